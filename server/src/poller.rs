//! Background poll loop.
//!
//! The reader and its chip live on one blocking thread. Handlers only ever
//! see the snapshot and the broadcast channel.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use chrono::Utc;
use tagwatch_reader::chip::sim::SimChip;
use tagwatch_reader::{DeviceConfig, Diagnostic, LpcdMode, Publisher, Reader, SensorUpdate};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::AppState;
use crate::config::SimConfig;
use crate::websocket::{KnownTagStatus, ReaderEvent};

/// Forwards every sensor update to connected clients.
struct BroadcastPublisher {
    events: broadcast::Sender<String>,
}

impl Publisher for BroadcastPublisher {
    fn publish(&mut self, update: SensorUpdate) {
        let event = match update {
            SensorUpdate::Health {
                state,
                consecutive_failures,
            } => ReaderEvent::Health {
                state,
                consecutive_failures,
            },
            update => ReaderEvent::Sensor { update },
        };
        // No subscribers is fine
        let _ = self.events.send(event.to_json());
    }
}

/// Moves the tag in and out of the simulated field on a fixed cycle.
struct SimDriver {
    config: SimConfig,
    started: Instant,
}

impl SimDriver {
    fn new(config: SimConfig, started: Instant) -> Self {
        Self { config, started }
    }

    fn tag_present(&self, now: Instant) -> bool {
        let period = self.config.present_for + self.config.absent_for;
        if self.config.tag.is_none() || period.is_zero() {
            return false;
        }
        let phase = now.duration_since(self.started).as_millis() % period.as_millis();
        phase < self.config.present_for.as_millis()
    }

    fn step(&self, reader: &mut Reader<SimChip>, now: Instant) {
        let present = self.tag_present(now);
        let in_lpcd = reader.lpcd_mode() == LpcdMode::LowPower;
        let chip = reader.chip_mut();
        match (&self.config.tag, present, chip.tag().is_some()) {
            (Some(uid), true, false) => {
                tracing::info!("Simulated tag {} enters the field", uid);
                chip.place(uid.clone(), self.config.protocol);
                if in_lpcd {
                    chip.wake();
                }
            }
            (_, false, true) => {
                tracing::info!("Simulated tag leaves the field");
                chip.remove_tag();
            }
            _ => {}
        }
    }
}

fn build_reader(
    config: DeviceConfig,
    sim: &SimConfig,
    events: broadcast::Sender<String>,
) -> Reader<SimChip> {
    let mut chip = SimChip::new();
    if let Some(celsius) = sim.temperature {
        chip.set_temperature(celsius);
    }

    let mut reader = Reader::new(config, chip).with_publisher(BroadcastPublisher {
        events: events.clone(),
    });

    let triggers = reader.triggers_mut();
    let tx = events.clone();
    triggers.add_on_tag(move |uid| {
        let _ = tx.send(
            ReaderEvent::TagDetected {
                uid: uid.to_string(),
                at: Utc::now(),
            }
            .to_json(),
        );
    });
    let tx = events.clone();
    triggers.add_on_tag_removed(move |uid| {
        let _ = tx.send(
            ReaderEvent::TagRemoved {
                uid: uid.to_string(),
                at: Utc::now(),
            }
            .to_json(),
        );
    });
    triggers.add_on_diagnostic(move |diagnostic: &Diagnostic| {
        let _ = events.send(
            ReaderEvent::Diagnostic {
                diagnostic: diagnostic.clone(),
            }
            .to_json(),
        );
    });
    reader
}

/// Copy the reader's state into the shared snapshot.
fn update_snapshot(state: &AppState, reader: &Reader<SimChip>) {
    let present: Vec<String> = reader.tags().present_uids().map(|uid| uid.to_string()).collect();
    let mut snapshot = state.reader_state.blocking_write();
    snapshot.health = reader.health().state();
    snapshot.consecutive_failures = reader.health().consecutive_failures();
    if let Some(last) = present.last() {
        snapshot.last_uid = Some(last.clone());
    } else if reader.tags().is_empty() {
        snapshot.last_uid = None;
    }
    snapshot.rf_power = reader.rf().power();
    snapshot.diagnostics = reader.diagnostics().clone();
    snapshot.known_tags = reader
        .config()
        .known_tags
        .iter()
        .map(|binding| {
            let uid = binding.uid.to_string();
            KnownTagStatus {
                present: present.contains(&uid),
                uid,
                sensor: binding.sensor.to_string(),
            }
        })
        .collect();
    snapshot.present_tags = present;
}

/// Run the reader until the server stops.
pub fn spawn(state: Arc<AppState>, config: DeviceConfig, sim: SimConfig) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let started = Instant::now();
        let driver = SimDriver::new(sim, started);
        let mut reader = build_reader(config, &driver.config, state.events.clone());

        reader.setup(started);
        update_snapshot(&state, &reader);

        while state.running.load(Ordering::Relaxed) {
            let now = Instant::now();
            driver.step(&mut reader, now);
            let delay = reader.poll(now);
            update_snapshot(&state, &reader);
            std::thread::sleep(delay);
        }
        tracing::info!("Poll loop stopped");
    })
}
