//! Tag presence tracking with removal debounce.
//!
//! A UID is present from its first read. It is removed only after
//! [`MISSES_BEFORE_REMOVAL`] consecutive polls that did not return it.

use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info};

use crate::config::KnownTagBinding;
use crate::events::Triggers;
use crate::sensors::{Publisher, SensorHandle, SensorUpdate};
use crate::uid::Uid;

pub const MISSES_BEFORE_REMOVAL: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub struct TagRecord {
    pub uid: Uid,
    pub present: bool,
    pub miss_count: u8,
    pub last_seen: Instant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TagEvent {
    Arrived { uid: Uid },
    Removed { uid: Uid },
}

#[derive(Debug, Default)]
pub struct TagTracker {
    records: Vec<TagRecord>,
    known: Vec<KnownTagBinding>,
}

impl TagTracker {
    pub fn new(known: Vec<KnownTagBinding>) -> Self {
        Self {
            records: Vec::new(),
            known,
        }
    }

    pub fn records(&self) -> &[TagRecord] {
        &self.records
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn present_uids(&self) -> impl Iterator<Item = &Uid> {
        self.records.iter().filter(|r| r.present).map(|r| &r.uid)
    }

    pub fn known_tags(&self) -> &[KnownTagBinding] {
        &self.known
    }

    fn sensor_for(&self, uid: &Uid) -> Option<&SensorHandle> {
        self.known.iter().find(|b| &b.uid == uid).map(|b| &b.sensor)
    }

    /// Feed one poll result. `None` means nothing was read, including failed
    /// reads.
    pub fn observe(&mut self, read: Option<&Uid>, now: Instant) -> Vec<TagEvent> {
        let mut events = Vec::new();

        for record in &mut self.records {
            if Some(&record.uid) == read {
                record.miss_count = 0;
                record.last_seen = now;
                continue;
            }
            record.miss_count += 1;
            if record.miss_count >= MISSES_BEFORE_REMOVAL {
                record.present = false;
            }
        }

        if let Some(uid) = read {
            if !self.records.iter().any(|r| &r.uid == uid) {
                self.records.push(TagRecord {
                    uid: uid.clone(),
                    present: true,
                    miss_count: 0,
                    last_seen: now,
                });
                events.push(TagEvent::Arrived { uid: uid.clone() });
            }
        }

        self.records.retain(|record| {
            if record.present {
                return true;
            }
            events.push(TagEvent::Removed {
                uid: record.uid.clone(),
            });
            false
        });
        events
    }

    /// Fire triggers and update sensors for `events`, in order.
    pub fn notify(
        &self,
        events: &[TagEvent],
        triggers: &mut Triggers,
        publisher: &mut dyn Publisher,
    ) {
        for event in events {
            match event {
                TagEvent::Arrived { uid } => {
                    info!(%uid, "tag detected");
                    publisher.publish(SensorUpdate::LastUid { uid: uid.to_string() });
                    if let Some(sensor) = self.sensor_for(uid) {
                        publisher.publish(SensorUpdate::KnownTag {
                            sensor: sensor.clone(),
                            present: true,
                        });
                    }
                    triggers.tag(uid);
                }
                TagEvent::Removed { uid } => {
                    info!(%uid, "tag removed");
                    if let Some(sensor) = self.sensor_for(uid) {
                        publisher.publish(SensorUpdate::KnownTag {
                            sensor: sensor.clone(),
                            present: false,
                        });
                    }
                    triggers.tag_removed(uid);
                }
            }
        }

        let removed_any = events.iter().any(|e| matches!(e, TagEvent::Removed { .. }));
        if removed_any && self.records.is_empty() {
            debug!("field empty");
            publisher.publish(SensorUpdate::LastUid { uid: String::new() });
        }
    }
}
