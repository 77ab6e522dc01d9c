use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pretty_assertions::assert_eq;
use tagwatch_reader::chip::sim::SimChip;
use tagwatch_reader::{Diagnostic, DeviceConfig, Health, LpcdMode, Protocol, Reader, uid};

fn reader(configure: impl FnOnce(&mut DeviceConfig)) -> Reader<SimChip> {
    let mut config = DeviceConfig::default();
    configure(&mut config);
    config.validate().unwrap();
    Reader::new(config, SimChip::new())
}

type Log = Arc<Mutex<Vec<String>>>;

/// Record every trigger as a line of text.
fn record(reader: &mut Reader<SimChip>) -> Log {
    let log: Log = Arc::default();
    let triggers = reader.triggers_mut();
    let sink = log.clone();
    triggers.add_on_tag(move |uid| sink.lock().unwrap().push(format!("tag {uid}")));
    let sink = log.clone();
    triggers.add_on_tag_removed(move |uid| sink.lock().unwrap().push(format!("removed {uid}")));
    let sink = log.clone();
    triggers.add_on_diagnostic(move |d| {
        let line = match d {
            Diagnostic::ResetStarted { attempt } => format!("reset {attempt}"),
            Diagnostic::ResetSucceeded { .. } => "reset ok".to_string(),
            Diagnostic::ResetFailed { .. } => "reset failed".to_string(),
            Diagnostic::RecoveryExhausted { attempts } => format!("exhausted {attempts}"),
            Diagnostic::FailureThreshold { consecutive_failures, .. } => {
                format!("threshold {consecutive_failures}")
            }
            other => format!("{other:?}"),
        };
        sink.lock().unwrap().push(line);
    });
    log
}

#[test]
fn three_timeouts_trigger_one_reset() {
    let start = Instant::now();
    let mut reader = reader(|c| c.max_failed_checks = 3);
    let log = record(&mut reader);
    reader.setup(start);
    reader.chip_mut().script_timeouts(3);

    for tick in 0..2 {
        reader.poll(start + Duration::from_secs(tick));
        assert_eq!(reader.health().state(), Health::Degraded);
    }
    assert_eq!(reader.chip().resets(), 0);

    reader.poll(start + Duration::from_secs(2));
    assert_eq!(reader.chip().resets(), 1);
    assert_eq!(reader.health().consecutive_failures(), 0);

    reader.poll(start + Duration::from_secs(3));
    assert_eq!(reader.health().state(), Health::Healthy);
    assert_eq!(reader.chip().resets(), 1);
    assert_eq!(*log.lock().unwrap(), vec!["reset 1", "reset ok"]);
}

#[test]
fn without_auto_reset_failures_pile_up() {
    let start = Instant::now();
    let mut reader = reader(|c| {
        c.max_failed_checks = 3;
        c.auto_reset_on_failure = false;
    });
    let log = record(&mut reader);
    reader.setup(start);
    reader.chip_mut().script_timeouts(12);

    for tick in 0..12 {
        reader.poll(start + Duration::from_secs(tick));
    }

    assert_eq!(reader.chip().resets(), 0);
    assert_eq!(reader.health().consecutive_failures(), 12);
    assert_eq!(reader.health().state(), Health::Degraded);
    assert_eq!(*log.lock().unwrap(), vec!["threshold 3"]);
}

#[test]
fn lpcd_cadence_until_wake() {
    let start = Instant::now();
    let mut reader = reader(|c| {
        c.lpcd_enabled = true;
        c.lpcd_interval = Duration::from_millis(100);
        c.update_interval = Duration::from_millis(500);
    });
    reader.setup(start);
    assert_eq!(reader.lpcd_mode(), LpcdMode::LowPower);

    let mut now = start;
    for _ in 0..5 {
        let next = reader.poll(now);
        assert_eq!(next, Duration::from_millis(100));
        now += next;
    }
    assert_eq!(reader.chip().uid_reads(), 0);

    reader
        .chip_mut()
        .place(uid::parse("04-5A-B2-11").unwrap(), Protocol::Iso14443A);
    reader.chip_mut().wake();

    let next = reader.poll(now);
    assert_eq!(next, Duration::from_millis(500));
    assert_eq!(reader.lpcd_mode(), LpcdMode::Active);
    assert_eq!(reader.chip().uid_reads(), 1);
    assert_eq!(reader.tags().present_uids().count(), 1);
}

#[test]
fn lpcd_wake_without_tag_goes_back_to_sleep() {
    let start = Instant::now();
    let mut reader = reader(|c| {
        c.lpcd_enabled = true;
        c.lpcd_interval = Duration::from_millis(100);
        c.update_interval = Duration::from_millis(500);
    });
    reader.setup(start);
    reader.chip_mut().wake();

    let next = reader.poll(start);

    assert_eq!(reader.chip().uid_reads(), 1);
    assert_eq!(next, Duration::from_millis(100));
    assert!(reader.chip().in_lpcd());
}

#[test]
fn tag_removal_is_debounced() {
    let start = Instant::now();
    let mut reader = reader(|_| {});
    let log = record(&mut reader);
    reader.setup(start);
    let tag = uid::parse("74:10:37:94").unwrap();

    reader.chip_mut().place(tag.clone(), Protocol::Iso14443A);
    reader.poll(start);
    reader.chip_mut().script(Ok(None));
    reader.poll(start + Duration::from_secs(1));
    reader.poll(start + Duration::from_secs(2));
    assert_eq!(*log.lock().unwrap(), vec!["tag 74-10-37-94"]);

    reader.chip_mut().remove_tag();
    reader.poll(start + Duration::from_secs(3));
    reader.poll(start + Duration::from_secs(4));
    assert_eq!(
        *log.lock().unwrap(),
        vec!["tag 74-10-37-94", "removed 74-10-37-94"]
    );
}

#[test]
fn failed_resets_back_off_and_stop_at_ceiling() {
    let start = Instant::now();
    let mut reader = reader(|c| {
        c.max_failed_checks = 1;
        c.reset.max_attempts = 3;
        c.reset.backoff_base = Duration::from_secs(1);
        c.reset.backoff_max = Duration::from_secs(4);
    });
    let log = record(&mut reader);
    reader.setup(start);
    reader.chip_mut().fail_resets(u32::MAX);
    reader.chip_mut().script_timeouts(200);

    // One poll every 500 ms for a minute.
    for tick in 0..120 {
        reader.poll(start + Duration::from_millis(500 * tick));
    }

    assert_eq!(reader.chip().resets(), 3);
    assert_eq!(reader.health().state(), Health::Degraded);
    assert_eq!(
        *log.lock().unwrap(),
        vec![
            "reset 1", "reset failed",
            "reset 2", "reset failed",
            "reset 3", "reset failed",
            "exhausted 3",
        ]
    );
}
