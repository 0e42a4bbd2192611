//! End-to-end scenarios against an in-memory driver standing in for a live
//! PostgreSQL server.

use pg_logical_stream::driver::mock::MockDriver;
use pg_logical_stream::driver::CopyData;
use pg_logical_stream::protocol::buffer::FrameWriter;
use pg_logical_stream::{ConsumerAction, ReplicationEvent, ReplicatorConfig, Replicator};
use std::collections::HashMap;

fn config(extra: &[(&str, &str)]) -> ReplicatorConfig {
    let mut map: HashMap<String, String> = [("slot".to_string(), "teas_slot".to_string())].into();
    for (k, v) in extra {
        map.insert(k.to_string(), v.to_string());
    }
    ReplicatorConfig::from_options(map).unwrap()
}

fn xlog_frame(wal_start: u64, text: &str) -> Vec<u8> {
    let mut w = FrameWriter::with_capacity(24 + text.len());
    w.write_u8(b'w');
    w.write_u64(wal_start);
    w.write_u64(wal_start);
    w.write_i64(0);
    let mut bytes = w.into_bytes();
    bytes.extend_from_slice(text.as_bytes());
    bytes
}

fn keepalive_frame(server_lsn: u64) -> Vec<u8> {
    let mut w = FrameWriter::with_capacity(18);
    w.write_u8(b'k');
    w.write_u64(server_lsn);
    w.write_i64(0);
    w.write_u8(0);
    w.into_bytes()
}

fn ready_driver() -> MockDriver {
    MockDriver::default()
        .with_identify_system("6821345681238281838", "1", "postgres")
        .with_integer_datetimes(true)
}

/// Scenario 1: basic logical stream over a transaction inserting three rows.
#[test]
fn basic_logical_stream_delivers_begin_inserts_commit() {
    let driver = ready_driver();
    driver.push_copy(CopyData::Row(xlog_frame(10, "BEGIN 501")));
    driver.push_copy(CopyData::Row(xlog_frame(20, "table public.teas: INSERT: kind[text]:'煎茶'")));
    driver.push_copy(CopyData::Row(xlog_frame(30, "table public.teas: INSERT: kind[text]:'蕎麦茶'")));
    driver.push_copy(CopyData::Row(xlog_frame(40, "table public.teas: INSERT: kind[text]:'魔茶'")));
    driver.push_copy(CopyData::Row(xlog_frame(50, "COMMIT 501 (at 2024-01-01 00:00:00 UTC)")));
    driver.push_copy(CopyData::Done);

    let mut replicator = Replicator::new(config(&[]));
    let mut results = Vec::new();
    replicator
        .replicate(driver, |event| {
            if let ReplicationEvent::Data(_, payload) = event {
                results.push(String::from_utf8_lossy(payload).into_owned());
                if results.len() == 5 {
                    return Ok(ConsumerAction::Stop);
                }
            }
            Ok(ConsumerAction::Continue)
        })
        .unwrap();

    assert!(results[0].starts_with("BEGIN "));
    assert!(results[1].contains("INSERT: kind[text]:'煎茶'"));
    assert!(results[2].contains("INSERT: kind[text]:'蕎麦茶'"));
    assert!(results[3].contains("INSERT: kind[text]:'魔茶'"));
    assert!(results[4].starts_with("COMMIT "));
}

/// Scenario 2: an `end_position` bound excludes a fourth insert past it.
#[test]
fn end_position_excludes_payload_past_bound() {
    let driver = ready_driver();
    driver.push_copy(CopyData::Row(xlog_frame(10, "BEGIN 501")));
    driver.push_copy(CopyData::Row(xlog_frame(20, "INSERT 1")));
    driver.push_copy(CopyData::Row(xlog_frame(30, "INSERT 2")));
    driver.push_copy(CopyData::Row(xlog_frame(40, "COMMIT 501")));
    // L = 40 captured after the third insert's transaction commits; a
    // fourth row lands at a WAL position past it.
    driver.push_copy(CopyData::Row(xlog_frame(60, "INSERT 3 (should not be delivered)")));
    driver.push_copy(CopyData::Done);

    let mut replicator = Replicator::new(config(&[("end_position", "40")]));
    let mut results = Vec::new();
    replicator
        .replicate(driver, |event| {
            if let ReplicationEvent::Data(_, payload) = event {
                results.push(String::from_utf8_lossy(payload).into_owned());
            }
            Ok(ConsumerAction::Continue)
        })
        .unwrap();

    assert_eq!(results.len(), 4);
    assert!(results.iter().all(|r| !r.contains("should not be delivered")));
}

/// Scenario 6: a second thread observes `last_server_lsn` advancing while
/// the loop runs, without needing to coordinate with the loop thread.
#[test]
fn progress_observable_from_another_thread() {
    let driver = ready_driver();
    for lsn in [100u64, 200, 300] {
        driver.push_copy(CopyData::Row(keepalive_frame(lsn)));
    }
    driver.push_copy(CopyData::Done);

    let mut replicator = Replicator::new(config(&[]));
    let progress = replicator.progress();

    let observer = std::thread::spawn(move || {
        // Progress is monotone non-decreasing; poll a few times and check
        // we never observe a value it could not have passed through.
        let mut last_seen = 0u64;
        for _ in 0..50 {
            let current = progress.last_server_lsn();
            assert!(current >= last_seen);
            last_seen = current;
            std::thread::yield_now();
        }
    });

    replicator
        .replicate(driver, |_event| Ok(ConsumerAction::Continue))
        .unwrap();
    observer.join().unwrap();

    assert_eq!(replicator.progress().last_server_lsn(), 300);
}
