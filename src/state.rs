//! Observable runtime progress, shared between the stream loop and readers
//! on other threads.
//!
//! Each field is an independent atomic rather than a struct behind a mutex:
//! readers tolerate transient cross-field inequality, and the loop thread
//! never needs to coordinate writes across fields.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

const ORDER: Ordering = Ordering::SeqCst;

/// The five runtime-state fields, each independently atomic.
#[derive(Debug, Default)]
pub struct ProgressState {
    last_server_lsn: AtomicU64,
    last_received_lsn: AtomicU64,
    last_processed_lsn: AtomicU64,
    last_message_send_time_us: AtomicI64,
    last_status_unix_ms: AtomicI64,
}

impl ProgressState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_server_lsn(&self) -> u64 {
        self.last_server_lsn.load(ORDER)
    }

    pub fn last_received_lsn(&self) -> u64 {
        self.last_received_lsn.load(ORDER)
    }

    pub fn last_processed_lsn(&self) -> u64 {
        self.last_processed_lsn.load(ORDER)
    }

    pub fn last_message_send_time_us(&self) -> i64 {
        self.last_message_send_time_us.load(ORDER)
    }

    pub fn last_status_unix_ms(&self) -> i64 {
        self.last_status_unix_ms.load(ORDER)
    }

    /// The server uses `0` to mean "no update"; callers should skip this
    /// call entirely rather than pass `0`, but a `0` is a harmless no-op.
    pub fn set_server_lsn(&self, lsn: u64) {
        if lsn != 0 {
            self.last_server_lsn.store(lsn, ORDER);
        }
    }

    pub fn set_received_lsn(&self, lsn: u64) {
        if lsn != 0 {
            self.last_received_lsn.store(lsn, ORDER);
        }
    }

    pub fn set_processed_lsn(&self, lsn: u64) {
        self.last_processed_lsn.store(lsn, ORDER);
    }

    pub fn set_message_send_time_us(&self, micros: i64) {
        self.last_message_send_time_us.store(micros, ORDER);
    }

    pub fn set_status_now(&self, unix_ms: i64) {
        self.last_status_unix_ms.store(unix_ms, ORDER);
    }
}
