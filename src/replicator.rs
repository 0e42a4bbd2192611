//! The replication session: bootstrap, the copy-both receive loop, and
//! feedback emission.

use crate::bootstrap::{self, SessionIdentity};
use crate::config::ReplicatorConfig;
use crate::driver::{wait_readable, CopyData, PgDriver};
use crate::errors::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;
use crate::protocol::{ServerFrame, StandbyStatusUpdate};
use crate::state::ProgressState;
use crate::timestamp;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};

/// One event delivered to the caller's consumer closure.
pub enum ReplicationEvent<'a> {
    /// An output-plugin payload decoded from a WAL data frame.
    Data(Lsn, &'a [u8]),
    /// A feedback cycle just completed; usable as a heartbeat trigger.
    Feedback,
}

/// What the consumer wants the loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerAction {
    Continue,
    Stop,
}

/// A replication session bound to one slot. Single-shot: once `replicate`
/// returns, a new `Replicator` is required to stream again.
pub struct Replicator<D: PgDriver> {
    config: ReplicatorConfig,
    driver: Option<D>,
    identity: Option<SessionIdentity>,
    state: Arc<ProgressState>,
    last_status_at: Option<Instant>,
    /// Resolved by bootstrap: the caller's `status_interval` if set,
    /// otherwise the server's `wal_receiver_status_interval` GUC. Unused
    /// until bootstrap has run at least once.
    status_interval: Duration,
}

impl<D: PgDriver> Replicator<D> {
    pub fn new(config: ReplicatorConfig) -> Self {
        Self {
            config,
            driver: None,
            identity: None,
            state: Arc::new(ProgressState::new()),
            last_status_at: None,
            status_interval: Duration::from_secs(10),
        }
    }

    /// A handle observers on another thread can poll for progress.
    pub fn progress(&self) -> Arc<ProgressState> {
        Arc::clone(&self.state)
    }

    pub fn config(&self) -> &ReplicatorConfig {
        &self.config
    }

    /// Runs bootstrap only, without entering the receive loop. Exposed so
    /// tests can observe handshake failures directly.
    pub fn initialize_replication(&mut self, mut driver: D) -> ReplicationResult<()> {
        let identity = bootstrap::bootstrap(&mut driver, &self.config)?;
        self.status_interval = identity.status_interval;
        self.identity = Some(identity);
        self.driver = Some(driver);
        Ok(())
    }

    /// Idempotent: closing an already-closed session is a no-op.
    pub fn close(&mut self) {
        if let Some(mut driver) = self.driver.take() {
            driver.close();
        }
    }

    /// Runs one full session: bootstrap, then the receive loop, invoking
    /// `consumer` for each decoded payload and after each feedback cycle.
    /// `consumer` returning `ConsumerAction::Stop` ends the loop cleanly;
    /// an `Err` from `consumer` aborts it and propagates after cleanup.
    pub fn replicate<F>(&mut self, driver: D, mut consumer: F) -> ReplicationResult<()>
    where
        F: FnMut(ReplicationEvent<'_>) -> ReplicationResult<ConsumerAction>,
    {
        self.initialize_replication(driver)?;
        let result = self.run_loop(&mut consumer);

        // Emit one last ack regardless of how the loop exited, including a
        // protocol error, to reduce WAL retention on the server after a
        // crash. Consumer errors skip this: the callback itself is the
        // thing that failed, so its invariants can't be trusted.
        let consumer_failed = matches!(result, Err(ReplicationError::Consumer(_)));
        if !consumer_failed {
            if let Err(feedback_err) = self.emit_feedback(&mut consumer) {
                warn!(error = %feedback_err, "final feedback emission failed during cleanup");
            }
        }

        self.close();
        result
    }

    fn run_loop<F>(&mut self, consumer: &mut F) -> ReplicationResult<()>
    where
        F: FnMut(ReplicationEvent<'_>) -> ReplicationResult<ConsumerAction>,
    {
        loop {
            if self.should_send_feedback() {
                self.emit_feedback(consumer)?;
            }

            if self.config.end_position.is_valid()
                && self.state.last_processed_lsn() >= self.config.end_position.0
            {
                return Ok(());
            }

            {
                let driver = self.driver_mut()?;
                match driver.consume_input() {
                    Ok(()) => {}
                    Err(e) if e.is_no_copy_in_progress() => continue,
                    Err(e) => return Err(e),
                }
                if driver.is_busy() {
                    continue;
                }
            }

            let frame = {
                let driver = self.driver_mut()?;
                driver.get_copy_data()
            };
            let bytes = match frame {
                Ok(CopyData::Row(bytes)) => bytes,
                Ok(CopyData::WouldBlock) => {
                    let (fd, timeout) = {
                        let driver = self.driver_mut()?;
                        (driver.socket_fd(), self.status_interval)
                    };
                    wait_readable(fd, timeout)?;
                    continue;
                }
                Ok(CopyData::Done) => {
                    debug!("replication stream ended");
                    return Ok(());
                }
                Err(e) if e.is_no_copy_in_progress() => continue,
                Err(e) => return Err(e),
            };

            match ServerFrame::decode(&bytes)? {
                ServerFrame::Keepalive {
                    server_lsn,
                    send_time_us,
                    reply_requested,
                } => {
                    self.state.set_server_lsn(server_lsn.0);
                    self.state.set_message_send_time_us(send_time_us);
                    if reply_requested {
                        self.emit_feedback(consumer)?;
                    }
                    if self.config.end_position.is_valid()
                        && self.state.last_server_lsn() >= self.config.end_position.0
                    {
                        return Ok(());
                    }
                }
                ServerFrame::XLogData {
                    wal_start,
                    server_lsn,
                    send_time_us,
                    payload,
                } => {
                    self.state.set_received_lsn(wal_start.0);
                    self.state.set_server_lsn(server_lsn.0);
                    self.state.set_message_send_time_us(send_time_us);
                    debug!(
                        wal_start = %wal_start,
                        sent_at = %timestamp::format_pg_micros(send_time_us),
                        "received WAL data"
                    );

                    if self.config.end_position.is_valid()
                        && wal_start.0 > self.config.end_position.0
                    {
                        return Ok(());
                    }

                    match consumer(ReplicationEvent::Data(wal_start, payload)) {
                        Ok(ConsumerAction::Continue) => {
                            self.state.set_processed_lsn(wal_start.0);
                        }
                        Ok(ConsumerAction::Stop) => {
                            self.state.set_processed_lsn(wal_start.0);
                            return Ok(());
                        }
                        Err(err) => return Err(ReplicationError::consumer(err)),
                    }
                }
            }
        }
    }

    fn should_send_feedback(&self) -> bool {
        match self.last_status_at {
            None => true,
            Some(at) => at.elapsed() >= self.status_interval,
        }
    }

    fn emit_feedback<F>(&mut self, consumer: &mut F) -> ReplicationResult<()>
    where
        F: FnMut(ReplicationEvent<'_>) -> ReplicationResult<ConsumerAction>,
    {
        let ack = Lsn(self.state.last_processed_lsn()).succ_or_zero();
        let now = SystemTime::now();
        let client_send_time_us = timestamp::to_pg_micros(now);
        let update = StandbyStatusUpdate {
            ack,
            client_send_time_us,
        };
        let bytes = update.to_bytes();

        let driver = self.driver_mut()?;
        driver.put_copy_data(&bytes)?;
        driver.flush()?;

        self.last_status_at = Some(Instant::now());
        self.state.set_status_now(unix_millis(now));
        info!(ack = %ack, "sent standby status update");

        match consumer(ReplicationEvent::Feedback) {
            Ok(_) => Ok(()),
            Err(err) => Err(ReplicationError::consumer(err)),
        }
    }

    fn driver_mut(&mut self) -> ReplicationResult<&mut D> {
        self.driver
            .as_mut()
            .ok_or_else(|| ReplicationError::session_invariant("no active connection"))
    }
}

fn unix_millis(time: SystemTime) -> i64 {
    time.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::mock::MockDriver;
    use crate::protocol::buffer::FrameWriter;
    use std::collections::HashMap;

    fn config(extra: &[(&str, &str)]) -> ReplicatorConfig {
        let mut map: HashMap<String, String> = [("slot".to_string(), "s".to_string())].into();
        for (k, v) in extra {
            map.insert(k.to_string(), v.to_string());
        }
        ReplicatorConfig::from_options(map).unwrap()
    }

    fn keepalive_frame(server_lsn: u64, reply_requested: bool) -> Vec<u8> {
        let mut w = FrameWriter::with_capacity(18);
        w.write_u8(b'k');
        w.write_u64(server_lsn);
        w.write_i64(0);
        w.write_u8(if reply_requested { 1 } else { 0 });
        w.into_bytes()
    }

    fn xlog_frame(wal_start: u64, payload: &[u8]) -> Vec<u8> {
        let mut w = FrameWriter::with_capacity(24 + payload.len());
        w.write_u8(b'w');
        w.write_u64(wal_start);
        w.write_u64(wal_start);
        w.write_i64(0);
        let mut bytes = w.into_bytes();
        bytes.extend_from_slice(payload);
        bytes
    }

    fn driver_with_frames(frames: Vec<Vec<u8>>) -> MockDriver {
        let driver = MockDriver::default()
            .with_identify_system("1", "1", "postgres")
            .with_integer_datetimes(true);
        for f in frames {
            driver.push_copy(CopyData::Row(f));
        }
        driver.push_copy(CopyData::Done);
        driver
    }

    #[test]
    fn delivers_payloads_in_order_and_advances_processed_lsn() {
        let driver = driver_with_frames(vec![
            xlog_frame(10, b"BEGIN 1"),
            xlog_frame(20, b"COMMIT 1"),
        ]);
        let mut replicator = Replicator::new(config(&[]));
        let mut received = Vec::new();
        replicator
            .replicate(driver, |event| {
                if let ReplicationEvent::Data(lsn, payload) = event {
                    received.push((lsn.0, payload.to_vec()));
                }
                Ok(ConsumerAction::Continue)
            })
            .unwrap();
        assert_eq!(received[0], (10, b"BEGIN 1".to_vec()));
        assert_eq!(received[1], (20, b"COMMIT 1".to_vec()));
        assert_eq!(replicator.progress().last_processed_lsn(), 20);
    }

    #[test]
    fn end_position_stops_before_delivering_payload_past_bound() {
        let driver = driver_with_frames(vec![xlog_frame(10, b"ok"), xlog_frame(30, b"too far")]);
        let mut replicator = Replicator::new(config(&[("end_position", "14")]));
        let mut received = Vec::new();
        replicator
            .replicate(driver, |event| {
                if let ReplicationEvent::Data(lsn, _) = event {
                    received.push(lsn.0);
                }
                Ok(ConsumerAction::Continue)
            })
            .unwrap();
        assert_eq!(received, vec![10]);
    }

    #[test]
    fn keepalive_with_server_lsn_past_end_position_terminates() {
        let driver = MockDriver::default()
            .with_identify_system("1", "1", "postgres")
            .with_integer_datetimes(true);
        driver.push_copy(CopyData::Row(keepalive_frame(100, false)));
        driver.push_copy(CopyData::Done);
        let mut replicator = Replicator::new(config(&[("end_position", "50")]));
        replicator
            .replicate(driver, |_event| Ok(ConsumerAction::Continue))
            .unwrap();
        assert_eq!(replicator.progress().last_server_lsn(), 100);
    }

    #[test]
    fn consumer_error_aborts_and_skips_final_feedback() {
        let driver = driver_with_frames(vec![xlog_frame(10, b"boom")]);
        let mut replicator = Replicator::new(config(&[]));
        let result = replicator.replicate(driver, |event| {
            if matches!(event, ReplicationEvent::Data(..)) {
                return Err(ReplicationError::consumer(std::io::Error::other("boom")));
            }
            Ok(ConsumerAction::Continue)
        });
        assert!(result.is_err());
    }

    #[test]
    fn zero_state_before_replicate_is_called() {
        let replicator: Replicator<MockDriver> = Replicator::new(config(&[]));
        let progress = replicator.progress();
        assert_eq!(progress.last_server_lsn(), 0);
        assert_eq!(progress.last_received_lsn(), 0);
        assert_eq!(progress.last_processed_lsn(), 0);
    }
}
