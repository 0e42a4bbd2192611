//! The three replication-stream message shapes: Primary keepalive, XLogData,
//! and the client's Standby Status Update.

use super::buffer::{FrameReader, FrameWriter};
use crate::errors::{ReplicationError, ReplicationResult};
use crate::lsn::Lsn;

const KEEPALIVE_TAG: u8 = b'k';
const XLOG_DATA_TAG: u8 = b'w';
const STANDBY_STATUS_UPDATE_TAG: u8 = b'r';

/// A decoded server→client replication frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerFrame<'a> {
    /// Primary keepalive message.
    Keepalive {
        server_lsn: Lsn,
        send_time_us: i64,
        reply_requested: bool,
    },
    /// WAL data carrying one opaque output-plugin payload.
    XLogData {
        wal_start: Lsn,
        server_lsn: Lsn,
        send_time_us: i64,
        payload: &'a [u8],
    },
}

impl<'a> ServerFrame<'a> {
    /// Decode a single CopyData frame. The first byte selects the variant;
    /// any other identifier is a fatal protocol error.
    pub fn decode(data: &'a [u8]) -> ReplicationResult<Self> {
        let mut reader = FrameReader::new(data);
        match reader.read_u8()? {
            KEEPALIVE_TAG => {
                let server_lsn = Lsn(reader.read_u64()?);
                let send_time_us = reader.read_i64()?;
                let reply_requested = reader.read_u8()? == 1;
                Ok(ServerFrame::Keepalive {
                    server_lsn,
                    send_time_us,
                    reply_requested,
                })
            }
            XLOG_DATA_TAG => {
                let wal_start = Lsn(reader.read_u64()?);
                let server_lsn = Lsn(reader.read_u64()?);
                let send_time_us = reader.read_i64()?;
                let payload = reader.read_remaining();
                Ok(ServerFrame::XLogData {
                    wal_start,
                    server_lsn,
                    send_time_us,
                    payload,
                })
            }
            other => Err(ReplicationError::protocol(format!(
                "unknown replication frame identifier: {:#04x}",
                other
            ))),
        }
    }
}

/// The client→server Standby Status Update.
///
/// This engine exposes no distinction between receiving, persisting, and
/// applying a WAL position: all three LSN fields carry the same
/// acknowledged value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StandbyStatusUpdate {
    pub ack: Lsn,
    pub client_send_time_us: i64,
}

impl StandbyStatusUpdate {
    pub const WIRE_LEN: usize = 34;

    pub fn to_bytes(self) -> Vec<u8> {
        let mut w = FrameWriter::with_capacity(Self::WIRE_LEN);
        w.write_u8(STANDBY_STATUS_UPDATE_TAG);
        w.write_u64(self.ack.0); // write position
        w.write_u64(self.ack.0); // flush position
        w.write_u64(self.ack.0); // apply position
        w.write_i64(self.client_send_time_us);
        w.write_u8(0); // reply-requested: always false from this engine
        w.into_bytes()
    }
}
