//! Wire framing for the PostgreSQL logical replication sub-protocol
//!
//! Covers exactly the three frame types the replication session exchanges
//! with the server over CopyBoth: Primary keepalive (`'k'`), XLogData
//! (`'w'`), and the client's Standby Status Update (`'r'`). Output-plugin
//! payload content inside an XLogData frame is never interpreted here.

pub mod buffer;
pub mod messages;

pub use messages::{ServerFrame, StandbyStatusUpdate};
