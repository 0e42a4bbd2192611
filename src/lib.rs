//! Client-side PostgreSQL logical replication streaming.
//!
//! Opens a replication-mode connection, runs the `IDENTIFY_SYSTEM` /
//! `START_REPLICATION` handshake, and drives the CopyBoth receive loop that
//! decodes server frames and emits Standby Status Update feedback. Output
//! plugin payloads (e.g. from `test_decoding` or `pgoutput`) are handed to
//! the caller as opaque bytes; interpreting them is the caller's job.

pub mod bootstrap;
pub mod config;
pub mod driver;
pub mod errors;
pub mod lsn;
pub mod protocol;
pub mod replicator;
pub mod state;
pub mod timestamp;

pub use bootstrap::SessionIdentity;
pub use config::{PluginOptionValue, ReplicatorConfig};
pub use driver::{LibpqDriver, PgDriver};
pub use errors::{ReplicationError, ReplicationResult};
pub use lsn::Lsn;
pub use replicator::{ConsumerAction, ReplicationEvent, Replicator};
pub use state::ProgressState;
