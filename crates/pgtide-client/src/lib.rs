pub mod connect;
mod conninfo;
mod error;
pub mod replication;

pub use connect::connect_postgres;
pub use error::{CdcError, CdcResult};
pub use replication::{
    AckHandle, EventStream, EventStreamConfig, GapReconciler, LogTableSpec, ReplicationConfig,
    ReplicationStream, SlotInfo, TransactionBatch,
};
