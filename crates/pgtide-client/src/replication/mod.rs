//! Streaming logical replication with gap recovery.
//!
//! Change data capture over the PostgreSQL streaming replication protocol
//! with the pgoutput plugin, plus replay of missed WAL spans from audit
//! log tables.

pub mod client;
pub mod pgoutput;
pub mod publication;
pub mod recovery;
pub mod relation_cache;
pub mod sequencer;
pub mod slot;
pub mod transaction;
mod wire;

pub use client::{AckHandle, ReplicationConfig, ReplicationStream};
pub use pgoutput::{PgOutputDecoder, PgOutputMessage};
pub use publication::{publication_exists, publication_tables, require_publication};
pub use recovery::{GapReconciler, LogTableSpec};
pub use relation_cache::RelationCache;
pub use sequencer::{EventStream, EventStreamConfig};
pub use slot::{create_slot, drop_slot, ensure_slot, slot_exists, slot_info, SlotInfo};
pub use transaction::{TransactionAssembler, TransactionBatch};
