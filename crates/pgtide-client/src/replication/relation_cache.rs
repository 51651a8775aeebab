//! Cache for PostgreSQL relation metadata.
//!
//! PostgreSQL sends a Relation message before the first DML on each table
//! in a replication session. These are cached to resolve the relation_id
//! carried by Insert/Update/Delete/Truncate messages. Relation ids are not
//! stable across sessions, so every new session starts with an empty cache.

use std::collections::HashMap;

use super::pgoutput::{ColumnInfo, RelationMessage, ReplicaIdentity};
use crate::error::{CdcError, CdcResult};

/// Cached information about a PostgreSQL relation (table).
#[derive(Debug, Clone)]
pub struct RelationInfo {
    pub namespace: String,
    pub name: String,
    pub columns: Vec<ColumnInfo>,
    pub replica_identity: ReplicaIdentity,
}

impl From<&RelationMessage> for RelationInfo {
    fn from(msg: &RelationMessage) -> Self {
        Self {
            namespace: msg.namespace.clone(),
            name: msg.name.clone(),
            columns: msg.columns.clone(),
            replica_identity: msg.replica_identity,
        }
    }
}

/// Cache of relation OID to table metadata mappings.
#[derive(Debug, Default)]
pub struct RelationCache {
    relations: HashMap<u32, RelationInfo>,
}

impl RelationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the schema for a relation id.
    pub fn upsert(&mut self, msg: &RelationMessage) {
        self.relations.insert(msg.relation_id, msg.into());
    }

    /// Look up relation info by OID.
    pub fn get(&self, relation_id: u32) -> Option<&RelationInfo> {
        self.relations.get(&relation_id)
    }

    /// Look up relation info for a row message.
    ///
    /// A miss here means the server violated its own ordering contract
    /// (Relation precedes any row referencing it), so the session is
    /// corrupted and must be torn down.
    pub fn lookup(&self, relation_id: u32) -> CdcResult<&RelationInfo> {
        self.relations.get(&relation_id).ok_or_else(|| {
            CdcError::Format(format!(
                "row references unknown relation id {} (no Relation message seen)",
                relation_id
            ))
        })
    }

    /// Clear the cache (e.g., on reconnect).
    pub fn clear(&mut self) {
        self.relations.clear();
    }

    /// Number of cached relations.
    pub fn len(&self) -> usize {
        self.relations.len()
    }

    /// Check if cache is empty.
    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relation(id: u32, name: &str) -> RelationMessage {
        RelationMessage {
            relation_id: id,
            namespace: "public".to_string(),
            name: name.to_string(),
            replica_identity: ReplicaIdentity::Default,
            columns: vec![ColumnInfo {
                flags: 1,
                name: "id".to_string(),
                type_oid: 23,
                type_modifier: -1,
            }],
        }
    }

    #[test]
    fn test_cache_upsert_and_get() {
        let mut cache = RelationCache::new();
        cache.upsert(&relation(16384, "users"));

        let info = cache.get(16384).unwrap();
        assert_eq!(info.namespace, "public");
        assert_eq!(info.name, "users");
        assert_eq!(info.columns.len(), 1);
        assert_eq!(info.columns[0].name, "id");
    }

    #[test]
    fn test_cache_upsert_replaces() {
        let mut cache = RelationCache::new();
        cache.upsert(&relation(16384, "users"));
        cache.upsert(&relation(16384, "users_v2"));

        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(16384).unwrap().name, "users_v2");
    }

    #[test]
    fn test_cache_miss_is_fatal_on_lookup() {
        let cache = RelationCache::new();
        assert!(cache.get(12345).is_none());

        let err = cache.lookup(12345).unwrap_err();
        assert!(matches!(err, CdcError::Format(_)));
        assert!(err.to_string().contains("12345"));
    }

    #[test]
    fn test_cache_clear() {
        let mut cache = RelationCache::new();
        cache.upsert(&relation(16384, "users"));
        assert_eq!(cache.len(), 1);

        cache.clear();
        assert!(cache.is_empty());
    }
}
