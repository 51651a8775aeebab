//! Transaction assembly: decoded pgoutput messages in, committed batches out.
//!
//! Begin opens a transaction, row messages buffer in arrival order, and
//! Commit closes it, stamping every buffered event with the commit LSN and
//! timestamp. Messages that arrive out of order are a protocol violation
//! and fail the stream instead of being skipped.

use chrono::{DateTime, Utc};
use tracing::debug;

use pgtide_core::{ChangeEvent, EventOrigin, Lsn, Operation, RowMap, Value};

use crate::error::{CdcError, CdcResult};

use super::pgoutput::{
    BeginMessage, ColumnValue, CommitMessage, DeleteMessage, InsertMessage, OldImage,
    PgOutputMessage, TruncateMessage, TupleData, UpdateMessage,
};
use super::relation_cache::{RelationCache, RelationInfo};
use super::wire::PG_EPOCH_OFFSET_SECS;

/// All events from one committed transaction, in WAL order.
#[derive(Debug, Clone)]
pub struct TransactionBatch {
    pub events: Vec<ChangeEvent>,
    /// LSN of the commit record. Every event in the batch carries it.
    pub commit_lsn: Lsn,
    /// End of the commit record. Acknowledging this LSN releases the whole
    /// transaction for WAL recycling.
    pub ack_lsn: Lsn,
    pub commit_ts: Option<DateTime<Utc>>,
    pub xid: u32,
}

struct OpenTransaction {
    xid: u32,
    events: Vec<ChangeEvent>,
}

/// Accumulates pgoutput messages into [`TransactionBatch`]es.
///
/// Relation metadata is cached across transactions for the lifetime of the
/// session, exactly as long as the server considers it announced.
pub struct TransactionAssembler {
    relations: RelationCache,
    current: Option<OpenTransaction>,
}

impl TransactionAssembler {
    pub fn new() -> Self {
        Self {
            relations: RelationCache::new(),
            current: None,
        }
    }

    /// Feed one decoded message. Returns a finished batch when a Commit
    /// closes the open transaction, `None` while it is still being built.
    pub fn apply(&mut self, message: PgOutputMessage) -> CdcResult<Option<TransactionBatch>> {
        match message {
            PgOutputMessage::Begin(begin) => {
                self.handle_begin(begin)?;
                Ok(None)
            }
            PgOutputMessage::Commit(commit) => self.handle_commit(commit).map(Some),
            PgOutputMessage::Relation(relation) => {
                self.relations.upsert(&relation);
                Ok(None)
            }
            PgOutputMessage::Type(ty) => {
                debug!(oid = ty.type_id, name = %ty.name, "custom type announced");
                Ok(None)
            }
            PgOutputMessage::Origin(origin) => {
                debug!(name = %origin.origin_name, "replication origin announced");
                Ok(None)
            }
            PgOutputMessage::Insert(insert) => {
                self.handle_insert(insert)?;
                Ok(None)
            }
            PgOutputMessage::Update(update) => {
                self.handle_update(update)?;
                Ok(None)
            }
            PgOutputMessage::Delete(delete) => {
                self.handle_delete(delete)?;
                Ok(None)
            }
            PgOutputMessage::Truncate(truncate) => {
                self.handle_truncate(truncate)?;
                Ok(None)
            }
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.current.is_some()
    }

    /// Transaction id of the open transaction, if one is being assembled.
    pub fn current_xid(&self) -> Option<u32> {
        self.current.as_ref().map(|txn| txn.xid)
    }

    fn handle_begin(&mut self, begin: BeginMessage) -> CdcResult<()> {
        if let Some(open) = &self.current {
            return Err(CdcError::Format(format!(
                "Begin for xid {} while transaction {} is still open",
                begin.xid, open.xid
            )));
        }
        debug!(xid = begin.xid, final_lsn = %Lsn(begin.final_lsn), "transaction started");
        self.current = Some(OpenTransaction {
            xid: begin.xid,
            events: Vec::new(),
        });
        Ok(())
    }

    fn handle_commit(&mut self, commit: CommitMessage) -> CdcResult<TransactionBatch> {
        let txn = self
            .current
            .take()
            .ok_or_else(|| CdcError::Format("Commit without a matching Begin".into()))?;

        let commit_lsn = Lsn(commit.commit_lsn);
        let commit_ts = pg_commit_timestamp(commit.timestamp);
        let mut events = txn.events;
        for event in &mut events {
            event.commit_lsn = commit_lsn;
            event.commit_ts = commit_ts;
            event.xid = Some(txn.xid);
        }

        debug!(
            xid = txn.xid,
            commit_lsn = %commit_lsn,
            events = events.len(),
            "transaction committed"
        );

        Ok(TransactionBatch {
            events,
            commit_lsn,
            ack_lsn: Lsn(commit.end_lsn),
            commit_ts,
            xid: txn.xid,
        })
    }

    fn handle_insert(&mut self, insert: InsertMessage) -> CdcResult<()> {
        let relation = self.relations.lookup(insert.relation_id)?;
        let mut event = base_event(Operation::Insert, relation);
        event.new = Some(tuple_to_row_map(&insert.new_tuple, relation, false)?);
        self.buffer(event, "Insert")
    }

    fn handle_update(&mut self, update: UpdateMessage) -> CdcResult<()> {
        let relation = self.relations.lookup(update.relation_id)?;
        let mut event = base_event(Operation::Update, relation);
        event.new = Some(tuple_to_row_map(&update.new_tuple, relation, false)?);
        match &update.old {
            Some(OldImage::Full(tuple)) => {
                event.old = Some(tuple_to_row_map(tuple, relation, false)?);
            }
            Some(OldImage::Key(tuple)) => {
                event.key = Some(tuple_to_row_map(tuple, relation, true)?);
            }
            None => {}
        }
        self.buffer(event, "Update")
    }

    fn handle_delete(&mut self, delete: DeleteMessage) -> CdcResult<()> {
        let relation = self.relations.lookup(delete.relation_id)?;
        let mut event = base_event(Operation::Delete, relation);
        match &delete.old {
            OldImage::Full(tuple) => {
                event.old = Some(tuple_to_row_map(tuple, relation, false)?);
            }
            OldImage::Key(tuple) => {
                event.key = Some(tuple_to_row_map(tuple, relation, true)?);
            }
        }
        self.buffer(event, "Delete")
    }

    /// One event per truncated relation, in the order the server listed them.
    fn handle_truncate(&mut self, truncate: TruncateMessage) -> CdcResult<()> {
        for relation_id in &truncate.relation_ids {
            let relation = self.relations.lookup(*relation_id)?;
            let event = base_event(Operation::Truncate, relation);
            self.buffer(event, "Truncate")?;
        }
        Ok(())
    }

    fn buffer(&mut self, event: ChangeEvent, kind: &str) -> CdcResult<()> {
        match self.current.as_mut() {
            Some(txn) => {
                txn.events.push(event);
                Ok(())
            }
            None => Err(CdcError::Format(format!(
                "{} for {}.{} arrived outside a transaction (missing Begin)",
                kind, event.schema, event.table
            ))),
        }
    }
}

impl Default for TransactionAssembler {
    fn default() -> Self {
        Self::new()
    }
}

fn base_event(op: Operation, relation: &RelationInfo) -> ChangeEvent {
    ChangeEvent {
        op,
        schema: relation.namespace.clone(),
        table: relation.name.clone(),
        new: None,
        old: None,
        key: None,
        commit_lsn: Lsn::ZERO,
        commit_ts: None,
        xid: None,
        origin: EventOrigin::Stream,
    }
}

/// Zip tuple values with the relation's column metadata.
///
/// `keys_only` restricts the output to replica identity key columns, which
/// is how key-only old images are materialized. TOASTed values the server
/// did not re-send are omitted from the map.
fn tuple_to_row_map(
    tuple: &TupleData,
    relation: &RelationInfo,
    keys_only: bool,
) -> CdcResult<RowMap> {
    if tuple.columns.len() != relation.columns.len() {
        return Err(CdcError::Format(format!(
            "tuple for {}.{} carries {} columns, relation declares {}",
            relation.namespace,
            relation.name,
            tuple.columns.len(),
            relation.columns.len()
        )));
    }

    let mut row = RowMap::new();
    for (value, column) in tuple.columns.iter().zip(relation.columns.iter()) {
        if keys_only && !column.is_key() {
            continue;
        }
        match value {
            ColumnValue::Null => {
                row.insert(column.name.clone(), Value::Null);
            }
            ColumnValue::Unchanged => {}
            ColumnValue::Text(text) => {
                row.insert(column.name.clone(), parse_text_value(text, column.type_oid));
            }
            ColumnValue::Binary(bytes) => {
                row.insert(column.name.clone(), Value::Bytes(bytes.clone()));
            }
        }
    }
    Ok(row)
}

/// Map a text-format column value onto a typed [`Value`] using the column's
/// type OID. Values that fail to parse keep their string form; the text is
/// still exactly what the server sent.
fn parse_text_value(text: &str, type_oid: u32) -> Value {
    match type_oid {
        // bool
        16 => Value::Bool(text == "t" || text == "true"),
        // int2, int4, int8
        21 | 23 | 20 => match text.parse::<i64>() {
            Ok(n) => Value::Int(n),
            Err(_) => Value::String(text.to_string()),
        },
        // float4, float8, numeric
        700 | 701 | 1700 => match text.parse::<f64>() {
            Ok(f) => Value::Float(f),
            Err(_) => Value::String(text.to_string()),
        },
        // json, jsonb
        114 | 3802 => match serde_json::from_str::<serde_json::Value>(text) {
            Ok(v) => Value::from(v),
            Err(_) => Value::String(text.to_string()),
        },
        // text, varchar, dates, uuids and everything else stay textual
        _ => Value::String(text.to_string()),
    }
}

/// Convert a commit timestamp (microseconds since 2000-01-01 UTC) to UTC
/// wall-clock time. Out-of-range values yield `None`.
fn pg_commit_timestamp(micros: i64) -> Option<DateTime<Utc>> {
    let secs = micros.div_euclid(1_000_000) + PG_EPOCH_OFFSET_SECS as i64;
    let nanos = (micros.rem_euclid(1_000_000) * 1_000) as u32;
    DateTime::from_timestamp(secs, nanos)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::pgoutput::{ColumnInfo, RelationMessage, ReplicaIdentity};

    fn column(name: &str, type_oid: u32, key: bool) -> ColumnInfo {
        ColumnInfo {
            flags: if key { 1 } else { 0 },
            name: name.into(),
            type_oid,
            type_modifier: -1,
        }
    }

    fn relation(id: u32, name: &str, columns: Vec<ColumnInfo>) -> PgOutputMessage {
        PgOutputMessage::Relation(RelationMessage {
            relation_id: id,
            namespace: "public".into(),
            name: name.into(),
            replica_identity: ReplicaIdentity::Default,
            columns,
        })
    }

    fn customer() -> PgOutputMessage {
        relation(
            16384,
            "customer",
            vec![column("id", 23, true), column("first_name", 25, false)],
        )
    }

    fn begin(xid: u32) -> PgOutputMessage {
        PgOutputMessage::Begin(BeginMessage {
            final_lsn: 100,
            timestamp: 0,
            xid,
        })
    }

    fn commit(commit_lsn: u64, end_lsn: u64) -> PgOutputMessage {
        PgOutputMessage::Commit(CommitMessage {
            flags: 0,
            commit_lsn,
            end_lsn,
            timestamp: 0,
        })
    }

    fn text(v: &str) -> ColumnValue {
        ColumnValue::Text(v.into())
    }

    fn tuple(values: Vec<ColumnValue>) -> TupleData {
        TupleData { columns: values }
    }

    #[test]
    fn test_insert_transaction_produces_single_batch() {
        let mut asm = TransactionAssembler::new();
        assert!(asm.apply(begin(777)).unwrap().is_none());
        assert!(asm.apply(customer()).unwrap().is_none());
        assert!(asm.in_transaction());
        assert_eq!(asm.current_xid(), Some(777));

        let insert = PgOutputMessage::Insert(InsertMessage {
            relation_id: 16384,
            new_tuple: tuple(vec![text("1"), text("Arthur")]),
        });
        assert!(asm.apply(insert).unwrap().is_none());

        let batch = asm.apply(commit(100, 101)).unwrap().unwrap();
        assert_eq!(batch.commit_lsn, Lsn(100));
        assert_eq!(batch.ack_lsn, Lsn(101));
        assert_eq!(batch.xid, 777);
        assert_eq!(batch.events.len(), 1);

        let event = &batch.events[0];
        assert_eq!(event.op, Operation::Insert);
        assert_eq!(event.schema, "public");
        assert_eq!(event.table, "customer");
        assert_eq!(event.commit_lsn, Lsn(100));
        assert_eq!(event.xid, Some(777));
        assert_eq!(event.origin, EventOrigin::Stream);

        let row = event.new.as_ref().unwrap();
        assert_eq!(row.get("id"), Some(&Value::Int(1)));
        assert_eq!(row.get("first_name"), Some(&Value::String("Arthur".into())));

        assert!(!asm.in_transaction());
        assert_eq!(asm.current_xid(), None);
    }

    #[test]
    fn test_update_with_full_old_image() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(1)).unwrap();
        asm.apply(customer()).unwrap();

        let update = PgOutputMessage::Update(UpdateMessage {
            relation_id: 16384,
            old: Some(OldImage::Full(tuple(vec![text("1"), text("Arthur")]))),
            new_tuple: tuple(vec![text("1"), text("Zaphod")]),
        });
        asm.apply(update).unwrap();

        let batch = asm.apply(commit(200, 201)).unwrap().unwrap();
        let event = &batch.events[0];
        assert_eq!(event.op, Operation::Update);
        let old = event.old.as_ref().unwrap();
        assert_eq!(old.get("first_name"), Some(&Value::String("Arthur".into())));
        assert!(event.key.is_none());
        assert_eq!(event.get_new("first_name"), Some(&Value::String("Zaphod".into())));
    }

    #[test]
    fn test_update_key_image_keeps_only_key_columns() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(2)).unwrap();
        asm.apply(customer()).unwrap();

        // Key tuples carry nulls in the non-key slots.
        let update = PgOutputMessage::Update(UpdateMessage {
            relation_id: 16384,
            old: Some(OldImage::Key(tuple(vec![text("7"), ColumnValue::Null]))),
            new_tuple: tuple(vec![text("8"), text("Ford")]),
        });
        asm.apply(update).unwrap();

        let batch = asm.apply(commit(210, 211)).unwrap().unwrap();
        let event = &batch.events[0];
        assert!(event.old.is_none());
        let key = event.key.as_ref().unwrap();
        assert_eq!(key.len(), 1);
        assert_eq!(key.get("id"), Some(&Value::Int(7)));
    }

    #[test]
    fn test_delete_key_image_feeds_row_accessor() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(3)).unwrap();
        asm.apply(customer()).unwrap();

        let delete = PgOutputMessage::Delete(DeleteMessage {
            relation_id: 16384,
            old: OldImage::Key(tuple(vec![text("5"), ColumnValue::Null])),
        });
        asm.apply(delete).unwrap();

        let batch = asm.apply(commit(220, 221)).unwrap().unwrap();
        let event = &batch.events[0];
        assert_eq!(event.op, Operation::Delete);
        assert!(event.new.is_none());
        assert!(event.old.is_none());
        let row = event.row().unwrap();
        assert_eq!(row.get("id"), Some(&Value::Int(5)));
    }

    #[test]
    fn test_truncate_emits_one_event_per_relation_in_order() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(4)).unwrap();
        asm.apply(relation(16385, "orders", vec![column("id", 23, true)]))
            .unwrap();
        asm.apply(relation(16390, "order_lines", vec![column("id", 23, true)]))
            .unwrap();

        let truncate = PgOutputMessage::Truncate(TruncateMessage {
            options: 0,
            relation_ids: vec![16385, 16390],
        });
        asm.apply(truncate).unwrap();

        let batch = asm.apply(commit(200, 201)).unwrap().unwrap();
        assert_eq!(batch.events.len(), 2);
        assert_eq!(batch.events[0].table, "orders");
        assert_eq!(batch.events[1].table, "order_lines");
        for event in &batch.events {
            assert_eq!(event.op, Operation::Truncate);
            assert_eq!(event.commit_lsn, Lsn(200));
            assert!(event.row().is_none());
        }
    }

    #[test]
    fn test_toasted_value_is_omitted_from_row() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(5)).unwrap();
        asm.apply(customer()).unwrap();

        let insert = PgOutputMessage::Insert(InsertMessage {
            relation_id: 16384,
            new_tuple: tuple(vec![text("9"), ColumnValue::Unchanged]),
        });
        asm.apply(insert).unwrap();

        let batch = asm.apply(commit(230, 231)).unwrap().unwrap();
        let row = batch.events[0].new.as_ref().unwrap();
        assert_eq!(row.len(), 1);
        assert!(!row.contains_key("first_name"));
    }

    #[test]
    fn test_binary_value_round_trips_as_bytes() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(6)).unwrap();
        asm.apply(relation(
            16386,
            "blobs",
            vec![column("id", 23, true), column("payload", 17, false)],
        ))
        .unwrap();

        let insert = PgOutputMessage::Insert(InsertMessage {
            relation_id: 16386,
            new_tuple: tuple(vec![text("1"), ColumnValue::Binary(vec![0xDE, 0xAD])]),
        });
        asm.apply(insert).unwrap();

        let batch = asm.apply(commit(240, 241)).unwrap().unwrap();
        let row = batch.events[0].new.as_ref().unwrap();
        assert_eq!(row.get("payload"), Some(&Value::Bytes(vec![0xDE, 0xAD])));
    }

    #[test]
    fn test_row_outside_transaction_is_fatal() {
        let mut asm = TransactionAssembler::new();
        // Relation metadata may arrive any time; rows may not.
        asm.apply(customer()).unwrap();

        let insert = PgOutputMessage::Insert(InsertMessage {
            relation_id: 16384,
            new_tuple: tuple(vec![text("1"), text("Arthur")]),
        });
        let err = asm.apply(insert).unwrap_err();
        match err {
            CdcError::Format(msg) => assert!(msg.contains("outside a transaction"), "{}", msg),
            other => panic!("expected Format error, got {:?}", other),
        }
    }

    #[test]
    fn test_commit_without_begin_is_fatal() {
        let mut asm = TransactionAssembler::new();
        assert!(matches!(
            asm.apply(commit(100, 101)).unwrap_err(),
            CdcError::Format(_)
        ));
    }

    #[test]
    fn test_nested_begin_is_fatal() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(7)).unwrap();
        assert!(matches!(
            asm.apply(begin(8)).unwrap_err(),
            CdcError::Format(_)
        ));
    }

    #[test]
    fn test_row_for_unknown_relation_is_fatal() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(9)).unwrap();

        let insert = PgOutputMessage::Insert(InsertMessage {
            relation_id: 99999,
            new_tuple: tuple(vec![text("1")]),
        });
        assert!(matches!(
            asm.apply(insert).unwrap_err(),
            CdcError::Format(_)
        ));
    }

    #[test]
    fn test_column_count_mismatch_is_fatal() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(10)).unwrap();
        asm.apply(customer()).unwrap();

        let insert = PgOutputMessage::Insert(InsertMessage {
            relation_id: 16384,
            new_tuple: tuple(vec![text("1")]),
        });
        assert!(matches!(
            asm.apply(insert).unwrap_err(),
            CdcError::Format(_)
        ));
    }

    #[test]
    fn test_assembler_is_reusable_across_transactions() {
        let mut asm = TransactionAssembler::new();
        asm.apply(customer()).unwrap();

        asm.apply(begin(11)).unwrap();
        let first = asm.apply(commit(300, 301)).unwrap().unwrap();
        assert!(first.events.is_empty());

        asm.apply(begin(12)).unwrap();
        let insert = PgOutputMessage::Insert(InsertMessage {
            relation_id: 16384,
            new_tuple: tuple(vec![text("2"), text("Trillian")]),
        });
        asm.apply(insert).unwrap();
        let second = asm.apply(commit(310, 311)).unwrap().unwrap();
        assert_eq!(second.xid, 12);
        assert_eq!(second.events.len(), 1);
    }

    #[test]
    fn test_parse_text_value_typing() {
        assert_eq!(parse_text_value("t", 16), Value::Bool(true));
        assert_eq!(parse_text_value("f", 16), Value::Bool(false));
        assert_eq!(parse_text_value("42", 20), Value::Int(42));
        assert_eq!(parse_text_value("-7", 23), Value::Int(-7));
        assert_eq!(parse_text_value("12.5", 701), Value::Float(12.5));
        assert_eq!(parse_text_value("12.5", 1700), Value::Float(12.5));
        assert_eq!(
            parse_text_value("not-a-number", 23),
            Value::String("not-a-number".into())
        );
        assert_eq!(
            parse_text_value("2024-01-01", 1082),
            Value::String("2024-01-01".into())
        );
        match parse_text_value(r#"{"a": 1}"#, 3802) {
            Value::Object(map) => assert_eq!(map.get("a"), Some(&Value::Int(1))),
            other => panic!("expected object, got {:?}", other),
        }
    }

    #[test]
    fn test_pg_commit_timestamp_conversion() {
        let epoch = pg_commit_timestamp(0).unwrap();
        assert_eq!(epoch.to_rfc3339(), "2000-01-01T00:00:00+00:00");

        let later = pg_commit_timestamp(1_500_000).unwrap();
        assert_eq!(later.timestamp(), 946_684_801);
        assert_eq!(later.timestamp_subsec_micros(), 500_000);

        let before = pg_commit_timestamp(-1_000_000).unwrap();
        assert_eq!(before.timestamp(), 946_684_799);
    }

    #[test]
    fn test_commit_timestamp_is_stamped_on_events() {
        let mut asm = TransactionAssembler::new();
        asm.apply(begin(13)).unwrap();
        asm.apply(customer()).unwrap();
        let insert = PgOutputMessage::Insert(InsertMessage {
            relation_id: 16384,
            new_tuple: tuple(vec![text("3"), text("Marvin")]),
        });
        asm.apply(insert).unwrap();

        let commit = PgOutputMessage::Commit(CommitMessage {
            flags: 0,
            commit_lsn: 400,
            end_lsn: 401,
            timestamp: 86_400_000_000, // one day past the Postgres epoch
        });
        let batch = asm.apply(commit).unwrap().unwrap();
        let ts = batch.events[0].commit_ts.unwrap();
        assert_eq!(ts.to_rfc3339(), "2000-01-02T00:00:00+00:00");
        assert_eq!(batch.commit_ts, Some(ts));
    }
}
