//! Decoder for the pgoutput logical replication protocol.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-logicalrep-message-formats.html
//!
//! Decoding is a pure function of the input bytes: the same buffer always
//! yields the same message, and anything malformed or unknown is an error
//! rather than a lossy guess.

use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read};

use crate::error::{CdcError, CdcResult};

/// A decoded pgoutput message.
#[derive(Debug, Clone, PartialEq)]
pub enum PgOutputMessage {
    Begin(BeginMessage),
    Commit(CommitMessage),
    Relation(RelationMessage),
    Type(TypeMessage),
    Insert(InsertMessage),
    Update(UpdateMessage),
    Delete(DeleteMessage),
    Truncate(TruncateMessage),
    Origin(OriginMessage),
}

#[derive(Debug, Clone, PartialEq)]
pub struct BeginMessage {
    pub final_lsn: u64,
    pub timestamp: i64, // microseconds since 2000-01-01
    pub xid: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CommitMessage {
    pub flags: u8,
    pub commit_lsn: u64,
    pub end_lsn: u64,
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RelationMessage {
    pub relation_id: u32,
    pub namespace: String,
    pub name: String,
    pub replica_identity: ReplicaIdentity,
    pub columns: Vec<ColumnInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaIdentity {
    Default, // 'd' - default (primary key or unique index)
    Nothing, // 'n' - nothing
    Full,    // 'f' - full (all columns)
    Index,   // 'i' - index
}

impl From<u8> for ReplicaIdentity {
    fn from(b: u8) -> Self {
        match b {
            b'n' => ReplicaIdentity::Nothing,
            b'f' => ReplicaIdentity::Full,
            b'i' => ReplicaIdentity::Index,
            _ => ReplicaIdentity::Default,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub flags: u8, // 1 = part of the replica identity key
    pub name: String,
    pub type_oid: u32,
    pub type_modifier: i32,
}

impl ColumnInfo {
    pub fn is_key(&self) -> bool {
        self.flags & 1 == 1
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TypeMessage {
    pub type_id: u32,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InsertMessage {
    pub relation_id: u32,
    pub new_tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct UpdateMessage {
    pub relation_id: u32,
    pub old: Option<OldImage>,
    pub new_tuple: TupleData,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeleteMessage {
    pub relation_id: u32,
    pub old: OldImage,
}

/// The prior row image carried by update/delete, as permitted by the
/// table's replica identity: the key columns only, or the full row.
#[derive(Debug, Clone, PartialEq)]
pub enum OldImage {
    Key(TupleData),
    Full(TupleData),
}

impl OldImage {
    pub fn tuple(&self) -> &TupleData {
        match self {
            OldImage::Key(t) | OldImage::Full(t) => t,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TruncateMessage {
    pub options: u8,
    pub relation_ids: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OriginMessage {
    pub origin_lsn: u64,
    pub origin_name: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TupleData {
    pub columns: Vec<ColumnValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ColumnValue {
    Null,
    Unchanged, // TOASTed value not re-sent
    Text(String),
    Binary(Vec<u8>),
}

/// Decoder for pgoutput binary protocol messages.
pub struct PgOutputDecoder;

impl PgOutputDecoder {
    pub fn new() -> Self {
        Self
    }

    /// Decode one pgoutput message from raw bytes.
    pub fn decode(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        if data.is_empty() {
            return Err(CdcError::Format("empty pgoutput message".into()));
        }

        let tag = data[0];
        let payload = &data[1..];

        match tag {
            b'B' => self.decode_begin(payload),
            b'C' => self.decode_commit(payload),
            b'R' => self.decode_relation(payload),
            b'Y' => self.decode_type(payload),
            b'I' => self.decode_insert(payload),
            b'U' => self.decode_update(payload),
            b'D' => self.decode_delete(payload),
            b'T' => self.decode_truncate(payload),
            b'O' => self.decode_origin(payload),
            other => Err(CdcError::UnsupportedMessage { tag: other }),
        }
    }

    fn decode_begin(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let final_lsn = cursor.read_u64::<BigEndian>()?;
        let timestamp = cursor.read_i64::<BigEndian>()?;
        let xid = cursor.read_u32::<BigEndian>()?;

        Ok(PgOutputMessage::Begin(BeginMessage {
            final_lsn,
            timestamp,
            xid,
        }))
    }

    fn decode_commit(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let flags = cursor.read_u8()?;
        let commit_lsn = cursor.read_u64::<BigEndian>()?;
        let end_lsn = cursor.read_u64::<BigEndian>()?;
        let timestamp = cursor.read_i64::<BigEndian>()?;

        Ok(PgOutputMessage::Commit(CommitMessage {
            flags,
            commit_lsn,
            end_lsn,
            timestamp,
        }))
    }

    fn decode_relation(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let relation_id = cursor.read_u32::<BigEndian>()?;
        let namespace = self.read_string(&mut cursor)?;
        let name = self.read_string(&mut cursor)?;
        let replica_identity = cursor.read_u8()?.into();
        let num_columns = self.read_count(cursor.read_i16::<BigEndian>()?)?;

        let mut columns = Vec::with_capacity(num_columns);
        for _ in 0..num_columns {
            let flags = cursor.read_u8()?;
            let col_name = self.read_string(&mut cursor)?;
            let type_oid = cursor.read_u32::<BigEndian>()?;
            let type_modifier = cursor.read_i32::<BigEndian>()?;

            columns.push(ColumnInfo {
                flags,
                name: col_name,
                type_oid,
                type_modifier,
            });
        }

        Ok(PgOutputMessage::Relation(RelationMessage {
            relation_id,
            namespace,
            name,
            replica_identity,
            columns,
        }))
    }

    fn decode_type(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let type_id = cursor.read_u32::<BigEndian>()?;
        let namespace = self.read_string(&mut cursor)?;
        let name = self.read_string(&mut cursor)?;

        Ok(PgOutputMessage::Type(TypeMessage {
            type_id,
            namespace,
            name,
        }))
    }

    fn decode_insert(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let relation_id = cursor.read_u32::<BigEndian>()?;
        let tuple_type = cursor.read_u8()?;

        if tuple_type != b'N' {
            return Err(CdcError::Format(format!(
                "expected 'N' for insert tuple, got '{}'",
                tuple_type as char
            )));
        }

        let new_tuple = self.decode_tuple(&mut cursor)?;

        Ok(PgOutputMessage::Insert(InsertMessage {
            relation_id,
            new_tuple,
        }))
    }

    fn decode_update(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let relation_id = cursor.read_u32::<BigEndian>()?;

        let first_type = cursor.read_u8()?;
        let (old, new_tuple) = match first_type {
            b'K' | b'O' => {
                let old_tuple = self.decode_tuple(&mut cursor)?;
                let old = if first_type == b'K' {
                    OldImage::Key(old_tuple)
                } else {
                    OldImage::Full(old_tuple)
                };
                let new_type = cursor.read_u8()?;
                if new_type != b'N' {
                    return Err(CdcError::Format(format!(
                        "expected 'N' after old tuple in update, got '{}'",
                        new_type as char
                    )));
                }
                (Some(old), self.decode_tuple(&mut cursor)?)
            }
            b'N' => (None, self.decode_tuple(&mut cursor)?),
            other => {
                return Err(CdcError::Format(format!(
                    "unexpected tuple type in update: '{}'",
                    other as char
                )));
            }
        };

        Ok(PgOutputMessage::Update(UpdateMessage {
            relation_id,
            old,
            new_tuple,
        }))
    }

    fn decode_delete(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let relation_id = cursor.read_u32::<BigEndian>()?;
        let tuple_type = cursor.read_u8()?;

        let old = match tuple_type {
            b'K' => OldImage::Key(self.decode_tuple(&mut cursor)?),
            b'O' => OldImage::Full(self.decode_tuple(&mut cursor)?),
            other => {
                return Err(CdcError::Format(format!(
                    "expected 'K' or 'O' for delete tuple, got '{}'",
                    other as char
                )));
            }
        };

        Ok(PgOutputMessage::Delete(DeleteMessage { relation_id, old }))
    }

    fn decode_truncate(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let num_relations = cursor.read_u32::<BigEndian>()? as usize;
        let options = cursor.read_u8()?;

        let mut relation_ids = Vec::with_capacity(num_relations);
        for _ in 0..num_relations {
            relation_ids.push(cursor.read_u32::<BigEndian>()?);
        }

        Ok(PgOutputMessage::Truncate(TruncateMessage {
            options,
            relation_ids,
        }))
    }

    fn decode_origin(&self, data: &[u8]) -> CdcResult<PgOutputMessage> {
        let mut cursor = Cursor::new(data);
        let origin_lsn = cursor.read_u64::<BigEndian>()?;
        let origin_name = self.read_string(&mut cursor)?;

        Ok(PgOutputMessage::Origin(OriginMessage {
            origin_lsn,
            origin_name,
        }))
    }

    fn decode_tuple(&self, cursor: &mut Cursor<&[u8]>) -> CdcResult<TupleData> {
        let num_columns = self.read_count(cursor.read_i16::<BigEndian>()?)?;
        let mut columns = Vec::with_capacity(num_columns);

        for _ in 0..num_columns {
            let indicator = cursor.read_u8()?;
            let value = match indicator {
                b'n' => ColumnValue::Null,
                b'u' => ColumnValue::Unchanged,
                b't' => ColumnValue::Text(self.read_utf8(self.read_value(cursor)?)?),
                b'b' => ColumnValue::Binary(self.read_value(cursor)?),
                other => {
                    return Err(CdcError::Format(format!(
                        "unknown column indicator: '{}' (0x{:02X})",
                        other as char, other
                    )));
                }
            };
            columns.push(value);
        }

        Ok(TupleData { columns })
    }

    /// Read a length-prefixed column value.
    fn read_value(&self, cursor: &mut Cursor<&[u8]>) -> CdcResult<Vec<u8>> {
        let len = cursor.read_i32::<BigEndian>()?;
        if len < 0 {
            return Err(CdcError::Format(format!(
                "negative column value length: {}",
                len
            )));
        }
        let mut buf = vec![0u8; len as usize];
        cursor.read_exact(&mut buf)?;
        Ok(buf)
    }

    fn read_utf8(&self, bytes: Vec<u8>) -> CdcResult<String> {
        String::from_utf8(bytes)
            .map_err(|e| CdcError::Format(format!("non-UTF-8 text value: {}", e)))
    }

    fn read_count(&self, raw: i16) -> CdcResult<usize> {
        if raw < 0 {
            return Err(CdcError::Format(format!("negative column count: {}", raw)));
        }
        Ok(raw as usize)
    }

    /// Read a null-terminated string.
    fn read_string(&self, cursor: &mut Cursor<&[u8]>) -> CdcResult<String> {
        let mut bytes = Vec::new();
        loop {
            let b = cursor.read_u8()?;
            if b == 0 {
                break;
            }
            bytes.push(b);
        }
        self.read_utf8(bytes)
    }
}

impl Default for PgOutputDecoder {
    fn default() -> Self {
        Self::new()
    }
}
