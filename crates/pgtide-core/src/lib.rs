pub mod error;
pub mod event;
pub mod lsn;

pub use error::{Error, Result};
pub use event::{ChangeEvent, EventOrigin, Operation, RowMap, Value};
pub use lsn::Lsn;
