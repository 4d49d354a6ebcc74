//! Core value types shared by every layer of the importer.
//!
//! - [`value`]: SQL values exchanged with the snapshot and target stores
//! - [`row`]: named snapshot rows
//! - [`query`]: parameterized query values built at unit registration
//! - [`entity`]: entity and name kinds recorded in the mapping store
//! - [`identifier`]: identifier validation and quoting

pub mod entity;
pub mod identifier;
pub mod query;
pub mod row;
pub mod value;

pub use entity::{normalize_name, EntityType, NameKind};
pub use query::SourceQuery;
pub use row::{parse_timestamp, SourceRow};
pub use value::{SqlNullType, SqlValue};
