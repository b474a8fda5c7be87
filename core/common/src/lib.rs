//! Common utilities and types shared across fieldsync modules.
//!
//! This module provides the data model of the mutation queue and the error
//! type used by the storage and sync layers.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    parse_timestamp, record_id, Action, EntityType, ItemState, MutationItem, Record, Resolution,
    ID_FIELD, LOCAL_MODIFIED_FIELD, SERVER_TIMESTAMP_FIELD,
};
