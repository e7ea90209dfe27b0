//! Shared error types

mod errors;

pub(crate) use errors::describe_exit;
pub use errors::{ClientError, Result, TransportError};
