//! Types shared between the tao crates.

pub mod errors;

pub use errors::{Cause, ERROR_SPLIT, ErrorCode, TaoError, TaoResult};
