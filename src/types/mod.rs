//! Shared value types.
//!
//! - [`encoding`]: deterministic little-endian `Encode`/`Decode` used by the
//!   compiled script resource format

pub mod encoding;
