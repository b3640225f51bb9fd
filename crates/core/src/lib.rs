//! Shared building blocks for keel crates.
//!
//! - [`Error`] / [`Result`]: errors for file access and document parsing
//! - [`ResultExt`]: logging combinators that avoid unwrap/expect
//! - [`format`]: typed loaders for JSON, YAML and TOML documents

#![forbid(unsafe_code)]

pub mod error;
pub mod format;
pub mod result;

pub use error::Error;
pub use result::{Result, ResultExt};
