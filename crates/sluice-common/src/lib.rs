//! Sluice Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, utilities, and error handling for the Sluice workspace.
//!
//! # Overview
//!
//! - **Error Handling**: the shared [`SluiceError`] and [`Result`] alias
//! - **Logging**: tracing subscriber setup driven by [`logging::LogConfig`]
//! - **Checksums**: integrity digests for staged files
//! - **Types**: small value types shared by the pipeline and its sinks
//!
//! # Example
//!
//! ```no_run
//! use sluice_common::{checksum::Checksum, Result};
//!
//! fn describe(path: &str) -> Result<()> {
//!     let checksum = Checksum::from_file(path)?;
//!     println!("{path}: {checksum}");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::{Result, SluiceError};
