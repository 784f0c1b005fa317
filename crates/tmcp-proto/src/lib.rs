//! Wire format for TMCP envelopes.
//!
//! The messages are plain `prost` derives; there is no `.proto` build step.

#![forbid(unsafe_code)]

pub mod v1;
pub mod validation;

pub use validation::{Validate, ValidationError};
