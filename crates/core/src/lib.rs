//! # spinsync core
//!
//! Pure building blocks shared by every part of the ingestion pipeline:
//!
//! - **Identifiers**: chain-qualified entity keys that independent producers
//!   derive identically without coordination
//! - **Types**: canonical tables, provenance tags, seed records
//! - **Ordering**: packing chain positions and wall-clock times into ordinals
//! - **Register**: the per-entity CRDT register and its merge function
//!
//! Nothing in this crate performs I/O.

#![warn(missing_docs)]

pub mod constants;
pub mod error;
pub mod hashing;
pub mod identifiers;
pub mod ordering;
pub mod register;
pub mod types;

pub use constants::*;
pub use error::{CoreError, Result};
pub use register::{FieldEntry, MergeOutcome, Register};
pub use types::*;
