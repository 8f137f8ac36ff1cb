//! Incremental, convergent ingestion of on-chain music NFTs.
//!
//! This crate provides:
//! - A cursor-driven processor contract and a runner that drives an ordered
//!   processor list to a fixpoint
//! - Mempool staging of provenance-tagged writes
//! - A merge engine folding staged writes into per-entity CRDT registers and
//!   materializing them as per-table views
//! - Error annotations with bounded automatic resets
//! - Chain and metadata clients, and the processors built on them
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │  Runner (one pass = every processor in order) │
//! │                                               │
//! │   cursor ──► trigger ──► process ──► mempool  │
//! │     ▲                                  │      │
//! │     │                           ┌──────▼────┐ │
//! │     └──── advance after ◄────── │   Merge   │ │
//! │           the drain             │  engine   │ │
//! │                                 └──────┬────┘ │
//! └────────────────────────────────────────┼──────┘
//!                                          │
//!                          ┌───────────────▼──────────────┐
//!                          │ SQLite: crdt_state,          │
//!                          │ canonical_records, view_*    │
//!                          └──────────────────────────────┘
//! ```
//!
//! Processors never write canonical state. Whatever order their writes land
//! in, every field of every entity converges to the write with the greatest
//! provenance.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod clients;
pub mod config;
pub mod merge;
pub mod processor;
pub mod processors;
pub mod runner;
pub mod storage;

// Re-export common types
pub use spinsync_core::{types::*, *};
