//! Core modules shared by the collectors and the gate.
//!
//! Configuration, manifests, ledgers, file leases and subprocess execution
//! live here. Nothing in `core` knows about coverage or benchmark semantics.

pub mod config;
pub mod error;
pub mod lanes;
pub mod ledger;
pub mod lock;
pub mod manifest;
pub mod output;
pub mod runner;
pub mod time;
