//! Adapters that live inside the domain crate for convenience.
//!
//! The in-memory storage is intended for unit testing and local demos. Real
//! adapters (SQLite, journal logs) live in separate crates.

pub mod memory_repo;
