//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: raw rows returned by repositories, before payload decoding.
//! - `repo`: SQL-only functions over the local SQLite database.
//!
//! Higher layers (`pending`, `cascade`) own the domain types and go through
//! these functions for every read and write.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{CascadeRepairRow, PendingRow};
