//! Offline-tolerant submission and synchronization core for cleaning logs.
//!
//! A staff member's checklist goes through [`submission::SubmissionController`];
//! anything that cannot reach the remote store lands in
//! [`pending::PendingWriteStore`] and is flushed later by [`sync::SyncEngine`].

pub mod app;
pub mod cascade;
pub mod config;
pub mod db;
pub mod model;
pub mod network;
pub mod pending;
pub mod pin;
pub mod remote;
pub mod submission;
pub mod sync;
