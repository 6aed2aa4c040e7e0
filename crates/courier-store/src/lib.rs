//! # courier-store
//!
//! Local durable storage for the Courier sync core, backed by SQLite.
//!
//! The store is the single source of truth for what the UI renders.  The
//! crate exposes a synchronous `Database` handle that wraps a
//! `rusqlite::Connection`, provides typed CRUD helpers for conversations and
//! messages, and broadcasts a [`StoreEvent`] after every committed change so
//! observers see local writes without delay.

pub mod conversations;
pub mod database;
pub mod events;
pub mod messages;
pub mod migrations;
pub mod models;

mod error;
mod sql;

pub use database::Database;
pub use error::{Result, StoreError};
pub use events::StoreEvent;
pub use models::*;
