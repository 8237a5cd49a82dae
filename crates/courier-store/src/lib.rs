//! # courier-store
//!
//! Durable state for the Courier delivery engine, backed by SQLite.
//!
//! The crate exposes a synchronous [`Database`] handle wrapping a
//! `rusqlite::Connection`. On top of the plain CRUD helpers it implements the
//! two transactional units the delivery engine depends on:
//!
//! - the conversation ledger ([`Database::post_message`]): message row,
//!   attachment references and every participant's conversation summary
//!   commit together or not at all;
//! - content-addressed file bookkeeping: `file_storage.ref_count` only ever
//!   changes in the same transaction as the `file_references` row that
//!   justifies it.

pub mod conversations;
pub mod database;
pub mod files;
pub mod groups;
pub mod ledger;
pub mod migrations;
pub mod models;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use models::*;
