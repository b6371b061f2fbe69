//! TestDeck common library
//!
//! Shared types, errors, and persistence used by the TestDeck server.

pub mod db;
pub mod error;
pub mod time;
pub mod types;

pub use db::Database;
pub use error::{Error, Result};
