//! Typed CRUD over the TestDeck schema
//!
//! One `Store` handle shared by the HTTP surface and the background workers.
//! All methods take short transactions and return owned value objects;
//! JSON-serialized columns are parsed on read and re-serialized on write.

mod catalog;
mod runs;
mod schedules;

pub use catalog::{CatalogFilter, NewTestDefinition};
pub use runs::{NewRun, RunFilter, RunPage};
pub use schedules::{NewSchedule, ScheduleUpdate};

use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::Connection;
use testdeck_common::Database;

/// Store handle over the shared connection
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn new(db: &Database) -> Self {
        Self {
            conn: db.connection(),
        }
    }
}
