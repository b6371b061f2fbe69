//! Startup recovery
//!
//! Runs once, before any worker starts: every run left `queued` or
//! `running` by a previous process is failed, along with its in-flight
//! tests. After this pass no non-terminal run exists that the current
//! process did not itself create.

use testdeck_common::Result;
use tracing::{info, warn};

use crate::store::Store;

pub const INTERRUPT_MESSAGE: &str = "Test execution interrupted by server restart";

pub fn recover_interrupted_runs(store: &Store) -> Result<()> {
    let (runs, tests) = store.fail_non_terminal_runs(INTERRUPT_MESSAGE)?;

    if runs > 0 {
        warn!(
            "Recovered {} interrupted run(s) ({} test row(s)) from previous process",
            runs, tests
        );
    } else {
        info!("No interrupted runs to recover");
    }
    Ok(())
}
