//! Workcache.
//!
//! Workcache runs commands in persistent workspaces that are shared between processes. Each
//! workspace is a directory named after its key, guarded by advisory file locks, and removed by a
//! mark-and-sweep cleanup once it has not been used for a while.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod logging;

fn main() {
    match cli::execute() {
        Ok(code) => std::process::exit(code),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
