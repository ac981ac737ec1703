// See <https://matklad.github.io/2021/02/27/delete-cargo-integration-tests.html>

pub mod atomic_move;
pub mod coalescing;
pub mod exclusion;
pub mod providers;
pub mod soft_delete;
pub mod utils;

pub use utils::*;
