//! CLI command implementations.
//!
//! | Module    | Commands handled          |
//! |-----------|---------------------------|
//! | `serve`   | `Serve`                   |
//! | `sweep`   | `Sweep`                   |
//! | `project` | `Init`, `SetSecret`       |
//! | `config`  | `Config`                  |

pub mod config;
pub mod project;
pub mod serve;
pub mod sweep;

pub use config::cmd_config;
pub use project::{cmd_init, cmd_set_secret};
pub use serve::cmd_serve;
pub use sweep::cmd_sweep;
