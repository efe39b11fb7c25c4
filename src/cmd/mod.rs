//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                       |
//! |----------|----------------------------------------|
//! | `serve`  | `Serve`                                |
//! | `db`     | `InitDb`, `RegistrationToken`, `Sweep` |
//! | `config` | `Config`                               |

pub mod config;
pub mod db;
pub mod serve;

pub use config::cmd_config;
pub use db::{cmd_init_db, cmd_registration_token, cmd_sweep};
pub use serve::cmd_serve;
