//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled        |
//! |----------|-------------------------|
//! | `serve`  | `Serve`                 |
//! | `init`   | `Init`                  |
//! | `user`   | `User add`, `User list` |
//! | `config` | `Config`                |

pub mod config;
pub mod init;
pub mod serve;
pub mod user;

pub use config::cmd_config;
pub use init::cmd_init;
pub use serve::{ServeOverrides, cmd_serve};
pub use user::cmd_user;
