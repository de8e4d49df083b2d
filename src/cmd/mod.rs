//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module     | Commands handled |
//! |------------|------------------|
//! | `start`    | `Start`          |
//! | `bringup`  | `BringUp`        |
//! | `name`     | `Name`           |
//! | `teardown` | `Teardown`       |
//! | `config`   | `Config`         |

pub mod bringup;
pub mod config;
pub mod name;
pub mod start;
pub mod teardown;

pub use bringup::{BringUpArgs, cmd_bring_up};
pub use config::cmd_config;
pub use name::cmd_name;
pub use start::{StartArgs, cmd_start};
pub use teardown::cmd_teardown;
