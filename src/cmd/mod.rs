//! CLI command implementations.
//!
//! Each submodule owns one or more related `Commands` variants:
//!
//! | Module   | Commands handled                                        |
//! |----------|---------------------------------------------------------|
//! | `serve`  | `Serve`                                                 |
//! | `jobs`   | `Run`, `Jobs`, `Job`, `Cancel`, `Profiles`, `Status`    |
//! | `drain`  | `Drain`                                                 |
//! | `config` | `Config`                                                |
//! | `init`   | `InitSharedFs`                                          |
//!
//! `serve`, `drain`, `config` and `init` work on local configuration; the
//! `jobs` commands talk to a running server through [`agentcore::client`].

pub mod config;
pub mod drain;
pub mod init;
pub mod jobs;
pub mod serve;

pub use config::cmd_config;
pub use drain::cmd_drain;
pub use init::cmd_init_shared_fs;
pub use jobs::{cmd_cancel, cmd_job, cmd_jobs, cmd_profiles, cmd_run, cmd_status};
pub use serve::cmd_serve;
