//! Side-effecting adapters: processes, git, hosting, filesystem artifacts.

pub mod agent;
pub mod checks;
pub mod clock;
pub mod config;
pub mod evaluate;
pub mod git;
pub mod hosting;
pub mod notify;
pub mod process;
pub mod prompt;
pub mod run_dir;
