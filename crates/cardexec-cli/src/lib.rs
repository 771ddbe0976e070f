//! `cardexec` command line host.
//!
//! Loads a TOML card file, runs every card through the execution engine
//! and prints record batches and state changes as NDJSON on stdout.

pub mod app;
pub mod config;
pub mod error;
pub mod output;

pub use app::{Application, RunSummary};
pub use config::{parse_param, AppConfig};
pub use error::{AppError, AppResult};
