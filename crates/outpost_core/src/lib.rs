//! Outpost core - update engine logic shared by the agent daemon.
//!
//! Everything in this crate is synchronous and side-effect free apart from
//! explicit file persistence: the update command grammar, the persisted
//! command script and completion log that make an update cycle resumable,
//! the manifest parser/compiler, and the configuration snapshot.

pub mod command;
pub mod config;
pub mod error;
pub mod manifest;
pub mod script;

pub use command::Command;
pub use config::Config;
pub use error::{Error, Result};
pub use manifest::Directive;
pub use script::{CommandLog, CommandScript};
