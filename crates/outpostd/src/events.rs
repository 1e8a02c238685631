//! Events exchanged between the controller, the downloader, their workers
//! and their timers.
//!
//! Each enum is the complete vocabulary of one actor's queue. Workers post
//! exactly one completion event after their side effect is durable; an
//! event arriving in a state that no longer expects it is simply ignored
//! by the top state.

use outpost_core::Command;

use crate::downloader::Session;

/// Controller queue vocabulary.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    /// Posted once when the controller enters its top state.
    PoweredOn,
    /// Recovery found a persisted command script from an earlier run.
    UpdateInterrupted,
    /// Poll the server for a manifest (timer tick or recovery hand-off).
    CheckForUpdate,
    /// External request to enter the remote-control state.
    RemoteControl,
    /// Dispatch the given command (always the current script head).
    ExecuteCommand(Command),
    /// The in-flight command completed successfully.
    CommandExecuted,
    /// The in-flight command failed; the cycle is aborted.
    CommandFailed,
    /// The script reached `end`.
    UpdateSucceeded,
    /// Downloader: manifest fetched and server said there is work.
    ManifestAvailable {
        procedures: String,
        new_version: String,
    },
    /// Downloader: no manifest this round (error, or nothing offered).
    ManifestUnavailable,
    /// Downloader: requested file fully staged.
    FileFetched { filename: String },
    /// Downloader: requested file could not be fetched.
    FileFetchFailed,
}

/// Downloader queue vocabulary.
#[derive(Debug, Clone)]
pub enum DownloaderEvent {
    /// Controller asks for the current manifest.
    FetchManifest,
    /// Controller asks for one file of the target version.
    FetchFile { filename: String, version: String },
    /// Login worker: session established.
    LoggedIn(Session),
    /// Login worker: no session (bad credentials or transport failure).
    LoginFailed,
}
