//! Persisted command script and completion log.
//!
//! The script file is the single unit of crash-recoverable state: it is
//! written when a manifest is accepted and deleted when the cycle closes.
//! The log file records one line per *completed* command, strictly after
//! the command succeeded, so its length is the resume offset. A command is
//! therefore replayed at most once: anything in the log is never run again.

use std::collections::VecDeque;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use tracing::{debug, warn};

use crate::command::Command;
use crate::error::Result;

/// Ordered list of update commands, mirrored verbatim in the script file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandScript {
    commands: VecDeque<Command>,
}

impl CommandScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_commands(commands: Vec<Command>) -> Self {
        Self {
            commands: commands.into(),
        }
    }

    pub fn push(&mut self, cmd: Command) {
        self.commands.push_back(cmd);
    }

    /// The command currently due for execution.
    pub fn head(&self) -> Option<&Command> {
        self.commands.front()
    }

    pub fn pop_head(&mut self) -> Option<Command> {
        self.commands.pop_front()
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Command> {
        self.commands.iter()
    }

    /// Render the one-command-per-line textual form.
    pub fn to_lines(&self) -> String {
        let mut out = String::new();
        for cmd in &self.commands {
            out.push_str(&cmd.to_string());
            out.push('\n');
        }
        out
    }

    /// Write the script file. This is the moment the cycle becomes
    /// recoverable; an interrupted process finds the file on the next boot.
    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, self.to_lines())?;
        debug!("wrote command script ({} commands) to {}", self.len(), path.display());
        Ok(())
    }

    /// Read a script file back. Blank lines are skipped; lines this build
    /// does not understand are kept as [`Command::Unknown`] so the resume
    /// offset still counts them.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let commands = text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(Command::parse)
            .collect();
        Ok(Self { commands })
    }
}

/// Append-only record of completed commands.
pub struct CommandLog;

impl CommandLog {
    /// Append one line for a command that just completed. Synced to disk
    /// before returning: the log must be durable before the next command
    /// is dispatched, or a crash could replay a completed step.
    pub fn append(path: &Path, cmd: &Command) -> Result<()> {
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        writeln!(file, "{}", cmd)?;
        file.sync_all()?;
        Ok(())
    }

    /// Load the completed commands. A missing file means a cycle that has
    /// not completed anything yet.
    pub fn load(path: &Path) -> Result<Vec<Command>> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(text
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(Command::parse)
            .collect())
    }
}

/// Compute the remaining suffix of an interrupted script.
///
/// The first `completed` commands are dropped; they are in the log and were
/// finished before the crash. If the command at the resume offset is
/// `restart`, it is skipped too: the process would not be running now if
/// that restart had not already happened.
pub fn resume(mut script: CommandScript, completed: usize) -> CommandScript {
    for _ in 0..completed {
        script.pop_head();
    }
    if matches!(script.head(), Some(Command::Restart)) {
        debug!("resume offset sits on restart; skipping it");
        script.pop_head();
    }
    script
}

/// Remove the script and log files, closing the cycle. Missing files are
/// fine; anything else is logged and ignored since the files will also be
/// cleared at the start of the next accepted cycle.
pub fn clear(script_path: &Path, log_path: &Path) {
    for path in [script_path, log_path] {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("could not remove {}: {}", path.display(), e);
            }
        }
    }
}
