//! The update command grammar.
//!
//! A compiled update is an ordered list of commands, serialized one per
//! line to the command script file. The same line format is appended to the
//! completion log after each command succeeds, so the textual form is the
//! crash-recovery contract and must round-trip exactly.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^version "([^"]+)"$"#).unwrap());
static GET_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^get "([^"]+)"$"#).unwrap());
static CHECK_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^check "([^"]+)" "([^"]+)"$"#).unwrap());
static SET_EXEC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^set_exec "([^"]+)"$"#).unwrap());
static EXEC_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^exec "([^"]+)"$"#).unwrap());
static COPY_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^copy "([^"]+)" "([^"]+)"$"#).unwrap());
static RENAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^rename "([^"]+)" "([^"]+)"$"#).unwrap());

/// One step of an update cycle.
///
/// Ordering within a script is semantically significant: downloads and
/// integrity checks always precede any mutation of the live tree, and the
/// agent replaces its own binary last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Target version of the cycle; the head line of every script.
    Version(String),
    /// Download a file into the staging directory.
    Get(String),
    /// Verify the staged file against its manifest checksum.
    Check { path: String, checksum: String },
    /// Ensure the execute permission bit is set.
    SetExec(String),
    /// Ask the main application to stop over the local control socket.
    ShutdownMain,
    /// Run a program and wait for it to exit.
    Exec(String),
    /// Filesystem copy, overwriting the destination.
    Copy { src: String, dst: String },
    /// Filesystem rename.
    Rename { src: String, dst: String },
    /// Terminate the process; the supervisor relaunches it and recovery
    /// resumes from the completion log.
    Restart,
    /// Terminal marker: the cycle completed.
    End,
    /// A persisted line this build does not understand. Kept so that the
    /// resume offset stays aligned with the file; fails when executed.
    Unknown(String),
}

impl Command {
    /// Parse one script line. Never fails: an unrecognized line becomes
    /// [`Command::Unknown`], which is a failing command at execution time.
    pub fn parse(line: &str) -> Command {
        let line = line.trim();

        if let Some(c) = VERSION_RE.captures(line) {
            return Command::Version(c[1].to_string());
        }
        if let Some(c) = GET_RE.captures(line) {
            return Command::Get(c[1].to_string());
        }
        if let Some(c) = CHECK_RE.captures(line) {
            return Command::Check {
                path: c[1].to_string(),
                checksum: c[2].to_string(),
            };
        }
        if let Some(c) = SET_EXEC_RE.captures(line) {
            return Command::SetExec(c[1].to_string());
        }
        if let Some(c) = EXEC_RE.captures(line) {
            return Command::Exec(c[1].to_string());
        }
        if let Some(c) = COPY_RE.captures(line) {
            return Command::Copy {
                src: c[1].to_string(),
                dst: c[2].to_string(),
            };
        }
        if let Some(c) = RENAME_RE.captures(line) {
            return Command::Rename {
                src: c[1].to_string(),
                dst: c[2].to_string(),
            };
        }

        match line {
            "shutdown_main" => Command::ShutdownMain,
            "restart" => Command::Restart,
            "end" => Command::End,
            _ => Command::Unknown(line.to_string()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Version(v) => write!(f, "version \"{}\"", v),
            Command::Get(path) => write!(f, "get \"{}\"", path),
            Command::Check { path, checksum } => write!(f, "check \"{}\" \"{}\"", path, checksum),
            Command::SetExec(path) => write!(f, "set_exec \"{}\"", path),
            Command::ShutdownMain => write!(f, "shutdown_main"),
            Command::Exec(path) => write!(f, "exec \"{}\"", path),
            Command::Copy { src, dst } => write!(f, "copy \"{}\" \"{}\"", src, dst),
            Command::Rename { src, dst } => write!(f, "rename \"{}\" \"{}\"", src, dst),
            Command::Restart => write!(f, "restart"),
            Command::End => write!(f, "end"),
            Command::Unknown(raw) => write!(f, "{}", raw),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_format_round_trips() {
        let commands = vec![
            Command::Version("2.0".to_string()),
            Command::Get("bin/tool".to_string()),
            Command::Check {
                path: "bin/tool".to_string(),
                checksum: "abc123".to_string(),
            },
            Command::SetExec("temp-download/bin/tool".to_string()),
            Command::ShutdownMain,
            Command::Exec("./pre-update.sh".to_string()),
            Command::Copy {
                src: "temp-download/bin/tool".to_string(),
                dst: "./bin/tool".to_string(),
            },
            Command::Rename {
                src: "outpostd".to_string(),
                dst: "outpostd.old".to_string(),
            },
            Command::Restart,
            Command::End,
        ];

        for cmd in commands {
            assert_eq!(Command::parse(&cmd.to_string()), cmd);
        }
    }

    #[test]
    fn test_exact_line_spellings() {
        assert_eq!(
            Command::Version("2.0".to_string()).to_string(),
            r#"version "2.0""#
        );
        assert_eq!(
            Command::Check {
                path: "a".to_string(),
                checksum: "ff".to_string()
            }
            .to_string(),
            r#"check "a" "ff""#
        );
        assert_eq!(Command::ShutdownMain.to_string(), "shutdown_main");
    }

    #[test]
    fn test_unrecognized_line_is_preserved() {
        let cmd = Command::parse("frobnicate \"x\"");
        assert_eq!(cmd, Command::Unknown("frobnicate \"x\"".to_string()));
        // Round-trips so the resume offset stays honest.
        assert_eq!(cmd.to_string(), "frobnicate \"x\"");
    }

    #[test]
    fn test_missing_quotes_rejected() {
        assert!(matches!(Command::parse("get bin/tool"), Command::Unknown(_)));
        assert!(matches!(
            Command::parse("version 2.0"),
            Command::Unknown(_)
        ));
    }
}
