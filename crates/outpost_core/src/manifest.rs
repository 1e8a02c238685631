//! Manifest parsing and compilation into a command script.
//!
//! The server's manifest body is free text with embedded directives. The
//! compiler turns the ordered directives into the fixed-phase script:
//! everything is downloaded and verified before the main application is
//! stopped, the live tree is only mutated after that, and the agent
//! replaces its own binary last, unconditionally followed by a restart.

use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::command::Command;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::script::CommandScript;

// Longer keywords first: `Update` must not shadow `UpdateExecutable`.
static FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(AddExecutable|UpdateExecutable|Add|Update) "([^"]+)" ([[:alnum:]]+)"#).unwrap()
});
static DELETE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"Delete "([^"]+)""#).unwrap());
static VERSION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"Version "([^"]+)""#).unwrap());

/// One parsed manifest directive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Add { path: String, checksum: String },
    AddExecutable { path: String, checksum: String },
    Update { path: String, checksum: String },
    UpdateExecutable { path: String, checksum: String },
    Delete { path: String },
    Version(String),
}

/// Extract the directives from a manifest body, in the order they appear.
pub fn parse_manifest(body: &str) -> Vec<Directive> {
    let mut found: Vec<(usize, Directive)> = Vec::new();

    for caps in FILE_RE.captures_iter(body) {
        let start = caps.get(0).unwrap().start();
        let path = caps[2].to_string();
        let checksum = caps[3].to_string();
        let directive = match &caps[1] {
            "Add" => Directive::Add { path, checksum },
            "AddExecutable" => Directive::AddExecutable { path, checksum },
            "Update" => Directive::Update { path, checksum },
            _ => Directive::UpdateExecutable { path, checksum },
        };
        found.push((start, directive));
    }

    for caps in DELETE_RE.captures_iter(body) {
        found.push((
            caps.get(0).unwrap().start(),
            Directive::Delete {
                path: caps[1].to_string(),
            },
        ));
    }

    for caps in VERSION_RE.captures_iter(body) {
        found.push((
            caps.get(0).unwrap().start(),
            Directive::Version(caps[1].to_string()),
        ));
    }

    found.sort_by_key(|(start, _)| *start);
    found.into_iter().map(|(_, d)| d).collect()
}

/// Compile directives into the ordered command script.
///
/// Returns the target version and the script. Fails only when the manifest
/// carries no `Version` directive; `Delete` directives are accepted but
/// compile to nothing (deletions are left to the post-update script).
pub fn compile(directives: &[Directive], config: &Config) -> Result<(String, CommandScript)> {
    let version = directives
        .iter()
        .find_map(|d| match d {
            Directive::Version(v) => Some(v.clone()),
            _ => None,
        })
        .ok_or(Error::MissingVersion)?;

    let staging = &config.update.staging_dir;

    // (path, checksum) pairs to download and verify.
    let mut get_files: Vec<(String, String)> = Vec::new();
    // New files copied from staging into the live tree.
    let mut copy_files: Vec<String> = Vec::new();
    // Staged paths whose execute bit must be set.
    let mut set_exec: Vec<String> = Vec::new();
    // Self-replacing pairs for in-use files outside the live tree; the
    // agent's own binary is kept separate so it always goes last.
    let mut pairs: Vec<Command> = Vec::new();
    let mut own_pairs: Vec<Command> = Vec::new();

    for directive in directives {
        match directive {
            Directive::Add { path, checksum } | Directive::AddExecutable { path, checksum } => {
                get_files.push((path.clone(), checksum.clone()));
                copy_files.push(path.clone());
                if matches!(directive, Directive::AddExecutable { .. }) {
                    set_exec.push(path.clone());
                }
            }
            Directive::Update { path, checksum }
            | Directive::UpdateExecutable { path, checksum } => {
                get_files.push((path.clone(), checksum.clone()));
                if matches!(directive, Directive::UpdateExecutable { .. }) {
                    set_exec.push(path.clone());
                }

                let p = Path::new(path);
                let first = p
                    .components()
                    .next()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned());
                if first.as_deref() != Some(config.update.app_dir.as_str()) {
                    // A file outside the application tree is in use by a
                    // running process and cannot be overwritten in place.
                    let pair = [
                        Command::Rename {
                            src: path.clone(),
                            dst: format!("{}.old", path),
                        },
                        Command::Copy {
                            src: staging.join(path).display().to_string(),
                            dst: path.clone(),
                        },
                    ];
                    let is_own_binary = p
                        .file_name()
                        .map(|n| n.to_string_lossy() == config.info.module_name)
                        .unwrap_or(false);
                    if is_own_binary {
                        own_pairs.extend(pair);
                    } else {
                        pairs.extend(pair);
                    }
                }
            }
            Directive::Delete { .. } | Directive::Version(_) => {}
        }
    }

    let mut script = CommandScript::new();
    script.push(Command::Version(version.clone()));

    for (path, _) in &get_files {
        script.push(Command::Get(path.clone()));
    }
    for (path, checksum) in &get_files {
        script.push(Command::Check {
            path: path.clone(),
            checksum: checksum.clone(),
        });
    }
    for path in &set_exec {
        script.push(Command::SetExec(staging.join(path).display().to_string()));
    }

    script.push(Command::ShutdownMain);
    script.push(Command::SetExec(config.update.pre_update_script.clone()));
    script.push(Command::SetExec(config.update.post_update_script.clone()));
    script.push(Command::Exec(format!("./{}", config.update.pre_update_script)));

    for path in &copy_files {
        script.push(Command::Copy {
            src: staging.join(path).display().to_string(),
            dst: Path::new(".").join(path).display().to_string(),
        });
    }

    let have_pairs = !pairs.is_empty() || !own_pairs.is_empty();
    for cmd in pairs.into_iter().chain(own_pairs) {
        script.push(cmd);
    }
    if have_pairs {
        script.push(Command::Restart);
    }

    script.push(Command::Exec(format!(
        "./{}",
        config.update.post_update_script
    )));
    script.push(Command::End);

    Ok((version, script))
}
