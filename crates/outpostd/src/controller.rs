//! Controller actor: recovery, polling cadence, script execution and
//! lifecycle transitions.
//!
//! State hierarchy:
//!
//! ```text
//! Active
//! ├── Recovery
//! ├── Update
//! │   ├── CheckForUpdate
//! │   └── ExecuteUpdateCommands
//! └── RemoteControl
//! ```
//!
//! `Update` is the grouping that owns the shared exit action: leaving it
//! (for any reason) re-arms the poll timer and removes the persisted
//! script and log, closing the cycle. A `restart` command exits the
//! process without leaving `Update`, which is exactly what keeps the files
//! around for the next boot's recovery.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tracing::{debug, error, info, warn};

use outpost_core::{manifest, script, Command, CommandLog, CommandScript, Config};

use crate::events::{ControllerEvent, DownloaderEvent};
use crate::runtime::{Hsm, Mailbox, Outcome, Timer};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ControllerState {
    Active,
    Recovery,
    Update,
    CheckForUpdate,
    ExecuteUpdateCommands,
    RemoteControl,
}

pub struct Controller {
    config: Arc<Config>,
    mailbox: Mailbox<ControllerEvent>,
    downloader: Mailbox<DownloaderEvent>,
    poll_timer: Timer<ControllerEvent>,
    /// Remaining commands of the in-flight cycle; head is next to run.
    script: CommandScript,
    /// Target version of the in-flight cycle.
    new_version: String,
}

impl Controller {
    pub fn new(
        config: Arc<Config>,
        mailbox: Mailbox<ControllerEvent>,
        downloader: Mailbox<DownloaderEvent>,
    ) -> Self {
        let poll_timer = Timer::new(mailbox.clone());
        Self {
            config,
            mailbox,
            downloader,
            poll_timer,
            script: CommandScript::new(),
            new_version: String::new(),
        }
    }

    fn arm_poll_timer(&mut self) {
        self.poll_timer.arm_periodic(
            Duration::from_secs(self.config.update.interval_secs),
            ControllerEvent::CheckForUpdate,
        );
    }

    /// Load the persisted script and completion log, drop everything the
    /// log proves finished and re-establish the in-flight version.
    fn resume_interrupted(&mut self) -> outpost_core::Result<()> {
        let full = CommandScript::load(&self.config.update.command_file)?;
        let log = CommandLog::load(&self.config.update.command_log)?;

        let version = match full.head() {
            Some(Command::Version(v)) => v.clone(),
            _ => {
                return Err(outpost_core::Error::MalformedScript(
                    "version missing from persisted script".to_string(),
                ))
            }
        };

        info!(
            "resuming update to {}: {} of {} commands already completed",
            version,
            log.len(),
            full.len()
        );
        self.new_version = version;
        self.script = script::resume(full, log.len());
        Ok(())
    }

    /// Compile an accepted manifest and persist the script. From this
    /// moment the cycle survives a crash.
    fn accept_manifest(&mut self, procedures: &str) -> outpost_core::Result<()> {
        let directives = manifest::parse_manifest(procedures);
        let (version, script) = manifest::compile(&directives, &self.config)?;
        script.save(&self.config.update.command_file)?;
        self.new_version = version;
        self.script = script;
        Ok(())
    }

    /// The head command completed: journal it, advance, dispatch the next.
    /// The log line is written only now, never before the side effect is
    /// done, so a crash replays a command at most once.
    fn complete_head(&mut self) {
        if let Some(done) = self.script.head() {
            if let Err(e) = CommandLog::append(&self.config.update.command_log, done) {
                warn!("could not journal completed command: {}", e);
            }
        }
        self.script.pop_head();
        if let Some(next) = self.script.head() {
            self.mailbox.post(ControllerEvent::ExecuteCommand(next.clone()));
        }
    }

    /// Dispatch one command. Quick actions complete inline; anything that
    /// blocks goes to a worker that posts exactly one completion event.
    fn execute_command(&mut self, cmd: &Command) {
        info!("{}", cmd);
        match cmd {
            Command::Version(_) => self.mailbox.post(ControllerEvent::CommandExecuted),
            Command::Get(path) => self.downloader.post(DownloaderEvent::FetchFile {
                filename: path.clone(),
                version: self.new_version.clone(),
            }),
            Command::Check { path, checksum } => {
                self.spawn_checksum(path.clone(), checksum.clone())
            }
            Command::SetExec(path) => self.set_exec(Path::new(path)),
            Command::ShutdownMain => self.spawn_shutdown_main(),
            Command::Exec(program) => self.spawn_exec(program.clone()),
            Command::Copy { src, dst } => self.spawn_copy(src.into(), dst.into()),
            Command::Rename { src, dst } => self.rename(src, dst),
            Command::Restart => {
                info!("restart requested; exiting for the supervisor to relaunch");
                std::process::exit(0);
            }
            Command::End => self.mailbox.post(ControllerEvent::UpdateSucceeded),
            Command::Unknown(raw) => {
                warn!("unrecognized command line: {}", raw);
                self.mailbox.post(ControllerEvent::CommandFailed);
            }
        }
    }

    /// Integrity gate: the staged file must hash to the manifest checksum.
    fn spawn_checksum(&self, path: String, expected: String) {
        let staged = self.config.update.staging_dir.join(&path);
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            let result = tokio::task::spawn_blocking(move || sha256_file(&staged)).await;
            match result {
                Ok(Ok(actual)) if actual.eq_ignore_ascii_case(&expected) => {
                    mailbox.post(ControllerEvent::CommandExecuted)
                }
                Ok(Ok(actual)) => {
                    warn!(
                        "checksum mismatch for {}: expected {}, got {}",
                        path, expected, actual
                    );
                    mailbox.post(ControllerEvent::CommandFailed);
                }
                Ok(Err(e)) => {
                    warn!("could not hash {}: {}", path, e);
                    mailbox.post(ControllerEvent::CommandFailed);
                }
                Err(e) => {
                    warn!("checksum worker did not finish: {}", e);
                    mailbox.post(ControllerEvent::CommandFailed);
                }
            }
        });
    }

    /// Set the owner execute bit; already-executable files succeed without
    /// being touched.
    fn set_exec(&self, path: &Path) {
        let outcome = std::fs::metadata(path).and_then(|meta| {
            let mut perms = meta.permissions();
            if perms.mode() & 0o100 != 0 {
                return Ok(());
            }
            perms.set_mode(perms.mode() | 0o100);
            std::fs::set_permissions(path, perms)
        });
        match outcome {
            Ok(()) => self.mailbox.post(ControllerEvent::CommandExecuted),
            Err(e) => {
                warn!("set_exec {}: {}", path.display(), e);
                self.mailbox.post(ControllerEvent::CommandFailed);
            }
        }
    }

    fn spawn_shutdown_main(&self) {
        let port = self.config.app.control_port;
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            match shutdown_main(port).await {
                Ok(()) => mailbox.post(ControllerEvent::CommandExecuted),
                Err(e) => {
                    warn!("main application shutdown failed: {:#}", e);
                    mailbox.post(ControllerEvent::CommandFailed);
                }
            }
        });
    }

    fn spawn_exec(&self, program: String) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            match tokio::process::Command::new(&program).status().await {
                Ok(status) => {
                    // Running to completion is what the command promises;
                    // the script's own exit code is its own business.
                    if !status.success() {
                        warn!("{} exited with {}", program, status);
                    }
                    mailbox.post(ControllerEvent::CommandExecuted);
                }
                Err(e) => {
                    warn!("could not run {}: {}", program, e);
                    mailbox.post(ControllerEvent::CommandFailed);
                }
            }
        });
    }

    fn spawn_copy(&self, src: PathBuf, dst: PathBuf) {
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            if let Some(parent) = dst.parent() {
                if !parent.as_os_str().is_empty() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
            }
            match tokio::fs::copy(&src, &dst).await {
                Ok(_) => mailbox.post(ControllerEvent::CommandExecuted),
                Err(e) => {
                    warn!(
                        "copy {} -> {} failed: {}",
                        src.display(),
                        dst.display(),
                        e
                    );
                    mailbox.post(ControllerEvent::CommandFailed);
                }
            }
        });
    }

    fn rename(&self, src: &str, dst: &str) {
        match std::fs::rename(src, dst) {
            Ok(()) => self.mailbox.post(ControllerEvent::CommandExecuted),
            Err(e) => {
                warn!("rename {} -> {} failed: {}", src, dst, e);
                self.mailbox.post(ControllerEvent::CommandFailed);
            }
        }
    }
}

/// Ask the main application to stop over its local control socket. Any
/// reply other than `done` - and any connection failure - is a failure;
/// the files it holds open cannot safely be replaced.
pub async fn shutdown_main(port: u16) -> anyhow::Result<()> {
    let stream = TcpStream::connect(("localhost", port))
        .await
        .context("control socket connect")?;
    let mut stream = BufReader::new(stream);

    stream.write_all(b"shutdown\n").await?;
    info!("sent shutdown request to main application");

    let mut reply = String::new();
    stream.read_line(&mut reply).await?;
    if reply.trim_end().starts_with("done") {
        Ok(())
    } else {
        bail!("unexpected control reply: {:?}", reply.trim_end());
    }
}

fn sha256_file(path: &Path) -> std::io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

impl Hsm for Controller {
    type Event = ControllerEvent;
    type State = ControllerState;

    fn initial(&self) -> ControllerState {
        ControllerState::Active
    }

    fn parent(&self, state: ControllerState) -> Option<ControllerState> {
        match state {
            ControllerState::Active => None,
            ControllerState::Recovery
            | ControllerState::Update
            | ControllerState::RemoteControl => Some(ControllerState::Active),
            ControllerState::CheckForUpdate | ControllerState::ExecuteUpdateCommands => {
                Some(ControllerState::Update)
            }
        }
    }

    fn entry(&mut self, state: ControllerState) {
        match state {
            ControllerState::Active => {
                info!("controller started");
                self.mailbox.post(ControllerEvent::PoweredOn);
            }
            ControllerState::Recovery => {
                info!("recovery started");
                // The mere existence of the script file is the
                // interruption signal: a cycle that completed deleted it.
                if self.config.update.command_file.exists() {
                    info!("persisted command script found; update was interrupted");
                    self.mailbox.post(ControllerEvent::UpdateInterrupted);
                } else {
                    self.mailbox.post(ControllerEvent::CheckForUpdate);
                }
            }
            ControllerState::Update => {
                // No polling while a cycle is in flight.
                self.poll_timer.disarm();
            }
            ControllerState::CheckForUpdate => {
                info!("checking for update...");
                self.downloader.post(DownloaderEvent::FetchManifest);
            }
            ControllerState::ExecuteUpdateCommands => {
                info!("executing update commands ({} remaining)", self.script.len());
                match self.script.head() {
                    Some(head) => self
                        .mailbox
                        .post(ControllerEvent::ExecuteCommand(head.clone())),
                    None => {
                        // Possible only with a tampered script/log pair;
                        // nothing is left to do, so close the cycle.
                        warn!("resumed script has no commands left");
                        self.mailbox.post(ControllerEvent::UpdateSucceeded);
                    }
                }
            }
            ControllerState::RemoteControl => {
                info!("remote control engaged");
            }
        }
    }

    fn exit(&mut self, state: ControllerState) {
        match state {
            ControllerState::CheckForUpdate => self.arm_poll_timer(),
            ControllerState::Update => {
                self.arm_poll_timer();
                script::clear(
                    &self.config.update.command_file,
                    &self.config.update.command_log,
                );
                self.script = CommandScript::new();
            }
            _ => {}
        }
    }

    fn handle(&mut self, state: ControllerState, event: &ControllerEvent) -> Outcome<ControllerState> {
        match state {
            ControllerState::Active => match event {
                ControllerEvent::PoweredOn => Outcome::Transition(ControllerState::Recovery),
                ControllerEvent::CheckForUpdate => {
                    Outcome::Transition(ControllerState::CheckForUpdate)
                }
                ControllerEvent::RemoteControl => {
                    Outcome::Transition(ControllerState::RemoteControl)
                }
                _ => Outcome::Parent,
            },

            ControllerState::Recovery => match event {
                ControllerEvent::UpdateInterrupted => match self.resume_interrupted() {
                    Ok(()) => Outcome::Transition(ControllerState::ExecuteUpdateCommands),
                    Err(e) => {
                        error!("cannot resume interrupted update: {}", e);
                        script::clear(
                            &self.config.update.command_file,
                            &self.config.update.command_log,
                        );
                        Outcome::Transition(ControllerState::CheckForUpdate)
                    }
                },
                _ => Outcome::Parent,
            },

            // Pure grouping state; behavior lives in entry/exit.
            ControllerState::Update => Outcome::Parent,

            ControllerState::CheckForUpdate => match event {
                ControllerEvent::ManifestUnavailable => {
                    info!("no manifest available");
                    Outcome::Transition(ControllerState::Active)
                }
                ControllerEvent::ManifestAvailable {
                    procedures,
                    new_version,
                } => {
                    if procedures.trim().is_empty() {
                        info!("package is up to date");
                        return Outcome::Transition(ControllerState::Active);
                    }
                    info!("manifest offers version {}", new_version);
                    match self.accept_manifest(procedures) {
                        Ok(()) => {
                            info!(
                                "update to {} accepted ({} commands)",
                                self.new_version,
                                self.script.len()
                            );
                            Outcome::Transition(ControllerState::ExecuteUpdateCommands)
                        }
                        Err(e) => {
                            warn!("rejecting manifest: {}", e);
                            Outcome::Transition(ControllerState::Active)
                        }
                    }
                }
                _ => Outcome::Parent,
            },

            ControllerState::ExecuteUpdateCommands => match event {
                ControllerEvent::ExecuteCommand(cmd) => {
                    let cmd = cmd.clone();
                    self.execute_command(&cmd);
                    Outcome::Handled
                }
                ControllerEvent::CommandExecuted => {
                    self.complete_head();
                    Outcome::Handled
                }
                ControllerEvent::CommandFailed => {
                    error!(
                        "update command failed; aborting cycle (will retry from a fresh manifest on the next poll)"
                    );
                    Outcome::Transition(ControllerState::Active)
                }
                ControllerEvent::FileFetched { filename } => {
                    match self.script.head() {
                        Some(Command::Get(path)) if path == filename => {
                            self.mailbox.post(ControllerEvent::CommandExecuted);
                        }
                        _ => debug!("stale file completion for {} ignored", filename),
                    }
                    Outcome::Handled
                }
                ControllerEvent::FileFetchFailed => {
                    error!("file fetch failed; aborting cycle");
                    Outcome::Transition(ControllerState::Active)
                }
                ControllerEvent::UpdateSucceeded => {
                    info!("updated to version {}", self.new_version);
                    Outcome::Transition(ControllerState::Active)
                }
                ControllerEvent::CheckForUpdate => {
                    debug!("poll tick ignored while executing update");
                    Outcome::Handled
                }
                _ => Outcome::Parent,
            },

            ControllerState::RemoteControl => Outcome::Parent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{self, dispatch};
    use outpost_core::config::Config;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    struct Fixture {
        controller: Controller,
        ctl_rx: UnboundedReceiver<ControllerEvent>,
        dl_rx: UnboundedReceiver<DownloaderEvent>,
        dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let mut config = Config::default();
        config.update.command_file = dir.path().join("update.cmd");
        config.update.command_log = dir.path().join("update.cmd.log");
        config.update.staging_dir = dir.path().join("temp-download");
        config.info.module_name = "outpostd".to_string();

        let (ctl_tx, ctl_rx) = runtime::mailbox();
        let (dl_tx, dl_rx) = runtime::mailbox();
        let controller = Controller::new(Arc::new(config), ctl_tx, dl_tx);
        Fixture {
            controller,
            ctl_rx,
            dl_rx,
            dir,
        }
    }

    fn crash_scenario_script() -> CommandScript {
        CommandScript::from_commands(vec![
            Command::Version("2.0".to_string()),
            Command::Get("bin/tool".to_string()),
            Command::Check {
                path: "bin/tool".to_string(),
                checksum: "abc123".to_string(),
            },
            Command::ShutdownMain,
            Command::Copy {
                src: "temp-download/bin/tool".to_string(),
                dst: "./bin/tool".to_string(),
            },
            Command::End,
        ])
    }

    async fn next_ctl(rx: &mut UnboundedReceiver<ControllerEvent>) -> ControllerEvent {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for controller event")
            .expect("controller queue closed")
    }

    #[tokio::test]
    async fn test_recovery_without_script_checks_for_update() {
        let mut f = fixture();
        f.controller.entry(ControllerState::Recovery);
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CheckForUpdate
        ));
    }

    /// Crash scenario: script persisted, first three commands logged; a
    /// fresh boot resumes directly at `shutdown_main`.
    #[tokio::test]
    async fn test_recovery_resumes_at_logged_offset() {
        let mut f = fixture();
        let script = crash_scenario_script();
        script.save(&f.controller.config.update.command_file).unwrap();
        for cmd in script.iter().take(3) {
            CommandLog::append(&f.controller.config.update.command_log, cmd).unwrap();
        }

        f.controller.entry(ControllerState::Recovery);
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::UpdateInterrupted
        ));

        let state = dispatch(
            &mut f.controller,
            ControllerState::Recovery,
            &ControllerEvent::UpdateInterrupted,
        );
        assert_eq!(state, ControllerState::ExecuteUpdateCommands);
        assert_eq!(f.controller.new_version, "2.0");
        assert_eq!(f.controller.script.head(), Some(&Command::ShutdownMain));

        // Entry dispatched the resumed head.
        match next_ctl(&mut f.ctl_rx).await {
            ControllerEvent::ExecuteCommand(cmd) => assert_eq!(cmd, Command::ShutdownMain),
            other => panic!("expected ExecuteCommand, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recovery_with_garbage_script_falls_back_to_polling() {
        let mut f = fixture();
        std::fs::write(
            &f.controller.config.update.command_file,
            "not a script at all\n",
        )
        .unwrap();

        let state = dispatch(
            &mut f.controller,
            ControllerState::Recovery,
            &ControllerEvent::UpdateInterrupted,
        );
        assert_eq!(state, ControllerState::CheckForUpdate);
        // The unusable files were discarded.
        assert!(!f.controller.config.update.command_file.exists());
    }

    #[tokio::test]
    async fn test_accepted_manifest_persists_script_and_starts_execution() {
        let mut f = fixture();
        let event = ControllerEvent::ManifestAvailable {
            procedures: "Version \"2.0\"\nAdd \"bin/tool\" abc123\n".to_string(),
            new_version: "2.0".to_string(),
        };

        let state = dispatch(&mut f.controller, ControllerState::CheckForUpdate, &event);
        assert_eq!(state, ControllerState::ExecuteUpdateCommands);
        assert!(f.controller.config.update.command_file.exists());

        let persisted =
            CommandScript::load(&f.controller.config.update.command_file).unwrap();
        assert_eq!(persisted.head(), Some(&Command::Version("2.0".to_string())));

        match next_ctl(&mut f.ctl_rx).await {
            ControllerEvent::ExecuteCommand(cmd) => {
                assert_eq!(cmd, Command::Version("2.0".to_string()))
            }
            other => panic!("expected ExecuteCommand, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_procedures_means_up_to_date() {
        let mut f = fixture();
        let event = ControllerEvent::ManifestAvailable {
            procedures: "  ".to_string(),
            new_version: "2.0".to_string(),
        };

        let state = dispatch(&mut f.controller, ControllerState::CheckForUpdate, &event);
        assert_eq!(state, ControllerState::Active);
        assert!(!f.controller.config.update.command_file.exists());
    }

    #[tokio::test]
    async fn test_manifest_without_version_is_rejected() {
        let mut f = fixture();
        let event = ControllerEvent::ManifestAvailable {
            procedures: "Add \"bin/tool\" abc123\n".to_string(),
            new_version: "".to_string(),
        };

        let state = dispatch(&mut f.controller, ControllerState::CheckForUpdate, &event);
        assert_eq!(state, ControllerState::Active);
    }

    #[tokio::test]
    async fn test_command_executed_journals_then_dispatches_next() {
        let mut f = fixture();
        f.controller.script = CommandScript::from_commands(vec![
            Command::Version("2.0".to_string()),
            Command::End,
        ]);

        let state = dispatch(
            &mut f.controller,
            ControllerState::ExecuteUpdateCommands,
            &ControllerEvent::CommandExecuted,
        );
        assert_eq!(state, ControllerState::ExecuteUpdateCommands);

        let log = CommandLog::load(&f.controller.config.update.command_log).unwrap();
        assert_eq!(log, vec![Command::Version("2.0".to_string())]);

        match next_ctl(&mut f.ctl_rx).await {
            ControllerEvent::ExecuteCommand(cmd) => assert_eq!(cmd, Command::End),
            other => panic!("expected ExecuteCommand, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_command_failed_aborts_cycle_and_cleans_up() {
        let mut f = fixture();
        f.controller.script = crash_scenario_script();
        f.controller
            .script
            .save(&f.controller.config.update.command_file)
            .unwrap();

        let state = dispatch(
            &mut f.controller,
            ControllerState::ExecuteUpdateCommands,
            &ControllerEvent::CommandFailed,
        );
        assert_eq!(state, ControllerState::Active);
        assert!(!f.controller.config.update.command_file.exists());
        assert!(f.controller.script.is_empty());
    }

    #[tokio::test]
    async fn test_update_succeeded_closes_cycle() {
        let mut f = fixture();
        f.controller.new_version = "2.0".to_string();
        f.controller
            .script
            .save(&f.controller.config.update.command_file)
            .unwrap();
        CommandLog::append(
            &f.controller.config.update.command_log,
            &Command::Version("2.0".to_string()),
        )
        .unwrap();

        let state = dispatch(
            &mut f.controller,
            ControllerState::ExecuteUpdateCommands,
            &ControllerEvent::UpdateSucceeded,
        );
        assert_eq!(state, ControllerState::Active);
        assert!(!f.controller.config.update.command_file.exists());
        assert!(!f.controller.config.update.command_log.exists());
    }

    #[tokio::test]
    async fn test_file_fetched_matches_head_get_by_filename() {
        let mut f = fixture();
        f.controller.script = CommandScript::from_commands(vec![
            Command::Get("bin/tool".to_string()),
            Command::End,
        ]);

        dispatch(
            &mut f.controller,
            ControllerState::ExecuteUpdateCommands,
            &ControllerEvent::FileFetched {
                filename: "bin/other".to_string(),
            },
        );
        assert!(
            f.ctl_rx.try_recv().is_err(),
            "mismatched filename must not complete the command"
        );

        dispatch(
            &mut f.controller,
            ControllerState::ExecuteUpdateCommands,
            &ControllerEvent::FileFetched {
                filename: "bin/tool".to_string(),
            },
        );
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CommandExecuted
        ));
    }

    #[tokio::test]
    async fn test_get_command_delegates_to_downloader() {
        let mut f = fixture();
        f.controller.new_version = "2.0".to_string();
        f.controller
            .execute_command(&Command::Get("bin/tool".to_string()));

        match f.dl_rx.try_recv().unwrap() {
            DownloaderEvent::FetchFile { filename, version } => {
                assert_eq!(filename, "bin/tool");
                assert_eq!(version, "2.0");
            }
            other => panic!("expected FetchFile, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_checksum_gate_passes_and_fails() {
        let mut f = fixture();
        let staging = f.controller.config.update.staging_dir.clone();
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("blob"), b"payload").unwrap();
        let good = sha256_file(&staging.join("blob")).unwrap();

        f.controller.execute_command(&Command::Check {
            path: "blob".to_string(),
            checksum: good,
        });
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CommandExecuted
        ));

        f.controller.execute_command(&Command::Check {
            path: "blob".to_string(),
            checksum: "0000".to_string(),
        });
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CommandFailed
        ));
    }

    #[tokio::test]
    async fn test_set_exec_sets_bit_and_is_idempotent() {
        let mut f = fixture();
        let target = f.dir.path().join("run.sh");
        std::fs::write(&target, "#!/bin/sh\n").unwrap();

        let cmd = Command::SetExec(target.display().to_string());
        f.controller.execute_command(&cmd);
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CommandExecuted
        ));
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_ne!(mode & 0o100, 0);

        // Second run finds the bit already set.
        f.controller.execute_command(&cmd);
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CommandExecuted
        ));
    }

    #[tokio::test]
    async fn test_set_exec_on_missing_file_fails() {
        let mut f = fixture();
        f.controller
            .execute_command(&Command::SetExec("no/such/file".to_string()));
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CommandFailed
        ));
    }

    #[tokio::test]
    async fn test_copy_overwrites_destination() {
        let mut f = fixture();
        let src = f.dir.path().join("new.bin");
        let dst = f.dir.path().join("live").join("old.bin");
        std::fs::write(&src, b"v2").unwrap();
        std::fs::create_dir_all(dst.parent().unwrap()).unwrap();
        std::fs::write(&dst, b"v1").unwrap();

        f.controller.execute_command(&Command::Copy {
            src: src.display().to_string(),
            dst: dst.display().to_string(),
        });
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CommandExecuted
        ));
        assert_eq!(std::fs::read(&dst).unwrap(), b"v2");
    }

    #[tokio::test]
    async fn test_rename_failure_reports_failed() {
        let mut f = fixture();
        f.controller.execute_command(&Command::Rename {
            src: f.dir.path().join("absent").display().to_string(),
            dst: f.dir.path().join("absent.old").display().to_string(),
        });
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CommandFailed
        ));
    }

    #[tokio::test]
    async fn test_unknown_command_fails() {
        let mut f = fixture();
        f.controller
            .execute_command(&Command::Unknown("frobnicate".to_string()));
        assert!(matches!(
            next_ctl(&mut f.ctl_rx).await,
            ControllerEvent::CommandFailed
        ));
    }

    #[tokio::test]
    async fn test_shutdown_main_accepts_done_reply() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            assert_eq!(line, "shutdown\n");
            stream.write_all(b"done\n").await.unwrap();
        });

        shutdown_main(port).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_main_rejects_other_replies_and_dead_socket() {
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream = BufReader::new(stream);
            let mut line = String::new();
            stream.read_line(&mut line).await.unwrap();
            stream.write_all(b"busy\n").await.unwrap();
        });
        assert!(shutdown_main(port).await.is_err());

        // Nothing listening: connection failure is a failure, not success.
        let unused = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = unused.local_addr().unwrap().port();
        drop(unused);
        assert!(shutdown_main(dead_port).await.is_err());
    }
}
