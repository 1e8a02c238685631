//! Downloader actor: session login, manifest polling and file staging.
//!
//! Every request cycle logs in first; sessions are never cached across
//! cycles, so an expired token can only cost a single round. The actor is
//! request/response shaped: it receives one fetch request, runs the login
//! and transfer on worker tasks, posts one result event to the controller
//! and returns to idle.

use std::sync::Arc;

use anyhow::{bail, Context};
use regex::Regex;
use reqwest::header::{HeaderMap, CONTENT_TYPE, COOKIE, SET_COOKIE};
use reqwest::Client;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use outpost_core::Config;

use crate::events::{ControllerEvent, DownloaderEvent};
use crate::runtime::{Hsm, Mailbox, Outcome};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DownloaderState {
    Active,
    FetchManifest,
    FetchFile,
}

/// An authenticated server session: the cookie pair to replay verbatim on
/// subsequent requests.
#[derive(Debug, Clone)]
pub struct Session {
    cookie: String,
}

impl Session {
    pub fn cookie(&self) -> &str {
        &self.cookie
    }
}

pub struct Downloader {
    config: Arc<Config>,
    mailbox: Mailbox<DownloaderEvent>,
    controller: Mailbox<ControllerEvent>,
    client: Client,
    session_re: Regex,
    /// File request being serviced while the login round-trip runs.
    pending: Option<(String, String)>,
}

impl Downloader {
    pub fn new(
        config: Arc<Config>,
        mailbox: Mailbox<DownloaderEvent>,
        controller: Mailbox<ControllerEvent>,
    ) -> anyhow::Result<Self> {
        let session_re = Regex::new(&config.server.session_pattern)
            .context("invalid server.session_pattern")?;
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .context("building http client")?;
        Ok(Self {
            config,
            mailbox,
            controller,
            client,
            session_re,
            pending: None,
        })
    }

    /// Login round-trip on a worker; the outcome comes back into our own
    /// queue so the current state decides what it means.
    fn spawn_login(&self) {
        let client = self.client.clone();
        let config = self.config.clone();
        let session_re = self.session_re.clone();
        let mailbox = self.mailbox.clone();
        tokio::spawn(async move {
            match login(&client, &config, &session_re).await {
                Ok(session) => mailbox.post(DownloaderEvent::LoggedIn(session)),
                Err(e) => {
                    warn!("login failed: {:#}", e);
                    mailbox.post(DownloaderEvent::LoginFailed);
                }
            }
        });
    }

    fn spawn_fetch_manifest(&self, session: Session) {
        let client = self.client.clone();
        let config = self.config.clone();
        let controller = self.controller.clone();
        tokio::spawn(async move {
            match fetch_manifest(&client, &config, &session).await {
                Ok(reply) if reply.result == "ok" => {
                    controller.post(ControllerEvent::ManifestAvailable {
                        procedures: reply.procedures,
                        new_version: reply.new_version,
                    })
                }
                Ok(reply) => {
                    info!("server declined manifest request: {}", reply.result);
                    controller.post(ControllerEvent::ManifestUnavailable);
                }
                Err(e) => {
                    warn!("manifest fetch failed: {:#}", e);
                    controller.post(ControllerEvent::ManifestUnavailable);
                }
            }
        });
    }

    fn spawn_fetch_file(&mut self, session: Option<Session>) {
        let Some((filename, version)) = self.pending.take() else {
            warn!("file fetch triggered with no pending request");
            return;
        };
        let client = self.client.clone();
        let config = self.config.clone();
        let controller = self.controller.clone();
        tokio::spawn(async move {
            match fetch_file(&client, &config, session.as_ref(), &filename, &version).await {
                Ok(bytes) => {
                    info!("staged {} ({} bytes)", filename, bytes);
                    controller.post(ControllerEvent::FileFetched { filename });
                }
                Err(e) => {
                    warn!("fetch of {} failed: {:#}", filename, e);
                    controller.post(ControllerEvent::FileFetchFailed);
                }
            }
        });
    }
}

impl Hsm for Downloader {
    type Event = DownloaderEvent;
    type State = DownloaderState;

    fn initial(&self) -> DownloaderState {
        DownloaderState::Active
    }

    fn parent(&self, state: DownloaderState) -> Option<DownloaderState> {
        match state {
            DownloaderState::Active => None,
            DownloaderState::FetchManifest | DownloaderState::FetchFile => {
                Some(DownloaderState::Active)
            }
        }
    }

    fn entry(&mut self, state: DownloaderState) {
        match state {
            DownloaderState::Active => {}
            DownloaderState::FetchManifest | DownloaderState::FetchFile => self.spawn_login(),
        }
    }

    fn handle(&mut self, state: DownloaderState, event: &DownloaderEvent) -> Outcome<DownloaderState> {
        match state {
            DownloaderState::Active => match event {
                DownloaderEvent::FetchManifest => {
                    Outcome::Transition(DownloaderState::FetchManifest)
                }
                DownloaderEvent::FetchFile { filename, version } => {
                    self.pending = Some((filename.clone(), version.clone()));
                    Outcome::Transition(DownloaderState::FetchFile)
                }
                // Stray login results from an abandoned round.
                other => {
                    debug!("ignored while idle: {:?}", other);
                    Outcome::Handled
                }
            },

            DownloaderState::FetchManifest => match event {
                DownloaderEvent::LoggedIn(session) => {
                    self.spawn_fetch_manifest(session.clone());
                    Outcome::Transition(DownloaderState::Active)
                }
                DownloaderEvent::LoginFailed => {
                    // No session means no manifest; the controller treats
                    // this round as "nothing available".
                    self.controller.post(ControllerEvent::ManifestUnavailable);
                    Outcome::Transition(DownloaderState::Active)
                }
                _ => Outcome::Parent,
            },

            DownloaderState::FetchFile => match event {
                DownloaderEvent::LoggedIn(session) => {
                    self.spawn_fetch_file(Some(session.clone()));
                    Outcome::Transition(DownloaderState::Active)
                }
                DownloaderEvent::LoginFailed => {
                    // File downloads are attempted anyway; some deployments
                    // serve them unauthenticated.
                    warn!("proceeding with file fetch without a session");
                    self.spawn_fetch_file(None);
                    Outcome::Transition(DownloaderState::Active)
                }
                _ => Outcome::Parent,
            },
        }
    }
}

/// POST credentials to the login endpoint and lift the session token out of
/// the response cookies. A response without one is a failed login no matter
/// what the status line says.
pub async fn login(client: &Client, config: &Config, session_re: &Regex) -> anyhow::Result<Session> {
    let resp = client
        .post(&config.server.login_url)
        .form(&[
            ("username", config.server.username.as_str()),
            ("password", config.server.password.as_str()),
        ])
        .send()
        .await
        .context("login request")?;

    let status = resp.status();
    if !status.is_success() {
        bail!("login rejected: {}", status);
    }
    extract_session(session_re, resp.headers())
        .context("login response carries no session cookie")
}

fn extract_session(session_re: &Regex, headers: &HeaderMap) -> Option<Session> {
    for value in headers.get_all(SET_COOKIE) {
        let Ok(text) = value.to_str() else { continue };
        if let Some(m) = session_re.find(text) {
            return Some(Session {
                cookie: m.as_str().to_string(),
            });
        }
    }
    None
}

/// The manifest endpoint's JSON reply.
#[derive(Debug, Deserialize)]
pub struct ManifestReply {
    /// `"ok"` when the server has an answer for this node.
    pub result: String,

    /// Update directives, one per line; empty means up to date.
    #[serde(default)]
    pub procedures: String,

    #[serde(rename = "new-version", default)]
    pub new_version: String,
}

/// Ask the server whether an update is available for this node at its
/// currently installed version.
pub async fn fetch_manifest(
    client: &Client,
    config: &Config,
    session: &Session,
) -> anyhow::Result<ManifestReply> {
    let resp = client
        .post(&config.server.update_url)
        .header(COOKIE, session.cookie())
        .form(&[
            ("node-id", config.node.id.as_str()),
            ("node-os", config.node.os.as_str()),
            ("current-version", config.info.package_version.as_str()),
        ])
        .send()
        .await
        .context("manifest request")?;

    let status = resp.status();
    if !status.is_success() {
        bail!("manifest request rejected: {}", status);
    }
    resp.json::<ManifestReply>()
        .await
        .context("decoding manifest reply")
}

/// Stream one file of the target version into the staging directory,
/// preserving its manifest-relative path. Returns the number of bytes
/// written after they are durably on disk.
pub async fn fetch_file(
    client: &Client,
    config: &Config,
    session: Option<&Session>,
    filename: &str,
    version: &str,
) -> anyhow::Result<u64> {
    let mut request = client.post(&config.server.download_url).form(&[
        ("node-id", config.node.id.as_str()),
        ("node-os", config.node.os.as_str()),
        ("version", version),
        ("filename", filename),
    ]);
    if let Some(session) = session {
        request = request.header(COOKIE, session.cookie());
    }

    let mut resp = request.send().await.context("file request")?;
    let status = resp.status();
    if !status.is_success() {
        bail!("file request rejected: {}", status);
    }
    // The endpoint answers errors (unknown file, bad version) as JSON
    // bodies; only a binary body is a file.
    if let Some(content_type) = resp.headers().get(CONTENT_TYPE) {
        if content_type.to_str().unwrap_or("").starts_with("application/json") {
            bail!("server has no file {} for version {}", filename, version);
        }
    }
    let declared = resp.content_length();

    let dest = config.update.staging_dir.join(filename);
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let mut file = tokio::fs::File::create(&dest)
        .await
        .with_context(|| format!("creating {}", dest.display()))?;

    let mut written: u64 = 0;
    while let Some(chunk) = resp.chunk().await.context("reading file body")? {
        file.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    file.flush().await?;
    // The checksum gate runs right after this; the bytes must be on disk,
    // not in a page cache that a crash would lose along with the log.
    file.sync_all().await?;

    if let Some(declared) = declared {
        if written != declared {
            bail!(
                "truncated transfer of {}: got {} of {} bytes",
                filename,
                written,
                declared
            );
        }
    }
    debug!("wrote {} bytes to {}", written, dest.display());
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{self, dispatch};
    use reqwest::header::HeaderValue;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn fixture() -> (
        Downloader,
        UnboundedReceiver<DownloaderEvent>,
        UnboundedReceiver<ControllerEvent>,
    ) {
        let (dl_tx, dl_rx) = runtime::mailbox();
        let (ctl_tx, ctl_rx) = runtime::mailbox();
        let downloader =
            Downloader::new(Arc::new(Config::default()), dl_tx, ctl_tx).unwrap();
        (downloader, dl_rx, ctl_rx)
    }

    fn play_re() -> Regex {
        Regex::new("PLAY_SESSION=([^;]+)").unwrap()
    }

    #[test]
    fn test_extract_session_takes_full_cookie_pair() {
        let mut headers = HeaderMap::new();
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("PLAY_SESSION=abc123; Path=/; HTTPOnly"),
        );
        let session = extract_session(&play_re(), &headers).unwrap();
        assert_eq!(session.cookie(), "PLAY_SESSION=abc123");
    }

    #[test]
    fn test_extract_session_scans_all_cookies() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("theme=dark"));
        headers.append(
            SET_COOKIE,
            HeaderValue::from_static("PLAY_SESSION=tok; Path=/"),
        );
        let session = extract_session(&play_re(), &headers).unwrap();
        assert_eq!(session.cookie(), "PLAY_SESSION=tok");
    }

    #[test]
    fn test_extract_session_absent() {
        let mut headers = HeaderMap::new();
        headers.append(SET_COOKIE, HeaderValue::from_static("theme=dark"));
        assert!(extract_session(&play_re(), &headers).is_none());
    }

    #[test]
    fn test_invalid_session_pattern_is_a_construction_error() {
        let (dl_tx, _dl_rx) = runtime::mailbox();
        let (ctl_tx, _ctl_rx) = runtime::mailbox();
        let mut config = Config::default();
        config.server.session_pattern = "(".to_string();
        assert!(Downloader::new(Arc::new(config), dl_tx, ctl_tx).is_err());
    }

    #[test]
    fn test_manifest_reply_decodes_hyphenated_field() {
        let reply: ManifestReply = serde_json::from_str(
            r#"{"result":"ok","procedures":"Version \"2.0\"\n","new-version":"2.0"}"#,
        )
        .unwrap();
        assert_eq!(reply.result, "ok");
        assert_eq!(reply.new_version, "2.0");
    }

    #[test]
    fn test_manifest_reply_tolerates_missing_fields() {
        let reply: ManifestReply = serde_json::from_str(r#"{"result":"no-update"}"#).unwrap();
        assert_eq!(reply.result, "no-update");
        assert!(reply.procedures.is_empty());
        assert!(reply.new_version.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_file_request_stores_pending_and_logs_in() {
        let (mut dl, _dl_rx, _ctl_rx) = fixture();
        let state = dispatch(
            &mut dl,
            DownloaderState::Active,
            &DownloaderEvent::FetchFile {
                filename: "bin/tool".to_string(),
                version: "2.0".to_string(),
            },
        );
        assert_eq!(state, DownloaderState::FetchFile);
        assert_eq!(
            dl.pending,
            Some(("bin/tool".to_string(), "2.0".to_string()))
        );
    }

    #[tokio::test]
    async fn test_manifest_login_failure_reports_unavailable() {
        let (mut dl, _dl_rx, mut ctl_rx) = fixture();
        let state = dispatch(
            &mut dl,
            DownloaderState::FetchManifest,
            &DownloaderEvent::LoginFailed,
        );
        assert_eq!(state, DownloaderState::Active);
        assert!(matches!(
            ctl_rx.try_recv().unwrap(),
            ControllerEvent::ManifestUnavailable
        ));
    }

    #[tokio::test]
    async fn test_stray_login_result_while_idle_is_ignored() {
        let (mut dl, _dl_rx, mut ctl_rx) = fixture();
        let state = dispatch(
            &mut dl,
            DownloaderState::Active,
            &DownloaderEvent::LoginFailed,
        );
        assert_eq!(state, DownloaderState::Active);
        assert!(ctl_rx.try_recv().is_err());
    }
}
