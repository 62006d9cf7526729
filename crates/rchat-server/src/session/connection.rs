//! One client connection, from admission to close.
//!
//! ```text
//! Connecting ──admitted──▶ KeyExchange ──key sent──▶ Authenticating
//!     │                                                   │
//!     │ refused / gone                       AUTH_SUCCESS │
//!     ▼                                                   ▼
//!   Closed ◀──────── EOF / QUIT / close signal ──────── Active
//! ```
//!
//! Reads happen on the session task. Writes go through a bounded queue to a
//! dedicated writer task, which is also how other sessions deliver
//! broadcasts to this one.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rchat_core::messages::{server_notice, FILE_ERROR};
use rchat_core::{
    drain_lines, ChatError, ChatResult, Cipher, ControlLine, DirectoryStore, FileFrame, Inbound,
    LineReader, Reassembler, TransferObserver,
};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::registry::{SessionHandle, SessionRegistry};
use crate::admission::{AdmissionGate, Permit, Refusal};
use crate::auth::CredentialStore;
use crate::handshake::{self, AuthOutcome};

pub const WAITING_NOTICE: &str =
    "Server is currently full. You are in a waiting queue. Please wait...";
pub const PROMOTED_NOTICE: &str = "You've been granted access to the server.";
pub const QUEUE_FULL_NOTICE: &str =
    "Server is full and the waiting queue is too long. Try again later.";
pub const SHUTDOWN_NOTICE: &str = "Server is shutting down.";

/// Services shared by every session.
pub struct SessionContext {
    pub gate: AdmissionGate,
    pub registry: Arc<SessionRegistry>,
    pub cipher: Arc<Cipher>,
    pub credentials: Arc<dyn CredentialStore>,
    /// Completed uploads land in `<download_dir>/<username>/`.
    pub download_dir: PathBuf,
    pub max_queue: Option<usize>,
    pub promote_delay: Duration,
    pub outbound_queue: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    KeyExchange,
    Authenticating,
    Active,
    Closed,
}

pub struct Session<R> {
    addr: SocketAddr,
    state: SessionState,
    username: Option<String>,
    reader: LineReader<R>,
    outbound: mpsc::Sender<String>,
    closer: Arc<watch::Sender<bool>>,
    closed: watch::Receiver<bool>,
    permit: Option<Permit>,
    was_queued: bool,
    registered: bool,
    ctx: Arc<SessionContext>,
}

impl<R: AsyncRead + Unpin + Send + 'static> Session<R> {
    /// Set up a session over a connection's two halves and start its writer.
    pub fn new<W>(addr: SocketAddr, reader: R, writer: W, ctx: Arc<SessionContext>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(ctx.outbound_queue);
        let (closer, closed) = watch::channel(false);
        tokio::spawn(async move {
            if let Err(e) = drain_lines(writer, outbound_rx).await {
                debug!(remote = %addr, error = %e, "write failed, dropping outbound queue");
            }
        });

        Self {
            addr,
            state: SessionState::Connecting,
            username: None,
            reader: LineReader::new(reader),
            outbound,
            closer: Arc::new(closer),
            closed,
            permit: None,
            was_queued: false,
            registered: false,
            ctx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Drive the session to completion. Cleanup runs exactly once, however
    /// the session ends.
    pub async fn run(mut self) {
        if let Err(e) = self.drive().await {
            debug!(remote = %self.addr, error = %e, "session ended with error");
        }
        self.finish().await;
    }

    async fn drive(&mut self) -> ChatResult<()> {
        if !self.admit().await? {
            return Ok(());
        }
        if !self.register().await {
            return Ok(());
        }
        self.exchange_key().await?;
        let Some(username) = self.authenticate().await? else {
            return Ok(());
        };
        self.chat(username).await
    }

    fn set_state(&mut self, state: SessionState) {
        debug!(remote = %self.addr, from = ?self.state, to = ?state, "session state");
        self.state = state;
    }

    /// Wait at the admission gate. `false` means the connection was turned
    /// away or went away while queued.
    async fn admit(&mut self) -> ChatResult<bool> {
        let gate = self.ctx.gate.clone();
        let ticket = gate.request_with_limit(self.ctx.max_queue);
        match ticket.refusal() {
            Some(Refusal::QueueFull) => {
                info!(
                    remote = %self.addr,
                    queued = gate.queue_length(),
                    "admission queue full, refusing"
                );
                self.send(ControlLine::Full(QUEUE_FULL_NOTICE.into()).encode())
                    .await?;
                return Ok(false);
            }
            Some(Refusal::Closed) => {
                self.send(ControlLine::Full(SHUTDOWN_NOTICE.into()).encode())
                    .await?;
                return Ok(false);
            }
            None => {}
        }

        self.was_queued = ticket.is_queued();
        if self.was_queued {
            info!(
                remote = %self.addr,
                position = gate.queue_length(),
                "server full, connection queued"
            );
            self.send(ControlLine::Waiting(WAITING_NOTICE.into()).encode())
                .await?;
        }

        let granted = ticket.granted();
        tokio::pin!(granted);
        let result = loop {
            tokio::select! {
                result = &mut granted => break result,
                line = self.reader.next_line() => match line {
                    Ok(Some(_)) => debug!(remote = %self.addr, "ignoring input while queued"),
                    Ok(None) | Err(_) => {
                        info!(remote = %self.addr, "queued connection went away");
                        return Ok(false);
                    }
                },
            }
        };

        match result {
            Ok(permit) => self.permit = Some(permit),
            Err(e) => {
                debug!(remote = %self.addr, error = %e, "admission failed");
                self.send(ControlLine::Full(SHUTDOWN_NOTICE.into()).encode())
                    .await?;
                return Ok(false);
            }
        }

        info!(
            remote = %self.addr,
            active = gate.active_count(),
            queued = gate.queue_length(),
            capacity = gate.capacity(),
            "connection admitted"
        );
        Ok(true)
    }

    async fn register(&mut self) -> bool {
        let handle = SessionHandle::new(self.addr, self.outbound.clone(), self.closer.clone());
        self.registered = self.ctx.registry.register(handle).await;
        self.registered
    }

    async fn exchange_key(&mut self) -> ChatResult<()> {
        self.set_state(SessionState::KeyExchange);
        if self.was_queued {
            self.send(ControlLine::Connected(PROMOTED_NOTICE.into()).encode())
                .await?;
            tokio::time::sleep(self.ctx.promote_delay).await;
        }
        let key = self.ctx.cipher.key_string();
        self.send(key).await
    }

    /// Handle auth frames until one succeeds. `None` if the client left first.
    async fn authenticate(&mut self) -> ChatResult<Option<String>> {
        self.set_state(SessionState::Authenticating);
        loop {
            let Some(frame) = self.next_frame().await? else {
                return Ok(None);
            };
            if Inbound::classify(&frame) == Inbound::Quit {
                return Ok(None);
            }
            // registration rewrites the credential file
            let credentials = self.ctx.credentials.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                handshake::authenticate(&frame, credentials.as_ref())
            })
            .await
            .map_err(|e| ChatError::Other(format!("credential check failed: {e}")))?;
            if let Some(reply) = outcome.reply() {
                self.send_sealed(reply).await?;
            }
            if let AuthOutcome::Success { username } = outcome {
                return Ok(Some(username));
            }
        }
    }

    async fn chat(&mut self, username: String) -> ChatResult<()> {
        self.set_state(SessionState::Active);
        self.ctx.registry.activate(self.addr, &username).await;
        info!(remote = %self.addr, username = %username, "session active");

        let store = DirectoryStore::new(self.ctx.download_dir.join(&username));
        let mut reassembler = Reassembler::new(Arc::new(store));
        self.username = Some(username);

        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(());
            };
            let frame = match self.ctx.cipher.decrypt(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(remote = %self.addr, error = %e, "dropping undecryptable frame");
                    continue;
                }
            };

            match Inbound::classify(&frame) {
                Inbound::Quit => {
                    let name = self.username.clone().unwrap_or_default();
                    info!(remote = %self.addr, username = %name, "client quit");
                    self.send_sealed(&server_notice(&format!("Goodbye, {name}!")))
                        .await?;
                    return Ok(());
                }
                Inbound::File => {
                    self.receive_file_frame(&mut reassembler, &frame).await?;
                    self.ctx.registry.broadcast(&line, self.addr).await;
                }
                Inbound::Chat => {
                    self.ctx.registry.broadcast(&line, self.addr).await;
                }
            }
        }
    }

    /// Apply a file frame to this session's uploads and report failures back
    /// to the uploader as `FILE_ERROR`.
    async fn receive_file_frame(
        &mut self,
        reassembler: &mut Reassembler,
        frame: &str,
    ) -> ChatResult<()> {
        let mut report = UploadReport::new(self.addr, self.ctx.download_dir.as_path());
        if let Err(e) = reassembler.handle(frame, &mut report) {
            warn!(remote = %self.addr, error = %e, "bad file frame");
        }
        if frame.starts_with(FILE_ERROR) {
            return Ok(());
        }
        for message in report.errors {
            self.send_sealed(&FileFrame::Error { message }.encode())
                .await?;
        }
        Ok(())
    }

    /// Next decryptable frame; undecryptable lines are dropped.
    async fn next_frame(&mut self) -> ChatResult<Option<String>> {
        loop {
            let Some(line) = self.next_line().await? else {
                return Ok(None);
            };
            match self.ctx.cipher.decrypt(&line) {
                Ok(frame) => return Ok(Some(frame)),
                Err(e) => debug!(remote = %self.addr, error = %e, "dropping undecryptable frame"),
            }
        }
    }

    /// Next wire line, or `None` at end of stream or once the session is
    /// told to close.
    async fn next_line(&mut self) -> ChatResult<Option<String>> {
        if *self.closed.borrow() {
            return Ok(None);
        }
        tokio::select! {
            line = self.reader.next_line() => line,
            _ = self.closed.changed() => Ok(None),
        }
    }

    async fn send(&self, line: String) -> ChatResult<()> {
        self.outbound
            .send(line)
            .await
            .map_err(|_| ChatError::Transport("connection writer closed".into()))
    }

    async fn send_sealed(&self, frame: &str) -> ChatResult<()> {
        let line = self.ctx.cipher.encrypt(frame)?;
        self.send(line).await
    }

    async fn finish(&mut self) {
        self.set_state(SessionState::Closed);
        self.closer.send_replace(true);
        if self.registered {
            self.ctx.registry.deregister(self.addr).await;
            self.registered = false;
        }
        if let Some(permit) = self.permit.take() {
            permit.release();
            let gate = &self.ctx.gate;
            info!(
                remote = %self.addr,
                username = self.username.as_deref().unwrap_or("-"),
                active = gate.active_count(),
                queued = gate.queue_length(),
                "connection closed, slot released"
            );
        }
    }
}

/// Logs a session's upload progress and collects errors for the uploader.
struct UploadReport<'a> {
    addr: SocketAddr,
    download_dir: &'a Path,
    errors: Vec<String>,
}

impl<'a> UploadReport<'a> {
    fn new(addr: SocketAddr, download_dir: &'a Path) -> Self {
        Self {
            addr,
            download_dir,
            errors: Vec::new(),
        }
    }
}

impl TransferObserver for UploadReport<'_> {
    fn on_progress(&mut self, file_name: &str, percent: u8) {
        debug!(remote = %self.addr, file = %file_name, percent, "upload progress");
    }

    fn on_complete(&mut self, file_name: &str, path: &Path, data: &[u8]) {
        let shown = path.strip_prefix(self.download_dir).unwrap_or(path);
        info!(
            remote = %self.addr,
            file = %file_name,
            path = %shown.display(),
            size = data.len(),
            "upload stored"
        );
    }

    fn on_error(&mut self, file_name: &str, message: &str) {
        warn!(remote = %self.addr, file = %file_name, error = %message, "upload failed");
        self.errors.push(format!("{file_name}: {message}"));
    }
}
