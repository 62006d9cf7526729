//! The rchat client.
//!
//! `ChatClient` manages the connection lifecycle: admission (possibly after
//! waiting in the server's queue), key receipt, authentication, the
//! background receive loop and graceful quit. Everything the server sends
//! after authentication surfaces as [`ClientEvent`]s.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rchat_core::messages::{chat_line, server_notice, AUTH_FAILURE, AUTH_SUCCESS, QUIT};
use rchat_core::{
    drain_lines, AuthRequest, ChatError, ChatResult, Cipher, ControlLine, DirectoryStore, Inbound,
    LineReader, Reassembler, TransferObserver,
};

use crate::file_transfer::{FileSender, DEFAULT_PACING};

/// Incoming files held open at once, across every sender in the room.
pub const MAX_OPEN_DOWNLOADS: usize = 32;

/// Something the user interface should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// The server is full; this connection is queued.
    Waiting(String),
    /// Promoted out of the queue.
    Admitted(String),
    /// A decrypted chat line, `[HH:MM:SS] sender: text`.
    Chat(String),
    DownloadProgress { file_name: String, percent: u8 },
    DownloadComplete { file_name: String, path: PathBuf },
    UploadProgress { file_name: String, percent: u8 },
    UploadComplete { file_name: String, bytes: u64 },
    /// A failed incoming or outgoing transfer.
    TransferError { file_name: String, message: String },
    /// The server closed the connection.
    Disconnected,
}

/// Configuration for connecting to an rchat server.
#[derive(Debug, Clone)]
pub struct ConnectConfig {
    /// Where files received from other users are written.
    pub download_dir: PathBuf,
    /// Pause between outgoing file chunks.
    pub chunk_pacing: Duration,
    /// Capacity of the outbound frame queue.
    pub outbound_queue: usize,
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            chunk_pacing: DEFAULT_PACING,
            outbound_queue: 256,
        }
    }
}

/// `<downloads>/rchat`, falling back to `./downloads`.
pub fn default_download_dir() -> PathBuf {
    dirs::download_dir()
        .map(|d| d.join("rchat"))
        .unwrap_or_else(|| PathBuf::from("downloads"))
}

/// A connection to an rchat server.
pub struct ChatClient {
    cipher: Arc<Cipher>,
    /// Held until authentication succeeds, then moved into the receive loop.
    reader: Option<LineReader<OwnedReadHalf>>,
    outbound: mpsc::Sender<String>,
    events: mpsc::UnboundedSender<ClientEvent>,
    files: FileSender,
    receive_task: Option<JoinHandle<()>>,
    username: Option<String>,
    was_queued: bool,
    config: ConnectConfig,
}

impl ChatClient {
    /// Connect and wait for admission and the key line.
    ///
    /// Queue notices are delivered on `events` while waiting. A server that
    /// refuses the connection yields [`ChatError::ServerFull`].
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        config: ConnectConfig,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> ChatResult<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| ChatError::Transport(format!("cannot connect: {e}")))?;
        let (read_half, write_half) = stream.into_split();
        let mut reader = LineReader::new(read_half);

        let mut was_queued = false;
        let key = loop {
            let line = reader.next_line().await?.ok_or_else(|| {
                ChatError::Transport("server closed the connection before admission".into())
            })?;
            match ControlLine::parse(&line) {
                Some(ControlLine::Full(reason)) => return Err(ChatError::ServerFull(reason)),
                Some(ControlLine::Waiting(reason)) => {
                    info!("server full, waiting in queue");
                    was_queued = true;
                    let _ = events.send(ClientEvent::Waiting(reason));
                }
                Some(ControlLine::Connected(reason)) => {
                    let _ = events.send(ClientEvent::Admitted(reason));
                }
                None => break line,
            }
        };
        let cipher = Arc::new(Cipher::from_key_string(&key)?);
        debug!("received chat key");

        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        tokio::spawn(async move {
            if let Err(e) = drain_lines(write_half, outbound_rx).await {
                debug!(error = %e, "connection writer stopped");
            }
        });

        let files = FileSender::new(cipher.clone(), outbound.clone(), config.chunk_pacing);
        Ok(Self {
            cipher,
            reader: Some(reader),
            outbound,
            events,
            files,
            receive_task: None,
            username: None,
            was_queued,
            config,
        })
    }

    /// Whether the server made this connection wait for a slot.
    pub fn was_queued(&self) -> bool {
        self.was_queued
    }

    /// The authenticated username, if any.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    /// Log in. `Ok(false)` means the server answered `AUTH_FAILURE`; the
    /// attempt may be repeated.
    pub async fn login(&mut self, username: &str, password: &str) -> ChatResult<bool> {
        self.authenticate(AuthRequest::Login {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await
    }

    /// Register a new account and log in with it.
    pub async fn register(&mut self, username: &str, password: &str) -> ChatResult<bool> {
        self.authenticate(AuthRequest::Register {
            username: username.to_string(),
            password: password.to_string(),
        })
        .await
    }

    async fn authenticate(&mut self, request: AuthRequest) -> ChatResult<bool> {
        if self.username.is_some() {
            return Err(ChatError::Other("already authenticated".into()));
        }
        self.send_frame(&request.encode()).await?;

        let reader = self
            .reader
            .as_mut()
            .ok_or_else(|| ChatError::Transport("connection already closed".into()))?;
        loop {
            let line = reader.next_line().await?.ok_or_else(|| {
                ChatError::Transport("server closed the connection during authentication".into())
            })?;
            let frame = match self.cipher.decrypt(&line) {
                Ok(frame) => frame,
                Err(e) => {
                    debug!(error = %e, "dropping undecryptable frame");
                    continue;
                }
            };
            match frame.as_str() {
                AUTH_SUCCESS => break,
                AUTH_FAILURE => return Ok(false),
                _ => debug!("ignoring frame while authenticating"),
            }
        }

        info!(username = request.username(), "authenticated");
        self.username = Some(request.username().to_string());
        self.start_receiving();
        Ok(true)
    }

    fn start_receiving(&mut self) {
        if let Some(reader) = self.reader.take() {
            let task = tokio::spawn(receive_loop(
                reader,
                self.cipher.clone(),
                self.events.clone(),
                self.config.download_dir.clone(),
            ));
            self.receive_task = Some(task);
        }
    }

    fn require_username(&self) -> ChatResult<&str> {
        self.username
            .as_deref()
            .ok_or_else(|| ChatError::AuthFailed("not logged in".into()))
    }

    /// Seal and queue one plaintext frame.
    pub async fn send_frame(&self, frame: &str) -> ChatResult<()> {
        let line = self.cipher.encrypt(frame)?;
        self.outbound
            .send(line)
            .await
            .map_err(|_| ChatError::Transport("connection closed".into()))
    }

    /// Send `[HH:MM:SS] <username>: <text>` to everyone else.
    pub async fn send_chat(&self, text: &str) -> ChatResult<()> {
        let line = chat_line(self.require_username()?, text);
        self.send_frame(&line).await
    }

    /// Tell the room this user has arrived.
    pub async fn announce_join(&self) -> ChatResult<()> {
        let username = self.require_username()?;
        let notice = server_notice(&format!("{username} has joined the chat. Say hi!"));
        self.send_frame(&notice).await
    }

    /// Start uploading a file in the background.
    ///
    /// Type and size are checked before anything is sent. Progress and the
    /// outcome arrive as events; the handle resolves to the bytes sent.
    pub fn send_file(&self, path: &Path) -> ChatResult<JoinHandle<ChatResult<u64>>> {
        self.require_username()?;
        self.files.send_file(path, self.events.clone())
    }

    /// Announce departure, send `QUIT` and wait for the server to close.
    pub async fn quit(mut self) -> ChatResult<()> {
        if let Some(username) = self.username.clone() {
            let notice = server_notice(&format!("{username} has left the chat."));
            self.send_frame(&notice).await?;
        }
        self.send_frame(QUIT).await?;

        if let Some(task) = self.receive_task.take() {
            if let Err(e) = task.await {
                warn!(error = %e, "receive loop panicked");
            }
        }
        Ok(())
    }
}

/// Read frames until the server closes, routing chat lines and file frames.
async fn receive_loop(
    mut reader: LineReader<OwnedReadHalf>,
    cipher: Arc<Cipher>,
    events: mpsc::UnboundedSender<ClientEvent>,
    download_dir: PathBuf,
) {
    let store = Arc::new(DirectoryStore::new(download_dir));
    let mut reassembler = Reassembler::with_max_open(store, MAX_OPEN_DOWNLOADS);
    let mut observer = EventObserver {
        events: events.clone(),
    };

    loop {
        let line = match reader.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "connection read failed");
                break;
            }
        };
        let frame = match cipher.decrypt(&line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(error = %e, "dropping undecryptable frame");
                continue;
            }
        };
        match Inbound::classify(&frame) {
            Inbound::File => {
                if let Err(e) = reassembler.handle(&frame, &mut observer) {
                    warn!(error = %e, "bad file frame");
                }
            }
            Inbound::Chat => {
                let _ = events.send(ClientEvent::Chat(frame));
            }
            Inbound::Quit => {}
        }
    }

    debug!("receive loop ended");
    let _ = events.send(ClientEvent::Disconnected);
}

/// Forwards reassembly callbacks as client events.
struct EventObserver {
    events: mpsc::UnboundedSender<ClientEvent>,
}

impl TransferObserver for EventObserver {
    fn on_progress(&mut self, file_name: &str, percent: u8) {
        let _ = self.events.send(ClientEvent::DownloadProgress {
            file_name: file_name.to_string(),
            percent,
        });
    }

    fn on_complete(&mut self, file_name: &str, path: &Path, _data: &[u8]) {
        let _ = self.events.send(ClientEvent::DownloadComplete {
            file_name: file_name.to_string(),
            path: path.to_path_buf(),
        });
    }

    fn on_error(&mut self, file_name: &str, message: &str) {
        let _ = self.events.send(ClientEvent::TransferError {
            file_name: file_name.to_string(),
            message: message.to_string(),
        });
    }
}
