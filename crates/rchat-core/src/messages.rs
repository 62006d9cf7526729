//! rchat frame grammar.
//!
//! Control lines (`SERVER_*`) and the key line travel in clear. Everything
//! else is a UTF-8 plaintext frame sealed by [`crate::crypto::Cipher`].

use crate::error::{ChatError, ChatResult};

pub const SERVER_FULL: &str = "SERVER_FULL";
pub const SERVER_WAITING: &str = "SERVER_WAITING";
pub const SERVER_CONNECTED: &str = "SERVER_CONNECTED";

pub const AUTH_LOGIN: &str = "AUTH_LOGIN";
pub const AUTH_REGISTER: &str = "AUTH_REGISTER";
pub const AUTH_SUCCESS: &str = "AUTH_SUCCESS";
pub const AUTH_FAILURE: &str = "AUTH_FAILURE";

pub const FILE_START: &str = "FILE_START";
pub const FILE_CHUNK: &str = "FILE_CHUNK";
pub const FILE_END: &str = "FILE_END";
pub const FILE_ERROR: &str = "FILE_ERROR";

/// Plaintext payload that ends a session gracefully.
pub const QUIT: &str = "QUIT";

/// Display name used for server-originated chat lines.
pub const SERVER_SENDER: &str = "Server";

/// Unencrypted admission notice sent before the key line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlLine {
    /// Connection refused.
    Full(String),
    /// Queued behind a saturated gate.
    Waiting(String),
    /// Promoted from the queue; the key line follows.
    Connected(String),
}

impl ControlLine {
    pub fn encode(&self) -> String {
        match self {
            ControlLine::Full(reason) => format!("{SERVER_FULL}:{reason}"),
            ControlLine::Waiting(reason) => format!("{SERVER_WAITING}:{reason}"),
            ControlLine::Connected(reason) => format!("{SERVER_CONNECTED}:{reason}"),
        }
    }

    /// Parse a control line; anything else (e.g. the key line) yields `None`.
    pub fn parse(line: &str) -> Option<Self> {
        let (tag, reason) = line.split_once(':')?;
        let reason = reason.to_string();
        match tag {
            SERVER_FULL => Some(ControlLine::Full(reason)),
            SERVER_WAITING => Some(ControlLine::Waiting(reason)),
            SERVER_CONNECTED => Some(ControlLine::Connected(reason)),
            _ => None,
        }
    }
}

/// Credentials frame sent while authenticating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthRequest {
    Login { username: String, password: String },
    Register { username: String, password: String },
}

impl AuthRequest {
    /// Parse `AUTH_LOGIN:<user>:<pass>` / `AUTH_REGISTER:<user>:<pass>`.
    ///
    /// The password keeps any further colons. Returns `None` for frames with
    /// fewer than three fields or an unknown verb.
    pub fn parse(frame: &str) -> Option<Self> {
        let mut parts = frame.splitn(3, ':');
        let verb = parts.next()?;
        let username = parts.next()?.to_string();
        let password = parts.next()?.to_string();
        match verb {
            AUTH_LOGIN => Some(AuthRequest::Login { username, password }),
            AUTH_REGISTER => Some(AuthRequest::Register { username, password }),
            _ => None,
        }
    }

    pub fn encode(&self) -> String {
        match self {
            AuthRequest::Login { username, password } => {
                format!("{AUTH_LOGIN}:{username}:{password}")
            }
            AuthRequest::Register { username, password } => {
                format!("{AUTH_REGISTER}:{username}:{password}")
            }
        }
    }

    pub fn username(&self) -> &str {
        match self {
            AuthRequest::Login { username, .. } | AuthRequest::Register { username, .. } => {
                username
            }
        }
    }
}

/// File-transfer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileFrame {
    Start {
        file_name: String,
        size: u64,
    },
    Chunk {
        index: u32,
        total: u32,
        /// Base64 of the raw chunk bytes.
        payload: String,
        /// Explicit transfer identifier (the file name). Older senders omit it.
        transfer: Option<String>,
    },
    End {
        file_name: String,
    },
    Error {
        message: String,
    },
}

impl FileFrame {
    /// Whether a plaintext frame carries one of the file-transfer tags.
    pub fn is_file_frame(frame: &str) -> bool {
        [FILE_START, FILE_CHUNK, FILE_END, FILE_ERROR]
            .iter()
            .any(|tag| frame.starts_with(tag))
    }

    pub fn parse(frame: &str) -> ChatResult<Self> {
        let (tag, rest) = frame.split_once(':').unwrap_or((frame, ""));
        match tag {
            FILE_START => {
                let (file_name, size) = rest
                    .rsplit_once(':')
                    .ok_or_else(|| malformed(frame, "missing size"))?;
                if file_name.is_empty() {
                    return Err(malformed(frame, "empty file name"));
                }
                let size = size
                    .parse::<u64>()
                    .map_err(|e| malformed(frame, &format!("bad size: {e}")))?;
                Ok(FileFrame::Start {
                    file_name: file_name.to_string(),
                    size,
                })
            }
            FILE_CHUNK => {
                let mut parts = rest.splitn(4, ':');
                let index = parts
                    .next()
                    .unwrap_or_default()
                    .parse::<u32>()
                    .map_err(|e| malformed(frame, &format!("bad chunk index: {e}")))?;
                let total = parts
                    .next()
                    .ok_or_else(|| malformed(frame, "missing total"))?
                    .parse::<u32>()
                    .map_err(|e| malformed(frame, &format!("bad chunk total: {e}")))?;
                let payload = parts
                    .next()
                    .ok_or_else(|| malformed(frame, "missing payload"))?
                    .to_string();
                let transfer = parts.next().filter(|t| !t.is_empty()).map(str::to_string);
                Ok(FileFrame::Chunk {
                    index,
                    total,
                    payload,
                    transfer,
                })
            }
            FILE_END => {
                if rest.is_empty() {
                    return Err(malformed(frame, "empty file name"));
                }
                Ok(FileFrame::End {
                    file_name: rest.to_string(),
                })
            }
            FILE_ERROR => Ok(FileFrame::Error {
                message: if rest.is_empty() {
                    "Unknown error".to_string()
                } else {
                    rest.to_string()
                },
            }),
            _ => Err(malformed(frame, "unknown file frame tag")),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            FileFrame::Start { file_name, size } => format!("{FILE_START}:{file_name}:{size}"),
            FileFrame::Chunk {
                index,
                total,
                payload,
                transfer: Some(transfer),
            } => format!("{FILE_CHUNK}:{index}:{total}:{payload}:{transfer}"),
            FileFrame::Chunk {
                index,
                total,
                payload,
                transfer: None,
            } => format!("{FILE_CHUNK}:{index}:{total}:{payload}"),
            FileFrame::End { file_name } => format!("{FILE_END}:{file_name}"),
            FileFrame::Error { message } => format!("{FILE_ERROR}:{message}"),
        }
    }
}

fn malformed(frame: &str, why: &str) -> ChatError {
    let head: String = frame.chars().take(32).collect();
    ChatError::InvalidMessage(format!("{why} in file frame '{head}'"))
}

/// What an Active session should do with a decrypted frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inbound {
    Quit,
    File,
    Chat,
}

impl Inbound {
    pub fn classify(frame: &str) -> Self {
        if frame == QUIT {
            Inbound::Quit
        } else if FileFrame::is_file_frame(frame) {
            Inbound::File
        } else {
            Inbound::Chat
        }
    }
}

/// Current local time as `[HH:MM:SS]`.
pub fn timestamp() -> String {
    chrono::Local::now().format("[%H:%M:%S]").to_string()
}

/// Build `<timestamp> <sender>: <text>`.
pub fn chat_line(sender: &str, text: &str) -> String {
    format!("{} {sender}: {text}", timestamp())
}

/// Build a chat line attributed to the server.
pub fn server_notice(text: &str) -> String {
    chat_line(SERVER_SENDER, text)
}
