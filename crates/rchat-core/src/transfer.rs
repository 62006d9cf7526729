//! Chunked file transfer over the chat line protocol.
//!
//! A sender emits `FILE_START`, then `FILE_CHUNK` frames carrying 64 KiB
//! slices in index order, then `FILE_END`. The receiving side feeds every
//! file frame into a [`Reassembler`], which buffers chunks per transfer,
//! detects completion, persists the bytes through a [`FileStore`] and reports
//! through a [`TransferObserver`].
//!
//! Malformed frames come back as `Err` (the caller logs and drops them);
//! transfer-level failures (disallowed type, oversize, incomplete at
//! `FILE_END`) are reported to the observer.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::{debug, info, warn};

use crate::error::{ChatError, ChatResult};
use crate::messages::FileFrame;

/// Fixed chunk size: 64 KiB.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Largest file accepted: 10 MiB.
pub const MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;

/// Default cap on transfers one reassembler keeps open, matching what a
/// single sender streams concurrently.
pub const MAX_OPEN_TRANSFERS: usize = 3;

/// Lower-case extensions accepted for transfer.
pub const ALLOWED_EXTENSIONS: &[&str] = &[".docx", ".pdf", ".jpeg", ".jpg"];

/// Lower-cased extension including the dot, or `""` if there is none.
///
/// A leading dot (".pdf") is a hidden file name, not an extension.
pub fn file_extension(file_name: &str) -> String {
    match file_name.rfind('.') {
        Some(pos) if pos > 0 => file_name[pos..].to_lowercase(),
        _ => String::new(),
    }
}

pub fn is_allowed_extension(file_name: &str) -> bool {
    ALLOWED_EXTENSIONS.contains(&file_extension(file_name).as_str())
}

/// Check a file's name and size against the transfer policy.
pub fn validate_file(file_name: &str, size: u64) -> ChatResult<()> {
    if !is_allowed_extension(file_name) {
        let ext = file_extension(file_name);
        return Err(ChatError::FileTransfer(format!(
            "File type not allowed: {}",
            if ext.is_empty() { "(none)" } else { &ext }
        )));
    }
    if size > MAX_FILE_SIZE {
        return Err(ChatError::FileTransfer(format!(
            "File too large: {size} bytes (limit {MAX_FILE_SIZE})"
        )));
    }
    Ok(())
}

/// Number of chunks for a file of `size` bytes: `ceil(size / CHUNK_SIZE)`.
pub fn total_chunks(size: u64) -> u32 {
    size.div_ceil(CHUNK_SIZE as u64) as u32
}

/// Split file bytes into `FILE_CHUNK` frames tagged with the transfer id.
pub fn chunk_frames<'a>(
    file_name: &'a str,
    data: &'a [u8],
) -> impl Iterator<Item = FileFrame> + 'a {
    let total = total_chunks(data.len() as u64);
    data.chunks(CHUNK_SIZE)
        .enumerate()
        .map(move |(index, chunk)| FileFrame::Chunk {
            index: index as u32,
            total,
            payload: BASE64.encode(chunk),
            transfer: Some(file_name.to_string()),
        })
}

/// Callbacks fired while reassembling transfers.
pub trait TransferObserver {
    fn on_progress(&mut self, file_name: &str, percent: u8);
    fn on_complete(&mut self, file_name: &str, path: &Path, data: &[u8]);
    fn on_error(&mut self, file_name: &str, message: &str);
}

/// A recorded observer callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Progress { file_name: String, percent: u8 },
    Complete { file_name: String, path: PathBuf, size: usize },
    Error { file_name: String, message: String },
}

impl TransferObserver for Vec<TransferEvent> {
    fn on_progress(&mut self, file_name: &str, percent: u8) {
        self.push(TransferEvent::Progress {
            file_name: file_name.to_string(),
            percent,
        });
    }

    fn on_complete(&mut self, file_name: &str, path: &Path, data: &[u8]) {
        self.push(TransferEvent::Complete {
            file_name: file_name.to_string(),
            path: path.to_path_buf(),
            size: data.len(),
        });
    }

    fn on_error(&mut self, file_name: &str, message: &str) {
        self.push(TransferEvent::Error {
            file_name: file_name.to_string(),
            message: message.to_string(),
        });
    }
}

/// Persistence handoff for completed transfers.
pub trait FileStore: Send + Sync {
    /// Persist `data` under `file_name`, returning where it landed.
    fn persist(&self, file_name: &str, data: &[u8]) -> ChatResult<PathBuf>;
}

/// Writes completed files into a directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl FileStore for DirectoryStore {
    fn persist(&self, file_name: &str, data: &[u8]) -> ChatResult<PathBuf> {
        let name = safe_file_name(file_name)?;
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(name);
        std::fs::write(&path, data)?;
        Ok(path)
    }
}

/// Reduce a peer-supplied name to its final path component.
fn safe_file_name(file_name: &str) -> ChatResult<&str> {
    let last = file_name
        .rsplit(|c| c == '/' || c == '\\')
        .next()
        .unwrap_or_default();
    if last.is_empty() || last == "." || last == ".." {
        return Err(ChatError::FileTransfer(format!(
            "unusable file name: {file_name}"
        )));
    }
    Ok(last)
}

/// In-flight state of one incoming file.
#[derive(Debug)]
struct TransferContext {
    size: u64,
    total_chunks: u32,
    chunks: BTreeMap<u32, Vec<u8>>,
    complete: bool,
}

impl TransferContext {
    fn new(size: u64) -> Self {
        let total_chunks = total_chunks(size);
        Self {
            size,
            total_chunks,
            chunks: BTreeMap::new(),
            complete: total_chunks == 0,
        }
    }

    fn percent(&self) -> u8 {
        if self.total_chunks == 0 {
            return 100;
        }
        (self.chunks.len() as u64 * 100 / self.total_chunks as u64) as u8
    }

    fn assemble(&self) -> Vec<u8> {
        let mut data = Vec::with_capacity(self.size as usize);
        for chunk in self.chunks.values() {
            data.extend_from_slice(chunk);
        }
        data
    }
}

/// Reassembles incoming transfers from one sender.
pub struct Reassembler {
    transfers: HashMap<String, TransferContext>,
    store: Arc<dyn FileStore>,
    max_open: usize,
}

impl Reassembler {
    pub fn new(store: Arc<dyn FileStore>) -> Self {
        Self::with_max_open(store, MAX_OPEN_TRANSFERS)
    }

    /// A reassembler that refuses a new `FILE_START` while `max_open`
    /// transfers are open. Restarting an open transfer is always allowed.
    pub fn with_max_open(store: Arc<dyn FileStore>, max_open: usize) -> Self {
        Self {
            transfers: HashMap::new(),
            store,
            max_open,
        }
    }

    /// Number of transfers started but not yet finished.
    pub fn in_progress(&self) -> usize {
        self.transfers.len()
    }

    /// Parse and apply one decrypted file frame.
    pub fn handle(&mut self, frame: &str, observer: &mut dyn TransferObserver) -> ChatResult<()> {
        match FileFrame::parse(frame)? {
            FileFrame::Start { file_name, size } => {
                self.start(file_name, size, observer);
                Ok(())
            }
            FileFrame::Chunk {
                index,
                total,
                payload,
                transfer,
            } => self.chunk(index, total, &payload, transfer.as_deref(), observer),
            FileFrame::End { file_name } => self.end(&file_name, observer),
            FileFrame::Error { message } => {
                observer.on_error("Transfer", &message);
                Ok(())
            }
        }
    }

    fn start(&mut self, file_name: String, size: u64, observer: &mut dyn TransferObserver) {
        if let Err(e) = validate_file(&file_name, size) {
            warn!(file = %file_name, size, error = %e, "rejecting incoming file");
            observer.on_error(&file_name, &reason(&e));
            return;
        }

        if !self.transfers.contains_key(&file_name) && self.transfers.len() >= self.max_open {
            warn!(
                file = %file_name,
                open = self.transfers.len(),
                "too many open transfers, rejecting incoming file"
            );
            observer.on_error(&file_name, "Too many transfers in progress");
            return;
        }

        let ctx = TransferContext::new(size);
        debug!(file = %file_name, size, chunks = ctx.total_chunks, "transfer started");
        if self.transfers.insert(file_name.clone(), ctx).is_some() {
            debug!(file = %file_name, "restarted transfer replaces earlier one");
        }
        observer.on_progress(&file_name, 0);
    }

    fn chunk(
        &mut self,
        index: u32,
        total: u32,
        payload: &str,
        transfer: Option<&str>,
        observer: &mut dyn TransferObserver,
    ) -> ChatResult<()> {
        let file_name = match transfer {
            Some(name) => match self.transfers.get(name) {
                Some(ctx) if ctx.total_chunks == total => name.to_string(),
                Some(ctx) => {
                    return Err(ChatError::InvalidMessage(format!(
                        "chunk total {total} does not match transfer '{name}' ({} chunks)",
                        ctx.total_chunks
                    )));
                }
                None => {
                    return Err(ChatError::InvalidMessage(format!(
                        "chunk {index} for unknown transfer '{name}'"
                    )));
                }
            },
            None => self.match_by_total(index, total)?,
        };

        if index >= total {
            return Err(ChatError::InvalidMessage(format!(
                "chunk index {index} out of range (total {total})"
            )));
        }
        let data = BASE64.decode(payload)?;
        if data.len() > CHUNK_SIZE {
            return Err(ChatError::InvalidMessage(format!(
                "chunk {index} is {} bytes, larger than {CHUNK_SIZE}",
                data.len()
            )));
        }

        let Some(ctx) = self.transfers.get_mut(&file_name) else {
            return Err(ChatError::InvalidMessage(format!(
                "transfer '{file_name}' vanished"
            )));
        };
        ctx.chunks.insert(index, data);
        if ctx.chunks.len() as u32 >= ctx.total_chunks {
            ctx.complete = true;
        }
        let percent = ctx.percent();
        observer.on_progress(&file_name, percent);
        Ok(())
    }

    /// Frames without a transfer id match the one open transfer with the same chunk count.
    fn match_by_total(&self, index: u32, total: u32) -> ChatResult<String> {
        let mut candidates = self
            .transfers
            .iter()
            .filter(|(_, ctx)| !ctx.complete && ctx.total_chunks == total)
            .map(|(name, _)| name);
        match (candidates.next(), candidates.next()) {
            (Some(name), None) => Ok(name.clone()),
            (None, _) => Err(ChatError::InvalidMessage(format!(
                "no active transfer for chunk {index} (total {total})"
            ))),
            (Some(_), Some(_)) => Err(ChatError::InvalidMessage(format!(
                "chunk {index} matches several transfers with {total} chunks"
            ))),
        }
    }

    fn end(&mut self, file_name: &str, observer: &mut dyn TransferObserver) -> ChatResult<()> {
        let Some(ctx) = self.transfers.get(file_name) else {
            return Err(ChatError::InvalidMessage(format!(
                "end of unknown transfer '{file_name}'"
            )));
        };

        if !ctx.complete {
            warn!(
                file = %file_name,
                received = ctx.chunks.len(),
                total = ctx.total_chunks,
                "transfer ended before all chunks arrived"
            );
            observer.on_error(file_name, "Incomplete file transfer");
            return Ok(());
        }

        let data = ctx.assemble();
        let expected = ctx.size;
        self.transfers.remove(file_name);

        if data.len() as u64 != expected {
            observer.on_error(
                file_name,
                &format!(
                    "Size mismatch: received {} bytes, expected {expected}",
                    data.len()
                ),
            );
            return Ok(());
        }

        match self.store.persist(file_name, &data) {
            Ok(path) => {
                info!(file = %file_name, bytes = data.len(), path = %path.display(), "file received");
                observer.on_complete(file_name, &path, &data);
            }
            Err(e) => {
                observer.on_error(file_name, &format!("Error completing transfer: {e}"));
            }
        }
        Ok(())
    }
}

fn reason(e: &ChatError) -> String {
    match e {
        ChatError::FileTransfer(msg) => msg.clone(),
        other => other.to_string(),
    }
}
