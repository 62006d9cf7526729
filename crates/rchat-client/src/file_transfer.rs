//! Outgoing file transfer.
//!
//! A file goes out as `FILE_START`, its 64 KiB chunks in ascending order
//! with a pacing delay between them, then `FILE_END`, each frame sealed and
//! queued on the connection's outbound channel. At most
//! [`MAX_CONCURRENT_UPLOADS`] files stream at once; further requests wait for
//! a free worker.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use rchat_core::transfer::{chunk_frames, total_chunks, validate_file};
use rchat_core::{ChatError, ChatResult, Cipher, FileFrame};

use crate::client::ClientEvent;

/// Files allowed to stream concurrently from one client.
pub const MAX_CONCURRENT_UPLOADS: usize = 3;

/// Default pause between chunks.
pub const DEFAULT_PACING: Duration = Duration::from_millis(100);

/// Stream one file's frames onto `outbound`.
///
/// Calls `on_progress` with the percentage sent after each chunk. Returns the
/// number of bytes sent.
pub async fn upload<F>(
    cipher: &Cipher,
    outbound: &mpsc::Sender<String>,
    file_name: &str,
    data: &[u8],
    pacing: Duration,
    mut on_progress: F,
) -> ChatResult<u64>
where
    F: FnMut(u8),
{
    let size = data.len() as u64;
    validate_file(file_name, size)?;

    send_frame(
        cipher,
        outbound,
        FileFrame::Start {
            file_name: file_name.to_string(),
            size,
        },
    )
    .await?;

    let total = total_chunks(size).max(1) as u64;
    for (sent, frame) in chunk_frames(file_name, data).enumerate() {
        send_frame(cipher, outbound, frame).await?;
        on_progress(((sent as u64 + 1) * 100 / total) as u8);
        if !pacing.is_zero() {
            tokio::time::sleep(pacing).await;
        }
    }

    send_frame(
        cipher,
        outbound,
        FileFrame::End {
            file_name: file_name.to_string(),
        },
    )
    .await?;

    info!(file = %file_name, bytes = size, "upload finished");
    Ok(size)
}

async fn send_frame(
    cipher: &Cipher,
    outbound: &mpsc::Sender<String>,
    frame: FileFrame,
) -> ChatResult<()> {
    let line = cipher.encrypt(&frame.encode())?;
    outbound
        .send(line)
        .await
        .map_err(|_| ChatError::Transport("connection closed during upload".into()))
}

/// Bounded pool of upload workers sharing one connection.
#[derive(Debug, Clone)]
pub struct FileSender {
    cipher: Arc<Cipher>,
    outbound: mpsc::Sender<String>,
    slots: Arc<Semaphore>,
    pacing: Duration,
}

impl FileSender {
    pub fn new(cipher: Arc<Cipher>, outbound: mpsc::Sender<String>, pacing: Duration) -> Self {
        Self {
            cipher,
            outbound,
            slots: Arc::new(Semaphore::new(MAX_CONCURRENT_UPLOADS)),
            pacing,
        }
    }

    /// Validate `path` and queue it for upload.
    ///
    /// Rejections (missing file, disallowed type, too large) are returned
    /// immediately and nothing is sent. Otherwise the upload runs in the
    /// background, reporting on `events`.
    pub fn send_file(
        &self,
        path: &Path,
        events: mpsc::UnboundedSender<ClientEvent>,
    ) -> ChatResult<JoinHandle<ChatResult<u64>>> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| {
                ChatError::FileTransfer(format!("not a file path: {}", path.display()))
            })?
            .to_string();
        let size = std::fs::metadata(path)
            .map_err(|e| ChatError::FileTransfer(format!("{}: {e}", path.display())))?
            .len();
        validate_file(&file_name, size)?;

        let path = path.to_path_buf();
        let sender = self.clone();
        Ok(tokio::spawn(async move {
            let _slot = sender
                .slots
                .acquire()
                .await
                .map_err(|_| ChatError::Other("upload pool closed".into()))?;
            debug!(file = %file_name, "upload slot acquired");

            let result = match tokio::fs::read(&path).await {
                Ok(data) => {
                    let progress_events = events.clone();
                    let name = file_name.clone();
                    upload(
                        &sender.cipher,
                        &sender.outbound,
                        &file_name,
                        &data,
                        sender.pacing,
                        move |percent| {
                            let _ = progress_events.send(ClientEvent::UploadProgress {
                                file_name: name.clone(),
                                percent,
                            });
                        },
                    )
                    .await
                }
                Err(e) => Err(ChatError::from(e)),
            };

            match &result {
                Ok(bytes) => {
                    let _ = events.send(ClientEvent::UploadComplete {
                        file_name: file_name.clone(),
                        bytes: *bytes,
                    });
                }
                Err(e) => {
                    warn!(file = %file_name, error = %e, "upload failed");
                    let _ = events.send(ClientEvent::TransferError {
                        file_name: file_name.clone(),
                        message: e.to_string(),
                    });
                }
            }
            result
        }))
    }

    /// Uploads that could start right now.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rchat_core::transfer::CHUNK_SIZE;

    fn drain(cipher: &Cipher, rx: &mut mpsc::Receiver<String>) -> Vec<String> {
        let mut frames = Vec::new();
        while let Ok(line) = rx.try_recv() {
            frames.push(cipher.decrypt(&line).unwrap());
        }
        frames
    }

    #[tokio::test]
    async fn upload_sends_start_chunks_end_in_order() {
        let cipher = Cipher::generate().unwrap();
        let (tx, mut rx) = mpsc::channel(16);
        let data = vec![7u8; CHUNK_SIZE * 2 + 10];
        let mut progress = Vec::new();

        let sent = upload(&cipher, &tx, "report.pdf", &data, Duration::ZERO, |p| {
            progress.push(p)
        })
        .await
        .unwrap();

        assert_eq!(sent, data.len() as u64);
        assert_eq!(progress, vec![33, 66, 100]);
        let frames = drain(&cipher, &mut rx);
        assert_eq!(frames.len(), 5);
        assert_eq!(frames[0], format!("FILE_START:report.pdf:{}", data.len()));
        assert!(frames[1].starts_with("FILE_CHUNK:0:3:"));
        assert!(frames[2].starts_with("FILE_CHUNK:1:3:"));
        assert!(frames[3].starts_with("FILE_CHUNK:2:3:"));
        assert!(frames[3].ends_with(":report.pdf"));
        assert_eq!(frames[4], "FILE_END:report.pdf");
    }

    #[tokio::test]
    async fn empty_file_is_start_then_end() {
        let cipher = Cipher::generate().unwrap();
        let (tx, mut rx) = mpsc::channel(4);
        upload(&cipher, &tx, "empty.docx", &[], Duration::ZERO, |_| {})
            .await
            .unwrap();
        assert_eq!(
            drain(&cipher, &mut rx),
            vec!["FILE_START:empty.docx:0", "FILE_END:empty.docx"]
        );
    }

    #[tokio::test]
    async fn rejected_files_send_nothing() {
        let cipher = Arc::new(Cipher::generate().unwrap());
        let (tx, mut rx) = mpsc::channel(4);
        let dir = tempfile::tempdir().unwrap();
        let exe = dir.path().join("tool.exe");
        std::fs::write(&exe, b"MZ").unwrap();

        let sender = FileSender::new(cipher.clone(), tx, Duration::ZERO);
        let (events, _events_rx) = mpsc::unbounded_channel();
        let err = sender.send_file(&exe, events.clone()).unwrap_err();
        assert!(err.to_string().contains("File type not allowed: .exe"));
        assert!(sender
            .send_file(&dir.path().join("missing.pdf"), events)
            .is_err());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn send_file_reports_progress_and_completion() {
        let cipher = Arc::new(Cipher::generate().unwrap());
        let (tx, mut rx) = mpsc::channel(16);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("photo.jpeg");
        std::fs::write(&path, vec![1u8; 100]).unwrap();

        let sender = FileSender::new(cipher.clone(), tx, Duration::ZERO);
        let (events, mut events_rx) = mpsc::unbounded_channel();
        let bytes = sender.send_file(&path, events).unwrap().await.unwrap().unwrap();
        assert_eq!(bytes, 100);
        assert_eq!(sender.available_slots(), MAX_CONCURRENT_UPLOADS);

        assert_eq!(
            events_rx.recv().await,
            Some(ClientEvent::UploadProgress {
                file_name: "photo.jpeg".into(),
                percent: 100
            })
        );
        assert_eq!(
            events_rx.recv().await,
            Some(ClientEvent::UploadComplete {
                file_name: "photo.jpeg".into(),
                bytes: 100
            })
        );
        assert_eq!(drain(&cipher, &mut rx).len(), 3);
    }

    #[tokio::test]
    async fn pool_limits_concurrent_uploads() {
        let cipher = Arc::new(Cipher::generate().unwrap());
        // a one-slot channel stalls every upload after its first frame
        let (tx, mut rx) = mpsc::channel(1);
        let dir = tempfile::tempdir().unwrap();
        let sender = FileSender::new(cipher.clone(), tx, Duration::ZERO);
        let (events, _events_rx) = mpsc::unbounded_channel();

        let mut handles = Vec::new();
        for i in 0..4 {
            let path = dir.path().join(format!("f{i}.pdf"));
            std::fs::write(&path, vec![0u8; 10]).unwrap();
            handles.push(sender.send_file(&path, events.clone()).unwrap());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sender.available_slots(), 0);

        let mut frames = 0;
        while frames < 4 * 3 {
            rx.recv().await.unwrap();
            frames += 1;
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 10);
        }
        assert_eq!(sender.available_slots(), MAX_CONCURRENT_UPLOADS);
    }
}
