//! rchat-client: client library for the rchat chat service.
//!
//! Connects over TCP, waits out the server's admission queue, receives the
//! shared chat key, authenticates, then exchanges sealed chat lines and
//! chunked files with the other users.
//!
//! # Quick Start
//!
//! ```no_run
//! use rchat_client::{ChatClient, ClientEvent, ConnectConfig};
//! use tokio::sync::mpsc;
//!
//! # async fn example() -> rchat_core::ChatResult<()> {
//! let (events, mut rx) = mpsc::unbounded_channel();
//! let mut client = ChatClient::connect("localhost:1060", ConnectConfig::default(), events).await?;
//!
//! if client.login("alice", "secret").await? {
//!     client.announce_join().await?;
//!     client.send_chat("hello").await?;
//!     if let Some(ClientEvent::Chat(line)) = rx.recv().await {
//!         println!("{line}");
//!     }
//! }
//! client.quit().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod file_transfer;

pub use client::{default_download_dir, ChatClient, ClientEvent, ConnectConfig};
pub use file_transfer::{upload, FileSender, DEFAULT_PACING, MAX_CONCURRENT_UPLOADS};

pub use rchat_core::{ChatError, ChatResult};
