//! rchat-core: shared protocol library for the rchat chat service.
//!
//! Provides the error type, the symmetric crypto envelope, newline framing,
//! the frame grammar (control, auth, file-transfer and chat frames) and the
//! chunked file-transfer reassembler used by both server and client.

pub mod codec;
pub mod crypto;
pub mod error;
pub mod messages;
pub mod transfer;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{frame_line, LineDecoder, MAX_LINE_LEN};
pub use crypto::Cipher;
pub use error::{ChatError, ChatResult};
pub use messages::{AuthRequest, ControlLine, FileFrame, Inbound};
pub use transfer::{DirectoryStore, FileStore, Reassembler, TransferEvent, TransferObserver};
pub use transport::{drain_lines, write_line, LineReader};
