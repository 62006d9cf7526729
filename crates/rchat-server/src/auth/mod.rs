//! Authentication: user credentials and the shared chat key.

pub mod credentials;
pub mod key_store;

pub use credentials::{CredentialStore, FileCredentialStore};
