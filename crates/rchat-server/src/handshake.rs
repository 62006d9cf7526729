//! Authentication step of the session protocol.
//!
//! After the key line the client sends sealed `AUTH_LOGIN:<user>:<pass>` or
//! `AUTH_REGISTER:<user>:<pass>` frames. Each gets `AUTH_SUCCESS` or
//! `AUTH_FAILURE` back; failures may be retried indefinitely on the same
//! connection.

use rchat_core::messages::{AUTH_FAILURE, AUTH_SUCCESS};
use rchat_core::AuthRequest;
use tracing::{debug, info, warn};

use crate::auth::CredentialStore;

/// What to do with one decrypted frame received while authenticating.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// Credentials accepted; the session becomes active as this user.
    Success { username: String },
    /// Answer with `AUTH_FAILURE` and keep waiting.
    Failure { reason: String },
    /// Not an auth frame; ignored without a reply.
    Ignored,
}

impl AuthOutcome {
    /// Reply frame to send, if any.
    pub fn reply(&self) -> Option<&'static str> {
        match self {
            AuthOutcome::Success { .. } => Some(AUTH_SUCCESS),
            AuthOutcome::Failure { .. } => Some(AUTH_FAILURE),
            AuthOutcome::Ignored => None,
        }
    }
}

/// Verify a login or perform a registration.
pub fn authenticate(frame: &str, store: &dyn CredentialStore) -> AuthOutcome {
    let Some(request) = AuthRequest::parse(frame) else {
        debug!("ignoring non-auth frame before authentication");
        return AuthOutcome::Ignored;
    };

    let result = match &request {
        AuthRequest::Login { username, password } => store.authenticate(username, password),
        AuthRequest::Register { username, password } => store.register(username, password),
    };

    let username = request.username().to_string();
    match result {
        Ok(true) => {
            info!(username = %username, "authentication succeeded");
            AuthOutcome::Success { username }
        }
        Ok(false) => {
            let reason = match request {
                AuthRequest::Login { .. } => "invalid username or password",
                AuthRequest::Register { .. } => "username unavailable",
            };
            info!(username = %username, reason, "authentication failed");
            AuthOutcome::Failure {
                reason: reason.to_string(),
            }
        }
        Err(e) => {
            warn!(username = %username, error = %e, "credential store error");
            AuthOutcome::Failure {
                reason: e.to_string(),
            }
        }
    }
}
