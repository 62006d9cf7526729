//! Core server: accepts TCP connections and runs one session task per
//! connection.
//!
//! Owns the shared chat key, the admission gate and the session registry,
//! and coordinates shutdown of everything it started.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rchat_core::messages::server_notice;
use rchat_core::{ChatError, ChatResult, Cipher};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::admission::AdmissionGate;
use crate::auth::CredentialStore;
use crate::config::ServerConfig;
use crate::session::{Session, SessionContext, SessionRegistry};

/// Chat line every authenticated client receives when the server stops.
pub const SHUTDOWN_FAREWELL: &str = "The server is shutting down. Goodbye!";

/// How long shutdown waits for sessions to deregister.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// The rchat server instance.
pub struct ChatServer {
    config: ServerConfig,
    ctx: Arc<SessionContext>,
    shutdown_tx: watch::Sender<bool>,
}

impl ChatServer {
    pub fn new(
        config: ServerConfig,
        cipher: Cipher,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let ctx = SessionContext {
            gate: AdmissionGate::new(config.max_sessions),
            registry: Arc::new(SessionRegistry::new()),
            cipher: Arc::new(cipher),
            credentials,
            download_dir: config.download_dir.clone(),
            max_queue: config.max_queue,
            promote_delay: config.promote_delay,
            outbound_queue: config.outbound_queue,
        };
        Self {
            config,
            ctx: Arc::new(ctx),
            shutdown_tx: watch::channel(false).0,
        }
    }

    pub fn context(&self) -> &Arc<SessionContext> {
        &self.ctx
    }

    /// Bind the configured listen address.
    pub async fn bind(&self) -> ChatResult<TcpListener> {
        let addr = (self.config.host.as_str(), self.config.port);
        TcpListener::bind(addr).await.map_err(|e| {
            ChatError::Transport(format!(
                "cannot listen on {}:{}: {e}",
                self.config.host, self.config.port
            ))
        })
    }

    /// Accept connections until [`ChatServer::shutdown`] is called.
    pub async fn run(&self, listener: TcpListener) -> ChatResult<()> {
        let local = listener.local_addr()?;
        info!(
            addr = %local,
            capacity = self.config.max_sessions,
            max_queue = ?self.config.max_queue,
            "rchat-server ready"
        );

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            if *shutdown_rx.borrow_and_update() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => self.spawn_session(stream, remote),
                    Err(e) => warn!(error = %e, "accept failed"),
                },
                _ = shutdown_rx.changed() => {}
            }
        }

        debug!("accept loop stopped");
        Ok(())
    }

    fn spawn_session(&self, stream: tokio::net::TcpStream, remote: SocketAddr) {
        let gate = &self.ctx.gate;
        info!(
            remote = %remote,
            active = gate.active_count(),
            queued = gate.queue_length(),
            "connection attempt"
        );
        if let Err(e) = stream.set_nodelay(true) {
            debug!(remote = %remote, error = %e, "cannot set TCP_NODELAY");
        }
        let (read_half, write_half) = stream.into_split();
        let session = Session::new(remote, read_half, write_half, self.ctx.clone());
        tokio::spawn(session.run());
    }

    /// Stop accepting, tell every client goodbye, close all sessions and
    /// fail anyone still queued. Safe to call more than once.
    pub async fn shutdown(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("shutting down");

        self.ctx.gate.close();
        for session in self.ctx.registry.list().await {
            debug!(
                remote = %session.addr,
                username = session.username.as_deref().unwrap_or("-"),
                "closing session"
            );
        }
        let farewell = match self.ctx.cipher.encrypt(&server_notice(SHUTDOWN_FAREWELL)) {
            Ok(line) => Some(line),
            Err(e) => {
                warn!(error = %e, "cannot seal shutdown notice");
                None
            }
        };
        let closed = self.ctx.registry.close_all(farewell).await;

        let deadline = Instant::now() + SHUTDOWN_GRACE;
        while self.ctx.registry.count().await > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        info!(closed, "all sessions closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::FileCredentialStore;
    use crate::session::connection::{PROMOTED_NOTICE, SHUTDOWN_NOTICE, WAITING_NOTICE};
    use rchat_core::messages::AUTH_SUCCESS;
    use rchat_core::{write_line, ControlLine, LineReader};
    use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    const QUIET: Duration = Duration::from_millis(150);

    struct Harness {
        server: Arc<ChatServer>,
        addr: SocketAddr,
        dir: tempfile::TempDir,
    }

    impl Harness {
        fn downloads(&self) -> std::path::PathBuf {
            self.dir.path().join("downloads")
        }
    }

    async fn start(capacity: usize, max_queue: Option<usize>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            max_sessions: capacity,
            max_queue,
            promote_delay: Duration::from_millis(10),
            outbound_queue: 64,
            key_path: dir.path().join("server.key"),
            users_path: dir.path().join("users.json"),
            download_dir: dir.path().join("downloads"),
        };
        let server = Arc::new(ChatServer::new(
            config,
            Cipher::generate().unwrap(),
            Arc::new(FileCredentialStore::in_memory()),
        ));
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let runner = server.clone();
        tokio::spawn(async move { runner.run(listener).await });
        Harness {
            server,
            addr,
            dir,
        }
    }

    struct TestClient {
        reader: LineReader<OwnedReadHalf>,
        writer: OwnedWriteHalf,
        cipher: Option<Cipher>,
    }

    impl TestClient {
        async fn connect(addr: SocketAddr) -> Self {
            let (read, write) = TcpStream::connect(addr).await.unwrap().into_split();
            Self {
                reader: LineReader::new(read),
                writer: write,
                cipher: None,
            }
        }

        async fn line(&mut self) -> Option<String> {
            self.reader.next_line().await.unwrap()
        }

        /// Read the key line, which must come first for an unqueued client.
        async fn take_key(&mut self) {
            let line = self.line().await.unwrap();
            assert!(ControlLine::parse(&line).is_none(), "expected key, got {line}");
            self.cipher = Some(Cipher::from_key_string(&line).unwrap());
        }

        fn cipher(&self) -> &Cipher {
            self.cipher.as_ref().unwrap()
        }

        async fn send_sealed(&mut self, frame: &str) -> String {
            let line = self.cipher().encrypt(frame).unwrap();
            write_line(&mut self.writer, &line).await.unwrap();
            line
        }

        async fn sealed(&mut self) -> String {
            let line = self.line().await.unwrap();
            self.cipher().decrypt(&line).unwrap()
        }

        async fn join(addr: SocketAddr, username: &str) -> Self {
            let mut client = Self::connect(addr).await;
            client.take_key().await;
            client
                .send_sealed(&format!("AUTH_REGISTER:{username}:secret"))
                .await;
            assert_eq!(client.sealed().await, AUTH_SUCCESS);
            client
        }

        async fn silent(&mut self) -> bool {
            timeout(QUIET, self.reader.next_line()).await.is_err()
        }
    }

    #[tokio::test]
    async fn fourth_client_waits_for_a_free_slot() {
        let h = start(3, None).await;
        let mut first = TestClient::connect(h.addr).await;
        first.take_key().await;
        let mut others = Vec::new();
        for _ in 0..2 {
            let mut c = TestClient::connect(h.addr).await;
            c.take_key().await;
            others.push(c);
        }

        let mut fourth = TestClient::connect(h.addr).await;
        assert_eq!(
            fourth.line().await.unwrap(),
            ControlLine::Waiting(WAITING_NOTICE.into()).encode()
        );
        assert!(fourth.silent().await);
        assert_eq!(h.server.context().gate.queue_length(), 1);

        drop(first);
        assert_eq!(
            fourth.line().await.unwrap(),
            ControlLine::Connected(PROMOTED_NOTICE.into()).encode()
        );
        fourth.take_key().await;
        assert_eq!(h.server.context().gate.active_count(), 3);
    }

    #[tokio::test]
    async fn chat_reaches_everyone_but_the_sender() {
        let h = start(5, None).await;
        let mut alice = TestClient::join(h.addr, "alice").await;
        let mut bob = TestClient::join(h.addr, "bob").await;
        let mut carol = TestClient::join(h.addr, "carol").await;
        let mut lurker = TestClient::connect(h.addr).await;
        lurker.take_key().await;

        let sent = alice.send_sealed("[12:00:00] alice: hi all").await;
        assert_eq!(bob.line().await.unwrap(), sent);
        assert_eq!(carol.line().await.unwrap(), sent);
        assert!(alice.silent().await);
        assert!(lurker.silent().await);
    }

    #[tokio::test]
    async fn messages_from_one_sender_keep_their_order() {
        let h = start(3, None).await;
        let mut alice = TestClient::join(h.addr, "alice").await;
        let mut bob = TestClient::join(h.addr, "bob").await;

        for i in 0..20 {
            alice.send_sealed(&format!("alice: {i}")).await;
        }
        for i in 0..20 {
            assert_eq!(bob.sealed().await, format!("alice: {i}"));
        }
    }

    #[tokio::test]
    async fn uploads_are_relayed_and_stored() {
        let h = start(3, None).await;
        let mut alice = TestClient::join(h.addr, "alice").await;
        let mut bob = TestClient::join(h.addr, "bob").await;

        alice.send_sealed("FILE_START:notes.pdf:3").await;
        alice.send_sealed("FILE_CHUNK:0:1:AQID:notes.pdf").await;
        alice.send_sealed("FILE_END:notes.pdf").await;

        assert_eq!(bob.sealed().await, "FILE_START:notes.pdf:3");
        assert_eq!(bob.sealed().await, "FILE_CHUNK:0:1:AQID:notes.pdf");
        assert_eq!(bob.sealed().await, "FILE_END:notes.pdf");

        let stored = h.downloads().join("alice").join("notes.pdf");
        assert_eq!(std::fs::read(stored).unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn quit_frees_the_slot() {
        let h = start(1, None).await;
        let mut alice = TestClient::join(h.addr, "alice").await;
        alice.send_sealed("QUIT").await;
        assert!(alice.sealed().await.ends_with("Goodbye, alice!"));
        assert_eq!(alice.line().await, None);

        let mut next = TestClient::connect(h.addr).await;
        next.take_key().await;
    }

    #[tokio::test]
    async fn full_queue_refuses_connection() {
        let h = start(1, Some(1)).await;
        let mut held = TestClient::connect(h.addr).await;
        held.take_key().await;
        let mut queued = TestClient::connect(h.addr).await;
        assert!(queued.line().await.unwrap().starts_with("SERVER_WAITING:"));

        let mut refused = TestClient::connect(h.addr).await;
        assert!(refused.line().await.unwrap().starts_with("SERVER_FULL:"));
        assert_eq!(refused.line().await, None);
    }

    #[tokio::test]
    async fn shutdown_says_goodbye_and_drains_queue() {
        let h = start(1, None).await;
        let mut alice = TestClient::join(h.addr, "alice").await;
        let mut queued = TestClient::connect(h.addr).await;
        assert!(queued.line().await.unwrap().starts_with("SERVER_WAITING:"));

        h.server.shutdown().await;

        let farewell = alice.sealed().await;
        assert!(farewell.ends_with(&format!("Server: {SHUTDOWN_FAREWELL}")));
        assert_eq!(alice.line().await, None);
        assert_eq!(
            queued.line().await.unwrap(),
            ControlLine::Full(SHUTDOWN_NOTICE.into()).encode()
        );
        assert_eq!(h.server.context().registry.count().await, 0);

        // second call is a no-op
        h.server.shutdown().await;
    }
}
