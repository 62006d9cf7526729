//! `rchat <username>`: join a chat server from the terminal.
//!
//! Connects (waiting in the server's queue if it is full), prompts for the
//! password, then turns stdin lines into chat messages while a printer task
//! renders everything the server sends. `/file <path>` uploads a file and
//! `/quit` leaves.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use dialoguer::Password;
use rchat_client::{ChatClient, ChatError, ClientEvent, ConnectConfig};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::expand_tilde;

/// Password attempts before giving up.
const MAX_AUTH_ATTEMPTS: usize = 3;

/// Everything needed to join a server.
#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub register: bool,
    pub download_dir: PathBuf,
}

/// One line typed by the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Quit,
    File(PathBuf),
    Chat(String),
    Empty,
}

impl Input {
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            Input::Empty
        } else if trimmed == "/quit" {
            Input::Quit
        } else if let Some(path) = trimmed.strip_prefix("/file ") {
            Input::File(PathBuf::from(path.trim()))
        } else {
            Input::Chat(line.trim_end().to_string())
        }
    }
}

/// Terminal text for an event, or `None` for events that print nothing.
pub fn render(event: &ClientEvent) -> Option<String> {
    match event {
        ClientEvent::Waiting(reason) | ClientEvent::Admitted(reason) => Some(format!("* {reason}")),
        ClientEvent::Chat(line) => Some(line.clone()),
        ClientEvent::DownloadProgress { .. } => None,
        ClientEvent::DownloadComplete { file_name, path } => Some(format!(
            "* received {file_name}, saved to {}",
            path.display()
        )),
        ClientEvent::UploadProgress { file_name, percent } => {
            Some(format!("* sending {file_name}: {percent}%"))
        }
        ClientEvent::UploadComplete { file_name, bytes } => {
            Some(format!("* sent {file_name} ({bytes} bytes)"))
        }
        ClientEvent::TransferError { file_name, message } => {
            Some(format!("* transfer of {file_name} failed: {message}"))
        }
        ClientEvent::Disconnected => Some("* disconnected from server".to_string()),
    }
}

pub async fn run(opts: ChatOptions) -> Result<()> {
    let addr = format!("{}:{}", opts.host, opts.port);
    info!(addr = %addr, username = %opts.username, "connecting");

    let (events, mut events_rx) = mpsc::unbounded_channel();
    let (disconnected_tx, mut disconnected) = oneshot::channel();
    let printer = tokio::spawn(async move {
        let mut disconnected_tx = Some(disconnected_tx);
        while let Some(event) = events_rx.recv().await {
            if let Some(text) = render(&event) {
                println!("{text}");
            }
            if event == ClientEvent::Disconnected {
                if let Some(tx) = disconnected_tx.take() {
                    let _ = tx.send(());
                }
            }
        }
    });

    let config = ConnectConfig {
        download_dir: opts.download_dir.clone(),
        ..Default::default()
    };
    let mut client = match ChatClient::connect(addr.as_str(), config, events).await {
        Ok(client) => client,
        Err(ChatError::ServerFull(reason)) => bail!("server refused the connection: {reason}"),
        Err(e) => return Err(e).with_context(|| format!("failed to connect to {addr}")),
    };
    if client.was_queued() {
        debug!("admitted after waiting in queue");
    }

    authenticate(&mut client, &opts).await?;
    client
        .announce_join()
        .await
        .context("failed to announce join")?;
    println!("* joined as {}. Type /file <path> to send a file, /quit to leave.", opts.username);

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut server_gone = false;
    loop {
        let line = tokio::select! {
            line = stdin.next_line() => line.context("failed to read stdin")?,
            _ = &mut disconnected => {
                server_gone = true;
                break;
            }
        };
        let Some(line) = line else { break };

        match Input::parse(&line) {
            Input::Empty => {}
            Input::Quit => break,
            Input::File(path) => {
                let path = expand_tilde(&path.to_string_lossy());
                if let Err(e) = client.send_file(&path) {
                    println!("* cannot send {}: {e}", path.display());
                }
            }
            Input::Chat(text) => client.send_chat(&text).await.context("failed to send")?,
        }
    }

    if server_gone {
        drop(client);
    } else {
        client.quit().await.context("failed to leave cleanly")?;
    }
    // ends once the last event sender is gone
    let _ = printer.await;
    Ok(())
}

async fn authenticate(client: &mut ChatClient, opts: &ChatOptions) -> Result<()> {
    for attempt in 1..=MAX_AUTH_ATTEMPTS {
        let password = prompt_password(&opts.username, opts.register && attempt == 1).await?;
        let result = if opts.register {
            client.register(&opts.username, &password).await
        } else {
            client.login(&opts.username, &password).await
        };
        if result.context("authentication failed")? {
            return Ok(());
        }
        if opts.register {
            println!("* registration failed: the name may be taken or invalid");
        } else {
            println!("* invalid username or password");
        }
    }
    bail!("authentication failed after {MAX_AUTH_ATTEMPTS} attempts")
}

async fn prompt_password(username: &str, confirm: bool) -> Result<String> {
    let prompt = format!("Password for {username}");
    tokio::task::spawn_blocking(move || {
        let mut input = Password::new().with_prompt(prompt);
        if confirm {
            input = input.with_confirmation("Confirm password", "Passwords do not match");
        }
        input.interact()
    })
    .await
    .context("password prompt task failed")?
    .context("failed to read password")
}
