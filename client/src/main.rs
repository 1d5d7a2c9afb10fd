use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use confab_client::{Connection, ConnectionWriter};
use confab_protocol::{Body, Envelope};

const CHUNK_SIZE: usize = 64 * 1024;

/// Terminal client for the Confab chat server
#[derive(Parser, Debug)]
#[command(name = "confab", version, about)]
struct Cli {
    /// Server address
    #[arg(long, default_value = "127.0.0.1:9400")]
    server: String,

    /// Username to register
    #[arg(long)]
    username: String,

    /// Accept incoming file offers without asking
    #[arg(long)]
    accept_files: bool,

    /// Directory for received files
    #[arg(long, default_value = "downloads")]
    download_dir: PathBuf,
}

/// A file being written to disk as its chunks arrive.
struct IncomingFile {
    path: PathBuf,
    file: fs::File,
    received: u64,
    total: u64,
}

/// State shared between the receive loop and the input loop.
struct Shared {
    writer: Mutex<ConnectionWriter>,
    /// Outgoing payloads waiting for the recipient's accept
    outgoing: Mutex<HashMap<Uuid, (String, Vec<u8>)>>,
    /// Offers waiting for /accept or /reject
    offers: Mutex<HashMap<Uuid, (String, String, u64)>>,
    /// Accepted transfers currently being written
    incoming: Mutex<HashMap<Uuid, IncomingFile>>,
    accept_files: bool,
    download_dir: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("confab_client=warn")),
        )
        .init();

    let cli = Cli::parse();

    let mut conn = Connection::connect(&cli.server)
        .await
        .with_context(|| format!("failed to reach {}", cli.server))?;
    let users = conn.login(&cli.username).await?;
    println!("connected as {} — online: {}", cli.username, users.join(", "));

    let (mut reader, writer) = conn.into_split();
    let shared = Arc::new(Shared {
        writer: Mutex::new(writer),
        outgoing: Mutex::new(HashMap::new()),
        offers: Mutex::new(HashMap::new()),
        incoming: Mutex::new(HashMap::new()),
        accept_files: cli.accept_files,
        download_dir: cli.download_dir,
    });

    let recv_state = Arc::clone(&shared);
    let recv_task = tokio::spawn(async move {
        loop {
            match reader.recv().await {
                Ok(envelope) => {
                    if let Err(e) = handle_incoming(&recv_state, envelope).await {
                        eprintln!("! {}", e);
                    }
                }
                Err(e) => {
                    eprintln!("! {}", e);
                    break;
                }
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim().to_string();
        if line.is_empty() {
            continue;
        }
        if line == "/quit" {
            let mut writer = shared.writer.lock().await;
            let _ = writer.send(Envelope::new(Body::Disconnect)).await;
            break;
        }
        if let Err(e) = handle_input(&shared, &line).await {
            eprintln!("! {}", e);
        }
    }

    recv_task.abort();
    Ok(())
}

/// React to one envelope from the server.
async fn handle_incoming(state: &Arc<Shared>, envelope: Envelope) -> Result<()> {
    let sender = envelope.sender.clone().unwrap_or_else(|| "server".to_string());

    match envelope.body {
        Body::PublicMessage { content } => println!("[{}] {}", sender, content),
        Body::PrivateMessage { content, .. } => println!("[{} → you] {}", sender, content),
        Body::SystemMessage { content } => println!("*** {}", content),
        Body::UserJoined { username } => println!("*** {} joined", username),
        Body::UserLeft { username } => println!("*** {} left", username),
        Body::UserListResponse { users } => println!("online: {}", users.join(", ")),

        Body::FileTransferRequest {
            transfer_id,
            file_name,
            total_size,
            ..
        } => {
            if state.accept_files {
                accept_offer(state, transfer_id, &sender, &file_name, total_size).await?;
            } else {
                println!(
                    "*** {} offers {} ({} bytes) — /accept {} or /reject {}",
                    sender, file_name, total_size, transfer_id, transfer_id
                );
                state
                    .offers
                    .lock()
                    .await
                    .insert(transfer_id, (sender, file_name, total_size));
            }
        }

        Body::FileTransferResponse {
            transfer_id,
            accepted,
        } => {
            let pending = state.outgoing.lock().await.remove(&transfer_id);
            match (pending, accepted) {
                (Some((file_name, data)), true) => {
                    println!("*** {} accepted {} — sending", sender, file_name);
                    let tx_state = Arc::clone(state);
                    tokio::spawn(async move {
                        if let Err(e) = send_chunks(&tx_state, transfer_id, data).await {
                            eprintln!("! transfer failed: {}", e);
                        }
                    });
                }
                (Some((file_name, _)), false) => {
                    println!("*** {} declined {}", sender, file_name);
                }
                (None, _) => println!("*** response for unknown transfer {}", transfer_id),
            }
        }

        Body::FileChunk {
            transfer_id, data, ..
        } => {
            let mut incoming = state.incoming.lock().await;
            if let Some(entry) = incoming.get_mut(&transfer_id) {
                entry.file.write_all(&data).await?;
                entry.received += data.len() as u64;
            }
        }

        Body::FileTransferComplete { transfer_id } => {
            if let Some(mut entry) = state.incoming.lock().await.remove(&transfer_id) {
                entry.file.flush().await?;
                println!(
                    "*** received {} ({} of {} bytes)",
                    entry.path.display(),
                    entry.received,
                    entry.total
                );
            }
        }

        Body::FileTransferCancelled { transfer_id, reason } => {
            state.outgoing.lock().await.remove(&transfer_id);
            state.offers.lock().await.remove(&transfer_id);
            if let Some(entry) = state.incoming.lock().await.remove(&transfer_id) {
                let _ = fs::remove_file(&entry.path).await;
            }
            println!("*** transfer {} cancelled: {}", transfer_id, reason);
        }

        Body::Error { code, message } => eprintln!("! {}: {}", code, message),

        _ => {}
    }
    Ok(())
}

/// Dispatch one line of user input.
async fn handle_input(state: &Arc<Shared>, line: &str) -> Result<()> {
    if let Some(rest) = line.strip_prefix("/msg ") {
        let (recipient, content) = rest
            .split_once(' ')
            .context("usage: /msg <user> <message>")?;
        send(state, Envelope::stamped(Body::PrivateMessage {
            recipient: recipient.to_string(),
            content: content.to_string(),
        }))
        .await
    } else if line == "/list" {
        send(state, Envelope::new(Body::UserListRequest)).await
    } else if let Some(rest) = line.strip_prefix("/send ") {
        let (recipient, path) = rest.split_once(' ').context("usage: /send <user> <path>")?;
        offer_file(state, recipient, Path::new(path)).await
    } else if let Some(rest) = line.strip_prefix("/accept ") {
        let transfer_id: Uuid = rest.trim().parse().context("bad transfer id")?;
        let offer = state.offers.lock().await.remove(&transfer_id);
        let (from, file_name, total) = offer.context("no such offer")?;
        accept_offer(state, transfer_id, &from, &file_name, total).await
    } else if let Some(rest) = line.strip_prefix("/reject ") {
        let transfer_id: Uuid = rest.trim().parse().context("bad transfer id")?;
        state
            .offers
            .lock()
            .await
            .remove(&transfer_id)
            .context("no such offer")?;
        send(state, Envelope::new(Body::FileTransferResponse {
            transfer_id,
            accepted: false,
        }))
        .await
    } else if line.starts_with('/') {
        anyhow::bail!("commands: /msg /list /send /accept /reject /quit");
    } else {
        send(state, Envelope::stamped(Body::PublicMessage {
            content: line.to_string(),
        }))
        .await
    }
}

async fn send(state: &Arc<Shared>, envelope: Envelope) -> Result<()> {
    let mut writer = state.writer.lock().await;
    writer.send(envelope).await?;
    Ok(())
}

/// Open the destination file and tell the server we accept.
async fn accept_offer(
    state: &Arc<Shared>,
    transfer_id: Uuid,
    from: &str,
    file_name: &str,
    total: u64,
) -> Result<()> {
    fs::create_dir_all(&state.download_dir).await?;
    // Only the final path component; offered names are untrusted.
    let safe_name = Path::new(file_name)
        .file_name()
        .context("offered file name is empty")?;
    let path = state.download_dir.join(safe_name);
    let file = fs::File::create(&path)
        .await
        .with_context(|| format!("cannot create {}", path.display()))?;

    state.incoming.lock().await.insert(
        transfer_id,
        IncomingFile {
            path: path.clone(),
            file,
            received: 0,
            total,
        },
    );
    println!("*** accepting {} from {} into {}", file_name, from, path.display());
    send(state, Envelope::new(Body::FileTransferResponse {
        transfer_id,
        accepted: true,
    }))
    .await
}

/// Read the file and offer it; chunks flow once the recipient accepts.
async fn offer_file(state: &Arc<Shared>, recipient: &str, path: &Path) -> Result<()> {
    let data = fs::read(path)
        .await
        .with_context(|| format!("cannot read {}", path.display()))?;
    anyhow::ensure!(!data.is_empty(), "refusing to offer an empty file");

    let file_name = path
        .file_name()
        .context("path has no file name")?
        .to_string_lossy()
        .to_string();
    let transfer_id = Uuid::new_v4();
    let total_size = data.len() as u64;

    state
        .outgoing
        .lock()
        .await
        .insert(transfer_id, (file_name.clone(), data));
    println!("*** offering {} ({} bytes) to {}", file_name, total_size, recipient);
    send(state, Envelope::new(Body::FileTransferRequest {
        transfer_id,
        recipient: recipient.to_string(),
        file_name,
        total_size,
    }))
    .await
}

/// Stream an accepted file in sequence-numbered chunks.
async fn send_chunks(state: &Arc<Shared>, transfer_id: Uuid, data: Vec<u8>) -> Result<()> {
    for (sequence, chunk) in data.chunks(CHUNK_SIZE).enumerate() {
        send(state, Envelope::new(Body::FileChunk {
            transfer_id,
            sequence: sequence as u64,
            data: chunk.to_vec(),
        }))
        .await?;
    }
    send(state, Envelope::new(Body::FileTransferComplete { transfer_id })).await?;
    println!("*** transfer {} sent", transfer_id);
    Ok(())
}
