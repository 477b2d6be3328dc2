/// ChatSync - replay inbound frames through a session and print the conversation list
use chatsync_core::{ChatSession, OfflineTransport, SessionConfig};
use std::env;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr so stdout stays valid JSON
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info"))
        )
        .with_writer(std::io::stderr)
        .init();

    let args: Vec<String> = env::args().collect();
    let config = SessionConfig::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let session = ChatSession::new(config, Arc::new(OfflineTransport));
    info!("Replaying frames from stdin as {}", session.local_user());

    let (tx, rx) = session.inbound_channel();
    let dispatch = session.spawn_inbound(rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut read = 0usize;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if tx.send(line.as_bytes().to_vec()).await.is_err() {
            warn!("Dispatch task stopped early");
            break;
        }
        read += 1;
    }
    drop(tx);
    dispatch.await?;

    info!(
        "Replayed {} frames, {} unread",
        read,
        session.total_unread().await
    );
    println!("{}", serde_json::to_string_pretty(&session.conversations().await)?);

    session.logout().await;
    Ok(())
}
