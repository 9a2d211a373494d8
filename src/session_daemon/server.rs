//! TCP transport for the voting service.
//!
//! Newline-delimited JSON. Each connection gets a reader loop feeding
//! [`VotingService::handle`] and a writer task draining the connection's
//! outbox, so broadcasts never wait on a slow socket.

use super::protocol::{ClientMessage, ServerMessage};
use super::routing::ConnectionId;
use super::service::VotingService;
use anyhow::{Context, Result};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Accepts connections until `shutdown_tx` fires.
///
/// Also runs the maintenance sweep every `sweep_interval`.
pub async fn serve(
    listener: TcpListener,
    service: VotingService,
    sweep_interval: Duration,
    shutdown_tx: broadcast::Sender<()>,
) -> Result<()> {
    let local_addr = listener
        .local_addr()
        .context("Failed to read listener address")?;
    info!(addr = %local_addr, "quickpoll listening");

    let sweeper = spawn_sweeper(service.clone(), sweep_interval, shutdown_tx.subscribe());
    let mut shutdown_rx = shutdown_tx.subscribe();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "connection accepted");
                        let service = service.clone();
                        let shutdown_rx = shutdown_tx.subscribe();
                        tokio::spawn(async move {
                            handle_connection(stream, service, shutdown_rx).await;
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                }
            }
            _ = shutdown_rx.recv() => {
                info!("shutting down");
                break;
            }
        }
    }

    sweeper.abort();
    service.shutdown().await;
    Ok(())
}

fn spawn_sweeper(
    service: VotingService,
    every: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        // The first tick completes immediately
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    service.sweep().await;
                }
                _ = shutdown_rx.recv() => break,
            }
        }
    })
}

async fn handle_connection(
    stream: TcpStream,
    service: VotingService,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let (reader, writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    let (outbox, inbox) = mpsc::unbounded_channel();
    // Queued ahead of registration so it is always the first line out
    let _ = outbox.send(ServerMessage::hello());
    let conn = service.connect(outbox).await;
    let writer_task = tokio::spawn(write_messages(writer, inbox));

    let mut buf = Vec::new();
    loop {
        buf.clear();
        tokio::select! {
            result = reader.read_until(b'\n', &mut buf) => {
                match result {
                    Ok(0) => break, // EOF
                    Ok(_) => handle_line(&service, conn, &buf).await,
                    Err(e) => {
                        debug!(conn, error = %e, "read failed");
                        break;
                    }
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }

    // Dropping the routing entry closes the outbox, which ends the writer
    service.disconnect(conn).await;
    let _ = writer_task.await;
    debug!(conn, "connection closed");
}

/// Decodes one raw line. Anything that is not a UTF-8 JSON client message
/// is answered with "Invalid message" and the connection stays open.
async fn handle_line(service: &VotingService, conn: ConnectionId, raw: &[u8]) {
    let parsed = std::str::from_utf8(raw)
        .map_err(|e| e.to_string())
        .map(str::trim)
        .and_then(|line| {
            if line.is_empty() {
                return Ok(None);
            }
            serde_json::from_str::<ClientMessage>(line)
                .map(Some)
                .map_err(|e| e.to_string())
        });

    match parsed {
        Ok(Some(message)) => service.handle(conn, message).await,
        Ok(None) => {}
        Err(e) => {
            debug!(conn, error = %e, "unparseable message");
            service
                .routing()
                .send(conn, ServerMessage::action_error("Invalid message"))
                .await;
        }
    }
}

async fn write_messages(
    mut writer: tokio::net::tcp::OwnedWriteHalf,
    mut inbox: mpsc::UnboundedReceiver<ServerMessage>,
) {
    while let Some(message) = inbox.recv().await {
        let json = match serde_json::to_string(&message) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "failed to serialize message");
                continue;
            }
        };
        if writer
            .write_all(format!("{json}\n").as_bytes())
            .await
            .is_err()
        {
            break;
        }
    }
    let _ = writer.shutdown().await;
}

#[cfg(test)]
#[path = "tests/server_tests.rs"]
mod server_tests;
