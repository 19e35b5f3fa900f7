//! Server network layer accepting WebSocket connections

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::config::Config;
use crate::coordinator::CoordinatorHandle;

/// Accepts connections and runs one task per WebSocket
pub struct Server {
    listener: TcpListener,
    coordinator: CoordinatorHandle,
    outbox_capacity: usize,
}

impl Server {
    pub async fn bind(config: &Config, coordinator: CoordinatorHandle) -> io::Result<Self> {
        let listener = TcpListener::bind(config.address()).await?;
        info!("Server listening on {}", listener.local_addr()?);
        Ok(Self {
            listener,
            coordinator,
            outbox_capacity: config.outbox_capacity.max(1),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept loop; runs until its task is dropped.
    pub async fn run(self) -> io::Result<()> {
        info!("Server started successfully");

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let coordinator = self.coordinator.clone();
                    let outbox_capacity = self.outbox_capacity;
                    tokio::spawn(async move {
                        handle_connection(stream, addr, coordinator, outbox_capacity).await;
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        }
    }
}

/// Drives one connection from handshake to cleanup.
///
/// The coordinator owns the only sender of the outbox, so the writer task
/// ends when the coordinator forgets the connection. The reader stops as
/// soon as that happens, and the coordinator is told about the closure only
/// after the read loop ends.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    coordinator: CoordinatorHandle,
    outbox_capacity: usize,
) {
    let ws_stream = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!("WebSocket handshake with {} failed: {}", addr, e);
            return;
        }
    };

    let (mut write, mut read) = ws_stream.split();
    let (tx, mut rx) = mpsc::channel::<String>(outbox_capacity);

    let conn = match coordinator.open(addr, tx).await {
        Some(conn) => conn,
        None => {
            let frame = CloseFrame {
                code: CloseCode::Again,
                reason: "server full".into(),
            };
            if let Err(e) = write.send(Message::Close(Some(frame))).await {
                debug!("Failed to refuse {}: {}", addr, e);
            }
            return;
        }
    };

    let mut writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if let Err(e) = write.send(Message::Text(text)).await {
                debug!("Write to {} failed: {}", addr, e);
                break;
            }
        }
        let _ = write.close().await;
    });
    let mut writer_done = false;

    loop {
        tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    // The response is queued on the outbox by the coordinator.
                    coordinator.submit(conn, text).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    warn!("Ignoring binary frame from connection {}", conn);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Connection {} read error: {}", conn, e);
                    break;
                }
            },
            result = &mut writer => {
                writer_done = true;
                if let Err(e) = result {
                    error!("Writer task for connection {} failed: {}", conn, e);
                }
                debug!("Connection {} can no longer be written to", conn);
                break;
            }
        }
    }

    coordinator.close(conn).await;
    if !writer_done {
        if let Err(e) = writer.await {
            error!("Writer task for connection {} failed: {}", conn, e);
        }
    }
}
