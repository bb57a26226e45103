use coinwatch_data::{
    protocol::Frame, refresh::RefreshLoop, registry::ConnectionRegistry, session::Session,
};
use futures::{SinkExt, StreamExt};
use std::{net::SocketAddr, sync::Arc};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{mpsc, watch},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

/// Accept live WebSocket clients until `shutdown` changes.
pub async fn serve(
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    refresh: Arc<RefreshLoop>,
    mut shutdown: watch::Receiver<bool>,
) {
    if let Ok(addr) = listener.local_addr() {
        info!("WebSocket server listening on ws://{}", addr);
    }

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    debug!("New WebSocket connection from {}", peer_addr);
                    tokio::spawn(handle_client(
                        stream,
                        peer_addr,
                        registry.clone(),
                        refresh.clone(),
                    ));
                }
                Err(e) => warn!("Failed to accept WebSocket connection: {}", e),
            },
            _ = shutdown.changed() => {
                info!("WebSocket server shutting down");
                break;
            }
        }
    }
}

/// Handle individual WebSocket client connection
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    refresh: Arc<RefreshLoop>,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    // Registry pushes frames in order, the writer drains them onto the socket
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    let session = match Session::connect(registry, refresh, Arc::new(tx)) {
        Ok(session) => session,
        Err(e) => {
            warn!("Failed to register {}: {}", peer_addr, e);
            return;
        }
    };
    let id = session.id();
    info!(%id, %peer_addr, "WebSocket client registered");

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = frame.as_str().to_owned();
            if ws_sender.send(Message::text(text)).await.is_err() {
                break;
            }
        }
        if let Err(e) = ws_sender.close().await {
            debug!("Failed to close WebSocket for {}: {}", peer_addr, e);
        }
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Text(text)) => {
                    session.handle_text(text.as_str());
                }
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    debug!("Received ping from {}", peer_addr);
                }
                Err(e) => {
                    debug!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
        session.close();
    });

    // Whichever half finishes first tears down the other
    tokio::select! {
        _ = &mut send_task => {
            recv_task.abort();
        }
        _ = &mut recv_task => {
            send_task.abort();
        }
    }

    info!(%id, %peer_addr, "WebSocket connection closed");
}
