//! Websocket endpoint exposing the fan-out hub to streaming clients.
//!
//! One writer task per connected client drains that client's hub queue into
//! the socket. Client frames are only read for ping/close handling.

use crate::infrastructure::hub::FanoutHub;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

pub struct StreamListener {
    hub: Arc<FanoutHub>,
    listen_addr: String,
}

impl StreamListener {
    pub fn new(hub: Arc<FanoutHub>, listen_addr: String) -> Self {
        Self { hub, listen_addr }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let listener = match TcpListener::bind(&self.listen_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                error!("Failed to bind stream listener on {}: {e}", self.listen_addr);
                return;
            }
        };
        info!("Stream listener accepting on {}", self.listen_addr);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!("Stream client connecting from {peer}");
                        let hub = self.hub.clone();
                        let shutdown = shutdown.clone();
                        tokio::spawn(handle_client(hub, stream, shutdown));
                    }
                    Err(e) => {
                        error!("Stream listener accept error: {e}");
                    }
                }
            }
        }
        info!("Stream listener stopped");
    }
}

async fn handle_client(hub: Arc<FanoutHub>, stream: TcpStream, mut shutdown: watch::Receiver<bool>) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!("Websocket handshake failed: {e}");
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let subscriber = hub.subscribe();
    let subscriber_id = subscriber.id;
    let mut queue = subscriber.receiver;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
            }
            payload = queue.recv() => match payload {
                Some(payload) => {
                    if write.send(Message::Text(payload.into())).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            frame = read.next() => match frame {
                Some(Ok(Message::Ping(payload))) => {
                    if write.send(Message::Pong(payload)).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!("Stream client read error: {e}");
                    break;
                }
                Some(Ok(_)) => {}
            }
        }
    }

    hub.unsubscribe(subscriber_id);
    debug!("Stream client {subscriber_id} disconnected");
}
