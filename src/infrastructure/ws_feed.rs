//! Websocket implementation of the tick feed subscription.
//!
//! The feed service multiplexes the options and underlying channels over one
//! websocket. After connecting we send a subscribe frame and receive
//! envelopes of the form `{"channel": "<name>", "data": {...}}`; the data
//! payload is forwarded untouched to the ingest loop.

use crate::domain::ports::{ChannelMessage, TickChannel, TickStream};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc::{self, Receiver};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info};

const FEED_QUEUE_CAPACITY: usize = 1024;

pub struct WebSocketTickStream {
    url: String,
    options_channel: String,
    underlying_channel: String,
}

impl WebSocketTickStream {
    pub fn new(url: String, options_channel: String, underlying_channel: String) -> Self {
        Self { url, options_channel, underlying_channel }
    }
}

#[async_trait]
impl TickStream for WebSocketTickStream {
    async fn subscribe(&self) -> Result<Receiver<ChannelMessage>> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to tick feed at {}", self.url))?;
        info!("Connected to tick feed at {}", self.url);

        let (mut write, mut read) = ws_stream.split();
        let subscribe_frame = json!({
            "action": "subscribe",
            "channels": [self.options_channel, self.underlying_channel],
        });
        write
            .send(Message::Text(subscribe_frame.to_string().into()))
            .await
            .context("Failed to send subscribe frame")?;

        let (tx, rx) = mpsc::channel(FEED_QUEUE_CAPACITY);
        let options_channel = self.options_channel.clone();
        let underlying_channel = self.underlying_channel.clone();

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        let Some(message) =
                            route_envelope(text.as_str(), &options_channel, &underlying_channel)
                        else {
                            continue;
                        };
                        if tx.send(message).await.is_err() {
                            // Ingest side dropped the subscription.
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if write.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        info!("Tick feed closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Tick feed read error: {e}");
                        break;
                    }
                }
            }
            // Dropping tx ends the receiver; the ingest loop resubscribes.
        });

        Ok(rx)
    }
}

fn route_envelope(
    raw: &str,
    options_channel: &str,
    underlying_channel: &str,
) -> Option<ChannelMessage> {
    let envelope: Value = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(e) => {
            debug!("Skipping unparseable feed frame: {e}");
            return None;
        }
    };
    let channel = envelope.get("channel").and_then(Value::as_str)?;
    let data = envelope.get("data")?;

    let channel = if channel == options_channel {
        TickChannel::Options
    } else if channel == underlying_channel {
        TickChannel::Underlying
    } else {
        debug!("Ignoring message on unknown channel {channel}");
        return None;
    };
    Some(ChannelMessage { channel, payload: data.to_string() })
}
