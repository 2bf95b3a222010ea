//! Tick ingest loop: drives the aggregator from the feed subscription.
//!
//! One subscriber per process. Malformed messages are logged and skipped;
//! a dropped connection is retried after five seconds; shutdown drains the
//! aggregator through `flush_all`.

use crate::application::aggregator::FoAggregator;
use crate::domain::ports::{ChannelMessage, TickChannel, TickStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

pub struct TickIngestLoop {
    stream: Arc<dyn TickStream>,
    aggregator: Arc<FoAggregator>,
    shutdown: watch::Receiver<bool>,
}

impl TickIngestLoop {
    pub fn new(
        stream: Arc<dyn TickStream>,
        aggregator: Arc<FoAggregator>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self { stream, aggregator, shutdown }
    }

    pub async fn run(mut self) {
        info!("Tick ingest loop started");
        while !*self.shutdown.borrow() {
            match self.stream.subscribe().await {
                Ok(mut rx) => {
                    info!("Subscribed to tick feed");
                    loop {
                        tokio::select! {
                            _ = self.shutdown.changed() => {
                                if *self.shutdown.borrow() {
                                    break;
                                }
                            }
                            message = rx.recv() => match message {
                                Some(message) => self.dispatch(message).await,
                                None => {
                                    error!("Tick feed stream ended, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    error!("Tick feed subscription failed: {e:#}");
                }
            }

            if *self.shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = self.shutdown.changed() => {}
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
            }
        }

        info!("Tick ingest loop stopping, flushing aggregator");
        self.aggregator.flush_all().await;
    }

    async fn dispatch(&self, message: ChannelMessage) {
        match message.channel {
            TickChannel::Options => match serde_json::from_str(&message.payload) {
                Ok(tick) => self.aggregator.handle_option(tick).await,
                Err(e) => debug!("Skipping malformed option tick: {e}"),
            },
            TickChannel::Underlying => match serde_json::from_str(&message.payload) {
                Ok(tick) => self.aggregator.handle_underlying(tick).await,
                Err(e) => debug!("Skipping malformed underlying tick: {e}"),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::aggregator::AggregatorSettings;
    use crate::domain::market::{ExpiryMetricsRow, StrikeRow, UnderlyingBarRow};
    use crate::domain::repositories::MarketDataRepository;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::NaiveDate;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct RecordingRepository {
        strike_rows: Mutex<Vec<StrikeRow>>,
    }

    #[async_trait]
    impl MarketDataRepository for RecordingRepository {
        async fn upsert_strike_rows(&self, rows: &[StrikeRow]) -> Result<()> {
            self.strike_rows.lock().unwrap().extend_from_slice(rows);
            Ok(())
        }
        async fn upsert_expiry_metrics(&self, _rows: &[ExpiryMetricsRow]) -> Result<()> {
            Ok(())
        }
        async fn upsert_underlying_bars(&self, _rows: &[UnderlyingBarRow]) -> Result<()> {
            Ok(())
        }
        async fn fetch_strike_rows(
            &self,
            _symbol: &str,
            _timeframe: &str,
            _expiries: &[NaiveDate],
            _time_range: Option<(i64, i64)>,
        ) -> Result<Vec<StrikeRow>> {
            Ok(vec![])
        }
        async fn list_expiries(&self, _symbol: &str) -> Result<Vec<NaiveDate>> {
            Ok(vec![])
        }
        async fn next_expiries(&self, _symbol: &str, _limit: i64) -> Result<Vec<NaiveDate>> {
            Ok(vec![])
        }
    }

    struct ScriptedStream {
        messages: Mutex<Option<Vec<ChannelMessage>>>,
    }

    #[async_trait]
    impl TickStream for ScriptedStream {
        async fn subscribe(&self) -> Result<mpsc::Receiver<ChannelMessage>> {
            let (tx, rx) = mpsc::channel(16);
            if let Some(messages) = self.messages.lock().unwrap().take() {
                for message in messages {
                    tx.try_send(message).unwrap();
                }
            }
            // Sender dropped here: the stream ends after the scripted batch.
            Ok(rx)
        }
    }

    #[tokio::test]
    async fn test_ingest_dispatches_and_flushes_on_shutdown() {
        let repo = Arc::new(RecordingRepository::default());
        let aggregator = Arc::new(FoAggregator::new(
            repo.clone(),
            None,
            &AggregatorSettings::default(),
        ));
        let stream = Arc::new(ScriptedStream {
            messages: Mutex::new(Some(vec![
                ChannelMessage {
                    channel: TickChannel::Options,
                    payload: r#"{"symbol":"NIFTY","expiry":"2024-11-07","strike":24000,
                                 "type":"CE","ts":1699356600,"volume":100,"oi":5}"#
                        .to_string(),
                },
                ChannelMessage {
                    channel: TickChannel::Options,
                    payload: "{not json".to_string(),
                },
            ])),
        });

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ingest = TickIngestLoop::new(stream, aggregator, shutdown_rx);
        let handle = tokio::spawn(ingest.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();

        // The valid tick was aggregated and flushed on shutdown; the
        // malformed one was skipped.
        let rows = repo.strike_rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].call.volume, 100.0);
    }
}
