//! F&O tick aggregator: the single writer for all bucket state.
//!
//! Options and underlying ticks fold into per-timeframe buckets; once a
//! bucket's boundary plus the flush lag has passed, the bucket is removed
//! from the live map under the lock, materialized into rows, persisted
//! (bounded by a semaphore) and broadcast to the hub. A bucket is flushed
//! exactly once; persistence failures drop the batch.

use crate::domain::liquidity::analyze_depth;
use crate::domain::market::{
    ExpiryMetricsRow, OptionSide, OptionTick, StrikeBucket, StrikeKey, StrikePair, StrikeRow,
    UnderlyingBar, UnderlyingBarRow, UnderlyingTick, bucket_start, normalize_timeframe,
    parse_expiry, timeframe_seconds,
};
use crate::domain::repositories::MarketDataRepository;
use crate::infrastructure::hub::FanoutHub;
use chrono::{NaiveDate, Utc};
use serde_json::{Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tracing::{error, warn};

const BAR_SOURCE: &str = "fo_stream";

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub timeframes: Vec<String>,
    pub persist_timeframes: Vec<String>,
    pub flush_lag_seconds: i64,
    pub persist_concurrency: usize,
}

impl Default for AggregatorSettings {
    fn default() -> Self {
        Self {
            timeframes: vec!["1min".to_string()],
            persist_timeframes: vec!["1min".to_string()],
            flush_lag_seconds: 5,
            persist_concurrency: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct BucketKey {
    symbol: String,
    expiry: NaiveDate,
    bucket_start: i64,
}

#[derive(Default)]
struct AggregatorState {
    // timeframe label -> bucket key -> live bucket
    buffers: HashMap<String, HashMap<BucketKey, StrikeBucket>>,
    underlying_buffers: HashMap<String, HashMap<(String, i64), UnderlyingBar>>,
    last_underlying: HashMap<String, f64>,
}

struct FlushItem {
    timeframe: String,
    seconds: i64,
    key: BucketKey,
    bucket: StrikeBucket,
    // last_underlying at collection time; the lock covers this read
    underlying_fallback: Option<f64>,
}

struct UnderlyingFlushItem {
    timeframe: String,
    symbol: String,
    bucket_start: i64,
    bar: UnderlyingBar,
}

pub struct FoAggregator {
    repository: Arc<dyn MarketDataRepository>,
    hub: Option<Arc<FanoutHub>>,
    // sorted by bucket width ascending
    timeframes: Vec<(String, i64)>,
    persist_timeframes: HashSet<String>,
    flush_lag: i64,
    state: Mutex<AggregatorState>,
    persist_sem: Semaphore,
}

impl FoAggregator {
    pub fn new(
        repository: Arc<dyn MarketDataRepository>,
        hub: Option<Arc<FanoutHub>>,
        settings: &AggregatorSettings,
    ) -> Self {
        let persist_timeframes: HashSet<String> = settings
            .persist_timeframes
            .iter()
            .map(|tf| normalize_timeframe(tf))
            .collect();

        let mut timeframes: Vec<(String, i64)> = Vec::new();
        let configured: HashSet<String> = settings
            .timeframes
            .iter()
            .map(|tf| normalize_timeframe(tf))
            .chain(persist_timeframes.iter().cloned())
            .collect();
        for label in configured {
            match timeframe_seconds(&label) {
                Ok(seconds) => timeframes.push((label, seconds)),
                Err(_) => warn!("Skipping unsupported timeframe {}", label),
            }
        }
        timeframes.sort_by_key(|(_, seconds)| *seconds);

        let mut state = AggregatorState::default();
        for (label, _) in &timeframes {
            state.buffers.insert(label.clone(), HashMap::new());
            state.underlying_buffers.insert(label.clone(), HashMap::new());
        }

        Self {
            repository,
            hub,
            timeframes,
            persist_timeframes,
            flush_lag: settings.flush_lag_seconds.max(1),
            state: Mutex::new(state),
            persist_sem: Semaphore::new(settings.persist_concurrency.max(1)),
        }
    }

    pub fn timeframe_labels(&self) -> Vec<String> {
        self.timeframes.iter().map(|(label, _)| label.clone()).collect()
    }

    /// Fold an option tick into every configured timeframe, then sweep.
    /// Mock ticks and ticks with an unusable expiry, type or strike are
    /// discarded without error.
    pub async fn handle_option(&self, tick: OptionTick) {
        if tick.is_mock {
            return;
        }
        let Some(expiry) = tick.expiry.as_deref().and_then(parse_expiry) else {
            return;
        };
        let Some(side) = tick.option_type.as_deref().and_then(OptionSide::parse) else {
            return;
        };
        let Some(strike) = tick.strike else {
            return;
        };
        let Some(symbol) = tick.symbol.clone().filter(|s| !s.is_empty()) else {
            return;
        };
        let ts = tick.effective_ts(Utc::now().timestamp());
        let strike_key = StrikeKey::from_price(strike);

        let liquidity = tick.depth.as_ref().and_then(|depth| {
            let last_price = tick.last_traded_price();
            if last_price > 0.0 { analyze_depth(depth, last_price) } else { None }
        });

        let (flush, underlying_flush) = {
            let mut state = self.state.lock().expect("aggregator lock poisoned");
            let last_underlying = state.last_underlying.get(&symbol).copied();
            for (label, seconds) in &self.timeframes {
                let key = BucketKey {
                    symbol: symbol.clone(),
                    expiry,
                    bucket_start: bucket_start(ts, *seconds),
                };
                let bucket = state
                    .buffers
                    .get_mut(label)
                    .expect("buffer exists for configured timeframe")
                    .entry(key)
                    .or_default();
                if bucket.underlying_close.is_none() {
                    bucket.underlying_close = last_underlying;
                }
                let pair = bucket.strikes.entry(strike_key).or_default();
                pair.side_mut(side).add(&tick);
                if let Some(snapshot) = &liquidity {
                    pair.liquidity = Some(snapshot.clone());
                }
            }
            (self.collect_flush(&mut state, ts), Self::collect_underlying_flush_locked(&mut state, &self.timeframes, self.flush_lag, ts))
        };

        self.persist_underlying_bars(underlying_flush).await;
        self.persist_batches(flush).await;
    }

    /// Fold an underlying tick into the OHLCV buffers, cache the last price,
    /// then sweep.
    pub async fn handle_underlying(&self, tick: UnderlyingTick) {
        if tick.is_mock {
            return;
        }
        let Some(symbol) = tick.symbol.clone().filter(|s| !s.is_empty()) else {
            return;
        };
        let Some(close) = tick.close_price() else {
            return;
        };
        if !close.is_finite() {
            return;
        }
        let ts = tick.effective_ts(Utc::now().timestamp());
        let volume = tick.traded_volume();

        let (flush, underlying_flush) = {
            let mut state = self.state.lock().expect("aggregator lock poisoned");
            state.last_underlying.insert(symbol.clone(), close);
            for (label, seconds) in &self.timeframes {
                let key = (symbol.clone(), bucket_start(ts, *seconds));
                let buffer = state
                    .underlying_buffers
                    .get_mut(label)
                    .expect("buffer exists for configured timeframe");
                match buffer.get_mut(&key) {
                    Some(bar) => bar.update(close, volume),
                    None => {
                        buffer.insert(key, UnderlyingBar::seed(close, volume));
                    }
                }
            }
            (self.collect_flush(&mut state, ts), Self::collect_underlying_flush_locked(&mut state, &self.timeframes, self.flush_lag, ts))
        };

        self.persist_underlying_bars(underlying_flush).await;
        self.persist_batches(flush).await;
    }

    /// Drain every live bucket regardless of boundary. Shutdown safety net.
    pub async fn flush_all(&self) {
        let (flush, underlying_flush) = {
            let mut state = self.state.lock().expect("aggregator lock poisoned");
            let AggregatorState { buffers, underlying_buffers, last_underlying } = &mut *state;
            let mut items = Vec::new();
            for (label, seconds) in &self.timeframes {
                let buffer = buffers.get_mut(label).expect("buffer exists");
                for (key, bucket) in buffer.drain() {
                    let underlying_fallback = last_underlying.get(&key.symbol).copied();
                    items.push(FlushItem {
                        timeframe: label.clone(),
                        seconds: *seconds,
                        key,
                        bucket,
                        underlying_fallback,
                    });
                }
            }
            let mut underlying_items = Vec::new();
            for (label, _) in &self.timeframes {
                let buffer = underlying_buffers.get_mut(label).expect("buffer exists");
                for ((symbol, start), bar) in buffer.drain() {
                    underlying_items.push(UnderlyingFlushItem {
                        timeframe: label.clone(),
                        symbol,
                        bucket_start: start,
                        bar,
                    });
                }
            }
            (items, underlying_items)
        };

        self.persist_underlying_bars(underlying_flush).await;
        self.persist_batches(flush).await;
    }

    /// Remove eligible option buckets from the live map. Must run under the
    /// state lock; the caller persists after releasing it.
    fn collect_flush(&self, state: &mut AggregatorState, reference_ts: i64) -> Vec<FlushItem> {
        let AggregatorState { buffers, last_underlying, .. } = state;
        let mut items = Vec::new();
        for (label, seconds) in &self.timeframes {
            let buffer = buffers.get_mut(label).expect("buffer exists");
            let eligible: Vec<BucketKey> = buffer
                .keys()
                .filter(|key| reference_ts - key.bucket_start >= seconds + self.flush_lag)
                .cloned()
                .collect();
            for key in eligible {
                if let Some(bucket) = buffer.remove(&key) {
                    let underlying_fallback = last_underlying.get(&key.symbol).copied();
                    items.push(FlushItem {
                        timeframe: label.clone(),
                        seconds: *seconds,
                        key,
                        bucket,
                        underlying_fallback,
                    });
                }
            }
        }
        items.sort_by(|a, b| {
            (a.seconds, a.key.bucket_start).cmp(&(b.seconds, b.key.bucket_start))
        });
        items
    }

    fn collect_underlying_flush_locked(
        state: &mut AggregatorState,
        timeframes: &[(String, i64)],
        flush_lag: i64,
        reference_ts: i64,
    ) -> Vec<UnderlyingFlushItem> {
        let mut items = Vec::new();
        for (label, seconds) in timeframes {
            let buffer = state.underlying_buffers.get_mut(label).expect("buffer exists");
            let eligible: Vec<(String, i64)> = buffer
                .keys()
                .filter(|(_, start)| reference_ts - start >= seconds + flush_lag)
                .cloned()
                .collect();
            for key in eligible {
                if let Some(bar) = buffer.remove(&key) {
                    items.push(UnderlyingFlushItem {
                        timeframe: label.clone(),
                        symbol: key.0,
                        bucket_start: key.1,
                        bar,
                    });
                }
            }
        }
        items
    }

    async fn persist_batches(&self, items: Vec<FlushItem>) {
        if items.is_empty() {
            return;
        }
        let _permit = self.persist_sem.acquire().await.expect("semaphore never closed");
        for item in items {
            self.persist_bucket(item).await;
        }
    }

    async fn persist_bucket(&self, item: FlushItem) {
        if item.bucket.strikes.is_empty() {
            return;
        }
        let (rows, metrics) = materialize_bucket(
            &item.timeframe,
            &item.key.symbol,
            item.key.expiry,
            item.key.bucket_start,
            &item.bucket,
            item.underlying_fallback,
        );

        if self.persist_timeframes.contains(&item.timeframe) {
            if let Err(e) = self.repository.upsert_strike_rows(&rows).await {
                error!(
                    "Failed to upsert {} strike rows for {} {} @ {}: {e:#}",
                    rows.len(),
                    item.key.symbol,
                    item.timeframe,
                    item.key.bucket_start
                );
            }
            if let Err(e) = self.repository.upsert_expiry_metrics(std::slice::from_ref(&metrics)).await {
                error!(
                    "Failed to upsert expiry metrics for {} {} @ {}: {e:#}",
                    item.key.symbol, item.timeframe, item.key.bucket_start
                );
            }
        }

        if let Some(hub) = &self.hub {
            hub.broadcast(&build_stream_payload(&item.timeframe, &rows, &metrics));
        }
    }

    async fn persist_underlying_bars(&self, items: Vec<UnderlyingFlushItem>) {
        if items.is_empty() {
            return;
        }
        let rows: Vec<UnderlyingBarRow> = items
            .into_iter()
            .filter(|item| self.persist_timeframes.contains(&item.timeframe))
            .map(|item| UnderlyingBarRow {
                symbol: item.symbol,
                timeframe: item.timeframe,
                time: item.bucket_start,
                open: item.bar.open,
                high: item.bar.high,
                low: item.bar.low,
                close: item.bar.close,
                volume: item.bar.volume as i64,
                source: BAR_SOURCE.to_string(),
            })
            .collect();
        if rows.is_empty() {
            return;
        }
        let _permit = self.persist_sem.acquire().await.expect("semaphore never closed");
        if let Err(e) = self.repository.upsert_underlying_bars(&rows).await {
            error!("Failed to upsert underlying bars: {e:#}");
        }
    }
}

/// Turn a drained bucket into persisted rows. Strikes are emitted ascending.
fn materialize_bucket(
    timeframe: &str,
    symbol: &str,
    expiry: NaiveDate,
    bucket_time: i64,
    bucket: &StrikeBucket,
    underlying_fallback: Option<f64>,
) -> (Vec<StrikeRow>, ExpiryMetricsRow) {
    let underlying = bucket.underlying_close.or(underlying_fallback);

    let mut rows = Vec::with_capacity(bucket.strikes.len());
    let mut total_call_volume = 0.0;
    let mut total_put_volume = 0.0;
    let mut total_call_oi = 0.0;
    let mut total_put_oi = 0.0;

    for (strike_key, pair) in &bucket.strikes {
        total_call_volume += pair.call.volume_sum;
        total_put_volume += pair.put.volume_sum;
        total_call_oi += pair.call.oi_sum;
        total_put_oi += pair.put.oi_sum;
        rows.push(StrikeRow {
            bucket_time,
            timeframe: timeframe.to_string(),
            symbol: symbol.to_string(),
            expiry,
            strike: strike_key.as_price(),
            underlying_close: underlying,
            call: pair.call.serialize(),
            put: pair.put.serialize(),
            liquidity: pair.liquidity.clone(),
        });
    }

    let metrics = ExpiryMetricsRow {
        bucket_time,
        timeframe: timeframe.to_string(),
        symbol: symbol.to_string(),
        expiry,
        underlying_close: underlying,
        total_call_volume,
        total_put_volume,
        total_call_oi,
        total_put_oi,
        pcr: safe_ratio(total_put_volume, total_call_volume),
        max_pain_strike: compute_max_pain(&bucket.strikes),
    };

    (rows, metrics)
}

fn safe_ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator <= 0.0 { None } else { Some(numerator / denominator) }
}

/// Strike minimizing total seller payout over the strikes present in the
/// bucket. Ties resolve to the smallest strike (ascending scan, strict <).
fn compute_max_pain(strikes: &BTreeMap<StrikeKey, StrikePair>) -> Option<f64> {
    if strikes.is_empty() {
        return None;
    }
    let mut best: Option<(f64, f64)> = None;
    for candidate in strikes.keys() {
        let candidate_price = candidate.as_price();
        let mut loss = 0.0;
        for (strike, pair) in strikes {
            let strike_price = strike.as_price();
            loss += (strike_price - candidate_price).max(0.0) * pair.call.volume_sum;
            loss += (candidate_price - strike_price).max(0.0) * pair.put.volume_sum;
        }
        match best {
            Some((_, best_loss)) if loss >= best_loss => {}
            _ => best = Some((candidate_price, loss)),
        }
    }
    best.map(|(strike, _)| strike)
}

fn serialize_stats_column(column: &crate::domain::market::OptionStatsColumn) -> Value {
    json!({
        "iv": column.iv,
        "delta": column.delta,
        "gamma": column.gamma,
        "theta": column.theta,
        "vega": column.vega,
        "volume": column.volume,
        "oi": column.oi,
        "count": column.count,
    })
}

fn build_stream_payload(timeframe: &str, rows: &[StrikeRow], metrics: &ExpiryMetricsRow) -> Value {
    let strikes: Vec<Value> = rows
        .iter()
        .map(|row| {
            json!({
                "strike": row.strike,
                "call": serialize_stats_column(&row.call),
                "put": serialize_stats_column(&row.put),
                "underlying": row.underlying_close,
            })
        })
        .collect();

    json!({
        "type": "fo_bucket",
        "timeframe": timeframe,
        "symbol": metrics.symbol,
        "expiry": metrics.expiry.format("%Y-%m-%d").to_string(),
        "bucket_time": metrics.bucket_time,
        "strikes": strikes,
        "metrics": {
            "total_call_volume": metrics.total_call_volume,
            "total_put_volume": metrics.total_put_volume,
            "total_call_oi": metrics.total_call_oi,
            "total_put_oi": metrics.total_put_oi,
            "pcr": metrics.pcr,
            "max_pain_strike": metrics.max_pain_strike,
            "underlying_close": metrics.underlying_close,
            "expiry": metrics.expiry.format("%Y-%m-%d").to_string(),
            "bucket_time": metrics.bucket_time,
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::OptionStats;
    use anyhow::Result;
    use async_trait::async_trait;

    #[derive(Default)]
    struct RecordingRepository {
        strike_rows: Mutex<Vec<StrikeRow>>,
        metrics_rows: Mutex<Vec<ExpiryMetricsRow>>,
        bar_rows: Mutex<Vec<UnderlyingBarRow>>,
    }

    #[async_trait]
    impl MarketDataRepository for RecordingRepository {
        async fn upsert_strike_rows(&self, rows: &[StrikeRow]) -> Result<()> {
            self.strike_rows.lock().unwrap().extend_from_slice(rows);
            Ok(())
        }
        async fn upsert_expiry_metrics(&self, rows: &[ExpiryMetricsRow]) -> Result<()> {
            self.metrics_rows.lock().unwrap().extend_from_slice(rows);
            Ok(())
        }
        async fn upsert_underlying_bars(&self, rows: &[UnderlyingBarRow]) -> Result<()> {
            self.bar_rows.lock().unwrap().extend_from_slice(rows);
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

    fn option_tick(ts: i64, strike: f64, side: &str, volume: f64) -> OptionTick {
        OptionTick {
            symbol: Some("NIFTY".to_string()),
            expiry: Some("2024-11-07".to_string()),
            strike: Some(strike),
            option_type: Some(side.to_string()),
            ts: Some(ts),
            iv: Some(0.18),
            volume: Some(volume),
            oi: Some(1_000.0),
            ..Default::default()
        }
    }

    fn build(repo: Arc<RecordingRepository>) -> FoAggregator {
        FoAggregator::new(
            repo,
            None,
            &AggregatorSettings {
                timeframes: vec!["1min".to_string()],
                persist_timeframes: vec!["1min".to_string()],
                flush_lag_seconds: 5,
                persist_concurrency: 2,
            },
        )
    }

    #[tokio::test]
    async fn test_bucket_flushes_once_after_boundary_plus_lag() {
        let repo = Arc::new(RecordingRepository::default());
        let agg = build(repo.clone());

        let base = 1_699_356_600;
        for offset in [0, 10, 20, 30, 40] {
            agg.handle_option(option_tick(base + offset, 24_000.0, "CE", 100.0)).await;
        }
        assert!(repo.strike_rows.lock().unwrap().is_empty());

        // 60s boundary + 5s lag + 1s
        agg.handle_option(option_tick(base + 66, 24_000.0, "CE", 100.0)).await;

        let rows = repo.strike_rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].bucket_time, base);
        assert_eq!(rows[0].call.count, 5);
        assert_eq!(rows[0].call.volume, 500.0);
        let metrics = repo.metrics_rows.lock().unwrap();
        assert_eq!(metrics.len(), 1);
        assert_eq!(metrics[0].total_call_volume, 500.0);
    }

    #[tokio::test]
    async fn test_flush_all_drains_quiet_buckets() {
        let repo = Arc::new(RecordingRepository::default());
        let agg = build(repo.clone());

        agg.handle_option(option_tick(1_699_356_600, 24_000.0, "CE", 75.0)).await;
        assert!(repo.strike_rows.lock().unwrap().is_empty());

        agg.flush_all().await;

        let rows = repo.strike_rows.lock().unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].call.count, 1);
        assert_eq!(rows[0].call.volume, 75.0);
    }

    #[tokio::test]
    async fn test_mock_and_malformed_ticks_are_discarded() {
        let repo = Arc::new(RecordingRepository::default());
        let agg = build(repo.clone());

        let mut mock = option_tick(1_699_356_600, 24_000.0, "CE", 100.0);
        mock.is_mock = true;
        agg.handle_option(mock).await;

        let mut bad_expiry = option_tick(1_699_356_600, 24_000.0, "CE", 100.0);
        bad_expiry.expiry = Some("not a date".to_string());
        agg.handle_option(bad_expiry).await;

        let mut bad_type = option_tick(1_699_356_600, 24_000.0, "CE", 100.0);
        bad_type.option_type = Some("FUT".to_string());
        agg.handle_option(bad_type).await;

        agg.flush_all().await;
        assert!(repo.strike_rows.lock().unwrap().is_empty());
        assert!(repo.metrics_rows.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_underlying_close_falls_back_to_last_seen() {
        let repo = Arc::new(RecordingRepository::default());
        let agg = build(repo.clone());

        agg.handle_underlying(UnderlyingTick {
            symbol: Some("NIFTY".to_string()),
            close: Some(24_030.5),
            ts: Some(1_699_356_590),
            ..Default::default()
        })
        .await;
        agg.handle_option(option_tick(1_699_356_600, 24_000.0, "PE", 10.0)).await;
        agg.flush_all().await;

        let rows = repo.strike_rows.lock().unwrap();
        assert_eq!(rows[0].underlying_close, Some(24_030.5));
        let metrics = repo.metrics_rows.lock().unwrap();
        assert_eq!(metrics[0].underlying_close, Some(24_030.5));
    }

    #[tokio::test]
    async fn test_underlying_close_null_when_never_seen() {
        let repo = Arc::new(RecordingRepository::default());
        let agg = build(repo.clone());
        agg.handle_option(option_tick(1_699_356_600, 24_000.0, "CE", 10.0)).await;
        agg.flush_all().await;
        assert_eq!(repo.strike_rows.lock().unwrap()[0].underlying_close, None);
    }

    #[tokio::test]
    async fn test_strike_rows_emitted_ascending() {
        let repo = Arc::new(RecordingRepository::default());
        let agg = build(repo.clone());
        for strike in [24_100.0, 23_900.0, 24_000.0] {
            agg.handle_option(option_tick(1_699_356_600, strike, "CE", 10.0)).await;
        }
        agg.flush_all().await;
        let strikes: Vec<f64> = repo.strike_rows.lock().unwrap().iter().map(|r| r.strike).collect();
        assert_eq!(strikes, vec![23_900.0, 24_000.0, 24_100.0]);
    }

    #[tokio::test]
    async fn test_underlying_bars_persisted() {
        let repo = Arc::new(RecordingRepository::default());
        let agg = build(repo.clone());
        for (offset, price) in [(0, 24_000.0), (20, 24_050.0), (40, 23_990.0)] {
            agg.handle_underlying(UnderlyingTick {
                symbol: Some("NIFTY".to_string()),
                close: Some(price),
                volume: Some(100.0),
                ts: Some(1_699_356_600 + offset),
                ..Default::default()
            })
            .await;
        }
        agg.flush_all().await;
        let bars = repo.bar_rows.lock().unwrap();
        assert_eq!(bars.len(), 1);
        assert_eq!(bars[0].open, 24_000.0);
        assert_eq!(bars[0].high, 24_050.0);
        assert_eq!(bars[0].low, 23_990.0);
        assert_eq!(bars[0].close, 23_990.0);
        assert_eq!(bars[0].volume, 300);
        assert_eq!(bars[0].time, 1_699_356_600);
    }

    #[test]
    fn test_max_pain_minimizes_seller_payout() {
        // Heavy call volume above 24000 pulls max pain down.
        let mut strikes: BTreeMap<StrikeKey, StrikePair> = BTreeMap::new();
        let mut entry = |strike: f64, call_vol: f64, put_vol: f64| {
            let mut pair = StrikePair::default();
            pair.call = OptionStats { volume_sum: call_vol, count: 1, ..Default::default() };
            pair.put = OptionStats { volume_sum: put_vol, count: 1, ..Default::default() };
            strikes.insert(StrikeKey::from_price(strike), pair);
        };
        entry(23_900.0, 0.0, 500.0);
        entry(24_000.0, 100.0, 100.0);
        entry(24_100.0, 800.0, 0.0);

        // loss(23900) = 100*100 + 200*800 = 170000
        // loss(24000) = 100*800 + 100*500 = 130000
        // loss(24100) = 200*500 + 100*100 = 110000
        assert_eq!(compute_max_pain(&strikes), Some(24_100.0));
    }

    #[test]
    fn test_max_pain_tie_breaks_to_smallest_strike() {
        let mut strikes: BTreeMap<StrikeKey, StrikePair> = BTreeMap::new();
        for strike in [24_000.0, 24_100.0] {
            strikes.insert(StrikeKey::from_price(strike), StrikePair::default());
        }
        // No volume anywhere: every candidate has zero loss.
        assert_eq!(compute_max_pain(&strikes), Some(24_000.0));
    }

    #[test]
    fn test_pcr_null_on_zero_call_volume() {
        assert_eq!(safe_ratio(500.0, 0.0), None);
        assert_eq!(safe_ratio(500.0, 1_000.0), Some(0.5));
    }

    #[tokio::test]
    async fn test_non_persist_timeframe_broadcasts_but_skips_storage() {
        let repo = Arc::new(RecordingRepository::default());
        let hub = Arc::new(FanoutHub::default());
        let agg = FoAggregator::new(
            repo.clone(),
            Some(hub.clone()),
            &AggregatorSettings {
                timeframes: vec!["1min".to_string()],
                persist_timeframes: vec![],
                flush_lag_seconds: 5,
                persist_concurrency: 2,
            },
        );
        let mut sub = hub.subscribe();
        agg.handle_option(option_tick(1_699_356_600, 24_000.0, "CE", 10.0)).await;
        agg.flush_all().await;

        assert!(repo.strike_rows.lock().unwrap().is_empty());
        let payload = sub.receiver.try_recv().unwrap();
        let value: Value = serde_json::from_str(&payload).unwrap();
        assert_eq!(value["type"], "fo_bucket");
        assert_eq!(value["symbol"], "NIFTY");
        assert_eq!(value["bucket_time"], 1_699_356_600);
        assert_eq!(value["strikes"][0]["strike"], 24_000.0);
        assert_eq!(value["metrics"]["expiry"], "2024-11-07");
    }
}
