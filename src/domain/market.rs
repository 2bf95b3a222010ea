//! Core market-data types for the F&O aggregation pipeline.
//!
//! Ticks arrive as JSON over the feed channels (see `infrastructure::ws_feed`),
//! get folded into per-timeframe [`StrikeBucket`]s and [`UnderlyingBar`]s, and
//! leave as persisted rows and broadcast payloads.

use crate::domain::liquidity::{DepthPayload, LiquiditySnapshot};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Option side discriminator (call / put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptionSide {
    CE,
    PE,
}

impl OptionSide {
    /// Parse a tick's `type` field. Anything other than CE/PE is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "CE" => Some(OptionSide::CE),
            "PE" => Some(OptionSide::PE),
            _ => None,
        }
    }
}

impl fmt::Display for OptionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionSide::CE => write!(f, "CE"),
            OptionSide::PE => write!(f, "PE"),
        }
    }
}

/// Raw option tick as published on the options channel. Unknown fields are
/// ignored; absent metrics default to zero at aggregation time.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OptionTick {
    pub symbol: Option<String>,
    pub expiry: Option<String>,
    pub strike: Option<f64>,
    #[serde(rename = "type")]
    pub option_type: Option<String>,
    pub ts: Option<i64>,
    pub timestamp: Option<i64>,
    pub iv: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub volume: Option<f64>,
    pub oi: Option<f64>,
    pub open_interest: Option<f64>,
    pub price: Option<f64>,
    pub last_price: Option<f64>,
    pub depth: Option<DepthPayload>,
    #[serde(default)]
    pub is_mock: bool,
}

impl OptionTick {
    pub fn effective_ts(&self, fallback: i64) -> i64 {
        self.ts.or(self.timestamp).unwrap_or(fallback)
    }

    pub fn last_traded_price(&self) -> f64 {
        self.price.or(self.last_price).unwrap_or(0.0)
    }

    pub fn open_interest(&self) -> f64 {
        self.oi.or(self.open_interest).unwrap_or(0.0)
    }
}

/// Raw underlying tick as published on the underlying channel.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UnderlyingTick {
    pub symbol: Option<String>,
    pub close: Option<f64>,
    pub price: Option<f64>,
    pub last_price: Option<f64>,
    pub ts: Option<i64>,
    pub timestamp: Option<i64>,
    pub volume: Option<f64>,
    pub vol: Option<f64>,
    #[serde(default)]
    pub is_mock: bool,
}

impl UnderlyingTick {
    pub fn effective_ts(&self, fallback: i64) -> i64 {
        self.ts.or(self.timestamp).unwrap_or(fallback)
    }

    pub fn close_price(&self) -> Option<f64> {
        self.close.or(self.price).or(self.last_price)
    }

    pub fn traded_volume(&self) -> f64 {
        self.volume.or(self.vol).unwrap_or(0.0)
    }
}

/// Normalize a timeframe label: trimmed, lowercased, bare minute counts get
/// a "min" suffix ("5" -> "5min").
pub fn normalize_timeframe(raw: &str) -> String {
    let tf = raw.trim().to_lowercase();
    if !tf.is_empty() && tf.chars().all(|c| c.is_ascii_digit()) {
        format!("{tf}min")
    } else {
        tf
    }
}

/// Convert a timeframe label to bucket width in seconds. Minute-based labels
/// are floored at 60 seconds.
pub fn timeframe_seconds(raw: &str) -> Result<i64, crate::domain::errors::FeedError> {
    let tf = normalize_timeframe(raw);
    let parse_prefix = |suffix: &str| -> Option<i64> {
        tf.strip_suffix(suffix).and_then(|n| n.parse::<i64>().ok())
    };
    if let Some(minutes) = parse_prefix("min") {
        return Ok((minutes * 60).max(60));
    }
    if let Some(hours) = parse_prefix("hour") {
        return Ok(hours * 3600);
    }
    if tf.ends_with("day") {
        return Ok(86_400);
    }
    if tf.ends_with("week") {
        return Ok(7 * 86_400);
    }
    if tf.ends_with("month") {
        return Ok(30 * 86_400);
    }
    Err(crate::domain::errors::FeedError::UnsupportedTimeframe { label: raw.to_string() })
}

/// Align a timestamp to the start of its bucket.
pub fn bucket_start(ts: i64, seconds: i64) -> i64 {
    ts - ts.rem_euclid(seconds)
}

/// Parse an expiry string. Accepts ISO dates ("2024-11-07", optionally with a
/// time suffix) and the dd-MMM-YYYY broker style ("07-Nov-2024").
pub fn parse_expiry(raw: &str) -> Option<NaiveDate> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Some(date);
    }
    if let Some(prefix) = trimmed.get(..10)
        && let Ok(date) = NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
    {
        return Some(date);
    }
    NaiveDate::parse_from_str(trimmed, "%d-%b-%Y").ok()
}

/// Running sums for one option side within one bucket. Averages are derived
/// at serialization time; volume and open interest stay sums.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptionStats {
    pub iv_sum: f64,
    pub delta_sum: f64,
    pub gamma_sum: f64,
    pub theta_sum: f64,
    pub vega_sum: f64,
    pub volume_sum: f64,
    pub oi_sum: f64,
    pub count: u64,
}

impl OptionStats {
    pub fn add(&mut self, tick: &OptionTick) {
        self.iv_sum += tick.iv.unwrap_or(0.0);
        self.delta_sum += tick.delta.unwrap_or(0.0);
        self.gamma_sum += tick.gamma.unwrap_or(0.0);
        self.theta_sum += tick.theta.unwrap_or(0.0);
        self.vega_sum += tick.vega.unwrap_or(0.0);
        self.volume_sum += tick.volume.unwrap_or(0.0);
        self.oi_sum += tick.open_interest();
        self.count += 1;
    }

    fn avg(&self, sum: f64) -> Option<f64> {
        if self.count == 0 { None } else { Some(sum / self.count as f64) }
    }

    pub fn serialize(&self) -> OptionStatsColumn {
        OptionStatsColumn {
            iv: self.avg(self.iv_sum),
            delta: self.avg(self.delta_sum),
            gamma: self.avg(self.gamma_sum),
            theta: self.avg(self.theta_sum),
            vega: self.avg(self.vega_sum),
            volume: self.volume_sum,
            oi: self.oi_sum,
            count: self.count,
        }
    }
}

/// Persisted shape of one side's aggregated stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptionStatsColumn {
    pub iv: Option<f64>,
    pub delta: Option<f64>,
    pub gamma: Option<f64>,
    pub theta: Option<f64>,
    pub vega: Option<f64>,
    pub volume: f64,
    pub oi: f64,
    pub count: u64,
}

/// Strike prices carry at most two decimals on NSE; keying buckets by the
/// price in hundredths keeps map keys ordered and hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StrikeKey(i64);

impl StrikeKey {
    pub fn from_price(strike: f64) -> Self {
        StrikeKey((strike * 100.0).round() as i64)
    }

    pub fn as_price(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

/// Per-strike accumulator pair inside a bucket.
#[derive(Debug, Clone, Default)]
pub struct StrikePair {
    pub call: OptionStats,
    pub put: OptionStats,
    pub liquidity: Option<LiquiditySnapshot>,
}

impl StrikePair {
    pub fn side_mut(&mut self, side: OptionSide) -> &mut OptionStats {
        match side {
            OptionSide::CE => &mut self.call,
            OptionSide::PE => &mut self.put,
        }
    }
}

/// In-memory accumulator for one (timeframe, symbol, expiry, bucket_start).
/// Created on first tick, destroyed when moved into a flush batch.
#[derive(Debug, Clone, Default)]
pub struct StrikeBucket {
    pub strikes: BTreeMap<StrikeKey, StrikePair>,
    pub underlying_close: Option<f64>,
}

/// OHLCV accumulator for the underlying instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct UnderlyingBar {
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl UnderlyingBar {
    pub fn seed(price: f64, volume: f64) -> Self {
        Self { open: price, high: price, low: price, close: price, volume }
    }

    pub fn update(&mut self, price: f64, volume: f64) {
        self.close = price;
        if price > self.high {
            self.high = price;
        }
        if price < self.low {
            self.low = price;
        }
        self.volume += volume;
    }
}

/// Persisted strike-level row.
/// Primary key: (timeframe, symbol, expiry, strike, bucket_time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrikeRow {
    pub bucket_time: i64,
    pub timeframe: String,
    pub symbol: String,
    pub expiry: NaiveDate,
    pub strike: f64,
    pub underlying_close: Option<f64>,
    pub call: OptionStatsColumn,
    pub put: OptionStatsColumn,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub liquidity: Option<LiquiditySnapshot>,
}

/// Persisted expiry-level metrics row.
/// Primary key: (timeframe, symbol, expiry, bucket_time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExpiryMetricsRow {
    pub bucket_time: i64,
    pub timeframe: String,
    pub symbol: String,
    pub expiry: NaiveDate,
    pub underlying_close: Option<f64>,
    pub total_call_volume: f64,
    pub total_put_volume: f64,
    pub total_call_oi: f64,
    pub total_put_oi: f64,
    pub pcr: Option<f64>,
    pub max_pain_strike: Option<f64>,
}

/// Persisted underlying OHLCV bar. Primary key: (symbol, timeframe, time).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnderlyingBarRow {
    pub symbol: String,
    pub timeframe: String,
    pub time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: i64,
    pub source: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeframe_seconds() {
        assert_eq!(timeframe_seconds("1min").unwrap(), 60);
        assert_eq!(timeframe_seconds("5min").unwrap(), 300);
        assert_eq!(timeframe_seconds("15").unwrap(), 900);
        assert_eq!(timeframe_seconds("2hour").unwrap(), 7200);
        assert_eq!(timeframe_seconds("1day").unwrap(), 86_400);
        assert!(timeframe_seconds("13sec").is_err());
    }

    #[test]
    fn test_bucket_alignment() {
        // P1: bucket_start = t - (t mod seconds(tf))
        assert_eq!(bucket_start(1_699_356_610, 60), 1_699_356_600);
        assert_eq!(bucket_start(1_699_356_600, 60), 1_699_356_600);
        assert_eq!(bucket_start(1_699_356_666, 300), 1_699_356_600);
    }

    #[test]
    fn test_parse_expiry_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 11, 7).unwrap();
        assert_eq!(parse_expiry("2024-11-07"), Some(expected));
        assert_eq!(parse_expiry("2024-11-07T00:00:00"), Some(expected));
        assert_eq!(parse_expiry("07-Nov-2024"), Some(expected));
        assert_eq!(parse_expiry("next thursday"), None);
        assert_eq!(parse_expiry(""), None);
    }

    #[test]
    fn test_option_stats_averages_consistent_with_sums() {
        let mut stats = OptionStats::default();
        for iv in [0.18, 0.20, 0.22] {
            stats.add(&OptionTick {
                iv: Some(iv),
                volume: Some(100.0),
                oi: Some(1_000.0),
                ..Default::default()
            });
        }
        let column = stats.serialize();
        assert_eq!(column.count, 3);
        assert_eq!(column.volume, 300.0);
        assert_eq!(column.oi, 3_000.0);
        let iv_avg = column.iv.unwrap();
        assert!((iv_avg * 3.0 - 0.60).abs() < 1e-9);
    }

    #[test]
    fn test_option_stats_empty_serializes_null_averages() {
        let column = OptionStats::default().serialize();
        assert!(column.iv.is_none());
        assert!(column.delta.is_none());
        assert_eq!(column.volume, 0.0);
        assert_eq!(column.count, 0);
    }

    #[test]
    fn test_oi_falls_back_to_open_interest() {
        let tick = OptionTick { open_interest: Some(42.0), ..Default::default() };
        assert_eq!(tick.open_interest(), 42.0);
        let tick = OptionTick { oi: Some(7.0), open_interest: Some(42.0), ..Default::default() };
        assert_eq!(tick.open_interest(), 7.0);
    }

    #[test]
    fn test_underlying_bar_ohlc() {
        let mut bar = UnderlyingBar::seed(100.0, 10.0);
        bar.update(105.0, 5.0);
        bar.update(95.0, 2.0);
        bar.update(101.0, 1.0);
        assert_eq!(bar.open, 100.0);
        assert_eq!(bar.high, 105.0);
        assert_eq!(bar.low, 95.0);
        assert_eq!(bar.close, 101.0);
        assert_eq!(bar.volume, 18.0);
    }

    #[test]
    fn test_strike_key_roundtrip() {
        let key = StrikeKey::from_price(24_050.5);
        assert_eq!(key.as_price(), 24_050.5);
        assert!(StrikeKey::from_price(24_000.0) < StrikeKey::from_price(24_050.0));
    }

    #[test]
    fn test_option_tick_ignores_unknown_fields() {
        let raw = r#"{"symbol":"NIFTY","expiry":"2024-11-07","strike":24000,
                      "type":"CE","ts":1699356600,"iv":0.18,"volume":1500,
                      "oi":125000,"price":180.5,"instrument_token":123456}"#;
        let tick: OptionTick = serde_json::from_str(raw).unwrap();
        assert_eq!(tick.strike, Some(24_000.0));
        assert_eq!(tick.option_type.as_deref(), Some("CE"));
        assert!(!tick.is_mock);
    }
}
