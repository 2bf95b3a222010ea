//! Condition evaluator: fetches live market state and compares it against
//! configured thresholds.
//!
//! Every failure mode short of cancellation becomes a structured
//! `EvaluationResult` with `matched = false` and an error string; nothing in
//! here is allowed to take a worker task down.

use crate::domain::alerts::{
    ComparisonOperator, ConditionConfig, EvaluationResult, GreekKind, LogicOperator,
    PositionMetric, PriceComparison, TimeConditionKind,
};
use crate::domain::ports::ConditionEvaluator;
use async_trait::async_trait;
use chrono::{Datelike, NaiveTime, Utc, Weekday};
use chrono_tz::Tz;
use reqwest::Client;
use serde_json::{Map, Value, json};
use std::time::Duration;
use tracing::error;

const MARKET_OPEN: (u32, u32) = (9, 15);
const MARKET_CLOSE: (u32, u32) = (15, 30);

#[derive(Debug, Clone)]
pub struct EvaluatorSettings {
    pub ticker_service_url: String,
    pub backend_url: String,
    pub timeout_seconds: u64,
}

impl Default for EvaluatorSettings {
    fn default() -> Self {
        Self {
            ticker_service_url: "http://localhost:8080".to_string(),
            backend_url: "http://localhost:8000".to_string(),
            timeout_seconds: 5,
        }
    }
}

/// Evaluates conditions against the ticker service (quotes) and the backend
/// (indicators, positions, greeks). Owns a pooled HTTP client.
pub struct HttpConditionEvaluator {
    client: Client,
    ticker_base: String,
    backend_base: String,
}

impl HttpConditionEvaluator {
    pub fn new(settings: &EvaluatorSettings) -> Self {
        let client = Client::builder()
            .pool_max_idle_per_host(5)
            .timeout(Duration::from_secs(settings.timeout_seconds.max(1)))
            .build()
            .unwrap_or_else(|_| Client::new());
        Self {
            client,
            ticker_base: settings.ticker_service_url.trim_end_matches('/').to_string(),
            backend_base: settings.backend_url.trim_end_matches('/').to_string(),
        }
    }

    async fn dispatch(&self, config: ConditionConfig) -> EvaluationResult {
        match config {
            ConditionConfig::Price { symbol, operator, threshold, max_threshold, comparison } => {
                self.evaluate_price(&symbol, operator, threshold, max_threshold, comparison).await
            }
            ConditionConfig::Indicator {
                symbol,
                indicator,
                timeframe,
                operator,
                threshold,
                max_threshold,
                lookback_periods,
            } => {
                self.evaluate_indicator(
                    &symbol,
                    &indicator,
                    &timeframe,
                    operator,
                    threshold,
                    max_threshold,
                    lookback_periods,
                )
                .await
            }
            ConditionConfig::Position {
                metric,
                operator,
                threshold,
                max_threshold,
                symbol,
                product,
                account_id,
            } => {
                self.evaluate_position(
                    metric,
                    operator,
                    threshold,
                    max_threshold,
                    symbol.as_deref(),
                    product.as_deref(),
                    account_id.as_deref(),
                )
                .await
            }
            ConditionConfig::Greek { symbol, greek, operator, threshold, max_threshold } => {
                self.evaluate_greek(&symbol, greek, operator, threshold, max_threshold).await
            }
            ConditionConfig::Time { condition, timezone, start_time, end_time, days } => {
                evaluate_time(condition, &timezone, start_time.as_deref(), end_time.as_deref(), days)
            }
            ConditionConfig::Composite { operator, conditions } => {
                self.evaluate_composite(operator, conditions).await
            }
            ConditionConfig::Custom {} | ConditionConfig::Script {} => {
                EvaluationResult::failed("Custom conditions not implemented")
            }
        }
    }

    async fn evaluate_price(
        &self,
        symbol: &str,
        operator: ComparisonOperator,
        threshold: f64,
        max_threshold: Option<f64>,
        comparison: PriceComparison,
    ) -> EvaluationResult {
        if symbol.is_empty() {
            return EvaluationResult::failed("Symbol is required");
        }

        // Live endpoint first, quotes endpoint as fallback.
        let data = match self.get_json(&format!("{}/live/{symbol}", self.ticker_base)).await {
            Ok(data) => data,
            Err(_) => {
                match self.get_json(&format!("{}/quotes/{symbol}", self.ticker_base)).await {
                    Ok(data) => data,
                    Err(e) => {
                        return EvaluationResult::failed(format!(
                            "Failed to fetch price for {symbol}: {e}"
                        ));
                    }
                }
            }
        };

        let current = data
            .get(comparison.field())
            .and_then(Value::as_f64)
            .or_else(|| data.get("last_price").and_then(Value::as_f64))
            .or_else(|| data.get("ltp").and_then(Value::as_f64));
        let Some(current) = current else {
            return EvaluationResult::failed(format!("No price data for {symbol}"));
        };

        EvaluationResult::matched(
            operator.compare(current, threshold, max_threshold),
            current,
            threshold,
            as_details(json!({
                "symbol": symbol,
                "operator": operator.as_str(),
                "comparison": comparison.field(),
            })),
        )
    }

    async fn evaluate_indicator(
        &self,
        symbol: &str,
        indicator: &str,
        timeframe: &str,
        operator: ComparisonOperator,
        threshold: f64,
        max_threshold: Option<f64>,
        lookback: u32,
    ) -> EvaluationResult {
        if symbol.is_empty() || indicator.is_empty() {
            return EvaluationResult::failed("Symbol and indicator are required");
        }
        let indicator = indicator.to_lowercase();
        let url = format!(
            "{}/api/indicators/{symbol}/{indicator}?timeframe={timeframe}&lookback={lookback}",
            self.backend_base
        );
        let data = match self.get_json(&url).await {
            Ok(data) => data,
            Err(e) => {
                return EvaluationResult::failed(format!(
                    "Failed to fetch {indicator} for {symbol}: {e}"
                ));
            }
        };
        let current = data
            .get("value")
            .and_then(Value::as_f64)
            .or_else(|| data.get(&indicator).and_then(Value::as_f64));
        let Some(current) = current else {
            return EvaluationResult::failed(format!("No {indicator} data for {symbol}"));
        };

        EvaluationResult::matched(
            operator.compare(current, threshold, max_threshold),
            current,
            threshold,
            as_details(json!({
                "symbol": symbol,
                "indicator": indicator,
                "timeframe": timeframe,
                "operator": operator.as_str(),
            })),
        )
    }

    async fn evaluate_position(
        &self,
        metric: PositionMetric,
        operator: ComparisonOperator,
        threshold: f64,
        max_threshold: Option<f64>,
        symbol: Option<&str>,
        product: Option<&str>,
        account_id: Option<&str>,
    ) -> EvaluationResult {
        let mut url = format!("{}/api/positions", self.backend_base);
        if let Some(account_id) = account_id {
            url.push_str(&format!("?account_id={account_id}"));
        }
        let data = match self.get_json(&url).await {
            Ok(data) => data,
            Err(e) => {
                return EvaluationResult::failed(format!("Failed to fetch positions: {e}"));
            }
        };

        let positions: Vec<&Value> = data
            .get("positions")
            .and_then(Value::as_array)
            .map(|list| {
                list.iter()
                    .filter(|p| {
                        symbol.is_none_or(|s| {
                            position_field_str(p, "tradingsymbol")
                                .or_else(|| position_field_str(p, "symbol"))
                                .is_some_and(|v| v == s)
                        })
                    })
                    .filter(|p| {
                        product.is_none_or(|wanted| {
                            position_field_str(p, "product").is_some_and(|v| v == wanted)
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        let current: f64 = positions.iter().map(|p| position_metric_value(p, metric)).sum();

        EvaluationResult::matched(
            operator.compare(current, threshold, max_threshold),
            current,
            threshold,
            as_details(json!({
                "metric": metric.as_str(),
                "operator": operator.as_str(),
                "symbol": symbol,
                "position_count": positions.len(),
            })),
        )
    }

    async fn evaluate_greek(
        &self,
        symbol: &str,
        greek: GreekKind,
        operator: ComparisonOperator,
        threshold: f64,
        max_threshold: Option<f64>,
    ) -> EvaluationResult {
        if symbol.is_empty() {
            return EvaluationResult::failed("Symbol is required");
        }
        let data = match self.get_json(&format!("{}/api/greeks/{symbol}", self.backend_base)).await
        {
            Ok(data) => data,
            Err(e) => {
                return EvaluationResult::failed(format!(
                    "Failed to fetch greeks for {symbol}: {e}"
                ));
            }
        };
        let Some(current) = data.get(greek.as_str()).and_then(Value::as_f64) else {
            return EvaluationResult::failed(format!("No {} data for {symbol}", greek.as_str()));
        };

        EvaluationResult::matched(
            operator.compare(current, threshold, max_threshold),
            current,
            threshold,
            as_details(json!({
                "symbol": symbol,
                "greek": greek.as_str(),
                "operator": operator.as_str(),
            })),
        )
    }

    /// All sub-conditions are evaluated in input order and collected into
    /// `details.sub_results`; no short-circuit.
    async fn evaluate_composite(
        &self,
        operator: LogicOperator,
        conditions: Vec<Value>,
    ) -> EvaluationResult {
        if conditions.len() < 2 {
            return EvaluationResult::failed(
                "Composite condition requires at least two sub-conditions",
            );
        }

        let mut results = Vec::with_capacity(conditions.len());
        for condition in &conditions {
            results.push(self.evaluate(condition).await);
        }

        let matched = match operator {
            LogicOperator::And => results.iter().all(|r| r.matched),
            LogicOperator::Or => results.iter().any(|r| r.matched),
        };
        let matched_count = results.iter().filter(|r| r.matched).count();

        EvaluationResult::time_based(
            matched,
            as_details(json!({
                "operator": operator,
                "sub_results": results.iter().map(EvaluationResult::to_json).collect::<Vec<_>>(),
                "total_conditions": conditions.len(),
                "matched_conditions": matched_count,
            })),
        )
    }

    async fn get_json(&self, url: &str) -> Result<Value, String> {
        let response = self.client.get(url).send().await.map_err(|e| format!("{e}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(format!("status {}", status.as_u16()));
        }
        response.json::<Value>().await.map_err(|e| format!("{e}"))
    }
}

#[async_trait]
impl ConditionEvaluator for HttpConditionEvaluator {
    async fn evaluate(&self, config: &Value) -> EvaluationResult {
        let parsed: ConditionConfig = match serde_json::from_value(config.clone()) {
            Ok(parsed) => parsed,
            Err(e) => {
                let kind = config
                    .get("type")
                    .and_then(Value::as_str)
                    .unwrap_or("<missing>");
                error!("Rejecting condition of type {kind}: {e}");
                return EvaluationResult::failed(format!("Invalid condition ({kind}): {e}"));
            }
        };
        self.dispatch(parsed).await
    }
}

fn position_field_str<'a>(position: &'a Value, field: &str) -> Option<&'a str> {
    position.get(field).and_then(Value::as_str)
}

fn position_metric_value(position: &Value, metric: PositionMetric) -> f64 {
    let field = |name: &str| position.get(name).and_then(Value::as_f64).unwrap_or(0.0);
    match metric {
        PositionMetric::Pnl => field("pnl"),
        PositionMetric::DayPnl => field("day_pnl"),
        PositionMetric::Quantity => field("quantity"),
        PositionMetric::Exposure => field("exposure"),
        PositionMetric::PnlPercentage => {
            if let Some(value) = position.get("pnl_percentage").and_then(Value::as_f64) {
                return value;
            }
            let invested = field("average_price") * field("quantity").abs();
            if invested > 0.0 { field("pnl") / invested * 100.0 } else { 0.0 }
        }
    }
}

/// Time conditions are evaluated against wall clock in the configured zone
/// and never touch the network.
fn evaluate_time(
    condition: TimeConditionKind,
    timezone: &str,
    start_time: Option<&str>,
    end_time: Option<&str>,
    days: Option<Vec<String>>,
) -> EvaluationResult {
    let tz: Tz = match timezone.parse() {
        Ok(tz) => tz,
        Err(_) => return EvaluationResult::failed(format!("Unknown timezone: {timezone}")),
    };
    let now = Utc::now().with_timezone(&tz);

    match condition {
        TimeConditionKind::MarketHours => {
            let open = NaiveTime::from_hms_opt(MARKET_OPEN.0, MARKET_OPEN.1, 0)
                .expect("market open is a valid time");
            let close = NaiveTime::from_hms_opt(MARKET_CLOSE.0, MARKET_CLOSE.1, 0)
                .expect("market close is a valid time");
            let t = now.time();
            let matched = open <= t && t <= close;
            EvaluationResult::time_based(
                matched,
                as_details(json!({
                    "condition": "market_hours",
                    "current_time": now.to_rfc3339(),
                    "market_open": format!("{:02}:{:02}", MARKET_OPEN.0, MARKET_OPEN.1),
                    "market_close": format!("{:02}:{:02}", MARKET_CLOSE.0, MARKET_CLOSE.1),
                })),
            )
        }
        TimeConditionKind::TimeRange => {
            let start = match parse_clock(start_time.unwrap_or("09:15")) {
                Some(start) => start,
                None => return EvaluationResult::failed("Invalid start_time"),
            };
            let end = match parse_clock(end_time.unwrap_or("15:30")) {
                Some(end) => end,
                None => return EvaluationResult::failed("Invalid end_time"),
            };
            let t = now.time();
            let matched = start <= t && t <= end;
            EvaluationResult::time_based(
                matched,
                as_details(json!({
                    "condition": "time_range",
                    "current_time": now.to_rfc3339(),
                    "start_time": start.format("%H:%M").to_string(),
                    "end_time": end.format("%H:%M").to_string(),
                })),
            )
        }
        TimeConditionKind::DayOfWeek => {
            let allowed: Vec<String> = days
                .unwrap_or_else(|| {
                    ["monday", "tuesday", "wednesday", "thursday", "friday"]
                        .iter()
                        .map(|d| d.to_string())
                        .collect()
                })
                .iter()
                .map(|d| d.to_lowercase())
                .collect();
            let current = match now.weekday() {
                Weekday::Mon => "monday",
                Weekday::Tue => "tuesday",
                Weekday::Wed => "wednesday",
                Weekday::Thu => "thursday",
                Weekday::Fri => "friday",
                Weekday::Sat => "saturday",
                Weekday::Sun => "sunday",
            };
            let matched = allowed.iter().any(|d| d == current);
            EvaluationResult::time_based(
                matched,
                as_details(json!({
                    "condition": "day_of_week",
                    "current_day": current,
                    "allowed_days": allowed,
                })),
            )
        }
    }
}

fn parse_clock(raw: &str) -> Option<NaiveTime> {
    NaiveTime::parse_from_str(raw, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(raw, "%H:%M:%S"))
        .ok()
}

fn as_details(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}
