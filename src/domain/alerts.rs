//! Alert model: persisted alert records, the condition-config variants the
//! evaluator dispatches on, and evaluation results.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertPriority {
    Low,
    Medium,
    High,
    Critical,
}

/// Evaluation order: most urgent first.
pub const PRIORITY_ORDER: [AlertPriority; 4] = [
    AlertPriority::Critical,
    AlertPriority::High,
    AlertPriority::Medium,
    AlertPriority::Low,
];

impl AlertPriority {
    /// Rank used by the quiet-hours threshold comparison.
    pub fn rank(&self) -> u8 {
        match self {
            AlertPriority::Low => 0,
            AlertPriority::Medium => 1,
            AlertPriority::High => 2,
            AlertPriority::Critical => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertPriority::Low => "low",
            AlertPriority::Medium => "medium",
            AlertPriority::High => "high",
            AlertPriority::Critical => "critical",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "low" => Some(AlertPriority::Low),
            "medium" => Some(AlertPriority::Medium),
            "high" => Some(AlertPriority::High),
            "critical" => Some(AlertPriority::Critical),
            _ => None,
        }
    }
}

impl fmt::Display for AlertPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertStatus {
    Active,
    Paused,
    /// Reachable only through administrative action; the worker never sets it.
    Triggered,
    Expired,
    Deleted,
}

impl AlertStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Active => "active",
            AlertStatus::Paused => "paused",
            AlertStatus::Triggered => "triggered",
            AlertStatus::Expired => "expired",
            AlertStatus::Deleted => "deleted",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "active" => Some(AlertStatus::Active),
            "paused" => Some(AlertStatus::Paused),
            "triggered" => Some(AlertStatus::Triggered),
            "expired" => Some(AlertStatus::Expired),
            "deleted" => Some(AlertStatus::Deleted),
            _ => None,
        }
    }
}

/// Persisted alert record. Mutated by the worker only through
/// `last_evaluated_at`, `last_triggered_at` and `trigger_count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub alert_id: Uuid,
    pub user_id: String,
    pub name: String,
    pub alert_type: String,
    pub priority: AlertPriority,
    pub status: AlertStatus,
    pub condition_config: Value,
    pub notification_channels: Vec<String>,
    pub evaluation_interval_seconds: i64,
    pub cooldown_seconds: i64,
    pub max_triggers_per_day: Option<i64>,
    pub trigger_count: i64,
    pub last_triggered_at: Option<DateTime<Utc>>,
    pub last_evaluated_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Alert {
    /// Symbol referenced by the condition, when it has one. Used for message
    /// formatting only.
    pub fn condition_symbol(&self) -> Option<String> {
        self.condition_config
            .get("symbol")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
    }
}

/// Append-only record of one trigger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertEvent {
    pub event_id: Uuid,
    pub alert_id: Uuid,
    pub triggered_at: DateTime<Utc>,
    pub evaluation_result: Value,
    pub notification_results: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComparisonOperator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Between,
}

impl ComparisonOperator {
    /// Compare a current value against the configured threshold(s).
    ///
    /// `eq` uses a relative tolerance of max(|threshold| * 1e-3, 1e-3);
    /// `between` is inclusive on both ends and requires `max_threshold`.
    pub fn compare(&self, current: f64, threshold: f64, max_threshold: Option<f64>) -> bool {
        match self {
            ComparisonOperator::Gt => current > threshold,
            ComparisonOperator::Gte => current >= threshold,
            ComparisonOperator::Lt => current < threshold,
            ComparisonOperator::Lte => current <= threshold,
            ComparisonOperator::Eq => {
                let tolerance = (threshold.abs() * 1e-3).max(1e-3);
                (current - threshold).abs() <= tolerance
            }
            ComparisonOperator::Between => match max_threshold {
                Some(upper) => threshold <= current && current <= upper,
                None => false,
            },
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ComparisonOperator::Gt => "gt",
            ComparisonOperator::Gte => "gte",
            ComparisonOperator::Lt => "lt",
            ComparisonOperator::Lte => "lte",
            ComparisonOperator::Eq => "eq",
            ComparisonOperator::Between => "between",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriceComparison {
    LastPrice,
    Bid,
    Ask,
    Vwap,
}

impl Default for PriceComparison {
    fn default() -> Self {
        PriceComparison::LastPrice
    }
}

impl PriceComparison {
    pub fn field(&self) -> &'static str {
        match self {
            PriceComparison::LastPrice => "last_price",
            PriceComparison::Bid => "bid",
            PriceComparison::Ask => "ask",
            PriceComparison::Vwap => "vwap",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionMetric {
    Pnl,
    DayPnl,
    Quantity,
    PnlPercentage,
    Exposure,
}

impl Default for PositionMetric {
    fn default() -> Self {
        PositionMetric::Pnl
    }
}

impl PositionMetric {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionMetric::Pnl => "pnl",
            PositionMetric::DayPnl => "day_pnl",
            PositionMetric::Quantity => "quantity",
            PositionMetric::PnlPercentage => "pnl_percentage",
            PositionMetric::Exposure => "exposure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GreekKind {
    Delta,
    Gamma,
    Theta,
    Vega,
}

impl GreekKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            GreekKind::Delta => "delta",
            GreekKind::Gamma => "gamma",
            GreekKind::Theta => "theta",
            GreekKind::Vega => "vega",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeConditionKind {
    MarketHours,
    TimeRange,
    DayOfWeek,
}

impl Default for TimeConditionKind {
    fn default() -> Self {
        TimeConditionKind::MarketHours
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogicOperator {
    And,
    Or,
}

fn default_timezone() -> String {
    "Asia/Kolkata".to_string()
}

fn default_timeframe() -> String {
    "5min".to_string()
}

fn default_lookback() -> u32 {
    14
}

/// Condition configuration, dispatched on the `type` discriminator.
///
/// An unknown `type` fails deserialization; the evaluator turns that into a
/// structured error result rather than propagating it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ConditionConfig {
    Price {
        symbol: String,
        operator: ComparisonOperator,
        threshold: f64,
        #[serde(default)]
        max_threshold: Option<f64>,
        #[serde(default)]
        comparison: PriceComparison,
    },
    Indicator {
        symbol: String,
        indicator: String,
        #[serde(default = "default_timeframe")]
        timeframe: String,
        operator: ComparisonOperator,
        threshold: f64,
        #[serde(default)]
        max_threshold: Option<f64>,
        #[serde(default = "default_lookback")]
        lookback_periods: u32,
    },
    Position {
        #[serde(default)]
        metric: PositionMetric,
        operator: ComparisonOperator,
        threshold: f64,
        #[serde(default)]
        max_threshold: Option<f64>,
        #[serde(default)]
        symbol: Option<String>,
        #[serde(default)]
        product: Option<String>,
        #[serde(default)]
        account_id: Option<String>,
    },
    Greek {
        symbol: String,
        greek: GreekKind,
        operator: ComparisonOperator,
        threshold: f64,
        #[serde(default)]
        max_threshold: Option<f64>,
    },
    Time {
        #[serde(default)]
        condition: TimeConditionKind,
        #[serde(default = "default_timezone")]
        timezone: String,
        #[serde(default)]
        start_time: Option<String>,
        #[serde(default)]
        end_time: Option<String>,
        #[serde(default)]
        days: Option<Vec<String>>,
    },
    Composite {
        operator: LogicOperator,
        conditions: Vec<Value>,
    },
    Custom {},
    Script {},
}

/// Result of evaluating one condition config.
#[derive(Debug, Clone, Serialize)]
pub struct EvaluationResult {
    pub matched: bool,
    pub current_value: Option<f64>,
    pub threshold: Option<f64>,
    pub details: Map<String, Value>,
    pub error: Option<String>,
    pub evaluated_at: DateTime<Utc>,
}

impl EvaluationResult {
    pub fn matched(
        matched: bool,
        current_value: f64,
        threshold: f64,
        details: Map<String, Value>,
    ) -> Self {
        Self {
            matched,
            current_value: Some(current_value),
            threshold: Some(threshold),
            details,
            error: None,
            evaluated_at: Utc::now(),
        }
    }

    pub fn time_based(matched: bool, details: Map<String, Value>) -> Self {
        Self {
            matched,
            current_value: None,
            threshold: None,
            details,
            error: None,
            evaluated_at: Utc::now(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            matched: false,
            current_value: None,
            threshold: None,
            details: Map::new(),
            error: Some(error.into()),
            evaluated_at: Utc::now(),
        }
    }

    pub fn to_json(&self) -> Value {
        json!({
            "matched": self.matched,
            "current_value": self.current_value,
            "threshold": self.threshold,
            "details": self.details,
            "error": self.error,
            "evaluated_at": self.evaluated_at.to_rfc3339(),
        })
    }
}
