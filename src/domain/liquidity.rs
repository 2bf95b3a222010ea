//! Order-book depth analysis for option ticks.
//!
//! A tick may carry a five-level book on each side. The aggregator reduces it
//! to a [`LiquiditySnapshot`] stored last-write-wins per strike per bucket.

use serde::{Deserialize, Serialize};

/// One price level of the order book.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepthLevel {
    #[serde(default)]
    pub quantity: i64,
    #[serde(default)]
    pub price: f64,
    #[serde(default)]
    pub orders: i64,
}

/// Raw depth payload. The feed publishes bid levels under "buy" and ask
/// levels under "sell".
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DepthPayload {
    #[serde(default)]
    pub buy: Vec<DepthLevel>,
    #[serde(default)]
    pub sell: Vec<DepthLevel>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiquidityTier {
    High,
    Medium,
    Low,
    Illiquid,
}

/// Essential per-strike liquidity metrics derived from one book snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquiditySnapshot {
    pub score: f64,
    pub tier: LiquidityTier,
    pub spread_pct: f64,
    pub spread_abs: f64,
    pub depth_imbalance_pct: f64,
    pub book_pressure: f64,
    pub total_bid_quantity: i64,
    pub total_ask_quantity: i64,
    pub depth_at_best_bid: i64,
    pub depth_at_best_ask: i64,
}

fn round_to(value: f64, places: u32) -> f64 {
    let factor = 10_f64.powi(places as i32);
    (value * factor).round() / factor
}

/// Reduce a book snapshot to liquidity metrics. Returns `None` when either
/// side of the book is empty or the traded price is unusable.
pub fn analyze_depth(depth: &DepthPayload, last_price: f64) -> Option<LiquiditySnapshot> {
    if depth.buy.is_empty() || depth.sell.is_empty() || last_price <= 0.0 {
        return None;
    }

    let best_bid = depth.buy[0].price;
    let best_ask = depth.sell[0].price;
    let spread_abs = best_ask - best_bid;
    let mid_price = (best_bid + best_ask) / 2.0;
    let spread_pct = if mid_price > 0.0 { spread_abs / mid_price * 100.0 } else { 0.0 };

    let total_bid_qty: i64 = depth.buy.iter().map(|l| l.quantity).sum();
    let total_ask_qty: i64 = depth.sell.iter().map(|l| l.quantity).sum();
    let total_orders: i64 = depth.buy.iter().chain(depth.sell.iter()).map(|l| l.orders).sum();

    let total_qty = total_bid_qty + total_ask_qty;
    let depth_imbalance_pct = if total_qty > 0 {
        (total_bid_qty - total_ask_qty) as f64 / total_qty as f64 * 100.0
    } else {
        0.0
    };
    let book_pressure = (depth_imbalance_pct / 100.0).clamp(-1.0, 1.0);

    // Composite score: spread tightness 40%, depth 30%, order count 20%,
    // book balance 10%.
    let spread_score = (100.0 - (spread_pct * 200.0).min(100.0)).max(0.0);
    let depth_score = (total_qty as f64 / 10.0).min(100.0);
    let order_score = (total_orders as f64).min(100.0);
    let balance_score = (100.0 - depth_imbalance_pct.abs() * 2.0).max(0.0);
    let score =
        spread_score * 0.40 + depth_score * 0.30 + order_score * 0.20 + balance_score * 0.10;

    let tier = if score >= 80.0 {
        LiquidityTier::High
    } else if score >= 60.0 {
        LiquidityTier::Medium
    } else if score >= 40.0 {
        LiquidityTier::Low
    } else {
        LiquidityTier::Illiquid
    };

    Some(LiquiditySnapshot {
        score: round_to(score, 2),
        tier,
        spread_pct: round_to(spread_pct, 4),
        spread_abs: round_to(spread_abs, 2),
        depth_imbalance_pct: round_to(depth_imbalance_pct, 2),
        book_pressure: round_to(book_pressure, 4),
        total_bid_quantity: total_bid_qty,
        total_ask_quantity: total_ask_qty,
        depth_at_best_bid: depth.buy[0].quantity,
        depth_at_best_ask: depth.sell[0].quantity,
    })
}
