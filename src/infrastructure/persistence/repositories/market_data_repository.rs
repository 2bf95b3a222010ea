use crate::domain::market::{
    ExpiryMetricsRow, OptionStatsColumn, StrikeRow, UnderlyingBarRow,
};
use crate::domain::repositories::MarketDataRepository;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use sqlx::{Row, SqlitePool};

const EXPIRY_FORMAT: &str = "%Y-%m-%d";

pub struct SqliteMarketDataRepository {
    pool: SqlitePool,
}

impl SqliteMarketDataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn encode_expiry(expiry: NaiveDate) -> String {
    expiry.format(EXPIRY_FORMAT).to_string()
}

fn decode_expiry(raw: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(raw, EXPIRY_FORMAT)
        .with_context(|| format!("Invalid expiry in storage: {raw}"))
}

fn decode_stats(raw: &str) -> Result<OptionStatsColumn> {
    serde_json::from_str(raw).context("Invalid stats column in storage")
}

#[async_trait]
impl MarketDataRepository for SqliteMarketDataRepository {
    async fn upsert_strike_rows(&self, rows: &[StrikeRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO fo_strike_buckets
                (timeframe, symbol, expiry, strike, bucket_time,
                 underlying_close, call_stats, put_stats, liquidity)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (timeframe, symbol, expiry, strike, bucket_time)
                DO UPDATE SET
                    underlying_close = excluded.underlying_close,
                    call_stats = excluded.call_stats,
                    put_stats = excluded.put_stats,
                    liquidity = excluded.liquidity
                "#,
            )
            .bind(&row.timeframe)
            .bind(&row.symbol)
            .bind(encode_expiry(row.expiry))
            .bind(row.strike)
            .bind(row.bucket_time)
            .bind(row.underlying_close)
            .bind(serde_json::to_string(&row.call)?)
            .bind(serde_json::to_string(&row.put)?)
            .bind(row.liquidity.as_ref().map(serde_json::to_string).transpose()?)
            .execute(&self.pool)
            .await
            .context("Failed to upsert strike row")?;
        }
        Ok(())
    }

    async fn upsert_expiry_metrics(&self, rows: &[ExpiryMetricsRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO fo_expiry_metrics
                (timeframe, symbol, expiry, bucket_time, underlying_close,
                 total_call_volume, total_put_volume, total_call_oi, total_put_oi,
                 pcr, max_pain_strike)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (timeframe, symbol, expiry, bucket_time)
                DO UPDATE SET
                    underlying_close = excluded.underlying_close,
                    total_call_volume = excluded.total_call_volume,
                    total_put_volume = excluded.total_put_volume,
                    total_call_oi = excluded.total_call_oi,
                    total_put_oi = excluded.total_put_oi,
                    pcr = excluded.pcr,
                    max_pain_strike = excluded.max_pain_strike
                "#,
            )
            .bind(&row.timeframe)
            .bind(&row.symbol)
            .bind(encode_expiry(row.expiry))
            .bind(row.bucket_time)
            .bind(row.underlying_close)
            .bind(row.total_call_volume)
            .bind(row.total_put_volume)
            .bind(row.total_call_oi)
            .bind(row.total_put_oi)
            .bind(row.pcr)
            .bind(row.max_pain_strike)
            .execute(&self.pool)
            .await
            .context("Failed to upsert expiry metrics")?;
        }
        Ok(())
    }

    async fn upsert_underlying_bars(&self, rows: &[UnderlyingBarRow]) -> Result<()> {
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO underlying_bars
                (symbol, timeframe, time, open, high, low, close, volume, source)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (symbol, timeframe, time)
                DO UPDATE SET
                    open = excluded.open,
                    high = excluded.high,
                    low = excluded.low,
                    close = excluded.close,
                    volume = excluded.volume,
                    source = excluded.source
                "#,
            )
            .bind(&row.symbol)
            .bind(&row.timeframe)
            .bind(row.time)
            .bind(row.open)
            .bind(row.high)
            .bind(row.low)
            .bind(row.close)
            .bind(row.volume)
            .bind(&row.source)
            .execute(&self.pool)
            .await
            .context("Failed to upsert underlying bar")?;
        }
        Ok(())
    }

    async fn fetch_strike_rows(
        &self,
        symbol: &str,
        timeframe: &str,
        expiries: &[NaiveDate],
        time_range: Option<(i64, i64)>,
    ) -> Result<Vec<StrikeRow>> {
        if expiries.is_empty() {
            return Ok(vec![]);
        }
        let placeholders = vec!["?"; expiries.len()].join(", ");
        let mut sql = format!(
            "SELECT timeframe, symbol, expiry, strike, bucket_time, underlying_close, \
                    call_stats, put_stats, liquidity \
             FROM fo_strike_buckets \
             WHERE symbol = ? AND timeframe = ? AND expiry IN ({placeholders})"
        );
        if time_range.is_some() {
            sql.push_str(" AND bucket_time >= ? AND bucket_time <= ?");
        }
        sql.push_str(" ORDER BY bucket_time ASC, strike ASC");

        let mut query = sqlx::query(&sql).bind(symbol).bind(timeframe);
        for expiry in expiries {
            query = query.bind(encode_expiry(*expiry));
        }
        if let Some((from, to)) = time_range {
            query = query.bind(from).bind(to);
        }

        let rows = query.fetch_all(&self.pool).await.context("Failed to fetch strike rows")?;
        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let expiry: String = row.try_get("expiry")?;
            let call_stats: String = row.try_get("call_stats")?;
            let put_stats: String = row.try_get("put_stats")?;
            let liquidity: Option<String> = row.try_get("liquidity")?;
            result.push(StrikeRow {
                bucket_time: row.try_get("bucket_time")?,
                timeframe: row.try_get("timeframe")?,
                symbol: row.try_get("symbol")?,
                expiry: decode_expiry(&expiry)?,
                strike: row.try_get("strike")?,
                underlying_close: row.try_get("underlying_close")?,
                call: decode_stats(&call_stats)?,
                put: decode_stats(&put_stats)?,
                liquidity: liquidity.as_deref().map(serde_json::from_str).transpose()?,
            });
        }
        Ok(result)
    }

    async fn list_expiries(&self, symbol: &str) -> Result<Vec<NaiveDate>> {
        let rows = sqlx::query(
            "SELECT DISTINCT expiry FROM fo_strike_buckets WHERE symbol = ? ORDER BY expiry ASC",
        )
        .bind(symbol)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list expiries")?;

        rows.into_iter()
            .map(|row| {
                let expiry: String = row.try_get("expiry")?;
                decode_expiry(&expiry)
            })
            .collect()
    }

    async fn next_expiries(&self, symbol: &str, limit: i64) -> Result<Vec<NaiveDate>> {
        let today = encode_expiry(chrono::Utc::now().date_naive());
        let rows = sqlx::query(
            "SELECT DISTINCT expiry FROM fo_strike_buckets \
             WHERE symbol = ? AND expiry >= ? ORDER BY expiry ASC LIMIT ?",
        )
        .bind(symbol)
        .bind(today)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch next expiries")?;

        rows.into_iter()
            .map(|row| {
                let expiry: String = row.try_get("expiry")?;
                decode_expiry(&expiry)
            })
            .collect()
    }
}
