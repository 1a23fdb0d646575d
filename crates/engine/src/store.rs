use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use common::{
    Market, OrderResult, OrderSide, Position, PositionStatus, QueuedTrade, Result, StopLossMode,
    WatchedAsset,
};

/// One persisted execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: String,
    pub session_id: Option<String>,
    pub ticker: String,
    pub side: OrderSide,
    pub order_type: String,
    pub requested_price: f64,
    pub executed_price: f64,
    pub requested_quantity: f64,
    pub executed_quantity: f64,
    pub fee: f64,
    pub total_value: f64,
    pub state: String,
    pub upstream_order_id: Option<String>,
    pub executed_at: DateTime<Utc>,
}

impl TradeRecord {
    pub fn from_result(
        result: &OrderResult,
        session_id: Option<String>,
        requested_price: f64,
        order_type: &str,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            session_id,
            ticker: result.ticker.clone(),
            side: result.side,
            order_type: order_type.to_string(),
            requested_price,
            executed_price: result.avg_price,
            requested_quantity: result.requested_quantity,
            executed_quantity: result.filled_quantity,
            fee: 0.0,
            total_value: result.total_value(),
            state: result.status.to_string(),
            upstream_order_id: Some(result.order_id.clone()),
            executed_at: result.filled_at.unwrap_or(result.created_at),
        }
    }
}

/// Thin persistence wrapper over the SQLite pool. All queries are
/// runtime-bound; schema lives in `migrations/`.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    // ── Positions ────────────────────────────────────────────────────────

    pub async fn upsert_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            "INSERT INTO positions
                 (ticker, name, market, quantity, avg_price, stop_loss, take_profit,
                  stop_loss_mode, status, risk_score, session_id, opened_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
             ON CONFLICT(ticker) DO UPDATE SET
                 quantity = ?4, avg_price = ?5, stop_loss = ?6, take_profit = ?7,
                 stop_loss_mode = ?8, status = ?9, last_updated = ?13",
        )
        .bind(&position.ticker)
        .bind(&position.name)
        .bind(position.market)
        .bind(position.quantity)
        .bind(position.avg_price)
        .bind(position.stop_loss)
        .bind(position.take_profit)
        .bind(position.stop_loss_mode)
        .bind(position.status)
        .bind(position.risk_score)
        .bind(&position.session_id)
        .bind(position.opened_at.to_rfc3339())
        .bind(position.last_updated.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn delete_position(&self, ticker: &str) -> Result<()> {
        sqlx::query("DELETE FROM positions WHERE ticker = ?1")
            .bind(ticker)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn load_positions(&self) -> Result<Vec<Position>> {
        let rows: Vec<PositionRow> = sqlx::query_as(
            "SELECT ticker, name, market, quantity, avg_price, stop_loss, take_profit,
                    stop_loss_mode, status, risk_score, session_id, opened_at, last_updated
             FROM positions",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PositionRow::into_position).collect())
    }

    // ── Trades ───────────────────────────────────────────────────────────

    pub async fn record_trade(&self, trade: &TradeRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO trades
                 (id, session_id, ticker, side, order_type, requested_price, executed_price,
                  requested_quantity, executed_quantity, fee, total_value, state,
                  upstream_order_id, executed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        )
        .bind(&trade.id)
        .bind(&trade.session_id)
        .bind(&trade.ticker)
        .bind(trade.side)
        .bind(&trade.order_type)
        .bind(trade.requested_price)
        .bind(trade.executed_price)
        .bind(trade.requested_quantity)
        .bind(trade.executed_quantity)
        .bind(trade.fee)
        .bind(trade.total_value)
        .bind(&trade.state)
        .bind(&trade.upstream_order_id)
        .bind(trade.executed_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Sessions ─────────────────────────────────────────────────────────

    pub async fn upsert_session(
        &self,
        session_id: &str,
        ticker: &str,
        market: Market,
        stage: &str,
        reanalyze_count: u32,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO sessions (id, ticker, market, stage, reanalyze_count, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET stage = ?4, reanalyze_count = ?5, updated_at = ?6",
        )
        .bind(session_id)
        .bind(ticker)
        .bind(market)
        .bind(stage)
        .bind(reanalyze_count)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // ── Watch list / trade queue ─────────────────────────────────────────

    pub async fn upsert_watch(&self, watch: &WatchedAsset) -> Result<()> {
        sqlx::query(
            "INSERT INTO watch_list (id, session_id, ticker, name, market, payload, status, added_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(id) DO UPDATE SET payload = ?6, status = ?7",
        )
        .bind(&watch.id)
        .bind(&watch.session_id)
        .bind(&watch.ticker)
        .bind(&watch.name)
        .bind(watch.market)
        .bind(serde_json::to_string(watch)?)
        .bind(watch.status)
        .bind(watch.added_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_queued_trade(&self, queued: &QueuedTrade) -> Result<()> {
        sqlx::query(
            "INSERT INTO trade_queue (id, ticker, payload, status, queued_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(id) DO UPDATE SET payload = ?3, status = ?4",
        )
        .bind(&queued.id)
        .bind(&queued.proposal.ticker)
        .bind(serde_json::to_string(queued)?)
        .bind(queued.status)
        .bind(queued.queued_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[derive(sqlx::FromRow)]
struct PositionRow {
    ticker: String,
    name: String,
    market: Market,
    quantity: f64,
    avg_price: f64,
    stop_loss: Option<f64>,
    take_profit: Option<f64>,
    stop_loss_mode: StopLossMode,
    status: PositionStatus,
    risk_score: f64,
    session_id: Option<String>,
    opened_at: String,
    last_updated: String,
}

impl PositionRow {
    fn into_position(self) -> Position {
        Position {
            ticker: self.ticker,
            name: self.name,
            market: self.market,
            quantity: self.quantity,
            avg_price: self.avg_price,
            current_price: self.avg_price,
            stop_loss: self.stop_loss,
            take_profit: self.take_profit,
            stop_loss_mode: self.stop_loss_mode,
            status: self.status,
            risk_score: self.risk_score,
            session_id: self.session_id,
            opened_at: parse_rfc3339(&self.opened_at),
            last_updated: parse_rfc3339(&self.last_updated),
        }
    }
}

fn parse_rfc3339(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
