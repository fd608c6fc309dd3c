//! PostgreSQL-backed store

use alloy_primitives::U256;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use tracing::{debug, info};

use crate::config::DatabaseConfig;
use crate::error::{RelayerError, RelayerResult};
use crate::events::LedgerEvent;
use crate::state::{Alert, SwapStats, SwapStore};
use crate::types::{
    CancelReason, Escrow, Hashlock, LedgerSide, Order, OrderId, OrderStatus, PartialFillPolicy,
    Secret, TxId, WinningBid,
};

pub struct PgSwapStore {
    pool: PgPool,
}

impl PgSwapStore {
    pub async fn new(config: &DatabaseConfig) -> RelayerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .connect(&config.url)
            .await
            .map_err(RelayerError::Database)?;

        Ok(Self { pool })
    }

    /// Run database migrations
    pub async fn run_migrations(&self) -> RelayerResult<()> {
        // In production, use sqlx::migrate!
        // For now, create tables inline

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orders (
                id BYTEA PRIMARY KEY,
                maker_asset TEXT NOT NULL,
                taker_asset TEXT NOT NULL,
                maker_amount TEXT NOT NULL,
                taker_amount TEXT NOT NULL,
                maker_address TEXT NOT NULL,
                dst_address TEXT NOT NULL,
                deadline TIMESTAMPTZ NOT NULL,
                hashlock BYTEA NOT NULL,
                timelock TIMESTAMPTZ NOT NULL,
                partial_allowed BOOLEAN NOT NULL,
                min_fill TEXT NOT NULL,
                status VARCHAR(30) NOT NULL,
                remaining_amount TEXT NOT NULL,
                auction_start TIMESTAMPTZ,
                winning_resolver TEXT,
                winning_input TEXT,
                winning_output TEXT,
                revealed_secret BYTEA,
                cancel_reason VARCHAR(30),
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_orders_status
            ON orders (status)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS escrows (
                order_id BYTEA NOT NULL,
                side VARCHAR(12) NOT NULL,
                address TEXT NOT NULL,
                amount TEXT NOT NULL,
                hashlock BYTEA NOT NULL,
                timelock TIMESTAMPTZ NOT NULL,
                claimed BOOLEAN NOT NULL DEFAULT FALSE,
                refunded BOOLEAN NOT NULL DEFAULT FALSE,
                deposit_tx TEXT NOT NULL,
                claim_tx TEXT,
                refund_tx TEXT,
                created_at TIMESTAMPTZ NOT NULL,
                PRIMARY KEY (order_id, side)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_escrows_open
            ON escrows (timelock) WHERE NOT claimed AND NOT refunded
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS ledger_checkpoints (
                ledger VARCHAR(12) PRIMARY KEY,
                cursor BIGINT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swap_events (
                id BIGSERIAL PRIMARY KEY,
                ledger VARCHAR(12) NOT NULL,
                cursor BIGINT NOT NULL,
                order_id BYTEA NOT NULL,
                event_type VARCHAR(50) NOT NULL,
                event_data JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_events_ledger_cursor
            ON swap_events (ledger, cursor)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS alerts (
                id BIGSERIAL PRIMARY KEY,
                order_id BYTEA,
                kind VARCHAR(50) NOT NULL,
                detail TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("Database migrations complete");
        Ok(())
    }
}

fn parse_u256(value: &str) -> RelayerResult<U256> {
    value
        .parse::<U256>()
        .map_err(|e| RelayerError::Internal(format!("bad amount in store: {}", e)))
}

fn bytes32(bytes: &[u8]) -> RelayerResult<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(RelayerError::Internal(format!(
            "expected 32-byte column, got {}",
            bytes.len()
        )));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}

fn order_from_row(row: &sqlx::postgres::PgRow) -> RelayerResult<Order> {
    let id_bytes: Vec<u8> = row.get("id");
    let hashlock_bytes: Vec<u8> = row.get("hashlock");
    let status_str: String = row.get("status");
    let status = OrderStatus::parse(&status_str)
        .ok_or_else(|| RelayerError::Internal(format!("unknown order status: {}", status_str)))?;
    let cancel_reason: Option<String> = row.get("cancel_reason");

    let winning_bid = match (
        row.get::<Option<String>, _>("winning_resolver"),
        row.get::<Option<String>, _>("winning_input"),
        row.get::<Option<String>, _>("winning_output"),
    ) {
        (Some(resolver), Some(input), Some(output)) => Some(WinningBid {
            resolver,
            input_amount: parse_u256(&input)?,
            output_amount: parse_u256(&output)?,
        }),
        _ => None,
    };

    let revealed_secret = match row.get::<Option<Vec<u8>>, _>("revealed_secret") {
        Some(bytes) => Some(Secret::from_bytes(bytes32(&bytes)?)),
        None => None,
    };

    Ok(Order {
        id: OrderId::from_bytes(bytes32(&id_bytes)?),
        maker_asset: row.get("maker_asset"),
        taker_asset: row.get("taker_asset"),
        maker_amount: parse_u256(row.get::<String, _>("maker_amount").as_str())?,
        taker_amount: parse_u256(row.get::<String, _>("taker_amount").as_str())?,
        maker_address: row.get("maker_address"),
        dst_address: row.get("dst_address"),
        deadline: row.get("deadline"),
        hashlock: Hashlock::from_bytes(bytes32(&hashlock_bytes)?),
        timelock: row.get("timelock"),
        partial_fill: PartialFillPolicy {
            allowed: row.get("partial_allowed"),
            min_fill: parse_u256(row.get::<String, _>("min_fill").as_str())?,
        },
        status,
        remaining_amount: parse_u256(row.get::<String, _>("remaining_amount").as_str())?,
        auction_start: row.get("auction_start"),
        winning_bid,
        revealed_secret,
        cancel_reason: cancel_reason.as_deref().and_then(CancelReason::parse),
        created_at: row.get("created_at"),
    })
}

fn escrow_from_row(row: &sqlx::postgres::PgRow) -> RelayerResult<Escrow> {
    let order_id_bytes: Vec<u8> = row.get("order_id");
    let hashlock_bytes: Vec<u8> = row.get("hashlock");
    let side_str: String = row.get("side");
    let side = LedgerSide::parse(&side_str)
        .ok_or_else(|| RelayerError::Internal(format!("unknown escrow side: {}", side_str)))?;

    Ok(Escrow {
        order_id: OrderId::from_bytes(bytes32(&order_id_bytes)?),
        side,
        address: row.get("address"),
        amount: parse_u256(row.get::<String, _>("amount").as_str())?,
        hashlock: Hashlock::from_bytes(bytes32(&hashlock_bytes)?),
        timelock: row.get("timelock"),
        claimed: row.get("claimed"),
        refunded: row.get("refunded"),
        deposit_tx: TxId(row.get("deposit_tx")),
        claim_tx: row.get::<Option<String>, _>("claim_tx").map(TxId),
        refund_tx: row.get::<Option<String>, _>("refund_tx").map(TxId),
        created_at: row.get("created_at"),
    })
}

#[async_trait]
impl SwapStore for PgSwapStore {
    async fn upsert_order(&self, order: &Order) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO orders
                (id, maker_asset, taker_asset, maker_amount, taker_amount,
                 maker_address, dst_address, deadline, hashlock, timelock,
                 partial_allowed, min_fill, status, remaining_amount,
                 auction_start, winning_resolver, winning_input, winning_output,
                 revealed_secret, cancel_reason, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10,
                    $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            ON CONFLICT (id)
            DO UPDATE SET
                status = $13,
                remaining_amount = $14,
                auction_start = $15,
                winning_resolver = $16,
                winning_input = $17,
                winning_output = $18,
                revealed_secret = $19,
                cancel_reason = $20,
                updated_at = NOW()
            "#,
        )
        .bind(order.id.as_bytes().to_vec())
        .bind(&order.maker_asset)
        .bind(&order.taker_asset)
        .bind(order.maker_amount.to_string())
        .bind(order.taker_amount.to_string())
        .bind(&order.maker_address)
        .bind(&order.dst_address)
        .bind(order.deadline)
        .bind(order.hashlock.as_bytes().to_vec())
        .bind(order.timelock)
        .bind(order.partial_fill.allowed)
        .bind(order.partial_fill.min_fill.to_string())
        .bind(order.status.as_str())
        .bind(order.remaining_amount.to_string())
        .bind(order.auction_start)
        .bind(order.winning_bid.as_ref().map(|b| b.resolver.clone()))
        .bind(order.winning_bid.as_ref().map(|b| b.input_amount.to_string()))
        .bind(order.winning_bid.as_ref().map(|b| b.output_amount.to_string()))
        .bind(order.revealed_secret.as_ref().map(|s| s.as_bytes().to_vec()))
        .bind(order.cancel_reason.map(|r| r.as_str()))
        .bind(order.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_order_status(
        &self,
        order_id: &OrderId,
        status: OrderStatus,
        reason: Option<CancelReason>,
    ) -> RelayerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, cancel_reason = COALESCE($3, cancel_reason), updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id.as_bytes().to_vec())
        .bind(status.as_str())
        .bind(reason.map(|r| r.as_str()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::OrderNotFound {
                order_id: order_id.to_string(),
            });
        }
        debug!("Order {} status -> {}", order_id, status);
        Ok(())
    }

    async fn set_auction_start(
        &self,
        order_id: &OrderId,
        start: DateTime<Utc>,
    ) -> RelayerResult<()> {
        sqlx::query("UPDATE orders SET auction_start = $2, updated_at = NOW() WHERE id = $1")
            .bind(order_id.as_bytes().to_vec())
            .bind(start)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn set_winning_bid(&self, order_id: &OrderId, bid: &WinningBid) -> RelayerResult<()> {
        sqlx::query(
            r#"
            UPDATE orders
            SET winning_resolver = $2, winning_input = $3, winning_output = $4, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(order_id.as_bytes().to_vec())
        .bind(&bid.resolver)
        .bind(bid.input_amount.to_string())
        .bind(bid.output_amount.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn set_revealed_secret(&self, order_id: &OrderId, secret: &Secret) -> RelayerResult<()> {
        sqlx::query("UPDATE orders SET revealed_secret = $2, updated_at = NOW() WHERE id = $1")
            .bind(order_id.as_bytes().to_vec())
            .bind(secret.as_bytes().to_vec())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn update_remaining(&self, order_id: &OrderId, remaining: U256) -> RelayerResult<()> {
        sqlx::query("UPDATE orders SET remaining_amount = $2, updated_at = NOW() WHERE id = $1")
            .bind(order_id.as_bytes().to_vec())
            .bind(remaining.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_order(&self, order_id: &OrderId) -> RelayerResult<Option<Order>> {
        let row = sqlx::query("SELECT * FROM orders WHERE id = $1")
            .bind(order_id.as_bytes().to_vec())
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(order_from_row).transpose()
    }

    async fn open_orders(&self) -> RelayerResult<Vec<Order>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM orders
            WHERE status NOT IN ('settled', 'expired_refunded', 'cancelled')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(order_from_row).collect()
    }

    async fn record_escrow(&self, escrow: &Escrow) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO escrows
                (order_id, side, address, amount, hashlock, timelock,
                 claimed, refunded, deposit_tx, claim_tx, refund_tx, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (order_id, side)
            DO UPDATE SET claimed = $7, refunded = $8, claim_tx = $10, refund_tx = $11
            "#,
        )
        .bind(escrow.order_id.as_bytes().to_vec())
        .bind(escrow.side.as_str())
        .bind(&escrow.address)
        .bind(escrow.amount.to_string())
        .bind(escrow.hashlock.as_bytes().to_vec())
        .bind(escrow.timelock)
        .bind(escrow.claimed)
        .bind(escrow.refunded)
        .bind(&escrow.deposit_tx.0)
        .bind(escrow.claim_tx.as_ref().map(|tx| tx.0.clone()))
        .bind(escrow.refund_tx.as_ref().map(|tx| tx.0.clone()))
        .bind(escrow.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_escrow_claimed(
        &self,
        order_id: &OrderId,
        side: LedgerSide,
        tx: Option<&TxId>,
    ) -> RelayerResult<()> {
        let result = sqlx::query(
            "UPDATE escrows SET claimed = TRUE, claim_tx = COALESCE($3, claim_tx)
             WHERE order_id = $1 AND side = $2",
        )
        .bind(order_id.as_bytes().to_vec())
        .bind(side.as_str())
        .bind(tx.map(|tx| tx.0.clone()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::EscrowNotFound {
                order_id: order_id.to_string(),
                side,
            });
        }
        Ok(())
    }

    async fn set_escrow_refunded(
        &self,
        order_id: &OrderId,
        side: LedgerSide,
        tx: Option<&TxId>,
    ) -> RelayerResult<()> {
        let result = sqlx::query(
            "UPDATE escrows SET refunded = TRUE, refund_tx = COALESCE($3, refund_tx)
             WHERE order_id = $1 AND side = $2",
        )
        .bind(order_id.as_bytes().to_vec())
        .bind(side.as_str())
        .bind(tx.map(|tx| tx.0.clone()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(RelayerError::EscrowNotFound {
                order_id: order_id.to_string(),
                side,
            });
        }
        Ok(())
    }

    async fn escrows_for(&self, order_id: &OrderId) -> RelayerResult<Vec<Escrow>> {
        let rows = sqlx::query("SELECT * FROM escrows WHERE order_id = $1 ORDER BY side ASC")
            .bind(order_id.as_bytes().to_vec())
            .fetch_all(&self.pool)
            .await?;

        rows.iter().map(escrow_from_row).collect()
    }

    async fn open_escrows(&self) -> RelayerResult<Vec<Escrow>> {
        let rows =
            sqlx::query("SELECT * FROM escrows WHERE NOT claimed AND NOT refunded ORDER BY timelock")
                .fetch_all(&self.pool)
                .await?;

        rows.iter().map(escrow_from_row).collect()
    }

    async fn get_checkpoint(&self, ledger: LedgerSide) -> RelayerResult<u64> {
        let row = sqlx::query("SELECT cursor FROM ledger_checkpoints WHERE ledger = $1")
            .bind(ledger.as_str())
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| r.get::<i64, _>("cursor") as u64).unwrap_or(0))
    }

    async fn save_checkpoint(&self, ledger: LedgerSide, cursor: u64) -> RelayerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_checkpoints (ledger, cursor, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (ledger)
            DO UPDATE SET cursor = $2, updated_at = NOW()
            "#,
        )
        .bind(ledger.as_str())
        .bind(cursor as i64)
        .execute(&self.pool)
        .await?;

        debug!("Saved checkpoint for {}: cursor {}", ledger, cursor);
        Ok(())
    }

    async fn store_event(&self, event: &LedgerEvent) -> RelayerResult<()> {
        let event_data = serde_json::to_value(event)
            .map_err(|e| RelayerError::Internal(e.to_string()))?;

        sqlx::query(
            r#"
            INSERT INTO swap_events (ledger, cursor, order_id, event_type, event_data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(event.ledger().as_str())
        .bind(event.cursor() as i64)
        .bind(event.order_id().as_bytes().to_vec())
        .bind(event.name())
        .bind(event_data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn claim_secrets_for(&self, order_id: &OrderId) -> RelayerResult<Vec<Secret>> {
        let rows = sqlx::query(
            r#"
            SELECT event_data FROM swap_events
            WHERE order_id = $1 AND event_type = 'EscrowClaimed'
            ORDER BY id ASC
            "#,
        )
        .bind(order_id.as_bytes().to_vec())
        .fetch_all(&self.pool)
        .await?;

        let mut secrets = Vec::with_capacity(rows.len());
        for row in rows {
            let value: serde_json::Value = row.get("event_data");
            let event: LedgerEvent = serde_json::from_value(value).map_err(|e| {
                RelayerError::Internal(format!("bad event row for order {}: {}", order_id, e))
            })?;
            if let LedgerEvent::EscrowClaimed { secret, .. } = event {
                secrets.push(secret);
            }
        }
        Ok(secrets)
    }

    async fn record_alert(
        &self,
        order_id: Option<&OrderId>,
        kind: &str,
        detail: &str,
    ) -> RelayerResult<()> {
        sqlx::query("INSERT INTO alerts (order_id, kind, detail) VALUES ($1, $2, $3)")
            .bind(order_id.map(|id| id.as_bytes().to_vec()))
            .bind(kind)
            .bind(detail)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn recent_alerts(&self, limit: u32) -> RelayerResult<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT order_id, kind, detail, created_at FROM alerts ORDER BY id DESC LIMIT $1",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let order_id: Option<Vec<u8>> = row.get("order_id");
                let order_id = match order_id {
                    Some(bytes) => Some(OrderId::from_bytes(bytes32(&bytes)?)),
                    None => None,
                };
                Ok(Alert {
                    order_id,
                    kind: row.get("kind"),
                    detail: row.get("detail"),
                    created_at: row.get("created_at"),
                })
            })
            .collect()
    }

    async fn stats(&self) -> RelayerResult<SwapStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE status NOT IN ('settled', 'expired_refunded', 'cancelled')) as open,
                COUNT(*) FILTER (WHERE status = 'settled') as settled,
                COUNT(*) FILTER (WHERE status = 'expired_refunded') as refunded,
                COUNT(*) FILTER (WHERE status = 'cancelled') as cancelled
            FROM orders
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        let escrow_row = sqlx::query(
            "SELECT COUNT(*) as open FROM escrows WHERE NOT claimed AND NOT refunded",
        )
        .fetch_one(&self.pool)
        .await?;

        let alert_row = sqlx::query("SELECT COUNT(*) as total FROM alerts")
            .fetch_one(&self.pool)
            .await?;

        Ok(SwapStats {
            orders_open: row.get::<i64, _>("open") as u64,
            orders_settled: row.get::<i64, _>("settled") as u64,
            orders_refunded: row.get::<i64, _>("refunded") as u64,
            orders_cancelled: row.get::<i64, _>("cancelled") as u64,
            escrows_open: escrow_row.get::<i64, _>("open") as u64,
            alerts_total: alert_row.get::<i64, _>("total") as u64,
        })
    }

    async fn health_check(&self) -> RelayerResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(RelayerError::Database)?;
        Ok(())
    }
}
