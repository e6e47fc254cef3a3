use crate::{
    config::Config,
    db::{self, Database},
    error::{AppError, Result},
    models::{BasketItem, ProductSelector, SnapshotItem},
};
use chrono::Utc;
use std::collections::HashMap;

/// Per-unit reservation with basket timeouts. Every mutation runs inside a
/// single transaction; the conditional `available > reserved` update is the
/// primitive that serializes reservations of the same unit across users.
pub struct ReservationEngine {
    db: Database,
    config: Config,
}

impl ReservationEngine {
    pub fn new(db: Database, config: Config) -> Self {
        Self { db, config }
    }

    /// Reserve one unit matching the selector and append it to the user's
    /// basket. Exactly one of: a basket row exists and `reserved` went up by
    /// one, or nothing changed and the caller sees `OutOfStock`. A transient
    /// store error rolls back and retries; `OutOfStock` never retries.
    pub async fn add_to_basket(
        &self,
        user_id: i64,
        selector: &ProductSelector,
    ) -> Result<BasketItem> {
        db::with_retry("add_to_basket", || self.try_add_to_basket(user_id, selector)).await
    }

    async fn try_add_to_basket(
        &self,
        user_id: i64,
        selector: &ProductSelector,
    ) -> Result<BasketItem> {
        let mut tx = self.db.pool().begin().await?;

        let candidate: Option<i64> = sqlx::query_scalar(
            "SELECT id FROM products
             WHERE city = $1 AND district = $2 AND product_type = $3
               AND size = $4 AND price = $5 AND available > reserved
             ORDER BY id ASC
             LIMIT 1",
        )
        .bind(&selector.city)
        .bind(&selector.district)
        .bind(&selector.product_type)
        .bind(&selector.size)
        .bind(selector.price)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(product_id) = candidate else {
            tx.rollback().await?;
            return Err(AppError::OutOfStock);
        };

        // Lost the race between SELECT and UPDATE: someone else took the
        // last unit. The predicate keeps reserved <= available.
        let reserved = sqlx::query(
            "UPDATE products SET reserved = reserved + 1
             WHERE id = $1 AND available > reserved",
        )
        .bind(product_id)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(AppError::OutOfStock);
        }

        let item = sqlx::query_as::<_, BasketItem>(
            "INSERT INTO basket_items
                (user_id, product_id, reserved_at, price_snapshot, product_type_snapshot)
             VALUES ($1, $2, NOW(), $3, $4)
             RETURNING *",
        )
        .bind(user_id)
        .bind(product_id)
        .bind(selector.price)
        .bind(&selector.product_type)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            "User {} reserved product {} ({} {})",
            user_id,
            product_id,
            selector.product_type,
            selector.size
        );
        Ok(item)
    }

    /// Remove the oldest basket entry for this product and release its unit.
    /// Returns false when the user has no such entry.
    pub async fn remove_from_basket(&self, user_id: i64, product_id: i64) -> Result<bool> {
        db::with_retry("remove_from_basket", || {
            self.try_remove_from_basket(user_id, product_id)
        })
        .await
    }

    async fn try_remove_from_basket(&self, user_id: i64, product_id: i64) -> Result<bool> {
        let mut tx = self.db.pool().begin().await?;

        let removed: Option<i64> = sqlx::query_scalar(
            "DELETE FROM basket_items
             WHERE id = (SELECT id FROM basket_items
                         WHERE user_id = $1 AND product_id = $2
                         ORDER BY reserved_at ASC LIMIT 1)
             RETURNING id",
        )
        .bind(user_id)
        .bind(product_id)
        .fetch_optional(&mut *tx)
        .await?;

        if removed.is_none() {
            tx.rollback().await?;
            return Ok(false);
        }

        self.release_unit(&mut tx, product_id).await?;
        tx.commit().await?;
        Ok(true)
    }

    /// Fetch the live basket, releasing expired entries first.
    pub async fn current_basket(&self, user_id: i64) -> Result<Vec<BasketItem>> {
        self.release_expired(user_id).await?;
        let items = sqlx::query_as::<_, BasketItem>(
            "SELECT * FROM basket_items WHERE user_id = $1 ORDER BY reserved_at ASC",
        )
        .bind(user_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(items)
    }

    /// Drop entries older than the basket timeout, except those covered by a
    /// live purchase deposit for the same user: a pending payment freezes its
    /// units regardless of age.
    pub async fn release_expired(&self, user_id: i64) -> Result<u64> {
        let cutoff = Utc::now() - self.config.basket_timeout();

        let mut tx = self.db.pool().begin().await?;

        let expired = sqlx::query_as::<_, BasketItem>(
            "SELECT * FROM basket_items
             WHERE user_id = $1 AND reserved_at < $2
             ORDER BY reserved_at ASC",
        )
        .bind(user_id)
        .bind(cutoff)
        .fetch_all(&mut *tx)
        .await?;

        if expired.is_empty() {
            tx.rollback().await?;
            return Ok(0);
        }

        let mut covered = self.pending_hold_counts(&mut tx, user_id).await?;

        let mut released = 0u64;
        for item in expired {
            if let Some(count) = covered.get_mut(&item.product_id) {
                if *count > 0 {
                    *count -= 1;
                    continue;
                }
            }

            sqlx::query("DELETE FROM basket_items WHERE id = $1")
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
            self.release_unit(&mut tx, item.product_id).await?;
            released += 1;
        }

        tx.commit().await?;

        if released > 0 {
            tracing::info!("Released {} expired basket item(s) for user {}", released, user_id);
        }
        Ok(released)
    }

    /// Sweeper entry point: run the per-user expiry for everyone with an
    /// over-age basket entry. Idempotent and safe to overlap.
    pub async fn release_expired_all(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.config.basket_timeout();
        let user_ids = sqlx::query_scalar::<_, i64>(
            "SELECT DISTINCT user_id FROM basket_items WHERE reserved_at < $1",
        )
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await?;

        let mut total = 0u64;
        for user_id in user_ids {
            match self.release_expired(user_id).await {
                Ok(n) => total += n,
                Err(err) => {
                    tracing::error!("Basket expiry failed for user {}: {}", user_id, err)
                }
            }
        }
        Ok(total)
    }

    /// Remove all basket entries for a user, releasing each unit.
    pub async fn clear_basket(&self, user_id: i64) -> Result<u64> {
        let mut tx = self.db.pool().begin().await?;

        let product_ids: Vec<i64> = sqlx::query_scalar(
            "DELETE FROM basket_items WHERE user_id = $1 RETURNING product_id",
        )
        .bind(user_id)
        .fetch_all(&mut *tx)
        .await?;

        for product_id in &product_ids {
            self.release_unit(&mut tx, *product_id).await?;
        }

        tx.commit().await?;
        Ok(product_ids.len() as u64)
    }

    /// Decrement `reserved` for the exact multiset of products in a payment
    /// snapshot. Used when a payment fails, expires, or underpays. Units
    /// already released (e.g. by the abandoned-reservation sweeper after a
    /// bug) are skipped, never driven negative.
    pub async fn release_snapshot(&self, snapshot: &[SnapshotItem]) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        for item in snapshot {
            self.release_unit(&mut tx, item.product_id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Clamp `reserved` counts that exceed the live holds (basket rows plus
    /// purchase-deposit snapshots). Only reachable after a prior bug or
    /// crash; every clamp is logged for the audit trail.
    pub async fn clean_abandoned_reservations(&self) -> Result<u64> {
        let mut tx = self.db.pool().begin().await?;

        let reserved_rows: Vec<(i64, i32)> =
            sqlx::query_as("SELECT id, reserved FROM products WHERE reserved > 0")
                .fetch_all(&mut *tx)
                .await?;

        let basket_counts: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT product_id, COUNT(*) FROM basket_items GROUP BY product_id",
        )
        .fetch_all(&mut *tx)
        .await?;
        let mut expected: HashMap<i64, i64> = basket_counts.into_iter().collect();

        let snapshots: Vec<sqlx::types::Json<Vec<SnapshotItem>>> = sqlx::query_scalar(
            "SELECT basket_snapshot FROM pending_deposits
             WHERE is_purchase AND basket_snapshot IS NOT NULL",
        )
        .fetch_all(&mut *tx)
        .await?;
        for snapshot in snapshots {
            for item in snapshot.0 {
                *expected.entry(item.product_id).or_insert(0) += 1;
            }
        }

        // A basket row and its covering deposit snapshot refer to the same
        // single hold, so the expected count is the max of the two sources,
        // not their sum. Approximate by capping at basket+snapshot and only
        // clamping clear excess.
        let mut clamped = 0u64;
        for (product_id, reserved) in reserved_rows {
            let allowed = expected.get(&product_id).copied().unwrap_or(0);
            if i64::from(reserved) > allowed {
                let result = sqlx::query(
                    "UPDATE products SET reserved = $1 WHERE id = $2 AND reserved = $3",
                )
                .bind(allowed as i32)
                .bind(product_id)
                .bind(reserved)
                .execute(&mut *tx)
                .await?;
                if result.rows_affected() > 0 {
                    tracing::warn!(
                        "Reservation skew: product {} reserved {} > held {}; clamped",
                        product_id,
                        reserved,
                        allowed
                    );
                    clamped += 1;
                }
            }
        }

        tx.commit().await?;
        Ok(clamped)
    }

    /// Conditional decrement; the `reserved > 0` guard is the MAX(0, n-1)
    /// clamp. A zero-row update means the count had already diverged and is
    /// logged so the skew shows up in audit.
    async fn release_unit(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        product_id: i64,
    ) -> Result<()> {
        let result = sqlx::query(
            "UPDATE products SET reserved = reserved - 1 WHERE id = $1 AND reserved > 0",
        )
        .bind(product_id)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            tracing::warn!(
                "Release clamp hit: product {} reserved count was already 0",
                product_id
            );
        }
        Ok(())
    }

    /// How many units of each product are frozen for this user by live
    /// purchase deposits.
    async fn pending_hold_counts(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: i64,
    ) -> Result<HashMap<i64, i64>> {
        let snapshots: Vec<sqlx::types::Json<Vec<SnapshotItem>>> = sqlx::query_scalar(
            "SELECT basket_snapshot FROM pending_deposits
             WHERE user_id = $1 AND is_purchase AND basket_snapshot IS NOT NULL",
        )
        .bind(user_id)
        .fetch_all(&mut **tx)
        .await?;

        let mut counts = HashMap::new();
        for snapshot in snapshots {
            for item in snapshot.0 {
                *counts.entry(item.product_id).or_insert(0) += 1;
            }
        }
        Ok(counts)
    }
}
