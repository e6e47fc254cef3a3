use super::{ensure_varchar_max, Database};
use crate::{
    error::{AppError, Result},
    models::User,
};
use rust_decimal::Decimal;

// ==================== USER QUERIES ====================
impl Database {
    /// First-contact creation is implicit: every inbound update upserts the
    /// row and refreshes username + last_seen.
    pub async fn touch_user(&self, user_id: i64, username: Option<&str>) -> Result<()> {
        if let Some(name) = username {
            ensure_varchar_max("users.username", name, 64)?;
        }

        sqlx::query(
            "INSERT INTO users (user_id, username, last_seen)
             VALUES ($1, $2, NOW())
             ON CONFLICT (user_id)
             DO UPDATE SET username = COALESCE(EXCLUDED.username, users.username),
                           last_seen = NOW()",
        )
        .bind(user_id)
        .bind(username)
        .execute(self.pool())
        .await?;
        Ok(())
    }

    pub async fn get_user(&self, user_id: i64) -> Result<Option<User>> {
        let row = sqlx::query_as::<_, User>("SELECT * FROM users WHERE user_id = $1")
            .bind(user_id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    pub async fn set_language(&self, user_id: i64, language: &str) -> Result<()> {
        ensure_varchar_max("users.language", language, 8)?;
        sqlx::query("UPDATE users SET language = $1 WHERE user_id = $2")
            .bind(language)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_banned(&self, user_id: i64, banned: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_banned = $1 WHERE user_id = $2")
            .bind(banned)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Blocked/deactivated accounts discovered during delivery are marked
    /// inactive; committed purchases are untouched.
    pub async fn mark_inactive(&self, user_id: i64) -> Result<()> {
        sqlx::query("UPDATE users SET is_inactive = TRUE WHERE user_id = $1")
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn set_reseller(&self, user_id: i64, is_reseller: bool) -> Result<()> {
        sqlx::query("UPDATE users SET is_reseller = $1 WHERE user_id = $2")
            .bind(is_reseller)
            .bind(user_id)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    /// Credit with an audit row, one transaction. Every balance movement
    /// (refill, overpayment, underpayment refund, admin adjustment) goes
    /// through here so the adjustment log is complete.
    pub async fn credit_balance(&self, user_id: i64, amount: Decimal, reason: &str) -> Result<()> {
        if amount <= Decimal::ZERO {
            return Err(AppError::BadRequest(
                "Credit amount must be positive".to_string(),
            ));
        }

        let mut tx = self.pool().begin().await?;

        sqlx::query(
            "INSERT INTO users (user_id, last_seen) VALUES ($1, NOW())
             ON CONFLICT (user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE users SET balance = balance + $1 WHERE user_id = $2")
            .bind(amount)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        sqlx::query(
            "INSERT INTO balance_adjustments (user_id, amount, reason) VALUES ($1, $2, $3)",
        )
        .bind(user_id)
        .bind(amount)
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    pub async fn list_user_ids(&self) -> Result<Vec<i64>> {
        let ids = sqlx::query_scalar::<_, i64>(
            "SELECT user_id FROM users WHERE NOT is_banned AND NOT is_inactive",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(ids)
    }
}
