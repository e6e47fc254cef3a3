use super::{ensure_varchar_max, Database};
use crate::{error::Result, models::AdminLogEntry};

// ==================== SETTINGS ====================
impl Database {
    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value =
            sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = $1")
                .bind(key)
                .fetch_optional(self.pool())
                .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        ensure_varchar_max("settings.key", key, 100)?;
        sqlx::query(
            "INSERT INTO settings (key, value) VALUES ($1, $2)
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(self.pool())
        .await?;
        Ok(())
    }
}

// ==================== ADMIN LOG ====================
impl Database {
    /// Append-only audit of administrative mutations.
    pub async fn log_admin_action(&self, admin_id: i64, action: &str, details: &str) -> Result<()> {
        ensure_varchar_max("admin_log.action", action, 100)?;
        sqlx::query("INSERT INTO admin_log (admin_id, action, details) VALUES ($1, $2, $3)")
            .bind(admin_id)
            .bind(action)
            .bind(details)
            .execute(self.pool())
            .await?;
        Ok(())
    }

    pub async fn recent_admin_log(&self, limit: i64) -> Result<Vec<AdminLogEntry>> {
        let rows = sqlx::query_as::<_, AdminLogEntry>(
            "SELECT * FROM admin_log ORDER BY created_at DESC LIMIT $1",
        )
        .bind(limit)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
