use super::{ensure_varchar_max, Database};
use crate::{
    error::{AppError, Result},
    models::{Product, ProductMedia},
};
use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::Row;

#[derive(Debug, Clone, Serialize)]
pub struct NewProduct {
    pub city: String,
    pub district: String,
    pub product_type: String,
    pub size: String,
    pub price: Decimal,
    pub original_text: String,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct InventoryCount {
    pub city: String,
    pub district: String,
    pub product_type: String,
    pub size: String,
    pub price: Decimal,
    pub in_stock: i64,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct SalesTotal {
    pub period: String,
    pub orders: i64,
    pub revenue: Decimal,
}

// ==================== PRODUCT QUERIES ====================
impl Database {
    /// New drops always start as a single unreserved unit.
    pub async fn create_product(&self, new: &NewProduct) -> Result<i64> {
        ensure_varchar_max("products.city", &new.city, 100)?;
        ensure_varchar_max("products.district", &new.district, 100)?;
        ensure_varchar_max("products.product_type", &new.product_type, 100)?;
        ensure_varchar_max("products.size", &new.size, 50)?;
        if new.price <= Decimal::ZERO {
            return Err(AppError::BadRequest("Price must be positive".to_string()));
        }

        let row = sqlx::query(
            "INSERT INTO products (city, district, product_type, size, price, available, reserved, original_text)
             VALUES ($1, $2, $3, $4, $5, 1, 0, $6)
             RETURNING id",
        )
        .bind(&new.city)
        .bind(&new.district)
        .bind(&new.product_type)
        .bind(&new.size)
        .bind(new.price)
        .bind(&new.original_text)
        .fetch_one(self.pool())
        .await?;

        Ok(row.try_get("id")?)
    }

    pub async fn get_product(&self, id: i64) -> Result<Option<Product>> {
        let row = sqlx::query_as::<_, Product>("SELECT * FROM products WHERE id = $1")
            .bind(id)
            .fetch_optional(self.pool())
            .await?;
        Ok(row)
    }

    /// Deletes the row and returns the media paths so the caller can remove
    /// the owned files from disk. Media rows cascade.
    pub async fn delete_product(&self, id: i64) -> Result<Vec<String>> {
        let media = self.product_media(id).await?;

        let result = sqlx::query("DELETE FROM products WHERE id = $1")
            .bind(id)
            .execute(self.pool())
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("Product {} not found", id)));
        }

        Ok(media.into_iter().map(|m| m.path).collect())
    }

    pub async fn product_media(&self, product_id: i64) -> Result<Vec<ProductMedia>> {
        let rows = sqlx::query_as::<_, ProductMedia>(
            "SELECT * FROM product_media WHERE product_id = $1 ORDER BY id ASC",
        )
        .bind(product_id)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn add_product_media(
        &self,
        product_id: i64,
        path: &str,
        media_kind: &str,
        telegram_file_id: Option<&str>,
    ) -> Result<i64> {
        ensure_varchar_max("product_media.media_kind", media_kind, 16)?;
        let row = sqlx::query(
            "INSERT INTO product_media (product_id, path, media_kind, telegram_file_id)
             VALUES ($1, $2, $3, $4)
             RETURNING id",
        )
        .bind(product_id)
        .bind(path)
        .bind(media_kind)
        .bind(telegram_file_id)
        .fetch_one(self.pool())
        .await?;
        Ok(row.try_get("id")?)
    }

    // -------------------- catalog reads --------------------

    pub async fn list_cities(&self) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT city FROM products WHERE available > reserved ORDER BY city ASC",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn list_districts(&self, city: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT district FROM products
             WHERE city = $1 AND available > reserved
             ORDER BY district ASC",
        )
        .bind(city)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    pub async fn list_types(&self, city: &str, district: &str) -> Result<Vec<String>> {
        let rows = sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT product_type FROM products
             WHERE city = $1 AND district = $2 AND available > reserved
             ORDER BY product_type ASC",
        )
        .bind(city)
        .bind(district)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Size/price variants with live stock for one (city, district, type).
    pub async fn list_variants(
        &self,
        city: &str,
        district: &str,
        product_type: &str,
    ) -> Result<Vec<InventoryCount>> {
        let rows = sqlx::query_as::<_, InventoryCount>(
            "SELECT city, district, product_type, size, price,
                    SUM(available - reserved)::BIGINT AS in_stock
             FROM products
             WHERE city = $1 AND district = $2 AND product_type = $3
               AND available > reserved
             GROUP BY city, district, product_type, size, price
             ORDER BY size ASC, price ASC",
        )
        .bind(city)
        .bind(district)
        .bind(product_type)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    // -------------------- derived aggregates --------------------

    pub async fn inventory_summary(&self) -> Result<Vec<InventoryCount>> {
        let rows = sqlx::query_as::<_, InventoryCount>(
            "SELECT city, district, product_type, size, price,
                    SUM(available - reserved)::BIGINT AS in_stock
             FROM products
             GROUP BY city, district, product_type, size, price
             ORDER BY city, district, product_type, size",
        )
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }

    /// Revenue grouped per day over the trailing N days.
    pub async fn sales_totals(&self, days: i64) -> Result<Vec<SalesTotal>> {
        let rows = sqlx::query_as::<_, SalesTotal>(
            "SELECT TO_CHAR(purchased_at::date, 'YYYY-MM-DD') AS period,
                    COUNT(*)::BIGINT AS orders,
                    COALESCE(SUM(price_paid), 0) AS revenue
             FROM purchases
             WHERE purchased_at >= NOW() - make_interval(days => $1)
             GROUP BY purchased_at::date
             ORDER BY purchased_at::date DESC",
        )
        .bind(days)
        .fetch_all(self.pool())
        .await?;
        Ok(rows)
    }
}
