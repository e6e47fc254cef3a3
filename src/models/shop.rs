use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

// ==================== USER ====================
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub user_id: i64,
    pub username: Option<String>,
    pub balance: Decimal,
    pub total_purchases: i32,
    pub language: String,
    pub is_reseller: bool,
    pub is_banned: bool,
    pub created_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

// ==================== PRODUCT ====================
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Product {
    pub id: i64,
    pub city: String,
    pub district: String,
    pub product_type: String,
    pub size: String,
    pub price: Decimal,
    pub available: i32,
    pub reserved: i32,
    pub original_text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ProductMedia {
    pub id: i64,
    pub product_id: i64,
    pub path: String,
    pub media_kind: String,
    pub telegram_file_id: Option<String>,
}

/// The (city, district, type, size, price) tuple a customer picks from the
/// catalog. One unit of any product matching this tuple is interchangeable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductSelector {
    pub city: String,
    pub district: String,
    pub product_type: String,
    pub size: String,
    pub price: Decimal,
}

// ==================== BASKET ====================
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct BasketItem {
    pub id: i64,
    pub user_id: i64,
    pub product_id: i64,
    pub reserved_at: DateTime<Utc>,
    pub price_snapshot: Decimal,
    pub product_type_snapshot: String,
}

/// Priced view of a basket after both discount layers.
#[derive(Debug, Clone, Serialize)]
pub struct BasketQuote {
    pub subtotal: Decimal,
    pub reseller_discount: Decimal,
    pub after_reseller: Decimal,
    pub code_discount: Decimal,
    pub final_total: Decimal,
    pub applied_code: Option<String>,
}

// ==================== PENDING DEPOSIT ====================

/// One basket entry frozen at payment-intent time, decoupled from the live
/// basket so later basket mutations cannot change what was paid for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotItem {
    pub product_id: i64,
    pub product_name: String,
    pub product_type: String,
    pub size: String,
    pub city: String,
    pub district: String,
    pub price: Decimal,
    pub original_text: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct PendingDeposit {
    pub payment_id: String,
    pub user_id: i64,
    pub currency: String,
    pub target_eur: Decimal,
    pub expected_crypto: Decimal,
    pub is_purchase: bool,
    pub basket_snapshot: Option<sqlx::types::Json<Vec<SnapshotItem>>>,
    pub discount_code: Option<String>,
    pub bot_id: String,
    pub created_at: DateTime<Utc>,
}

impl PendingDeposit {
    pub fn snapshot_items(&self) -> &[SnapshotItem] {
        self.basket_snapshot
            .as_ref()
            .map(|j| j.0.as_slice())
            .unwrap_or(&[])
    }
}

// ==================== PURCHASES ====================
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Purchase {
    pub id: i64,
    pub user_id: i64,
    pub product_id: Option<i64>,
    pub product_name: String,
    pub product_type: String,
    pub size: String,
    pub city: String,
    pub district: String,
    pub price_paid: Decimal,
    pub original_text: String,
    pub payment_id: Option<String>,
    pub bot_id: Option<String>,
    pub purchased_at: DateTime<Utc>,
}

// ==================== DISCOUNTS ====================
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DiscountCode {
    pub code: String,
    pub discount_type: String,
    pub value: Decimal,
    pub is_active: bool,
    pub max_uses: Option<i32>,
    pub max_uses_per_user: Option<i32>,
    pub uses_count: i32,
    pub expiry_at: Option<DateTime<Utc>>,
    pub allowed_cities: Option<sqlx::types::Json<Vec<String>>>,
    pub allowed_types: Option<sqlx::types::Json<Vec<String>>>,
    pub allowed_sizes: Option<sqlx::types::Json<Vec<String>>>,
    pub created_at: DateTime<Utc>,
}

/// Result of a successful code application.
#[derive(Debug, Clone, Serialize)]
pub struct DiscountOutcome {
    pub code: String,
    pub discount_type: String,
    pub value: Decimal,
    pub discount_amount: Decimal,
    pub final_total: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct ResellerRule {
    pub reseller_user_id: i64,
    pub product_type: String,
    pub percent: Decimal,
}

// ==================== ADMIN ====================
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct AdminLogEntry {
    pub id: i64,
    pub admin_id: i64,
    pub action: String,
    pub details: String,
    pub created_at: DateTime<Utc>,
}

// ==================== API ENVELOPE ====================
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}
