use super::{require_admin_key, AppState};
use crate::{
    db::products::NewProduct,
    error::{AppError, Result},
    models::ApiResponse,
    utils::format_eur,
};
use axum::{
    extract::{Path, State},
    http::HeaderMap,
    Json,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// The admin HTTP surface consumes only the core APIs; every mutation lands
// in the admin log. Mutations authenticate with the x-admin-key header and
// carry the acting admin's id for the audit trail.

#[derive(Debug, Deserialize)]
pub struct AdminRequest<T> {
    pub admin_id: i64,
    #[serde(flatten)]
    pub body: T,
}

// -------------------- products --------------------

#[derive(Debug, Deserialize)]
pub struct CreateProductRequest {
    pub city: String,
    pub district: String,
    pub product_type: String,
    pub size: String,
    pub price: Decimal,
    #[serde(default)]
    pub original_text: String,
}

#[derive(Debug, Serialize)]
pub struct CreatedProduct {
    pub id: i64,
}

/// POST /api/v1/admin/products
pub async fn create_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AdminRequest<CreateProductRequest>>,
) -> Result<Json<ApiResponse<CreatedProduct>>> {
    require_admin_key(&headers, &state)?;

    let new = NewProduct {
        city: req.body.city.trim().to_string(),
        district: req.body.district.trim().to_string(),
        product_type: req.body.product_type.trim().to_string(),
        size: req.body.size.trim().to_string(),
        price: req.body.price,
        original_text: req.body.original_text,
    };
    let id = state.db.create_product(&new).await?;
    state.catalog.refresh().await?;

    state
        .db
        .log_admin_action(
            req.admin_id,
            "product_create",
            &format!(
                "id={} {}/{} {} {} {} EUR",
                id, new.city, new.district, new.product_type, new.size, new.price
            ),
        )
        .await?;

    Ok(Json(ApiResponse::success(CreatedProduct { id })))
}

/// DELETE /api/v1/admin/products/{id}: removes the row and the owned media
/// directory.
pub async fn delete_product(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<AdminRequest<serde_json::Value>>,
) -> Result<Json<ApiResponse<String>>> {
    require_admin_key(&headers, &state)?;

    let media_paths = state.db.delete_product(id).await?;
    let media_dir = std::path::Path::new(&state.config.media_dir).join(id.to_string());
    if media_dir.exists() {
        if let Err(err) = tokio::fs::remove_dir_all(&media_dir).await {
            tracing::warn!("Could not remove media dir {:?}: {}", media_dir, err);
        }
    }
    state.catalog.refresh().await?;

    state
        .db
        .log_admin_action(
            req.admin_id,
            "product_delete",
            &format!("id={} media_files={}", id, media_paths.len()),
        )
        .await?;

    Ok(Json(ApiResponse::success(format!("Product {} deleted", id))))
}

#[derive(Debug, Deserialize)]
pub struct AddMediaRequest {
    pub path: String,
    #[serde(default = "default_media_kind")]
    pub media_kind: String,
    pub telegram_file_id: Option<String>,
}

fn default_media_kind() -> String {
    "photo".to_string()
}

/// POST /api/v1/admin/products/{id}/media: attach a media file already
/// placed under the product's media directory.
pub async fn add_product_media(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<i64>,
    Json(req): Json<AdminRequest<AddMediaRequest>>,
) -> Result<Json<ApiResponse<i64>>> {
    require_admin_key(&headers, &state)?;

    if !matches!(req.body.media_kind.as_str(), "photo" | "video" | "animation") {
        return Err(AppError::BadRequest(
            "media_kind must be photo, video, or animation".to_string(),
        ));
    }
    if state.db.get_product(id).await?.is_none() {
        return Err(AppError::NotFound(format!("Product {} not found", id)));
    }

    let media_id = state
        .db
        .add_product_media(
            id,
            &req.body.path,
            &req.body.media_kind,
            req.body.telegram_file_id.as_deref(),
        )
        .await?;

    state
        .db
        .log_admin_action(
            req.admin_id,
            "product_media_add",
            &format!("product={} path={}", id, req.body.path),
        )
        .await?;

    Ok(Json(ApiResponse::success(media_id)))
}

// -------------------- discount codes --------------------

#[derive(Debug, Deserialize)]
pub struct CreateCodeRequest {
    pub code: String,
    pub discount_type: String,
    pub value: Decimal,
    pub max_uses: Option<i32>,
    pub max_uses_per_user: Option<i32>,
    pub expiry_at: Option<DateTime<Utc>>,
    pub allowed_cities: Option<Vec<String>>,
    pub allowed_types: Option<Vec<String>>,
    pub allowed_sizes: Option<Vec<String>>,
}

/// POST /api/v1/admin/discounts
pub async fn create_discount_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AdminRequest<CreateCodeRequest>>,
) -> Result<Json<ApiResponse<String>>> {
    require_admin_key(&headers, &state)?;

    let code = req.body.code.trim().to_ascii_uppercase();
    if code.is_empty() {
        return Err(AppError::BadRequest("Code cannot be empty".to_string()));
    }
    if !matches!(req.body.discount_type.as_str(), "percentage" | "fixed") {
        return Err(AppError::BadRequest(
            "discount_type must be 'percentage' or 'fixed'".to_string(),
        ));
    }
    if req.body.value <= Decimal::ZERO {
        return Err(AppError::BadRequest("Value must be positive".to_string()));
    }

    sqlx::query(
        "INSERT INTO discount_codes
            (code, discount_type, value, max_uses, max_uses_per_user, expiry_at,
             allowed_cities, allowed_types, allowed_sizes)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
         ON CONFLICT (code) DO NOTHING",
    )
    .bind(&code)
    .bind(&req.body.discount_type)
    .bind(req.body.value)
    .bind(req.body.max_uses)
    .bind(req.body.max_uses_per_user)
    .bind(req.body.expiry_at)
    .bind(req.body.allowed_cities.map(|v| serde_json::json!(v)))
    .bind(req.body.allowed_types.map(|v| serde_json::json!(v)))
    .bind(req.body.allowed_sizes.map(|v| serde_json::json!(v)))
    .execute(state.db.pool())
    .await?;

    state
        .db
        .log_admin_action(req.admin_id, "discount_create", &code)
        .await?;

    Ok(Json(ApiResponse::success(format!("Code {} created", code))))
}

#[derive(Debug, Deserialize)]
pub struct ToggleCodeRequest {
    pub active: bool,
}

/// POST /api/v1/admin/discounts/{code}/toggle
pub async fn toggle_discount_code(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(code): Path<String>,
    Json(req): Json<AdminRequest<ToggleCodeRequest>>,
) -> Result<Json<ApiResponse<String>>> {
    require_admin_key(&headers, &state)?;

    let code = code.trim().to_ascii_uppercase();
    let result = sqlx::query("UPDATE discount_codes SET is_active = $1 WHERE code = $2")
        .bind(req.body.active)
        .bind(&code)
        .execute(state.db.pool())
        .await?;
    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("Code {} not found", code)));
    }

    state
        .db
        .log_admin_action(
            req.admin_id,
            "discount_toggle",
            &format!("{} active={}", code, req.body.active),
        )
        .await?;

    Ok(Json(ApiResponse::success(format!(
        "Code {} {}",
        code,
        if req.body.active { "activated" } else { "deactivated" }
    ))))
}

// -------------------- reseller rules --------------------

#[derive(Debug, Deserialize)]
pub struct ResellerRuleRequest {
    pub reseller_user_id: i64,
    pub product_type: String,
    pub percent: Decimal,
}

/// PUT /api/v1/admin/resellers: upsert one (user, type) percentage rule.
pub async fn upsert_reseller_rule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AdminRequest<ResellerRuleRequest>>,
) -> Result<Json<ApiResponse<String>>> {
    require_admin_key(&headers, &state)?;

    if req.body.percent < Decimal::ZERO || req.body.percent > Decimal::from(100) {
        return Err(AppError::BadRequest(
            "Percent must be within [0, 100]".to_string(),
        ));
    }

    sqlx::query(
        "INSERT INTO reseller_discounts (reseller_user_id, product_type, percent)
         VALUES ($1, $2, $3)
         ON CONFLICT (reseller_user_id, product_type)
         DO UPDATE SET percent = EXCLUDED.percent",
    )
    .bind(req.body.reseller_user_id)
    .bind(&req.body.product_type)
    .bind(req.body.percent)
    .execute(state.db.pool())
    .await?;
    state.db.set_reseller(req.body.reseller_user_id, true).await?;

    state
        .db
        .log_admin_action(
            req.admin_id,
            "reseller_rule_upsert",
            &format!(
                "user={} type={} percent={}",
                req.body.reseller_user_id, req.body.product_type, req.body.percent
            ),
        )
        .await?;

    Ok(Json(ApiResponse::success("Rule stored".to_string())))
}

// -------------------- recovery --------------------

#[derive(Debug, Serialize)]
pub struct PendingDepositView {
    pub payment_id: String,
    pub user_id: i64,
    pub currency: String,
    pub target_eur: String,
    pub is_purchase: bool,
    pub items: usize,
    pub created_at: DateTime<Utc>,
}

/// GET /api/v1/admin/deposits: stuck payment list.
pub async fn list_pending_deposits(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<PendingDepositView>>>> {
    require_admin_key(&headers, &state)?;

    let deposits = state.finalizer.list_pending().await?;
    let view = deposits
        .into_iter()
        .map(|d| PendingDepositView {
            user_id: d.user_id,
            currency: d.currency.clone(),
            target_eur: format_eur(d.target_eur),
            is_purchase: d.is_purchase,
            items: d.snapshot_items().len(),
            created_at: d.created_at,
            payment_id: d.payment_id,
        })
        .collect();
    Ok(Json(ApiResponse::success(view)))
}

/// POST /api/v1/admin/deposits/{payment_id}/recover
pub async fn recover_deposit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(payment_id): Path<String>,
    Json(req): Json<AdminRequest<serde_json::Value>>,
) -> Result<Json<ApiResponse<String>>> {
    require_admin_key(&headers, &state)?;

    let outcome = state.finalizer.manual_recover(&payment_id).await?;
    state
        .db
        .log_admin_action(req.admin_id, "deposit_recover", &payment_id)
        .await?;

    Ok(Json(ApiResponse::success(outcome)))
}

// -------------------- aggregates & broadcast --------------------

/// GET /api/v1/admin/inventory
pub async fn inventory_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<crate::db::products::InventoryCount>>>> {
    require_admin_key(&headers, &state)?;
    Ok(Json(ApiResponse::success(state.db.inventory_summary().await?)))
}

/// GET /api/v1/admin/sales/{days}
pub async fn sales_totals(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(days): Path<i64>,
) -> Result<Json<ApiResponse<Vec<crate::db::products::SalesTotal>>>> {
    require_admin_key(&headers, &state)?;
    let days = days.clamp(1, 365);
    Ok(Json(ApiResponse::success(state.db.sales_totals(days).await?)))
}

#[derive(Debug, Deserialize)]
pub struct BroadcastRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResult {
    pub recipients: usize,
}

/// POST /api/v1/admin/broadcast: fan a text out to all active users via
/// their default transport. Runs in the background; the response reports
/// the recipient count only.
pub async fn broadcast(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AdminRequest<BroadcastRequest>>,
) -> Result<Json<ApiResponse<BroadcastResult>>> {
    require_admin_key(&headers, &state)?;

    let text = req.body.text.trim().to_string();
    if text.is_empty() {
        return Err(AppError::BadRequest("Broadcast text is empty".to_string()));
    }

    let user_ids = state.db.list_user_ids().await?;
    let recipients = user_ids.len();

    let fleet = state.fleet.clone();
    tokio::spawn(async move {
        let bot_id = fleet.default_bot_id().await;
        for user_id in user_ids {
            fleet.send_text_routed(&bot_id, user_id, &text).await;
        }
        tracing::info!("Broadcast finished ({} recipients)", recipients);
    });

    state
        .db
        .log_admin_action(
            req.admin_id,
            "broadcast",
            &format!("{} recipients", recipients),
        )
        .await?;

    Ok(Json(ApiResponse::success(BroadcastResult { recipients })))
}

/// GET /api/v1/admin/log: recent administrative mutations.
pub async fn admin_log(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ApiResponse<Vec<crate::models::AdminLogEntry>>>> {
    require_admin_key(&headers, &state)?;
    Ok(Json(ApiResponse::success(state.db.recent_admin_log(100).await?)))
}

#[derive(Debug, Deserialize)]
pub struct BanRequest {
    pub user_id: i64,
    pub banned: bool,
}

/// POST /api/v1/admin/ban
pub async fn set_banned(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<AdminRequest<BanRequest>>,
) -> Result<Json<ApiResponse<String>>> {
    require_admin_key(&headers, &state)?;

    state.db.set_banned(req.body.user_id, req.body.banned).await?;
    state
        .db
        .log_admin_action(
            req.admin_id,
            "user_ban",
            &format!("user={} banned={}", req.body.user_id, req.body.banned),
        )
        .await?;

    Ok(Json(ApiResponse::success(format!(
        "User {} {}",
        req.body.user_id,
        if req.body.banned { "banned" } else { "unbanned" }
    ))))
}
