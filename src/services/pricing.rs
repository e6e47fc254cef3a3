use crate::{
    db::{self, Database},
    error::{AppError, Result},
    models::{BasketItem, BasketQuote, DiscountCode, DiscountOutcome},
    utils::{normalize_token, quantize_floor},
};
use chrono::Utc;
use rust_decimal::Decimal;

/// Scope of the basket a general code is validated against.
#[derive(Debug, Clone, Default)]
pub struct BasketScope {
    pub cities: Vec<String>,
    pub types: Vec<String>,
    pub sizes: Vec<String>,
}

/// Two-layer pricing: implicit per-reseller per-type percentages first, then
/// an optional general code against the reseller-adjusted total. General
/// codes are consumed atomically with per-user and global caps.
pub struct DiscountResolver {
    db: Database,
}

impl DiscountResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Reseller percentage for (user, product type); zero when no rule.
    pub async fn reseller_percent(&self, user_id: i64, product_type: &str) -> Result<Decimal> {
        let pct: Option<Decimal> = sqlx::query_scalar(
            "SELECT percent FROM reseller_discounts
             WHERE reseller_user_id = $1 AND LOWER(product_type) = LOWER($2)",
        )
        .bind(user_id)
        .bind(product_type)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(pct.unwrap_or(Decimal::ZERO))
    }

    /// Price a basket. The applied code is re-validated read-only against
    /// the reseller-adjusted total; if it no longer validates the quote
    /// silently drops it (`applied_code` comes back as None).
    pub async fn quote(
        &self,
        user_id: i64,
        items: &[BasketItem],
        applied_code: Option<&str>,
        scope: &BasketScope,
    ) -> Result<BasketQuote> {
        let mut subtotal = Decimal::ZERO;
        let mut after_reseller = Decimal::ZERO;

        for item in items {
            subtotal += item.price_snapshot;
            let pct = self
                .reseller_percent(user_id, &item.product_type_snapshot)
                .await?;
            after_reseller += apply_reseller_percent(item.price_snapshot, pct);
        }

        let mut quote = BasketQuote {
            subtotal,
            reseller_discount: subtotal - after_reseller,
            after_reseller,
            code_discount: Decimal::ZERO,
            final_total: after_reseller,
            applied_code: None,
        };

        if let Some(code) = applied_code {
            match self.validate(code, after_reseller, scope).await {
                Ok(outcome) => {
                    quote.code_discount = outcome.discount_amount;
                    quote.final_total = outcome.final_total;
                    quote.applied_code = Some(outcome.code);
                }
                Err(AppError::DiscountRejected(reason)) => {
                    tracing::debug!("Applied code '{}' detached on requote: {}", code, reason);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(quote)
    }

    /// Read-only validation for re-display after a basket change. Never
    /// mutates usage counters.
    pub async fn validate(
        &self,
        code_text: &str,
        base_total: Decimal,
        scope: &BasketScope,
    ) -> Result<DiscountOutcome> {
        let normalized = normalize_code(code_text)?;

        let code = sqlx::query_as::<_, DiscountCode>(
            "SELECT * FROM discount_codes WHERE code = $1",
        )
        .bind(&normalized)
        .fetch_optional(self.db.pool())
        .await?;

        let code = code.ok_or_else(|| reject("Discount code not found"))?;
        check_code_usable(&code, scope)?;

        Ok(compute_outcome(&code, base_total))
    }

    /// Validate AND consume in one transaction. The code row is locked, the
    /// usage row and the counter increment commit together or not at all:
    /// `uses_count` never moves without a matching DiscountUsage row. Lock
    /// contention rolls back and retries with backoff; business rejects
    /// surface immediately.
    pub async fn validate_and_consume(
        &self,
        code_text: &str,
        base_total: Decimal,
        user_id: i64,
        scope: &BasketScope,
    ) -> Result<DiscountOutcome> {
        db::with_retry("validate_and_consume", || {
            self.try_validate_and_consume(code_text, base_total, user_id, scope)
        })
        .await
    }

    async fn try_validate_and_consume(
        &self,
        code_text: &str,
        base_total: Decimal,
        user_id: i64,
        scope: &BasketScope,
    ) -> Result<DiscountOutcome> {
        let normalized = normalize_code(code_text)?;

        let mut tx = self.db.pool().begin().await?;

        let code = sqlx::query_as::<_, DiscountCode>(
            "SELECT * FROM discount_codes WHERE code = $1 FOR UPDATE",
        )
        .bind(&normalized)
        .fetch_optional(&mut *tx)
        .await?;

        let code = match code {
            Some(code) => code,
            None => {
                tx.rollback().await?;
                return Err(reject("Discount code not found"));
            }
        };

        if let Err(err) = check_code_usable(&code, scope) {
            tx.rollback().await?;
            return Err(err);
        }

        if let Some(per_user_cap) = code.max_uses_per_user {
            let used: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM discount_code_usage WHERE user_id = $1 AND code = $2",
            )
            .bind(user_id)
            .bind(&normalized)
            .fetch_one(&mut *tx)
            .await?;
            if used >= i64::from(per_user_cap) {
                tx.rollback().await?;
                return Err(reject("You have already used this code the maximum number of times"));
            }
        }

        let outcome = compute_outcome(&code, base_total);

        sqlx::query(
            "INSERT INTO discount_code_usage (user_id, code, used_at, discount_amount)
             VALUES ($1, $2, NOW(), $3)",
        )
        .bind(user_id)
        .bind(&normalized)
        .bind(outcome.discount_amount)
        .execute(&mut *tx)
        .await?;

        // The guarded increment is what makes the global cap race-safe: two
        // concurrent consumers both pass the read check, only one row wins.
        let result = sqlx::query(
            "UPDATE discount_codes
             SET uses_count = uses_count + 1
             WHERE code = $1 AND (max_uses IS NULL OR uses_count < max_uses)",
        )
        .bind(&normalized)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(reject("Code reached usage limit"));
        }

        tx.commit().await?;

        tracing::info!(
            "User {} consumed discount code '{}' (-{} EUR)",
            user_id,
            outcome.code,
            outcome.discount_amount
        );
        Ok(outcome)
    }
}

fn reject(reason: &str) -> AppError {
    AppError::DiscountRejected(reason.to_string())
}

fn normalize_code(code_text: &str) -> Result<String> {
    let trimmed = code_text.trim();
    if trimmed.is_empty() {
        return Err(reject("No code provided"));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Shared active/expiry/cap/scope checks for both validation paths.
fn check_code_usable(code: &DiscountCode, scope: &BasketScope) -> Result<()> {
    if !code.is_active {
        return Err(reject("This discount code is inactive"));
    }
    if let Some(expiry) = code.expiry_at {
        if Utc::now() > expiry {
            return Err(reject("This discount code has expired"));
        }
    }
    if let Some(cap) = code.max_uses {
        if code.uses_count >= cap {
            return Err(reject("Code reached usage limit"));
        }
    }

    check_scope(code.allowed_cities.as_ref().map(|j| j.0.as_slice()), &scope.cities, "cities")?;
    check_scope(code.allowed_types.as_ref().map(|j| j.0.as_slice()), &scope.types, "products")?;
    check_scope(code.allowed_sizes.as_ref().map(|j| j.0.as_slice()), &scope.sizes, "sizes")?;
    Ok(())
}

/// Empty/absent allow-list means unrestricted. A non-empty list requires at
/// least one basket value to match, case-insensitive and trimmed.
fn check_scope(allowed: Option<&[String]>, basket_values: &[String], label: &str) -> Result<()> {
    let Some(allowed) = allowed else {
        return Ok(());
    };
    if allowed.is_empty() {
        return Ok(());
    }

    let allowed_normalized: Vec<String> = allowed.iter().map(|v| normalize_token(v)).collect();
    let matches = basket_values
        .iter()
        .map(|v| normalize_token(v))
        .any(|v| allowed_normalized.contains(&v));

    if matches {
        Ok(())
    } else {
        Err(reject(&format!(
            "This code is only valid for {}: {}",
            label,
            allowed.join(", ")
        )))
    }
}

/// Percentage or fixed amount, clamped to the base, floored to the cent.
fn compute_outcome(code: &DiscountCode, base_total: Decimal) -> DiscountOutcome {
    let raw = match code.discount_type.as_str() {
        "percentage" => base_total * code.value / Decimal::from(100),
        _ => code.value,
    };

    let discount_amount = quantize_floor(raw.min(base_total)).max(Decimal::ZERO);
    let final_total = quantize_floor(base_total - discount_amount).max(Decimal::ZERO);

    DiscountOutcome {
        code: code.code.clone(),
        discount_type: code.discount_type.clone(),
        value: code.value,
        discount_amount,
        final_total,
    }
}

/// Per-item reseller layer: `price × (1 − pct/100)`, floored to the cent.
pub fn apply_reseller_percent(price: Decimal, percent: Decimal) -> Decimal {
    if percent <= Decimal::ZERO {
        return price;
    }
    let pct = percent.min(Decimal::from(100));
    let discount = quantize_floor(price * pct / Decimal::from(100));
    price - discount
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use sqlx::types::Json;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn test_code(discount_type: &str, value: &str) -> DiscountCode {
        DiscountCode {
            code: "SUMMER10".to_string(),
            discount_type: discount_type.to_string(),
            value: d(value),
            is_active: true,
            max_uses: None,
            max_uses_per_user: None,
            uses_count: 0,
            expiry_at: None,
            allowed_cities: None,
            allowed_types: None,
            allowed_sizes: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn percentage_discount_floors_to_cent() {
        let code = test_code("percentage", "15");
        let outcome = compute_outcome(&code, d("19.99"));
        // 15% of 19.99 = 2.9985 -> 2.99 floored
        assert_eq!(outcome.discount_amount, d("2.99"));
        assert_eq!(outcome.final_total, d("17.00"));
    }

    #[test]
    fn fixed_discount_clamps_to_base() {
        let code = test_code("fixed", "30");
        let outcome = compute_outcome(&code, d("20.00"));
        assert_eq!(outcome.discount_amount, d("20.00"));
        assert_eq!(outcome.final_total, d("0.00"));
    }

    #[test]
    fn expired_code_is_rejected() {
        let mut code = test_code("fixed", "5");
        code.expiry_at = Some(Utc::now() - Duration::hours(1));
        let err = check_code_usable(&code, &BasketScope::default()).unwrap_err();
        assert!(matches!(err, AppError::DiscountRejected(_)));
    }

    #[test]
    fn capped_code_at_limit_is_rejected() {
        let mut code = test_code("fixed", "5");
        code.max_uses = Some(3);
        code.uses_count = 3;
        assert!(check_code_usable(&code, &BasketScope::default()).is_err());
    }

    #[test]
    fn scope_matching_is_case_insensitive() {
        let mut code = test_code("fixed", "5");
        code.allowed_cities = Some(Json(vec!["Berlin".to_string()]));

        let mut scope = BasketScope::default();
        scope.cities = vec![" berlin ".to_string()];
        assert!(check_code_usable(&code, &scope).is_ok());

        scope.cities = vec!["Hamburg".to_string()];
        assert!(check_code_usable(&code, &scope).is_err());
    }

    #[test]
    fn empty_scope_list_is_unrestricted() {
        let mut code = test_code("fixed", "5");
        code.allowed_sizes = Some(Json(vec![]));
        assert!(check_code_usable(&code, &BasketScope::default()).is_ok());
    }

    #[test]
    fn reseller_percent_floors_per_item() {
        // 7% of 9.99 = 0.6993 -> discount 0.69, item 9.30
        assert_eq!(apply_reseller_percent(d("9.99"), d("7")), d("9.30"));
        assert_eq!(apply_reseller_percent(d("10.00"), d("0")), d("10.00"));
        // Over-100 rules clamp to free, never negative
        assert_eq!(apply_reseller_percent(d("10.00"), d("150")), d("0.00"));
    }
}
