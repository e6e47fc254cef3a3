use crate::{
    bot::BotFleet,
    config::Config,
    constants::{
        FINALIZE_RETRY_DELAYS_SECS, MIN_DEPOSIT_EUR, OVERPAYMENT_MIN_EUR, PAYMENT_TOLERANCE_EUR,
        PAYMENT_TOLERANCE_RATIO,
    },
    db::{self, Database},
    error::{AppError, Result},
    integrations::nowpayments::{
        CreatePaymentOutcome, NowPaymentsClient, PaymentEvent, PaymentStatus,
    },
    models::{BasketItem, PendingDeposit, SnapshotItem},
    services::{
        price_oracle::PriceOracle,
        pricing::{apply_reseller_percent, BasketScope, DiscountResolver},
        reservation::ReservationEngine,
    },
    utils::{format_eur, quantize_floor, quantize_half_up},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// What a customer needs to complete a crypto payment.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    pub payment_id: String,
    pub pay_address: String,
    pub pay_amount: Decimal,
    pub currency: String,
    pub target_eur: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
}

struct FinalizeResult {
    user_id: i64,
    bot_id: String,
    payment_id: String,
    delivered: Vec<SnapshotItem>,
    skipped: Vec<SnapshotItem>,
}

/// Idempotent commit of a paid basket. The pending-deposit row is the lock:
/// its delete and the inventory debit share one transaction, so a duplicate
/// IPN either claims the row or finds nothing to do.
pub struct PurchaseFinalizer {
    db: Database,
    config: Config,
    gateway: Arc<NowPaymentsClient>,
    oracle: Arc<PriceOracle>,
    fleet: Arc<BotFleet>,
    reservations: Arc<ReservationEngine>,
    resolver: Arc<DiscountResolver>,
}

impl PurchaseFinalizer {
    pub fn new(
        db: Database,
        config: Config,
        gateway: Arc<NowPaymentsClient>,
        oracle: Arc<PriceOracle>,
        fleet: Arc<BotFleet>,
        reservations: Arc<ReservationEngine>,
        resolver: Arc<DiscountResolver>,
    ) -> Self {
        Self {
            db,
            config,
            gateway,
            oracle,
            fleet,
            reservations,
            resolver,
        }
    }

    // -------------------- intent creation --------------------

    /// Quote the basket, freeze it into a snapshot, and open a payment at
    /// the gateway. The pending deposit keeps the basket's units reserved
    /// past BASKET_TIMEOUT until a terminal event.
    pub async fn create_purchase_intent(
        &self,
        user_id: i64,
        currency: &str,
        bot_id: &str,
        applied_code: Option<&str>,
    ) -> Result<PaymentIntent> {
        let items = self.reservations.current_basket(user_id).await?;
        if items.is_empty() {
            return Err(AppError::BadRequest("Your basket is empty".to_string()));
        }

        let (snapshot, scope) = self.snapshot_basket(user_id, &items).await?;
        let quote = self
            .resolver
            .quote(user_id, &items, applied_code, &scope)
            .await?;

        if quote.final_total <= Decimal::ZERO {
            return Err(AppError::BadRequest(
                "Nothing to pay for this basket".to_string(),
            ));
        }

        let order_id = new_order_id("ORD");
        let created = self
            .gateway
            .create_payment(quote.final_total, currency, &order_id, &self.config.ipn_url())
            .await?;

        let created = match created {
            CreatePaymentOutcome::Created(created) => created,
            CreatePaymentOutcome::BelowMinimum { min_amount } => {
                return Err(AppError::BadRequest(format!(
                    "Total is below the {} minimum of {} for this currency",
                    currency.to_uppercase(),
                    min_amount
                )));
            }
        };

        self.insert_deposit(
            &created.payment_id,
            user_id,
            currency,
            quote.final_total,
            created.pay_amount,
            true,
            Some(&snapshot),
            quote.applied_code.as_deref(),
            bot_id,
        )
        .await?;

        tracing::info!(
            "Purchase intent {} for user {}: {} EUR as {} {}",
            created.payment_id,
            user_id,
            quote.final_total,
            created.pay_amount,
            currency
        );

        Ok(PaymentIntent {
            payment_id: created.payment_id,
            pay_address: created.pay_address,
            pay_amount: created.pay_amount,
            currency: currency.to_string(),
            target_eur: quote.final_total,
            expires_at: created.expires_at,
        })
    }

    /// Balance top-up intent; no basket involvement.
    pub async fn create_refill_intent(
        &self,
        user_id: i64,
        amount_eur: Decimal,
        currency: &str,
        bot_id: &str,
    ) -> Result<PaymentIntent> {
        let min: Decimal = MIN_DEPOSIT_EUR.parse().unwrap_or_default();
        if amount_eur < min {
            return Err(AppError::BadRequest(format!(
                "Minimum top-up is {} EUR",
                MIN_DEPOSIT_EUR
            )));
        }

        let order_id = new_order_id("REF");
        let created = self
            .gateway
            .create_payment(amount_eur, currency, &order_id, &self.config.ipn_url())
            .await?;

        let created = match created {
            CreatePaymentOutcome::Created(created) => created,
            CreatePaymentOutcome::BelowMinimum { min_amount } => {
                return Err(AppError::BadRequest(format!(
                    "Amount is below the {} minimum of {} for this currency",
                    currency.to_uppercase(),
                    min_amount
                )));
            }
        };

        self.insert_deposit(
            &created.payment_id,
            user_id,
            currency,
            amount_eur,
            created.pay_amount,
            false,
            None,
            None,
            bot_id,
        )
        .await?;

        Ok(PaymentIntent {
            payment_id: created.payment_id,
            pay_address: created.pay_address,
            pay_amount: created.pay_amount,
            currency: currency.to_string(),
            target_eur: amount_eur,
            expires_at: created.expires_at,
        })
    }

    /// Pay the whole basket from the stored balance: conditional debit and
    /// inventory commit in one transaction.
    pub async fn purchase_with_balance(
        &self,
        user_id: i64,
        bot_id: &str,
        applied_code: Option<&str>,
    ) -> Result<Vec<SnapshotItem>> {
        let items = self.reservations.current_basket(user_id).await?;
        if items.is_empty() {
            return Err(AppError::BadRequest("Your basket is empty".to_string()));
        }

        let (snapshot, scope) = self.snapshot_basket(user_id, &items).await?;
        let quote = self
            .resolver
            .quote(user_id, &items, applied_code, &scope)
            .await?;

        let payment_id = new_order_id("BAL");
        let mut tx = self.db.pool().begin().await?;

        if quote.final_total > Decimal::ZERO {
            let debited = sqlx::query(
                "UPDATE users SET balance = balance - $1
                 WHERE user_id = $2 AND balance >= $1",
            )
            .bind(quote.final_total)
            .bind(user_id)
            .execute(&mut *tx)
            .await?;
            if debited.rows_affected() == 0 {
                tx.rollback().await?;
                return Err(AppError::BadRequest(
                    "Insufficient balance for this purchase".to_string(),
                ));
            }
            sqlx::query(
                "INSERT INTO balance_adjustments (user_id, amount, reason) VALUES ($1, $2, $3)",
            )
            .bind(user_id)
            .bind(-quote.final_total)
            .bind(format!("Balance purchase {}", payment_id))
            .execute(&mut *tx)
            .await?;
        }

        let (delivered, skipped) = self
            .finalize_items_tx(&mut tx, user_id, &snapshot, &payment_id, bot_id)
            .await?;
        tx.commit().await?;

        if !skipped.is_empty() {
            self.alert_skipped(&payment_id, user_id, &skipped).await;
        }
        self.dispatch_delivery(bot_id, user_id, &delivered).await;

        Ok(delivered)
    }

    // -------------------- webhook entry point --------------------

    /// Process one normalized gateway event. Always safe to replay.
    pub async fn on_payment_event(self: &Arc<Self>, event: PaymentEvent) -> Result<()> {
        if event.status.is_paid() {
            return self.handle_paid(event).await;
        }
        if event.status.is_terminal_failure() {
            return self.handle_terminated(event).await;
        }

        match event.status {
            PaymentStatus::Waiting | PaymentStatus::Confirming | PaymentStatus::Sending => {
                tracing::info!(
                    "Payment {} status {:?}: waiting for confirmation",
                    event.payment_id,
                    event.status
                );
            }
            PaymentStatus::Unknown(ref raw) => {
                tracing::info!("Unhandled payment status '{}' for {}", raw, event.payment_id);
            }
            _ => {}
        }
        Ok(())
    }

    async fn handle_paid(self: &Arc<Self>, event: PaymentEvent) -> Result<()> {
        if let Some(parent) = &event.parent_payment_id {
            tracing::info!(
                "Ignoring child payment event {} (parent {})",
                event.payment_id,
                parent
            );
            return Ok(());
        }
        if event.actually_paid <= Decimal::ZERO {
            tracing::warn!(
                "Ignoring paid event {} with zero actually_paid",
                event.payment_id
            );
            return Ok(());
        }

        let deposit = self.get_deposit(&event.payment_id).await?;
        let Some(deposit) = deposit else {
            tracing::info!("Payment {} already processed; acknowledging", event.payment_id);
            return Ok(());
        };

        if !deposit.currency.eq_ignore_ascii_case(&event.pay_currency) {
            tracing::error!(
                "Currency mismatch on {}: stored {}, webhook {}; discarding deposit",
                event.payment_id,
                deposit.currency,
                event.pay_currency
            );
            self.delete_deposit(&event.payment_id).await?;
            return Err(AppError::BadRequest("Currency mismatch".to_string()));
        }

        let paid_eur = self.paid_eur_equivalent(&event, &deposit).await;
        let log_prefix = if deposit.is_purchase { "PURCHASE" } else { "REFILL" };
        tracing::info!(
            "{} {}: user {} paid {} {} ({} EUR, target {})",
            log_prefix,
            event.payment_id,
            deposit.user_id,
            event.actually_paid,
            event.pay_currency,
            paid_eur,
            deposit.target_eur
        );

        if !deposit.is_purchase {
            return self.settle_refill(&deposit, paid_eur).await;
        }

        let tolerance_ratio: Decimal = PAYMENT_TOLERANCE_RATIO.parse().unwrap_or_default();
        let tolerance_eur: Decimal = PAYMENT_TOLERANCE_EUR.parse().unwrap_or_default();
        let ratio = if deposit.expected_crypto > Decimal::ZERO {
            event.actually_paid / deposit.expected_crypto
        } else {
            Decimal::ZERO
        };
        let eur_gap = deposit.target_eur - paid_eur;
        let acceptable = ratio >= tolerance_ratio || eur_gap <= tolerance_eur;

        if acceptable {
            self.finalize_accepted(deposit, paid_eur).await
        } else {
            self.settle_underpayment(&deposit, paid_eur).await
        }
    }

    /// Expired / Failed / Refunded: release the snapshot, drop the deposit,
    /// tell the user.
    async fn handle_terminated(&self, event: PaymentEvent) -> Result<()> {
        let Some(deposit) = self.claim_deposit(&event.payment_id).await? else {
            return Ok(());
        };

        if deposit.is_purchase {
            self.reservations
                .release_snapshot(deposit.snapshot_items())
                .await?;
        }

        tracing::info!(
            "Payment {} terminated ({:?}); released {} item(s)",
            event.payment_id,
            event.status,
            deposit.snapshot_items().len()
        );
        self.fleet
            .send_text_routed(
                &deposit.bot_id,
                deposit.user_id,
                "Your payment window expired and the reserved items were released. \
                 You can order again at any time.",
            )
            .await;
        Ok(())
    }

    // -------------------- settlement paths --------------------

    /// Refill: claim the deposit and credit the balance atomically.
    async fn settle_refill(&self, deposit: &PendingDeposit, paid_eur: Decimal) -> Result<()> {
        if paid_eur <= Decimal::ZERO {
            tracing::error!(
                "Refill {} has no EUR value; leaving deposit for recovery",
                deposit.payment_id
            );
            return Ok(());
        }

        let mut tx = self.db.pool().begin().await?;
        let claimed: Option<String> = sqlx::query_scalar(
            "DELETE FROM pending_deposits WHERE payment_id = $1 RETURNING payment_id",
        )
        .bind(&deposit.payment_id)
        .fetch_optional(&mut *tx)
        .await?;
        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query("UPDATE users SET balance = balance + $1 WHERE user_id = $2")
            .bind(paid_eur)
            .bind(deposit.user_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "INSERT INTO balance_adjustments (user_id, amount, reason) VALUES ($1, $2, $3)",
        )
        .bind(deposit.user_id)
        .bind(paid_eur)
        .bind(format!("Refill {}", deposit.payment_id))
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        self.fleet
            .send_text_routed(
                &deposit.bot_id,
                deposit.user_id,
                &format!("Top-up confirmed: {} EUR added to your balance.", format_eur(paid_eur)),
            )
            .await;
        Ok(())
    }

    /// Below tolerance: the paid value is credited, the units go back.
    async fn settle_underpayment(&self, deposit: &PendingDeposit, paid_eur: Decimal) -> Result<()> {
        tracing::warn!(
            "UNDERPAYMENT {}: user {} paid {} EUR of {}",
            deposit.payment_id,
            deposit.user_id,
            paid_eur,
            deposit.target_eur
        );

        let mut tx = self.db.pool().begin().await?;
        let claimed: Option<PendingDeposit> = sqlx::query_as(
            "DELETE FROM pending_deposits WHERE payment_id = $1 RETURNING *",
        )
        .bind(&deposit.payment_id)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(claimed) = claimed else {
            tx.rollback().await?;
            return Ok(());
        };

        if paid_eur > Decimal::ZERO {
            sqlx::query("UPDATE users SET balance = balance + $1 WHERE user_id = $2")
                .bind(paid_eur)
                .bind(deposit.user_id)
                .execute(&mut *tx)
                .await?;
            sqlx::query(
                "INSERT INTO balance_adjustments (user_id, amount, reason) VALUES ($1, $2, $3)",
            )
            .bind(deposit.user_id)
            .bind(paid_eur)
            .bind(format!("Underpayment refund on purchase {}", deposit.payment_id))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.reservations
            .release_snapshot(claimed.snapshot_items())
            .await?;

        self.fleet
            .send_text_routed(
                &deposit.bot_id,
                deposit.user_id,
                &format!(
                    "Your payment covered {} EUR of the {} EUR total, so the order was not \
                     completed. The amount was credited to your balance and the items released.",
                    format_eur(paid_eur),
                    format_eur(deposit.target_eur)
                ),
            )
            .await;
        Ok(())
    }

    /// Accepted payment: one finalize attempt inline; failures hand off to a
    /// background retry task so the webhook can acknowledge promptly.
    async fn finalize_accepted(
        self: &Arc<Self>,
        deposit: PendingDeposit,
        paid_eur: Decimal,
    ) -> Result<()> {
        match self.finalize_once(&deposit).await {
            Ok(Some(result)) => {
                self.after_finalize(&result, &deposit, paid_eur).await;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(err) => {
                tracing::error!(
                    "Finalize failed for {}; scheduling retries: {}",
                    deposit.payment_id,
                    err
                );
                self.spawn_finalize_retries(deposit, paid_eur);
                Ok(())
            }
        }
    }

    fn spawn_finalize_retries(self: &Arc<Self>, deposit: PendingDeposit, paid_eur: Decimal) {
        let finalizer = self.clone();

        tokio::spawn(async move {
            for (attempt, delay) in FINALIZE_RETRY_DELAYS_SECS.iter().enumerate() {
                tokio::time::sleep(Duration::from_secs(*delay)).await;
                tracing::info!(
                    "Retrying finalize for {} (attempt {}/{})",
                    deposit.payment_id,
                    attempt + 1,
                    FINALIZE_RETRY_DELAYS_SECS.len()
                );
                match finalizer.finalize_once(&deposit).await {
                    Ok(Some(result)) => {
                        finalizer.after_finalize(&result, &deposit, paid_eur).await;
                        return;
                    }
                    Ok(None) => return,
                    Err(err) => {
                        tracing::error!(
                            "Finalize retry {} failed for {}: {}",
                            attempt + 1,
                            deposit.payment_id,
                            err
                        );
                    }
                }
            }

            tracing::error!(
                "CRITICAL: finalize exhausted retries for payment {} (user {})",
                deposit.payment_id,
                deposit.user_id
            );
            finalizer
                .fleet
                .notify_admins(&format!(
                    "CRITICAL: purchase {} for user {} failed after all retries. Payment was \
                     received but finalization did not commit. Manual recovery required.",
                    deposit.payment_id, deposit.user_id
                ))
                .await;
        });
    }

    /// The atomic commit. Claims the deposit and debits inventory in one
    /// transaction; rollback on error restores the deposit for retry or
    /// manual recovery. Returns None when another processor already won.
    /// Transient store errors retry with backoff: the deposit claim makes a
    /// replay a no-op, so the retry cannot double-debit.
    async fn finalize_once(&self, deposit: &PendingDeposit) -> Result<Option<FinalizeResult>> {
        db::with_retry("finalize_once", || self.try_finalize_once(deposit)).await
    }

    async fn try_finalize_once(&self, deposit: &PendingDeposit) -> Result<Option<FinalizeResult>> {
        let mut tx = self.db.pool().begin().await?;

        let claimed: Option<String> = sqlx::query_scalar(
            "DELETE FROM pending_deposits WHERE payment_id = $1 RETURNING payment_id",
        )
        .bind(&deposit.payment_id)
        .fetch_optional(&mut *tx)
        .await?;
        if claimed.is_none() {
            tx.rollback().await?;
            return Ok(None);
        }

        let (delivered, skipped) = self
            .finalize_items_tx(
                &mut tx,
                deposit.user_id,
                deposit.snapshot_items(),
                &deposit.payment_id,
                &deposit.bot_id,
            )
            .await?;

        tx.commit().await?;

        Ok(Some(FinalizeResult {
            user_id: deposit.user_id,
            bot_id: deposit.bot_id.clone(),
            payment_id: deposit.payment_id.clone(),
            delivered,
            skipped,
        }))
    }

    /// Debit each snapshot unit conditionally, write purchase rows for what
    /// actually debited, bump the purchase counter, and clear the matching
    /// basket rows. Items that lost their unit are skipped, not fatal.
    async fn finalize_items_tx(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        user_id: i64,
        snapshot: &[SnapshotItem],
        payment_id: &str,
        bot_id: &str,
    ) -> Result<(Vec<SnapshotItem>, Vec<SnapshotItem>)> {
        let mut delivered = Vec::new();
        let mut skipped = Vec::new();

        for item in snapshot {
            let debit = sqlx::query(
                "UPDATE products SET available = available - 1, reserved = reserved - 1
                 WHERE id = $1 AND reserved > 0 AND available > 0",
            )
            .bind(item.product_id)
            .execute(&mut **tx)
            .await?;

            if debit.rows_affected() == 0 {
                tracing::error!(
                    "Product {} unavailable at finalize of {}; continuing with remainder",
                    item.product_id,
                    payment_id
                );
                skipped.push(item.clone());
                continue;
            }

            sqlx::query(
                "INSERT INTO purchases
                    (user_id, product_id, product_name, product_type, size, city, district,
                     price_paid, original_text, payment_id, bot_id)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(user_id)
            .bind(item.product_id)
            .bind(&item.product_name)
            .bind(&item.product_type)
            .bind(&item.size)
            .bind(&item.city)
            .bind(&item.district)
            .bind(item.price)
            .bind(&item.original_text)
            .bind(payment_id)
            .bind(bot_id)
            .execute(&mut **tx)
            .await?;

            delivered.push(item.clone());
        }

        if !delivered.is_empty() {
            sqlx::query(
                "UPDATE users SET total_purchases = total_purchases + $1 WHERE user_id = $2",
            )
            .bind(delivered.len() as i32)
            .bind(user_id)
            .execute(&mut **tx)
            .await?;
        }

        // The snapshot's basket rows are spent either way: the unit was
        // sold or it no longer exists.
        for item in snapshot {
            sqlx::query(
                "DELETE FROM basket_items
                 WHERE id = (SELECT id FROM basket_items
                             WHERE user_id = $1 AND product_id = $2
                             ORDER BY reserved_at ASC LIMIT 1)",
            )
            .bind(user_id)
            .bind(item.product_id)
            .execute(&mut **tx)
            .await?;
        }

        Ok((delivered, skipped))
    }

    /// Post-commit work: overpayment credit, skipped-item alert, delivery.
    async fn after_finalize(
        &self,
        result: &FinalizeResult,
        deposit: &PendingDeposit,
        paid_eur: Decimal,
    ) {
        if !result.skipped.is_empty() {
            self.alert_skipped(&result.payment_id, result.user_id, &result.skipped)
                .await;
        }

        if paid_eur > deposit.target_eur {
            let min: Decimal = OVERPAYMENT_MIN_EUR.parse().unwrap_or_default();
            let surplus = quantize_floor(paid_eur - deposit.target_eur);
            if surplus > min {
                if let Err(err) = self
                    .db
                    .credit_balance(
                        result.user_id,
                        surplus,
                        &format!("Overpayment on purchase {}", result.payment_id),
                    )
                    .await
                {
                    tracing::error!(
                        "Overpayment credit failed for {}: {}",
                        result.payment_id,
                        err
                    );
                }
            }
        }

        self.dispatch_delivery(&result.bot_id, result.user_id, &result.delivered)
            .await;
    }

    /// Delivery is at-least-once: failures alert the admin but never unwind
    /// the committed purchase. Items go out in snapshot order.
    async fn dispatch_delivery(&self, bot_id: &str, user_id: i64, delivered: &[SnapshotItem]) {
        if delivered.is_empty() {
            return;
        }

        self.fleet
            .send_text_routed(
                bot_id,
                user_id,
                &format!(
                    "Payment confirmed! Delivering {} item(s):",
                    delivered.len()
                ),
            )
            .await;

        for item in delivered {
            let text = format!(
                "{} {} — {}, {}\n\n{}",
                item.product_type, item.size, item.city, item.district, item.original_text
            );
            let outcome = self.fleet.send_text_routed(bot_id, user_id, &text).await;
            if outcome == crate::bot::outbound::SendOutcome::Failed {
                self.fleet
                    .notify_admins(&format!(
                        "Delivery of product {} to user {} failed; purchase is committed, \
                         re-delivery needed.",
                        item.product_id, user_id
                    ))
                    .await;
                continue;
            }

            match self.db.product_media(item.product_id).await {
                Ok(media) => {
                    for entry in media {
                        let sent = self
                            .fleet
                            .send_media_routed(bot_id, user_id, &entry.media_kind, &entry.path, None)
                            .await;
                        if sent == crate::bot::outbound::SendOutcome::Failed {
                            self.fleet
                                .notify_admins(&format!(
                                    "Media {} for product {} undeliverable to user {}",
                                    entry.path, item.product_id, user_id
                                ))
                                .await;
                        }
                    }
                }
                Err(err) => {
                    tracing::error!(
                        "Media lookup failed for product {}: {}",
                        item.product_id,
                        err
                    );
                    self.fleet
                        .notify_admins(&format!(
                            "Media missing for committed purchase of product {} (user {})",
                            item.product_id, user_id
                        ))
                        .await;
                }
            }
        }
    }

    async fn alert_skipped(&self, payment_id: &str, user_id: i64, skipped: &[SnapshotItem]) {
        let ids: Vec<String> = skipped.iter().map(|i| i.product_id.to_string()).collect();
        self.fleet
            .notify_admins(&format!(
                "Finalize of {} (user {}) skipped unavailable product(s): {}",
                payment_id,
                user_id,
                ids.join(", ")
            ))
            .await;
    }

    // -------------------- recovery & sweeping --------------------

    /// Admin-triggered recovery of a stuck deposit: assume the target amount
    /// arrived in full and run the normal settlement.
    pub async fn manual_recover(&self, payment_id: &str) -> Result<String> {
        let deposit = self
            .get_deposit(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("No pending deposit {}", payment_id)))?;

        if deposit.is_purchase {
            match self.finalize_once(&deposit).await? {
                Some(result) => {
                    self.after_finalize(&result, &deposit, deposit.target_eur).await;
                    Ok(format!(
                        "Recovered purchase {}: {} delivered, {} skipped",
                        payment_id,
                        result.delivered.len(),
                        result.skipped.len()
                    ))
                }
                None => Ok(format!("Payment {} was already processed", payment_id)),
            }
        } else {
            self.settle_refill(&deposit, deposit.target_eur).await?;
            Ok(format!(
                "Recovered refill {}: credited {} EUR",
                payment_id,
                format_eur(deposit.target_eur)
            ))
        }
    }

    /// Reap deposits that never saw a terminal event. Treated exactly like
    /// an Expired IPN.
    pub async fn expire_stale_deposits(&self) -> Result<u64> {
        let cutoff = Utc::now() - self.config.pending_deposit_lifetime();
        let stale: Vec<String> = sqlx::query_scalar(
            "SELECT payment_id FROM pending_deposits WHERE created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await?;

        let mut reaped = 0u64;
        for payment_id in stale {
            let Some(deposit) = self.claim_deposit(&payment_id).await? else {
                continue;
            };
            if deposit.is_purchase {
                self.reservations
                    .release_snapshot(deposit.snapshot_items())
                    .await?;
            }
            self.fleet
                .send_text_routed(
                    &deposit.bot_id,
                    deposit.user_id,
                    "Payment timeout: your payment was not received in time and the reserved \
                     items have been released.",
                )
                .await;
            reaped += 1;
        }

        if reaped > 0 {
            tracing::info!("Expired {} stale pending deposit(s)", reaped);
        }
        Ok(reaped)
    }

    /// Deposits currently awaiting events, for the admin recovery list.
    pub async fn list_pending(&self) -> Result<Vec<PendingDeposit>> {
        let rows = sqlx::query_as::<_, PendingDeposit>(
            "SELECT * FROM pending_deposits ORDER BY created_at ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(rows)
    }

    // -------------------- internals --------------------

    /// EUR value of the paid amount: gateway-settled outcome first, then the
    /// oracle spot price, then proportional to the expected crypto amount.
    async fn paid_eur_equivalent(&self, event: &PaymentEvent, deposit: &PendingDeposit) -> Decimal {
        if let Some(outcome) = event.outcome_eur {
            return quantize_half_up(outcome);
        }

        if let Some(price) = self.oracle.price_eur(&event.pay_currency).await.value() {
            return quantize_half_up(event.actually_paid * price);
        }

        if deposit.expected_crypto > Decimal::ZERO {
            let proportion = event.actually_paid / deposit.expected_crypto;
            return quantize_half_up(proportion * deposit.target_eur);
        }

        Decimal::ZERO
    }

    /// Frozen copy of the basket plus the scope lists for code validation.
    async fn snapshot_basket(
        &self,
        user_id: i64,
        items: &[BasketItem],
    ) -> Result<(Vec<SnapshotItem>, BasketScope)> {
        let mut snapshot = Vec::with_capacity(items.len());
        let mut scope = BasketScope::default();

        for item in items {
            let product = self
                .db
                .get_product(item.product_id)
                .await?
                .ok_or_else(|| {
                    AppError::Internal(format!(
                        "Basket references missing product {}",
                        item.product_id
                    ))
                })?;

            let pct = self
                .resolver
                .reseller_percent(user_id, &item.product_type_snapshot)
                .await?;

            scope.cities.push(product.city.clone());
            scope.types.push(product.product_type.clone());
            scope.sizes.push(product.size.clone());

            snapshot.push(SnapshotItem {
                product_id: product.id,
                product_name: format!("{} {}", product.product_type, product.size),
                product_type: product.product_type,
                size: product.size,
                city: product.city,
                district: product.district,
                price: apply_reseller_percent(item.price_snapshot, pct),
                original_text: product.original_text,
            });
        }

        Ok((snapshot, scope))
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_deposit(
        &self,
        payment_id: &str,
        user_id: i64,
        currency: &str,
        target_eur: Decimal,
        expected_crypto: Decimal,
        is_purchase: bool,
        snapshot: Option<&[SnapshotItem]>,
        discount_code: Option<&str>,
        bot_id: &str,
    ) -> Result<()> {
        let snapshot_json = match snapshot {
            Some(items) => Some(serde_json::to_value(items).map_err(|e| {
                AppError::Internal(format!("Snapshot serialization failed: {e}"))
            })?),
            None => None,
        };

        sqlx::query(
            "INSERT INTO pending_deposits
                (payment_id, user_id, currency, target_eur, expected_crypto, is_purchase,
                 basket_snapshot, discount_code, bot_id)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
        )
        .bind(payment_id)
        .bind(user_id)
        .bind(currency.to_ascii_lowercase())
        .bind(target_eur)
        .bind(expected_crypto)
        .bind(is_purchase)
        .bind(snapshot_json)
        .bind(discount_code)
        .bind(bot_id)
        .execute(self.db.pool())
        .await?;
        Ok(())
    }

    async fn get_deposit(&self, payment_id: &str) -> Result<Option<PendingDeposit>> {
        let row = sqlx::query_as::<_, PendingDeposit>(
            "SELECT * FROM pending_deposits WHERE payment_id = $1",
        )
        .bind(payment_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Atomic lookup-and-delete; whoever gets the row back owns the
    /// terminal handling for this payment.
    async fn claim_deposit(&self, payment_id: &str) -> Result<Option<PendingDeposit>> {
        let row = sqlx::query_as::<_, PendingDeposit>(
            "DELETE FROM pending_deposits WHERE payment_id = $1 RETURNING *",
        )
        .bind(payment_id)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    async fn delete_deposit(&self, payment_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM pending_deposits WHERE payment_id = $1")
            .bind(payment_id)
            .execute(self.db.pool())
            .await?;
        Ok(())
    }
}

fn new_order_id(prefix: &str) -> String {
    format!("{}_{}", prefix, hex::encode(rand::random::<[u8; 16]>()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    fn tolerance_accepts(actually_paid: &str, expected: &str, paid_eur: &str, target: &str) -> bool {
        let ratio_floor: Decimal = PAYMENT_TOLERANCE_RATIO.parse().unwrap();
        let eur_gap_cap: Decimal = PAYMENT_TOLERANCE_EUR.parse().unwrap();
        let expected = d(expected);
        let ratio = if expected > Decimal::ZERO {
            d(actually_paid) / expected
        } else {
            Decimal::ZERO
        };
        let gap = d(target) - d(paid_eur);
        ratio >= ratio_floor || gap <= eur_gap_cap
    }

    #[test]
    fn exact_payment_is_accepted() {
        assert!(tolerance_accepts("0.07", "0.07", "10.00", "10.00"));
    }

    #[test]
    fn two_percent_short_is_accepted_by_ratio() {
        assert!(tolerance_accepts("0.0686", "0.07", "9.80", "10.00"));
    }

    #[test]
    fn small_eur_gap_is_accepted() {
        // 95% ratio but only 0.40 EUR short
        assert!(tolerance_accepts("0.0665", "0.07", "9.60", "10.00"));
    }

    #[test]
    fn deep_underpayment_is_rejected() {
        // 70% ratio and 3 EUR short: both checks fail
        assert!(!tolerance_accepts("0.049", "0.07", "7.00", "10.00"));
    }

    #[test]
    fn overpayment_is_accepted() {
        assert!(tolerance_accepts("0.08", "0.07", "11.23", "10.00"));
    }

    #[test]
    fn order_ids_are_prefixed_and_unique() {
        let a = new_order_id("ORD");
        let b = new_order_id("ORD");
        assert!(a.starts_with("ORD_"));
        assert_ne!(a, b);
        assert_eq!(a.len(), "ORD_".len() + 32);
    }
}
