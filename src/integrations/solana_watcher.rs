use crate::{
    config::Config,
    constants::WALLET_POLL_INTERVAL_SECS,
    db::Database,
    error::Result,
    integrations::nowpayments::{PaymentEvent, PaymentStatus},
    services::finalizer::PurchaseFinalizer,
};
use rust_decimal::Decimal;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{interval, Duration};

const LAMPORTS_PER_SOL: i64 = 1_000_000_000;

/// Optional direct-chain mode: poll a watched wallet for inbound transfers
/// and settle open SOL deposits whose expected amount matches. Runs only
/// when a watch wallet is configured; the gateway IPN remains the primary
/// settlement path and replays are absorbed by the deposit claim.
pub struct SolanaWatcher {
    db: Database,
    config: Config,
    finalizer: Arc<PurchaseFinalizer>,
    client: reqwest::Client,
    seen_signatures: Mutex<HashSet<String>>,
}

impl SolanaWatcher {
    pub fn new(db: Database, config: Config, finalizer: Arc<PurchaseFinalizer>) -> Self {
        Self {
            db,
            config,
            finalizer,
            client: reqwest::Client::new(),
            seen_signatures: Mutex::new(HashSet::new()),
        }
    }

    pub fn start(self: Arc<Self>) {
        let Some(wallet) = self.config.solana_watch_wallet.clone() else {
            return;
        };
        tracing::info!("Starting direct-chain deposit watcher");

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(WALLET_POLL_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                if let Err(err) = self.scan(&wallet).await {
                    tracing::error!("Deposit watcher error: {}", err);
                }
            }
        });
    }

    async fn scan(&self, wallet: &str) -> Result<()> {
        let open_sol_deposits: Vec<(String, Decimal)> = sqlx::query_as(
            "SELECT payment_id, expected_crypto FROM pending_deposits WHERE currency = 'sol'",
        )
        .fetch_all(self.db.pool())
        .await?;
        if open_sol_deposits.is_empty() {
            return Ok(());
        }

        let signatures = self.recent_signatures(wallet).await?;
        for signature in signatures {
            {
                let mut seen = self.seen_signatures.lock().await;
                if !seen.insert(signature.clone()) {
                    continue;
                }
                if seen.len() > 10_000 {
                    seen.clear();
                }
            }

            let Some(received) = self.received_sol(wallet, &signature).await? else {
                continue;
            };

            // Match by expected amount within the payment tolerance band.
            let matched = open_sol_deposits.iter().find(|(_, expected)| {
                *expected > Decimal::ZERO
                    && received >= *expected * Decimal::new(98, 2)
            });

            if let Some((payment_id, _)) = matched {
                tracing::info!(
                    "Direct-chain deposit matched payment {} ({} SOL, sig {})",
                    payment_id,
                    received,
                    signature
                );
                let event = PaymentEvent {
                    payment_id: payment_id.clone(),
                    status: PaymentStatus::Finished,
                    pay_currency: "sol".to_string(),
                    actually_paid: received,
                    outcome_eur: None,
                    parent_payment_id: None,
                    order_id: None,
                };
                if let Err(err) = self.finalizer.on_payment_event(event).await {
                    tracing::error!(
                        "Direct-chain settlement failed for {}: {}",
                        payment_id,
                        err
                    );
                }
            }
        }
        Ok(())
    }

    async fn recent_signatures(&self, wallet: &str) -> Result<Vec<String>> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getSignaturesForAddress",
            "params": [wallet, {"limit": 20}],
        });
        let body = self.rpc(payload).await?;
        let signatures = body
            .get("result")
            .and_then(|r| r.as_array())
            .map(|entries| {
                entries
                    .iter()
                    .filter(|e| e.get("err").map(|v| v.is_null()).unwrap_or(false))
                    .filter_map(|e| e.get("signature").and_then(|s| s.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Ok(signatures)
    }

    /// Net lamports received by the wallet in one transaction, if any.
    async fn received_sol(&self, wallet: &str, signature: &str) -> Result<Option<Decimal>> {
        let payload = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getTransaction",
            "params": [signature, {"encoding": "jsonParsed", "maxSupportedTransactionVersion": 0}],
        });
        let body = self.rpc(payload).await?;

        let result = body.get("result");
        let Some(result) = result.filter(|r| !r.is_null()) else {
            return Ok(None);
        };

        let keys: Vec<String> = result
            .pointer("/transaction/message/accountKeys")
            .and_then(|k| k.as_array())
            .map(|keys| {
                keys.iter()
                    .filter_map(|k| {
                        k.as_str()
                            .map(str::to_string)
                            .or_else(|| k.get("pubkey").and_then(|p| p.as_str()).map(str::to_string))
                    })
                    .collect()
            })
            .unwrap_or_default();
        let Some(index) = keys.iter().position(|k| k == wallet) else {
            return Ok(None);
        };

        let pre = result
            .pointer("/meta/preBalances")
            .and_then(|b| b.as_array())
            .and_then(|b| b.get(index))
            .and_then(|v| v.as_i64());
        let post = result
            .pointer("/meta/postBalances")
            .and_then(|b| b.as_array())
            .and_then(|b| b.get(index))
            .and_then(|v| v.as_i64());

        match (pre, post) {
            (Some(pre), Some(post)) if post > pre => {
                let lamports = post - pre;
                Ok(Some(Decimal::new(lamports, 0) / Decimal::new(LAMPORTS_PER_SOL, 0)))
            }
            _ => Ok(None),
        }
    }

    async fn rpc(&self, payload: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(&self.config.solana_rpc_url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| crate::error::AppError::Gateway(format!("Solana RPC failed: {e}")))?;
        response
            .json()
            .await
            .map_err(|e| crate::error::AppError::Gateway(format!("Solana RPC malformed: {e}")))
    }
}
