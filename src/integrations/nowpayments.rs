use crate::{
    config::Config,
    error::{AppError, Result},
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha512;

type HmacSha512 = Hmac<Sha512>;

/// Normalized gateway payment state. The adapter maps the wire strings and
/// makes no business decisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    Waiting,
    Confirming,
    Sending,
    Finished,
    Confirmed,
    PartiallyPaid,
    Expired,
    Failed,
    Refunded,
    Unknown(String),
}

impl PaymentStatus {
    fn from_wire(raw: &str) -> Self {
        match raw {
            "waiting" => Self::Waiting,
            "confirming" => Self::Confirming,
            "sending" => Self::Sending,
            "finished" => Self::Finished,
            "confirmed" => Self::Confirmed,
            "partially_paid" => Self::PartiallyPaid,
            "expired" => Self::Expired,
            "failed" => Self::Failed,
            "refunded" => Self::Refunded,
            other => Self::Unknown(other.to_string()),
        }
    }

    /// Statuses that can complete a deposit.
    pub fn is_paid(&self) -> bool {
        matches!(self, Self::Finished | Self::Confirmed | Self::PartiallyPaid)
    }

    /// Terminal failure statuses that release the deposit.
    pub fn is_terminal_failure(&self) -> bool {
        matches!(self, Self::Expired | Self::Failed | Self::Refunded)
    }
}

#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub payment_id: String,
    pub status: PaymentStatus,
    pub pay_currency: String,
    pub actually_paid: Decimal,
    /// Gateway-settled EUR value, present only when outcome_currency is EUR.
    pub outcome_eur: Option<Decimal>,
    pub parent_payment_id: Option<String>,
    pub order_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CreatedPayment {
    pub payment_id: String,
    pub pay_address: String,
    pub pay_amount: Decimal,
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub enum CreatePaymentOutcome {
    Created(CreatedPayment),
    /// The EUR amount converts to less crypto than the gateway minimum.
    BelowMinimum { min_amount: Decimal },
}

pub struct NowPaymentsClient {
    client: reqwest::Client,
    api_url: String,
    api_key: String,
    ipn_secret: Option<String>,
}

impl NowPaymentsClient {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_url: config.nowpayments_api_url.trim_end_matches('/').to_string(),
            api_key: config.nowpayments_api_key.clone(),
            ipn_secret: config.nowpayments_ipn_secret.clone(),
        }
    }

    /// Minimum payable amount in `pay_currency` for an EUR-priced order.
    pub async fn min_amount(&self, pay_currency: &str) -> Result<Decimal> {
        #[derive(Deserialize)]
        struct MinAmountResponse {
            min_amount: serde_json::Value,
        }

        let url = format!(
            "{}/v1/min-amount?currency_from={}&currency_to=eur",
            self.api_url, pay_currency
        );
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("min-amount request failed: {e}")))?;

        let body: MinAmountResponse = response
            .json()
            .await
            .map_err(|e| AppError::Gateway(format!("min-amount response malformed: {e}")))?;
        decimal_from_value(&body.min_amount)
            .ok_or_else(|| AppError::Gateway("min-amount missing".to_string()))
    }

    /// Expected crypto amount for an EUR price, used for the minimum check.
    pub async fn estimate(&self, amount_eur: Decimal, pay_currency: &str) -> Result<Decimal> {
        #[derive(Deserialize)]
        struct EstimateResponse {
            estimated_amount: serde_json::Value,
        }

        let url = format!(
            "{}/v1/estimate?amount={}&currency_from=eur&currency_to={}",
            self.api_url, amount_eur, pay_currency
        );
        let response = self
            .client
            .get(&url)
            .header("x-api-key", &self.api_key)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("estimate request failed: {e}")))?;

        let body: EstimateResponse = response
            .json()
            .await
            .map_err(|e| AppError::Gateway(format!("estimate response malformed: {e}")))?;
        decimal_from_value(&body.estimated_amount)
            .ok_or_else(|| AppError::Gateway("estimate missing".to_string()))
    }

    /// Create a payment intent. The returned `payment_id` keys the pending
    /// deposit; `pay_amount` is the exact crypto the customer must send.
    pub async fn create_payment(
        &self,
        amount_eur: Decimal,
        pay_currency: &str,
        order_id: &str,
        ipn_url: &str,
    ) -> Result<CreatePaymentOutcome> {
        let min = self.min_amount(pay_currency).await?;
        let estimated = self.estimate(amount_eur, pay_currency).await?;
        if estimated < min {
            return Ok(CreatePaymentOutcome::BelowMinimum { min_amount: min });
        }

        #[derive(Deserialize)]
        struct CreateResponse {
            payment_id: serde_json::Value,
            pay_address: String,
            pay_amount: serde_json::Value,
            #[serde(default)]
            expiration_estimate_date: Option<String>,
        }

        let payload = serde_json::json!({
            "price_amount": amount_eur,
            "price_currency": "eur",
            "pay_currency": pay_currency,
            "order_id": order_id,
            "ipn_callback_url": ipn_url,
        });

        let response = self
            .client
            .post(format!("{}/v1/payment", self.api_url))
            .header("x-api-key", &self.api_key)
            .json(&payload)
            .send()
            .await
            .map_err(|e| AppError::Gateway(format!("create-payment request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(AppError::Gateway(format!(
                "create-payment rejected ({}): {}",
                status, text
            )));
        }

        let body: CreateResponse = response
            .json()
            .await
            .map_err(|e| AppError::Gateway(format!("create-payment response malformed: {e}")))?;

        let payment_id = string_from_value(&body.payment_id)
            .ok_or_else(|| AppError::Gateway("payment_id missing".to_string()))?;
        let pay_amount = decimal_from_value(&body.pay_amount)
            .ok_or_else(|| AppError::Gateway("pay_amount missing".to_string()))?;
        let expires_at = body
            .expiration_estimate_date
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(CreatePaymentOutcome::Created(CreatedPayment {
            payment_id,
            pay_address: body.pay_address,
            pay_amount,
            expires_at,
        }))
    }

    /// Verify and normalize an IPN callback. With an IPN secret configured
    /// the signature is mandatory; verification uses the raw request body.
    pub fn parse_ipn(&self, signature: Option<&str>, raw_body: &[u8]) -> Result<PaymentEvent> {
        if let Some(secret) = &self.ipn_secret {
            let signature = signature.ok_or(AppError::InvalidSignature)?;
            verify_signature(secret, raw_body, signature)?;
        }

        let data: serde_json::Value = serde_json::from_slice(raw_body)
            .map_err(|_| AppError::BadRequest("IPN body is not JSON".to_string()))?;

        parse_event(&data)
    }
}

fn parse_event(data: &serde_json::Value) -> Result<PaymentEvent> {
    let payment_id = data
        .get("payment_id")
        .and_then(string_from_value_ref)
        .ok_or_else(|| AppError::BadRequest("IPN missing payment_id".to_string()))?;
    let status_raw = data
        .get("payment_status")
        .and_then(|v| v.as_str())
        .ok_or_else(|| AppError::BadRequest("IPN missing payment_status".to_string()))?;
    let pay_currency = data
        .get("pay_currency")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_ascii_lowercase();

    let actually_paid = data
        .get("actually_paid")
        .and_then(decimal_from_value)
        .unwrap_or(Decimal::ZERO);

    let outcome_eur = match (
        data.get("outcome_amount").and_then(decimal_from_value),
        data.get("outcome_currency").and_then(|v| v.as_str()),
    ) {
        (Some(amount), Some(currency)) if currency.eq_ignore_ascii_case("eur") => Some(amount),
        _ => None,
    };

    Ok(PaymentEvent {
        payment_id,
        status: PaymentStatus::from_wire(status_raw),
        pay_currency,
        actually_paid,
        outcome_eur,
        parent_payment_id: data
            .get("parent_payment_id")
            .and_then(string_from_value_ref)
            .filter(|s| !s.is_empty()),
        order_id: data
            .get("order_id")
            .and_then(string_from_value_ref)
            .filter(|s| !s.is_empty()),
    })
}

/// HMAC-SHA512 over the canonical re-serialization (recursively sorted keys,
/// compact separators) of the raw body. Comparison is constant-time via the
/// MAC verify.
fn verify_signature(secret: &str, raw_body: &[u8], signature_hex: &str) -> Result<()> {
    let data: serde_json::Value =
        serde_json::from_slice(raw_body).map_err(|_| AppError::InvalidSignature)?;
    let canonical = canonical_json(&data);

    let expected_tag = hex::decode(signature_hex.trim().to_ascii_lowercase())
        .map_err(|_| AppError::InvalidSignature)?;

    let mut mac = HmacSha512::new_from_slice(secret.as_bytes())
        .map_err(|_| AppError::InvalidSignature)?;
    mac.update(canonical.as_bytes());
    mac.verify_slice(&expected_tag)
        .map_err(|_| AppError::InvalidSignature)
}

/// Deterministic JSON with object keys sorted at every nesting level and no
/// whitespace. Arrays keep their order; scalars use serde_json formatting.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonical_json(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        scalar => serde_json::to_string(scalar).unwrap_or_default(),
    }
}

fn decimal_from_value(value: &serde_json::Value) -> Option<Decimal> {
    match value {
        serde_json::Value::String(s) => s.trim().parse().ok(),
        serde_json::Value::Number(n) => n.to_string().parse().ok(),
        _ => None,
    }
}

fn string_from_value(value: &serde_json::Value) -> Option<String> {
    string_from_value_ref(value)
}

fn string_from_value_ref(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, body: &[u8]) -> String {
        let data: serde_json::Value = serde_json::from_slice(body).unwrap();
        let canonical = canonical_json(&data);
        let mut mac = HmacSha512::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(canonical.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn canonical_json_sorts_keys_recursively() {
        let value: serde_json::Value =
            serde_json::from_str(r#"{"b":1,"a":{"z":true,"y":[3,2]}}"#).unwrap();
        assert_eq!(canonical_json(&value), r#"{"a":{"y":[3,2],"z":true},"b":1}"#);
    }

    #[test]
    fn canonical_json_is_stable_under_key_order() {
        let first: serde_json::Value =
            serde_json::from_str(r#"{"payment_id":1,"payment_status":"finished"}"#).unwrap();
        let second: serde_json::Value =
            serde_json::from_str(r#"{"payment_status":"finished","payment_id":1}"#).unwrap();
        assert_eq!(canonical_json(&first), canonical_json(&second));
    }

    #[test]
    fn signature_verifies_and_rejects_tampering() {
        let secret = "super-secret";
        let body = br#"{"payment_id":42,"payment_status":"finished","actually_paid":"0.07"}"#;
        let signature = sign(secret, body);

        assert!(verify_signature(secret, body, &signature).is_ok());

        let tampered = br#"{"payment_id":42,"payment_status":"finished","actually_paid":"7.00"}"#;
        assert!(matches!(
            verify_signature(secret, tampered, &signature),
            Err(AppError::InvalidSignature)
        ));

        assert!(matches!(
            verify_signature(secret, body, "not-hex"),
            Err(AppError::InvalidSignature)
        ));
    }

    #[test]
    fn signature_accepts_uppercase_hex() {
        let secret = "s";
        let body = br#"{"k":1}"#;
        let signature = sign(secret, body).to_uppercase();
        assert!(verify_signature(secret, body, &signature).is_ok());
    }

    #[test]
    fn parse_event_normalizes_fields() {
        let body = serde_json::json!({
            "payment_id": 123456,
            "payment_status": "partially_paid",
            "pay_currency": "SOL",
            "actually_paid": "0.05",
            "outcome_amount": 7.21,
            "outcome_currency": "eur",
            "order_id": "ORD_abc"
        });
        let event = parse_event(&body).unwrap();
        assert_eq!(event.payment_id, "123456");
        assert_eq!(event.status, PaymentStatus::PartiallyPaid);
        assert_eq!(event.pay_currency, "sol");
        assert_eq!(event.actually_paid, "0.05".parse().unwrap());
        assert_eq!(event.outcome_eur, Some("7.21".parse().unwrap()));
        assert!(event.parent_payment_id.is_none());
    }

    #[test]
    fn parse_event_ignores_non_eur_outcome() {
        let body = serde_json::json!({
            "payment_id": "9",
            "payment_status": "finished",
            "pay_currency": "btc",
            "actually_paid": 0.001,
            "outcome_amount": "0.0009",
            "outcome_currency": "btc"
        });
        let event = parse_event(&body).unwrap();
        assert_eq!(event.outcome_eur, None);
        assert!(event.status.is_paid());
    }

    #[test]
    fn parse_event_requires_payment_id_and_status() {
        let missing_id = serde_json::json!({"payment_status": "finished"});
        assert!(parse_event(&missing_id).is_err());

        let missing_status = serde_json::json!({"payment_id": 1});
        assert!(parse_event(&missing_status).is_err());
    }

    #[test]
    fn status_classification() {
        assert!(PaymentStatus::Finished.is_paid());
        assert!(PaymentStatus::Confirmed.is_paid());
        assert!(PaymentStatus::PartiallyPaid.is_paid());
        assert!(!PaymentStatus::Waiting.is_paid());
        assert!(PaymentStatus::Expired.is_terminal_failure());
        assert!(PaymentStatus::Refunded.is_terminal_failure());
        assert!(!PaymentStatus::Confirming.is_terminal_failure());
        assert_eq!(
            PaymentStatus::from_wire("weird"),
            PaymentStatus::Unknown("weird".to_string())
        );
    }
}
