use crate::constants::{DEFAULT_BASKET_TIMEOUT_MINUTES, DEFAULT_DEPOSIT_LIFETIME_MINUTES};
use std::env;

/// One primary bot identity plus its ordered backup tokens.
#[derive(Debug, Clone)]
pub struct BotTokenConfig {
    pub index: usize,
    pub token: String,
    pub bot_id: String,
    pub backups: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    // Server
    pub host: String,
    pub port: u16,
    pub environment: String,

    // Database
    pub database_url: String,
    pub database_max_connections: u32,

    // Telegram fleet
    pub bot_tokens: Vec<BotTokenConfig>,
    pub webhook_url: String,
    pub primary_admin_ids: Vec<i64>,
    pub secondary_admin_ids: Vec<i64>,
    pub support_username: String,

    // Shop behavior
    pub basket_timeout_minutes: u64,
    pub pending_deposit_lifetime_minutes: u64,
    pub media_dir: String,

    // Payment gateway
    pub nowpayments_api_key: String,
    pub nowpayments_ipn_secret: Option<String>,
    pub nowpayments_api_url: String,

    // Price oracle
    pub price_rpc_url: Option<String>,

    // Optional direct-chain mode
    pub solana_watch_wallet: Option<String>,
    pub solana_rpc_url: String,

    // Admin HTTP surface
    pub admin_api_key: Option<String>,

    // CORS
    pub cors_allowed_origins: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let bot_tokens = parse_bot_tokens()?;

        Ok(Config {
            host: env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()?,
            environment: env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string()),

            database_url: env::var("DATABASE_URL")?,
            database_max_connections: env::var("DATABASE_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "50".to_string())
                .parse()?,

            bot_tokens,
            webhook_url: env::var("WEBHOOK_URL")?,
            primary_admin_ids: parse_admin_ids(),
            secondary_admin_ids: parse_id_list(
                &env::var("SECONDARY_ADMIN_IDS").unwrap_or_default(),
            ),
            support_username: env::var("SUPPORT_USERNAME")
                .unwrap_or_else(|_| "support".to_string()),

            basket_timeout_minutes: parse_minutes(
                "BASKET_TIMEOUT_MINUTES",
                DEFAULT_BASKET_TIMEOUT_MINUTES,
            ),
            pending_deposit_lifetime_minutes: parse_minutes(
                "PENDING_DEPOSIT_LIFETIME_MINUTES",
                DEFAULT_DEPOSIT_LIFETIME_MINUTES,
            ),
            media_dir: env::var("MEDIA_DIR").unwrap_or_else(|_| "./media".to_string()),

            nowpayments_api_key: env::var("NOWPAYMENTS_API_KEY")?,
            nowpayments_ipn_secret: env::var("NOWPAYMENTS_IPN_SECRET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            nowpayments_api_url: env::var("NOWPAYMENTS_API_URL")
                .unwrap_or_else(|_| "https://api.nowpayments.io".to_string()),

            price_rpc_url: env::var("PRICE_RPC_URL").ok().filter(|s| !s.trim().is_empty()),

            solana_watch_wallet: env::var("SOLANA_WATCH_WALLET")
                .ok()
                .filter(|s| !s.trim().is_empty()),
            solana_rpc_url: env::var("SOLANA_RPC_URL")
                .unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".to_string()),

            admin_api_key: env::var("ADMIN_API_KEY").ok().filter(|s| !s.trim().is_empty()),

            cors_allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_else(|_| "*".to_string()),
        })
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.database_url.trim().is_empty() {
            anyhow::bail!("DATABASE_URL is empty");
        }
        if self.bot_tokens.is_empty() {
            anyhow::bail!("No bot tokens configured. Set TOKEN or TOKENS.");
        }
        if self.webhook_url.trim().is_empty() {
            anyhow::bail!("WEBHOOK_URL is empty");
        }
        url::Url::parse(&self.webhook_url)
            .map_err(|e| anyhow::anyhow!("WEBHOOK_URL is not a valid URL: {e}"))?;
        if self.nowpayments_api_key.trim().is_empty() {
            anyhow::bail!("NOWPAYMENTS_API_KEY is empty; payment system cannot work");
        }

        if self.primary_admin_ids.is_empty() {
            tracing::warn!("No primary admin IDs configured; admin alerts are disabled");
        }
        if self.nowpayments_ipn_secret.is_none() {
            tracing::warn!("NOWPAYMENTS_IPN_SECRET not set; IPN signature verification disabled");
        }
        if self.admin_api_key.is_none() {
            tracing::warn!("ADMIN_API_KEY not set; admin HTTP endpoints disabled");
        }
        if let Some(wallet) = &self.solana_watch_wallet {
            tracing::info!("Direct-chain deposit mode enabled for wallet {}…", &wallet[..wallet.len().min(8)]);
        }

        for bot in &self.bot_tokens {
            tracing::info!(
                "Bot {} (ID: {}) configured with {} backup token(s)",
                bot.index + 1,
                bot.bot_id,
                bot.backups.len()
            );
        }

        Ok(())
    }

    pub fn basket_timeout(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.basket_timeout_minutes as i64)
    }

    pub fn pending_deposit_lifetime(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.pending_deposit_lifetime_minutes as i64)
    }

    pub fn is_primary_admin(&self, user_id: i64) -> bool {
        self.primary_admin_ids.contains(&user_id)
    }

    pub fn is_admin(&self, user_id: i64) -> bool {
        self.primary_admin_ids.contains(&user_id) || self.secondary_admin_ids.contains(&user_id)
    }

    pub fn ipn_url(&self) -> String {
        format!("{}/webhook", self.webhook_url.trim_end_matches('/'))
    }

    pub fn telegram_webhook_url(&self, token: &str) -> String {
        format!("{}/telegram/{}", self.webhook_url.trim_end_matches('/'), token)
    }
}

/// TOKENS takes precedence over the legacy singular TOKEN. Each primary may
/// carry an ordered backup list in BACKUP_TOKENS_<n> (1-based).
fn parse_bot_tokens() -> anyhow::Result<Vec<BotTokenConfig>> {
    let tokens_str = env::var("TOKENS").unwrap_or_default();
    let mut raw: Vec<String> = tokens_str
        .split(',')
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    if raw.is_empty() {
        if let Ok(single) = env::var("TOKEN") {
            let single = single.trim().to_string();
            if !single.is_empty() {
                raw.push(single);
            }
        }
    }

    let mut out = Vec::with_capacity(raw.len());
    for (index, token) in raw.into_iter().enumerate() {
        let bot_id = bot_id_from_token(&token)
            .ok_or_else(|| anyhow::anyhow!("Token {} format is invalid", index + 1))?;

        let backups = env::var(format!("BACKUP_TOKENS_{}", index + 1))
            .unwrap_or_default()
            .split(',')
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .collect();

        out.push(BotTokenConfig {
            index,
            token,
            bot_id,
            backups,
        });
    }
    Ok(out)
}

/// Telegram tokens look like `<numeric bot id>:<secret>`.
pub fn bot_id_from_token(token: &str) -> Option<String> {
    let (id, secret) = token.split_once(':')?;
    if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    if secret.len() < 30 {
        return None;
    }
    Some(id.to_string())
}

/// PRIMARY_ADMIN_IDS plus the legacy single ADMIN_ID merged in.
fn parse_admin_ids() -> Vec<i64> {
    let mut ids = parse_id_list(&env::var("PRIMARY_ADMIN_IDS").unwrap_or_default());
    if let Ok(legacy) = env::var("ADMIN_ID") {
        if let Ok(id) = legacy.trim().parse::<i64>() {
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
    }
    ids
}

fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|part| part.trim().parse::<i64>().ok())
        .collect()
}

fn parse_minutes(key: &str, default: u64) -> u64 {
    match env::var(key).ok().and_then(|v| v.trim().parse::<u64>().ok()) {
        Some(n) if n > 0 => n,
        Some(_) => {
            tracing::warn!("{} must be positive, using default {}", key, default);
            default
        }
        None => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bot_id_from_token_requires_numeric_prefix() {
        assert_eq!(
            bot_id_from_token("123456:AAEhBOweik6ad9r_QXMENQjcrGbqCr4K-pk"),
            Some("123456".to_string())
        );
        assert_eq!(bot_id_from_token("notdigits:AAEhBOweik6ad9r_QXMENQjcrGbq"), None);
        assert_eq!(bot_id_from_token("123456"), None);
        assert_eq!(bot_id_from_token("123456:short"), None);
    }

    #[test]
    fn parse_id_list_skips_garbage() {
        assert_eq!(parse_id_list("1, 2,x, 3"), vec![1, 2, 3]);
        assert!(parse_id_list("").is_empty());
    }
}
