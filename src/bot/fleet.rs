use crate::{
    bot::outbound::{self, SendOutcome},
    config::{bot_id_from_token, Config},
    constants::TRANSPORT_STOP_TIMEOUT_SECS,
    db::Database,
};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use teloxide::RequestError;
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Health {
    Ok,
    /// Token revoked or the bot itself was banned.
    AuthFatal,
    /// Network blip; never triggers failover.
    Transient,
}

/// N live Telegram transports behind one backend. Deposits and purchases
/// remember the bot_id that created them; the registry keeps both original
/// and replacement bot_ids routable after a failover.
pub struct BotFleet {
    config: Config,
    db: Database,
    /// bot_id (canonical or alias) -> live transport.
    registry: RwLock<HashMap<String, Arc<Bot>>>,
    /// Webhook path token -> canonical bot_id, for the update sink.
    tokens: RwLock<HashMap<String, String>>,
    /// Primary index -> currently active bot_id.
    active: RwLock<HashMap<usize, String>>,
    failed: RwLock<HashSet<String>>,
    /// Serializes failovers fleet-wide.
    failover_lock: Mutex<()>,
    failover_in_progress: Mutex<HashSet<String>>,
    /// Primary index -> next unused backup offset.
    next_backup: Mutex<HashMap<usize, usize>>,
}

impl BotFleet {
    pub fn new(config: Config, db: Database) -> Self {
        Self {
            config,
            db,
            registry: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            active: RwLock::new(HashMap::new()),
            failed: RwLock::new(HashSet::new()),
            failover_lock: Mutex::new(()),
            failover_in_progress: Mutex::new(HashSet::new()),
            next_backup: Mutex::new(HashMap::new()),
        }
    }

    /// Bring up every primary transport and install its webhook. A primary
    /// that fails verification at boot is still registered; the health loop
    /// owns failover decisions.
    pub async fn start(self: &Arc<Self>) -> anyhow::Result<()> {
        for bot_info in &self.config.bot_tokens {
            let bot = Arc::new(Bot::new(bot_info.token.clone()));

            let webhook = self.config.telegram_webhook_url(&bot_info.token);
            match url::Url::parse(&webhook) {
                Ok(url) => {
                    if let Err(err) = bot.set_webhook(url).await {
                        tracing::warn!(
                            "Webhook install failed for bot {}: {}",
                            bot_info.bot_id,
                            err
                        );
                    }
                }
                Err(err) => tracing::error!("Bad webhook URL for bot {}: {}", bot_info.bot_id, err),
            }

            match bot.get_me().await {
                Ok(me) => tracing::info!(
                    "Bot {} online as @{}",
                    bot_info.bot_id,
                    me.username.as_deref().unwrap_or("?")
                ),
                Err(err) => tracing::warn!(
                    "Bot {} identity probe failed at boot: {}",
                    bot_info.bot_id,
                    err
                ),
            }

            self.registry
                .write()
                .await
                .insert(bot_info.bot_id.clone(), bot);
            self.tokens
                .write()
                .await
                .insert(bot_info.token.clone(), bot_info.bot_id.clone());
            self.active
                .write()
                .await
                .insert(bot_info.index, bot_info.bot_id.clone());
        }
        Ok(())
    }

    /// Transport responsible for `bot_id`, following failover aliases. Falls
    /// back to any live transport so a committed delivery always has a path
    /// out.
    pub async fn bot_for(&self, bot_id: &str) -> Option<Arc<Bot>> {
        let registry = self.registry.read().await;
        if let Some(bot) = registry.get(bot_id) {
            return Some(bot.clone());
        }
        drop(registry);
        self.any_live_bot().await
    }

    pub async fn bot_for_token(&self, token: &str) -> Option<(String, Arc<Bot>)> {
        let bot_id = self.tokens.read().await.get(token).cloned()?;
        let bot = self.registry.read().await.get(&bot_id).cloned()?;
        Some((bot_id, bot))
    }

    pub async fn any_live_bot(&self) -> Option<Arc<Bot>> {
        let failed = self.failed.read().await;
        let active = self.active.read().await;
        let registry = self.registry.read().await;
        for bot_id in active.values() {
            if failed.contains(bot_id) {
                continue;
            }
            if let Some(bot) = registry.get(bot_id) {
                return Some(bot.clone());
            }
        }
        None
    }

    /// First bot_id in the fleet, used to stamp state created outside any
    /// inbound update (admin API, recovery).
    pub async fn default_bot_id(&self) -> String {
        let active = self.active.read().await;
        active
            .get(&0)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }

    /// Route a text message through the transport the user knows.
    pub async fn send_text_routed(&self, bot_id: &str, chat_id: i64, text: &str) -> SendOutcome {
        let Some(bot) = self.bot_for(bot_id).await else {
            tracing::error!("No live transport to reach chat {}", chat_id);
            return SendOutcome::Failed;
        };
        let outcome = outbound::send_text(&bot, chat_id, text).await;
        if outcome == SendOutcome::Blocked {
            let _ = self.db.mark_inactive(chat_id).await;
        }
        outcome
    }

    pub async fn send_media_routed(
        &self,
        bot_id: &str,
        chat_id: i64,
        media_kind: &str,
        path: &str,
        caption: Option<&str>,
    ) -> SendOutcome {
        let Some(bot) = self.bot_for(bot_id).await else {
            return SendOutcome::Failed;
        };
        let outcome = outbound::send_media(&bot, chat_id, media_kind, path, caption).await;
        if outcome == SendOutcome::Blocked {
            let _ = self.db.mark_inactive(chat_id).await;
        }
        outcome
    }

    /// Alert every primary admin through the first surviving transport.
    pub async fn notify_admins(&self, message: &str) {
        self.notify_admins_excluding(message, None).await;
    }

    async fn notify_admins_excluding(&self, message: &str, exclude_bot_id: Option<&str>) {
        if self.config.primary_admin_ids.is_empty() {
            tracing::warn!("Admin alert dropped (no admins configured): {}", message);
            return;
        }

        let candidates: Vec<(String, Arc<Bot>)> = {
            let failed = self.failed.read().await;
            let active = self.active.read().await;
            let registry = self.registry.read().await;
            active
                .values()
                .filter(|id| !failed.contains(*id) && Some(id.as_str()) != exclude_bot_id)
                .filter_map(|id| registry.get(id).map(|b| (id.clone(), b.clone())))
                .collect()
        };

        for (bot_id, bot) in candidates {
            let mut delivered = false;
            for admin_id in &self.config.primary_admin_ids {
                if outbound::send_text(&bot, *admin_id, message).await == SendOutcome::Sent {
                    delivered = true;
                }
            }
            if delivered {
                return;
            }
            tracing::warn!("Admin alert via bot {} failed; trying next transport", bot_id);
        }
        tracing::error!("Admin alert undeliverable on every transport: {}", message);
    }

    // -------------------- health & failover --------------------

    /// §60s loop body: probe each active identity, failing over the ones
    /// whose token no longer authenticates.
    pub async fn health_check_all(self: &Arc<Self>) {
        let snapshot: Vec<(usize, String)> = {
            let active = self.active.read().await;
            active.iter().map(|(i, id)| (*i, id.clone())).collect()
        };

        for (index, bot_id) in snapshot {
            if self.failed.read().await.contains(&bot_id) {
                continue;
            }
            let Some(bot) = self.registry.read().await.get(&bot_id).cloned() else {
                continue;
            };

            match probe(&bot).await {
                Health::Ok | Health::Transient => {}
                Health::AuthFatal => {
                    tracing::error!(
                        "Health check failed for bot {} (primary {}); starting failover",
                        bot_id,
                        index + 1
                    );
                    let fleet = self.clone();
                    fleet.perform_failover(&bot_id, index).await;
                }
            }
        }
    }

    /// Promote the next unused backup token for a primary. Holds the fleet
    /// mutex end to end; the in-progress set blocks re-entry from error
    /// handlers racing the health loop. Success is silent; only failures
    /// alert the admins.
    pub async fn perform_failover(self: &Arc<Self>, failed_bot_id: &str, primary_index: usize) -> bool {
        let _guard = self.failover_lock.lock().await;

        {
            let mut in_progress = self.failover_in_progress.lock().await;
            if in_progress.contains(failed_bot_id) {
                tracing::info!("Failover already in progress for bot {}", failed_bot_id);
                return false;
            }
            if self.failed.read().await.contains(failed_bot_id) {
                return false;
            }
            in_progress.insert(failed_bot_id.to_string());
        }

        let result = self.failover_inner(failed_bot_id, primary_index).await;

        self.failover_in_progress
            .lock()
            .await
            .remove(failed_bot_id);
        result
    }

    async fn failover_inner(self: &Arc<Self>, failed_bot_id: &str, primary_index: usize) -> bool {
        let backup_token = self.take_next_backup(primary_index).await;
        let Some(backup_token) = backup_token else {
            self.failed.write().await.insert(failed_bot_id.to_string());
            self.notify_admins_excluding(
                &format!(
                    "CRITICAL: Bot {} (ID: {}) is down and no backup tokens remain. \
                     Manual intervention required.",
                    primary_index + 1,
                    failed_bot_id
                ),
                Some(failed_bot_id),
            )
            .await;
            return false;
        };

        let Some(backup_bot_id) = bot_id_from_token(&backup_token) else {
            tracing::error!("Backup token for primary {} is malformed", primary_index + 1);
            return false;
        };

        tracing::warn!("FAILOVER: bot {} -> backup {}", failed_bot_id, backup_bot_id);
        self.failed.write().await.insert(failed_bot_id.to_string());

        // Stop the old transport, bounded: a wedged HTTP client must not
        // stall the promotion.
        let old_bot = self.registry.read().await.get(failed_bot_id).cloned();
        if let Some(old_bot) = old_bot {
            let stop = tokio::time::timeout(
                Duration::from_secs(TRANSPORT_STOP_TIMEOUT_SECS),
                old_bot.delete_webhook(),
            )
            .await;
            match stop {
                Ok(Ok(_)) => {}
                Ok(Err(err)) => tracing::warn!("Stopping old bot {}: {}", failed_bot_id, err),
                Err(_) => tracing::warn!(
                    "Timeout stopping old bot {}; abandoning it",
                    failed_bot_id
                ),
            }
        }

        let new_bot = Arc::new(Bot::new(backup_token.clone()));
        let webhook = self.config.telegram_webhook_url(&backup_token);
        let install = match url::Url::parse(&webhook) {
            Ok(url) => new_bot.set_webhook(url).await.map(|_| ()),
            Err(err) => {
                tracing::error!("Bad webhook URL for backup: {}", err);
                self.notify_failover_failure(failed_bot_id, primary_index, "bad webhook URL")
                    .await;
                return false;
            }
        };
        if let Err(err) = install {
            self.notify_failover_failure(failed_bot_id, primary_index, &err.to_string())
                .await;
            return false;
        }

        match new_bot.get_me().await {
            Ok(me) => {
                tracing::info!(
                    "FAILOVER SUCCESS: primary {} now @{} (ID: {})",
                    primary_index + 1,
                    me.username.as_deref().unwrap_or("?"),
                    backup_bot_id
                );
            }
            Err(err) => {
                self.notify_failover_failure(failed_bot_id, primary_index, &err.to_string())
                    .await;
                return false;
            }
        }

        {
            let mut registry = self.registry.write().await;
            registry.insert(backup_bot_id.clone(), new_bot.clone());
            // Alias: deliveries addressed to the dead identity flow through
            // the replacement until the next restart.
            registry.insert(failed_bot_id.to_string(), new_bot);
        }
        self.tokens
            .write()
            .await
            .insert(backup_token, backup_bot_id.clone());
        self.active
            .write()
            .await
            .insert(primary_index, backup_bot_id);

        true
    }

    async fn take_next_backup(&self, primary_index: usize) -> Option<String> {
        let backups = &self.config.bot_tokens.get(primary_index)?.backups;
        let mut next = self.next_backup.lock().await;
        let offset = next.entry(primary_index).or_insert(0);
        let token = backups.get(*offset)?.clone();
        *offset += 1;
        Some(token)
    }

    async fn notify_failover_failure(&self, failed_bot_id: &str, primary_index: usize, error: &str) {
        let short: String = error.chars().take(100).collect();
        self.notify_admins_excluding(
            &format!(
                "Failover FAILED for bot {} (ID: {}): {}",
                primary_index + 1,
                failed_bot_id,
                short
            ),
            Some(failed_bot_id),
        )
        .await;
    }
}

/// Identity probe classification. Blocked-by-user style errors come back as
/// Forbidden but are user-scoped, not a token problem.
async fn probe(bot: &Bot) -> Health {
    match bot.get_me().await {
        Ok(_) => Health::Ok,
        Err(err) => classify_probe_error(&err),
    }
}

fn classify_probe_error(err: &RequestError) -> Health {
    match err {
        RequestError::Network(_) | RequestError::Io(_) | RequestError::RetryAfter(_) => {
            Health::Transient
        }
        _ => {
            let text = err.to_string().to_ascii_lowercase();
            if text.contains("bot was blocked") || text.contains("user is deactivated") {
                return Health::Ok;
            }
            if text.contains("unauthorized") || text.contains("bot token") {
                return Health::AuthFatal;
            }
            Health::Transient
        }
    }
}
