use rust_decimal::Decimal;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// What the next free-text message from a user means. One state per flow;
/// transitions happen only on matching input kinds.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum FlowState {
    #[default]
    Idle,
    AwaitingDiscountCode,
    AwaitingRefillAmount,
}

#[derive(Debug, Clone, Default)]
pub struct UserSession {
    pub state: FlowState,
    /// Code already consumed via the atomic apply; re-validated read-only on
    /// every requote and silently detached if it stops matching.
    pub applied_code: Option<String>,
    /// Refill amount captured while the user picks a currency.
    pub refill_amount: Option<Decimal>,
}

/// Per-user conversation state, partitioned by user id. No cross-user
/// sharing; the map is only contended for the duration of a clone or store.
#[derive(Default)]
pub struct SessionStore {
    inner: RwLock<HashMap<i64, UserSession>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, user_id: i64) -> UserSession {
        self.inner
            .read()
            .await
            .get(&user_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn set_state(&self, user_id: i64, state: FlowState) {
        let mut map = self.inner.write().await;
        map.entry(user_id).or_default().state = state;
    }

    pub async fn set_applied_code(&self, user_id: i64, code: Option<String>) {
        let mut map = self.inner.write().await;
        map.entry(user_id).or_default().applied_code = code;
    }

    pub async fn set_refill_amount(&self, user_id: i64, amount: Option<Decimal>) {
        let mut map = self.inner.write().await;
        map.entry(user_id).or_default().refill_amount = amount;
    }

    pub async fn reset(&self, user_id: i64) {
        let mut map = self.inner.write().await;
        if let Some(session) = map.get_mut(&user_id) {
            session.state = FlowState::Idle;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sessions_are_partitioned_by_user() {
        let store = SessionStore::new();
        store.set_state(1, FlowState::AwaitingDiscountCode).await;
        store.set_applied_code(2, Some("SUMMER".to_string())).await;

        assert_eq!(store.get(1).await.state, FlowState::AwaitingDiscountCode);
        assert_eq!(store.get(1).await.applied_code, None);
        assert_eq!(store.get(2).await.state, FlowState::Idle);
        assert_eq!(store.get(2).await.applied_code, Some("SUMMER".to_string()));
    }

    #[tokio::test]
    async fn reset_returns_to_idle_but_keeps_code() {
        let store = SessionStore::new();
        store.set_state(7, FlowState::AwaitingRefillAmount).await;
        store.set_applied_code(7, Some("X".to_string())).await;
        store.reset(7).await;

        let session = store.get(7).await;
        assert_eq!(session.state, FlowState::Idle);
        assert_eq!(session.applied_code, Some("X".to_string()));
    }
}
