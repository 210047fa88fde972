//! C3: `TokenPool` — in-memory account index with selection, cooldowns and
//! sticky sessions (`spec.md` §4.1).
//!
//! Grounded on the donor's `gproxy-provider-core::credential::CredentialPool`
//! (async `RwLock`-guarded maps, a background-recoverable unavailable set),
//! generalized to the single critical-section selection algorithm, session
//! stickiness and lazy refresh `spec.md` §4.1/§5 specify.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;

use cloudgate_common::{now_unix_millis, now_unix_seconds};

use crate::account::{Account, AuthTokenRefresher, CloudAccountStore};

/// Rate-limit cooldown: 5 minutes (`spec.md` §4.1).
pub const RATE_LIMIT_COOLDOWN_MS: i64 = 5 * 60 * 1000;
/// Forbidden/unauthorized cooldown: 30 minutes (`spec.md` §4.1).
pub const FORBIDDEN_COOLDOWN_MS: i64 = 30 * 60 * 1000;
/// Sticky-session TTL: 10 minutes (`spec.md` §3 "Session binding").
pub const SESSION_BINDING_TTL_MS: i64 = 10 * 60 * 1000;
/// Refresh when less than this many seconds remain before expiry (`spec.md` §4.1).
pub const REFRESH_SKEW_SECONDS: i64 = 300;

/// `spec.md` §3 "Session binding": `sessionKey → { accountId, expiresAt }`,
/// sticky to the account id rather than its transient position in
/// `accounts` (`spec.md` §4.1 "Session binding semantics" — "Sticky to
/// `accountId`").
#[derive(Debug, Clone)]
struct SessionBinding {
    account_id: String,
    expires_at: i64,
}

struct PoolState {
    /// Stable insertion-order list; round-robin indexes into this.
    accounts: Vec<Account>,
    cooldowns: HashMap<String, i64>,
    session_bindings: HashMap<String, SessionBinding>,
}

/// Arguments for [`TokenPool::select_next`] (`spec.md` §4.1 `SelectNext`).
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    pub session_key: Option<String>,
    pub exclude_account_ids: Vec<String>,
}

pub struct TokenPool {
    store: Arc<dyn CloudAccountStore>,
    refresher: Arc<dyn AuthTokenRefresher>,
    state: Mutex<PoolState>,
    current_index: AtomicUsize,
}

impl TokenPool {
    pub fn new(store: Arc<dyn CloudAccountStore>, refresher: Arc<dyn AuthTokenRefresher>) -> Self {
        Self {
            store,
            refresher,
            state: Mutex::new(PoolState {
                accounts: Vec::new(),
                cooldowns: HashMap::new(),
                session_bindings: HashMap::new(),
            }),
            current_index: AtomicUsize::new(0),
        }
    }

    /// `spec.md` §4.1 `Reload()`: re-read the store.
    pub async fn reload(&self) -> anyhow::Result<()> {
        let accounts = self.store.list_accounts().await?;
        let mut state = self.state.lock().await;
        state.accounts = accounts;
        Ok(())
    }

    pub async fn get_account_count(&self) -> usize {
        self.state.lock().await.accounts.len()
    }

    /// `spec.md` §4.1 "Selection algorithm". Candidate computation and the
    /// round-robin index advance happen under the single lock held by this
    /// function body; the refresh HTTP call (§4.1 "Refresh discipline",
    /// §5 "Avoid holding any lock across network I/O") happens after the
    /// lock is released.
    pub async fn select_next(&self, opts: &SelectOptions) -> Option<Account> {
        if self.get_account_count().await == 0 {
            let _ = self.reload().await;
            if self.get_account_count().await == 0 {
                return None;
            }
        }

        let (chosen_index, used_sticky) = {
            let mut state = self.state.lock().await;
            let now_ms = now_unix_millis();

            if state.accounts.is_empty() {
                return None;
            }

            let excluded: std::collections::HashSet<&str> =
                opts.exclude_account_ids.iter().map(String::as_str).collect();

            let mut candidates: Vec<usize> = (0..state.accounts.len())
                .filter(|i| !excluded.contains(state.accounts[*i].id.as_str()))
                .collect();
            if candidates.is_empty() && !excluded.is_empty() {
                tracing::warn!("exclusion list emptied the candidate pool, falling back to all accounts");
                candidates = (0..state.accounts.len()).collect();
            }
            let candidates0 = candidates.clone();

            state
                .session_bindings
                .retain(|_, binding| binding.expires_at > now_ms);

            let cooled: std::collections::HashSet<usize> = candidates0
                .iter()
                .copied()
                .filter(|i| {
                    state
                        .cooldowns
                        .get(&state.accounts[*i].id)
                        .is_some_and(|until| *until > now_ms)
                })
                .collect();
            let mut selectable: Vec<usize> =
                candidates0.iter().copied().filter(|i| !cooled.contains(i)).collect();
            if selectable.is_empty() {
                tracing::warn!("bypassing cooldown to keep service available");
                selectable = candidates0.clone();
            }

            drop(candidates);

            let sticky_index = opts.session_key.as_ref().and_then(|session_key| {
                let binding = state.session_bindings.get(session_key)?;
                if binding.expires_at <= now_ms {
                    return None;
                }
                selectable
                    .iter()
                    .copied()
                    .find(|i| state.accounts[*i].id == binding.account_id)
            });

            match sticky_index {
                Some(index) => (index, true),
                None => {
                    let index = self.round_robin_pick(&selectable);
                    (index, false)
                }
            }
        };

        self.finalize_selection(chosen_index, opts.session_key.as_deref(), used_sticky)
            .await
    }

    fn round_robin_pick(&self, selectable: &[usize]) -> usize {
        let pick = self.current_index.fetch_add(1, Ordering::SeqCst) % selectable.len();
        selectable[pick]
    }

    /// `spec.md` §4.1 "Finalize the selection": lazy refresh, `project_id`
    /// sanitization, and (if a session key was supplied) binding the session.
    async fn finalize_selection(
        &self,
        index: usize,
        session_key: Option<&str>,
        used_sticky: bool,
    ) -> Option<Account> {
        let needs_refresh = {
            let state = self.state.lock().await;
            let account = state.accounts.get(index)?;
            account.token.seconds_until_expiry() < REFRESH_SKEW_SECONDS
        };

        if needs_refresh {
            let (refresh_token, account_id) = {
                let state = self.state.lock().await;
                let account = state.accounts.get(index)?;
                (account.token.refresh_token.clone(), account.id.clone())
            };

            match self.refresher.refresh(&refresh_token).await {
                Ok(refreshed) => {
                    let mut state = self.state.lock().await;
                    if let Some(account) = state.accounts.get_mut(index) {
                        account.token.access_token = refreshed.access_token;
                        if let Some(rt) = refreshed.refresh_token {
                            account.token.refresh_token = rt;
                        }
                        account.token.expires_in = refreshed.expires_in;
                        account.token.expiry_timestamp = now_unix_seconds() + refreshed.expires_in;
                        let updated = account.clone();
                        drop(state);
                        if let Err(err) = self.store.upsert_account(updated).await {
                            tracing::warn!(account = %account_id, error = %err, "failed to persist refreshed token");
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(account = %account_id, error = %err, "token refresh failed, proceeding with stale token");
                }
            }
        }

        let mut state = self.state.lock().await;
        let account = state.accounts.get_mut(index)?;
        let sanitized = account.token.sanitized_project_id();
        account.token.project_id = Some(sanitized);
        account.last_used = now_unix_seconds();
        let result = account.clone();

        if let Some(key) = session_key {
            if !used_sticky {
                state.session_bindings.insert(
                    key.to_string(),
                    SessionBinding {
                        account_id: result.id.clone(),
                        expires_at: now_unix_millis() + SESSION_BINDING_TTL_MS,
                    },
                );
            } else {
                // Refresh the TTL on every successful sticky hit.
                if let Some(binding) = state.session_bindings.get_mut(key) {
                    binding.expires_at = now_unix_millis() + SESSION_BINDING_TTL_MS;
                }
            }
        }

        Some(result)
    }

    /// `spec.md` §4.1 `MarkRateLimited`: 5-minute cooldown.
    pub async fn mark_rate_limited(&self, id_or_email: &str) {
        self.mark_cooldown(id_or_email, RATE_LIMIT_COOLDOWN_MS, "rate-limited")
            .await;
    }

    /// `spec.md` §4.1 `MarkForbidden`: 30-minute cooldown.
    pub async fn mark_forbidden(&self, id_or_email: &str) {
        self.mark_cooldown(id_or_email, FORBIDDEN_COOLDOWN_MS, "forbidden")
            .await;
    }

    async fn mark_cooldown(&self, id_or_email: &str, duration_ms: i64, reason: &str) {
        let mut state = self.state.lock().await;
        let Some(account) = state
            .accounts
            .iter()
            .find(|a| a.id == id_or_email || a.email == id_or_email)
        else {
            return;
        };
        let id = account.id.clone();
        let until = now_unix_millis() + duration_ms;
        state.cooldowns.insert(id.clone(), until);
        tracing::warn!(account = %id, %reason, until, "account placed on cooldown");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::{Provider, RefreshedToken, Token};
    use async_trait::async_trait;

    struct NoopRefresher;

    #[async_trait]
    impl AuthTokenRefresher for NoopRefresher {
        async fn refresh(&self, _refresh_token: &str) -> anyhow::Result<RefreshedToken> {
            Ok(RefreshedToken {
                access_token: "refreshed".to_string(),
                refresh_token: None,
                expires_in: 3600,
            })
        }
    }

    fn account(id: &str) -> Account {
        Account {
            id: id.to_string(),
            provider: Provider::Google,
            email: format!("{id}@example.com"),
            token: Token {
                access_token: "at".to_string(),
                refresh_token: "rt".to_string(),
                token_type: "Bearer".to_string(),
                expires_in: 3600,
                expiry_timestamp: now_unix_seconds() + 3600,
                project_id: Some("proj-x".to_string()),
                session_id: None,
                upstream_proxy_url: None,
            },
            quota: None,
            status: None,
            is_active: true,
            created_at: now_unix_seconds(),
            last_used: 0,
        }
    }

    fn pool(ids: &[&str]) -> TokenPool {
        let store = crate::account::InMemoryAccountStore::new(
            ids.iter().map(|id| account(id)).collect(),
        );
        TokenPool::new(Arc::new(store), Arc::new(NoopRefresher))
    }

    #[tokio::test]
    async fn round_robin_without_session_key() {
        let pool = pool(&["A", "B"]);
        pool.reload().await.unwrap();

        let first = pool.select_next(&SelectOptions::default()).await.unwrap();
        let second = pool.select_next(&SelectOptions::default()).await.unwrap();
        let third = pool.select_next(&SelectOptions::default()).await.unwrap();

        assert_eq!(first.id, "A");
        assert_eq!(second.id, "B");
        assert_eq!(third.id, "A");
    }

    #[tokio::test]
    async fn sticky_session_pins_to_same_account() {
        let pool = pool(&["A", "B"]);
        pool.reload().await.unwrap();

        let opts = SelectOptions {
            session_key: Some("s1".to_string()),
            exclude_account_ids: vec![],
        };
        let first = pool.select_next(&opts).await.unwrap();
        let second = pool.select_next(&opts).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn mark_rate_limited_excludes_until_cooldown_fallback() {
        let pool = pool(&["A", "B"]);
        pool.reload().await.unwrap();
        pool.mark_rate_limited("A").await;

        // A is cooled; B should always be picked while A remains cooled.
        for _ in 0..3 {
            let picked = pool.select_next(&SelectOptions::default()).await.unwrap();
            assert_eq!(picked.id, "B");
        }
    }

    #[tokio::test]
    async fn all_cooled_falls_back_to_full_candidate_set() {
        let pool = pool(&["A"]);
        pool.reload().await.unwrap();
        pool.mark_rate_limited("A").await;

        let picked = pool.select_next(&SelectOptions::default()).await;
        assert!(picked.is_some());
    }

    #[tokio::test]
    async fn synthetic_project_id_is_sanitized_on_finalize() {
        let store = crate::account::InMemoryAccountStore::new(vec![{
            let mut a = account("A");
            a.token.project_id = Some("cloud-code-42".to_string());
            a
        }]);
        let pool = TokenPool::new(Arc::new(store), Arc::new(NoopRefresher));
        pool.reload().await.unwrap();

        let picked = pool.select_next(&SelectOptions::default()).await.unwrap();
        assert_eq!(picked.token.project_id.as_deref(), Some(""));
    }

    #[tokio::test]
    async fn exclusion_emptying_candidates_falls_back_with_warning() {
        let pool = pool(&["A"]);
        pool.reload().await.unwrap();

        let opts = SelectOptions {
            session_key: None,
            exclude_account_ids: vec!["A".to_string()],
        };
        let picked = pool.select_next(&opts).await;
        assert!(picked.is_some());
    }

    #[tokio::test]
    async fn empty_pool_returns_none() {
        let pool = pool(&[]);
        let picked = pool.select_next(&SelectOptions::default()).await;
        assert!(picked.is_none());
    }
}
