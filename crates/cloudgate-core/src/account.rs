//! C1/C2: the external interfaces this crate depends on without implementing.
//!
//! `spec.md` §3 "Account"/"Token" data model, plus the `CloudAccountStore` and
//! `AuthTokenRefresher` interfaces `spec.md` §1 names as out-of-scope
//! collaborators. An in-memory store is provided as the default/test
//! implementation — persistence itself is assumed, not built here.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

use cloudgate_common::now_unix_seconds;

fn synthetic_project_pattern() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)^cloud-code-\d+$").unwrap())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    Google,
    Anthropic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    RateLimited,
    Expired,
}

/// `spec.md` §3 "Token". `expiry_timestamp` is the authoritative deadline;
/// `expires_in` is informational only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    pub expires_in: i64,
    pub expiry_timestamp: i64,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub upstream_proxy_url: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

impl Token {
    /// A synthetic `project_id` matching `^cloud-code-\d+$` (case-insensitive)
    /// is discarded before use (`spec.md` §3 "Token" invariants).
    pub fn sanitized_project_id(&self) -> String {
        match &self.project_id {
            Some(id) if synthetic_project_pattern().is_match(id) => String::new(),
            Some(id) => id.clone(),
            None => String::new(),
        }
    }

    pub fn seconds_until_expiry(&self) -> i64 {
        self.expiry_timestamp - now_unix_seconds()
    }
}

/// `spec.md` §3 "Account". `id` is stable/unique; `email` is a label, not a
/// validated address. `is_active` is advisory — the pool selector only
/// consults `status` and cooldowns (`spec.md` §9 open question, resolved: the
/// flag is surfaced for callers/UI but never excludes an account from
/// selection on its own).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    pub id: String,
    pub provider: Provider,
    pub email: String,
    pub token: Token,
    #[serde(default)]
    pub quota: Option<serde_json::Value>,
    #[serde(default)]
    pub status: Option<AccountStatus>,
    #[serde(default = "default_true")]
    pub is_active: bool,
    pub created_at: i64,
    pub last_used: i64,
}

fn default_true() -> bool {
    true
}

/// C1: persistent CRUD for account records. Implemented externally (desktop
/// app / local persistence layer); `cloudgate-core` only consumes it.
#[async_trait]
pub trait CloudAccountStore: Send + Sync {
    async fn list_accounts(&self) -> anyhow::Result<Vec<Account>>;
    async fn upsert_account(&self, account: Account) -> anyhow::Result<()>;
    async fn get_account(&self, id: &str) -> anyhow::Result<Option<Account>>;
}

/// C2: exchanges a refresh-token for a fresh access-token. Implemented
/// externally (OAuth client); `cloudgate-core` only consumes it.
#[async_trait]
pub trait AuthTokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> anyhow::Result<RefreshedToken>;
}

#[derive(Debug, Clone)]
pub struct RefreshedToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_in: i64,
}

/// Default/test `CloudAccountStore`: an in-memory map guarded by a `RwLock`.
/// Stands in for the real (host-app-owned) persistence layer in tests and in
/// standalone deployments of this gateway.
#[derive(Default)]
pub struct InMemoryAccountStore {
    accounts: RwLock<HashMap<String, Account>>,
}

impl InMemoryAccountStore {
    pub fn new(accounts: Vec<Account>) -> Self {
        let map = accounts.into_iter().map(|a| (a.id.clone(), a)).collect();
        Self {
            accounts: RwLock::new(map),
        }
    }
}

#[async_trait]
impl CloudAccountStore for InMemoryAccountStore {
    async fn list_accounts(&self) -> anyhow::Result<Vec<Account>> {
        Ok(self.accounts.read().unwrap().values().cloned().collect())
    }

    async fn upsert_account(&self, account: Account) -> anyhow::Result<()> {
        self.accounts
            .write()
            .unwrap()
            .insert(account.id.clone(), account);
        Ok(())
    }

    async fn get_account(&self, id: &str) -> anyhow::Result<Option<Account>> {
        Ok(self.accounts.read().unwrap().get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token() -> Token {
        Token {
            access_token: "at".to_string(),
            refresh_token: "rt".to_string(),
            token_type: "Bearer".to_string(),
            expires_in: 3600,
            expiry_timestamp: now_unix_seconds() + 3600,
            project_id: None,
            session_id: None,
            upstream_proxy_url: None,
        }
    }

    #[test]
    fn synthetic_project_id_is_discarded() {
        let mut t = token();
        t.project_id = Some("cloud-code-12345".to_string());
        assert_eq!(t.sanitized_project_id(), "");

        t.project_id = Some("CLOUD-CODE-99".to_string());
        assert_eq!(t.sanitized_project_id(), "");
    }

    #[test]
    fn real_project_id_survives() {
        let mut t = token();
        t.project_id = Some("my-real-project".to_string());
        assert_eq!(t.sanitized_project_id(), "my-real-project");
    }
}
