pub mod account;
pub mod auth_guard;
pub mod classify;
pub mod error;
pub mod orchestrator;
pub mod token_pool;
pub mod upstream_client;

pub use account::{
    Account, AccountStatus, AuthTokenRefresher, CloudAccountStore, InMemoryAccountStore, Provider,
    RefreshedToken, Token,
};
pub use auth_guard::{AuthGuard, ClientProtocol};
pub use classify::{classify_upstream_error, error_to_http_status, is_quota_exhausted_message};
pub use error::{GatewayError, ProxyError};
pub use orchestrator::{AnthropicOutcome, ChatOutcome, GeminiOutcome, ProxyOrchestrator};
pub use token_pool::{SelectOptions, TokenPool};
pub use upstream_client::UpstreamClient;
