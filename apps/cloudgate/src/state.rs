use std::sync::Arc;

use cloudgate_core::{AuthGuard, ProxyOrchestrator};

/// Shared state handed to every axum handler: the orchestrator that owns the
/// `TokenPool`/`UpstreamClient` retry core, and the bearer-key guard checked
/// by the `require_auth` middleware.
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<ProxyOrchestrator>,
    pub auth: Arc<AuthGuard>,
}
