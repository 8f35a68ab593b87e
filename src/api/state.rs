//! Shared application state handed to every handler via `State<AppState>`,
//! cloned once per request off the `Router`'s single instance.

use crate::auth::AuthStore;
use crate::cache_store::CompareCacheStore;
use crate::config::Config;
use crate::ledger::CreditLedger;
use crate::orchestrator::CompareOrchestrator;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub auth: Arc<AuthStore>,
    pub orchestrator: Arc<CompareOrchestrator>,
    pub cache: Arc<CompareCacheStore>,
    pub ledger: Arc<CreditLedger>,
    pub http_client: reqwest::Client,
}
