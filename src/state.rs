use crate::cache::Cache;
use crate::config::Config;
use crate::engine::MediaEngine;
use crate::loader::HttpLoader;
use crate::metrics::Metrics;
use crate::signature::SignatureVerifier;
use crate::throttle::Throttle;
use std::sync::Arc;

/// Everything a request handler needs, assembled once at startup.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub engine: Arc<MediaEngine>,
    pub loader: Arc<HttpLoader>,
    pub loader_cache: Arc<dyn Cache>,
    pub metadata_cache: Arc<dyn Cache>,
    pub result_cache: Arc<dyn Cache>,
    pub verifier: SignatureVerifier,
    pub throttle: Throttle,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Config,
        engine: MediaEngine,
        loader: HttpLoader,
        loader_cache: Arc<dyn Cache>,
        metadata_cache: Arc<dyn Cache>,
        result_cache: Arc<dyn Cache>,
        throttle: Throttle,
        metrics: Arc<Metrics>,
    ) -> Self {
        let verifier = SignatureVerifier::new(config.secret.clone());
        Self {
            config: Arc::new(config),
            engine: Arc::new(engine),
            loader: Arc::new(loader),
            loader_cache,
            metadata_cache,
            result_cache,
            verifier,
            throttle,
            metrics,
        }
    }
}
