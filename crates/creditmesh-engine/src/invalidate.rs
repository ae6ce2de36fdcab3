use std::sync::Arc;

use tracing::debug;

use creditmesh_events::PatchBuilder;
use creditmesh_router::Router;

/// The single choke point for cache eviction. Inject, clearing, and drift
/// declare the equivalents they touched; this bumps the Router snapshot
/// generation and drops the viz quantiles for each. No other component may
/// reach into Router or PatchBuilder cache internals.
pub struct CacheInvalidator {
    router: Arc<Router>,
    patches: Arc<PatchBuilder>,
}

impl CacheInvalidator {
    pub fn new(router: Arc<Router>, patches: Arc<PatchBuilder>) -> Self {
        Self { router, patches }
    }

    pub fn invalidate<I, S>(&self, affected_equivalents: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for equivalent in affected_equivalents {
            let code = equivalent.as_ref();
            self.router.bump_generation(code);
            self.patches.drop_quantiles(code);
            debug!(equivalent = code, "invalidated caches");
        }
    }
}
