use crate::{rate_limit::RateLimiterRegistry, upstream::Upstream};
use manifold_config::UpstreamConfig;
use manifold_primitives::{GatewayError, UpstreamId};
use std::{collections::HashMap, sync::Arc};

/// Flat registry of upstreams keyed by id.
///
/// Networks reference upstreams by id; the registry is the single owner, so
/// an upstream can serve many networks without ownership cycles.
#[derive(Debug, Default)]
pub struct UpstreamRegistry {
    upstreams: HashMap<UpstreamId, Arc<Upstream>>,
}

impl UpstreamRegistry {
    /// Builds every configured upstream, wiring shared budgets by name.
    pub fn new(
        configs: &[UpstreamConfig],
        budgets: &RateLimiterRegistry,
    ) -> Result<Self, GatewayError> {
        let mut upstreams = HashMap::with_capacity(configs.len());
        for config in configs {
            let budget = config.rate_limit_budget.as_deref().and_then(|name| budgets.get(name));
            let upstream = Upstream::new(config.clone(), budget)?;
            upstreams.insert(config.id.clone(), Arc::new(upstream));
        }
        Ok(Self { upstreams })
    }

    /// Registry over pre-built upstreams; used by tests with scripted
    /// transports.
    pub fn from_upstreams(upstreams: impl IntoIterator<Item = Arc<Upstream>>) -> Self {
        Self {
            upstreams: upstreams
                .into_iter()
                .map(|upstream| (upstream.id().clone(), upstream))
                .collect(),
        }
    }

    /// Looks up an upstream by id.
    pub fn get(&self, id: &UpstreamId) -> Option<Arc<Upstream>> {
        self.upstreams.get(id).cloned()
    }

    /// All registered upstreams.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Upstream>> {
        self.upstreams.values()
    }

    /// Number of registered upstreams.
    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    /// Returns `true` if no upstreams are registered.
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }
}
