use crate::{
    network::Network,
    selector::{DefaultPolicy, SelectionPolicy, Selector},
};
use manifold_cache::CacheLayer;
use manifold_config::{CorsConfig, GatewayConfig, NetworkConfig, ProjectConfig};
use manifold_failsafe::{ConsensusEngine, FailsafeExecutor, MisbehaviorTracker};
use manifold_metrics::MetricsTracker;
use manifold_primitives::{
    ErrorKind, GatewayError, JsonRpcRequest, JsonRpcResponse, MethodCatalog, NetworkId,
    RequestDirectives,
};
use manifold_upstream::{spawn_poller, AutoTuner, RateLimiterRegistry, Upstream, UpstreamRegistry};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// How often per-network lag gauges are refreshed from poller state.
const LAG_REFRESH_INTERVAL: Duration = Duration::from_secs(10);

/// The top-level gateway value.
///
/// Owns every process-wide registry (upstreams, budgets, the metrics
/// tracker, the method catalog) and the background tasks keeping them
/// current. Dependency-injected throughout; nothing lives in file-scope
/// globals.
#[derive(Debug)]
pub struct App {
    networks: HashMap<NetworkId, Network>,
    /// CORS settings of the project owning each network. Projects scope
    /// their own CORS, so the HTTP surface must resolve it per request.
    cors: HashMap<NetworkId, CorsConfig>,
    upstreams: UpstreamRegistry,
    budgets: RateLimiterRegistry,
    tracker: Arc<MetricsTracker>,
    catalog: Arc<MethodCatalog>,
    tasks: Vec<JoinHandle<()>>,
}

impl App {
    /// Normalizes the configuration and assembles the gateway.
    ///
    /// Must run inside a tokio runtime: pollers, the budget auto-tuner and
    /// the lag refresher are spawned here.
    pub fn from_config(config: GatewayConfig) -> Result<Self, GatewayError> {
        let config = config
            .normalize()
            .map_err(|err| GatewayError::new(ErrorKind::ConfigInvalid, err.to_string()))?;

        let catalog = Arc::new(MethodCatalog::default());
        let tracker = Arc::new(MetricsTracker::new());

        let budget_configs: Vec<_> =
            config.projects.iter().flat_map(|p| p.rate_limiters.iter().cloned()).collect();
        let budgets = RateLimiterRegistry::new(&budget_configs);

        let upstream_configs: Vec<_> =
            config.projects.iter().flat_map(|p| p.upstreams.iter().cloned()).collect();
        let upstreams = UpstreamRegistry::new(&upstream_configs, &budgets)?;

        let mut networks = HashMap::new();
        let mut cors = HashMap::new();
        for project in &config.projects {
            for network_config in &project.networks {
                let network =
                    build_network(project, network_config, &upstreams, &catalog, &tracker)?;
                networks.insert(network_config.id.clone(), network);
                cors.insert(network_config.id.clone(), project.cors.clone());
            }
        }

        let mut tasks = Vec::new();
        for upstream in upstreams.iter() {
            tasks.push(spawn_poller(Arc::clone(upstream)));
        }
        tasks.push(AutoTuner::new(&budgets).spawn());
        tasks.push(spawn_lag_refresher(networks.values().cloned().collect(), Arc::clone(&tracker)));

        info!(
            target: "app",
            networks = networks.len(),
            upstreams = upstreams.len(),
            "gateway assembled"
        );
        Ok(Self { networks, cors, upstreams, budgets, tracker, catalog, tasks })
    }

    /// The in-process entry point: forwards one envelope to a network.
    pub async fn forward(
        &self,
        network: &NetworkId,
        request: &JsonRpcRequest,
        directives: &RequestDirectives,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let Some(network) = self.networks.get(network) else {
            return Err(GatewayError::new(
                ErrorKind::UpstreamClientError,
                format!("unknown network {network}"),
            ))
        };
        network.forward(request, directives).await
    }

    /// Looks up a network.
    pub fn network(&self, id: &NetworkId) -> Option<&Network> {
        self.networks.get(id)
    }

    /// CORS settings of the project owning `network`.
    pub fn cors_for(&self, network: &NetworkId) -> Option<&CorsConfig> {
        self.cors.get(network)
    }

    /// The process-wide upstream registry.
    pub fn upstreams(&self) -> &UpstreamRegistry {
        &self.upstreams
    }

    /// The process-wide budget registry.
    pub fn budgets(&self) -> &RateLimiterRegistry {
        &self.budgets
    }

    /// The process-wide metrics tracker.
    pub fn tracker(&self) -> &Arc<MetricsTracker> {
        &self.tracker
    }

    /// The method catalog.
    pub fn catalog(&self) -> &Arc<MethodCatalog> {
        &self.catalog
    }

    /// Stops every background task.
    pub fn shutdown(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn build_network(
    project: &ProjectConfig,
    config: &NetworkConfig,
    registry: &UpstreamRegistry,
    catalog: &Arc<MethodCatalog>,
    tracker: &Arc<MetricsTracker>,
) -> Result<Network, GatewayError> {
    let upstreams: Vec<Arc<Upstream>> = config
        .upstreams
        .iter()
        .map(|id| {
            registry.get(id).ok_or_else(|| {
                GatewayError::new(
                    ErrorKind::ConfigInvalid,
                    format!("network {} references unknown upstream {id}", config.id),
                )
            })
        })
        .collect::<Result<_, _>>()?;

    let punisher = Arc::new(MisbehaviorTracker::new(
        config.consensus.as_ref().and_then(|c| c.punish_misbehavior.clone()),
    ));

    let selection = config.selection_policy.clone();
    let policy: Option<Arc<dyn SelectionPolicy>> = selection.as_ref().map(|selection| {
        Arc::new(DefaultPolicy { min_healthy_threshold: selection.min_healthy_threshold })
            as Arc<dyn SelectionPolicy>
    });

    let selector = Selector::new(
        config.id.clone(),
        upstreams.clone(),
        Arc::clone(tracker),
        Arc::clone(&punisher),
        policy,
        selection.unwrap_or_default(),
    );

    let executor =
        FailsafeExecutor::new(config.id.clone(), config.failsafe.clone(), Arc::clone(tracker));

    let consensus = config.consensus.as_ref().map(|consensus| {
        ConsensusEngine::new(
            config.id.clone(),
            consensus.clone(),
            Arc::clone(&punisher),
            Arc::clone(tracker),
        )
    });

    let cache = CacheLayer::new(&project.cache, Arc::clone(catalog));

    debug!(
        target: "app",
        network = %config.id,
        upstreams = upstreams.len(),
        consensus = consensus.is_some(),
        "network assembled"
    );
    Ok(Network::new(config.id.clone(), upstreams, cache, selector, executor, consensus))
}

/// Periodically converts poller snapshots into per-upstream lag gauges,
/// relative to the best head and finalized block seen on each network.
fn spawn_lag_refresher(networks: Vec<Network>, tracker: Arc<MetricsTracker>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(LAG_REFRESH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            for network in &networks {
                let states: Vec<_> = network
                    .upstreams()
                    .iter()
                    .map(|upstream| (upstream.id().clone(), upstream.chain_state()))
                    .collect();
                let best_head = states.iter().filter_map(|(_, s)| s.latest_block).max();
                let best_finalized = states.iter().filter_map(|(_, s)| s.finalized_block).max();
                let (Some(best_head), Some(best_finalized)) = (best_head, best_finalized) else {
                    continue
                };
                for (id, state) in states {
                    let head_lag =
                        state.latest_block.map_or(best_head, |head| best_head.saturating_sub(head));
                    let finalization_lag = state
                        .finalized_block
                        .map_or(best_finalized, |fin| best_finalized.saturating_sub(fin));
                    tracker.set_lag(&id, network.id(), head_lag, finalization_lag);
                }
            }
        }
    })
}
