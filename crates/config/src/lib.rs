//! Normalized configuration model.
//!
//! The gateway core consumes a fully-normalized, immutable configuration
//! value. File parsing lives in the binary; this crate owns the types, the
//! defaulting rules and the [`GatewayConfig::normalize`] pass that applies
//! them. After normalization nothing mutates configuration except the
//! auto-tuned rate budgets, which tag their adjustments atomically elsewhere.

mod cache;
mod network;
mod rate_limit;
mod score;
mod server;
mod upstream;

pub use cache::{CacheConfig, CachePolicyConfig, ConnectorConfig, ConnectorDriver};
pub use network::{
    ConsensusConfig, DisputeBehavior, FailsafeRuleConfig, HedgeConfig, NetworkConfig,
    PunishMisbehaviorConfig, RetryConfig, SelectionPolicyConfig, TimeoutConfig,
};
pub use rate_limit::{AutoTuneConfig, BudgetRuleConfig, RateLimitBudgetConfig};
pub use score::ScoreMultiplierConfig;
pub use server::{CorsConfig, HealthCheckConfig, MetricsConfig, ServerConfig};
pub use upstream::{
    CircuitBreakerConfig, JsonRpcOptions, NodeType, PollerConfig, UpstreamConfig, UpstreamGroup,
    VendorConfig,
};

use manifold_primitives::{NetworkId, UpstreamId};
use serde::{Deserialize, Serialize};

/// Errors produced while normalizing or validating configuration.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A project declared no networks.
    #[error("project {0} declares no networks")]
    NoNetworks(String),
    /// A network references an upstream id that does not exist.
    #[error("network {network} references unknown upstream {upstream}")]
    UnknownUpstream {
        /// The referencing network.
        network: NetworkId,
        /// The missing upstream id.
        upstream: UpstreamId,
    },
    /// An upstream references a rate limit budget that does not exist.
    #[error("upstream {upstream} references unknown rate limit budget {budget}")]
    UnknownBudget {
        /// The referencing upstream.
        upstream: UpstreamId,
        /// The missing budget name.
        budget: String,
    },
    /// A cache policy references a connector that does not exist.
    #[error("cache policy references unknown connector {0}")]
    UnknownConnector(String),
    /// A consensus section is inconsistent.
    #[error("network {network}: {message}")]
    InvalidConsensus {
        /// The offending network.
        network: NetworkId,
        /// What is inconsistent.
        message: String,
    },
}

/// Top level gateway configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct GatewayConfig {
    /// HTTP server surface.
    pub server: ServerConfig,
    /// Metrics exporter surface.
    pub metrics: MetricsConfig,
    /// Projects, each bundling networks, upstreams and shared registries.
    pub projects: Vec<ProjectConfig>,
}

/// One project: a set of networks served by a set of upstreams.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Project identifier.
    pub id: String,
    /// Networks served by this project.
    pub networks: Vec<NetworkConfig>,
    /// Upstream endpoints. Shared across the project's networks by id.
    pub upstreams: Vec<UpstreamConfig>,
    /// Named rate limit budgets.
    pub rate_limiters: Vec<RateLimitBudgetConfig>,
    /// Cache policies and connectors.
    pub cache: CacheConfig,
    /// CORS settings for the HTTP surface.
    pub cors: CorsConfig,
    /// Health check surface.
    pub health_check: HealthCheckConfig,
}

impl GatewayConfig {
    /// Applies all defaulting rules and validates cross-references.
    ///
    /// This is the single normalization pass; the returned value is treated
    /// as immutable for the lifetime of the process.
    pub fn normalize(mut self) -> Result<Self, ConfigError> {
        for project in &mut self.projects {
            if project.networks.is_empty() {
                return Err(ConfigError::NoNetworks(project.id.clone()))
            }

            for upstream in &mut project.upstreams {
                upstream.apply_defaults();

                if let Some(budget) = &upstream.rate_limit_budget {
                    if !project.rate_limiters.iter().any(|b| &b.name == budget) {
                        return Err(ConfigError::UnknownBudget {
                            upstream: upstream.id.clone(),
                            budget: budget.clone(),
                        })
                    }
                }
            }

            for policy in &project.cache.policies {
                if !project.cache.connectors.iter().any(|c| c.id == policy.connector) {
                    return Err(ConfigError::UnknownConnector(policy.connector.clone()))
                }
            }

            for network in &mut project.networks {
                for id in &network.upstreams {
                    if !project.upstreams.iter().any(|u| &u.id == id) {
                        return Err(ConfigError::UnknownUpstream {
                            network: network.id.clone(),
                            upstream: id.clone(),
                        })
                    }
                }

                // any fallback-group upstream activates the default selection
                // policy for its network
                let has_fallback = project
                    .upstreams
                    .iter()
                    .any(|u| network.upstreams.contains(&u.id) && u.group == UpstreamGroup::Fallback);
                if has_fallback && network.selection_policy.is_none() {
                    network.selection_policy = Some(SelectionPolicyConfig::default());
                }

                if let Some(consensus) = &network.consensus {
                    if consensus.agreement_threshold > consensus.required_participants {
                        return Err(ConfigError::InvalidConsensus {
                            network: network.id.clone(),
                            message: format!(
                                "agreement threshold {} exceeds required participants {}",
                                consensus.agreement_threshold, consensus.required_participants
                            ),
                        })
                    }
                    if network.upstreams.len() < 2 {
                        return Err(ConfigError::InvalidConsensus {
                            network: network.id.clone(),
                            message: "consensus requires at least two upstreams".to_owned(),
                        })
                    }
                }
            }
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use manifold_primitives::PatternSet;

    fn minimal_project() -> ProjectConfig {
        ProjectConfig {
            id: "main".to_owned(),
            networks: vec![NetworkConfig {
                id: NetworkId::new("evm:1"),
                upstreams: vec![UpstreamId::new("a"), UpstreamId::new("b")],
                ..Default::default()
            }],
            upstreams: vec![
                UpstreamConfig::new("a", "http://a.example/rpc"),
                UpstreamConfig::new("b", "http://b.example/rpc"),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn defaults_ports() {
        let config = GatewayConfig::default();
        assert_eq!(config.server.http_port, 4000);
        assert_eq!(config.metrics.port, 4001);
    }

    #[test]
    fn allow_methods_implies_ignore_all() {
        let mut project = minimal_project();
        project.upstreams[0].allow_methods = PatternSet::new(["eth_*"]);
        let config = GatewayConfig { projects: vec![project], ..Default::default() }
            .normalize()
            .unwrap();
        let upstream = &config.projects[0].upstreams[0];
        assert!(upstream.ignore_methods.matches("net_version"));
        // the untouched upstream ignores nothing
        assert!(config.projects[0].upstreams[1].ignore_methods.is_empty());
    }

    #[test]
    fn fallback_group_activates_selection_policy() {
        let mut project = minimal_project();
        project.upstreams[1].group = UpstreamGroup::Fallback;
        let config = GatewayConfig { projects: vec![project], ..Default::default() }
            .normalize()
            .unwrap();
        assert!(config.projects[0].networks[0].selection_policy.is_some());
    }

    #[test]
    fn unknown_upstream_is_rejected() {
        let mut project = minimal_project();
        project.networks[0].upstreams.push(UpstreamId::new("ghost"));
        let err = GatewayConfig { projects: vec![project], ..Default::default() }
            .normalize()
            .unwrap_err();
        assert!(matches!(err, ConfigError::UnknownUpstream { .. }));
    }

    #[test]
    fn deserializes_from_toml() {
        let raw = r#"
            [server]
            httpPort = 8545

            [[projects]]
            id = "main"

            [[projects.networks]]
            id = "evm:1"
            upstreams = ["alchemy"]

            [[projects.networks.failsafe]]
            matchMethod = "eth_*"

            [projects.networks.failsafe.retry]
            maxAttempts = 5
            delay = "250ms"

            [[projects.upstreams]]
            id = "alchemy"
            endpoint = "https://eth.example/rpc"
            group = "fallback"

            [[projects.rateLimiters]]
            name = "global"

            [[projects.rateLimiters.rules]]
            method = "*"
            maxCount = 50
            period = "1s"
            waitTime = "500ms"
        "#;
        let config: GatewayConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.server.http_port, 8545);
        let project = &config.projects[0];
        let retry = project.networks[0].failsafe[0].retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.delay, std::time::Duration::from_millis(250));
        assert_eq!(project.upstreams[0].group, UpstreamGroup::Fallback);
        assert_eq!(
            project.rate_limiters[0].rules[0].wait_time,
            std::time::Duration::from_millis(500)
        );
    }

    #[test]
    fn consensus_threshold_validated() {
        let mut project = minimal_project();
        project.networks[0].consensus = Some(ConsensusConfig {
            required_participants: 2,
            agreement_threshold: 3,
            ..Default::default()
        });
        let err = GatewayConfig { projects: vec![project], ..Default::default() }
            .normalize()
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidConsensus { .. }));
    }
}
