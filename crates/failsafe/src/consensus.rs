//! Multi-upstream consensus.
//!
//! Fans a request out to the best N candidates concurrently and compares
//! canonical response hashes. Agreement of T identical responses wins early;
//! otherwise the configured dispute behavior decides what, if anything, is
//! returned. Upstreams that disagree with a winning group accrue disputes
//! and may be cordoned.

use crate::{executor::Served, punish::MisbehaviorTracker};
use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use manifold_config::{ConsensusConfig, DisputeBehavior};
use manifold_metrics::{MetricsTracker, TrackerKey};
use manifold_primitives::{
    canonical_result_hash, Attempt, ErrorKind, GatewayError, JsonRpcRequest, JsonRpcResponse,
    NetworkId, UpstreamId,
};
use manifold_upstream::Upstream;
use serde_json::json;
use std::{collections::HashMap, sync::Arc, time::Instant};
use tracing::{debug, trace};

/// One comparable response gathered during a round.
#[derive(Debug, Clone)]
struct Collected {
    upstream: Arc<Upstream>,
    response: JsonRpcResponse,
    hash: [u8; 32],
}

/// The consensus engine for one network.
#[derive(Debug)]
pub struct ConsensusEngine {
    network: NetworkId,
    config: ConsensusConfig,
    punisher: Arc<MisbehaviorTracker>,
    tracker: Arc<MetricsTracker>,
}

impl ConsensusEngine {
    /// Creates the engine.
    pub fn new(
        network: NetworkId,
        config: ConsensusConfig,
        punisher: Arc<MisbehaviorTracker>,
        tracker: Arc<MetricsTracker>,
    ) -> Self {
        Self { network, config, punisher, tracker }
    }

    /// The shared misbehavior tracker, consulted by selectors.
    pub fn punisher(&self) -> &Arc<MisbehaviorTracker> {
        &self.punisher
    }

    /// Returns `true` if the method participates in consensus.
    pub fn applies_to(&self, method: &str) -> bool {
        self.config.match_method.as_ref().map_or(true, |pattern| pattern.matches(method))
    }

    /// Runs one consensus round over the best candidates.
    pub async fn execute(
        &self,
        request: &JsonRpcRequest,
        candidates: Vec<Arc<Upstream>>,
    ) -> Result<Served, GatewayError> {
        let participants: Vec<Arc<Upstream>> =
            candidates.into_iter().take(self.config.required_participants).collect();
        let low_participants = participants.len() < self.config.required_participants;
        let behavior = if low_participants {
            self.config.low_participants_behavior
        } else {
            self.config.dispute_behavior
        };

        if participants.is_empty() ||
            (low_participants && behavior == DisputeBehavior::ReturnError)
        {
            return Err(GatewayError::new(
                ErrorKind::ConsensusLowParticipants,
                format!(
                    "{} of {} required upstreams available",
                    participants.len(),
                    self.config.required_participants
                ),
            ))
        }

        debug!(
            target: "failsafe::consensus",
            network = %self.network,
            method = %request.method,
            participants = participants.len(),
            threshold = self.config.agreement_threshold,
            low_participants,
            "starting consensus round"
        );

        let mut inflight: FuturesUnordered<BoxFuture<'_, (Arc<Upstream>, Result<JsonRpcResponse, GatewayError>)>> =
            participants
                .iter()
                .map(|upstream| self.dispatch(Arc::clone(upstream), request).boxed())
                .collect();

        let mut collected: Vec<Collected> = Vec::new();
        let mut groups: HashMap<[u8; 32], usize> = HashMap::new();
        let mut failures: Vec<Attempt> = Vec::new();

        while let Some((upstream, result)) = inflight.next().await {
            match result {
                Ok(response) => {
                    let hash = response_hash(&response);
                    collected.push(Collected { upstream, response, hash });
                    let agreeing = groups.entry(hash).or_insert(0);
                    *agreeing += 1;
                    if *agreeing >= self.config.agreement_threshold {
                        // losers still in flight are cancelled by the drop
                        drop(inflight);
                        return Ok(self.finish_agreement(request, hash, collected))
                    }
                }
                Err(err) => {
                    trace!(
                        target: "failsafe::consensus",
                        network = %self.network,
                        upstream = %upstream.id(),
                        error = %err,
                        "participant failed"
                    );
                    failures.push(Attempt {
                        upstream: upstream.id().clone(),
                        kind: err.kind,
                        message: err.message,
                    });
                }
            }
        }

        self.resolve_dispute(request, behavior, low_participants, collected, failures)
    }

    /// Dispatches to one participant, recording metrics on completion.
    async fn dispatch(
        &self,
        upstream: Arc<Upstream>,
        request: &JsonRpcRequest,
    ) -> (Arc<Upstream>, Result<JsonRpcResponse, GatewayError>) {
        let key = TrackerKey {
            upstream: upstream.id().clone(),
            network: self.network.clone(),
            method: request.method.clone(),
        };
        let started = Instant::now();
        let result = upstream.forward(request).await;
        match &result {
            Ok(_) => self.tracker.record_success(&key, started.elapsed()),
            Err(err) => self.tracker.record_error(&key, err.kind),
        }
        (upstream, result)
    }

    fn finish_agreement(
        &self,
        request: &JsonRpcRequest,
        winning_hash: [u8; 32],
        collected: Vec<Collected>,
    ) -> Served {
        for dissent in collected.iter().filter(|c| c.hash != winning_hash) {
            debug!(
                target: "failsafe::consensus",
                network = %self.network,
                upstream = %dissent.upstream.id(),
                method = %request.method,
                "response disagreed with winning group"
            );
            self.punisher.record_dispute(dissent.upstream.id(), &request.method);
        }
        let winner = collected
            .into_iter()
            .find(|c| c.hash == winning_hash)
            .expect("threshold was reached by this hash");
        Served { response: winner.response, upstream: winner.upstream }
    }

    fn resolve_dispute(
        &self,
        request: &JsonRpcRequest,
        behavior: DisputeBehavior,
        low_participants: bool,
        collected: Vec<Collected>,
        failures: Vec<Attempt>,
    ) -> Result<Served, GatewayError> {
        let dispute_error = |message: String| {
            let kind = if low_participants {
                ErrorKind::ConsensusLowParticipants
            } else {
                ErrorKind::ConsensusDispute
            };
            Err(GatewayError::new(kind, message).with_attempts(failures.clone()))
        };

        if collected.is_empty() {
            return dispute_error(format!(
                "no comparable response from any of the {} participants",
                failures.len()
            ))
        }

        match behavior {
            DisputeBehavior::ReturnError => dispute_error(format!(
                "no agreement of {} among {} responses",
                self.config.agreement_threshold,
                collected.len()
            )),
            DisputeBehavior::AcceptMostCommonValidResult => {
                Ok(most_common(&collected).expect("collected is non-empty"))
            }
            DisputeBehavior::PreferBlockHeadLeader => match block_head_leader(&collected) {
                Some(leader) => Ok(leader),
                None => Ok(most_common(&collected).expect("collected is non-empty")),
            },
            DisputeBehavior::OnlyBlockHeadLeader => match block_head_leader(&collected) {
                Some(leader) => Ok(leader),
                None => dispute_error("no unambiguous block-head leader".to_owned()),
            },
        }
    }
}

/// Canonical hash over the comparable part of a response: the result value,
/// or the revert signature for execution reverts.
fn response_hash(response: &JsonRpcResponse) -> [u8; 32] {
    match (&response.result, &response.error) {
        (Some(result), _) => canonical_result_hash(result),
        (None, Some(error)) => canonical_result_hash(&json!([error.code, error.message])),
        (None, None) => canonical_result_hash(&serde_json::Value::Null),
    }
}

/// The largest group's representative. Ties break toward the group holding
/// the smallest upstream id so the choice is deterministic.
fn most_common(collected: &[Collected]) -> Option<Served> {
    let mut counts: HashMap<[u8; 32], (usize, &UpstreamId)> = HashMap::new();
    for c in collected {
        let entry = counts.entry(c.hash).or_insert((0, c.upstream.id()));
        entry.0 += 1;
        if c.upstream.id() < entry.1 {
            entry.1 = c.upstream.id();
        }
    }
    let (winning_hash, _) = counts.into_iter().max_by(
        |(_, (count_a, id_a)), (_, (count_b, id_b))| {
            count_a.cmp(count_b).then_with(|| id_b.cmp(id_a))
        },
    )?;
    collected
        .iter()
        .find(|c| c.hash == winning_hash)
        .map(|c| Served { response: c.response.clone(), upstream: Arc::clone(&c.upstream) })
}

/// The participant with the strictly highest observed head block.
fn block_head_leader(collected: &[Collected]) -> Option<Served> {
    let mut leader: Option<(&Collected, u64)> = None;
    let mut tied = false;
    for c in collected {
        let Some(head) = c.upstream.chain_state().latest_block else { continue };
        match &leader {
            Some((_, best)) if head == *best => tied = true,
            Some((_, best)) if head > *best => {
                leader = Some((c, head));
                tied = false;
            }
            None => leader = Some((c, head)),
            _ => {}
        }
    }
    match (leader, tied) {
        (Some((c, _)), false) => {
            Some(Served { response: c.response.clone(), upstream: Arc::clone(&c.upstream) })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::{scripted_upstream, scripted_upstream_at_head, Script};
    use serde_json::json;

    fn engine(config: ConsensusConfig) -> ConsensusEngine {
        let punisher = Arc::new(MisbehaviorTracker::new(
            config.punish_misbehavior.clone(),
        ));
        ConsensusEngine::new(
            NetworkId::new("evm:1"),
            config,
            punisher,
            Arc::new(MetricsTracker::new()),
        )
    }

    fn request() -> JsonRpcRequest {
        JsonRpcRequest::new(json!(1), "eth_call", json!([{"to": "0xabc"}, "latest"]))
    }

    #[tokio::test]
    async fn agreement_wins_and_disagreement_is_punished() {
        let engine = engine(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 2,
            punish_misbehavior: Some(Default::default()),
            ..Default::default()
        });
        let candidates = vec![
            scripted_upstream("u1", Script::success("0xabc")),
            scripted_upstream("u2", Script::success("0xabc")),
            scripted_upstream("u3", Script::success("0xdef")),
        ];

        let served = engine.execute(&request(), candidates).await.unwrap();
        assert_eq!(served.response.result, Some(json!("0xabc")));
        assert_eq!(
            engine.punisher().dispute_count(&UpstreamId::new("u3"), "eth_call"),
            1
        );
        assert_eq!(
            engine.punisher().dispute_count(&UpstreamId::new("u1"), "eth_call"),
            0
        );
    }

    #[tokio::test]
    async fn dispute_returns_error_by_default() {
        let engine = engine(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 3,
            ..Default::default()
        });
        let candidates = vec![
            scripted_upstream("u1", Script::success("0xaaa")),
            scripted_upstream("u2", Script::success("0xbbb")),
            scripted_upstream("u3", Script::success("0xccc")),
        ];

        let err = engine.execute(&request(), candidates).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConsensusDispute);
    }

    #[tokio::test]
    async fn dispute_prefers_block_head_leader() {
        let engine = engine(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 2,
            dispute_behavior: DisputeBehavior::PreferBlockHeadLeader,
            ..Default::default()
        });
        let candidates = vec![
            scripted_upstream_at_head("u1", Script::success("0xabc"), 100),
            scripted_upstream_at_head("u2", Script::success("0xdef"), 99),
            scripted_upstream_at_head("u3", Script::success("0xghi"), 99),
        ];

        let served = engine.execute(&request(), candidates).await.unwrap();
        assert_eq!(served.response.result, Some(json!("0xabc")));
        assert_eq!(served.upstream.id(), &UpstreamId::new("u1"));
    }

    #[tokio::test]
    async fn leader_tie_falls_back_to_most_common() {
        let engine = engine(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 3,
            dispute_behavior: DisputeBehavior::PreferBlockHeadLeader,
            ..Default::default()
        });
        let candidates = vec![
            scripted_upstream_at_head("u1", Script::success("0xaaa"), 100),
            scripted_upstream_at_head("u2", Script::success("0xbbb"), 100),
            scripted_upstream_at_head("u3", Script::success("0xbbb"), 99),
        ];

        let served = engine.execute(&request(), candidates).await.unwrap();
        assert_eq!(served.response.result, Some(json!("0xbbb")));
    }

    #[tokio::test]
    async fn low_participants_error_behavior() {
        let engine = engine(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 2,
            low_participants_behavior: DisputeBehavior::ReturnError,
            ..Default::default()
        });
        let candidates = vec![scripted_upstream("u1", Script::success("0xabc"))];

        let err = engine.execute(&request(), candidates).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ConsensusLowParticipants);
    }

    #[tokio::test]
    async fn low_participants_can_accept_most_common() {
        let engine = engine(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 3,
            low_participants_behavior: DisputeBehavior::AcceptMostCommonValidResult,
            ..Default::default()
        });
        let candidates = vec![
            scripted_upstream("u1", Script::success("0xaaa")),
            scripted_upstream("u2", Script::success("0xaaa")),
        ];

        let served = engine.execute(&request(), candidates).await.unwrap();
        assert_eq!(served.response.result, Some(json!("0xaaa")));
    }

    #[tokio::test]
    async fn reverts_participate_in_agreement() {
        let revert = Script::error_body(3, "execution reverted: denied");
        let engine = engine(ConsensusConfig {
            required_participants: 2,
            agreement_threshold: 2,
            ..Default::default()
        });
        let candidates = vec![
            scripted_upstream("u1", revert.clone()),
            scripted_upstream("u2", revert),
        ];

        let served = engine.execute(&request(), candidates).await.unwrap();
        assert!(served.response.is_execution_reverted());
    }

    #[tokio::test]
    async fn failed_participants_do_not_block_agreement() {
        let engine = engine(ConsensusConfig {
            required_participants: 3,
            agreement_threshold: 2,
            ..Default::default()
        });
        let candidates = vec![
            scripted_upstream("u1", Script::success("0xabc")),
            scripted_upstream("u2", Script::server_error()),
            scripted_upstream("u3", Script::success("0xabc")),
        ];

        let served = engine.execute(&request(), candidates).await.unwrap();
        assert_eq!(served.response.result, Some(json!("0xabc")));
    }
}
