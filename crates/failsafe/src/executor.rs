use futures::{future::BoxFuture, stream::FuturesUnordered, FutureExt, StreamExt};
use manifold_config::{FailsafeRuleConfig, HedgeConfig, RetryConfig};
use manifold_metrics::{MetricsTracker, TrackerKey, DEFAULT_LATENCY_QUANTILE};
use manifold_primitives::{
    Attempt, ErrorKind, Finality, GatewayError, JsonRpcRequest, JsonRpcResponse, NetworkId,
    RequestDirectives, UpstreamId,
};
use manifold_upstream::Upstream;
use rand::Rng;
use std::{
    collections::HashSet,
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{debug, trace};

/// A successful execution: the response plus the upstream that produced it,
/// so the caller can consult its chain state for cache finality.
#[derive(Debug, Clone)]
pub struct Served {
    /// The winning response.
    pub response: JsonRpcResponse,
    /// The upstream that served it.
    pub upstream: Arc<Upstream>,
}

/// Composes the failsafe stages for each request.
///
/// The first rule whose method glob and finality set match the request
/// provides the plan; stage order is fixed: timeout wraps retry, retry wraps
/// hedged attempts, and each attempt runs under the target upstream's own
/// rate limiter and circuit breaker.
#[derive(Debug)]
pub struct FailsafeExecutor {
    network: NetworkId,
    rules: Vec<FailsafeRuleConfig>,
    tracker: Arc<MetricsTracker>,
}

struct Plan<'a> {
    timeout: Option<Duration>,
    retry: Option<&'a RetryConfig>,
    hedge: Option<&'a HedgeConfig>,
}

type AttemptOutcome = (Arc<Upstream>, Result<JsonRpcResponse, GatewayError>);

impl FailsafeExecutor {
    /// Creates the executor for one network.
    pub fn new(
        network: NetworkId,
        rules: Vec<FailsafeRuleConfig>,
        tracker: Arc<MetricsTracker>,
    ) -> Self {
        Self { network, rules, tracker }
    }

    fn plan(&self, method: &str, finality: Finality) -> Plan<'_> {
        match self.rules.iter().find(|rule| rule.matches(method, finality)) {
            Some(rule) => Plan {
                timeout: rule.timeout.as_ref().map(|t| t.duration),
                retry: rule.retry.as_ref(),
                hedge: rule.hedge.as_ref(),
            },
            None => Plan { timeout: None, retry: None, hedge: None },
        }
    }

    /// Runs the request against the ordered candidate list.
    ///
    /// Candidates arrive best-first from the selector; retries walk down the
    /// list, never revisiting an upstream within one request.
    pub async fn execute(
        &self,
        request: &JsonRpcRequest,
        finality: Finality,
        directives: &RequestDirectives,
        candidates: Vec<Arc<Upstream>>,
    ) -> Result<Served, GatewayError> {
        let plan = self.plan(&request.method, finality);
        let started = Instant::now();

        match plan.timeout {
            Some(deadline) => {
                match tokio::time::timeout(
                    deadline,
                    self.run_attempts(&plan, request, directives, candidates),
                )
                .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        debug!(
                            target: "failsafe",
                            network = %self.network,
                            method = %request.method,
                            ?deadline,
                            "request deadline expired, cancelling in-flight attempts"
                        );
                        Err(GatewayError::timeout(started.elapsed()))
                    }
                }
            }
            None => self.run_attempts(&plan, request, directives, candidates).await,
        }
    }

    /// Runs a consensus round under the matching rule's deadline. Retry and
    /// hedge stages do not apply: the round owns its own fan-out, and
    /// consensus outcomes only surface after the full round completes.
    pub async fn execute_consensus(
        &self,
        request: &JsonRpcRequest,
        finality: Finality,
        consensus: &crate::ConsensusEngine,
        candidates: Vec<Arc<Upstream>>,
    ) -> Result<Served, GatewayError> {
        let plan = self.plan(&request.method, finality);
        let started = Instant::now();
        match plan.timeout {
            Some(deadline) => {
                match tokio::time::timeout(deadline, consensus.execute(request, candidates)).await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(GatewayError::timeout(started.elapsed())),
                }
            }
            None => consensus.execute(request, candidates).await,
        }
    }

    async fn run_attempts(
        &self,
        plan: &Plan<'_>,
        request: &JsonRpcRequest,
        directives: &RequestDirectives,
        candidates: Vec<Arc<Upstream>>,
    ) -> Result<Served, GatewayError> {
        let max_attempts = plan.retry.map_or(1, |retry| retry.max_attempts.max(1));
        let mut tried: HashSet<UpstreamId> = HashSet::new();
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut last_error: Option<GatewayError> = None;

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let retry = plan.retry.expect("attempt > 0 implies a retry stage");
                tokio::time::sleep(backoff_delay(retry, attempt)).await;
            }

            if next_candidate(&candidates, &tried).is_none() {
                break
            }

            match self.hedged_attempt(plan, request, &candidates, &mut tried, &mut attempts).await
            {
                Ok(served) => {
                    if directives.retry_empty &&
                        served.response.is_empty_result() &&
                        attempt + 1 < max_attempts
                    {
                        trace!(
                            target: "failsafe",
                            network = %self.network,
                            method = %request.method,
                            upstream = %served.upstream.id(),
                            "empty result, retrying per directive"
                        );
                        attempts.push(Attempt {
                            upstream: served.upstream.id().clone(),
                            kind: ErrorKind::CacheMiss,
                            message: "empty result".to_owned(),
                        });
                        continue
                    }
                    return Ok(served)
                }
                Err(err) => {
                    if !err.is_retryable() {
                        return Err(err.with_attempts(attempts))
                    }
                    last_error = Some(err);
                }
            }
        }

        let err = last_error.unwrap_or_else(|| {
            GatewayError::new(
                ErrorKind::PolicyExcluded,
                "no eligible upstream for this request",
            )
        });
        Err(err.with_attempts(attempts))
    }

    /// One retry attempt: a primary dispatch, optionally joined by hedges
    /// when the primary is slow. First success wins and the losers are
    /// cancelled by dropping their futures.
    async fn hedged_attempt(
        &self,
        plan: &Plan<'_>,
        request: &JsonRpcRequest,
        candidates: &[Arc<Upstream>],
        tried: &mut HashSet<UpstreamId>,
        attempts: &mut Vec<Attempt>,
    ) -> Result<Served, GatewayError> {
        let primary = next_candidate(candidates, tried)
            .expect("caller checked a candidate remains");
        tried.insert(primary.id().clone());

        let mut inflight: FuturesUnordered<BoxFuture<'_, AttemptOutcome>> =
            FuturesUnordered::new();
        inflight.push(self.dispatch(Arc::clone(&primary), request).boxed());

        let Some(hedge) = plan.hedge else {
            let (upstream, result) = inflight.next().await.expect("primary is in flight");
            return match result {
                Ok(response) => Ok(Served { response, upstream }),
                Err(err) => {
                    attempts.push(attempt_record(&upstream, &err));
                    Err(err)
                }
            }
        };

        let delay = self.hedge_delay(hedge, primary.id(), &request.method);
        let mut hedges_left = hedge.max_count;
        let mut last_error: Option<GatewayError> = None;

        loop {
            if inflight.is_empty() &&
                (hedges_left == 0 || next_candidate(candidates, tried).is_none())
            {
                return Err(last_error.unwrap_or_else(|| {
                    GatewayError::new(ErrorKind::PolicyExcluded, "no hedge candidate available")
                }))
            }

            tokio::select! {
                outcome = inflight.next(), if !inflight.is_empty() => {
                    let (upstream, result) = outcome.expect("guarded by is_empty");
                    match result {
                        Ok(response) => return Ok(Served { response, upstream }),
                        Err(err) => {
                            attempts.push(attempt_record(&upstream, &err));
                            last_error = Some(err);
                        }
                    }
                }
                _ = tokio::time::sleep(delay), if hedges_left > 0 => {
                    if let Some(next) = next_candidate(candidates, tried) {
                        trace!(
                            target: "failsafe",
                            network = %self.network,
                            method = %request.method,
                            primary = %primary.id(),
                            hedge = %next.id(),
                            ?delay,
                            "hedging slow attempt"
                        );
                        tried.insert(next.id().clone());
                        inflight.push(self.dispatch(Arc::clone(&next), request).boxed());
                    }
                    hedges_left -= 1;
                }
            }
        }
    }

    /// Dispatches to one upstream, recording the outcome in the tracker.
    /// Cancelled dispatches record nothing.
    async fn dispatch(&self, upstream: Arc<Upstream>, request: &JsonRpcRequest) -> AttemptOutcome {
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

    fn hedge_delay(&self, hedge: &HedgeConfig, upstream: &UpstreamId, method: &str) -> Duration {
        let base = match hedge.delay {
            Some(delay) => delay,
            None => {
                let key = TrackerKey {
                    upstream: upstream.clone(),
                    network: self.network.clone(),
                    method: method.to_owned(),
                };
                let quantile = hedge.quantile.unwrap_or(DEFAULT_LATENCY_QUANTILE);
                let observed = self.tracker.snapshot_at_quantile(&key, quantile).latency;
                Duration::from_secs_f64(observed)
            }
        };
        base.clamp(hedge.min_delay, hedge.max_delay)
    }
}

fn next_candidate(
    candidates: &[Arc<Upstream>],
    tried: &HashSet<UpstreamId>,
) -> Option<Arc<Upstream>> {
    candidates.iter().find(|upstream| !tried.contains(upstream.id())).cloned()
}

fn attempt_record(upstream: &Upstream, err: &GatewayError) -> Attempt {
    Attempt {
        upstream: upstream.id().clone(),
        kind: err.kind,
        message: err.message.clone(),
    }
}

fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let factor = retry.backoff_factor.max(1.0).powi(attempt.saturating_sub(1) as i32);
    let backoff = retry.delay.mul_f64(factor).min(retry.backoff_max_delay);
    let jitter = if retry.jitter.is_zero() {
        Duration::ZERO
    } else {
        rand::thread_rng().gen_range(Duration::ZERO..retry.jitter)
    };
    backoff + jitter
}
