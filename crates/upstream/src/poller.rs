//! Per-upstream chain state polling.
//!
//! A background task tracks the latest and finalized block numbers of the
//! chain behind an upstream. When the upstream cannot serve the `finalized`
//! tag, the finalized block is estimated as `latest - fallback depth`.
//! Snapshots are published atomically; poller failures degrade the
//! upstream's score but never fail requests.

use crate::upstream::Upstream;
use manifold_primitives::{BlockRef, ErrorKind, JsonRpcRequest};
use serde_json::json;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Snapshot of an upstream's view of its chain.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChainState {
    /// Latest block number the upstream reported.
    pub latest_block: Option<u64>,
    /// Finalized block number, observed or estimated.
    pub finalized_block: Option<u64>,
    /// Whether `finalized_block` came from the upstream rather than the
    /// fallback depth estimate.
    pub finality_observed: bool,
    /// Last poll error, if the most recent cycle failed.
    pub last_error: Option<String>,
    /// Number of successful poll cycles so far.
    pub poll_successes: u64,
}

/// Spawns the poll loop for one upstream.
pub fn spawn_poller(upstream: Arc<Upstream>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let config = upstream.config().poller.clone();
        let mut ticker = tokio::time::interval(config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // once an upstream says it cannot serve the finalized tag, stop asking
        let mut finalized_supported = true;

        loop {
            ticker.tick().await;
            let mut state = upstream.chain_state();

            match poll_latest(&upstream).await {
                Ok(latest) => {
                    trace!(target: "upstream::poller", upstream = %upstream.id(), latest, "polled head");
                    state.latest_block = Some(latest);
                    state.last_error = None;
                    state.poll_successes += 1;
                }
                Err(message) => {
                    warn!(target: "upstream::poller", upstream = %upstream.id(), %message, "head poll failed");
                    state.last_error = Some(message);
                    upstream.publish_chain_state(state);
                    continue
                }
            }

            if finalized_supported {
                match poll_finalized(&upstream).await {
                    Ok(finalized) => {
                        state.finalized_block = Some(finalized);
                        state.finality_observed = true;
                    }
                    Err(PollError::Unsupported) => {
                        debug!(
                            target: "upstream::poller",
                            upstream = %upstream.id(),
                            "finalized tag unsupported, falling back to depth estimate"
                        );
                        finalized_supported = false;
                    }
                    Err(PollError::Failed(message)) => {
                        state.last_error = Some(message);
                    }
                }
            }
            if !finalized_supported {
                state.finalized_block = state
                    .latest_block
                    .map(|latest| latest.saturating_sub(config.fallback_finality_depth));
                state.finality_observed = false;
            }

            upstream.publish_chain_state(state);
        }
    })
}

enum PollError {
    Unsupported,
    Failed(String),
}

async fn poll_latest(upstream: &Upstream) -> Result<u64, String> {
    let request = JsonRpcRequest::new(json!(1), "eth_blockNumber", json!([]));
    let response = upstream.forward(&request).await.map_err(|err| err.to_string())?;
    response
        .result
        .as_ref()
        .and_then(BlockRef::from_value)
        .and_then(|block| block.as_number())
        .ok_or_else(|| "malformed eth_blockNumber result".to_owned())
}

async fn poll_finalized(upstream: &Upstream) -> Result<u64, PollError> {
    let request =
        JsonRpcRequest::new(json!(1), "eth_getBlockByNumber", json!(["finalized", false]));
    let response = upstream.forward(&request).await.map_err(|err| {
        if err.kind == ErrorKind::UnsupportedMethod {
            PollError::Unsupported
        } else {
            PollError::Failed(err.to_string())
        }
    })?;
    response
        .result
        .as_ref()
        .and_then(|result| result.get("number"))
        .and_then(BlockRef::from_value)
        .and_then(|block| block.as_number())
        .ok_or(PollError::Unsupported)
}
