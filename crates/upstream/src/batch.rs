//! Outbound batch coalescing.
//!
//! When an upstream supports wire batches, single calls are queued and
//! drained by one task per upstream: the first call opens a window, further
//! calls join until the window closes or the batch is full, then one HTTP
//! request carries them all. Callers suspend on a oneshot until their slot
//! resolves; the coalescing is invisible to them.

use crate::{
    classify::{classify_status, classify_transport_error},
    transport::JsonRpcTransport,
};
use bytes::Bytes;
use manifold_config::JsonRpcOptions;
use manifold_primitives::{
    ErrorKind, GatewayError, JsonRpcRequest, JsonRpcResponse, UpstreamId,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::trace;

pub(crate) struct BatchItem {
    pub(crate) request: JsonRpcRequest,
    pub(crate) reply: oneshot::Sender<Result<JsonRpcResponse, GatewayError>>,
}

/// Sender half used by [`crate::Upstream::forward`] to enqueue calls.
#[derive(Debug, Clone)]
pub(crate) struct BatchHandle {
    tx: mpsc::Sender<BatchItem>,
}

impl BatchHandle {
    /// Enqueues one call and waits for its slot to resolve.
    pub(crate) async fn dispatch(
        &self,
        request: JsonRpcRequest,
    ) -> Result<JsonRpcResponse, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(BatchItem { request, reply })
            .await
            .map_err(|_| GatewayError::transport("batch coalescer is gone"))?;
        rx.await.map_err(|_| GatewayError::transport("batch coalescer dropped the call"))?
    }
}

/// Spawns the per-upstream coalescer task and returns its handle.
pub(crate) fn spawn_coalescer(
    upstream: UpstreamId,
    options: JsonRpcOptions,
    transport: Arc<dyn JsonRpcTransport>,
) -> BatchHandle {
    let (tx, mut rx) = mpsc::channel::<BatchItem>(options.batch_max_size.max(1) * 4);

    tokio::spawn(async move {
        while let Some(first) = rx.recv().await {
            let mut batch = vec![first];
            let window = tokio::time::sleep(options.batch_max_wait);
            tokio::pin!(window);

            while batch.len() < options.batch_max_size {
                tokio::select! {
                    _ = &mut window => break,
                    item = rx.recv() => match item {
                        Some(item) => batch.push(item),
                        None => break,
                    },
                }
            }

            trace!(
                target: "upstream::batch",
                upstream = %upstream,
                size = batch.len(),
                "dispatching coalesced batch"
            );
            dispatch_batch(&upstream, &transport, batch).await;
        }
    });

    BatchHandle { tx }
}

async fn dispatch_batch(
    upstream: &UpstreamId,
    transport: &Arc<dyn JsonRpcTransport>,
    batch: Vec<BatchItem>,
) {
    // ids are rewritten to batch slots so replies can be routed back; the
    // caller's original id is restored on the way out
    let wire: Vec<JsonRpcRequest> = batch
        .iter()
        .enumerate()
        .map(|(slot, item)| item.request.with_id(slot as u64))
        .collect();

    let body = match serde_json::to_vec(&wire) {
        Ok(body) => Bytes::from(body),
        Err(err) => {
            fail_all(batch, &GatewayError::transport(format!("batch serialization: {err}")));
            return
        }
    };

    let reply = match transport.send(body).await {
        Ok(reply) => reply,
        Err(err) => {
            fail_all(batch, &classify_transport_error(err));
            return
        }
    };
    if let Err(err) = classify_status(upstream, reply.status) {
        fail_all(batch, &err);
        return
    }

    let responses: Vec<JsonRpcResponse> = match serde_json::from_slice(&reply.body) {
        Ok(responses) => responses,
        Err(err) => {
            fail_all(
                batch,
                &GatewayError::new(
                    ErrorKind::UpstreamServerError,
                    format!("upstream {upstream} returned a malformed batch: {err}"),
                ),
            );
            return
        }
    };

    let mut slots: Vec<Option<JsonRpcResponse>> = vec![None; batch.len()];
    for response in responses {
        if let Some(slot) = response.id.as_u64() {
            if let Some(entry) = slots.get_mut(slot as usize) {
                *entry = Some(response);
            }
        }
    }

    for (slot, item) in batch.into_iter().enumerate() {
        let result = match slots[slot].take() {
            Some(mut response) => {
                response.id = item.request.id.clone();
                Ok(response)
            }
            None => Err(GatewayError::new(
                ErrorKind::UpstreamServerError,
                format!("upstream {upstream} omitted a batch slot"),
            )),
        };
        let _ = item.reply.send(result);
    }
}

fn fail_all(batch: Vec<BatchItem>, err: &GatewayError) {
    for item in batch {
        let _ = item.reply.send(Err(err.clone()));
    }
}
