//! Signs and sends single operations to the target node and reports their progress.
use std::sync::Arc;

use async_stream::stream;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::{error, info, warn};
use subxt::utils::H256;

use crate::error::{Error, Result};
use crate::model::{Identity, Inclusion, Operation, TxOutcome, TxStage};
use crate::node_client::{NodeClient, NodeStatus};

/// Lazy sequence of outcomes for one transaction, ending at the first terminal outcome.
pub type OutcomeStream = BoxStream<'static, TxOutcome>;

/// Sends transactions through a [`NodeClient`].
///
/// No nonce is cached: every send asks the node for the next valid nonce of the signer,
/// so callers must not send for the same identity concurrently.
pub struct TxSubmitter<C> {
    /// The node connection.
    client: Arc<C>,
}

impl<C> Clone for TxSubmitter<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<C: NodeClient> TxSubmitter<C> {
    /// Creates a submitter on top of a node client.
    pub fn new(client: Arc<C>) -> Self {
        Self { client }
    }

    /// Signs and sends `operation`, yielding its outcomes.
    ///
    /// Nothing happens until the stream is polled. The stream yields
    /// [`TxStage::Sent`] once the node accepted the transaction, then progress
    /// updates, and ends with exactly one terminal outcome. Errors from the node
    /// are reported as outcomes, never as panics or `Err`s.
    pub fn submit(&self, operation: Operation, signer: Identity) -> OutcomeStream {
        let client = Arc::clone(&self.client);

        Box::pin(stream! {
            let kind = operation.kind();
            let address = signer.address().to_string();

            let nonce = match client.next_nonce(signer.account_id()).await {
                Ok(nonce) => nonce,
                Err(err) => {
                    error!("❌ Failed to fetch nonce for {address} ({kind}): {err}");
                    yield TxOutcome::TransportError(format!("failed to fetch nonce: {err}"));
                    return;
                }
            };

            let (extrinsic_hash, mut statuses) =
                match client.sign_and_send(&operation, &signer, nonce).await {
                    Ok(sent) => sent,
                    Err(err) => {
                        error!("❌ Failed to send {kind} for {address} with nonce {nonce}: {err}");
                        yield TxOutcome::TransportError(err.to_string());
                        return;
                    }
                };

            info!("✅ Sent {kind} for {address} with nonce {nonce}: {extrinsic_hash:?}");
            yield TxOutcome::Pending(TxStage::Sent { extrinsic_hash, nonce });

            while let Some(status) = statuses.next().await {
                match status {
                    Ok(NodeStatus::Validated) => {
                        info!("📄 Transaction {extrinsic_hash:?} has been validated.");
                        yield TxOutcome::Pending(TxStage::Validated);
                    }
                    Ok(NodeStatus::Broadcast { num_peers }) => {
                        info!("📡 Transaction {extrinsic_hash:?} broadcasted to {num_peers} peers.");
                        yield TxOutcome::Pending(TxStage::Broadcast { num_peers });
                    }
                    Ok(NodeStatus::Retracted) => {
                        warn!("⚠️ Transaction {extrinsic_hash:?} is no longer in the best block.");
                        yield TxOutcome::Pending(TxStage::Retracted);
                    }
                    Ok(NodeStatus::InBlock { block_hash })
                    | Ok(NodeStatus::Finalized { block_hash }) => {
                        yield inspect_inclusion(
                            client.as_ref(),
                            block_hash,
                            extrinsic_hash,
                            kind,
                            &address,
                        )
                        .await;
                        return;
                    }
                    Ok(NodeStatus::Dropped(message)) => {
                        error!("❌ {kind} from {address} dropped: {message}");
                        yield TxOutcome::TransportError(format!("transaction dropped: {message}"));
                        return;
                    }
                    Ok(NodeStatus::Invalid(message)) => {
                        error!("❌ {kind} from {address} invalid: {message}");
                        yield TxOutcome::TransportError(format!("transaction invalid: {message}"));
                        return;
                    }
                    Ok(NodeStatus::Error(message)) => {
                        error!("❌ Error while watching {kind} from {address}: {message}");
                        yield TxOutcome::TransportError(message);
                        return;
                    }
                    Err(err) => {
                        error!("❌ Error while watching {kind} from {address}: {err}");
                        yield TxOutcome::TransportError(err.to_string());
                        return;
                    }
                }
            }

            error!("❌ Status stream of {extrinsic_hash:?} ended before inclusion");
            yield TxOutcome::TransportError("status stream ended before inclusion".to_string());
        })
    }

    /// Submits `operation` and waits for its terminal outcome.
    ///
    /// Returns the inclusion on success, and [`Error::OnChainFailure`] or
    /// [`Error::Transport`] otherwise.
    pub async fn submit_and_wait(&self, operation: Operation, signer: &Identity) -> Result<Inclusion> {
        let kind = operation.kind();
        let outcome = wait_for_terminal(self.submit(operation, signer.clone())).await;

        match outcome {
            TxOutcome::IncludedInBlock(inclusion) => Ok(inclusion),
            TxOutcome::Failed { reason, .. } => Err(Error::OnChainFailure {
                identity: signer.address().to_string(),
                operation: kind,
                reason,
            }),
            TxOutcome::TransportError(message) => Err(Error::Transport {
                identity: signer.address().to_string(),
                operation: kind,
                message,
            }),
            TxOutcome::Pending(stage) => Err(Error::Transport {
                identity: signer.address().to_string(),
                operation: kind,
                message: format!("no terminal outcome after {stage:?}"),
            }),
        }
    }
}

/// Drains `outcomes` until its terminal outcome.
pub async fn wait_for_terminal(mut outcomes: OutcomeStream) -> TxOutcome {
    while let Some(outcome) = outcomes.next().await {
        if outcome.is_terminal() {
            return outcome;
        }
    }
    TxOutcome::TransportError("outcome stream ended without a terminal outcome".to_string())
}

/// Classifies an included transaction by the events its extrinsic emitted.
async fn inspect_inclusion<C: NodeClient>(
    client: &C,
    block_hash: H256,
    extrinsic_hash: H256,
    kind: &'static str,
    address: &str,
) -> TxOutcome {
    let events = match client.extrinsic_events(block_hash, extrinsic_hash).await {
        Ok(events) => events,
        Err(err) => {
            error!("❌ Failed to fetch events of {kind} from {address} in block {block_hash:?}: {err}");
            return TxOutcome::TransportError(format!("failed to fetch events: {err}"));
        }
    };

    if let Some(failed) = events.iter().find(|event| event.is("System", "ExtrinsicFailed")) {
        error!(
            "❌ {kind} from {address} failed in block {block_hash:?}: 0x{}",
            hex::encode(&failed.fields)
        );
        return TxOutcome::Failed {
            block_hash,
            reason: format!("System.ExtrinsicFailed 0x{}", hex::encode(&failed.fields)),
        };
    }

    info!("📦 {kind} from {address} included in block {block_hash:?}");
    TxOutcome::IncludedInBlock(Inclusion {
        block_hash,
        extrinsic_hash,
        events,
    })
}
