//! Feeds a stream of submission requests into the transaction submitter.
//!
//! Requests are sent strictly in the order they are received: the next request is only
//! signed once the node accepted the previous one. Up to `max_in_flight` accepted
//! submissions may await inclusion at the same time. Every request ends in exactly one
//! [`SubmissionReport`], and a failing request never prevents later ones from being sent.
//!
//! Per request: `Queued → Sent → {Included → {Success | OnChainFailure} | TransportFailed}`.

use std::num::NonZeroUsize;

use futures::future::{self, BoxFuture};
use futures::stream::{FuturesUnordered, Stream};
use futures::{FutureExt, StreamExt};
use log::{error, info, warn};
use snafu::ResultExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{Result, SequencerTaskSnafu};
use crate::model::{FeedId, SubmissionRequest, TxOutcome};
use crate::node_client::NodeClient;
use crate::tx_submitter::{wait_for_terminal, TxSubmitter};

/// Capacity of the report channel handed to callers.
pub const REPORT_CHANNEL_CAPACITY: usize = 100;

/// Terminal result of one submission request.
#[derive(Clone, Debug)]
pub struct SubmissionReport {
    /// Source chain of the request.
    pub chain: String,
    /// Source block number.
    pub block_number: u64,
    /// Signer address.
    pub identity: String,
    /// Target feed.
    pub feed_id: FeedId,
    /// The terminal outcome.
    pub outcome: TxOutcome,
}

/// Totals over everything a sequencer processed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequencerSummary {
    /// Requests taken from the input.
    pub submitted: usize,
    /// Requests included and executed successfully.
    pub succeeded: usize,
    /// Requests included but failed on chain.
    pub on_chain_failed: usize,
    /// Requests that never made it into a block.
    pub transport_failed: usize,
}

impl SequencerSummary {
    /// Adds one terminal outcome to the totals.
    fn count(&mut self, outcome: &TxOutcome) {
        match outcome {
            TxOutcome::IncludedInBlock(_) => self.succeeded += 1,
            TxOutcome::Failed { .. } => self.on_chain_failed += 1,
            TxOutcome::TransportError(_) | TxOutcome::Pending(_) => self.transport_failed += 1,
        }
    }
}

/// Handle to a running sequencer.
pub struct SubmissionHandle {
    /// Fires to stop taking new requests.
    cancel: Option<oneshot::Sender<()>>,
    /// The sequencer task.
    task: JoinHandle<SequencerSummary>,
}

impl SubmissionHandle {
    /// Stops taking requests from the input. Submissions already sent run to completion.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            // the sequencer may already have finished
            let _ = cancel.send(());
        }
    }

    /// Waits for the sequencer to finish and returns its totals.
    pub async fn join(self) -> Result<SequencerSummary> {
        self.task.await.context(SequencerTaskSnafu)
    }

    /// Whether the sequencer has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Sequences submissions into a [`TxSubmitter`].
pub struct SubmissionSequencer<C> {
    /// Where requests are sent.
    submitter: TxSubmitter<C>,
    /// Bound on submissions awaiting inclusion.
    max_in_flight: NonZeroUsize,
}

impl<C: NodeClient> SubmissionSequencer<C> {
    /// Creates a sequencer allowing `max_in_flight` submissions to await inclusion at once.
    pub fn new(submitter: TxSubmitter<C>, max_in_flight: NonZeroUsize) -> Self {
        Self {
            submitter,
            max_in_flight,
        }
    }

    /// Starts processing `requests` on a new task.
    ///
    /// One report per request is pushed to `reports`. Processing ends when `requests`
    /// ends or the handle is cancelled, after all sent submissions reached a terminal
    /// outcome.
    pub fn process<S>(self, requests: S, reports: mpsc::Sender<SubmissionReport>) -> SubmissionHandle
    where
        S: Stream<Item = SubmissionRequest> + Send + 'static,
    {
        let (cancel, cancelled) = oneshot::channel();
        let task = tokio::spawn(self.run(requests.boxed(), cancelled, reports));

        SubmissionHandle {
            cancel: Some(cancel),
            task,
        }
    }

    /// The sequencer loop; returns once the input is exhausted or cancelled and nothing is in flight.
    async fn run(
        self,
        mut requests: futures::stream::BoxStream<'static, SubmissionRequest>,
        mut cancelled: oneshot::Receiver<()>,
        reports: mpsc::Sender<SubmissionReport>,
    ) -> SequencerSummary {
        let mut summary = SequencerSummary::default();
        let mut in_flight: FuturesUnordered<BoxFuture<'static, SubmissionReport>> =
            FuturesUnordered::new();
        let mut accepting = true;
        let mut cancel_armed = true;

        while accepting || !in_flight.is_empty() {
            let has_room = accepting && in_flight.len() < self.max_in_flight.get();
            let mut next_request = None;
            let mut finished = None;

            tokio::select! {
                biased;

                signal = &mut cancelled, if cancel_armed => {
                    cancel_armed = false;
                    // a dropped handle detaches the sequencer rather than cancelling it
                    if signal.is_ok() && accepting {
                        info!("🛑 Submission input cancelled, waiting for {} in-flight submissions", in_flight.len());
                        accepting = false;
                    }
                }

                Some(report) = in_flight.next(), if !in_flight.is_empty() => {
                    finished = Some(report);
                }

                request = requests.next(), if has_room => {
                    match request {
                        Some(request) => next_request = Some(request),
                        None => {
                            info!("Submission input ended, waiting for {} in-flight submissions", in_flight.len());
                            accepting = false;
                        }
                    }
                }
            }

            // awaited outside select! so no borrow of `in_flight` is held across an await
            if let Some(report) = finished {
                summary.count(&report.outcome);
                if reports.send(report).await.is_err() {
                    warn!("Submission report receiver dropped");
                }
            }
            if let Some(request) = next_request {
                summary.submitted += 1;
                let report = self.send(request).await;
                in_flight.push(report);
            }
        }

        info!("Submission sequencer finished: {summary:?}");
        summary
    }

    /// Sends `request` and returns a future resolving to its report.
    ///
    /// Returns once the node accepted (or rejected) the transaction, so the next request
    /// is never signed before this one was handed to the node.
    async fn send(&self, request: SubmissionRequest) -> BoxFuture<'static, SubmissionReport> {
        let report = |outcome: TxOutcome| SubmissionReport {
            chain: request.chain.clone(),
            block_number: request.metadata.number,
            identity: request.identity.address().to_string(),
            feed_id: request.feed_id,
            outcome,
        };

        let operation = match request.operation() {
            Ok(operation) => operation,
            Err(err) => {
                error!(
                    "❌ Cannot submit block {} of {}: {err}",
                    request.metadata.number, request.chain
                );
                return future::ready(report(TxOutcome::TransportError(err.to_string()))).boxed();
            }
        };

        let mut outcomes = self.submitter.submit(operation, request.identity.clone());

        match outcomes.next().await {
            Some(TxOutcome::Pending(_)) => {
                let report = report(TxOutcome::TransportError(String::new()));
                async move {
                    SubmissionReport {
                        outcome: wait_for_terminal(outcomes).await,
                        ..report
                    }
                }
                .boxed()
            }
            Some(terminal) => future::ready(report(terminal)).boxed(),
            None => future::ready(report(TxOutcome::TransportError(
                "submission produced no outcome".to_string(),
            )))
            .boxed(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::stream;
    use subxt::utils::H256;

    use super::*;
    use crate::mock_node::{test_identity, Behaviour, MockNodeClient};
    use crate::model::{BlockMetadata, Identity};

    fn request(identity: &Identity, number: u64, payload: &[u8]) -> SubmissionRequest {
        SubmissionRequest {
            feed_id: 7,
            payload: payload.to_vec(),
            metadata: BlockMetadata::new(H256::from_low_u64_be(number), number),
            chain: "source".to_string(),
            identity: identity.clone(),
        }
    }

    fn sequencer(node: &Arc<MockNodeClient>, max_in_flight: usize) -> SubmissionSequencer<MockNodeClient> {
        SubmissionSequencer::new(
            TxSubmitter::new(Arc::clone(node)),
            NonZeroUsize::new(max_in_flight).unwrap(),
        )
    }

    async fn drain(mut reports: mpsc::Receiver<SubmissionReport>) -> Vec<SubmissionReport> {
        let mut all = Vec::new();
        while let Some(report) = reports.recv().await {
            all.push(report);
        }
        all
    }

    fn assert_send<T: Send>(value: T) -> T {
        value
    }

    #[tokio::test]
    async fn the_sequencer_loop_can_be_spawned() {
        let node = Arc::new(MockNodeClient::new());
        let (_cancel, cancelled) = oneshot::channel();
        let (tx, rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let requests = stream::iter(vec![request(&test_identity(1), 1, b"r1")]).boxed();

        let summary = tokio::spawn(assert_send(sequencer(&node, 1).run(requests, cancelled, tx)))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, 1);
        assert_eq!(drain(rx).await.len(), 1);
    }

    #[tokio::test]
    async fn sends_preserve_input_order_when_completions_do_not() {
        let node = Arc::new(MockNodeClient::new());
        node.script(b"r1", Behaviour::SucceedAfter(Duration::from_millis(100)));
        node.script(b"r3", Behaviour::SucceedAfter(Duration::from_millis(50)));
        let requests = vec![
            request(&test_identity(1), 1, b"r1"),
            request(&test_identity(2), 2, b"r2"),
            request(&test_identity(3), 3, b"r3"),
        ];
        let (tx, rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);

        let handle = sequencer(&node, 3).process(stream::iter(requests), tx);
        let summary = handle.join().await.unwrap();
        let reports = drain(rx).await;

        assert_eq!(
            node.sent_payloads(),
            vec![b"r1".to_vec(), b"r2".to_vec(), b"r3".to_vec()]
        );
        let completed: Vec<u64> = reports.iter().map(|r| r.block_number).collect();
        assert_eq!(completed, vec![2, 3, 1]);
        assert_eq!(summary.succeeded, 3);
    }

    #[tokio::test]
    async fn a_failed_submission_does_not_stop_later_ones() {
        let node = Arc::new(MockNodeClient::new());
        node.script(b"r1", Behaviour::TransportFailure);
        let alice = test_identity(1);
        let requests = vec![request(&alice, 1, b"r1"), request(&alice, 2, b"r2")];
        let (tx, rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);

        let summary = sequencer(&node, 1)
            .process(stream::iter(requests), tx)
            .join()
            .await
            .unwrap();
        let reports = drain(rx).await;

        assert_eq!(reports.len(), 2);
        assert!(matches!(reports[0].outcome, TxOutcome::TransportError(_)));
        assert!(matches!(reports[1].outcome, TxOutcome::IncludedInBlock(_)));
        assert_eq!(
            summary,
            SequencerSummary {
                submitted: 2,
                succeeded: 1,
                on_chain_failed: 0,
                transport_failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn on_chain_failures_are_not_reported_as_success() {
        let node = Arc::new(MockNodeClient::new());
        node.script(b"bad", Behaviour::OnChainFailure);
        let (tx, rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);

        let summary = sequencer(&node, 1)
            .process(stream::iter(vec![request(&test_identity(1), 1, b"bad")]), tx)
            .join()
            .await
            .unwrap();
        let reports = drain(rx).await;

        assert!(matches!(reports[0].outcome, TxOutcome::Failed { .. }));
        assert_eq!(summary.on_chain_failed, 1);
        assert_eq!(summary.succeeded, 0);
    }

    #[tokio::test]
    async fn the_same_identity_gets_consecutive_nonces() {
        let node = Arc::new(MockNodeClient::new());
        let alice = test_identity(1);
        let requests = (1..=4).map(|n| request(&alice, n, &[n as u8])).collect::<Vec<_>>();
        let (tx, rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);

        let summary = sequencer(&node, 4)
            .process(stream::iter(requests), tx)
            .join()
            .await
            .unwrap();
        drop(rx);

        assert_eq!(node.nonces_used(alice.address()), vec![0, 1, 2, 3]);
        assert_eq!(summary.succeeded, 4);
    }

    #[tokio::test]
    async fn cancelled_sequencers_finish_in_flight_work_but_send_nothing_new() {
        let node = Arc::new(MockNodeClient::new());
        node.script(b"slow", Behaviour::SucceedAfter(Duration::from_millis(100)));
        let alice = test_identity(1);
        let (input, requests) = futures::channel::mpsc::unbounded();
        let (tx, rx) = mpsc::channel(REPORT_CHANNEL_CAPACITY);

        let mut handle = sequencer(&node, 2).process(requests, tx);
        input.unbounded_send(request(&alice, 1, b"slow")).unwrap();
        while node.sent_payloads().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        handle.cancel();
        input.unbounded_send(request(&alice, 2, b"late")).unwrap();
        let summary = handle.join().await.unwrap();
        let reports = drain(rx).await;

        assert_eq!(node.sent_payloads(), vec![b"slow".to_vec()]);
        assert_eq!(reports.len(), 1);
        assert!(matches!(reports[0].outcome, TxOutcome::IncludedInBlock(_)));
        assert_eq!(summary.submitted, 1);
    }
}
