//! Caller-facing entry point tying the submitter, registrar and sequencer together.

use std::num::NonZeroUsize;
use std::sync::Arc;

use futures::Stream;
use log::info;
use snafu::ResultExt;
use subxt::utils::AccountId32;
use tokio::sync::mpsc;

use crate::error::{Result, TransferFailedSnafu};
use crate::feed_registrar::FeedRegistrar;
use crate::model::{FeedId, Identity, Operation, SubmissionRequest};
use crate::node_client::NodeClient;
use crate::registry_store::RegistryStore;
use crate::sequencer::{
    SubmissionHandle,
    SubmissionReport,
    SubmissionSequencer,
    REPORT_CHANNEL_CAPACITY,
};
use crate::tx_submitter::TxSubmitter;

/// Relays data into feeds of the target chain.
pub struct Relayer<C> {
    /// Shared transaction submitter.
    submitter: TxSubmitter<C>,
    /// Resolves identities to feeds.
    registrar: FeedRegistrar<C>,
    /// Concurrency bound for [`Relayer::process_submissions`].
    max_in_flight: NonZeroUsize,
}

impl<C: NodeClient> Relayer<C> {
    /// Creates a relayer talking to `client` and recording feeds in `store`.
    pub fn new(client: Arc<C>, store: Arc<dyn RegistryStore>, max_in_flight: NonZeroUsize) -> Self {
        let submitter = TxSubmitter::new(client);
        let registrar = FeedRegistrar::new(submitter.clone(), store);
        Self {
            submitter,
            registrar,
            max_in_flight,
        }
    }

    /// The feed of `identity`, registering one on first use.
    pub async fn get_feed_id(&self, identity: &Identity) -> Result<FeedId> {
        self.registrar.get_or_create_feed(identity).await
    }

    /// A clone of the registrar, for components that resolve feeds on their own.
    pub fn registrar(&self) -> FeedRegistrar<C> {
        self.registrar.clone()
    }

    /// Starts submitting `requests`, returning the handle and the per-request reports.
    pub fn process_submissions<S>(
        &self,
        requests: S,
    ) -> (SubmissionHandle, mpsc::Receiver<SubmissionReport>)
    where
        S: Stream<Item = SubmissionRequest> + Send + 'static,
    {
        let (reports, receiver) = mpsc::channel(REPORT_CHANNEL_CAPACITY);
        let handle = SubmissionSequencer::new(self.submitter.clone(), self.max_in_flight)
            .process(requests, reports);
        (handle, receiver)
    }

    /// Transfers `amount` from `from` to `to`, waiting for in-block inclusion only.
    pub async fn send_value_transfer(
        &self,
        from: &Identity,
        to: AccountId32,
        amount: u128,
    ) -> Result<()> {
        let to_address = to.to_string();
        let inclusion = self
            .submitter
            .submit_and_wait(Operation::Transfer { dest: to, amount }, from)
            .await
            .map_err(Box::new)
            .context(TransferFailedSnafu {
                from: from.address(),
                to: to_address.clone(),
                amount,
            })?;

        info!(
            "💸 Transferred {amount} from {} to {to_address} in block {:?}",
            from.address(),
            inclusion.block_hash
        );
        Ok(())
    }
}
