//! Ensures every identity owns exactly one feed.
//!
//! The registry store is consulted first; only identities without a record trigger a
//! `Feeds.create` transaction. Concurrent requests for the same unregistered identity
//! share one in-flight creation, so at most one creation transaction per identity is
//! ever outstanding. The creation itself runs on its own task and is never cancelled
//! halfway, even if every caller waiting on it goes away.

use std::collections::HashMap;
use std::sync::Arc;

use codec::Decode;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info};
use snafu::ResultExt;
use subxt::utils::AccountId32;
use tokio::sync::Mutex;

use crate::error::{
    CreationTaskSnafu,
    Error,
    FeedCreatedEventDecodeSnafu,
    RegistrationFailedSnafu,
    Result,
    UnrecordedFeedSnafu,
};
use crate::model::{FeedId, Identity, Inclusion, Operation, FEEDS_PALLET, FEED_CREATED_EVENT};
use crate::node_client::NodeClient;
use crate::registry_store::RegistryStore;
use crate::tx_submitter::TxSubmitter;

/// A creation every waiter for the same identity can await.
type PendingCreation = Shared<BoxFuture<'static, Result<FeedId, Arc<Error>>>>;

/// Resolves identities to feeds, creating feeds on first use.
pub struct FeedRegistrar<C> {
    /// Used to send creation transactions.
    submitter: TxSubmitter<C>,
    /// Where registrations are persisted.
    store: Arc<dyn RegistryStore>,
    /// In-flight creations keyed by identity address.
    pending: Arc<Mutex<HashMap<String, PendingCreation>>>,
}

impl<C> Clone for FeedRegistrar<C> {
    fn clone(&self) -> Self {
        Self {
            submitter: self.submitter.clone(),
            store: Arc::clone(&self.store),
            pending: Arc::clone(&self.pending),
        }
    }
}

impl<C: NodeClient> FeedRegistrar<C> {
    /// Creates a registrar sending through `submitter` and persisting into `store`.
    pub fn new(submitter: TxSubmitter<C>, store: Arc<dyn RegistryStore>) -> Self {
        Self {
            submitter,
            store,
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the feed of `identity`, creating and recording it if there is none.
    ///
    /// Fails with [`Error::RegistrationFailed`] if the creation could not be completed,
    /// in which case nothing is recorded and the next call starts over.
    pub async fn get_or_create_feed(&self, identity: &Identity) -> Result<FeedId> {
        if let Some(feed_id) = self.store.lookup(identity.account_id()) {
            debug!("Feed {feed_id} already registered for {}", identity.address());
            return Ok(feed_id);
        }

        let creation = {
            let mut pending = self.pending.lock().await;

            // A creation may have completed between the lookup and taking the lock.
            if let Some(feed_id) = self.store.lookup(identity.account_id()) {
                return Ok(feed_id);
            }

            pending
                .entry(identity.address().to_string())
                .or_insert_with(|| self.spawn_creation(identity.clone()))
                .clone()
        };

        creation.await.context(RegistrationFailedSnafu {
            identity: identity.address(),
        })
    }

    /// Starts creating a feed for `identity` on a separate task.
    ///
    /// Must be called with the `pending` lock held; the task removes its own entry once it
    /// settled, whatever the outcome.
    fn spawn_creation(&self, identity: Identity) -> PendingCreation {
        let submitter = self.submitter.clone();
        let store = Arc::clone(&self.store);
        let pending = Arc::clone(&self.pending);
        let address = identity.address().to_string();

        let task = tokio::spawn(async move {
            let result = create_feed(&submitter, store.as_ref(), &identity).await;
            pending.lock().await.remove(identity.address());
            result.map_err(|err| {
                error!(
                    "❌ Feed creation for {} failed: {err}",
                    identity.address()
                );
                Arc::new(err)
            })
        });

        async move {
            task.await
                .context(CreationTaskSnafu { identity: address })
                .map_err(Arc::new)?
        }
        .boxed()
        .shared()
    }
}

/// Sends `Feeds.create` for `identity`, extracts the new feed and records it.
async fn create_feed<C: NodeClient>(
    submitter: &TxSubmitter<C>,
    store: &dyn RegistryStore,
    identity: &Identity,
) -> Result<FeedId> {
    info!("🆕 No feed registered for {}, creating one", identity.address());

    let inclusion = submitter
        .submit_and_wait(Operation::CreateFeed, identity)
        .await?;
    let feed_id = created_feed_id(&inclusion, identity)?;

    let block_hash = format!("{:#x}", inclusion.block_hash);
    if let Err(err) = store.record(identity.account_id(), feed_id).await {
        error!(
            "❌ Feed {feed_id} was created for {} in block {block_hash} but could not be recorded: {err}",
            identity.address()
        );
        return Err(err).map_err(Box::new).context(UnrecordedFeedSnafu {
            identity: identity.address(),
            feed_id,
            block_hash,
        });
    }
    info!("✅ Registered feed {feed_id} for {}", identity.address());
    Ok(feed_id)
}

/// Finds the `FeedCreated(feed_id, creator)` event emitted for `identity`.
fn created_feed_id(inclusion: &Inclusion, identity: &Identity) -> Result<FeedId> {
    for event in inclusion
        .events
        .iter()
        .filter(|event| event.is(FEEDS_PALLET, FEED_CREATED_EVENT))
    {
        let (feed_id, creator) = <(FeedId, AccountId32)>::decode(&mut event.fields.as_slice())
            .context(FeedCreatedEventDecodeSnafu)?;
        if &creator == identity.account_id() {
            return Ok(feed_id);
        }
    }

    Err(Error::FeedCreatedEventMissing {
        identity: identity.address().to_string(),
        block_hash: format!("{:#x}", inclusion.block_hash),
    })
}
