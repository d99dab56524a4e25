//! A scripted [`NodeClient`] for tests.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_stream::stream;
use async_trait::async_trait;
use codec::Encode;
use futures::StreamExt;
use subxt::utils::{AccountId32, H256};
use subxt_signer::sr25519::Keypair;

use crate::model::{ChainEvent, FeedId, Identity, Operation, FEEDS_PALLET, FEED_CREATED_EVENT};
use crate::node_client::{NodeClient, NodeStatus, StatusStream};

/// How the mock node treats a transaction.
#[derive(Clone, Copy, Debug)]
pub enum Behaviour {
    /// Included, execution succeeds.
    Succeed,
    /// Included after the given delay, execution succeeds.
    SucceedAfter(Duration),
    /// Included, `System.ExtrinsicFailed` emitted.
    OnChainFailure,
    /// `sign_and_send` errors.
    TransportFailure,
    /// Dropped from the pool after validation.
    Dropped,
    /// The status stream closes without inclusion.
    EndsBeforeInclusion,
    /// Included, but the `FeedCreated` event carries garbage.
    MalformedFeedCreated,
}

/// A transaction the mock node received.
#[derive(Clone, Debug)]
pub struct SentTx {
    /// Signer address.
    pub signer: String,
    /// The operation.
    pub operation: Operation,
    /// Nonce it was signed with.
    pub nonce: u64,
}

/// Internal, mutex protected state of [`MockNodeClient`].
#[derive(Default)]
struct MockState {
    /// Accepted transactions, in send order.
    sent: Vec<SentTx>,
    /// Number of nonce lookups.
    nonce_queries: usize,
    /// Behaviour of data submissions by payload.
    scripts: HashMap<Vec<u8>, Behaviour>,
    /// Behaviours of upcoming feed creations.
    creation_behaviours: Vec<Behaviour>,
    /// Delay before a creation is included.
    creation_delay: Duration,
    /// Feed id the next successful creation gets.
    next_feed_id: FeedId,
    /// Events per extrinsic hash.
    events: HashMap<H256, Vec<ChainEvent>>,
}

/// A node that includes every transaction in its own block and records what it received.
pub struct MockNodeClient {
    /// Everything the node has seen and been told.
    state: Mutex<MockState>,
}

/// Deterministic identity for tests.
pub fn test_identity(seed: u8) -> Identity {
    Identity::new(Keypair::from_secret_key([seed; 32]).unwrap())
}

/// A field-less `System` event.
fn system_event(variant: &str) -> ChainEvent {
    ChainEvent {
        pallet: "System".to_string(),
        variant: variant.to_string(),
        fields: Vec::new(),
    }
}

impl MockNodeClient {
    /// A node assigning feed ids starting at 7.
    pub fn new() -> Self {
        Self::with_first_feed_id(7)
    }

    /// A node assigning feed ids starting at `first_feed_id`.
    pub fn with_first_feed_id(first_feed_id: FeedId) -> Self {
        Self {
            state: Mutex::new(MockState {
                next_feed_id: first_feed_id,
                ..Default::default()
            }),
        }
    }

    /// A `Feeds.put` carrying `payload` on feed 0.
    pub fn put(payload: &[u8]) -> Operation {
        Operation::PutData {
            feed_id: 0,
            data: payload.to_vec(),
            metadata: Vec::new(),
        }
    }

    /// Treat data submissions carrying `payload` with `behaviour`.
    pub fn script(&self, payload: &[u8], behaviour: Behaviour) {
        self.state
            .lock()
            .unwrap()
            .scripts
            .insert(payload.to_vec(), behaviour);
    }

    /// Behaviours for the next feed creations, in order. Later creations succeed.
    pub fn script_creations(&self, behaviours: Vec<Behaviour>) {
        self.state.lock().unwrap().creation_behaviours = behaviours;
    }

    /// Delay between sending a feed creation and its inclusion.
    pub fn delay_creations(&self, delay: Duration) {
        self.state.lock().unwrap().creation_delay = delay;
    }

    /// Everything sent so far, in send order.
    pub fn sent(&self) -> Vec<SentTx> {
        self.state.lock().unwrap().sent.clone()
    }

    /// Number of remote calls made (nonce queries and sends).
    pub fn network_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.nonce_queries + state.sent.len()
    }

    /// Number of feed creation transactions sent.
    pub fn creations(&self) -> usize {
        self.sent()
            .iter()
            .filter(|tx| tx.operation == Operation::CreateFeed)
            .count()
    }

    /// Payloads of data submissions, in send order.
    pub fn sent_payloads(&self) -> Vec<Vec<u8>> {
        self.sent()
            .into_iter()
            .filter_map(|tx| match tx.operation {
                Operation::PutData { data, .. } => Some(data),
                _ => None,
            })
            .collect()
    }

    /// Nonces `address` signed with, in send order.
    pub fn nonces_used(&self, address: &str) -> Vec<u64> {
        self.sent()
            .iter()
            .filter(|tx| tx.signer == address)
            .map(|tx| tx.nonce)
            .collect()
    }

    /// Picks how `operation` is treated and how long its inclusion takes.
    fn behaviour_for(state: &mut MockState, operation: &Operation) -> (Behaviour, Duration) {
        match operation {
            Operation::CreateFeed => {
                let behaviour = if state.creation_behaviours.is_empty() {
                    Behaviour::Succeed
                } else {
                    state.creation_behaviours.remove(0)
                };
                (behaviour, state.creation_delay)
            }
            Operation::PutData { data, .. } => match state.scripts.get(data) {
                Some(Behaviour::SucceedAfter(delay)) => (Behaviour::Succeed, *delay),
                Some(behaviour) => (*behaviour, Duration::ZERO),
                None => (Behaviour::Succeed, Duration::ZERO),
            },
            Operation::Transfer { amount, .. } if *amount == 0 => {
                (Behaviour::OnChainFailure, Duration::ZERO)
            }
            Operation::Transfer { .. } => (Behaviour::Succeed, Duration::ZERO),
        }
    }
}

#[async_trait]
impl NodeClient for MockNodeClient {
    async fn next_nonce(&self, account: &AccountId32) -> Result<u64, subxt::Error> {
        let mut state = self.state.lock().unwrap();
        state.nonce_queries += 1;
        let address = account.to_string();
        Ok(state.sent.iter().filter(|tx| tx.signer == address).count() as u64)
    }

    async fn sign_and_send(
        &self,
        operation: &Operation,
        signer: &Identity,
        nonce: u64,
    ) -> Result<(H256, StatusStream), subxt::Error> {
        let mut state = self.state.lock().unwrap();

        let expected = state
            .sent
            .iter()
            .filter(|tx| tx.signer == signer.address())
            .count() as u64;
        if nonce != expected {
            return Err(subxt::Error::Other("Transaction is outdated".into()));
        }

        let (behaviour, delay) = Self::behaviour_for(&mut state, operation);
        if let Behaviour::TransportFailure = behaviour {
            return Err(subxt::Error::Other("connection closed".into()));
        }

        state.sent.push(SentTx {
            signer: signer.address().to_string(),
            operation: operation.clone(),
            nonce,
        });
        let index = state.sent.len() as u64;
        let extrinsic_hash = H256::from_low_u64_be(index);
        let block_hash = H256::from_low_u64_be(1_000 + index);

        let mut events = Vec::new();
        match (behaviour, operation) {
            (Behaviour::OnChainFailure, _) => events.push(system_event("ExtrinsicFailed")),
            (Behaviour::MalformedFeedCreated, _) => {
                events.push(ChainEvent {
                    pallet: FEEDS_PALLET.to_string(),
                    variant: FEED_CREATED_EVENT.to_string(),
                    fields: vec![1, 2],
                });
                events.push(system_event("ExtrinsicSuccess"));
            }
            (_, Operation::CreateFeed) => {
                let feed_id = state.next_feed_id;
                state.next_feed_id += 1;
                events.push(ChainEvent {
                    pallet: FEEDS_PALLET.to_string(),
                    variant: FEED_CREATED_EVENT.to_string(),
                    fields: (feed_id, signer.account_id().clone()).encode(),
                });
                events.push(system_event("ExtrinsicSuccess"));
            }
            _ => events.push(system_event("ExtrinsicSuccess")),
        }
        state.events.insert(extrinsic_hash, events);

        let statuses = stream! {
            yield Ok::<_, subxt::Error>(NodeStatus::Validated);
            match behaviour {
                Behaviour::Dropped => {
                    yield Ok(NodeStatus::Dropped("pool full".to_string()));
                }
                Behaviour::EndsBeforeInclusion => {}
                _ => {
                    yield Ok(NodeStatus::Broadcast { num_peers: 3 });
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    yield Ok(NodeStatus::InBlock { block_hash });
                }
            }
        };

        Ok((extrinsic_hash, statuses.boxed()))
    }

    async fn extrinsic_events(
        &self,
        _block_hash: H256,
        extrinsic_hash: H256,
    ) -> Result<Vec<ChainEvent>, subxt::Error> {
        self.state
            .lock()
            .unwrap()
            .events
            .get(&extrinsic_hash)
            .cloned()
            .ok_or_else(|| subxt::Error::Other("unknown extrinsic".into()))
    }
}
