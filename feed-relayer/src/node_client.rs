//! The parts of the target node's API the relayer consumes.
//!
//! [`NodeClient`] is the seam between the relayer logic and the node. The production
//! implementation, [`SubxtNodeClient`], talks to a Substrate node over websocket RPC;
//! tests use a scripted client instead.

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use log::info;
use subxt::backend::legacy::LegacyRpcMethods;
use subxt::backend::rpc::reconnecting_rpc_client::{PingConfig, RpcClient as ReconnectingRpcClient};
use subxt::backend::rpc::RpcClient;
use subxt::config::polkadot::PolkadotExtrinsicParamsBuilder as Params;
use subxt::dynamic::Value;
use subxt::tx::{DynamicPayload, TxStatus};
use subxt::utils::{AccountId32, H256};
use subxt::{OnlineClient, PolkadotConfig};
use url::Url;

use crate::error::{Error, Result};
use crate::model::{ChainEvent, Identity, Operation, FEEDS_PALLET};

/// Connected Substrate client.
pub type API = OnlineClient<PolkadotConfig>;

/// Status of a submitted transaction as reported by the node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeStatus {
    /// Validated by the node's pool.
    Validated,
    /// Gossiped to peers.
    Broadcast {
        /// Number of peers.
        num_peers: u32,
    },
    /// Included in a best block.
    InBlock {
        /// The block.
        block_hash: H256,
    },
    /// The best block containing the transaction was retracted.
    Retracted,
    /// Included in a finalized block.
    Finalized {
        /// The block.
        block_hash: H256,
    },
    /// Dropped from the pool.
    Dropped(String),
    /// Deemed invalid by the pool.
    Invalid(String),
    /// The node reported an error while watching.
    Error(String),
}

/// Stream of statuses for one transaction, in the order the node reports them.
pub type StatusStream = BoxStream<'static, Result<NodeStatus, subxt::Error>>;

/// Remote node transaction and event API.
#[async_trait]
pub trait NodeClient: Send + Sync + 'static {
    /// Next valid nonce for `account`, including transactions still in the node's pool.
    async fn next_nonce(&self, account: &AccountId32) -> Result<u64, subxt::Error>;

    /// Signs `operation` with `signer` using `nonce`, sends it, and watches it.
    ///
    /// Returns the extrinsic hash together with its status stream.
    async fn sign_and_send(
        &self,
        operation: &Operation,
        signer: &Identity,
        nonce: u64,
    ) -> Result<(H256, StatusStream), subxt::Error>;

    /// Events emitted by the extrinsic `extrinsic_hash` in block `block_hash`, in order.
    async fn extrinsic_events(
        &self,
        block_hash: H256,
        extrinsic_hash: H256,
    ) -> Result<Vec<ChainEvent>, subxt::Error>;
}

/// Opens a reconnecting websocket RPC connection to `url`.
pub async fn connect_rpc(url: &Url) -> Result<RpcClient> {
    info!("Connecting to Substrate node at: {}", url);

    let rpc_client = ReconnectingRpcClient::builder()
        .request_timeout(Duration::from_secs(60))
        .connection_timeout(Duration::from_secs(10))
        .enable_ws_ping(PingConfig::new())
        .build(url.to_string())
        .await
        .map_err(|err| Error::ChainConnection {
            url: url.to_string(),
            message: err.to_string(),
        })?;

    Ok(RpcClient::new(rpc_client))
}

/// Opens a subxt client on top of `rpc_client`.
async fn online_client(url: &Url, rpc_client: RpcClient) -> Result<API> {
    let api = OnlineClient::<PolkadotConfig>::from_rpc_client(rpc_client)
        .await
        .map_err(|err| Error::ChainConnection {
            url: url.to_string(),
            message: err.to_string(),
        })?;

    info!("Substrate client connected");
    Ok(api)
}

/// Opens a subxt client on a reconnecting websocket RPC client.
pub async fn connect(url: &Url) -> Result<API> {
    online_client(url, connect_rpc(url).await?).await
}

/// [`NodeClient`] backed by subxt.
///
/// Transactions and events go through the subxt client, nonces through the legacy
/// `system_accountNextIndex` RPC, which also counts transactions still in the pool.
#[derive(Clone)]
pub struct SubxtNodeClient {
    /// Typed client for transactions, blocks and events.
    api: API,
    /// Raw RPC methods on the same connection.
    rpc: LegacyRpcMethods<PolkadotConfig>,
}

impl SubxtNodeClient {
    /// Wraps an already open RPC connection and the client built on it.
    pub fn new(api: API, rpc_client: RpcClient) -> Self {
        Self {
            api,
            rpc: LegacyRpcMethods::new(rpc_client),
        }
    }

    /// Connects to the node at `url`.
    pub async fn connect(url: &Url) -> Result<Self> {
        let rpc_client = connect_rpc(url).await?;
        let api = online_client(url, rpc_client.clone()).await?;
        Ok(Self::new(api, rpc_client))
    }
}

/// Builds the dynamic call for an operation.
fn payload(operation: &Operation) -> DynamicPayload {
    match operation {
        Operation::CreateFeed => subxt::dynamic::tx(FEEDS_PALLET, "create", Vec::<Value>::new()),
        Operation::PutData {
            feed_id,
            data,
            metadata,
        } => subxt::dynamic::tx(
            FEEDS_PALLET,
            "put",
            vec![
                Value::u128(u128::from(*feed_id)),
                Value::from_bytes(data.as_slice()),
                Value::from_bytes(metadata.as_slice()),
            ],
        ),
        Operation::Transfer { dest, amount } => subxt::dynamic::tx(
            "Balances",
            "transfer_keep_alive",
            vec![
                Value::unnamed_variant("Id", [Value::from_bytes(dest.0)]),
                Value::u128(*amount),
            ],
        ),
    }
}

impl From<TxStatus<PolkadotConfig, API>> for NodeStatus {
    fn from(status: TxStatus<PolkadotConfig, API>) -> Self {
        match status {
            TxStatus::Validated => NodeStatus::Validated,
            TxStatus::Broadcasted { num_peers } => NodeStatus::Broadcast { num_peers },
            TxStatus::NoLongerInBestBlock => NodeStatus::Retracted,
            TxStatus::InBestBlock(details) => NodeStatus::InBlock {
                block_hash: details.block_hash(),
            },
            TxStatus::InFinalizedBlock(details) => NodeStatus::Finalized {
                block_hash: details.block_hash(),
            },
            TxStatus::Error { message } => NodeStatus::Error(message),
            TxStatus::Invalid { message } => NodeStatus::Invalid(message),
            TxStatus::Dropped { message } => NodeStatus::Dropped(message),
        }
    }
}

#[async_trait]
impl NodeClient for SubxtNodeClient {
    async fn next_nonce(&self, account: &AccountId32) -> Result<u64, subxt::Error> {
        // runtime account_nonce reads finalized state and misses pooled transactions
        self.rpc.system_account_next_index(account).await
    }

    async fn sign_and_send(
        &self,
        operation: &Operation,
        signer: &Identity,
        nonce: u64,
    ) -> Result<(H256, StatusStream), subxt::Error> {
        let tx_params = Params::new().nonce(nonce).build();
        let progress = self
            .api
            .tx()
            .sign_and_submit_then_watch(&payload(operation), signer.keypair(), tx_params)
            .await?;

        let hash = progress.extrinsic_hash();
        let statuses = progress
            .map(|status| status.map(NodeStatus::from))
            .boxed();

        Ok((hash, statuses))
    }

    async fn extrinsic_events(
        &self,
        block_hash: H256,
        extrinsic_hash: H256,
    ) -> Result<Vec<ChainEvent>, subxt::Error> {
        let extrinsics = self.api.blocks().at(block_hash).await?.extrinsics().await?;

        let extrinsic = extrinsics
            .iter()
            .find(|ext| ext.hash() == extrinsic_hash)
            .ok_or_else(|| {
                subxt::Error::Other(format!(
                    "extrinsic {extrinsic_hash:?} not found in block {block_hash:?}"
                ))
            })?;

        extrinsic
            .events()
            .await?
            .iter()
            .map(|event| {
                event.map(|event| ChainEvent {
                    pallet: event.pallet_name().to_string(),
                    variant: event.variant_name().to_string(),
                    fields: event.field_bytes().to_vec(),
                })
            })
            .collect()
    }
}
