//! Follows a source chain and turns its finalized blocks into submission requests.
//!
//! Each finalized block becomes one [`SubmissionRequest`] whose payload is the SCALE
//! encoding of `(header, extrinsics)` and whose metadata is the block's hash and number.
//! The stream ends when the block subscription fails.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use async_stream::stream;
use codec::Encode;
use futures::stream::BoxStream;
use log::{error, info};
use subxt::{OnlineClient, PolkadotConfig};
use url::Url;

use crate::error::Result;
use crate::model::{BlockMetadata, FeedId, Identity, SubmissionRequest};
use crate::node_client::connect;

/// Block of a source chain.
pub type SourceBlock = subxt::blocks::Block<PolkadotConfig, OnlineClient<PolkadotConfig>>;

/// `<name>,<ws url>,<key file>` as given on the command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SourceChainArg {
    /// Name used in logs and reports.
    pub name: String,
    /// RPC url of the source chain.
    pub url: Url,
    /// Secret key file of the identity submitting this chain's blocks.
    pub key_file: PathBuf,
}

impl FromStr for SourceChainArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(',').map(str::trim).collect();
        let [name, url, key_file] = parts.as_slice() else {
            return Err(format!("expected <name>,<url>,<key file>, got '{s}'"));
        };
        if name.is_empty() {
            return Err("source name must not be empty".to_string());
        }

        Ok(Self {
            name: name.to_string(),
            url: url.parse().map_err(|err| format!("invalid url '{url}': {err}"))?,
            key_file: PathBuf::from(key_file),
        })
    }
}

impl fmt::Display for SourceChainArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.url)
    }
}

/// A source chain being relayed into `feed_id` by `identity`.
pub struct SourceChain {
    /// Name used in logs and reports.
    pub name: String,
    /// Connection to the source chain.
    pub api: OnlineClient<PolkadotConfig>,
    /// Signer of the submissions.
    pub identity: Identity,
    /// Feed receiving the blocks.
    pub feed_id: FeedId,
}

impl SourceChain {
    /// Connects to the source chain at `url`.
    pub async fn connect(name: String, url: &Url, identity: Identity, feed_id: FeedId) -> Result<Self> {
        Ok(Self {
            name,
            api: connect(url).await?,
            identity,
            feed_id,
        })
    }

    /// Streams a submission request for every finalized block from now on.
    pub fn follow(self) -> BoxStream<'static, SubmissionRequest> {
        Box::pin(stream! {
            let mut blocks = match self.api.blocks().subscribe_finalized().await {
                Ok(blocks) => blocks,
                Err(err) => {
                    error!("Failed to subscribe to finalized blocks of {}: {}", self.name, err);
                    return;
                }
            };
            info!("Following finalized blocks of {} into feed {}", self.name, self.feed_id);

            while let Some(block) = blocks.next().await {
                let block = match block {
                    Ok(block) => block,
                    Err(err) => {
                        error!("Error receiving block of {}: {}", self.name, err);
                        return;
                    }
                };

                match self.request_for(&block).await {
                    Ok(request) => {
                        yield request;
                    }
                    Err(err) => {
                        error!(
                            "Failed to fetch extrinsics of {} block {}: {}",
                            self.name,
                            block.number(),
                            err
                        );
                        return;
                    }
                }
            }

            info!("Block subscription of {} ended", self.name);
        })
    }

    /// Builds the submission request for one finalized block.
    async fn request_for(&self, block: &SourceBlock) -> Result<SubmissionRequest, subxt::Error> {
        let extrinsics: Vec<Vec<u8>> = block
            .extrinsics()
            .await?
            .iter()
            .map(|ext| ext.bytes().to_vec())
            .collect();

        Ok(SubmissionRequest {
            feed_id: self.feed_id,
            payload: encode_block(block.header(), &extrinsics),
            metadata: BlockMetadata::new(block.hash(), block.number().into()),
            chain: self.name.clone(),
            identity: self.identity.clone(),
        })
    }
}

/// SCALE encoding of a block as `(header, extrinsics)`.
pub fn encode_block<H: Encode>(header: &H, extrinsics: &[Vec<u8>]) -> Vec<u8> {
    (header, extrinsics).encode()
}
