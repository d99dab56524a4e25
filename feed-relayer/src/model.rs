//! Data model shared by the submitter, registrar and sequencer.

use std::fmt;

use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use subxt::utils::{AccountId32, H256};
use subxt_signer::sr25519::Keypair;

use crate::error::{MetadataEncodeSnafu, Result};

/// Chain-issued identifier of a feed.
pub type FeedId = u64;

/// Pallet that owns feeds on the target chain.
pub const FEEDS_PALLET: &str = "Feeds";

/// Event emitted by the feeds pallet when a feed is created: `(feed_id, creator)`.
pub const FEED_CREATED_EVENT: &str = "FeedCreated";

/// A signing principal: an sr25519 keypair plus its cached account id and address.
#[derive(Clone)]
pub struct Identity {
    /// Signs transactions.
    keypair: Keypair,
    /// Derived from the keypair's public key.
    account_id: AccountId32,
    /// SS58 form of `account_id`.
    address: String,
}

impl Identity {
    /// Wraps a keypair, deriving its account id and SS58 address once.
    pub fn new(keypair: Keypair) -> Self {
        let account_id = keypair.public_key().to_account_id();
        let address = account_id.to_string();
        Self {
            keypair,
            account_id,
            address,
        }
    }

    /// The keypair used to sign transactions.
    pub fn keypair(&self) -> &Keypair {
        &self.keypair
    }

    /// The on-chain account id of this identity.
    pub fn account_id(&self) -> &AccountId32 {
        &self.account_id
    }

    /// Human-readable SS58 address, used as the registry key and in logs.
    pub fn address(&self) -> &str {
        &self.address
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Identity").field(&self.address).finish()
    }
}

/// A signable operation understood by the target chain.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// `Feeds.create()`.
    CreateFeed,
    /// `Feeds.put(feed_id, data, metadata)`.
    PutData {
        /// Feed the data is appended to.
        feed_id: FeedId,
        /// Opaque block data.
        data: Vec<u8>,
        /// Encoded metadata describing `data`.
        metadata: Vec<u8>,
    },
    /// `Balances.transfer_keep_alive(dest, amount)`.
    Transfer {
        /// Recipient account.
        dest: AccountId32,
        /// Amount in the chain's smallest unit.
        amount: u128,
    },
}

impl Operation {
    /// Short name used in logs and errors.
    pub fn kind(&self) -> &'static str {
        match self {
            Operation::CreateFeed => "feed creation",
            Operation::PutData { .. } => "data submission",
            Operation::Transfer { .. } => "value transfer",
        }
    }
}

/// Metadata attached to every submitted source block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMetadata {
    /// `0x`-prefixed hash of the source block.
    pub hash: String,
    /// Height of the source block.
    pub number: u64,
}

impl BlockMetadata {
    /// Builds metadata for a source block.
    pub fn new(hash: H256, number: u64) -> Self {
        Self {
            hash: format!("{hash:#x}"),
            number,
        }
    }
}

/// One unit of external data to be committed to a feed.
#[derive(Clone, Debug)]
pub struct SubmissionRequest {
    /// Feed the payload belongs to.
    pub feed_id: FeedId,
    /// Encoded source block.
    pub payload: Vec<u8>,
    /// Describes the source block.
    pub metadata: BlockMetadata,
    /// Name of the source chain, for logging.
    pub chain: String,
    /// Signer of the submission.
    pub identity: Identity,
}

impl SubmissionRequest {
    /// Converts the request into the `Feeds.put` operation, JSON-encoding the metadata.
    pub fn operation(&self) -> Result<Operation> {
        Ok(Operation::PutData {
            feed_id: self.feed_id,
            data: self.payload.clone(),
            metadata: serde_json::to_vec(&self.metadata).context(MetadataEncodeSnafu)?,
        })
    }
}

/// An event emitted by an extrinsic, with its fields left SCALE encoded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainEvent {
    /// Pallet that emitted the event.
    pub pallet: String,
    /// Event variant name.
    pub variant: String,
    /// SCALE-encoded event fields.
    pub fields: Vec<u8>,
}

impl ChainEvent {
    /// Whether this event is `pallet.variant`.
    pub fn is(&self, pallet: &str, variant: &str) -> bool {
        self.pallet == pallet && self.variant == variant
    }
}

/// Where and how a transaction was included.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Inclusion {
    /// Block containing the extrinsic.
    pub block_hash: H256,
    /// Hash of the extrinsic.
    pub extrinsic_hash: H256,
    /// Events emitted by the extrinsic, in order.
    pub events: Vec<ChainEvent>,
}

/// Non-terminal progress of a submitted transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxStage {
    /// The signed transaction was handed to the node.
    Sent {
        /// Hash of the extrinsic.
        extrinsic_hash: H256,
        /// Nonce the node computed for it.
        nonce: u64,
    },
    /// The node validated the transaction.
    Validated,
    /// The transaction was gossiped.
    Broadcast {
        /// Number of peers it was sent to.
        num_peers: u32,
    },
    /// The block containing the transaction was retracted.
    Retracted,
}

/// A status notification for one submitted transaction.
///
/// Everything except [`TxOutcome::Pending`] is terminal.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TxOutcome {
    /// Still on its way.
    Pending(TxStage),
    /// Included in a block and executed successfully.
    IncludedInBlock(Inclusion),
    /// Included in a block but execution failed.
    Failed {
        /// Block the failing extrinsic was included in.
        block_hash: H256,
        /// Failure details.
        reason: String,
    },
    /// The node could not be reached, or it rejected the transaction before inclusion.
    TransportError(String),
}

impl TxOutcome {
    /// Whether no further outcomes follow this one.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxOutcome::Pending(_))
    }
}
