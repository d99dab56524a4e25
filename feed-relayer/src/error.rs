use std::path::PathBuf;
use std::sync::Arc;

use snafu::Snafu;

use crate::model::FeedId;

/// Represents errors that can occur while loading keys, talking to the target node,
/// registering feeds and persisting the feed registry.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Error when reading a signing key from a file.
    #[snafu(display("Failed to read signing key from file '{}': {}", path.display(), source))]
    KeyFileRead {
        /// The path of the key file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Error when parsing a signing key from a hexadecimal string.
    #[snafu(display("Failed to parse signing key as hex: {}", source))]
    KeyParse {
        /// The underlying hex parsing error.
        source: hex::FromHexError,
    },

    /// sr25519 secrets must be exactly 32 bytes long.
    #[snafu(display("Invalid key length: expected 32 bytes, got {}", length))]
    InvalidKeyLength {
        /// The actual length of the provided key.
        length: usize,
    },

    /// Error when failing to create a keypair from a secret key.
    #[snafu(display("Failed to create keypair from secret key"))]
    KeypairCreation,

    /// Error when attempting to connect to a node.
    #[snafu(display("Error connecting to chain at {url}: {message}"))]
    ChainConnection {
        /// The RPC url we tried to reach.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// The registry file exists but cannot be trusted.
    ///
    /// This is fatal: without a readable registry the one-feed-per-identity
    /// guarantee cannot be upheld.
    #[snafu(display("Feed registry '{}' is unreadable or corrupt: {reason}", path.display()))]
    StoreCorruption {
        /// Path of the registry file.
        path: PathBuf,
        /// What was wrong with it.
        reason: String,
    },

    /// The registry could not be written. The previous file contents are retained.
    #[snafu(display("Failed to persist feed registry '{}': {}", path.display(), source))]
    StoreWrite {
        /// Path of the registry file.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Error when serializing the registry contents.
    #[snafu(display("Failed to serialize feed registry: {}", source))]
    StoreSerialize {
        /// The underlying serde error.
        source: serde_json::Error,
    },

    /// An identity already maps to a different feed.
    #[snafu(display(
        "Identity {identity} is already registered with feed {existing}, refusing to record feed {attempted}"
    ))]
    FeedConflict {
        /// Address of the identity.
        identity: String,
        /// The feed already on record.
        existing: FeedId,
        /// The feed that was rejected.
        attempted: FeedId,
    },

    /// The node could not be reached or rejected the transaction before inclusion.
    #[snafu(display("Transport error while sending {operation} for {identity}: {message}"))]
    Transport {
        /// Address of the signing identity.
        identity: String,
        /// Kind of operation that was being sent.
        operation: &'static str,
        /// Description of the failure.
        message: String,
    },

    /// The transaction was included in a block but its execution failed.
    #[snafu(display("{operation} from {identity} failed on chain: {reason}"))]
    OnChainFailure {
        /// Address of the signing identity.
        identity: String,
        /// Kind of operation that failed.
        operation: &'static str,
        /// Failure details taken from the emitted events.
        reason: String,
    },

    /// The creation transaction was included but carried no `FeedCreated` event for the signer.
    #[snafu(display("No FeedCreated event for {identity} in block {block_hash}"))]
    FeedCreatedEventMissing {
        /// Address of the signing identity.
        identity: String,
        /// Block the creation was included in.
        block_hash: String,
    },

    /// The `FeedCreated` event did not decode as `(feed_id, creator)`.
    #[snafu(display("Failed to decode FeedCreated event: {}", source))]
    FeedCreatedEventDecode {
        /// The underlying SCALE decoding error.
        source: codec::Error,
    },

    /// A feed was created on chain but could not be recorded.
    ///
    /// The feed exists but is unknown to the registry; record it by hand before retrying,
    /// otherwise a second feed is created.
    #[snafu(display(
        "Feed {feed_id} created for {identity} in block {block_hash} could not be recorded: {source}"
    ))]
    UnrecordedFeed {
        /// Address of the identity.
        identity: String,
        /// The feed that was created.
        feed_id: FeedId,
        /// Block the creation was included in.
        block_hash: String,
        /// Why recording failed.
        source: Box<Error>,
    },

    /// Feed creation did not complete. Nothing was recorded.
    #[snafu(display("Feed registration failed for {identity}: {source}"))]
    RegistrationFailed {
        /// Address of the identity.
        identity: String,
        /// Why the creation failed, shared between all callers waiting on it.
        source: Arc<Error>,
    },

    /// The background creation task panicked or was aborted.
    #[snafu(display("Feed creation task for {identity} did not complete: {source}"))]
    CreationTask {
        /// Address of the identity.
        identity: String,
        /// The underlying join error.
        source: tokio::task::JoinError,
    },

    /// A value transfer did not reach in-block inclusion successfully.
    #[snafu(display("Transfer of {amount} from {from} to {to} failed: {source}"))]
    TransferFailed {
        /// Address of the sender.
        from: String,
        /// Address of the recipient.
        to: String,
        /// Amount in the chain's smallest unit.
        amount: u128,
        /// Transport or on-chain failure.
        source: Box<Error>,
    },

    /// Error when encoding submission metadata.
    #[snafu(display("Failed to encode submission metadata: {}", source))]
    MetadataEncode {
        /// The underlying serde error.
        source: serde_json::Error,
    },

    /// The submission sequencer task panicked or was aborted.
    #[snafu(display("Submission sequencer did not shut down cleanly: {}", source))]
    SequencerTask {
        /// The underlying join error.
        source: tokio::task::JoinError,
    },
}

/// Type alias for results that return a `Result<T, Error>`, simplifying error handling.
pub type Result<T, E = Error> = std::result::Result<T, E>;
