//! # Feed Relayer
//!
//! Relays blocks of other chains into feeds of a Substrate-based target chain.
//!
//! Every signing identity owns exactly one feed. The feed is created on first use and
//! remembered in a durable registry, so restarts never register a second feed. Blocks
//! are submitted as signed `Feeds.put` transactions in the order they arrive, and each
//! submission is tracked until the target node reports it in a block.

/// Error handling module.
///
/// Defines the crate error type using `snafu`, covering key loading, transport and
/// on-chain failures, feed registration and registry persistence.
pub mod error;

/// Data model: identities, operations, submission requests and outcomes.
pub mod model;

/// The consumed node API and its subxt implementation.
pub mod node_client;

/// Transaction submission module.
///
/// Signs and sends single operations, resolving the nonce at send time, and watches
/// them until inclusion, distinguishing on-chain failures from transport failures.
pub mod tx_submitter;

/// Durable identity → feed registry.
pub mod registry_store;

/// Idempotent, single-flight feed registration.
pub mod feed_registrar;

/// Ordered, bounded-concurrency submission of request streams.
pub mod sequencer;

/// Caller-facing relayer API.
pub mod relayer;

/// Source chain block follower.
pub mod source_chain;

/// Cryptographic signer module.
///
/// Provides functionality for loading substrate keys from disk.
pub mod signer;

#[cfg(test)]
mod mock_node;

#[cfg(test)]
mod test_directory;
