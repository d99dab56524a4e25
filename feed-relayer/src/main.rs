//! feed relayer
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use feed_relayer::model::TxOutcome;
use feed_relayer::node_client::SubxtNodeClient;
use feed_relayer::registry_store::JsonFileRegistryStore;
use feed_relayer::relayer::Relayer;
use feed_relayer::sequencer::SubmissionReport;
use feed_relayer::signer;
use feed_relayer::source_chain::{SourceChain, SourceChainArg};
use futures::StreamExt;
use log::{error, info};
use subxt::utils::AccountId32;
use url::Url;

/// Feed Relayer CLI
#[derive(Parser, Debug)]
#[command(
    name = "feed-relayer",
    version,
    about = "Relays blocks of other chains into feeds of a Substrate chain"
)]
struct Cli {
    /// URL of the Substrate node receiving the feeds (e.g. ws://localhost:9944)
    #[arg(long, env = "TARGET_URL", default_value = "ws://127.0.0.1:9944")]
    target_url: Url,

    /// Path of the JSON file remembering which feed belongs to which identity
    #[arg(long, env = "FEEDS_FILE", default_value = "feeds.json")]
    feeds_file: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Subcommands of the relayer
#[derive(Subcommand, Debug)]
enum Commands {
    /// Relay finalized blocks of one or more source chains
    Run {
        /// Source chain as <name>,<ws url>,<key file>; repeat for several chains
        #[arg(
            long = "source",
            env = "SOURCES",
            value_delimiter = ';',
            required = true
        )]
        sources: Vec<SourceChainArg>,

        /// Maximum number of submissions awaiting inclusion at once
        #[arg(long, env = "MAX_IN_FLIGHT", default_value = "1")]
        max_in_flight: NonZeroUsize,
    },

    /// Print the feed of an identity, registering one if needed
    FeedId {
        /// Hex encoded sr25519 secret key file of the identity
        #[arg(long)]
        key: PathBuf,
    },

    /// Transfer funds, e.g. to pay for a source identity's submissions
    Transfer {
        /// Hex encoded sr25519 secret key file of the sender
        #[arg(long)]
        from: PathBuf,

        /// SS58 address of the recipient
        #[arg(long, value_parser = |s: &str| AccountId32::from_str(s).map_err(|e| format!("{e:?}")))]
        to: AccountId32,

        /// Amount in the chain's smallest unit
        #[arg(long)]
        amount: u128,
    },
}

/// Logs the terminal outcome of one submission.
fn log_report(report: &SubmissionReport) {
    match &report.outcome {
        TxOutcome::IncludedInBlock(inclusion) => info!(
            "📦 {} block {} stored in feed {} (block {:?})",
            report.chain, report.block_number, report.feed_id, inclusion.block_hash
        ),
        TxOutcome::Failed { block_hash, reason } => error!(
            "❌ {} block {} from {} failed on chain in block {:?}: {}",
            report.chain, report.block_number, report.identity, block_hash, reason
        ),
        TxOutcome::TransportError(reason) => error!(
            "❌ {} block {} from {} was not submitted: {}",
            report.chain, report.block_number, report.identity, reason
        ),
        TxOutcome::Pending(stage) => error!(
            "❌ {} block {} from {} stopped at {:?}",
            report.chain, report.block_number, report.identity, stage
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger with fallback to info if RUST_LOG is not set
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    info!("🚀 Starting feed relayer...");

    let client = Arc::new(SubxtNodeClient::connect(&cli.target_url).await?);
    let store = Arc::new(JsonFileRegistryStore::load(&cli.feeds_file).await?);

    match cli.command {
        Commands::Run {
            sources,
            max_in_flight,
        } => {
            let relayer = Relayer::new(client, store, max_in_flight);

            let mut streams = Vec::with_capacity(sources.len());
            for source in sources {
                info!("🔵 Setting up source chain {source}");
                let identity = signer::load_identity(&source.key_file).await?;
                let feed_id = relayer.get_feed_id(&identity).await?;
                let chain = SourceChain::connect(source.name, &source.url, identity, feed_id).await?;
                streams.push(chain.follow());
            }

            let requests = futures::stream::select_all(streams).take_until(async {
                if let Err(err) = tokio::signal::ctrl_c().await {
                    error!("Failed to listen for ctrl-c: {err}");
                    futures::future::pending::<()>().await;
                }
                info!("🛑 Ctrl-C received, finishing in-flight submissions");
            });

            let (handle, mut reports) = relayer.process_submissions(requests);
            let report_logger = tokio::spawn(async move {
                while let Some(report) = reports.recv().await {
                    log_report(&report);
                }
            });

            let summary = handle.join().await?;
            report_logger.await?;
            info!("🏁 Relayer stopped: {summary:?}");
        }
        Commands::FeedId { key } => {
            let relayer = Relayer::new(client, store, NonZeroUsize::MIN);
            let identity = signer::load_identity(&key).await?;
            let feed_id = relayer.get_feed_id(&identity).await?;
            info!("Feed of {} is {feed_id}", identity.address());
            println!("{feed_id}");
        }
        Commands::Transfer { from, to, amount } => {
            let relayer = Relayer::new(client, store, NonZeroUsize::MIN);
            let from = signer::load_identity(&from).await?;
            relayer.send_value_transfer(&from, to, amount).await?;
        }
    }

    Ok(())
}
