use std::sync::Arc;

use color_eyre::eyre::{eyre, Result};
use serde_json::json;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use event_walker::config::Config;
use event_walker::provider::{JsonRpcProvider, Provider};
use event_walker::walker::Walker;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config = Config::read()?;
    let provider = Arc::new(JsonRpcProvider::new(&config.rpc)?);

    // without an explicit end, scan up to and including the current tip
    let to_block = match config.scan.to_block {
        Some(to) => to,
        None => provider.block_height().await? + 1,
    };

    if to_block < config.scan.from_block {
        return Err(eyre!(
            "chain tip {} is behind scan.from_block {}",
            to_block.saturating_sub(1),
            config.scan.from_block
        ));
    }

    let walker = Walker::from_config(provider, &config.scan, to_block)?;
    let token = CancellationToken::new();

    info!(
        from = config.scan.from_block,
        to = to_block,
        address = %config.scan.address,
        event = %config.scan.event_name,
        workers = config.scan.workers,
        "starting scan"
    );

    // termination handling. the block being scanned is drained before stopping
    tokio::spawn({
        let token = token.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupted, finishing current block");
                token.cancel();
            }
        }
    });

    let summary = walker.start_traversal_block(token).await;

    for (block, log) in walker.logs().await {
        println!("{}", json!({ "block": block, "log": log }));
    }

    println!("{}", json!({ "summary": summary }));
    info!(?summary, "done");

    Ok(())
}

fn setup() -> Result<()> {
    color_eyre::install()?;

    let filter = EnvFilter::from_default_env();

    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::NEW)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    Ok(())
}
