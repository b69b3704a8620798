//! docbridge CLI - tail or feed the document topic of a Kafka cluster.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use docbridge::broker::KafkaConnector;
use docbridge::{
    logging, BridgeConfig, Deserializer, JsonCodec, OffsetReset, Publisher, RemoteDispatcher,
    Serializer,
};
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "docbridge")]
#[command(about = "Publish documents to, or tail documents from, a Kafka topic")]
#[command(version)]
struct Cli {
    /// TOML configuration file; DOCBRIDGE__* variables override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Bootstrap servers, overriding the configuration
    #[arg(long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print every received document as a `["name", {...}]` JSON line
    Tail(TailArgs),
    /// Publish `["name", {...}]` JSON lines from a file or stdin
    Publish(PublishArgs),
}

#[derive(Args)]
struct TailArgs {
    /// Consumer group
    #[arg(long)]
    group_id: Option<String>,

    /// Start from the earliest retained offset when the group has none
    #[arg(long)]
    from_beginning: bool,
}

#[derive(Args)]
struct PublishArgs {
    /// Input file; reads stdin when omitted
    file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BridgeConfig::load(cli.config.clone().unwrap_or_default())
        .context("failed to load configuration")?;
    if let Some(address) = &cli.address {
        config.publisher.address = address.clone();
        config.dispatcher.address = address.clone();
    }

    logging::init(&config.log_level);
    logging::install_panic_hook();

    match cli.command {
        Commands::Tail(args) => tail(config, args).await,
        Commands::Publish(args) => publish(config, args).await,
    }
}

async fn tail(config: BridgeConfig, args: TailArgs) -> Result<()> {
    let mut dispatcher_config = config.dispatcher;
    if let Some(group_id) = args.group_id {
        dispatcher_config.group_id = group_id;
    }
    if args.from_beginning {
        dispatcher_config.offset_reset = OffsetReset::Earliest;
    }

    let mut remote = RemoteDispatcher::connect(&KafkaConnector::new(), dispatcher_config)
        .await
        .context("failed to connect consumer")?;

    remote.subscribe(|name, document| {
        let line = match JsonCodec.serialize(name, document) {
            Ok(line) => line,
            Err(e) => {
                warn!(%name, error = %e, "Cannot render document");
                return;
            }
        };
        let mut stdout = io::stdout().lock();
        if stdout
            .write_all(&line)
            .and_then(|_| stdout.write_all(b"\n"))
            .is_err()
        {
            warn!("stdout closed");
        }
    });

    let shutdown = remote.shutdown_handle();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("Received shutdown signal (Ctrl+C)");
        }
        shutdown.stop();
    });

    remote.start().await.context("receive loop failed")?;
    Ok(())
}

async fn publish(config: BridgeConfig, args: PublishArgs) -> Result<()> {
    let publisher = Publisher::connect(&KafkaConnector::new(), config.publisher)
        .await
        .context("failed to connect producer")?;

    let reader: Box<dyn BufRead> = match &args.file {
        Some(path) => Box::new(io::BufReader::new(
            std::fs::File::open(path).with_context(|| format!("cannot open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let mut sent = 0usize;
    for (index, line) in reader.lines().enumerate() {
        let line = line.context("failed to read input")?;
        if line.trim().is_empty() {
            continue;
        }
        let (name, document) = JsonCodec
            .deserialize(line.as_bytes())
            .with_context(|| format!("line {} is not a [name, document] pair", index + 1))?;

        if let Err(e) = publisher.publish(name, document).await {
            error!(line = index + 1, %name, error = %e, "Publish failed");
            publisher.close().await?;
            return Err(e.into());
        }
        sent += 1;
    }

    publisher.close().await.context("flush failed")?;
    info!(documents = sent, "Published");
    Ok(())
}
