//! Redis Bridge - command-line front end
//!
//! Runs the prediction filters, the image listener and the broadcast writer
//! against a Redis server (or an in-memory broker for dry runs).
//!
//! # Usage
//!
//! ```bash
//! # Classify two images, 0.5s per reply, keep the input on timeout
//! redis-bridge predict ic cat.jpg dog.jpg -t 0.5 -a passthrough
//!
//! # Print every image a model publishes on "images_in" until Ctrl-C
//! redis-bridge listen --data-type od -i images_in --prefix cam
//!
//! # Publish files as JSON records, images included
//! redis-bridge broadcast *.png --include-image
//!
//! # Show the available plugins
//! redis-bridge list
//! ```

mod input;

use anyhow::{bail, Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use redis_bridge_core::converters::PredictionKind;
use redis_bridge_core::data::DictOptions;
use redis_bridge_core::nodes::{create_default_registry, listen_reader, data_broadcast};
use redis_bridge_core::transport::{InMemoryTransport, PubSubTransport};
use redis_bridge_core::{DataItem, RecordKind};
use serde_json::{Map, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Redis Bridge - request/response over Redis pub/sub
#[derive(Parser)]
#[command(name = "redis-bridge")]
#[command(author, version)]
#[command(about = "Send images to models over Redis pub/sub and collect their replies")]
struct Args {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Message broker to use
    #[arg(long, value_enum, default_value = "redis", global = true)]
    transport: TransportKind,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TransportKind {
    /// Connect to the Redis server given by --redis-host/--redis-port/--redis-db
    Redis,
    /// Process-local broker; nothing answers, useful for checking timeouts
    Memory,
}

/// Options shared by all bridge commands; unset flags leave the config file
/// (or the built-in default) in charge
#[derive(ClapArgs, Default)]
struct BridgeOptions {
    /// Node parameters file (json, yaml or toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Redis host
    #[arg(short = 'H', long)]
    redis_host: Option<String>,

    /// Redis port
    #[arg(short = 'p', long)]
    redis_port: Option<u16>,

    /// Redis database index
    #[arg(short = 'd', long)]
    redis_db: Option<u32>,

    /// Channel to publish on
    #[arg(short = 'o', long)]
    channel_out: Option<String>,

    /// Channel to receive on
    #[arg(short = 'i', long)]
    channel_in: Option<String>,

    /// Seconds to wait for a reply; 0 or less waits forever
    #[arg(short = 't', long, allow_negative_numbers = true)]
    timeout: Option<f64>,

    /// What to do when the timeout expires
    #[arg(short = 'a', long)]
    timeout_action: Option<String>,

    /// Poll interval in seconds while waiting
    #[arg(short = 's', long)]
    sleep_time: Option<f64>,
}

#[derive(Subcommand)]
enum Command {
    /// Send image files to a model and print the predictions as JSON lines
    Predict {
        /// Prediction kind: ic, od, is or dp
        kind: PredictionKind,

        /// Image files, sent in order as one batch
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Segmentation labels, in pixel-value order
        #[arg(long, value_delimiter = ',')]
        labels: Vec<String>,

        /// Reply format (image_format for segmentation, data_format for depth)
        #[arg(long)]
        format: Option<String>,

        #[command(flatten)]
        options: BridgeOptions,
    },

    /// Print images received on the inbound channel as JSON lines
    Listen {
        /// Record kind to produce: ic, od, is or dp
        #[arg(long)]
        data_type: String,

        /// Name prefix for received images
        #[arg(long)]
        prefix: Option<String>,

        #[command(flatten)]
        options: BridgeOptions,
    },

    /// Publish image files as JSON records
    Broadcast {
        /// Image files
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Embed the image bytes (base64)
        #[arg(long)]
        include_image: bool,

        #[command(flatten)]
        options: BridgeOptions,
    },

    /// List the available plugins
    List,
}

impl BridgeOptions {
    /// Config file contents overridden by the flags that were given
    fn params(&self) -> Result<Map<String, Value>> {
        let mut params = match &self.config {
            Some(path) => match redis_bridge_core::config::load_params_file(path)
                .with_context(|| format!("Failed to load config {}", path.display()))?
            {
                Value::Object(map) => map,
                _ => bail!("Config {} must contain a mapping", path.display()),
            },
            None => Map::new(),
        };

        let mut set = |key: &str, value: Option<Value>| {
            if let Some(value) = value {
                params.insert(key.to_string(), value);
            }
        };
        set("redis_host", self.redis_host.clone().map(Value::from));
        set("redis_port", self.redis_port.map(Value::from));
        set("redis_db", self.redis_db.map(Value::from));
        set("channel_out", self.channel_out.clone().map(Value::from));
        set("channel_in", self.channel_in.clone().map(Value::from));
        set("timeout", self.timeout.map(Value::from));
        set("timeout_action", self.timeout_action.clone().map(Value::from));
        set("sleep_time", self.sleep_time.map(Value::from));

        Ok(params)
    }
}

fn print_item(item: &DataItem) -> Result<()> {
    let options = DictOptions {
        source: true,
        metadata: true,
        image: false,
    };
    println!("{}", serde_json::to_string(&item.to_dict(options)?)?);
    Ok(())
}

fn transport(kind: TransportKind) -> Option<Arc<dyn PubSubTransport>> {
    match kind {
        TransportKind::Memory => Some(Arc::new(InMemoryTransport::new())),
        TransportKind::Redis => None,
    }
}

async fn predict(
    transport: Option<Arc<dyn PubSubTransport>>,
    kind: PredictionKind,
    files: Vec<PathBuf>,
    labels: Vec<String>,
    format: Option<String>,
    options: BridgeOptions,
) -> Result<()> {
    let mut params = options.params()?;
    if !labels.is_empty() {
        params.insert("labels".into(), Value::from(labels));
    }
    if let Some(format) = format {
        let key = match kind {
            PredictionKind::Depth => "data_format",
            _ => "image_format",
        };
        params.insert(key.into(), Value::from(format));
    }

    let items = input::load_items(&files, kind.record_kind())?;
    let mut filter = create_default_registry()
        .create_node_with_transport(kind.node_type(), &Value::Object(params), transport)?
        .into_filter()?;

    filter
        .initialize()
        .await
        .with_context(|| format!("Failed to initialize {}", kind.node_type()))?;

    let sent = items.len();
    let results = filter.process(items).await;
    filter.finalize().await?;

    let results = results.context("Prediction failed")?;
    for item in &results {
        print_item(item)?;
    }
    tracing::info!("{} of {} file(s) produced a result", results.len(), sent);
    Ok(())
}

async fn listen(
    transport: Option<Arc<dyn PubSubTransport>>,
    data_type: String,
    prefix: Option<String>,
    options: BridgeOptions,
) -> Result<()> {
    let mut params = options.params()?;
    params.insert("data_type".into(), Value::from(data_type));
    if let Some(prefix) = prefix {
        params.insert("prefix".into(), Value::from(prefix));
    }

    let mut reader = create_default_registry()
        .create_node_with_transport(listen_reader::NODE_TYPE, &Value::Object(params), transport)?
        .into_reader()?;
    reader
        .initialize()
        .await
        .with_context(|| format!("Failed to initialize {}", listen_reader::NODE_TYPE))?;

    let outcome = {
        let mut stream = reader.read()?;
        let ctrl_c = tokio::signal::ctrl_c();
        tokio::pin!(ctrl_c);

        loop {
            tokio::select! {
                _ = &mut ctrl_c => {
                    tracing::info!("Interrupted");
                    break Ok(());
                }
                next = stream.next() => match next {
                    Some(Ok(item)) => print_item(&item)?,
                    Some(Err(e)) if e.is_fatal() => break Err(e),
                    Some(Err(e)) => tracing::warn!("Skipping message: {}", e),
                    None => break Ok(()),
                },
            }
        }
    };

    reader.finalize().await?;
    outcome.context("Listening failed")
}

async fn broadcast(
    transport: Option<Arc<dyn PubSubTransport>>,
    files: Vec<PathBuf>,
    include_image: bool,
    options: BridgeOptions,
) -> Result<()> {
    let mut params = options.params()?;
    if include_image {
        params.insert("include_image".into(), Value::Bool(true));
    }

    let items = input::load_items(&files, RecordKind::ImageClassification)?;
    let mut writer = create_default_registry()
        .create_node_with_transport(data_broadcast::NODE_TYPE, &Value::Object(params), transport)?
        .into_writer()?;

    writer
        .initialize()
        .await
        .with_context(|| format!("Failed to initialize {}", data_broadcast::NODE_TYPE))?;
    let written = writer.write(&items).await;
    writer.finalize().await?;

    written.context("Broadcast failed")?;
    tracing::info!("Broadcast {} file(s)", items.len());
    Ok(())
}

fn list() {
    let registry = create_default_registry();
    for node_type in registry.list_types() {
        if let Some((role, description)) = registry.describe(&node_type) {
            println!("{:<22} {:<7} {}", node_type, role.as_str(), description);
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let filter = match args.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into()))
        .init();

    let transport = transport(args.transport);

    match args.command {
        Command::Predict {
            kind,
            files,
            labels,
            format,
            options,
        } => predict(transport, kind, files, labels, format, options).await?,
        Command::Listen {
            data_type,
            prefix,
            options,
        } => listen(transport, data_type, prefix, options).await?,
        Command::Broadcast {
            files,
            include_image,
            options,
        } => broadcast(transport, files, include_image, options).await?,
        Command::List => list(),
    }

    Ok(())
}
