//! mqtt-session command line client
//!
//! Publishes or subscribes through one managed session, mostly useful for
//! checking a configuration file against a real broker.

use clap::{Parser, Subcommand};
use mqtt_session::observability::{init_default_logging, init_logging, LogFormat};
use mqtt_session::{
    CommandResult, ConnectionState, MqttClient, MqttConfig, MqttMessage, Qos, RumqttEngine,
};
use std::path::PathBuf;
use std::process;
use std::time::Duration;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{error, info, warn, Level};

/// Default config file looked up in the working directory
const DEFAULT_CONFIG: &str = "mqtt-session.toml";

/// How long to wait for the broker to accept the connection
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Serialized MQTT client session
#[derive(Parser)]
#[command(name = "mqtt-session")]
#[command(about = "Publish and subscribe through a managed MQTT session")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Broker URL, used instead of a configuration file
    #[arg(short, long, env = "MQTT_URL", conflicts_with = "config")]
    url: Option<String>,

    /// Client identifier when connecting by URL; generated if omitted
    #[arg(short = 'i', long, default_value = "")]
    client_id: String,

    /// Verbose logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish one message
    Pub {
        #[arg(short, long)]
        topic: String,
        #[arg(short, long)]
        message: String,
        #[arg(
            short,
            long,
            default_value_t = 0,
            value_parser = clap::value_parser!(u8).range(0..=2)
        )]
        qos: u8,
        #[arg(short, long)]
        retain: bool,
    },
    /// Subscribe and print incoming messages
    Sub {
        #[arg(short, long, required = true)]
        topic: Vec<String>,
        #[arg(
            short,
            long,
            default_value_t = 0,
            value_parser = clap::value_parser!(u8).range(0..=2)
        )]
        qos: u8,
        /// Exit after this many messages
        #[arg(short = 'C', long)]
        count: Option<usize>,
    },
    /// Validate the configuration
    Config {
        /// Show the effective configuration
        #[arg(long)]
        show: bool,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    match cli.verbose {
        0 => init_default_logging(),
        1 => init_logging(Level::DEBUG, LogFormat::Compact, false),
        _ => init_logging(Level::TRACE, LogFormat::Compact, true),
    };

    let config = match load_configuration(&cli) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            process::exit(1);
        }
    };

    let result = match cli.command {
        Commands::Pub {
            topic,
            message,
            qos,
            retain,
        } => publish_once(config, topic, message, to_qos(qos), retain).await,
        Commands::Sub { topic, qos, count } => subscribe(config, topic, to_qos(qos), count).await,
        Commands::Config { show } => handle_config_command(config, show),
    };

    if let Err(e) = result {
        error!("Command failed: {}", e);
        process::exit(1);
    }
}

fn to_qos(raw: u8) -> Qos {
    Qos::try_from(raw).unwrap_or_default()
}

fn load_configuration(cli: &Cli) -> Result<MqttConfig, Box<dyn std::error::Error>> {
    if let Some(path) = &cli.config {
        info!("Loading configuration from: {}", path.display());
        return Ok(MqttConfig::load_from_file(path)?);
    }
    if let Some(url) = &cli.url {
        let mut config = MqttConfig::from_url(cli.client_id.clone(), url)?;
        config.resolve_env_vars()?;
        config.validate()?;
        return Ok(config);
    }

    let path = PathBuf::from(DEFAULT_CONFIG);
    if path.exists() {
        info!("Loading configuration from: {}", path.display());
        return Ok(MqttConfig::load_from_file(&path)?);
    }
    Err(format!("no configuration; pass --config, --url or create {DEFAULT_CONFIG}").into())
}

fn check(op: &str, result: CommandResult) -> Result<CommandResult, Box<dyn std::error::Error>> {
    if result.is_success() {
        Ok(result)
    } else {
        Err(format!("{op} failed: {}", result.status).into())
    }
}

async fn wait_connected(
    client: &MqttClient<RumqttEngine>,
) -> Result<(), Box<dyn std::error::Error>> {
    check("connect", client.connect_configured().await?)?;
    tokio::time::timeout(
        CONNECT_TIMEOUT,
        client.wait_for_state(ConnectionState::Connected),
    )
    .await
    .map_err(|_| "timed out waiting for the broker")??;
    Ok(())
}

async fn publish_once(
    config: MqttConfig,
    topic: String,
    message: String,
    qos: Qos,
    retain: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let (acks_tx, mut acks) = mpsc::unbounded_channel();
    let client = MqttClient::builder(config)
        .on_publish(move |mid| {
            let _ = acks_tx.send(mid);
        })
        .build(RumqttEngine::new())?;

    wait_connected(&client).await?;
    let result = check(
        "publish",
        client
            .publish_str(&message, topic.as_str(), qos, retain)
            .await?,
    )?;

    // wait for the broker to finish the QoS flow before disconnecting
    let acked = tokio::time::timeout(CONNECT_TIMEOUT, async {
        while let Some(mid) = acks.recv().await {
            if mid == result.message_id {
                return true;
            }
        }
        false
    })
    .await
    .unwrap_or(false);
    if !acked {
        warn!(mid = result.message_id, "Publish was not acknowledged");
    }

    info!(%topic, mid = result.message_id, "Published");
    client.shutdown().await;
    Ok(())
}

async fn subscribe(
    config: MqttConfig,
    filters: Vec<String>,
    qos: Qos,
    count: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let (messages_tx, mut messages) = mpsc::unbounded_channel::<MqttMessage>();
    let client = MqttClient::builder(config)
        .on_message(move |message| {
            let _ = messages_tx.send(message);
        })
        .on_subscribe(|mid, granted| info!(mid, ?granted, "Subscribed"))
        .on_disconnect(|reason| warn!(%reason, "Connection lost"))
        .build(RumqttEngine::new())?;

    wait_connected(&client).await?;
    check("subscribe", client.subscribe_many(filters, qos).await?)?;

    let mut received = 0usize;
    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Received SIGINT, shutting down gracefully...");
                break;
            }
            message = messages.recv() => {
                let Some(message) = message else { break };
                println!("{} {}", message.topic, message.payload_text());
                received += 1;
                if count.is_some_and(|limit| received >= limit) {
                    break;
                }
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

fn handle_config_command(config: MqttConfig, show: bool) -> Result<(), Box<dyn std::error::Error>> {
    if show {
        let mut shown = config.clone();
        if let Some(credentials) = shown.credentials.as_mut() {
            if credentials.password.is_some() {
                credentials.password = Some("********".to_string());
            }
        }
        if let Some(psk) = shown.psk.as_mut() {
            psk.key = "********".to_string();
        }
        println!("Effective configuration:");
        println!("{}", toml::to_string_pretty(&shown)?);
        if config.client_id.is_empty() {
            println!("client_id is generated for each session");
        }
    }

    info!("Configuration validation complete");
    Ok(())
}
