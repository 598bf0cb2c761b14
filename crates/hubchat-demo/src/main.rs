use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::{timeout, Duration};
use tracing::info;
use tracing_subscriber::EnvFilter;

use hubchat_core::{
    chat::{generate_payment_string, PairingInvite},
    harness::{HubConnection, MemoryHub},
    keys::DeviceKeys,
    ChatSession, DeviceConfig, DeviceEvent, DeviceProtocol,
};
use hubchat_crypto::chash;

#[derive(Parser)]
#[command(name = "hubchat-demo")]
#[command(about = "Hub-relayed encrypted device chat, run against an in-memory hub")]
struct Args {
    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a fresh device configuration as TOML
    Keygen {
        #[arg(long)]
        name: String,
        #[arg(long)]
        testnet: bool,
    },
    /// Show the address and invite links of a configured device
    Show {
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
    /// Pair a wallet device with the configured device and exchange messages
    Chat {
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Message delivered to the wallet once it pairs
        #[arg(short, long, default_value = "welcome aboard")]
        message: String,
    },
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<DeviceConfig> {
    match path {
        Some(path) => Ok(DeviceConfig::load_from_file(path)?),
        None => DeviceConfig::load_from_env().or_else(|e| {
            info!(error = %e, "no usable HUBCHAT_* environment, generating a throwaway identity");
            Ok(DeviceConfig::generate("demo service", true))
        }),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("hubchat_demo={0},hubchat_core={0}", args.log_level))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    chash::self_check().context("checksum offset tables")?;

    match args.command {
        Command::Keygen { name, testnet } => {
            let config = DeviceConfig::generate(name, testnet);
            print!("{}", toml::to_string(&config)?);
            Ok(())
        }
        Command::Show { config } => {
            let config = load_config(config.as_ref())?;
            show(&config)
        }
        Command::Chat { config, message } => {
            let config = load_config(config.as_ref())?;
            run_chat(config, message).await
        }
    }
}

fn show(config: &DeviceConfig) -> anyhow::Result<()> {
    let keys = DeviceKeys::from_config(config)?;
    let address = keys.identity.address()?;
    let invite = hubchat_core::chat::invite_string(
        keys.identity.pub_b64(),
        &config.hub_host(),
        config.testnet,
    );
    println!("DEVICE_ADDRESS={address}");
    println!("DEVICE_PUBKEY={}", keys.identity.pub_b64());
    println!("TEMP_PUBKEY={}", keys.current.pub_b64());
    println!("PAIRING_LINK={invite}#0000");
    Ok(())
}

async fn next_event<F>(
    events: &mut broadcast::Receiver<DeviceEvent>,
    pred: F,
) -> anyhow::Result<DeviceEvent>
where
    F: Fn(&DeviceEvent) -> bool,
{
    timeout(Duration::from_secs(10), async {
        loop {
            let event = events.recv().await?;
            if pred(&event) {
                return Ok::<_, broadcast::error::RecvError>(event);
            }
        }
    })
    .await
    .context("timed out waiting for device event")?
    .context("device event stream closed")
}

async fn run_chat(config: DeviceConfig, message: String) -> anyhow::Result<()> {
    let hub = MemoryHub::new();

    // Service side, from configuration
    let (conn, rx) = hub.connect()?;
    let service: Arc<DeviceProtocol<HubConnection>> =
        Arc::new(DeviceProtocol::from_config(conn, &config)?);
    let mut service_events = service.subscribe();
    let chat = ChatSession::start(service.clone(), rx, config.testnet);

    // Wallet side, throwaway keys
    let (conn, rx) = hub.connect()?;
    let wallet = Arc::new(DeviceProtocol::new(
        conn,
        DeviceKeys::generate(),
        config.hub_host(),
        "demo wallet",
    )?);
    let mut wallet_events = wallet.subscribe();
    wallet.start(rx);

    next_event(&mut service_events, |e| matches!(e, DeviceEvent::Ready)).await?;
    next_event(&mut wallet_events, |e| matches!(e, DeviceEvent::Ready)).await?;
    info!(address = %service.address(), "service ready");

    let link = chat.send_after_pairing(message)?;
    println!("PAIRING_LINK={link}");

    let invite = PairingInvite::parse(&link)?;
    let secret = invite.pairing_secret.context("link carries no pairing secret")?;
    wallet
        .send(
            &invite.pubkey,
            "pairing",
            json!({
                "pairing_secret": secret,
                "reverse_pairing_secret": "demo-wallet",
                "device_name": wallet.device_name(),
            }),
        )
        .await?;

    if let DeviceEvent::Pairing(reply) =
        next_event(&mut wallet_events, |e| matches!(e, DeviceEvent::Pairing(_))).await?
    {
        println!("PAIRED_WITH={}", reply.body["device_name"]);
    }
    if let DeviceEvent::Message(msg) =
        next_event(&mut wallet_events, |e| matches!(e, DeviceEvent::Message(_))).await?
    {
        println!("WALLET_RECEIVED={}", msg.body);

        let payments = json!({ "payments": [{ "address": service.address(), "amount": 10000, "asset": "base" }] });
        let payment = generate_payment_string(&payments)?;
        wallet.reply(&msg, json!(format!("[payment](payment:{payment})"))).await?;
    }
    if let DeviceEvent::Message(msg) =
        next_event(&mut service_events, |e| matches!(e, DeviceEvent::Message(_))).await?
    {
        println!("SERVICE_RECEIVED={}", msg.body);
    }

    let stats = service.stats();
    println!(
        "SERVICE_STATS received={} dispatched={} sent={}",
        stats.received, stats.dispatched, stats.sent
    );
    Ok(())
}
