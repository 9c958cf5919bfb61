//! Speak Without Words CLI tools: local pairing demo, advertisement
//! inspection, device identity.

#![forbid(unsafe_code)]

use std::io::Read;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use sww_common::{DeviceId, Payload, ProtocolConfig, SessionAdvertisement, SignalPayload};
use sww_connect::{Clock, ConnectionCoordinator, MemoryMailbox, SystemClock};

#[derive(Parser, Debug)]
#[command(name = "sww")]
#[command(about = "Speak Without Words CLI tools")]
struct Args {
    /// Default log level when RUST_LOG is unset
    #[arg(long, default_value = "warn", env = "SWW_LOG_LEVEL")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Pair two in-process devices over an in-memory relay and exchange a signal
    Demo {
        /// Text the guest sends back
        #[arg(short, long, default_value = "on my way")]
        reply: String,
    },

    /// Validate a QR advertisement payload (reads stdin when omitted)
    Inspect {
        payload: Option<String>,
    },

    /// Show this device's id, creating it on first use
    DeviceId {
        /// Device id file
        #[arg(short, long, env = "SWW_DEVICE_ID_PATH", default_value = "sww-device-id")]
        path: PathBuf,
    },

    /// Show version and cipher suite
    Version,
}

fn main() -> Result<()> {
    let args = Args::parse();
    sww_common::init_tracing_with_default(&args.log_level);

    match args.command {
        Command::Demo { reply } => {
            let config = ProtocolConfig::from_env()?;
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?;
            rt.block_on(demo(config, reply))?;
        }
        Command::Inspect { payload } => {
            let payload = match payload {
                Some(p) => p,
                None => {
                    let mut buf = String::new();
                    std::io::stdin()
                        .read_to_string(&mut buf)
                        .context("reading payload from stdin")?;
                    buf
                }
            };
            inspect(&payload, &ProtocolConfig::from_env()?)?;
        }
        Command::DeviceId { path } => {
            let id = DeviceId::load_or_create(&path)
                .with_context(|| format!("device id at {}", path.display()))?;
            println!("{}", id);
        }
        Command::Version => {
            let suite = sww_crypto::suite();
            println!("sww {}", env!("CARGO_PKG_VERSION"));
            println!(
                "protocol v{} ({})",
                sww_common::PROTOCOL_VERSION,
                sww_common::APP_TAG
            );
            println!("{} / {} / {}", suite.key_agreement, suite.kdf, suite.aead);
        }
    }

    Ok(())
}

fn inspect(payload: &str, config: &ProtocolConfig) -> Result<()> {
    let now = SystemClock.now_ms();
    let ad = SessionAdvertisement::parse(payload)?;
    println!("{}", serde_json::to_string_pretty(&ad)?);

    match ad.validate_freshness(now, config) {
        Ok(()) => println!("valid: session {}", ad.session_code()?),
        Err(e) => println!("rejected: {}", e),
    }
    Ok(())
}

async fn demo(config: ProtocolConfig, reply: String) -> Result<()> {
    let relay = MemoryMailbox::new();
    let host = ConnectionCoordinator::new(relay.clone(), DeviceId::generate()?, config.clone());
    let guest = ConnectionCoordinator::new(relay, DeviceId::generate()?, config);

    let _host_listener = host
        .events()
        .on_payload(|m| println!("host   <- {:?}", m.payload));
    let _guest_listener = guest
        .events()
        .on_payload(|m| println!("guest  <- {:?}", m.payload));

    host.warm_up().await?;
    guest.warm_up().await?;

    let offer = host.create_session().await?;
    println!("session code: {}", offer.session_code);
    println!("qr payload:   {}", offer.payload);

    let connection = guest.connect_with_qr(&offer.payload).await?;
    println!(
        "paired, verification code {}",
        connection.verification_code.as_deref().unwrap_or("-")
    );

    host.send_payload(Payload::Signal(SignalPayload::icon("yes", "👍", "Yes")))
        .await?;
    guest.send_payload(Payload::text(reply)).await?;

    guest.disconnect().await;
    println!("host status after guest left: {:?}", host.status());
    Ok(())
}
