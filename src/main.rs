use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail};
use clap::Parser;
use rand::RngCore;
use sha2::{Digest, Sha512};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use i2tcp::config::NodeConfig;
use i2tcp::{ConnectionEndpoint, ConnectionHandler, ListenerServer, ProtocolVersion};

#[derive(Parser)]
#[command(name = "i2tcp")]
#[command(about = "Authenticated, encrypted framed TCP transport")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, help = "Config file path")]
    config: Option<String>,

    #[arg(long, help = "Listen address (overrides config)")]
    listen: Option<String>,

    #[arg(long, help = "Server address to connect to (overrides config)")]
    connect: Option<String>,

    #[arg(long, help = "Pre-shared key (overrides config)")]
    key: Option<String>,

    #[arg(long, help = "Protocol version: v1, v2 or v3 (overrides config)")]
    protocol: Option<String>,

    #[arg(long, default_value = "i2tcp=info", help = "Log filter when RUST_LOG is unset")]
    log: String,

    #[arg(long, help = "Output as JSON")]
    json: bool,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run an echo server
    Serve,
    /// Send one message and print the reply
    Send {
        message: String,
        #[arg(long, default_value_t = 5000, help = "Reply timeout in milliseconds")]
        timeout_ms: u64,
    },
    /// Round-trip random payloads through an echo server and verify them
    Bench {
        #[arg(long, default_value_t = 10)]
        count: usize,
        #[arg(long, default_value_t = 1024 * 1024)]
        size: usize,
    },
    GenerateConfig {
        #[arg(long, default_value = "i2tcp.toml", help = "Config file path")]
        output: String,
    },
}

fn parse_protocol(value: &str) -> anyhow::Result<ProtocolVersion> {
    match value.to_ascii_lowercase().as_str() {
        "v1" | "1" | "1.3" => Ok(ProtocolVersion::V1),
        "v2" | "2" | "2.1" => Ok(ProtocolVersion::V2),
        "v3" | "3" | "3.0" => Ok(ProtocolVersion::V3),
        other => Err(anyhow!("unknown protocol version '{}'", other)),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if let Commands::GenerateConfig { output } = &cli.command {
        NodeConfig::default().save(output)?;
        if cli.json {
            println!("{}", serde_json::json!({"config": output}));
        } else {
            println!("✅ Generated config file: {}", output);
        }
        return Ok(());
    }

    // Load configuration
    let mut config = NodeConfig::load_or_create(cli.config.as_deref())?;

    // Override config with CLI args if provided
    if let Some(listen) = cli.listen {
        config.server.listen_address = listen;
    }
    if let Some(connect) = cli.connect {
        config.client.address = connect;
    }
    if let Some(key) = cli.key {
        config.server.key = key.clone();
        config.client.key = key;
    }
    if let Some(protocol) = cli.protocol.as_deref() {
        let protocol = parse_protocol(protocol)?;
        config.server.protocol = protocol;
        config.client.protocol = protocol;
    }

    match cli.command {
        Commands::Serve => {
            let server = ListenerServer::new(config.server)?;
            let addr = server.start().await?;
            if !cli.json {
                println!("🔌 Echo server listening on {}", addr);
                if let Some(fingerprint) = server.key_fingerprint() {
                    println!("🔑 Session key fingerprint {}", fingerprint);
                }
            }

            loop {
                tokio::select! {
                    handler = server.get_connection(true) => match handler {
                        Some(handler) => {
                            tokio::spawn(echo(handler));
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        info!("Interrupted, shutting down");
                        break;
                    }
                }
            }

            server.kill().await;
            let metrics = server.metrics();
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                println!("📈 Served {} connection(s), {} message(s) in, {} out",
                         metrics.connections_opened, metrics.messages_received, metrics.messages_sent);
            }
        }
        Commands::Send { message, timeout_ms } => {
            let endpoint = ConnectionEndpoint::new(config.client)?;
            endpoint.connect().await?;
            endpoint.send(message.as_bytes()).await?;

            let reply = endpoint.get(None, Duration::from_millis(timeout_ms)).await;
            endpoint.kill().await;

            match reply {
                Some(reply) => {
                    let text = String::from_utf8_lossy(&reply);
                    if cli.json {
                        println!("{}", serde_json::json!({"reply": text, "bytes": reply.len()}));
                    } else {
                        println!("{}", text);
                    }
                }
                None => bail!("no reply within {} ms", timeout_ms),
            }
        }
        Commands::Bench { count, size } => {
            let endpoint = ConnectionEndpoint::new(config.client)?;
            endpoint.connect().await?;
            if !cli.json {
                println!("🚀 Sending {} payload(s) of {} bytes ({})", count, size,
                         if endpoint.is_secured() { "secured" } else { "authentication only" });
            }

            let started = Instant::now();
            let mut verified = 0usize;
            for round in 0..count {
                let mut payload = vec![0u8; size];
                rand::thread_rng().fill_bytes(&mut payload);
                let digest = Sha512::digest(&payload);

                endpoint.send(&payload).await?;
                match endpoint.get(None, Duration::from_secs(30)).await {
                    Some(echoed) if Sha512::digest(&echoed) == digest => verified += 1,
                    Some(echoed) => warn!("Round {}: echo mismatch ({} bytes back)", round, echoed.len()),
                    None => warn!("Round {}: no echo received", round),
                }
            }
            let elapsed = started.elapsed();
            endpoint.kill().await;

            let throughput = (2 * count * size) as f64 / elapsed.as_secs_f64().max(f64::EPSILON) / (1024.0 * 1024.0);
            if cli.json {
                println!("{}", serde_json::json!({
                    "rounds": count,
                    "verified": verified,
                    "payload_bytes": size,
                    "elapsed_ms": elapsed.as_millis() as u64,
                    "throughput_mib_s": throughput,
                }));
            } else {
                println!("✅ {}/{} round trips verified in {:.2?} ({:.2} MiB/s)", verified, count, elapsed, throughput);
            }
            if verified != count {
                bail!("{} round trip(s) failed verification", count - verified);
            }
        }
        // written before the config is loaded
        Commands::GenerateConfig { .. } => {}
    }

    Ok(())
}

async fn echo(handler: Arc<ConnectionHandler>) {
    let peer = handler.peer_addr();
    while let Some(message) = handler.recv(true).await {
        if let Err(e) = handler.send(&message).await {
            warn!("Echo to {} failed: {}", peer, e);
            break;
        }
    }
    info!("Echo session with {} finished", peer);
}
