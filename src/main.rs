use std::path::PathBuf;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use offload_agent::config::{AgentConfig, CONFIG_FILE, EngineConfig};
use offload_agent::engine::TaskEngine;
use offload_agent::exec::ExecutorRegistry;
use offload_agent::session::{self, Registration};
use offload_agent::ws::SideChannel;
use offload_agent::{ollama, sysinfo};

#[derive(Parser)]
#[command(name = "offload-agent", version, about = "Task broker worker agent")]
struct Cli {
    /// Persisted agent record.
    #[arg(long, global = true, env = "OFFLOAD_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Also write daily-rotated logs to this directory.
    #[arg(long, global = true, env = "OFFLOAD_LOG_DIR")]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Register this machine with the broker.
    Register {
        #[arg(long, env = "OFFLOAD_SERVER")]
        server: String,
        /// Registration API key.
        #[arg(long, env = "OFFLOAD_API_KEY")]
        key: String,
        #[arg(long, default_value_t = 5)]
        tier: u8,
        #[arg(long, value_delimiter = ',', default_values = ["debug::echo", "shell::bash"])]
        caps: Vec<String>,
        #[arg(long, default_value_t = 1)]
        capacity: u32,
    },
    /// Authenticate and process tasks until interrupted.
    Serve {
        #[arg(long, env = "OFFLOAD_SERVER")]
        server: Option<String>,
        /// Also keep a websocket side channel open.
        #[arg(long)]
        ws: bool,
    },
    /// Print detected system information.
    Sysinfo,
    /// Print capabilities for locally installed models.
    Ollama,
    /// Authenticate and probe the broker.
    Ping {
        #[arg(long, env = "OFFLOAD_SERVER")]
        server: Option<String>,
    },
}

fn init_tracing(log_dir: Option<&PathBuf>) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "offload-agent.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(
                    tracing_subscriber::fmt::layer()
                        .with_ansi(false)
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage. Err means one is
    // already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cli = Cli::parse();
    let _log_guard = init_tracing(cli.log_dir.as_ref());

    match cli.command {
        Command::Register {
            server,
            key,
            tier,
            caps,
            capacity,
        } => {
            let engine_cfg = EngineConfig::from_env()?;
            let mut capabilities = caps;
            if ollama::ensure_running(&engine_cfg.ollama_url).await {
                capabilities =
                    session::merge_capabilities(capabilities, ollama::model_capabilities().await);
            }

            let mut config = AgentConfig::load(&cli.config);
            let client = session::register(
                Registration {
                    server,
                    api_key: SecretString::from(key),
                    capabilities,
                    tier,
                    capacity,
                },
                &mut config,
            )
            .await
            .context("registration failed")?;
            config
                .save(&cli.config)
                .with_context(|| format!("saving {}", cli.config.display()))?;
            eprintln!("Registered agent {}", config.agent_id.as_deref().unwrap_or("?"));
            eprintln!("   Config: {}", cli.config.display());

            if !client.ping().await {
                bail!("registered, but the broker did not answer the ping");
            }
            eprintln!("   Ping: ok");
        }

        Command::Serve { server, ws } => {
            let engine_cfg = EngineConfig::from_env()?;
            let mut config = AgentConfig::load(&cli.config);
            let server = config.resolve_server(server.as_deref())?;
            config.credentials()?;

            if !ollama::ensure_running(&engine_cfg.ollama_url).await {
                tracing::warn!("Local model service unavailable; LLM tasks will fail");
            }

            let client = session::authenticate(&server, &mut config)
                .await
                .context("authentication failed")?;
            config
                .save(&cli.config)
                .with_context(|| format!("saving {}", cli.config.display()))?;

            eprintln!("Offload agent v{}", env!("CARGO_PKG_VERSION"));
            eprintln!("   Broker: {server}");
            eprintln!("   Runs: {}", engine_cfg.runs_dir().display());

            let _side_channel = match (ws, client.token()) {
                (true, Some(token)) => Some(SideChannel::new(&server, token)?.spawn()),
                _ => None,
            };

            let registry = ExecutorRegistry::builtin(&engine_cfg)?;
            let engine = TaskEngine::new(client, registry, engine_cfg)?;
            tokio::select! {
                () = engine.run() => {}
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("Interrupted, shutting down");
                }
            }
        }

        Command::Sysinfo => {
            let info = sysinfo::collect().await;
            println!("{}", sysinfo::describe(&info));
        }

        Command::Ollama => {
            let caps = ollama::model_capabilities().await;
            if caps.is_empty() {
                println!("No local models found");
            }
            for cap in caps {
                println!("{cap}");
            }
        }

        Command::Ping { server } => {
            let mut config = AgentConfig::load(&cli.config);
            let server = config.resolve_server(server.as_deref())?;
            let client = session::authenticate(&server, &mut config).await?;
            if !client.ping().await {
                bail!("broker at {server} did not answer the ping");
            }
            println!("pong");
        }
    }

    Ok(())
}
