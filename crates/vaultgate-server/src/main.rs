use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use vaultgate::{AdmissionGate, GateConfig, TracingAuditSink};

#[derive(Parser, Debug)]
#[command(author, version, about = "vaultgate rate-limited API front")]
struct Args {
    #[arg(long, default_value = "127.0.0.1:8080")]
    listen: String,
    /// TOML config file. Flags below override its values.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Bucket capacity and tokens regained per minute, per client.
    #[arg(long)]
    rate_limit_per_minute: Option<u32>,
    /// Forget clients idle for this many seconds.
    #[arg(long)]
    idle_timeout_secs: Option<u64>,
    /// Max tracked clients.
    #[arg(long)]
    max_clients: Option<usize>,
    /// Ignore X-Forwarded-For. Use when no trusted reverse proxy rewrites it.
    #[arg(long)]
    no_trust_forwarded: bool,
    /// HS256 secret for bearer credentials.
    #[arg(long, env = "VAULTGATE_JWT_SECRET", hide_env_values = true)]
    jwt_secret: Option<String>,
}

impl Args {
    fn gate_config(&self) -> Result<GateConfig> {
        let mut config = GateConfig::load_or_default(self.config.as_deref())?;
        if let Some(rate) = self.rate_limit_per_minute {
            config.rate_limit_per_minute = rate;
        }
        if let Some(secs) = self.idle_timeout_secs {
            config.idle_timeout_secs = secs;
        }
        if let Some(max) = self.max_clients {
            config.max_clients = max;
        }
        if self.no_trust_forwarded {
            config.trust_forwarded_header = false;
        }
        if let Some(secret) = &self.jwt_secret {
            config.jwt_secret = Some(secret.clone());
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "vaultgate_server=info,vaultgate=info,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let addr: SocketAddr = args
        .listen
        .parse()
        .with_context(|| format!("invalid --listen {}", args.listen))?;
    let config = args.gate_config().context("invalid configuration")?;

    let gate = AdmissionGate::from_config(&config)?.with_audit_sink(Arc::new(TracingAuditSink));
    let app = vaultgate_server::app::router(Arc::new(gate));

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    let local_addr = listener.local_addr()?;
    tracing::info!(
        "vaultgate listening addr={local_addr} rate={}/min idle_timeout={}s max_clients={} trust_forwarded={} bearer={}",
        config.rate_limit_per_minute,
        config.idle_timeout_secs,
        config.max_clients,
        config.trust_forwarded_header,
        config.jwt_secret.is_some(),
    );

    vaultgate_server::app::serve(listener, app, async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await
    .context("server failed")?;

    Ok(())
}
