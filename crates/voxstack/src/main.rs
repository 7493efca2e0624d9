//! `voxstack`: runs a SIP transaction stack with a logging transaction user
//! until Ctrl-C or a `Shutdown` command.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use voxstack::infra_common::{
    log_welcome, setup_logging, StackConfig, TransportConfig, TransportKind,
};
use voxstack::{CommandServer, LoggingTransactionUser, SipStack};

#[derive(Parser, Debug)]
#[command(name = "voxstack", version, about = "SIP transaction and transport stack")]
struct Cli {
    /// TOML stack configuration
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Log as JSON
    #[arg(long)]
    json_logs: bool,

    /// Adds a UDP transport on this port
    #[arg(long)]
    udp: Option<u16>,

    /// Adds a TCP transport on this port
    #[arg(long)]
    tcp: Option<u16>,

    /// Serves XML commands on 127.0.0.1 at this port
    #[arg(long)]
    command_port: Option<u16>,
}

impl Cli {
    fn stack_config(&self) -> anyhow::Result<StackConfig> {
        let mut config = match &self.config {
            Some(path) => StackConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => StackConfig::default(),
        };
        if let Some(level) = &self.log_level {
            config.logging.level = level.clone();
        }
        if self.json_logs {
            config.logging.json = true;
        }
        if let Some(port) = self.udp {
            config.transports.push(TransportConfig::new(TransportKind::Udp, port));
        }
        if let Some(port) = self.tcp {
            config.transports.push(TransportConfig::new(TransportKind::Tcp, port));
        }
        if let Some(port) = self.command_port {
            config.command_server = Some(format!("127.0.0.1:{}", port));
        }
        if config.transports.is_empty() {
            config.transports.push(TransportConfig::new(TransportKind::Udp, 5060));
        }
        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.stack_config()?;

    let logging = config.logging.to_logging_config("voxstack")?;
    setup_logging(&logging)?;
    log_welcome("voxstack", env!("CARGO_PKG_VERSION"));

    let stack = SipStack::builder()
        .config(config.clone())
        .transaction_user(Arc::new(LoggingTransactionUser))
        .dns_runtime(tokio::runtime::Handle::current())
        .start()
        .context("starting stack")?;
    for tuple in stack.transports() {
        info!("listening on {}", tuple);
    }

    let cancel = match &config.command_server {
        Some(addr) => {
            let server = CommandServer::bind(addr, stack.handle()).await?;
            let cancel = server.cancel_token();
            tokio::spawn(async move {
                if let Err(e) = server.serve().await {
                    warn!("command server failed: {:#}", e);
                }
            });
            cancel
        }
        None => CancellationToken::new(),
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("waiting for Ctrl-C")?;
            info!("interrupted");
        }
        _ = cancel.cancelled() => info!("shutdown command received"),
    }
    cancel.cancel();

    stack.shutdown()?;
    tokio::task::spawn_blocking(move || stack.join())
        .await
        .context("joining stack thread")?;
    info!("voxstack stopped");
    Ok(())
}
