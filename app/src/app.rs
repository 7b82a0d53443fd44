use crate::config::{config_value_parser, NodeConfig};
use crate::devnet::Devnet;
use clap::builder::ArgPredicate;
use clap::Parser;
use eyre::Result;
use futures::pin_mut;
use std::future::Future;
use std::str::FromStr;
use tracing::*;
use tracing_subscriber::{prelude::*, EnvFilter};

#[inline]
pub fn run() -> Result<()> {
    App::parse().run()
}

#[derive(Parser)]
#[command(author, about = "Distributed validator node", long_about = None)]
pub struct App {
    #[arg(
        long = "config",
        value_name = "CONFIG_OR_PATH",
        value_parser = config_value_parser,
        default_value_if("dev", ArgPredicate::IsPresent, Some("dev")),
        required_unless_present = "dev"
    )]
    config: Option<NodeConfig>,

    /// Operators in the local cluster
    #[arg(long, default_value_t = 4)]
    pub nodes: usize,

    /// Validators every operator holds a share of
    #[arg(long, default_value_t = 2)]
    pub validators: usize,

    /// Decided heights seeded on the most advanced node
    #[arg(long, default_value_t = 10)]
    pub heights: u64,

    #[arg(
        long = "full-log-context",
        env = "FULL_LOG_CONTEXT",
        default_value_t = false
    )]
    pub full_log_context: bool,

    #[arg(long)]
    pub dev: bool,

    #[clap(long, help = "Port for the metrics server")]
    pub metrics_port: Option<u16>,
}

impl App {
    pub fn run(self) -> Result<()> {
        self.init_tracing();
        let tokio_runtime = tokio_runtime()?;
        tokio_runtime.block_on(run_until_ctrl_c(self.execute()))?;
        Ok(())
    }

    fn init_tracing(&self) {
        let rust_log_level = std::env::var("RUST_LOG")
            .ok()
            .and_then(|level| Level::from_str(&level).ok())
            .unwrap_or(Level::INFO);

        let filter = if self.full_log_context {
            EnvFilter::builder().parse_lossy(rust_log_level.as_str())
        } else {
            let filter_tag = format!("dv_node={rust_log_level},protocol={rust_log_level}");
            EnvFilter::builder().parse_lossy(filter_tag.as_str())
        };

        let main_layer = tracing_subscriber::fmt::layer().with_target(true);

        let layers = if rust_log_level == Level::DEBUG || rust_log_level == Level::TRACE {
            vec![main_layer
                .with_file(true)
                .with_line_number(true)
                .with_filter(filter)
                .boxed()]
        } else {
            vec![main_layer.with_filter(filter).boxed()]
        };

        tracing_subscriber::registry().with(layers).init();
    }

    async fn execute(self) -> Result<()> {
        let config = self.config.unwrap_or_default();
        info!(
            nodes = self.nodes,
            validators = self.validators,
            mode = ?config.mode,
            "Booting local cluster"
        );

        if self.metrics_port.is_some() {
            crate::metrics::start_server(self.metrics_port).await;
        }

        let devnet = Devnet::new(&config, self.nodes, self.validators);
        devnet.seed(self.heights)?;
        devnet.spawn_dispatchers();
        devnet.start_validators().await?;
        devnet.sync_all().await?;

        if self.metrics_port.is_none() {
            devnet.stop().await;
            return Ok(());
        }

        info!("Cluster synced, serving metrics until interrupted");
        futures::future::pending::<()>().await;
        Ok(())
    }
}

pub fn tokio_runtime() -> Result<tokio::runtime::Runtime, std::io::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
}

async fn run_until_ctrl_c<F, E>(fut: F) -> Result<(), E>
where
    F: Future<Output = Result<(), E>>,
    E: Send + Sync + 'static + From<std::io::Error>,
{
    let ctrl_c = tokio::signal::ctrl_c();

    let mut stream = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let sigterm = stream.recv();
    pin_mut!(sigterm, ctrl_c, fut);

    tokio::select! {
        _ = ctrl_c => {
            info!("Received ctrl-c");
        },
        _ = sigterm => {
            info!("Received SIGTERM");
        },
        res = fut => res?,
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Mode;

    #[test]
    fn dev_flag_selects_dev_config() {
        let app = App::try_parse_from(["dv_node", "--dev"]).unwrap();
        assert_eq!(app.config, Some(NodeConfig::default()));
        assert_eq!(app.nodes, 4);
        assert_eq!(app.validators, 2);
    }

    #[test]
    fn config_is_required_without_dev() {
        assert!(App::try_parse_from(["dv_node"]).is_err());
        let app = App::try_parse_from(["dv_node", "--config", "dev", "--nodes", "7"]).unwrap();
        assert_eq!(app.nodes, 7);
        assert_eq!(app.config.map(|c| c.mode), Some(Mode::ReadWrite));
    }
}
