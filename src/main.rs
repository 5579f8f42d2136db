use clap::Parser;
use keygate::{Config, Server};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "keygate")]
#[command(about = "Multi-tenant key-pooling proxy for AI provider APIs")]
struct Cli {
    #[arg(short, long, help = "Path to configuration file")]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match Config::load_from(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("failed to load configuration: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.logging.level))
        .init();

    info!(
        master = config.is_master,
        kv = %config.kv.backend,
        "starting keygate"
    );

    let server = match Server::new(config).await {
        Ok(server) => server,
        Err(e) => {
            error!("failed to initialize server: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run().await {
        error!("server error: {e}");
        std::process::exit(1);
    }
}
