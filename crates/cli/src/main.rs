use {
    clap::Parser,
    tracing::{error, info},
    tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt},
};

/// Exit codes: 0 on clean shutdown, 2 for configuration problems, 1 for
/// runtime failures (bind, fatal init).
const EXIT_CONFIG: i32 = 2;
const EXIT_RUNTIME: i32 = 1;

#[derive(Parser)]
#[command(name = "pulse", about = "Pulse — realtime fan-out gateway", version)]
struct Cli {
    /// Address to bind to (overrides HOST).
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (overrides PORT).
    #[arg(long)]
    port: Option<u16>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

fn init_tracing(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.clone()));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    // A missing .env is fine; environment variables win either way.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&cli);

    let mut config = match pulse_config::Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(EXIT_CONFIG);
        },
    };
    if let Some(host) = cli.host {
        config.host = host;
    }
    if let Some(port) = cli.port {
        config.port = port;
    }

    info!(
        host = %config.host,
        port = config.port,
        environment = %config.environment,
        "starting pulse gateway"
    );

    if let Err(e) = pulse_gateway::run(config).await {
        error!(error = %e, "gateway failed");
        std::process::exit(EXIT_RUNTIME);
    }
}
