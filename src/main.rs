mod cli;

use clap::Parser;
use cli::{Cli, Commands};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use logbucket::config::Config;
use logbucket::ingest::{self, select_entities};
use logbucket::observability::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    init_tracing(cli.overrides.debug);

    let mut config = match Config::load(cli.overrides.config.clone()) {
        Ok(config) => config,
        Err(e) => fatal(&e, "fix config/logbucket.toml or the LOGBUCKET__* environment"),
    };
    cli.overrides.apply(&mut config);
    if let Err(e) = config.validate() {
        fatal(&e, "check the command-line flags");
    }

    match cli.command {
        Commands::Ls(args) => match select_entities(&config, cli.service, &args.entities) {
            Ok(entities) => {
                for entity in entities {
                    println!("{}", entity.name);
                }
            }
            Err(e) => fatal(&e, e.hint()),
        },
        Commands::Ingest(args) => {
            let cancel = CancellationToken::new();
            tokio::spawn(shutdown_signal(cancel.clone()));

            if let Err(e) = ingest::ingest(&config, cli.service, &args.entities, cancel).await {
                fatal(&e, e.hint());
            }
        }
    }

    Ok(())
}

/// Log `e` with a remediation hint and exit 1
fn fatal(e: &dyn std::error::Error, hint: &str) -> ! {
    error!(error = %e, "{}", hint);
    eprintln!("error: {}\nhint: {}", e, hint);
    std::process::exit(1)
}

/// Cancel `token` on Ctrl+C or SIGTERM
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received, stopping downloaders");
    token.cancel();
}
