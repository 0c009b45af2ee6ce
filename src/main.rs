use anyhow::Result;
use clap::Parser;
use probe_agent::{actions, agent, cli, config, logging};
use tokio_util::sync::CancellationToken;

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, "SIGTERM handler unavailable, waiting for ctrl-c only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let args = cli::Args::parse();
    let config = config::Config::load(&args)?;
    let _log_guard = logging::init_tracing(config.log_file.as_deref(), config.logs_max_size)?;

    if args.has_action() {
        return actions::dispatch(&args, &config).await;
    }
    if !config.run {
        return actions::validate(&config);
    }

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        tracing::info!("shutdown signal received");
        signal_cancel.cancel();
    });

    agent::run(config, cancel).await
}
