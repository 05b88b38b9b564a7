//! raweb-tunnel: WebSocket tunnel between RAWeb browsers and guacd.

use clap::Parser;
use raweb_tunnel::{App, Config};
use tokio_util::sync::CancellationToken;

mod cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = cli::Cli::parse();

    let filter = std::env::var("RAWEB_LOG")
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .init();

    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    let app = App::new(config);

    match args.command.unwrap_or(cli::Command::Serve) {
        cli::Command::Serve => serve(&app).await?,
        cli::Command::InstallRuntime => {
            app.managed()?.install_runtime().await?;
            println!("guacd runtime installed");
        }
        cli::Command::UninstallRuntime => {
            app.managed()?.uninstall_runtime().await?;
            println!("guacd runtime uninstalled");
        }
        cli::Command::StartDaemon => start_daemon(&app).await?,
        cli::Command::StopDaemon => {
            app.managed()?.terminate_instance().await?;
            println!("guacd stopped");
        }
    }

    Ok(())
}

async fn serve(app: &App) -> anyhow::Result<()> {
    tracing::info!(method = ?app.config.daemon.method, "raweb-tunnel starting");

    let cancel = CancellationToken::new();
    let server = app.server(cancel.clone())?;
    let (listener, _) = server.bind().await?;

    let signal = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        tracing::info!("ctrl-c received, shutting down");
        signal.cancel();
    });

    server.serve(listener).await?;
    app.shutdown().await;
    tracing::info!("raweb-tunnel stopped");
    Ok(())
}

/// The daemon is a child of this process, so it lives as long as we do.
async fn start_daemon(app: &App) -> anyhow::Result<()> {
    let supervisor = app.managed()?;
    supervisor.request_start().await?;
    supervisor
        .wait_until_running(app.config.daemon.ready_timeout())
        .await?;
    println!(
        "guacd {} at {}; press ctrl-c to stop",
        supervisor.state().await,
        supervisor.daemon_addr()
    );
    tokio::signal::ctrl_c().await?;
    app.shutdown().await;
    println!("guacd stopped");
    Ok(())
}
