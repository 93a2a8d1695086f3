//! agentrelay server binary

use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use agentrelay_server::config::ServerArgs;
use agentrelay_server::logging::init_logging;
use agentrelay_server::serve;
use agentrelay_server::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = ServerArgs::parse();
    let logging = init_logging(&args.log_dir(), args.log_format, args.log_stdout)?;

    let state = Arc::new(AppState::new(args.server_config()));
    let listener = TcpListener::bind(args.bind).await?;
    let heartbeat = state.config.heartbeat;
    info!(
        component = "server",
        event = "server.listening",
        addr = %listener.local_addr()?,
        run_id = %logging.run_id,
        auth_required = state.config.auth_token.is_some(),
        ping_interval_secs = heartbeat.ping_interval.as_secs(),
        timeout_multiplier = heartbeat.timeout_multiplier,
        "agentrelay server listening"
    );

    serve(listener, state, shutdown_signal()).await?;

    info!(
        component = "server",
        event = "server.stopped",
        run_id = %logging.run_id,
        "agentrelay server stopped"
    );
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(
            component = "server",
            event = "server.signal.failed",
            error = %err,
            "Failed to listen for ctrl-c"
        );
        std::future::pending::<()>().await;
    }
}
