mod agent;
mod config;
mod errors;
mod history;
mod llm;
mod logging;
mod rag;
mod server;
mod session;
mod state;
mod tools;

use std::process::ExitCode;

use anyhow::Context;
use tokio::net::TcpListener;

use crate::config::Settings;
use crate::state::AppState;

#[tokio::main]
async fn main() -> ExitCode {
    let settings = match Settings::from_env() {
        Ok(settings) => settings,
        Err(err) => {
            eprintln!("{}", err);
            return ExitCode::from(1);
        }
    };

    logging::init(std::path::Path::new("./logs"));

    match serve(settings).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("fatal: {:#}", err);
            ExitCode::from(2)
        }
    }
}

async fn serve(settings: Settings) -> anyhow::Result<()> {
    let port = settings.port;
    let state = AppState::initialize(settings).await?;

    let bind_addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("failed to bind to {}", bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    let app = server::router::router(state);
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
