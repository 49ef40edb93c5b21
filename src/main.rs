use actix_web::middleware::{from_fn, Logger};
use actix_web::{web, App, HttpServer};
use anyhow::Context;
use credgate_server::middleware::{enforce_deadline, RequestDeadline};
use credgate_server::{configure, AppState, Settings};
use dotenv::dotenv;
use std::net::TcpListener;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging; RUST_LOG overrides the default level
    FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .init();

    // Load configuration
    let config = Settings::new().context("failed to load configuration")?;
    info!(environment = %config.environment, "Configuration loaded successfully");

    let host = config.server.host.clone();
    let port = config.server.port;
    let workers = config.server.workers as usize;
    let prune_every = config.rate_limit.prune_interval_seconds;
    let deadline = config.request_timeout().map(RequestDeadline);

    // Initialize application state
    let state = AppState::new(config)
        .await
        .context("failed to initialise application state")?;
    let state = web::Data::new(state);

    // Sweep idle rate-limit windows
    if prune_every > 0 {
        let limiter = state.limiter.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(prune_every));
            loop {
                ticker.tick().await;
                let removed = limiter.prune_idle();
                if removed > 0 {
                    debug!(removed, tracked = limiter.tracked_keys(), "pruned idle rate-limit windows");
                }
            }
        });
    }

    let listener = TcpListener::bind(format!("{}:{}", host, port))
        .with_context(|| format!("failed to bind {}:{}", host, port))?;
    info!("Starting server at {}:{}", host, port);

    HttpServer::new(move || {
        let mut app = App::new()
            .wrap(from_fn(enforce_deadline))
            .wrap(Logger::default())
            .app_data(state.clone());
        if let Some(deadline) = deadline {
            app = app.app_data(web::Data::new(deadline));
        }
        app.configure(configure)
    })
    .listen(listener)?
    .workers(workers)
    .run()
    .await
    .context("server terminated with an error")?;

    info!("Server stopped");
    Ok(())
}
