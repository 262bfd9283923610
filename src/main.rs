use clap::Parser;
use ct_server::config::{self, Args};
use ct_server::state::Server;
use ct_server::{driver, server};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let args = Args::parse();
    let config = config::load(args)?;

    let startup_timestamp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    let port = config.port;
    let server = std::sync::Arc::new(Server::new(config.clone(), startup_timestamp));

    let _handles = driver::start(server.clone(), config).await?;

    let app = server::router(server);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    log::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
