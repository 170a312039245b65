use msgboard_server::{BoardServer, ServerConfig};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::from_env();
    log::info!(
        "Starting msgboard on {} (session capacity {}, heartbeat {}s)",
        config.bind_addr,
        config.session_capacity,
        config.heartbeat_interval_secs
    );

    let server = BoardServer::new(config);
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {e}");
            std::future::pending::<()>().await;
        }
    };

    if let Err(e) = server.run_until(shutdown).await {
        log::error!("Server error: {e}");
        std::process::exit(1);
    }
}
