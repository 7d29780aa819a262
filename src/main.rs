use signal_hub::config::ServerConfig;
use signal_hub::signaling::{OpenAdmission, SignalingServer, TokenAdmission};
use tracing::info;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = ServerConfig::from_env()?;

    println!("   signal-hub");
    println!("   Binding to {}", config.bind_addr);
    println!("   Press Ctrl+C to stop\n");

    let server = match config.token.clone() {
        Some(token) => SignalingServer::bind(config, TokenAdmission::new(token)).await?,
        None => SignalingServer::bind(config, OpenAdmission).await?,
    };

    tokio::select! {
        result = server.run() => result?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }

    Ok(())
}
