use clap::Parser;
use log::{error, info};
use server::config::ServerConfig;
use server::network::Server;
use server::world::World;

/// Main-method of the application.
/// Parses command-line arguments, loads every map and serves clients until
/// Ctrl+C.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = ServerConfig::parse();

    let (world, map_tasks) = World::load(&config.data_dir, config.map_inbox)?;
    info!(
        "Loaded {} maps from {}",
        world.map_ids().len(),
        config.data_dir.display()
    );

    let server = Server::new(config, world.clone()).await?;

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down gracefully...");
        }
    }

    world.shutdown().await;
    for task in map_tasks {
        if let Err(e) = task.await {
            error!("Map task panicked: {}", e);
        }
    }

    Ok(())
}
