use canvas_sync::{CanvasServer, ServerConfig};
use log::{error, info};

#[tokio::main]
async fn main() {
    env_logger::init();

    let config = ServerConfig::from_env();
    info!(
        "Starting canvas server on {} (endpoint {}, init {:?})",
        config.bind_addr, config.endpoint_path, config.init_format
    );

    let server = CanvasServer::new(config);
    if let Err(e) = server.run().await {
        error!("Canvas server stopped: {e}");
        std::process::exit(1);
    }
}
