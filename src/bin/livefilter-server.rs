/// LiveFilter sync server
///
/// Standalone hub that relays filter, highlight and pop-out messages
/// between connected sessions over WebSocket.

use livefilter::config::ServerConfig;
use livefilter::server::run_server;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    // HOST and PORT from the environment, with defaults
    let config = ServerConfig::from_env()
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;

    run_server(config).await
}
