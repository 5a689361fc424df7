pub mod client;
pub mod config;
pub mod endpoint;
pub mod retransmit;
pub mod server;

use std::sync::Arc;

use config::Config;
use server::CoapServer;

/// In order to let integration tests start the endpoint the same way the
/// binary does, the main function body lives here.
pub async fn server_main(config: Arc<Config>) -> anyhow::Result<()> {
    let server = CoapServer::create_server(
        config.coap.listen,
        config.coap.multicast,
        config.coap.starting_mid,
    )
    .await?;

    tokio::select! {
        _ = server.wait_stopped() => {}
        _ = tokio::signal::ctrl_c() => server.stop(),
    }

    Ok(())
}
