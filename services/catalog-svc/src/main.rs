use std::net::SocketAddr;
use std::path::PathBuf;

use catalog_svc::{build_router, DEFAULT_PORT, PORT_ENV, SERVICE_NAME};
use common_config::service_port;
use common_obs::{shutdown_signal, ObsInit};
use tokio::net::TcpListener;

const LOG_FILE_ENV: &str = "CATALOG_LOG_FILE";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let log_file = std::env::var_os(LOG_FILE_ENV).map(PathBuf::from);
    let _obs = ObsInit::init_with_log_file(SERVICE_NAME, log_file.as_deref())?;

    let port = service_port(PORT_ENV, DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(event = "service_start", %addr, service = SERVICE_NAME, "starting service");

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        build_router().into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
