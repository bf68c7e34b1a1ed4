use std::net::SocketAddr;
use std::sync::Arc;

use common_config::load;
use common_obs::{shutdown_signal, ObsInit};
use tokio::net::TcpListener;
use userinfo_svc::config::UserInfoConfig;
use userinfo_svc::{build_router, AppState, SERVICE_NAME};

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = load::<UserInfoConfig>()?;
    let _obs = ObsInit::init_with_log_file(SERVICE_NAME, config.log_file.as_deref())?;

    let addr = config.socket_addr()?;
    tracing::info!(
        event = "service_start",
        service = SERVICE_NAME,
        version = VERSION,
        listen_addr = %addr,
        users_path = %config.users_path.display(),
        tokens_path = %config.tokens_path.display(),
        "starting service"
    );

    let state = Arc::new(AppState::open(&config).await?);
    let router = build_router(state);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    Ok(())
}
