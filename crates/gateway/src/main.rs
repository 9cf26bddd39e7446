use std::net::SocketAddr;

use axum::Router;
use axum::http::StatusCode;
use edgeguard_gateway::{config, http};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = match config::GatewayConfig::load() {
        Ok(cfg) => cfg,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let state = match http::AppState::from_config(config.clone()) {
        Ok(state) => state,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };
    let _sweeper = state.spawn_counter_sweeper();

    // Standalone deployments answer guarded traffic directly; embedders pass
    // their own downstream router.
    let downstream = Router::new().fallback(|| async { (StatusCode::OK, "ok") });
    let app = http::router(state, downstream);

    let listener = match tokio::net::TcpListener::bind(config.bind_addr).await {
        Ok(listener) => listener,
        Err(_) => {
            eprintln!("STARTUP_ERROR ERR_BIND_FAILED: failed to bind gateway listener");
            std::process::exit(1);
        }
    };

    tracing::info!(
        bind_addr = %config.bind_addr,
        classifier_url = %config.classifier_url,
        failure_mode = config.classifier_failure_mode.as_str(),
        "edgeguard-gateway listening"
    );

    if let Err(err) = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    {
        eprintln!("STARTUP_ERROR ERR_SERVER_FAILED: {}", err);
        std::process::exit(1);
    }
}
