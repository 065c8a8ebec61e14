use std::net::SocketAddr;
use std::sync::Arc;

use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use secure_audit::audit::recorder::{log_startup_integrity, spawn_integrity_monitor};
use secure_audit::audit::AuditRecorder;
use secure_audit::config::AppConfig;
use secure_audit::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "secure_audit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting secure audit service");

    let config = AppConfig::load()?;

    // One store per process, shared by every request
    let store = Arc::new(config.audit.open_store());
    let recorder = AuditRecorder::new(
        store,
        config.audit.allow_list(),
        config.audit.append_timeout(),
    )
    .with_max_pending(config.audit.max_pending_appends);

    log_startup_integrity(&recorder).await;

    if let Some(every) = config.audit.verify_interval() {
        spawn_integrity_monitor(recorder.clone(), every);
        info!("Audit integrity monitor started (every {:?})", every);
    }

    if !config.audit.enabled {
        info!("Request capture disabled; audit log is verify-only");
    }

    let app = server::router(AppState::new(recorder, config.audit.enabled)).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .into_inner(),
    );

    let addr: SocketAddr = config.bind_address().parse()?;
    info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
