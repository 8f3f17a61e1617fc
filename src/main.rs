use std::net::SocketAddr;
use std::time::Duration;

use exam_proctoring::{
    config::{get_config, init_config, LogFormat},
    routes, AppState,
};
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_config()?;
    let config = get_config();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("exam_proctoring=info,tower_http=info"));
    match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt().with_env_filter(filter).json().init(),
        LogFormat::Pretty => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }

    let app_state = AppState::new()?;

    {
        let hub = app_state.hub.clone();
        let retention = chrono::Duration::seconds(config.session_retention_secs);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(PRUNE_INTERVAL).await;
                let pruned = hub.prune(chrono::Utc::now(), retention);
                if pruned > 0 {
                    info!(pruned, remaining = hub.len(), "pruned finished exam sessions");
                }
            }
        });
    }

    let app = routes::app(app_state, config.student_rps, config.instructor_rps)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = config.server_address.parse()?;
    info!("Proctoring hub listening on {}", addr);
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
