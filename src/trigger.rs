//! HTTP trigger for scheduled invocations.
//!
//! `GET`/`POST /run` runs the job once and answers with its outcome. Runs are
//! serialized: a request arriving while a run is in progress waits for it.

use axum::{Router, extract::State, http::StatusCode, routing::get};
use snafu::prelude::*;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::{PipelineError, ServeSnafu};
use crate::pipeline::Pipeline;
use crate::types::RunDate;

type SharedPipeline = Arc<Mutex<Pipeline>>;

/// Router exposing `/run` and `/health`.
pub fn router(pipeline: Pipeline) -> Router {
    Router::new()
        .route("/run", get(run_handler).post(run_handler))
        .route("/health", get(health_handler))
        .with_state(Arc::new(Mutex::new(pipeline)))
}

/// Serve the trigger on `addr` until SIGINT or SIGTERM.
pub async fn serve(addr: SocketAddr, pipeline: Pipeline) -> Result<(), PipelineError> {
    let listener = TcpListener::bind(addr).await.context(ServeSnafu)?;
    info!("Trigger listening on http://{}/run", addr);

    axum::serve(listener, router(pipeline))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context(ServeSnafu)?;

    info!("Trigger stopped");
    Ok(())
}

async fn run_handler(State(pipeline): State<SharedPipeline>) -> (StatusCode, String) {
    let mut pipeline = pipeline.lock().await;
    match pipeline.run(RunDate::today()).await {
        Ok(_) => (StatusCode::OK, "ETL completed".to_string()),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ETL failed: {}", e.message()),
        ),
    }
}

async fn health_handler() -> &'static str {
    "ok\n"
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = interrupt => {
            info!(message = "Signal received.", signal = "SIGINT");
        }
        _ = terminate => {
            info!(message = "Signal received.", signal = "SIGTERM");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::tests::{CountingWarehouse, FixedSource, pipeline};
    use tempfile::TempDir;

    async fn spawn(pipeline: Pipeline) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(pipeline)).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn test_run_reports_success() {
        let temp_dir = TempDir::new().unwrap();
        let warehouse = Arc::new(CountingWarehouse::default());
        let base = spawn(
            pipeline(FixedSource(Ok("[]")), temp_dir.path(), warehouse.clone()).await,
        )
        .await;

        let response = reqwest::Client::new()
            .post(format!("{base}/run"))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(response.text().await.unwrap(), "ETL completed");

        let response = reqwest::get(format!("{base}/run")).await.unwrap();
        assert_eq!(response.status(), 200);
        assert_eq!(warehouse.submitted.lock().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn test_run_reports_failure_message() {
        let temp_dir = TempDir::new().unwrap();
        let warehouse = Arc::new(CountingWarehouse::default());
        let base = spawn(pipeline(FixedSource(Err(502)), temp_dir.path(), warehouse).await).await;

        let response = reqwest::get(format!("{base}/run")).await.unwrap();
        assert_eq!(response.status(), 500);
        let body = response.text().await.unwrap();
        assert!(body.starts_with("ETL failed: Extraction failed"), "{body}");
        assert!(body.contains("HTTP 502"), "{body}");
    }

    #[tokio::test]
    async fn test_health() {
        let temp_dir = TempDir::new().unwrap();
        let warehouse = Arc::new(CountingWarehouse::default());
        let base = spawn(pipeline(FixedSource(Ok("[]")), temp_dir.path(), warehouse).await).await;

        let body = reqwest::get(format!("{base}/health"))
            .await
            .unwrap()
            .text()
            .await
            .unwrap();
        assert_eq!(body, "ok\n");
    }
}
