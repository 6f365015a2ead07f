use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{multipart::MultipartRejection, DefaultBodyLimit, Multipart, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

mod config;
mod extract;
mod filters;
mod models;
mod storage;
#[cfg(test)]
mod test_support;

use config::Config;
use models::{ErrorResponse, ExtractImagesResponse};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let dotenv = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    if let Err(e) = dotenv {
        if !e.not_found() {
            tracing::warn!("ignoring unreadable .env file: {}", e);
        }
    }

    let config = Config::from_env();
    tracing::info!(
        "staging uploads in {}, writing images to {}",
        config.temp_dir.display(),
        config.images_dir.display()
    );

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app(Arc::new(config))).await?;
    Ok(())
}

fn app(config: Arc<Config>) -> Router {
    let body_limit = match config.max_upload_bytes {
        0 => DefaultBodyLimit::disable(),
        max => DefaultBodyLimit::max(max),
    };

    Router::new()
        .route("/health", get(health))
        .route("/upload_pdf/", post(upload_pdf))
        .route("/upload_pdf", post(upload_pdf))
        .layer(body_limit)
        // Any origin, method and header, with credentials.
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(config)
}

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

async fn upload_pdf(
    State(config): State<Arc<Config>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Response {
    let bytes = match multipart {
        Ok(mut multipart) => read_file_field(&mut multipart).await,
        Err(rejection) => Err((StatusCode::UNPROCESSABLE_ENTITY, rejection.body_text())),
    };
    let bytes = match bytes {
        Ok(bytes) => bytes,
        Err((status, detail)) => {
            tracing::warn!("rejected upload ({}): {}", status, detail);
            return (status, Json(ErrorResponse { detail })).into_response();
        }
    };

    match extract::extract_logo(config, bytes).await {
        Ok(url) => {
            let response = ExtractImagesResponse {
                extracted_images: url,
            };
            (StatusCode::OK, Json(response)).into_response()
        }
        Err(e) => {
            // Callers get the same answer whatever went wrong.
            tracing::error!("image extraction failed: {}", e);
            let detail = "Internal Server Error".to_string();
            (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { detail })).into_response()
        }
    }
}

async fn read_file_field(multipart: &mut Multipart) -> Result<Bytes, (StatusCode, String)> {
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| (e.status(), e.body_text()))?
    {
        if field.name() == Some("file") {
            return field.bytes().await.map_err(|e| (e.status(), e.body_text()));
        }
    }
    Err((
        StatusCode::UNPROCESSABLE_ENTITY,
        "missing form field \"file\"".to_string(),
    ))
}
