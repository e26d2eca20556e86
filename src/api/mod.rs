//! HTTP API over the record store.

pub mod records;
pub mod stats;

use axum::{
    Json,
    Router,
    http::StatusCode,
    response::{
        IntoResponse,
        Response,
    },
    routing,
};
use serde::Serialize;
use tokio::net::{
    TcpListener,
    ToSocketAddrs,
};
use tokio_util::sync::CancellationToken;

use crate::{
    database::Database,
    publisher::Publisher,
};

#[derive(Clone, Debug)]
pub struct Api {
    pub database: Database,
    pub publisher: Option<Publisher>,
    pub shutdown: CancellationToken,
}

impl Api {
    pub fn new(database: Database, publisher: Option<Publisher>) -> Self {
        Self {
            database,
            publisher,
            shutdown: CancellationToken::new(),
        }
    }

    /// Provide a [`CancellationToken`] with which the API can be shut down.
    pub fn with_shutdown(mut self, shutdown: CancellationToken) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn router(&self) -> Router<()> {
        Router::new()
            .nest(
                "/v1",
                Router::new()
                    .route("/records", routing::get(records::get_records))
                    .route("/records/{id}", routing::get(records::get_record))
                    .route(
                        "/records/{id}/publish",
                        routing::post(records::post_publish_record),
                    )
                    .route("/stats", routing::get(stats::get_stats)),
            )
            .fallback(routing::get(not_found))
            .with_state(self.clone())
    }

    pub async fn serve(&self, listen_addresses: impl ToSocketAddrs) -> Result<(), crate::Error> {
        let tcp_listener = TcpListener::bind(listen_addresses).await?;
        let shutdown = self.shutdown.clone();

        axum::serve(tcp_listener, self.router().into_make_service())
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
            })
            .await?;

        Ok(())
    }
}

async fn not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, "not found")
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    error: ErrorResponseInner,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponseInner {
    message: String,
    error: ApiError,
}

impl From<ApiError> for ErrorResponse {
    fn from(value: ApiError) -> Self {
        Self {
            error: ErrorResponseInner {
                message: value.to_string(),
                error: value,
            },
        }
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        (self.error.error.status_code(), Json(self)).into_response()
    }
}

#[derive(Debug, thiserror::Error, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiError {
    #[error("no such record")]
    NotFound,

    #[error("record has no publishable observation")]
    NotPublishable,

    #[error("no publisher configured")]
    PublisherNotConfigured,

    #[error("internal server error")]
    InternalServerError,
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotPublishable => StatusCode::CONFLICT,
            Self::PublisherNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::InternalServerError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<crate::database::Error> for ApiError {
    fn from(value: crate::database::Error) -> Self {
        tracing::error!(?value, "database error");
        Self::InternalServerError
    }
}

impl From<crate::publisher::Error> for ApiError {
    fn from(value: crate::publisher::Error) -> Self {
        tracing::error!(?value, "publisher error");
        Self::InternalServerError
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        ErrorResponse::from(self).into_response()
    }
}
