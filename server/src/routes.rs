use std::sync::Arc;

use axum::extract::rejection::{JsonRejection, PathRejection};
use axum::extract::{Extension, Path, TypedHeader};
use axum::http::header::HOST;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use ephemeral_paste_common::{
    paste_url, CreatePasteRequest, CreatePasteResponse, ErrorResponse, HealthResponse, PasteView,
    TestNow, Url, HEALTH_ENDPOINT, PASTES_ENDPOINT,
};
use tower_http::trace::TraceLayer;
use tracing::{error, instrument};

use crate::error::PasteError;
use crate::short_code::{ShortCode, SHORT_CODE_SIZE};
use crate::store::PasteStore;
use crate::time::Clock;

/// Everything a request handler needs, built once at startup.
#[derive(Clone)]
pub struct AppState {
    store: PasteStore,
    clock: Arc<dyn Clock>,
    public_url: Option<Url>,
    test_mode: bool,
}

impl AppState {
    pub fn new(
        store: PasteStore,
        clock: Arc<dyn Clock>,
        public_url: Option<Url>,
        test_mode: bool,
    ) -> Self {
        Self {
            store,
            clock,
            public_url,
            test_mode,
        }
    }

    fn now(&self, test_now: Option<TypedHeader<TestNow>>) -> DateTime<Utc> {
        match test_now {
            Some(TypedHeader(TestNow(now))) if self.test_mode => now,
            _ => self.clock.now(),
        }
    }

    fn base_url(&self, headers: &HeaderMap) -> Option<Url> {
        if let Some(url) = &self.public_url {
            return Some(url.clone());
        }

        let host = headers.get(HOST)?.to_str().ok()?;
        let proto = headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("https");
        Url::parse(&format!("{}://{}", proto, host)).ok()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(PASTES_ENDPOINT, post(create))
        .route(
            &format!("{}/:code", PASTES_ENDPOINT),
            get(view::<SHORT_CODE_SIZE>).delete(delete::<SHORT_CODE_SIZE>),
        )
        .route(HEALTH_ENDPOINT, get(health))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

impl IntoResponse for PasteError {
    fn into_response(self) -> Response {
        match self {
            Self::Validation(message) => {
                (StatusCode::BAD_REQUEST, Json(ErrorResponse::new(message))).into_response()
            }
            Self::NotFound => (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse::new("Paste not found")),
            )
                .into_response(),
            Self::Storage(e) => {
                error!("Storage failure: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse::new("Internal server error")),
                )
                    .into_response()
            }
        }
    }
}

#[instrument(skip_all)]
async fn create(
    Extension(state): Extension<AppState>,
    test_now: Option<TypedHeader<TestNow>>,
    headers: HeaderMap,
    body: Result<Json<CreatePasteRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<CreatePasteResponse>), PasteError> {
    let Json(request) = body.map_err(|rejection| match rejection {
        JsonRejection::JsonDataError(e) => PasteError::validation(e.to_string()),
        _ => PasteError::validation("Invalid JSON body"),
    })?;

    let now = state.now(test_now);
    let record = state.store.create_paste(request, now).await?;

    let url = state
        .base_url(&headers)
        .and_then(|base| paste_url(&base, &record.id).ok())
        .map(String::from)
        .unwrap_or_default();

    Ok((
        StatusCode::CREATED,
        Json(CreatePasteResponse { id: record.id, url }),
    ))
}

#[instrument(skip(state, test_now))]
async fn view<const N: usize>(
    Extension(state): Extension<AppState>,
    test_now: Option<TypedHeader<TestNow>>,
    code: Result<Path<ShortCode<N>>, PathRejection>,
) -> Result<Json<PasteView>, PasteError> {
    // Malformed ids get the same answer as unknown ones.
    let Path(code) = code.map_err(|_| PasteError::NotFound)?;
    let now = state.now(test_now);
    state.store.consume(&code.to_string(), now).await.map(Json)
}

#[instrument(skip(state))]
async fn delete<const N: usize>(
    Extension(state): Extension<AppState>,
    code: Result<Path<ShortCode<N>>, PathRejection>,
) -> Result<StatusCode, PasteError> {
    if let Ok(Path(code)) = code {
        state.store.delete(&code.to_string()).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

async fn health(Extension(state): Extension<AppState>) -> (StatusCode, Json<HealthResponse>) {
    match state.store.health().await {
        Ok(()) => (
            StatusCode::OK,
            Json(HealthResponse {
                ok: true,
                error: None,
            }),
        ),
        Err(e) => {
            error!("Health check failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(HealthResponse {
                    ok: false,
                    error: Some("Database connection failed".to_owned()),
                }),
            )
        }
    }
}
