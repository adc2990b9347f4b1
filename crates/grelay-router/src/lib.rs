//! HTTP surface of the proxy: routing, inbound authentication, CORS,
//! and response framing.

pub mod auth;
pub mod handlers;

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{header, HeaderValue, Method, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use grelay_core::Pipeline;
use grelay_protocol::error::{ErrorBody, TYPE_AUTHENTICATION};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub auth_password: String,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/v1/chat/completions", post(handlers::openai_chat_completions))
        .route("/v1/models", get(handlers::openai_list_models))
        .route("/v1/models/{*model_action}", post(handlers::gemini_generate))
        .route("/v1beta/models", get(handlers::gemini_list_models))
        .route("/v1beta/models/{*model_action}", post(handlers::gemini_generate))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .merge(protected)
        .layer(cors)
        .with_state(state)
}

async fn require_auth(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if req.method() == Method::OPTIONS {
        return StatusCode::NO_CONTENT.into_response();
    }

    match auth::verify_request(req.headers(), req.uri().query(), &state.auth_password) {
        Ok(()) => next.run(req).await,
        Err(failure) => {
            match failure.attempted {
                Some(masked) => {
                    warn!(credential = %masked, path = %req.uri().path(), "rejected inbound credential")
                }
                None => warn!(path = %req.uri().path(), "request without credentials"),
            }
            unauthorized_response()
        }
    }
}

fn unauthorized_response() -> Response {
    let body = ErrorBody::new(
        "Invalid credentials. Use Bearer token, Basic Auth, 'key' query param, \
         or 'x-goog-api-key' header.",
        TYPE_AUTHENTICATION,
        401,
    );
    let mut response = (StatusCode::UNAUTHORIZED, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::WWW_AUTHENTICATE, HeaderValue::from_static("Basic"));
    response
}
