//! HTTP surface
//!
//! - `POST /verify-email` runs a verification
//! - `GET /check-tor` reports whether egress is attested as Tor
//! - `POST /challenge/{attempt_id}` delivers a challenge completion; it
//!   needs the challenge origin and the `challengeKey` of the attempt in
//!   the `X-Challenge-Key` header
//! - `GET /attempts/{attempt_id}` waits for a challenged attempt to finish
//!
//! Every path answers with a JSON body, including malformed requests,
//! unknown routes and handler panics.

use crate::challenge::{AttemptId, ChallengeError};
use crate::outcome::{FailureKind, VerificationResult};
use crate::secret::Secret;
use crate::verifier::{ConnectionVerifier, VerificationAttempt, VerificationRequest};
use axum::extract::rejection::{JsonRejection, StringRejection};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any as AnyOrigin, CorsLayer};
use tracing::{error, info, warn};

/// Carries the completion key on `POST /challenge/{attempt_id}`.
pub const CHALLENGE_KEY_HEADER: &str = "x-challenge-key";

/// Shared handler state.
#[derive(Clone)]
pub struct ApiState {
    pub verifier: ConnectionVerifier,
    /// Upper bound for `GET /attempts/{id}` to wait on an outcome.
    pub outcome_wait: Duration,
}

impl ApiState {
    #[must_use]
    pub const fn new(verifier: ConnectionVerifier) -> Self {
        Self {
            verifier,
            outcome_wait: Duration::from_secs(25),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VerifyBody {
    #[serde(default)]
    email: Option<String>,
    #[serde(default, alias = "password")]
    secret: Option<Secret>,
    #[serde(default)]
    provider: Option<String>,
}

/// Body of every `/verify-email` and `/attempts` answer.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_captcha: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requires_bridge: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt_id: Option<AttemptId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub challenge_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bridge_instructions: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attempt: Option<VerificationAttempt>,
}

impl VerifyResponse {
    fn failure(message: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct StatusBody {
    success: bool,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn status_body(code: StatusCode, success: bool, message: &str, error: Option<String>) -> Response {
    (
        code,
        Json(StatusBody {
            success,
            message: message.to_string(),
            error,
        }),
    )
        .into_response()
}

const fn status_for(kind: FailureKind) -> StatusCode {
    match kind {
        FailureKind::InvalidRequest
        | FailureKind::UnsupportedProvider
        | FailureKind::AuthRejected
        | FailureKind::ChallengeAbandoned
        | FailureKind::Cancelled => StatusCode::BAD_REQUEST,
        FailureKind::Conflict => StatusCode::CONFLICT,
        FailureKind::ProxyUnavailable | FailureKind::BootstrapTimeout => {
            StatusCode::SERVICE_UNAVAILABLE
        }
        FailureKind::ProbeTimeout => StatusCode::GATEWAY_TIMEOUT,
        FailureKind::TransportError => StatusCode::BAD_GATEWAY,
    }
}

fn render(result: VerificationResult) -> (StatusCode, Json<VerifyResponse>) {
    let message = result.message();
    let (code, body) = match result {
        VerificationResult::Success { .. } => (
            StatusCode::OK,
            VerifyResponse {
                success: true,
                message,
                ..VerifyResponse::default()
            },
        ),
        VerificationResult::NeedsChallenge {
            attempt_id,
            url,
            completion_key,
            ..
        } => (
            StatusCode::OK,
            VerifyResponse {
                message,
                requires_captcha: Some(true),
                attempt_id: Some(attempt_id),
                challenge_url: Some(url),
                challenge_key: Some(completion_key),
                ..VerifyResponse::default()
            },
        ),
        VerificationResult::NeedsBridgeSetup { instructions, .. } => (
            StatusCode::OK,
            VerifyResponse {
                message,
                requires_bridge: Some(true),
                bridge_instructions: Some(instructions),
                ..VerifyResponse::default()
            },
        ),
        VerificationResult::Failed { kind, .. } => (
            status_for(kind),
            VerifyResponse::failure(message, kind.to_string()),
        ),
    };
    (code, Json(body))
}

async fn verify_email(
    State(state): State<ApiState>,
    body: Result<Json<VerifyBody>, JsonRejection>,
) -> (StatusCode, Json<VerifyResponse>) {
    let Json(body) = match body {
        Ok(body) => body,
        Err(rejection) => {
            warn!("Rejected verify-email body: {}", rejection);
            return (
                StatusCode::BAD_REQUEST,
                Json(VerifyResponse::failure(
                    "Verification failed",
                    format!("{}: {}", FailureKind::InvalidRequest, rejection.body_text()),
                )),
            );
        }
    };

    let mut request = VerificationRequest::new(
        body.email.unwrap_or_default(),
        body.secret.unwrap_or_default(),
    );
    if let Some(provider) = body.provider.filter(|p| !p.trim().is_empty()) {
        request = request.with_provider_hint(provider);
    }

    render(state.verifier.verify(request).await)
}

async fn check_tor(State(state): State<ApiState>) -> Response {
    let proxy = state.verifier.proxy();
    if let Err(e) = proxy.start().await {
        warn!("Tor check could not start the proxy: {}", e);
        return status_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            false,
            "Failed to check Tor connection",
            Some(e.to_string()),
        );
    }

    if proxy.check_live().await {
        status_body(StatusCode::OK, true, "Connected to Tor network", None)
    } else {
        status_body(StatusCode::OK, false, "Not connected to Tor network", None)
    }
}

async fn complete_challenge(
    State(state): State<ApiState>,
    Path(attempt_id): Path<String>,
    headers: HeaderMap,
    body: Result<String, StringRejection>,
) -> Response {
    let Ok(attempt_id) = attempt_id.parse::<AttemptId>() else {
        return status_body(StatusCode::NOT_FOUND, false, "Unknown attempt", None);
    };
    let Some(origin) = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok()) else {
        return status_body(StatusCode::FORBIDDEN, false, "Missing Origin header", None);
    };
    let body = match body {
        Ok(body) => body,
        Err(rejection) => {
            return status_body(
                StatusCode::BAD_REQUEST,
                false,
                "Invalid completion message",
                Some(rejection.body_text()),
            );
        }
    };

    let key = headers
        .get(CHALLENGE_KEY_HEADER)
        .and_then(|v| v.to_str().ok());

    match state
        .verifier
        .challenges()
        .accept_message(attempt_id, origin, key, &body)
    {
        Ok(true) => status_body(StatusCode::OK, true, "Challenge completed", None),
        Ok(false) => status_body(
            StatusCode::NOT_FOUND,
            false,
            "No pending challenge for this attempt",
            None,
        ),
        Err(e @ ChallengeError::UntrustedOrigin(_)) => {
            status_body(StatusCode::FORBIDDEN, false, "Untrusted origin", Some(e.to_string()))
        }
        Err(e @ ChallengeError::BadKey) => status_body(
            StatusCode::FORBIDDEN,
            false,
            "Invalid completion key",
            Some(e.to_string()),
        ),
        Err(e) => status_body(
            StatusCode::BAD_REQUEST,
            false,
            "Invalid completion message",
            Some(e.to_string()),
        ),
    }
}

async fn attempt_outcome(
    State(state): State<ApiState>,
    Path(attempt_id): Path<String>,
) -> (StatusCode, Json<VerifyResponse>) {
    let not_found = || {
        (
            StatusCode::NOT_FOUND,
            Json(VerifyResponse::failure("Unknown attempt", "not_found")),
        )
    };
    let Ok(attempt_id) = attempt_id.parse::<AttemptId>() else {
        return not_found();
    };

    match tokio::time::timeout(state.outcome_wait, state.verifier.outcome(attempt_id)).await {
        Ok(Some(result)) => render(result),
        Ok(None) => not_found(),
        Err(_) => (
            StatusCode::ACCEPTED,
            Json(VerifyResponse {
                message: "Attempt is still waiting for the challenge".into(),
                attempt_id: Some(attempt_id),
                attempt: state.verifier.attempt_by_id(attempt_id),
                ..VerifyResponse::default()
            }),
        ),
    }
}

async fn not_found() -> Response {
    status_body(StatusCode::NOT_FOUND, false, "Not found", None)
}

async fn method_not_allowed() -> Response {
    status_body(StatusCode::METHOD_NOT_ALLOWED, false, "Method not allowed", None)
}

fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = err
        .downcast_ref::<String>()
        .map(String::as_str)
        .or_else(|| err.downcast_ref::<&str>().copied())
        .unwrap_or("unknown panic");
    error!("Request handler panicked: {}", detail);
    status_body(
        StatusCode::INTERNAL_SERVER_ERROR,
        false,
        "Verification failed",
        Some("internal error".into()),
    )
}

/// All routes, with CORS and panic isolation.
#[must_use]
pub fn router(state: ApiState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AnyOrigin)
        .allow_methods(AnyOrigin)
        .allow_headers(AnyOrigin);

    Router::new()
        .route("/verify-email", post(verify_email))
        .route("/check-tor", get(check_tor))
        .route("/challenge/{attempt_id}", post(complete_challenge))
        .route("/attempts/{attempt_id}", get(attempt_outcome))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(CatchPanicLayer::custom(panic_response))
        .layer(cors)
        .with_state(state)
}

/// Serve the API on `listener` until `shutdown` resolves.
///
/// # Errors
///
/// Returns an error if the listener address cannot be read or the server
/// fails while accepting connections.
pub async fn serve<F>(listener: TcpListener, state: ApiState, shutdown: F) -> std::io::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    info!("Serving onboarding API on {}", listener.local_addr()?);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
}
