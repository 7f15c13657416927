use std::{convert::Infallible, time::Duration};

use axum::{
    extract::{rejection::JsonRejection, DefaultBodyLimit, Path, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{Stream, StreamExt};
use serde_json::json;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{debug, warn};

use crate::{
    analysis::SubmitOutcome,
    auth::{require_caller, resolve_caller},
    error::AnalysisError,
    models::{AnalysisRequest, Caller},
    rate_limit::RateLimitHeaders,
    AppState,
};

const LEGACY_FORMAT_HEADER: &str = "x-legacy-format";

pub fn router(state: AppState) -> Router {
    let body_limit = state.config.max_body_bytes;
    Router::new()
        .route("/healthz", get(healthz))
        .route("/api/submit/geojson", post(submit_geojson))
        .route("/api/status/{token}", get(get_status))
        .route("/api/status/{token}/stream", get(stream_status))
        .route("/api/analysis-jobs/stats", get(job_stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn healthz() -> impl IntoResponse {
    Json(json!({ "ok": true, "timestamp": Utc::now() }))
}

pub async fn submit_geojson(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Response {
    let caller = match resolve_caller(&headers, &state.config.api_keys) {
        Ok(caller) => caller,
        Err(err) => return err.into_response(),
    };

    let key = rate_limit_key(caller.as_ref(), &headers);
    let decision = state.limiter.check(&key).await;
    if !decision.allowed {
        debug!(client = %key, "Rate limit exceeded");
        let mut response = AnalysisError::RateLimited {
            retry_after_secs: decision.retry_after_secs(),
        }
        .into_response();
        apply_rate_limit_headers(&mut response, &decision.headers);
        return response;
    }

    let mut response = match admit(&state, caller.as_ref(), &headers, payload).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    apply_rate_limit_headers(&mut response, &decision.headers);
    response
}

async fn admit(
    state: &AppState,
    caller: Option<&Caller>,
    headers: &HeaderMap,
    payload: Result<Json<AnalysisRequest>, JsonRejection>,
) -> Result<Response, AnalysisError> {
    let Json(request) = match payload {
        Ok(payload) => payload,
        Err(JsonRejection::JsonDataError(err)) => {
            return Err(AnalysisError::InvalidGeoJson(vec![format!("- {}", err.body_text())]));
        }
        Err(rejection) if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE => {
            warn!("Rejected oversized submission body");
            return Ok(rejection.into_response());
        }
        Err(rejection) => {
            debug!("Unreadable submission body: {}", rejection.body_text());
            return Err(AnalysisError::MissingBody);
        }
    };

    let legacy = headers
        .get(LEGACY_FORMAT_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|value| value.trim().eq_ignore_ascii_case("true"));

    let response = match state.analysis.submit(request, caller, legacy).await? {
        SubmitOutcome::Completed(result) => (StatusCode::OK, Json(result)).into_response(),
        SubmitOutcome::Accepted(accepted) => (StatusCode::ACCEPTED, Json(accepted)).into_response(),
    };
    Ok(response)
}

pub async fn get_status(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Response, AnalysisError> {
    let reply = state.analysis.status(&token).await?;
    Ok((reply.code.http_status(), Json(reply)).into_response())
}

pub async fn stream_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(token): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AnalysisError> {
    resolve_caller(&headers, &state.config.api_keys)?;
    let events = state.analysis.stream_events(&token).await?;

    let stream = events.into_stream().map(|event| {
        let json = serde_json::to_string(&event).unwrap_or_default();
        Ok(Event::default().data(json))
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15))))
}

pub async fn job_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AnalysisError> {
    let caller = require_caller(&headers, &state.config.api_keys)?;
    let stats = state.analysis.stats(&caller.owner).await?;
    Ok(Json(stats).into_response())
}

/// Identified callers are limited per owner, anonymous ones per client
/// address.
fn rate_limit_key(caller: Option<&Caller>, headers: &HeaderMap) -> String {
    if let Some(caller) = caller {
        return format!("owner:{}", caller.owner);
    }
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    let real_ip = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty());
    match forwarded.or(real_ip) {
        Some(addr) => format!("ip:{addr}"),
        None => "anonymous".to_string(),
    }
}

fn apply_rate_limit_headers(response: &mut Response, limits: &RateLimitHeaders) {
    let headers = response.headers_mut();
    headers.insert("x-ratelimit-limit", HeaderValue::from(limits.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(limits.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(limits.reset_seconds));
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::{config::parse_api_keys, job_store::JobStore};
    use axum::{
        body::{to_bytes, Body},
        http::{header, Request},
    };
    use serde_json::Value;
    use std::sync::Arc;
    use tokio_util::{sync::CancellationToken, task::TaskTracker};
    use tower::ServiceExt;

    struct TestApp {
        app: Router,
        _dir: tempfile::TempDir,
    }

    fn test_app(script: &str, max_requests: u32) -> TestApp {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = crate::config::Config {
            work_dir: dir.path().to_path_buf(),
            program: "sh".to_string(),
            program_args: vec!["-c".to_string(), script.to_string(), "analysis".to_string()],
            kill_grace_ms: 100,
            rate_limit_max_requests: max_requests,
            api_keys: parse_api_keys(["secret=alice:2"]).expect("keys"),
            ..crate::config::Config::default()
        };
        let state = AppState::new(
            Arc::new(config),
            JobStore::open_in_memory().expect("store"),
            CancellationToken::new(),
            TaskTracker::new(),
        );
        TestApp {
            app: router(state),
            _dir: dir,
        }
    }

    fn submission(is_async: bool) -> String {
        json!({
            "type": "FeatureCollection",
            "features": [{
                "type": "Feature",
                "geometry": { "type": "Point", "coordinates": [5.1, 52.0] },
                "properties": { "plot_id": "A1" }
            }],
            "analysisOptions": { "async": is_async, "unitType": "ha" }
        })
        .to_string()
    }

    fn post_submit(body: String) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/api/submit/geojson")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body))
            .expect("request")
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).expect("request")
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        serde_json::from_slice(&bytes).expect("json body")
    }

    const WRITE_OK: &str = r#"printf '{"rows":[1]}' > "$2""#;

    #[tokio::test]
    async fn healthz_reports_ok() {
        let t = test_app(WRITE_OK, 30);
        let response = t.app.clone().oneshot(get("/healthz")).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["ok"], json!(true));
    }

    #[tokio::test]
    async fn sync_submission_returns_result_inline() {
        let t = test_app(WRITE_OK, 30);
        let response = t
            .app
            .clone()
            .oneshot(post_submit(submission(false)))
            .await
            .expect("response");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get("x-ratelimit-remaining")
                .and_then(|v| v.to_str().ok()),
            Some("29")
        );
        assert_eq!(body_json(response).await, json!({ "rows": [1] }));
    }

    #[tokio::test]
    async fn async_submission_is_accepted_then_completes() {
        let t = test_app(WRITE_OK, 30);
        let response = t
            .app
            .clone()
            .oneshot(post_submit(submission(true)))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::ACCEPTED);
        let accepted = body_json(response).await;
        let status_url = accepted["statusUrl"].as_str().expect("statusUrl").to_string();
        assert_eq!(accepted["featureCount"], json!(1));

        let mut last = Value::Null;
        for _ in 0..100 {
            let response = t.app.clone().oneshot(get(&status_url)).await.expect("status");
            last = body_json(response).await;
            if last["code"] == json!("analysis_completed") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        assert_eq!(last["code"], json!("analysis_completed"));
        assert_eq!(last["data"], json!({ "rows": [1] }));
    }

    #[tokio::test]
    async fn unknown_api_key_is_unauthorized() {
        let t = test_app(WRITE_OK, 30);
        let mut request = post_submit(submission(false));
        request
            .headers_mut()
            .insert("x-api-key", HeaderValue::from_static("wrong"));
        let response = t.app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["code"], json!("auth_invalid_api_key"));
    }

    #[tokio::test]
    async fn second_request_over_limit_is_throttled() {
        let t = test_app(WRITE_OK, 1);
        let first = t
            .app
            .clone()
            .oneshot(post_submit(submission(false)))
            .await
            .expect("first");
        assert_eq!(first.status(), StatusCode::OK);

        let second = t
            .app
            .clone()
            .oneshot(post_submit(submission(false)))
            .await
            .expect("second");
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        let retry_after: u64 = second
            .headers()
            .get(header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok())
            .expect("retry-after");
        assert!((1..=60).contains(&retry_after));
        assert_eq!(body_json(second).await["code"], json!("auth_rate_limit_exceeded"));
    }

    #[tokio::test]
    async fn malformed_body_is_a_bad_request() {
        let t = test_app(WRITE_OK, 30);
        let response = t
            .app
            .clone()
            .oneshot(post_submit("{not json".to_string()))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            body_json(response).await["code"],
            json!("system_missing_request_body")
        );
    }

    #[tokio::test]
    async fn unknown_token_status_is_not_found() {
        let t = test_app(WRITE_OK, 30);
        let response = t
            .app
            .clone()
            .oneshot(get("/api/status/0b7c1a9e-0000-4c5f-9d55-1b3f8f1c2d3e"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(body_json(response).await["code"], json!("analysis_job_not_found"));
    }

    #[tokio::test]
    async fn stream_for_unknown_token_sends_one_final_event() {
        let t = test_app(WRITE_OK, 30);
        let response = t
            .app
            .clone()
            .oneshot(get("/api/status/missing/stream"))
            .await
            .expect("response");
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .and_then(|v| v.to_str().ok()),
            Some("text/event-stream")
        );
        let bytes = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let text = String::from_utf8_lossy(&bytes);
        let events: Vec<Value> = text
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| serde_json::from_str(data.trim()).expect("event json"))
            .collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["code"], json!("analysis_job_not_found"));
        assert_eq!(events[0]["final"], json!(true));
    }

    #[tokio::test]
    async fn stats_require_an_api_key() {
        let t = test_app(WRITE_OK, 30);
        let response = t
            .app
            .clone()
            .oneshot(get("/api/analysis-jobs/stats"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let mut submit = post_submit(submission(false));
        submit
            .headers_mut()
            .insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer secret"));
        let submitted = t.app.clone().oneshot(submit).await.expect("submit");
        assert_eq!(submitted.status(), StatusCode::OK);

        let mut request = get("/api/analysis-jobs/stats");
        request
            .headers_mut()
            .insert("x-api-key", HeaderValue::from_static("secret"));
        let response = t.app.clone().oneshot(request).await.expect("response");
        assert_eq!(response.status(), StatusCode::OK);
        let stats = body_json(response).await;
        assert_eq!(stats["summary"]["total"], json!(1));
        assert_eq!(stats["statusCounts"]["completed"], json!(1));
        assert_eq!(stats["recentJobs"][0]["resultsAvailable"], json!(true));
    }

    #[test]
    fn anonymous_callers_are_keyed_by_forwarded_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(rate_limit_key(None, &headers), "anonymous");
        headers.insert("x-forwarded-for", HeaderValue::from_static("10.0.0.7, 10.0.0.1"));
        assert_eq!(rate_limit_key(None, &headers), "ip:10.0.0.7");
        let caller = Caller {
            owner: "alice".to_string(),
            max_concurrent_analyses: None,
        };
        assert_eq!(rate_limit_key(Some(&caller), &headers), "owner:alice");
    }
}
