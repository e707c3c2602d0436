use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};

use crate::engine::{
    error::EngineError,
    judge::Judge,
    metrics::MetricsRegistry,
    models::{RunRequest, RunResult, SubmitRequest, SubmitResult, TestCase},
};

const MAX_CODE_BYTES: usize = 256 * 1024;
const MAX_INPUT_BYTES: usize = 1024 * 1024;
const MAX_TEST_CASES: usize = 128;

#[derive(Clone)]
pub struct AppState {
    judge: Arc<Judge>,
    metrics: Arc<MetricsRegistry>,
}

pub fn routes(judge: Arc<Judge>, metrics_registry: Arc<MetricsRegistry>) -> Router {
    let state = AppState {
        judge,
        metrics: metrics_registry,
    };
    Router::new()
        .route("/healthz", get(health))
        .route("/metrics", get(metrics))
        .route("/v1/run", post(run_code))
        .route("/v1/submit", post(submit_code))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}

async fn metrics(State(state): State<AppState>) -> (StatusCode, String) {
    (StatusCode::OK, state.metrics.render_prometheus())
}

async fn run_code(
    State(state): State<AppState>,
    Json(request): Json<RunRequest>,
) -> Result<Json<RunResult>, EngineError> {
    validate_code(&request.code)?;
    validate_input(&request.input_data)?;
    validate_limits(request.time_limit, request.memory_limit)?;

    let limits = state.judge.limits(request.time_limit, request.memory_limit);
    let output = match state
        .judge
        .run(&request.language, &request.code, &request.input_data, limits)
        .await
    {
        Ok(output) => output,
        Err(err @ EngineError::UnsupportedLanguage(_)) => err.to_string(),
        Err(err) => return Err(err),
    };
    Ok(Json(RunResult { output }))
}

async fn submit_code(
    State(state): State<AppState>,
    Json(request): Json<SubmitRequest>,
) -> Result<Json<SubmitResult>, EngineError> {
    validate_code(&request.code)?;
    validate_test_cases(&request.testcases)?;
    validate_limits(request.time_limit, request.memory_limit)?;

    let limits = state.judge.limits(request.time_limit, request.memory_limit);
    let result = match state
        .judge
        .submit(&request.language, &request.code, &request.testcases, limits)
        .await
    {
        Ok(verdict) => SubmitResult {
            verdict: verdict.to_string(),
            test_case: verdict.failed_test_case(),
            detail: verdict.detail().map(ToString::to_string),
        },
        Err(err @ EngineError::UnsupportedLanguage(_)) => SubmitResult {
            verdict: err.to_string(),
            test_case: None,
            detail: None,
        },
        Err(err) => return Err(err),
    };
    Ok(Json(result))
}

fn validate_code(code: &str) -> Result<(), EngineError> {
    if code.trim().is_empty() {
        return Err(EngineError::InvalidRequest("code is empty".to_string()));
    }
    if code.len() > MAX_CODE_BYTES {
        return Err(EngineError::InvalidRequest("code too large".to_string()));
    }
    Ok(())
}

fn validate_input(input: &str) -> Result<(), EngineError> {
    if input.len() > MAX_INPUT_BYTES {
        return Err(EngineError::InvalidRequest("input too large".to_string()));
    }
    Ok(())
}

fn validate_test_cases(cases: &[TestCase]) -> Result<(), EngineError> {
    if cases.len() > MAX_TEST_CASES {
        return Err(EngineError::InvalidRequest(format!(
            "too many test cases; max is {MAX_TEST_CASES}"
        )));
    }
    for case in cases {
        validate_input(&case.input)?;
        if case.output.len() > MAX_INPUT_BYTES {
            return Err(EngineError::InvalidRequest(
                "expected output too large".to_string(),
            ));
        }
    }
    Ok(())
}

fn validate_limits(time_limit: Option<u64>, memory_limit: Option<u64>) -> Result<(), EngineError> {
    if time_limit == Some(0) || memory_limit == Some(0) {
        return Err(EngineError::InvalidRequest(
            "limits must be greater than zero".to_string(),
        ));
    }
    Ok(())
}
