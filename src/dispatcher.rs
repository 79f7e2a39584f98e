use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::logs::LogPipeline;
use crate::matcher::Route;
use crate::models::{LogRecord, MockConfig, ResponseVariant};
use crate::renderer;
use crate::request::RequestFacts;
use crate::sandbox::ConditionEvaluator;
use crate::selector::{self, Outcome};
use arc_swap::ArcSwap;
use axum::{
    Json, Router,
    extract::{Request, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use http_body_util::BodyExt;
use serde_json::json;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

/// Validated, immutable view of a `MockConfig` that requests evaluate against.
///
/// Reconfiguration swaps in a new snapshot; a request keeps the one it loaded first.
#[derive(Debug)]
pub struct MockSnapshot {
    pub config: MockConfig,
    pub route: Route,
    pub variants: Vec<Arc<ResponseVariant>>,
}

impl MockSnapshot {
    pub fn compile(mut config: MockConfig) -> EngineResult<Self> {
        let route = Route::compile(config.method.clone(), &config.path_pattern)
            .map_err(EngineError::InvalidConfig)?;

        let mut ids = HashSet::new();
        let mut orders = HashSet::new();
        for variant in &config.variants {
            if variant.id.trim().is_empty() {
                return Err(EngineError::InvalidConfig("variant id must not be empty".into()));
            }
            if !ids.insert(variant.id.as_str()) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate variant id {:?}",
                    variant.id
                )));
            }
            if !orders.insert(variant.order) {
                return Err(EngineError::InvalidConfig(format!(
                    "duplicate variant order {} (variant {:?})",
                    variant.order, variant.id
                )));
            }
            if !(100..=599).contains(&variant.status_code) {
                return Err(EngineError::InvalidConfig(format!(
                    "variant {:?} has invalid status code {}",
                    variant.id, variant.status_code
                )));
            }
        }

        config.variants.sort_by_key(|v| v.order);
        let variants = config.variants.iter().cloned().map(Arc::new).collect();
        Ok(Self {
            config,
            route,
            variants,
        })
    }
}

#[derive(Clone)]
pub struct InstanceContext {
    pub node_id: Arc<str>,
    pub instance_id: Uuid,
    pub snapshot: Arc<ArcSwap<MockSnapshot>>,
    pub logs: Arc<LogPipeline>,
    pub evaluator: Arc<dyn ConditionEvaluator>,
}

pub fn router(ctx: InstanceContext) -> Router {
    Router::new().fallback(handle_request).with_state(ctx)
}

struct Served {
    response: Response,
    status: StatusCode,
    matched_variant_id: Option<String>,
    console: Vec<String>,
    error: Option<(ErrorKind, String)>,
    delay: Option<Duration>,
}

impl Served {
    fn failure(
        status: StatusCode,
        kind: ErrorKind,
        message: String,
        body: serde_json::Value,
    ) -> Self {
        Self {
            response: (status, Json(body)).into_response(),
            status,
            matched_variant_id: None,
            console: Vec::new(),
            error: Some((kind, message)),
            delay: None,
        }
    }
}

async fn handle_request(State(ctx): State<InstanceContext>, req: Request) -> Response {
    let started = Instant::now();
    let snapshot = ctx.snapshot.load_full();

    let (parts, body) = req.into_parts();
    let body_bytes = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            tracing::warn!("Failed to read request body on {}: {}", ctx.node_id, e);
            Default::default()
        }
    };
    let facts = RequestFacts::from_parts(&parts, &body_bytes);

    tracing::info!("Incoming request on {}: {} {}", ctx.node_id, facts.method, facts.url);

    let served = serve(&snapshot, facts.clone(), ctx.evaluator.as_ref()).await;
    if let Some(delay) = served.delay {
        tokio::time::sleep(delay).await;
    }

    let elapsed = started.elapsed();
    let outcome = served
        .error
        .as_ref()
        .map(|(kind, _)| kind.as_str())
        .unwrap_or("matched");
    crate::metrics::record_request(&ctx.node_id, outcome, elapsed.as_secs_f64());

    let (error_kind, error_message) = match served.error {
        Some((kind, message)) => (Some(kind), Some(message)),
        None => (None, None),
    };
    ctx.logs.record(LogRecord {
        instance_id: ctx.instance_id,
        node_id: ctx.node_id.to_string(),
        timestamp: chrono::Utc::now(),
        request: facts.summary(),
        matched_variant_id: served.matched_variant_id,
        console_output: served.console,
        error_kind,
        error_message,
        status: served.status.as_u16(),
        duration_ms: elapsed.as_millis() as u64,
    });

    served.response
}

async fn serve(
    snapshot: &MockSnapshot,
    facts: RequestFacts,
    evaluator: &dyn ConditionEvaluator,
) -> Served {
    let Some(route_match) = snapshot.route.matches(&facts.method, &facts.path) else {
        tracing::warn!("No route for {} {}", facts.method, facts.path);
        return Served::failure(
            StatusCode::NOT_FOUND,
            ErrorKind::RouteNotFound,
            format!(
                "{} {} does not match {} {}",
                facts.method,
                facts.path,
                snapshot.config.method,
                snapshot.route.pattern()
            ),
            json!({
                "error": "route not found",
                "request": { "method": facts.method, "path": facts.path }
            }),
        );
    };
    let facts = facts.with_params(route_match.params);

    let selection = selector::select(&snapshot.variants, &facts, evaluator).await;
    let mut served = match selection.outcome {
        Outcome::Matched(variant) => {
            match renderer::render(&variant, &snapshot.config.headers, &facts) {
                Ok(rendered) => {
                    tracing::info!("Matched variant: {}", variant.id);
                    Served {
                        status: rendered.status,
                        response: rendered.into_response(),
                        matched_variant_id: Some(variant.id.clone()),
                        console: Vec::new(),
                        error: None,
                        delay: variant.delay_ms.map(Duration::from_millis),
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to render variant {}: {}", variant.id, e);
                    let mut served = Served::failure(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        ErrorKind::RenderError,
                        e.to_string(),
                        json!({
                            "error": "response rendering failed",
                            "variantId": variant.id,
                        }),
                    );
                    served.matched_variant_id = Some(variant.id.clone());
                    served
                }
            }
        }
        Outcome::NoMatch => Served::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::NoVariantMatched,
            "no response variant condition was satisfied".into(),
            json!({
                "error": "condition not satisfied",
                "message": "no response variant condition was satisfied",
                "evaluated": selection.evaluated,
            }),
        ),
        Outcome::ScriptFailed { variant_id, error } => Served::failure(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorKind::ConditionScriptError,
            error.to_string(),
            json!({
                "error": "script execution failed",
                "message": error.to_string(),
                "variantId": variant_id,
            }),
        ),
    };
    served.console = selection.console;
    served
}
