//! Condition script execution.
//!
//! Every evaluation gets a fresh QuickJS runtime on its own thread. The script sees a frozen
//! `request` object and a `console` whose writes land in a plain `Vec<String>` handed back
//! to the caller. The runtime's interrupt handler aborts the script once the deadline passes,
//! so an expired evaluation gives its concurrency slot back.

use crate::config::EngineSettings;
use crate::error::ScriptError;
use crate::request::RequestFacts;
use async_trait::async_trait;
use parking_lot::Mutex;
use rquickjs::{CatchResultExt, Context, Function, Runtime};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, oneshot};

const EMIT_GLOBAL: &str = "__scriptmockEmit";
const SANDBOX_STACK_BYTES: usize = 4 * 1024 * 1024;
const MAX_CONSOLE_LINES: usize = 1_000;
/// Slack for a single native call that runs past the deadline between interrupt checks.
const INTERRUPT_GRACE: Duration = Duration::from_millis(100);

/// Verdict of one condition script plus whatever it printed.
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptRun {
    pub verdict: Result<bool, ScriptError>,
    pub console: Vec<String>,
}

impl ScriptRun {
    fn failed(error: ScriptError) -> Self {
        Self {
            verdict: Err(error),
            console: Vec::new(),
        }
    }
}

/// Seam between the variant selector and whatever runs condition scripts.
#[async_trait]
pub trait ConditionEvaluator: Send + Sync {
    async fn evaluate(&self, script: &str, facts: &RequestFacts) -> ScriptRun;
}

#[derive(Debug, Clone, Copy)]
struct Limits {
    timeout: Duration,
    max_script_bytes: usize,
    memory_limit_bytes: usize,
    max_stack_bytes: usize,
}

pub struct Sandbox {
    limits: Limits,
    permits: Arc<Semaphore>,
}

type ConsoleSink = Arc<Mutex<Vec<String>>>;

fn push_console(sink: &ConsoleSink, line: String) {
    let mut lines = sink.lock();
    if lines.len() < MAX_CONSOLE_LINES {
        lines.push(line);
    } else if lines.len() == MAX_CONSOLE_LINES {
        lines.push("[console output truncated]".to_string());
    }
}

impl Sandbox {
    pub fn new(settings: &EngineSettings) -> Self {
        Self {
            limits: Limits {
                timeout: settings.script_timeout,
                max_script_bytes: settings.max_script_bytes,
                memory_limit_bytes: settings.memory_limit_bytes,
                max_stack_bytes: settings.max_stack_bytes,
            },
            permits: Arc::new(Semaphore::new(settings.max_concurrent_scripts.max(1))),
        }
    }
}

#[async_trait]
impl ConditionEvaluator for Sandbox {
    async fn evaluate(&self, script: &str, facts: &RequestFacts) -> ScriptRun {
        if script.len() > self.limits.max_script_bytes {
            return ScriptRun::failed(ScriptError::TooLarge {
                size: script.len(),
                limit: self.limits.max_script_bytes,
            });
        }
        let facts_json = match serde_json::to_string(facts) {
            Ok(json) => json,
            Err(e) => return ScriptRun::failed(ScriptError::Engine(e.to_string())),
        };

        // Waiting for a slot counts against the budget.
        let deadline = Instant::now() + self.limits.timeout;
        let source = build_source(script, &facts_json);
        let sink: ConsoleSink = Arc::default();
        let verdict = spawn_evaluation(
            self.permits.clone(),
            source,
            self.limits,
            deadline,
            sink.clone(),
        )
        .await;
        if let Err(ScriptError::Timeout(budget)) = &verdict {
            tracing::warn!("Condition script exceeded {:?} budget", budget);
        }
        let console = sink.lock().clone();
        ScriptRun { verdict, console }
    }
}

async fn spawn_evaluation(
    permits: Arc<Semaphore>,
    source: String,
    limits: Limits,
    deadline: Instant,
    sink: ConsoleSink,
) -> Result<bool, ScriptError> {
    let wake_at = tokio::time::Instant::from_std(deadline);
    let permit = match tokio::time::timeout_at(wake_at, permits.acquire_owned()).await {
        Ok(Ok(permit)) => permit,
        Ok(Err(e)) => return Err(ScriptError::Engine(e.to_string())),
        Err(_) => return Err(ScriptError::Timeout(limits.timeout)),
    };

    let (tx, rx) = oneshot::channel();
    thread::Builder::new()
        .name("scriptmock-sandbox".into())
        .stack_size(SANDBOX_STACK_BYTES)
        .spawn(move || {
            let verdict = run_script(&source, &limits, deadline, sink);
            drop(permit);
            let _ = tx.send(verdict);
        })
        .map_err(|e| ScriptError::Engine(format!("failed to spawn script thread: {e}")))?;

    match tokio::time::timeout_at(wake_at + INTERRUPT_GRACE, rx).await {
        Ok(Ok(verdict)) => verdict,
        Ok(Err(_)) => Err(ScriptError::Engine(
            "script thread exited without a verdict".into(),
        )),
        Err(_) => Err(ScriptError::Timeout(limits.timeout)),
    }
}

fn run_script(
    source: &str,
    limits: &Limits,
    deadline: Instant,
    sink: ConsoleSink,
) -> Result<bool, ScriptError> {
    let engine = |e: rquickjs::Error| ScriptError::Engine(e.to_string());

    let runtime = Runtime::new().map_err(engine)?;
    runtime.set_memory_limit(limits.memory_limit_bytes);
    runtime.set_max_stack_size(limits.max_stack_bytes);
    let interrupted = Arc::new(AtomicBool::new(false));
    let flag = interrupted.clone();
    runtime.set_interrupt_handler(Some(Box::new(move || {
        let expired = Instant::now() >= deadline;
        if expired {
            flag.store(true, Ordering::Relaxed);
        }
        expired
    })));
    let context = Context::full(&runtime).map_err(engine)?;

    let verdict = context.with(|ctx| {
        let emit = Function::new(ctx.clone(), move |level: String, text: String| {
            if level == "log" {
                push_console(&sink, text);
            } else {
                push_console(&sink, format!("[{level}] {text}"));
            }
        })
        .map_err(engine)?;
        ctx.globals().set(EMIT_GLOBAL, emit).map_err(engine)?;

        ctx.eval::<bool, _>(source)
            .catch(&ctx)
            .map_err(|caught| ScriptError::Thrown(caught.to_string()))
    });

    if interrupted.load(Ordering::Relaxed) {
        return Err(ScriptError::Timeout(limits.timeout));
    }
    verdict
}

/// Wraps the user script as a function body behind the console and request prelude.
fn build_source(script: &str, facts_json: &str) -> String {
    format!(
        r#"(function (emit) {{
  const format = (value) => {{
    if (typeof value === 'string') return value;
    if (value instanceof Error) return String(value);
    if (value !== null && typeof value === 'object') {{
      try {{ return JSON.stringify(value); }} catch (_) {{ return String(value); }}
    }}
    return String(value);
  }};
  const writer = (level) => (...args) => emit(level, args.map(format).join(' '));
  globalThis.console = Object.freeze({{
    log: writer('log'),
    info: writer('info'),
    warn: writer('warn'),
    error: writer('error'),
    debug: writer('debug'),
  }});
}})(globalThis.{EMIT_GLOBAL});
delete globalThis.{EMIT_GLOBAL};
(function () {{
  const freeze = (value) => {{
    if (value !== null && typeof value === 'object') {{
      Object.values(value).forEach(freeze);
      Object.freeze(value);
    }}
    return value;
  }};
  Object.defineProperty(globalThis, 'request', {{
    value: freeze({facts_json}),
    writable: false,
    configurable: false,
    enumerable: true,
  }});
}})();
!!(function (request) {{
{script}
}})(globalThis.request);
"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn sandbox() -> Sandbox {
        Sandbox::new(&EngineSettings {
            script_timeout: Duration::from_secs(5),
            ..EngineSettings::default()
        })
    }

    fn facts() -> RequestFacts {
        RequestFacts {
            method: "GET".into(),
            path: "/mock/users/7".into(),
            url: "/mock/users/7?role=admin".into(),
            raw_query: "role=admin".into(),
            query: BTreeMap::from([("role".to_string(), "admin".to_string())]),
            headers: BTreeMap::from([("x-tenant".to_string(), "acme".to_string())]),
            body: String::new(),
            json: None,
            params: BTreeMap::from([("id".to_string(), "7".to_string())]),
        }
    }

    #[tokio::test]
    async fn returns_truthiness_of_result() {
        let sb = sandbox();
        assert_eq!(sb.evaluate("return true;", &facts()).await.verdict, Ok(true));
        assert_eq!(sb.evaluate("return false;", &facts()).await.verdict, Ok(false));
        assert_eq!(sb.evaluate("return 'yes';", &facts()).await.verdict, Ok(true));
        assert_eq!(sb.evaluate("return 0;", &facts()).await.verdict, Ok(false));
        assert_eq!(sb.evaluate("let x = 1;", &facts()).await.verdict, Ok(false));
    }

    #[tokio::test]
    async fn reads_request_facts() {
        let sb = sandbox();
        let run = sb
            .evaluate(
                "return request.query.role === 'admin' && request.params.id === '7' \
                 && request.headers['x-tenant'] === 'acme' && request.method === 'GET';",
                &facts(),
            )
            .await;
        assert_eq!(run.verdict, Ok(true));
    }

    #[tokio::test]
    async fn request_is_frozen() {
        let sb = sandbox();
        let run = sb
            .evaluate(
                "request.query.role = 'guest'; request.extra = 1; \
                 return request.query.role === 'admin' && request.extra === undefined;",
                &facts(),
            )
            .await;
        assert_eq!(run.verdict, Ok(true));
    }

    #[tokio::test]
    async fn captures_console_in_order() {
        let sb = sandbox();
        let run = sb
            .evaluate(
                "console.log('first', 1); console.warn({a: 1}); console.log('third'); return true;",
                &facts(),
            )
            .await;
        assert_eq!(run.verdict, Ok(true));
        assert_eq!(run.console, vec!["first 1", "[warn] {\"a\":1}", "third"]);
    }

    #[tokio::test]
    async fn thrown_error_keeps_message_and_console() {
        let sb = sandbox();
        let run = sb
            .evaluate(
                "console.log('before'); throw Error('mock-condition-script-error');",
                &facts(),
            )
            .await;
        match run.verdict {
            Err(ScriptError::Thrown(msg)) => assert!(msg.contains("mock-condition-script-error")),
            other => panic!("expected thrown error, got {other:?}"),
        }
        assert_eq!(run.console, vec!["before"]);
    }

    #[tokio::test]
    async fn syntax_error_is_a_script_error() {
        let sb = sandbox();
        let run = sb.evaluate("return (;", &facts()).await;
        assert!(matches!(run.verdict, Err(ScriptError::Thrown(_))));
    }

    #[tokio::test]
    async fn runaway_script_times_out_and_keeps_console() {
        let sb = Sandbox::new(&EngineSettings {
            script_timeout: Duration::from_millis(100),
            ..EngineSettings::default()
        });
        let run = sb.evaluate("console.log('spin'); while (true) {}", &facts()).await;
        assert_eq!(run.verdict, Err(ScriptError::Timeout(Duration::from_millis(100))));
        assert_eq!(run.console, vec!["spin"]);
    }

    #[tokio::test]
    async fn nested_runaway_loops_give_their_slot_back() {
        let sb = Sandbox::new(&EngineSettings {
            script_timeout: Duration::from_millis(200),
            max_concurrent_scripts: 1,
            ..EngineSettings::default()
        });
        let run = sb
            .evaluate("while (true) { for (let i = 0; i < 1000; i++) {} }", &facts())
            .await;
        assert!(matches!(run.verdict, Err(ScriptError::Timeout(_))));

        for _ in 0..3 {
            let run = sb.evaluate("return true;", &facts()).await;
            assert_eq!(run.verdict, Ok(true));
        }
    }

    #[tokio::test]
    async fn unbounded_recursion_is_a_script_error() {
        let sb = sandbox();
        let run = sb
            .evaluate("function f(n) { return f(n + 1); } return f(0);", &facts())
            .await;
        assert!(matches!(run.verdict, Err(ScriptError::Thrown(_))));
    }

    #[tokio::test]
    async fn oversized_script_is_rejected() {
        let sb = Sandbox::new(&EngineSettings {
            max_script_bytes: 16,
            ..EngineSettings::default()
        });
        let run = sb
            .evaluate("return true; // padding past the limit", &facts())
            .await;
        assert!(matches!(run.verdict, Err(ScriptError::TooLarge { .. })));
    }

    #[tokio::test]
    async fn no_host_globals_leak_in() {
        let sb = sandbox();
        let run = sb
            .evaluate(
                "return typeof __scriptmockEmit === 'undefined' && typeof require === 'undefined';",
                &facts(),
            )
            .await;
        assert_eq!(run.verdict, Ok(true));
    }
}
