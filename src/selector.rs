use crate::error::ScriptError;
use crate::models::ResponseVariant;
use crate::request::RequestFacts;
use crate::sandbox::ConditionEvaluator;
use futures::stream::{self, TryStreamExt};
use std::sync::Arc;

/// Result of walking an instance's variants for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Matched(Arc<ResponseVariant>),
    NoMatch,
    ScriptFailed {
        variant_id: String,
        error: ScriptError,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub outcome: Outcome,
    /// Console output of every script that ran, in evaluation order.
    pub console: Vec<String>,
    /// Ids of the variants whose condition was consulted.
    pub evaluated: Vec<String>,
}

/// First-match-wins walk over variants already sorted by ascending `order`.
///
/// A script error ends the walk: no later variant is consulted.
pub async fn select(
    variants: &[Arc<ResponseVariant>],
    facts: &RequestFacts,
    evaluator: &dyn ConditionEvaluator,
) -> Selection {
    let walk = stream::iter(variants.iter().map(Ok::<_, Selection>))
        .try_fold(Trail::default(), |trail, variant| {
            step(trail, variant, facts, evaluator)
        })
        .await;
    match walk {
        Ok(trail) => trail.finish(Outcome::NoMatch),
        Err(decided) => decided,
    }
}

/// What the walk has accumulated so far.
#[derive(Default)]
struct Trail {
    console: Vec<String>,
    evaluated: Vec<String>,
}

impl Trail {
    fn finish(self, outcome: Outcome) -> Selection {
        Selection {
            outcome,
            console: self.console,
            evaluated: self.evaluated,
        }
    }
}

/// `Ok` moves on to the next variant, `Err` carries the decided selection.
async fn step(
    mut trail: Trail,
    variant: &Arc<ResponseVariant>,
    facts: &RequestFacts,
    evaluator: &dyn ConditionEvaluator,
) -> Result<Trail, Selection> {
    trail.evaluated.push(variant.id.clone());
    let Some(script) = variant.condition() else {
        tracing::debug!("Variant {} has no condition, matched as default", variant.id);
        return Err(trail.finish(Outcome::Matched(variant.clone())));
    };

    let run = evaluator.evaluate(script, facts).await;
    trail.console.extend(run.console);
    crate::metrics::record_script(&run.verdict);

    match run.verdict {
        Ok(true) => Err(trail.finish(Outcome::Matched(variant.clone()))),
        Ok(false) => {
            tracing::trace!("Variant {} condition not satisfied", variant.id);
            Ok(trail)
        }
        Err(error) => {
            tracing::warn!("Condition script of variant {} failed: {}", variant.id, error);
            Err(trail.finish(Outcome::ScriptFailed {
                variant_id: variant.id.clone(),
                error,
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ScriptRun;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    /// Interprets scripts of the form `<verdict>` / `<verdict>:<console line>`.
    #[derive(Default)]
    struct Scripted {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ConditionEvaluator for Scripted {
        async fn evaluate(&self, script: &str, _facts: &RequestFacts) -> ScriptRun {
            self.calls.lock().push(script.to_string());
            let (verdict, line) = script.split_once(':').unwrap_or((script, ""));
            let console = if line.is_empty() { vec![] } else { vec![line.to_string()] };
            let verdict = match verdict {
                "true" => Ok(true),
                "false" => Ok(false),
                other => Err(ScriptError::Thrown(other.to_string())),
            };
            ScriptRun { verdict, console }
        }
    }

    fn variant(id: &str, order: i64, script: Option<&str>) -> Arc<ResponseVariant> {
        Arc::new(ResponseVariant {
            id: id.into(),
            order,
            condition_script: script.map(str::to_string),
            status_code: 200,
            headers: vec![],
            body: id.into(),
            content_type: None,
            delay_ms: None,
        })
    }

    #[tokio::test]
    async fn first_truthy_wins_and_later_scripts_never_run() {
        let eval = Scripted::default();
        let variants = vec![
            variant("a", 1, Some("false:a-ran")),
            variant("b", 2, Some("true:b-ran")),
            variant("c", 3, Some("true:c-ran")),
        ];
        let sel = select(&variants, &RequestFacts::default(), &eval).await;
        assert_eq!(sel.outcome, Outcome::Matched(variants[1].clone()));
        assert_eq!(sel.console, vec!["a-ran", "b-ran"]);
        assert_eq!(sel.evaluated, vec!["a", "b"]);
        assert_eq!(eval.calls.lock().len(), 2);
    }

    #[tokio::test]
    async fn script_error_is_fail_fast() {
        let eval = Scripted::default();
        let variants = vec![
            variant("a", 1, Some("boom:a-ran")),
            variant("b", 2, None),
        ];
        let sel = select(&variants, &RequestFacts::default(), &eval).await;
        assert_eq!(
            sel.outcome,
            Outcome::ScriptFailed {
                variant_id: "a".into(),
                error: ScriptError::Thrown("boom".into()),
            }
        );
        assert_eq!(sel.console, vec!["a-ran"]);
        assert_eq!(sel.evaluated, vec!["a"]);
    }

    #[tokio::test]
    async fn all_falsy_is_no_match() {
        let eval = Scripted::default();
        let variants = vec![variant("a", 1, Some("false")), variant("b", 2, Some("false"))];
        let sel = select(&variants, &RequestFacts::default(), &eval).await;
        assert_eq!(sel.outcome, Outcome::NoMatch);
        assert_eq!(sel.evaluated, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unconditional_variant_matches_without_evaluation() {
        let eval = Scripted::default();
        let variants = vec![variant("default", 1, Some("   ")), variant("b", 2, Some("true"))];
        let sel = select(&variants, &RequestFacts::default(), &eval).await;
        assert_eq!(sel.outcome, Outcome::Matched(variants[0].clone()));
        assert!(eval.calls.lock().is_empty());
    }

    #[tokio::test]
    async fn empty_variant_list_is_no_match() {
        let eval = Scripted::default();
        let sel = select(&[], &RequestFacts::default(), &eval).await;
        assert_eq!(sel.outcome, Outcome::NoMatch);
        assert!(sel.console.is_empty());
    }
}
