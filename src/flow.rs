use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

use crate::auth::AuthError;
use crate::client::{CallError, GatewayClient, ServiceResponse};
use crate::scheduler::RunState;
use crate::types::Service;

/// Values extracted by earlier steps, consumed by later steps' placeholders.
pub type FlowContext = HashMap<&'static str, String>;

/// Classification of a step's response.
///
/// `ExpectedMiss` covers outcomes like a 404 on a probed random identifier:
/// the service answered as designed, so it counts for availability but not as
/// a business success, and never toward the hard-error rate.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Passed,
    ExpectedMiss,
    Failed(String),
}

impl StepOutcome {
    pub fn is_hard_error(&self) -> bool {
        matches!(self, StepOutcome::Failed(_))
    }
}

pub struct FlowStep {
    pub name: &'static str,
    pub service: Service,
    pub method: Method,
    /// Path relative to the gateway base URL; `{key}` segments are rendered
    /// from the flow context before the call goes out.
    pub path: String,
    pub body: Option<Value>,
    pub check: fn(&ServiceResponse) -> StepOutcome,
    pub extract: Option<fn(&ServiceResponse, &mut FlowContext) -> Result<(), String>>,
}

pub struct ChainedFlow {
    pub name: &'static str,
    pub steps: Vec<FlowStep>,
}

#[derive(Debug)]
pub struct StepRecord {
    pub name: &'static str,
    pub service: Service,
    pub duration: Duration,
    pub outcome: StepOutcome,
}

#[derive(Debug)]
pub struct FlowResult {
    pub total_steps: usize,
    pub steps: Vec<StepRecord>,
    pub failed_at: Option<&'static str>,
    pub context: FlowContext,
}

impl FlowResult {
    pub fn completed_steps(&self) -> usize {
        self.steps
            .iter()
            .filter(|record| record.outcome == StepOutcome::Passed)
            .count()
    }

    pub fn succeeded(&self) -> bool {
        self.failed_at.is_none() && self.completed_steps() == self.total_steps
    }

    pub fn had_hard_error(&self) -> bool {
        self.steps.iter().any(|record| record.outcome.is_hard_error())
    }
}

/// Runs a [`ChainedFlow`] step by step: render placeholders, call, classify,
/// extract. The first non-passing step stops the flow; later steps issue no
/// calls and the context stays as the last passing step left it.
pub struct FlowExecutor<'a> {
    pub client: &'a GatewayClient,
    pub run: &'a RunState,
}

impl FlowExecutor<'_> {
    /// Hard service errors are confined to the returned [`FlowResult`];
    /// only credential failures propagate, so the scheduler can abort.
    pub async fn run(&self, flow: &ChainedFlow) -> Result<FlowResult, AuthError> {
        let mut context = FlowContext::new();
        let mut steps = Vec::with_capacity(flow.steps.len());
        let mut failed_at = None;

        for step in &flow.steps {
            if self.run.is_aborted() {
                break;
            }

            let path = match render(&step.path, &context) {
                Ok(path) => path,
                Err(reason) => {
                    steps.push(StepRecord {
                        name: step.name,
                        service: step.service,
                        duration: Duration::ZERO,
                        outcome: StepOutcome::Failed(reason),
                    });
                    failed_at = Some(step.name);
                    break;
                }
            };
            let body = match &step.body {
                Some(template) => match render_value(template, &context) {
                    Ok(value) => Some(value),
                    Err(reason) => {
                        steps.push(StepRecord {
                            name: step.name,
                            service: step.service,
                            duration: Duration::ZERO,
                            outcome: StepOutcome::Failed(reason),
                        });
                        failed_at = Some(step.name);
                        break;
                    }
                },
                None => None,
            };

            let response = match self
                .client
                .send(step.method.clone(), &path, body.as_ref())
                .await
            {
                Ok(response) => response,
                Err(CallError::Auth(err)) => return Err(err),
                Err(CallError::Transport { detail, duration }) => {
                    steps.push(StepRecord {
                        name: step.name,
                        service: step.service,
                        duration,
                        outcome: StepOutcome::Failed(detail),
                    });
                    failed_at = Some(step.name);
                    break;
                }
            };

            let mut outcome = (step.check)(&response);
            if outcome == StepOutcome::Passed {
                if let Some(extract) = step.extract {
                    if let Err(reason) = extract(&response, &mut context) {
                        outcome = StepOutcome::Failed(reason);
                    }
                }
            }

            let stop = outcome != StepOutcome::Passed;
            if stop {
                failed_at = Some(step.name);
            }
            steps.push(StepRecord {
                name: step.name,
                service: step.service,
                duration: response.duration,
                outcome,
            });
            if stop {
                break;
            }
        }

        Ok(FlowResult {
            total_steps: flow.steps.len(),
            steps,
            failed_at,
            context,
        })
    }
}

fn render(template: &str, context: &FlowContext) -> Result<String, String> {
    if !template.contains('{') {
        return Ok(template.to_string());
    }
    let mut rendered = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        rendered.push_str(&rest[..open]);
        let tail = &rest[open + 1..];
        let close = tail
            .find('}')
            .ok_or_else(|| format!("unclosed placeholder in {:?}", template))?;
        let key = &tail[..close];
        match context.get(key) {
            Some(value) => rendered.push_str(value),
            None => return Err(format!("missing context value for {{{}}}", key)),
        }
        rest = &tail[close + 1..];
    }
    rendered.push_str(rest);
    Ok(rendered)
}

fn render_value(template: &Value, context: &FlowContext) -> Result<Value, String> {
    match template {
        Value::String(text) => render(text, context).map(Value::String),
        Value::Array(items) => items
            .iter()
            .map(|item| render_value(item, context))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(fields) => fields
            .iter()
            .map(|(key, value)| render_value(value, context).map(|v| (key.clone(), v)))
            .collect::<Result<serde_json::Map<_, _>, _>>()
            .map(Value::Object),
        other => Ok(other.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_substitutes_context_values() {
        let mut context = FlowContext::new();
        context.insert("order_id", "42".to_string());
        assert_eq!(render("orders/{order_id}", &context).unwrap(), "orders/42");
        assert_eq!(render("orders/health", &context).unwrap(), "orders/health");
    }

    #[test]
    fn render_fails_on_missing_key() {
        let context = FlowContext::new();
        let err = render("orders/{order_id}", &context).unwrap_err();
        assert!(err.contains("order_id"));
    }

    #[test]
    fn render_value_walks_nested_strings() {
        let mut context = FlowContext::new();
        context.insert("order_id", "7".to_string());
        let template = serde_json::json!({"order": "{order_id}", "nested": {"id": "{order_id}"}, "n": 3});
        let rendered = render_value(&template, &context).unwrap();
        assert_eq!(rendered["order"], "7");
        assert_eq!(rendered["nested"]["id"], "7");
        assert_eq!(rendered["n"], 3);
    }
}
