//! The seam between the execution engine and an actual test framework.
//!
//! Discovery of what exists is out of scope for the engine; a provider
//! materializes a named test set into classes and methods and runs one
//! method at a time. The built-in [`ScriptedProvider`] interprets the
//! definitions carried in the run settings, which is how the CLI self-test
//! mode and the integration tests exercise the engine end to end.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use kiln_wire::StackTrace;

use crate::settings::{BehaviorSpec, RunSettings};

/// Terminal result of one test method attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    Passed,
    Failed(StackTrace),
    Errored(StackTrace),
    Skipped(Option<String>),
    AssumptionFailed(StackTrace),
}

/// A test set materialized for execution.
#[derive(Debug, Clone)]
pub struct SuitePlan {
    pub name: String,
    pub classes: Vec<ClassPlan>,
}

#[derive(Debug, Clone)]
pub struct ClassPlan {
    pub name: String,
    pub group: Option<String>,
    pub methods: Vec<String>,
}

/// Narrow interface the dispatcher drives tests through.
pub trait TestProvider: Send + Sync {
    /// Materialize the named test set, `None` if the provider doesn't know it.
    fn suite(&self, name: &str) -> Option<SuitePlan>;

    /// Execute one method. `attempt` is 0 for the normal run and counts up
    /// for re-runs after failure.
    fn run(&self, class: &str, method: &str, attempt: u32) -> TestOutcome;
}

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("unknown test provider '{0}'")]
    Unknown(String),
}

/// Instantiate the provider the settings name.
pub fn provider_for(settings: &RunSettings) -> Result<Arc<dyn TestProvider>, ProviderError> {
    match settings.provider.as_str() {
        "scripted" => Ok(Arc::new(ScriptedProvider::new(settings.clone()))),
        other => Err(ProviderError::Unknown(other.to_string())),
    }
}

/// Provider that replays the scripted behaviors from the run settings.
pub struct ScriptedProvider {
    settings: RunSettings,
}

impl ScriptedProvider {
    pub fn new(settings: RunSettings) -> Self {
        ScriptedProvider { settings }
    }

    fn method_spec(&self, class: &str, method: &str) -> Option<(&BehaviorSpec, u64)> {
        for suite in &self.settings.suites {
            for class_spec in &suite.classes {
                if class_spec.name == class {
                    if let Some(m) = class_spec.methods.iter().find(|m| m.name == method) {
                        return Some((&m.behavior, m.delay_ms));
                    }
                }
            }
        }
        None
    }
}

impl TestProvider for ScriptedProvider {
    fn suite(&self, name: &str) -> Option<SuitePlan> {
        let spec = self.settings.suite(name)?;
        Some(SuitePlan {
            name: spec.name.clone(),
            classes: spec
                .classes
                .iter()
                .map(|c| ClassPlan {
                    name: c.name.clone(),
                    group: c.group.clone(),
                    methods: c.methods.iter().map(|m| m.name.clone()).collect(),
                })
                .collect(),
        })
    }

    fn run(&self, class: &str, method: &str, attempt: u32) -> TestOutcome {
        let Some((behavior, delay_ms)) = self.method_spec(class, method) else {
            return TestOutcome::Errored(synthetic_trace(
                class,
                method,
                &format!("no scripted definition for {class}::{method}"),
            ));
        };
        if delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(delay_ms));
        }

        match behavior {
            BehaviorSpec::Pass => TestOutcome::Passed,
            BehaviorSpec::Fail { message } => {
                TestOutcome::Failed(synthetic_trace(class, method, message))
            }
            BehaviorSpec::Error { message } => {
                TestOutcome::Errored(synthetic_trace(class, method, message))
            }
            BehaviorSpec::Skip { reason } => TestOutcome::Skipped(reason.clone()),
            BehaviorSpec::Assumption { message } => {
                TestOutcome::AssumptionFailed(synthetic_trace(class, method, message))
            }
            BehaviorSpec::FailOnce { message } => {
                if attempt == 0 {
                    TestOutcome::Failed(synthetic_trace(class, method, message))
                } else {
                    TestOutcome::Passed
                }
            }
        }
    }
}

/// Plausible trace variants for a scripted failure.
fn synthetic_trace(class: &str, method: &str, message: &str) -> StackTrace {
    let frame = format!("    at {class}::{method}");
    StackTrace {
        message: Some(message.to_string()),
        smart_trimmed: Some(format!("{message}\n{frame}")),
        full: Some(format!(
            "{message}\n{frame}\n    at kiln::exec::dispatcher::run_leaf\n    at kiln::exec::scheduler::schedule"
        )),
        trimmed: Some(format!("{message}\n{frame}")),
    }
}
