//! Run settings: the serialized configuration a forked worker executes.
//!
//! The controller writes one JSON settings file per worker (through a temp
//! file), passes its path as the worker's single positional argument, and the
//! worker reads it back. Everything a worker needs lives here: the provider
//! selection, the scripted test definitions, the concurrency intent, and the
//! properties to announce as `sys-prop` events.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::exec::planner::{ConcurrencyIntent, RunnerCounter};

/// Fork index environment variable, always set fresh on spawn.
pub const ENV_FORK_ID: &str = "KILN_FORK_ID";

/// Variables never inherited by a worker from the controller environment.
/// `KILN_FORK_ID` is re-set per fork; a stale value from an outer kiln run
/// must not leak through.
pub const EXCLUDED_ENV: &[&str] = &[ENV_FORK_ID, "KILN_SETTINGS_FILE"];

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("settings file is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Everything one worker run needs to know.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSettings {
    /// Test provider selection; only `scripted` is built in.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Test-set definitions the provider materializes.
    #[serde(default)]
    pub suites: Vec<SuiteSpec>,
    /// Parallelism intent, resolved against discovered counts in the worker.
    #[serde(default)]
    pub intent: ConcurrencyIntent,
    /// Drop the full stack-trace variant from report entries.
    #[serde(default)]
    pub trim_stack_traces: bool,
    /// Re-run failed tests up to this many extra attempts; a later success
    /// is counted as a flake.
    #[serde(default)]
    pub rerun_failing_count: u32,
    /// Extra key/value properties the worker reports at startup.
    #[serde(default)]
    pub report_properties: BTreeMap<String, String>,
}

fn default_provider() -> String {
    "scripted".to_string()
}

impl Default for RunSettings {
    fn default() -> Self {
        RunSettings {
            provider: default_provider(),
            suites: Vec::new(),
            intent: ConcurrencyIntent::default(),
            trim_stack_traces: false,
            rerun_failing_count: 0,
            report_properties: BTreeMap::new(),
        }
    }
}

/// One test set: the unit a `run-class` command names.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteSpec {
    pub name: String,
    pub classes: Vec<ClassSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassSpec {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub methods: Vec<MethodSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    #[serde(default)]
    pub behavior: BehaviorSpec,
    /// Simulated execution time.
    #[serde(default)]
    pub delay_ms: u64,
}

/// What a scripted test does when run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum BehaviorSpec {
    #[default]
    Pass,
    Fail {
        message: String,
    },
    Error {
        message: String,
    },
    Skip {
        #[serde(default)]
        reason: Option<String>,
    },
    Assumption {
        message: String,
    },
    /// Fails on the first attempt, passes on any re-run: a scripted flake.
    FailOnce {
        message: String,
    },
}

impl RunSettings {
    pub fn from_file(path: &Path) -> Result<Self, SettingsError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), SettingsError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text)?;
        Ok(())
    }

    pub fn suite(&self, name: &str) -> Option<&SuiteSpec> {
        self.suites.iter().find(|s| s.name == name)
    }

    /// All test-set names, in definition order.
    pub fn suite_names(&self) -> Vec<String> {
        self.suites.iter().map(|s| s.name.clone()).collect()
    }

    /// Discovered counts for the named test sets, feeding the planner.
    pub fn counter_for(&self, unit_names: &[String]) -> RunnerCounter {
        let mut counter = RunnerCounter::default();
        for name in unit_names {
            let Some(suite) = self.suite(name) else {
                continue;
            };
            counter.suites += 1;
            counter.classes += suite.classes.len() as u32;
            counter.methods += suite
                .classes
                .iter()
                .map(|c| c.methods.len() as u32)
                .sum::<u32>();
        }
        counter
    }

    /// A settings value containing only the named test sets, for handing a
    /// worker its partition.
    pub fn partition(&self, unit_names: &[String]) -> RunSettings {
        let mut copy = self.clone();
        copy.suites = self
            .suites
            .iter()
            .filter(|s| unit_names.iter().any(|n| n == &s.name))
            .cloned()
            .collect();
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> RunSettings {
        RunSettings {
            suites: vec![
                SuiteSpec {
                    name: "alpha".to_string(),
                    classes: vec![ClassSpec {
                        name: "AlphaTest".to_string(),
                        group: None,
                        methods: vec![
                            MethodSpec {
                                name: "passes".to_string(),
                                behavior: BehaviorSpec::Pass,
                                delay_ms: 0,
                            },
                            MethodSpec {
                                name: "fails".to_string(),
                                behavior: BehaviorSpec::Fail {
                                    message: "expected 1 but was 2".to_string(),
                                },
                                delay_ms: 0,
                            },
                        ],
                    }],
                },
                SuiteSpec {
                    name: "beta".to_string(),
                    classes: vec![],
                },
            ],
            ..RunSettings::default()
        }
    }

    #[test]
    fn settings_survive_a_file_round_trip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("settings.json");
        let settings = sample();
        settings.write_to(&path).expect("write");
        let loaded = RunSettings::from_file(&path).expect("read");
        assert_eq!(loaded.suites.len(), 2);
        assert_eq!(loaded.suites[0].classes[0].methods.len(), 2);
    }

    #[test]
    fn counter_counts_only_named_suites() {
        let settings = sample();
        let counter = settings.counter_for(&["alpha".to_string()]);
        assert_eq!(counter.suites, 1);
        assert_eq!(counter.classes, 1);
        assert_eq!(counter.methods, 2);
    }

    #[test]
    fn partition_keeps_only_named_suites() {
        let settings = sample();
        let part = settings.partition(&["beta".to_string()]);
        assert_eq!(part.suite_names(), vec!["beta".to_string()]);
    }

    #[test]
    fn behavior_defaults_to_pass() {
        let json = r#"{"name": "m"}"#;
        let method: MethodSpec = serde_json::from_str(json).expect("parse");
        assert!(matches!(method.behavior, BehaviorSpec::Pass));
    }
}
