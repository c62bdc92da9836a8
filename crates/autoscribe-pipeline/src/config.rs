//! autoscribe configuration (TOML).
//!
//! ```toml
//! artifact_root = ".autoscribe/checkpoints"
//! manual_root = "manual"
//! max_attempts = 2
//!
//! [retry_backoff]
//! kind = "fixed"
//! delay_ms = 1000
//!
//! [selectors]
//! other_attributes = ["role", "aria-label", "type"]
//!
//! [workers.plan]
//! kind = "command"
//! program = "./agents/planner"
//! timeout_secs = 600
//!
//! [workers.trace]
//! kind = "http"
//! endpoint = "http://localhost:8700/stages"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use autoscribe_types::{AutoscribeError, Result, Stage};
use serde::{Deserialize, Serialize};

use crate::retry::BackoffPolicy;
use crate::selector::{SelectorEngine, SelectorRules};
use crate::worker::{SelectorWorker, WorkerRegistry};
use crate::workers::{CommandWorker, HttpWorker};

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoscribeConfig {
    /// Root of the checkpoint tree.
    pub artifact_root: PathBuf,

    /// Root holding `<storyId>/<type>_test_cases.md` documents.
    pub manual_root: PathBuf,

    /// Where Emit workers are expected to write generated code.
    pub output_root: PathBuf,

    /// Whole-task attempts per bulk job, first run included.
    pub max_attempts: u32,

    /// Delay between whole-task attempts.
    pub retry_backoff: BackoffPolicy,

    pub selectors: SelectorRules,

    pub workers: WorkersConfig,
}

impl Default for AutoscribeConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from(".autoscribe/checkpoints"),
            manual_root: PathBuf::from("manual"),
            output_root: PathBuf::from("automation"),
            max_attempts: 2,
            retry_backoff: BackoffPolicy::None,
            selectors: SelectorRules::default(),
            workers: WorkersConfig::default(),
        }
    }
}

/// One optional worker spec per stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    pub plan: Option<WorkerSpec>,
    pub trace: Option<WorkerSpec>,
    pub derive_selectors: Option<WorkerSpec>,
    pub emit: Option<WorkerSpec>,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            plan: None,
            trace: None,
            derive_selectors: Some(WorkerSpec::Builtin),
            emit: None,
        }
    }
}

impl WorkersConfig {
    pub fn get(&self, stage: Stage) -> Option<&WorkerSpec> {
        match stage {
            Stage::Plan => self.plan.as_ref(),
            Stage::Trace => self.trace.as_ref(),
            Stage::DeriveSelectors => self.derive_selectors.as_ref(),
            Stage::Emit => self.emit.as_ref(),
        }
    }
}

/// How a stage is executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerSpec {
    /// In-process implementation. Only Derive-Selectors has one.
    Builtin,
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    Http {
        endpoint: String,
        #[serde(default = "default_http_retries")]
        max_retries: usize,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
}

fn default_http_retries() -> usize {
    3
}

impl AutoscribeConfig {
    /// Load configuration from `path`, falling back to defaults when the file
    /// does not exist.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content).map_err(|e| match e {
            AutoscribeError::Config(msg) => {
                AutoscribeError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| AutoscribeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| AutoscribeError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(AutoscribeError::Config(
                "max_attempts must be at least 1".into(),
            ));
        }
        for stage in Stage::ALL {
            if let Some(WorkerSpec::Builtin) = self.workers.get(stage) {
                if stage != Stage::DeriveSelectors {
                    return Err(AutoscribeError::Config(format!(
                        "stage '{stage}' has no builtin worker"
                    )));
                }
            }
        }
        Ok(())
    }

    pub fn selector_engine(&self) -> Result<SelectorEngine> {
        SelectorEngine::with_rules(self.selectors.clone())
    }

    /// Instantiate one worker per configured stage. Unconfigured stages are
    /// left empty; the orchestrator reports them.
    pub fn build_registry(&self) -> Result<WorkerRegistry> {
        self.validate()?;
        let mut registry = WorkerRegistry::new();

        for stage in Stage::ALL {
            let Some(spec) = self.workers.get(stage) else {
                continue;
            };
            match spec {
                WorkerSpec::Builtin => {
                    registry.register(SelectorWorker::new(self.selector_engine()?));
                }
                WorkerSpec::Command {
                    program,
                    args,
                    timeout_secs,
                } => {
                    let mut worker = CommandWorker::new(stage, program.clone())
                        .args(args.iter().cloned())
                        .env("AUTOSCRIBE_MANUAL_ROOT", self.manual_root.display().to_string())
                        .env("AUTOSCRIBE_OUTPUT_ROOT", self.output_root.display().to_string());
                    if let Some(secs) = timeout_secs {
                        worker = worker.timeout(Duration::from_secs(*secs));
                    }
                    registry.register(worker);
                }
                WorkerSpec::Http {
                    endpoint,
                    max_retries,
                    timeout_secs,
                } => {
                    let mut worker = HttpWorker::new(stage, endpoint.clone())
                        .with_retries(*max_retries, BackoffPolicy::default());
                    if let Some(secs) = timeout_secs {
                        worker = worker.with_timeout(Duration::from_secs(*secs));
                    }
                    registry.register(worker);
                }
            }
            tracing::debug!(stage = %stage, "Worker configured");
        }

        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AutoscribeConfig::load(&dir.path().join("autoscribe.toml")).unwrap();
        assert_eq!(config, AutoscribeConfig::default());
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.workers.derive_selectors, Some(WorkerSpec::Builtin));
    }

    #[test]
    fn parses_workers_and_overrides() {
        let config = AutoscribeConfig::from_toml(
            r#"
            artifact_root = "/var/autoscribe"
            max_attempts = 3

            [retry_backoff]
            kind = "fixed"
            delay_ms = 250

            [selectors]
            other_attributes = ["aria-label", "role"]

            [workers.plan]
            kind = "command"
            program = "planner"
            args = ["--story-dir", "manual"]
            timeout_secs = 60

            [workers.trace]
            kind = "http"
            endpoint = "http://localhost:8700"
            "#,
        )
        .unwrap();

        assert_eq!(config.artifact_root, PathBuf::from("/var/autoscribe"));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retry_backoff, BackoffPolicy::Fixed { delay_ms: 250 });
        assert_eq!(config.selectors.other_attributes, vec!["aria-label", "role"]);
        assert_eq!(config.selectors.max_classes, 3);
        assert_eq!(
            config.workers.plan,
            Some(WorkerSpec::Command {
                program: "planner".into(),
                args: vec!["--story-dir".into(), "manual".into()],
                timeout_secs: Some(60),
            })
        );
        assert_eq!(
            config.workers.trace,
            Some(WorkerSpec::Http {
                endpoint: "http://localhost:8700".into(),
                max_retries: 3,
                timeout_secs: None,
            })
        );
        // Untouched sections keep their defaults.
        assert_eq!(config.workers.derive_selectors, Some(WorkerSpec::Builtin));
    }

    #[test]
    fn zero_attempts_rejected() {
        let err = AutoscribeConfig::from_toml("max_attempts = 0").unwrap_err();
        assert!(matches!(err, AutoscribeError::Config(_)));
    }

    #[test]
    fn builtin_only_for_selector_stage() {
        let err = AutoscribeConfig::from_toml("[workers.emit]\nkind = \"builtin\"").unwrap_err();
        assert!(err.to_string().contains("emit"));
    }

    #[test]
    fn invalid_toml_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("autoscribe.toml");
        std::fs::write(&path, "max_attempts = [").unwrap();
        assert!(matches!(
            AutoscribeConfig::load(&path),
            Err(AutoscribeError::Config(_))
        ));
    }

    #[test]
    fn registry_covers_configured_stages() {
        let config = AutoscribeConfig::from_toml(
            r#"
            [workers.plan]
            kind = "command"
            program = "planner"

            [workers.emit]
            kind = "http"
            endpoint = "http://localhost:8700"
            "#,
        )
        .unwrap();
        let registry = config.build_registry().unwrap();
        assert!(registry.has(Stage::Plan));
        assert!(registry.has(Stage::DeriveSelectors));
        assert!(registry.has(Stage::Emit));
        assert_eq!(registry.missing(), vec![Stage::Trace]);
    }

    #[test]
    fn default_config_roundtrips_through_toml() {
        let config = AutoscribeConfig::default();
        let text = config.to_toml().unwrap();
        assert_eq!(AutoscribeConfig::from_toml(&text).unwrap(), config);
    }
}
