// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The default `RuntimeBuilder`/`PlanBuilder` pair (spec.md §4.7, §4.6 item
//! 4): prepares a `venv` with `pip` and runs a dispatch's entry point under
//! it. Every Task in this control plane targets Python (spec.md §3), so
//! this is the only plugin the Worker composition root wires in; a
//! multi-language plugin registry is out of scope (spec.md §1 Non-goals).

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::process::Command;

use antcode_core::model::{LockSource, RuntimeSpec};

use antcode_proto::worker::TaskDispatch;

use crate::engine::PlanBuilder;
use crate::model::ExecPlan;
use crate::runtime::RuntimeBuilder;

/// Grace period after SIGTERM before the executor escalates to SIGKILL.
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(10);
const DEFAULT_MAX_OUTPUT_LINES: usize = 10_000;
const DEFAULT_MAX_OUTPUT_BYTES: usize = 16 * 1024 * 1024;

/// Builds a `venv` at `venv_dir` and installs the spec's dependencies with
/// `pip`. Only `LockSource::Requirements` is supported; the other variants
/// name dependency resolution strategies this control plane does not
/// itself implement (spec.md §3, §4.7 Open Questions).
pub struct PipRuntimeBuilder {
    python_bin: String,
}

impl Default for PipRuntimeBuilder {
    fn default() -> Self {
        Self {
            python_bin: "python3".to_string(),
        }
    }
}

impl PipRuntimeBuilder {
    pub fn new(python_bin: impl Into<String>) -> Self {
        Self {
            python_bin: python_bin.into(),
        }
    }
}

#[async_trait::async_trait]
impl RuntimeBuilder for PipRuntimeBuilder {
    async fn build(
        &self,
        spec: &RuntimeSpec,
        venv_dir: &Path,
    ) -> Result<PathBuf, Box<dyn std::error::Error + Send + Sync>> {
        let requirements = match &spec.lock_source {
            LockSource::Requirements { requirements } => requirements.clone(),
            other => {
                return Err(format!("PipRuntimeBuilder only supports LockSource::Requirements, got {other:?}").into());
            }
        };

        let python_bin = spec.python.path.clone().unwrap_or_else(|| self.python_bin.clone());

        let status = Command::new(&python_bin)
            .args(["-m", "venv"])
            .arg(venv_dir)
            .status()
            .await?;
        if !status.success() {
            return Err(format!("{python_bin} -m venv failed with {status}").into());
        }

        let venv_python = venv_dir.join("bin").join("python3");

        if !requirements.is_empty() {
            let requirements_file = venv_dir.join("requirements.txt");
            tokio::fs::write(&requirements_file, requirements.join("\n")).await?;

            let mut pip_args = vec!["-m".to_string(), "pip".to_string(), "install".to_string(), "--quiet".to_string()];
            for constraint in &spec.constraints {
                pip_args.push("--constraint".to_string());
                pip_args.push(constraint.clone());
            }
            pip_args.push("-r".to_string());
            pip_args.push(requirements_file.to_string_lossy().into_owned());

            let status = Command::new(&venv_python).args(&pip_args).status().await?;
            if !status.success() {
                return Err(format!("pip install failed with {status}").into());
            }
        }

        Ok(venv_python)
    }
}

/// Builds an `ExecPlan` that invokes the fetched project's entry point
/// under the runtime's prepared interpreter (spec.md §4.6 item 4).
#[derive(Default)]
pub struct PythonEntryPointPlanBuilder;

#[async_trait::async_trait]
impl PlanBuilder for PythonEntryPointPlanBuilder {
    fn runtime_spec(&self, dispatch: &TaskDispatch) -> RuntimeSpec {
        let env_vars = parse_json_string_map(&dispatch.environment_json);
        RuntimeSpec {
            env_vars,
            ..RuntimeSpec::default()
        }
    }

    async fn build_plan(&self, dispatch: &TaskDispatch, project_dir: &Path, python_executable: &Path) -> Result<ExecPlan, String> {
        if dispatch.entry_point.is_empty() {
            return Err("dispatch is missing an entry_point".to_string());
        }

        let mut env = parse_json_string_map(&dispatch.environment_json);
        if !dispatch.params_json.is_empty() {
            env.insert("ANTCODE_TASK_PARAMS".to_string(), dispatch.params_json.clone());
        }

        Ok(ExecPlan {
            run_id: antcode_core::model::TaskRunId::new(dispatch.run_id.clone()),
            program: python_executable.to_string_lossy().into_owned(),
            args: vec![dispatch.entry_point.clone()],
            cwd: project_dir.to_path_buf(),
            env,
            timeout: Duration::from_secs(dispatch.timeout_secs.max(1)),
            grace_period: DEFAULT_GRACE_PERIOD,
            max_output_lines: DEFAULT_MAX_OUTPUT_LINES,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
            artifact_globs: vec!["**/*.out".to_string(), "artifacts/**".to_string()],
        })
    }
}

fn parse_json_string_map(raw: &str) -> std::collections::BTreeMap<String, String> {
    if raw.is_empty() {
        return std::collections::BTreeMap::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}
