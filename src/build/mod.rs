//! Build pipeline: install dependencies, package, tidy the output.
//!
//! Stages run strictly in order and a failed stage stops the run. Whatever
//! the subprocesses printed up to that point is kept and handed back with the
//! error.

pub mod runner;

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{info, instrument, warn};

use crate::config::BuildConfig;
use crate::events::{EngineEvent, EventSink};
use crate::fsops::{DeleteOutcome, FsError, FsMutator};
use crate::processes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildStage {
    CheckingToolchain,
    KillingRunningInstance,
    ClearingOutput,
    Installing,
    Building,
    CleaningArtifacts,
    Done,
}

impl fmt::Display for BuildStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            BuildStage::CheckingToolchain => "checking toolchain",
            BuildStage::KillingRunningInstance => "stopping running instance",
            BuildStage::ClearingOutput => "clearing output directory",
            BuildStage::Installing => "installing dependencies",
            BuildStage::Building => "packaging",
            BuildStage::CleaningArtifacts => "cleaning artifacts",
            BuildStage::Done => "done",
        };
        f.write_str(text)
    }
}

/// One subprocess invocation
#[derive(Debug, Clone)]
pub struct BuildStep {
    pub command: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl BuildStep {
    pub fn display_command(&self) -> String {
        let mut text = self.command.display().to_string();
        for arg in &self.args {
            text.push(' ');
            text.push_str(arg);
        }
        text
    }
}

/// A line of subprocess output
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LogLine {
    pub text: String,
    #[serde(rename = "isError")]
    pub is_error: bool,
    pub timestamp: DateTime<Utc>,
}

impl LogLine {
    pub fn new(text: impl Into<String>, is_error: bool) -> Self {
        Self {
            text: text.into(),
            is_error,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only record of everything the build subprocesses printed
#[derive(Debug, Clone, Default, Serialize)]
pub struct BuildLog {
    lines: Vec<LogLine>,
}

impl BuildLog {
    pub fn push(&mut self, line: LogLine) {
        self.lines.push(line);
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// The last `n` lines, for error reports
    pub fn tail(&self, n: usize) -> &[LogLine] {
        &self.lines[self.lines.len().saturating_sub(n)..]
    }
}

#[derive(Error, Debug)]
pub enum BuildError {
    #[error("{tool} is not available ({detail}); install it and make sure it is on PATH")]
    ToolchainMissing { tool: String, detail: String },

    #[error("output directory could not be cleared: {0}")]
    OutputLocked(#[source] FsError),

    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{stage} failed with exit code {code:?}")]
    StepFailed { stage: BuildStage, code: Option<i32> },

    #[error("{stage} did not finish within {after:?}")]
    StepTimeout { stage: BuildStage, after: Duration },

    #[error("failed to wait for build step: {0}")]
    Wait(#[source] io::Error),
}

/// A failed run: where it stopped, why, and the output collected so far
#[derive(Error, Debug)]
#[error("build failed while {stage}: {error}")]
pub struct BuildFailure {
    pub stage: BuildStage,
    #[source]
    pub error: BuildError,
    pub log: BuildLog,
}

#[derive(Debug, Default)]
pub struct BuildReport {
    pub log: BuildLog,
    /// Cleanup problems that did not fail the build
    pub warnings: Vec<String>,
    /// Where a locked output directory was moved to, if it had to be
    pub displaced_output: Option<PathBuf>,
    pub killed_instances: usize,
}

pub struct BuildPipeline {
    config: BuildConfig,
    mutator: FsMutator,
}

impl BuildPipeline {
    pub fn new(config: BuildConfig, mutator: FsMutator) -> Self {
        Self { config, mutator }
    }

    pub fn output_dir(&self, project_root: &Path) -> PathBuf {
        project_root.join(&self.config.output_dir)
    }

    /// Run every stage against `project_root`.
    #[instrument(skip_all, fields(project = %project_root.display(), tool = %self.config.tool))]
    pub async fn run(
        &self,
        project_root: &Path,
        events: &EventSink,
    ) -> Result<BuildReport, BuildFailure> {
        let mut report = BuildReport::default();

        enter(BuildStage::CheckingToolchain, events);
        let tool = match self.check_toolchain(project_root).await {
            Ok(tool) => tool,
            Err(error) => return Err(fail(BuildStage::CheckingToolchain, error, report.log)),
        };

        enter(BuildStage::KillingRunningInstance, events);
        if let Some(name) = &self.config.executable_name {
            report.killed_instances = processes::kill_by_name(name);
        }

        enter(BuildStage::ClearingOutput, events);
        let output = self.output_dir(project_root);
        match self.mutator.clear(&output).await {
            Ok(DeleteOutcome::Displaced(moved)) => {
                warn!(output = %output.display(), moved = %moved.display(), "Output directory was locked and has been displaced");
                report.displaced_output = Some(moved);
            }
            Ok(_) => {}
            Err(e) => {
                return Err(fail(
                    BuildStage::ClearingOutput,
                    BuildError::OutputLocked(e),
                    report.log,
                ))
            }
        }

        let steps = [
            (BuildStage::Installing, vec!["install".to_string()]),
            (
                BuildStage::Building,
                vec!["run".to_string(), self.config.script.clone()],
            ),
        ];
        for (stage, args) in steps {
            enter(stage, events);
            let step = BuildStep {
                command: tool.clone(),
                args,
                cwd: project_root.to_path_buf(),
            };
            if let Err(error) = self.run_step(&step, stage, &mut report.log, events).await {
                return Err(fail(stage, error, report.log));
            }
        }

        enter(BuildStage::CleaningArtifacts, events);
        tokio::time::sleep(Duration::from_millis(self.config.settle_delay_ms)).await;
        report.warnings = self.clean_artifacts(&output).await;

        enter(BuildStage::Done, events);
        info!(
            lines = report.log.len(),
            warnings = report.warnings.len(),
            "Build finished"
        );
        Ok(report)
    }

    /// Resolve the tool on PATH and make sure `<tool> -v` runs
    async fn check_toolchain(&self, project_root: &Path) -> Result<PathBuf, BuildError> {
        let missing = |detail: String| BuildError::ToolchainMissing {
            tool: self.config.tool.clone(),
            detail,
        };

        let tool = which::which(&self.config.tool).map_err(|e| missing(e.to_string()))?;
        let output = Command::new(&tool)
            .arg("-v")
            .current_dir(project_root)
            .output()
            .await
            .map_err(|e| missing(e.to_string()))?;

        if !output.status.success() {
            return Err(missing(format!(
                "`{} -v` exited with {:?}",
                self.config.tool,
                output.status.code()
            )));
        }

        info!(
            tool = %tool.display(),
            version = %String::from_utf8_lossy(&output.stdout).trim(),
            "Toolchain available"
        );
        Ok(tool)
    }

    async fn run_step(
        &self,
        step: &BuildStep,
        stage: BuildStage,
        log: &mut BuildLog,
        events: &EventSink,
    ) -> Result<(), BuildError> {
        let timeout = self.config.step_timeout_secs.map(Duration::from_secs);
        let status = runner::run_step(step, stage, timeout, |line| {
            events.emit(EngineEvent::BuildLog {
                text: line.text.clone(),
                is_error: line.is_error,
                timestamp: line.timestamp,
            });
            log.push(line);
        })
        .await?;

        if status.success() {
            Ok(())
        } else {
            Err(BuildError::StepFailed {
                stage,
                code: status.code(),
            })
        }
    }

    /// Remove metadata sidecars and unpacked variants; problems become warnings
    async fn clean_artifacts(&self, output: &Path) -> Vec<String> {
        let mut warnings = Vec::new();

        for pattern in &self.config.metadata_globs {
            let full = output.join(pattern).to_string_lossy().to_string();
            let paths = match glob::glob(&full) {
                Ok(paths) => paths,
                Err(e) => {
                    warnings.push(format!("invalid cleanup pattern {}: {}", pattern, e));
                    continue;
                }
            };
            for path in paths.filter_map(Result::ok) {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    warn!(path = %path.display(), error = %e, "Could not remove build metadata");
                    warnings.push(format!("could not remove {}: {}", path.display(), e));
                }
            }
        }

        if !self.config.keep_unpacked {
            for dir in &self.config.unpacked_dirs {
                let path = output.join(dir);
                if let Err(e) = self.mutator.clear(&path).await {
                    warn!(path = %path.display(), error = %e, "Could not remove unpacked output");
                    warnings.push(e.to_string());
                }
            }
        }

        warnings
    }
}

fn enter(stage: BuildStage, events: &EventSink) {
    info!(stage = %stage, "Build stage");
    events.emit(EngineEvent::Stage {
        status: stage.to_string(),
    });
}

fn fail(stage: BuildStage, error: BuildError, log: BuildLog) -> BuildFailure {
    warn!(stage = %stage, error = %error, lines = log.len(), "Build failed");
    BuildFailure { stage, error, log }
}
