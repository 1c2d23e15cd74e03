//! Chains of external tool invocations with declared file contracts.
//!
//! Each step names the files it reads and writes. Inputs are checked before
//! a step runs and outputs after, so a tool that exits 0 without writing its
//! result still stops the chain.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use clap::ValueEnum;
use serde::Serialize;

use crate::error::BidsError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<String>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, value: impl Into<String>) -> Self {
        self.args.push(value.into());
        self
    }

    pub fn path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().to_string())
    }

    pub fn flag(self, flag: &str, value: impl Into<String>) -> Self {
        self.arg(flag).arg(value)
    }

    pub fn flag_path(self, flag: &str, path: &Path) -> Self {
        self.arg(flag).path(path)
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

pub trait ToolRunner {
    fn run(&self, step: &str, invocation: &Invocation) -> Result<(), BidsError>;
}

/// Runs tools as child processes and checks their exit status.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemToolRunner;

impl ToolRunner for SystemToolRunner {
    fn run(&self, step: &str, invocation: &Invocation) -> Result<(), BidsError> {
        tracing::debug!(step, command = %invocation, "spawning");
        let output = Command::new(&invocation.program)
            .args(&invocation.args)
            .output()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => {
                    BidsError::MissingTool(invocation.program.display().to_string())
                }
                _ => BidsError::StepFailed {
                    step: step.to_string(),
                    status: "spawn".to_string(),
                    message: err.to_string(),
                },
            })?;
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        let message = if stderr.is_empty() {
            format!("command failed: {invocation}")
        } else {
            stderr
        };
        Err(BidsError::StepFailed {
            step: step.to_string(),
            status: output
                .status
                .code()
                .map(|code| format!("exit {code}"))
                .unwrap_or_else(|| "killed".to_string()),
            message,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepAction {
    Exec(Invocation),
    Move { from: PathBuf, to: PathBuf },
    Copy { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub name: String,
    pub action: StepAction,
    pub inputs: Vec<PathBuf>,
    pub outputs: Vec<PathBuf>,
}

impl Step {
    pub fn exec(name: &str, invocation: Invocation) -> Self {
        Self {
            name: name.to_string(),
            action: StepAction::Exec(invocation),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn move_file(name: &str, from: PathBuf, to: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            inputs: vec![from.clone()],
            outputs: vec![to.clone()],
            action: StepAction::Move { from, to },
        }
    }

    pub fn copy_file(name: &str, from: PathBuf, to: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            inputs: vec![from.clone()],
            outputs: vec![to.clone()],
            action: StepAction::Copy { from, to },
        }
    }

    pub fn reads(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.inputs.extend(paths);
        self
    }

    pub fn writes(mut self, paths: impl IntoIterator<Item = PathBuf>) -> Self {
        self.outputs.extend(paths);
        self
    }

    fn execute(&self, runner: &dyn ToolRunner) -> Result<(), BidsError> {
        for input in &self.inputs {
            if !input.exists() {
                return Err(BidsError::MissingInput {
                    step: self.name.clone(),
                    path: input.clone(),
                });
            }
        }
        for output in &self.outputs {
            if let Some(parent) = output.parent() {
                if !parent.as_os_str().is_empty() {
                    fs::create_dir_all(parent)
                        .map_err(|err| BidsError::Filesystem(err.to_string()))?;
                }
            }
        }

        match &self.action {
            StepAction::Exec(invocation) => runner.run(&self.name, invocation)?,
            StepAction::Move { from, to } => move_replacing(from, to)?,
            StepAction::Copy { from, to } => {
                fs::copy(from, to).map_err(|err| {
                    BidsError::Filesystem(format!(
                        "copy {} -> {}: {err}",
                        from.display(),
                        to.display()
                    ))
                })?;
            }
        }

        for output in &self.outputs {
            if !output.exists() {
                return Err(BidsError::MissingOutput {
                    step: self.name.clone(),
                    path: output.clone(),
                });
            }
        }
        Ok(())
    }
}

fn move_replacing(from: &Path, to: &Path) -> Result<(), BidsError> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => {
            fs::copy(from, to).map_err(|err| BidsError::Filesystem(err.to_string()))?;
            fs::remove_file(from).map_err(|err| BidsError::Filesystem(err.to_string()))
        }
        Err(err) => Err(BidsError::Filesystem(format!(
            "move {} -> {}: {err}",
            from.display(),
            to.display()
        ))),
    }
}

/// What to do with the rest of the chain once a step fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Stop at the first failing step.
    #[default]
    FailFast,
    /// Skip only the steps that consume a missing output.
    Skip,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed { message: String },
    Skipped { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct StepReport {
    pub name: String,
    #[serde(flatten)]
    pub status: StepStatus,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct PipelineReport {
    pub steps: Vec<StepReport>,
}

impl PipelineReport {
    pub fn succeeded(&self) -> bool {
        self.steps
            .iter()
            .all(|step| step.status == StepStatus::Completed)
    }

    pub fn completed(&self) -> usize {
        self.steps
            .iter()
            .filter(|step| step.status == StepStatus::Completed)
            .count()
    }

    /// Turns the first failed step into an error.
    pub fn into_result(self) -> Result<Self, BidsError> {
        let failed = self.steps.iter().find_map(|step| match &step.status {
            StepStatus::Failed { message } => Some((step.name.clone(), message.clone())),
            _ => None,
        });
        match failed {
            Some((step, message)) => Err(BidsError::StepFailed {
                step,
                status: "failed".to_string(),
                message,
            }),
            None => Ok(self),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, step: Step) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|step| step.name.as_str()).collect()
    }

    pub fn run(&self, runner: &dyn ToolRunner, policy: FailurePolicy) -> PipelineReport {
        let mut report = PipelineReport::default();
        // Outputs that will never appear because their producer failed or was skipped.
        let mut unavailable: HashSet<PathBuf> = HashSet::new();
        let mut halted = false;

        for step in &self.steps {
            if halted {
                report.steps.push(StepReport {
                    name: step.name.clone(),
                    status: StepStatus::Skipped {
                        reason: "an earlier step failed".to_string(),
                    },
                });
                continue;
            }

            if let Some(missing) = step.inputs.iter().find(|path| unavailable.contains(*path)) {
                tracing::warn!(step = %step.name, input = %missing.display(), "skipping step");
                unavailable.extend(step.outputs.iter().cloned());
                report.steps.push(StepReport {
                    name: step.name.clone(),
                    status: StepStatus::Skipped {
                        reason: format!("input {} was not produced", missing.display()),
                    },
                });
                continue;
            }

            tracing::info!(step = %step.name, "running step");
            match step.execute(runner) {
                Ok(()) => report.steps.push(StepReport {
                    name: step.name.clone(),
                    status: StepStatus::Completed,
                }),
                Err(err) => {
                    tracing::error!(step = %step.name, %err, "step failed");
                    unavailable.extend(step.outputs.iter().cloned());
                    report.steps.push(StepReport {
                        name: step.name.clone(),
                        status: StepStatus::Failed {
                            message: err.to_string(),
                        },
                    });
                    if policy == FailurePolicy::FailFast {
                        halted = true;
                    }
                }
            }
        }
        report
    }
}

/// Looks a program up on `PATH`.
pub fn find_in_path(name: &str) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    for path in std::env::split_paths(&path_var) {
        let exe = path.join(format!("{name}.exe"));
        if exe.exists() {
            return Some(exe);
        }
        let plain = path.join(name);
        if plain.exists() {
            return Some(plain);
        }
    }
    None
}
