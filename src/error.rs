use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum BidsError {
    #[error("missing config file shanoir-bids.json in current directory")]
    MissingConfig,

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("invalid config: {0}")]
    InvalidConfig(String),

    #[error("toolchain config {path} is missing key `{key}` in section [anima-scripts]")]
    #[diagnostic(help("see the Anima scripts README for the expected ~/.anima/config.txt"))]
    MissingToolchainConfig { path: PathBuf, key: String },

    #[error("invalid file type: {0} (expected dicom or nifti)")]
    InvalidFileType(String),

    #[error("invalid sort order: {0} (expected field,ASC or field,DESC)")]
    InvalidSort(String),

    #[error("catalog request failed: {0}")]
    CatalogHttp(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("no password available (set SHANOIR_PASSWORD or run interactively)")]
    MissingCredentials,

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("no downloaded archive found for dataset {0}")]
    ArchiveNotFound(String),

    #[error("refusing to overwrite existing run archive {0}")]
    #[diagnostic(help(
        "runs are numbered by counting existing archives; a deleted run leaves a gap"
    ))]
    RunCollision(PathBuf),

    #[error("another reconcile holds the lock {0}")]
    LockHeld(PathBuf),

    #[error("required tool not found: {0}")]
    MissingTool(String),

    #[error("step `{step}` failed ({status}): {message}")]
    StepFailed {
        step: String,
        status: String,
        message: String,
    },

    #[error("step `{step}` is missing input {path}")]
    MissingInput { step: String, path: PathBuf },

    #[error("step `{step}` did not produce {path}")]
    MissingOutput { step: String, path: PathBuf },

    #[error("invalid preprocessing options: {0}")]
    InvalidOptions(String),
}

impl BidsError {
    /// Process exit status: 2 for configuration and usage, 3 for remote or tool failures.
    pub fn exit_code(&self) -> u8 {
        match self {
            BidsError::MissingConfig
            | BidsError::ConfigRead(_)
            | BidsError::ConfigParse(_)
            | BidsError::InvalidConfig(_)
            | BidsError::MissingToolchainConfig { .. }
            | BidsError::InvalidFileType(_)
            | BidsError::InvalidSort(_)
            | BidsError::InvalidOptions(_)
            | BidsError::MissingCredentials => 2,
            BidsError::CatalogHttp(_)
            | BidsError::CatalogStatus { .. }
            | BidsError::Authentication(_)
            | BidsError::MissingTool(_)
            | BidsError::StepFailed { .. } => 3,
            _ => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failing_step() -> miette::Result<()> {
        Err(BidsError::StepFailed {
            step: "dti-estimation".to_string(),
            status: "exit 1".to_string(),
            message: "bad gradients".to_string(),
        })?;
        Ok(())
    }

    #[test]
    fn report_keeps_exit_code() {
        let report = failing_step().unwrap_err();
        let code = report.downcast_ref::<BidsError>().map(BidsError::exit_code);
        assert_eq!(code, Some(3));
    }

    #[test]
    fn config_errors_exit_with_usage_code() {
        assert_eq!(BidsError::MissingConfig.exit_code(), 2);
        assert_eq!(BidsError::MissingCredentials.exit_code(), 2);
        assert_eq!(BidsError::Filesystem("disk full".to_string()).exit_code(), 1);
    }
}
