//! DICOM archive unpacking and conversion to NIfTI with dcm2niix.

use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::error::BidsError;
use crate::fs_util;
use crate::pipeline::{Invocation, ToolRunner};

pub const DICOM_DIR: &str = "dicom";
pub const DIFFUSION_DIR: &str = "diffusion";

/// Prefix given to the converted volume of a modality directory.
pub fn volume_prefix(modality_dir: &str) -> &'static str {
    if modality_dir == DIFFUSION_DIR {
        "dwi_"
    } else {
        "T13D_"
    }
}

#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub data_dir: Utf8PathBuf,
    pub modality_dir: String,
    pub dcm2niix: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExtractedFiles {
    pub volume: Utf8PathBuf,
    pub encodings: Vec<Utf8PathBuf>,
    pub removed: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExtractStatus {
    Extracted(ExtractedFiles),
    Skipped { reason: String },
    Failed { message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectExtraction {
    pub subject: String,
    #[serde(flatten)]
    pub status: ExtractStatus,
}

/// Converts the archive of every subject under the data directory.
///
/// A failing subject is reported and the batch moves on.
pub fn extract_all(
    options: &ExtractOptions,
    runner: &dyn ToolRunner,
) -> Result<Vec<SubjectExtraction>, BidsError> {
    let mut subjects = Vec::new();
    let entries = fs::read_dir(options.data_dir.as_std_path())
        .map_err(|err| BidsError::Filesystem(format!("list {}: {err}", options.data_dir)))?;
    for entry in entries {
        let entry = entry.map_err(|err| BidsError::Filesystem(err.to_string()))?;
        if !entry.path().is_dir() {
            continue;
        }
        let Ok(name) = entry.file_name().into_string() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        subjects.push(name);
    }
    subjects.sort();

    let mut results = Vec::new();
    for subject in subjects {
        tracing::info!(%subject, "extracting");
        let subject_dir = options.data_dir.join(&subject);
        let status = match extract_subject(
            &subject_dir,
            &subject,
            &options.modality_dir,
            &options.dcm2niix,
            runner,
        ) {
            Ok(Some(files)) => ExtractStatus::Extracted(files),
            Ok(None) => {
                tracing::warn!(%subject, "no archive to extract");
                ExtractStatus::Skipped {
                    reason: format!("missing {}/{subject}.zip", options.modality_dir),
                }
            }
            Err(err) => {
                tracing::error!(%subject, %err, "extraction failed");
                ExtractStatus::Failed {
                    message: err.to_string(),
                }
            }
        };
        results.push(SubjectExtraction { subject, status });
    }
    Ok(results)
}

/// Unzips `<subject>/<modality>/<subject>.zip`, converts it and renames the outputs.
///
/// Returns `Ok(None)` when the subject has no archive for this modality.
pub fn extract_subject(
    subject_dir: &Utf8Path,
    subject: &str,
    modality_dir: &str,
    dcm2niix: &Path,
    runner: &dyn ToolRunner,
) -> Result<Option<ExtractedFiles>, BidsError> {
    let modality = subject_dir.join(modality_dir);
    let archive = modality.join(format!("{subject}.zip"));
    if !archive.as_std_path().is_file() {
        return Ok(None);
    }
    let dicom = modality.join(DICOM_DIR);

    let count = fs_util::extract_zip(archive.as_std_path(), dicom.as_std_path())?;
    tracing::debug!(%subject, files = count, "archive unpacked");

    let convert = Invocation::new(dcm2niix)
        .flag("-m", "1")
        .flag("-z", "1")
        .path(dicom.as_std_path());
    runner.run("dcm2niix", &convert)?;

    let volume = single_output(&dicom, "nii.gz")?;
    let volume_target = modality.join(format!("{}{subject}.nii.gz", volume_prefix(modality_dir)));
    rename(&volume, &volume_target)?;

    let mut encodings = Vec::new();
    for ext in ["bval", "bvec"] {
        let found = fs_util::files_with_suffix(dicom.as_std_path(), ext)?;
        let Some(source) = found.into_iter().next() else {
            continue;
        };
        let target = modality.join(format!("encoding_{subject}.{ext}"));
        rename(&source, target.as_std_path())?;
        encodings.push(target);
    }
    if modality_dir == DIFFUSION_DIR && encodings.is_empty() {
        tracing::warn!(%subject, "converter produced no gradient files");
    }

    let removed = fs_util::remove_files_except(dicom.as_std_path(), "dcm")?;

    Ok(Some(ExtractedFiles {
        volume: volume_target,
        encodings,
        removed,
    }))
}

fn single_output(dir: &Utf8Path, suffix: &str) -> Result<PathBuf, BidsError> {
    let mut found = fs_util::files_with_suffix(dir.as_std_path(), suffix)?;
    match found.len() {
        1 => Ok(found.remove(0)),
        0 => Err(BidsError::MissingOutput {
            step: "dcm2niix".to_string(),
            path: dir.join(format!("*.{suffix}")).into_std_path_buf(),
        }),
        n => Err(BidsError::Filesystem(format!(
            "dcm2niix produced {n} .{suffix} files in {dir}, expected one"
        ))),
    }
}

fn rename(from: &Path, to: impl AsRef<Path>) -> Result<(), BidsError> {
    let to = to.as_ref();
    fs::rename(from, to).map_err(|err| {
        BidsError::Filesystem(format!("move {} -> {}: {err}", from.display(), to.display()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_by_modality() {
        assert_eq!(volume_prefix("diffusion"), "dwi_");
        assert_eq!(volume_prefix("structural"), "T13D_");
    }
}
