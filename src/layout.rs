use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::Path;

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::domain::{SequenceSpec, SubjectId};
use crate::error::BidsError;

/// BIDS-like output tree: `<root>/<subject>/<modality>/...`.
#[derive(Debug, Clone)]
pub struct BidsLayout {
    root: Utf8PathBuf,
}

impl BidsLayout {
    pub fn new(root: Utf8PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn subject_dir(&self, subject: &SubjectId) -> Utf8PathBuf {
        self.root.join(subject.as_str())
    }

    pub fn modality_dir(&self, subject: &SubjectId, sequence: &SequenceSpec) -> Utf8PathBuf {
        self.subject_dir(subject).join(&sequence.modality_dir)
    }

    pub fn ensure_root(&self) -> Result<(), BidsError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| BidsError::Filesystem(err.to_string()))
    }

    pub fn ensure_modality_dir(
        &self,
        subject: &SubjectId,
        sequence: &SequenceSpec,
    ) -> Result<Utf8PathBuf, BidsError> {
        let dir = self.modality_dir(subject, sequence);
        fs::create_dir_all(dir.as_std_path())
            .map_err(|err| BidsError::Filesystem(format!("create {dir}: {err}")))?;
        Ok(dir)
    }

    pub fn provenance_path(&self) -> Utf8PathBuf {
        self.root.join(".shanoir-bids").join("downloads.jsonl")
    }

    pub fn append_provenance(&self, entry: &Provenance) -> Result<(), BidsError> {
        let path = self.provenance_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| BidsError::Filesystem(err.to_string()))?;
        }
        let mut line =
            serde_json::to_vec(entry).map_err(|err| BidsError::Filesystem(err.to_string()))?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_std_path())
            .map_err(|err| BidsError::Filesystem(err.to_string()))?;
        file.write_all(&line)
            .map_err(|err| BidsError::Filesystem(err.to_string()))
    }

    /// Records that the archive logged at `from` now lives at `to`.
    pub fn record_rename(&self, from: &Utf8Path, to: &Utf8Path) -> Result<(), BidsError> {
        let previous = self
            .read_provenance()?
            .into_iter()
            .rev()
            .find(|entry| entry.path == from.as_str());
        let Some(previous) = previous else {
            tracing::debug!(%from, "renamed archive has no provenance entry");
            return Ok(());
        };
        self.append_provenance(&Provenance {
            path: to.to_string(),
            renamed_from: Some(from.to_string()),
            ..previous
        })
    }

    pub fn read_provenance(&self) -> Result<Vec<Provenance>, BidsError> {
        let path = self.provenance_path();
        if !path.as_std_path().exists() {
            return Ok(Vec::new());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| BidsError::Filesystem(err.to_string()))?;
        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                serde_json::from_str(line).map_err(|err| BidsError::Filesystem(err.to_string()))
            })
            .collect()
    }
}

/// One line of the download log kept next to the layout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provenance {
    pub downloaded_at: String,
    pub dataset_id: String,
    pub subject_name: String,
    pub dataset_name: String,
    pub path: String,
    pub tool: String,
    /// Set on entries written when an existing archive became `_run-1`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renamed_from: Option<String>,
}

/// Finds the archive downloaded for `dataset_id` in `dir`: `<id>.zip` or `<id>_<name>.zip`.
pub fn locate_archive(dir: &Utf8Path, dataset_id: &str) -> Result<Utf8PathBuf, BidsError> {
    let pattern = format!(
        "{}/{}*.zip",
        glob::Pattern::escape(dir.as_str()),
        glob::Pattern::escape(dataset_id)
    );
    let mut matches = glob::glob(&pattern)
        .map_err(|err| BidsError::Filesystem(err.to_string()))?
        .filter_map(Result::ok)
        .filter(|path| {
            path.is_file()
                && path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| names_dataset(name, dataset_id))
        })
        .collect::<Vec<_>>();
    matches.sort();
    let first = matches
        .into_iter()
        .next()
        .ok_or_else(|| BidsError::ArchiveNotFound(dataset_id.to_string()))?;
    Utf8PathBuf::from_path_buf(first)
        .map_err(|_| BidsError::Filesystem("non-utf8 archive path".to_string()))
}

/// Whether `name` is `<id>.zip` or `<id>_...`; `42` does not name `4211_T1.zip`.
pub fn names_dataset(name: &str, dataset_id: &str) -> bool {
    name.strip_prefix(dataset_id)
        .is_some_and(|rest| rest == ".zip" || rest.starts_with('_'))
}

/// Moves `from` to `to` without replacing an existing file.
///
/// Falls back to copy-then-remove when the rename crosses filesystems.
pub fn move_file_noclobber(from: &Path, to: &Path) -> Result<(), BidsError> {
    if to.exists() {
        return Err(BidsError::RunCollision(to.to_path_buf()));
    }
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::CrossesDevices => copy_then_remove(from, to),
        Err(err) => Err(BidsError::Filesystem(format!(
            "move {} -> {}: {err}",
            from.display(),
            to.display()
        ))),
    }
}

fn copy_then_remove(from: &Path, to: &Path) -> Result<(), BidsError> {
    let parent = to
        .parent()
        .ok_or_else(|| BidsError::Filesystem("invalid destination path".to_string()))?;
    let temp = tempfile::Builder::new()
        .prefix("shanoir-bids-move")
        .tempfile_in(parent)
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;
    fs::copy(from, temp.path()).map_err(|err| BidsError::Filesystem(err.to_string()))?;
    temp.persist_noclobber(to)
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;
    fs::remove_file(from).map_err(|err| BidsError::Filesystem(err.to_string()))
}
