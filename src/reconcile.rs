//! Run numbering for archives placed in a subject/modality directory.
//!
//! The policy is "count existing, append next": the state is recomputed from
//! the directory listing on every call and deleted runs are never renumbered.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};

use camino::{Utf8Path, Utf8PathBuf};
use regex::Regex;
use serde::Serialize;

use crate::domain::{DatasetRecord, PrefixSubstitution, SequenceSpec, SubjectId};
use crate::error::BidsError;
use crate::layout::{BidsLayout, move_file_noclobber};

const LOCK_FILE: &str = ".reconcile.lock";

/// How many archives of one subject/sequence already exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunState {
    Empty,
    /// A single archive without a run suffix.
    Single(Utf8PathBuf),
    Multiple(usize),
}

impl RunState {
    pub fn scan(dir: &Utf8Path, stem: &str, ext: &str) -> Result<Self, BidsError> {
        if !dir.as_std_path().exists() {
            return Ok(RunState::Empty);
        }
        let pattern = Regex::new(&format!(
            r"^{}(_run-(\d+))?\.{}$",
            regex::escape(stem),
            regex::escape(ext)
        ))
        .map_err(|err| BidsError::Filesystem(err.to_string()))?;

        let mut unsuffixed = Vec::new();
        let mut count = 0usize;
        let entries = fs::read_dir(dir.as_std_path())
            .map_err(|err| BidsError::Filesystem(format!("list {dir}: {err}")))?;
        for entry in entries {
            let entry = entry.map_err(|err| BidsError::Filesystem(err.to_string()))?;
            if !entry.path().is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(caps) = pattern.captures(name) else {
                continue;
            };
            count += 1;
            if caps.get(1).is_none() {
                unsuffixed.push(dir.join(name));
            }
        }

        Ok(match (count, unsuffixed.pop()) {
            (0, _) => RunState::Empty,
            (1, Some(path)) => RunState::Single(path),
            (count, _) => RunState::Multiple(count),
        })
    }

    /// Renames and final destination needed to add one more archive.
    pub fn plan(&self, dir: &Utf8Path, stem: &str, ext: &str) -> RunPlan {
        match self {
            RunState::Empty => RunPlan {
                renames: Vec::new(),
                destination: dir.join(format!("{stem}.{ext}")),
                run: None,
            },
            RunState::Single(existing) => RunPlan {
                renames: vec![(existing.clone(), run_path(dir, stem, ext, 1))],
                destination: run_path(dir, stem, ext, 2),
                run: Some(2),
            },
            RunState::Multiple(count) => {
                let run = *count as u32 + 1;
                RunPlan {
                    renames: Vec::new(),
                    destination: run_path(dir, stem, ext, run),
                    run: Some(run),
                }
            }
        }
    }

    /// State of the directory once `plan` has been carried out.
    pub fn after(&self, plan: &RunPlan) -> RunState {
        match self {
            RunState::Empty => RunState::Single(plan.destination.clone()),
            RunState::Single(_) => RunState::Multiple(2),
            RunState::Multiple(count) => RunState::Multiple(count + 1),
        }
    }
}

/// Placements planned during a dry run, keyed by directory and archive stem.
///
/// Nothing is written in a dry run, so later records of the same subject and
/// sequence must be planned against these instead of a fresh scan.
#[derive(Debug, Default)]
pub struct PendingRuns {
    states: HashMap<(Utf8PathBuf, String), RunState>,
}

fn run_path(dir: &Utf8Path, stem: &str, ext: &str, run: u32) -> Utf8PathBuf {
    dir.join(format!("{stem}_run-{run}.{ext}"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunPlan {
    pub renames: Vec<(Utf8PathBuf, Utf8PathBuf)>,
    pub destination: Utf8PathBuf,
    pub run: Option<u32>,
}

/// An existing archive moved aside to make room for a new run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenamedRun {
    pub from: Utf8PathBuf,
    pub to: Utf8PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Placed {
        path: Utf8PathBuf,
        run: Option<u32>,
        renamed: Vec<RenamedRun>,
    },
    NameMismatch {
        expected: String,
        actual: String,
    },
}

pub struct Reconciler<'a> {
    layout: &'a BidsLayout,
    substitutions: &'a [PrefixSubstitution],
}

impl<'a> Reconciler<'a> {
    pub fn new(layout: &'a BidsLayout, substitutions: &'a [PrefixSubstitution]) -> Self {
        Self {
            layout,
            substitutions,
        }
    }

    pub fn subject_id(&self, record: &DatasetRecord) -> SubjectId {
        SubjectId::derive(&record.subject_name, self.substitutions)
    }

    /// Computes where an archive would go without touching the filesystem.
    ///
    /// The plan is recorded in `pending` so the next preview for the same
    /// subject and sequence numbers after it.
    pub fn preview(
        &self,
        archive_ext: &str,
        record: &DatasetRecord,
        sequence: &SequenceSpec,
        pending: &mut PendingRuns,
    ) -> Result<Option<RunPlan>, BidsError> {
        if !record.matches_name(&sequence.dataset_name) {
            return Ok(None);
        }
        let subject = self.subject_id(record);
        let dir = self.layout.modality_dir(&subject, sequence);
        let stem = sequence.archive_stem(&subject);
        let key = (dir.clone(), format!("{stem}.{archive_ext}"));
        let state = match pending.states.get(&key) {
            Some(state) => state.clone(),
            None => RunState::scan(&dir, &stem, archive_ext)?,
        };
        let plan = state.plan(&dir, &stem, archive_ext);
        pending.states.insert(key, state.after(&plan));
        Ok(Some(plan))
    }

    /// Moves a downloaded archive into the layout, numbering runs as needed.
    pub fn place(
        &self,
        archive: &Utf8Path,
        record: &DatasetRecord,
        sequence: &SequenceSpec,
    ) -> Result<ReconcileOutcome, BidsError> {
        if !record.matches_name(&sequence.dataset_name) {
            tracing::warn!(
                subject = %record.subject_name,
                expected = %sequence.dataset_name,
                actual = %record.dataset_name,
                "dataset name mismatch, nothing downloaded"
            );
            return Ok(ReconcileOutcome::NameMismatch {
                expected: sequence.dataset_name.clone(),
                actual: record.dataset_name.clone(),
            });
        }

        let subject = self.subject_id(record);
        let dir = self.layout.ensure_modality_dir(&subject, sequence)?;
        let stem = sequence.archive_stem(&subject);
        let ext = archive_extension(archive);

        let _lock = DirLock::acquire(&dir)?;
        let state = RunState::scan(&dir, &stem, &ext)?;
        let plan = state.plan(&dir, &stem, &ext);
        tracing::debug!(?state, destination = %plan.destination, "planned placement");

        if plan.destination.as_std_path().exists() {
            return Err(BidsError::RunCollision(plan.destination.into_std_path_buf()));
        }
        for (_, to) in &plan.renames {
            if to.as_std_path().exists() {
                return Err(BidsError::RunCollision(to.clone().into_std_path_buf()));
            }
        }

        let mut renamed = Vec::new();
        for (from, to) in &plan.renames {
            move_file_noclobber(from.as_std_path(), to.as_std_path())?;
            tracing::info!(from = %from, to = %to, "renamed existing run");
            renamed.push(RenamedRun {
                from: from.clone(),
                to: to.clone(),
            });
        }
        if let Err(err) = move_file_noclobber(archive.as_std_path(), plan.destination.as_std_path())
        {
            // Put the single run back so the directory keeps its invariant.
            for (from, to) in plan.renames.iter().rev() {
                let _ = move_file_noclobber(to.as_std_path(), from.as_std_path());
            }
            return Err(err);
        }
        tracing::info!(path = %plan.destination, run = ?plan.run, "placed archive");

        Ok(ReconcileOutcome::Placed {
            path: plan.destination,
            run: plan.run,
            renamed,
        })
    }
}

/// Extension of a downloaded archive, keeping `.nii.gz` style double suffixes.
pub fn archive_extension(path: &Utf8Path) -> String {
    let name = path.file_name().unwrap_or_default();
    for double in ["nii.gz", "tar.gz"] {
        if name.ends_with(&format!(".{double}")) {
            return double.to_string();
        }
    }
    path.extension().unwrap_or("zip").to_string()
}

/// Exclusive marker file guarding scan+rename in one directory.
struct DirLock {
    path: Utf8PathBuf,
    _file: File,
}

impl DirLock {
    fn acquire(dir: &Utf8Path) -> Result<Self, BidsError> {
        let path = dir.join(LOCK_FILE);
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path.as_std_path())
            .map_err(|err| match err.kind() {
                std::io::ErrorKind::AlreadyExists => {
                    BidsError::LockHeld(path.clone().into_std_path_buf())
                }
                _ => BidsError::Filesystem(format!("lock {path}: {err}")),
            })?;
        Ok(Self { path, _file: file })
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.path.as_std_path());
    }
}
