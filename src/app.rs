use camino::{Utf8Path, Utf8PathBuf};
use serde::Serialize;

use crate::catalog::{CatalogClient, SearchOutcome};
use crate::config::ResolvedConfig;
use crate::domain::{DatasetRecord, SearchQuery, SequenceSpec};
use crate::error::BidsError;
use crate::layout::{BidsLayout, Provenance};
use crate::reconcile::{PendingRuns, ReconcileOutcome, Reconciler};

#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    pub dry_run: bool,
    /// Replaces the configured subject patterns when non-empty.
    pub subjects: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub overview: Vec<SubjectOverview>,
    pub items: Vec<FetchItemResult>,
    pub failures: Vec<FetchFailure>,
}

impl FetchResult {
    pub fn placed(&self) -> usize {
        self.items
            .iter()
            .filter(|item| item.action == FetchAction::Placed)
            .count()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubjectOverview {
    pub subject_pattern: String,
    pub datasets: Vec<DatasetRecord>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchAction {
    Placed,
    Planned,
    NameMismatch,
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchItemResult {
    pub subject_id: String,
    pub dataset_id: String,
    pub dataset_name: String,
    pub action: FetchAction,
    pub path: Option<String>,
    pub run: Option<u32>,
    /// Archives that became `_run-1` when this one arrived.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub renamed: Vec<String>,
}

impl FetchItemResult {
    fn unplaced(subject_id: String, record: &DatasetRecord) -> Self {
        Self {
            subject_id,
            dataset_id: record.id.clone(),
            dataset_name: record.dataset_name.clone(),
            action: FetchAction::NameMismatch,
            path: None,
            run: None,
            renamed: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FetchFailure {
    pub subject_pattern: String,
    pub dataset_name: Option<String>,
    pub dataset_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

fn emit(sink: &dyn ProgressSink, message: impl Into<String>) {
    sink.event(ProgressEvent {
        message: message.into(),
    });
}

pub struct App<C: CatalogClient> {
    layout: BidsLayout,
    catalog: C,
}

impl<C: CatalogClient> App<C> {
    pub fn new(layout: BidsLayout, catalog: C) -> Self {
        Self { layout, catalog }
    }

    pub fn layout(&self) -> &BidsLayout {
        &self.layout
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Directory archives are streamed into before they are reconciled.
    pub fn incoming_dir(&self) -> Utf8PathBuf {
        self.layout.root().join(".shanoir-bids").join("incoming")
    }

    pub fn fetch(
        &self,
        config: &ResolvedConfig,
        options: &FetchOptions,
        sink: &dyn ProgressSink,
    ) -> Result<FetchResult, BidsError> {
        let subjects = if options.subjects.is_empty() {
            config.subjects.clone()
        } else {
            options.subjects.clone()
        };
        if !options.dry_run {
            self.layout.ensure_root()?;
        }

        let mut result = FetchResult {
            overview: Vec::new(),
            items: Vec::new(),
            failures: Vec::new(),
        };
        let mut pending = PendingRuns::default();

        for pattern in &subjects {
            if pattern != "*" {
                match self.sequences(config, pattern) {
                    Ok(datasets) => {
                        emit(
                            sink,
                            format!("{pattern}: {} dataset(s) available", datasets.len()),
                        );
                        for record in &datasets {
                            emit(
                                sink,
                                format!("  {} - {}", record.subject_name, record.dataset_name),
                            );
                        }
                        result.overview.push(SubjectOverview {
                            subject_pattern: pattern.clone(),
                            datasets,
                        });
                    }
                    Err(err) => {
                        tracing::warn!(subject = %pattern, %err, "overview search failed");
                        result.failures.push(FetchFailure {
                            subject_pattern: pattern.clone(),
                            dataset_name: None,
                            dataset_id: None,
                            message: err.to_string(),
                        });
                    }
                }
            }

            for sequence in &config.sequences {
                self.fetch_sequence(
                    config,
                    pattern,
                    sequence,
                    options,
                    sink,
                    &mut pending,
                    &mut result,
                );
            }
        }

        Ok(result)
    }

    /// Every dataset the catalog holds for a subject pattern, whatever its name.
    pub fn sequences(
        &self,
        config: &ResolvedConfig,
        subject_pattern: &str,
    ) -> Result<Vec<DatasetRecord>, BidsError> {
        let query = build_query(config, subject_pattern, None);
        Ok(self.catalog.search(&query)?.into_records())
    }

    #[allow(clippy::too_many_arguments)]
    fn fetch_sequence(
        &self,
        config: &ResolvedConfig,
        pattern: &str,
        sequence: &SequenceSpec,
        options: &FetchOptions,
        sink: &dyn ProgressSink,
        pending: &mut PendingRuns,
        result: &mut FetchResult,
    ) {
        let query = build_query(config, pattern, Some(&sequence.dataset_name));
        let records = match self.catalog.search(&query) {
            Ok(SearchOutcome::Found(records)) => records,
            Ok(SearchOutcome::NoContent) => {
                emit(
                    sink,
                    format!("{pattern} / {}: no file found", sequence.dataset_name),
                );
                return;
            }
            Err(err) => {
                tracing::warn!(
                    subject = %pattern,
                    sequence = %sequence.dataset_name,
                    %err,
                    "search failed"
                );
                result.failures.push(FetchFailure {
                    subject_pattern: pattern.to_string(),
                    dataset_name: Some(sequence.dataset_name.clone()),
                    dataset_id: None,
                    message: err.to_string(),
                });
                return;
            }
        };

        emit(
            sink,
            format!(
                "sequence {}: {} item(s) found",
                sequence.dataset_name,
                records.len()
            ),
        );

        let reconciler = Reconciler::new(&self.layout, &config.subject_prefixes);
        for record in records {
            emit(
                sink,
                format!(
                    "subject {} - {} - id {}",
                    record.subject_name, record.dataset_name, record.id
                ),
            );
            match self.fetch_record(&reconciler, config, &record, sequence, options, pending) {
                Ok(item) => {
                    if item.action == FetchAction::NameMismatch {
                        emit(sink, format!("{}: nothing downloaded", item.subject_id));
                    }
                    result.items.push(item);
                }
                Err(err) => {
                    tracing::warn!(dataset = %record.id, %err, "dataset not placed");
                    result.failures.push(FetchFailure {
                        subject_pattern: pattern.to_string(),
                        dataset_name: Some(record.dataset_name.clone()),
                        dataset_id: Some(record.id.clone()),
                        message: err.to_string(),
                    });
                }
            }
        }
    }

    fn fetch_record(
        &self,
        reconciler: &Reconciler<'_>,
        config: &ResolvedConfig,
        record: &DatasetRecord,
        sequence: &SequenceSpec,
        options: &FetchOptions,
        pending: &mut PendingRuns,
    ) -> Result<FetchItemResult, BidsError> {
        let subject_id = reconciler.subject_id(record);
        let mut item = FetchItemResult::unplaced(subject_id.to_string(), record);

        if options.dry_run {
            if let Some(plan) = reconciler.preview("zip", record, sequence, pending)? {
                item.action = FetchAction::Planned;
                item.path = Some(plan.destination.to_string());
                item.run = plan.run;
                item.renamed = plan.renames.iter().map(|(_, to)| to.to_string()).collect();
            }
            return Ok(item);
        }

        // A broad subject filter can return other sequences; skip those before downloading.
        if !record.matches_name(&sequence.dataset_name) {
            tracing::warn!(
                subject = %subject_id,
                expected = %sequence.dataset_name,
                actual = %record.dataset_name,
                "dataset name mismatch, nothing downloaded"
            );
            return Ok(item);
        }

        let incoming = self.incoming_dir();
        let downloaded = self
            .catalog
            .download(record, config.file_type, incoming.as_std_path())?;
        let archive = Utf8PathBuf::from_path_buf(downloaded)
            .map_err(|_| BidsError::Filesystem("non-utf8 archive path".to_string()))?;

        self.apply_outcome(item, reconciler.place(&archive, record, sequence)?, record)
    }

    /// Places an archive that was downloaded outside of `fetch`.
    pub fn place(
        &self,
        config: &ResolvedConfig,
        archive: &Utf8Path,
        record: &DatasetRecord,
        sequence: &SequenceSpec,
    ) -> Result<FetchItemResult, BidsError> {
        let reconciler = Reconciler::new(&self.layout, &config.subject_prefixes);
        let item = FetchItemResult::unplaced(reconciler.subject_id(record).to_string(), record);
        self.apply_outcome(item, reconciler.place(archive, record, sequence)?, record)
    }

    fn apply_outcome(
        &self,
        mut item: FetchItemResult,
        outcome: ReconcileOutcome,
        record: &DatasetRecord,
    ) -> Result<FetchItemResult, BidsError> {
        match outcome {
            ReconcileOutcome::Placed { path, run, renamed } => {
                for moved in &renamed {
                    self.layout.record_rename(&moved.from, &moved.to)?;
                }
                self.layout.append_provenance(&Provenance {
                    downloaded_at: chrono::Utc::now().to_rfc3339(),
                    dataset_id: record.id.clone(),
                    subject_name: record.subject_name.clone(),
                    dataset_name: record.dataset_name.clone(),
                    path: path.to_string(),
                    tool: format!("shanoir-bids/{}", env!("CARGO_PKG_VERSION")),
                    renamed_from: None,
                })?;
                item.action = FetchAction::Placed;
                item.path = Some(path.to_string());
                item.run = run;
                item.renamed = renamed.iter().map(|moved| moved.to.to_string()).collect();
            }
            ReconcileOutcome::NameMismatch { .. } => {
                item.action = FetchAction::NameMismatch;
            }
        }
        Ok(item)
    }
}

pub fn build_query(
    config: &ResolvedConfig,
    subject_pattern: &str,
    dataset_name: Option<&str>,
) -> SearchQuery {
    SearchQuery {
        study: config.study.clone(),
        subject_pattern: subject_pattern.to_string(),
        dataset_name: dataset_name.map(str::to_string),
        page_size: config.page_size,
        sort: config.sort.clone(),
        file_type: config.file_type,
    }
}
