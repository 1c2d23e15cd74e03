use std::io::{self, Write};

use serde::Serialize;

use crate::app::{FetchResult, ProgressEvent, ProgressSink};
use crate::domain::DatasetRecord;
use crate::extract::SubjectExtraction;
use crate::pipeline::PipelineReport;

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Interactive,
    NonInteractive,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print_fetch(result: &FetchResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_sequences(records: &[DatasetRecord]) -> io::Result<()> {
        Self::print_json(&records)
    }

    pub fn print_extract(results: &[SubjectExtraction]) -> io::Result<()> {
        Self::print_json(&results)
    }

    pub fn print_pipeline(report: &PipelineReport) -> io::Result<()> {
        Self::print_json(report)
    }

    pub fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Echoes progress lines to stdout as they happen.
pub struct ConsoleOutput;

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        let mut stdout = io::stdout().lock();
        let _ = writeln!(stdout, "{}", event.message);
    }
}
