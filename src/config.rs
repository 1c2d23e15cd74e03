use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use camino::Utf8PathBuf;
use directories::BaseDirs;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::domain::{FileType, PrefixSubstitution, SequenceSpec, SortOrder};
use crate::error::BidsError;

pub const DEFAULT_CONFIG_FILE: &str = "shanoir-bids.json";
pub const DEFAULT_HOST: &str = "shanoir.irisa.fr";
pub const DEFAULT_PAGE_SIZE: u32 = 200;
const MAX_PAGE_SIZE: u32 = 10_000;

#[derive(Debug, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub username: Option<String>,
    pub study: String,
    #[serde(default)]
    pub subjects: Option<SubjectEntry>,
    #[serde(default)]
    pub sequences: Vec<SequenceSpec>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub file_type: Option<String>,
    #[serde(default)]
    pub page_size: Option<u32>,
    #[serde(default)]
    pub sort: Option<String>,
    #[serde(default)]
    pub subject_prefixes: Vec<PrefixSubstitution>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SubjectEntry {
    Shorthand(String),
    List(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub host: String,
    pub username: Option<String>,
    pub study: String,
    pub subjects: Vec<String>,
    pub sequences: Vec<SequenceSpec>,
    pub output_dir: Utf8PathBuf,
    pub file_type: FileType,
    pub page_size: u32,
    pub sort: SortOrder,
    pub subject_prefixes: Vec<PrefixSubstitution>,
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn resolve(path: Option<&str>) -> Result<ResolvedConfig, BidsError> {
        let config_path = match path {
            Some(path) => PathBuf::from(path),
            None => PathBuf::from(DEFAULT_CONFIG_FILE),
        };

        if path.is_none() && !config_path.exists() {
            return Err(BidsError::MissingConfig);
        }

        let content = fs::read_to_string(&config_path)
            .map_err(|_| BidsError::ConfigRead(config_path.clone()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| BidsError::ConfigParse(err.to_string()))?;

        Self::resolve_config(config)
    }

    pub fn resolve_config(config: Config) -> Result<ResolvedConfig, BidsError> {
        let host = config
            .host
            .map(|host| host.trim().to_string())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        if host.is_empty() || host.contains('/') {
            return Err(BidsError::InvalidConfig(format!("invalid host `{host}`")));
        }

        let study = config.study.trim().to_string();
        if study.is_empty() {
            return Err(BidsError::InvalidConfig("study must not be empty".to_string()));
        }

        let subjects = match config.subjects {
            None => vec!["*".to_string()],
            Some(SubjectEntry::Shorthand(value)) => vec![value],
            Some(SubjectEntry::List(values)) => values,
        };
        let subjects = dedup_subjects(subjects);
        if subjects.is_empty() {
            return Err(BidsError::InvalidConfig(
                "subjects must contain at least one pattern".to_string(),
            ));
        }

        if config.sequences.is_empty() {
            return Err(BidsError::InvalidConfig(
                "at least one sequence is required".to_string(),
            ));
        }
        for sequence in &config.sequences {
            validate_sequence(sequence)?;
        }

        let page_size = config.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(BidsError::InvalidConfig(format!(
                "page_size must be between 1 and {MAX_PAGE_SIZE}"
            )));
        }

        let file_type = match config.file_type {
            Some(value) => value.parse()?,
            None => FileType::Dicom,
        };
        let sort = match config.sort {
            Some(value) => value.parse()?,
            None => SortOrder::default(),
        };

        Ok(ResolvedConfig {
            host,
            username: config.username.filter(|name| !name.trim().is_empty()),
            study,
            subjects,
            sequences: config.sequences,
            output_dir: Utf8PathBuf::from(config.output_dir.unwrap_or_else(|| "data".to_string())),
            file_type,
            page_size,
            sort,
            subject_prefixes: config.subject_prefixes,
        })
    }
}

// Subject lists are maintained by hand and tend to repeat entries.
fn dedup_subjects(subjects: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for subject in subjects {
        let subject = subject.trim().to_string();
        if subject.is_empty() || out.contains(&subject) {
            continue;
        }
        out.push(subject);
    }
    out
}

fn validate_sequence(sequence: &SequenceSpec) -> Result<(), BidsError> {
    if sequence.dataset_name.trim().is_empty() {
        return Err(BidsError::InvalidConfig(
            "sequence dataset_name must not be empty".to_string(),
        ));
    }
    let dir = sequence.modality_dir.as_str();
    let single_component = !dir.is_empty()
        && dir != "."
        && dir != ".."
        && !dir.contains('/')
        && !dir.contains('\\');
    if !single_component {
        return Err(BidsError::InvalidConfig(format!(
            "modality_dir `{dir}` must be a single directory name"
        )));
    }
    if sequence.label.contains('/') || sequence.label.contains('\\') {
        return Err(BidsError::InvalidConfig(format!(
            "label `{}` must not contain path separators",
            sequence.label
        )));
    }
    Ok(())
}

/// Install locations of the Anima toolchain, read from `~/.anima/config.txt`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toolchain {
    pub anima_dir: PathBuf,
    pub extra_data_root: PathBuf,
    pub scripts_root: PathBuf,
}

impl Toolchain {
    pub fn default_path() -> Result<PathBuf, BidsError> {
        BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".anima").join("config.txt"))
            .ok_or_else(|| BidsError::Filesystem("unable to resolve home directory".to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, BidsError> {
        let content =
            fs::read_to_string(path).map_err(|_| BidsError::ConfigRead(path.to_path_buf()))?;
        Self::parse(&content, path)
    }

    pub fn parse(content: &str, origin: &Path) -> Result<Self, BidsError> {
        let sections = parse_key_values(content);
        let section = sections.get("anima-scripts");
        let lookup = |key: &str| {
            section
                .and_then(|values| values.get(key))
                .filter(|value| !value.is_empty())
                .map(PathBuf::from)
                .ok_or_else(|| BidsError::MissingToolchainConfig {
                    path: origin.to_path_buf(),
                    key: key.to_string(),
                })
        };
        Ok(Self {
            anima_dir: lookup("anima")?,
            extra_data_root: lookup("extra-data-root")?,
            scripts_root: lookup("anima-scripts-root")?,
        })
    }

    pub fn anima_tool(&self, name: &str) -> PathBuf {
        self.anima_dir.join(name)
    }

    pub fn script(&self, relative: &str) -> PathBuf {
        self.scripts_root.join(relative)
    }
}

static SECTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\[\s*([^\]]+?)\s*\]$").unwrap());
static ENTRY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([^=:]+?)\s*[=:]\s*(.*)$").unwrap());

fn parse_key_values(content: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current = String::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(caps) = SECTION_RE.captures(line) {
            current = caps[1].to_string();
            continue;
        }
        if let Some(caps) = ENTRY_RE.captures(line) {
            sections
                .entry(current.clone())
                .or_default()
                .insert(caps[1].trim().to_lowercase(), caps[2].trim().to_string());
        }
    }
    sections
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn subjects_are_trimmed_and_deduplicated() {
        let subjects = dedup_subjects(vec![
            "longidep*037*mp".to_string(),
            " longidep*037*mp ".to_string(),
            "".to_string(),
            "longidep*038*dv".to_string(),
        ]);
        assert_eq!(subjects, vec!["longidep*037*mp", "longidep*038*dv"]);
    }

    #[test]
    fn toolchain_reads_anima_section() {
        let content = "\
[anima-scripts]
anima = /opt/anima/bin/
anima-scripts-root = /opt/anima/scripts/
extra-data-root = /opt/anima/data/
";
        let toolchain = Toolchain::parse(content, Path::new("config.txt")).unwrap();
        assert_eq!(
            toolchain.anima_tool("animaDTIEstimator"),
            PathBuf::from("/opt/anima/bin/animaDTIEstimator")
        );
        assert_eq!(toolchain.extra_data_root, PathBuf::from("/opt/anima/data/"));
    }

    #[test]
    fn key_values_by_section() {
        let content = "# anima\n[anima-scripts]\nanima: /a\n; note\n[other]\nanima = /b\n";
        for _ in 0..2 {
            let sections = parse_key_values(content);
            assert_eq!(sections["anima-scripts"]["anima"], "/a");
            assert_eq!(sections["other"]["anima"], "/b");
        }
    }

    #[test]
    fn toolchain_reports_missing_key() {
        let content = "[anima-scripts]\nanima = /opt/anima/bin/\n";
        let err = Toolchain::parse(content, Path::new("config.txt")).unwrap_err();
        assert_matches!(
            err,
            BidsError::MissingToolchainConfig { key, .. } if key == "extra-data-root"
        );
    }
}
