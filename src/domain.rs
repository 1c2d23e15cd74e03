use std::fmt;
use std::str::FromStr;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::BidsError;

/// Format the portal converts a dataset to before zipping it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum FileType {
    Dicom,
    Nifti,
}

impl FileType {
    /// Value of the `format` query parameter on the download endpoint.
    pub fn download_format(self) -> &'static str {
        match self {
            FileType::Dicom => "dcm",
            FileType::Nifti => "nii",
        }
    }
}

impl fmt::Display for FileType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileType::Dicom => write!(f, "dicom"),
            FileType::Nifti => write!(f, "nifti"),
        }
    }
}

impl FromStr for FileType {
    type Err = BidsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "dicom" | "dcm" => Ok(FileType::Dicom),
            "nifti" | "nii" => Ok(FileType::Nifti),
            _ => Err(BidsError::InvalidFileType(value.to_string())),
        }
    }
}

/// One row of a catalog search, as returned by the portal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetRecord {
    #[serde(deserialize_with = "id_as_string")]
    pub id: String,
    pub subject_name: String,
    pub dataset_name: String,
}

impl DatasetRecord {
    pub fn matches_name(&self, expected: &str) -> bool {
        self.dataset_name.to_uppercase() == expected.to_uppercase()
    }
}

// The portal has served ids both as JSON strings and numbers.
fn id_as_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: serde::Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Text(String),
        Number(u64),
    }

    Ok(match RawId::deserialize(deserializer)? {
        RawId::Text(value) => value,
        RawId::Number(value) => value.to_string(),
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrefixSubstitution {
    pub from: String,
    pub to: String,
}

/// Directory-safe subject identifier derived from the catalog subject name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SubjectId(String);

impl SubjectId {
    pub fn derive(subject_name: &str, substitutions: &[PrefixSubstitution]) -> Self {
        let mut value = subject_name.replace(' ', "_");
        for substitution in substitutions {
            if substitution.from.is_empty() {
                continue;
            }
            value = value.replace(&substitution.from, &substitution.to);
        }
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a sequence lands in the layout and how its archives are named.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceSpec {
    pub dataset_name: String,
    pub modality_dir: String,
    #[serde(default)]
    pub label: String,
}

impl SequenceSpec {
    /// File stem shared by every run of this sequence for one subject.
    pub fn archive_stem(&self, subject: &SubjectId) -> String {
        if self.label.is_empty() {
            subject.as_str().to_string()
        } else {
            format!("{}_{}", subject.as_str(), self.label)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SortDirection {
    Asc,
    Desc,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SortOrder {
    pub field: String,
    pub direction: SortDirection,
}

impl Default for SortOrder {
    fn default() -> Self {
        Self {
            field: "id".to_string(),
            direction: SortDirection::Asc,
        }
    }
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let direction = match self.direction {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        };
        write!(f, "{},{}", self.field, direction)
    }
}

impl FromStr for SortOrder {
    type Err = BidsError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let (field, direction) = value
            .trim()
            .split_once(',')
            .ok_or_else(|| BidsError::InvalidSort(value.to_string()))?;
        let field = field.trim();
        if field.is_empty() || !field.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_') {
            return Err(BidsError::InvalidSort(value.to_string()));
        }
        let direction = match direction.trim().to_ascii_uppercase().as_str() {
            "ASC" => SortDirection::Asc,
            "DESC" => SortDirection::Desc,
            _ => return Err(BidsError::InvalidSort(value.to_string())),
        };
        Ok(Self {
            field: field.to_string(),
            direction,
        })
    }
}

/// Parameters of one catalog search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchQuery {
    pub study: String,
    pub subject_pattern: String,
    pub dataset_name: Option<String>,
    pub page_size: u32,
    pub sort: SortOrder,
    pub file_type: FileType,
}

impl SearchQuery {
    /// Solr expression sent as `searchText` in expert mode.
    pub fn search_text(&self) -> String {
        let mut text = format!("studyName:{}", self.study);
        if let Some(name) = &self.dataset_name {
            text.push_str(&format!(" AND datasetName:\"{name}\""));
        }
        text.push_str(&format!(" AND subjectName:{}", self.subject_pattern));
        text
    }
}
