use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Catch-all type and subtype; always part of a taxonomy.
pub const OTHER: &str = "other";

const BUILTIN: &[(&str, &[&str])] = &[
    (
        "research",
        &[
            "research_paper",
            "research_proposal",
            "research_review",
            "research_benchmark_tests",
        ],
    ),
    (
        "legal",
        &[
            "nda",
            "employee_contract",
            "compliance_guideline",
            "company_bylaws",
            "company_incorporation",
            "litigation",
            "patent",
        ],
    ),
    (
        "finance",
        &[
            "bank_document",
            "financial_statement",
            "financial_report",
            "financial_analysis",
            "financial_forecast",
        ],
    ),
    (
        "hr",
        &[
            "cv",
            "cover_letter",
            "job_application",
            "job_interview_guidelines",
            "job_offer",
            "job_post",
        ],
    ),
    (
        "engineering",
        &[
            "design_specification",
            "code",
            "documentation",
            "config",
            "infra",
            "security",
        ],
    ),
    ("security", &["threat_report", "incident_report"]),
    (
        "marketing",
        &["marketing_plan", "marketing_report", "marketing_strategy"],
    ),
    (
        "content_creation",
        &["blog_post", "social_media_post", "email_template"],
    ),
];

/// Errors raised while loading a taxonomy file.
#[derive(Debug, Error)]
pub enum TaxonomyError {
    /// File could not be read.
    #[error("failed to read taxonomy {path}: {source}")]
    Io {
        /// Taxonomy path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// File is not a valid taxonomy document.
    #[error("invalid taxonomy: {0}")]
    Parse(#[from] toml::de::Error),
}

/// One document type and the subtypes it admits.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DocumentType {
    /// Type name as the model should answer it.
    pub name: String,
    /// Admissible subtypes, `other` last.
    #[serde(default)]
    pub subtypes: Vec<String>,
}

#[derive(Deserialize)]
struct TaxonomyFile {
    #[serde(default)]
    types: Vec<DocumentType>,
}

/// Closed, ordered mapping of document types to subtypes.
///
/// Every type admits `other` as a subtype, and `other` is always a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Taxonomy {
    types: Vec<DocumentType>,
}

impl Default for Taxonomy {
    fn default() -> Self {
        Self::builtin()
    }
}

impl Taxonomy {
    /// Normalize `types` into a taxonomy.
    pub fn new(types: impl IntoIterator<Item = DocumentType>) -> Self {
        let mut normalized: Vec<DocumentType> = Vec::new();
        for mut entry in types {
            entry.name = entry.name.trim().to_lowercase();
            if entry.name.is_empty() || normalized.iter().any(|known| known.name == entry.name) {
                continue;
            }
            entry.subtypes = entry
                .subtypes
                .iter()
                .map(|subtype| subtype.trim().to_lowercase())
                .filter(|subtype| !subtype.is_empty() && subtype != OTHER)
                .collect();
            entry.subtypes.push(OTHER.to_string());
            normalized.push(entry);
        }

        // `other` always closes the list so the model sees it last.
        if let Some(index) = normalized.iter().position(|entry| entry.name == OTHER) {
            let other = normalized.remove(index);
            normalized.push(other);
        } else {
            normalized.push(DocumentType {
                name: OTHER.to_string(),
                subtypes: vec![OTHER.to_string()],
            });
        }

        Self { types: normalized }
    }

    /// Built-in document taxonomy.
    pub fn builtin() -> Self {
        Self::new(BUILTIN.iter().map(|(name, subtypes)| DocumentType {
            name: (*name).to_string(),
            subtypes: subtypes.iter().map(|subtype| (*subtype).to_string()).collect(),
        }))
    }

    /// Parse a TOML document made of `[[types]]` tables with `name` and `subtypes`.
    pub fn from_toml(raw: &str) -> Result<Self, TaxonomyError> {
        let file: TaxonomyFile = toml::from_str(raw)?;
        Ok(Self::new(file.types))
    }

    /// Load from `path`, or the built-in taxonomy when no path is configured.
    pub fn load(path: Option<&Path>) -> Result<Self, TaxonomyError> {
        let Some(path) = path else {
            return Ok(Self::builtin());
        };
        let raw = std::fs::read_to_string(path).map_err(|source| TaxonomyError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let taxonomy = Self::from_toml(&raw)?;
        tracing::debug!(path = %path.display(), types = taxonomy.types.len(), "Loaded taxonomy");
        Ok(taxonomy)
    }

    /// Type names in prompt order.
    pub fn type_names(&self) -> impl Iterator<Item = &str> {
        self.types.iter().map(|entry| entry.name.as_str())
    }

    /// Subtypes of `doc_type`, if it is part of the taxonomy.
    pub fn subtypes(&self, doc_type: &str) -> Option<&[String]> {
        self.types
            .iter()
            .find(|entry| entry.name == doc_type)
            .map(|entry| entry.subtypes.as_slice())
    }

    /// Whether `doc_type` is a known type.
    pub fn contains(&self, doc_type: &str) -> bool {
        self.subtypes(doc_type).is_some()
    }
}
