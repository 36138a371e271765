//! Pre-flight dataset validation.
//!
//! The validator is a gate, not a filter: it runs every check independently
//! (no short-circuit), appends at most one issue per check, and leaves the
//! abort decision to the caller. I/O and parse failures degrade to a single
//! `validation_error` issue instead of propagating.

use crate::models::{Dataset, GeometryKind, ValidationConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, warn};

/// A single typed validation finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValidationIssue {
    /// Required fields absent from every record
    MissingFields { fields: Vec<String>, count: usize },

    /// Dataset declares no CRS
    MissingCrs,

    /// Dataset CRS differs from the expected identifier
    WrongCrs { expected: String, found: String },

    /// Records whose geometry kind differs from the expected kind
    InvalidGeometryType {
        expected: String,
        found: Vec<String>,
        count: usize,
    },

    /// Records with no geometry at all
    NullGeometries { count: usize },

    /// Geometries failing the validity predicate
    InvalidGeometries { count: usize },

    /// A caller-supplied per-field predicate rejected records
    CustomValidationError { field: String, count: usize },

    /// The dataset could not be read or parsed at all
    ValidationError { message: String },
}

/// Result of one `validate` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    /// Name of the validated dataset
    pub dataset: String,

    /// When validation ran
    pub timestamp: DateTime<Utc>,

    /// Number of records inspected
    pub record_count: usize,

    /// All findings; empty means the dataset passed
    pub issues: Vec<ValidationIssue>,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }
}

/// Caller-supplied predicate over one field's value. Receives `None` when a
/// record does not carry the field.
pub type FieldCheck = Box<dyn Fn(Option<&serde_json::Value>) -> bool + Send + Sync>;

/// Schema/geometry/CRS gate over a dataset.
pub struct Validator {
    required_fields: Vec<String>,
    expected_crs: String,
    expected_geometry: GeometryKind,
    custom_checks: Vec<(String, FieldCheck)>,
}

impl Validator {
    pub fn new(config: &ValidationConfig) -> Self {
        Self {
            required_fields: config.required_fields.clone(),
            expected_crs: config.expected_crs.clone(),
            expected_geometry: config.expected_geometry,
            custom_checks: Vec::new(),
        }
    }

    /// Register a per-field predicate. Records where the predicate returns
    /// false are counted into one `custom_validation_error` issue.
    pub fn add_check(
        mut self,
        field: impl Into<String>,
        check: impl Fn(Option<&serde_json::Value>) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.custom_checks.push((field.into(), Box::new(check)));
        self
    }

    /// Run every check over the dataset and collect the findings.
    pub fn validate(&self, dataset: &Dataset, name: &str) -> ValidationReport {
        let mut issues = Vec::new();

        self.check_required_fields(dataset, &mut issues);
        self.check_crs(dataset, &mut issues);
        self.check_geometry_types(dataset, &mut issues);
        self.check_null_geometries(dataset, &mut issues);
        self.check_geometry_validity(dataset, &mut issues);
        self.run_custom_checks(dataset, &mut issues);

        if issues.is_empty() {
            debug!(dataset = name, records = dataset.len(), "Validation passed");
        } else {
            warn!(
                dataset = name,
                records = dataset.len(),
                issues = issues.len(),
                "Validation found issues"
            );
        }

        ValidationReport {
            dataset: name.to_string(),
            timestamp: Utc::now(),
            record_count: dataset.len(),
            issues,
        }
    }

    /// Validate a JSONL dataset file. Unreadable or unparseable input
    /// degrades to a report with a single `validation_error` issue.
    pub fn validate_file(&self, path: &Path, name: &str) -> ValidationReport {
        match Dataset::load_jsonl(path) {
            Ok(dataset) => self.validate(&dataset, name),
            Err(e) => {
                warn!(dataset = name, error = %e, "Validation could not read dataset");
                ValidationReport {
                    dataset: name.to_string(),
                    timestamp: Utc::now(),
                    record_count: 0,
                    issues: vec![ValidationIssue::ValidationError {
                        message: e.to_string(),
                    }],
                }
            }
        }
    }

    fn check_required_fields(&self, dataset: &Dataset, issues: &mut Vec<ValidationIssue>) {
        if self.required_fields.is_empty() {
            return;
        }

        // Field presence is matched case-insensitively over the union of all
        // record attributes.
        let present: BTreeSet<String> = dataset
            .records
            .iter()
            .flat_map(|r| r.attributes.keys())
            .map(|k| k.to_lowercase())
            .collect();

        let missing: Vec<String> = self
            .required_fields
            .iter()
            .filter(|f| !present.contains(&f.to_lowercase()))
            .cloned()
            .collect();

        if !missing.is_empty() {
            issues.push(ValidationIssue::MissingFields {
                count: missing.len(),
                fields: missing,
            });
        }
    }

    fn check_crs(&self, dataset: &Dataset, issues: &mut Vec<ValidationIssue>) {
        if dataset.schema.crs.is_empty() {
            issues.push(ValidationIssue::MissingCrs);
        } else if dataset.schema.crs != self.expected_crs {
            issues.push(ValidationIssue::WrongCrs {
                expected: self.expected_crs.clone(),
                found: dataset.schema.crs.clone(),
            });
        }
    }

    fn check_geometry_types(&self, dataset: &Dataset, issues: &mut Vec<ValidationIssue>) {
        let mut found: BTreeSet<String> = BTreeSet::new();
        let mut count = 0;

        for record in &dataset.records {
            if let Some(geometry) = &record.geometry {
                if geometry.kind() != self.expected_geometry {
                    found.insert(geometry.kind().to_string());
                    count += 1;
                }
            }
        }

        if count > 0 {
            issues.push(ValidationIssue::InvalidGeometryType {
                expected: self.expected_geometry.to_string(),
                found: found.into_iter().collect(),
                count,
            });
        }
    }

    fn check_null_geometries(&self, dataset: &Dataset, issues: &mut Vec<ValidationIssue>) {
        let count = dataset
            .records
            .iter()
            .filter(|r| r.geometry.is_none())
            .count();
        if count > 0 {
            issues.push(ValidationIssue::NullGeometries { count });
        }
    }

    fn check_geometry_validity(&self, dataset: &Dataset, issues: &mut Vec<ValidationIssue>) {
        let count = dataset
            .records
            .iter()
            .filter_map(|r| r.geometry.as_ref())
            .filter(|g| !g.is_valid())
            .count();
        if count > 0 {
            issues.push(ValidationIssue::InvalidGeometries { count });
        }
    }

    fn run_custom_checks(&self, dataset: &Dataset, issues: &mut Vec<ValidationIssue>) {
        for (field, check) in &self.custom_checks {
            let count = dataset
                .records
                .iter()
                .filter(|r| !check(r.attributes.get(field)))
                .count();
            if count > 0 {
                issues.push(ValidationIssue::CustomValidationError {
                    field: field.clone(),
                    count,
                });
            }
        }
    }
}
