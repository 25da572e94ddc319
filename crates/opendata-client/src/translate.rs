//! Code to label translation of row batches.

use crate::error::{ClientError, Result};
use crate::metadata::MetadataResolver;
use opendata_core::{CatalogError, ColumnKind, DimensionVocabulary, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What to do with a code that has no vocabulary entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TranslationPolicy {
    /// Keep the raw code and log a warning
    #[default]
    PassThrough,
    /// Abort with a translation error
    Fail,
}

impl std::fmt::Display for TranslationPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TranslationPolicy::PassThrough => write!(f, "pass_through"),
            TranslationPolicy::Fail => write!(f, "fail"),
        }
    }
}

impl std::str::FromStr for TranslationPolicy {
    type Err = CatalogError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "pass_through" | "passthrough" => Ok(TranslationPolicy::PassThrough),
            "fail" => Ok(TranslationPolicy::Fail),
            _ => Err(CatalogError::ValidationError(format!(
                "Unknown translation policy: {} (expected pass_through or fail)",
                s
            ))),
        }
    }
}

/// Replaces dimension codes with labels using cached vocabularies.
///
/// Time dimensions keep their codes unless configured otherwise, since
/// period codes are what filters match on.
pub struct Translator {
    resolver: Arc<MetadataResolver>,
    policy: TranslationPolicy,
    translate_time_dimensions: bool,
}

impl Translator {
    pub fn new(
        resolver: Arc<MetadataResolver>,
        policy: TranslationPolicy,
        translate_time_dimensions: bool,
    ) -> Self {
        Self {
            resolver,
            policy,
            translate_time_dimensions,
        }
    }

    pub fn policy(&self) -> TranslationPolicy {
        self.policy
    }

    /// Translate every dimension column present in `rows`, in place.
    pub async fn translate_rows(&self, dataset_id: &str, rows: &mut [Row]) -> Result<()> {
        let Some(first) = rows.first() else {
            return Ok(());
        };
        let structure = self.resolver.get_structure(dataset_id).await?;

        let targets: Vec<&str> = structure
            .dimensions()
            .filter(|c| self.translate_time_dimensions || c.kind != ColumnKind::TimeDimension)
            .map(|c| c.key.as_str())
            .filter(|key| first.contains_key(*key))
            .collect();

        for column in targets {
            let vocabulary = match self.resolver.get_vocabulary(dataset_id, column).await {
                Ok(v) => v,
                Err(e) if self.policy == TranslationPolicy::PassThrough => {
                    tracing::warn!(
                        dataset = %dataset_id,
                        dimension = %column,
                        error = %e,
                        "Vocabulary unavailable, keeping raw codes"
                    );
                    continue;
                }
                Err(e) => return Err(e),
            };
            self.translate_column(dataset_id, column, &vocabulary, rows)?;
        }
        Ok(())
    }

    fn translate_column(
        &self,
        dataset_id: &str,
        column: &str,
        vocabulary: &DimensionVocabulary,
        rows: &mut [Row],
    ) -> Result<()> {
        let mut unknown: BTreeMap<String, usize> = BTreeMap::new();

        for row in rows.iter_mut() {
            let Some(Value::String(code)) = row.get_mut(column) else {
                continue;
            };
            match vocabulary.label(code) {
                Some(label) => *code = label.to_string(),
                None => match self.policy {
                    TranslationPolicy::Fail => {
                        return Err(ClientError::Translation {
                            dataset_id: dataset_id.to_string(),
                            dimension: column.to_string(),
                            code: code.trim().to_string(),
                        })
                    }
                    TranslationPolicy::PassThrough => {
                        *unknown.entry(code.trim().to_string()).or_default() += 1;
                    }
                },
            }
        }

        if !unknown.is_empty() {
            tracing::warn!(
                dataset = %dataset_id,
                dimension = %column,
                codes = ?unknown.keys().take(10).collect::<Vec<_>>(),
                distinct = unknown.len(),
                "Codes without vocabulary entry passed through"
            );
        }
        Ok(())
    }
}
