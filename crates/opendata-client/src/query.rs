//! Query builder: validates a [`QuerySpec`] against the dataset's columns and
//! renders the OData request parameters.

use crate::error::{ClientError, Result};
use crate::metadata::MetadataResolver;
use crate::upstream::PageRequest;
use opendata_core::validation::{validate_column_key, validate_dataset_id};
use opendata_core::{DatasetStructure, QuerySpec};
use std::sync::Arc;

/// Rendered request parameters for a row query, minus the page window
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryParams {
    pub dataset_id: String,
    /// `$filter` text
    pub filter: Option<String>,
    /// `$select` columns
    pub select: Option<Vec<String>>,
}

impl QueryParams {
    /// Unfiltered query over every column
    pub fn all(dataset_id: impl Into<String>) -> Self {
        Self {
            dataset_id: dataset_id.into(),
            filter: None,
            select: None,
        }
    }

    /// Percent-encoded query string for `TypedDataSet`
    pub fn to_query_string(&self, page: PageRequest) -> String {
        let mut pairs: Vec<(&str, String)> = vec![
            ("$format", "json".to_string()),
            ("$top", page.top.to_string()),
            ("$skip", page.skip.to_string()),
        ];
        if let Some(filter) = &self.filter {
            pairs.push(("$filter", filter.clone()));
        }
        if let Some(select) = &self.select {
            pairs.push(("$select", select.join(",")));
        }
        if page.inline_count {
            pairs.push(("$inlinecount", "allpages".to_string()));
        }

        pairs
            .iter()
            .map(|(k, v)| format!("{}={}", k, urlencoding::encode(v)))
            .collect::<Vec<_>>()
            .join("&")
    }
}

/// Checks queries against resolved structures before any data request
#[derive(Clone)]
pub struct QueryBuilder {
    resolver: Arc<MetadataResolver>,
}

impl QueryBuilder {
    pub fn new(resolver: Arc<MetadataResolver>) -> Self {
        Self { resolver }
    }

    /// Validate `spec` and render its parameters.
    ///
    /// Resolves the dataset structure (cache first). Unknown filter keys fail
    /// with `InvalidFilter`, unknown projection columns with `InvalidColumn`.
    pub async fn build(&self, spec: &QuerySpec) -> Result<QueryParams> {
        validate_dataset_id(&spec.dataset_id)?;
        if let Some(filter) = &spec.filter {
            filter.check_shape().map_err(|e| ClientError::InvalidFilter {
                dataset_id: spec.dataset_id.clone(),
                message: e.to_string(),
            })?;
        }
        let structure = self.resolver.get_structure(&spec.dataset_id).await?;
        build_params(spec, &structure)
    }
}

/// Validate `spec` against a known structure and render its parameters.
pub fn build_params(spec: &QuerySpec, structure: &DatasetStructure) -> Result<QueryParams> {
    let filter = match &spec.filter {
        Some(filter) => {
            filter.check_shape().map_err(|e| ClientError::InvalidFilter {
                dataset_id: spec.dataset_id.clone(),
                message: e.to_string(),
            })?;
            if let Some(unknown) = filter
                .referenced_keys()
                .into_iter()
                .find(|key| !structure.has_column(key))
            {
                return Err(ClientError::InvalidFilter {
                    dataset_id: spec.dataset_id.clone(),
                    message: format!(
                        "unknown column '{}' (known: {})",
                        unknown,
                        structure.column_keys().join(", ")
                    ),
                });
            }
            Some(filter.render())
        }
        None => None,
    };

    let select = match &spec.projection {
        Some(columns) if columns.is_empty() => None,
        Some(columns) => {
            for column in columns {
                if validate_column_key(column).is_err() || !structure.has_column(column) {
                    return Err(ClientError::InvalidColumn {
                        dataset_id: spec.dataset_id.clone(),
                        column: column.clone(),
                    });
                }
            }
            Some(columns.clone())
        }
        None => None,
    };

    Ok(QueryParams {
        dataset_id: spec.dataset_id.clone(),
        filter,
        select,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendata_core::{ColumnDefinition, ColumnKind, CompareOp, Filter};

    fn structure() -> DatasetStructure {
        let column = |key: &str, kind| ColumnDefinition {
            key: key.to_string(),
            kind,
            title: key.to_string(),
            description: None,
            unit: None,
            data_type: None,
            vocabulary: None,
        };
        DatasetStructure {
            dataset_id: "85313NED".into(),
            columns: vec![
                column("Perioden", ColumnKind::TimeDimension),
                column("RegioS", ColumnKind::Dimension),
                column("Bevolking_1", ColumnKind::Topic),
            ],
        }
    }

    #[test]
    fn test_unknown_filter_key() {
        let spec = QuerySpec::new("85313NED").with_filter(Filter::equals("DoesNotExist", "x"));
        let err = build_params(&spec, &structure()).unwrap_err();
        match err {
            ClientError::InvalidFilter { dataset_id, message } => {
                assert_eq!(dataset_id, "85313NED");
                assert!(message.contains("DoesNotExist"));
            }
            other => panic!("expected invalid filter, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_projection_column() {
        let spec = QuerySpec::new("85313NED").with_projection(["RegioS", "Inwoners"]);
        let err = build_params(&spec, &structure()).unwrap_err();
        assert!(matches!(err, ClientError::InvalidColumn { column, .. } if column == "Inwoners"));
    }

    #[test]
    fn test_empty_group_is_invalid_filter() {
        let spec = QuerySpec::new("85313NED").with_filter(Filter::or(vec![]));
        let err = build_params(&spec, &structure()).unwrap_err();
        assert!(matches!(err, ClientError::InvalidFilter { .. }));
    }

    #[test]
    fn test_renders_params() {
        let spec = QuerySpec::new("85313NED")
            .with_filter(Filter::and(vec![
                Filter::equals("RegioS", "NL01"),
                Filter::compare("Bevolking_1", CompareOp::Ge, 1000.0),
            ]))
            .with_projection(["Perioden", "Bevolking_1"]);
        let params = build_params(&spec, &structure()).unwrap();

        assert_eq!(
            params.filter.as_deref(),
            Some("(RegioS eq 'NL01') and (Bevolking_1 ge 1000)")
        );
        assert_eq!(
            params.select,
            Some(vec!["Perioden".to_string(), "Bevolking_1".to_string()])
        );
    }

    #[test]
    fn test_query_string_encoding() {
        let params = QueryParams {
            dataset_id: "85313NED".into(),
            filter: Some("RegioS eq 'NL01'".into()),
            select: Some(vec!["RegioS".into(), "Perioden".into()]),
        };
        let qs = params.to_query_string(PageRequest {
            top: 1000,
            skip: 2000,
            inline_count: true,
        });
        assert_eq!(
            qs,
            "$format=json&$top=1000&$skip=2000&$filter=RegioS%20eq%20%27NL01%27&$select=RegioS%2CPerioden&$inlinecount=allpages"
        );

        let qs = QueryParams::all("X").to_query_string(PageRequest {
            top: 1,
            skip: 0,
            inline_count: false,
        });
        assert_eq!(qs, "$format=json&$top=1&$skip=0");
    }
}
