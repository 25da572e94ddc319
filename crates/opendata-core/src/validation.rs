//! Input validation
//!
//! Everything that ends up in a request URL, a SQL statement or a file name
//! passes through here first, so bad input fails before any network call.

use crate::{CatalogError, Result};

/// Maximum length for dataset identifiers
pub const MAX_DATASET_ID_LEN: usize = 100;

/// Maximum length for column keys and SQL table names
pub const MAX_COLUMN_KEY_LEN: usize = 128;

/// Maximum length for catalog search queries
pub const MAX_SEARCH_QUERY_LEN: usize = 500;

/// Maximum length for export file names
pub const MAX_FILE_NAME_LEN: usize = 255;

/// Validate a dataset identifier
///
/// Requirements:
/// - Not empty
/// - <= 100 characters
/// - ASCII alphanumeric, underscore, hyphen only
pub fn validate_dataset_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(CatalogError::ValidationError(
            "Dataset id cannot be empty".to_string(),
        ));
    }

    if id.len() > MAX_DATASET_ID_LEN {
        return Err(CatalogError::ValidationError(format!(
            "Dataset id too long: {} > {} characters",
            id.len(),
            MAX_DATASET_ID_LEN
        )));
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(CatalogError::ValidationError(format!(
            "Dataset id '{}' contains invalid characters (allowed: A-Z, a-z, 0-9, _, -)",
            id
        )));
    }

    Ok(())
}

/// Validate a column key (also used for dimension names)
///
/// Requirements:
/// - Not empty, <= 128 characters
/// - Starts with an ASCII letter or underscore
/// - ASCII alphanumeric and underscore only
pub fn validate_column_key(key: &str) -> Result<()> {
    validate_sql_identifier(key, "Column key")
}

/// Validate a SQL table name for the SQLite sink
pub fn validate_table_name(name: &str) -> Result<()> {
    validate_sql_identifier(name, "Table name")
}

fn validate_sql_identifier(value: &str, what: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CatalogError::ValidationError(format!(
            "{} cannot be empty",
            what
        )));
    }

    if value.len() > MAX_COLUMN_KEY_LEN {
        return Err(CatalogError::ValidationError(format!(
            "{} too long: {} > {} characters",
            what,
            value.len(),
            MAX_COLUMN_KEY_LEN
        )));
    }

    let mut chars = value.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !first_ok || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(CatalogError::ValidationError(format!(
            "{} '{}' is not a valid identifier (letters, digits, _; no leading digit)",
            what, value
        )));
    }

    Ok(())
}

/// Validate a catalog search query and return it trimmed
pub fn validate_search_query(query: &str) -> Result<String> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(CatalogError::ValidationError(
            "Search query cannot be empty".to_string(),
        ));
    }

    if trimmed.len() > MAX_SEARCH_QUERY_LEN {
        return Err(CatalogError::ValidationError(format!(
            "Search query too long: {} > {} characters",
            trimmed.len(),
            MAX_SEARCH_QUERY_LEN
        )));
    }

    Ok(trimmed.to_string())
}

/// Validate an export file name
///
/// Only a bare file name is accepted: no directory components, no leading
/// dot, no null bytes.
pub fn validate_file_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CatalogError::ValidationError(
            "File name cannot be empty".to_string(),
        ));
    }

    if name.len() > MAX_FILE_NAME_LEN {
        return Err(CatalogError::ValidationError(format!(
            "File name too long: {} > {} characters",
            name.len(),
            MAX_FILE_NAME_LEN
        )));
    }

    if name.contains('\0') {
        return Err(CatalogError::ValidationError(
            "File name contains null byte".to_string(),
        ));
    }

    if name.contains('/') || name.contains('\\') || name.contains("..") {
        return Err(CatalogError::ValidationError(format!(
            "File name '{}' must not contain path components",
            name
        )));
    }

    if name.starts_with('.') {
        return Err(CatalogError::ValidationError(format!(
            "File name '{}' must not start with a dot",
            name
        )));
    }

    Ok(())
}
