//! Typed row filters
//!
//! Filters stay structured until a request is built; `render` produces the
//! OData v3 `$filter` text. String literals are quoted with single quotes and
//! embedded quotes are doubled.

use crate::{CatalogError, Result};
use serde::{Deserialize, Serialize};
use std::fmt::Write;

/// Numeric comparison operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompareOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl CompareOp {
    pub fn as_odata(self) -> &'static str {
        match self {
            CompareOp::Eq => "eq",
            CompareOp::Ne => "ne",
            CompareOp::Gt => "gt",
            CompareOp::Ge => "ge",
            CompareOp::Lt => "lt",
            CompareOp::Le => "le",
        }
    }
}

impl std::str::FromStr for CompareOp {
    type Err = CatalogError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "eq" | "=" | "==" => Ok(CompareOp::Eq),
            "ne" | "!=" => Ok(CompareOp::Ne),
            "gt" | ">" => Ok(CompareOp::Gt),
            "ge" | ">=" => Ok(CompareOp::Ge),
            "lt" | "<" => Ok(CompareOp::Lt),
            "le" | "<=" => Ok(CompareOp::Le),
            _ => Err(CatalogError::ValidationError(format!(
                "Unknown comparison operator: {}",
                s
            ))),
        }
    }
}

/// Predicate over the raw (untranslated) codes of a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// `Key eq 'value'`
    Equals { key: String, value: String },
    /// `substringof('needle', Key)`
    Substring { key: String, needle: String },
    /// `Key gt 10`
    Compare {
        key: String,
        cmp: CompareOp,
        number: f64,
    },
    And { clauses: Vec<Filter> },
    Or { clauses: Vec<Filter> },
}

impl Filter {
    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn substring(key: impl Into<String>, needle: impl Into<String>) -> Self {
        Filter::Substring {
            key: key.into(),
            needle: needle.into(),
        }
    }

    pub fn compare(key: impl Into<String>, cmp: CompareOp, number: f64) -> Self {
        Filter::Compare {
            key: key.into(),
            cmp,
            number,
        }
    }

    pub fn and(clauses: Vec<Filter>) -> Self {
        Filter::And { clauses }
    }

    pub fn or(clauses: Vec<Filter>) -> Self {
        Filter::Or { clauses }
    }

    /// Every column key the filter references, in first-seen order
    pub fn referenced_keys(&self) -> Vec<&str> {
        let mut keys = Vec::new();
        self.collect_keys(&mut keys);
        keys
    }

    fn collect_keys<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Filter::Equals { key, .. } | Filter::Substring { key, .. } | Filter::Compare { key, .. } => {
                if !out.contains(&key.as_str()) {
                    out.push(key);
                }
            }
            Filter::And { clauses } | Filter::Or { clauses } => {
                for clause in clauses {
                    clause.collect_keys(out);
                }
            }
        }
    }

    /// Structural checks that do not need the dataset's columns
    pub fn check_shape(&self) -> Result<()> {
        match self {
            Filter::And { clauses } | Filter::Or { clauses } => {
                if clauses.is_empty() {
                    return Err(CatalogError::ValidationError(
                        "and/or filter needs at least one clause".to_string(),
                    ));
                }
                clauses.iter().try_for_each(Filter::check_shape)
            }
            Filter::Compare { key, number, .. } if !number.is_finite() => Err(
                CatalogError::ValidationError(format!("Comparison on '{}' needs a finite number", key)),
            ),
            _ => Ok(()),
        }
    }

    /// OData v3 `$filter` text
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out);
        out
    }

    fn render_into(&self, out: &mut String) {
        match self {
            Filter::Equals { key, value } => {
                let _ = write!(out, "{} eq {}", key, quote(value));
            }
            Filter::Substring { key, needle } => {
                let _ = write!(out, "substringof({}, {})", quote(needle), key);
            }
            Filter::Compare { key, cmp, number } => {
                let _ = write!(out, "{} {} {}", key, cmp.as_odata(), format_number(*number));
            }
            Filter::And { clauses } => render_joined(clauses, " and ", out),
            Filter::Or { clauses } => render_joined(clauses, " or ", out),
        }
    }
}

fn render_joined(clauses: &[Filter], joiner: &str, out: &mut String) {
    for (i, clause) in clauses.iter().enumerate() {
        if i > 0 {
            out.push_str(joiner);
        }
        out.push('(');
        clause.render_into(out);
        out.push(')');
    }
}

fn quote(literal: &str) -> String {
    format!("'{}'", literal.replace('\'', "''"))
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{}", n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_leaves() {
        assert_eq!(Filter::equals("RegioS", "NL01").render(), "RegioS eq 'NL01'");
        assert_eq!(
            Filter::substring("Perioden", "2023").render(),
            "substringof('2023', Perioden)"
        );
        assert_eq!(
            Filter::compare("Bevolking_1", CompareOp::Gt, 10.0).render(),
            "Bevolking_1 gt 10"
        );
        assert_eq!(
            Filter::compare("Rate_2", CompareOp::Le, 2.5).render(),
            "Rate_2 le 2.5"
        );
    }

    #[test]
    fn test_render_nested() {
        let filter = Filter::and(vec![
            Filter::equals("RegioS", "NL01"),
            Filter::or(vec![
                Filter::substring("Perioden", "2022"),
                Filter::substring("Perioden", "2023"),
            ]),
        ]);
        assert_eq!(
            filter.render(),
            "(RegioS eq 'NL01') and ((substringof('2022', Perioden)) or (substringof('2023', Perioden)))"
        );
    }

    #[test]
    fn test_quotes_are_doubled() {
        assert_eq!(
            Filter::equals("Naam", "'s-Hertogenbosch").render(),
            "Naam eq '''s-Hertogenbosch'"
        );
    }

    #[test]
    fn test_empty_group_rejected() {
        assert!(Filter::and(vec![]).check_shape().is_err());
        assert!(Filter::and(vec![Filter::or(vec![])]).check_shape().is_err());
        assert!(Filter::compare("X", CompareOp::Eq, f64::NAN)
            .check_shape()
            .is_err());
        assert!(Filter::and(vec![Filter::equals("A", "1")])
            .check_shape()
            .is_ok());
    }

    #[test]
    fn test_referenced_keys_deduplicated() {
        let filter = Filter::or(vec![
            Filter::equals("RegioS", "NL01"),
            Filter::equals("RegioS", "GM0363"),
            Filter::substring("Perioden", "2023"),
        ]);
        assert_eq!(filter.referenced_keys(), vec!["RegioS", "Perioden"]);
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!(">=".parse::<CompareOp>().unwrap(), CompareOp::Ge);
        assert_eq!("ne".parse::<CompareOp>().unwrap(), CompareOp::Ne);
        assert!("~".parse::<CompareOp>().is_err());
    }

    #[test]
    fn test_filter_serde_is_tagged() {
        let json = serde_json::to_value(Filter::equals("RegioS", "NL01")).unwrap();
        assert_eq!(json["op"], "equals");
        let back: Filter = serde_json::from_value(json).unwrap();
        assert_eq!(back, Filter::equals("RegioS", "NL01"));
    }
}
