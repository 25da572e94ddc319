//! `--where` argument parsing.
//!
//! Each clause is `KEY OP VALUE` with one of:
//!
//! | op | meaning |
//! | --- | --- |
//! | `=` | code equals value |
//! | `~` | value occurs in the code |
//! | `!=` `>` `>=` `<` `<=` | numeric comparison |

use opendata_core::{CompareOp, Filter};

pub fn parse_clause(clause: &str) -> Result<Filter, String> {
    let (start, op_len) = find_operator(clause)
        .ok_or_else(|| format!("'{}' has no operator (use =, ~, !=, >, >=, < or <=)", clause))?;
    let key = clause[..start].trim();
    let op = &clause[start..start + op_len];
    let value = clause[start + op_len..].trim();

    if key.is_empty() {
        return Err(format!("'{}' has no column key", clause));
    }
    if value.is_empty() {
        return Err(format!("'{}' has no value", clause));
    }

    match op {
        "=" => Ok(Filter::equals(key, value)),
        "~" => Ok(Filter::substring(key, value)),
        _ => {
            let cmp: CompareOp = op.parse().map_err(|e| format!("{}", e))?;
            let number: f64 = value
                .parse()
                .map_err(|_| format!("'{}' compares against a non-number '{}'", clause, value))?;
            Ok(Filter::compare(key, cmp, number))
        }
    }
}

/// Combine clauses with `and`, or with `or` when `any` is set
pub fn parse_clauses(clauses: &[String], any: bool) -> Result<Option<Filter>, String> {
    let mut filters = clauses
        .iter()
        .map(|c| parse_clause(c))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(match filters.len() {
        0 => None,
        1 => filters.pop(),
        _ if any => Some(Filter::or(filters)),
        _ => Some(Filter::and(filters)),
    })
}

fn find_operator(clause: &str) -> Option<(usize, usize)> {
    let start = clause.find(['=', '!', '<', '>', '~'])?;
    let rest = &clause[start..];
    let len = if rest.starts_with(">=") || rest.starts_with("<=") || rest.starts_with("!=") {
        2
    } else if rest.starts_with('!') {
        return None;
    } else {
        1
    };
    Some((start, len))
}
