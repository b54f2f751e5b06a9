//! Filter Parser
//!
//! Turns a JSON filter document into a [`Query`].
//!
//! # Supported Syntax
//!
//! ```text
//! { "<path>": <literal> }                       equality
//! { "<path>": { "$op": <operand>, ... } }       operators, all must hold
//! { "$limit": <n> }                             result cap
//! ```
//!
//! Operators: `$eq $ne $gt $gte $lt $lte $in $exists $contains`.

use crate::query::ast::*;
use crate::query::error::{QueryError, QueryResult};
use serde_json::{Map, Value};

/// Pseudo-field carrying the result limit
pub const LIMIT_KEY: &str = "$limit";

/// Parse a filter document, capping `$limit` at `max_limit`
pub fn parse_filter(filter: &Value, max_limit: usize) -> QueryResult<Query> {
    let fields = match filter {
        Value::Null => return Ok(Query::all()),
        Value::Object(fields) => fields,
        other => {
            return Err(QueryError::InvalidFilter(format!(
                "filter must be an object, got {}",
                type_name(other)
            )))
        }
    };

    let mut limit = None;
    let mut filters = Vec::with_capacity(fields.len());

    for (field, condition) in fields {
        if field == LIMIT_KEY {
            limit = Some(parse_limit(condition)?.min(max_limit));
            continue;
        }
        if field.starts_with('$') {
            return Err(QueryError::UnknownOperator(field.clone()));
        }
        if field.is_empty() {
            return Err(QueryError::InvalidFilter("empty field path".to_string()));
        }

        match condition {
            Value::Object(ops) if is_operator_object(ops) => {
                for (op, operand) in ops {
                    filters.push(Filter::field(field, parse_predicate(field, op, operand)?));
                }
            }
            Value::Object(ops) if ops.keys().any(|k| k.starts_with('$')) => {
                return Err(QueryError::InvalidFilter(format!(
                    "field '{}' mixes operators and literal keys",
                    field
                )));
            }
            literal => filters.push(Filter::field(field, Predicate::Eq(literal.clone()))),
        }
    }

    Ok(Query {
        filter: Filter::And(filters),
        limit,
    })
}

fn is_operator_object(ops: &Map<String, Value>) -> bool {
    !ops.is_empty() && ops.keys().all(|k| k.starts_with('$'))
}

fn parse_limit(value: &Value) -> QueryResult<usize> {
    value
        .as_u64()
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
        .ok_or_else(|| QueryError::InvalidLimit(value.to_string()))
}

fn parse_predicate(field: &str, op: &str, operand: &Value) -> QueryResult<Predicate> {
    let operator = Operator::from_str(op).ok_or_else(|| QueryError::UnknownOperator(op.to_string()))?;

    let number = || {
        operand.as_f64().ok_or_else(|| {
            QueryError::InvalidFilter(format!(
                "{} on '{}' needs a number, got {}",
                operator,
                field,
                type_name(operand)
            ))
        })
    };

    Ok(match operator {
        Operator::Eq => Predicate::Eq(operand.clone()),
        Operator::Ne => Predicate::Ne(operand.clone()),
        Operator::Gt => Predicate::Gt(number()?),
        Operator::Gte => Predicate::Gte(number()?),
        Operator::Lt => Predicate::Lt(number()?),
        Operator::Lte => Predicate::Lte(number()?),
        Operator::In => match operand {
            Value::Array(options) => Predicate::In(options.clone()),
            other => {
                return Err(QueryError::InvalidFilter(format!(
                    "$in on '{}' needs an array, got {}",
                    field,
                    type_name(other)
                )))
            }
        },
        Operator::Exists => match operand {
            Value::Bool(expected) => Predicate::Exists(*expected),
            other => {
                return Err(QueryError::InvalidFilter(format!(
                    "$exists on '{}' needs a boolean, got {}",
                    field,
                    type_name(other)
                )))
            }
        },
        Operator::Contains => Predicate::Contains(operand.clone()),
    })
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
