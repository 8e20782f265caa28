//! Metadata filter evaluator
//!
//! A filter is a JSON object treated as a conjunction over its keys. Field
//! keys map either to an operator object (`{"$gt": 5}`) or to a nested
//! object that extends the field path (`{"specs": {"storage": ...}}`).
//! Filters compile once into a rule list and are then evaluated against
//! each record's metadata document.
//!
//! Comparison policy is strict: no type coercion, with the single exception
//! that two JSON numbers compare numerically (so `4` matches `4.0`).
//! Missing fields, including missing intermediate objects, satisfy only
//! `$ne`, `$nin` and `$exists: false`.

use std::cmp::Ordering;
use std::fmt;

use serde_json::Value;

use crate::errors::{Result, TinyVecError};

#[derive(Debug, Clone)]
enum Cond {
    Eq(Value),
    Ne(Value),
    Gt(Value),
    Gte(Value),
    Lt(Value),
    Lte(Value),
    In(Vec<Value>),
    Nin(Vec<Value>),
    Exists(bool),
}

#[derive(Debug, Clone)]
struct Rule {
    path: Vec<String>,
    conds: Vec<Cond>,
}

/// A compiled filter document.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    rules: Vec<Rule>,
}

impl Filter {
    /// Compile a filter from its JSON text form.
    pub fn parse(raw: &str) -> Result<Self> {
        let doc: Value = serde_json::from_str(raw)
            .map_err(|e| TinyVecError::InvalidFilter(format!("not valid JSON: {e}")))?;
        Self::from_value(&doc)
    }

    /// Compile a filter from an already-parsed JSON document.
    pub fn from_value(doc: &Value) -> Result<Self> {
        let obj = match doc.as_object() {
            Some(obj) => obj,
            None => return Err(invalid("filter must be a JSON object")),
        };
        let mut rules = Vec::new();
        for (key, value) in obj {
            if key.starts_with('$') {
                return Err(invalid(format!(
                    "operator {key} cannot appear at the top level"
                )));
            }
            compile_field(&mut rules, vec![key.clone()], value)?;
        }
        Ok(Self { rules })
    }

    /// Evaluate against one metadata document. An empty filter matches
    /// everything.
    pub fn matches(&self, metadata: &Value) -> bool {
        self.rules.iter().all(|rule| {
            let field = resolve_path(metadata, &rule.path);
            rule.conds.iter().all(|cond| eval(cond, field))
        })
    }
}

fn invalid(msg: impl fmt::Display) -> TinyVecError {
    TinyVecError::InvalidFilter(msg.to_string())
}

fn compile_field(rules: &mut Vec<Rule>, path: Vec<String>, value: &Value) -> Result<()> {
    let obj = match value.as_object() {
        Some(obj) => obj,
        None => {
            return Err(invalid(format!(
                "field {} must map to an operator object or a nested object",
                path.join(".")
            )))
        }
    };

    let operator_keys = obj.keys().filter(|k| k.starts_with('$')).count();
    if operator_keys == 0 {
        // Nested object: every key extends the field path.
        for (key, sub) in obj {
            let mut extended = path.clone();
            extended.push(key.clone());
            compile_field(rules, extended, sub)?;
        }
        return Ok(());
    }
    if operator_keys != obj.len() {
        return Err(invalid(format!(
            "field {} mixes operators and nested fields",
            path.join(".")
        )));
    }

    let mut conds = Vec::with_capacity(obj.len());
    for (op, arg) in obj {
        conds.push(compile_op(op, arg)?);
    }
    rules.push(Rule { path, conds });
    Ok(())
}

fn compile_op(op: &str, arg: &Value) -> Result<Cond> {
    match op {
        "$eq" => Ok(Cond::Eq(arg.clone())),
        "$ne" => Ok(Cond::Ne(arg.clone())),
        "$gt" => Ok(Cond::Gt(arg.clone())),
        "$gte" => Ok(Cond::Gte(arg.clone())),
        "$lt" => Ok(Cond::Lt(arg.clone())),
        "$lte" => Ok(Cond::Lte(arg.clone())),
        "$in" => match arg.as_array() {
            Some(items) => Ok(Cond::In(items.clone())),
            None => Err(invalid("$in requires an array argument")),
        },
        "$nin" => match arg.as_array() {
            Some(items) => Ok(Cond::Nin(items.clone())),
            None => Err(invalid("$nin requires an array argument")),
        },
        "$exists" => match arg.as_bool() {
            Some(want) => Ok(Cond::Exists(want)),
            None => Err(invalid("$exists requires a boolean argument")),
        },
        other => Err(invalid(format!("unknown operator {other}"))),
    }
}

/// Walk a dotted path through nested objects. Any missing segment, or a
/// non-object intermediate, resolves to `None`.
fn resolve_path<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    let mut current = doc;
    for segment in path {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn eval(cond: &Cond, field: Option<&Value>) -> bool {
    match cond {
        Cond::Eq(want) => field.is_some_and(|v| json_eq(v, want)),
        Cond::Ne(want) => !field.is_some_and(|v| json_eq(v, want)),
        Cond::Gt(want) => cmp_numbers(field, want) == Some(Ordering::Greater),
        Cond::Gte(want) => matches!(
            cmp_numbers(field, want),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        Cond::Lt(want) => cmp_numbers(field, want) == Some(Ordering::Less),
        Cond::Lte(want) => matches!(
            cmp_numbers(field, want),
            Some(Ordering::Less | Ordering::Equal)
        ),
        Cond::In(set) => field.is_some_and(|v| in_set(v, set)),
        Cond::Nin(set) => !field.is_some_and(|v| in_set(v, set)),
        Cond::Exists(want) => field.is_some() == *want,
    }
}

/// Numeric comparison. `None` when either side is absent or not a number,
/// which every ordering operator treats as false.
fn cmp_numbers(field: Option<&Value>, want: &Value) -> Option<Ordering> {
    let lhs = field?.as_f64()?;
    let rhs = want.as_f64()?;
    lhs.partial_cmp(&rhs)
}

/// `$in` membership: scalar fields match by element equality; array fields
/// match on a non-empty intersection with the argument.
fn in_set(field: &Value, set: &[Value]) -> bool {
    match field {
        Value::Array(items) => items
            .iter()
            .any(|item| set.iter().any(|want| json_eq(item, want))),
        scalar => set.iter().any(|want| json_eq(scalar, want)),
    }
}

/// Strict equality, except numbers compare by value across integer and
/// float representations, recursively through arrays and objects.
fn json_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => x == y,
            _ => x == y,
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| json_eq(a, b))
        }
        (Value::Object(x), Value::Object(y)) => {
            x.len() == y.len()
                && x.iter()
                    .all(|(k, v)| y.get(k).is_some_and(|w| json_eq(v, w)))
        }
        _ => a == b,
    }
}
