//! Alarm rule evaluation over flattened UVE trees.
//!
//! Operands are dotted paths walked by [`resolve`]. Path segments `*` and
//! `__value` enumerate object values, `__key` enumerates object keys, and a
//! list node fans every following comparison out over its elements. A missing
//! intermediate attribute resolves with `status == false`, which fails the
//! enclosing AND term; a missing final attribute resolves to `null` with
//! `status == true` and takes part in the comparison.
//!
//! Strings that themselves hold JSON are re-parsed and descended into, since
//! generators frequently nest serialized structs inside string fields.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::rules::{
    AlarmAndList, AlarmCondition, AlarmConditionMatch, AlarmConfig, AlarmMatch, AlarmOperation,
};
use crate::uve::UveKey;

/// Table whose entity keys lack the project prefix; the parent fq-name is
/// recovered from the first entry of `interface_list` instead.
pub const VM_TABLE: &str = "ObjectVMTable";

const LIST_ELEMENT: &str = "__list_element__";

/// Errors surfaced by rule evaluation. The caller still publishes an alarm
/// slot with `rules = None` when these occur.
#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("operand2 json literal is invalid: {0}")]
    BadJsonLiteral(String),
    #[error("values {0} and {1} cannot be ordered")]
    Incomparable(String, String),
    #[error("range operand2 must be a two-element list, got {0}")]
    BadRange(String),
}

// ---------------------------------------------------------------------------
// Path resolution
// ---------------------------------------------------------------------------

/// One step of the walked path: the attribute (or key) name and the value it
/// led to. List descents record a `__list_element__` node.
pub type PathNode = (String, Value);

/// A single resolution of an operand path.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub value: Value,
    pub uve_path: Vec<PathNode>,
    /// `false` when an intermediate attribute was missing.
    pub status: bool,
}

/// Result of resolving an operand: a single value, or a fan-out across dict
/// values / list elements.
#[derive(Debug)]
pub enum ResolvedOperand {
    One(Resolved),
    Many(Vec<Resolved>),
}

/// Resolves a dotted operand path against a flattened UVE.
#[must_use]
pub fn resolve(uve: &Value, operand: &str) -> ResolvedOperand {
    let segs: Vec<&str> = operand.split('.').collect();
    walk(uve, &segs, Vec::new())
}

fn walk(node: &Value, segs: &[&str], path: Vec<PathNode>) -> ResolvedOperand {
    if segs.is_empty() {
        return ResolvedOperand::One(Resolved {
            value: node.clone(),
            uve_path: path,
            status: true,
        });
    }
    match node {
        Value::Object(map) => match segs[0] {
            "*" | "__value" => {
                let mut out = Vec::new();
                for (k, v) in map {
                    let mut p = path.clone();
                    p.push((k.clone(), v.clone()));
                    collect(&mut out, walk(v, &segs[1..], p));
                }
                ResolvedOperand::Many(out)
            }
            "__key" => {
                let mut out = Vec::new();
                for (k, v) in map {
                    let mut p = path.clone();
                    p.push((k.clone(), v.clone()));
                    collect(&mut out, walk(&Value::String(k.clone()), &segs[1..], p));
                }
                ResolvedOperand::Many(out)
            }
            seg => {
                let next = map.get(seg).cloned().unwrap_or(Value::Null);
                let mut p = path;
                p.push((seg.to_string(), next.clone()));
                walk(&next, &segs[1..], p)
            }
        },
        Value::Array(items) => {
            let mut out = Vec::new();
            for item in items {
                let mut p = path.clone();
                p.push((LIST_ELEMENT.to_string(), item.clone()));
                collect(&mut out, walk(item, segs, p));
            }
            ResolvedOperand::Many(out)
        }
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(parsed) => walk(&parsed, segs, path),
            Err(_) => ResolvedOperand::One(Resolved {
                value: Value::Null,
                uve_path: path,
                status: false,
            }),
        },
        // Null, or a scalar with path segments left to walk.
        _ => ResolvedOperand::One(Resolved {
            value: Value::Null,
            uve_path: path,
            status: false,
        }),
    }
}

fn collect(out: &mut Vec<Resolved>, r: ResolvedOperand) {
    match r {
        ResolvedOperand::One(x) => out.push(x),
        ResolvedOperand::Many(v) => out.extend(v),
    }
}

/// JSON text of a value for match records. A string that already holds valid
/// JSON passes through verbatim.
#[must_use]
pub fn json_text(val: &Value) -> String {
    if let Value::String(s) = val {
        if serde_json::from_str::<Value>(s).is_ok() {
            return s.clone();
        }
    }
    val.to_string()
}

/// Resolves a variable path against the recorded walk of an operand.
fn attribute_from_path(attr: &str, path: &[PathNode]) -> Option<Value> {
    let segs: Vec<&str> = attr.split('.').collect();
    let mut ai = 0;
    let mut ui = 0;
    let mut pnode: Option<&PathNode> = None;
    while ai < segs.len() && ui < path.len() {
        if segs[ai] == "__key" {
            return Some(Value::String(path[ui].0.clone()));
        }
        if segs[ai] == "__value" {
            return Some(path[ui].1.clone());
        }
        if segs[ai] != "*" && segs[ai] != path[ui].0 {
            break;
        }
        pnode = Some(&path[ui]);
        ui += 1;
        ai += 1;
        if ui < path.len() && path[ui].0 == LIST_ELEMENT {
            pnode = Some(&path[ui]);
            ui += 1;
        }
    }
    let pnode = pnode?;
    let mut val = pnode.1.clone();
    for seg in &segs[ai..] {
        let Value::Object(map) = &val else {
            return None;
        };
        val = map.get(*seg).cloned().unwrap_or(Value::Null);
    }
    Some(val)
}

// ---------------------------------------------------------------------------
// Comparison
// ---------------------------------------------------------------------------

fn normalize(val: &Value) -> Value {
    if let Value::String(s) = val {
        if let Ok(parsed) = serde_json::from_str::<Value>(s) {
            return parsed;
        }
    }
    val.clone()
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_f64(), y.as_f64()) {
            (Some(x), Some(y)) => (x - y).abs() == 0.0,
            _ => x == y,
        },
        _ => a == b,
    }
}

fn order(a: &Value, b: &Value) -> Result<std::cmp::Ordering, EvalError> {
    use std::cmp::Ordering;
    let incomparable = || EvalError::Incomparable(a.to_string(), b.to_string());
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let (x, y) = (
                x.as_f64().ok_or_else(incomparable)?,
                y.as_f64().ok_or_else(incomparable)?,
            );
            x.partial_cmp(&y).ok_or_else(incomparable)
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Ok(x.cmp(y)),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                match order(ex, ey)? {
                    Ordering::Equal => {}
                    other => return Ok(other),
                }
            }
            Ok(x.len().cmp(&y.len()))
        }
        _ => Err(incomparable()),
    }
}

/// Compares two resolved operand values.
///
/// `null` ordering: strictly less than any non-null under `<`/`<=`, strictly
/// greater under the mirrored operations, never equal to itself under the
/// strict forms.
pub fn compare(val1: &Value, val2: &Value, op: AlarmOperation) -> Result<bool, EvalError> {
    use std::cmp::Ordering;
    let v1 = normalize(val1);
    let v2 = normalize(val2);
    let result = match op {
        AlarmOperation::Equal => loose_eq(&v1, &v2),
        AlarmOperation::NotEqual => !loose_eq(&v1, &v2),
        AlarmOperation::Less => match (v1.is_null(), v2.is_null()) {
            (true, true) => false,
            (true, false) => true,
            (false, true) => false,
            (false, false) => order(&v1, &v2)? == Ordering::Less,
        },
        AlarmOperation::LessOrEqual => match (v1.is_null(), v2.is_null()) {
            (true, _) => true,
            (false, true) => false,
            (false, false) => order(&v1, &v2)? != Ordering::Greater,
        },
        AlarmOperation::Greater => match (v1.is_null(), v2.is_null()) {
            (true, true) => false,
            (false, true) => true,
            (true, false) => false,
            (false, false) => order(&v1, &v2)? == Ordering::Greater,
        },
        AlarmOperation::GreaterOrEqual => match (v1.is_null(), v2.is_null()) {
            (_, true) => true,
            (true, false) => false,
            (false, false) => order(&v1, &v2)? != Ordering::Less,
        },
        AlarmOperation::In => match &v2 {
            Value::Array(items) => items.iter().any(|el| loose_eq(&v1, el)),
            _ => false,
        },
        AlarmOperation::NotIn => match &v2 {
            Value::Array(items) => !items.iter().any(|el| loose_eq(&v1, el)),
            _ => true,
        },
        AlarmOperation::Range => {
            let Value::Array(bounds) = &v2 else {
                return Err(EvalError::BadRange(v2.to_string()));
            };
            let [lo, hi] = bounds.as_slice() else {
                return Err(EvalError::BadRange(v2.to_string()));
            };
            order(lo, &v1)? != Ordering::Greater && order(&v1, hi)? != Ordering::Greater
        }
        AlarmOperation::SizeEqual => match &v1 {
            Value::Array(items) => loose_eq(&Value::from(items.len()), &v2),
            _ => false,
        },
        AlarmOperation::SizeNotEqual => match &v1 {
            Value::Array(items) => !loose_eq(&Value::from(items.len()), &v2),
            _ => true,
        },
    };
    Ok(result)
}

// ---------------------------------------------------------------------------
// Rule evaluation
// ---------------------------------------------------------------------------

/// Evaluates one rule against a flattened UVE.
///
/// Returns the satisfied OR-list, or `None` when the rule does not fire
/// (including when project scoping excludes the entity).
///
/// # Errors
///
/// Propagates [`EvalError`] for malformed literals and untypable orderings;
/// the caller is expected to publish a `rules = None` alarm slot in that
/// case.
pub fn evaluate(
    cfg: &AlarmConfig,
    key: &UveKey,
    uve: &Value,
) -> Result<Option<Vec<AlarmAndList>>, EvalError> {
    if cfg.parent_type.as_deref() == Some("project") {
        let parent = uve_parent_fqname(key.table(), key.name(), uve);
        if parent.as_deref() != Some(cfg.parent_fq_name_str().as_str()) {
            return Ok(None);
        }
    }
    let mut or_out = Vec::new();
    'or: for and_cfg in &cfg.alarm_rules.or_list {
        let mut and_out = Vec::new();
        for exp in &and_cfg.and_list {
            match eval_condition(exp, uve)? {
                Some(acm) => and_out.push(acm),
                None => continue 'or,
            }
        }
        or_out.push(AlarmAndList { and_list: and_out });
    }
    if or_out.is_empty() {
        Ok(None)
    } else {
        Ok(Some(or_out))
    }
}

/// Derives the parent fq-name of an entity for project-scoped rules.
#[must_use]
pub fn uve_parent_fqname(table: &str, name: &str, uve: &Value) -> Option<String> {
    if table == VM_TABLE {
        let intf = uve
            .get("UveVirtualMachineAgent")?
            .get("interface_list")?
            .get(0)?
            .as_str()?;
        Some(intf.rsplit_once(':').map_or(intf, |(p, _)| p).to_string())
    } else {
        Some(name.rsplit_once(':').map_or(name, |(p, _)| p).to_string())
    }
}

enum Operand2Val {
    Literal(Value),
    Single(Resolved),
    Fanned(Vec<Resolved>),
}

fn eval_condition(
    exp: &AlarmCondition,
    uve: &Value,
) -> Result<Option<AlarmConditionMatch>, EvalError> {
    let op1 = resolve(uve, &exp.operand1);
    if let ResolvedOperand::One(r) = &op1 {
        if !r.status {
            return Ok(None);
        }
    }

    let op2 = match &exp.operand2.json_value {
        Some(lit) => Operand2Val::Literal(
            serde_json::from_str(lit).map_err(|_| EvalError::BadJsonLiteral(lit.clone()))?,
        ),
        None => {
            let path = exp.operand2.uve_attribute.as_deref().unwrap_or_default();
            match resolve(uve, path) {
                ResolvedOperand::One(r) => {
                    if !r.status {
                        return Ok(None);
                    }
                    Operand2Val::Single(r)
                }
                ResolvedOperand::Many(rs) => Operand2Val::Fanned(rs),
            }
        }
    };

    let mut matches = Vec::new();
    match (&op1, &op2) {
        (ResolvedOperand::Many(r1s), Operand2Val::Fanned(r2s)) => {
            if r1s.len() != r2s.len() {
                return Ok(None);
            }
            for (r1, r2) in r1s.iter().zip(r2s.iter()) {
                if compare(&r1.value, &r2.value, exp.operation)? {
                    matches.push(make_match(exp, r1, Some(r2)));
                }
            }
        }
        (ResolvedOperand::Many(r1s), Operand2Val::Literal(lit)) => {
            for r1 in r1s {
                if compare(&r1.value, lit, exp.operation)? {
                    matches.push(make_match(exp, r1, None));
                }
            }
        }
        (ResolvedOperand::Many(r1s), Operand2Val::Single(r2)) => {
            for r1 in r1s {
                if compare(&r1.value, &r2.value, exp.operation)? {
                    matches.push(make_match(exp, r1, Some(r2)));
                }
            }
        }
        (ResolvedOperand::One(r1), Operand2Val::Fanned(r2s)) => {
            for r2 in r2s {
                if compare(&r1.value, &r2.value, exp.operation)? {
                    matches.push(make_match(exp, r1, Some(r2)));
                }
            }
        }
        (ResolvedOperand::One(r1), Operand2Val::Literal(lit)) => {
            if compare(&r1.value, lit, exp.operation)? {
                matches.push(make_match(exp, r1, None));
            }
        }
        (ResolvedOperand::One(r1), Operand2Val::Single(r2)) => {
            if compare(&r1.value, &r2.value, exp.operation)? {
                matches.push(make_match(exp, r1, Some(r2)));
            }
        }
    }

    if matches.is_empty() {
        Ok(None)
    } else {
        Ok(Some(AlarmConditionMatch {
            condition: exp.clone(),
            match_list: matches,
        }))
    }
}

fn make_match(exp: &AlarmCondition, op1: &Resolved, op2: Option<&Resolved>) -> AlarmMatch {
    let mut json_variables = BTreeMap::new();
    for var in &exp.variables {
        let path = match op2 {
            None => &op1.uve_path,
            Some(r2) => {
                let p1 = common_prefix_len(&exp.operand1, var);
                let p2 = exp
                    .operand2
                    .uve_attribute
                    .as_deref()
                    .map_or(0, |a| common_prefix_len(a, var));
                if p1 > p2 {
                    &op1.uve_path
                } else {
                    &r2.uve_path
                }
            }
        };
        let val = attribute_from_path(var, path).unwrap_or(Value::Null);
        json_variables.insert(var.clone(), json_text(&val));
    }
    AlarmMatch {
        json_operand1_value: json_text(&op1.value),
        json_operand2_value: op2.map(|r| json_text(&r.value)),
        json_variables,
    }
}

fn common_prefix_len(a: &str, b: &str) -> usize {
    a.split('.')
        .zip(b.split('.'))
        .take_while(|(x, y)| x == y)
        .count()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
