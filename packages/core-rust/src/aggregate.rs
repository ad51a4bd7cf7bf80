//! Multi-source UVE aggregation.
//!
//! Merges the per-type contributions of all sources for one UVE key into a
//! single annotated view, honoring the `@aggtype` hints:
//!
//! - `sum` on an integer scalar: numeric sum across sources
//! - `sum` on a struct: field-wise sum of its integer leaves
//! - `union` on a list: set-union with stable deduplication
//! - `union` on a map: per-source values kept by prefixing the source into
//!   the composite element key
//! - `append` on a list: concatenation, folding entries that share a
//!   `listkey` and summing their integer fields
//! - no hint: one entry per distinct value, tagged with contributing sources
//!
//! The timestamp attribute `__T` keeps only the latest source. A malformed
//! attribute is logged and skipped; it never fails the whole key.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};
use tracing::warn;

use crate::uve::{
    agg_hint, attr_type, canonical_json, is_integer_type, list_key_field, list_name, text_i64,
    TIMESTAMP_ATTR,
};

/// Per-type contributions for one UVE key: `type -> source -> payload`.
///
/// A payload is the JSON object of annotated attributes that one source
/// reported for that struct type.
pub type SourceContribs = BTreeMap<String, BTreeMap<String, Value>>;

/// Aggregates all contributions for `key` into one value per type.
///
/// Types whose payloads carry no attributes are dropped; the caller's delta
/// tracking turns that into a tombstone.
#[must_use]
pub fn aggregate_uve(key: &str, contribs: &SourceContribs) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for (typ, sources) in contribs {
        let mut attrs: BTreeMap<String, BTreeMap<String, Value>> = BTreeMap::new();
        for (source, payload) in sources {
            let Some(obj) = payload.as_object() else {
                warn!(key, typ, source, "contribution payload is not an object; skipping");
                continue;
            };
            for (attr, aval) in obj {
                attrs
                    .entry(attr.clone())
                    .or_default()
                    .insert(source.clone(), aval.clone());
            }
        }

        // __T carries the send timestamp; only the latest source counts.
        if let Some(stamps) = attrs.get_mut(TIMESTAMP_ATTR) {
            keep_latest(stamps);
        }

        let mut result = Map::new();
        for (attr, oattr) in &attrs {
            match aggregate_attr(oattr) {
                Some(v) => {
                    result.insert(attr.clone(), v);
                }
                None => warn!(key, typ, attr, "attribute aggregation failed; skipping"),
            }
        }
        if !result.is_empty() {
            out.insert(typ.clone(), Value::Object(result));
        }
    }
    out
}

fn keep_latest(stamps: &mut BTreeMap<String, Value>) {
    let latest = stamps
        .iter()
        .max_by_key(|(_, v)| text_i64(v).unwrap_or(i64::MIN))
        .map(|(s, _)| s.clone());
    if let Some(latest) = latest {
        stamps.retain(|s, _| *s == latest);
    }
}

fn aggregate_attr(oattr: &BTreeMap<String, Value>) -> Option<Value> {
    let (_, first) = oattr.iter().next()?;
    let typ = attr_type(first);
    let hint = agg_hint(first);
    match (typ, hint) {
        (Some(t), Some("sum")) if is_integer_type(t) => elem_sum(oattr, first),
        (Some("struct"), Some("sum")) => struct_sum(oattr, first),
        (Some("list"), Some("union")) => list_union(oattr, first),
        (Some("map"), Some("union")) => map_union(oattr, first),
        (Some("list"), Some("append")) => append(oattr, first),
        _ => Some(default_agg(oattr)),
    }
}

fn elem_sum(oattr: &BTreeMap<String, Value>, first: &Value) -> Option<Value> {
    let mut count: i64 = 0;
    for v in oattr.values() {
        count = count.checked_add(text_i64(v)?)?;
    }
    let mut result = first.clone();
    result
        .as_object_mut()?
        .insert("#text".to_string(), Value::String(count.to_string()));
    Some(result)
}

fn struct_sum(oattr: &BTreeMap<String, Value>, first: &Value) -> Option<Value> {
    let sname = first
        .as_object()?
        .keys()
        .find(|k| !k.starts_with('@'))?
        .clone();
    let mut sums: BTreeMap<String, (String, i64)> = BTreeMap::new();
    for sval in oattr.values() {
        let fields = sval.get(&sname)?.as_object()?;
        for (field, aval) in fields {
            let Some(t) = attr_type(aval) else { continue };
            if !is_integer_type(t) {
                continue;
            }
            let n = text_i64(aval)?;
            let entry = sums.entry(field.clone()).or_insert((t.to_string(), 0));
            entry.1 = entry.1.checked_add(n)?;
        }
    }
    let mut folded = Map::new();
    for (field, (t, n)) in sums {
        let mut leaf = Map::new();
        leaf.insert("@type".to_string(), Value::String(t));
        leaf.insert("#text".to_string(), Value::String(n.to_string()));
        folded.insert(field, Value::Object(leaf));
    }
    let mut result = first.clone();
    result
        .as_object_mut()?
        .insert(sname, Value::Object(folded));
    Some(result)
}

fn list_union(oattr: &BTreeMap<String, Value>, first: &Value) -> Option<Value> {
    let sname = list_name(first)?;
    let inner_type = first.get("list")?.get("@type").cloned();
    let mut result = annotations_of(first);
    let mut seen = BTreeSet::new();
    let mut elems = Vec::new();
    for sval in oattr.values() {
        for elem in crate::uve::list_elems(sval) {
            if seen.insert(canonical_json(&elem)) {
                elems.push(elem);
            }
        }
    }
    let mut list = Map::new();
    if let Some(t) = inner_type {
        list.insert("@type".to_string(), t);
    }
    list.insert("@size".to_string(), Value::String(elems.len().to_string()));
    list.insert(sname, Value::Array(elems));
    result.insert("list".to_string(), Value::Object(list));
    Some(Value::Object(result))
}

fn map_union(oattr: &BTreeMap<String, Value>, first: &Value) -> Option<Value> {
    let fmap = first.get("map")?.as_object()?;
    let sname = fmap
        .keys()
        .find(|k| !k.starts_with('@') && *k != "element")
        .cloned();

    let mut result = annotations_of(first);
    let mut out = Map::new();
    out.insert("@key".to_string(), Value::String("string".to_string()));
    if let Some(v) = fmap.get("@value") {
        out.insert("@value".to_string(), v.clone());
    }

    let mut elements = Vec::new();
    let mut values = Vec::new();
    let mut size = 0_usize;
    for (source, sval) in oattr {
        let smap = sval.get("map")?.as_object()?;
        let raw = normalize_array(smap.get("element"));
        if let Some(sname) = &sname {
            let svals = normalize_array(smap.get(sname.as_str()));
            for (k, v) in raw.iter().zip(svals.iter()) {
                elements.push(Value::String(format!("{source}:{}", canonical_json(k))));
                values.push(v.clone());
                size += 1;
            }
        } else {
            for pair in raw.chunks(2) {
                if let [k, v] = pair {
                    elements.push(Value::String(format!("{source}:{}", canonical_json(k))));
                    elements.push(v.clone());
                    size += 1;
                }
            }
        }
    }
    out.insert("@size".to_string(), Value::String(size.to_string()));
    out.insert("element".to_string(), Value::Array(elements));
    if let Some(sname) = sname {
        out.insert(sname, Value::Array(values));
    }
    result.insert("map".to_string(), Value::Object(out));
    Some(Value::Object(result))
}

fn append(oattr: &BTreeMap<String, Value>, first: &Value) -> Option<Value> {
    let sname = list_name(first)?;
    let mut elems = Vec::new();
    for sval in oattr.values() {
        elems.extend(crate::uve::list_elems(sval));
    }
    let folded = match elems.first().and_then(list_key_field) {
        Some(key_field) => consolidate(&elems, &key_field)?,
        None => elems,
    };
    let mut result = first.clone();
    let list = result.as_object_mut()?.get_mut("list")?.as_object_mut()?;
    list.insert("@size".to_string(), Value::String(folded.len().to_string()));
    list.insert(sname, Value::Array(folded));
    Some(result)
}

/// Folds entries sharing the same listkey value, summing their integer
/// fields. Entries whose listkey is missing pass through unfolded.
fn consolidate(elems: &[Value], key_field: &str) -> Option<Vec<Value>> {
    let mut folded: Vec<Value> = Vec::new();
    for item in elems {
        let key_text = item
            .get(key_field)
            .and_then(|k| k.get("#text"))
            .and_then(Value::as_str);
        let existing = key_text.and_then(|kt| {
            folded.iter_mut().find(|r| {
                r.get(key_field)
                    .and_then(|k| k.get("#text"))
                    .and_then(Value::as_str)
                    == Some(kt)
            })
        });
        match existing {
            Some(slot) => {
                for (field, aval) in item.as_object()? {
                    if field == key_field || agg_hint(aval) == Some("listkey") {
                        continue;
                    }
                    let Some(t) = attr_type(aval) else { continue };
                    if !is_integer_type(t) {
                        continue;
                    }
                    let add = text_i64(aval)?;
                    let slot_field = slot.get_mut(field)?.as_object_mut()?;
                    let cur: i64 = slot_field.get("#text")?.as_str()?.parse().ok()?;
                    slot_field.insert(
                        "#text".to_string(),
                        Value::String(cur.checked_add(add)?.to_string()),
                    );
                }
            }
            None => folded.push(item.clone()),
        }
    }
    Some(folded)
}

/// One entry per distinct value, each tagged with its contributing sources.
/// A single distinct value collapses to the bare value.
fn default_agg(oattr: &BTreeMap<String, Value>) -> Value {
    let mut entries: Vec<(String, Value, Vec<String>)> = Vec::new();
    for (source, val) in oattr {
        let canon = canonical_json(val);
        match entries.iter_mut().find(|(c, _, _)| *c == canon) {
            Some((_, _, sources)) => sources.push(source.clone()),
            None => entries.push((canon, val.clone(), vec![source.clone()])),
        }
    }
    if entries.len() == 1 {
        return entries.remove(0).1;
    }
    Value::Array(
        entries
            .into_iter()
            .map(|(_, val, sources)| {
                let mut row = vec![val];
                row.extend(sources.into_iter().map(Value::String));
                Value::Array(row)
            })
            .collect(),
    )
}

fn annotations_of(attr: &Value) -> Map<String, Value> {
    attr.as_object().map_or_else(Map::new, |obj| {
        obj.iter()
            .filter(|(k, _)| k.starts_with('@'))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    })
}

fn normalize_array(v: Option<&Value>) -> Vec<Value> {
    match v {
        Some(Value::Array(items)) => items.clone(),
        Some(single) => vec![single.clone()],
        None => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
