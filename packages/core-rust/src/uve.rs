//! UVE keys and the annotated value model.
//!
//! A UVE (User-Visible Entity) is a mapping from struct-type names to JSON
//! trees carrying type annotations. The annotation scheme mirrors what the
//! collectors emit:
//!
//! - scalars: `{"@type": "i64", "#text": "3"}`
//! - lists:   `{"@type": "list", "@aggtype": "append", "list": {"@type": "struct", "@size": "2", "<elem>": [..]}}`
//! - maps:    `{"@type": "map", "map": {"@key": "string", "@value": "...", "@size": "1", "element": [..]}}`
//! - structs: `{"@type": "struct", "<name>": { .. fields .. }}`
//!
//! [`flatten`] strips the annotations into plain JSON; the alarm evaluator
//! only ever walks flattened trees.

use std::fmt;

use serde_json::{Map, Value};

/// Struct-type name under which generated alarms are stored on a UVE.
pub const ALARMS_TYPE: &str = "UVEAlarms";

/// Attribute carrying the send timestamp. Aggregation keeps only the value
/// from the latest source.
pub const TIMESTAMP_ATTR: &str = "__T";

// ---------------------------------------------------------------------------
// UveKey
// ---------------------------------------------------------------------------

/// A UVE key `"<table>:<name>"`. Only the first colon separates the table
/// from the entity name; the name itself may contain further colons.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UveKey(String);

impl UveKey {
    /// Parses a key, requiring at least one colon with a non-empty table part.
    #[must_use]
    pub fn parse(key: &str) -> Option<Self> {
        let idx = key.find(':')?;
        if idx == 0 {
            return None;
        }
        Some(Self(key.to_string()))
    }

    /// The UVE type family, e.g. `virtual-network`.
    #[must_use]
    pub fn table(&self) -> &str {
        self.0.split_once(':').map_or("", |(t, _)| t)
    }

    /// The entity name within the table.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.split_once(':').map_or("", |(_, n)| n)
    }

    /// The full `table:name` form.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ---------------------------------------------------------------------------
// Annotation helpers
// ---------------------------------------------------------------------------

/// Returns the `@type` annotation of an attribute, if any.
#[must_use]
pub fn attr_type(attr: &Value) -> Option<&str> {
    attr.get("@type").and_then(Value::as_str)
}

/// Returns the `@aggtype` annotation of an attribute, if any.
#[must_use]
pub fn agg_hint(attr: &Value) -> Option<&str> {
    attr.get("@aggtype").and_then(Value::as_str)
}

/// Whether a `@type` value names an integer scalar type.
#[must_use]
pub fn is_integer_type(typ: &str) -> bool {
    matches!(
        typ,
        "i8" | "i16" | "i32" | "i64" | "byte" | "u8" | "u16" | "u32" | "u64"
    )
}

/// Parses an annotated scalar's `#text` as a signed integer.
#[must_use]
pub fn text_i64(attr: &Value) -> Option<i64> {
    attr.get("#text")?.as_str()?.trim().parse().ok()
}

/// Name of the element member inside a `list` wrapper: the single key that
/// does not start with `@`.
#[must_use]
pub fn list_name(attr: &Value) -> Option<String> {
    let list = attr.get("list")?.as_object()?;
    list.keys().find(|k| !k.starts_with('@')).cloned()
}

/// The elements of an annotated list attribute, normalized to a `Vec`.
///
/// A single-element list may appear unwrapped; `@size == "0"` or a missing
/// element member yields an empty `Vec`.
#[must_use]
pub fn list_elems(attr: &Value) -> Vec<Value> {
    let Some(sname) = list_name(attr) else {
        return Vec::new();
    };
    match attr.get("list").and_then(|l| l.get(&sname)) {
        Some(Value::Array(items)) => items.clone(),
        Some(single) => vec![single.clone()],
        None => Vec::new(),
    }
}

/// Finds the field of a list element annotated `@aggtype: listkey`, which
/// identifies entries for folding during `append` aggregation.
#[must_use]
pub fn list_key_field(elem: &Value) -> Option<String> {
    let obj = elem.as_object()?;
    obj.iter()
        .find(|(_, v)| agg_hint(v) == Some("listkey"))
        .map(|(k, _)| k.clone())
}

/// The single non-`@` member of a `struct`-typed attribute, holding its
/// fields.
#[must_use]
pub fn struct_fields(attr: &Value) -> Option<&Value> {
    let obj = attr.as_object()?;
    obj.iter()
        .find(|(k, _)| !k.starts_with('@') && *k != "#text")
        .map(|(_, v)| v)
}

// ---------------------------------------------------------------------------
// Canonical form
// ---------------------------------------------------------------------------

/// Serializes a JSON value with object keys sorted, for stable deduplication
/// during `union` and default aggregation.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    fn write(value: &Value, out: &mut String) {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<&String> = map.keys().collect();
                keys.sort();
                out.push('{');
                for (i, k) in keys.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    out.push_str(&Value::String((*k).clone()).to_string());
                    out.push(':');
                    write(&map[*k], out);
                }
                out.push('}');
            }
            Value::Array(items) => {
                out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        out.push(',');
                    }
                    write(item, out);
                }
                out.push(']');
            }
            other => out.push_str(&other.to_string()),
        }
    }
    let mut out = String::new();
    write(value, &mut out);
    out
}

// ---------------------------------------------------------------------------
// Flattening
// ---------------------------------------------------------------------------

/// Strips annotations from an attribute tree, producing plain JSON.
///
/// Scalars are typed according to `@type` (integer types parse to numbers,
/// `bool` to booleans, `double`/`float` to floats, everything else stays a
/// string). List and map wrappers become JSON arrays and objects; struct
/// wrappers collapse to their field object.
#[must_use]
pub fn flatten(attr: &Value) -> Value {
    match attr {
        Value::Object(map) => {
            if map.contains_key("#text") {
                flatten_scalar(map)
            } else if let Some(list) = map.get("list") {
                flatten_list(list)
            } else if let Some(mapw) = map.get("map") {
                flatten_map(mapw)
            } else if attr_type(attr) == Some("struct") {
                struct_fields(attr).map_or(Value::Null, flatten)
            } else {
                let mut out = Map::new();
                for (k, v) in map {
                    if !k.starts_with('@') {
                        out.insert(k.clone(), flatten(v));
                    }
                }
                Value::Object(out)
            }
        }
        Value::Array(items) => Value::Array(items.iter().map(flatten).collect()),
        other => other.clone(),
    }
}

fn flatten_scalar(map: &Map<String, Value>) -> Value {
    let text = match map.get("#text") {
        Some(Value::String(s)) => s.clone(),
        Some(other) => return other.clone(),
        None => return Value::Null,
    };
    match map.get("@type").and_then(Value::as_str) {
        Some(t) if is_integer_type(t) => text
            .trim()
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| text.trim().parse::<u64>().map(Value::from))
            .unwrap_or(Value::String(text)),
        Some("double" | "float") => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(|f| serde_json::Number::from_f64(f).map(Value::Number))
            .unwrap_or(Value::String(text)),
        Some("bool") => Value::Bool(text == "true"),
        _ => Value::String(text),
    }
}

fn flatten_list(list: &Value) -> Value {
    let Some(obj) = list.as_object() else {
        return Value::Array(Vec::new());
    };
    let Some(sname) = obj.keys().find(|k| !k.starts_with('@')) else {
        return Value::Array(Vec::new());
    };
    let elems = match &obj[sname] {
        Value::Array(items) => items.clone(),
        single => vec![single.clone()],
    };
    Value::Array(elems.iter().map(flatten).collect())
}

fn flatten_map(mapw: &Value) -> Value {
    let Some(obj) = mapw.as_object() else {
        return Value::Object(Map::new());
    };
    let elems = match obj.get("element") {
        Some(Value::Array(items)) => items.clone(),
        Some(single) => vec![single.clone()],
        None => Vec::new(),
    };
    let sname = obj
        .keys()
        .find(|k| !k.starts_with('@') && *k != "element")
        .cloned();
    let mut out = Map::new();
    if let Some(sname) = sname {
        // Keys live in "element", values in the parallel member array.
        let vals = match &obj[&sname] {
            Value::Array(items) => items.clone(),
            single => vec![single.clone()],
        };
        for (k, v) in elems.iter().zip(vals.iter()) {
            let key = k.as_str().map_or_else(|| canonical_json(k), String::from);
            out.insert(key, flatten(v));
        }
    } else {
        // Alternating key/value entries.
        for pair in elems.chunks(2) {
            if let [k, v] = pair {
                let key = k.as_str().map_or_else(|| canonical_json(k), String::from);
                out.insert(key, flatten(v));
            }
        }
    }
    Value::Object(out)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn key_splits_on_first_colon() {
        let key = UveKey::parse("virtual-network:default-domain:admin:vn1").unwrap();
        assert_eq!(key.table(), "virtual-network");
        assert_eq!(key.name(), "default-domain:admin:vn1");
        assert_eq!(key.as_str(), "virtual-network:default-domain:admin:vn1");
    }

    #[test]
    fn key_requires_table_prefix() {
        assert!(UveKey::parse("no-colon").is_none());
        assert!(UveKey::parse(":name-only").is_none());
        assert!(UveKey::parse("t:").is_some());
    }

    #[test]
    fn annotation_accessors() {
        let attr = json!({"@type": "i64", "@aggtype": "sum", "#text": "42"});
        assert_eq!(attr_type(&attr), Some("i64"));
        assert_eq!(agg_hint(&attr), Some("sum"));
        assert_eq!(text_i64(&attr), Some(42));
        assert!(is_integer_type("u32"));
        assert!(!is_integer_type("string"));
    }

    #[test]
    fn list_helpers_normalize_single_element() {
        let attr = json!({
            "@type": "list",
            "list": {"@type": "string", "@size": "1", "element": "only"}
        });
        assert_eq!(list_name(&attr).as_deref(), Some("element"));
        assert_eq!(list_elems(&attr), vec![json!("only")]);
    }

    #[test]
    fn listkey_field_discovery() {
        let elem = json!({
            "name": {"@type": "string", "@aggtype": "listkey", "#text": "vif0"},
            "bytes": {"@type": "i64", "#text": "10"}
        });
        assert_eq!(list_key_field(&elem).as_deref(), Some("name"));
        assert_eq!(list_key_field(&json!({"a": {"@type": "i64", "#text": "1"}})), None);
    }

    #[test]
    fn flatten_scalar_types() {
        assert_eq!(flatten(&json!({"@type": "i64", "#text": "8"})), json!(8));
        assert_eq!(flatten(&json!({"@type": "u64", "#text": "18446744073709551615"})),
            json!(18_446_744_073_709_551_615_u64));
        assert_eq!(flatten(&json!({"@type": "bool", "#text": "true"})), json!(true));
        assert_eq!(flatten(&json!({"@type": "string", "#text": "DOWN"})), json!("DOWN"));
        assert_eq!(flatten(&json!({"@type": "double", "#text": "1.5"})), json!(1.5));
    }

    #[test]
    fn flatten_list_wrapper() {
        let attr = json!({
            "@type": "list",
            "list": {"@type": "string", "@size": "2", "element": [
                {"@type": "string", "#text": "a"},
                {"@type": "string", "#text": "b"}
            ]}
        });
        assert_eq!(flatten(&attr), json!(["a", "b"]));
    }

    #[test]
    fn flatten_struct_wrapper() {
        let attr = json!({
            "@type": "struct",
            "CounterSet": {
                "rx": {"@type": "i64", "#text": "3"},
                "tx": {"@type": "i64", "#text": "5"}
            }
        });
        assert_eq!(flatten(&attr), json!({"rx": 3, "tx": 5}));
    }

    #[test]
    fn flatten_map_alternating_elements() {
        let attr = json!({
            "@type": "map",
            "map": {"@key": "string", "@value": "string", "@size": "2",
                    "element": ["k1", {"@type": "string", "#text": "v1"},
                                "k2", {"@type": "string", "#text": "v2"}]}
        });
        assert_eq!(flatten(&attr), json!({"k1": "v1", "k2": "v2"}));
    }

    #[test]
    fn flatten_plain_object_drops_annotations() {
        let attr = json!({"@meta": "x", "s": {"@type": "string", "#text": "UP"}});
        assert_eq!(flatten(&attr), json!({"s": "UP"}));
    }

    #[test]
    fn canonical_json_sorts_keys() {
        let a = json!({"b": 1, "a": [2, {"z": 3, "y": 4}]});
        assert_eq!(canonical_json(&a), r#"{"a":[2,{"y":4,"z":3}],"b":1}"#);
    }
}
