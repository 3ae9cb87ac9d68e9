//! Typed Input and Output Values
//!
//! Values flow from the plan into task inputs, through the command
//! template, and back out as task outputs. `File` and `Directory` hold a
//! local path or a URI.
//!
//! # YAML Form
//!
//! Scalars, sequences and maps are written naturally; files and
//! directories are single-key maps:
//!
//! ```yaml
//! inputs:
//!   threshold: 0.5
//!   samples: [a, b, c]
//!   reads: {File: /data/reads.fq}
//!   reference: {Directory: "https://example.org/ref/"}
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::Result;

/// A typed value bound to a task input or produced as an output.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    File(String),
    Directory(String),
    Array(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// Returns true if `path` is a URI (`scheme://...`) rather than a local path.
pub fn is_uri(path: &str) -> bool {
    match path.split_once("://") {
        Some((scheme, _)) => {
            !scheme.is_empty()
                && scheme
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        }
        None => false,
    }
}

impl Value {
    pub fn file(path: impl Into<String>) -> Self {
        Self::File(path.into())
    }

    pub fn directory(path: impl Into<String>) -> Self {
        Self::Directory(path.into())
    }

    /// Every file and directory reference in this value, depth first.
    ///
    /// The boolean is true for directories.
    pub fn file_refs(&self) -> Vec<(&str, bool)> {
        let mut refs = Vec::new();
        self.collect_refs(&mut refs);
        refs
    }

    fn collect_refs<'a>(&'a self, refs: &mut Vec<(&'a str, bool)>) {
        match self {
            Self::File(p) => refs.push((p, false)),
            Self::Directory(p) => refs.push((p, true)),
            Self::Array(items) => items.iter().for_each(|v| v.collect_refs(refs)),
            Self::Map(map) => map.values().for_each(|v| v.collect_refs(refs)),
            _ => {}
        }
    }

    /// Rebuilds the value with every file and directory path rewritten by `f`.
    pub fn map_paths<F>(&self, f: &mut F) -> Result<Value>
    where
        F: FnMut(&str, bool) -> Result<String>,
    {
        Ok(match self {
            Self::File(p) => Self::File(f(p, false)?),
            Self::Directory(p) => Self::Directory(f(p, true)?),
            Self::Array(items) => Self::Array(
                items
                    .iter()
                    .map(|v| v.map_paths(f))
                    .collect::<Result<Vec<_>>>()?,
            ),
            Self::Map(map) => {
                let mut out = BTreeMap::new();
                for (k, v) in map {
                    out.insert(k.clone(), v.map_paths(f)?);
                }
                Self::Map(out)
            }
            other => other.clone(),
        })
    }

    /// Short string form of a scalar, `None` for compound values.
    pub fn scalar_string(&self) -> Option<String> {
        match self {
            Self::Boolean(b) => Some(b.to_string()),
            Self::Int(i) => Some(i.to_string()),
            Self::Float(f) => Some(f.to_string()),
            Self::String(s) | Self::File(s) | Self::Directory(s) => Some(s.clone()),
            Self::Null | Self::Array(_) | Self::Map(_) => None,
        }
    }

    /// Renders the value for substitution into a command template.
    pub fn render(&self) -> String {
        match self {
            Self::Null => String::new(),
            Self::Array(items) => items
                .iter()
                .map(Value::render)
                .collect::<Vec<_>>()
                .join(" "),
            Self::Map(_) => self.to_json().to_string(),
            other => other.scalar_string().unwrap_or_default(),
        }
    }

    /// Plain JSON form, with files and directories as their paths.
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value as J;
        match self {
            Self::Null => J::Null,
            Self::Boolean(b) => J::Bool(*b),
            Self::Int(i) => J::from(*i),
            Self::Float(f) => J::from(*f),
            Self::String(s) | Self::File(s) | Self::Directory(s) => J::String(s.clone()),
            Self::Array(items) => J::Array(items.iter().map(Value::to_json).collect()),
            Self::Map(map) => J::Object(
                map.iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}

impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Self::Null => serializer.serialize_unit(),
            Self::Boolean(b) => serializer.serialize_bool(*b),
            Self::Int(i) => serializer.serialize_i64(*i),
            Self::Float(f) => serializer.serialize_f64(*f),
            Self::String(s) => serializer.serialize_str(s),
            Self::File(p) | Self::Directory(p) => {
                let tag = if matches!(self, Self::File(_)) {
                    "File"
                } else {
                    "Directory"
                };
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry(tag, p)?;
                map.end()
            }
            Self::Array(items) => {
                let mut seq = serializer.serialize_seq(Some(items.len()))?;
                for item in items {
                    seq.serialize_element(item)?;
                }
                seq.end()
            }
            Self::Map(entries) => {
                let mut map = serializer.serialize_map(Some(entries.len()))?;
                for (k, v) in entries {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
        }
    }
}

#[derive(Deserialize)]
enum PathTag {
    File(String),
    Directory(String),
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawValue {
    Null(()),
    Boolean(bool),
    Int(i64),
    Float(f64),
    String(String),
    Array(Vec<RawValue>),
    Path(PathTag),
    Map(BTreeMap<String, RawValue>),
}

impl From<RawValue> for Value {
    fn from(raw: RawValue) -> Self {
        match raw {
            RawValue::Null(()) => Value::Null,
            RawValue::Boolean(b) => Value::Boolean(b),
            RawValue::Int(i) => Value::Int(i),
            RawValue::Float(f) => Value::Float(f),
            RawValue::String(s) => Value::String(s),
            RawValue::Array(items) => Value::Array(items.into_iter().map(Value::from).collect()),
            RawValue::Path(PathTag::File(p)) => Value::File(p),
            RawValue::Path(PathTag::Directory(p)) => Value::Directory(p),
            RawValue::Map(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        RawValue::deserialize(deserializer).map(Value::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yaml_forms() {
        let yaml = r#"
n: 3
x: 0.5
flag: true
name: sample
reads: {File: /data/reads.fq}
ref: {Directory: "s3://bucket/ref/"}
list: [1, 2]
meta: {a: 1}
nothing: null
"#;
        let map: BTreeMap<String, Value> = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(map["n"], Value::Int(3));
        assert_eq!(map["x"], Value::Float(0.5));
        assert_eq!(map["flag"], Value::Boolean(true));
        assert_eq!(map["name"], Value::String("sample".into()));
        assert_eq!(map["reads"], Value::file("/data/reads.fq"));
        assert_eq!(map["ref"], Value::directory("s3://bucket/ref/"));
        assert_eq!(map["list"], Value::Array(vec![Value::Int(1), Value::Int(2)]));
        assert!(matches!(map["meta"], Value::Map(_)));
        assert_eq!(map["nothing"], Value::Null);
    }

    #[test]
    fn test_json_keeps_file_type() {
        let v = Value::Array(vec![Value::file("/a"), Value::String("/a".into())]);
        let text = serde_json::to_string(&v).unwrap();
        let back: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn test_int_and_float_differ() {
        let a = serde_json::to_string(&Value::Int(1)).unwrap();
        let b = serde_json::to_string(&Value::Float(1.0)).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_file_refs_and_map_paths() {
        let mut map = BTreeMap::new();
        map.insert("x".to_string(), Value::file("/in/x.txt"));
        map.insert("d".to_string(), Value::directory("/in/dir"));
        let v = Value::Array(vec![Value::Map(map), Value::Int(1)]);

        let refs = v.file_refs();
        assert_eq!(refs, vec![("/in/dir", true), ("/in/x.txt", false)]);

        let moved = v
            .map_paths(&mut |p, _| Ok(p.replace("/in", "/mnt")))
            .unwrap();
        assert_eq!(moved.file_refs()[1].0, "/mnt/x.txt");
    }

    #[test]
    fn test_render() {
        let v = Value::Array(vec![Value::file("/a"), Value::Int(2), Value::Boolean(false)]);
        assert_eq!(v.render(), "/a 2 false");
        assert_eq!(Value::Null.render(), "");
        assert_eq!(Value::Array(vec![]).scalar_string(), None);
    }

    #[test]
    fn test_is_uri() {
        assert!(is_uri("https://example.org/x.txt"));
        assert!(is_uri("s3://bucket/key"));
        assert!(!is_uri("/data/x.txt"));
        assert!(!is_uri("relative/x://y"));
    }
}
