//! The backend-neutral decomposed form of an object.
//!
//! A [`DecomposedObject`] is an insertion-ordered map from field name to
//! [`Value`]. Composite fields nest another `DecomposedObject`; collections
//! are [`Value::List`]s. Backends that can only store flat leaves use
//! [`DecomposedObject::flatten`] and [`DecomposedObject::from_flat`], which
//! translate between the nested form and dotted field paths
//! (`address.city`, `items.0`).

use crate::error::{StorageError, StorageResult};
use crate::value::Value;

/// Separator between the segments of a field path.
pub const PATH_SEPARATOR: char = '.';

/// Ordered field-name → value mapping with unique names.
#[derive(Debug, Clone, Default)]
pub struct DecomposedObject {
    fields: Vec<(String, Value)>,
}

impl DecomposedObject {
    /// Create an empty object.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a field.
    ///
    /// `path` may be dotted, in which case intermediate composites are
    /// created. An intermediate that currently holds a non-composite value is
    /// replaced by a composite. Replacing a field keeps its position.
    pub fn insert(&mut self, path: impl AsRef<str>, value: impl Into<Value>) {
        self.insert_value(path.as_ref(), value.into());
    }

    /// Builder-style [`insert`](Self::insert).
    pub fn with(mut self, path: impl AsRef<str>, value: impl Into<Value>) -> Self {
        self.insert(path, value);
        self
    }

    fn insert_value(&mut self, path: &str, value: Value) {
        match path.split_once(PATH_SEPARATOR) {
            None => match self.position(path) {
                Some(idx) => self.fields[idx].1 = value,
                None => self.fields.push((path.to_string(), value)),
            },
            Some((head, rest)) => {
                let idx = match self.position(head) {
                    Some(idx) => idx,
                    None => {
                        self.fields
                            .push((head.to_string(), Value::Nested(DecomposedObject::new())));
                        self.fields.len() - 1
                    }
                };
                let slot = &mut self.fields[idx].1;
                if !matches!(slot, Value::Nested(_)) {
                    *slot = Value::Nested(DecomposedObject::new());
                }
                if let Value::Nested(child) = slot {
                    child.insert_value(rest, value);
                }
            }
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|(k, _)| k == name)
    }

    /// Look up a direct field.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(k, _)| k == name).map(|(_, v)| v)
    }

    /// Look up a dotted path, descending through composites and list indices.
    pub fn get_path(&self, path: &str) -> Option<&Value> {
        let mut segments = path.split(PATH_SEPARATOR);
        let mut current = self.get(segments.next()?)?;
        for segment in segments {
            current = match current {
                Value::Nested(object) => object.get(segment)?,
                Value::List(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        Some(current)
    }

    /// Remove a direct field, returning its value.
    pub fn remove(&mut self, name: &str) -> Option<Value> {
        let idx = self.position(name)?;
        Some(self.fields.remove(idx).1)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Iterate fields in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.fields.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(k, _)| k.as_str())
    }

    // ── flat form ────────────────────────────────────────────────────

    /// Leaf entries keyed by dotted path.
    ///
    /// Lists emit one entry per element (`items.0`, `items.1`, ...); an empty
    /// list emits its own path with an empty [`Value::List`] so it stays
    /// distinguishable from an absent field. Empty composites emit nothing.
    pub fn flatten(&self) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        for (name, value) in &self.fields {
            flatten_into(name.clone(), value, &mut out);
        }
        out
    }

    /// Rebuild the nested form from dotted leaf entries.
    ///
    /// A composite whose keys are exactly `0..n` is turned back into a list.
    pub fn from_flat<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, Value)>,
    {
        let mut object = Self::new();
        for (path, value) in entries {
            object.insert_value(&path, value);
        }
        object.relist();
        object
    }

    fn relist(&mut self) {
        for (_, value) in &mut self.fields {
            relist_value(value);
        }
    }

    // ── tree form ────────────────────────────────────────────────────

    /// Convert to a JSON object tree.
    pub fn to_json(&self) -> StorageResult<serde_json::Value> {
        let mut map = serde_json::Map::with_capacity(self.fields.len());
        for (name, value) in &self.fields {
            map.insert(name.clone(), value.to_json().map_err(|e| e.under(name))?);
        }
        Ok(serde_json::Value::Object(map))
    }

    /// Convert from a JSON tree whose root must be an object.
    pub fn from_json(json: serde_json::Value) -> StorageResult<Self> {
        match json {
            serde_json::Value::Object(map) => Ok(Self::from_json_map(map)),
            other => Err(StorageError::mismatch("", "composite", json_kind(&other))),
        }
    }

    pub(crate) fn from_json_map(map: serde_json::Map<String, serde_json::Value>) -> Self {
        let fields = map
            .into_iter()
            .filter_map(|(k, v)| Value::from_json(v).map(|v| (k, v)))
            .collect();
        Self { fields }
    }
}

/// Field-set equality: same names with equal values, in any order.
///
/// Backends are free to reorder keys (the JSON tree sorts them), so order is
/// not part of an object's identity.
impl PartialEq for DecomposedObject {
    fn eq(&self, other: &Self) -> bool {
        self.fields.len() == other.fields.len()
            && self
                .fields
                .iter()
                .all(|(k, v)| other.get(k).is_some_and(|o| o == v))
    }
}

impl FromIterator<(String, Value)> for DecomposedObject {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        let mut object = Self::new();
        for (name, value) in iter {
            object.insert_value(&name, value);
        }
        object
    }
}

impl IntoIterator for DecomposedObject {
    type Item = (String, Value);
    type IntoIter = std::vec::IntoIter<(String, Value)>;

    fn into_iter(self) -> Self::IntoIter {
        self.fields.into_iter()
    }
}

fn flatten_into(path: String, value: &Value, out: &mut Vec<(String, Value)>) {
    match value {
        Value::Nested(object) => {
            for (name, child) in &object.fields {
                flatten_into(format!("{path}{PATH_SEPARATOR}{name}"), child, out);
            }
        }
        Value::List(items) if items.is_empty() => out.push((path, Value::List(Vec::new()))),
        Value::List(items) => {
            for (idx, item) in items.iter().enumerate() {
                flatten_into(format!("{path}{PATH_SEPARATOR}{idx}"), item, out);
            }
        }
        leaf => out.push((path, leaf.clone())),
    }
}

fn relist_value(value: &mut Value) {
    match value {
        Value::Nested(object) => {
            object.relist();
            if let Some(items) = as_indexed(object) {
                *value = Value::List(items);
            }
        }
        Value::List(items) => items.iter_mut().for_each(relist_value),
        _ => {}
    }
}

/// `Some(elements)` when the keys of `object` are exactly `0..n`.
fn as_indexed(object: &mut DecomposedObject) -> Option<Vec<Value>> {
    if object.is_empty() {
        return None;
    }
    let mut indexed = Vec::with_capacity(object.len());
    for (name, _) in &object.fields {
        // Reject "01" and friends so only canonical indices qualify.
        if name.len() > 1 && name.starts_with('0') {
            return None;
        }
        indexed.push(name.parse::<usize>().ok()?);
    }
    let mut sorted = indexed.clone();
    sorted.sort_unstable();
    if sorted.iter().enumerate().any(|(expected, idx)| expected != *idx) {
        return None;
    }

    let mut slots: Vec<Option<Value>> = vec![None; indexed.len()];
    for (idx, (_, value)) in indexed.into_iter().zip(std::mem::take(&mut object.fields)) {
        slots[idx] = Some(value);
    }
    Some(slots.into_iter().flatten().collect())
}

fn json_kind(json: &serde_json::Value) -> &'static str {
    match json {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "list",
        serde_json::Value::Object(_) => "composite",
    }
}

// ── tests ────────────────────────────────────────────────────────────
