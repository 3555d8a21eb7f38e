// Copyright 2026 Developers of the converge project.
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! JSON operational diffs: structural diff, application, and three-way
//! transform.
//!
//! A diff between two JSON objects is an [`ObjectOperationSet`]: a mapping
//! from key to [`Operation`]. Operations recurse into nested objects and
//! lists, carry numeric deltas for numbers, and delegate string edits to the
//! diff-match-patch patch format via [`crate::textdiff`]. The wire form of an
//! operation is the tagged object `{"o": <tag>, "v": <payload>}`.
//!
//! Key iteration is canonical (lexicographic) everywhere, so two peers
//! diffing the same values produce byte-identical operation sets.

use std::collections::BTreeMap;

use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Number, Value};

use crate::error::DiffError;
use crate::textdiff;

/// Edits to one top-level object, keyed by member name.
pub type ObjectOperationSet = BTreeMap<String, Operation>;

/// Edits to a list, keyed by pre-image index.
pub type ListOperationSet = BTreeMap<usize, Operation>;

/// One edit applied at a path.
#[derive(Clone, Debug, PartialEq)]
pub enum Operation {
    /// Insert a value at a not-yet-present key or index. Wire tag `+`.
    Add(Value),
    /// Delete the value at the path. Wire tag `-`.
    Remove,
    /// Wholesale replacement. Wire tag `r`.
    Replace(Value),
    /// Numeric delta; commutes with concurrent deltas. Wire tag `I`.
    Increment(Number),
    /// Recursive list diff over pre-image indices. Wire tag `L`.
    List(ListOperationSet),
    /// Recursive object diff. Wire tag `O`.
    Object(ObjectOperationSet),
    /// diff-match-patch patch text for a string. Wire tag `d`.
    Dmp(String),
}

impl Serialize for Operation {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        match self {
            Operation::Add(v) => {
                map.serialize_entry("o", "+")?;
                map.serialize_entry("v", v)?;
            }
            Operation::Remove => {
                map.serialize_entry("o", "-")?;
            }
            Operation::Replace(v) => {
                map.serialize_entry("o", "r")?;
                map.serialize_entry("v", v)?;
            }
            Operation::Increment(n) => {
                map.serialize_entry("o", "I")?;
                map.serialize_entry("v", n)?;
            }
            Operation::List(ops) => {
                let keyed: BTreeMap<String, &Operation> =
                    ops.iter().map(|(i, op)| (i.to_string(), op)).collect();
                map.serialize_entry("o", "L")?;
                map.serialize_entry("v", &keyed)?;
            }
            Operation::Object(ops) => {
                map.serialize_entry("o", "O")?;
                map.serialize_entry("v", ops)?;
            }
            Operation::Dmp(patch) => {
                map.serialize_entry("o", "d")?;
                map.serialize_entry("v", patch)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Operation {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Operation::from_wire(&raw).map_err(D::Error::custom)
    }
}

impl Operation {
    /// Decode the wire form. Unknown tags and ill-typed payloads are
    /// [`DiffError::MalformedOperation`].
    pub fn from_wire(raw: &Value) -> Result<Operation, DiffError> {
        let object = raw
            .as_object()
            .ok_or_else(|| malformed("operation must be an object"))?;
        let tag = object
            .get("o")
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("operation is missing its \"o\" tag"))?;
        let payload = object.get("v");
        match tag {
            "-" => Ok(Operation::Remove),
            "+" => Ok(Operation::Add(required(tag, payload)?.clone())),
            "r" => Ok(Operation::Replace(required(tag, payload)?.clone())),
            "I" => match required(tag, payload)? {
                Value::Number(n) => Ok(Operation::Increment(n.clone())),
                _ => Err(malformed("increment payload must be a number")),
            },
            "d" => match required(tag, payload)? {
                Value::String(patch) => Ok(Operation::Dmp(patch.clone())),
                _ => Err(malformed("text patch payload must be a string")),
            },
            "O" => {
                let members = required(tag, payload)?
                    .as_object()
                    .ok_or_else(|| malformed("object diff payload must be an object"))?;
                let mut ops = ObjectOperationSet::new();
                for (key, value) in members {
                    ops.insert(key.clone(), Operation::from_wire(value)?);
                }
                Ok(Operation::Object(ops))
            }
            "L" => {
                let members = required(tag, payload)?
                    .as_object()
                    .ok_or_else(|| malformed("list diff payload must be an object"))?;
                let mut ops = ListOperationSet::new();
                for (key, value) in members {
                    let index = key
                        .parse::<usize>()
                        .map_err(|_| malformed(format!("list index {key:?} is not a number")))?;
                    ops.insert(index, Operation::from_wire(value)?);
                }
                Ok(Operation::List(ops))
            }
            other => Err(malformed(format!("unknown operation tag {other:?}"))),
        }
    }
}

fn required<'a>(tag: &str, payload: Option<&'a Value>) -> Result<&'a Value, DiffError> {
    payload.ok_or_else(|| malformed(format!("operation {tag:?} is missing its payload")))
}

fn malformed(message: impl Into<String>) -> DiffError {
    DiffError::MalformedOperation(message.into())
}

fn precondition(message: impl Into<String>) -> DiffError {
    DiffError::OperationPreconditionViolated(message.into())
}

/// Diff two objects into the operation set transforming `base` into
/// `modified`. Equal members are omitted; an equal pair of objects diffs to
/// the empty set.
pub fn object_diff(base: &Map<String, Value>, modified: &Map<String, Value>) -> ObjectOperationSet {
    let mut ops = ObjectOperationSet::new();
    for (key, value) in base {
        match modified.get(key) {
            None => {
                ops.insert(key.clone(), Operation::Remove);
            }
            Some(new) if new == value => {}
            Some(new) => {
                ops.insert(key.clone(), value_diff(value, new));
            }
        }
    }
    for (key, value) in modified {
        if !base.contains_key(key) {
            ops.insert(key.clone(), Operation::Add(value.clone()));
        }
    }
    ops
}

fn value_diff(base: &Value, modified: &Value) -> Operation {
    match (base, modified) {
        (Value::Object(a), Value::Object(b)) => {
            let inner = object_diff(a, b);
            if inner.is_empty() {
                Operation::Replace(modified.clone())
            } else {
                Operation::Object(inner)
            }
        }
        #[cfg(feature = "list-diff")]
        (Value::Array(a), Value::Array(b)) => {
            let inner = list_diff(a, b);
            if inner.is_empty() {
                Operation::Replace(modified.clone())
            } else {
                Operation::List(inner)
            }
        }
        (Value::String(a), Value::String(b)) if !a.is_empty() && !b.is_empty() => {
            match textdiff::make_patch(a, b) {
                Ok(patch) => Operation::Dmp(patch),
                Err(_) => Operation::Replace(modified.clone()),
            }
        }
        (Value::Number(a), Value::Number(b)) => match number_delta(a, b) {
            Some(delta) => Operation::Increment(delta),
            None => Operation::Replace(modified.clone()),
        },
        _ => Operation::Replace(modified.clone()),
    }
}

/// Align two lists on their common prefix and suffix and diff the middle
/// positionally. Index keys refer to the pre-image list.
#[cfg(feature = "list-diff")]
pub fn list_diff(base: &[Value], modified: &[Value]) -> ListOperationSet {
    let limit = base.len().min(modified.len());
    let prefix = base
        .iter()
        .zip(modified)
        .take_while(|(a, b)| a == b)
        .count();
    let suffix = (1..=limit - prefix)
        .take_while(|&i| base[base.len() - i] == modified[modified.len() - i])
        .count();
    let base_middle = &base[prefix..base.len() - suffix];
    let modified_middle = &modified[prefix..modified.len() - suffix];

    let mut ops = ListOperationSet::new();
    for offset in 0..base_middle.len().max(modified_middle.len()) {
        let index = prefix + offset;
        match (base_middle.get(offset), modified_middle.get(offset)) {
            (Some(a), Some(b)) if a == b => {}
            (Some(a), Some(b)) => {
                ops.insert(index, value_diff(a, b));
            }
            (Some(_), None) => {
                ops.insert(index, Operation::Remove);
            }
            (None, Some(b)) => {
                ops.insert(index, Operation::Add(b.clone()));
            }
            (None, None) => {}
        }
    }
    ops
}

/// Apply an operation set to `base`, producing the modified object. `base`
/// is never mutated.
pub fn apply_object_diff(
    ops: &ObjectOperationSet,
    base: &Map<String, Value>,
) -> Result<Map<String, Value>, DiffError> {
    let mut out = base.clone();
    for (key, op) in ops {
        match op {
            Operation::Add(v) => {
                if out.contains_key(key) {
                    return Err(precondition(format!("add to present key {key:?}")));
                }
                out.insert(key.clone(), v.clone());
            }
            Operation::Remove => {
                if out.remove(key).is_none() {
                    return Err(precondition(format!("remove of absent key {key:?}")));
                }
            }
            Operation::Replace(v) => {
                out.insert(key.clone(), v.clone());
            }
            edit => {
                let current = out
                    .get(key)
                    .ok_or_else(|| precondition(format!("edit of absent key {key:?}")))?;
                let next = apply_value(edit, current)?;
                out.insert(key.clone(), next);
            }
        }
    }
    Ok(out)
}

fn apply_value(op: &Operation, current: &Value) -> Result<Value, DiffError> {
    match (op, current) {
        (Operation::Increment(delta), Value::Number(n)) => {
            Ok(Value::Number(number_add(n, delta)?))
        }
        (Operation::Increment(_), _) => Err(precondition("increment of a non-number")),
        (Operation::Dmp(patch), Value::String(s)) => {
            Ok(Value::String(textdiff::apply_patch(patch, s)?))
        }
        (Operation::Dmp(_), _) => Err(precondition("text patch of a non-string")),
        (Operation::Object(ops), Value::Object(map)) => {
            Ok(Value::Object(apply_object_diff(ops, map)?))
        }
        (Operation::Object(_), _) => Err(precondition("object diff of a non-object")),
        (Operation::List(ops), Value::Array(items)) => {
            Ok(Value::Array(apply_list_diff(ops, items)?))
        }
        (Operation::List(_), _) => Err(precondition("list diff of a non-list")),
        (Operation::Add(_) | Operation::Remove | Operation::Replace(_), _) => {
            Err(malformed("positional operation in value position"))
        }
    }
}

/// Apply a list operation set. Replacements, recursive edits, and removals
/// run in descending pre-image index order; insertions then splice in
/// ascending order.
pub fn apply_list_diff(ops: &ListOperationSet, base: &[Value]) -> Result<Vec<Value>, DiffError> {
    let mut out = base.to_vec();
    for (&index, op) in ops.iter().rev() {
        match op {
            Operation::Add(_) => {}
            Operation::Remove => {
                if index >= out.len() {
                    return Err(precondition(format!("remove of absent list index {index}")));
                }
                out.remove(index);
            }
            Operation::Replace(v) => {
                if index >= out.len() {
                    return Err(precondition(format!(
                        "replace of absent list index {index}"
                    )));
                }
                out[index] = v.clone();
            }
            edit => {
                let current = out
                    .get(index)
                    .ok_or_else(|| precondition(format!("edit of absent list index {index}")))?;
                out[index] = apply_value(edit, current)?;
            }
        }
    }
    for (&index, op) in ops.iter() {
        if let Operation::Add(v) = op {
            if index > out.len() {
                return Err(precondition(format!("insert past end of list at {index}")));
            }
            out.insert(index, v.clone());
        }
    }
    Ok(out)
}

/// Rebase `local` onto `upstream`, both diffs of `base`, so that the result
/// can be applied after `upstream`. On equal-precedence conflicts the
/// upstream side wins and the local operation is dropped.
pub fn transform_object_diff(
    local: &ObjectOperationSet,
    upstream: &ObjectOperationSet,
    base: &Map<String, Value>,
) -> Result<ObjectOperationSet, DiffError> {
    let mut out = ObjectOperationSet::new();
    for (key, local_op) in local {
        let Some(upstream_op) = upstream.get(key) else {
            out.insert(key.clone(), local_op.clone());
            continue;
        };
        if let Some(rebased) = transform_operation(local_op, upstream_op, base.get(key))? {
            out.insert(key.clone(), rebased);
        }
    }
    Ok(out)
}

fn transform_operation(
    local: &Operation,
    upstream: &Operation,
    base: Option<&Value>,
) -> Result<Option<Operation>, DiffError> {
    use Operation::*;
    Ok(match (local, upstream) {
        // Both sides created the key; the local value survives as a replace.
        (Add(a), Add(b)) => {
            if a == b {
                None
            } else {
                Some(Replace(a.clone()))
            }
        }
        (Add(v), Remove) => Some(Add(v.clone())),
        (Add(_), _) => None,

        (Remove, Remove) => None,
        (Remove, _) => Some(Remove),

        (Replace(_), Replace(_)) => None,
        (Replace(v), _) => Some(Replace(v.clone())),

        (Increment(n), Increment(_)) => Some(Increment(n.clone())),
        (Increment(_), _) => None,

        (Object(a), Object(b)) => {
            let sub_base = match base {
                Some(Value::Object(map)) => map,
                _ => return Err(precondition("object transform without an object base")),
            };
            let inner = transform_object_diff(a, b, sub_base)?;
            if inner.is_empty() {
                None
            } else {
                Some(Object(inner))
            }
        }
        (List(a), List(b)) => {
            let sub_base = match base {
                Some(Value::Array(items)) => items.as_slice(),
                _ => return Err(precondition("list transform without a list base")),
            };
            let inner = transform_list_diff(a, b, sub_base)?;
            if inner.is_empty() {
                None
            } else {
                Some(List(inner))
            }
        }
        (Object(_) | List(_), _) => None,

        (Dmp(local_patch), Dmp(upstream_patch)) => {
            let base_text = match base {
                Some(Value::String(s)) => s.as_str(),
                _ => return Err(precondition("text transform without a string base")),
            };
            textdiff::transform_patch(local_patch, upstream_patch, base_text)?.map(Dmp)
        }
        (Dmp(_), _) => None,
    })
}

/// Rebase list operations: upstream insertions and removals below a local
/// index shift it; an upstream operation on the same element resolves by the
/// same precedence rules as object members.
fn transform_list_diff(
    local: &ListOperationSet,
    upstream: &ListOperationSet,
    base: &[Value],
) -> Result<ListOperationSet, DiffError> {
    let mut out = ListOperationSet::new();
    for (&index, local_op) in local {
        let mut shifted = index;
        let mut collision: Option<&Operation> = None;
        for (&upstream_index, upstream_op) in upstream {
            match upstream_op {
                Operation::Add(_) => {
                    // The server's insertion lands first, also on index ties.
                    if upstream_index <= index {
                        shifted += 1;
                    }
                }
                Operation::Remove => {
                    if upstream_index < index {
                        shifted = shifted.saturating_sub(1);
                    } else if upstream_index == index {
                        collision = Some(upstream_op);
                    }
                }
                other => {
                    if upstream_index == index {
                        collision = Some(other);
                    }
                }
            }
        }
        let rebased = match collision {
            Some(upstream_op) => transform_operation(local_op, upstream_op, base.get(index))?,
            None => Some(local_op.clone()),
        };
        if let Some(op) = rebased {
            out.insert(shifted, op);
        }
    }
    Ok(out)
}

fn number_delta(base: &Number, modified: &Number) -> Option<Number> {
    if let (Some(a), Some(b)) = (base.as_i64(), modified.as_i64()) {
        return b.checked_sub(a).map(Number::from);
    }
    let delta = modified.as_f64()? - base.as_f64()?;
    Number::from_f64(delta)
}

fn number_add(base: &Number, delta: &Number) -> Result<Number, DiffError> {
    if let (Some(a), Some(d)) = (base.as_i64(), delta.as_i64()) {
        if let Some(sum) = a.checked_add(d) {
            return Ok(Number::from(sum));
        }
    }
    match (base.as_f64(), delta.as_f64()) {
        (Some(a), Some(d)) => Number::from_f64(a + d)
            .ok_or_else(|| precondition("increment produced a non-finite number")),
        _ => Err(precondition("increment overflowed")),
    }
}
