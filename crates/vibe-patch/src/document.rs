//! Structured edits against a single JSON document
//!
//! Applies RFC 6902 operations in place and reports what each one displaced,
//! so the caller can always build an inverse. A failed operation leaves the
//! document untouched.

use serde_json::Value;
use tracing::warn;
use vibe_core::{AppliedRecord, OpKind, PatchOperation, Result, VibeError};

use crate::pointer;

/// Apply one operation to `doc`, returning its pre-image record
pub fn apply(doc: &mut Value, op: &PatchOperation) -> Result<AppliedRecord> {
    let kind = op.validate()?;
    let path = pointer::parse(&op.path)?;

    let (resolved, prior) = match kind {
        OpKind::Add => {
            let value = require_value(op)?;
            let (prior, resolved) = add_at(doc, &path, value)?;
            (resolved, prior)
        }
        OpKind::Remove => {
            let prior = remove_at(doc, &path)?;
            (path, Some(prior))
        }
        OpKind::Replace => {
            let value = require_value(op)?;
            let prior = replace_at(doc, &path, value)?;
            (path, Some(prior))
        }
        OpKind::Copy => {
            let from = pointer::parse(require_from(op)?)?;
            let value = get_at(doc, &from)
                .cloned()
                .ok_or_else(|| VibeError::PointerNotFound(pointer::format(&from)))?;
            let (prior, resolved) = add_at(doc, &path, value)?;
            (resolved, prior)
        }
        OpKind::Move => {
            let from = pointer::parse(require_from(op)?)?;
            if pointer::is_child(&from, &path) {
                return Err(VibeError::InvalidTarget(format!(
                    "cannot move {} into its own child {}",
                    pointer::format(&from),
                    op.path
                )));
            }
            if get_at(doc, &from).is_none() {
                return Err(VibeError::PointerNotFound(pointer::format(&from)));
            }
            if from == path {
                (path, None)
            } else {
                let value = remove_at(doc, &from)?;
                match add_at(doc, &path, value.clone()) {
                    Ok((prior, resolved)) => (resolved, prior),
                    Err(e) => {
                        // Put the source back so a failed move is a no-op.
                        if let Err(restore) = add_at(doc, &from, value) {
                            warn!(
                                "Could not restore {} after failed move: {}",
                                pointer::format(&from),
                                restore
                            );
                        }
                        return Err(e);
                    }
                }
            }
        }
        OpKind::Test => {
            let expected = require_value(op)?;
            let actual = get_at(doc, &path)
                .ok_or_else(|| VibeError::PointerNotFound(op.path.clone()))?;
            if *actual != expected {
                return Err(VibeError::TestFailed(format!(
                    "value at {} is {}, expected {}",
                    op.path, actual, expected
                )));
            }
            (path, None)
        }
    };

    let written = match kind {
        OpKind::Remove | OpKind::Test => None,
        _ => get_at(doc, &resolved).cloned(),
    };

    let mut applied = op.clone();
    applied.path = pointer::format(&resolved);
    let record = AppliedRecord::new(applied, prior);
    Ok(match written {
        Some(value) => record.with_new_value(value),
        None => record,
    })
}

/// Look up the value a pointer refers to
pub fn get<'a>(doc: &'a Value, pointer_str: &str) -> Option<&'a Value> {
    doc.pointer(pointer_str)
}

fn require_value(op: &PatchOperation) -> Result<Value> {
    op.value
        .clone()
        .ok_or_else(|| VibeError::Validation(format!("'{}' at {} requires a value", op.op, op.path)))
}

fn require_from(op: &PatchOperation) -> Result<&str> {
    op.from
        .as_deref()
        .ok_or_else(|| VibeError::Validation(format!("'{}' at {} requires 'from'", op.op, op.path)))
}

fn get_at<'a>(doc: &'a Value, path: &[String]) -> Option<&'a Value> {
    doc.pointer(&pointer::format(path))
}

/// Split a non-root path into its parent container and final key
fn split_parent<'p>(path: &'p [String]) -> Result<(&'p [String], &'p str)> {
    match path.split_last() {
        Some((key, parent)) => Ok((parent, key.as_str())),
        None => Err(VibeError::InvalidTarget(
            "the document root cannot be targeted".to_string(),
        )),
    }
}

fn container_mut<'a>(doc: &'a mut Value, parent: &[String]) -> Result<&'a mut Value> {
    let ptr = pointer::format(parent);
    doc.pointer_mut(&ptr)
        .ok_or(VibeError::PointerNotFound(ptr))
}

fn parse_index(key: &str) -> Result<usize> {
    if key.len() > 1 && key.starts_with('0') {
        return Err(VibeError::InvalidPointer(format!("invalid array index: {}", key)));
    }
    key.parse::<usize>()
        .map_err(|_| VibeError::InvalidPointer(format!("invalid array index: {}", key)))
}

/// Insert or overwrite; returns the overwritten value and the concrete path
fn add_at(doc: &mut Value, path: &[String], value: Value) -> Result<(Option<Value>, Vec<String>)> {
    let (parent, key) = split_parent(path)?;
    let container = container_mut(doc, parent)?;

    match container {
        Value::Object(map) => {
            let prior = map.insert(key.to_string(), value);
            Ok((prior, path.to_vec()))
        }
        Value::Array(arr) => {
            let idx = if key == "-" { arr.len() } else { parse_index(key)? };
            if idx > arr.len() {
                return Err(VibeError::InvalidTarget(format!(
                    "index {} out of bounds (len {})",
                    idx,
                    arr.len()
                )));
            }
            arr.insert(idx, value);
            let mut resolved = parent.to_vec();
            resolved.push(idx.to_string());
            Ok((None, resolved))
        }
        _ => Err(VibeError::InvalidTarget(format!(
            "{} is not a container",
            pointer::format(parent)
        ))),
    }
}

fn remove_at(doc: &mut Value, path: &[String]) -> Result<Value> {
    let (parent, key) = split_parent(path)?;
    let container = container_mut(doc, parent)?;

    match container {
        Value::Object(map) => map
            .remove(key)
            .ok_or_else(|| VibeError::PointerNotFound(pointer::format(path))),
        Value::Array(arr) => {
            let idx = parse_index(key)?;
            if idx >= arr.len() {
                return Err(VibeError::PointerNotFound(pointer::format(path)));
            }
            Ok(arr.remove(idx))
        }
        _ => Err(VibeError::InvalidTarget(format!(
            "{} is not a container",
            pointer::format(parent)
        ))),
    }
}

fn replace_at(doc: &mut Value, path: &[String], value: Value) -> Result<Value> {
    let (parent, key) = split_parent(path)?;
    let container = container_mut(doc, parent)?;

    match container {
        Value::Object(map) => match map.get_mut(key) {
            Some(slot) => Ok(std::mem::replace(slot, value)),
            None => Err(VibeError::PointerNotFound(pointer::format(path))),
        },
        Value::Array(arr) => {
            let idx = parse_index(key)?;
            match arr.get_mut(idx) {
                Some(slot) => Ok(std::mem::replace(slot, value)),
                None => Err(VibeError::PointerNotFound(pointer::format(path))),
            }
        }
        _ => Err(VibeError::InvalidTarget(format!(
            "{} is not a container",
            pointer::format(parent)
        ))),
    }
}
