//! JSON patch operations over `serde_json::Value` documents.
//!
//! Operations follow RFC 6902 (`add`, `remove`, `replace`, `move`, `copy`,
//! `test`) with RFC 6901 JSON pointers. A sequence is applied to a working
//! copy and committed only if every operation succeeds, so a failed `test`
//! leaves the document exactly as it was.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single patch operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum PatchOperation {
    Add { path: String, value: Value },
    Remove { path: String },
    Replace { path: String, value: Value },
    Move { from: String, path: String },
    Copy { from: String, path: String },
    /// Precondition: the value at `path` must equal `value`
    Test { path: String, value: Value },
}

impl PatchOperation {
    pub fn path(&self) -> &str {
        match self {
            PatchOperation::Add { path, .. }
            | PatchOperation::Remove { path }
            | PatchOperation::Replace { path, .. }
            | PatchOperation::Move { path, .. }
            | PatchOperation::Copy { path, .. }
            | PatchOperation::Test { path, .. } => path,
        }
    }
}

/// Why an operation could not be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatchErrorKind {
    /// A `test` operation found a different value
    TestFailed,
    /// The pointer does not resolve to an existing location
    PathNotFound,
    /// The pointer is malformed, or a `move` targets its own child
    InvalidPath,
    /// An array index is not a number or is out of range
    InvalidIndex,
}

/// Failure of one operation inside a patch sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchError {
    /// Position of the failing operation in the sequence
    pub index: usize,
    pub path: String,
    pub kind: PatchErrorKind,
}

impl PatchError {
    pub fn is_test_failure(&self) -> bool {
        self.kind == PatchErrorKind::TestFailed
    }
}

impl std::fmt::Display for PatchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let reason = match self.kind {
            PatchErrorKind::TestFailed => "test failed",
            PatchErrorKind::PathNotFound => "path not found",
            PatchErrorKind::InvalidPath => "invalid path",
            PatchErrorKind::InvalidIndex => "invalid array index",
        };
        write!(f, "Patch operation {} at '{}': {reason}", self.index, self.path)
    }
}

impl std::error::Error for PatchError {}

/// Apply `ops` to `doc` transactionally.
pub fn apply(doc: &mut Value, ops: &[PatchOperation]) -> Result<(), PatchError> {
    let mut working = doc.clone();
    for (index, op) in ops.iter().enumerate() {
        apply_one(&mut working, op).map_err(|kind| PatchError {
            index,
            path: op.path().to_string(),
            kind,
        })?;
    }
    *doc = working;
    Ok(())
}

fn apply_one(doc: &mut Value, op: &PatchOperation) -> Result<(), PatchErrorKind> {
    match op {
        PatchOperation::Add { path, value } => add(doc, &parse_pointer(path)?, value.clone()),
        PatchOperation::Remove { path } => remove(doc, &parse_pointer(path)?).map(|_| ()),
        PatchOperation::Replace { path, value } => {
            let target = resolve_mut(doc, &parse_pointer(path)?)?;
            *target = value.clone();
            Ok(())
        }
        PatchOperation::Move { from, path } => {
            let from = parse_pointer(from)?;
            let to = parse_pointer(path)?;
            if to.len() > from.len() && to[..from.len()] == from[..] {
                return Err(PatchErrorKind::InvalidPath);
            }
            let value = remove(doc, &from)?;
            add(doc, &to, value)
        }
        PatchOperation::Copy { from, path } => {
            let value = resolve(doc, &parse_pointer(from)?)?.clone();
            add(doc, &parse_pointer(path)?, value)
        }
        PatchOperation::Test { path, value } => {
            if resolve(doc, &parse_pointer(path)?)? == value {
                Ok(())
            } else {
                Err(PatchErrorKind::TestFailed)
            }
        }
    }
}

/// Split a JSON pointer into unescaped reference tokens.
fn parse_pointer(pointer: &str) -> Result<Vec<String>, PatchErrorKind> {
    if pointer.is_empty() {
        return Ok(Vec::new());
    }
    let rest = pointer.strip_prefix('/').ok_or(PatchErrorKind::InvalidPath)?;
    Ok(rest
        .split('/')
        .map(|token| token.replace("~1", "/").replace("~0", "~"))
        .collect())
}

fn parse_index(token: &str, len: usize) -> Result<usize, PatchErrorKind> {
    let well_formed = !token.is_empty()
        && token.bytes().all(|b| b.is_ascii_digit())
        && (token == "0" || !token.starts_with('0'));
    if !well_formed {
        return Err(PatchErrorKind::InvalidIndex);
    }
    let index: usize = token.parse().map_err(|_| PatchErrorKind::InvalidIndex)?;
    if index > len {
        return Err(PatchErrorKind::InvalidIndex);
    }
    Ok(index)
}

fn resolve<'a>(doc: &'a Value, tokens: &[String]) -> Result<&'a Value, PatchErrorKind> {
    tokens.iter().try_fold(doc, |node, token| match node {
        Value::Object(map) => map.get(token).ok_or(PatchErrorKind::PathNotFound),
        Value::Array(items) => {
            let index = parse_index(token, items.len())?;
            items.get(index).ok_or(PatchErrorKind::InvalidIndex)
        }
        _ => Err(PatchErrorKind::PathNotFound),
    })
}

fn resolve_mut<'a>(doc: &'a mut Value, tokens: &[String]) -> Result<&'a mut Value, PatchErrorKind> {
    tokens.iter().try_fold(doc, |node, token| match node {
        Value::Object(map) => map.get_mut(token).ok_or(PatchErrorKind::PathNotFound),
        Value::Array(items) => {
            let index = parse_index(token, items.len())?;
            items.get_mut(index).ok_or(PatchErrorKind::InvalidIndex)
        }
        _ => Err(PatchErrorKind::PathNotFound),
    })
}

fn add(doc: &mut Value, tokens: &[String], value: Value) -> Result<(), PatchErrorKind> {
    let Some((last, parent)) = tokens.split_last() else {
        *doc = value;
        return Ok(());
    };
    match resolve_mut(doc, parent)? {
        Value::Object(map) => {
            map.insert(last.clone(), value);
            Ok(())
        }
        Value::Array(items) => {
            if last == "-" {
                items.push(value);
            } else {
                let index = parse_index(last, items.len())?;
                items.insert(index, value);
            }
            Ok(())
        }
        _ => Err(PatchErrorKind::PathNotFound),
    }
}

fn remove(doc: &mut Value, tokens: &[String]) -> Result<Value, PatchErrorKind> {
    let (last, parent) = tokens.split_last().ok_or(PatchErrorKind::InvalidPath)?;
    match resolve_mut(doc, parent)? {
        Value::Object(map) => map.remove(last).ok_or(PatchErrorKind::PathNotFound),
        Value::Array(items) => {
            let index = parse_index(last, items.len())?;
            if index >= items.len() {
                return Err(PatchErrorKind::InvalidIndex);
            }
            Ok(items.remove(index))
        }
        _ => Err(PatchErrorKind::PathNotFound),
    }
}
