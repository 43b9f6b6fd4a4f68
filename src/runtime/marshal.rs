//! Marshaling across the context boundary.
//!
//! Arguments travel into a context as [`Transferable`]s: either a
//! detached plain copy, or an envelope referencing a value that already
//! lives there. Results travel out the same two ways, surfaced to
//! callers as [`OpResult`]. The deep-copy direction detects cycles by
//! object identity and enforces the context's copy budget.

use std::collections::HashSet;

use indexmap::IndexMap;

use crate::runtime::config::CopyLimits;
use crate::runtime::error::{Error, Result};
use crate::runtime::live::{LiveValue, ObjectKind, ObjectRef, Property};
use crate::runtime::reference::{ReferenceEnvelope, ReferenceHandle};
use crate::runtime::runner::ContextState;
use crate::runtime::value::{LimitTracker, PlainValue};

/// Pre-marshaled argument form: context-independent, ready to be
/// re-materialized on the target context's thread.
#[derive(Debug, Clone)]
pub enum Transferable {
    /// Plain data, deep-copied into the target context.
    Copy(PlainValue),
    /// A reference to a value that must already live in the target
    /// context; references from other contexts are refused at
    /// materialization.
    Reference(ReferenceEnvelope),
}

impl Transferable {
    /// Transfer a handle's referent by reference. Fails if the handle
    /// was released.
    pub fn reference(handle: &ReferenceHandle) -> Result<Self> {
        handle.transfer_out().map(Transferable::Reference)
    }
}

impl From<PlainValue> for Transferable {
    fn from(value: PlainValue) -> Self {
        Transferable::Copy(value)
    }
}

/// Result of a value-producing operation, marshaled per the requested
/// [`ResultKind`](crate::runtime::config::ResultKind).
#[derive(Debug)]
pub enum OpResult {
    Plain(PlainValue),
    Reference(ReferenceHandle),
}

impl OpResult {
    pub fn into_plain(self) -> Result<PlainValue> {
        match self {
            OpResult::Plain(value) => Ok(value),
            OpResult::Reference(_) => Err(Error::InvalidOperation(
                "result was marshaled as a reference".to_string(),
            )),
        }
    }

    pub fn into_reference(self) -> Result<ReferenceHandle> {
        match self {
            OpResult::Reference(handle) => Ok(handle),
            OpResult::Plain(_) => Err(Error::InvalidOperation(
                "result was marshaled as a plain copy".to_string(),
            )),
        }
    }
}

/// Materialize a transferable inside the target context.
pub(crate) fn materialize(state: &ContextState, transferable: Transferable) -> Result<LiveValue> {
    match transferable {
        Transferable::Copy(value) => Ok(plain_to_live(value)),
        Transferable::Reference(envelope) => {
            if envelope.context_id() != state.context_id() {
                return Err(Error::InvalidOperation(
                    "reference belongs to a different context".to_string(),
                ));
            }
            state.deref(envelope.reference())
        }
    }
}

/// Deep-copy a live value into its detached plain form. Functions and
/// promise-like objects are not copyable; cycles fail rather than
/// recurse.
pub(crate) fn live_to_plain(value: &LiveValue, limits: CopyLimits) -> Result<PlainValue> {
    let mut visited = HashSet::new();
    let mut tracker = LimitTracker::new(limits);
    copy_value(value, &mut visited, &mut tracker)
}

fn copy_value(
    value: &LiveValue,
    visited: &mut HashSet<usize>,
    tracker: &mut LimitTracker,
) -> Result<PlainValue> {
    tracker.descend()?;
    let copied = match value {
        LiveValue::Undefined => {
            tracker.charge(1)?;
            PlainValue::Undefined
        }
        LiveValue::Null => {
            tracker.charge(1)?;
            PlainValue::Null
        }
        LiveValue::Bool(b) => {
            tracker.charge(1)?;
            PlainValue::Bool(*b)
        }
        LiveValue::Number(n) => {
            tracker.charge(std::mem::size_of::<f64>())?;
            PlainValue::number(*n)
        }
        LiveValue::String(s) => {
            tracker.charge(s.len())?;
            PlainValue::String(s.clone())
        }
        LiveValue::Function(func) => {
            return Err(Error::InvalidOperation(format!(
                "function '{}' is not copyable",
                func.name().unwrap_or("<anonymous>")
            )))
        }
        LiveValue::Object(object) => {
            let copied = copy_object(object, visited, tracker)?;
            visited.remove(&object.identity());
            copied
        }
    };
    tracker.ascend();
    Ok(copied)
}

fn copy_object(
    object: &ObjectRef,
    visited: &mut HashSet<usize>,
    tracker: &mut LimitTracker,
) -> Result<PlainValue> {
    if !visited.insert(object.identity()) {
        return Err(Error::InvalidOperation(
            "circular structure is not copyable".to_string(),
        ));
    }
    let data = object.borrow();
    match &data.kind {
        ObjectKind::Promise(_) => Err(Error::InvalidOperation(
            "a promise is not copyable".to_string(),
        )),
        ObjectKind::Array(elements) => {
            let mut items = Vec::with_capacity(elements.len());
            for element in elements {
                items.push(copy_value(element, visited, tracker)?);
            }
            Ok(PlainValue::Array(items))
        }
        ObjectKind::Plain => {
            let mut map = IndexMap::with_capacity(data.properties.len());
            for (key, property) in &data.properties {
                // Accessor properties are behaviors, not data; a copy
                // carries own data properties only.
                if let Property::Value(value) = property {
                    tracker.charge(key.len())?;
                    map.insert(key.clone(), copy_value(value, visited, tracker)?);
                }
            }
            Ok(PlainValue::Object(map))
        }
    }
}

/// Rebuild a live value from its plain form inside the target context.
pub(crate) fn plain_to_live(value: PlainValue) -> LiveValue {
    match value {
        PlainValue::Undefined => LiveValue::Undefined,
        PlainValue::Null => LiveValue::Null,
        PlainValue::Bool(b) => LiveValue::Bool(b),
        PlainValue::Int(i) => LiveValue::Number(i as f64),
        PlainValue::Float(f) => LiveValue::Number(f),
        PlainValue::String(s) => LiveValue::String(s),
        PlainValue::Array(items) => {
            let elements = items.into_iter().map(plain_to_live).collect();
            LiveValue::Object(ObjectRef::array(elements))
        }
        PlainValue::Object(map) => {
            let object = ObjectRef::plain();
            for (key, value) in map {
                object.define(key, plain_to_live(value));
            }
            LiveValue::Object(object)
        }
    }
}
