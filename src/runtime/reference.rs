//! Reference descriptors, handles, and transfer envelopes.
//!
//! A [`ReferenceData`] descriptor is the immutable record of a captured
//! value: its owning context, its remote reference, and its type
//! classification and flags as they were at capture time. Mutating the
//! live value afterward does not update the descriptor; the snapshot is
//! intentionally stale. [`ReferenceHandle`] wraps a descriptor with a
//! one-way disposed flag and exposes the typed operation surface;
//! [`ReferenceEnvelope`] is the value-type form that crosses context
//! boundaries and re-materializes into an equivalent handle.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::runtime::config::{CaptureOptions, DerefOptions, ExecMode, TransferOptions};
use crate::runtime::context::{ContextHandle, RemoteRef};
use crate::runtime::error::{Error, Result};
use crate::runtime::live::{LiveValue, PromiseState, PropertyKey};
use crate::runtime::marshal::{plain_to_live, OpResult, Transferable};
use crate::runtime::runner::{
    ContextCommand, ContextScope, ContextState, Deferred, Dispatched, Responder,
};
use crate::runtime::value::PlainValue;

/// Type classification of a captured value. Frozen at capture time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeOf {
    Null,
    Undefined,
    Number,
    String,
    Boolean,
    Object,
    Function,
}

impl TypeOf {
    pub fn as_str(&self) -> &'static str {
        match self {
            TypeOf::Null => "null",
            TypeOf::Undefined => "undefined",
            TypeOf::Number => "number",
            TypeOf::String => "string",
            TypeOf::Boolean => "boolean",
            TypeOf::Object => "object",
            TypeOf::Function => "function",
        }
    }
}

impl std::fmt::Display for TypeOf {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Frees the captured slot when the last descriptor sharing it drops.
/// Delivery is best-effort; a context that is already gone has nothing
/// left to free.
#[derive(Debug)]
pub(crate) struct SlotGuard {
    holder: ContextHandle,
    remote: RemoteRef,
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.holder.send_raw(ContextCommand::ReleaseSlot {
            slot: self.remote.slot(),
        });
    }
}

/// Immutable descriptor of a captured value.
///
/// The owning-context handle is the sole strong-ownership edge; the
/// remote references are lookup keys carrying only a non-owning context
/// id.
#[derive(Debug, Clone)]
pub struct ReferenceData {
    holder: ContextHandle,
    guard: Arc<SlotGuard>,
    reference: RemoteRef,
    context: RemoteRef,
    type_of: TypeOf,
    accessors: bool,
    inherit: bool,
    is_array: bool,
    is_promise: bool,
    promise_state: Option<PromiseState>,
    is_async: bool,
    name: Option<Arc<str>>,
}

fn classify(value: &LiveValue) -> (TypeOf, bool, bool, Option<PromiseState>, bool, Option<String>) {
    match value {
        LiveValue::Undefined => (TypeOf::Undefined, false, false, None, false, None),
        LiveValue::Null => (TypeOf::Null, false, false, None, false, None),
        LiveValue::Bool(_) => (TypeOf::Boolean, false, false, None, false, None),
        LiveValue::Number(_) => (TypeOf::Number, false, false, None, false, None),
        LiveValue::String(_) => (TypeOf::String, false, false, None, false, None),
        LiveValue::Object(object) => (
            TypeOf::Object,
            object.is_array(),
            object.is_promise(),
            object.promise_state(),
            false,
            None,
        ),
        LiveValue::Function(func) => (
            TypeOf::Function,
            false,
            false,
            None,
            func.is_async(),
            func.name().map(str::to_string),
        ),
    }
}

/// Capture a live value into a new reference handle. Runs on the owning
/// context's thread; the classification snapshot is taken here and never
/// revisited.
pub(crate) fn capture_reference(
    state: &mut ContextState,
    owner: &ContextHandle,
    value: LiveValue,
    options: &CaptureOptions,
) -> ReferenceHandle {
    let (type_of, is_array, is_promise, promise_state, is_async, captured_name) = classify(&value);
    let remote = state.insert_slot(value);
    let context = RemoteRef::new(state.context_id(), 0);
    let name = options
        .name
        .clone()
        .or(captured_name)
        .map(Arc::<str>::from);
    ReferenceHandle::from_data(ReferenceData {
        holder: owner.clone(),
        guard: Arc::new(SlotGuard {
            holder: owner.clone(),
            remote,
        }),
        reference: remote,
        context,
        type_of,
        accessors: options.accessors,
        inherit: options.inherit,
        is_array,
        is_promise,
        promise_state,
        is_async,
        name,
    })
}

/// Disposal-aware handle over a captured value, exposing the typed
/// operation surface.
///
/// Every mutating or invoking operation performs the disposal check and
/// the classification check locally, before any command is built or
/// dispatched; a request guaranteed to fail never costs a cross-thread
/// round trip.
#[derive(Debug)]
pub struct ReferenceHandle {
    data: ReferenceData,
    disposed: AtomicBool,
}

impl ReferenceHandle {
    pub(crate) fn from_data(data: ReferenceData) -> Self {
        Self {
            data,
            disposed: AtomicBool::new(false),
        }
    }

    /// The context that owns the referenced value.
    pub fn owner(&self) -> &ContextHandle {
        &self.data.holder
    }

    fn check_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::ReferenceReleased);
        }
        Ok(())
    }

    fn check_live(&self) -> Result<()> {
        self.check_disposed()?;
        if self.data.holder.is_disposed() {
            return Err(Error::ContextDisposed);
        }
        Ok(())
    }

    fn check_object_like(&self) -> Result<()> {
        match self.data.type_of {
            TypeOf::Object | TypeOf::Function => Ok(()),
            other => Err(Error::InvalidOperation(format!(
                "property access on a value of type {other}"
            ))),
        }
    }

    fn effective(&self, options: TransferOptions) -> TransferOptions {
        TransferOptions {
            result: options.result,
            accessors: options.accessors || self.data.accessors,
            inherit: options.inherit || self.data.inherit,
        }
    }

    fn dispatch<T, F>(&self, mode: ExecMode, build: F) -> Result<Dispatched<T>>
    where
        F: FnOnce(Responder<T>) -> ContextCommand,
    {
        match mode {
            ExecMode::Block => self.data.holder.dispatch_block(build).map(Dispatched::Returned),
            ExecMode::Defer => Ok(Dispatched::Deferred(self.data.holder.dispatch_defer(build))),
            ExecMode::Ignore => self
                .data
                .holder
                .dispatch_ignore(build)
                .map(|()| Dispatched::Ignored),
        }
    }

    /// Invoke the referenced value as a function.
    pub fn apply(
        &self,
        receiver: Option<Transferable>,
        arguments: Vec<Transferable>,
        options: TransferOptions,
        mode: ExecMode,
    ) -> Result<Dispatched<OpResult>> {
        self.check_live()?;
        if self.data.type_of != TypeOf::Function {
            return Err(Error::InvalidOperation(format!(
                "apply on a value of type {}",
                self.data.type_of
            )));
        }
        let owner = self.data.holder.clone();
        let reference = self.data.reference;
        let options = self.effective(options);
        self.dispatch(mode, move |responder| ContextCommand::Apply {
            owner,
            reference,
            receiver,
            arguments,
            options,
            responder,
        })
    }

    pub fn apply_sync(
        &self,
        receiver: Option<Transferable>,
        arguments: Vec<Transferable>,
        options: TransferOptions,
    ) -> Result<OpResult> {
        self.apply(receiver, arguments, options, ExecMode::Block)?
            .returned()
    }

    pub fn apply_async(
        &self,
        receiver: Option<Transferable>,
        arguments: Vec<Transferable>,
        options: TransferOptions,
    ) -> Deferred<OpResult> {
        into_deferred(self.apply(receiver, arguments, options, ExecMode::Defer))
    }

    pub fn apply_ignored(
        &self,
        receiver: Option<Transferable>,
        arguments: Vec<Transferable>,
    ) -> Result<()> {
        self.apply(
            receiver,
            arguments,
            TransferOptions::default(),
            ExecMode::Ignore,
        )
        .map(|_| ())
    }

    /// Read a property of the referenced value.
    pub fn get(
        &self,
        key: impl Into<PropertyKey>,
        options: TransferOptions,
        mode: ExecMode,
    ) -> Result<Dispatched<OpResult>> {
        self.check_live()?;
        self.check_object_like()?;
        let owner = self.data.holder.clone();
        let reference = self.data.reference;
        let key = key.into();
        let options = self.effective(options);
        self.dispatch(mode, move |responder| ContextCommand::GetProp {
            owner,
            reference,
            key,
            options,
            responder,
        })
    }

    pub fn get_sync(
        &self,
        key: impl Into<PropertyKey>,
        options: TransferOptions,
    ) -> Result<OpResult> {
        self.get(key, options, ExecMode::Block)?.returned()
    }

    pub fn get_async(
        &self,
        key: impl Into<PropertyKey>,
        options: TransferOptions,
    ) -> Deferred<OpResult> {
        into_deferred(self.get(key, options, ExecMode::Defer))
    }

    /// Write a property of the referenced value. Resolves to whether the
    /// write took effect.
    pub fn set(
        &self,
        key: impl Into<PropertyKey>,
        value: Transferable,
        options: TransferOptions,
        mode: ExecMode,
    ) -> Result<Dispatched<bool>> {
        self.check_live()?;
        self.check_object_like()?;
        let reference = self.data.reference;
        let key = key.into();
        let options = self.effective(options);
        self.dispatch(mode, move |responder| ContextCommand::SetProp {
            reference,
            key,
            value,
            options,
            responder,
        })
    }

    pub fn set_sync(
        &self,
        key: impl Into<PropertyKey>,
        value: Transferable,
        options: TransferOptions,
    ) -> Result<bool> {
        self.set(key, value, options, ExecMode::Block)?.returned()
    }

    pub fn set_async(
        &self,
        key: impl Into<PropertyKey>,
        value: Transferable,
        options: TransferOptions,
    ) -> Deferred<bool> {
        into_deferred(self.set(key, value, options, ExecMode::Defer))
    }

    pub fn set_ignored(&self, key: impl Into<PropertyKey>, value: Transferable) -> Result<()> {
        self.set(key, value, TransferOptions::default(), ExecMode::Ignore)
            .map(|_| ())
    }

    /// Remove an own property. Resolves to whether a property existed.
    pub fn delete(&self, key: impl Into<PropertyKey>, mode: ExecMode) -> Result<Dispatched<bool>> {
        self.check_live()?;
        self.check_object_like()?;
        let reference = self.data.reference;
        let key = key.into();
        self.dispatch(mode, move |responder| ContextCommand::DeleteProp {
            reference,
            key,
            responder,
        })
    }

    pub fn delete_sync(&self, key: impl Into<PropertyKey>) -> Result<bool> {
        self.delete(key, ExecMode::Block)?.returned()
    }

    pub fn delete_async(&self, key: impl Into<PropertyKey>) -> Deferred<bool> {
        into_deferred(self.delete(key, ExecMode::Defer))
    }

    pub fn delete_ignored(&self, key: impl Into<PropertyKey>) -> Result<()> {
        self.delete(key, ExecMode::Ignore).map(|_| ())
    }

    /// Produce a fully detached copy of the referenced value's data.
    pub fn copy(&self, mode: ExecMode) -> Result<Dispatched<PlainValue>> {
        self.check_live()?;
        if self.data.type_of == TypeOf::Function {
            return Err(Error::InvalidOperation(
                "a function is not copyable".to_string(),
            ));
        }
        if self.data.is_promise {
            return Err(Error::InvalidOperation(
                "a promise is not copyable".to_string(),
            ));
        }
        let reference = self.data.reference;
        self.dispatch(mode, move |responder| ContextCommand::CopyValue {
            reference,
            responder,
        })
    }

    pub fn copy_sync(&self) -> Result<PlainValue> {
        self.copy(ExecMode::Block)?.returned()
    }

    pub fn copy_async(&self) -> Deferred<PlainValue> {
        into_deferred(self.copy(ExecMode::Defer))
    }

    /// Materialize the referenced value inside the caller's own context.
    /// Valid only on the owning context's thread.
    pub fn deref_in(&self, scope: &ContextScope<'_>) -> Result<LiveValue> {
        self.check_disposed()?;
        if scope.context_id() != self.data.reference.context_id() {
            return Err(Error::InvalidOperation(
                "reference belongs to a different context".to_string(),
            ));
        }
        scope.state().deref(self.data.reference)
    }

    /// Materialize into the caller's context, optionally crossing the
    /// context boundary by deep copy when [`DerefOptions::copy`] is set.
    /// The cross-context path blocks on the owning context.
    pub fn deref_into(
        &self,
        scope: &mut ContextScope<'_>,
        options: DerefOptions,
    ) -> Result<LiveValue> {
        self.check_disposed()?;
        if scope.context_id() == self.data.reference.context_id() {
            return scope.state().deref(self.data.reference);
        }
        if !options.copy {
            return Err(Error::InvalidOperation(
                "cross-context dereference requires the copy option".to_string(),
            ));
        }
        let plain = self.copy(ExecMode::Block)?.returned()?;
        Ok(plain_to_live(plain))
    }

    /// Dispose the handle. One-way and idempotent; all further
    /// operations fail with a disposal error.
    pub fn release(&self) {
        self.disposed.swap(true, Ordering::SeqCst);
    }

    pub fn is_released(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Build the transferable form of this handle. The envelope binds to
    /// the same underlying remote reference.
    pub fn transfer_out(&self) -> Result<ReferenceEnvelope> {
        self.check_disposed()?;
        Ok(ReferenceEnvelope {
            data: self.data.clone(),
        })
    }

    // Read-only accessors over the frozen descriptor. No dispatch; they
    // fail only when the handle itself was released.

    pub fn type_of(&self) -> Result<TypeOf> {
        self.check_disposed()?;
        Ok(self.data.type_of)
    }

    pub fn is_array(&self) -> Result<bool> {
        self.check_disposed()?;
        Ok(self.data.is_array)
    }

    pub fn is_promise(&self) -> Result<bool> {
        self.check_disposed()?;
        Ok(self.data.is_promise)
    }

    /// Settlement state observed at capture time, for promise-flagged
    /// references.
    pub fn promise_state(&self) -> Result<Option<PromiseState>> {
        self.check_disposed()?;
        Ok(self.data.promise_state)
    }

    pub fn is_async(&self) -> Result<bool> {
        self.check_disposed()?;
        Ok(self.data.is_async)
    }

    pub fn name(&self) -> Result<Option<Arc<str>>> {
        self.check_disposed()?;
        Ok(self.data.name.clone())
    }
}

fn into_deferred<T>(result: Result<Dispatched<T>>) -> Deferred<T> {
    match result.and_then(Dispatched::deferred) {
        Ok(deferred) => deferred,
        Err(err) => Deferred::rejected(err),
    }
}

/// Serializable, context-independent form of a reference descriptor.
///
/// Carries no thread-bound state; it can cross any context boundary and
/// re-materialize into a handle bound to the same remote reference. The
/// envelope shares the descriptor's slot guard, so the captured value
/// stays alive while any envelope or handle for it exists.
#[derive(Debug, Clone)]
pub struct ReferenceEnvelope {
    data: ReferenceData,
}

impl ReferenceEnvelope {
    /// Reconstruct a reference handle equivalent to the one this
    /// envelope was built from.
    pub fn materialize(&self) -> ReferenceHandle {
        ReferenceHandle::from_data(self.data.clone())
    }

    pub fn context_id(&self) -> u64 {
        self.data.reference.context_id()
    }

    pub(crate) fn reference(&self) -> RemoteRef {
        self.data.reference
    }

    pub fn type_of(&self) -> TypeOf {
        self.data.type_of
    }

    pub fn is_array(&self) -> bool {
        self.data.is_array
    }

    pub fn is_promise(&self) -> bool {
        self.data.is_promise
    }

    pub fn promise_state(&self) -> Option<PromiseState> {
        self.data.promise_state
    }

    pub fn is_async(&self) -> bool {
        self.data.is_async
    }

    pub fn name(&self) -> Option<&str> {
        self.data.name.as_deref()
    }
}

impl PartialEq for ReferenceEnvelope {
    fn eq(&self, other: &Self) -> bool {
        self.data.reference == other.data.reference
            && self.data.context == other.data.context
            && self.data.type_of == other.data.type_of
            && self.data.accessors == other.data.accessors
            && self.data.inherit == other.data.inherit
            && self.data.is_array == other.data.is_array
            && self.data.is_promise == other.data.is_promise
            && self.data.promise_state == other.data.promise_state
            && self.data.is_async == other.data.is_async
            && self.data.name == other.data.name
    }
}

impl Eq for ReferenceEnvelope {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_types_are_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<ReferenceData>();
        assert_send_sync::<ReferenceHandle>();
        assert_send_sync::<ReferenceEnvelope>();
    }

    #[test]
    fn type_of_displays_like_a_typeof_result() {
        assert_eq!(TypeOf::Function.to_string(), "function");
        assert_eq!(TypeOf::Undefined.to_string(), "undefined");
        assert_eq!(TypeOf::Object.as_str(), "object");
    }
}
