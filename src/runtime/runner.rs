//! Operation runners and the per-context execution loop.
//!
//! Every cross-context operation becomes one [`ContextCommand`]: a
//! one-shot task carrying pre-marshaled arguments and a responder. The
//! [`ContextCore`] drains its command channel in strict FIFO order on the
//! context's own thread, performs the real access or invocation against
//! the live value, and marshals exactly one outcome back: a value, or a
//! context-local exception converted into a propagated error. Runners
//! never retry.

use std::collections::HashSet;
use std::future::Future;
use std::ops::ControlFlow;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::runtime::config::{CaptureOptions, CopyLimits, ResultKind, TransferOptions};
use crate::runtime::context::{ContextHandle, RemoteRef};
use crate::runtime::error::{annotate_caught, Error, Result, ThrownError};
use crate::runtime::live::{
    FunctionRef, LiveValue, ObjectKind, ObjectRef, Property, PropertyKey,
};
use crate::runtime::marshal::{live_to_plain, materialize, OpResult, Transferable};
use crate::runtime::reference::{capture_reference, ReferenceHandle};
use crate::runtime::script::{CodeHolder, Compiler};
use crate::runtime::value::PlainValue;

/// A task shipped onto a context's thread to produce a live value there.
pub(crate) type CaptureTask =
    Box<dyn FnOnce(&mut ContextScope<'_>) -> std::result::Result<LiveValue, ThrownError> + Send>;

/// Delivery channel for one task's single outcome.
pub(crate) enum Responder<T> {
    Block(std::sync::mpsc::Sender<Result<T>>),
    Defer(oneshot::Sender<Result<T>>),
    Ignore,
}

impl<T> Responder<T> {
    pub(crate) fn is_ignore(&self) -> bool {
        matches!(self, Responder::Ignore)
    }

    fn respond(self, result: Result<T>) {
        match self {
            // A caller that stopped waiting drops its receiver; the
            // undelivered payload is dropped here, which releases any
            // slot a captured reference result owns.
            Responder::Block(tx) => {
                let _ = tx.send(result);
            }
            Responder::Defer(tx) => {
                let _ = tx.send(result);
            }
            Responder::Ignore => {}
        }
    }
}

/// Commands executed on a context's thread, one per operation.
pub(crate) enum ContextCommand {
    Capture {
        owner: ContextHandle,
        options: CaptureOptions,
        task: CaptureTask,
        responder: Responder<ReferenceHandle>,
    },
    Exec {
        task: CaptureTask,
        responder: Responder<PlainValue>,
    },
    Apply {
        owner: ContextHandle,
        reference: RemoteRef,
        receiver: Option<Transferable>,
        arguments: Vec<Transferable>,
        options: TransferOptions,
        responder: Responder<OpResult>,
    },
    GetProp {
        owner: ContextHandle,
        reference: RemoteRef,
        key: PropertyKey,
        options: TransferOptions,
        responder: Responder<OpResult>,
    },
    SetProp {
        reference: RemoteRef,
        key: PropertyKey,
        value: Transferable,
        options: TransferOptions,
        responder: Responder<bool>,
    },
    DeleteProp {
        reference: RemoteRef,
        key: PropertyKey,
        responder: Responder<bool>,
    },
    CopyValue {
        reference: RemoteRef,
        responder: Responder<PlainValue>,
    },
    Compile {
        owner: ContextHandle,
        holder: CodeHolder,
        responder: Responder<(ReferenceHandle, CodeHolder)>,
    },
    ReleaseSlot {
        slot: u32,
    },
    Dispose {
        done: std::sync::mpsc::Sender<()>,
    },
}

/// Result of a non-blocking dispatch. Completion wakes the caller's
/// executor when the target context finishes the task; there is no
/// polling loop behind this future.
pub struct Deferred<T> {
    early: Option<Error>,
    rx: Option<oneshot::Receiver<Result<T>>>,
}

impl<T> Deferred<T> {
    pub(crate) fn pending(rx: oneshot::Receiver<Result<T>>) -> Self {
        Self {
            early: None,
            rx: Some(rx),
        }
    }

    /// A deferred result that was rejected before dispatch.
    pub(crate) fn rejected(err: Error) -> Self {
        Self {
            early: Some(err),
            rx: None,
        }
    }

    /// Block the current thread until the result arrives.
    pub fn wait(self) -> Result<T> {
        futures::executor::block_on(self)
    }
}

impl<T> Future for Deferred<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(err) = this.early.take() {
            return Poll::Ready(Err(err));
        }
        match this.rx.as_mut() {
            Some(rx) => match Pin::new(rx).poll(cx) {
                Poll::Ready(Ok(result)) => {
                    this.rx = None;
                    Poll::Ready(result)
                }
                Poll::Ready(Err(_)) => {
                    this.rx = None;
                    Poll::Ready(Err(Error::ContextDisposed))
                }
                Poll::Pending => Poll::Pending,
            },
            None => Poll::Ready(Err(Error::Logic(
                "deferred result polled after completion".to_string(),
            ))),
        }
    }
}

/// Outcome of a mode-parameterized dispatch.
pub enum Dispatched<T> {
    /// Blocking mode: the result itself.
    Returned(T),
    /// Non-blocking mode: a deferred result.
    Deferred(Deferred<T>),
    /// Fire-and-forget: the task was enqueued, the outcome is discarded.
    Ignored,
}

impl<T> Dispatched<T> {
    pub fn returned(self) -> Result<T> {
        match self {
            Dispatched::Returned(value) => Ok(value),
            _ => Err(Error::Logic(
                "dispatch did not run in blocking mode".to_string(),
            )),
        }
    }

    pub fn deferred(self) -> Result<Deferred<T>> {
        match self {
            Dispatched::Deferred(deferred) => Ok(deferred),
            _ => Err(Error::Logic(
                "dispatch did not run in deferred mode".to_string(),
            )),
        }
    }
}

/// Mutable state owned by one context's thread: the slot table of live
/// values, the global object, and the pending-exception channel.
pub struct ContextState {
    id: u64,
    slots: Vec<Option<LiveValue>>,
    free_slots: Vec<u32>,
    global: ObjectRef,
    pending_exception: Option<ThrownError>,
    limits: CopyLimits,
}

impl ContextState {
    fn new(id: u64, limits: CopyLimits) -> Self {
        let global = ObjectRef::plain();
        Self {
            id,
            // Slot 0 pins the global object for the context's lifetime.
            slots: vec![Some(LiveValue::Object(global.clone()))],
            free_slots: Vec::new(),
            global,
            pending_exception: None,
            limits,
        }
    }

    pub fn context_id(&self) -> u64 {
        self.id
    }

    pub(crate) fn limits(&self) -> CopyLimits {
        self.limits
    }

    pub(crate) fn deref(&self, remote: RemoteRef) -> Result<LiveValue> {
        if remote.context_id() != self.id {
            return Err(Error::InvalidOperation(
                "reference belongs to a different context".to_string(),
            ));
        }
        match self.slots.get(remote.slot() as usize) {
            Some(Some(value)) => Ok(value.clone()),
            _ => Err(Error::ReferenceReleased),
        }
    }

    pub(crate) fn insert_slot(&mut self, value: LiveValue) -> RemoteRef {
        let slot = match self.free_slots.pop() {
            Some(slot) => {
                self.slots[slot as usize] = Some(value);
                slot
            }
            None => {
                self.slots.push(Some(value));
                (self.slots.len() - 1) as u32
            }
        };
        RemoteRef::new(self.id, slot)
    }

    pub(crate) fn release_slot(&mut self, slot: u32) {
        if slot == 0 {
            return;
        }
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            if entry.take().is_some() {
                self.free_slots.push(slot);
            }
        }
    }

    fn live_slots(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    fn clear_slots(&mut self) {
        self.slots.clear();
        self.free_slots.clear();
    }

    /// Post an exception into the context's error channel.
    pub fn post_exception(&mut self, thrown: ThrownError) {
        self.pending_exception = Some(thrown);
    }

    /// Take the pending exception, leaving the channel empty.
    pub fn take_exception(&mut self) -> Option<ThrownError> {
        self.pending_exception.take()
    }
}

/// What code running inside a context sees: scoped access to the
/// context's own state, valid only for the duration of one task.
pub struct ContextScope<'a> {
    state: &'a mut ContextState,
}

impl<'a> ContextScope<'a> {
    pub(crate) fn new(state: &'a mut ContextState) -> Self {
        Self { state }
    }

    pub fn context_id(&self) -> u64 {
        self.state.id
    }

    pub fn global(&self) -> ObjectRef {
        self.state.global.clone()
    }

    pub fn post_exception(&mut self, thrown: ThrownError) {
        self.state.post_exception(thrown);
    }

    pub fn take_exception(&mut self) -> Option<ThrownError> {
        self.state.take_exception()
    }

    pub(crate) fn state(&self) -> &ContextState {
        self.state
    }
}

/// Convert a finished task into the propagated form: a thrown exception
/// becomes an uncaught error, and an exception left posted behind a
/// successful return is a protocol violation.
fn finish_task<T>(
    state: &mut ContextState,
    outcome: std::result::Result<T, ThrownError>,
) -> Result<T> {
    match outcome {
        Err(thrown) => {
            state.take_exception();
            Err(Error::Uncaught(thrown.message().to_string()))
        }
        Ok(value) => match state.take_exception() {
            None => Ok(value),
            Some(posted) => Err(Error::Logic(format!(
                "exception posted without propagation: {posted}"
            ))),
        },
    }
}

fn log_if_logic<T>(context: u64, result: &Result<T>) {
    if let Err(Error::Logic(message)) = result {
        tracing::error!(context, %message, "aborting task after protocol violation");
    }
}

/// Executes commands against one context's state, on its thread.
pub(crate) struct ContextCore {
    state: ContextState,
    compiler: Option<Box<dyn Compiler + Send>>,
}

impl ContextCore {
    pub(crate) fn new(
        id: u64,
        compiler: Option<Box<dyn Compiler + Send>>,
        limits: CopyLimits,
    ) -> Self {
        Self {
            state: ContextState::new(id, limits),
            compiler,
        }
    }

    pub(crate) async fn run(&mut self, mut rx: mpsc::UnboundedReceiver<ContextCommand>) {
        while let Some(command) = rx.recv().await {
            if self.execute(command).is_break() {
                break;
            }
        }
        let leaked = self.state.live_slots().saturating_sub(1);
        if leaked > 0 {
            tracing::warn!(
                context = self.state.id,
                leaked,
                "context torn down with outstanding references"
            );
        }
        self.state.clear_slots();
    }

    fn execute(&mut self, command: ContextCommand) -> ControlFlow<()> {
        let context = self.state.id;
        match command {
            ContextCommand::Capture {
                owner,
                options,
                task,
                responder,
            } => {
                let outcome = task(&mut ContextScope::new(&mut self.state));
                let result = finish_task(&mut self.state, outcome).map(|value| {
                    capture_reference(&mut self.state, &owner, value, &options)
                });
                log_if_logic(context, &result);
                responder.respond(result);
            }
            ContextCommand::Exec { task, responder } => {
                let outcome = task(&mut ContextScope::new(&mut self.state));
                let result = finish_task(&mut self.state, outcome)
                    .and_then(|value| live_to_plain(&value, self.state.limits()));
                log_if_logic(context, &result);
                responder.respond(result);
            }
            ContextCommand::Apply {
                owner,
                reference,
                receiver,
                arguments,
                options,
                responder,
            } => {
                let value = self.run_apply(reference, receiver, arguments);
                if responder.is_ignore() {
                    self.discard(context, "apply", value);
                } else {
                    let result = value.and_then(|value| self.marshal_out(&owner, value, &options));
                    log_if_logic(context, &result);
                    responder.respond(result);
                }
            }
            ContextCommand::GetProp {
                owner,
                reference,
                key,
                options,
                responder,
            } => {
                let value = self.run_get(reference, &key, &options);
                if responder.is_ignore() {
                    self.discard(context, "get", value);
                } else {
                    let result = value.and_then(|value| self.marshal_out(&owner, value, &options));
                    log_if_logic(context, &result);
                    responder.respond(result);
                }
            }
            ContextCommand::SetProp {
                reference,
                key,
                value,
                options,
                responder,
            } => {
                let result = self.run_set(reference, key, value, &options);
                log_if_logic(context, &result);
                if responder.is_ignore() {
                    self.discard(context, "set", result);
                } else {
                    responder.respond(result);
                }
            }
            ContextCommand::DeleteProp {
                reference,
                key,
                responder,
            } => {
                let result = self.run_delete(reference, &key);
                if responder.is_ignore() {
                    self.discard(context, "delete", result);
                } else {
                    responder.respond(result);
                }
            }
            ContextCommand::CopyValue {
                reference,
                responder,
            } => {
                let result = self
                    .state
                    .deref(reference)
                    .and_then(|value| live_to_plain(&value, self.state.limits()));
                if responder.is_ignore() {
                    self.discard(context, "copy", result);
                } else {
                    responder.respond(result);
                }
            }
            ContextCommand::Compile {
                owner,
                mut holder,
                responder,
            } => {
                let result = self
                    .run_compile(&owner, &mut holder)
                    .map(|handle| (handle, holder));
                log_if_logic(context, &result);
                responder.respond(result);
            }
            ContextCommand::ReleaseSlot { slot } => {
                self.state.release_slot(slot);
            }
            ContextCommand::Dispose { done } => {
                let leaked = self.state.live_slots().saturating_sub(1);
                if leaked > 0 {
                    tracing::warn!(
                        context,
                        leaked,
                        "disposing context with outstanding references"
                    );
                }
                self.state.clear_slots();
                let _ = done.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn discard<T>(&self, context: u64, operation: &str, result: Result<T>) {
        if let Err(err) = result {
            tracing::debug!(context, operation, error = %err, "discarding fire-and-forget failure");
        }
    }

    fn run_apply(
        &mut self,
        reference: RemoteRef,
        receiver: Option<Transferable>,
        arguments: Vec<Transferable>,
    ) -> Result<LiveValue> {
        let callee = match self.state.deref(reference)? {
            LiveValue::Function(func) => func,
            other => {
                return Err(Error::InvalidOperation(format!(
                    "apply target is not a function: {other:?}"
                )))
            }
        };
        let receiver = receiver
            .map(|transferable| materialize(&self.state, transferable))
            .transpose()?;
        let mut live_arguments = Vec::with_capacity(arguments.len());
        for argument in arguments {
            live_arguments.push(materialize(&self.state, argument)?);
        }
        let outcome = callee.invoke(
            &mut ContextScope::new(&mut self.state),
            receiver,
            live_arguments,
        );
        finish_task(&mut self.state, outcome)
    }

    fn run_get(
        &mut self,
        reference: RemoteRef,
        key: &PropertyKey,
        options: &TransferOptions,
    ) -> Result<LiveValue> {
        match self.state.deref(reference)? {
            LiveValue::Object(object) => self.read_object_property(object, key, options),
            LiveValue::Function(func) => {
                let property = match key {
                    PropertyKey::Name(name) => func.properties().get(name).cloned(),
                    PropertyKey::Index(_) => None,
                };
                match property {
                    Some(property) => {
                        let receiver = LiveValue::Function(func);
                        Ok(self
                            .resolve_property(property, receiver, options.accessors)?
                            .unwrap_or(LiveValue::Undefined))
                    }
                    None => Ok(LiveValue::Undefined),
                }
            }
            other => Err(Error::InvalidOperation(format!(
                "property access on a non-object value: {other:?}"
            ))),
        }
    }

    fn read_object_property(
        &mut self,
        object: ObjectRef,
        key: &PropertyKey,
        options: &TransferOptions,
    ) -> Result<LiveValue> {
        if let PropertyKey::Index(index) = key {
            let data = object.borrow();
            if let ObjectKind::Array(elements) = &data.kind {
                return Ok(elements
                    .get(*index as usize)
                    .cloned()
                    .unwrap_or(LiveValue::Undefined));
            }
        }

        let name = key.to_string();
        let mut visited = HashSet::new();
        let mut current = object.clone();
        loop {
            if !visited.insert(current.identity()) {
                // Prototype cycle; stop walking.
                break;
            }
            let property = current.borrow().properties.get(&name).cloned();
            if let Some(property) = property {
                let receiver = LiveValue::Object(object.clone());
                if let Some(value) =
                    self.resolve_property(property, receiver, options.accessors)?
                {
                    return Ok(value);
                }
            }
            if !options.inherit {
                break;
            }
            let prototype = current.borrow().prototype.clone();
            match prototype {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(LiveValue::Undefined)
    }

    /// Resolve one own property. `None` means the property is treated as
    /// absent (an accessor encountered without accessor traversal
    /// enabled).
    fn resolve_property(
        &mut self,
        property: Property,
        receiver: LiveValue,
        accessors: bool,
    ) -> Result<Option<LiveValue>> {
        match property {
            Property::Value(value) => Ok(Some(value)),
            Property::Accessor { get, .. } => {
                if !accessors {
                    return Ok(None);
                }
                match get {
                    Some(getter) => {
                        let outcome = getter.invoke(
                            &mut ContextScope::new(&mut self.state),
                            Some(receiver),
                            Vec::new(),
                        );
                        finish_task(&mut self.state, outcome).map(Some)
                    }
                    None => Ok(Some(LiveValue::Undefined)),
                }
            }
        }
    }

    fn run_set(
        &mut self,
        reference: RemoteRef,
        key: PropertyKey,
        value: Transferable,
        options: &TransferOptions,
    ) -> Result<bool> {
        let value = materialize(&self.state, value)?;
        match self.state.deref(reference)? {
            LiveValue::Object(object) => {
                if let PropertyKey::Index(index) = &key {
                    let mut data = object.borrow_mut();
                    if let ObjectKind::Array(elements) = &mut data.kind {
                        let index = *index as usize;
                        if index >= elements.len() {
                            elements.resize(index + 1, LiveValue::Undefined);
                        }
                        elements[index] = value;
                        return Ok(true);
                    }
                }
                let name = key.to_string();
                let existing = object.borrow().properties.get(&name).cloned();
                match existing {
                    Some(Property::Accessor { set, .. }) => {
                        let receiver = LiveValue::Object(object);
                        self.write_through_accessor(name, set, receiver, value, options)
                    }
                    _ => {
                        object.define(name, value);
                        Ok(true)
                    }
                }
            }
            LiveValue::Function(func) => {
                let name = key.to_string();
                let existing = func.properties().get(&name).cloned();
                match existing {
                    Some(Property::Accessor { set, .. }) => {
                        let receiver = LiveValue::Function(func);
                        self.write_through_accessor(name, set, receiver, value, options)
                    }
                    _ => {
                        func.properties_mut().insert(name, Property::Value(value));
                        Ok(true)
                    }
                }
            }
            other => Err(Error::InvalidOperation(format!(
                "property access on a non-object value: {other:?}"
            ))),
        }
    }

    fn write_through_accessor(
        &mut self,
        name: String,
        setter: Option<FunctionRef>,
        receiver: LiveValue,
        value: LiveValue,
        options: &TransferOptions,
    ) -> Result<bool> {
        if !options.accessors {
            return Err(Error::InvalidOperation(format!(
                "property '{name}' is an accessor"
            )));
        }
        match setter {
            Some(setter) => {
                let outcome = setter.invoke(
                    &mut ContextScope::new(&mut self.state),
                    Some(receiver),
                    vec![value],
                );
                finish_task(&mut self.state, outcome)?;
                Ok(true)
            }
            // Accessor without a setter: the assignment has no effect.
            None => Ok(false),
        }
    }

    fn run_delete(&mut self, reference: RemoteRef, key: &PropertyKey) -> Result<bool> {
        match self.state.deref(reference)? {
            LiveValue::Object(object) => {
                if let PropertyKey::Index(index) = key {
                    let mut data = object.borrow_mut();
                    if let ObjectKind::Array(elements) = &mut data.kind {
                        let index = *index as usize;
                        if index < elements.len() {
                            elements[index] = LiveValue::Undefined;
                            return Ok(true);
                        }
                        return Ok(false);
                    }
                }
                let name = key.to_string();
                Ok(object.borrow_mut().properties.shift_remove(&name).is_some())
            }
            LiveValue::Function(func) => {
                let name = key.to_string();
                Ok(func.properties_mut().shift_remove(&name).is_some())
            }
            other => Err(Error::InvalidOperation(format!(
                "property access on a non-object value: {other:?}"
            ))),
        }
    }

    fn marshal_out(
        &mut self,
        owner: &ContextHandle,
        value: LiveValue,
        options: &TransferOptions,
    ) -> Result<OpResult> {
        match options.result {
            ResultKind::Copy => {
                live_to_plain(&value, self.state.limits()).map(OpResult::Plain)
            }
            ResultKind::Reference => {
                let capture = CaptureOptions {
                    accessors: options.accessors,
                    inherit: options.inherit,
                    name: None,
                };
                Ok(OpResult::Reference(capture_reference(
                    &mut self.state,
                    owner,
                    value,
                    &capture,
                )))
            }
        }
    }

    fn run_compile(
        &mut self,
        owner: &ContextHandle,
        holder: &mut CodeHolder,
    ) -> Result<ReferenceHandle> {
        let compiler = match self.compiler.as_mut() {
            Some(compiler) => compiler,
            None => {
                return Err(Error::InvalidOperation(
                    "context has no compiler".to_string(),
                ))
            }
        };
        let compiled = compiler.compile(holder.source());
        let unit = match compiled {
            Ok(unit) => unit,
            Err(caught) => return Err(annotate_caught(caught, holder.origin())),
        };

        holder.set_cached_data_rejected(unit.cached_data_rejected);
        if holder.should_produce_cached_data() {
            if let Some(bytes) = unit.cached_data.as_deref() {
                holder.save_cached_data(bytes);
            }
        }

        let mut body = unit.body;
        let name = holder.origin().filename().to_string();
        let function = FunctionRef::new(Some(name.clone()), false, move |scope, _receiver, args| {
            body(scope, args)
        });
        let options = CaptureOptions {
            name: Some(name),
            ..CaptureOptions::default()
        };
        Ok(capture_reference(
            &mut self.state,
            owner,
            LiveValue::Function(function),
            &options,
        ))
    }
}
