//! Cross-context references and dispatch for thread-isolated value spaces.
//!
//! `isoref` lets values owned by one single-threaded context be observed,
//! invoked, copied, and mutated from anywhere else in the process. Each
//! context runs on its own dedicated thread; a captured value becomes a
//! [`ReferenceHandle`] whose operations are dispatched onto the owning
//! thread in FIFO order, blocking or deferred, and fail deterministically
//! once the handle is released or the context disposed.
//!
//! ```no_run
//! use isoref::{CaptureOptions, ContextConfig, ContextHandle, LiveValue, TransferOptions};
//!
//! # fn main() -> isoref::Result<()> {
//! let context = ContextHandle::spawn(ContextConfig::new().with_name("worker"))?;
//! let greeting = context.capture_with(CaptureOptions::default(), |_scope| {
//!     Ok(LiveValue::String("hello".to_string()))
//! })?;
//! let copied = greeting.copy_sync()?;
//! assert_eq!(copied.as_str(), Some("hello"));
//! # Ok(())
//! # }
//! ```

pub mod runtime;

pub use runtime::{
    annotate_caught, CaptureOptions, Caught, CodeHolder, CompileOptions, CompileOutcome,
    CompileSource, CompiledBody, CompiledUnit, Compiler, ContextConfig, ContextHandle,
    ContextScope, CopyLimits, Deferred, DerefOptions, Dispatched, Error, ExecMode, FunctionRef,
    LiveValue, ObjectRef, OpResult, PlainValue, PromiseState, Property, PropertyKey,
    ReferenceEnvelope, ReferenceHandle, RemoteRef, Result, ResultKind, ScriptOrigin, ThrownError,
    Transferable, TransferOptions, TypeOf,
};
