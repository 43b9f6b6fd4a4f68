//! Context ownership and dispatch.
//!
//! Each context executes on a dedicated OS thread with a single-threaded
//! Tokio runtime draining a FIFO command channel. [`ContextHandle`] is the
//! reference-counted ownership record for that thread: the context is torn
//! down when the last handle (or reference descriptor holding one) drops,
//! or earlier when [`ContextHandle::dispose`] is called explicitly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::oneshot;

use crate::runtime::config::{CaptureOptions, ContextConfig};
use crate::runtime::error::{Error, Result, ThrownError};
use crate::runtime::live::LiveValue;
use crate::runtime::reference::ReferenceHandle;
use crate::runtime::runner::{
    CaptureTask, ContextCommand, ContextCore, ContextScope, Deferred, Responder,
};
use crate::runtime::script::CodeHolder;
use crate::runtime::value::PlainValue;

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

type InitSignalChannel = (
    std::sync::mpsc::Sender<Result<()>>,
    std::sync::mpsc::Receiver<Result<()>>,
);

/// Opaque reference to a value inside exactly one context: a lookup key
/// into that context's slot table, not a pointer. Dereferencing happens
/// only while executing on the owning context's thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRef {
    context_id: u64,
    slot: u32,
}

impl RemoteRef {
    pub(crate) fn new(context_id: u64, slot: u32) -> Self {
        Self { context_id, slot }
    }

    /// Identifier of the owning context. A non-owning association, useful
    /// only for validation and diagnostics.
    pub fn context_id(&self) -> u64 {
        self.context_id
    }

    pub(crate) fn slot(&self) -> u32 {
        self.slot
    }
}

pub(crate) struct ContextInner {
    id: u64,
    name: Option<String>,
    tx: mpsc::UnboundedSender<ContextCommand>,
    disposed: AtomicBool,
    dispatched: AtomicU64,
    call_timeout: Option<Duration>,
}

/// Shared-ownership handle to a context's lifecycle.
///
/// Cloning is cheap and thread-safe; the clone count is the ownership
/// count. Every reference descriptor holds one, so a context cannot be
/// torn down while references into it are outstanding. The exception is
/// [`dispose`](Self::dispose), which invalidates them all at once.
#[derive(Clone)]
pub struct ContextHandle {
    inner: Arc<ContextInner>,
}

impl ContextHandle {
    /// Spawn a new context on its own thread. Blocks until the thread has
    /// initialized or reports a startup failure.
    pub fn spawn(config: ContextConfig) -> Result<Self> {
        config.validate()?;
        let ContextConfig {
            name,
            compiler,
            call_timeout,
            copy_limits,
        } = config;

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel::<ContextCommand>();
        let (init_tx, init_rx): InitSignalChannel = std::sync::mpsc::channel();

        let thread_name = match &name {
            Some(name) => format!("isoref-context-{name}"),
            None => format!("isoref-context-{id}"),
        };
        std::thread::Builder::new()
            .name(thread_name)
            .spawn(move || {
                let tokio_rt = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => rt,
                    Err(err) => {
                        let _ = init_tx.send(Err(Error::Config(format!(
                            "failed to build context runtime: {err}"
                        ))));
                        return;
                    }
                };

                let mut core = ContextCore::new(id, compiler, copy_limits);
                let _ = init_tx.send(Ok(()));
                tokio_rt.block_on(core.run(cmd_rx));
                tracing::debug!(context = id, "context thread exited");
            })
            .map_err(|err| Error::Config(format!("failed to spawn context thread: {err}")))?;

        match init_rx.recv() {
            Ok(Ok(())) => {
                tracing::debug!(context = id, "context spawned");
                Ok(Self {
                    inner: Arc::new(ContextInner {
                        id,
                        name,
                        tx: cmd_tx,
                        disposed: AtomicBool::new(false),
                        dispatched: AtomicU64::new(0),
                        call_timeout,
                    }),
                })
            }
            Ok(Err(err)) => Err(err),
            Err(_) => Err(Error::Config(
                "context thread failed to initialize".to_string(),
            )),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn name(&self) -> Option<&str> {
        self.inner.name.as_deref()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    /// Number of operations dispatched onto this context so far.
    /// Fail-fast rejections never move this counter.
    pub fn dispatch_count(&self) -> u64 {
        self.inner.dispatched.load(Ordering::Relaxed)
    }

    /// Tear the context down, invalidating every remote reference bound
    /// to it. Idempotent; commands already in the queue still run first.
    pub fn dispose(&self) -> Result<()> {
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        tracing::debug!(context = self.inner.id, "disposing context");
        let (done_tx, done_rx) = std::sync::mpsc::channel();
        if self.inner.tx.send(ContextCommand::Dispose { done: done_tx }).is_err() {
            // Thread already gone; nothing left to invalidate.
            return Ok(());
        }
        let _ = done_rx.recv();
        Ok(())
    }

    /// Capture a reference to the context's global object.
    pub fn global(&self) -> Result<ReferenceHandle> {
        self.capture_with(CaptureOptions::default(), |scope| {
            Ok(LiveValue::Object(scope.global()))
        })
    }

    /// Run `build` on the context's thread and capture its result into a
    /// new reference handle owned by this context.
    ///
    /// This is the entry point for putting values into a context. It
    /// blocks; calling it from the context's own thread would deadlock.
    /// Code already running inside the context works with
    /// [`ContextScope`] directly instead.
    pub fn capture_with<F>(&self, options: CaptureOptions, build: F) -> Result<ReferenceHandle>
    where
        F: FnOnce(&mut ContextScope<'_>) -> std::result::Result<LiveValue, ThrownError>
            + Send
            + 'static,
    {
        let owner = self.clone();
        self.dispatch_block(move |responder| ContextCommand::Capture {
            owner,
            options,
            task: Box::new(build) as CaptureTask,
            responder,
        })
    }

    /// Run `task` on the context's thread and return a detached copy of
    /// its result. Blocks; see [`capture_with`](Self::capture_with) for
    /// the threading caveat.
    pub fn exec_with<F>(&self, task: F) -> Result<PlainValue>
    where
        F: FnOnce(&mut ContextScope<'_>) -> std::result::Result<LiveValue, ThrownError>
            + Send
            + 'static,
    {
        self.dispatch_block(move |responder| ContextCommand::Exec {
            task: Box::new(task) as CaptureTask,
            responder,
        })
    }

    /// Compile the holder's source in this context, blocking until done.
    /// Cache bytes and rejection flags are written back into `holder`;
    /// the compiled unit is returned as a function reference.
    pub fn compile_sync(&self, holder: &mut CodeHolder) -> Result<ReferenceHandle> {
        let owner = self.clone();
        let shipped = holder.clone();
        let (handle, updated) = self.dispatch_block(move |responder| ContextCommand::Compile {
            owner,
            holder: shipped,
            responder,
        })?;
        *holder = updated;
        Ok(handle)
    }

    /// Non-blocking compile. Resolves to the function reference and the
    /// holder with cache results written back.
    pub fn compile_async(&self, holder: CodeHolder) -> Deferred<(ReferenceHandle, CodeHolder)> {
        let owner = self.clone();
        self.dispatch_defer(move |responder| ContextCommand::Compile {
            owner,
            holder,
            responder,
        })
    }

    pub(crate) fn send(&self, command: ContextCommand) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::ContextDisposed);
        }
        self.inner
            .tx
            .send(command)
            .map_err(|_| Error::ContextDisposed)?;
        self.inner.dispatched.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Bookkeeping send: no disposal gate, no dispatch accounting,
    /// delivery is best-effort.
    pub(crate) fn send_raw(&self, command: ContextCommand) {
        let _ = self.inner.tx.send(command);
    }

    pub(crate) fn dispatch_block<T, F>(&self, build: F) -> Result<T>
    where
        F: FnOnce(Responder<T>) -> ContextCommand,
    {
        let (result_tx, result_rx) = std::sync::mpsc::channel();
        self.send(build(Responder::Block(result_tx)))?;
        match self.inner.call_timeout {
            Some(timeout) => result_rx.recv_timeout(timeout).map_err(|err| match err {
                RecvTimeoutError::Timeout => Error::Timeout(timeout.as_millis() as u64),
                RecvTimeoutError::Disconnected => Error::ContextDisposed,
            })?,
            None => result_rx.recv().map_err(|_| Error::ContextDisposed)?,
        }
    }

    pub(crate) fn dispatch_defer<T, F>(&self, build: F) -> Deferred<T>
    where
        F: FnOnce(Responder<T>) -> ContextCommand,
    {
        let (result_tx, result_rx) = oneshot::channel();
        match self.send(build(Responder::Defer(result_tx))) {
            Ok(()) => Deferred::pending(result_rx),
            Err(err) => Deferred::rejected(err),
        }
    }

    pub(crate) fn dispatch_ignore<T, F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(Responder<T>) -> ContextCommand,
    {
        self.send(build(Responder::Ignore))
    }
}

impl PartialEq for ContextHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ContextHandle {}

impl std::fmt::Debug for ContextHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::config::ContextConfig;

    #[test]
    fn spawn_and_dispose_round_trip() {
        let context = ContextHandle::spawn(ContextConfig::new().with_name("lifecycle")).unwrap();
        assert!(!context.is_disposed());
        assert_eq!(context.name(), Some("lifecycle"));

        context.dispose().unwrap();
        assert!(context.is_disposed());
        // Disposal is idempotent.
        context.dispose().unwrap();
    }

    #[test]
    fn context_ids_are_unique() {
        let a = ContextHandle::spawn(ContextConfig::new()).unwrap();
        let b = ContextHandle::spawn(ContextConfig::new()).unwrap();
        assert_ne!(a.id(), b.id());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
    }

    #[test]
    fn exec_runs_on_a_named_thread() {
        let context = ContextHandle::spawn(ContextConfig::new().with_name("affinity")).unwrap();
        let result = context
            .exec_with(|_scope| {
                let name = std::thread::current()
                    .name()
                    .unwrap_or_default()
                    .to_string();
                Ok(LiveValue::String(name))
            })
            .unwrap();
        assert_eq!(
            result.as_str(),
            Some("isoref-context-affinity"),
            "tasks must run on the context's own thread"
        );
    }

    #[test]
    fn operations_fail_fast_after_dispose() {
        let context = ContextHandle::spawn(ContextConfig::new()).unwrap();
        context.dispose().unwrap();
        let err = context
            .exec_with(|_scope| Ok(LiveValue::Null))
            .unwrap_err();
        assert_eq!(err, Error::ContextDisposed);
    }

    #[test]
    fn thrown_errors_propagate_from_exec() {
        let context = ContextHandle::spawn(ContextConfig::new()).unwrap();
        let err = context
            .exec_with(|_scope| Err(ThrownError::new("boom")))
            .unwrap_err();
        assert_eq!(err, Error::Uncaught("boom".to_string()));
    }
}
