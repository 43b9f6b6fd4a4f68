//! Boundary options: context configuration and per-operation marshaling
//! options, parsed once into portable form.

use std::time::Duration;

use crate::runtime::error::{Error, Result};
use crate::runtime::script::Compiler;

/// Default copy-depth budget for deep copies crossing a context boundary.
pub const DEFAULT_COPY_DEPTH: usize = 100;
/// Default copy-size budget in bytes.
pub const DEFAULT_COPY_BYTES: usize = 10 * 1024 * 1024;

/// Depth and byte budget enforced while deep-copying values out of a
/// context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyLimits {
    pub max_depth: usize,
    pub max_bytes: usize,
}

impl Default for CopyLimits {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_COPY_DEPTH,
            max_bytes: DEFAULT_COPY_BYTES,
        }
    }
}

/// Configuration for spawning a context. Validated once at spawn.
pub struct ContextConfig {
    pub(crate) name: Option<String>,
    pub(crate) compiler: Option<Box<dyn Compiler + Send>>,
    pub(crate) call_timeout: Option<Duration>,
    pub(crate) copy_limits: CopyLimits,
}

impl ContextConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Label used in thread names and diagnostics.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Compilation collaborator moved onto the context's thread. Without
    /// one, compile dispatches fail.
    pub fn with_compiler(mut self, compiler: Box<dyn Compiler + Send>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    /// Upper bound on how long a blocking call waits for its result. The
    /// dispatched task still runs to completion when the wait expires.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }

    pub fn with_copy_limits(mut self, limits: CopyLimits) -> Self {
        self.copy_limits = limits;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.copy_limits.max_depth == 0 {
            return Err(Error::Config(
                "copy depth limit must be at least 1".to_string(),
            ));
        }
        if self.copy_limits.max_bytes == 0 {
            return Err(Error::Config(
                "copy size limit must be at least 1 byte".to_string(),
            ));
        }
        if let Some(timeout) = self.call_timeout {
            if timeout.is_zero() {
                return Err(Error::Config("call timeout must be non-zero".to_string()));
            }
        }
        Ok(())
    }
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            name: None,
            compiler: None,
            call_timeout: None,
            copy_limits: CopyLimits::default(),
        }
    }
}

/// Execution mode for a dispatched operation.
///
/// The original system selected among these with a small integer
/// parameter whose exact mapping is not recoverable; the mode is an
/// explicit enumeration here instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    /// Suspend the calling thread until the target context deposits the
    /// result.
    Block,
    /// Enqueue and return a deferred result immediately; completion wakes
    /// the caller's executor, with no polling loop.
    Defer,
    /// Fire-and-forget: the outcome, including any error, is discarded.
    Ignore,
}

/// How a value-producing operation marshals its result back.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResultKind {
    /// Deep-copy into a context-independent plain value.
    #[default]
    Copy,
    /// Capture the result in its owning context and hand back a new
    /// reference to it.
    Reference,
}

/// Per-call marshaling options for `apply`/`get`/`set`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferOptions {
    pub result: ResultKind,
    /// Run accessor properties during property access for this call,
    /// even if the handle was captured without accessor traversal.
    pub accessors: bool,
    /// Walk the prototype chain on `get` for this call.
    pub inherit: bool,
}

impl TransferOptions {
    pub fn reference() -> Self {
        Self {
            result: ResultKind::Reference,
            ..Self::default()
        }
    }
}

/// Options captured when a value is first turned into a reference.
#[derive(Debug, Clone, Default)]
pub struct CaptureOptions {
    /// Enable accessor traversal on property operations through the
    /// resulting handle.
    pub accessors: bool,
    /// Enable prototype-chain traversal on `get` through the resulting
    /// handle.
    pub inherit: bool,
    /// Override the captured name; functions otherwise contribute their
    /// own.
    pub name: Option<String>,
}

/// Options for materializing a reference into the caller's context.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerefOptions {
    /// Permit cross-context materialization by deep copy. Without this,
    /// dereferencing is valid only in the owning context.
    pub copy: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(ContextConfig::default().validate().is_ok());
    }

    #[test]
    fn zero_copy_budget_is_rejected() {
        let config = ContextConfig::new().with_copy_limits(CopyLimits {
            max_depth: 0,
            max_bytes: 1,
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let config = ContextConfig::new().with_copy_limits(CopyLimits {
            max_depth: 1,
            max_bytes: 0,
        });
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let config = ContextConfig::new().with_call_timeout(Duration::ZERO);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
