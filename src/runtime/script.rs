//! Portable carriers for source text, origin metadata, and compiled-cache
//! bytes.
//!
//! Everything here is context-independent and `Send`: options are parsed
//! once into a [`CodeHolder`], which can then be shipped to any context's
//! thread for compilation. The only context-bound piece is the transient
//! [`CompileSource`] borrow handed to the compiler, which cannot outlive
//! the compile call.

use std::sync::Arc;

use crate::runtime::error::{Caught, ThrownError};
use crate::runtime::live::LiveValue;
use crate::runtime::runner::ContextScope;

pub(crate) const DEFAULT_FILENAME: &str = "<isoref>";

/// Script origin in portable form: resource name and position offsets,
/// usable for error annotation in a different context from the one where
/// the options were parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOrigin {
    filename: String,
    line_offset: u32,
    column_offset: u32,
    is_module: bool,
}

impl ScriptOrigin {
    pub fn new(
        filename: impl Into<String>,
        line_offset: u32,
        column_offset: u32,
        is_module: bool,
    ) -> Self {
        Self {
            filename: filename.into(),
            line_offset,
            column_offset,
            is_module,
        }
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn line_offset(&self) -> u32 {
        self.line_offset
    }

    pub fn column_offset(&self) -> u32 {
        self.column_offset
    }

    pub fn is_module(&self) -> bool {
        self.is_module
    }
}

impl Default for ScriptOrigin {
    fn default() -> Self {
        Self {
            filename: DEFAULT_FILENAME.to_string(),
            line_offset: 0,
            column_offset: 0,
            is_module: false,
        }
    }
}

/// Recognized compile options. Parsed once, at holder construction.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Resource name used in error annotation and origin reporting.
    pub filename: Option<String>,
    /// Shifts reported line numbers for embedded snippets.
    pub line_offset: u32,
    /// Shifts the reported column on the first snippet line.
    pub column_offset: u32,
    /// Selects module-level compile semantics.
    pub is_module: bool,
    /// Previously produced cache buffer, supplied to skip recompilation.
    pub cached_data: Option<Vec<u8>>,
    /// Request that compilation also emit a reusable cache buffer.
    pub produce_cached_data: bool,
}

/// Transient view handed to the compiler for exactly one compile call.
///
/// This is a borrow of the holder, so teardown is guaranteed on every exit
/// path, including a compile that fails midway. It is never stored.
pub struct CompileSource<'a> {
    pub code: &'a str,
    pub origin: &'a ScriptOrigin,
    pub cached_data: Option<&'a [u8]>,
}

/// Caller-visible outcome flags of a compile call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompileOutcome {
    /// A supplied cache buffer failed validation (stale or mismatched).
    pub cached_data_rejected: bool,
    /// A reusable cache buffer was produced and stored on the holder.
    pub cached_data_produced: bool,
}

/// Portable holder for one unit of compilable code: owned source text,
/// origin, and incoming/outgoing cache buffers.
#[derive(Debug, Clone)]
pub struct CodeHolder {
    origin: ScriptOrigin,
    code: Arc<str>,
    cached_data_in: Option<Arc<[u8]>>,
    cached_data_out: Option<Arc<[u8]>>,
    cached_data_rejected: bool,
    produce_cached_data: bool,
    supplied_cached_data: bool,
}

impl CodeHolder {
    pub fn new(code: impl Into<String>, options: CompileOptions) -> Self {
        let CompileOptions {
            filename,
            line_offset,
            column_offset,
            is_module,
            cached_data,
            produce_cached_data,
        } = options;
        let origin = ScriptOrigin::new(
            filename.unwrap_or_else(|| DEFAULT_FILENAME.to_string()),
            line_offset,
            column_offset,
            is_module,
        );
        let supplied_cached_data = cached_data.is_some();
        Self {
            origin,
            code: Arc::from(code.into()),
            cached_data_in: cached_data.map(Arc::from),
            cached_data_out: None,
            cached_data_rejected: false,
            produce_cached_data,
            supplied_cached_data,
        }
    }

    pub fn origin(&self) -> &ScriptOrigin {
        &self.origin
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn did_supply_cached_data(&self) -> bool {
        self.supplied_cached_data
    }

    pub fn should_produce_cached_data(&self) -> bool {
        self.produce_cached_data
    }

    pub fn cached_data_rejected(&self) -> bool {
        self.cached_data_rejected
    }

    /// Cache bytes produced by the most recent compile, if any.
    pub fn cached_data(&self) -> Option<&[u8]> {
        self.cached_data_out.as_deref()
    }

    /// Build the transient compile source for a single compile call.
    pub fn source(&self) -> CompileSource<'_> {
        CompileSource {
            code: &self.code,
            origin: &self.origin,
            cached_data: self.cached_data_in.as_deref(),
        }
    }

    /// Copy compiler-produced cache bytes into a context-independent
    /// buffer for reuse from any context.
    pub fn save_cached_data(&mut self, bytes: &[u8]) {
        self.cached_data_out = Some(Arc::from(bytes));
    }

    pub fn set_cached_data_rejected(&mut self, rejected: bool) {
        self.cached_data_rejected = rejected;
    }

    /// Snapshot the outcome flags for reporting to callers.
    pub fn write_compile_results(&self) -> CompileOutcome {
        CompileOutcome {
            cached_data_rejected: self.cached_data_rejected,
            cached_data_produced: self.cached_data_out.is_some(),
        }
    }
}

/// Executable form of a compiled unit, runnable on the owning context's
/// thread. Not `Send`; it never leaves the thread that compiled it.
pub type CompiledBody = Box<
    dyn FnMut(&mut ContextScope<'_>, Vec<LiveValue>) -> std::result::Result<LiveValue, ThrownError>,
>;

/// What a compiler hands back on success.
pub struct CompiledUnit {
    pub body: CompiledBody,
    /// Reusable cache bytes, if production was requested and supported.
    pub cached_data: Option<Vec<u8>>,
    /// Whether a supplied cache buffer failed validation.
    pub cached_data_rejected: bool,
}

/// Compilation collaborator. One instance is moved onto each context's
/// thread at spawn and invoked there for every compile dispatched to that
/// context.
pub trait Compiler {
    fn compile(&mut self, source: CompileSource<'_>) -> std::result::Result<CompiledUnit, Caught>;
}
