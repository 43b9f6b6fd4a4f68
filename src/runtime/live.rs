//! Context-local values.
//!
//! Everything in this module is `Rc`-based and deliberately not `Send`:
//! a live value belongs to exactly one context and is only ever touched
//! from that context's thread. Thread affinity is a compile-time property
//! here, not a locking discipline.

use std::cell::RefCell;
use std::rc::Rc;

use indexmap::IndexMap;

use crate::runtime::error::ThrownError;
use crate::runtime::runner::ContextScope;

/// Signature of a native function living inside a context. The receiver
/// is `None` when the call site supplied no `this` binding.
pub type NativeFn = Box<
    dyn FnMut(
        &mut ContextScope<'_>,
        Option<LiveValue>,
        Vec<LiveValue>,
    ) -> std::result::Result<LiveValue, ThrownError>,
>;

/// A value inside a context. The variant set is closed and mirrors the
/// capture-time classification exactly.
#[derive(Clone)]
pub enum LiveValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Object(ObjectRef),
    Function(FunctionRef),
}

impl LiveValue {
    pub fn is_undefined(&self) -> bool {
        matches!(self, LiveValue::Undefined)
    }
}

impl std::fmt::Debug for LiveValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LiveValue::Undefined => f.write_str("undefined"),
            LiveValue::Null => f.write_str("null"),
            LiveValue::Bool(b) => write!(f, "{b}"),
            LiveValue::Number(n) => write!(f, "{n}"),
            LiveValue::String(s) => write!(f, "{s:?}"),
            LiveValue::Object(obj) => write!(f, "[object @{:x}]", obj.identity()),
            LiveValue::Function(func) => {
                write!(f, "[function {}]", func.name().unwrap_or("<anonymous>"))
            }
        }
    }
}

/// Observed lifecycle stage of a promise-like object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending,
    Fulfilled,
    Rejected,
}

/// What an object is, beyond its property map.
#[derive(Clone)]
pub enum ObjectKind {
    Plain,
    /// Ordered elements; index keys address these.
    Array(Vec<LiveValue>),
    /// Promise-like object carrying its current settlement state.
    Promise(PromiseState),
}

/// An own property: either a data property or an accessor pair.
#[derive(Clone)]
pub enum Property {
    Value(LiveValue),
    Accessor {
        get: Option<FunctionRef>,
        set: Option<FunctionRef>,
    },
}

pub struct ObjectData {
    pub kind: ObjectKind,
    pub properties: IndexMap<String, Property>,
    pub prototype: Option<ObjectRef>,
}

/// Shared handle to an object within its context.
#[derive(Clone)]
pub struct ObjectRef(Rc<RefCell<ObjectData>>);

impl ObjectRef {
    pub fn plain() -> Self {
        Self::with_kind(ObjectKind::Plain)
    }

    pub fn array(elements: Vec<LiveValue>) -> Self {
        Self::with_kind(ObjectKind::Array(elements))
    }

    pub fn promise(state: PromiseState) -> Self {
        Self::with_kind(ObjectKind::Promise(state))
    }

    fn with_kind(kind: ObjectKind) -> Self {
        Self(Rc::new(RefCell::new(ObjectData {
            kind,
            properties: IndexMap::new(),
            prototype: None,
        })))
    }

    pub fn borrow(&self) -> std::cell::Ref<'_, ObjectData> {
        self.0.borrow()
    }

    pub fn borrow_mut(&self) -> std::cell::RefMut<'_, ObjectData> {
        self.0.borrow_mut()
    }

    /// Stable identity for cycle detection within one context.
    pub fn identity(&self) -> usize {
        Rc::as_ptr(&self.0) as usize
    }

    pub fn set_prototype(&self, prototype: Option<ObjectRef>) {
        self.0.borrow_mut().prototype = prototype;
    }

    /// Define a data property.
    pub fn define(&self, key: impl Into<String>, value: LiveValue) {
        self.0
            .borrow_mut()
            .properties
            .insert(key.into(), Property::Value(value));
    }

    /// Define an accessor property.
    pub fn define_accessor(
        &self,
        key: impl Into<String>,
        get: Option<FunctionRef>,
        set: Option<FunctionRef>,
    ) {
        self.0
            .borrow_mut()
            .properties
            .insert(key.into(), Property::Accessor { get, set });
    }

    pub fn is_array(&self) -> bool {
        matches!(self.0.borrow().kind, ObjectKind::Array(_))
    }

    pub fn is_promise(&self) -> bool {
        matches!(self.0.borrow().kind, ObjectKind::Promise(_))
    }

    pub fn promise_state(&self) -> Option<PromiseState> {
        match self.0.borrow().kind {
            ObjectKind::Promise(state) => Some(state),
            _ => None,
        }
    }

    /// Settle a promise-like object. No-op on other kinds.
    pub fn settle(&self, state: PromiseState) {
        if let ObjectKind::Promise(ref mut current) = self.0.borrow_mut().kind {
            *current = state;
        }
    }
}

pub struct FunctionData {
    name: Option<String>,
    is_async: bool,
    call: RefCell<NativeFn>,
    properties: RefCell<IndexMap<String, Property>>,
}

/// Shared handle to a function within its context.
#[derive(Clone)]
pub struct FunctionRef(Rc<FunctionData>);

impl FunctionRef {
    pub fn new<F>(name: Option<String>, is_async: bool, call: F) -> Self
    where
        F: FnMut(
                &mut ContextScope<'_>,
                Option<LiveValue>,
                Vec<LiveValue>,
            ) -> std::result::Result<LiveValue, ThrownError>
            + 'static,
    {
        Self(Rc::new(FunctionData {
            name,
            is_async,
            call: RefCell::new(Box::new(call)),
            properties: RefCell::new(IndexMap::new()),
        }))
    }

    pub fn name(&self) -> Option<&str> {
        self.0.name.as_deref()
    }

    pub fn is_async(&self) -> bool {
        self.0.is_async
    }

    /// Invoke the function on its own context's thread. Re-entrant
    /// invocation of the same function value is refused.
    pub fn invoke(
        &self,
        scope: &mut ContextScope<'_>,
        receiver: Option<LiveValue>,
        arguments: Vec<LiveValue>,
    ) -> std::result::Result<LiveValue, ThrownError> {
        let mut call = self
            .0
            .call
            .try_borrow_mut()
            .map_err(|_| ThrownError::new("function re-entered while executing"))?;
        (call)(scope, receiver, arguments)
    }

    pub fn properties(&self) -> std::cell::Ref<'_, IndexMap<String, Property>> {
        self.0.properties.borrow()
    }

    pub fn properties_mut(&self) -> std::cell::RefMut<'_, IndexMap<String, Property>> {
        self.0.properties.borrow_mut()
    }
}

/// Property key in marshaled form: names address the property map,
/// indexes address array elements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyKey {
    Name(String),
    Index(u32),
}

impl From<&str> for PropertyKey {
    fn from(name: &str) -> Self {
        PropertyKey::Name(name.to_string())
    }
}

impl From<String> for PropertyKey {
    fn from(name: String) -> Self {
        PropertyKey::Name(name)
    }
}

impl From<u32> for PropertyKey {
    fn from(index: u32) -> Self {
        PropertyKey::Index(index)
    }
}

impl std::fmt::Display for PropertyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyKey::Name(name) => f.write_str(name),
            PropertyKey::Index(index) => write!(f, "{index}"),
        }
    }
}
