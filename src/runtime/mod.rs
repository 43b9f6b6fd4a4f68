//! Cross-context reference and dispatch runtime.
//!
//! Each context owns a single-threaded value space on a dedicated OS
//! thread. A value captured in its own context becomes a disposal-aware
//! [`ReferenceHandle`] that can be transferred to other contexts and
//! operated on from any thread; every operation is dispatched onto the
//! owning context's thread in FIFO order, in blocking, deferred, or
//! fire-and-forget mode.

pub mod config;
pub mod context;
pub mod error;
pub mod live;
pub mod marshal;
pub mod reference;
pub mod runner;
pub mod script;
pub mod value;

pub use config::{
    CaptureOptions, ContextConfig, CopyLimits, DerefOptions, ExecMode, ResultKind, TransferOptions,
};
pub use context::{ContextHandle, RemoteRef};
pub use error::{annotate_caught, Caught, Error, Result, ThrownError};
pub use live::{
    FunctionRef, LiveValue, NativeFn, ObjectData, ObjectKind, ObjectRef, PromiseState, Property,
    PropertyKey,
};
pub use marshal::{OpResult, Transferable};
pub use reference::{ReferenceData, ReferenceEnvelope, ReferenceHandle, TypeOf};
pub use runner::{ContextScope, ContextState, Deferred, Dispatched};
pub use script::{
    CodeHolder, CompileOptions, CompileOutcome, CompileSource, CompiledBody, CompiledUnit,
    Compiler, ScriptOrigin,
};
pub use value::{LimitTracker, PlainValue};

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn spawn() -> ContextHandle {
        ContextHandle::spawn(ContextConfig::new()).unwrap()
    }

    /// Capture a function that bumps a counter on the context's global
    /// and returns the value the counter had before the call.
    fn capture_ticker(context: &ContextHandle) -> ReferenceHandle {
        context
            .capture_with(CaptureOptions::default(), |scope| {
                let global = scope.global();
                global.define("count", LiveValue::Number(0.0));
                Ok(LiveValue::Function(FunctionRef::new(
                    Some("tick".to_string()),
                    false,
                    |scope, _receiver, _arguments| {
                        let global = scope.global();
                        let current = match global.borrow().properties.get("count") {
                            Some(Property::Value(LiveValue::Number(n))) => *n,
                            _ => 0.0,
                        };
                        global.define("count", LiveValue::Number(current + 1.0));
                        Ok(LiveValue::Number(current))
                    },
                )))
            })
            .unwrap()
    }

    fn plain_int(result: OpResult) -> i64 {
        match result.into_plain().unwrap() {
            PlainValue::Int(value) => value,
            other => panic!("expected an integer, got {other:?}"),
        }
    }

    // --- Disposal protocol ---

    #[test]
    fn released_handle_rejects_every_operation() {
        let context = spawn();
        let numbers = context
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Object(ObjectRef::array(vec![
                    LiveValue::Number(1.0),
                ])))
            })
            .unwrap();

        numbers.release();
        // Repeated release is a no-op, not a crash.
        numbers.release();
        assert!(numbers.is_released());

        assert_eq!(numbers.copy_sync().unwrap_err(), Error::ReferenceReleased);
        assert_eq!(
            numbers
                .get_sync(0u32, TransferOptions::default())
                .unwrap_err(),
            Error::ReferenceReleased
        );
        assert_eq!(numbers.delete_sync("x").unwrap_err(), Error::ReferenceReleased);
        assert_eq!(numbers.type_of().unwrap_err(), Error::ReferenceReleased);
        assert_eq!(numbers.is_array().unwrap_err(), Error::ReferenceReleased);
        assert_eq!(numbers.transfer_out().unwrap_err(), Error::ReferenceReleased);
        // Non-blocking mode delivers the same failure as a rejection.
        assert_eq!(
            numbers.copy_async().wait().unwrap_err(),
            Error::ReferenceReleased
        );
    }

    #[test]
    fn disposing_the_context_invalidates_its_references() {
        let context = spawn();
        let ticker = capture_ticker(&context);
        let global = context.global().unwrap();

        context.dispose().unwrap();

        assert_eq!(
            ticker
                .apply_sync(None, Vec::new(), TransferOptions::default())
                .unwrap_err(),
            Error::ContextDisposed
        );
        assert_eq!(global.copy_sync().unwrap_err(), Error::ContextDisposed);
        // The frozen descriptor still answers; only dereferencing is gone.
        assert_eq!(ticker.type_of().unwrap(), TypeOf::Function);
    }

    // --- Fail fast before dispatch ---

    #[test]
    fn apply_on_a_non_function_never_dispatches() {
        let context = spawn();
        let number = context
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Number(7.0))
            })
            .unwrap();

        let dispatched_before = context.dispatch_count();
        let err = number
            .apply_sync(None, Vec::new(), TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(context.dispatch_count(), dispatched_before);

        // Property access on a scalar fails fast the same way.
        let err = number
            .get_sync("x", TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(context.dispatch_count(), dispatched_before);
    }

    #[test]
    fn copy_of_a_function_or_promise_never_dispatches() {
        let context = spawn();
        let ticker = capture_ticker(&context);
        let promise = context
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Object(ObjectRef::promise(PromiseState::Pending)))
            })
            .unwrap();

        let dispatched_before = context.dispatch_count();
        assert!(matches!(
            ticker.copy_sync().unwrap_err(),
            Error::InvalidOperation(_)
        ));
        assert!(matches!(
            promise.copy_sync().unwrap_err(),
            Error::InvalidOperation(_)
        ));
        assert_eq!(context.dispatch_count(), dispatched_before);
    }

    // --- Capture-time snapshot staleness ---

    #[test]
    fn descriptor_flags_are_frozen_at_capture_time() {
        let context = spawn();
        let promise = context
            .capture_with(CaptureOptions::default(), |scope| {
                let promise = ObjectRef::promise(PromiseState::Pending);
                scope
                    .global()
                    .define("pending", LiveValue::Object(promise.clone()));
                Ok(LiveValue::Object(promise))
            })
            .unwrap();

        assert_eq!(promise.type_of().unwrap(), TypeOf::Object);
        assert!(promise.is_promise().unwrap());
        assert_eq!(
            promise.promise_state().unwrap(),
            Some(PromiseState::Pending)
        );

        // Settle the live promise behind the captured descriptor.
        context
            .exec_with(|scope| {
                let global = scope.global();
                let live = match global.borrow().properties.get("pending") {
                    Some(Property::Value(LiveValue::Object(p))) => p.clone(),
                    _ => return Err(ThrownError::new("promise is missing")),
                };
                live.settle(PromiseState::Fulfilled);
                Ok(LiveValue::Undefined)
            })
            .unwrap();

        // The snapshot does not move.
        assert_eq!(
            promise.promise_state().unwrap(),
            Some(PromiseState::Pending)
        );
        assert!(promise.is_promise().unwrap());
    }

    #[test]
    fn array_growth_does_not_touch_the_captured_flags() {
        let context = spawn();
        let list = context
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Object(ObjectRef::array(vec![
                    LiveValue::Number(1.0),
                ])))
            })
            .unwrap();
        assert!(list.is_array().unwrap());

        assert!(list
            .set_sync(9u32, PlainValue::Int(10).into(), TransferOptions::default())
            .unwrap());
        assert!(list.is_array().unwrap());
        assert_eq!(list.type_of().unwrap(), TypeOf::Object);

        match list.copy_sync().unwrap() {
            PlainValue::Array(items) => assert_eq!(items.len(), 10),
            other => panic!("expected array copy, got {other:?}"),
        }
    }

    // --- FIFO dispatch ---

    #[test]
    fn concurrent_applies_execute_in_strict_serial_order() {
        let context = spawn();
        let ticker = Arc::new(capture_ticker(&context));
        let observed = Arc::new(Mutex::new(Vec::new()));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let ticker = Arc::clone(&ticker);
            let observed = Arc::clone(&observed);
            workers.push(std::thread::spawn(move || {
                for _ in 0..25 {
                    let result = ticker
                        .apply_sync(None, Vec::new(), TransferOptions::default())
                        .unwrap();
                    observed.lock().unwrap().push(plain_int(result));
                }
            }));
        }
        for worker in workers {
            worker.join().unwrap();
        }

        // Serial read-modify-write: every pre-increment value is distinct
        // and the full range is covered.
        let mut values = observed.lock().unwrap().clone();
        values.sort_unstable();
        assert_eq!(values, (0..100).collect::<Vec<i64>>());
    }

    #[test]
    fn submission_order_is_execution_order_for_one_caller() {
        let context = spawn();
        let ticker = capture_ticker(&context);

        let deferred: Vec<_> = (0..10)
            .map(|_| ticker.apply_async(None, Vec::new(), TransferOptions::default()))
            .collect();
        for (expected, result) in deferred.into_iter().enumerate() {
            assert_eq!(plain_int(result.wait().unwrap()), expected as i64);
        }
    }

    // --- Property operations ---

    #[test]
    fn global_properties_round_trip_through_get_and_set() {
        let context = spawn();
        let global = context.global().unwrap();

        assert!(global
            .set_sync("answer", PlainValue::Int(42).into(), TransferOptions::default())
            .unwrap());
        let read = global
            .get_sync("answer", TransferOptions::default())
            .unwrap();
        assert_eq!(plain_int(read), 42);

        assert!(global.delete_sync("answer").unwrap());
        assert!(!global.delete_sync("answer").unwrap());
        let gone = global
            .get_sync("answer", TransferOptions::default())
            .unwrap();
        assert_eq!(gone.into_plain().unwrap(), PlainValue::Undefined);
    }

    #[test]
    fn accessor_properties_require_accessor_traversal() {
        let context = spawn();
        let object = context
            .capture_with(CaptureOptions::default(), |_scope| {
                let object = ObjectRef::plain();
                object.define_accessor(
                    "paced",
                    Some(FunctionRef::new(None, false, |_scope, _receiver, _args| {
                        Ok(LiveValue::Number(5.0))
                    })),
                    None,
                );
                Ok(LiveValue::Object(object))
            })
            .unwrap();

        // Without the flag the accessor reads as absent.
        let silent = object
            .get_sync("paced", TransferOptions::default())
            .unwrap();
        assert_eq!(silent.into_plain().unwrap(), PlainValue::Undefined);

        let options = TransferOptions {
            accessors: true,
            ..TransferOptions::default()
        };
        assert_eq!(plain_int(object.get_sync("paced", options).unwrap()), 5);

        // Writing through an accessor without the flag is refused.
        let err = object
            .set_sync("paced", PlainValue::Int(1).into(), TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn prototype_chain_is_walked_only_with_inherit() {
        let context = spawn();
        let child = context
            .capture_with(
                CaptureOptions {
                    inherit: true,
                    ..CaptureOptions::default()
                },
                |_scope| {
                    let parent = ObjectRef::plain();
                    parent.define("inherited", LiveValue::Number(11.0));
                    let child = ObjectRef::plain();
                    child.set_prototype(Some(parent));
                    Ok(LiveValue::Object(child))
                },
            )
            .unwrap();

        // Captured with inherit, so the default call sees the chain.
        assert_eq!(
            plain_int(child.get_sync("inherited", TransferOptions::default()).unwrap()),
            11
        );

        let flat = context
            .capture_with(CaptureOptions::default(), |_scope| {
                let parent = ObjectRef::plain();
                parent.define("inherited", LiveValue::Number(11.0));
                let child = ObjectRef::plain();
                child.set_prototype(Some(parent));
                Ok(LiveValue::Object(child))
            })
            .unwrap();
        assert_eq!(
            flat.get_sync("inherited", TransferOptions::default())
                .unwrap()
                .into_plain()
                .unwrap(),
            PlainValue::Undefined
        );
        let options = TransferOptions {
            inherit: true,
            ..TransferOptions::default()
        };
        assert_eq!(plain_int(flat.get_sync("inherited", options).unwrap()), 11);
    }

    #[test]
    fn apply_sees_receiver_and_arguments() {
        let context = spawn();
        let adder = context
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Function(FunctionRef::new(
                    Some("add".to_string()),
                    false,
                    |_scope, receiver, arguments| {
                        let base = match receiver {
                            Some(LiveValue::Object(object)) => {
                                match object.borrow().properties.get("base") {
                                    Some(Property::Value(LiveValue::Number(n))) => *n,
                                    _ => 0.0,
                                }
                            }
                            _ => 0.0,
                        };
                        let total: f64 = arguments
                            .iter()
                            .map(|argument| match argument {
                                LiveValue::Number(n) => *n,
                                _ => 0.0,
                            })
                            .sum();
                        Ok(LiveValue::Number(base + total))
                    },
                )))
            })
            .unwrap();
        let receiver = context
            .capture_with(CaptureOptions::default(), |_scope| {
                let object = ObjectRef::plain();
                object.define("base", LiveValue::Number(100.0));
                Ok(LiveValue::Object(object))
            })
            .unwrap();

        let result = adder
            .apply_sync(
                Some(Transferable::reference(&receiver).unwrap()),
                vec![PlainValue::Int(2).into(), PlainValue::Int(3).into()],
                TransferOptions::default(),
            )
            .unwrap();
        assert_eq!(plain_int(result), 105);
    }

    #[test]
    fn reference_results_point_back_into_the_owning_context() {
        let context = spawn();
        let maker = context
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Function(FunctionRef::new(
                    Some("make".to_string()),
                    false,
                    |_scope, _receiver, _arguments| {
                        let object = ObjectRef::plain();
                        object.define("kind", LiveValue::String("made".to_string()));
                        Ok(LiveValue::Object(object))
                    },
                )))
            })
            .unwrap();

        let made = maker
            .apply_sync(None, Vec::new(), TransferOptions::reference())
            .unwrap()
            .into_reference()
            .unwrap();
        assert_eq!(made.type_of().unwrap(), TypeOf::Object);
        assert_eq!(made.owner().id(), context.id());

        let kind = made.get_sync("kind", TransferOptions::default()).unwrap();
        assert_eq!(
            kind.into_plain().unwrap(),
            PlainValue::String("made".to_string())
        );
    }

    #[test]
    fn fire_and_forget_runs_but_discards_the_outcome() {
        let context = spawn();
        let ticker = capture_ticker(&context);

        ticker.apply_ignored(None, Vec::new()).unwrap();
        ticker.apply_ignored(None, Vec::new()).unwrap();
        // FIFO: this blocking read runs after both ignored applies.
        let count = context
            .exec_with(|scope| {
                match scope.global().borrow().properties.get("count") {
                    Some(Property::Value(value)) => Ok(value.clone()),
                    _ => Ok(LiveValue::Undefined),
                }
            })
            .unwrap();
        assert_eq!(count, PlainValue::Int(2));

        // Local fail-fast stays observable even in ignore mode.
        ticker.release();
        assert_eq!(
            ticker.apply_ignored(None, Vec::new()).unwrap_err(),
            Error::ReferenceReleased
        );
    }

    // --- Cross-context transfer ---

    #[test]
    fn envelope_round_trip_preserves_classification_and_flags() {
        let context = spawn();
        let list = context
            .capture_with(
                CaptureOptions {
                    accessors: true,
                    inherit: true,
                    name: Some("list".to_string()),
                },
                |_scope| {
                    Ok(LiveValue::Object(ObjectRef::array(vec![
                        LiveValue::Number(1.0),
                        LiveValue::Number(2.0),
                    ])))
                },
            )
            .unwrap();

        let envelope = list.transfer_out().unwrap();
        // Hand the envelope to another thread and rebuild the handle there.
        let rebuilt = std::thread::spawn(move || envelope.materialize())
            .join()
            .unwrap();

        assert_eq!(rebuilt.type_of().unwrap(), TypeOf::Object);
        assert!(rebuilt.is_array().unwrap());
        assert!(!rebuilt.is_promise().unwrap());
        assert!(!rebuilt.is_async().unwrap());
        assert_eq!(rebuilt.name().unwrap().as_deref(), Some("list"));
        assert_eq!(
            rebuilt.transfer_out().unwrap(),
            list.transfer_out().unwrap()
        );

        // Both handles address the same live value.
        assert!(list
            .set_sync(0u32, PlainValue::Int(9).into(), TransferOptions::default())
            .unwrap());
        assert_eq!(
            plain_int(rebuilt.get_sync(0u32, TransferOptions::default()).unwrap()),
            9
        );

        // Disposal stays per-handle.
        list.release();
        assert!(rebuilt.is_array().unwrap());
    }

    #[test]
    fn references_do_not_cross_into_foreign_contexts_as_arguments() {
        let context_a = spawn();
        let context_b = spawn();
        let foreign = context_a.global().unwrap();
        let echo = context_b
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Function(FunctionRef::new(
                    Some("echo".to_string()),
                    false,
                    |_scope, _receiver, mut arguments| {
                        Ok(arguments.pop().unwrap_or(LiveValue::Undefined))
                    },
                )))
            })
            .unwrap();

        let err = echo
            .apply_sync(
                None,
                vec![Transferable::reference(&foreign).unwrap()],
                TransferOptions::default(),
            )
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn deref_materializes_only_in_the_owning_context() {
        let owner = spawn();
        let other = spawn();
        let list = owner
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Object(ObjectRef::array(vec![
                    LiveValue::Number(2.0),
                    LiveValue::Number(3.0),
                ])))
            })
            .unwrap();

        // Same context: the live value is reachable directly.
        let envelope = list.transfer_out().unwrap();
        let summed = owner
            .exec_with(move |scope| {
                let handle = envelope.materialize();
                let live = handle
                    .deref_in(scope)
                    .map_err(|err| ThrownError::new(err.to_string()))?;
                let total = match live {
                    LiveValue::Object(object) => match &object.borrow().kind {
                        ObjectKind::Array(elements) => elements
                            .iter()
                            .map(|element| match element {
                                LiveValue::Number(n) => *n,
                                _ => 0.0,
                            })
                            .sum::<f64>(),
                        _ => return Err(ThrownError::new("not an array")),
                    },
                    _ => return Err(ThrownError::new("not an object")),
                };
                Ok(LiveValue::Number(total))
            })
            .unwrap();
        assert_eq!(summed, PlainValue::Int(5));

        // Foreign context: refused without the copy policy, deep-copied
        // with it.
        let envelope = list.transfer_out().unwrap();
        let copied = other
            .exec_with(move |scope| {
                let handle = envelope.materialize();
                match handle.deref_in(scope) {
                    Err(Error::InvalidOperation(_)) => {}
                    other => {
                        return Err(ThrownError::new(format!(
                            "expected refusal, got {other:?}"
                        )))
                    }
                }
                match handle.deref_into(scope, DerefOptions::default()) {
                    Err(Error::InvalidOperation(_)) => {}
                    other => {
                        return Err(ThrownError::new(format!(
                            "expected refusal, got {other:?}"
                        )))
                    }
                }
                handle
                    .deref_into(scope, DerefOptions { copy: true })
                    .map_err(|err| ThrownError::new(err.to_string()))
            })
            .unwrap();
        assert_eq!(
            copied,
            PlainValue::Array(vec![PlainValue::Int(2), PlainValue::Int(3)])
        );
    }

    // --- Annotated-error protocol ---

    #[test]
    fn posting_without_propagating_is_a_logic_defect() {
        let context = spawn();
        let rogue = context
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Function(FunctionRef::new(
                    Some("rogue".to_string()),
                    false,
                    |scope, _receiver, _arguments| {
                        scope.post_exception(ThrownError::new("left behind"));
                        Ok(LiveValue::Undefined)
                    },
                )))
            })
            .unwrap();

        let err = rogue
            .apply_sync(None, Vec::new(), TransferOptions::default())
            .unwrap_err();
        assert!(matches!(err, Error::Logic(_)));

        // The channel is drained; the context stays usable.
        let ticker = capture_ticker(&context);
        assert_eq!(
            plain_int(
                ticker
                    .apply_sync(None, Vec::new(), TransferOptions::default())
                    .unwrap()
            ),
            0
        );
    }

    // --- Blocking-call timeout ---

    #[test]
    fn blocking_calls_time_out_while_the_task_still_completes() {
        let context = ContextHandle::spawn(
            ContextConfig::new().with_call_timeout(Duration::from_millis(50)),
        )
        .unwrap();
        let slow = context
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Function(FunctionRef::new(
                    Some("slow".to_string()),
                    false,
                    |scope, _receiver, _arguments| {
                        std::thread::sleep(Duration::from_millis(150));
                        scope.global().define("ran", LiveValue::Bool(true));
                        Ok(LiveValue::Undefined)
                    },
                )))
            })
            .unwrap();

        let err = slow
            .apply_sync(None, Vec::new(), TransferOptions::default())
            .unwrap_err();
        assert_eq!(err, Error::Timeout(50));

        // The abandoned task ran to completion anyway.
        std::thread::sleep(Duration::from_millis(250));
        let ran = context
            .exec_with(|scope| {
                match scope.global().borrow().properties.get("ran") {
                    Some(Property::Value(value)) => Ok(value.clone()),
                    _ => Ok(LiveValue::Bool(false)),
                }
            })
            .unwrap();
        assert_eq!(ran, PlainValue::Bool(true));
    }

    // --- Compilation through portable holders ---

    /// Minimal compiler collaborator: flags a closing brace that directly
    /// follows a binary operator, validates cache bytes by equality, and
    /// compiles everything else to a function returning the source length.
    struct TinyCompiler;

    impl TinyCompiler {
        fn cache_bytes(code: &str) -> Vec<u8> {
            let mut bytes = b"tinycache:".to_vec();
            bytes.extend_from_slice(code.as_bytes());
            bytes
        }

        /// 1-based line and 0-based column of the offending brace.
        fn syntax_error(code: &str) -> Option<(u32, u32)> {
            let bytes = code.as_bytes();
            for (index, &byte) in bytes.iter().enumerate() {
                if byte != b'}' {
                    continue;
                }
                let mut prev = index;
                while prev > 0 {
                    prev -= 1;
                    match bytes[prev] {
                        b' ' | b'\t' | b'\n' => continue,
                        b'+' | b'-' | b'*' | b'/' => {
                            let line = code[..index].matches('\n').count() as u32 + 1;
                            let column = match code[..index].rfind('\n') {
                                Some(newline) => (index - newline - 1) as u32,
                                None => index as u32,
                            };
                            return Some((line, column));
                        }
                        _ => break,
                    }
                }
            }
            None
        }
    }

    impl Compiler for TinyCompiler {
        fn compile(
            &mut self,
            source: CompileSource<'_>,
        ) -> std::result::Result<CompiledUnit, Caught> {
            if let Some((line, column)) = Self::syntax_error(source.code) {
                return Err(Caught::message("unexpected token '}'", line, column));
            }
            let expected = Self::cache_bytes(source.code);
            let cached_data_rejected = match source.cached_data {
                Some(bytes) => bytes != expected.as_slice(),
                None => false,
            };
            let length = source.code.len() as f64;
            Ok(CompiledUnit {
                body: Box::new(move |_scope, _arguments| Ok(LiveValue::Number(length))),
                cached_data: Some(expected),
                cached_data_rejected,
            })
        }
    }

    fn spawn_compiling() -> ContextHandle {
        ContextHandle::spawn(ContextConfig::new().with_compiler(Box::new(TinyCompiler))).unwrap()
    }

    #[test]
    fn compile_errors_carry_the_annotated_location() {
        let context = spawn_compiling();
        let mut holder = CodeHolder::new(
            "function(){ return 1 + }",
            CompileOptions {
                filename: Some("test.js".to_string()),
                ..CompileOptions::default()
            },
        );

        let err = context.compile_sync(&mut holder).unwrap_err();
        match err {
            Error::Compile(message) => {
                // The brace sits at line 1, 0-based column 23; reported
                // 1-based as column 24.
                assert!(message.ends_with("test.js:1:24"), "got: {message}");
                assert!(message.contains("unexpected token '}'"));
            }
            other => panic!("expected a compile error, got {other:?}"),
        }
    }

    #[test]
    fn compile_errors_respect_origin_offsets() {
        let context = spawn_compiling();
        let mut holder = CodeHolder::new(
            "1 + }",
            CompileOptions {
                filename: Some("snippet.js".to_string()),
                line_offset: 7,
                column_offset: 2,
                ..CompileOptions::default()
            },
        );
        let err = context.compile_sync(&mut holder).unwrap_err();
        match err {
            // Brace at 0-based column 4, shifted by the column offset on
            // line 1, then reported 1-based.
            Error::Compile(message) => {
                assert!(message.ends_with("snippet.js:8:7"), "got: {message}")
            }
            other => panic!("expected a compile error, got {other:?}"),
        }
    }

    #[test]
    fn produced_cache_feeds_a_second_identical_compile() {
        let context = spawn_compiling();
        let source = "function add(a, b) { return a; }";

        let mut first = CodeHolder::new(
            source,
            CompileOptions {
                filename: Some("cached.js".to_string()),
                produce_cached_data: true,
                ..CompileOptions::default()
            },
        );
        let compiled_first = context.compile_sync(&mut first).unwrap();
        let outcome = first.write_compile_results();
        assert!(outcome.cached_data_produced);
        assert!(!outcome.cached_data_rejected);
        let cache = first.cached_data().unwrap().to_vec();

        let mut second = CodeHolder::new(
            source,
            CompileOptions {
                filename: Some("cached.js".to_string()),
                cached_data: Some(cache),
                ..CompileOptions::default()
            },
        );
        let compiled_second = context.compile_sync(&mut second).unwrap();
        assert!(second.did_supply_cached_data());
        assert!(!second.cached_data_rejected());

        // Both compilations behave identically.
        let first_result = compiled_first
            .apply_sync(None, Vec::new(), TransferOptions::default())
            .unwrap();
        let second_result = compiled_second
            .apply_sync(None, Vec::new(), TransferOptions::default())
            .unwrap();
        assert_eq!(
            first_result.into_plain().unwrap(),
            second_result.into_plain().unwrap()
        );
    }

    #[test]
    fn stale_cache_is_flagged_but_not_fatal() {
        let context = spawn_compiling();
        let mut holder = CodeHolder::new(
            "2",
            CompileOptions {
                cached_data: Some(b"tinycache:something else".to_vec()),
                ..CompileOptions::default()
            },
        );
        let compiled = context.compile_sync(&mut holder).unwrap();
        assert!(holder.cached_data_rejected());
        assert_eq!(
            plain_int(
                compiled
                    .apply_sync(None, Vec::new(), TransferOptions::default())
                    .unwrap()
            ),
            1
        );
    }

    #[test]
    fn compiling_without_a_compiler_is_refused() {
        let context = spawn();
        let mut holder = CodeHolder::new("1", CompileOptions::default());
        let err = context.compile_sync(&mut holder).unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[tokio::test]
    async fn compile_async_returns_the_updated_holder() {
        let context = spawn_compiling();
        let holder = CodeHolder::new(
            "40 + 2",
            CompileOptions {
                produce_cached_data: true,
                ..CompileOptions::default()
            },
        );
        let (compiled, holder) = context.compile_async(holder).await.unwrap();
        assert!(holder.write_compile_results().cached_data_produced);
        assert_eq!(compiled.type_of().unwrap(), TypeOf::Function);
        assert_eq!(
            compiled.name().unwrap().as_deref(),
            Some(script::DEFAULT_FILENAME)
        );
    }

    // --- Deferred mode under an async caller ---

    #[tokio::test]
    async fn deferred_results_resolve_without_blocking() {
        let context = spawn();
        let ticker = capture_ticker(&context);

        let first = ticker.apply_async(None, Vec::new(), TransferOptions::default());
        let second = ticker.apply_async(None, Vec::new(), TransferOptions::default());
        assert_eq!(plain_int(first.await.unwrap()), 0);
        assert_eq!(plain_int(second.await.unwrap()), 1);
    }

    #[tokio::test]
    async fn deferred_failures_arrive_as_rejections() {
        let context = spawn();
        let number = context
            .capture_with(CaptureOptions::default(), |_scope| {
                Ok(LiveValue::Number(1.0))
            })
            .unwrap();
        let err = number
            .apply_async(None, Vec::new(), TransferOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }
}
