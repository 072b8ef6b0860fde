//! Reverse-call adapter tests: native code invoking managed instances, with
//! managed exceptions forwarded across the boundary and back.

use std::sync::Arc;

use parking_lot::Mutex;

use objc_bridge::registry;
use objc_bridge::runtime::fixture::{self, Fixture};
use objc_bridge::{
    BridgeError, Handle, ManagedException, ManagedInstance, NativeFault, ParamKind,
    RegistryError, ReverseBinding, Value,
};

fn setup() -> &'static Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    fixture::install()
}

/// Exports `instance` as a native object of a freshly defined class with the
/// given reverse-bound methods installed.
fn export(
    f: &Fixture,
    class_name: &str,
    methods: &[&ReverseBinding],
    instance: Arc<dyn ManagedInstance>,
) -> Handle {
    let root = f.class_handle("TestObject").unwrap();
    let class = f.define_class(class_name, root);
    for binding in methods {
        f.define_method(class, binding.selector(), binding.encoding().source(), binding.imp());
    }
    let handle = f.new_object(class);
    registry::register(handle, instance).unwrap();
    handle
}

struct Adder;

impl ManagedInstance for Adder {
    fn invoke(&self, selector: &str, args: &[Value]) -> Result<Value, ManagedException> {
        match selector {
            "addOne:" => Ok(Value::Int32(args[0].as_i32().map_err(|e| {
                ManagedException::new("InvalidCallError", e.to_string())
            })? + 1)),
            "name" => Ok(Value::String("managed adder".to_string())),
            other => Err(ManagedException::new(
                "MissingMethodError",
                format!("no managed method {other}"),
            )),
        }
    }
}

#[test]
fn native_call_reaches_the_managed_instance() {
    let f = setup();
    let add_one = ReverseBinding::bind("addOne:", "i@:i", None).unwrap();
    let name = ReverseBinding::bind("name", "*@:", None).unwrap();
    let obj = export(f, "RevAdder", &[&add_one, &name], Arc::new(Adder));

    // The forward engine drives the reverse binding like any native method,
    // so the full native->managed->native loop runs.
    assert_eq!(obj.call("addOne:", &[Value::Int32(41)]).unwrap(), Value::Int32(42));
    assert_eq!(
        obj.call("name", &[]).unwrap(),
        Value::String("managed adder".to_string())
    );
}

struct Recorder {
    seen: Mutex<Vec<Value>>,
}

impl ManagedInstance for Recorder {
    fn invoke(&self, _selector: &str, args: &[Value]) -> Result<Value, ManagedException> {
        self.seen.lock().extend_from_slice(args);
        Ok(Value::Null)
    }

    fn parameter_kinds(&self, selector: &str) -> Option<Vec<ParamKind>> {
        (selector == "pushChar:").then(|| vec![ParamKind::Char])
    }
}

#[test]
fn declared_char_parameter_rehydrates_from_a_u16_slot() {
    let f = setup();
    let push_char = ReverseBinding::bind("pushChar:", "v@:S", None).unwrap();
    let push_short = ReverseBinding::bind("pushShort:", "v@:S", None).unwrap();
    let recorder = Arc::new(Recorder { seen: Mutex::new(Vec::new()) });
    let obj = export(f, "RevRecorder", &[&push_char, &push_short], recorder.clone());

    // Identical wire format; only the declared parameter kind differs.
    obj.call("pushChar:", &[Value::UInt16('x' as u16)]).unwrap();
    obj.call("pushShort:", &[Value::UInt16('x' as u16)]).unwrap();

    let seen = recorder.seen.lock();
    assert_eq!(seen.as_slice(), &[Value::Char('x'), Value::UInt16('x' as u16)]);
}

struct Thrower;

impl ManagedInstance for Thrower {
    fn invoke(&self, _selector: &str, _args: &[Value]) -> Result<Value, ManagedException> {
        Err(ManagedException::new("CustomError", "boom")
            .with_cause(ManagedException::new("IoError", "disk on fire")))
    }
}

#[test]
fn managed_exception_round_trips_with_type_and_message() {
    let f = setup();
    let fail = ReverseBinding::bind("fail", "v@:", None).unwrap();
    let obj = export(f, "RevThrower", &[&fail], Arc::new(Thrower));

    let err = obj.call("fail", &[]).unwrap_err();
    let BridgeError::NativeFault(NativeFault::Forwarded { cause, handle }) = err else {
        panic!("expected the forwarded managed exception to be reconstituted");
    };
    assert!(!handle.is_null());
    assert_eq!(cause.exception_type, "CustomError");
    assert_eq!(cause.message, "boom");
    let inner = cause.cause.as_deref().unwrap();
    assert_eq!(inner.exception_type, "IoError");
    assert_eq!(inner.message, "disk on fire");
}

#[test]
fn managed_exception_is_a_real_native_exception_too() {
    let f = setup();
    let fail = ReverseBinding::bind("failAgain", "v@:", None).unwrap();
    let obj = export(f, "RevThrower2", &[&fail], Arc::new(Thrower));

    let err = obj.call("failAgain", &[]).unwrap_err();
    let BridgeError::NativeFault(fault) = err else {
        panic!("expected a native fault");
    };
    // Name and reason mirror the managed type and message, so purely native
    // observers see a sensible exception as well.
    let exc = fault.handle();
    use objc_bridge::runtime::ObjcRuntime;
    assert!(f.is_exception(exc));
    assert_eq!(f.exception_name(exc), "CustomError");
    assert_eq!(f.exception_reason(exc), "boom");
}

#[test]
fn corrupt_payload_still_reports_the_native_fault() {
    let f = setup();
    use objc_bridge::runtime::ObjcRuntime;

    // A side channel that was never valid JSON. Conversion must fall back
    // to the plain native wrapper instead of masking the fault.
    let exc = f.new_exception("GlueFault", "wires crossed", Some(b"not json".to_vec()));
    let err = objc_bridge::exception::from_handle(exc);

    let BridgeError::NativeFault(NativeFault::Raised { name, reason, handle }) = err else {
        panic!("expected the undecodable payload to degrade to a raised fault");
    };
    assert_eq!(name, "GlueFault");
    assert_eq!(reason, "wires crossed");
    assert_eq!(handle, exc);
}

struct AuditedThrower;

impl ManagedInstance for AuditedThrower {
    fn invoke(&self, _selector: &str, _args: &[Value]) -> Result<Value, ManagedException> {
        Err(ManagedException::new("AuditedError", "logged on the way out")
            .with_cause(ManagedException::new("WrappedIo", "root cause")))
    }
}

#[test]
fn exception_logger_observes_the_forwarded_cause_chain() {
    let f = setup();
    let captured: Arc<Mutex<Vec<ManagedException>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = captured.clone();
    objc_bridge::exception::set_exception_logger(move |e| sink.lock().push(e.clone()));

    let fail = ReverseBinding::bind("auditedFail", "v@:", None).unwrap();
    let obj = export(f, "RevAudited", &[&fail], Arc::new(AuditedThrower));
    obj.call("auditedFail", &[]).unwrap_err();

    objc_bridge::exception::clear_exception_logger();

    // The hook runs on the boundary crossing, with the cause chain intact.
    // Filter by type since the hook is process-wide and tests run together.
    let captured = captured.lock();
    let seen = captured
        .iter()
        .find(|e| e.exception_type == "AuditedError")
        .expect("logger never saw the forwarded exception");
    assert_eq!(seen.message, "logged on the way out");
    assert_eq!(seen.cause.as_deref().unwrap().exception_type, "WrappedIo");
}

#[test]
fn duplicate_export_is_rejected() {
    let f = setup();
    let root = f.class_handle("TestObject").unwrap();
    let class = f.define_class("RevDupe", root);
    let handle = f.new_object(class);

    registry::register(handle, Arc::new(Adder)).unwrap();
    let err = registry::register(handle, Arc::new(Adder)).unwrap_err();
    assert_eq!(err, RegistryError::AlreadyRegistered(handle));
}

struct EchoResult;

impl ManagedInstance for EchoResult {
    fn invoke(&self, _selector: &str, args: &[Value]) -> Result<Value, ManagedException> {
        Ok(args.first().cloned().unwrap_or(Value::Null))
    }
}

#[test]
fn pointer_results_pass_back_unchanged() {
    let f = setup();
    let echo = ReverseBinding::bind("echo:", "@@:@", None).unwrap();
    let obj = export(f, "RevEcho", &[&echo], Arc::new(EchoResult));

    let friend = f.new_object(f.class_handle("TestNumber").unwrap());
    let result = obj.call("echo:", &[Value::Object(friend)]).unwrap();
    assert_eq!(result, Value::Object(friend));

    assert_eq!(obj.call("echo:", &[Value::Null]).unwrap(), Value::Null);
}
