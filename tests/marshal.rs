//! Marshaling tests: structs, C-strings, and scalar widths through real
//! foreign calls.

use objc_bridge::runtime::fixture::{self, Fixture, Point, Rect, Size};
use objc_bridge::{Handle, Value};

fn setup() -> &'static Fixture {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    fixture::install()
}

fn number_with(f: &Fixture, value: i64) -> Handle {
    let class = f.class_handle("TestNumber").unwrap();
    let obj = f.new_object(class);
    f.with_state(obj, |s| s.int = value);
    obj
}

fn rect_value(x: f64, y: f64, w: f64, h: f64) -> Value {
    Value::Struct(vec![
        Value::Struct(vec![Value::Float64(x), Value::Float64(y)]),
        Value::Struct(vec![Value::Float64(w), Value::Float64(h)]),
    ])
}

#[test]
fn nested_struct_round_trips_through_a_native_call() {
    let f = setup();
    let obj = number_with(f, 0);

    let rect = rect_value(1.5, -2.0, 320.0, 200.25);
    obj.call("setBounds:", &[rect.clone()]).unwrap();

    // The callee received the real struct by value.
    let stored = f.with_state(obj, |s| s.bounds);
    assert_eq!(
        stored,
        Rect {
            origin: Point { x: 1.5, y: -2.0 },
            size: Size { width: 320.0, height: 200.25 },
        }
    );

    // And a struct return drains back bit-for-bit.
    assert_eq!(obj.call("bounds", &[]).unwrap(), rect);
}

#[test]
fn cstring_argument_and_return() {
    let f = setup();
    let obj = number_with(f, 9);

    assert_eq!(
        obj.call("stringLength:", &[Value::String("hello".into())]).unwrap(),
        Value::Int32(5)
    );
    // A null C-string pointer is a distinct case from an empty string.
    assert_eq!(obj.call("stringLength:", &[Value::Null]).unwrap(), Value::Int32(-1));
    assert_eq!(
        obj.call("stringLength:", &[Value::String(String::new())]).unwrap(),
        Value::Int32(0)
    );

    assert_eq!(
        obj.call("description", &[]).unwrap(),
        Value::String("TestNumber(9)".to_string())
    );
}

#[test]
fn interior_nul_is_rejected_before_the_call() {
    let f = setup();
    let obj = number_with(f, 0);

    let err = obj
        .call("stringLength:", &[Value::String("bad\0string".into())])
        .unwrap_err();
    assert!(err.is_invalid_call());
}

#[test]
fn scalar_widths_survive_the_boundary() {
    let f = setup();
    let obj = number_with(f, -7);

    assert_eq!(obj.call("intValue", &[]).unwrap(), Value::Int32(-7));
    assert_eq!(obj.call("longValue", &[]).unwrap(), Value::Int64(-7));
    assert_eq!(obj.call("doubleValue", &[]).unwrap(), Value::Float64(-7.0));
}

#[test]
fn void_return_is_null_and_side_effects_land() {
    let f = setup();
    let obj = number_with(f, 11);

    assert_eq!(obj.call("negate", &[]).unwrap(), Value::Null);
    assert_eq!(obj.call("intValue", &[]).unwrap(), Value::Int32(-11));
}

#[test]
fn widening_applies_to_arguments() {
    let f = setup();
    let obj = number_with(f, 100);

    // A UInt16 value fits an i32 slot by widening; a lossy value does not.
    assert_eq!(
        obj.call("addInt:", &[Value::UInt16(44)]).unwrap(),
        Value::Int32(144)
    );
    let err = obj.call("addInt:", &[Value::Int64(1)]).unwrap_err();
    assert!(err.is_invalid_call());
}

#[test]
fn pointer_argument_reaches_the_callee() {
    let f = setup();
    let a = number_with(f, 30);
    let b = number_with(f, 12);

    assert_eq!(
        a.call("addNumber:", &[Value::Object(b)]).unwrap(),
        Value::Int32(42)
    );
    assert_eq!(a.call("addNumber:", &[Value::Null]).unwrap(), Value::Int32(30));
}
