//! In-process runtime backend for the test suite.
//!
//! Implements [`ObjcRuntime`] over plain Rust tables, with one deliberate
//! property: every method implementation is a genuine `extern "C"` function,
//! so the generic libffi path and the direct-call primitives both perform
//! real foreign calls against real calling conventions. The direct-call
//! primitives themselves are a software message-send routed through the same
//! generic call machinery, driven by the callee's true encoding.
//!
//! Ships a small class hierarchy (`TestObject` -> `TestNumber`) exercising
//! scalar, string, struct, and exception behavior, plus hooks for tests to
//! define further classes and install reverse bindings.

use std::cell::Cell;
use std::collections::HashMap;
use std::ffi::{c_char, CStr, CString};
use std::sync::atomic::{AtomicIsize, AtomicUsize, Ordering};
use std::sync::OnceLock;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::encoding::{self, TypeToken};
use crate::ffi::{self, buffer};
use crate::object::Handle;
use crate::runtime::{self, DirectCallTable, Imp, MethodImpl, ObjcRuntime, MANAGED_PAYLOAD_KEY};
use crate::selector::Sel;
use crate::value::Value;

/// Rectangle used by the struct-marshaling methods.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

#[repr(C)]
#[derive(Clone, Copy, PartialEq, Debug, Default)]
pub struct Rect {
    pub origin: Point,
    pub size: Size,
}

pub const RECT_ENCODING: &str = "{Rect={Point=dd}{Size=dd}}";

#[derive(Default)]
pub struct NumberState {
    pub int: i64,
    pub bounds: Rect,
    text: Option<CString>,
}

struct ObjectCell {
    class: Handle,
    refs: AtomicIsize,
    state: Mutex<NumberState>,
}

struct ClassDef {
    name: String,
    superclass: Handle,
    methods: Mutex<HashMap<Sel, MethodImpl>>,
}

struct ExceptionData {
    name: String,
    reason: String,
    payload: Option<Vec<u8>>,
}

pub struct Fixture {
    classes: DashMap<Handle, ClassDef>,
    class_names: DashMap<String, Handle>,
    objects: DashMap<Handle, ObjectCell>,
    exceptions: DashMap<Handle, ExceptionData>,
    selectors: DashMap<String, Sel>,
    selector_names: DashMap<Sel, String>,
    exception_class: OnceLock<Handle>,
    next_handle: AtomicUsize,
    next_sel: AtomicUsize,
    dispatches: AtomicUsize,
    direct: DirectCallTable,
}

thread_local! {
    static PENDING: Cell<Handle> = const { Cell::new(Handle::NULL) };
}

static FIXTURE: OnceLock<Fixture> = OnceLock::new();

/// Coerces a typed `extern "C"` function to the untyped implementation slot.
macro_rules! imp {
    ($f:ident ( $($arg:ty),* ) $(-> $ret:ty)?) => {{
        let typed: unsafe extern "C" fn($($arg),*) $(-> $ret)? = $f;
        unsafe {
            std::mem::transmute::<unsafe extern "C" fn($($arg),*) $(-> $ret)?, Imp>(typed)
        }
    }};
}

/// Builds the fixture on first call and installs it as the process runtime.
/// Idempotent, so every test can call it unconditionally.
pub fn install() -> &'static Fixture {
    let f = FIXTURE.get_or_init(Fixture::new);
    runtime::install(f);
    f
}

fn fx() -> &'static Fixture {
    FIXTURE
        .get()
        .expect("fixture method ran before fixture::install")
}

fn note_dispatch() {
    fx().dispatches.fetch_add(1, Ordering::Relaxed);
}

fn set_pending(exc: Handle) {
    PENDING.with(|p| p.set(exc));
}

fn take_pending() -> Handle {
    PENDING.with(|p| p.replace(Handle::NULL))
}

impl Fixture {
    fn new() -> Fixture {
        let f = Fixture {
            classes: DashMap::new(),
            class_names: DashMap::new(),
            objects: DashMap::new(),
            exceptions: DashMap::new(),
            selectors: DashMap::new(),
            selector_names: DashMap::new(),
            exception_class: OnceLock::new(),
            next_handle: AtomicUsize::new(0x1000),
            next_sel: AtomicUsize::new(1),
            dispatches: AtomicUsize::new(0),
            direct: DirectCallTable {
                call_p: direct_call_p,
                call_i: direct_call_i,
                call_pi: direct_call_pi,
                call_ii: direct_call_ii,
                call_pp: direct_call_pp,
                call_ip: direct_call_ip,
            },
        };
        f.populate();
        f
    }

    fn populate(&self) {
        let root = self.define_class("TestObject", Handle::NULL);
        self.define_method(root, "alloc", "@@:", imp!(imp_alloc(Handle, Sel) -> Handle));
        self.define_method(root, "self", "@@:", imp!(imp_self(Handle, Sel) -> Handle));

        let number = self.define_class("TestNumber", root);
        self.define_method(
            number,
            "numberWithInt:",
            "@@:i",
            imp!(imp_number_with_int(Handle, Sel, i32) -> Handle),
        );
        self.define_method(
            number,
            "initWithInt:",
            "@@:i",
            imp!(imp_init_with_int(Handle, Sel, i32) -> Handle),
        );
        self.define_method(number, "intValue", "i@:", imp!(imp_int_value(Handle, Sel) -> i32));
        self.define_method(
            number,
            "unsignedShortValue",
            "S@:",
            imp!(imp_unsigned_short_value(Handle, Sel) -> u16),
        );
        self.define_method(number, "longValue", "q@:", imp!(imp_long_value(Handle, Sel) -> i64));
        self.define_method(
            number,
            "doubleValue",
            "d@:",
            imp!(imp_double_value(Handle, Sel) -> f64),
        );
        self.define_method(number, "addInt:", "i@:i", imp!(imp_add_int(Handle, Sel, i32) -> i32));
        self.define_method(
            number,
            "addNumber:",
            "i@:@",
            imp!(imp_add_number(Handle, Sel, Handle) -> i32),
        );
        self.define_method(number, "negate", "v@:", imp!(imp_negate(Handle, Sel)));
        self.define_method(number, "explode", "v@:", imp!(imp_explode(Handle, Sel)));
        self.define_method(
            number,
            "description",
            "*@:",
            imp!(imp_description(Handle, Sel) -> *const c_char),
        );
        self.define_method(
            number,
            "stringLength:",
            "i@:*",
            imp!(imp_string_length(Handle, Sel, *const c_char) -> i32),
        );
        self.define_method(
            number,
            "bounds",
            &format!("{RECT_ENCODING}@:"),
            imp!(imp_bounds(Handle, Sel) -> Rect),
        );
        self.define_method(
            number,
            "setBounds:",
            &format!("v@:{RECT_ENCODING}"),
            imp!(imp_set_bounds(Handle, Sel, Rect)),
        );

        let exc = self.define_class("Exception", root);
        let _ = self.exception_class.set(exc);
    }

    fn fresh_handle(&self) -> Handle {
        Handle(self.next_handle.fetch_add(16, Ordering::Relaxed))
    }

    /// Class handle by name, without going through the installed runtime.
    pub fn class_handle(&self, name: &str) -> Option<Handle> {
        self.class_names.get(name).map(|h| *h)
    }

    /// Registers a new class; tests use this to host reverse bindings.
    pub fn define_class(&self, name: &str, superclass: Handle) -> Handle {
        if let Some(existing) = self.class_names.get(name) {
            return *existing;
        }
        let handle = self.fresh_handle();
        self.classes.insert(
            handle,
            ClassDef {
                name: name.to_string(),
                superclass,
                methods: Mutex::new(HashMap::new()),
            },
        );
        self.class_names.insert(name.to_string(), handle);
        handle
    }

    /// Installs (or replaces) a method on a class.
    pub fn define_method(&self, class: Handle, name: &str, encoding: &str, imp: Imp) {
        let sel = self.register_selector(name);
        let def = self
            .classes
            .get(&class)
            .expect("defining a method on an unknown class");
        def.methods.lock().insert(
            sel,
            MethodImpl {
                imp,
                encoding: encoding.to_string(),
            },
        );
    }

    /// Allocates a bare native object of `class` (reference count one).
    pub fn new_object(&self, class: Handle) -> Handle {
        let handle = self.fresh_handle();
        self.objects.insert(
            handle,
            ObjectCell {
                class,
                refs: AtomicIsize::new(1),
                state: Mutex::new(NumberState::default()),
            },
        );
        handle
    }

    /// Runs `f` against the mutable state of a live object.
    pub fn with_state<R>(&self, obj: Handle, f: impl FnOnce(&mut NumberState) -> R) -> R {
        let cell = self
            .objects
            .get(&obj)
            .expect("fixture object is gone or never existed");
        let mut state = cell.state.lock();
        f(&mut state)
    }

    pub fn ref_count(&self, obj: Handle) -> isize {
        self.objects
            .get(&obj)
            .map(|c| c.refs.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn is_live(&self, obj: Handle) -> bool {
        self.objects.contains_key(&obj)
    }

    /// Number of method implementations run so far, across all threads.
    pub fn dispatch_count(&self) -> usize {
        self.dispatches.load(Ordering::Relaxed)
    }
}

impl ObjcRuntime for Fixture {
    fn class_of(&self, obj: Handle) -> Handle {
        if self.classes.contains_key(&obj) {
            // Class handles answer their own methods; no metaclass tier.
            return obj;
        }
        self.objects.get(&obj).map(|c| c.class).unwrap_or(Handle::NULL)
    }

    fn class_named(&self, name: &str) -> Option<Handle> {
        self.class_names.get(name).map(|h| *h)
    }

    fn class_name(&self, class: Handle) -> String {
        self.classes
            .get(&class)
            .map(|c| c.name.clone())
            .unwrap_or_else(|| "(not a class)".to_string())
    }

    fn superclass(&self, class: Handle) -> Handle {
        self.classes
            .get(&class)
            .map(|c| c.superclass)
            .unwrap_or(Handle::NULL)
    }

    fn lookup_method(&self, class: Handle, sel: Sel) -> Option<MethodImpl> {
        let mut cursor = class;
        while !cursor.is_null() {
            let def = self.classes.get(&cursor)?;
            if let Some(m) = def.methods.lock().get(&sel) {
                return Some(m.clone());
            }
            cursor = def.superclass;
        }
        None
    }

    fn register_selector(&self, name: &str) -> Sel {
        if let Some(sel) = self.selectors.get(name) {
            return *sel;
        }
        let sel = Sel(self.next_sel.fetch_add(1, Ordering::Relaxed));
        self.selectors.insert(name.to_string(), sel);
        self.selector_names.insert(sel, name.to_string());
        sel
    }

    fn selector_name(&self, sel: Sel) -> String {
        self.selector_names
            .get(&sel)
            .map(|n| n.clone())
            .unwrap_or_default()
    }

    fn retain(&self, obj: Handle) {
        if let Some(cell) = self.objects.get(&obj) {
            cell.refs.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn release(&self, obj: Handle) {
        let dead = match self.objects.get(&obj) {
            Some(cell) => cell.refs.fetch_sub(1, Ordering::Relaxed) == 1,
            None => false,
        };
        if dead {
            self.objects.remove(&obj);
            self.exceptions.remove(&obj);
        }
    }

    fn direct_calls(&self) -> &DirectCallTable {
        &self.direct
    }

    fn take_pending_exception(&self) -> Option<Handle> {
        let exc = take_pending();
        (!exc.is_null()).then_some(exc)
    }

    fn raise(&self, exc: Handle) {
        set_pending(exc);
    }

    fn is_exception(&self, obj: Handle) -> bool {
        self.exceptions.contains_key(&obj)
    }

    fn exception_name(&self, exc: Handle) -> String {
        self.exceptions
            .get(&exc)
            .map(|e| e.name.clone())
            .unwrap_or_default()
    }

    fn exception_reason(&self, exc: Handle) -> String {
        self.exceptions
            .get(&exc)
            .map(|e| e.reason.clone())
            .unwrap_or_default()
    }

    fn exception_payload(&self, exc: Handle, key: &str) -> Option<Vec<u8>> {
        if key != MANAGED_PAYLOAD_KEY {
            return None;
        }
        self.exceptions.get(&exc).and_then(|e| e.payload.clone())
    }

    fn new_exception(&self, name: &str, reason: &str, payload: Option<Vec<u8>>) -> Handle {
        let class = self.exception_class.get().copied().unwrap_or(Handle::NULL);
        let handle = self.new_object(class);
        self.exceptions.insert(
            handle,
            ExceptionData {
                name: name.to_string(),
                reason: reason.to_string(),
                payload,
            },
        );
        handle
    }
}

// Direct-call primitives: a software message-send. Each shim resolves the
// callee, routes the call through the generic frame machinery using the
// callee's true encoding, and drains any pending exception into the
// out-parameter, exactly like a hand-written msgSend stub would.

enum DirectArg {
    None,
    Int(i32),
    Ptr(Handle),
}

unsafe fn direct_dispatch(target: Handle, sel: Sel, arg: DirectArg, exc: *mut Handle) -> usize {
    *exc = Handle::NULL;
    let f = fx();

    let m = match f.lookup_method(f.class_of(target), sel) {
        Some(m) => m,
        None => panic!(
            "direct call to unresolvable selector {:?} on {:?}",
            f.selector_name(sel),
            target
        ),
    };
    let sig = match encoding::cached(&m.encoding) {
        Ok(sig) => sig,
        Err(e) => panic!("direct call against malformed encoding: {e}"),
    };

    let frame = ffi::frame_for(&sig);
    let mut frame = frame.borrow_mut();
    let mut scratch = Vec::new();

    let encoded = (|| {
        buffer::encode(
            &mut frame.args[0],
            &Value::Object(target),
            &sig.args[0],
            &mut scratch,
        )?;
        buffer::encode(
            &mut frame.args[1],
            &Value::Selector(sel),
            &sig.args[1],
            &mut scratch,
        )?;
        let value = match (&arg, sig.args.get(2)) {
            (DirectArg::None, _) => return Ok(()),
            (DirectArg::Int(v), Some(TypeToken::UInt32)) => Value::UInt32(*v as u32),
            (DirectArg::Int(v), _) => Value::Int32(*v),
            (DirectArg::Ptr(h), Some(TypeToken::Sel)) => Value::Selector(Sel(h.0)),
            (DirectArg::Ptr(h), Some(TypeToken::Pointer)) => Value::Pointer(h.0),
            (DirectArg::Ptr(h), _) => Value::Object(*h),
        };
        buffer::encode(&mut frame.args[2], &value, &sig.args[2], &mut scratch)
    })();
    if let Err(e) = encoded {
        panic!("direct call argument did not fit its slot: {e}");
    }

    frame.ret.zero();
    frame.call(m.imp);

    let raised = take_pending();
    if !raised.is_null() {
        *exc = raised;
        return 0;
    }
    (frame.ret.as_ptr() as *const usize).read_unaligned()
}

unsafe extern "C" fn direct_call_p(target: Handle, sel: Sel, exc: *mut Handle) -> Handle {
    Handle(direct_dispatch(target, sel, DirectArg::None, exc))
}

unsafe extern "C" fn direct_call_i(target: Handle, sel: Sel, exc: *mut Handle) -> i32 {
    direct_dispatch(target, sel, DirectArg::None, exc) as i32
}

unsafe extern "C" fn direct_call_pi(target: Handle, sel: Sel, arg: i32, exc: *mut Handle) -> Handle {
    Handle(direct_dispatch(target, sel, DirectArg::Int(arg), exc))
}

unsafe extern "C" fn direct_call_ii(target: Handle, sel: Sel, arg: i32, exc: *mut Handle) -> i32 {
    direct_dispatch(target, sel, DirectArg::Int(arg), exc) as i32
}

unsafe extern "C" fn direct_call_pp(
    target: Handle,
    sel: Sel,
    arg: Handle,
    exc: *mut Handle,
) -> Handle {
    Handle(direct_dispatch(target, sel, DirectArg::Ptr(arg), exc))
}

unsafe extern "C" fn direct_call_ip(
    target: Handle,
    sel: Sel,
    arg: Handle,
    exc: *mut Handle,
) -> i32 {
    direct_dispatch(target, sel, DirectArg::Ptr(arg), exc) as i32
}

// TestObject / TestNumber method implementations. Each is a real foreign
// entry point whose true signature matches its registered encoding.

unsafe extern "C" fn imp_alloc(this: Handle, _cmd: Sel) -> Handle {
    note_dispatch();
    fx().new_object(this)
}

unsafe extern "C" fn imp_self(this: Handle, _cmd: Sel) -> Handle {
    note_dispatch();
    this
}

unsafe extern "C" fn imp_number_with_int(this: Handle, _cmd: Sel, v: i32) -> Handle {
    note_dispatch();
    let f = fx();
    let obj = f.new_object(this);
    f.with_state(obj, |s| s.int = v as i64);
    obj
}

unsafe extern "C" fn imp_init_with_int(this: Handle, _cmd: Sel, v: i32) -> Handle {
    note_dispatch();
    fx().with_state(this, |s| s.int = v as i64);
    this
}

unsafe extern "C" fn imp_int_value(this: Handle, _cmd: Sel) -> i32 {
    note_dispatch();
    fx().with_state(this, |s| s.int as i32)
}

unsafe extern "C" fn imp_unsigned_short_value(this: Handle, _cmd: Sel) -> u16 {
    note_dispatch();
    fx().with_state(this, |s| s.int as u16)
}

unsafe extern "C" fn imp_long_value(this: Handle, _cmd: Sel) -> i64 {
    note_dispatch();
    fx().with_state(this, |s| s.int)
}

unsafe extern "C" fn imp_double_value(this: Handle, _cmd: Sel) -> f64 {
    note_dispatch();
    fx().with_state(this, |s| s.int as f64)
}

unsafe extern "C" fn imp_add_int(this: Handle, _cmd: Sel, v: i32) -> i32 {
    note_dispatch();
    fx().with_state(this, |s| s.int as i32 + v)
}

unsafe extern "C" fn imp_add_number(this: Handle, _cmd: Sel, other: Handle) -> i32 {
    note_dispatch();
    let f = fx();
    let lhs = f.with_state(this, |s| s.int);
    let rhs = if other.is_null() {
        0
    } else {
        f.with_state(other, |s| s.int)
    };
    (lhs + rhs) as i32
}

unsafe extern "C" fn imp_negate(this: Handle, _cmd: Sel) {
    note_dispatch();
    fx().with_state(this, |s| s.int = -s.int);
}

unsafe extern "C" fn imp_explode(_this: Handle, _cmd: Sel) {
    note_dispatch();
    let exc = fx().new_exception("TestException", "on fire", None);
    set_pending(exc);
}

unsafe extern "C" fn imp_description(this: Handle, _cmd: Sel) -> *const c_char {
    note_dispatch();
    fx().with_state(this, |s| {
        let text = CString::new(format!("TestNumber({})", s.int)).unwrap_or_default();
        s.text = Some(text);
        s.text
            .as_ref()
            .map(|c| c.as_ptr())
            .unwrap_or(std::ptr::null())
    })
}

unsafe extern "C" fn imp_string_length(_this: Handle, _cmd: Sel, s: *const c_char) -> i32 {
    note_dispatch();
    if s.is_null() {
        return -1;
    }
    CStr::from_ptr(s).to_bytes().len() as i32
}

unsafe extern "C" fn imp_bounds(this: Handle, _cmd: Sel) -> Rect {
    note_dispatch();
    fx().with_state(this, |s| s.bounds)
}

unsafe extern "C" fn imp_set_bounds(this: Handle, _cmd: Sel, r: Rect) {
    note_dispatch();
    fx().with_state(this, |s| s.bounds = r);
}
