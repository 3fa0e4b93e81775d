//! Generated boundary surface for the tern interop testbed.
//!
//! The flat `_simple_obj` / `_seq_*` / `_ref_obj_with_seq_*` function set is
//! the only way the calling-language runtime touches these objects. Plain
//! value structs cross by copy; everything with identity crosses as a
//! positive `i64` handle backed by the process-wide table in
//! `tern-abi-core`. Entry points either complete or trap via the host's
//! `tern_rt_trap` with an ABI error code; the C signatures carry no error
//! channel.
//!
//! Text ownership: inbound `char*` values are copied before an entry point
//! returns; outbound text from `_seq_string_get` is a fresh NUL-terminated
//! buffer obtained from `tern_rt_alloc`, owned by the caller.

use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::sync::Mutex;

use once_cell::sync::OnceCell;
use tern_abi_core::{
    env_u32_nonzero, AbiError, Handle, HandleTable, Payload, Seq, TERN_TRAP_ABI_INTERNAL,
};

// Provided by the calling-language runtime. Tests supply panicking /
// Vec-backed shims; the "C-unwind" ABI lets a test trap shim unwind back
// out through the exported surface instead of aborting.
extern "C-unwind" {
    fn tern_rt_alloc(len: u32) -> *mut u8;
    fn tern_rt_trap(code: i32) -> !;
}

// -------------------------
// Schema constants
// -------------------------

pub const SIMPLE_CONST: i64 = 123;

pub const SIMPLE_ENUM_FIRST: c_char = 0;
pub const SIMPLE_ENUM_SECOND: c_char = 1;
pub const SIMPLE_ENUM_THIRD: c_char = 2;

// -------------------------
// Value structs
// -------------------------

/// Fixed-layout value aggregate; crosses the boundary by copy, no identity.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleObj {
    pub simple_a: i64,
    pub simple_b: c_char,
    pub simple_c: c_char,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SimpleObjWithProc {
    pub simple_a: i64,
    pub simple_b: c_char,
    pub simple_c: c_char,
}

// -------------------------
// Heap payloads
// -------------------------

#[derive(Debug, Default)]
struct SimpleRefState {
    simple_ref_a: i64,
    simple_ref_b: c_char,
}

/// Composite payload: sole owner of its byte-sequence handle. The handle is
/// never exposed through any entry point; all `_ref_obj_with_seq_data_*`
/// calls delegate through the composite.
#[derive(Debug)]
struct RefWithSeqState {
    data: Handle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjKind {
    SimpleRef,
    SeqInt,
    SeqByte,
    SeqString,
    RefWithSeq,
}

#[derive(Debug)]
enum BoundaryObj {
    SimpleRef(SimpleRefState),
    SeqInt(Seq<i64>),
    SeqByte(Seq<c_char>),
    SeqString(Seq<CString>),
    RefWithSeq(RefWithSeqState),
}

impl BoundaryObj {
    fn kind(&self) -> ObjKind {
        match self {
            BoundaryObj::SimpleRef(_) => ObjKind::SimpleRef,
            BoundaryObj::SeqInt(_) => ObjKind::SeqInt,
            BoundaryObj::SeqByte(_) => ObjKind::SeqByte,
            BoundaryObj::SeqString(_) => ObjKind::SeqString,
            BoundaryObj::RefWithSeq(_) => ObjKind::RefWithSeq,
        }
    }
}

impl Payload for BoundaryObj {
    fn owned_handles(&self) -> Vec<Handle> {
        match self {
            BoundaryObj::RefWithSeq(s) => vec![s.data],
            _ => Vec::new(),
        }
    }
}

// -------------------------
// Table static & policy
// -------------------------

struct Policy {
    max_live_handles: u32,
}

static POLICY: OnceCell<Policy> = OnceCell::new();

fn policy() -> &'static Policy {
    POLICY.get_or_init(|| Policy {
        max_live_handles: env_u32_nonzero("TERN_ABI_MAX_LIVE_HANDLES", 1 << 20),
    })
}

static TABLE: OnceCell<Mutex<HandleTable<BoundaryObj>>> = OnceCell::new();

fn table() -> &'static Mutex<HandleTable<BoundaryObj>> {
    TABLE.get_or_init(|| Mutex::new(HandleTable::new()))
}

fn trap(code: i32) -> ! {
    unsafe { tern_rt_trap(code) }
}

/// Runs `f` under the table lock, trapping on `AbiError`. Entry points
/// validate before mutating, so recovering a poisoned lock is sound: a trap
/// never fires mid-mutation.
fn with_table<R>(f: impl FnOnce(&mut HandleTable<BoundaryObj>) -> Result<R, AbiError>) -> R {
    let mut guard = table().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match f(&mut guard) {
        Ok(v) => v,
        Err(e) => trap(e.wire_code()),
    }
}

fn decode(raw: i64) -> Result<Handle, AbiError> {
    Handle::from_i64(raw).ok_or(AbiError::InvalidHandle)
}

fn allocate(table: &mut HandleTable<BoundaryObj>, obj: BoundaryObj) -> Handle {
    if table.live_len() >= policy().max_live_handles as usize {
        trap(TERN_TRAP_ABI_INTERNAL);
    }
    table.allocate(obj)
}

fn unref_as(raw: i64, kind: ObjKind) {
    with_table(|t| {
        let h = decode(raw)?;
        if t.resolve(h)?.kind() != kind {
            return Err(AbiError::InvalidHandle);
        }
        t.decrement(h)?;
        Ok(())
    })
}

// -------------------------
// Typed resolution helpers
// -------------------------

fn with_simple_ref<R>(raw: i64, f: impl FnOnce(&mut SimpleRefState) -> R) -> R {
    with_table(|t| match t.resolve_mut(decode(raw)?)? {
        BoundaryObj::SimpleRef(s) => Ok(f(s)),
        _ => Err(AbiError::InvalidHandle),
    })
}

fn with_seq_int<R>(raw: i64, f: impl FnOnce(&mut Seq<i64>) -> Result<R, AbiError>) -> R {
    with_table(|t| match t.resolve_mut(decode(raw)?)? {
        BoundaryObj::SeqInt(s) => f(s),
        _ => Err(AbiError::InvalidHandle),
    })
}

fn with_seq_string<R>(raw: i64, f: impl FnOnce(&mut Seq<CString>) -> Result<R, AbiError>) -> R {
    with_table(|t| match t.resolve_mut(decode(raw)?)? {
        BoundaryObj::SeqString(s) => f(s),
        _ => Err(AbiError::InvalidHandle),
    })
}

/// Resolves the composite, then its owned byte sequence. The façade never
/// hands the inner handle out.
fn with_ref_seq_data<R>(raw: i64, f: impl FnOnce(&mut Seq<c_char>) -> Result<R, AbiError>) -> R {
    with_table(|t| {
        let data = match t.resolve(decode(raw)?)? {
            BoundaryObj::RefWithSeq(s) => s.data,
            _ => return Err(AbiError::InvalidHandle),
        };
        match t.resolve_mut(data)? {
            BoundaryObj::SeqByte(s) => f(s),
            _ => Err(AbiError::InvalidHandle),
        }
    })
}

// -------------------------
// Text marshaling
// -------------------------

/// Copies caller-owned text into callee-owned storage. The caller keeps its
/// buffer; a NUL pointer is a host-side contract violation.
unsafe fn import_text(value: *const c_char) -> CString {
    if value.is_null() {
        trap(TERN_TRAP_ABI_INTERNAL);
    }
    CStr::from_ptr(value).to_owned()
}

/// Copies text (including its NUL) into a host-allocated buffer the caller
/// will own.
fn export_text(text: &CStr) -> *mut c_char {
    let bytes = text.to_bytes_with_nul();
    let len = match u32::try_from(bytes.len()) {
        Ok(len) => len,
        Err(_) => trap(TERN_TRAP_ABI_INTERNAL),
    };
    unsafe {
        let out = tern_rt_alloc(len);
        if out.is_null() {
            trap(TERN_TRAP_ABI_INTERNAL);
        }
        std::ptr::copy_nonoverlapping(bytes.as_ptr(), out, bytes.len());
        out as *mut c_char
    }
}

fn c_bool(v: bool) -> c_char {
    if v {
        1
    } else {
        0
    }
}

// -------------------------
// Exported C ABI: plain calls & value structs
// -------------------------

/// Returns the integer passed in.
#[no_mangle]
pub extern "C-unwind" fn _simple_call(a: i64) -> i64 {
    a
}

#[no_mangle]
pub extern "C-unwind" fn _simple_obj(simple_a: i64, simple_b: c_char, simple_c: c_char) -> SimpleObj {
    SimpleObj {
        simple_a,
        simple_b,
        simple_c,
    }
}

#[no_mangle]
pub extern "C-unwind" fn _simple_obj_eq(a: SimpleObj, b: SimpleObj) -> c_char {
    c_bool(a == b)
}

#[no_mangle]
pub extern "C-unwind" fn _simple_obj_with_proc(
    simple_a: i64,
    simple_b: c_char,
    simple_c: c_char,
) -> SimpleObjWithProc {
    SimpleObjWithProc {
        simple_a,
        simple_b,
        simple_c,
    }
}

#[no_mangle]
pub extern "C-unwind" fn _simple_obj_with_proc_eq(a: SimpleObjWithProc, b: SimpleObjWithProc) -> c_char {
    c_bool(a == b)
}

/// Side-effecting hook on a by-value struct: the mutation below touches only
/// this function's copy and is invisible to the caller.
#[no_mangle]
pub extern "C-unwind" fn _simple_obj_with_proc_extra_proc(mut s: SimpleObjWithProc) {
    s.simple_a = s.simple_a.wrapping_add(SIMPLE_CONST);
    s.simple_b = SIMPLE_ENUM_SECOND;
    let _ = s;
}

// -------------------------
// Exported C ABI: SimpleRefObj
// -------------------------

#[no_mangle]
pub extern "C-unwind" fn _new_simple_ref_obj() -> i64 {
    with_table(|t| Ok(allocate(t, BoundaryObj::SimpleRef(SimpleRefState::default())).as_i64()))
}

#[no_mangle]
pub extern "C-unwind" fn _simple_ref_obj_get_simple_ref_a(simple_ref_obj: i64) -> i64 {
    with_simple_ref(simple_ref_obj, |s| s.simple_ref_a)
}

#[no_mangle]
pub extern "C-unwind" fn _simple_ref_obj_set_simple_ref_a(simple_ref_obj: i64, value: i64) {
    with_simple_ref(simple_ref_obj, |s| s.simple_ref_a = value)
}

#[no_mangle]
pub extern "C-unwind" fn _simple_ref_obj_get_simple_ref_b(simple_ref_obj: i64) -> c_char {
    with_simple_ref(simple_ref_obj, |s| s.simple_ref_b)
}

#[no_mangle]
pub extern "C-unwind" fn _simple_ref_obj_set_simple_ref_b(simple_ref_obj: i64, value: c_char) {
    with_simple_ref(simple_ref_obj, |s| s.simple_ref_b = value)
}

/// Does some thing with SimpleRefObj. Opaque hook: requires a live handle,
/// currently leaves the payload untouched.
#[no_mangle]
pub extern "C-unwind" fn _simple_ref_obj_doit(s: i64) {
    with_simple_ref(s, |_| ())
}

#[no_mangle]
pub extern "C-unwind" fn _simple_ref_obj_unref(simple_ref_obj: i64) {
    unref_as(simple_ref_obj, ObjKind::SimpleRef)
}

// -------------------------
// Exported C ABI: SeqInt
// -------------------------

#[no_mangle]
pub extern "C-unwind" fn _new_seq_int() -> i64 {
    with_table(|t| Ok(allocate(t, BoundaryObj::SeqInt(Seq::new())).as_i64()))
}

#[no_mangle]
pub extern "C-unwind" fn _seq_int_len(seq_int: i64) -> i64 {
    with_seq_int(seq_int, |s| Ok(s.len() as i64))
}

#[no_mangle]
pub extern "C-unwind" fn _seq_int_get(seq_int: i64, index: i64) -> i64 {
    with_seq_int(seq_int, |s| s.get(index).copied())
}

#[no_mangle]
pub extern "C-unwind" fn _seq_int_set(seq_int: i64, index: i64, value: i64) {
    with_seq_int(seq_int, |s| s.set(index, value))
}

#[no_mangle]
pub extern "C-unwind" fn _seq_int_delete(seq_int: i64, index: i64) {
    with_seq_int(seq_int, |s| s.delete(index))
}

#[no_mangle]
pub extern "C-unwind" fn _seq_int_add(seq_int: i64, value: i64) {
    with_seq_int(seq_int, |s| {
        s.add(value);
        Ok(())
    })
}

#[no_mangle]
pub extern "C-unwind" fn _seq_int_clear(seq_int: i64) {
    with_seq_int(seq_int, |s| {
        s.clear();
        Ok(())
    })
}

#[no_mangle]
pub extern "C-unwind" fn _seq_int_unref(seq_int: i64) {
    unref_as(seq_int, ObjKind::SeqInt)
}

// -------------------------
// Exported C ABI: RefObjWithSeq (façade over an owned byte sequence)
// -------------------------

#[no_mangle]
pub extern "C-unwind" fn _new_ref_obj_with_seq() -> i64 {
    with_table(|t| {
        let data = allocate(t, BoundaryObj::SeqByte(Seq::new()));
        Ok(allocate(t, BoundaryObj::RefWithSeq(RefWithSeqState { data })).as_i64())
    })
}

#[no_mangle]
pub extern "C-unwind" fn _ref_obj_with_seq_data_len(ref_obj_with_seq: i64) -> i64 {
    with_ref_seq_data(ref_obj_with_seq, |s| Ok(s.len() as i64))
}

#[no_mangle]
pub extern "C-unwind" fn _ref_obj_with_seq_data_get(ref_obj_with_seq: i64, index: i64) -> c_char {
    with_ref_seq_data(ref_obj_with_seq, |s| s.get(index).copied())
}

#[no_mangle]
pub extern "C-unwind" fn _ref_obj_with_seq_data_set(ref_obj_with_seq: i64, index: i64, value: c_char) {
    with_ref_seq_data(ref_obj_with_seq, |s| s.set(index, value))
}

#[no_mangle]
pub extern "C-unwind" fn _ref_obj_with_seq_data_delete(ref_obj_with_seq: i64, index: i64) {
    with_ref_seq_data(ref_obj_with_seq, |s| s.delete(index))
}

#[no_mangle]
pub extern "C-unwind" fn _ref_obj_with_seq_data_add(ref_obj_with_seq: i64, value: c_char) {
    with_ref_seq_data(ref_obj_with_seq, |s| {
        s.add(value);
        Ok(())
    })
}

#[no_mangle]
pub extern "C-unwind" fn _ref_obj_with_seq_data_clear(ref_obj_with_seq: i64) {
    with_ref_seq_data(ref_obj_with_seq, |s| {
        s.clear();
        Ok(())
    })
}

/// Releasing the composite releases its owned byte sequence in the same
/// destruction step.
#[no_mangle]
pub extern "C-unwind" fn _ref_obj_with_seq_unref(ref_obj_with_seq: i64) {
    unref_as(ref_obj_with_seq, ObjKind::RefWithSeq)
}

// -------------------------
// Exported C ABI: SeqString
// -------------------------

#[no_mangle]
pub extern "C-unwind" fn _new_seq_string() -> i64 {
    with_table(|t| Ok(allocate(t, BoundaryObj::SeqString(Seq::new())).as_i64()))
}

#[no_mangle]
pub extern "C-unwind" fn _seq_string_len(seq_string: i64) -> i64 {
    with_seq_string(seq_string, |s| Ok(s.len() as i64))
}

#[no_mangle]
pub extern "C-unwind" fn _seq_string_get(seq_string: i64, index: i64) -> *mut c_char {
    with_seq_string(seq_string, |s| {
        let text = s.get(index)?;
        Ok(export_text(text))
    })
}

#[no_mangle]
pub extern "C-unwind" fn _seq_string_set(seq_string: i64, index: i64, value: *const c_char) {
    let text = unsafe { import_text(value) };
    with_seq_string(seq_string, |s| s.set(index, text))
}

#[no_mangle]
pub extern "C-unwind" fn _seq_string_delete(seq_string: i64, index: i64) {
    with_seq_string(seq_string, |s| s.delete(index))
}

#[no_mangle]
pub extern "C-unwind" fn _seq_string_add(seq_string: i64, value: *const c_char) {
    let text = unsafe { import_text(value) };
    with_seq_string(seq_string, |s| {
        s.add(text);
        Ok(())
    })
}

#[no_mangle]
pub extern "C-unwind" fn _seq_string_clear(seq_string: i64) {
    with_seq_string(seq_string, |s| {
        s.clear();
        Ok(())
    })
}

#[no_mangle]
pub extern "C-unwind" fn _seq_string_unref(seq_string: i64) {
    unref_as(seq_string, ObjKind::SeqString)
}

/// Builds a fresh string sequence the caller owns (refcount 1, released via
/// `_seq_string_unref`).
#[no_mangle]
pub extern "C-unwind" fn _get_datas() -> i64 {
    with_table(|t| Ok(allocate(t, BoundaryObj::SeqString(Seq::new())).as_i64()))
}
