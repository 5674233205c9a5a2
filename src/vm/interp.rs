//! The interpreter loop.
//!
//! Each interpreted activation runs in its own call to [`Interp::run`];
//! managed calls recurse natively through [`Interp::invoke`]. Exceptions
//! unwind one frame at a time: a frame that cannot handle an exception runs
//! its own finally and fault handlers and then returns
//! [`Outcome::Threw`] to its caller, which continues the unwind at its call
//! site.

use std::ptr;
use std::sync::Arc;

use tracing::{debug, trace};

use crate::error::VmError;
use crate::il::BinOp;
use crate::metadata::{MethodImpl, WellKnown};

use super::context::{FrameLink, ThreadContext};
use super::convert::{Src, conv, conv_ovf, conv_target};
use super::frame::{ActiveHandler, Continuation, Frame, Outcome};
use super::heap::ObjRef;
use super::method::{ClauseKind, CompiledMethod, DataItem, MethodHandle, RetKind, RuntimeMethod};
use super::opcodes::{MintType, Opcode, instr_len, read_i32, read_u32, read_u64};
use super::runtime::Runtime;
use super::value::{StackValue, load, store};

/// Interpreter bound to one runtime and the calling thread.
pub(crate) struct Interp<'r> {
    pub rt: &'r Runtime,
    pub ctx: &'r ThreadContext,
}

/// Operation order of the `add.i4 .. mul.ovf.un.i4` and `.i8` families.
const BINOPS: [BinOp; 19] = [
    BinOp::Add,
    BinOp::Sub,
    BinOp::Mul,
    BinOp::Div,
    BinOp::DivUn,
    BinOp::Rem,
    BinOp::RemUn,
    BinOp::And,
    BinOp::Or,
    BinOp::Xor,
    BinOp::Shl,
    BinOp::Shr,
    BinOp::ShrUn,
    BinOp::AddOvf,
    BinOp::AddOvfUn,
    BinOp::SubOvf,
    BinOp::SubOvfUn,
    BinOp::MulOvf,
    BinOp::MulOvfUn,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArithError {
    DivideByZero,
    Overflow,
}

macro_rules! int_binop {
    ($name:ident, $t:ty, $u:ty) => {
        fn $name(op: BinOp, a: $t, b: $t) -> Result<$t, ArithError> {
            use ArithError::*;
            Ok(match op {
                BinOp::Add => a.wrapping_add(b),
                BinOp::Sub => a.wrapping_sub(b),
                BinOp::Mul => a.wrapping_mul(b),
                BinOp::Div | BinOp::Rem | BinOp::DivUn | BinOp::RemUn if b == 0 => {
                    return Err(DivideByZero);
                }
                BinOp::Div => a.checked_div(b).ok_or(Overflow)?,
                BinOp::Rem => a.checked_rem(b).ok_or(Overflow)?,
                BinOp::DivUn => ((a as $u) / (b as $u)) as $t,
                BinOp::RemUn => ((a as $u) % (b as $u)) as $t,
                BinOp::And => a & b,
                BinOp::Or => a | b,
                BinOp::Xor => a ^ b,
                BinOp::Shl => a.wrapping_shl(b as u32),
                BinOp::Shr => a.wrapping_shr(b as u32),
                BinOp::ShrUn => (a as $u).wrapping_shr(b as u32) as $t,
                BinOp::AddOvf => a.checked_add(b).ok_or(Overflow)?,
                BinOp::AddOvfUn => (a as $u).checked_add(b as $u).ok_or(Overflow)? as $t,
                BinOp::SubOvf => a.checked_sub(b).ok_or(Overflow)?,
                BinOp::SubOvfUn => (a as $u).checked_sub(b as $u).ok_or(Overflow)? as $t,
                BinOp::MulOvf => a.checked_mul(b).ok_or(Overflow)?,
                BinOp::MulOvfUn => (a as $u).checked_mul(b as $u).ok_or(Overflow)? as $t,
            })
        }
    };
}

int_binop!(binop_i32, i32, u32);
int_binop!(binop_i64, i64, u64);

fn binop_f64(op: BinOp, a: f64, b: f64) -> f64 {
    match op {
        BinOp::Add => a + b,
        BinOp::Sub => a - b,
        BinOp::Mul => a * b,
        BinOp::Div => a / b,
        _ => a % b,
    }
}

/// Operand width of a compare or branch family member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Width {
    I4,
    I8,
    R8,
}

/// `(signed, unsigned)` views of an integer operand.
fn int_views(width: Width, v: StackValue) -> (i64, u64) {
    match width {
        Width::I4 => (v.i32() as i64, v.i32() as u32 as u64),
        _ => (v.i64(), v.i64() as u64),
    }
}

/// Evaluate condition `cond` in `beq, bne.un, bge, bge.un, bgt, bgt.un,
/// ble, ble.un, blt, blt.un` order. Unsigned float conditions hold when the
/// operands are unordered.
fn condition(width: Width, cond: usize, a: StackValue, b: StackValue) -> bool {
    if width == Width::R8 {
        let (a, b) = (a.f64(), b.f64());
        return match cond {
            0 => a == b,
            1 => a != b,
            2 => a >= b,
            3 => !(a < b),
            4 => a > b,
            5 => !(a <= b),
            6 => a <= b,
            7 => !(a > b),
            8 => a < b,
            _ => !(a >= b),
        };
    }
    let ((sa, ua), (sb, ub)) = (int_views(width, a), int_views(width, b));
    match cond {
        0 => sa == sb,
        1 => sa != sb,
        2 => sa >= sb,
        3 => ua >= ub,
        4 => sa > sb,
        5 => ua > ub,
        6 => sa <= sb,
        7 => ua <= ub,
        8 => sa < sb,
        _ => ua < ub,
    }
}

/// Evaluate a `ceq, cgt, cgt.un, clt, clt.un` family member.
fn compare(width: Width, k: usize, a: StackValue, b: StackValue) -> bool {
    // Same truth table as the branch conditions.
    let cond = match k {
        0 => 0,
        1 => 4,
        2 => 5,
        3 => 8,
        _ => 9,
    };
    condition(width, cond, a, b)
}

fn family(op: Opcode, first: Opcode, last: Opcode) -> Option<usize> {
    let (op, first, last) = (op as u16, first as u16, last as u16);
    (first <= op && op <= last).then(|| (op - first) as usize)
}

/// How a tail transfer left the frame.
enum Transfer {
    /// The frame now runs another method from its start
    Reload,
    /// The target ran as a nested call and the frame is done
    Done,
    Threw(ObjRef),
}

impl<'r> Interp<'r> {
    pub fn new(rt: &'r Runtime, ctx: &'r ThreadContext) -> Self {
        Self { rt, ctx }
    }

    /// Call `handle` with `args`. A value-type result is written to
    /// `retbuf`; `parent` is the calling interpreter frame, if any.
    pub fn invoke(
        &self,
        handle: MethodHandle,
        args: &[StackValue],
        retbuf: *mut u8,
        parent: Option<&FrameLink<'_>>,
    ) -> Result<Outcome, VmError> {
        let rt = self.rt;
        let depth = parent.map_or(0, FrameLink::depth);
        if depth >= rt.config().max_frame_depth {
            return Ok(Outcome::Threw(rt.new_exception(
                WellKnown::StackOverflowException,
                "frame depth limit reached",
            )));
        }
        if self.ctx.take_interrupt() {
            return Ok(Outcome::Threw(
                rt.new_exception(WellKnown::ThreadInterruptedException, "thread interrupted"),
            ));
        }

        let method = rt.methods().get(handle);
        if args.len() != method.arg_count() {
            return Err(VmError::ArgumentMismatch {
                method: method.name.clone(),
                reason: format!("expected {} arguments, got {}", method.arg_count(), args.len()),
            });
        }
        match &rt.metadata().method(method.id).imp {
            MethodImpl::Il(_) => self.run_il(&method, args, retbuf, parent),
            MethodImpl::InternalCall(name) => self.icall(&method, name, args),
            MethodImpl::PInvoke { library, symbol } => {
                crate::ffi::pinvoke::call(self, &method, library, symbol, args)
            }
            #[cfg(feature = "jit")]
            MethodImpl::Compiled(entry) => crate::jit::call_compiled(self, &method, *entry, args, retbuf),
            MethodImpl::Abstract => Ok(Outcome::Threw(rt.new_exception(
                WellKnown::MissingMethodException,
                &format!("{} has no implementation", method.name),
            ))),
        }
    }

    fn run_il(
        &self,
        method: &RuntimeMethod,
        args: &[StackValue],
        retbuf: *mut u8,
        parent: Option<&FrameLink<'_>>,
    ) -> Result<Outcome, VmError> {
        let compiled = self.rt.compiled(method)?;
        let link = FrameLink::new(parent, &compiled);
        let _guard = self.ctx.enter(&link);
        let mut frame = Frame::new(&link, compiled, retbuf);
        frame.store_args(args);
        self.run(&mut frame)?;
        Ok(frame.outcome())
    }

    fn icall(&self, method: &RuntimeMethod, name: &str, args: &[StackValue]) -> Result<Outcome, VmError> {
        let Some(f) = self.rt.icall(name) else {
            return Ok(Outcome::Threw(self.rt.new_exception(
                WellKnown::MissingMethodException,
                &format!("no internal call `{name}` for {}", method.name),
            )));
        };
        let cx = crate::ffi::icall::IcallContext {
            runtime: self.rt,
            thread: self.ctx,
        };
        Ok(match f(&cx, args) {
            Ok(value) => Outcome::Returned(value),
            Err(ex) => Outcome::Threw(ex),
        })
    }

    // =========================================================================
    // Dispatch loop
    // =========================================================================

    /// Execute `frame` from `frame.ip` until it returns, its exception
    /// escapes, or, for a filter frame, `endfilter`.
    pub(crate) fn run(&self, frame: &mut Frame<'_>) -> Result<(), VmError> {
        let rt = self.rt;
        let md = rt.metadata();
        let heap = rt.heap();
        let check_shapes = rt.config().check_stack_balance;
        let trace_exec = rt.config().trace_exec;

        'reload: loop {
            let method = Arc::clone(&frame.method);
            let code: &[u16] = &method.code;
            let mut ip = frame.ip;

            macro_rules! throw {
                ($ex:expr) => {{
                    let ex = $ex;
                    frame.ip = ip;
                    match self.unwind(frame, ex, ip, None)? {
                        Some(next) => {
                            ip = next;
                            continue;
                        }
                        None => return Ok(()),
                    }
                }};
            }
            macro_rules! raise {
                ($which:ident, $msg:expr) => {
                    throw!(rt.new_exception(WellKnown::$which, $msg))
                };
            }
            macro_rules! pop {
                () => {
                    frame.pop()?
                };
            }
            macro_rules! jump {
                ($delta:expr) => {{
                    ip = (ip as isize + $delta as isize) as usize;
                    continue;
                }};
            }
            macro_rules! short_delta {
                () => {
                    code[ip + 1] as i16 as isize
                };
            }
            macro_rules! long_delta {
                () => {
                    read_i32(code, ip + 1) as isize
                };
            }
            macro_rules! item {
                ($kind:ident, $index:expr) => {
                    match method.item($index) {
                        DataItem::$kind(x) => x.clone(),
                        other => {
                            return Err(VmError::InvalidProgram {
                                method: method.name.clone(),
                                offset: ip,
                                reason: format!("data item {other:?} used as {}", stringify!($kind)),
                            });
                        }
                    }
                };
            }
            macro_rules! deref {
                ($receiver:expr) => {
                    match self.address_of($receiver) {
                        Some(p) => p,
                        None => raise!(NullReferenceException, "object reference not set"),
                    }
                };
            }

            loop {
                let Some(&word) = code.get(ip) else {
                    return Err(VmError::InvalidProgram {
                        method: method.name.clone(),
                        offset: ip,
                        reason: "control ran past the end of the code".into(),
                    });
                };
                let Some(op) = Opcode::from_u16(word) else {
                    return Err(VmError::InvalidOpcode {
                        method: method.name.clone(),
                        offset: ip,
                        word,
                    });
                };
                frame.ip = ip;
                if check_shapes {
                    check_shape(frame, &method, ip)?;
                }
                if trace_exec {
                    trace!(target: "mintvm::exec", "{}+{ip:04x} {:<16} {:?}", method.name, op.name(), frame.stack);
                }
                let next = ip + instr_len(code, ip);
                let a1 = code.get(ip + 1).copied().unwrap_or(0);
                let a2 = code.get(ip + 2).copied().unwrap_or(0);

                if let Some(k) = family(op, Opcode::AddI4, Opcode::MulOvfUnI4) {
                    let b = pop!().i32();
                    let a = pop!().i32();
                    match binop_i32(BINOPS[k], a, b) {
                        Ok(v) => frame.push(StackValue::I32(v)),
                        Err(ArithError::DivideByZero) => raise!(DivideByZeroException, "attempted to divide by zero"),
                        Err(ArithError::Overflow) => raise!(OverflowException, "arithmetic operation overflowed"),
                    }
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::AddI8, Opcode::MulOvfUnI8) {
                    let op = BINOPS[k];
                    let b = pop!();
                    let b = if op.is_shift() { b.i32() as i64 } else { b.i64() };
                    let a = pop!().i64();
                    match binop_i64(op, a, b) {
                        Ok(v) => frame.push(StackValue::I64(v)),
                        Err(ArithError::DivideByZero) => raise!(DivideByZeroException, "attempted to divide by zero"),
                        Err(ArithError::Overflow) => raise!(OverflowException, "arithmetic operation overflowed"),
                    }
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::AddR8, Opcode::RemR8) {
                    let b = pop!().f64();
                    let a = pop!().f64();
                    frame.push(StackValue::F64(binop_f64(BINOPS[k], a, b)));
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::CeqI4, Opcode::CltUnR8) {
                    let width = [Width::I4, Width::I8, Width::R8][k / 5];
                    let b = pop!();
                    let a = pop!();
                    frame.push(StackValue::I32(compare(width, k % 5, a, b) as i32));
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::BeqI4, Opcode::BltUnR8S) {
                    let width = [Width::I4, Width::I8, Width::R8][k / 20];
                    let b = pop!();
                    let a = pop!();
                    if condition(width, (k % 20) / 2, a, b) {
                        if k % 2 == 1 {
                            jump!(short_delta!());
                        } else {
                            jump!(long_delta!());
                        }
                    }
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::BrfalseI4, Opcode::BrtrueOS) {
                    let v = pop!();
                    let truthy = match k / 4 {
                        0 => v.i32() != 0,
                        1 => v.i64() != 0,
                        _ => !v.obj().is_null(),
                    };
                    let want = (k % 4) >= 2;
                    if truthy == want {
                        if k % 2 == 1 {
                            jump!(short_delta!());
                        } else {
                            jump!(long_delta!());
                        }
                    }
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::LdargI1, Opcode::LdargP) {
                    let v = unsafe { load(MintType::ALL[k], frame.slot(a1)) };
                    frame.push(v);
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::StargI1, Opcode::StargP) {
                    let v = pop!();
                    unsafe { store(MintType::ALL[k], frame.slot(a1), v) };
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::LdlocI1, Opcode::LdlocP) {
                    let v = unsafe { load(MintType::ALL[k], frame.local(a1)) };
                    frame.push(v);
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::StlocI1, Opcode::StlocP) {
                    let v = pop!();
                    unsafe { store(MintType::ALL[k], frame.local(a1), v) };
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::LdfldI1, Opcode::LdfldP) {
                    let receiver = pop!();
                    let base = deref!(receiver);
                    let v = unsafe { load(MintType::ALL[k], base.add(a1 as usize)) };
                    frame.push(v);
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::StfldI1, Opcode::StfldP) {
                    let v = pop!();
                    let receiver = pop!();
                    let base = deref!(receiver);
                    let dst = unsafe { base.add(a1 as usize) };
                    unsafe { store(MintType::ALL[k], dst, v) };
                    if MintType::ALL[k] == MintType::O {
                        rt.gc().write_barrier(dst, v.obj());
                    }
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::LdsfldI1, Opcode::LdsfldP) {
                    let field = item!(Field, a1);
                    let v = unsafe { load(MintType::ALL[k], rt.static_addr(field)) };
                    frame.push(v);
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::StsfldI1, Opcode::StsfldP) {
                    let field = item!(Field, a1);
                    let v = pop!();
                    let dst = rt.static_addr(field);
                    unsafe { store(MintType::ALL[k], dst, v) };
                    if MintType::ALL[k] == MintType::O {
                        rt.gc().write_barrier(dst, v.obj());
                    }
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::LdindI1, Opcode::LdindP) {
                    let addr = pop!();
                    let src = deref!(addr);
                    frame.push(unsafe { load(MintType::ALL[k], src) });
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::StindI1, Opcode::StindP) {
                    let v = pop!();
                    let addr = pop!();
                    let dst = deref!(addr);
                    unsafe { store(MintType::ALL[k], dst, v) };
                    if MintType::ALL[k] == MintType::O {
                        rt.gc().write_barrier(dst, v.obj());
                    }
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::LdelemI1, Opcode::LdelemVt) {
                    let index = pop!().i64();
                    let array = pop!().obj();
                    let Some(object) = heap.get(array) else {
                        raise!(NullReferenceException, "array reference not set");
                    };
                    let Some(src) = object.element(index) else {
                        raise!(IndexOutOfRangeException, "index was outside the bounds of the array");
                    };
                    let mint = MintType::ALL[k];
                    if mint == MintType::Vt {
                        let dst = frame.vt_alloc(a1 as u32);
                        unsafe { ptr::copy_nonoverlapping(src, dst, a1 as usize) };
                        frame.push(StackValue::Vt(dst));
                    } else {
                        frame.push(unsafe { load(mint, src) });
                    }
                    ip = next;
                    continue;
                }
                if let Some(k) = family(op, Opcode::StelemI1, Opcode::StelemVt) {
                    let v = pop!();
                    let index = pop!().i64();
                    let array = pop!().obj();
                    let Some(object) = heap.get(array) else {
                        raise!(NullReferenceException, "array reference not set");
                    };
                    let Some(dst) = object.element(index) else {
                        raise!(IndexOutOfRangeException, "index was outside the bounds of the array");
                    };
                    let mint = MintType::ALL[k];
                    match mint {
                        MintType::Vt => {
                            unsafe { ptr::copy_nonoverlapping(v.vt(), dst, a1 as usize) };
                            frame.vt_free(a1 as u32);
                        }
                        MintType::O => {
                            let value = v.obj();
                            let fits = match object.array_elem() {
                                Some(elem) => value.is_null() || rt.is_instance(value, elem),
                                None => false,
                            };
                            if !fits {
                                raise!(ArrayTypeMismatchException, "element type does not match the array");
                            }
                            unsafe { store(mint, dst, v) };
                            rt.gc().write_barrier(dst, value);
                        }
                        _ => unsafe { store(mint, dst, v) },
                    }
                    ip = next;
                    continue;
                }

                match op {
                    Opcode::Nop => {}
                    Opcode::Break => {
                        debug!(target: "mintvm::exec", method = %method.name, ip, "break");
                    }
                    Opcode::Safepoint => {
                        if self.ctx.take_interrupt() {
                            raise!(ThreadInterruptedException, "thread interrupted");
                        }
                        rt.gc().safepoint(self.ctx);
                    }
                    Opcode::InitLocals => unsafe {
                        ptr::write_bytes(frame.local(a1), 0, a2 as usize);
                    },

                    Opcode::Ldnull => frame.push(StackValue::NULL),
                    Opcode::LdcI4M1 => frame.push(StackValue::I32(-1)),
                    Opcode::LdcI40 => frame.push(StackValue::I32(0)),
                    Opcode::LdcI41 => frame.push(StackValue::I32(1)),
                    Opcode::LdcI4S => frame.push(StackValue::I32(a1 as i16 as i32)),
                    Opcode::LdcI4 => frame.push(StackValue::I32(read_i32(code, ip + 1))),
                    Opcode::LdcI8 => frame.push(StackValue::I64(read_u64(code, ip + 1) as i64)),
                    Opcode::LdcR4 => frame.push(StackValue::F64(f32::from_bits(read_u32(code, ip + 1)) as f64)),
                    Opcode::LdcR8 => frame.push(StackValue::F64(f64::from_bits(read_u64(code, ip + 1)))),
                    Opcode::Ldstr => {
                        let s = item!(Str, a1);
                        frame.push(StackValue::Ref(s));
                    }

                    Opcode::Dup => {
                        let v = frame.peek(0)?;
                        frame.push(v);
                    }
                    Opcode::DupVt => {
                        let src = frame.peek(0)?.vt();
                        let dst = frame.vt_alloc(a1 as u32);
                        unsafe { ptr::copy_nonoverlapping(src, dst, a1 as usize) };
                        frame.push(StackValue::Vt(dst));
                    }
                    Opcode::Pop => {
                        pop!();
                    }
                    Opcode::PopVt => {
                        pop!();
                        frame.vt_free(a1 as u32);
                    }

                    Opcode::LdargVt => {
                        let src = frame.slot(a1);
                        let dst = frame.vt_alloc(a2 as u32);
                        unsafe { ptr::copy_nonoverlapping(src, dst, a2 as usize) };
                        frame.push(StackValue::Vt(dst));
                    }
                    Opcode::StargVt => {
                        let v = pop!();
                        let dst = frame.slot(a1);
                        unsafe { ptr::copy_nonoverlapping(v.vt(), dst, a2 as usize) };
                        frame.vt_free(a2 as u32);
                    }
                    Opcode::Ldarga => {
                        let p = frame.slot(a1);
                        frame.push(StackValue::Ptr(p));
                    }
                    Opcode::LdlocVt => {
                        let src = frame.local(a1);
                        let dst = frame.vt_alloc(a2 as u32);
                        unsafe { ptr::copy_nonoverlapping(src, dst, a2 as usize) };
                        frame.push(StackValue::Vt(dst));
                    }
                    Opcode::StlocVt => {
                        let v = pop!();
                        let dst = frame.local(a1);
                        unsafe { ptr::copy_nonoverlapping(v.vt(), dst, a2 as usize) };
                        frame.vt_free(a2 as u32);
                    }
                    Opcode::Ldloca => {
                        let p = frame.local(a1);
                        frame.push(StackValue::Ptr(p));
                    }

                    Opcode::LdfldVt => {
                        let receiver = pop!();
                        let base = deref!(receiver);
                        let dst = frame.vt_alloc(a2 as u32);
                        unsafe { ptr::copy(base.add(a1 as usize), dst, a2 as usize) };
                        frame.push(StackValue::Vt(dst));
                    }
                    Opcode::StfldVt => {
                        let v = pop!();
                        let receiver = pop!();
                        let base = deref!(receiver);
                        unsafe { ptr::copy(v.vt(), base.add(a1 as usize), a2 as usize) };
                        frame.vt_free(a2 as u32);
                    }
                    Opcode::Ldflda => {
                        let receiver = pop!();
                        let base = deref!(receiver);
                        frame.push(StackValue::Ptr(unsafe { base.add(a1 as usize) }));
                    }
                    Opcode::LdsfldVt => {
                        let field = item!(Field, a1);
                        let src = rt.static_addr(field);
                        let dst = frame.vt_alloc(a2 as u32);
                        unsafe { ptr::copy_nonoverlapping(src, dst, a2 as usize) };
                        frame.push(StackValue::Vt(dst));
                    }
                    Opcode::StsfldVt => {
                        let field = item!(Field, a1);
                        let v = pop!();
                        unsafe { ptr::copy_nonoverlapping(v.vt(), rt.static_addr(field), a2 as usize) };
                        frame.vt_free(a2 as u32);
                    }
                    Opcode::Ldsflda => {
                        let field = item!(Field, a1);
                        frame.push(StackValue::Ptr(rt.static_addr(field)));
                    }

                    Opcode::LdobjVt => {
                        let addr = pop!();
                        let src = deref!(addr);
                        let dst = frame.vt_alloc(a1 as u32);
                        unsafe { ptr::copy(src, dst, a1 as usize) };
                        frame.push(StackValue::Vt(dst));
                    }
                    Opcode::StobjVt => {
                        let v = pop!();
                        let addr = pop!();
                        let dst = deref!(addr);
                        unsafe { ptr::copy(v.vt(), dst, a1 as usize) };
                        frame.vt_free(a1 as u32);
                    }
                    Opcode::Initobj => {
                        let addr = pop!();
                        let dst = deref!(addr);
                        unsafe { ptr::write_bytes(dst, 0, a1 as usize) };
                    }

                    Opcode::Newarr => {
                        let elem = item!(Type, a1);
                        let len = pop!().i64();
                        if len < 0 || len > i32::MAX as i64 {
                            raise!(OverflowException, &format!("array length {len} is out of range"));
                        }
                        let Some(array) = heap.alloc_array(elem.clone(), md.size_of(&elem).max(1), len as usize) else {
                            raise!(OutOfMemoryException, &format!("cannot allocate an array of {len} elements"));
                        };
                        frame.push(StackValue::Ref(array));
                    }
                    Opcode::Ldlen => {
                        let array = pop!().obj();
                        let Some(len) = heap.get(array).and_then(|o| o.array_len()) else {
                            raise!(NullReferenceException, "array reference not set");
                        };
                        frame.push(StackValue::I64(len as i64));
                    }
                    Opcode::Ldelema => {
                        let index = pop!().i64();
                        let array = pop!().obj();
                        let Some(object) = heap.get(array) else {
                            raise!(NullReferenceException, "array reference not set");
                        };
                        let Some(p) = object.element(index) else {
                            raise!(IndexOutOfRangeException, "index was outside the bounds of the array");
                        };
                        frame.push(StackValue::Ptr(p));
                    }

                    Opcode::Box => {
                        let class = item!(Class, a1);
                        let Some(mint) = MintType::from_u16(a2) else {
                            return Err(invalid(&method, ip, "bad storage type operand"));
                        };
                        let v = pop!();
                        let obj = heap.alloc_instance(class, md.class(class).instance_size.max(8));
                        if let Some(o) = heap.get(obj) {
                            unsafe { store(mint, o.data(), v) };
                        }
                        frame.push(StackValue::Ref(obj));
                    }
                    Opcode::BoxVt => {
                        let class = item!(Class, a1);
                        let v = pop!();
                        let obj = heap.alloc_instance(class, md.class(class).instance_size.max(a2 as u32));
                        if let Some(o) = heap.get(obj) {
                            unsafe { ptr::copy_nonoverlapping(v.vt(), o.data(), a2 as usize) };
                        }
                        frame.vt_free(a2 as u32);
                        frame.push(StackValue::Ref(obj));
                    }
                    Opcode::UnboxAny | Opcode::UnboxAnyVt => {
                        let class = item!(Class, a1);
                        let obj = pop!().obj();
                        let Some(object) = heap.get(obj) else {
                            raise!(NullReferenceException, "cannot unbox null");
                        };
                        if object.class() != class {
                            raise!(
                                InvalidCastException,
                                &format!(
                                    "cannot unbox {} as {}",
                                    md.class(object.class()).name,
                                    md.class(class).name
                                )
                            );
                        }
                        if op == Opcode::UnboxAnyVt {
                            let dst = frame.vt_alloc(a2 as u32);
                            unsafe { ptr::copy_nonoverlapping(object.data(), dst, a2 as usize) };
                            frame.push(StackValue::Vt(dst));
                        } else {
                            let Some(mint) = MintType::from_u16(a2) else {
                                return Err(invalid(&method, ip, "bad storage type operand"));
                            };
                            frame.push(unsafe { load(mint, object.data()) });
                        }
                    }
                    Opcode::Castclass | Opcode::Isinst => {
                        let ty = item!(Type, a1);
                        let obj = pop!().obj();
                        if obj.is_null() || rt.is_instance(obj, &ty) {
                            frame.push(StackValue::Ref(obj));
                        } else if op == Opcode::Isinst {
                            frame.push(StackValue::NULL);
                        } else {
                            let from = heap.get(obj).map_or("?", |o| md.class(o.class()).name.as_str());
                            raise!(
                                InvalidCastException,
                                &format!("cannot cast {from} to {}", md.type_name(&ty))
                            );
                        }
                    }
                    Opcode::Strlen => {
                        let s = pop!().obj();
                        let Some(chars) = heap.get(s).and_then(|o| o.chars()) else {
                            raise!(NullReferenceException, "string reference not set");
                        };
                        frame.push(StackValue::I32(chars.len() as i32));
                    }
                    Opcode::Getchr => {
                        let index = pop!().i32();
                        let s = pop!().obj();
                        let Some(chars) = heap.get(s).and_then(|o| o.chars()) else {
                            raise!(NullReferenceException, "string reference not set");
                        };
                        let Some(&c) = usize::try_from(index).ok().and_then(|i| chars.get(i)) else {
                            raise!(IndexOutOfRangeException, "index was outside the bounds of the string");
                        };
                        frame.push(StackValue::I32(c as i32));
                    }

                    Opcode::Call => {
                        let handle = item!(Method, a1);
                        if let Some(ex) = self.call(frame, handle, ip)? {
                            throw!(ex);
                        }
                    }
                    Opcode::Callvirt => {
                        let handle = item!(Method, a1);
                        let Some(handle) = self.dispatch(frame, handle)? else {
                            raise!(NullReferenceException, "object reference not set");
                        };
                        if let Some(ex) = self.call(frame, handle, ip)? {
                            throw!(ex);
                        }
                    }
                    Opcode::Ckthis => {
                        let this = frame.peek(a1 as usize)?;
                        if self.address_of(this).is_none() {
                            raise!(NullReferenceException, "object reference not set");
                        }
                    }
                    Opcode::Newobj | Opcode::NewobjVt => {
                        let handle = item!(Method, a1);
                        let size = (op == Opcode::NewobjVt).then_some(a2 as u32);
                        if let Some(ex) = self.new_object(frame, handle, size, ip)? {
                            throw!(ex);
                        }
                    }
                    Opcode::TailCall | Opcode::Jmp => {
                        let handle = item!(Method, a1);
                        let transfer = if op == Opcode::Jmp {
                            self.jmp(frame, handle)?
                        } else {
                            self.tail_call(frame, handle, ip)?
                        };
                        match transfer {
                            Transfer::Reload => continue 'reload,
                            Transfer::Done => return Ok(()),
                            Transfer::Threw(ex) => throw!(ex),
                        }
                    }
                    Opcode::Vtresult => {
                        let (ret_size, args_size) = (a1 as u32, a2 as u32);
                        if ret_size > 0 {
                            let base = method.vt_offset();
                            let src = base + frame.vt_sp - ret_size;
                            let dst = src - args_size;
                            let mem = frame.mem_ptr();
                            unsafe { ptr::copy(mem.add(src as usize), mem.add(dst as usize), ret_size as usize) };
                            frame.set_top(0, StackValue::Vt(unsafe { mem.add(dst as usize) }));
                        }
                        frame.vt_free(args_size);
                    }

                    Opcode::Ret => {
                        frame.result = Some(pop!());
                        return Ok(());
                    }
                    Opcode::RetVoid => {
                        frame.result = None;
                        return Ok(());
                    }
                    Opcode::RetVt => {
                        let v = pop!();
                        if !frame.retval.is_null() {
                            unsafe { ptr::copy(v.vt(), frame.retval, a1 as usize) };
                        }
                        frame.vt_free(a1 as u32);
                        frame.result = None;
                        return Ok(());
                    }

                    Opcode::Br => jump!(long_delta!()),
                    Opcode::BrS => jump!(short_delta!()),
                    Opcode::BeqO | Opcode::BeqOS | Opcode::BneUnO | Opcode::BneUnOS => {
                        let b = pop!().obj();
                        let a = pop!().obj();
                        let eq = matches!(op, Opcode::BeqO | Opcode::BeqOS);
                        if (a == b) == eq {
                            if matches!(op, Opcode::BeqOS | Opcode::BneUnOS) {
                                jump!(short_delta!());
                            } else {
                                jump!(long_delta!());
                            }
                        }
                    }
                    Opcode::Switch => {
                        let index = pop!().i32() as u32;
                        let count = read_u32(code, ip + 1);
                        if index < count {
                            jump!(read_i32(code, ip + 3 + 2 * index as usize));
                        }
                    }
                    Opcode::Leave | Opcode::LeaveS => {
                        let delta = if op == Opcode::LeaveS {
                            short_delta!()
                        } else {
                            long_delta!()
                        };
                        let target = (ip as isize + delta) as usize;
                        match self.leave(frame, ip, target)? {
                            Some(next) => {
                                ip = next;
                                continue;
                            }
                            None => return Ok(()),
                        }
                    }
                    Opcode::EndFinally => {
                        frame.active.pop();
                        frame.clear_stacks();
                        match self.resume(frame)? {
                            Some(next) => {
                                ip = next;
                                continue;
                            }
                            None => return Ok(()),
                        }
                    }
                    Opcode::EndFilter => {
                        let verdict = pop!().i32();
                        frame.result = Some(StackValue::I32(verdict));
                        return Ok(());
                    }
                    Opcode::Throw => {
                        let ex = pop!().obj();
                        if ex.is_null() {
                            raise!(NullReferenceException, "thrown object is null");
                        }
                        throw!(ex);
                    }
                    Opcode::Rethrow => {
                        let Some(ex) = frame.active.iter().rev().find_map(|h| h.exception) else {
                            return Err(invalid(&method, ip, "rethrow outside a catch handler"));
                        };
                        throw!(ex);
                    }

                    Opcode::NegI4 => {
                        let v = pop!().i32();
                        frame.push(StackValue::I32(v.wrapping_neg()));
                    }
                    Opcode::NegI8 => {
                        let v = pop!().i64();
                        frame.push(StackValue::I64(v.wrapping_neg()));
                    }
                    Opcode::NegR8 => {
                        let v = pop!().f64();
                        frame.push(StackValue::F64(-v));
                    }
                    Opcode::NotI4 => {
                        let v = pop!().i32();
                        frame.push(StackValue::I32(!v));
                    }
                    Opcode::NotI8 => {
                        let v = pop!().i64();
                        frame.push(StackValue::I64(!v));
                    }
                    Opcode::CeqO | Opcode::CgtUnO | Opcode::CltUnO => {
                        let b = pop!().obj().addr();
                        let a = pop!().obj().addr();
                        let r = match op {
                            Opcode::CeqO => a == b,
                            Opcode::CgtUnO => a > b,
                            _ => a < b,
                        };
                        frame.push(StackValue::I32(r as i32));
                    }

                    Opcode::ConvI4
                    | Opcode::ConvI8
                    | Opcode::ConvR8
                    | Opcode::ConvOvfI4
                    | Opcode::ConvOvfI8
                    | Opcode::ConvOvfR8
                    | Opcode::ConvOvfUnI4
                    | Opcode::ConvOvfUnI8 => {
                        let Some(target) = conv_target(a1) else {
                            return Err(invalid(&method, ip, "bad conversion target"));
                        };
                        let v = pop!();
                        let src = match op {
                            Opcode::ConvI4 | Opcode::ConvOvfI4 | Opcode::ConvOvfUnI4 => Src::I4(v.i32()),
                            Opcode::ConvI8 | Opcode::ConvOvfI8 | Opcode::ConvOvfUnI8 => Src::I8(v.i64()),
                            _ => Src::R8(v.f64()),
                        };
                        let result = match op {
                            Opcode::ConvI4 | Opcode::ConvI8 | Opcode::ConvR8 => Some(conv(target, src)),
                            Opcode::ConvOvfUnI4 | Opcode::ConvOvfUnI8 => conv_ovf(target, src, true),
                            _ => conv_ovf(target, src, false),
                        };
                        match result {
                            Some(v) => frame.push(v),
                            None => raise!(OverflowException, "conversion overflowed"),
                        }
                    }
                    Opcode::WidenI4Under => {
                        let v = frame.peek(1)?.i32();
                        frame.set_top(1, StackValue::I64(v as i64));
                    }
                    Opcode::Ckfinite => {
                        if !frame.peek(0)?.f64().is_finite() {
                            raise!(ArithmeticException, "number is not finite");
                        }
                    }

                    other => return Err(invalid(&method, ip, &format!("unexpected opcode {}", other.name()))),
                }
                ip = next;
            }
        }
    }

    /// Address behind a field receiver or pointer, `None` for null.
    fn address_of(&self, v: StackValue) -> Option<*mut u8> {
        match v {
            StackValue::Ref(r) => self.rt.heap().get(r).map(|o| o.data()),
            StackValue::Ptr(p) | StackValue::Vt(p) => (!p.is_null()).then_some(p),
            StackValue::I64(n) => (n != 0).then_some(n as usize as *mut u8),
            StackValue::I32(_) | StackValue::F64(_) => None,
        }
    }

    // =========================================================================
    // Calls
    // =========================================================================

    /// Call `handle` with the arguments on top of `frame`'s stack. Returns
    /// the exception if the callee threw.
    fn call(&self, frame: &mut Frame<'_>, handle: MethodHandle, ip: usize) -> Result<Option<ObjRef>, VmError> {
        let callee = self.rt.methods().get(handle);
        let n = callee.arg_count();
        let Some(start) = frame.stack.len().checked_sub(n) else {
            return Err(VmError::StackUnderflow {
                method: frame.method.name.clone(),
                offset: ip,
            });
        };
        let retbuf = match callee.ret {
            RetKind::Vt(size) => frame.vt_alloc(size),
            _ => ptr::null_mut(),
        };
        frame.link.publish(ip, &frame.stack);
        let outcome = self.invoke(handle, &frame.stack[start..], retbuf, Some(frame.link))?;
        frame.stack.truncate(start);
        match outcome {
            Outcome::Returned(value) => {
                match callee.ret {
                    RetKind::Void => {}
                    RetKind::Value(_) => match value {
                        Some(v) => frame.push(v),
                        None => {
                            return Err(VmError::InvalidProgram {
                                method: callee.name.clone(),
                                offset: 0,
                                reason: "returned no value".into(),
                            });
                        }
                    },
                    RetKind::Vt(_) => frame.push(StackValue::Vt(retbuf)),
                }
                Ok(None)
            }
            Outcome::Threw(ex) => {
                if let RetKind::Vt(size) = callee.ret {
                    frame.vt_free(size);
                }
                Ok(Some(ex))
            }
        }
    }

    /// Resolve a virtual call against its receiver. `None` for a null
    /// receiver.
    fn dispatch(&self, frame: &Frame<'_>, handle: MethodHandle) -> Result<Option<MethodHandle>, VmError> {
        let rt = self.rt;
        let callee = rt.methods().get(handle);
        let n = callee.arg_count();
        let this = frame.peek(n.saturating_sub(1))?;
        let StackValue::Ref(receiver) = this else {
            return Ok(Some(handle));
        };
        let Some(object) = rt.heap().get(receiver) else {
            return Ok(None);
        };
        let md = rt.metadata();
        let target = md.resolve_virtual(callee.id, object.class());
        if target == callee.id {
            return Ok(Some(handle));
        }
        Ok(Some(rt.methods().resolve(md, target, &callee.ctx.method_inst)))
    }

    /// `newobj`: allocate, run the constructor, push the new instance.
    /// `vt_size` is set for value types, which are built on the value-type
    /// stack.
    fn new_object(
        &self,
        frame: &mut Frame<'_>,
        ctor: MethodHandle,
        vt_size: Option<u32>,
        ip: usize,
    ) -> Result<Option<ObjRef>, VmError> {
        let rt = self.rt;
        let callee = rt.methods().get(ctor);
        let n = callee.arg_count().saturating_sub(1);
        let Some(start) = frame.stack.len().checked_sub(n) else {
            return Err(VmError::StackUnderflow {
                method: frame.method.name.clone(),
                offset: ip,
            });
        };
        let owner = rt.metadata().method(callee.id).owner;
        let (this, result) = match vt_size {
            Some(size) => {
                let buf = frame.vt_alloc(size);
                unsafe { ptr::write_bytes(buf, 0, size as usize) };
                (StackValue::Ptr(buf), StackValue::Vt(buf))
            }
            None => {
                let obj = rt
                    .heap()
                    .alloc_instance(owner, rt.metadata().class(owner).instance_size);
                (StackValue::Ref(obj), StackValue::Ref(obj))
            }
        };
        let mut args = Vec::with_capacity(n + 1);
        args.push(this);
        args.extend_from_slice(&frame.stack[start..]);
        frame.link.publish(ip, &frame.stack);
        let outcome = self.invoke(ctor, &args, ptr::null_mut(), Some(frame.link))?;
        frame.stack.truncate(start);
        match outcome {
            Outcome::Returned(_) => {
                frame.push(result);
                Ok(None)
            }
            Outcome::Threw(ex) => {
                if let Some(size) = vt_size {
                    frame.vt_free(size);
                }
                Ok(Some(ex))
            }
        }
    }

    /// Replace the running method of `frame` with an IL target, keeping the
    /// frame chain depth unchanged.
    fn become_method(&self, frame: &mut Frame<'_>, target: Arc<CompiledMethod>, args: &[StackValue]) {
        let words = target.mem_size().div_ceil(8);
        let old = std::mem::replace(&mut frame.mem, vec![0u64; words].into_boxed_slice());
        frame.method = target;
        // Value-type arguments still point into the old block.
        frame.store_args(args);
        drop(old);
        frame.link.set_method(&frame.method);
        frame.clear_stacks();
        frame.continuations.clear();
        frame.active.clear();
        frame.ex = None;
        frame.ip = 0;
    }

    fn tail_call(&self, frame: &mut Frame<'_>, handle: MethodHandle, ip: usize) -> Result<Transfer, VmError> {
        let rt = self.rt;
        if self.ctx.take_interrupt() {
            return Ok(Transfer::Threw(
                rt.new_exception(WellKnown::ThreadInterruptedException, "thread interrupted"),
            ));
        }
        let callee = rt.methods().get(handle);
        let n = callee.arg_count();
        let Some(start) = frame.stack.len().checked_sub(n) else {
            return Err(VmError::StackUnderflow {
                method: frame.method.name.clone(),
                offset: ip,
            });
        };
        let args: Vec<StackValue> = frame.stack[start..].to_vec();
        if matches!(rt.metadata().method(callee.id).imp, MethodImpl::Il(_)) {
            let target = rt.compiled(&callee)?;
            self.become_method(frame, target, &args);
            return Ok(Transfer::Reload);
        }
        frame.link.publish(ip, &frame.stack);
        let outcome = self.invoke(handle, &args, frame.retval, Some(frame.link))?;
        Ok(self.finish_transfer(frame, outcome))
    }

    fn jmp(&self, frame: &mut Frame<'_>, handle: MethodHandle) -> Result<Transfer, VmError> {
        let rt = self.rt;
        let callee = rt.methods().get(handle);
        let current = Arc::clone(&frame.method);
        let mut args = Vec::with_capacity(current.args.len());
        for slot in current.args.iter() {
            let p = frame.slot(slot.offset as u16);
            args.push(match slot.mint {
                MintType::Vt => StackValue::Vt(p),
                mint => unsafe { load(mint, p) },
            });
        }
        if args.len() != callee.arg_count() {
            return Err(VmError::ArgumentMismatch {
                method: callee.name.clone(),
                reason: format!("jmp from {} with a different signature", current.name),
            });
        }
        if matches!(rt.metadata().method(callee.id).imp, MethodImpl::Il(_)) {
            let target = rt.compiled(&callee)?;
            self.become_method(frame, target, &args);
            return Ok(Transfer::Reload);
        }
        frame.link.publish(frame.ip, &frame.stack);
        let outcome = self.invoke(handle, &args, frame.retval, Some(frame.link))?;
        Ok(self.finish_transfer(frame, outcome))
    }

    fn finish_transfer(&self, frame: &mut Frame<'_>, outcome: Outcome) -> Transfer {
        match outcome {
            Outcome::Returned(value) => {
                frame.result = value;
                Transfer::Done
            }
            Outcome::Threw(ex) => Transfer::Threw(ex),
        }
    }

    // =========================================================================
    // Exception handling
    // =========================================================================

    /// Start unwinding `ex` thrown at `throw_ip`. Returns where execution
    /// resumes in this frame, or `None` when the exception leaves it.
    /// `resume_after` restarts the clause search past a filter that threw.
    fn unwind(
        &self,
        frame: &mut Frame<'_>,
        ex: ObjRef,
        throw_ip: usize,
        resume_after: Option<usize>,
    ) -> Result<Option<usize>, VmError> {
        let method = Arc::clone(&frame.method);
        debug!(
            target: "mintvm::unwind",
            method = %method.name,
            ip = throw_ip,
            exception = %self.rt.class_name_of(ex),
            "throw"
        );
        if frame.is_filter {
            // Exceptions inside a filter are the owning frame's business.
            frame.ex = Some(ex);
            return Ok(None);
        }

        let ip = throw_ip as u32;
        let start = resume_after.map_or(0, |i| i + 1);
        let mut found = None;
        for (i, clause) in method.clauses.iter().enumerate().skip(start) {
            if !clause.try_contains(ip) {
                continue;
            }
            match &clause.kind {
                ClauseKind::Catch(ty) => {
                    if self.rt.is_instance(ex, ty) {
                        found = Some(i);
                        break;
                    }
                }
                ClauseKind::Filter { filter_start } => match self.run_filter(frame, ex, throw_ip, *filter_start)? {
                    Ok(true) => {
                        found = Some(i);
                        break;
                    }
                    Ok(false) => {}
                    Err(nested) => {
                        debug!(target: "mintvm::unwind", method = %method.name, clause = i, "filter threw");
                        return self.unwind(frame, nested, throw_ip, Some(i));
                    }
                },
                ClauseKind::Finally | ClauseKind::Fault => {}
            }
        }

        // Handlers the exception escapes are abandoned along with the work
        // they queued.
        while let Some(active) = frame.active.last().copied() {
            let running = &method.clauses[active.clause as usize];
            let caught_inside = found.is_some_and(|h| running.handler_contains(method.clauses[h].try_start));
            if caught_inside {
                break;
            }
            frame.active.pop();
            frame.continuations.truncate(active.base);
        }

        let limit = found.unwrap_or(method.clauses.len());
        let finallies: Vec<usize> = (0..limit)
            .filter(|&i| method.clauses[i].is_finally_like() && method.clauses[i].try_contains(ip))
            .collect();

        frame.clear_stacks();
        let base = match found {
            Some(h) => {
                debug!(target: "mintvm::unwind", method = %method.name, clause = h, finally = finallies.len(), "handler found");
                let base = frame.continuations.len();
                frame.continuations.push(Continuation::EnterHandler {
                    clause: h as u16,
                    exception: ex,
                });
                base
            }
            None => {
                debug!(target: "mintvm::unwind", method = %method.name, finally = finallies.len(), "exception leaves frame");
                frame.continuations.clear();
                frame.active.clear();
                frame.continuations.push(Continuation::ExitFrame { exception: ex });
                0
            }
        };
        // Innermost handler on top.
        for &i in finallies.iter().rev() {
            frame.continuations.push(Continuation::RunFinally { clause: i as u16, base });
        }
        frame.ex = Some(ex);
        self.resume(frame)
    }

    /// Evaluate a filter expression in a nested frame that shares the
    /// locals of `frame`. `Err` carries an exception the filter threw.
    fn run_filter(
        &self,
        frame: &mut Frame<'_>,
        ex: ObjRef,
        throw_ip: usize,
        filter_start: u32,
    ) -> Result<Result<bool, ObjRef>, VmError> {
        let method = Arc::clone(&frame.method);
        frame.link.publish(throw_ip, &frame.stack);
        let link = FrameLink::new(Some(frame.link), &method);
        let _guard = self.ctx.enter(&link);
        let mut child = Frame::new(&link, Arc::clone(&method), ptr::null_mut());
        let shared = child.mem.len().min(frame.mem.len());
        child.mem[..shared].copy_from_slice(&frame.mem[..shared]);
        child.is_filter = true;
        child.ip = filter_start as usize;
        child.push(StackValue::Ref(ex));
        self.run(&mut child)?;
        frame.mem[..shared].copy_from_slice(&child.mem[..shared]);
        Ok(match child.ex {
            Some(nested) => Err(nested),
            None => Ok(child.result.is_some_and(|v| v.i32() != 0)),
        })
    }

    /// `leave`: exit catch handlers and protected regions toward `target`,
    /// running the finally handlers in between.
    fn leave(&self, frame: &mut Frame<'_>, ip: usize, target: usize) -> Result<Option<usize>, VmError> {
        let method = Arc::clone(&frame.method);
        let (from, to) = (ip as u32, target as u32);
        frame.clear_stacks();
        while let Some(active) = frame.active.last().copied() {
            let clause = &method.clauses[active.clause as usize];
            if clause.is_finally_like() || !clause.handler_contains(from) || clause.handler_contains(to) {
                break;
            }
            frame.active.pop();
        }
        let finallies: Vec<usize> = method
            .clauses
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c.kind, ClauseKind::Finally) && c.try_contains(from) && !c.try_contains(to))
            .map(|(i, _)| i)
            .collect();
        if finallies.is_empty() {
            return Ok(Some(target));
        }
        let base = frame.continuations.len();
        frame.continuations.push(Continuation::Resume(to));
        for &i in finallies.iter().rev() {
            frame.continuations.push(Continuation::RunFinally { clause: i as u16, base });
        }
        self.resume(frame)
    }

    /// Take the next queued continuation.
    fn resume(&self, frame: &mut Frame<'_>) -> Result<Option<usize>, VmError> {
        let method = Arc::clone(&frame.method);
        match frame.continuations.pop() {
            Some(Continuation::Resume(target)) => Ok(Some(target as usize)),
            Some(Continuation::RunFinally { clause, base }) => {
                debug!(target: "mintvm::unwind", method = %method.name, clause, "run finally");
                frame.active.push(ActiveHandler {
                    clause,
                    base,
                    exception: None,
                });
                Ok(Some(method.clauses[clause as usize].handler_start as usize))
            }
            Some(Continuation::EnterHandler { clause, exception }) => {
                frame.ex = None;
                frame.push(StackValue::Ref(exception));
                frame.active.push(ActiveHandler {
                    clause,
                    base: frame.continuations.len(),
                    exception: Some(exception),
                });
                Ok(Some(method.clauses[clause as usize].handler_start as usize))
            }
            Some(Continuation::ExitFrame { exception }) => {
                frame.ex = Some(exception);
                Ok(None)
            }
            None => Err(VmError::EndFinallyWithoutContinuation {
                method: method.name.clone(),
                offset: frame.ip,
            }),
        }
    }
}

fn check_shape(frame: &Frame<'_>, method: &CompiledMethod, ip: usize) -> Result<(), VmError> {
    if let Some(Some(shape)) = method.shapes.get(ip) {
        if shape.height as usize != frame.stack.len() || shape.vt != frame.vt_sp {
            return Err(VmError::StackImbalance {
                method: method.name.clone(),
                offset: ip,
                expected: shape.height as usize,
                expected_vt: shape.vt as usize,
                found: frame.stack.len(),
                found_vt: frame.vt_sp as usize,
            });
        }
    }
    Ok(())
}

fn invalid(method: &CompiledMethod, ip: usize, reason: &str) -> VmError {
    VmError::InvalidProgram {
        method: method.name.clone(),
        offset: ip,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_int_division_faults() {
        assert_eq!(binop_i32(BinOp::Div, 7, 0), Err(ArithError::DivideByZero));
        assert_eq!(binop_i32(BinOp::Div, i32::MIN, -1), Err(ArithError::Overflow));
        assert_eq!(binop_i32(BinOp::Rem, i32::MIN, -1), Err(ArithError::Overflow));
        assert_eq!(binop_i64(BinOp::RemUn, -1, 10), Ok(5));
        assert_eq!(binop_i32(BinOp::DivUn, -2, 2), Ok(i32::MAX));
    }

    #[test]
    fn test_checked_arithmetic() {
        assert_eq!(binop_i32(BinOp::AddOvf, i32::MAX, 1), Err(ArithError::Overflow));
        assert_eq!(binop_i32(BinOp::Add, i32::MAX, 1), Ok(i32::MIN));
        assert_eq!(binop_i32(BinOp::SubOvfUn, 0, 1), Err(ArithError::Overflow));
        assert_eq!(binop_i64(BinOp::MulOvfUn, -1, 1), Ok(-1));
        assert_eq!(binop_i64(BinOp::MulOvf, i64::MAX, 2), Err(ArithError::Overflow));
    }

    #[test]
    fn test_shifts() {
        assert_eq!(binop_i32(BinOp::Shr, -8, 1), Ok(-4));
        assert_eq!(binop_i32(BinOp::ShrUn, -8, 28), Ok(15));
        assert_eq!(binop_i64(BinOp::Shl, 1, 40), Ok(1 << 40));
    }

    #[test]
    fn test_unordered_float_conditions() {
        let (nan, one) = (StackValue::F64(f64::NAN), StackValue::F64(1.0));
        // bge.un and blt.un both hold for unordered operands
        assert!(condition(Width::R8, 3, nan, one));
        assert!(condition(Width::R8, 9, nan, one));
        assert!(!condition(Width::R8, 2, nan, one));
        assert!(compare(Width::R8, 2, nan, one));
        assert!(!compare(Width::R8, 1, nan, one));
    }

    #[test]
    fn test_unsigned_int_conditions() {
        let (neg, one) = (StackValue::I32(-1), StackValue::I32(1));
        assert!(condition(Width::I4, 4, one, neg));
        assert!(condition(Width::I4, 5, neg, one));
        assert!(compare(Width::I4, 4, neg, one));
    }

    #[test]
    fn test_family_offsets() {
        assert_eq!(family(Opcode::SubI8, Opcode::AddI8, Opcode::MulOvfUnI8), Some(1));
        assert_eq!(family(Opcode::AddI4, Opcode::AddI8, Opcode::MulOvfUnI8), None);
        assert_eq!(BINOPS[family(Opcode::ShrUnI4, Opcode::AddI4, Opcode::MulOvfUnI4).unwrap()], BinOp::ShrUn);
        assert_eq!(family(Opcode::BltUnR8S, Opcode::BeqI4, Opcode::BltUnR8S), Some(59));
    }
}
