//! Numeric conversions behind the `conv.*` instruction families.

use crate::il::ConvTarget;

use super::value::StackValue;

/// Operand of a conversion, as found on the evaluation stack.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Src {
    I4(i32),
    I8(i64),
    R8(f64),
}

const TARGETS: [ConvTarget; 13] = [
    ConvTarget::I1,
    ConvTarget::U1,
    ConvTarget::I2,
    ConvTarget::U2,
    ConvTarget::I4,
    ConvTarget::U4,
    ConvTarget::I8,
    ConvTarget::U8,
    ConvTarget::I,
    ConvTarget::U,
    ConvTarget::R4,
    ConvTarget::R8,
    ConvTarget::RUn,
];

/// Decode the target operand word of a conversion.
pub fn conv_target(word: u16) -> Option<ConvTarget> {
    TARGETS.get(word as usize).copied()
}

/// Inclusive integer range of a target, or `None` for float targets.
fn bounds(target: ConvTarget) -> Option<(i128, i128)> {
    Some(match target {
        ConvTarget::I1 => (i8::MIN as i128, i8::MAX as i128),
        ConvTarget::U1 => (0, u8::MAX as i128),
        ConvTarget::I2 => (i16::MIN as i128, i16::MAX as i128),
        ConvTarget::U2 => (0, u16::MAX as i128),
        ConvTarget::I4 => (i32::MIN as i128, i32::MAX as i128),
        ConvTarget::U4 => (0, u32::MAX as i128),
        ConvTarget::I8 | ConvTarget::I => (i64::MIN as i128, i64::MAX as i128),
        ConvTarget::U8 | ConvTarget::U => (0, u64::MAX as i128),
        ConvTarget::R4 | ConvTarget::R8 | ConvTarget::RUn => return None,
    })
}

/// Narrow an in-range or wrapped integer to the slot the target lives in.
fn narrow(target: ConvTarget, v: i128) -> StackValue {
    match target {
        ConvTarget::I1 => StackValue::I32(v as i8 as i32),
        ConvTarget::U1 => StackValue::I32(v as u8 as i32),
        ConvTarget::I2 => StackValue::I32(v as i16 as i32),
        ConvTarget::U2 => StackValue::I32(v as u16 as i32),
        ConvTarget::I4 | ConvTarget::U4 => StackValue::I32(v as i32),
        ConvTarget::I8 | ConvTarget::U8 | ConvTarget::I | ConvTarget::U => StackValue::I64(v as i64),
        ConvTarget::R4 => StackValue::F64(v as f32 as f64),
        ConvTarget::R8 | ConvTarget::RUn => StackValue::F64(v as f64),
    }
}

/// Unchecked conversion. Integers truncate, floats saturate toward the
/// target range and NaN becomes zero.
pub fn conv(target: ConvTarget, src: Src) -> StackValue {
    match src {
        Src::I4(v) => match target {
            // Unsigned widening of a 32-bit value zero-extends
            ConvTarget::U8 | ConvTarget::U => StackValue::I64(v as u32 as i64),
            ConvTarget::RUn => StackValue::F64(v as u32 as f64),
            _ => narrow(target, v as i128),
        },
        Src::I8(v) => match target {
            ConvTarget::RUn => StackValue::F64(v as u64 as f64),
            _ => narrow(target, v as i128),
        },
        Src::R8(f) => match target {
            ConvTarget::R4 => StackValue::F64(f as f32 as f64),
            ConvTarget::R8 | ConvTarget::RUn => StackValue::F64(f),
            ConvTarget::U8 | ConvTarget::U => StackValue::I64(f as u64 as i64),
            ConvTarget::U4 => StackValue::I32(f as u32 as i32),
            _ => narrow(target, f as i64 as i128),
        },
    }
}

/// Checked conversion; `None` when the value does not fit the target.
/// `unsigned` reads an integer source as unsigned.
pub fn conv_ovf(target: ConvTarget, src: Src, unsigned: bool) -> Option<StackValue> {
    let value = match src {
        Src::I4(v) if unsigned => v as u32 as i128,
        Src::I4(v) => v as i128,
        Src::I8(v) if unsigned => v as u64 as i128,
        Src::I8(v) => v as i128,
        Src::R8(f) => {
            let Some((lo, hi)) = bounds(target) else {
                return Some(conv(target, src));
            };
            if f.is_nan() {
                return None;
            }
            let t = f.trunc();
            if t < lo as f64 || t >= hi as f64 + 1.0 {
                return None;
            }
            return Some(narrow(target, t as i128));
        }
    };
    match bounds(target) {
        Some((lo, hi)) if value < lo || value > hi => None,
        Some(_) => Some(narrow(target, value)),
        None => Some(StackValue::F64(match target {
            ConvTarget::R4 => value as f32 as f64,
            _ => value as f64,
        })),
    }
}
