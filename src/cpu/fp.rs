//! RV32F single-precision floating point.
//!
//! Everything whose result or exception flags depend on the rounding mode
//! goes through `simple_soft_float`, with the effective mode passed per
//! operation and the accumulated `FPState` flags folded into fflags
//! afterwards. The host floating-point environment is never touched.
//! Sign injection, min/max, classification, and the register moves are
//! plain bit manipulation.

use crate::cpu::{Cpu, Trap, TrapType};
use crate::decode::{Decoded, DecoderBuilder, Entry, Key};
use crate::memory::AccessWidth;
use num_derive::FromPrimitive;
use simple_soft_float::{F32, FPState, RoundingMode, StatusFlags};
use std::cmp::Ordering;
use std::fmt::Write as _;

use super::{dump_x, fname};

/// A single is NaN-boxed in the upper half of the 64-bit register cell.
pub const NAN_BOX_F32: u64 = 0xffff_ffff_0000_0000;

/// The canonical quiet NaN produced for any improperly boxed operand.
pub const CANONICAL_NAN_F32: u32 = 0x7fc0_0000;

pub const FFLAGS_NX: u8 = 0x01;
pub const FFLAGS_UF: u8 = 0x02;
pub const FFLAGS_OF: u8 = 0x04;
pub const FFLAGS_DZ: u8 = 0x08;
pub const FFLAGS_NV: u8 = 0x10;

const MANT_SIZE32: u32 = 23;
const EXP_MASK32: u32 = 0xff;
const MANT_MASK32: u32 = (1 << MANT_SIZE32) - 1;
const QNAN_MASK32: u32 = 1 << (MANT_SIZE32 - 1);
const SIGN_MASK32: u32 = 1 << 31;

/// Bit positions of the fclass.s result mask.
#[derive(Copy, Clone, PartialEq, Eq, Debug, FromPrimitive)]
pub enum Fclass {
    Ninf,
    Nnormal,
    Nsubnormal,
    Nzero,
    Pzero,
    Psubnormal,
    Pnormal,
    Pinf,
    Snan,
    Qnan,
}

#[must_use]
pub const fn fclass_f32(a: u32) -> Fclass {
    let a_sign = a >> 31;
    let a_exp = (a >> MANT_SIZE32) & EXP_MASK32;
    let a_mant = a & MANT_MASK32;
    if a_exp == EXP_MASK32 {
        if a_mant != 0 {
            if a_mant & QNAN_MASK32 != 0 {
                Fclass::Qnan
            } else {
                Fclass::Snan
            }
        } else if a_sign != 0 {
            Fclass::Ninf
        } else {
            Fclass::Pinf
        }
    } else if a_exp == 0 {
        if a_mant == 0 {
            if a_sign != 0 {
                Fclass::Nzero
            } else {
                Fclass::Pzero
            }
        } else if a_sign != 0 {
            Fclass::Nsubnormal
        } else {
            Fclass::Psubnormal
        }
    } else if a_sign != 0 {
        Fclass::Nnormal
    } else {
        Fclass::Pnormal
    }
}

const fn is_nan_f32(a: u32) -> bool {
    (a >> MANT_SIZE32) & EXP_MASK32 == EXP_MASK32 && a & MANT_MASK32 != 0
}

const fn is_signaling_nan_f32(a: u32) -> bool {
    is_nan_f32(a) && a & QNAN_MASK32 == 0
}

impl Cpu {
    /// Raw low half of an f register, boxing ignored (fsw, fmv.x.w).
    pub(crate) const fn read_f_raw(&self, r: usize) -> u32 {
        self.f_[r] as u32
    }

    /// Operand read: a value that isn't NaN-boxed reads as the canonical
    /// quiet NaN.
    pub(crate) const fn read_f_bits(&self, r: usize) -> u32 {
        if self.f_[r] & NAN_BOX_F32 == NAN_BOX_F32 {
            self.f_[r] as u32
        } else {
            CANONICAL_NAN_F32
        }
    }

    pub(crate) fn write_f_bits(&mut self, r: usize, bits: u32) {
        self.f_[r] = NAN_BOX_F32 | u64::from(bits);
    }

    fn read_f_soft(&self, r: usize) -> F32 {
        F32::from_bits(self.read_f_bits(r))
    }

    fn write_f_soft(&mut self, r: usize, v: F32) {
        self.write_f_bits(r, v.into_bits());
    }

    /// Resolves the instruction's rm field to a soft-float rounding mode.
    /// Codes 5 and 6 are illegal, as is a dynamic rm when frm holds an
    /// illegal code.
    fn effective_rm(&self, d: &Decoded) -> Result<RoundingMode, Trap> {
        let rm = if d.rm == 7 { self.read_frm() } else { d.rm };
        match rm {
            0 => Ok(RoundingMode::TiesToEven),
            1 => Ok(RoundingMode::TowardZero),
            2 => Ok(RoundingMode::TowardNegative),
            3 => Ok(RoundingMode::TowardPositive),
            4 => Ok(RoundingMode::TiesToAway),
            _ => Err(Trap {
                trap_type: TrapType::IllegalInstruction,
                value: d.word,
            }),
        }
    }

    fn apply_fp_state(&mut self, state: &FPState) {
        let flags = state.status_flags;
        let mut bits = 0;
        if flags.contains(StatusFlags::INVALID_OPERATION) {
            bits |= FFLAGS_NV;
        }
        if flags.contains(StatusFlags::DIVISION_BY_ZERO) {
            bits |= FFLAGS_DZ;
        }
        if flags.contains(StatusFlags::OVERFLOW) {
            bits |= FFLAGS_OF;
        }
        if flags.contains(StatusFlags::UNDERFLOW) {
            bits |= FFLAGS_UF;
        }
        if flags.contains(StatusFlags::INEXACT) {
            bits |= FFLAGS_NX;
        }
        if bits != 0 {
            self.add_to_fflags(bits);
        }
    }
}

/// Out-of-range fcvt.w.s results saturate: NaN and positive overflow to
/// INT32_MAX, negative overflow to INT32_MIN.
const fn saturate_i32(bits: u32) -> u32 {
    if is_nan_f32(bits) || bits & SIGN_MASK32 == 0 {
        i32::MAX as u32
    } else {
        i32::MIN as u32
    }
}

const fn saturate_u32(bits: u32) -> u32 {
    if is_nan_f32(bits) || bits & SIGN_MASK32 == 0 {
        u32::MAX
    } else {
        0
    }
}

/// IEEE-754 2008 minNum/maxNum on the unboxed operand bits: the non-NaN
/// operand wins, both NaN returns the canonical NaN, a signalling NaN
/// raises invalid, and -0 orders below +0.
fn min_max(cpu: &mut Cpu, d: &Decoded, is_min: bool) {
    let a_bits = cpu.read_f_bits(d.rs1);
    let b_bits = cpu.read_f_bits(d.rs2);
    let a = f32::from_bits(a_bits);
    let b = f32::from_bits(b_bits);

    if is_signaling_nan_f32(a_bits) || is_signaling_nan_f32(b_bits) {
        cpu.add_to_fflags(FFLAGS_NV);
    }

    let result = if a.is_nan() && b.is_nan() {
        CANONICAL_NAN_F32
    } else if a.is_nan() {
        b_bits
    } else if b.is_nan() {
        a_bits
    } else if a == 0.0 && b == 0.0 {
        // min(+0,-0) is -0 and max(+0,-0) is +0, which bitwise or/and
        // deliver directly
        if is_min {
            a_bits | b_bits
        } else {
            a_bits & b_bits
        }
    } else if (a < b) == is_min {
        a_bits
    } else {
        b_bits
    };

    cpu.write_f_bits(d.rd, result);
}

fn check_fmt(cpu: &Cpu, d: &Decoded) -> Result<(), Trap> {
    // fmt field (funct7[1:0]) must select single precision
    if d.funct7 & 3 == 0 {
        Ok(())
    } else {
        Err(cpu.reserved(d))
    }
}

// ------------------------------------------------------------------
// Disassembly formats
// ------------------------------------------------------------------

fn dump_f(s: &mut String, cpu: &Cpu, r: usize, evaluate: bool) {
    *s += fname(cpu.abi_en, r);
    if evaluate {
        let _ = write!(s, ":{:x}", cpu.read_f_raw(r));
    }
}

fn dump_format_fr(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_f(s, cpu, d.rd, evaluate);
    *s += ",";
    dump_f(s, cpu, d.rs1, evaluate);
    *s += ",";
    dump_f(s, cpu, d.rs2, evaluate);
}

fn dump_format_fr1(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_f(s, cpu, d.rd, evaluate);
    *s += ",";
    dump_f(s, cpu, d.rs1, evaluate);
}

fn dump_format_fr4(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_f(s, cpu, d.rd, evaluate);
    *s += ",";
    dump_f(s, cpu, d.rs1, evaluate);
    *s += ",";
    dump_f(s, cpu, d.rs2, evaluate);
    *s += ",";
    dump_f(s, cpu, d.rs3, evaluate);
}

fn dump_format_fi_mem(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_f(s, cpu, d.rd, evaluate);
    let _ = write!(s, ",{:x}(", d.imm_i);
    dump_x(s, cpu, d.rs1, evaluate);
    *s += ")";
}

fn dump_format_fs(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_f(s, cpu, d.rs2, evaluate);
    let _ = write!(s, ",{:x}(", d.imm_s);
    dump_x(s, cpu, d.rs1, evaluate);
    *s += ")";
}

/// x-destination, f-source (fcvt.w.s, fmv.x.w, fclass.s)
fn dump_format_xf(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rd, evaluate);
    *s += ",";
    dump_f(s, cpu, d.rs1, evaluate);
}

/// f-destination, x-source (fcvt.s.w, fmv.w.x)
fn dump_format_fx(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_f(s, cpu, d.rd, evaluate);
    *s += ",";
    dump_x(s, cpu, d.rs1, evaluate);
}

fn dump_format_fcmp(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rd, evaluate);
    *s += ",";
    dump_f(s, cpu, d.rs1, evaluate);
    *s += ",";
    dump_f(s, cpu, d.rs2, evaluate);
}

// ------------------------------------------------------------------
// Registration
// ------------------------------------------------------------------

#[allow(clippy::too_many_lines)]
pub(crate) fn register(b: &mut DecoderBuilder) {
    use Entry::{Leaf, Table};

    // LOAD-FP
    let load_fp = b.table(Key::Funct3);
    b.primary(0x07, Table(load_fp));
    let flw = b.op(
        "flw",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_i as u32);
            let v = cpu.load(addr, AccessWidth::Word)?;
            cpu.write_f_bits(d.rd, v);
            Ok(())
        },
        dump_format_fi_mem,
    );
    b.leaf(load_fp, 2, flw);

    // STORE-FP
    let store_fp = b.table(Key::Funct3);
    b.primary(0x27, Table(store_fp));
    let fsw = b.op(
        "fsw",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_s as u32);
            cpu.store(addr, cpu.read_f_raw(d.rs2), AccessWidth::Word)
        },
        dump_format_fs,
    );
    b.leaf(store_fp, 2, fsw);

    // Fused multiply-add family. Single rounding; the sign flips happen
    // on the exact operands before the fused operation.
    let fmadd = b.op(
        "fmadd.s",
        |cpu, d| {
            check_fmt(cpu, d)?;
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let r = cpu.read_f_soft(d.rs1).fused_mul_add(
                &cpu.read_f_soft(d.rs2),
                &cpu.read_f_soft(d.rs3),
                Some(rm),
                Some(&mut state),
            );
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fr4,
    );
    b.primary(0x43, Leaf(fmadd));

    let fmsub = b.op(
        "fmsub.s",
        |cpu, d| {
            check_fmt(cpu, d)?;
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let mut c = cpu.read_f_soft(d.rs3);
            c.toggle_sign();
            let r = cpu.read_f_soft(d.rs1).fused_mul_add(
                &cpu.read_f_soft(d.rs2),
                &c,
                Some(rm),
                Some(&mut state),
            );
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fr4,
    );
    b.primary(0x47, Leaf(fmsub));

    let fnmsub = b.op(
        "fnmsub.s",
        |cpu, d| {
            check_fmt(cpu, d)?;
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let mut a = cpu.read_f_soft(d.rs1);
            a.toggle_sign();
            let r = a.fused_mul_add(
                &cpu.read_f_soft(d.rs2),
                &cpu.read_f_soft(d.rs3),
                Some(rm),
                Some(&mut state),
            );
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fr4,
    );
    b.primary(0x4b, Leaf(fnmsub));

    let fnmadd = b.op(
        "fnmadd.s",
        |cpu, d| {
            check_fmt(cpu, d)?;
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let mut a = cpu.read_f_soft(d.rs1);
            a.toggle_sign();
            let mut c = cpu.read_f_soft(d.rs3);
            c.toggle_sign();
            let r = a.fused_mul_add(&cpu.read_f_soft(d.rs2), &c, Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fr4,
    );
    b.primary(0x4f, Leaf(fnmadd));

    // OP-FP: funct7 selects the operation
    let op_fp = b.table(Key::Funct7);
    b.primary(0x53, Table(op_fp));

    let fadd = b.op(
        "fadd.s",
        |cpu, d| {
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let r = cpu
                .read_f_soft(d.rs1)
                .add(&cpu.read_f_soft(d.rs2), Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fr,
    );
    b.leaf(op_fp, 0x00, fadd);

    let fsub = b.op(
        "fsub.s",
        |cpu, d| {
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let r = cpu
                .read_f_soft(d.rs1)
                .sub(&cpu.read_f_soft(d.rs2), Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fr,
    );
    b.leaf(op_fp, 0x04, fsub);

    let fmul = b.op(
        "fmul.s",
        |cpu, d| {
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let r = cpu
                .read_f_soft(d.rs1)
                .mul(&cpu.read_f_soft(d.rs2), Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fr,
    );
    b.leaf(op_fp, 0x08, fmul);

    let fdiv = b.op(
        "fdiv.s",
        |cpu, d| {
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let r = cpu
                .read_f_soft(d.rs1)
                .div(&cpu.read_f_soft(d.rs2), Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fr,
    );
    b.leaf(op_fp, 0x0c, fdiv);

    let fsqrt = b.op(
        "fsqrt.s",
        |cpu, d| {
            if d.rs2 != 0 {
                return Err(cpu.reserved(d));
            }
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let r = cpu.read_f_soft(d.rs1).sqrt(Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fr1,
    );
    b.leaf(op_fp, 0x2c, fsqrt);

    // Sign injection, keyed a fourth time on funct3
    let sgnj = b.table(Key::Funct3);
    b.set(op_fp, 0x10, Table(sgnj));
    let fsgnj = b.op(
        "fsgnj.s",
        |cpu, d| {
            let a = cpu.read_f_bits(d.rs1);
            let b = cpu.read_f_bits(d.rs2);
            cpu.write_f_bits(d.rd, a & !SIGN_MASK32 | b & SIGN_MASK32);
            Ok(())
        },
        dump_format_fr,
    );
    b.leaf(sgnj, 0, fsgnj);
    let fsgnjn = b.op(
        "fsgnjn.s",
        |cpu, d| {
            let a = cpu.read_f_bits(d.rs1);
            let b = cpu.read_f_bits(d.rs2);
            cpu.write_f_bits(d.rd, a & !SIGN_MASK32 | !b & SIGN_MASK32);
            Ok(())
        },
        dump_format_fr,
    );
    b.leaf(sgnj, 1, fsgnjn);
    let fsgnjx = b.op(
        "fsgnjx.s",
        |cpu, d| {
            let a = cpu.read_f_bits(d.rs1);
            let b = cpu.read_f_bits(d.rs2);
            cpu.write_f_bits(d.rd, a ^ b & SIGN_MASK32);
            Ok(())
        },
        dump_format_fr,
    );
    b.leaf(sgnj, 2, fsgnjx);

    // min/max
    let minmax = b.table(Key::Funct3);
    b.set(op_fp, 0x14, Table(minmax));
    let fmin = b.op(
        "fmin.s",
        |cpu, d| {
            min_max(cpu, d, true);
            Ok(())
        },
        dump_format_fr,
    );
    b.leaf(minmax, 0, fmin);
    let fmax = b.op(
        "fmax.s",
        |cpu, d| {
            min_max(cpu, d, false);
            Ok(())
        },
        dump_format_fr,
    );
    b.leaf(minmax, 1, fmax);

    // Comparisons: fle/flt signal on any NaN, feq only on signalling
    let fcmp = b.table(Key::Funct3);
    b.set(op_fp, 0x50, Table(fcmp));
    let fle = b.op(
        "fle.s",
        |cpu, d| {
            let mut state = FPState::default();
            let r = cpu
                .read_f_soft(d.rs1)
                .compare_signaling(&cpu.read_f_soft(d.rs2), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_x(
                d.rd,
                u32::from(matches!(r, Some(Ordering::Less | Ordering::Equal))),
            );
            Ok(())
        },
        dump_format_fcmp,
    );
    b.leaf(fcmp, 0, fle);
    let flt = b.op(
        "flt.s",
        |cpu, d| {
            let mut state = FPState::default();
            let r = cpu
                .read_f_soft(d.rs1)
                .compare_signaling(&cpu.read_f_soft(d.rs2), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_x(d.rd, u32::from(r == Some(Ordering::Less)));
            Ok(())
        },
        dump_format_fcmp,
    );
    b.leaf(fcmp, 1, flt);
    let feq = b.op(
        "feq.s",
        |cpu, d| {
            let mut state = FPState::default();
            let r = cpu
                .read_f_soft(d.rs1)
                .compare_quiet(&cpu.read_f_soft(d.rs2), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_x(d.rd, u32::from(r == Some(Ordering::Equal)));
            Ok(())
        },
        dump_format_fcmp,
    );
    b.leaf(fcmp, 2, feq);

    // float -> integer conversions, keyed on rs2
    let cvt_to_int = b.table(Key::Rs2);
    b.set(op_fp, 0x60, Table(cvt_to_int));
    let fcvt_w = b.op(
        "fcvt.w.s",
        |cpu, d| {
            let rm = cpu.effective_rm(d)?;
            let v = cpu.read_f_soft(d.rs1);
            let bits = cpu.read_f_bits(d.rs1);
            let mut state = FPState::default();
            let r = v.to_i32(true, Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            let out = r.map_or_else(
                || {
                    cpu.add_to_fflags(FFLAGS_NV);
                    saturate_i32(bits)
                },
                |x| x as u32,
            );
            cpu.write_x(d.rd, out);
            Ok(())
        },
        dump_format_xf,
    );
    b.leaf(cvt_to_int, 0, fcvt_w);
    let fcvt_wu = b.op(
        "fcvt.wu.s",
        |cpu, d| {
            let rm = cpu.effective_rm(d)?;
            let v = cpu.read_f_soft(d.rs1);
            let bits = cpu.read_f_bits(d.rs1);
            let mut state = FPState::default();
            let r = v.to_u32(true, Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            let out = r.unwrap_or_else(|| {
                cpu.add_to_fflags(FFLAGS_NV);
                saturate_u32(bits)
            });
            cpu.write_x(d.rd, out);
            Ok(())
        },
        dump_format_xf,
    );
    b.leaf(cvt_to_int, 1, fcvt_wu);

    // integer -> float conversions, keyed on rs2
    let cvt_from_int = b.table(Key::Rs2);
    b.set(op_fp, 0x68, Table(cvt_from_int));
    let fcvt_s_w = b.op(
        "fcvt.s.w",
        |cpu, d| {
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let r = F32::from_i32(cpu.read_x(d.rs1) as i32, Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fx,
    );
    b.leaf(cvt_from_int, 0, fcvt_s_w);
    let fcvt_s_wu = b.op(
        "fcvt.s.wu",
        |cpu, d| {
            let rm = cpu.effective_rm(d)?;
            let mut state = FPState::default();
            let r = F32::from_u32(cpu.read_x(d.rs1), Some(rm), Some(&mut state));
            cpu.apply_fp_state(&state);
            cpu.write_f_soft(d.rd, r);
            Ok(())
        },
        dump_format_fx,
    );
    b.leaf(cvt_from_int, 1, fcvt_s_wu);

    // register moves and classification
    let mv_class = b.table(Key::Funct3);
    b.set(op_fp, 0x70, Table(mv_class));
    let fmv_x_w = b.op(
        "fmv.x.w",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_f_raw(d.rs1));
            Ok(())
        },
        dump_format_xf,
    );
    b.leaf(mv_class, 0, fmv_x_w);
    let fclass = b.op(
        "fclass.s",
        |cpu, d| {
            cpu.write_x(d.rd, 1 << fclass_f32(cpu.read_f_bits(d.rs1)) as u32);
            Ok(())
        },
        dump_format_xf,
    );
    b.leaf(mv_class, 1, fclass);

    let mv_w_x = b.table(Key::Funct3);
    b.set(op_fp, 0x78, Table(mv_w_x));
    let fmv_w_x = b.op(
        "fmv.w.x",
        |cpu, d| {
            cpu.write_f_bits(d.rd, cpu.read_x(d.rs1));
            Ok(())
        },
        dump_format_fx,
    );
    b.leaf(mv_w_x, 0, fmv_w_x);
}
