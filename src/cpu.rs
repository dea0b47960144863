#![allow(clippy::unreadable_literal)]
#![allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]

use crate::csr;
use crate::csr::{
    Csr, MIP_MEIP, MIP_MSIP, MIP_MTIP, MISA_MXL32, MSTATUS_MIE, MSTATUS_MIE_SHIFT, MSTATUS_MPIE,
    MSTATUS_MPIE_SHIFT, MSTATUS_MPP, MSTATUS_MPP_SHIFT,
};
use crate::decode::{Decoded, Decoder, DecoderBuilder, Entry, Key, TableId, RESERVED};
use crate::memory::{AccessWidth, BusCallback, Memory};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use std::fmt::Write as _;

pub mod fp;

/// Trap vector used when the Zicsr extension is absent: with no mtvec to
/// consult, every trap redirects here.
pub const FIXED_MTVEC_ADDR: u32 = 0x0000_0004;

/// Cycles charged on top of the faulting instruction for a trap entry.
const TRAP_CYCLE_PENALTY: u64 = 5;

/// Interrupt pending bits as returned by the interrupt callback.
pub mod irq {
    pub const EXTERNAL: u32 = 1;
    pub const SOFTWARE: u32 = 2;
    pub const TIMER: u32 = 4;
}

/// Interrupt callback, polled once per step. Returns the currently
/// pending [`irq`] lines.
pub type InterruptCallback = Box<dyn FnMut() -> u32>;

/// Which optional extensions a core is built with. The decode tables are
/// populated accordingly at construction, so an absent extension's
/// encodings fall through to the reserved handler.
#[derive(Clone, Copy, Debug)]
pub struct Extensions {
    pub zicsr: bool,
    pub fext: bool,
}

impl Default for Extensions {
    fn default() -> Self {
        Self {
            zicsr: true,
            fext: true,
        }
    }
}

#[allow(dead_code)]
#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq, Eq)]
pub enum PrivilegeMode {
    User,
    Supervisor,
    Reserved,
    Machine,
}

// bigger number is higher privilege level
const fn get_privilege_encoding(mode: PrivilegeMode) -> u8 {
    assert!(!matches!(mode, PrivilegeMode::Reserved));
    mode as u8
}

/// Returns `PrivilegeMode` from encoded privilege mode bits
#[must_use]
pub fn get_privilege_mode(encoding: u32) -> PrivilegeMode {
    match FromPrimitive::from_u32(encoding) {
        Some(PrivilegeMode::Reserved) | None => unreachable!(),
        Some(m) => m,
    }
}

#[derive(Debug)]
pub struct Trap {
    pub trap_type: TrapType,
    pub value: u32, // Trap type specific value (tval)
}

#[derive(Clone, Copy, Debug, FromPrimitive, PartialEq, Eq)]
pub enum TrapType {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAddressMisaligned = 6,
    StoreAccessFault = 7,
    EnvironmentCallFromUMode = 8,
    EnvironmentCallFromSMode = 9,
    EnvironmentCallFromMMode = 11,

    MachineSoftwareInterrupt = 103,
    MachineTimerInterrupt = 107,
    MachineExternalInterrupt = 111,
}

const INTERRUPT_BIT: u32 = 0x8000_0000;

const fn get_trap_cause(trap: &Trap) -> u32 {
    if (trap.trap_type as u32) < 100 {
        trap.trap_type as u32
    } else {
        trap.trap_type as u32 - 100 | INTERRUPT_BIT
    }
}

/// Everything the run loop did in one step, as seen by the embedder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepEvent {
    /// An instruction retired; PC has advanced or been redirected.
    Retired,
    /// A trap (exception or interrupt) was entered.
    Trapped,
    /// An environment call or breakpoint fired with halt-on-ecall set.
    HaltEcall,
    /// A reserved encoding was fetched with halt-on-reserved set. The
    /// trap has *not* been entered; PC still points at the instruction.
    HaltReserved,
    /// Instruction fetch failed on the bus. Unrecoverable.
    FetchFault,
}

/// Snapshot of one hart's architectural state. The live counters and the
/// interrupt-pending bits are folded into the CSR image on capture and
/// extracted again on restore.
#[derive(Clone)]
pub struct HartState {
    pub x: [u64; 32],
    pub f: [u64; 32],
    pub csr: Vec<u64>,
    pub pc: u32,
}

/// Emulates an RV32 CPU core: one hart plus its memory port.
pub struct Cpu {
    x_: [u64; 32],
    f_: [u64; 32],
    csr: Box<[u64]>,
    fflags_: u8,
    frm_: u32,
    pc: u32,
    insn_addr: u32,
    insn: u32,
    privilege_mode: PrivilegeMode,
    mip: u32,

    pub cycle: u64,
    instret: u64,
    mtime_delta: u64,
    mtimecmp: u64,

    reset_vector: u32,
    access_addr: u32,
    iaddr_align_mask: u32,

    ext: Extensions,
    pub halt_on_ecall: bool,
    pub halt_on_reserved: bool,
    pub abi_en: bool,

    pub(crate) memory: Memory,
    decoder: Decoder,
    int_callback: Option<InterruptCallback>,
}

impl Cpu {
    /// Creates a new `Cpu` with the given extensions and internal memory
    /// window size.
    #[must_use]
    pub fn new(ext: Extensions, memory_bytes: usize) -> Self {
        let mut builder = DecoderBuilder::new();
        let system = register_rv32i(&mut builder);
        if ext.zicsr {
            register_zicsr(&mut builder, &system);
        }
        if ext.fext {
            fp::register(&mut builder);
        }

        let mut cpu = Self {
            x_: [0; 32],
            f_: [0; 32],
            csr: vec![0; 4096].into_boxed_slice(),
            fflags_: 0,
            frm_: 0,
            pc: 0,
            insn_addr: 0,
            insn: 0,
            privilege_mode: PrivilegeMode::Machine,
            mip: 0,
            cycle: 0,
            instret: 0,
            mtime_delta: 0,
            mtimecmp: 0,
            reset_vector: 0,
            access_addr: 0,
            iaddr_align_mask: 3,
            ext,
            halt_on_ecall: false,
            halt_on_reserved: false,
            abi_en: false,
            memory: Memory::new(memory_bytes),
            decoder: builder.build(),
            int_callback: None,
        };
        cpu.csr[Csr::Misa as usize] = u64::from(cpu.misa_value());
        cpu
    }

    const fn misa_value(&self) -> u32 {
        let mut misa = MISA_MXL32 | 1 << (b'I' - b'A');
        if self.ext.fext {
            misa |= 1 << (b'F' - b'A');
        }
        misa
    }

    /// Reset-pin behaviour: architectural state is cleared, PC returns to
    /// the reset vector, privilege returns to Machine. Memory contents
    /// are left alone so a loaded image survives.
    pub fn reset(&mut self) {
        self.x_ = [0; 32];
        self.f_ = [0; 32];
        self.csr.fill(0);
        self.csr[Csr::Misa as usize] = u64::from(self.misa_value());
        self.fflags_ = 0;
        self.frm_ = 0;
        self.pc = self.reset_vector;
        self.insn = 0;
        self.insn_addr = self.reset_vector;
        self.privilege_mode = PrivilegeMode::Machine;
        self.mip = 0;
        self.cycle = 0;
        self.instret = 0;
        self.mtime_delta = 0;
        self.mtimecmp = 0;
        self.access_addr = 0;
    }

    pub fn set_reset_vector(&mut self, addr: u32) {
        self.reset_vector = addr;
    }

    #[inline]
    pub(crate) const fn read_x(&self, r: usize) -> u32 {
        self.x_[r] as u32
    }

    #[inline]
    pub(crate) fn write_x(&mut self, r: usize, v: u32) {
        if r != 0 {
            self.x_[r] = u64::from(v);
        }
    }

    /// Reads integer register content
    ///
    /// # Arguments
    /// * `reg` Register number. Must be 0-31
    #[must_use]
    pub fn read_register(&self, reg: u8) -> u32 {
        debug_assert!(reg <= 31, "reg must be 0-31. {reg}");
        self.read_x(reg as usize)
    }

    pub fn write_register(&mut self, reg: u8, value: u32) {
        debug_assert!(reg <= 31, "reg must be 0-31. {reg}");
        self.write_x(reg as usize, value);
    }

    #[must_use]
    pub const fn read_pc(&self) -> u32 {
        self.pc
    }

    pub fn update_pc(&mut self, value: u32) {
        self.pc = value;
    }

    #[must_use]
    pub const fn privilege_mode(&self) -> PrivilegeMode {
        self.privilege_mode
    }

    /// The raw bytes of the most recently fetched instruction, for
    /// embedder inspection after a halt.
    #[must_use]
    pub const fn curr_instruction(&self) -> u32 {
        self.insn
    }

    /// Effective address of the most recent load, store, or jump.
    #[must_use]
    pub const fn last_access_addr(&self) -> u32 {
        self.access_addr
    }

    #[must_use]
    pub const fn clk_cycles(&self) -> u64 {
        self.cycle
    }

    #[must_use]
    pub const fn insts_retired(&self) -> u64 {
        self.instret
    }

    pub fn register_mem_callback(&mut self, callback: BusCallback) {
        self.memory.register_callback(callback);
    }

    /// Direct memory access for the embedder, between steps. Follows the
    /// bus path (internal window, then callback), not the trap path.
    pub fn read_mem(&mut self, addr: u32, width: AccessWidth) -> (u32, bool) {
        self.memory.read(addr, width)
    }

    pub fn write_mem(&mut self, addr: u32, value: u32, width: AccessWidth) -> bool {
        self.memory.write(addr, value, width)
    }

    pub fn register_int_callback(&mut self, callback: InterruptCallback) {
        self.int_callback = Some(callback);
    }

    #[must_use]
    pub fn hart_state(&self) -> HartState {
        let mut csr = self.csr.to_vec();
        for c in [
            Csr::Fflags,
            Csr::Frm,
            Csr::Fcsr,
            Csr::Mip,
            Csr::Mcycle,
            Csr::Mcycleh,
            Csr::Minstret,
            Csr::Minstreth,
            Csr::Mtime,
            Csr::Mtimeh,
            Csr::Mtimecmp,
            Csr::Mtimecmph,
        ] {
            csr[c as usize] = u64::from(self.read_csr_raw(c));
        }
        HartState {
            x: self.x_,
            f: self.f_,
            csr,
            pc: self.pc,
        }
    }

    pub fn set_hart_state(&mut self, state: &HartState) {
        self.x_ = state.x;
        self.x_[0] = 0;
        self.f_ = state.f;
        self.csr.copy_from_slice(&state.csr);
        self.fflags_ = (state.csr[Csr::Fflags as usize] & 0x1f) as u8;
        self.frm_ = (state.csr[Csr::Frm as usize] & 7) as u32;
        self.mip = state.csr[Csr::Mip as usize] as u32;
        self.pc = state.pc;
    }

    /// Runs one fetch-decode-execute step.
    pub fn step(&mut self) -> StepEvent {
        self.cycle = self.cycle.wrapping_add(1);
        self.service_timer();
        self.poll_interrupts();
        if let Some(trap) = self.pending_interrupt() {
            self.enter_trap(&trap, self.pc);
            return StepEvent::Trapped;
        }

        self.insn_addr = self.pc;
        if self.pc & self.iaddr_align_mask != 0 {
            let trap = Trap {
                trap_type: TrapType::InstructionAddressMisaligned,
                value: self.pc,
            };
            self.enter_trap(&trap, self.pc);
            return StepEvent::Trapped;
        }

        let (word, fault) = self.memory.read(self.pc, AccessWidth::Instr);
        if fault {
            log::info!("** fetch fault at {:#010x}", self.pc);
            return StepEvent::FetchFault;
        }
        self.insn = word;

        let op_id = self.decoder.decode(word);
        if op_id == RESERVED && self.halt_on_reserved {
            return StepEvent::HaltReserved;
        }

        let decoded = Decoded::new(word);
        self.pc = self.insn_addr.wrapping_add(4);
        let exec = self.decoder.get(op_id).exec;
        match exec(self, &decoded) {
            Ok(()) => {
                self.instret = self.instret.wrapping_add(1);
                StepEvent::Retired
            }
            Err(trap) => {
                let halting = self.halt_on_ecall
                    && matches!(
                        trap.trap_type,
                        TrapType::EnvironmentCallFromUMode
                            | TrapType::EnvironmentCallFromSMode
                            | TrapType::EnvironmentCallFromMMode
                            | TrapType::Breakpoint
                    );
                self.enter_trap(&trap, self.insn_addr);
                if halting {
                    // Leave PC on the halting instruction so the embedder
                    // sees where the run stopped; the trap CSRs are
                    // already written.
                    self.pc = self.insn_addr;
                    return StepEvent::HaltEcall;
                }
                StepEvent::Trapped
            }
        }
    }

    const fn mtime(&self) -> u64 {
        self.cycle.wrapping_add(self.mtime_delta)
    }

    fn service_timer(&mut self) {
        if self.ext.zicsr && self.mtimecmp > 0 && self.mtime() >= self.mtimecmp {
            self.mip |= MIP_MTIP;
        }
    }

    fn poll_interrupts(&mut self) {
        let Some(callback) = self.int_callback.as_mut() else {
            return;
        };
        let bits = callback();
        // External and software lines are level sensitive; the timer bit
        // is also owned by the internal comparator and only cleared by an
        // mtimecmp write.
        self.mip &= !(MIP_MEIP | MIP_MSIP);
        if bits & irq::EXTERNAL != 0 {
            self.mip |= MIP_MEIP;
        }
        if bits & irq::SOFTWARE != 0 {
            self.mip |= MIP_MSIP;
        }
        if bits & irq::TIMER != 0 {
            self.mip |= MIP_MTIP;
        }
    }

    fn pending_interrupt(&self) -> Option<Trap> {
        if !self.ext.zicsr {
            return None;
        }
        let enabled = match self.privilege_mode {
            PrivilegeMode::Machine => self.read_csr_raw(Csr::Mstatus) & MSTATUS_MIE != 0,
            _ => true,
        };
        if !enabled {
            return None;
        }
        let pending = self.mip & self.read_csr_raw(Csr::Mie);
        // external > software > timer
        for (bit, trap_type) in [
            (MIP_MEIP, TrapType::MachineExternalInterrupt),
            (MIP_MSIP, TrapType::MachineSoftwareInterrupt),
            (MIP_MTIP, TrapType::MachineTimerInterrupt),
        ] {
            if pending & bit != 0 {
                return Some(Trap {
                    trap_type,
                    value: 0,
                });
            }
        }
        None
    }

    /// Trap entry. With Zicsr, performs the full mstatus/mepc/mcause/
    /// mtval bookkeeping and redirects through mtvec; without, the guest
    /// only observes the PC redirect to the fixed vector.
    fn enter_trap(&mut self, trap: &Trap, epc: u32) {
        self.cycle = self.cycle.wrapping_add(TRAP_CYCLE_PENALTY);
        if !self.ext.zicsr {
            self.pc = FIXED_MTVEC_ADDR;
            return;
        }

        let cause = get_trap_cause(trap);
        self.write_csr_raw(Csr::Mepc, epc);
        self.write_csr_raw(Csr::Mcause, cause);
        self.write_csr_raw(Csr::Mtval, trap.value);

        let status = self.read_csr_raw(Csr::Mstatus);
        let mie = status >> 3 & 1;
        let new_status = (status & !(MSTATUS_MIE | MSTATUS_MPIE | MSTATUS_MPP))
            | mie << MSTATUS_MPIE_SHIFT
            | u32::from(get_privilege_encoding(self.privilege_mode)) << MSTATUS_MPP_SHIFT;
        self.write_csr_raw(Csr::Mstatus, new_status);
        self.privilege_mode = PrivilegeMode::Machine;

        let mtvec = self.read_csr_raw(Csr::Mtvec);
        let mut target = mtvec & !3;
        if mtvec & 3 == 1 && cause & INTERRUPT_BIT != 0 {
            target = target.wrapping_add(4 * (cause & 0xffff));
        }
        self.pc = target;
    }

    pub(crate) fn reserved(&self, d: &Decoded) -> Trap {
        log::info!(
            "** {:#010x}: reserved instruction {:#010x}",
            self.insn_addr,
            d.word
        );
        Trap {
            trap_type: TrapType::IllegalInstruction,
            value: d.word,
        }
    }

    fn illegal_csr(&self) -> Trap {
        Trap {
            trap_type: TrapType::IllegalInstruction,
            value: self.insn,
        }
    }

    fn csr_for_access(&self, csrno: u16) -> Result<Csr, Trap> {
        let Some(c) = Csr::from_u16(csrno) else {
            log::info!("** {:#010x}: CSR {csrno:#05x} isn't implemented", self.insn_addr);
            return Err(self.illegal_csr());
        };
        if matches!(c, Csr::Fflags | Csr::Frm | Csr::Fcsr) && !self.ext.fext {
            return Err(self.illegal_csr());
        }
        let privilege = (csrno >> 8) & 3;
        if privilege as u8 > get_privilege_encoding(self.privilege_mode) {
            log::info!("** {:#010x}: lacking privilege for {c}", self.insn_addr);
            return Err(self.illegal_csr());
        }
        Ok(c)
    }

    fn read_csr(&self, csrno: u16) -> Result<u32, Trap> {
        Ok(self.read_csr_raw(self.csr_for_access(csrno)?))
    }

    fn write_csr(&mut self, csrno: u16, value: u32) -> Result<(), Trap> {
        let c = self.csr_for_access(csrno)?;
        if csr::read_only(csrno) {
            log::info!("** {:#010x}: write to read-only {c}", self.insn_addr);
            return Err(self.illegal_csr());
        }
        let mask = csr::write_mask(c);
        let merged = (self.read_csr_raw(c) & !mask) | (value & mask);
        self.write_csr_raw(c, merged);
        Ok(())
    }

    fn read_csr_raw(&self, c: Csr) -> u32 {
        match c {
            Csr::Fflags => u32::from(self.fflags_),
            Csr::Frm => self.frm_,
            Csr::Fcsr => u32::from(self.fflags_) | self.frm_ << 5,
            Csr::Mip => self.mip,
            Csr::Mcycle => self.cycle as u32,
            Csr::Mcycleh => (self.cycle >> 32) as u32,
            Csr::Minstret => self.instret as u32,
            Csr::Minstreth => (self.instret >> 32) as u32,
            Csr::Mtime => self.mtime() as u32,
            Csr::Mtimeh => (self.mtime() >> 32) as u32,
            Csr::Mtimecmp => self.mtimecmp as u32,
            Csr::Mtimecmph => (self.mtimecmp >> 32) as u32,
            Csr::Mvendorid | Csr::Marchid | Csr::Mimpid | Csr::Mhartid => 0,
            _ => self.csr[c as usize] as u32,
        }
    }

    fn write_csr_raw(&mut self, c: Csr, value: u32) {
        match c {
            Csr::Fflags => self.fflags_ = (value & 0x1f) as u8,
            Csr::Frm => self.frm_ = value & 7,
            Csr::Fcsr => {
                self.fflags_ = (value & 0x1f) as u8;
                self.frm_ = value >> 5 & 7;
            }
            Csr::Mip => self.mip = value,
            Csr::Misa => {} // WARL, not writable here
            Csr::Mcycle => self.cycle = self.cycle & !0xffff_ffff | u64::from(value),
            Csr::Mcycleh => {
                self.cycle = self.cycle & 0xffff_ffff | u64::from(value) << 32;
            }
            Csr::Minstret => self.instret = self.instret & !0xffff_ffff | u64::from(value),
            Csr::Minstreth => {
                self.instret = self.instret & 0xffff_ffff | u64::from(value) << 32;
            }
            Csr::Mtime => {
                let mtime = self.mtime() & !0xffff_ffff | u64::from(value);
                self.mtime_delta = mtime.wrapping_sub(self.cycle);
            }
            Csr::Mtimeh => {
                let mtime = self.mtime() & 0xffff_ffff | u64::from(value) << 32;
                self.mtime_delta = mtime.wrapping_sub(self.cycle);
            }
            Csr::Mtimecmp => {
                self.mtimecmp = self.mtimecmp & !0xffff_ffff | u64::from(value);
                self.mip &= !MIP_MTIP;
            }
            Csr::Mtimecmph => {
                self.mtimecmp = self.mtimecmp & 0xffff_ffff | u64::from(value) << 32;
                self.mip &= !MIP_MTIP;
            }
            _ => self.csr[c as usize] = u64::from(value),
        }
    }

    pub(crate) fn add_to_fflags(&mut self, flags: u8) {
        self.fflags_ |= flags & 0x1f;
    }

    pub(crate) const fn read_frm(&self) -> u32 {
        self.frm_
    }

    /// Guest load with the alignment policy of the semantic layer:
    /// a misaligned effective address traps before the bus is touched.
    pub(crate) fn load(&mut self, addr: u32, width: AccessWidth) -> Result<u32, Trap> {
        self.access_addr = addr;
        if addr & (width.bytes() - 1) != 0 {
            return Err(Trap {
                trap_type: TrapType::LoadAddressMisaligned,
                value: addr,
            });
        }
        let (v, fault) = self.memory.read(addr, width);
        if fault {
            return Err(Trap {
                trap_type: TrapType::LoadAccessFault,
                value: addr,
            });
        }
        Ok(v)
    }

    pub(crate) fn store(&mut self, addr: u32, value: u32, width: AccessWidth) -> Result<(), Trap> {
        self.access_addr = addr;
        if addr & (width.bytes() - 1) != 0 {
            return Err(Trap {
                trap_type: TrapType::StoreAddressMisaligned,
                value: addr,
            });
        }
        if self.memory.write(addr, value, width) {
            return Err(Trap {
                trap_type: TrapType::StoreAccessFault,
                value: addr,
            });
        }
        Ok(())
    }

    /// Redirects PC to a jump/branch target, trapping on a target the
    /// fetch stage could not handle. JALR's bit 0 must already be clear.
    fn jump_to(&mut self, target: u32) -> Result<(), Trap> {
        self.access_addr = target;
        if target & self.iaddr_align_mask != 0 {
            return Err(Trap {
                trap_type: TrapType::InstructionAddressMisaligned,
                value: target,
            });
        }
        self.pc = target;
        Ok(())
    }

    /// Formats the instruction at `addr` as
    /// `<addr>: <word>    <mnemonic> <operands>` into `s`. Returns false
    /// when the word cannot be fetched. With `evaluate`, current register
    /// contents are appended to the operands.
    pub fn disassemble(&mut self, addr: u32, s: &mut String, evaluate: bool) -> bool {
        let (word, fault) = self.memory.read(addr, AccessWidth::Instr);
        if fault {
            let _ = write!(s, "{addr:08x}: <inaccessible>");
            return false;
        }
        self.disassemble_word(addr, word, s, evaluate);
        true
    }

    pub fn disassemble_word(&self, addr: u32, word: u32, s: &mut String, evaluate: bool) {
        let op_id = self.decoder.lookup(word);
        let op = self.decoder.get(op_id);
        let _ = write!(s, "{addr:08x}: {word:08x}    {} ", op.name);
        (op.dump)(s, self, &Decoded::new(word), addr, evaluate);
    }
}

// ------------------------------------------------------------------
// Disassembly support
// ------------------------------------------------------------------

const XREG_ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

const FREG_ABI_NAMES: [&str; 32] = [
    "ft0", "ft1", "ft2", "ft3", "ft4", "ft5", "ft6", "ft7", "fs0", "fs1", "fa0", "fa1", "fa2",
    "fa3", "fa4", "fa5", "fa6", "fa7", "fs2", "fs3", "fs4", "fs5", "fs6", "fs7", "fs8", "fs9",
    "fs10", "fs11", "ft8", "ft9", "ft10", "ft11",
];

const XREG_NAMES: [&str; 32] = [
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "x31",
];

const FREG_NAMES: [&str; 32] = [
    "f0", "f1", "f2", "f3", "f4", "f5", "f6", "f7", "f8", "f9", "f10", "f11", "f12", "f13", "f14",
    "f15", "f16", "f17", "f18", "f19", "f20", "f21", "f22", "f23", "f24", "f25", "f26", "f27",
    "f28", "f29", "f30", "f31",
];

pub(crate) const fn xname(abi: bool, r: usize) -> &'static str {
    if abi {
        XREG_ABI_NAMES[r]
    } else {
        XREG_NAMES[r]
    }
}

pub(crate) const fn fname(abi: bool, r: usize) -> &'static str {
    if abi {
        FREG_ABI_NAMES[r]
    } else {
        FREG_NAMES[r]
    }
}

fn dump_x(s: &mut String, cpu: &Cpu, r: usize, evaluate: bool) {
    *s += xname(cpu.abi_en, r);
    if evaluate {
        let _ = write!(s, ":{:x}", cpu.read_x(r));
    }
}

fn dump_format_u(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rd, evaluate);
    let _ = write!(s, ",{:#x}", (d.imm_u as u32) >> 12);
}

fn dump_format_j(s: &mut String, cpu: &Cpu, d: &Decoded, addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rd, evaluate);
    let _ = write!(s, ",{:x}", addr.wrapping_add(d.imm_j as u32));
}

fn dump_format_i(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rd, evaluate);
    *s += ",";
    dump_x(s, cpu, d.rs1, evaluate);
    let _ = write!(s, ",{:x}", d.imm_i);
}

fn dump_format_i_mem(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rd, evaluate);
    let _ = write!(s, ",{:x}(", d.imm_i);
    dump_x(s, cpu, d.rs1, evaluate);
    *s += ")";
}

fn dump_format_shift(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rd, evaluate);
    *s += ",";
    dump_x(s, cpu, d.rs1, evaluate);
    let _ = write!(s, ",{:x}", d.shamt);
}

fn dump_format_b(s: &mut String, cpu: &Cpu, d: &Decoded, addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rs1, evaluate);
    *s += ",";
    dump_x(s, cpu, d.rs2, evaluate);
    let _ = write!(s, ",{:x}", addr.wrapping_add(d.imm_b as u32));
}

fn dump_format_s(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rs2, evaluate);
    let _ = write!(s, ",{:x}(", d.imm_s);
    dump_x(s, cpu, d.rs1, evaluate);
    *s += ")";
}

fn dump_format_r(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    dump_x(s, cpu, d.rd, evaluate);
    *s += ",";
    dump_x(s, cpu, d.rs1, evaluate);
    *s += ",";
    dump_x(s, cpu, d.rs2, evaluate);
}

fn dump_format_csr(s: &mut String, cpu: &Cpu, d: &Decoded, _addr: u32, evaluate: bool) {
    let csrno = (d.word >> 20 & 0xfff) as u16;
    dump_x(s, cpu, d.rd, evaluate);
    match Csr::from_u16(csrno) {
        Some(c) => {
            let _ = write!(s, ",{c}");
            if evaluate {
                let _ = write!(s, ":{:x}", cpu.read_csr_raw(c));
            }
        }
        None => {
            let _ = write!(s, ",{csrno:#x}");
        }
    }
    if d.funct3 & 4 != 0 {
        // immediate variant: the rs1 field is a zero-extended literal
        let _ = write!(s, ",{:x}", d.rs1);
    } else {
        *s += ",";
        dump_x(s, cpu, d.rs1, evaluate);
    }
}

fn dump_empty(_s: &mut String, _cpu: &Cpu, _d: &Decoded, _addr: u32, _evaluate: bool) {}

// ------------------------------------------------------------------
// RV32I registration
// ------------------------------------------------------------------

/// Table handles RV32I leaves behind for other extensions to extend.
pub(crate) struct SystemTables {
    /// SYSTEM secondary table, keyed on funct3.
    pub funct3: TableId,
    /// Tertiary table under SYSTEM funct3=0, keyed on funct7.
    pub funct7: TableId,
}

#[allow(clippy::too_many_lines)]
fn register_rv32i(b: &mut DecoderBuilder) -> SystemTables {
    use Entry::{Leaf, Table};

    let lui = b.op(
        "lui",
        |cpu, d| {
            cpu.write_x(d.rd, d.imm_u as u32);
            Ok(())
        },
        dump_format_u,
    );
    b.primary(0x37, Leaf(lui));

    let auipc = b.op(
        "auipc",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.insn_addr.wrapping_add(d.imm_u as u32));
            Ok(())
        },
        dump_format_u,
    );
    b.primary(0x17, Leaf(auipc));

    let jal = b.op(
        "jal",
        |cpu, d| {
            let target = cpu.insn_addr.wrapping_add(d.imm_j as u32);
            let link = cpu.pc;
            cpu.jump_to(target)?;
            cpu.write_x(d.rd, link);
            Ok(())
        },
        dump_format_j,
    );
    b.primary(0x6f, Leaf(jal));

    let jalr = b.op(
        "jalr",
        |cpu, d| {
            let target = cpu.read_x(d.rs1).wrapping_add(d.imm_i as u32) & !1;
            let link = cpu.pc;
            cpu.jump_to(target)?;
            cpu.write_x(d.rd, link);
            Ok(())
        },
        dump_format_i_mem,
    );
    b.primary(0x67, Leaf(jalr));

    // Conditional branches, keyed on funct3. The routine re-derives its
    // condition from funct3 so all six share one body.
    let branches = b.table(Key::Funct3);
    b.primary(0x63, Table(branches));
    for (funct3, name) in [
        (0, "beq"),
        (1, "bne"),
        (4, "blt"),
        (5, "bge"),
        (6, "bltu"),
        (7, "bgeu"),
    ] {
        let op = b.op(
            name,
            |cpu, d| {
                if branch_cond(d.funct3)(cpu.read_x(d.rs1), cpu.read_x(d.rs2)) {
                    cpu.jump_to(cpu.insn_addr.wrapping_add(d.imm_b as u32))?;
                }
                Ok(())
            },
            dump_format_b,
        );
        b.leaf(branches, funct3, op);
    }

    // Loads, keyed on funct3
    let loads = b.table(Key::Funct3);
    b.primary(0x03, Table(loads));

    let lb = b.op(
        "lb",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_i as u32);
            let v = cpu.load(addr, AccessWidth::Byte)?;
            cpu.write_x(d.rd, v as u8 as i8 as i32 as u32);
            Ok(())
        },
        dump_format_i_mem,
    );
    b.leaf(loads, 0, lb);

    let lh = b.op(
        "lh",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_i as u32);
            let v = cpu.load(addr, AccessWidth::Half)?;
            cpu.write_x(d.rd, v as u16 as i16 as i32 as u32);
            Ok(())
        },
        dump_format_i_mem,
    );
    b.leaf(loads, 1, lh);

    let lw = b.op(
        "lw",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_i as u32);
            let v = cpu.load(addr, AccessWidth::Word)?;
            cpu.write_x(d.rd, v);
            Ok(())
        },
        dump_format_i_mem,
    );
    b.leaf(loads, 2, lw);

    let lbu = b.op(
        "lbu",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_i as u32);
            let v = cpu.load(addr, AccessWidth::Byte)?;
            cpu.write_x(d.rd, v);
            Ok(())
        },
        dump_format_i_mem,
    );
    b.leaf(loads, 4, lbu);

    let lhu = b.op(
        "lhu",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_i as u32);
            let v = cpu.load(addr, AccessWidth::Half)?;
            cpu.write_x(d.rd, v);
            Ok(())
        },
        dump_format_i_mem,
    );
    b.leaf(loads, 5, lhu);

    // Stores, keyed on funct3
    let stores = b.table(Key::Funct3);
    b.primary(0x23, Table(stores));

    let sb = b.op(
        "sb",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_s as u32);
            cpu.store(addr, cpu.read_x(d.rs2), AccessWidth::Byte)
        },
        dump_format_s,
    );
    b.leaf(stores, 0, sb);

    let sh = b.op(
        "sh",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_s as u32);
            cpu.store(addr, cpu.read_x(d.rs2), AccessWidth::Half)
        },
        dump_format_s,
    );
    b.leaf(stores, 1, sh);

    let sw = b.op(
        "sw",
        |cpu, d| {
            let addr = cpu.read_x(d.rs1).wrapping_add(d.imm_s as u32);
            cpu.store(addr, cpu.read_x(d.rs2), AccessWidth::Word)
        },
        dump_format_s,
    );
    b.leaf(stores, 2, sw);

    // OP-IMM, keyed on funct3; the shifts descend once more on funct7 so
    // stray upper shamt bits decode as reserved.
    let op_imm = b.table(Key::Funct3);
    b.primary(0x13, Table(op_imm));

    let addi = b.op(
        "addi",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1).wrapping_add(d.imm_i as u32));
            Ok(())
        },
        dump_format_i,
    );
    b.leaf(op_imm, 0, addi);

    let slti = b.op(
        "slti",
        |cpu, d| {
            cpu.write_x(d.rd, u32::from((cpu.read_x(d.rs1) as i32) < d.imm_i));
            Ok(())
        },
        dump_format_i,
    );
    b.leaf(op_imm, 2, slti);

    let sltiu = b.op(
        "sltiu",
        |cpu, d| {
            cpu.write_x(d.rd, u32::from(cpu.read_x(d.rs1) < d.imm_i as u32));
            Ok(())
        },
        dump_format_i,
    );
    b.leaf(op_imm, 3, sltiu);

    let xori = b.op(
        "xori",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) ^ d.imm_i as u32);
            Ok(())
        },
        dump_format_i,
    );
    b.leaf(op_imm, 4, xori);

    let ori = b.op(
        "ori",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) | d.imm_i as u32);
            Ok(())
        },
        dump_format_i,
    );
    b.leaf(op_imm, 6, ori);

    let andi = b.op(
        "andi",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) & d.imm_i as u32);
            Ok(())
        },
        dump_format_i,
    );
    b.leaf(op_imm, 7, andi);

    let slli_tbl = b.table(Key::Funct7);
    b.set(op_imm, 1, Table(slli_tbl));
    let slli = b.op(
        "slli",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) << d.shamt);
            Ok(())
        },
        dump_format_shift,
    );
    b.leaf(slli_tbl, 0x00, slli);

    let sri_tbl = b.table(Key::Funct7);
    b.set(op_imm, 5, Table(sri_tbl));
    let srli = b.op(
        "srli",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) >> d.shamt);
            Ok(())
        },
        dump_format_shift,
    );
    b.leaf(sri_tbl, 0x00, srli);
    let srai = b.op(
        "srai",
        |cpu, d| {
            cpu.write_x(d.rd, ((cpu.read_x(d.rs1) as i32) >> d.shamt) as u32);
            Ok(())
        },
        dump_format_shift,
    );
    b.leaf(sri_tbl, 0x20, srai);

    // OP, funct3 then funct7
    let op_tbl = b.table(Key::Funct3);
    b.primary(0x33, Table(op_tbl));

    let arith = b.table(Key::Funct7);
    b.set(op_tbl, 0, Table(arith));
    let add = b.op(
        "add",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1).wrapping_add(cpu.read_x(d.rs2)));
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(arith, 0x00, add);
    let sub = b.op(
        "sub",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1).wrapping_sub(cpu.read_x(d.rs2)));
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(arith, 0x20, sub);

    let sll_tbl = b.table(Key::Funct7);
    b.set(op_tbl, 1, Table(sll_tbl));
    let sll = b.op(
        "sll",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) << (cpu.read_x(d.rs2) & 0x1f));
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(sll_tbl, 0x00, sll);

    let slt_tbl = b.table(Key::Funct7);
    b.set(op_tbl, 2, Table(slt_tbl));
    let slt = b.op(
        "slt",
        |cpu, d| {
            cpu.write_x(
                d.rd,
                u32::from((cpu.read_x(d.rs1) as i32) < cpu.read_x(d.rs2) as i32),
            );
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(slt_tbl, 0x00, slt);

    let sltu_tbl = b.table(Key::Funct7);
    b.set(op_tbl, 3, Table(sltu_tbl));
    let sltu = b.op(
        "sltu",
        |cpu, d| {
            cpu.write_x(d.rd, u32::from(cpu.read_x(d.rs1) < cpu.read_x(d.rs2)));
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(sltu_tbl, 0x00, sltu);

    let xor_tbl = b.table(Key::Funct7);
    b.set(op_tbl, 4, Table(xor_tbl));
    let xor = b.op(
        "xor",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) ^ cpu.read_x(d.rs2));
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(xor_tbl, 0x00, xor);

    let srr_tbl = b.table(Key::Funct7);
    b.set(op_tbl, 5, Table(srr_tbl));
    let srl = b.op(
        "srl",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) >> (cpu.read_x(d.rs2) & 0x1f));
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(srr_tbl, 0x00, srl);
    let sra = b.op(
        "sra",
        |cpu, d| {
            cpu.write_x(
                d.rd,
                ((cpu.read_x(d.rs1) as i32) >> (cpu.read_x(d.rs2) & 0x1f)) as u32,
            );
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(srr_tbl, 0x20, sra);

    let or_tbl = b.table(Key::Funct7);
    b.set(op_tbl, 6, Table(or_tbl));
    let or = b.op(
        "or",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) | cpu.read_x(d.rs2));
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(or_tbl, 0x00, or);

    let and_tbl = b.table(Key::Funct7);
    b.set(op_tbl, 7, Table(and_tbl));
    let and = b.op(
        "and",
        |cpu, d| {
            cpu.write_x(d.rd, cpu.read_x(d.rs1) & cpu.read_x(d.rs2));
            Ok(())
        },
        dump_format_r,
    );
    b.leaf(and_tbl, 0x00, and);

    // The simulator's memory model is sequential, so fences retire as
    // no-ops whatever their predecessor/successor sets say.
    let fence = b.op("fence", |_cpu, _d| Ok(()), dump_empty);
    b.primary(0x0f, Leaf(fence));

    // SYSTEM: funct3=0 descends funct7 then rs2 to tell the environment
    // instructions apart; Zicsr hangs the CSR ops and mret off these.
    let system = b.table(Key::Funct3);
    b.primary(0x73, Table(system));
    let env_funct7 = b.table(Key::Funct7);
    b.set(system, 0, Table(env_funct7));
    let env_rs2 = b.table(Key::Rs2);
    b.set(env_funct7, 0x00, Table(env_rs2));

    let ecall = b.op(
        "ecall",
        |cpu, _d| {
            let trap_type = match cpu.privilege_mode {
                PrivilegeMode::User => TrapType::EnvironmentCallFromUMode,
                PrivilegeMode::Supervisor => TrapType::EnvironmentCallFromSMode,
                PrivilegeMode::Machine => TrapType::EnvironmentCallFromMMode,
                PrivilegeMode::Reserved => unreachable!(),
            };
            Err(Trap {
                trap_type,
                value: 0,
            })
        },
        dump_empty,
    );
    b.leaf(env_rs2, 0, ecall);

    let ebreak = b.op(
        "ebreak",
        |cpu, _d| {
            Err(Trap {
                trap_type: TrapType::Breakpoint,
                value: cpu.insn_addr,
            })
        },
        dump_empty,
    );
    b.leaf(env_rs2, 1, ebreak);

    SystemTables {
        funct3: system,
        funct7: env_funct7,
    }
}

type BranchFn = fn(u32, u32) -> bool;

fn branch_cond(funct3: u32) -> BranchFn {
    match funct3 {
        0 => |a, b| a == b,
        1 => |a, b| a != b,
        4 => |a, b| (a as i32) < b as i32,
        5 => |a, b| a as i32 >= b as i32,
        6 => |a, b| a < b,
        _ => |a, b| a >= b,
    }
}

// ------------------------------------------------------------------
// Zicsr registration
// ------------------------------------------------------------------

const fn csr_field(d: &Decoded) -> u16 {
    (d.word >> 20 & 0xfff) as u16
}

fn register_zicsr(b: &mut DecoderBuilder, system: &SystemTables) {
    let csrrw = b.op(
        "csrrw",
        |cpu, d| {
            let csrno = csr_field(d);
            let src = cpu.read_x(d.rs1);
            if d.rd == 0 {
                // rd=x0 skips the read and any read side effect
                cpu.write_csr(csrno, src)?;
            } else {
                let old = cpu.read_csr(csrno)?;
                cpu.write_csr(csrno, src)?;
                cpu.write_x(d.rd, old);
            }
            Ok(())
        },
        dump_format_csr,
    );
    b.leaf(system.funct3, 1, csrrw);

    let csrrs = b.op(
        "csrrs",
        |cpu, d| {
            let csrno = csr_field(d);
            let old = cpu.read_csr(csrno)?;
            if d.rs1 != 0 {
                cpu.write_csr(csrno, old | cpu.read_x(d.rs1))?;
            }
            cpu.write_x(d.rd, old);
            Ok(())
        },
        dump_format_csr,
    );
    b.leaf(system.funct3, 2, csrrs);

    let csrrc = b.op(
        "csrrc",
        |cpu, d| {
            let csrno = csr_field(d);
            let old = cpu.read_csr(csrno)?;
            if d.rs1 != 0 {
                cpu.write_csr(csrno, old & !cpu.read_x(d.rs1))?;
            }
            cpu.write_x(d.rd, old);
            Ok(())
        },
        dump_format_csr,
    );
    b.leaf(system.funct3, 3, csrrc);

    let csrrwi = b.op(
        "csrrwi",
        |cpu, d| {
            let csrno = csr_field(d);
            if d.rd == 0 {
                cpu.write_csr(csrno, d.rs1 as u32)?;
            } else {
                let old = cpu.read_csr(csrno)?;
                cpu.write_csr(csrno, d.rs1 as u32)?;
                cpu.write_x(d.rd, old);
            }
            Ok(())
        },
        dump_format_csr,
    );
    b.leaf(system.funct3, 5, csrrwi);

    let csrrsi = b.op(
        "csrrsi",
        |cpu, d| {
            let csrno = csr_field(d);
            let old = cpu.read_csr(csrno)?;
            if d.rs1 != 0 {
                cpu.write_csr(csrno, old | d.rs1 as u32)?;
            }
            cpu.write_x(d.rd, old);
            Ok(())
        },
        dump_format_csr,
    );
    b.leaf(system.funct3, 6, csrrsi);

    let csrrci = b.op(
        "csrrci",
        |cpu, d| {
            let csrno = csr_field(d);
            let old = cpu.read_csr(csrno)?;
            if d.rs1 != 0 {
                cpu.write_csr(csrno, old & !(d.rs1 as u32))?;
            }
            cpu.write_x(d.rd, old);
            Ok(())
        },
        dump_format_csr,
    );
    b.leaf(system.funct3, 7, csrrci);

    // mret: funct7=0x18, rs2=0b00010
    let mret_rs2 = b.table(Key::Rs2);
    b.set(system.funct7, 0x18, Entry::Table(mret_rs2));
    let mret = b.op(
        "mret",
        |cpu, _d| {
            let mepc = cpu.read_csr_raw(Csr::Mepc);
            let status = cpu.read_csr_raw(Csr::Mstatus);
            let mpie = status >> MSTATUS_MPIE_SHIFT & 1;
            let mpp = status >> MSTATUS_MPP_SHIFT & 3;
            // MIE <- MPIE, MPIE <- 1, MPP <- least privileged mode
            let new_status = (status & !(MSTATUS_MIE | MSTATUS_MPP))
                | mpie << MSTATUS_MIE_SHIFT
                | MSTATUS_MPIE;
            cpu.write_csr_raw(Csr::Mstatus, new_status);
            cpu.privilege_mode = match mpp {
                0 => PrivilegeMode::User,
                1 => PrivilegeMode::Supervisor,
                _ => PrivilegeMode::Machine,
            };
            cpu.pc = mepc;
            Ok(())
        },
        dump_empty,
    );
    b.leaf(mret_rs2, 2, mret);
}

#[cfg(test)]
mod test_cpu {
    use super::*;

    fn create_cpu() -> Cpu {
        Cpu::new(Extensions::default(), 0x10000)
    }

    fn store_word(cpu: &mut Cpu, addr: u32, word: u32) {
        assert!(!cpu.memory.write(addr, word, AccessWidth::Word));
    }

    fn run_until_halt(cpu: &mut Cpu, max_steps: usize) -> StepEvent {
        for _ in 0..max_steps {
            let ev = cpu.step();
            if ev != StepEvent::Retired && ev != StepEvent::Trapped {
                return ev;
            }
        }
        panic!("no halt within {max_steps} steps");
    }

    #[test]
    fn initialize() {
        let _cpu = create_cpu();
    }

    #[test]
    fn addi_chain() {
        let mut cpu = create_cpu();
        cpu.halt_on_ecall = true;
        store_word(&mut cpu, 0, 0x00500093); // addi x1, x0, 5
        store_word(&mut cpu, 4, 0x00708113); // addi x2, x1, 7
        store_word(&mut cpu, 8, 0xffc10193); // addi x3, x2, -4
        store_word(&mut cpu, 12, 0x00100073); // ebreak

        let ev = run_until_halt(&mut cpu, 10);
        assert_eq!(ev, StepEvent::HaltEcall);
        assert_eq!(cpu.read_register(1), 5);
        assert_eq!(cpu.read_register(2), 12);
        assert_eq!(cpu.read_register(3), 8);
        assert_eq!(cpu.read_pc(), 12);
        assert_eq!(cpu.read_csr_raw(Csr::Mcause), 3); // breakpoint
    }

    #[test]
    fn jal_skips_instruction() {
        let mut cpu = create_cpu();
        cpu.halt_on_ecall = true;
        store_word(&mut cpu, 0, 0x008000ef); // jal x1, +8
        store_word(&mut cpu, 4, 0x00100513); // addi x10, x0, 1
        store_word(&mut cpu, 8, 0x00200513); // addi x10, x0, 2
        store_word(&mut cpu, 12, 0x00100073); // ebreak

        run_until_halt(&mut cpu, 10);
        assert_eq!(cpu.read_register(10), 2);
        assert_eq!(cpu.read_register(1), 4); // address of the skipped addi
    }

    #[test]
    fn load_store_byte_round_trip() {
        let mut cpu = create_cpu();
        cpu.halt_on_ecall = true;
        cpu.write_register(2, 0x1000);
        store_word(&mut cpu, 0, 0x05a00093); // addi x1, x0, 0x5a
        store_word(&mut cpu, 4, 0x00110023); // sb x1, 0(x2)
        store_word(&mut cpu, 8, 0x00014183); // lbu x3, 0(x2)
        store_word(&mut cpu, 12, 0x00010203); // lb x4, 0(x2)
        store_word(&mut cpu, 16, 0x00100073); // ebreak

        run_until_halt(&mut cpu, 10);
        assert_eq!(cpu.read_register(3), 0x5a);
        assert_eq!(cpu.read_register(4), 0x5a);
    }

    #[test]
    fn lb_sign_extends() {
        let mut cpu = create_cpu();
        cpu.write_register(2, 0x1000);
        cpu.memory.write(0x1000, 0x80, AccessWidth::Byte);
        store_word(&mut cpu, 0, 0x00010203); // lb x4, 0(x2)
        store_word(&mut cpu, 4, 0x00014183); // lbu x3, 0(x2)
        cpu.step();
        cpu.step();
        assert_eq!(cpu.read_register(4), 0xffff_ff80);
        assert_eq!(cpu.read_register(3), 0x80);
    }

    #[test]
    fn hardcoded_zero() {
        let mut cpu = create_cpu();
        store_word(&mut cpu, 0, 0x02a00013); // addi x0, x0, 42
        cpu.step();
        assert_eq!(cpu.read_register(0), 0);
    }

    #[test]
    fn shift_boundaries() {
        let mut cpu = create_cpu();
        store_word(&mut cpu, 0, 0x800000b7); // lui x1, 0x80000
        store_word(&mut cpu, 4, 0x41f0d113); // srai x2, x1, 31
        store_word(&mut cpu, 8, 0x00100193); // addi x3, x0, 1
        store_word(&mut cpu, 12, 0x01f19213); // slli x4, x3, 31
        for _ in 0..4 {
            cpu.step();
        }
        assert_eq!(cpu.read_register(1), 0x8000_0000);
        assert_eq!(cpu.read_register(2), 0xffff_ffff); // INT32_MIN >>a 31 == -1
        assert_eq!(cpu.read_register(4), 0x8000_0000);
    }

    #[test]
    fn slli_with_stray_funct7_bits_is_reserved() {
        let cpu = create_cpu();
        // slli x2, x1, 31 with funct7 = 0x01
        let word = 0x01f09113 | 1 << 25;
        assert_eq!(cpu.decoder.lookup(word), RESERVED);
        // srai keeps bit 30
        assert_ne!(cpu.decoder.lookup(0x41f0d113), RESERVED);
    }

    #[test]
    fn jalr_clears_low_bit() {
        let mut cpu = create_cpu();
        store_word(&mut cpu, 0, 0x00900093); // addi x1, x0, 9
        store_word(&mut cpu, 4, 0x00008167); // jalr x2, 0(x1)
        cpu.step();
        cpu.step();
        assert_eq!(cpu.read_pc(), 8); // 9 & !1
        assert_eq!(cpu.read_register(2), 8); // link = 4 + 4
    }

    #[test]
    fn branch_taken_and_not_taken() {
        let mut cpu = create_cpu();
        store_word(&mut cpu, 0, 0x00500093); // addi x1, x0, 5
        store_word(&mut cpu, 4, 0x00500113); // addi x2, x0, 5
        store_word(&mut cpu, 8, 0x00208463); // beq x1, x2, +8
        store_word(&mut cpu, 12, 0x00100193); // addi x3, x0, 1 (skipped)
        for _ in 0..3 {
            cpu.step();
        }
        assert_eq!(cpu.read_pc(), 16);
        assert_eq!(cpu.read_register(3), 0);

        let mut cpu = create_cpu();
        store_word(&mut cpu, 0, 0x00500093); // addi x1, x0, 5
        store_word(&mut cpu, 4, 0x00a00113); // addi x2, x0, 10
        store_word(&mut cpu, 8, 0x00208463); // beq x1, x2, +8 (not taken)
        store_word(&mut cpu, 12, 0x00100193); // addi x3, x0, 1
        for _ in 0..4 {
            cpu.step();
        }
        assert_eq!(cpu.read_register(3), 1);
    }

    #[test]
    fn misaligned_branch_target_traps() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x100);
        store_word(&mut cpu, 0, 0x00000163); // beq x0, x0, +2
        assert_eq!(cpu.step(), StepEvent::Trapped);
        assert_eq!(cpu.read_csr_raw(Csr::Mcause), 0);
        assert_eq!(cpu.read_csr_raw(Csr::Mtval), 2);
        assert_eq!(cpu.read_csr_raw(Csr::Mepc), 0);
        assert_eq!(cpu.read_pc(), 0x100);
    }

    #[test]
    fn misaligned_load_traps() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x100);
        cpu.write_register(2, 2);
        store_word(&mut cpu, 0, 0x00012183); // lw x3, 0(x2)
        cpu.step();
        assert_eq!(
            cpu.read_csr_raw(Csr::Mcause),
            TrapType::LoadAddressMisaligned as u32
        );
        assert_eq!(cpu.read_csr_raw(Csr::Mtval), 2);
        assert_eq!(cpu.last_access_addr(), 2);
    }

    #[test]
    fn load_outside_memory_is_access_fault() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x100);
        cpu.write_register(2, 0x0100_0000);
        store_word(&mut cpu, 0, 0x00012183); // lw x3, 0(x2)
        cpu.step();
        assert_eq!(
            cpu.read_csr_raw(Csr::Mcause),
            TrapType::LoadAccessFault as u32
        );
    }

    #[test]
    fn ecall_takes_machine_trap() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x100);
        store_word(&mut cpu, 0, 0x00000073); // ecall
        assert_eq!(cpu.step(), StepEvent::Trapped);
        assert_eq!(cpu.read_pc(), 0x100);
        assert_eq!(cpu.read_csr_raw(Csr::Mepc), 0);
        assert_eq!(cpu.read_csr_raw(Csr::Mcause), 11);
    }

    #[test]
    fn csr_swap() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mscratch, 0xdeadbeef);
        cpu.write_register(6, 0x1234);
        store_word(&mut cpu, 0, 0x340312f3); // csrrw x5, mscratch, x6
        cpu.step();
        assert_eq!(cpu.read_register(5), 0xdeadbeef);
        assert_eq!(cpu.read_csr_raw(Csr::Mscratch), 0x1234);
    }

    #[test]
    fn csr_set_clear_and_immediates() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mscratch, 0x55);
        cpu.write_register(4, 0x0f);
        store_word(&mut cpu, 0, 0x340222f3); // csrrs x5, mscratch, x4
        store_word(&mut cpu, 4, 0x05000393); // addi x7, x0, 0x50
        store_word(&mut cpu, 8, 0x3403b473); // csrrc x8, mscratch, x7
        store_word(&mut cpu, 12, 0x340fd573); // csrrwi x10, mscratch, 0x1f
        for _ in 0..4 {
            cpu.step();
        }
        assert_eq!(cpu.read_register(5), 0x55);
        assert_eq!(cpu.read_register(8), 0x5f);
        assert_eq!(cpu.read_register(10), 0x0f);
        assert_eq!(cpu.read_csr_raw(Csr::Mscratch), 0x1f);
    }

    #[test]
    fn csr_write_to_read_only_is_illegal() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x100);
        store_word(&mut cpu, 0, 0xf110d073); // csrrwi x0, mvendorid, 1
        cpu.step();
        assert_eq!(
            cpu.read_csr_raw(Csr::Mcause),
            TrapType::IllegalInstruction as u32
        );
        assert_eq!(cpu.read_csr_raw(Csr::Mtval), 0xf110d073);
        assert_eq!(cpu.read_pc(), 0x100);
    }

    #[test]
    fn csr_read_of_read_only_is_legal() {
        let mut cpu = create_cpu();
        store_word(&mut cpu, 0, 0xf1102573); // csrrs x10, mvendorid, x0
        assert_eq!(cpu.step(), StepEvent::Retired);
        assert_eq!(cpu.read_register(10), 0);
    }

    #[test]
    fn unknown_csr_is_illegal() {
        let mut cpu = create_cpu();
        store_word(&mut cpu, 0, 0x12302573); // csrrs x10, 0x123, x0
        assert_eq!(cpu.step(), StepEvent::Trapped);
        assert_eq!(
            cpu.read_csr_raw(Csr::Mcause),
            TrapType::IllegalInstruction as u32
        );
    }

    #[test]
    fn trap_updates_mstatus_and_mret_restores() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x8000);
        cpu.write_csr_raw(Csr::Mstatus, MSTATUS_MIE);
        store_word(&mut cpu, 0, 0x00000073); // ecall
        store_word(&mut cpu, 0x8000, 0x30200073); // mret

        cpu.step();
        let status = cpu.read_csr_raw(Csr::Mstatus);
        assert_eq!(status >> 3 & 1, 0, "MIE cleared");
        assert_eq!(status >> 7 & 1, 1, "MPIE holds old MIE");
        assert_eq!(status >> 11 & 3, 3, "MPP holds Machine");
        assert_eq!(cpu.read_pc(), 0x8000);

        cpu.step(); // mret
        assert_eq!(cpu.read_pc(), 0);
        let status = cpu.read_csr_raw(Csr::Mstatus);
        assert_eq!(status >> 3 & 1, 1, "MIE restored");
        assert_eq!(status >> 7 & 1, 1, "MPIE set");
        assert_eq!(cpu.privilege_mode(), PrivilegeMode::Machine);
    }

    #[test]
    fn vectored_interrupt_dispatch() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x101); // vectored, base 0x100
        cpu.write_csr_raw(Csr::Mie, MIP_MTIP);
        cpu.write_csr_raw(Csr::Mstatus, MSTATUS_MIE);
        cpu.write_csr_raw(Csr::Mtimecmp, 1);
        store_word(&mut cpu, 0, 0x00000013); // nop

        assert_eq!(cpu.step(), StepEvent::Trapped);
        assert_eq!(cpu.read_pc(), 0x100 + 4 * 7);
        assert_eq!(cpu.read_csr_raw(Csr::Mcause), 0x8000_0007);
    }

    #[test]
    fn exception_ignores_vectored_mode() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x101);
        store_word(&mut cpu, 0, 0x00000073); // ecall
        cpu.step();
        assert_eq!(cpu.read_pc(), 0x100);
    }

    #[test]
    fn interrupt_needs_global_enable() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x100);
        cpu.write_csr_raw(Csr::Mie, MIP_MTIP);
        cpu.write_csr_raw(Csr::Mtimecmp, 1);
        store_word(&mut cpu, 0, 0x00000013); // nop
        assert_eq!(cpu.step(), StepEvent::Retired);
        assert_eq!(cpu.read_pc(), 4);

        cpu.write_csr_raw(Csr::Mstatus, MSTATUS_MIE);
        assert_eq!(cpu.step(), StepEvent::Trapped);
        assert_eq!(cpu.read_pc(), 0x100);
        assert_eq!(cpu.read_csr_raw(Csr::Mepc), 4);
    }

    #[test]
    fn mtimecmp_write_clears_pending_timer() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtimecmp, 1);
        cpu.cycle = 10;
        cpu.service_timer();
        assert_ne!(cpu.mip & MIP_MTIP, 0);
        cpu.write_csr_raw(Csr::Mtimecmp, u32::MAX);
        assert_eq!(cpu.mip & MIP_MTIP, 0);
    }

    #[test]
    fn external_interrupt_callback_priority() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x100);
        cpu.write_csr_raw(Csr::Mie, MIP_MEIP | MIP_MSIP);
        cpu.write_csr_raw(Csr::Mstatus, MSTATUS_MIE);
        cpu.register_int_callback(Box::new(|| irq::EXTERNAL | irq::SOFTWARE));
        store_word(&mut cpu, 0, 0x00000013);

        assert_eq!(cpu.step(), StepEvent::Trapped);
        // Both lines pending; external wins
        assert_eq!(cpu.read_csr_raw(Csr::Mcause), 0x8000_000b);
    }

    #[test]
    fn halt_on_reserved_leaves_pc_and_instruction() {
        let mut cpu = create_cpu();
        cpu.halt_on_reserved = true;
        store_word(&mut cpu, 0, 0xffff_ffff);
        assert_eq!(cpu.step(), StepEvent::HaltReserved);
        assert_eq!(cpu.read_pc(), 0);
        assert_eq!(cpu.curr_instruction(), 0xffff_ffff);
        // No trap entered
        assert_eq!(cpu.read_csr_raw(Csr::Mcause), 0);
    }

    #[test]
    fn reserved_without_halt_traps_illegal() {
        let mut cpu = create_cpu();
        cpu.write_csr_raw(Csr::Mtvec, 0x100);
        store_word(&mut cpu, 0, 0xffff_ffff);
        assert_eq!(cpu.step(), StepEvent::Trapped);
        assert_eq!(
            cpu.read_csr_raw(Csr::Mcause),
            TrapType::IllegalInstruction as u32
        );
        assert_eq!(cpu.read_csr_raw(Csr::Mtval), 0xffff_ffff);
    }

    #[test]
    fn without_zicsr_traps_redirect_to_fixed_vector() {
        let mut cpu = Cpu::new(
            Extensions {
                zicsr: false,
                fext: false,
            },
            0x10000,
        );
        store_word(&mut cpu, 0, 0x340312f3); // csrrw x5, mscratch, x6
        assert_eq!(cpu.step(), StepEvent::Trapped);
        assert_eq!(cpu.read_pc(), FIXED_MTVEC_ADDR);

        // F-family opcodes are reserved too
        cpu.update_pc(8);
        store_word(&mut cpu, 8, 0x00012087); // flw f1, 0(x2)
        assert_eq!(cpu.step(), StepEvent::Trapped);
        assert_eq!(cpu.read_pc(), FIXED_MTVEC_ADDR);
    }

    #[test]
    fn retired_tracks_straight_line_progress() {
        let mut cpu = create_cpu();
        store_word(&mut cpu, 0, 0x00000013);
        store_word(&mut cpu, 4, 0x00000013);
        store_word(&mut cpu, 8, 0x00000013);
        for _ in 0..3 {
            assert_eq!(cpu.step(), StepEvent::Retired);
        }
        assert_eq!(cpu.insts_retired(), 3);
        assert_eq!(cpu.read_pc(), 12);
    }

    #[test]
    fn fetch_fault_is_unrecoverable() {
        let mut cpu = create_cpu();
        cpu.update_pc(0x0100_0000);
        assert_eq!(cpu.step(), StepEvent::FetchFault);
    }

    #[test]
    fn reset_restores_initial_state() {
        let mut cpu = create_cpu();
        cpu.set_reset_vector(0x40);
        cpu.write_register(5, 99);
        cpu.write_csr_raw(Csr::Mscratch, 7);
        cpu.cycle = 123;
        cpu.instret = 9;
        cpu.reset();
        assert_eq!(cpu.read_pc(), 0x40);
        assert_eq!(cpu.read_register(5), 0);
        assert_eq!(cpu.read_csr_raw(Csr::Mscratch), 0);
        assert_eq!(cpu.clk_cycles(), 0);
        assert_eq!(cpu.insts_retired(), 0);
        assert_eq!(cpu.privilege_mode(), PrivilegeMode::Machine);
        assert_ne!(cpu.read_csr_raw(Csr::Misa), 0);
    }

    #[test]
    fn hart_state_round_trip() {
        let mut cpu = create_cpu();
        cpu.write_register(7, 0x1234);
        cpu.write_csr_raw(Csr::Mscratch, 0xabcd);
        cpu.update_pc(0x60);
        let state = cpu.hart_state();

        let mut other = create_cpu();
        other.set_hart_state(&state);
        assert_eq!(other.read_register(7), 0x1234);
        assert_eq!(other.read_csr_raw(Csr::Mscratch), 0xabcd);
        assert_eq!(other.read_pc(), 0x60);
    }

    #[test]
    fn decode_key_mnemonics() {
        let cpu = create_cpu();
        for (word, name) in [
            (0x00500093, "addi"),
            (0x008000ef, "jal"),
            (0x00008167, "jalr"),
            (0x00208463, "beq"),
            (0x00014183, "lbu"),
            (0x00110023, "sb"),
            (0x40208133u32, "sub"),
            (0x00000073, "ecall"),
            (0x00100073, "ebreak"),
            (0x30200073, "mret"),
            (0x340312f3, "csrrw"),
            (0x0000000f, "fence"),
        ] {
            let op = cpu.decoder.get(cpu.decoder.lookup(word));
            assert_eq!(op.name, name, "word {word:#010x}");
        }
    }

    #[test]
    fn disassemble_format() {
        let mut cpu = create_cpu();
        store_word(&mut cpu, 0, 0x00500093); // addi x1, x0, 5
        let mut s = String::new();
        assert!(cpu.disassemble(0, &mut s, false));
        assert_eq!(s, "00000000: 00500093    addi x1,x0,5");

        cpu.abi_en = true;
        s.clear();
        cpu.disassemble(0, &mut s, false);
        assert_eq!(s, "00000000: 00500093    addi ra,zero,5");
    }

    #[test]
    fn simple_loop_sums() {
        let mut cpu = create_cpu();
        cpu.halt_on_ecall = true;
        cpu.write_csr_raw(Csr::Mtvec, 0x100);
        // 1 + 2 + 3
        store_word(&mut cpu, 0, 0x00000093); // addi x1, x0, 0
        store_word(&mut cpu, 4, 0x00100113); // addi x2, x0, 1
        store_word(&mut cpu, 8, 0x00400193); // addi x3, x0, 4
        store_word(&mut cpu, 12, 0x002080b3); // add x1, x1, x2
        store_word(&mut cpu, 16, 0x00110113); // addi x2, x2, 1
        store_word(&mut cpu, 20, 0xfe314ce3); // blt x2, x3, -8
        store_word(&mut cpu, 24, 0x00000073); // ecall

        let ev = run_until_halt(&mut cpu, 100);
        assert_eq!(ev, StepEvent::HaltEcall);
        assert_eq!(cpu.read_register(1), 6);
        assert_eq!(cpu.read_csr_raw(Csr::Mepc), 24);
        assert_eq!(cpu.read_csr_raw(Csr::Mcause), 11);
    }
}
