//! rv32sim: an RV32IF(+Zicsr) instruction set simulator.
//!
//! The simulator executes RV32I programs with the Zicsr and F extensions
//! optionally compiled into the decode tables. One hart is modelled; the
//! embedder drives it through [`Simulator`] and may attach a bus callback
//! for memory-mapped devices and an interrupt callback for external
//! interrupt lines.
//!
//! Sample code to run an executable to completion:
//! ```ignore
//! let mut sim = Simulator::new();
//! sim.read_elf(Path::new("prog.elf"))?;
//! let exit = sim.run(RunConfig::default());
//! ```
//!
//! # Module structure
//!
//! - `cpu`: hart state, trap unit, instruction semantics, run-loop step
//! - `decode`: the hierarchical decode-table arena
//! - `memory`: internal memory window and external bus callback
//! - `csr`: CSR addresses, write masks, status bit layout
//! - `elf_analyzer`: ELF32 executable intake

pub mod cpu;
pub mod csr;
pub mod decode;
pub mod elf_analyzer;
pub mod memory;

use crate::cpu::{Cpu, Extensions, HartState, StepEvent};
use crate::elf_analyzer::{ElfAnalyzer, ElfError, PT_LOAD};
use crate::memory::{AccessWidth, BusCallback, DEFAULT_MEMORY_BYTES};
pub use cpu::InterruptCallback;
use fnv::FnvHashMap;
use std::io;
use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// Host-observable failures, as opposed to guest-visible traps which are
/// handled inside the core.
#[derive(Debug, Error)]
pub enum SimError {
    #[error(transparent)]
    Elf(#[from] ElfError),
    #[error("segment byte at {0:#010x} does not fit in simulated memory")]
    SegmentOutOfRange(u32),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Process-style exit code of a completed run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExitCode {
    /// Clean termination: a halt flag fired or the cycle budget ran out.
    Terminated = 0,
    /// Halted on a reserved/illegal instruction (halt_on_reserved).
    ReservedHalt = 1,
    /// The executable could not be loaded.
    ElfLoadError = 2,
    /// Unrecoverable bus error (instruction fetch failed).
    BusError = 3,
}

impl ExitCode {
    #[must_use]
    pub const fn code(self) -> i32 {
        self as i32
    }
}

/// Per-run configuration.
pub struct RunConfig {
    /// PC after reset, before any entry point is applied.
    pub reset_vector: u32,
    /// Stop after this many cycles; 0 runs unbounded.
    pub cycle_budget: u64,
    /// Stop cleanly when the guest executes ecall or ebreak.
    pub halt_on_ecall: bool,
    /// Stop (exit code 1) on a reserved encoding, before the trap is
    /// entered, leaving the offending instruction inspectable.
    pub halt_on_reserved: bool,
    /// Dump a disassembly of the loaded image instead of executing.
    pub disassemble: bool,
    /// Trace each instruction to the sink as it executes.
    pub rt_disassem: bool,
    /// ABI register names (a0, fs1, ...) instead of x/f numbers.
    pub abi_register_names: bool,
    /// Overrides the ELF entry point.
    pub entry_point_override: Option<u32>,
    /// Destination for disassembly output; stdout when absent.
    pub trace_sink: Option<Box<dyn Write>>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            reset_vector: 0,
            cycle_budget: 0,
            halt_on_ecall: true,
            halt_on_reserved: false,
            disassemble: false,
            rt_disassem: false,
            abi_register_names: false,
            entry_point_override: None,
            trace_sink: None,
        }
    }
}

/// The embedder-facing simulator: a CPU core plus executable intake.
pub struct Simulator {
    cpu: Cpu,
    entry_point: Option<u32>,
    loaded_range: Option<(u32, u32)>,
    symbol_map: FnvHashMap<String, u32>,
}

impl Simulator {
    #[must_use]
    pub fn new() -> Self {
        Self::with_extensions(Extensions::default())
    }

    #[must_use]
    pub fn with_extensions(ext: Extensions) -> Self {
        Self {
            cpu: Cpu::new(ext, DEFAULT_MEMORY_BYTES),
            entry_point: None,
            loaded_range: None,
            symbol_map: FnvHashMap::default(),
        }
    }

    /// Loads an ELF executable: PT_LOAD segments go to memory through
    /// the bus path, the entry point and symbol map are captured.
    ///
    /// # Errors
    /// [`SimError`] on I/O failure, a malformed image, or a segment that
    /// fits in neither the internal window nor a registered callback.
    pub fn read_elf(&mut self, path: &Path) -> Result<(), SimError> {
        self.load_elf(std::fs::read(path)?)
    }

    pub fn load_elf(&mut self, data: Vec<u8>) -> Result<(), SimError> {
        let analyzer = ElfAnalyzer::new(data);
        let header = analyzer.read_header()?;

        for ph in analyzer
            .read_program_headers(&header)?
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD && ph.p_filesz > 0)
        {
            let bytes = analyzer.bytes(ph.p_offset, ph.p_filesz)?;
            for (i, byte) in bytes.iter().enumerate() {
                let addr = ph.p_paddr.wrapping_add(i as u32);
                if self
                    .cpu
                    .write_mem(addr, u32::from(*byte), AccessWidth::Byte)
                {
                    return Err(SimError::SegmentOutOfRange(addr));
                }
            }
            let end = ph.p_paddr.wrapping_add(ph.p_filesz);
            self.loaded_range = Some(match self.loaded_range {
                None => (ph.p_paddr, end),
                Some((lo, hi)) => (lo.min(ph.p_paddr), hi.max(end)),
            });
        }

        self.symbol_map = analyzer.create_symbol_map(&header)?;
        self.entry_point = Some(header.e_entry);
        Ok(())
    }

    /// Resets the hart and executes until a halt condition, the cycle
    /// budget, or an unrecoverable fault.
    pub fn run(&mut self, mut cfg: RunConfig) -> ExitCode {
        self.cpu.set_reset_vector(cfg.reset_vector);
        self.cpu.reset();
        if let Some(entry) = cfg.entry_point_override.or(self.entry_point) {
            self.cpu.update_pc(entry);
        }
        self.cpu.halt_on_ecall = cfg.halt_on_ecall;
        self.cpu.halt_on_reserved = cfg.halt_on_reserved;
        self.cpu.abi_en = cfg.abi_register_names;

        let mut sink: Box<dyn Write> = cfg
            .trace_sink
            .take()
            .unwrap_or_else(|| Box::new(io::stdout()));

        if cfg.disassemble {
            self.dump_disassembly(&mut sink);
            return ExitCode::Terminated;
        }

        let mut line = String::new();
        loop {
            if cfg.rt_disassem {
                line.clear();
                self.cpu.disassemble(self.cpu.read_pc(), &mut line, true);
                let _ = writeln!(sink, "{line}");
            }
            match self.cpu.step() {
                StepEvent::Retired | StepEvent::Trapped => {}
                StepEvent::HaltEcall => return ExitCode::Terminated,
                StepEvent::HaltReserved => return ExitCode::ReservedHalt,
                StepEvent::FetchFault => return ExitCode::BusError,
            }
            if cfg.cycle_budget != 0 && self.cpu.clk_cycles() >= cfg.cycle_budget {
                return ExitCode::Terminated;
            }
        }
    }

    fn dump_disassembly(&mut self, sink: &mut dyn Write) {
        let Some((lo, hi)) = self.loaded_range else {
            return;
        };
        let mut line = String::new();
        let mut addr = lo & !3;
        while addr < hi {
            line.clear();
            self.cpu.disassemble(addr, &mut line, false);
            let _ = writeln!(sink, "{line}");
            addr = addr.wrapping_add(4);
        }
    }

    /// Direct memory access, between steps.
    pub fn read_mem(&mut self, addr: u32, width: AccessWidth) -> (u32, bool) {
        self.cpu.read_mem(addr, width)
    }

    pub fn write_mem(&mut self, addr: u32, value: u32, width: AccessWidth) -> bool {
        self.cpu.write_mem(addr, value, width)
    }

    /// Generates a reset-pin event on the core.
    pub fn reset_cpu(&mut self) {
        self.cpu.reset();
    }

    /// Value of the indexed integer register.
    #[must_use]
    pub fn regi(&self, idx: u32) -> u32 {
        self.cpu.read_register((idx % 32) as u8)
    }

    #[must_use]
    pub const fn pc(&self) -> u32 {
        self.cpu.read_pc()
    }

    #[must_use]
    pub fn hart_state(&self) -> HartState {
        self.cpu.hart_state()
    }

    pub fn set_hart_state(&mut self, state: &HartState) {
        self.cpu.set_hart_state(state);
    }

    pub fn register_mem_callback(&mut self, callback: BusCallback) {
        self.cpu.register_mem_callback(callback);
    }

    pub fn register_interrupt_callback(&mut self, callback: InterruptCallback) {
        self.cpu.register_int_callback(callback);
    }

    /// Virtual address of a symbol from the loaded executable.
    #[must_use]
    pub fn address_of_symbol(&self, name: &str) -> Option<u32> {
        self.symbol_map.get(name).copied()
    }

    /// Returns immutable reference to `Cpu`.
    #[must_use]
    pub const fn get_cpu(&self) -> &Cpu {
        &self.cpu
    }

    /// Returns mutable reference to `Cpu`.
    pub fn get_mut_cpu(&mut self) -> &mut Cpu {
        &mut self.cpu
    }
}

impl Default for Simulator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test_simulator {
    use super::*;
    use crate::elf_analyzer::test_support::synthetic_elf;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Clone, Default)]
    struct SharedSink(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn load_words(sim: &mut Simulator, base: u32, words: &[u32]) {
        for (i, w) in words.iter().enumerate() {
            assert!(!sim.write_mem(base + 4 * i as u32, *w, AccessWidth::Word));
        }
    }

    #[test]
    fn run_halts_cleanly_on_ebreak() {
        let mut sim = Simulator::new();
        load_words(
            &mut sim,
            0,
            &[
                0x00500093, // addi x1, x0, 5
                0x00708113, // addi x2, x1, 7
                0x00100073, // ebreak
            ],
        );
        let exit = sim.run(RunConfig::default());
        assert_eq!(exit, ExitCode::Terminated);
        assert_eq!(exit.code(), 0);
        assert_eq!(sim.regi(1), 5);
        assert_eq!(sim.regi(2), 12);
        assert_eq!(sim.pc(), 8);
    }

    #[test]
    fn run_reports_reserved_halt() {
        let mut sim = Simulator::new();
        load_words(&mut sim, 0, &[0xffff_ffff]);
        let exit = sim.run(RunConfig {
            halt_on_reserved: true,
            ..RunConfig::default()
        });
        assert_eq!(exit, ExitCode::ReservedHalt);
        assert_eq!(sim.get_cpu().curr_instruction(), 0xffff_ffff);
    }

    #[test]
    fn run_reports_bus_error_on_unmapped_fetch() {
        let mut sim = Simulator::new();
        let exit = sim.run(RunConfig {
            entry_point_override: Some(0xf000_0000),
            ..RunConfig::default()
        });
        assert_eq!(exit, ExitCode::BusError);
    }

    #[test]
    fn cycle_budget_bounds_the_run() {
        let mut sim = Simulator::new();
        // jal x0, 0 spins forever
        load_words(&mut sim, 0, &[0x0000006f]);
        let exit = sim.run(RunConfig {
            cycle_budget: 100,
            ..RunConfig::default()
        });
        assert_eq!(exit, ExitCode::Terminated);
        assert!(sim.get_cpu().clk_cycles() >= 100);
    }

    #[test]
    fn elf_load_and_run() {
        let mut sim = Simulator::new();
        let payload: Vec<u8> = [
            0x02a00093u32, // addi x1, x0, 42
            0x00100073,    // ebreak
        ]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
        sim.load_elf(synthetic_elf(0x80, 0x80, &payload)).unwrap();
        assert_eq!(sim.address_of_symbol("main"), Some(0x80));

        let exit = sim.run(RunConfig::default());
        assert_eq!(exit, ExitCode::Terminated);
        assert_eq!(sim.regi(1), 42);
        assert_eq!(sim.pc(), 0x84);
    }

    #[test]
    fn elf_errors_are_reported() {
        let mut sim = Simulator::new();
        assert!(matches!(
            sim.load_elf(vec![0; 16]),
            Err(SimError::Elf(ElfError::NotElf))
        ));
        // A segment outside memory with no callback cannot be loaded
        let image = synthetic_elf(0xf000_0000, 0xf000_0000, &[0; 4]);
        assert!(matches!(
            sim.load_elf(image),
            Err(SimError::SegmentOutOfRange(0xf000_0000))
        ));
    }

    #[test]
    fn entry_point_override_wins() {
        let mut sim = Simulator::new();
        let payload: Vec<u8> = [
            0x02a00093u32, // addi x1, x0, 42 (entry per ELF)
            0x00100073,    // ebreak
        ]
        .iter()
        .flat_map(|w| w.to_le_bytes())
        .collect();
        sim.load_elf(synthetic_elf(0x80, 0x80, &payload)).unwrap();
        // Skip the addi
        let exit = sim.run(RunConfig {
            entry_point_override: Some(0x84),
            ..RunConfig::default()
        });
        assert_eq!(exit, ExitCode::Terminated);
        assert_eq!(sim.regi(1), 0);
    }

    #[test]
    fn mem_callback_extends_the_bus() {
        let mut sim = Simulator::new();
        let device = Rc::new(RefCell::new(0u32));
        let device_in_cb = Rc::clone(&device);
        sim.register_mem_callback(Box::new(move |addr, data, _width, is_write| {
            if addr != 0xf000_0000 {
                return 1;
            }
            if is_write {
                *device_in_cb.borrow_mut() = *data;
            } else {
                *data = *device_in_cb.borrow();
            }
            0
        }));

        assert!(!sim.write_mem(0xf000_0000, 0x1234, AccessWidth::Word));
        assert_eq!(*device.borrow(), 0x1234);
        assert_eq!(sim.read_mem(0xf000_0000, AccessWidth::Word), (0x1234, false));
        assert_eq!(sim.read_mem(0xf000_0004, AccessWidth::Word), (0, true));
    }

    #[test]
    fn rt_disassem_traces_to_sink() {
        let sink = SharedSink::default();
        let mut sim = Simulator::new();
        load_words(&mut sim, 0, &[0x00500093, 0x00100073]); // addi; ebreak
        let exit = sim.run(RunConfig {
            rt_disassem: true,
            trace_sink: Some(Box::new(sink.clone())),
            ..RunConfig::default()
        });
        assert_eq!(exit, ExitCode::Terminated);
        let out = String::from_utf8(sink.0.borrow().clone()).unwrap();
        // rt traces evaluate operands, so register values ride along
        assert!(out.contains("00000000: 00500093    addi x1:0,x0:0,5"), "{out}");
        assert!(out.contains("ebreak"), "{out}");
    }

    #[test]
    fn disassemble_mode_dumps_without_executing() {
        let sink = SharedSink::default();
        let mut sim = Simulator::new();
        let payload: Vec<u8> = [0x00500093u32, 0x00100073]
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect();
        sim.load_elf(synthetic_elf(0x80, 0x80, &payload)).unwrap();
        let exit = sim.run(RunConfig {
            disassemble: true,
            trace_sink: Some(Box::new(sink.clone())),
            ..RunConfig::default()
        });
        assert_eq!(exit, ExitCode::Terminated);
        assert_eq!(sim.regi(1), 0, "nothing executed");
        let out = String::from_utf8(sink.0.borrow().clone()).unwrap();
        assert!(out.contains("00000080: 00500093    addi x1,x0,5"), "{out}");
    }

    #[test]
    fn hart_state_survives_round_trip() {
        let mut sim = Simulator::new();
        load_words(&mut sim, 0, &[0x00500093, 0x00100073]);
        sim.run(RunConfig::default());
        let state = sim.hart_state();

        let mut other = Simulator::new();
        other.set_hart_state(&state);
        assert_eq!(other.regi(1), 5);
        assert_eq!(other.pc(), sim.pc());
    }
}
