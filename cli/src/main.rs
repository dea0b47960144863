use getopts::Options;
use rv32sim::{ExitCode, RunConfig, Simulator};
use std::env;
use std::path::Path;
use std::process::exit;

fn print_usage(program: &str, opts: &Options) {
    let usage = format!("Usage: {program} program_file [options]");
    print!("{}", opts.usage(&usage));
}

fn parse_addr(s: &str) -> Result<u32, String> {
    let t = s.trim_start_matches("0x");
    u32::from_str_radix(t, 16).map_err(|e| format!("bad address '{s}': {e}"))
}

fn main() {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let program = args[0].clone();

    let mut opts = Options::new();
    opts.optopt("c", "cycles", "Cycle budget, 0 for unbounded", "N");
    opts.optopt("r", "reset-vector", "Reset vector (hex)", "ADDR");
    opts.optopt("e", "entry", "Entry point override (hex)", "ADDR");
    opts.optflag("d", "disassemble", "Disassemble the image instead of running");
    opts.optflag("t", "trace", "Trace each executed instruction");
    opts.optflag("a", "abi", "Use ABI register names in disassembly");
    opts.optflag("k", "keep-running", "Do not halt on ecall/ebreak");
    opts.optflag("R", "halt-reserved", "Halt on reserved instructions");
    opts.optflag("h", "help", "Show this help menu");

    let matches = match opts.parse(&args[1..]) {
        Ok(m) => m,
        Err(f) => {
            eprintln!("{f}");
            print_usage(&program, &opts);
            exit(2);
        }
    };

    if matches.opt_present("h") || matches.free.is_empty() {
        print_usage(&program, &opts);
        exit(if matches.opt_present("h") { 0 } else { 2 });
    }

    let mut cfg = RunConfig {
        halt_on_ecall: !matches.opt_present("k"),
        halt_on_reserved: matches.opt_present("R"),
        disassemble: matches.opt_present("d"),
        rt_disassem: matches.opt_present("t"),
        abi_register_names: matches.opt_present("a"),
        ..RunConfig::default()
    };
    if let Some(n) = matches.opt_str("c") {
        match n.parse() {
            Ok(n) => cfg.cycle_budget = n,
            Err(e) => {
                eprintln!("bad cycle budget '{n}': {e}");
                exit(2);
            }
        }
    }
    if let Some(addr) = matches.opt_str("r") {
        match parse_addr(&addr) {
            Ok(a) => cfg.reset_vector = a,
            Err(e) => {
                eprintln!("{e}");
                exit(2);
            }
        }
    }
    if let Some(addr) = matches.opt_str("e") {
        match parse_addr(&addr) {
            Ok(a) => cfg.entry_point_override = Some(a),
            Err(e) => {
                eprintln!("{e}");
                exit(2);
            }
        }
    }

    let mut sim = Simulator::new();
    if let Err(e) = sim.read_elf(Path::new(&matches.free[0])) {
        eprintln!("{}: {e}", matches.free[0]);
        exit(ExitCode::ElfLoadError.code());
    }

    let code = sim.run(cfg);
    log::info!(
        "executed {} instructions in {} cycles",
        sim.get_cpu().insts_retired(),
        sim.get_cpu().clk_cycles()
    );
    exit(code.code());
}
