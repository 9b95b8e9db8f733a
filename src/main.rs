//! tapstim - deterministic HP93000 AVC test-vector generation over JTAG
//! debug TAPs, wired against one reference RISC-V + PULP chip target.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Args as ClapArgs, Parser, Subcommand};

use tapstim::chip::ReferenceChip;
use tapstim::error::AppError;
use tapstim::sink::avc::AvcSink;
use tapstim::sink::VectorSink;
use tapstim::vector::Vector;

#[derive(Parser, Debug)]
#[command(name = "tapstim")]
#[command(about = "Generate deterministic HP93000 AVC vectors for a RISC-V/PULP debug TAP chain")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    #[command(subcommand)]
    command: Command,
}

#[derive(ClapArgs, Debug)]
struct CommonArgs {
    /// Output .avc path (companion .wtb/.tmf are written alongside it)
    #[arg(short, long)]
    output: PathBuf,

    /// PORT statement name; omitted entirely if not given
    #[arg(short = 'p', long = "port-name")]
    port_name: Option<String>,

    /// Wave-table name written into the .wtb companion file
    #[arg(short = 'w', long = "wtb-name", default_value = "Standard ATI")]
    wtb_name: String,

    /// Device-cycle name used on every normal-vector line
    #[arg(short = 'd', long = "device_cycle_name", default_value = "dvc_1")]
    device_cycle_name: String,

    /// Run-length compress the vector stream before writing
    #[arg(short, long)]
    compress: bool,

    /// Skip the leading chip reset this command would otherwise emit
    #[arg(long = "no-reset")]
    no_reset: bool,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// TRST pulse, returning both TAPs to Run-Test/Idle with BYPASS selected
    ResetChip,

    /// Read back both TAPs' IDCODE registers
    VerifyIdcode,

    /// Halt the configured hart and verify its program counter
    HaltCoreVerifyPc {
        #[arg(long = "expected-pc")]
        expected_pc: String,
        #[arg(long = "wait-cycles")]
        wait_cycles: Option<u32>,
    },

    /// Resume the configured hart
    ResumeCore {
        #[arg(long = "wait-cycles")]
        wait_cycles: Option<u32>,
    },

    /// Write one word: `0xADDR=0xVAL[#comment]`
    WriteMem {
        entry: String,
        /// Use RISC-V System Bus Access instead of the PULP burst path
        #[arg(long)]
        sba: bool,
    },

    /// Verify one word: `0xADDR=0xVAL[#comment]`
    VerifyMem {
        entry: String,
        #[arg(long)]
        sba: bool,
    },

    /// Preload an ELF's loadable segments
    ExecuteElf {
        #[arg(short = 'e', long)]
        elf: PathBuf,
        #[arg(long)]
        sba: bool,
        #[arg(long = "wait-cycles")]
        wait_cycles: Option<u32>,
    },

    /// Poll the end-of-computation status word
    CheckEoc {
        #[arg(short = 'r', long = "return-code", default_value = "0")]
        return_code: String,
        #[arg(long = "eoc-wait-cycles", default_value_t = 10)]
        eoc_wait_cycles: u32,
        /// Use the fixed-wait flavor instead of the matched-loop poll
        #[arg(long = "no-loop")]
        no_loop: bool,
    },
}

fn parse_u32(arg: &str, value: &str) -> Result<u32, AppError> {
    let value = value.trim();
    let (radix, digits) = match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => (16, hex),
        None => (10, value),
    };
    u32::from_str_radix(digits, radix).map_err(|e| AppError::InvalidArgument {
        arg: arg.to_string(),
        reason: e.to_string(),
    })
}

/// Parse `0xADDR=0xVAL[#comment]`, returning `(addr, value)`. The trailing
/// comment is accepted but not otherwise used by the reference chip's
/// single-word commands.
fn parse_addr_value(entry: &str) -> Result<(u32, u32), AppError> {
    let without_comment = entry.split('#').next().unwrap_or(entry);
    let (addr, value) = without_comment.split_once('=').ok_or_else(|| AppError::InvalidArgument {
        arg: entry.to_string(),
        reason: "expected ADDR=VAL".to_string(),
    })?;
    Ok((parse_u32("addr", addr)?, parse_u32("value", value)?))
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

fn run(cli: Cli) -> Result<(), AppError> {
    let chip = ReferenceChip::new();
    let common = cli.common;

    let mut vectors: Vec<Vector> = Vec::new();
    if !common.no_reset && !matches!(cli.command, Command::ResetChip) {
        vectors.extend(chip.reset_chip()?);
    }

    match cli.command {
        Command::ResetChip => vectors.extend(chip.reset_chip()?),
        Command::VerifyIdcode => vectors.extend(chip.verify_idcode()?),
        Command::HaltCoreVerifyPc { expected_pc, wait_cycles } => {
            let expected_pc = parse_u32("expected-pc", &expected_pc)?;
            vectors.extend(chip.halt_core_verify_pc(expected_pc, wait_cycles)?);
        }
        Command::ResumeCore { wait_cycles } => vectors.extend(chip.resume_core(wait_cycles)?),
        Command::WriteMem { entry, sba } => {
            let (addr, value) = parse_addr_value(&entry)?;
            vectors.extend(chip.write_mem(addr, value, sba)?);
        }
        Command::VerifyMem { entry, sba } => {
            let (addr, expected) = parse_addr_value(&entry)?;
            vectors.extend(chip.verify_mem(addr, expected, sba)?);
        }
        Command::ExecuteElf { elf, sba, wait_cycles } => {
            vectors.extend(chip.execute_elf(&elf, sba, wait_cycles)?);
        }
        Command::CheckEoc { return_code, eoc_wait_cycles, no_loop } => {
            let return_code = parse_u32("return-code", &return_code)?;
            vectors.extend(chip.check_eoc(return_code, eoc_wait_cycles, !no_loop)?);
        }
    }

    let mut sink = AvcSink::new(
        common.output,
        &chip.pins,
        common.port_name,
        common.device_cycle_name,
        common.wtb_name,
    );
    sink.open()?;
    sink.write_vectors(&vectors, common.compress)?;
    sink.close()?;

    Ok(())
}
