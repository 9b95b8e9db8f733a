//! Top-level error type for the CLI boundary.
//!
//! Each layer (bit vectors, the vector model, the JTAG/TAP stack, the ELF
//! loader, the vector sinks) defines its own error enum close to where the
//! failure actually occurs. `AppError` folds all of them into one type via
//! `#[from]`, the same way the boot layer folds `KvmError` into `BootError`.

use thiserror::Error;

use crate::bitarray::BitArrayError;
use crate::elf::ElfError;
use crate::jtag::JtagError;
use crate::sink::SinkError;
use crate::taps::pulp::PulpError;
use crate::taps::riscv::RiscvError;
use crate::vector::VectorError;

/// Errors surfaced to the CLI entry point.
#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    Jtag(#[from] JtagError),

    #[error(transparent)]
    BitArray(#[from] BitArrayError),

    #[error(transparent)]
    Elf(#[from] ElfError),

    #[error(transparent)]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Pulp(#[from] PulpError),

    #[error(transparent)]
    Riscv(#[from] RiscvError),

    #[error("invalid argument {arg}: {reason}")]
    InvalidArgument { arg: String, reason: String },
}
