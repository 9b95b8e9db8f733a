//! ATE (HP93000) test-vector generation over JTAG/RISC-V and PULP debug
//! TAPs: a typed vector model, a JTAG TAP controller driver, the two debug
//! TAP protocols layered on it, an ELF byte-map loader, and an AVC text
//! sink.

pub mod bitarray;
pub mod chip;
pub mod elf;
pub mod error;
pub mod jtag;
#[cfg(feature = "sim")]
pub mod sim;
pub mod sink;
pub mod taps;
pub mod vector;

pub use chip::ReferenceChip;
pub use error::AppError;
