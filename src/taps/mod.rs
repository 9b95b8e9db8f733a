//! Protocol-specific TAPs layered on top of [`crate::jtag`].

pub mod pulp;
pub mod riscv;
