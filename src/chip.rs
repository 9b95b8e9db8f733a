//! Reference chip target: one concrete wiring of a RISC-V Debug TAP and a
//! PULP Advanced-Debug TAP into a two-TAP chain, a generic pin table, and
//! the default protocol constants (hart id, EOC address, retry cap) the CLI
//! uses when no override is given.
//!
//! This is not modeled on any specific real part; the per-chip configuration
//! commands (GPIO mux, SoC config register polarity, …) are left to callers
//! embedding the library against their own chip's register map.

use std::collections::BTreeMap;
use std::path::Path;

use crate::bitarray::BitArray;
use crate::elf;
use crate::error::AppError;
use crate::jtag::{ExpectedBits, JtagDriver, JtagPins};
use crate::taps::pulp::{self, PulpTap};
use crate::taps::riscv::{self, RiscvTap, CSR_DPC, DEFAULT_EOC_ADDR};
use crate::vector::{PinDecl, PinDirection, Vector, VectorBuilder};

/// A chip target's fixed configuration: pin table, TAP chain IDCODEs, and
/// protocol defaults. Threaded explicitly into every command instead of
/// living behind global state.
pub struct ReferenceChip {
    pub pins: BTreeMap<String, PinDecl>,
    pub jtag_pins: JtagPins,
    pub riscv_idcode: u32,
    pub pulp_idcode: u32,
    pub hart: u32,
    pub sbaccess: u8,
    pub eoc_addr: u32,
    pub retries: u32,
}

impl Default for ReferenceChip {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceChip {
    pub fn new() -> Self {
        Self {
            pins: Self::pin_table(),
            jtag_pins: JtagPins {
                tck: "tck".to_string(),
                tms: "tms".to_string(),
                tdi: "tdi".to_string(),
                tdo: "tdo".to_string(),
                trst: "trst".to_string(),
            },
            riscv_idcode: 0x2495_11c3,
            pulp_idcode: 0x1010_2001,
            hart: 0x3e0,
            sbaccess: 32,
            eoc_addr: DEFAULT_EOC_ADDR,
            retries: 10,
        }
    }

    fn pin_table() -> BTreeMap<String, PinDecl> {
        let mut pins = BTreeMap::new();
        let declare = |pins: &mut BTreeMap<String, PinDecl>, logical: &str, physical: &str, default: char, dir: PinDirection| {
            pins.insert(
                logical.to_string(),
                PinDecl {
                    physical_name: physical.to_string(),
                    default_state: default,
                    direction: dir,
                },
            );
        };
        declare(&mut pins, "chip_reset", "CHIP_RESET", '1', PinDirection::Input);
        declare(&mut pins, "trst", "TRST", '1', PinDirection::Input);
        declare(&mut pins, "tms", "TMS", '0', PinDirection::Input);
        declare(&mut pins, "tck", "TCK", '0', PinDirection::Input);
        declare(&mut pins, "tdi", "TDI", '0', PinDirection::Input);
        declare(&mut pins, "tdo", "TDO", 'X', PinDirection::Output);
        pins
    }

    /// Build a fresh driver, pin builder, and TAP handles for one command
    /// invocation. RISC-V is registered first, meaning it sits nearest TDI;
    /// `JtagDriver::add_tap` keeps the chain in shift order by inserting
    /// each new TAP at the front, so after both calls `chain()` holds
    /// `[PULP, RISCV]` and the tap indices below follow that order.
    fn context(&self) -> (JtagDriver, VectorBuilder, RiscvTap, PulpTap) {
        let mut driver = JtagDriver::new(self.jtag_pins.clone());
        driver.add_tap(riscv::build_jtag_tap("RISCV", self.riscv_idcode));
        driver.add_tap(pulp::build_jtag_tap("PULP", self.pulp_idcode));
        let vb = VectorBuilder::new(self.pins.clone());
        (driver, vb, RiscvTap::new(1), PulpTap::new(0))
    }

    /// TRST pulse per [`crate::jtag::JtagDriver::reset`].
    pub fn reset_chip(&self) -> Result<Vec<Vector>, AppError> {
        let (driver, mut vb, _riscv, _pulp) = self.context();
        Ok(driver.reset(&mut vb)?.into_iter().map(Vector::Normal).collect())
    }

    /// Read back both TAPs' IDCODE registers against the configured
    /// expected values.
    pub fn verify_idcode(&self) -> Result<Vec<Vector>, AppError> {
        let (driver, mut vb, _riscv, _pulp) = self.context();
        const RISCV_TAP_INDEX: usize = 1;
        const PULP_TAP_INDEX: usize = 0;
        let mut vectors = Vec::new();
        let riscv_expected = ExpectedBits::from_bitarray(&BitArray::from_uint(self.riscv_idcode as u128, 32)?);
        vectors.extend(
            driver
                .read_reg(&mut vb, RISCV_TAP_INDEX, "IDCODE", Some(&riscv_expected), "Verify RISC-V IDCODE. ")?
                .into_iter()
                .map(Vector::Normal),
        );
        let pulp_expected = ExpectedBits::from_bitarray(&BitArray::from_uint(self.pulp_idcode as u128, 32)?);
        vectors.extend(
            driver
                .read_reg(&mut vb, PULP_TAP_INDEX, "IDCODE", Some(&pulp_expected), "Verify PULP IDCODE. ")?
                .into_iter()
                .map(Vector::Normal),
        );
        Ok(vectors)
    }

    /// Halt the configured hart, then read `CSR_DPC` and compare against
    /// `expected_pc`.
    pub fn halt_core_verify_pc(
        &self,
        expected_pc: u32,
        wait_cycles: Option<u32>,
    ) -> Result<Vec<Vector>, AppError> {
        let (driver, mut vb, riscv, _pulp) = self.context();
        let mut vectors = riscv.halt(&driver, &mut vb, self.hart, wait_cycles, self.retries)?;
        vectors.extend(riscv.read_reg_abstract_cmd(
            &driver,
            &mut vb,
            CSR_DPC,
            expected_pc,
            wait_cycles,
            self.retries,
        )?);
        Ok(vectors)
    }

    pub fn resume_core(&self, wait_cycles: Option<u32>) -> Result<Vec<Vector>, AppError> {
        let (driver, mut vb, riscv, _pulp) = self.context();
        Ok(riscv.resume(&driver, &mut vb, self.hart, wait_cycles, self.retries)?)
    }

    /// Write one word. `via_sba` picks the RISC-V System Bus Access path;
    /// otherwise the PULP Advanced-Debug burst path is used.
    pub fn write_mem(&self, addr: u32, value: u32, via_sba: bool) -> Result<Vec<Vector>, AppError> {
        let (driver, mut vb, riscv, pulp) = self.context();
        if via_sba {
            Ok(riscv.write_mem(&driver, &mut vb, addr, value, self.sbaccess)?)
        } else {
            Ok(pulp
                .write32(&driver, &mut vb, addr, &[value], "Write mem. ")?
                .into_iter()
                .map(Vector::Normal)
                .collect())
        }
    }

    pub fn verify_mem(&self, addr: u32, expected: u32, via_sba: bool) -> Result<Vec<Vector>, AppError> {
        let (driver, mut vb, riscv, pulp) = self.context();
        if via_sba {
            Ok(riscv.read_mem(&driver, &mut vb, addr, expected, self.sbaccess)?)
        } else {
            Ok(pulp.read32(&driver, &mut vb, addr, &[expected], self.retries, "Verify mem. ")?)
        }
    }

    /// Preload an ELF's loadable segments, `via_sba` picking the RISC-V or
    /// PULP path the same way [`ReferenceChip::write_mem`] does.
    pub fn execute_elf(
        &self,
        elf_path: &Path,
        via_sba: bool,
        wait_cycles: Option<u32>,
    ) -> Result<Vec<Vector>, AppError> {
        let loaded = elf::load_byte_map(elf_path, 4)?;
        let (driver, mut vb, riscv, pulp) = self.context();
        let vectors = if via_sba {
            riscv.load_elf(&driver, &mut vb, &loaded.byte_map, self.sbaccess, wait_cycles)?
        } else {
            pulp.load_elf(&driver, &mut vb, &loaded.byte_map, "Load ELF. ")?
                .into_iter()
                .map(Vector::Normal)
                .collect()
        };
        Ok(vectors)
    }

    /// Poll the end-of-computation status word. `use_loop` selects the
    /// matched-loop flavor over the fixed-`wait_cycles` flavor.
    pub fn check_eoc(
        &self,
        return_code: u32,
        wait_cycles: u32,
        use_loop: bool,
    ) -> Result<Vec<Vector>, AppError> {
        let (driver, mut vb, riscv, _pulp) = self.context();
        if use_loop {
            Ok(riscv.wait_for_end_of_computation(
                &driver,
                &mut vb,
                return_code,
                self.eoc_addr,
                wait_cycles as usize,
                self.retries,
            )?)
        } else {
            Ok(riscv.check_end_of_computation(&driver, &mut vb, return_code, wait_cycles, self.eoc_addr)?)
        }
    }
}
