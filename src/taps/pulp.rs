//! PULP Advanced-Debug TAP: burst-mode AXI system-bus access.
//!
//! Module select, setup burst, and write burst each re-enter Shift-DR for
//! their own phase rather than holding the scan chain open continuously
//! across a whole burst. That costs a few extra FSM-transition vectors
//! relative to a hand-bit-banged continuous shift, but keeps each phase a
//! composable call into [`crate::jtag`] instead of a second, parallel
//! bit-banging implementation.
//!
//! Read burst is the exception: the status poll and the data/CRC payload
//! share one burst shift register, so [`PulpTap::read_burst`] enters
//! Shift-DR once and holds it open (`noexit`) across the preceding-tap
//! bypass bits, the poll, and the payload, exiting only on the final
//! shift.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::bitarray::{BitArray, PackedBuilder};
use crate::jtag::{ExpectedBits, JtagDriver, JtagError, JtagRegister, JtagTap};
use crate::vector::{NormalVector, Vector, VectorBuilder, VectorError};

#[derive(Error, Debug)]
pub enum PulpError {
    #[error(transparent)]
    Jtag(#[from] JtagError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    BitArray(#[from] crate::bitarray::BitArrayError),

    #[error("shape error: {0}")]
    Shape(String),
}

/// Maximum burst size in 32-bit words the engine will ever request, to cap
/// DR size on the tester.
pub const MAX_BURST_WORDS: usize = 256;

/// 6-bit module id selecting the AXI4 system-bus module.
pub const DBG_MODULE_ID_AXI: u8 = 0b100000;

/// Advanced-debug burst command codes (the `cmd:4` field of setup-burst).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BurstCmd {
    Nop,
    Write8,
    Write16,
    Write32,
    Write64,
    Read8,
    Read16,
    Read32,
    Read64,
    IntRegWrite,
    IntRegSelect,
}

impl BurstCmd {
    fn code(self) -> u8 {
        match self {
            BurstCmd::Nop => 0x0,
            BurstCmd::Write8 => 0x1,
            BurstCmd::Write16 => 0x2,
            BurstCmd::Write32 => 0x3,
            BurstCmd::Write64 => 0x4,
            BurstCmd::Read8 => 0x5,
            BurstCmd::Read16 => 0x6,
            BurstCmd::Read32 => 0x7,
            BurstCmd::Read64 => 0x8,
            BurstCmd::IntRegWrite => 0x9,
            BurstCmd::IntRegSelect => 0xa,
        }
    }
}

/// Build the standard PULP advanced-debug JTAG TAP: IDCODE, the AXI
/// burst-access register, CONFREG, TESTMODEREG and BISTREG, each with the
/// IR selection pattern the advanced-debug bridge expects.
pub fn build_jtag_tap(name: impl Into<String>, idcode: u32) -> JtagTap {
    let mut tap = JtagTap::new(name, 5);
    tap.add_register(JtagRegister {
        name: "IDCODE".to_string(),
        ir_value: BitArray::from_bin("0b00010").unwrap(),
        dr_length: 32,
        default_value: Some(BitArray::from_uint(idcode as u128, 32).unwrap()),
    });
    tap.add_register(JtagRegister {
        name: "AXIREG".to_string(),
        ir_value: BitArray::from_bin("0b00100").unwrap(),
        dr_length: 53,
        default_value: None,
    });
    tap.add_register(JtagRegister {
        name: "BBMUXREG".to_string(),
        ir_value: BitArray::from_bin("0b00101").unwrap(),
        dr_length: 21,
        default_value: None,
    });
    tap.add_register(JtagRegister {
        name: "CONFREG".to_string(),
        ir_value: BitArray::from_bin("0b00110").unwrap(),
        dr_length: 9,
        default_value: None,
    });
    tap.add_register(JtagRegister {
        name: "TESTMODEREG".to_string(),
        ir_value: BitArray::from_bin("0b01000").unwrap(),
        dr_length: 4,
        default_value: None,
    });
    tap.add_register(JtagRegister {
        name: "BISTREG".to_string(),
        ir_value: BitArray::from_bin("0b01001").unwrap(),
        dr_length: 20,
        default_value: None,
    });
    tap
}

/// Handle onto one PULP advanced-debug TAP already registered with a
/// [`JtagDriver`].
pub struct PulpTap {
    tap_index: usize,
    axi_ir: BitArray,
}

impl PulpTap {
    pub fn new(tap_index: usize) -> Self {
        Self {
            tap_index,
            axi_ir: BitArray::from_bin("0b00100").unwrap(),
        }
    }

    fn module_select(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        module_id: u8,
    ) -> Result<Vec<NormalVector>, PulpError> {
        let dr = BitArray::from_uint(module_id as u128, 6)?;
        Ok(driver.set_dr(vb, self.tap_index, &dr, None, "Module select. ", false)?)
    }

    fn setup_burst(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        cmd: BurstCmd,
        start_addr: u32,
        nwords: u16,
    ) -> Result<Vec<NormalVector>, PulpError> {
        if nwords as usize > MAX_BURST_WORDS {
            return Err(PulpError::Shape(format!(
                "burst of {nwords} words exceeds the {MAX_BURST_WORDS}-word cap"
            )));
        }
        let dr = PackedBuilder::new()
            .push_uint(cmd.code() as u128, 4)?
            .push_uint(start_addr as u128, 32)?
            .push_uint(nwords as u128, 16)?
            .finish_msb_first();
        Ok(driver.set_dr(vb, self.tap_index, &dr, None, "Setup burst. ", false)?)
    }

    fn write_burst(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        words: &[u32],
    ) -> Result<Vec<NormalVector>, PulpError> {
        let mut builder = PackedBuilder::new().push_bool(true); // start bit
        for &w in words {
            // Per-word payload is pre-reversed; the driver's usual
            // MSB-first-to-shift-order conversion then lands each word's
            // bits in the order the burst bridge expects.
            builder = builder.push_bits(BitArray::from_uint(w as u128, 32)?.reversed());
        }
        let dr = builder
            .push_uint(0xffff_ffff, 32)? // CRC, ignored on write
            .push_bool(false) // trailing bit
            .finish_msb_first();
        Ok(driver.set_dr(vb, self.tap_index, &dr, None, "Write burst payload. ", false)?)
    }

    fn read_burst(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        nwords: usize,
        expected_words: Option<&[u32]>,
        wait_cycles: Option<u32>,
        retries: u32,
    ) -> Result<Vec<Vector>, PulpError> {
        let mut out: Vec<Vector> = Vec::new();

        // Enter Shift-DR once and hold it open through the preceding-tap
        // bypass bits, the status poll, and the data/CRC payload. Leaving
        // and re-entering Shift-DR anywhere in between would pass back
        // through Capture-DR and reload the burst shift register, losing
        // the payload this TAP is mid-way through shifting out.
        out.extend(
            driver
                .goto_shift_dr(vb, "Shift read burst data. ")?
                .into_iter()
                .map(Vector::Normal),
        );
        for _ in 0..self.tap_index {
            out.extend(
                driver
                    .shift(vb, &[false], Some(&[None]), "", true)?
                    .into_iter()
                    .map(Vector::Normal),
            );
        }

        match wait_cycles {
            None => {
                let condition = driver.shift(
                    vb,
                    &[false],
                    Some(&[Some(true)]),
                    "Poll read burst status. ",
                    true,
                )?;
                let idle_padding = driver.idle_vector(vb, 1, None)?;
                let condition = VectorBuilder::pad(condition, &idle_padding);
                let idle = driver.idle_vectors(vb, 8)?;
                out.push(vb.matched_loop(condition, idle, retries)?);
                // Make sure there are at least 8 normal vectors before the next matched loop.
                out.extend(driver.idle_vectors(vb, 8)?.into_iter().map(Vector::Normal));
            }
            Some(n) => {
                if n == 0 {
                    return Err(PulpError::Shape(
                        "wait_cycles must be >= 1 for the fixed-wait read-burst flavor"
                            .to_string(),
                    ));
                }
                let mut expected = vec![Some(false); n as usize];
                *expected.last_mut().unwrap() = Some(true);
                let bits = vec![false; n as usize];
                let vectors = driver.shift(
                    vb,
                    &bits,
                    Some(&expected),
                    "Poll read burst status (fixed wait). ",
                    true,
                )?;
                out.extend(vectors.into_iter().map(Vector::Normal));
            }
        }

        let mut expected_bits: Vec<Option<bool>> = Vec::new();
        match expected_words {
            Some(exp) => {
                for &w in exp {
                    expected_bits.extend(
                        BitArray::from_uint(w as u128, 32)?
                            .reversed()
                            .lsb_first_bits()
                            .into_iter()
                            .map(Some),
                    );
                }
            }
            None => expected_bits.extend(std::iter::repeat(None).take(nwords * 32)),
        }
        expected_bits.extend(std::iter::repeat(None).take(32)); // ignored CRC
        let data_bits = vec![false; expected_bits.len()];
        out.extend(
            driver
                .shift(vb, &data_bits, Some(&expected_bits), "", false)?
                .into_iter()
                .map(Vector::Normal),
        );
        Ok(out)
    }

    /// `module-select -> setup-burst(WRITE32) -> write-burst`.
    pub fn write32(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        addr: u32,
        words: &[u32],
        comment: &str,
    ) -> Result<Vec<NormalVector>, PulpError> {
        let mut vectors = driver.set_ir(vb, self.tap_index, &self.axi_ir, comment)?;
        vectors.extend(self.module_select(driver, vb, DBG_MODULE_ID_AXI)?);
        vectors.extend(self.setup_burst(driver, vb, BurstCmd::Write32, addr, words.len() as u16)?);
        vectors.extend(self.write_burst(driver, vb, words)?);
        Ok(vectors)
    }

    /// Matched-loop read flavor: polls the status bit until it reads `1`.
    pub fn read32(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        addr: u32,
        expected: &[u32],
        retries: u32,
        comment: &str,
    ) -> Result<Vec<Vector>, PulpError> {
        let mut vectors: Vec<Vector> = driver
            .set_ir(vb, self.tap_index, &self.axi_ir, comment)?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        vectors.extend(
            self.module_select(driver, vb, DBG_MODULE_ID_AXI)?
                .into_iter()
                .map(Vector::Normal),
        );
        vectors.extend(
            self.setup_burst(driver, vb, BurstCmd::Read32, addr, expected.len() as u16)?
                .into_iter()
                .map(Vector::Normal),
        );
        vectors.extend(self.read_burst(driver, vb, expected.len(), Some(expected), None, retries)?);
        Ok(vectors)
    }

    /// Fixed-wait read flavor: the caller supplies the poll delay instead
    /// of relying on a matched loop.
    pub fn read32_no_loop(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        addr: u32,
        expected: &[u32],
        wait_cycles: u32,
        comment: &str,
    ) -> Result<Vec<Vector>, PulpError> {
        let mut vectors: Vec<Vector> = driver
            .set_ir(vb, self.tap_index, &self.axi_ir, comment)?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        vectors.extend(
            self.module_select(driver, vb, DBG_MODULE_ID_AXI)?
                .into_iter()
                .map(Vector::Normal),
        );
        vectors.extend(
            self.setup_burst(driver, vb, BurstCmd::Read32, addr, expected.len() as u16)?
                .into_iter()
                .map(Vector::Normal),
        );
        vectors.extend(self.read_burst(
            driver,
            vb,
            expected.len(),
            Some(expected),
            Some(wait_cycles),
            1,
        )?);
        Ok(vectors)
    }

    /// Split `byte_map` into maximal contiguous runs of at most
    /// [`MAX_BURST_WORDS`] 32-bit words (breaking on a gap of more than 4
    /// bytes between keys) and `write32` each run.
    pub fn load_elf(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        byte_map: &BTreeMap<u64, u128>,
        comment: &str,
    ) -> Result<Vec<NormalVector>, PulpError> {
        let mut vectors = Vec::new();
        for (base, words) in chunk_contiguous_runs(byte_map, MAX_BURST_WORDS) {
            vectors.extend(self.write32(driver, vb, base as u32, &words, comment)?);
        }
        Ok(vectors)
    }

    /// Mirrors [`PulpTap::load_elf`] but issues `read32` bursts comparing
    /// against the same byte map.
    pub fn verify_l2(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        byte_map: &BTreeMap<u64, u128>,
        retries: u32,
        comment: &str,
    ) -> Result<Vec<Vector>, PulpError> {
        let mut vectors = Vec::new();
        for (base, words) in chunk_contiguous_runs(byte_map, MAX_BURST_WORDS) {
            vectors.extend(self.read32(driver, vb, base as u32, &words, retries, comment)?);
        }
        Ok(vectors)
    }

    /// `sel_fll_clk` occupies the top bit of the 9-bit CONFREG DR, the
    /// 8-bit SoC config value the rest. On some Rosetta-generation silicon
    /// the `hd_mem_backend_use_edram` bit (bit 0) is active-low instead of
    /// active-high; set `invert_edram_bit` for those targets.
    pub fn set_config_reg(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        sel_fll_clk: bool,
        soc_jtag_reg_value: &BitArray,
        invert_edram_bit: bool,
    ) -> Result<Vec<NormalVector>, PulpError> {
        if soc_jtag_reg_value.len() != 8 {
            return Err(PulpError::Shape(format!(
                "soc_jtag_reg_value must be 8 bits, got {}",
                soc_jtag_reg_value.len()
            )));
        }
        let mut value = soc_jtag_reg_value.clone();
        if invert_edram_bit {
            let bit0 = value.get(0)?;
            value.set(0, !bit0)?;
        }
        let dr = PackedBuilder::new()
            .push_bool(sel_fll_clk)
            .push_bits(value)
            .finish_msb_first();
        Ok(driver.write_reg(vb, self.tap_index, "CONFREG", &dr, "Set config reg. ")?)
    }

    pub fn verify_config_reg(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        sel_fll_clk: bool,
        soc_jtag_reg_value: &BitArray,
    ) -> Result<Vec<NormalVector>, PulpError> {
        if soc_jtag_reg_value.len() != 8 {
            return Err(PulpError::Shape(format!(
                "soc_jtag_reg_value must be 8 bits, got {}",
                soc_jtag_reg_value.len()
            )));
        }
        let dr = PackedBuilder::new()
            .push_bool(sel_fll_clk)
            .push_bits(soc_jtag_reg_value.clone())
            .finish_msb_first();
        let expected = ExpectedBits::from_bitarray(&dr);
        Ok(driver.read_reg(vb, self.tap_index, "CONFREG", Some(&expected), "Verify config reg. ")?)
    }
}

fn chunk_contiguous_runs(map: &BTreeMap<u64, u128>, max_words: usize) -> Vec<(u64, Vec<u32>)> {
    let mut runs: Vec<(u64, Vec<u32>)> = Vec::new();
    let mut current_base: Option<u64> = None;
    let mut current_words: Vec<u32> = Vec::new();
    let mut prev_addr: Option<u64> = None;

    for (&addr, &word) in map.iter() {
        let starts_new_run = match prev_addr {
            None => true,
            Some(prev) => addr.saturating_sub(prev) > 4 || current_words.len() >= max_words,
        };
        if starts_new_run {
            if let Some(base) = current_base.take() {
                runs.push((base, std::mem::take(&mut current_words)));
            }
            current_base = Some(addr);
        }
        current_words.push(word as u32);
        prev_addr = Some(addr);
    }
    if let Some(base) = current_base {
        runs.push((base, current_words));
    }
    runs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chip_pins() -> crate::vector::VectorBuilder {
        use crate::vector::{PinDecl, PinDirection};
        let mut m = BTreeMap::new();
        for name in ["tck", "tms", "tdi", "tdo", "trst"] {
            m.insert(
                name.to_string(),
                PinDecl {
                    physical_name: name.to_uppercase(),
                    default_state: if name == "tdo" { 'X' } else { '0' },
                    direction: if name == "tdo" {
                        PinDirection::Output
                    } else {
                        PinDirection::Input
                    },
                },
            );
        }
        crate::vector::VectorBuilder::new(m)
    }

    fn driver_with_pulp_tap() -> (JtagDriver, PulpTap) {
        let mut driver = JtagDriver::new(crate::jtag::JtagPins {
            tck: "tck".to_string(),
            tms: "tms".to_string(),
            tdi: "tdi".to_string(),
            tdo: "tdo".to_string(),
            trst: "trst".to_string(),
        });
        driver.add_tap(build_jtag_tap("PULP", 0x1010_2001));
        (driver, PulpTap::new(0))
    }

    #[test]
    fn module_select_dr_is_six_bits() {
        let (driver, tap) = driver_with_pulp_tap();
        let mut vb = chip_pins();
        let vectors = tap.module_select(&driver, &mut vb, DBG_MODULE_ID_AXI).unwrap();
        assert!(!vectors.is_empty());
    }

    #[test]
    fn setup_burst_rejects_oversized_burst() {
        let (driver, tap) = driver_with_pulp_tap();
        let mut vb = chip_pins();
        let err = tap
            .setup_burst(&driver, &mut vb, BurstCmd::Write32, 0x1000, 257)
            .unwrap_err();
        assert!(matches!(err, PulpError::Shape(_)));
    }

    #[test]
    fn write32_emits_a_nonempty_vector_sequence() {
        let (driver, tap) = driver_with_pulp_tap();
        let mut vb = chip_pins();
        let vectors = tap
            .write32(&driver, &mut vb, 0x1c00_8080, &[0xdead_beef], "write")
            .unwrap();
        assert!(!vectors.is_empty());
    }

    #[test]
    fn read32_loop_flavor_pads_matched_loop_with_trailing_normals() {
        let (driver, tap) = driver_with_pulp_tap();
        let mut vb = chip_pins();
        let vectors = tap
            .read32(&driver, &mut vb, 0x1c00_8080, &[0xdead_beef], 10, "read")
            .unwrap();
        let loop_pos = vectors
            .iter()
            .position(|v| matches!(v, Vector::MatchedLoop(_)))
            .expect("read32 should emit a matched loop for the burst-status poll");
        let after = &vectors[loop_pos + 1..];
        assert!(after.len() >= 8);
        assert!(after[..8].iter().all(|v| matches!(v, Vector::Normal(_))));
    }

    /// Count of flattened `Normal` vectors with `tms == '1'`, recursing into
    /// matched-loop/loop bodies. A single Shift-DR session entered once and
    /// exited once should show exactly 3: the Select-DR-Scan pulse on entry,
    /// plus the two adjacent TMS=1 cycles (last shifted bit, then Update-DR)
    /// on exit.
    fn count_tms_high(vectors: &[Vector]) -> usize {
        vectors
            .iter()
            .map(|v| match v {
                Vector::Normal(n) => (n.pin_state.get("tms") == Some(&'1')) as usize,
                Vector::Loop(l) => count_tms_high(&l.body),
                Vector::MatchedLoop(m) => count_tms_high(
                    &m.condition
                        .iter()
                        .cloned()
                        .chain(m.idle.iter().cloned())
                        .map(Vector::Normal)
                        .collect::<Vec<_>>(),
                ),
            })
            .sum()
    }

    #[test]
    fn read_burst_loop_flavor_holds_one_continuous_shift_dr_session() {
        let (driver, tap) = driver_with_pulp_tap();
        let mut vb = chip_pins();
        let vectors = tap
            .read_burst(&driver, &mut vb, 1, Some(&[0xdead_beef]), None, 10)
            .unwrap();

        let first = match &vectors[0] {
            Vector::Normal(n) => n,
            other => panic!("expected the first vector to be the Shift-DR entry, got {other:?}"),
        };
        assert_eq!(
            first.pin_state.get("tms"),
            Some(&'1'),
            "read_burst must enter Shift-DR before polling status"
        );
        assert_eq!(
            count_tms_high(&vectors),
            3,
            "exactly one Shift-DR entry and one exit: re-entering between the \
             status poll and the data shift would reload the burst shift register"
        );
    }

    #[test]
    fn read_burst_fixed_wait_flavor_holds_one_continuous_shift_dr_session() {
        let (driver, tap) = driver_with_pulp_tap();
        let mut vb = chip_pins();
        let vectors = tap
            .read_burst(&driver, &mut vb, 1, Some(&[0xdead_beef]), Some(4), 1)
            .unwrap();

        let first = match &vectors[0] {
            Vector::Normal(n) => n,
            other => panic!("expected the first vector to be the Shift-DR entry, got {other:?}"),
        };
        assert_eq!(
            first.pin_state.get("tms"),
            Some(&'1'),
            "the fixed-wait status poll must happen inside Shift-DR, not Run-Test/Idle"
        );
        assert_eq!(count_tms_high(&vectors), 3);
    }

    #[test]
    fn read_burst_emits_one_bypass_bit_per_preceding_tap() {
        let mut driver = JtagDriver::new(crate::jtag::JtagPins {
            tck: "tck".to_string(),
            tms: "tms".to_string(),
            tdi: "tdi".to_string(),
            tdo: "tdo".to_string(),
            trst: "trst".to_string(),
        });
        // RISC-V registered first, so PULP ends up at tap_index 1 with one
        // preceding chain entry.
        driver.add_tap(crate::taps::riscv::build_jtag_tap("RISCV", 0x1000_0001));
        driver.add_tap(build_jtag_tap("PULP", 0x1010_2001));
        let tap = PulpTap::new(1);
        let mut vb = chip_pins();

        let with_preceding = tap
            .read_burst(&driver, &mut vb, 1, Some(&[0xdead_beef]), Some(4), 1)
            .unwrap();

        let mut driver_alone = JtagDriver::new(crate::jtag::JtagPins {
            tck: "tck".to_string(),
            tms: "tms".to_string(),
            tdi: "tdi".to_string(),
            tdo: "tdo".to_string(),
            trst: "trst".to_string(),
        });
        driver_alone.add_tap(build_jtag_tap("PULP", 0x1010_2001));
        let tap_alone = PulpTap::new(0);
        let mut vb_alone = chip_pins();
        let without_preceding = tap_alone
            .read_burst(&driver_alone, &mut vb_alone, 1, Some(&[0xdead_beef]), Some(4), 1)
            .unwrap();

        let normal_count = |vs: &[Vector]| {
            vs.iter()
                .filter(|v| matches!(v, Vector::Normal(_)))
                .count()
        };
        assert_eq!(
            normal_count(&with_preceding),
            normal_count(&without_preceding) + 1,
            "one extra chain tap ahead of PULP should add exactly one bypass bit"
        );
    }

    #[test]
    fn chunk_contiguous_runs_splits_on_gap() {
        let mut map = BTreeMap::new();
        map.insert(0x1c00_8080u64, 0x1111_1111u128);
        map.insert(0x1c00_8084u64, 0x2222_2222u128);
        map.insert(0x1c00_8100u64, 0x3333_3333u128);
        let runs = chunk_contiguous_runs(&map, MAX_BURST_WORDS);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].0, 0x1c00_8080);
        assert_eq!(runs[0].1, vec![0x1111_1111, 0x2222_2222]);
        assert_eq!(runs[1].0, 0x1c00_8100);
        assert_eq!(runs[1].1, vec![0x3333_3333]);
    }

    #[test]
    fn chunk_contiguous_runs_splits_at_burst_cap() {
        let mut map = BTreeMap::new();
        for i in 0..300u64 {
            map.insert(0x1000 + i * 4, i as u128);
        }
        let runs = chunk_contiguous_runs(&map, MAX_BURST_WORDS);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].1.len(), MAX_BURST_WORDS);
        assert_eq!(runs[1].1.len(), 300 - MAX_BURST_WORDS);
    }
}
