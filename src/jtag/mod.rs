//! JTAG TAP Controller driver.
//!
//! Holds the ordered TAP chain and generates the FSM-traversal vector
//! sequences (reset, idle, goto-shift-dr/ir, shift, set-ir/set-dr,
//! read/write-register, poll-register). This is the one place in the
//! system where MSB-first human-facing values are converted to LSB-first
//! wire/shift order; every higher layer must go through here.

use thiserror::Error;

use crate::bitarray::BitArray;
use crate::vector::{NormalVector, VectorBuilder, VectorError};

#[derive(Error, Debug)]
pub enum JtagError {
    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error("tap index {0} is not part of the chain")]
    UnknownTap(usize),

    #[error("register {reg} does not belong to tap {tap}")]
    RegisterNotOnTap { tap: String, reg: String },

    #[error("shape error: {0}")]
    ShapeError(String),
}

/// Tri-state expected value for a shift: `Some(bit)` compares, `None` is a
/// don't-care (`X` on the ATE). Stored LSB-first, matching [`BitArray`]'s
/// internal convention, so a target TAP's and the bypassed TAPs' expected
/// bits concatenate directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedBits {
    bits: Vec<Option<bool>>,
}

impl ExpectedBits {
    pub fn all_dont_care(width: usize) -> Self {
        Self {
            bits: vec![None; width],
        }
    }

    pub fn from_bitarray(value: &BitArray) -> Self {
        Self {
            bits: value.lsb_first_bits().iter().map(|b| Some(*b)).collect(),
        }
    }

    /// Build directly from a LSB-first tri-state bit vector, for callers
    /// that compare only some fields of a wider register (the rest stay
    /// don't-care).
    pub fn from_bits(bits: Vec<Option<bool>>) -> Self {
        Self { bits }
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    pub fn lsb_first(&self) -> &[Option<bool>] {
        &self.bits
    }

    pub fn is_all_dont_care(&self) -> bool {
        self.bits.iter().all(|b| b.is_none())
    }
}

/// A single JTAG register: its instruction-register selection pattern and
/// data-register length.
#[derive(Clone, Debug)]
pub struct JtagRegister {
    pub name: String,
    pub ir_value: BitArray,
    pub dr_length: usize,
    pub default_value: Option<BitArray>,
}

/// One TAP in the chain: a name, an instruction-register width, and a set
/// of registers. Every TAP automatically carries a `BYPASS` register
/// (IR = all ones, DR length 1).
#[derive(Clone, Debug)]
pub struct JtagTap {
    pub name: String,
    pub ir_size: usize,
    pub registers: Vec<JtagRegister>,
}

impl JtagTap {
    pub fn new(name: impl Into<String>, ir_size: usize) -> Self {
        let bypass = JtagRegister {
            name: "BYPASS".to_string(),
            ir_value: BitArray::ones(ir_size),
            dr_length: 1,
            default_value: None,
        };
        Self {
            name: name.into(),
            ir_size,
            registers: vec![bypass],
        }
    }

    pub fn add_register(&mut self, reg: JtagRegister) -> usize {
        self.registers.push(reg);
        self.registers.len() - 1
    }

    pub fn bypass(&self) -> &JtagRegister {
        &self.registers[0]
    }

    pub fn register(&self, name: &str) -> Option<&JtagRegister> {
        self.registers.iter().find(|r| r.name == name)
    }
}

/// Logical pin names the driver drives or samples. Resolved against a
/// [`VectorBuilder`]'s pin declarations (logical or physical names both
/// work, since `VectorBuilder::set` resolves either).
#[derive(Clone, Debug)]
pub struct JtagPins {
    pub tck: String,
    pub tms: String,
    pub tdi: String,
    pub tdo: String,
    pub trst: String,
}

/// Drives the TAP chain. Carries only configuration (pin names, the
/// registered TAPs) — the pin state itself lives in the [`VectorBuilder`]
/// passed explicitly to every method, so no global mutable state is
/// threaded implicitly between calls.
pub struct JtagDriver {
    pins: JtagPins,
    chain: Vec<JtagTap>,
}

impl JtagDriver {
    pub fn new(pins: JtagPins) -> Self {
        Self {
            pins,
            chain: Vec::new(),
        }
    }

    /// Register a TAP. Call in physical TDI→TDO order: the TAP nearest
    /// TDI goes first. Internally the chain is kept in shift order (the
    /// TAP shifted in last is the one that should end up sitting nearest
    /// TDI), so each call inserts at the front.
    pub fn add_tap(&mut self, tap: JtagTap) {
        self.chain.insert(0, tap);
    }

    pub fn chain(&self) -> &[JtagTap] {
        &self.chain
    }

    fn set_defaults(&self, vb: &mut VectorBuilder) -> Result<(), JtagError> {
        vb.set(&self.pins.tck, '0')?;
        vb.set(&self.pins.trst, '1')?;
        vb.set(&self.pins.tms, '0')?;
        vb.set(&self.pins.tdi, '0')?;
        vb.set(&self.pins.tdo, 'X')?;
        Ok(())
    }

    pub fn idle_vector(
        &self,
        vb: &mut VectorBuilder,
        repeat: u32,
        comment: Option<String>,
    ) -> Result<NormalVector, JtagError> {
        self.set_defaults(vb)?;
        Ok(vb.vector(repeat, comment))
    }

    pub fn idle_vectors(
        &self,
        vb: &mut VectorBuilder,
        count: usize,
    ) -> Result<Vec<NormalVector>, JtagError> {
        (0..count).map(|_| self.idle_vector(vb, 1, None)).collect()
    }

    /// Drive TRST low for 10 cycles, then TRST high with TCK=1, TMS=0 for
    /// 10 more cycles.
    pub fn reset(&self, vb: &mut VectorBuilder) -> Result<Vec<NormalVector>, JtagError> {
        let mut vectors = Vec::with_capacity(20);
        self.set_defaults(vb)?;
        vb.set(&self.pins.trst, '0')?;
        vectors.push(vb.vector(1, Some("JTAG reset".to_string())));
        for _ in 0..9 {
            vectors.push(vb.vector(1, None));
        }
        vb.set(&self.pins.trst, '1')?;
        vb.set(&self.pins.tck, '1')?;
        vb.set(&self.pins.tms, '0')?;
        for _ in 0..10 {
            vectors.push(vb.vector(1, None));
        }
        Ok(vectors)
    }

    /// Run-Test/Idle -> Select-DR-Scan -> Capture-DR -> Shift-DR.
    pub fn goto_shift_dr(
        &self,
        vb: &mut VectorBuilder,
        comment: &str,
    ) -> Result<Vec<NormalVector>, JtagError> {
        let mut vectors = Vec::with_capacity(3);
        self.set_defaults(vb)?;
        vb.set(&self.pins.tms, '1')?;
        vb.set(&self.pins.tck, '0')?;
        vectors.push(vb.vector(1, Some(comment.to_string())));
        vb.set(&self.pins.tck, '1')?;
        vb.set(&self.pins.tms, '0')?;
        vectors.push(vb.vector(1, None));
        vectors.push(vb.vector(1, Some("goto shift DR".to_string())));
        Ok(vectors)
    }

    /// Run-Test/Idle -> Select-DR-Scan -> Select-IR-Scan -> Capture-IR ->
    /// Shift-IR (one TMS=1 cycle longer than the DR path).
    pub fn goto_shift_ir(
        &self,
        vb: &mut VectorBuilder,
        comment: &str,
    ) -> Result<Vec<NormalVector>, JtagError> {
        let mut vectors = Vec::with_capacity(4);
        self.set_defaults(vb)?;
        vb.set(&self.pins.tms, '1')?;
        vb.set(&self.pins.tck, '0')?;
        vectors.push(vb.vector(1, Some(comment.to_string())));
        vb.set(&self.pins.tck, '1')?;
        vectors.push(vb.vector(1, None));
        vb.set(&self.pins.tms, '0')?;
        vectors.push(vb.vector(1, None));
        vectors.push(vb.vector(1, Some("goto shift IR".to_string())));
        Ok(vectors)
    }

    /// Shift `bits_in` (LSB-first shift order, index 0 shifted first).
    /// When `expected_out` carries any concrete bit, TDO is compared
    /// per-cycle. On the last cycle TMS is pre-driven to 1 unless
    /// `noexit`, then the exit path traverses Exit1 -> Update ->
    /// Run-Test/Idle.
    pub fn shift(
        &self,
        vb: &mut VectorBuilder,
        bits_in: &[bool],
        expected_out: Option<&[Option<bool>]>,
        comment: &str,
        noexit: bool,
    ) -> Result<Vec<NormalVector>, JtagError> {
        if let Some(e) = expected_out {
            if e.len() != bits_in.len() {
                return Err(JtagError::ShapeError(format!(
                    "expected_out length {} does not match bits_in length {}",
                    e.len(),
                    bits_in.len()
                )));
            }
        }
        self.set_defaults(vb)?;
        vb.set(&self.pins.tck, '1')?;
        vb.set(&self.pins.tms, '0')?;
        let mut vectors = Vec::with_capacity(bits_in.len() + 3);
        let has_expected = expected_out
            .map(|e| e.iter().any(|b| b.is_some()))
            .unwrap_or(false);
        let mut first_comment = format!("{comment}/Start shifting. ");
        for (idx, &bit) in bits_in.iter().enumerate() {
            vb.set(&self.pins.tdi, if bit { '1' } else { '0' })?;
            let expected_bit = expected_out.and_then(|e| e[idx]);
            if has_expected {
                vb.set(&self.pins.tdo, match expected_bit {
                    Some(true) => '1',
                    Some(false) => '0',
                    None => 'X',
                })?;
            }
            if idx == bits_in.len() - 1 && !noexit {
                vb.set(&self.pins.tms, '1')?;
            }
            let mut cycle_comment = std::mem::take(&mut first_comment);
            cycle_comment.push_str(&format!("Shift bit {}", if bit { '1' } else { '0' }));
            if has_expected {
                let label = match expected_bit {
                    Some(true) => "1".to_string(),
                    Some(false) => "0".to_string(),
                    None => "X".to_string(),
                };
                cycle_comment.push_str(&format!(" expecting tdo {label}"));
            }
            vectors.push(vb.vector(1, Some(cycle_comment)));
        }
        if !noexit {
            vectors.push(vb.vector(1, Some("goto Update DR/IR".to_string())));
            vb.set(&self.pins.tms, '0')?;
            vectors.push(vb.vector(1, Some("goto run test idle".to_string())));
            vectors.push(vb.vector(1, Some("idle".to_string())));
        }
        Ok(vectors)
    }

    /// Set the IR of `tap_index` to `ir_value` (MSB-first, width =
    /// `tap.ir_size`), putting every other TAP into BYPASS.
    pub fn set_ir(
        &self,
        vb: &mut VectorBuilder,
        tap_index: usize,
        ir_value: &BitArray,
        comment: &str,
    ) -> Result<Vec<NormalVector>, JtagError> {
        let tap = self
            .chain
            .get(tap_index)
            .ok_or(JtagError::UnknownTap(tap_index))?;
        if ir_value.len() != tap.ir_size {
            return Err(JtagError::ShapeError(format!(
                "IR value width {} does not match tap {} IR size {}",
                ir_value.len(),
                tap.name,
                tap.ir_size
            )));
        }
        let full_comment = format!("{comment}/Set IR of tap {} to [{}]", tap.name, ir_value.pretty());
        let mut vectors = self.goto_shift_ir(vb, &full_comment)?;
        let mut chain_bits = Vec::new();
        for (i, elem) in self.chain.iter().enumerate() {
            if i == tap_index {
                chain_bits.extend(ir_value.lsb_first_bits());
            } else {
                chain_bits.extend(elem.bypass().ir_value.lsb_first_bits());
            }
        }
        vectors.extend(self.shift(vb, &chain_bits, None, "", false)?);
        Ok(vectors)
    }

    /// Set the DR of `tap_index` to `dr_value` (MSB-first, width caller's
    /// choice). Every other TAP in the chain contributes a single zero
    /// bit (their BYPASS DR length is always 1).
    #[allow(clippy::too_many_arguments)]
    pub fn set_dr(
        &self,
        vb: &mut VectorBuilder,
        tap_index: usize,
        dr_value: &BitArray,
        expected: Option<&ExpectedBits>,
        comment: &str,
        noexit: bool,
    ) -> Result<Vec<NormalVector>, JtagError> {
        let tap = self
            .chain
            .get(tap_index)
            .ok_or(JtagError::UnknownTap(tap_index))?;
        let mut full_comment = format!("{comment}/Set DR of tap {} to [{}]", tap.name, dr_value.pretty());
        if let Some(exp) = expected {
            if !exp.is_all_dont_care() {
                full_comment.push_str(" expecting to read a matching value");
            }
        }
        let mut vectors = self.goto_shift_dr(vb, &full_comment)?;
        let mut chain_bits = Vec::new();
        let mut expected_bits: Vec<Option<bool>> = Vec::new();
        for (i, _elem) in self.chain.iter().enumerate() {
            if i == tap_index {
                chain_bits.extend(dr_value.lsb_first_bits());
                match expected {
                    Some(exp) => expected_bits.extend(exp.lsb_first().iter().copied()),
                    None => expected_bits.extend(std::iter::repeat(None).take(dr_value.len())),
                }
            } else {
                chain_bits.push(false);
                expected_bits.push(None);
            }
        }
        vectors.extend(self.shift(vb, &chain_bits, Some(&expected_bits), "", noexit)?);
        Ok(vectors)
    }

    /// `set_ir(reg)` followed by `set_dr(all-zero, expected)`.
    pub fn read_reg(
        &self,
        vb: &mut VectorBuilder,
        tap_index: usize,
        reg_name: &str,
        expected: Option<&ExpectedBits>,
        comment: &str,
    ) -> Result<Vec<NormalVector>, JtagError> {
        let tap = &self.chain[tap_index];
        let reg = tap
            .register(reg_name)
            .ok_or_else(|| JtagError::RegisterNotOnTap {
                tap: tap.name.clone(),
                reg: reg_name.to_string(),
            })?
            .clone();
        let mut vectors = self.set_ir(vb, tap_index, &reg.ir_value, comment)?;
        let zero_dr = BitArray::zeros(reg.dr_length);
        vectors.extend(self.set_dr(vb, tap_index, &zero_dr, expected, "Read value from DR. ", false)?);
        Ok(vectors)
    }

    /// `set_ir(reg)` followed by `set_dr(value)`.
    pub fn write_reg(
        &self,
        vb: &mut VectorBuilder,
        tap_index: usize,
        reg_name: &str,
        value: &BitArray,
        comment: &str,
    ) -> Result<Vec<NormalVector>, JtagError> {
        let tap = &self.chain[tap_index];
        let reg = tap
            .register(reg_name)
            .ok_or_else(|| JtagError::RegisterNotOnTap {
                tap: tap.name.clone(),
                reg: reg_name.to_string(),
            })?
            .clone();
        if value.len() != reg.dr_length {
            return Err(JtagError::ShapeError(format!(
                "value width {} does not match register {} DR length {}",
                value.len(),
                reg.name,
                reg.dr_length
            )));
        }
        let mut vectors = self.set_ir(vb, tap_index, &reg.ir_value, comment)?;
        vectors.extend(self.set_dr(vb, tap_index, value, None, "Write value to DR. ", false)?);
        Ok(vectors)
    }

    /// Assemble a matched loop: condition = read-and-compare, idle = the
    /// pad-to-8-multiple of `jtag_idle`. Always followed by 8 trailing
    /// normal vectors, so two polls can be composed back-to-back without
    /// ever landing a matched loop directly against another one.
    pub fn poll_reg(
        &self,
        vb: &mut VectorBuilder,
        tap_index: usize,
        reg_name: &str,
        expected: &ExpectedBits,
        retries: u32,
        comment: &str,
    ) -> Result<Vec<crate::vector::Vector>, JtagError> {
        let condition = self.read_reg(vb, tap_index, reg_name, Some(expected), comment)?;
        let idle_padding = self.idle_vector(vb, 1, None)?;
        let condition = VectorBuilder::pad(condition, &idle_padding);
        let idle = self.idle_vectors(vb, 8)?;
        let mut vectors = vec![vb.matched_loop(condition, idle, retries)?];
        // Make sure there are at least 8 normal vectors before the next matched loop.
        vectors.extend(self.idle_vectors(vb, 8)?.into_iter().map(crate::vector::Vector::Normal));
        Ok(vectors)
    }
}
