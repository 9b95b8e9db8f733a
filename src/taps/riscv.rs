//! RISC-V Debug TAP: DMI access, abstract commands, hart halt/resume, and
//! System Bus Access, layered on [`crate::jtag`].
//!
//! Field positions for DMCONTROL/DMSTATUS/ABSTRACTCS follow the RISC-V
//! External Debug Specification; SBCS uses a simplified internally
//! consistent layout (sbversion/sbaccess/sbautoincrement/sbreadonaddr/
//! sbreadondata) since only those fields are ever driven or compared here.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::bitarray::{BitArray, BitArrayError, PackedBuilder};
use crate::jtag::{ExpectedBits, JtagDriver, JtagError, JtagRegister, JtagTap};
use crate::vector::{NormalVector, Vector, VectorBuilder, VectorError};

#[derive(Error, Debug)]
pub enum RiscvError {
    #[error(transparent)]
    Jtag(#[from] JtagError),

    #[error(transparent)]
    Vector(#[from] VectorError),

    #[error(transparent)]
    BitArray(#[from] BitArrayError),

    #[error("value out of range: {0}")]
    OutOfRange(String),

    #[error("invalid abstract command: {0}")]
    InvalidCommand(String),
}

/// DMI access opcode (the low 2 bits of a DMIACCESS shift).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmiOp {
    Nop,
    Read,
    Write,
}

impl DmiOp {
    fn code(self) -> u8 {
        match self {
            DmiOp::Nop => 0,
            DmiOp::Read => 1,
            DmiOp::Write => 2,
        }
    }
}

/// DMI status, read back in the op field of the following shift.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DmiStatus {
    Success,
    Failed,
    Pending,
}

impl DmiStatus {
    fn code(self) -> u8 {
        match self {
            DmiStatus::Success => 0,
            DmiStatus::Failed => 2,
            DmiStatus::Pending => 3,
        }
    }
}

const DMI_SETTLE_CYCLES: usize = 10;

pub const DMI_ADDR_DATA0: u8 = 0x04;
pub const DMI_ADDR_DMCONTROL: u8 = 0x10;
pub const DMI_ADDR_DMSTATUS: u8 = 0x11;
pub const DMI_ADDR_ABSTRACTCS: u8 = 0x16;
pub const DMI_ADDR_COMMAND: u8 = 0x17;
pub const DMI_ADDR_SBCS: u8 = 0x38;
pub const DMI_ADDR_SBADDRESS0: u8 = 0x39;
pub const DMI_ADDR_SBDATA0: u8 = 0x3c;

const DMSTATUS_BIT_ALLHALTED: u8 = 9;
const DMSTATUS_BIT_ALLRESUMEACK: u8 = 17;
const ABSTRACTCS_BIT_BUSY: u8 = 12;

/// The Debug PC CSR, used by `halt_and_read_pc`-style flows.
pub const CSR_DPC: u16 = 0x7b1;

/// Default end-of-computation status-word address on the reference chip.
pub const DEFAULT_EOC_ADDR: u32 = 0x1a10_40a0;

/// Build the standard RISC-V debug JTAG TAP: IDCODE, DTMCS, DMIACCESS.
pub fn build_jtag_tap(name: impl Into<String>, idcode: u32) -> JtagTap {
    let mut tap = JtagTap::new(name, 5);
    tap.add_register(JtagRegister {
        name: "IDCODE".to_string(),
        ir_value: BitArray::from_bin("0b00001").unwrap(),
        dr_length: 32,
        default_value: Some(BitArray::from_uint(idcode as u128, 32).unwrap()),
    });
    tap.add_register(JtagRegister {
        name: "DTMCS".to_string(),
        ir_value: BitArray::from_bin("0b10000").unwrap(),
        dr_length: 32,
        default_value: None,
    });
    tap.add_register(JtagRegister {
        name: "DMIACCESS".to_string(),
        ir_value: BitArray::from_bin("0b10001").unwrap(),
        dr_length: 41,
        default_value: None,
    });
    tap
}

fn full_word_bits(value: u32) -> Vec<Option<bool>> {
    BitArray::from_uint(value as u128, 32)
        .unwrap()
        .lsb_first_bits()
        .into_iter()
        .map(Some)
        .collect()
}

fn single_bit_bits(bit: u8, value: bool) -> Vec<Option<bool>> {
    let mut bits = vec![None; 32];
    bits[bit as usize] = Some(value);
    bits
}

fn dmi_expected_bits(status: Option<DmiStatus>, data_bits: Option<Vec<Option<bool>>>) -> ExpectedBits {
    let mut bits: Vec<Option<bool>> = Vec::with_capacity(41);
    match status {
        Some(s) => bits.extend(
            BitArray::from_uint(s.code() as u128, 2)
                .unwrap()
                .lsb_first_bits()
                .into_iter()
                .map(Some),
        ),
        None => bits.extend(std::iter::repeat(None).take(2)),
    }
    match data_bits {
        Some(d) => bits.extend(d),
        None => bits.extend(std::iter::repeat(None).take(32)),
    }
    bits.extend(std::iter::repeat(None).take(7)); // addr field, always don't-care on read-back
    ExpectedBits::from_bits(bits)
}

fn abstract_command_word(
    aarsize: u8,
    aarpostinc: bool,
    postexec: bool,
    transfer: bool,
    write: bool,
    regno: u16,
) -> Result<u32, RiscvError> {
    if !(2..=4).contains(&aarsize) {
        return Err(RiscvError::InvalidCommand(format!(
            "aarsize {aarsize} not in {{2,3,4}}"
        )));
    }
    let dr = PackedBuilder::new()
        .push_uint(0, 8)? // cmd_type = Access Register
        .push_uint(aarsize as u128, 3)?
        .push_bool(false)
        .push_bool(aarpostinc)
        .push_bool(postexec)
        .push_bool(transfer)
        .push_bool(write)
        .push_uint(regno as u128, 16)?
        .finish_msb_first();
    Ok(dr.to_uint()? as u32)
}

#[allow(clippy::too_many_arguments)]
fn dmcontrol_value(
    haltreq: bool,
    resumereq: bool,
    hartreset: bool,
    ackhavereset: bool,
    hasel: bool,
    hart: u32,
    ndmreset: bool,
    dmactive: bool,
) -> Result<BitArray, RiscvError> {
    if hart >= 1 << 20 {
        return Err(RiscvError::OutOfRange(format!(
            "hart id {hart:#x} exceeds 20 bits"
        )));
    }
    let hartsello = hart & 0x3ff;
    let hartselhi = (hart >> 10) & 0x3ff;
    let dr = PackedBuilder::new()
        .push_bool(haltreq) // 31
        .push_bool(resumereq) // 30
        .push_bool(hartreset) // 29
        .push_bool(ackhavereset) // 28
        .push_bool(false) // 27 reserved
        .push_bool(hasel) // 26
        .push_uint(hartsello as u128, 10)? // 25:16
        .push_uint(hartselhi as u128, 10)? // 15:6
        .push_bool(false) // 5 reserved
        .push_bool(false) // 4 reserved
        .push_bool(false) // 3 setresethaltreq
        .push_bool(false) // 2 clrresethaltreq
        .push_bool(ndmreset) // 1
        .push_bool(dmactive) // 0
        .finish_msb_first();
    Ok(dr)
}

fn sbcs_value(
    sbreadonaddr: bool,
    sbreadondata: bool,
    sbautoincrement: bool,
    sbaccess: u8,
) -> Result<BitArray, RiscvError> {
    let code = match sbaccess {
        8 => 0u128,
        16 => 1,
        32 => 2,
        64 => 3,
        128 => 4,
        other => {
            return Err(RiscvError::OutOfRange(format!(
                "sbaccess {other} not in {{8,16,32,64,128}}"
            )))
        }
    };
    let dr = PackedBuilder::new()
        .push_uint(0b001, 3)? // 31:29 sbversion = 1
        .push_bool(false) // 28 reserved
        .push_uint(code, 3)? // 27:25 sbaccess
        .push_bool(sbautoincrement) // 24
        .push_bool(sbreadonaddr) // 23
        .push_bool(sbreadondata) // 22
        .push_uint(0, 22)? // 21:0 reserved
        .finish_msb_first();
    Ok(dr)
}

/// Handle onto one RISC-V debug TAP already registered with a
/// [`JtagDriver`].
pub struct RiscvTap {
    tap_index: usize,
    dmiaccess_ir: BitArray,
}

impl RiscvTap {
    pub fn new(tap_index: usize) -> Self {
        Self {
            tap_index,
            dmiaccess_ir: BitArray::from_bin("0b10001").unwrap(),
        }
    }

    /// A single DMIACCESS shift carrying `op`/`addr`/`data`. The result of
    /// a READ or WRITE only becomes visible on the *next* DMIACCESS shift
    /// — see [`RiscvTap::dmi_op`].
    pub fn set_dmi(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        op: DmiOp,
        addr: u8,
        data: u32,
        comment: &str,
    ) -> Result<Vec<NormalVector>, RiscvError> {
        if addr >= 1 << 7 {
            return Err(RiscvError::OutOfRange(format!(
                "dmi address {addr:#x} exceeds 7 bits"
            )));
        }
        let dr = PackedBuilder::new()
            .push_uint(addr as u128, 7)?
            .push_uint(data as u128, 32)?
            .push_uint(op.code() as u128, 2)?
            .finish_msb_first();
        Ok(driver.write_reg(vb, self.tap_index, "DMIACCESS", &dr, comment)?)
    }

    /// Full DMI transaction: shift `op`/`addr`/`data`, let the module
    /// process it for [`DMI_SETTLE_CYCLES`], then shift a NOP and compare
    /// the result.
    pub fn dmi_op(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        op: DmiOp,
        addr: u8,
        data: u32,
        expected_status: Option<DmiStatus>,
        expected_data_bits: Option<Vec<Option<bool>>>,
        comment: &str,
    ) -> Result<Vec<NormalVector>, RiscvError> {
        let mut vectors = self.set_dmi(driver, vb, op, addr, data, comment)?;
        vectors.extend(driver.idle_vectors(vb, DMI_SETTLE_CYCLES)?);
        let expected = dmi_expected_bits(expected_status, expected_data_bits);
        vectors.extend(driver.read_reg(
            vb,
            self.tap_index,
            "DMIACCESS",
            Some(&expected),
            "Read DMI result. ",
        )?);
        Ok(vectors)
    }

    fn dmi_reset_vectors(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
    ) -> Result<Vec<NormalVector>, RiscvError> {
        let dtmcs_reset = BitArray::from_uint(1u128 << 16, 32)?;
        let mut vectors = driver.write_reg(vb, self.tap_index, "DTMCS", &dtmcs_reset, "DMI reset. ")?;
        vectors.extend(driver.set_ir(
            vb,
            self.tap_index,
            &self.dmiaccess_ir,
            "Re-select DMIACCESS. ",
        )?);
        Ok(vectors)
    }

    /// Matched-loop poll of a DMI-addressed register: issues one DMI read
    /// of `addr`, then repeatedly re-samples the DMIACCESS result with a
    /// NOP shift (the module continues processing the outstanding read
    /// independent of the scan chain, so re-issuing the read on every
    /// retry would just restart it). The idle side performs a DMI reset
    /// (clears sticky `busyerror`) and re-selects DMIACCESS. Always
    /// followed by 8 trailing normal vectors, so two polls can be composed
    /// back-to-back without landing a matched loop directly against
    /// another one.
    fn poll_dmi(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        addr: u8,
        expected_status: Option<DmiStatus>,
        expected_data_bits: Option<Vec<Option<bool>>>,
        retries: u32,
        comment: &str,
    ) -> Result<Vec<Vector>, RiscvError> {
        let mut vectors: Vec<Vector> = self
            .set_dmi(driver, vb, DmiOp::Read, addr, 0, comment)?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        let expected = dmi_expected_bits(expected_status, expected_data_bits);
        let condition = driver.read_reg(vb, self.tap_index, "DMIACCESS", Some(&expected), "Poll DMI. ")?;
        let idle_padding = driver.idle_vector(vb, 1, None)?;
        let condition = VectorBuilder::pad(condition, &idle_padding);
        let idle = self.dmi_reset_vectors(driver, vb)?;
        let idle = VectorBuilder::pad(idle, &idle_padding);
        vectors.push(vb.matched_loop(condition, idle, retries)?);
        // Make sure there are at least 8 normal vectors before the next matched loop.
        vectors.extend(driver.idle_vectors(vb, 8)?.into_iter().map(Vector::Normal));
        Ok(vectors)
    }

    fn wait_dmstatus_bit(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        bit: u8,
        wait_cycles: Option<u32>,
        retries: u32,
        comment: &str,
    ) -> Result<Vec<Vector>, RiscvError> {
        match wait_cycles {
            None => self.poll_dmi(
                driver,
                vb,
                DMI_ADDR_DMSTATUS,
                Some(DmiStatus::Success),
                Some(single_bit_bits(bit, true)),
                retries,
                comment,
            ),
            Some(n) => {
                let mut out: Vec<Vector> = driver
                    .idle_vectors(vb, n as usize)?
                    .into_iter()
                    .map(Vector::Normal)
                    .collect();
                out.extend(
                    self.dmi_op(
                        driver,
                        vb,
                        DmiOp::Read,
                        DMI_ADDR_DMSTATUS,
                        0,
                        Some(DmiStatus::Success),
                        Some(single_bit_bits(bit, true)),
                        comment,
                    )?
                    .into_iter()
                    .map(Vector::Normal),
                );
                Ok(out)
            }
        }
    }

    fn wait_abstract_command_done(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        wait_cycles: Option<u32>,
        retries: u32,
    ) -> Result<Vec<Vector>, RiscvError> {
        match wait_cycles {
            None => self.poll_dmi(
                driver,
                vb,
                DMI_ADDR_ABSTRACTCS,
                Some(DmiStatus::Success),
                Some(single_bit_bits(ABSTRACTCS_BIT_BUSY, false)),
                retries,
                "Poll abstract command done. ",
            ),
            Some(n) => {
                let mut out: Vec<Vector> = driver
                    .idle_vectors(vb, n as usize)?
                    .into_iter()
                    .map(Vector::Normal)
                    .collect();
                out.extend(
                    self.dmi_op(
                        driver,
                        vb,
                        DmiOp::Read,
                        DMI_ADDR_ABSTRACTCS,
                        0,
                        Some(DmiStatus::Success),
                        Some(single_bit_bits(ABSTRACTCS_BIT_BUSY, false)),
                        "Check abstract command done (fixed wait). ",
                    )?
                    .into_iter()
                    .map(Vector::Normal),
                );
                Ok(out)
            }
        }
    }

    /// `DATA0 <- data`, then an access-register abstract command with
    /// `transfer=1, write=1, regno`.
    pub fn write_reg_abstract_cmd(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        regno: u16,
        data: u32,
        wait_cycles: Option<u32>,
        retries: u32,
    ) -> Result<Vec<Vector>, RiscvError> {
        let mut vectors: Vec<Vector> = self
            .dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_DATA0,
                data,
                Some(DmiStatus::Success),
                None,
                "Write DATA0. ",
            )?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        let cmd_word = abstract_command_word(2, false, false, true, true, regno)?;
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_COMMAND,
                cmd_word,
                Some(DmiStatus::Success),
                None,
                "Issue write abstract command. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        vectors.extend(self.wait_abstract_command_done(driver, vb, wait_cycles, retries)?);
        Ok(vectors)
    }

    /// An access-register abstract command with `transfer=1, write=0,
    /// regno`, then `DATA0` read and compared against `expected`.
    pub fn read_reg_abstract_cmd(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        regno: u16,
        expected: u32,
        wait_cycles: Option<u32>,
        retries: u32,
    ) -> Result<Vec<Vector>, RiscvError> {
        let cmd_word = abstract_command_word(2, false, false, true, false, regno)?;
        let mut vectors: Vec<Vector> = self
            .dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_COMMAND,
                cmd_word,
                Some(DmiStatus::Success),
                None,
                "Issue read abstract command. ",
            )?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        vectors.extend(self.wait_abstract_command_done(driver, vb, wait_cycles, retries)?);
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Read,
                DMI_ADDR_DATA0,
                0,
                Some(DmiStatus::Success),
                Some(full_word_bits(expected)),
                "Read DATA0. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        Ok(vectors)
    }

    /// Halt `hart`: set `haltreq`, wait for `DMSTATUS.allhalted`, clear
    /// `haltreq`.
    pub fn halt(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        hart: u32,
        wait_cycles: Option<u32>,
        retries: u32,
    ) -> Result<Vec<Vector>, RiscvError> {
        let dmcontrol_on = dmcontrol_value(true, false, false, false, false, hart, false, true)?;
        let mut vectors: Vec<Vector> = self
            .dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_DMCONTROL,
                dmcontrol_on.to_uint()? as u32,
                Some(DmiStatus::Success),
                None,
                "Request halt. ",
            )?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        vectors.extend(self.wait_dmstatus_bit(
            driver,
            vb,
            DMSTATUS_BIT_ALLHALTED,
            wait_cycles,
            retries,
            "Check allhalted. ",
        )?);
        let dmcontrol_clear = dmcontrol_value(false, false, false, false, false, hart, false, true)?;
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_DMCONTROL,
                dmcontrol_clear.to_uint()? as u32,
                Some(DmiStatus::Success),
                None,
                "Clear haltreq. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        Ok(vectors)
    }

    /// Resume `hart`: set `resumereq`, wait for `DMSTATUS.allresumeack`,
    /// clear `resumereq`.
    pub fn resume(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        hart: u32,
        wait_cycles: Option<u32>,
        retries: u32,
    ) -> Result<Vec<Vector>, RiscvError> {
        let dmcontrol_on = dmcontrol_value(false, true, false, false, false, hart, false, true)?;
        let mut vectors: Vec<Vector> = self
            .dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_DMCONTROL,
                dmcontrol_on.to_uint()? as u32,
                Some(DmiStatus::Success),
                None,
                "Request resume. ",
            )?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        vectors.extend(self.wait_dmstatus_bit(
            driver,
            vb,
            DMSTATUS_BIT_ALLRESUMEACK,
            wait_cycles,
            retries,
            "Check allresumeack. ",
        )?);
        let dmcontrol_clear = dmcontrol_value(false, false, false, false, false, hart, false, true)?;
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_DMCONTROL,
                dmcontrol_clear.to_uint()? as u32,
                Some(DmiStatus::Success),
                None,
                "Clear resumereq. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        Ok(vectors)
    }

    /// Single-word system-bus write: configure SBCS, write SBADDRESS0,
    /// write SBDATA0 (the write itself triggers the bus transaction).
    pub fn write_mem(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        addr: u32,
        data: u32,
        sbaccess: u8,
    ) -> Result<Vec<Vector>, RiscvError> {
        let sbcs = sbcs_value(false, false, false, sbaccess)?;
        let mut vectors: Vec<Vector> = self
            .dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_SBCS,
                sbcs.to_uint()? as u32,
                Some(DmiStatus::Success),
                None,
                "Configure SBCS. ",
            )?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_SBADDRESS0,
                addr,
                Some(DmiStatus::Success),
                None,
                "Write SBADDRESS0. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_SBDATA0,
                data,
                Some(DmiStatus::Success),
                None,
                "Write SBDATA0. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        Ok(vectors)
    }

    /// Single-word system-bus read: configure SBCS with `sbreadonaddr`,
    /// write SBADDRESS0 (triggers the read), read SBDATA0.
    pub fn read_mem(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        addr: u32,
        expected: u32,
        sbaccess: u8,
    ) -> Result<Vec<Vector>, RiscvError> {
        let sbcs = sbcs_value(true, false, false, sbaccess)?;
        let mut vectors: Vec<Vector> = self
            .dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_SBCS,
                sbcs.to_uint()? as u32,
                Some(DmiStatus::Success),
                None,
                "Configure SBCS. ",
            )?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_SBADDRESS0,
                addr,
                Some(DmiStatus::Success),
                None,
                "Write SBADDRESS0 (triggers read). ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Read,
                DMI_ADDR_SBDATA0,
                0,
                Some(DmiStatus::Success),
                Some(full_word_bits(expected)),
                "Read SBDATA0. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        Ok(vectors)
    }

    /// Preload an ELF byte-map via SBA: enable autoincrement, write
    /// SBADDRESS0 only when a new contiguous run starts (gap > 4 bytes),
    /// then SBDATA0 per word, finishing with a sticky busy-error check and
    /// autoincrement disable.
    pub fn load_elf(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        byte_map: &BTreeMap<u64, u128>,
        sbaccess: u8,
        wait_cycles: Option<u32>,
    ) -> Result<Vec<Vector>, RiscvError> {
        let mut vectors: Vec<Vector> = Vec::new();
        let sbcs_on = sbcs_value(false, false, true, sbaccess)?;
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_SBCS,
                sbcs_on.to_uint()? as u32,
                Some(DmiStatus::Success),
                None,
                "Enable SB autoincrement. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        let mut prev_addr: Option<u64> = None;
        for (&addr, &word) in byte_map.iter() {
            let starts_new_run = match prev_addr {
                None => true,
                Some(prev) => addr.saturating_sub(prev) > 4,
            };
            if starts_new_run {
                vectors.extend(
                    self.dmi_op(
                        driver,
                        vb,
                        DmiOp::Write,
                        DMI_ADDR_SBADDRESS0,
                        addr as u32,
                        Some(DmiStatus::Success),
                        None,
                        "Write SBADDRESS0 (new run). ",
                    )?
                    .into_iter()
                    .map(Vector::Normal),
                );
            }
            vectors.extend(
                self.dmi_op(
                    driver,
                    vb,
                    DmiOp::Write,
                    DMI_ADDR_SBDATA0,
                    word as u32,
                    Some(DmiStatus::Success),
                    None,
                    "Write SBDATA0. ",
                )?
                .into_iter()
                .map(Vector::Normal),
            );
            if let Some(n) = wait_cycles {
                vectors.extend(driver.idle_vectors(vb, n as usize)?.into_iter().map(Vector::Normal));
            }
            prev_addr = Some(addr);
        }
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Nop,
                0,
                0,
                Some(DmiStatus::Success),
                None,
                "Check sticky busy-error. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        let sbcs_off = sbcs_value(false, false, false, sbaccess)?;
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_SBCS,
                sbcs_off.to_uint()? as u32,
                Some(DmiStatus::Success),
                None,
                "Disable SB autoincrement. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        Ok(vectors)
    }

    /// Read `addr` and compare against `{bit31=1, bits[30:0]=return_code}`
    /// after a fixed `wait_cycles` idle.
    pub fn check_end_of_computation(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        return_code: u32,
        wait_cycles: u32,
        addr: u32,
    ) -> Result<Vec<Vector>, RiscvError> {
        let sbcs = sbcs_value(true, false, false, 32)?;
        let mut vectors: Vec<Vector> = self
            .dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_SBCS,
                sbcs.to_uint()? as u32,
                Some(DmiStatus::Success),
                None,
                "Configure SBCS for EOC poll. ",
            )?
            .into_iter()
            .map(Vector::Normal)
            .collect();
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Write,
                DMI_ADDR_SBADDRESS0,
                addr,
                Some(DmiStatus::Success),
                None,
                "Write EOC address (triggers read). ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        vectors.extend(driver.idle_vectors(vb, wait_cycles as usize)?.into_iter().map(Vector::Normal));
        let expected_value = (1u32 << 31) | (return_code & 0x7fff_ffff);
        vectors.extend(
            self.dmi_op(
                driver,
                vb,
                DmiOp::Read,
                DMI_ADDR_SBDATA0,
                0,
                Some(DmiStatus::Success),
                Some(full_word_bits(expected_value)),
                "Read EOC status. ",
            )?
            .into_iter()
            .map(Vector::Normal),
        );
        Ok(vectors)
    }

    /// Matched-loop wrapper around [`RiscvTap::check_end_of_computation`]:
    /// the idle body inserts `idle_vector_count` JTAG idles. Always
    /// followed by 8 trailing normal vectors, so two polls can be composed
    /// back-to-back without landing a matched loop directly against
    /// another one.
    pub fn wait_for_end_of_computation(
        &self,
        driver: &JtagDriver,
        vb: &mut VectorBuilder,
        return_code: u32,
        addr: u32,
        idle_vector_count: usize,
        retries: u32,
    ) -> Result<Vec<Vector>, RiscvError> {
        let sbcs = sbcs_value(true, false, false, 32)?;
        let mut condition: Vec<NormalVector> = self.dmi_op(
            driver,
            vb,
            DmiOp::Write,
            DMI_ADDR_SBCS,
            sbcs.to_uint()? as u32,
            Some(DmiStatus::Success),
            None,
            "Configure SBCS for EOC poll. ",
        )?;
        condition.extend(self.dmi_op(
            driver,
            vb,
            DmiOp::Write,
            DMI_ADDR_SBADDRESS0,
            addr,
            Some(DmiStatus::Success),
            None,
            "Write EOC address (triggers read). ",
        )?);
        let expected_value = (1u32 << 31) | (return_code & 0x7fff_ffff);
        condition.extend(self.dmi_op(
            driver,
            vb,
            DmiOp::Read,
            DMI_ADDR_SBDATA0,
            0,
            Some(DmiStatus::Success),
            Some(full_word_bits(expected_value)),
            "Read EOC status. ",
        )?);
        let idle_padding = driver.idle_vector(vb, 1, None)?;
        let condition = VectorBuilder::pad(condition, &idle_padding);
        let idle = driver.idle_vectors(vb, idle_vector_count)?;
        let idle = VectorBuilder::pad(idle, &idle_padding);
        let mut vectors = vec![vb.matched_loop(condition, idle, retries)?];
        // Make sure there are at least 8 normal vectors before the next matched loop.
        vectors.extend(driver.idle_vectors(vb, 8)?.into_iter().map(Vector::Normal));
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::{PinDecl, PinDirection};

    fn chip_pins() -> VectorBuilder {
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
        VectorBuilder::new(m)
    }

    fn driver_with_riscv_tap() -> (JtagDriver, RiscvTap) {
        let mut driver = JtagDriver::new(crate::jtag::JtagPins {
            tck: "tck".to_string(),
            tms: "tms".to_string(),
            tdi: "tdi".to_string(),
            tdo: "tdo".to_string(),
            trst: "trst".to_string(),
        });
        driver.add_tap(build_jtag_tap("RISCV", 0x2495_11c3));
        (driver, RiscvTap::new(0))
    }

    #[test]
    fn abstract_command_word_rejects_bad_aarsize() {
        let err = abstract_command_word(5, false, false, true, false, CSR_DPC).unwrap_err();
        assert!(matches!(err, RiscvError::InvalidCommand(_)));
    }

    #[test]
    fn dmcontrol_value_splits_hartsel() {
        let dr = dmcontrol_value(true, false, false, false, false, 0x3e0, false, true).unwrap();
        assert_eq!(dr.len(), 32);
        assert!(dr.get(31).unwrap()); // haltreq
        assert!(dr.get(0).unwrap()); // dmactive
    }

    #[test]
    fn dmcontrol_value_rejects_oversized_hart() {
        let err = dmcontrol_value(true, false, false, false, false, 1 << 20, false, true).unwrap_err();
        assert!(matches!(err, RiscvError::OutOfRange(_)));
    }

    #[test]
    fn halt_emits_nonempty_vector_sequence() {
        let (driver, tap) = driver_with_riscv_tap();
        let mut vb = chip_pins();
        let vectors = tap.halt(&driver, &mut vb, 0x3e0, None, 5).unwrap();
        assert!(!vectors.is_empty());
    }

    #[test]
    fn read_reg_abstract_cmd_emits_data0_read() {
        let (driver, tap) = driver_with_riscv_tap();
        let mut vb = chip_pins();
        let vectors = tap
            .read_reg_abstract_cmd(&driver, &mut vb, CSR_DPC, 0x1c00_8080, None, 5)
            .unwrap();
        assert!(!vectors.is_empty());
    }

    #[test]
    fn check_end_of_computation_uses_default_eoc_addr() {
        let (driver, tap) = driver_with_riscv_tap();
        let mut vb = chip_pins();
        let vectors = tap
            .check_end_of_computation(&driver, &mut vb, 0, 10, DEFAULT_EOC_ADDR)
            .unwrap();
        assert!(!vectors.is_empty());
    }

    #[test]
    fn wait_for_end_of_computation_produces_matched_loop() {
        let (driver, tap) = driver_with_riscv_tap();
        let mut vb = chip_pins();
        let result = tap
            .wait_for_end_of_computation(&driver, &mut vb, 0, DEFAULT_EOC_ADDR, 4, 10)
            .unwrap();
        let (matched_loop, trailing) = result.split_first().unwrap();
        match matched_loop {
            Vector::MatchedLoop(m) => {
                assert_eq!(m.condition.len() % 8, 0);
                assert_eq!(m.idle.len() % 8, 0);
                assert_eq!(m.retries, 10);
            }
            _ => panic!("expected a matched loop"),
        }
        assert_eq!(trailing.len(), 8);
        assert!(trailing.iter().all(|v| matches!(v, Vector::Normal(_))));
    }

    fn normal_comments(vectors: &[Vector]) -> Vec<String> {
        vectors
            .iter()
            .filter_map(|v| match v {
                Vector::Normal(n) => n.comment.clone(),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn halt_loop_flavor_issues_a_dmi_read_before_polling_dmstatus() {
        let (driver, tap) = driver_with_riscv_tap();
        let mut vb = chip_pins();
        let vectors = tap.halt(&driver, &mut vb, 0, None, 5).unwrap();
        let loop_pos = vectors
            .iter()
            .position(|v| matches!(v, Vector::MatchedLoop(_)))
            .expect("halt's loop flavor should emit a matched loop for the dmstatus poll");
        let before = normal_comments(&vectors[..loop_pos]);
        assert!(
            before.iter().any(|c| c.contains("Check allhalted. /Set IR of tap RISCV")),
            "expected an initiating DMI read of DMSTATUS before the matched-loop poll, got: {before:?}"
        );
    }
}
