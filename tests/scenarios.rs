//! End-to-end scenarios against the public library API: one test per
//! named scenario, each checked against the concrete bit patterns and
//! comment trails the generators emit rather than against raw byte
//! counts, so a broken field width or wrong DMI address shows up here
//! even when a narrower unit test nearby wouldn't catch it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tapstim::bitarray::{BitArray, PackedBuilder};
use tapstim::chip::ReferenceChip;
use tapstim::elf;
use tapstim::jtag::{ExpectedBits, JtagDriver, JtagPins};
use tapstim::sink::avc::{AvcReader, AvcSink};
use tapstim::sink::VectorSink;
use tapstim::taps::riscv::{self, DEFAULT_EOC_ADDR};
use tapstim::vector::{PinDecl, PinDirection, Vector, VectorBuilder};

fn flatten_comments(vectors: &[Vector], out: &mut Vec<String>) {
    for v in vectors {
        match v {
            Vector::Normal(n) => out.extend(n.comment.clone()),
            Vector::Loop(l) => flatten_comments(&l.body, out),
            Vector::MatchedLoop(m) => {
                for n in m.condition.iter().chain(m.idle.iter()) {
                    out.extend(n.comment.clone());
                }
            }
        }
    }
}

fn comments(vectors: &[Vector]) -> Vec<String> {
    let mut out = Vec::new();
    flatten_comments(vectors, &mut out);
    out
}

fn any_contains(cs: &[String], needle: &str) -> bool {
    cs.iter().any(|c| c.contains(needle))
}

fn tempfile(name: &str) -> PathBuf {
    let mut dir = std::env::temp_dir();
    dir.push(format!("tapstim-scenario-{name}-{}.avc", std::process::id()));
    dir
}

fn jtag_pins() -> JtagPins {
    JtagPins {
        tck: "tck".to_string(),
        tms: "tms".to_string(),
        tdi: "tdi".to_string(),
        tdo: "tdo".to_string(),
        trst: "trst".to_string(),
    }
}

fn minimal_vb() -> VectorBuilder {
    let mut pins = BTreeMap::new();
    for name in ["tck", "tms", "tdi", "tdo", "trst"] {
        pins.insert(
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
    VectorBuilder::new(pins)
}

/// Scenario A — halt hart 0x3e0, read CSR_DPC expecting 0x1c008080, resume.
#[test]
fn scenario_a_halt_and_read_pc() {
    let chip = ReferenceChip::new();
    let halt_vectors = chip.halt_core_verify_pc(0x1c00_8080, None).unwrap();
    let cs = comments(&halt_vectors);

    assert!(any_contains(&cs, "Request halt. "));
    assert!(any_contains(&cs, "Issue read abstract command. "));
    assert!(any_contains(&cs, "Read DATA0. "));
    assert!(any_contains(&cs, "Clear haltreq. "));

    // DMCONTROL write: haltreq(31)=1, dmactive(0)=1, hartsello(25:16)=0x3e0.
    let expected_dmcontrol = (1u32 << 31) | (0x3e0u32 << 16) | 1;
    let dmcontrol_dmi = PackedBuilder::new()
        .push_uint(0x10, 7) // DMI_ADDR_DMCONTROL
        .unwrap()
        .push_uint(expected_dmcontrol as u128, 32)
        .unwrap()
        .push_uint(2, 2) // DmiOp::Write
        .unwrap()
        .finish_msb_first();
    assert!(any_contains(
        &cs,
        &format!("Set DR of tap RISCV to [{}]", dmcontrol_dmi.pretty())
    ));

    // Abstract command: regno=CSR_DPC(0x7b1), transfer=1, write=0, aarsize=2.
    let cmd_word = PackedBuilder::new()
        .push_uint(0, 8) // cmd_type = Access Register
        .unwrap()
        .push_uint(2, 3) // aarsize
        .unwrap()
        .push_bool(false) // reserved
        .push_bool(false) // aarpostinc
        .push_bool(false) // postexec
        .push_bool(true) // transfer
        .push_bool(false) // write
        .push_uint(0x7b1, 16)
        .unwrap()
        .finish_msb_first();
    let cmd_dmi = PackedBuilder::new()
        .push_uint(0x17, 7) // DMI_ADDR_COMMAND
        .unwrap()
        .push_uint(cmd_word.to_uint().unwrap(), 32)
        .unwrap()
        .push_uint(2, 2)
        .unwrap()
        .finish_msb_first();
    assert!(any_contains(
        &cs,
        &format!("Set DR of tap RISCV to [{}]", cmd_dmi.pretty())
    ));

    // Deterministic: the same request always emits the same vectors.
    assert_eq!(halt_vectors, chip.halt_core_verify_pc(0x1c00_8080, None).unwrap());

    let resume_vectors = chip.resume_core(None).unwrap();
    let rc = comments(&resume_vectors);
    assert!(any_contains(&rc, "Request resume. "));
    assert!(any_contains(&rc, "Clear resumereq. "));
}

/// Scenario B — write/verify one word via the PULP advanced-debug TAP.
#[test]
fn scenario_b_write_and_verify_one_word_via_pulp() {
    let chip = ReferenceChip::new();
    let write_vectors = chip.write_mem(0x1c00_8080, 0xdead_beef, false).unwrap();
    let wc = comments(&write_vectors);

    let module_select_dr = BitArray::from_uint(0b100000, 6).unwrap();
    assert!(any_contains(
        &wc,
        &format!("Set DR of tap PULP to [{}]", module_select_dr.pretty())
    ));

    let setup_burst_dr = PackedBuilder::new()
        .push_uint(0x3, 4) // BurstCmd::Write32
        .unwrap()
        .push_uint(0x1c00_8080, 32)
        .unwrap()
        .push_uint(1, 16)
        .unwrap()
        .finish_msb_first();
    assert!(any_contains(
        &wc,
        &format!("Set DR of tap PULP to [{}]", setup_burst_dr.pretty())
    ));

    let write_burst_dr = PackedBuilder::new()
        .push_bool(true) // start bit
        .push_bits(BitArray::from_uint(0xdead_beef, 32).unwrap().reversed())
        .push_uint(0xffff_ffff, 32)
        .unwrap()
        .push_bool(false) // trailing bit
        .finish_msb_first();
    assert!(any_contains(
        &wc,
        &format!("Set DR of tap PULP to [{}]", write_burst_dr.pretty())
    ));

    let verify_vectors = chip.verify_mem(0x1c00_8080, 0xdead_beef, false).unwrap();
    let vc = comments(&verify_vectors);
    let read_setup_burst_dr = PackedBuilder::new()
        .push_uint(0x7, 4) // BurstCmd::Read32
        .unwrap()
        .push_uint(0x1c00_8080, 32)
        .unwrap()
        .push_uint(1, 16)
        .unwrap()
        .finish_msb_first();
    assert!(any_contains(
        &vc,
        &format!("Set DR of tap PULP to [{}]", read_setup_burst_dr.pretty())
    ));
    assert!(any_contains(&vc, "Poll read burst status. "));

    assert_eq!(write_vectors, chip.write_mem(0x1c00_8080, 0xdead_beef, false).unwrap());
}

/// A minimal hand-built ELF64 whose PT_LOAD segments yield exactly the
/// byte-map `{0x1c008080:0x11111111, 0x1c008084:0x22222222,
/// 0x1c008100:0x33333333}`, so the gap of 0x7c bytes between the second
/// and third word forces a two-burst split.
fn build_fixture_elf() -> Vec<u8> {
    let mut buf = Vec::new();

    buf.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
    buf.push(2); // EI_CLASS = ELFCLASS64
    buf.push(1); // EI_DATA = ELFDATA2LSB
    buf.push(1); // EI_VERSION
    buf.push(0); // EI_OSABI
    buf.extend_from_slice(&[0u8; 8]); // EI_ABIVERSION + padding

    buf.extend_from_slice(&2u16.to_le_bytes()); // e_type = ET_EXEC
    buf.extend_from_slice(&243u16.to_le_bytes()); // e_machine = EM_RISCV
    buf.extend_from_slice(&1u32.to_le_bytes()); // e_version
    buf.extend_from_slice(&0x1c00_8080u64.to_le_bytes()); // e_entry
    buf.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
    buf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
    buf.extend_from_slice(&0u32.to_le_bytes()); // e_flags
    buf.extend_from_slice(&64u16.to_le_bytes()); // e_ehsize
    buf.extend_from_slice(&56u16.to_le_bytes()); // e_phentsize
    buf.extend_from_slice(&2u16.to_le_bytes()); // e_phnum
    buf.extend_from_slice(&0u16.to_le_bytes()); // e_shentsize
    buf.extend_from_slice(&0u16.to_le_bytes()); // e_shnum
    buf.extend_from_slice(&0u16.to_le_bytes()); // e_shstrndx
    assert_eq!(buf.len(), 64);

    let seg0_offset = 64 + 56 * 2; // 176
    buf.extend_from_slice(&1u32.to_le_bytes()); // p_type = PT_LOAD
    buf.extend_from_slice(&7u32.to_le_bytes()); // p_flags = RWX
    buf.extend_from_slice(&(seg0_offset as u64).to_le_bytes()); // p_offset
    buf.extend_from_slice(&0x1c00_8080u64.to_le_bytes()); // p_vaddr
    buf.extend_from_slice(&0x1c00_8080u64.to_le_bytes()); // p_paddr
    buf.extend_from_slice(&8u64.to_le_bytes()); // p_filesz
    buf.extend_from_slice(&8u64.to_le_bytes()); // p_memsz
    buf.extend_from_slice(&4u64.to_le_bytes()); // p_align

    let seg1_offset = seg0_offset + 8; // 184
    buf.extend_from_slice(&1u32.to_le_bytes());
    buf.extend_from_slice(&7u32.to_le_bytes());
    buf.extend_from_slice(&(seg1_offset as u64).to_le_bytes());
    buf.extend_from_slice(&0x1c00_8100u64.to_le_bytes());
    buf.extend_from_slice(&0x1c00_8100u64.to_le_bytes());
    buf.extend_from_slice(&4u64.to_le_bytes());
    buf.extend_from_slice(&4u64.to_le_bytes());
    buf.extend_from_slice(&4u64.to_le_bytes());
    assert_eq!(buf.len(), seg0_offset);

    buf.extend_from_slice(&0x1111_1111u32.to_le_bytes());
    buf.extend_from_slice(&0x2222_2222u32.to_le_bytes());
    buf.extend_from_slice(&0x3333_3333u32.to_le_bytes());

    buf
}

/// Scenario C — ELF preload splits into two bursts on a gap > 4 bytes.
#[test]
fn scenario_c_elf_preload_splits_on_gap() {
    let elf_path = tempfile("elf-fixture");
    std::fs::write(&elf_path, build_fixture_elf()).unwrap();

    let loaded = elf::load_byte_map(&elf_path, 4).unwrap();
    assert_eq!(loaded.byte_map.len(), 3);
    assert_eq!(loaded.byte_map[&0x1c00_8080], 0x1111_1111);
    assert_eq!(loaded.byte_map[&0x1c00_8084], 0x2222_2222);
    assert_eq!(loaded.byte_map[&0x1c00_8100], 0x3333_3333);

    let chip = ReferenceChip::new();
    let vectors = chip.execute_elf(&elf_path, false, None).unwrap();
    let cs = comments(&vectors);

    let setup_burst_count = cs.iter().filter(|c| c.contains("Setup burst. ")).count();
    assert_eq!(
        setup_burst_count, 2,
        "a gap of more than 4 bytes between 0x1c008084 and 0x1c008100 must split the load into two bursts"
    );

    let first_burst_dr = PackedBuilder::new()
        .push_uint(0x3, 4) // BurstCmd::Write32
        .unwrap()
        .push_uint(0x1c00_8080, 32)
        .unwrap()
        .push_uint(2, 16) // two contiguous words
        .unwrap()
        .finish_msb_first();
    assert!(any_contains(
        &cs,
        &format!("Set DR of tap PULP to [{}]", first_burst_dr.pretty())
    ));

    let second_burst_dr = PackedBuilder::new()
        .push_uint(0x3, 4)
        .unwrap()
        .push_uint(0x1c00_8100, 32)
        .unwrap()
        .push_uint(1, 16) // one word
        .unwrap()
        .finish_msb_first();
    assert!(any_contains(
        &cs,
        &format!("Set DR of tap PULP to [{}]", second_burst_dr.pretty())
    ));

    let _ = std::fs::remove_file(&elf_path);
}

/// Scenario D — end-of-computation poll, fixed-wait flavor.
#[test]
fn scenario_d_end_of_computation_poll() {
    let chip = ReferenceChip::new();
    let vectors = chip.check_eoc(0, 10, false).unwrap();
    let cs = comments(&vectors);

    assert!(any_contains(&cs, "Configure SBCS for EOC poll. "));
    assert!(any_contains(&cs, "Write EOC address (triggers read). "));
    assert!(any_contains(&cs, "Read EOC status. "));
    assert!(any_contains(&cs, "Read DMI result. "));
    assert!(any_contains(&cs, "expecting to read a matching value"));

    let sbcs_dr = PackedBuilder::new()
        .push_uint(0b001, 3) // sbversion = 1
        .unwrap()
        .push_bool(false) // reserved
        .push_uint(2, 3) // sbaccess=32 -> code 2
        .unwrap()
        .push_bool(false) // sbautoincrement
        .push_bool(true) // sbreadonaddr
        .push_bool(false) // sbreadondata
        .push_uint(0, 22)
        .unwrap()
        .finish_msb_first();
    let sbcs_dmi = PackedBuilder::new()
        .push_uint(0x38, 7) // DMI_ADDR_SBCS
        .unwrap()
        .push_uint(sbcs_dr.to_uint().unwrap(), 32)
        .unwrap()
        .push_uint(2, 2) // DmiOp::Write
        .unwrap()
        .finish_msb_first();
    assert!(any_contains(
        &cs,
        &format!("Set DR of tap RISCV to [{}]", sbcs_dmi.pretty())
    ));

    let sbaddress_dmi = PackedBuilder::new()
        .push_uint(0x39, 7) // DMI_ADDR_SBADDRESS0
        .unwrap()
        .push_uint(DEFAULT_EOC_ADDR as u128, 32)
        .unwrap()
        .push_uint(2, 2)
        .unwrap()
        .finish_msb_first();
    assert!(any_contains(
        &cs,
        &format!("Set DR of tap RISCV to [{}]", sbaddress_dmi.pretty())
    ));

    let v10 = chip.check_eoc(0, 10, false).unwrap();
    let v20 = chip.check_eoc(0, 20, false).unwrap();
    assert_eq!(
        v20.len(),
        v10.len() + 10,
        "the fixed-wait flavor should add exactly wait_cycles idle vectors"
    );
}

/// Scenario E — compression preserves semantics across a round-trip.
#[test]
fn scenario_e_compression_preserves_semantics() {
    let vb = minimal_vb();
    let repeated = vb.vector(1, Some("idle".to_string()));
    let stream: Vec<Vector> = (0..100).map(|_| Vector::Normal(repeated.clone())).collect();

    let compressed = VectorBuilder::compress(stream.clone());
    assert_eq!(compressed.len(), 1);
    match &compressed[0] {
        Vector::Normal(n) => assert_eq!(n.repeat, 100),
        other => panic!("expected a single normal vector, got {other:?}"),
    }

    let sum_before: u64 = stream
        .iter()
        .map(|v| match v {
            Vector::Normal(n) => n.repeat as u64,
            _ => 0,
        })
        .sum();
    let sum_after: u64 = compressed
        .iter()
        .map(|v| match v {
            Vector::Normal(n) => n.repeat as u64,
            _ => 0,
        })
        .sum();
    assert_eq!(sum_before, sum_after);

    let path = tempfile("compression");
    let mut sink = AvcSink::new(&path, vb.pins(), None, "dvc_1", "Standard ATI");
    sink.open().unwrap();
    sink.write_vectors(&stream, true).unwrap();
    sink.close().unwrap();

    let mut reader = AvcReader::new(&path, vb.pins());
    let read_back = reader.read_all().unwrap();
    assert_eq!(read_back.len(), 1);
    match &read_back[0] {
        Vector::Normal(n) => assert_eq!(n.repeat, 100),
        other => panic!("expected a single normal vector after round-trip, got {other:?}"),
    }

    let _ = std::fs::remove_file(&path);
    let _ = std::fs::remove_file(path.with_extension("wtb"));
    let _ = std::fs::remove_file(path.with_extension("tmf"));
}

/// Scenario F — `poll_reg` always shapes a MatchedLoop followed by at
/// least 8 trailing NormalVectors, so two polls compose without ever
/// landing a matched loop directly against another one.
#[test]
fn scenario_f_poll_reg_matched_loop_padding() {
    let mut driver = JtagDriver::new(jtag_pins());
    driver.add_tap(riscv::build_jtag_tap("RISCV", 0x2495_11c3));
    let mut vb = minimal_vb();
    let expected = ExpectedBits::all_dont_care(32);

    let result = driver
        .poll_reg(&mut vb, 0, "IDCODE", &expected, 5, "Poll IDCODE. ")
        .unwrap();

    let (matched_loop, trailing) = result.split_first().unwrap();
    match matched_loop {
        Vector::MatchedLoop(m) => {
            assert!(!m.condition.is_empty());
            assert_eq!(m.condition.len() % 8, 0);
            assert_eq!(m.idle.len(), 8);
            assert_eq!(m.retries, 5);
        }
        other => panic!("expected a matched loop, got {other:?}"),
    }
    assert_eq!(trailing.len(), 8);
    assert!(trailing.iter().all(|v| matches!(v, Vector::Normal(_))));
}
