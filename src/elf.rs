//! ELF loadable-segment reader: the boundary between an ELF binary on disk
//! and the word-keyed byte-map the PULP and RISC-V preload paths consume.
//!
//! Only `PT_LOAD` segments are considered. Each segment contributes its
//! `p_filesz` bytes at `p_paddr`, plus `p_memsz - p_filesz` trailing zero
//! bytes (bss). Bytes are aggregated into `word_width`-wide little-endian
//! words anchored to word-width-aligned addresses, merging with any value
//! already present at that address (read-modify-write), the same way
//! `ElfParser.__add_mem_word` does it.

use std::collections::BTreeMap;
use std::path::Path;

use goblin::elf::Elf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ElfError {
    #[error("failed to read {path}: {cause}")]
    Io {
        path: String,
        #[source]
        cause: std::io::Error,
    },

    #[error("malformed ELF at {path}: {cause}")]
    Parse {
        path: String,
        #[source]
        cause: goblin::error::Error,
    },

    #[error("unsupported word width {0}; expected one of 1, 2, 4, 8, 16 bytes")]
    UnsupportedWordWidth(usize),
}

/// A parsed ELF's loadable segments, merged into a word-aligned byte-map,
/// plus its entry point.
pub struct LoadedElf {
    pub byte_map: BTreeMap<u64, u128>,
    pub entry: u64,
}

/// Read `path`, keep only `PT_LOAD` segments, and fold them into a
/// `word_width`-byte-wide address-keyed map (zero-filled bss included).
///
/// `word_width` is in bytes (1, 2, 4, 8, or 16, matching the 8/16/32/64/128
/// bit word widths named in the spec).
pub fn load_byte_map(path: impl AsRef<Path>, word_width: usize) -> Result<LoadedElf, ElfError> {
    if !matches!(word_width, 1 | 2 | 4 | 8 | 16) {
        return Err(ElfError::UnsupportedWordWidth(word_width));
    }
    let path = path.as_ref();
    let path_str = path.display().to_string();
    let data = std::fs::read(path).map_err(|cause| ElfError::Io {
        path: path_str.clone(),
        cause,
    })?;
    let elf = Elf::parse(&data).map_err(|cause| ElfError::Parse {
        path: path_str.clone(),
        cause,
    })?;

    let mut byte_map: BTreeMap<u64, u128> = BTreeMap::new();
    for segment in elf.program_headers.iter() {
        if segment.p_type != goblin::elf::program_header::PT_LOAD {
            continue;
        }
        let file_start = segment.p_offset as usize;
        let file_end = file_start + segment.p_filesz as usize;
        let segment_data = data.get(file_start..file_end).unwrap_or(&[]);
        add_bytes(&mut byte_map, segment.p_paddr, segment_data, word_width);

        let bss_len = segment.p_memsz.saturating_sub(segment.p_filesz) as usize;
        if bss_len > 0 {
            let bss_start = segment.p_paddr + segment.p_filesz;
            let zeros = vec![0u8; bss_len];
            add_bytes(&mut byte_map, bss_start, &zeros, word_width);
        }
    }

    Ok(LoadedElf {
        byte_map,
        entry: elf.header.e_entry,
    })
}

/// Merge `data` (starting at guest address `base`) into `map`, aggregating
/// into `word_width`-aligned little-endian words and read-modify-writing
/// any word already present.
fn add_bytes(map: &mut BTreeMap<u64, u128>, base: u64, data: &[u8], word_width: usize) {
    let width = word_width as u64;
    let mut addr = base;
    let mut offset = 0usize;
    while offset < data.len() {
        let aligned_base = addr & !(width - 1);
        let shift = (addr - aligned_base) as usize;
        let chunk_len = (word_width - shift).min(data.len() - offset);

        let mut value = map.get(&aligned_base).copied().unwrap_or(0);
        let mask = !(word_mask(chunk_len) << (shift * 8));
        value &= mask;
        let mut chunk_value: u128 = 0;
        for (i, &byte) in data[offset..offset + chunk_len].iter().enumerate() {
            chunk_value |= (byte as u128) << (i * 8);
        }
        value |= chunk_value << (shift * 8);
        map.insert(aligned_base, value);

        addr += chunk_len as u64;
        offset += chunk_len;
    }
}

fn word_mask(word_width: usize) -> u128 {
    if word_width >= 16 {
        u128::MAX
    } else {
        (1u128 << (word_width * 8)) - 1
    }
}
