//! # Victim image loading
//!
//! Loads statically linked, non position independent x86-64 ELF executables
//! into a [`VictimImage`]: the loadable segments plus every function symbol
//! as a routine. Raw images built from machine code are supported as well,
//! mainly for tests.

use crate::instrumentation::RoutineInfo;
use elf::{endian::AnyEndian, ElfBytes};
use log::debug;
use std::collections::HashSet;
use std::path::Path;

pub use elf::abi::*;

/// One loadable segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u64,
    /// File backed content, the rest up to `size` is zero filled
    pub data: Vec<u8>,
    /// Size in memory
    pub size: u64,
}

/// Executable image of a victim program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VictimImage {
    pub name: String,
    pub entry: u64,
    pub segments: Vec<Segment>,
    /// Function symbols sorted by address
    pub routines: Vec<RoutineInfo>,
}

impl VictimImage {
    /// Parse an ELF executable.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to a statically linked x86-64 executable.
    ///
    /// # Returns
    ///
    /// * `Ok(VictimImage)` - Segments and routines of the executable.
    /// * `Err(String)` - File not readable, not x86-64 or without symbol table.
    pub fn from_elf(path: &Path) -> Result<Self, String> {
        let file_data = std::fs::read(path)
            .map_err(|e| format!("Could not read {}: {}", path.display(), e))?;
        let elf_data = ElfBytes::<AnyEndian>::minimal_parse(file_data.as_ref())
            .map_err(|e| format!("Open file data failed: {e}"))?;

        if elf_data.ehdr.e_machine != EM_X86_64 {
            return Err(format!(
                "{} is not an x86-64 executable (machine {})",
                path.display(),
                elf_data.ehdr.e_machine
            ));
        }

        // Get all loadable program headers and their data
        let segments = elf_data
            .segments()
            .ok_or("Missing program headers")?
            .iter()
            .filter(|ph| ph.p_type == PT_LOAD)
            .map(|ph| {
                let data = elf_data
                    .segment_data(&ph)
                    .map_err(|e| format!("Segment at 0x{:x}: {e}", ph.p_vaddr))?;
                Ok(Segment {
                    address: ph.p_vaddr,
                    data: data.to_vec(),
                    size: ph.p_memsz.max(data.len() as u64),
                })
            })
            .collect::<Result<Vec<_>, String>>()?;

        // Parse out all function symbols with their names
        let (symtab, strtab) = elf_data
            .symbol_table()
            .map_err(|e| format!("Symbol table: {e}"))?
            .ok_or("Missing symbol table")?;
        let mut seen = HashSet::new();
        let mut routines = Vec::new();
        for symbol in symtab.iter() {
            if symbol.st_symtype() != STT_FUNC || symbol.st_value == 0 {
                continue;
            }
            let name = strtab
                .get(symbol.st_name as usize)
                .map_err(|e| format!("Symbol name: {e}"))?;
            if name.is_empty() || !seen.insert(name.to_string()) {
                continue;
            }
            routines.push(RoutineInfo {
                name: name.to_string(),
                address: symbol.st_value,
                size: symbol.st_size,
            });
        }
        routines.sort_by_key(|routine| routine.address);
        debug!(
            "Loaded {}: {} segments, {} routines",
            path.display(),
            segments.len(),
            routines.len()
        );

        Ok(Self {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().to_string())
                .unwrap_or_default(),
            entry: elf_data.ehdr.e_entry,
            segments,
            routines,
        })
    }

    /// Image made of one code segment at `base`, entry at `base`.
    ///
    /// `symbols` are routine names with their offset from `base`. Their size is
    /// left open, so their instruction streams end at the first return.
    pub fn from_raw(name: &str, base: u64, code: Vec<u8>, symbols: &[(&str, u64)]) -> Self {
        let mut routines: Vec<RoutineInfo> = symbols
            .iter()
            .map(|(name, offset)| RoutineInfo {
                name: name.to_string(),
                address: base + offset,
                size: 0,
            })
            .collect();
        routines.sort_by_key(|routine| routine.address);
        Self {
            name: name.to_string(),
            entry: base,
            segments: vec![Segment {
                address: base,
                size: code.len() as u64,
                data: code,
            }],
            routines,
        }
    }

    /// Add a data segment
    pub fn with_segment(mut self, address: u64, data: Vec<u8>, size: u64) -> Self {
        self.segments.push(Segment {
            address,
            size: size.max(data.len() as u64),
            data,
        });
        self
    }

    pub fn routine(&self, name: &str) -> Option<&RoutineInfo> {
        self.routines.iter().find(|routine| routine.name == name)
    }

    /// File backed bytes from `address` up to `length` bytes, clipped at the
    /// end of the containing segment
    pub fn bytes_at(&self, address: u64, length: usize) -> Option<&[u8]> {
        self.segments.iter().find_map(|segment| {
            let offset = address.checked_sub(segment.address)? as usize;
            if offset >= segment.data.len() {
                return None;
            }
            let end = segment.data.len().min(offset.saturating_add(length));
            Some(&segment.data[offset..end])
        })
    }
}
