//! DWARF line info for stack frames
//!
//! Maps a file-relative instruction address to source file:line using the
//! addr2line crate. Only loaded when `--source` is requested; most system
//! libraries ship without debug info and simply have no line table.

use anyhow::{Context, Result};
use object::{Object, ObjectSection};
use std::fs::File;
use std::path::Path;

/// Source location of an instruction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
}

impl std::fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.file, self.line)
    }
}

/// Line tables of one ELF object
pub struct SourceLines {
    context: addr2line::Context<gimli::EndianRcSlice<gimli::RunTimeEndian>>,
}

impl std::fmt::Debug for SourceLines {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceLines").finish_non_exhaustive()
    }
}

impl SourceLines {
    /// Load DWARF sections from an ELF file
    pub fn load(binary_path: &Path) -> Result<Self> {
        let file = File::open(binary_path)
            .with_context(|| format!("Failed to open binary: {}", binary_path.display()))?;

        let mmap = unsafe { memmap2::Mmap::map(&file) }.context("Failed to memory-map binary")?;

        let object = object::File::parse(&*mmap).context("Failed to parse ELF binary")?;

        if object.section_by_name(".debug_line").is_none() {
            anyhow::bail!("{} has no .debug_line section", binary_path.display());
        }

        let endian = if object.is_little_endian() {
            gimli::RunTimeEndian::Little
        } else {
            gimli::RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<gimli::EndianRcSlice<gimli::RunTimeEndian>> {
            let data = object
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or(std::borrow::Cow::Borrowed(&[]));
            let bytes: std::rc::Rc<[u8]> = std::rc::Rc::from(data.into_owned());
            Ok(gimli::EndianRcSlice::new(bytes, endian))
        };

        let dwarf = gimli::Dwarf::load(&load_section).context("Failed to load DWARF sections")?;

        let context =
            addr2line::Context::from_dwarf(dwarf).context("Failed to create DWARF context")?;

        Ok(Self { context })
    }

    /// Source location of a file-relative address, if the line table covers it
    pub fn lookup(&self, vaddr: u64) -> Option<SourceLocation> {
        let location = self.context.find_location(vaddr).ok().flatten()?;
        let file = location.file?;
        let line = location.line.filter(|line| *line != 0)?;

        Some(SourceLocation {
            file: file.to_string(),
            line,
        })
    }
}
