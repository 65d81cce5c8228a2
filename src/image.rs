// CLASSIFICATION: COMMUNITY
// Filename: image.rs v0.1
// Author: Lukas Bower
// Date Modified: 2027-09-02

//! Segment table parser for `<fw_name>.mdt` blobs.
//!
//! The blob is an ELF header followed by its program header table. Segment
//! bytes live in separate `<fw_name>.bNN` blobs, so nothing past the table is
//! read here.

use log::debug;
use xmas_elf::header::Class;
use xmas_elf::program::Type;
use xmas_elf::ElfFile;

use crate::error::PilError;

pub const ELF32_HEADER_SIZE: usize = 52;
pub const ELF32_PHDR_SIZE: usize = 32;
pub const ELF64_HEADER_SIZE: usize = 64;
pub const ELF64_PHDR_SIZE: usize = 56;

/// Flag bit marking a segment whose address is chosen at load time.
pub const PF_RELOCATABLE: u32 = 1 << 27;
const PF_SEGMENT_KIND_MASK: u32 = 0x7 << 24;
const PF_SEGMENT_KIND_HASH: u32 = 0x2 << 24;

/// One program header, decoded.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SegmentDescriptor {
    /// Position in the program header table; names the `.bNN` blob.
    pub index: usize,
    pub load: bool,
    pub flags: u32,
    pub paddr: u64,
    pub file_size: u64,
    pub mem_size: u64,
    pub align: u64,
}

impl SegmentDescriptor {
    /// Hash segments carry the signature chain and are never loaded.
    pub fn is_hash(&self) -> bool {
        self.flags & PF_SEGMENT_KIND_MASK == PF_SEGMENT_KIND_HASH
    }

    pub fn is_relocatable(&self) -> bool {
        self.flags & PF_RELOCATABLE != 0
    }

    pub fn is_loadable(&self) -> bool {
        self.load && !self.is_hash() && self.mem_size != 0
    }
}

/// Decoded image header and segment table for one boot attempt.
#[derive(Clone, Debug)]
pub struct ImageDescriptor {
    pub entry: u64,
    pub segments: Vec<SegmentDescriptor>,
}

impl ImageDescriptor {
    /// Validate and decode a segment table blob.
    pub fn parse(bytes: &[u8]) -> Result<Self, PilError> {
        if bytes.len() < ELF32_HEADER_SIZE {
            return Err(PilError::malformed("not big enough to be an elf header"));
        }
        let elf = ElfFile::new(bytes)
            .map_err(|e| PilError::malformed(format!("not an elf header: {e}")))?;
        let (header_size, phdr_size) = match elf.header.pt1.class() {
            Class::ThirtyTwo => (ELF32_HEADER_SIZE, ELF32_PHDR_SIZE),
            Class::SixtyFour => (ELF64_HEADER_SIZE, ELF64_PHDR_SIZE),
            _ => return Err(PilError::malformed("unknown elf class")),
        };

        let pt2 = &elf.header.pt2;
        let count = pt2.ph_count();
        if count == 0 {
            return Err(PilError::malformed("no loadable segments"));
        }
        if usize::from(pt2.ph_entry_size()) != phdr_size {
            return Err(PilError::malformed(format!(
                "program header size {} unsupported",
                pt2.ph_entry_size()
            )));
        }
        let table = usize::from(count) * phdr_size;
        let offset = usize::try_from(pt2.ph_offset())
            .map_err(|_| PilError::malformed("program header offset out of range"))?;
        let within = header_size + table <= bytes.len()
            && offset >= header_size
            && offset
                .checked_add(table)
                .is_some_and(|end| end <= bytes.len());
        if !within {
            return Err(PilError::malformed("program headers not within mdt"));
        }

        let mut segments = Vec::with_capacity(usize::from(count));
        for index in 0..count {
            let ph = elf
                .program_header(index)
                .map_err(|e| PilError::malformed(format!("program header {index}: {e}")))?;
            segments.push(SegmentDescriptor {
                index: usize::from(index),
                load: matches!(ph.get_type(), Ok(Type::Load)),
                flags: ph.flags().0,
                paddr: ph.physical_addr(),
                file_size: ph.file_size(),
                mem_size: ph.mem_size(),
                align: ph.align(),
            });
        }
        let entry = pt2.entry_point();
        debug!("mdt: entry {entry:#x}, {count} program headers");
        Ok(Self { entry, segments })
    }

    pub fn loadable(&self) -> impl Iterator<Item = &SegmentDescriptor> {
        self.segments.iter().filter(|s| s.is_loadable())
    }
}
