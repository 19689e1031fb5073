//! Section registry: user sections (`.text`, `.data`, `.bss`, `.rodata`,
//! or custom names), their bodies, relocation lists, and the globals
//! defined in each (spec.md §3, §4.1).

use crate::error::{Error, Result};
use crate::reloc::Relocation;
use crate::saa::ByteStream;
use crate::symbol::SymbolId;
use bitflags::bitflags;
use std::collections::HashMap;

/// Dense, zero-based index into [`SectionTable`]. The on-disk ELF section
/// header index is `id + 2` (slot 0 is `SHN_UNDEF`, slot 1 is reserved —
/// see spec.md §3 invariant 1); that `+2` offset is applied only at
/// serialization time, in `writer.rs`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectionId(pub u32);

/// Opaque assembler-visible segment id. Allocated in even numbers; an odd
/// id names "the base of the segment with the next-lower even id", which
/// this back end cannot relocate against (spec.md §4.3, "ELF format does
/// not support segment base references").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(pub i32);

impl SegmentId {
    /// Whether this id names a segment *base* rather than a real segment.
    pub fn is_segment_base(self) -> bool {
        self.0 % 2 != 0
    }
}

/// ELF section type: either initialized bytes on disk (`SHT_PROGBITS`) or
/// a zero-fill region occupying no file space (`SHT_NOBITS`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SectionKind {
    /// `SHT_PROGBITS`
    Progbits,
    /// `SHT_NOBITS`
    Nobits,
}

impl SectionKind {
    /// Raw `sh_type` value.
    pub fn sh_type(self) -> u32 {
        match self {
            SectionKind::Progbits => 1,
            SectionKind::Nobits => 8,
        }
    }
}

bitflags! {
    /// `sh_flags` bits this back end ever sets.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SectionFlags: u32 {
        /// `SHF_WRITE`
        const WRITE = 1;
        /// `SHF_ALLOC`
        const ALLOC = 2;
        /// `SHF_EXECINSTR`
        const EXECINSTR = 4;
    }
}

/// A single user section: its body, relocations, and the global symbols
/// defined within it (used by the `..got`/`..sym` exact/nearest-below
/// searches in `reloc.rs`).
#[derive(Debug)]
pub struct Section {
    /// Segment id the driver/emitter uses to address this section.
    pub segment: SegmentId,
    /// Section name, e.g. `.text`.
    pub name: String,
    pub(crate) kind: SectionKind,
    pub(crate) flags: SectionFlags,
    /// Power-of-two alignment.
    pub align: u32,
    body: ByteStream,
    /// Current length; for `SHT_NOBITS` sections this advances without
    /// `body` ever growing.
    len: u32,
    pub(crate) relocs: Vec<Relocation>,
    /// Global symbols defined in this section, in declaration order.
    /// Exact/nearest-below symbol search (`reloc.rs`) scans this in
    /// *reverse*, matching the reference tool pushing new globals onto
    /// the front of a singly linked list and then scanning head-first.
    pub(crate) globals: Vec<SymbolId>,
}

impl Section {
    /// Current length in bytes (file size for `PROGBITS`, logical extent
    /// for `NOBITS`).
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the section is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Borrow the accumulated body bytes (empty for `NOBITS` sections).
    pub fn body(&self) -> &[u8] {
        self.body.as_slice()
    }

    fn write_bytes(&mut self, data: &[u8]) {
        self.body.write_bytes(data);
        self.len += data.len() as u32;
    }

    fn write_zeros(&mut self, count: u32) {
        self.body.write_zeros(count as usize);
        self.len += count;
    }

    fn reserve(&mut self, count: u32) {
        self.len += count;
    }
}

/// Default section attributes for the four names spec.md §4.1 treats
/// specially; any other name gets `PROGBITS | ALLOC`, alignment 1.
fn default_attrs(name: &str) -> (SectionKind, SectionFlags, u32) {
    match name {
        ".text" => (
            SectionKind::Progbits,
            SectionFlags::ALLOC | SectionFlags::EXECINSTR,
            16,
        ),
        ".rodata" => (SectionKind::Progbits, SectionFlags::ALLOC, 4),
        ".data" => (
            SectionKind::Progbits,
            SectionFlags::ALLOC | SectionFlags::WRITE,
            4,
        ),
        ".bss" => (
            SectionKind::Nobits,
            SectionFlags::ALLOC | SectionFlags::WRITE,
            4,
        ),
        _ => (SectionKind::Progbits, SectionFlags::ALLOC, 1),
    }
}

const RESERVED_NAMES: [&str; 4] = [".comment", ".shstrtab", ".symtab", ".strtab"];

/// Attributes parsed out of a `section NAME [attr]*` directive
/// (spec.md §4.1).
#[derive(Debug, Default, Clone, Copy)]
pub struct SectionAttrs {
    pub kind: Option<SectionKind>,
    pub align: Option<u32>,
    pub flags_and: SectionFlags,
    pub flags_or: SectionFlags,
}

/// Registry of all user sections declared so far.
#[derive(Debug, Default)]
pub struct SectionTable {
    sections: Vec<Section>,
    by_name: HashMap<String, SectionId>,
    by_segment: HashMap<SegmentId, SectionId>,
}

impl SectionTable {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of declared sections.
    pub fn len(&self) -> usize {
        self.sections.len()
    }

    /// Whether no section has been declared yet.
    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }

    /// Iterate sections in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (SectionId, &Section)> {
        self.sections
            .iter()
            .enumerate()
            .map(|(i, s)| (SectionId(i as u32), s))
    }

    /// Borrow a section by id.
    pub fn get(&self, id: SectionId) -> &Section {
        &self.sections[id.0 as usize]
    }

    fn get_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id.0 as usize]
    }

    /// Look up the section owning `segment`, if `segment` names one of
    /// our sections at all (it might instead be an external symbol's
    /// segment id).
    pub fn section_for_segment(&self, segment: SegmentId) -> Option<SectionId> {
        self.by_segment.get(&segment).copied()
    }

    /// Look up a section by name.
    pub fn by_name(&self, name: &str) -> Option<SectionId> {
        self.by_name.get(name).copied()
    }

    /// Create a new section named `name` with explicit `segment` id,
    /// applying `attrs` over the name's defaults. Returns an error for
    /// the four reserved names (spec.md §3 invariant 5).
    pub fn create(
        &mut self,
        name: &str,
        segment: SegmentId,
        attrs: SectionAttrs,
    ) -> Result<SectionId> {
        if RESERVED_NAMES.contains(&name) {
            return Err(Error::ReservedSectionName {
                name: name.to_string(),
            });
        }
        let (default_kind, default_flags, default_align) = default_attrs(name);
        let kind = attrs.kind.unwrap_or(default_kind);
        let mut flags = default_flags;
        flags &= !attrs.flags_and;
        flags |= attrs.flags_or;
        let align = attrs.align.unwrap_or(default_align);

        let id = SectionId(self.sections.len() as u32);
        self.sections.push(Section {
            segment,
            name: name.to_string(),
            kind,
            flags,
            align,
            body: ByteStream::new(),
            len: 0,
            relocs: Vec::new(),
            globals: Vec::new(),
        });
        self.by_name.insert(name.to_string(), id);
        self.by_segment.insert(segment, id);
        Ok(id)
    }

    /// Append raw data to a section's body (`OUT_RAWDATA`,
    /// `OUT_ADDRESS`/`OUT_REL*ADR` slots).
    pub fn write_bytes(&mut self, id: SectionId, data: &[u8]) {
        self.get_mut(id).write_bytes(data);
    }

    /// Materialize `count` zero bytes (`PROGBITS` `OUT_RESERVE`, or any
    /// write into a `NOBITS` section, which always degrades to a length
    /// bump regardless of what was asked for).
    pub fn write_zeros(&mut self, id: SectionId, count: u32) {
        self.get_mut(id).write_zeros(count);
    }

    /// Advance a `NOBITS` section's length without touching its (absent)
    /// body.
    pub fn reserve(&mut self, id: SectionId, count: u32) {
        self.get_mut(id).reserve(count);
    }

    /// Record a relocation at the section's current length and return
    /// its resulting byte offset (the value a symbol defined right after
    /// this emission would take).
    pub fn push_reloc(&mut self, id: SectionId, reloc: Relocation) {
        self.get_mut(id).relocs.push(reloc);
    }

    /// Register `symbol` as a global defined in this section.
    pub fn push_global(&mut self, id: SectionId, symbol: SymbolId) {
        self.get_mut(id).globals.push(symbol);
    }
}
