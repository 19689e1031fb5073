//! Debug-info back ends: STABS (`stabs.rs`) and DWARF v2/3 (`dwarf.rs`),
//! selected by [`DebugFormat`] at [`crate::emitter::EmitterConfig`] build
//! time (spec.md §4.7, §4.8).

pub mod dwarf;
pub mod stabs;

use crate::reloc::RelocType;
use crate::section::{SectionKind, SectionTable};

/// Which debug back end, if any, is active for this object file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DebugFormat {
    /// No debug information is generated.
    #[default]
    None,
    /// `-F stabs`
    Stabs,
    /// `-F dwarf`
    Dwarf,
}

/// A section a debug back end wants written into the object file, plus
/// the relocations it carries against other sections.
///
/// Relocation targets are named by section name rather than
/// [`crate::section::SectionId`]: the debug back ends only see section
/// names via [`DebugBackend::linenum`], so resolving the name to an id
/// (and to a `RelocTarget::SectionSym`) is left to the emitter, which
/// owns the `SectionTable`.
#[derive(Debug, Clone)]
pub struct DebugSection {
    pub name: String,
    pub kind: SectionKind,
    pub body: Vec<u8>,
    pub relocs: Vec<(u32, String, RelocType)>,
}

/// One source line mapped to a byte offset in a section, the common unit
/// both back ends consume (spec.md §4.7/§4.8 `linenum` call).
#[derive(Debug, Clone)]
pub struct LineRecord {
    pub section_name: String,
    pub offset: u32,
    pub filename: String,
    pub line: u32,
}

/// Shared interface both debug back ends implement: accumulate line
/// records as the assembler walks the source, then emit their debug
/// sections once all sections are finalized.
pub trait DebugBackend {
    /// Record that `offset` bytes into `section_name` corresponds to
    /// `filename:line`.
    fn linenum(&mut self, section_name: &str, offset: u32, filename: &str, line: u32);

    /// Produce the debug sections to append to the object file. Called
    /// once, after the last `linenum` and after all section lengths are
    /// final.
    fn generate(&mut self, sections: &SectionTable) -> Vec<DebugSection>;
}
