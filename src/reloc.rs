//! Relocation types, the `WRT` pseudo-segment dispatch, and the
//! exact/nearest-below symbol searches the `OUT_REL*ADR` opcodes need to
//! find a relocation target (spec.md §4.3).

use crate::error::Error;
use crate::section::{Section, SectionId};
use crate::symbol::{SymbolId, SymbolPlace, SymbolTable};
use num_derive::{FromPrimitive, ToPrimitive};

/// `R_386_*` relocation type, restricted to the subset this back end
/// ever emits (spec.md §4.3 table).
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive)]
#[repr(u8)]
pub enum RelocType {
    /// `R_386_16`: 16-bit absolute.
    Abs16 = 20,
    /// `R_386_32`: 32-bit absolute.
    Abs32 = 1,
    /// `R_386_PC16`: 16-bit PC-relative.
    Pc16 = 21,
    /// `R_386_PC32`: 32-bit PC-relative.
    Pc32 = 2,
    /// `R_386_GOT32`: 32-bit GOT-entry offset.
    Got32 = 3,
    /// `R_386_PLT32`: 32-bit PC-relative PLT offset.
    Plt32 = 4,
    /// `R_386_GOTOFF`: 32-bit offset from the GOT's own base.
    GotOff = 9,
    /// `R_386_GOTPC`: 32-bit PC-relative offset of the GOT itself.
    GotPc = 10,
}

/// What a relocation's `r_info` symbol field ultimately names. This
/// replaces the reference tool's `GLOBAL_TEMP_BASE`-offset encoding
/// (`R_386_RELATIVE`-free section symbols numbered below a sentinel,
/// global slots numbered above it) with an explicit sum type, resolved
/// to a real symbol-table index only at serialization time
/// (`writer.rs`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocTarget {
    /// The `STT_SECTION` symbol synthesized for this section.
    SectionSym(SectionId),
    /// Dense global slot (1-based; see `SymbolTable::make_global`).
    Global(u32),
}

/// A single relocation entry pending in a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Relocation {
    /// Byte offset within the section being relocated.
    pub offset: u32,
    pub target: RelocTarget,
    pub ty: RelocType,
    /// `SHT_RELA` addend; always 0 for this format's `SHT_REL` tables,
    /// kept so `writer.rs` doesn't need a second shape for the value.
    pub addend: i32,
}

/// The `WRT ..xxx` qualifier passed to `out()`, selecting which pseudo-
/// segment a reference is relative to (spec.md §6.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wrt {
    /// No `WRT` qualifier: a plain section-relative or absolute value.
    None,
    /// `WRT ..gotpc`
    GotPc,
    /// `WRT ..gotoff`
    GotOff,
    /// `WRT ..got`: require an exact symbol match at the reference's
    /// target offset (`R_386_GOT32`, addend must resolve to 0).
    Got,
    /// `WRT ..plt`
    Plt,
    /// `WRT ..sym`: resolve against the nearest symbol at or below the
    /// reference's target offset, rewriting the addend to the resulting
    /// displacement.
    Sym,
}

/// Dispatch an `OUT_ADDRESS` (non-PC-relative, arbitrary width) slot's
/// `wrt` qualifier to the relocation type it produces, or an error if
/// the combination is nonsensical (spec.md §4.3 edge cases).
pub fn address_reloc_type(wrt: Wrt, width: u8) -> Result<RelocType, Error> {
    match (wrt, width) {
        (Wrt::None, 4) | (Wrt::Sym, 4) => Ok(RelocType::Abs32),
        (Wrt::None, 2) => Ok(RelocType::Abs16),
        (Wrt::GotOff, 4) => Ok(RelocType::GotOff),
        (Wrt::Got, 4) => Ok(RelocType::Got32),
        (Wrt::GotPc, 4) => Ok(RelocType::GotPc),
        (Wrt::Plt, _) => Err(Error::NonPcRelativePlt),
        (Wrt::Got, _) | (Wrt::GotOff, _) | (Wrt::GotPc, _) | (Wrt::Sym, _) | (Wrt::None, _) => {
            Err(Error::Non32BitRelocation)
        }
    }
}

/// Dispatch an `OUT_REL2ADR`/`OUT_REL4ADR` (PC-relative) slot's `wrt`
/// qualifier to its relocation type (spec.md §4.3 edge cases).
pub fn pc_relative_reloc_type(wrt: Wrt, width: u8) -> Result<RelocType, Error> {
    match (wrt, width) {
        (Wrt::None, 2) => Ok(RelocType::Pc16),
        (Wrt::None, 4) => Ok(RelocType::Pc32),
        (Wrt::Plt, 4) => Ok(RelocType::Plt32),
        (Wrt::Got, _) => Err(Error::PcRelativeGot),
        (Wrt::GotOff, _) | (Wrt::GotPc, _) => Err(Error::UnsupportedWrt),
        (Wrt::Plt, _) => Err(Error::Non32BitRelocation),
        (Wrt::Sym, _) => Err(Error::UnsupportedWrt),
        (Wrt::None, _) => Err(Error::Non32BitRelocation),
    }
}

/// Find the symbol defined at exactly `offset` within `section`, scanning
/// its globals newest-first (see `Section::globals` doc comment).
pub fn exact_symbol_at(section: &Section, symbols: &SymbolTable, offset: u32) -> Option<SymbolId> {
    section.globals.iter().rev().copied().find(|&id| {
        let symbol = symbols.get(id);
        matches!(symbol.place, SymbolPlace::Section(_)) && symbol.value == offset
    })
}

/// Find the global symbol in `section` with the largest value `<=
/// offset`, breaking ties in favour of the most-recently-declared
/// symbol (spec.md §4.3 "nearest-below" search). Returns the symbol and
/// the additional distance from its value to `offset`.
pub fn nearest_below(
    section: &Section,
    symbols: &SymbolTable,
    offset: u32,
) -> Option<(SymbolId, u32)> {
    let mut best: Option<SymbolId> = None;
    for &id in section.globals.iter().rev() {
        let symbol = symbols.get(id);
        if !matches!(symbol.place, SymbolPlace::Section(_)) {
            continue;
        }
        if symbol.value > offset {
            continue;
        }
        let better = match best {
            None => true,
            Some(current) => symbol.value > symbols.get(current).value,
        };
        if better {
            best = Some(id);
        }
    }
    best.map(|id| (id, offset - symbols.get(id).value))
}
