//! The public, assembler-facing surface: `init`/`section_names`/
//! `deflabel`/`out`/`directive`/`filename`/`segbase`/`set_info`/
//! `cleanup` (spec.md §6.1), tying the section registry, symbol table,
//! relocation engine, and debug back end together the way `elf_init`/
//! `elf_out`/`elf_deflabel` do in the reference tool.

use crate::debug::{dwarf::DwarfBackend, stabs::StabsBackend, DebugBackend, DebugFormat};
use crate::error::{Error, LogReporter, Reporter, Result, Severity, WarnClass};
use crate::raa::SlotMap;
use crate::reloc::{
    address_reloc_type, exact_symbol_at, nearest_below, pc_relative_reloc_type, RelocTarget,
    Relocation, Wrt,
};
use crate::section::{SectionAttrs, SectionFlags, SectionId, SectionKind, SectionTable, SegmentId};
use crate::strtab::StringTable;
use crate::symbol::{SymbolPlace, SymbolTable, SymbolType, Visibility};
use crate::writer::{self, WriteContext};
use std::io::Write;
use typed_builder::TypedBuilder;

/// How a section-relative reference resolves its symbol, chosen from the
/// WRT qualifier that produced it (spec.md §4.3's dispatch table): `..got`
/// is symbol-exact, `..sym` is nearest-below, everything else (`..gotoff`,
/// `..gotpc`, plain, `..plt`) is plain section-relative.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RelocMode {
    Plain,
    Exact,
    NearestBelow,
}

/// Pseudo-segments allocated once at [`Emitter::init`] (spec.md §6.3):
/// `..gotpc`, `..gotoff`, `..got`, `..plt`, `..sym`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecialSegments {
    pub gotpc: SegmentId,
    pub gotoff: SegmentId,
    pub got: SegmentId,
    pub plt: SegmentId,
    pub sym: SegmentId,
}

/// Static, per-object configuration (spec.md §7c).
#[derive(TypedBuilder)]
pub struct EmitterConfig {
    /// `EI_OSABI`; 0 (`ELFOSABI_NONE`) unless the caller targets a
    /// specific ABI tag.
    #[builder(default)]
    pub osabi: u8,
    /// `EI_ABIVERSION`.
    #[builder(default)]
    pub abi_version: u8,
    /// Module (source file) name, recorded as an `STT_FILE` symbol.
    #[builder(default, setter(strip_option))]
    pub module_name: Option<String>,
    /// Debug back end to activate, if any.
    #[builder(default)]
    pub debug_format: DebugFormat,
    /// Whether 16-bit relocation warnings (a GNU extension) are surfaced.
    #[builder(default)]
    pub warn_gnu_elf: bool,
}

/// Whether a `deflabel` call promotes a symbol's binding, and if so to
/// what (spec.md §4.2 "is_global" tri-state).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    Local,
    Global,
    /// `offset` doubles as the requested alignment for a tentative
    /// (`SHN_COMMON`) definition.
    Common,
}

/// One slot to write via [`Emitter::out`] (spec.md §4.3 `OUT_*` kinds).
#[derive(Debug, Clone)]
pub enum OutData {
    /// `OUT_RAWDATA`
    Raw(Vec<u8>),
    /// `OUT_RESERVE`
    Reserve(u32),
    /// `OUT_ADDRESS`: a `width`-byte absolute/relocatable value.
    Address {
        value: i64,
        target: Option<SegmentId>,
        wrt: Wrt,
        width: u8,
    },
    /// `OUT_REL2ADR` / `OUT_REL4ADR`: a `width`-byte PC-relative value.
    /// `insn_end` is the section offset the displacement is measured
    /// from (the byte right after the relocation field).
    RelAdr {
        value: i64,
        target: Option<SegmentId>,
        wrt: Wrt,
        width: u8,
        insn_end: u32,
    },
}

/// The emitter: owns every section, symbol, and pending relocation for
/// one object file, across however many assembler passes it takes to
/// settle forward references.
pub struct Emitter<R: Reporter = LogReporter> {
    sections: SectionTable,
    symbols: SymbolTable,
    globals: SlotMap,
    strtab: StringTable,
    config: EmitterConfig,
    reporter: R,
    next_segment: i32,
    special: SpecialSegments,
    debug_backend: Option<Box<dyn DebugBackend>>,
    module_name_offset: Option<u32>,
    current_filename: String,
}

impl Emitter<LogReporter> {
    /// Create a new emitter with the default [`LogReporter`].
    pub fn init(config: EmitterConfig) -> (Self, SpecialSegments) {
        let reporter = LogReporter {
            warn_gnu_elf: config.warn_gnu_elf,
        };
        Self::init_with_reporter(config, reporter)
    }
}

impl<R: Reporter> Emitter<R> {
    /// Create a new emitter with a caller-supplied [`Reporter`].
    pub fn init_with_reporter(config: EmitterConfig, reporter: R) -> (Self, SpecialSegments) {
        let mut next_segment = 0i32;
        let mut alloc = || {
            let id = SegmentId(next_segment);
            next_segment += 2;
            id
        };
        let special = SpecialSegments {
            gotpc: alloc(),
            gotoff: alloc(),
            got: alloc(),
            plt: alloc(),
            sym: alloc(),
        };

        let mut strtab = StringTable::new();
        let module_name_offset = config.module_name.as_deref().map(|n| strtab.push(n));

        let debug_backend: Option<Box<dyn DebugBackend>> = match config.debug_format {
            DebugFormat::None => None,
            DebugFormat::Stabs => Some(Box::new(StabsBackend::new())),
            DebugFormat::Dwarf => Some(Box::new(DwarfBackend::new())),
        };

        let emitter = Emitter {
            sections: SectionTable::new(),
            symbols: SymbolTable::new(),
            globals: SlotMap::new(),
            strtab,
            config,
            reporter,
            next_segment,
            special,
            debug_backend,
            module_name_offset,
            current_filename: String::new(),
        };
        (emitter, special)
    }

    /// Allocate a fresh segment id for a symbol this back end did not
    /// itself create a section for (an `extern`, in the reference
    /// tool's terms). The driver obtains one of these before calling
    /// [`Emitter::deflabel`] for an undefined or common symbol.
    pub fn alloc_segment(&mut self) -> SegmentId {
        let id = SegmentId(self.next_segment);
        self.next_segment += 2;
        id
    }

    fn ensure_default_text(&mut self) -> SectionId {
        if let Some(id) = self.sections.by_name(".text") {
            return id;
        }
        let segment = self.alloc_segment();
        self.sections
            .create(".text", segment, SectionAttrs::default())
            .expect(".text is never a reserved name")
    }

    /// `section NAME [attr]*` (spec.md §4.1). `None` names the default
    /// section (`.text`), created lazily the first time it is needed.
    pub fn section_names(&mut self, spec: Option<&str>) -> Result<SegmentId> {
        let Some(spec) = spec else {
            return Ok(self.sections.get(self.ensure_default_text()).segment);
        };
        let mut parts = spec.split_whitespace();
        let name = parts.next().unwrap_or("").to_string();
        if let Some(id) = self.sections.by_name(&name) {
            return Ok(self.sections.get(id).segment);
        }
        let attrs = self.parse_section_attrs(parts)?;
        let segment = self.alloc_segment();
        let id = self.sections.create(&name, segment, attrs)?;
        Ok(self.sections.get(id).segment)
    }

    fn parse_section_attrs<'a>(
        &mut self,
        parts: impl Iterator<Item = &'a str>,
    ) -> Result<SectionAttrs> {
        let mut attrs = SectionAttrs::default();
        for token in parts {
            if let Some(value) = token.strip_prefix("align=") {
                let requested: u32 = value.parse().unwrap_or(0);
                if requested == 0 || !requested.is_power_of_two() {
                    self.reporter.report(
                        Severity::NonFatal,
                        WarnClass::General,
                        &Error::AlignmentNotPowerOfTwo { requested },
                    );
                    attrs.align = Some(1);
                } else {
                    attrs.align = Some(requested);
                }
                continue;
            }
            match token {
                "alloc" => attrs.flags_or |= SectionFlags::ALLOC,
                "noalloc" => attrs.flags_and |= SectionFlags::ALLOC,
                "exec" => attrs.flags_or |= SectionFlags::EXECINSTR,
                "noexec" => attrs.flags_and |= SectionFlags::EXECINSTR,
                "write" => attrs.flags_or |= SectionFlags::WRITE,
                "nowrite" => attrs.flags_and |= SectionFlags::WRITE,
                "progbits" => attrs.kind = Some(SectionKind::Progbits),
                "nobits" => attrs.kind = Some(SectionKind::Nobits),
                _ => {}
            }
        }
        Ok(attrs)
    }

    /// Parse a `GLOBAL`/`COMMON` `special` string into type/visibility
    /// overrides (spec.md §4.2). Unrecognised keywords are reported as
    /// non-fatal errors and otherwise ignored.
    fn apply_special(&mut self, special: Option<&str>) -> (SymbolType, Visibility) {
        let mut ty = SymbolType::NoType;
        let mut visibility = Visibility::Default;
        let Some(special) = special else {
            return (ty, visibility);
        };
        for token in special.split_whitespace() {
            match token {
                "function" => ty = SymbolType::Func,
                "data" | "object" => ty = SymbolType::Object,
                "notype" => ty = SymbolType::NoType,
                "internal" => visibility = Visibility::Internal,
                "hidden" => visibility = Visibility::Hidden,
                "protected" => visibility = Visibility::Protected,
                _ => {
                    self.reporter.report(
                        Severity::NonFatal,
                        WarnClass::General,
                        &Error::UnrecognisedSymbolType {
                            keyword: token.to_string(),
                        },
                    );
                }
            }
        }
        (ty, visibility)
    }

    /// Define or update a symbol (spec.md §4.2 `deflabel`).
    pub fn deflabel(
        &mut self,
        name: &str,
        segment: Option<SegmentId>,
        offset: u32,
        binding: Binding,
        special: Option<&str>,
    ) -> Result<()> {
        if let Some(name) = name.strip_prefix("..") {
            self.reporter.report(
                Severity::NonFatal,
                WarnClass::General,
                &Error::UnrecognisedSpecialSymbol {
                    name: format!("..{name}"),
                },
            );
            return Ok(());
        }

        let place = match segment {
            None => SymbolPlace::Abs,
            Some(seg) => match self.sections.section_for_segment(seg) {
                Some(id) => SymbolPlace::Section(id),
                None if matches!(binding, Binding::Common) => SymbolPlace::Common,
                None => SymbolPlace::Undef,
            },
        };

        let (ty, visibility) = self.apply_special(special);

        let id = match self.symbols.by_name(name) {
            Some(id) => id,
            None => {
                let strtab_offset = self.strtab.push(name);
                self.symbols.define(name, strtab_offset, place)
            }
        };
        {
            let symbol = self.symbols.get_mut(id);
            symbol.place = place;
            symbol.value = offset;
            symbol.ty = ty;
            symbol.visibility = visibility;
        }

        if let SymbolPlace::Section(section_id) = place {
            self.sections.push_global(section_id, id);
        }

        match binding {
            Binding::Local => {}
            Binding::Global | Binding::Common => {
                let slot = self.symbols.make_global(id);
                if let Some(seg) = segment {
                    self.globals.insert(seg.0, slot);
                }
            }
        }
        Ok(())
    }

    /// Record `%1size NAME, N` (spec.md §4.2).
    pub fn set_size(&mut self, name: &str, size: u32) {
        self.symbols.set_size(name, size);
    }

    /// `filename`: associate source position `(name, line)` with the
    /// current write point in `segment`, feeding the active debug back
    /// end (spec.md §4.7/§4.8 `linenum`).
    pub fn filename(&mut self, name: &str, line: u32, segment: SegmentId) {
        self.current_filename = name.to_string();
        let Some(section_id) = self.sections.section_for_segment(segment) else {
            return;
        };
        let offset = self.sections.get(section_id).len();
        let section_name = self.sections.get(section_id).name.clone();
        if let Some(backend) = &mut self.debug_backend {
            backend.linenum(&section_name, offset, name, line);
        }
    }

    /// The most recently recorded source file name.
    pub fn current_filename(&self) -> &str {
        &self.current_filename
    }

    /// `segbase`: ELF object files have no notion of a segment base
    /// distinct from the segment itself, so this is the identity
    /// function (matches the reference tool's `elf_segbase`).
    pub fn segbase(&self, segment: SegmentId) -> SegmentId {
        segment
    }

    /// `set_info`: miscellaneous assembler-driver info this back end has
    /// no use for (matches the reference tool's `elf_set_info`, which
    /// ignores everything it's handed).
    pub fn set_info(&mut self, _key: &str, _value: &str) {}

    /// `directive NAME [VALUE]`: back-end-specific directives outside
    /// the `section`/`global`/`common` core. Returns whether `name` was
    /// recognised (an unrecognised directive is the caller's cue to
    /// report an error upstream).
    pub fn directive(&mut self, name: &str, _value: Option<&str>) -> bool {
        matches!(name, "gnu-elf-extensions")
    }

    /// Resolve `target` (a segment that may or may not be one of our
    /// sections) to a [`RelocTarget`], reporting
    /// [`Error::NoSuitableGlobalSymbol`] if it names neither.
    fn resolve_extern(&mut self, target: SegmentId) -> Result<RelocTarget> {
        let slot = self.globals.get(target.0);
        if slot == 0 {
            self.reporter.report(
                Severity::NonFatal,
                WarnClass::General,
                &Error::NoSuitableGlobalSymbol,
            );
            return Err(Error::NoSuitableGlobalSymbol);
        }
        Ok(RelocTarget::Global(slot))
    }

    /// Resolve a section-relative reference, returning both the
    /// relocation target and the value that should actually be written
    /// at the relocation site: 0 for an exact symbol match, the
    /// symbol-relative displacement for a nearest-below match, and the
    /// caller's own `value` unchanged for everything else (spec.md §4.3,
    /// `elf_add_gsym_reloc`).
    fn resolve_target(
        &mut self,
        target: SegmentId,
        value: i64,
        mode: RelocMode,
    ) -> Result<(RelocTarget, i64)> {
        if target.is_segment_base() {
            return Err(Error::SegmentBaseReference);
        }
        let offset_in_target = value as u32;
        match self.sections.section_for_segment(target) {
            Some(section_id) => match mode {
                RelocMode::Plain => Ok((RelocTarget::SectionSym(section_id), value)),
                RelocMode::Exact => {
                    let section = self.sections.get(section_id);
                    match exact_symbol_at(section, &self.symbols, offset_in_target) {
                        Some(symbol_id) => {
                            let slot = self.symbols.make_global(symbol_id);
                            Ok((RelocTarget::Global(slot), 0))
                        }
                        None => Err(Error::NoSuitableGlobalSymbol),
                    }
                }
                RelocMode::NearestBelow => {
                    let section = self.sections.get(section_id);
                    match nearest_below(section, &self.symbols, offset_in_target) {
                        Some((symbol_id, addend)) => {
                            let slot = self.symbols.make_global(symbol_id);
                            Ok((RelocTarget::Global(slot), addend as i64))
                        }
                        // No symbol at or below this offset: fall through to a
                        // plain section-relative reloc rather than erroring.
                        None => Ok((RelocTarget::SectionSym(section_id), value)),
                    }
                }
            },
            None => {
                if matches!(mode, RelocMode::Exact) && offset_in_target != 0 {
                    self.reporter.report(
                        Severity::NonFatal,
                        WarnClass::General,
                        &Error::NoSuitableGlobalSymbol,
                    );
                    return Err(Error::NoSuitableGlobalSymbol);
                }
                let target = self.resolve_extern(target)?;
                Ok((target, value))
            }
        }
    }

    /// Emit one slot into the currently-selected section (spec.md §4.3).
    pub fn out(&mut self, segto: SegmentId, data: OutData) -> Result<()> {
        let Some(section_id) = self.sections.section_for_segment(segto) else {
            return Err(Error::AbsoluteSpace);
        };
        let is_nobits = matches!(self.sections.get(section_id).kind, SectionKind::Nobits);
        let section_name = self.sections.get(section_id).name.clone();

        match data {
            OutData::Raw(bytes) => {
                if is_nobits {
                    self.reporter.report(
                        Severity::Warning,
                        WarnClass::General,
                        &Error::InitializedBss {
                            section: section_name,
                        },
                    );
                    self.sections.reserve(section_id, bytes.len() as u32);
                } else {
                    self.sections.write_bytes(section_id, &bytes);
                }
            }
            OutData::Reserve(count) => {
                if is_nobits {
                    self.sections.reserve(section_id, count);
                } else {
                    self.reporter.report(
                        Severity::Warning,
                        WarnClass::General,
                        &Error::ReserveInProgbits {
                            section: section_name,
                        },
                    );
                    self.sections.write_zeros(section_id, count);
                }
            }
            OutData::Address {
                value,
                target,
                wrt,
                width,
            } => {
                let offset = self.sections.get(section_id).len();
                match target {
                    None => {
                        self.sections
                            .write_bytes(section_id, &truncate(value, width));
                    }
                    Some(target_segment) => {
                        let ty = address_reloc_type(wrt, width)?;
                        let mode = match wrt {
                            Wrt::Got => RelocMode::Exact,
                            Wrt::Sym => RelocMode::NearestBelow,
                            _ => RelocMode::Plain,
                        };
                        // `..gotpc` is section-relative to the *current*
                        // position, so the running section offset is folded
                        // into the value before resolution (outelf32.c
                        // `addr += s->len`).
                        let adjusted = if matches!(wrt, Wrt::GotPc) {
                            value + offset as i64
                        } else {
                            value
                        };
                        let (reloc_target, final_value) =
                            self.resolve_target(target_segment, adjusted, mode)?;
                        self.sections
                            .write_bytes(section_id, &truncate(final_value, width));
                        self.sections.push_reloc(
                            section_id,
                            Relocation {
                                offset,
                                target: reloc_target,
                                ty,
                                addend: 0,
                            },
                        );
                    }
                }
            }
            OutData::RelAdr {
                value,
                target,
                wrt,
                width,
                insn_end,
            } => {
                let offset = self.sections.get(section_id).len();
                match target {
                    None => {
                        let disp = value - insn_end as i64;
                        self.sections.write_bytes(section_id, &truncate(disp, width));
                    }
                    Some(target_segment)
                        if self.sections.section_for_segment(target_segment) == Some(section_id) =>
                    {
                        let disp = value - insn_end as i64;
                        self.sections.write_bytes(section_id, &truncate(disp, width));
                    }
                    Some(target_segment) => {
                        let ty = pc_relative_reloc_type(wrt, width)?;
                        // PC-relative references never search for a symbol
                        // (exact or nearest-below); they always resolve
                        // plainly against the section itself (outelf32.c
                        // `OUT_REL4ADR`).
                        let (reloc_target, _) =
                            self.resolve_target(target_segment, value, RelocMode::Plain)?;
                        let disp = value - insn_end as i64;
                        self.sections.write_bytes(section_id, &truncate(disp, width));
                        self.sections.push_reloc(
                            section_id,
                            Relocation {
                                offset,
                                target: reloc_target,
                                ty,
                                addend: 0,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    /// Reset per-pass state (section bodies, relocations, and the
    /// global-slot map) ahead of a second assembler pass. The symbol
    /// table is left untouched: `deflabel` reuses an existing symbol's
    /// id by name, and section ids are assigned in the same creation
    /// order on every pass, so `SymbolPlace::Section` references made in
    /// pass one stay valid once pass two recreates those sections.
    pub fn reset_for_pass(&mut self) {
        self.sections = SectionTable::new();
        self.globals = SlotMap::new();
    }

    /// Finalize and write the object file. Consumes no state the caller
    /// might still need to inspect (sections/symbols stay borrowable
    /// through `&self` methods before this is called).
    pub fn cleanup<W: Write>(&mut self, out: &mut W) -> Result<()> {
        let debug_sections = if let Some(backend) = &mut self.debug_backend {
            backend.generate(&self.sections)
        } else {
            Vec::new()
        };
        let ctx = WriteContext {
            sections: &self.sections,
            symbols: &self.symbols,
            symbol_names: &self.strtab,
            module_name: self.module_name_offset,
            osabi: self.config.osabi,
            abi_version: self.config.abi_version,
            debug_sections: &debug_sections,
        };
        writer::write(&ctx, out)
    }
}

fn truncate(value: i64, width: u8) -> Vec<u8> {
    let bytes = value.to_le_bytes();
    bytes[..width as usize].to_vec()
}
