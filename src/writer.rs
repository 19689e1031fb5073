//! ELF32/i386 `ET_REL` container writer: header, section header table,
//! `.symtab`/`.strtab`, and `SHT_REL` relocation tables (spec.md §4.4,
//! §4.5, §4.6, §6).

use crate::base::align16;
use crate::debug::DebugSection;
use crate::error::Result;
use crate::reloc::RelocTarget;
use crate::section::{SectionId, SectionKind, SectionTable};
use crate::strtab::StringTable;
use crate::symbol::{SymbolPlace, SymbolTable, SymbolType};
use std::collections::HashMap;
use std::io::Write;

const ET_REL: u16 = 1;
const EM_386: u16 = 3;
const EV_CURRENT: u32 = 1;
const SHT_STRTAB: u32 = 3;
const SHT_REL: u32 = 9;
const SHT_SYMTAB: u32 = 2;
const SHN_UNDEF: u16 = 0;
const SHN_ABS: u16 = 0xfff1;
const SHN_COMMON: u16 = 0xfff2;

/// Everything the writer needs; assembled by [`crate::emitter::Emitter`]
/// once a pass is complete and about to be serialized.
pub struct WriteContext<'a> {
    pub sections: &'a SectionTable,
    pub symbols: &'a SymbolTable,
    pub symbol_names: &'a StringTable,
    /// `.strtab` offset of the module's file name, if one was configured
    /// (already interned into `symbol_names` by the emitter).
    pub module_name: Option<u32>,
    pub osabi: u8,
    pub abi_version: u8,
    pub debug_sections: &'a [DebugSection],
}

struct RawSection {
    name: String,
    sh_type: u32,
    sh_flags: u32,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u32,
    sh_entsize: u32,
    body: Vec<u8>,
    is_nobits: bool,
}

/// Serialize the object file described by `ctx` into `out`.
///
/// Section header order (spec.md §4.4 step 7): null; user sections;
/// `.comment`; `.shstrtab`; `.symtab`; `.strtab`; one `.rel.NAME` per
/// user section with relocations; then the debug sections, each
/// immediately followed by its own `.rel.NAME` if it carries any.
pub fn write<W: Write>(ctx: &WriteContext<'_>, out: &mut W) -> Result<()> {
    let mut shstrtab = StringTable::new();

    // User sections occupy slots `0..n_user` in declaration order, which
    // is exactly `SectionId.0` (`SectionTable::create` hands out ids in
    // that same order), so no id-to-slot map is needed for them.
    let n_user = ctx.sections.len();
    let section_header_index: HashMap<SectionId, usize> =
        ctx.sections.iter().map(|(id, _)| (id, id.0 as usize)).collect();

    let comment_slot = n_user;
    let shstrtab_slot = n_user + 1;
    let symtab_slot = n_user + 2;
    let strtab_slot = n_user + 3;

    let mut next_slot = n_user + 4;
    let mut user_rel_slot: HashMap<SectionId, usize> = HashMap::new();
    for (id, section) in ctx.sections.iter() {
        if !section.relocs.is_empty() {
            user_rel_slot.insert(id, next_slot);
            next_slot += 1;
        }
    }

    let mut debug_header_index: HashMap<String, usize> = HashMap::new();
    let mut debug_rel_slot: HashMap<String, usize> = HashMap::new();
    for debug_section in ctx.debug_sections {
        debug_header_index.insert(debug_section.name.clone(), next_slot);
        next_slot += 1;
        if !debug_section.relocs.is_empty() {
            debug_rel_slot.insert(debug_section.name.clone(), next_slot);
            next_slot += 1;
        }
    }

    let mut section_symtab_index = HashMap::new();
    let (symtab_bytes, local_count, global_symtab_index, debug_symtab_index) = build_symtab(
        ctx,
        &section_header_index,
        &debug_header_index,
        &mut section_symtab_index,
    );

    let mut raw_sections: Vec<RawSection> = Vec::with_capacity(next_slot);

    for (_id, section) in ctx.sections.iter() {
        raw_sections.push(RawSection {
            name: section.name.clone(),
            sh_type: section.kind.sh_type(),
            sh_flags: section.flags.bits(),
            sh_link: 0,
            sh_info: 0,
            sh_addralign: section.align,
            sh_entsize: 0,
            body: section.body().to_vec(),
            is_nobits: matches!(section.kind, SectionKind::Nobits),
        });
    }

    raw_sections.push(RawSection {
        name: ".comment".to_string(),
        sh_type: SectionKind::Progbits.sh_type(),
        sh_flags: 0,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 0,
        body: comment_bytes(),
        is_nobits: false,
    });

    raw_sections.push(RawSection {
        name: ".shstrtab".to_string(),
        sh_type: SHT_STRTAB,
        sh_flags: 0,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 0,
        body: Vec::new(), // filled in once every name is interned
        is_nobits: false,
    });

    raw_sections.push(RawSection {
        name: ".symtab".to_string(),
        sh_type: SHT_SYMTAB,
        sh_flags: 0,
        sh_link: strtab_slot as u32,
        sh_info: (local_count + symbol_preamble_count(ctx)) as u32,
        sh_addralign: 4,
        sh_entsize: 16,
        body: symtab_bytes,
        is_nobits: false,
    });

    raw_sections.push(RawSection {
        name: ".strtab".to_string(),
        sh_type: SHT_STRTAB,
        sh_flags: 0,
        sh_link: 0,
        sh_info: 0,
        sh_addralign: 1,
        sh_entsize: 0,
        body: ctx.symbol_names.as_slice().to_vec(),
        is_nobits: false,
    });

    for (id, section) in ctx.sections.iter() {
        if section.relocs.is_empty() {
            continue;
        }
        let target_slot = section_header_index[&id];
        let body = build_reltab(&section.relocs, &section_symtab_index, &global_symtab_index);
        raw_sections.push(RawSection {
            name: format!(".rel{}", section.name),
            sh_type: SHT_REL,
            sh_flags: 0,
            sh_link: symtab_slot as u32,
            sh_info: target_slot as u32,
            sh_addralign: 4,
            sh_entsize: 8,
            body,
            is_nobits: false,
        });
    }

    for debug_section in ctx.debug_sections {
        let target_slot = debug_header_index[&debug_section.name];
        raw_sections.push(RawSection {
            name: debug_section.name.clone(),
            sh_type: SectionKind::Progbits.sh_type(),
            sh_flags: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            body: debug_section.body.clone(),
            is_nobits: false,
        });
        if debug_section.relocs.is_empty() {
            continue;
        }
        // A debug section's relocation may target either a user section
        // (e.g. `.debug_aranges` pointing back at `.text`) or another
        // debug section (e.g. `.debug_info` pointing at `.debug_abbrev`);
        // `debug_symtab_index`/`section_symtab_index` together cover both.
        let mut body = Vec::new();
        for (offset, name, ty) in &debug_section.relocs {
            let sym_index = ctx
                .sections
                .by_name(name)
                .and_then(|id| section_symtab_index.get(&id).copied())
                .or_else(|| debug_symtab_index.get(name).copied())
                .unwrap_or(0);
            let r_info = (sym_index << 8) | *ty as u8 as u32;
            body.extend_from_slice(&offset.to_le_bytes());
            body.extend_from_slice(&r_info.to_le_bytes());
        }
        raw_sections.push(RawSection {
            name: format!(".rel{}", debug_section.name),
            sh_type: SHT_REL,
            sh_flags: 0,
            sh_link: symtab_slot as u32,
            sh_info: target_slot as u32,
            sh_addralign: 4,
            sh_entsize: 8,
            body,
            is_nobits: false,
        });
    }

    debug_assert_eq!(raw_sections.len(), next_slot);

    // Intern every section name into .shstrtab, in final header order.
    let mut names = Vec::with_capacity(raw_sections.len());
    for section in &raw_sections {
        names.push(shstrtab.push(&section.name));
    }
    raw_sections[shstrtab_slot].body = shstrtab.as_slice().to_vec();

    let shstrndx = shstrtab_slot as u16 + 1; // +1 for the leading SHN_UNDEF slot
    let nsections = raw_sections.len() as u16 + 1;

    // `e_shoff` is fixed at 0x40: the section header table sits right
    // after the (padded) ELF header (spec.md §4.4 step 4/6). Section
    // bodies start after the header table, 16-byte aligned.
    const E_SHOFF: u32 = 0x40;
    let header_table_end = E_SHOFF + 40 * nsections as u32;
    let mut offset = align16(header_table_end);
    let mut offsets = vec![0u32; raw_sections.len()];
    for (i, section) in raw_sections.iter().enumerate() {
        if section.is_nobits {
            offsets[i] = offset;
            continue;
        }
        offsets[i] = offset;
        offset += align16(section.body.len() as u32);
    }

    write_ehdr(out, ctx, nsections, E_SHOFF, shstrndx)?;
    out.write_all(&[0u8; 12])?; // pad the 52-byte Ehdr up to e_shoff

    // SHN_UNDEF's header, then the rest in final order.
    out.write_all(&[0u8; 40])?;
    for (i, section) in raw_sections.iter().enumerate() {
        let mut hdr = Vec::with_capacity(40);
        hdr.extend_from_slice(&names[i].to_le_bytes());
        hdr.extend_from_slice(&section.sh_type.to_le_bytes());
        hdr.extend_from_slice(&section.sh_flags.to_le_bytes());
        hdr.extend_from_slice(&0u32.to_le_bytes()); // sh_addr
        hdr.extend_from_slice(&offsets[i].to_le_bytes());
        hdr.extend_from_slice(&(section.body.len() as u32).to_le_bytes());
        hdr.extend_from_slice(&section.sh_link.to_le_bytes());
        hdr.extend_from_slice(&section.sh_info.to_le_bytes());
        hdr.extend_from_slice(&section.sh_addralign.to_le_bytes());
        hdr.extend_from_slice(&section.sh_entsize.to_le_bytes());
        out.write_all(&hdr)?;
    }

    let table_pad = align16(header_table_end) - header_table_end;
    out.write_all(&vec![0u8; table_pad as usize])?;

    for section in &raw_sections {
        if !section.is_nobits {
            out.write_all(&section.body)?;
            let padded = align16(section.body.len() as u32) - section.body.len() as u32;
            out.write_all(&vec![0u8; padded as usize])?;
        }
    }

    Ok(())
}

/// `.comment` section body (spec.md §4.4 step 3): a leading NUL, a
/// human-readable identifier string, and a trailing NUL.
fn comment_bytes() -> Vec<u8> {
    let mut bytes = vec![0u8];
    bytes.extend_from_slice(format!("elf32obj {}", env!("CARGO_PKG_VERSION")).as_bytes());
    bytes.push(0);
    bytes
}

fn write_ehdr<W: Write>(
    out: &mut W,
    ctx: &WriteContext<'_>,
    shnum: u16,
    shoff: u32,
    shstrndx: u16,
) -> Result<()> {
    let mut e_ident = [0u8; 16];
    e_ident[0..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
    e_ident[4] = 1; // ELFCLASS32
    e_ident[5] = 1; // ELFDATA2LSB
    e_ident[6] = 1; // EV_CURRENT
    e_ident[7] = ctx.osabi;
    e_ident[8] = ctx.abi_version;
    out.write_all(&e_ident)?;
    out.write_all(&ET_REL.to_le_bytes())?;
    out.write_all(&EM_386.to_le_bytes())?;
    out.write_all(&EV_CURRENT.to_le_bytes())?;
    out.write_all(&0u32.to_le_bytes())?; // e_entry
    out.write_all(&0u32.to_le_bytes())?; // e_phoff
    out.write_all(&shoff.to_le_bytes())?;
    out.write_all(&0u32.to_le_bytes())?; // e_flags
    out.write_all(&52u16.to_le_bytes())?; // e_ehsize
    out.write_all(&0u16.to_le_bytes())?; // e_phentsize
    out.write_all(&0u16.to_le_bytes())?; // e_phnum
    out.write_all(&40u16.to_le_bytes())?; // e_shentsize
    out.write_all(&shnum.to_le_bytes())?;
    out.write_all(&shstrndx.to_le_bytes())?;
    Ok(())
}

/// Number of symtab entries that precede every local/global symbol: the
/// null entry, the optional `STT_FILE` entry, and one `STT_SECTION`
/// entry per section (user sections and debug sections alike, spec.md
/// §4.5 simplified from the reference tool's fixed "3 DWARF section
/// symbols" to "every section gets one", see DESIGN.md).
fn symbol_preamble_count(ctx: &WriteContext<'_>) -> usize {
    1 + ctx.module_name.is_some() as usize + ctx.sections.len() + ctx.debug_sections.len()
}

fn build_symtab(
    ctx: &WriteContext<'_>,
    section_header_index: &HashMap<SectionId, usize>,
    debug_header_index: &HashMap<String, usize>,
    section_symtab_index: &mut HashMap<SectionId, u32>,
) -> (Vec<u8>, usize, HashMap<u32, u32>, HashMap<String, u32>) {
    let mut bytes = Vec::new();
    push_sym_entry(&mut bytes, 0, 0, 0, 0, 0, SHN_UNDEF);

    if let Some(name_offset) = ctx.module_name {
        push_sym_entry(
            &mut bytes,
            name_offset,
            0,
            0,
            sym_info(0, SymbolType::File),
            0,
            SHN_ABS,
        );
    }

    let mut index = 1 + ctx.module_name.is_some() as u32;
    for (id, _section) in ctx.sections.iter() {
        section_symtab_index.insert(id, index);
        let shndx = (section_header_index[&id] + 1) as u16;
        push_sym_entry(&mut bytes, 0, 0, 0, sym_info(0, SymbolType::Section), 0, shndx);
        index += 1;
    }

    let mut debug_symtab_index = HashMap::new();
    for debug_section in ctx.debug_sections {
        debug_symtab_index.insert(debug_section.name.clone(), index);
        let shndx = (debug_header_index[&debug_section.name] + 1) as u16;
        push_sym_entry(&mut bytes, 0, 0, 0, sym_info(0, SymbolType::Section), 0, shndx);
        index += 1;
    }

    let mut local_count = 0usize;
    for (_id, symbol) in ctx.symbols.iter() {
        if symbol.global {
            continue;
        }
        let shndx = symtab_shndx(symbol.place, section_header_index);
        push_sym_entry(
            &mut bytes,
            symbol.strtab_offset,
            symbol.value,
            symbol.size,
            sym_info(0, symbol.ty),
            symbol.visibility.as_u8(),
            shndx,
        );
        local_count += 1;
        index += 1;
    }

    let mut globals: Vec<_> = ctx.symbols.iter().filter(|(_, s)| s.global).collect();
    globals.sort_by_key(|(_, s)| s.global_slot.unwrap_or(0));
    let mut global_symtab_index = HashMap::new();
    for (_id, symbol) in globals {
        let shndx = symtab_shndx(symbol.place, section_header_index);
        if let Some(slot) = symbol.global_slot {
            global_symtab_index.insert(slot, index);
        }
        push_sym_entry(
            &mut bytes,
            symbol.strtab_offset,
            symbol.value,
            symbol.size,
            sym_info(1, symbol.ty),
            symbol.visibility.as_u8(),
            shndx,
        );
        index += 1;
    }

    (bytes, local_count, global_symtab_index, debug_symtab_index)
}

fn symtab_shndx(place: SymbolPlace, section_header_index: &HashMap<SectionId, usize>) -> u16 {
    match place {
        SymbolPlace::Undef => SHN_UNDEF,
        SymbolPlace::Abs => SHN_ABS,
        SymbolPlace::Common => SHN_COMMON,
        SymbolPlace::Section(id) => (section_header_index[&id] + 1) as u16,
    }
}

fn sym_info(bind: u8, ty: SymbolType) -> u8 {
    (bind << 4) | (ty.as_u8() & 0xf)
}

fn push_sym_entry(
    bytes: &mut Vec<u8>,
    name: u32,
    value: u32,
    size: u32,
    info: u8,
    other: u8,
    shndx: u16,
) {
    bytes.extend_from_slice(&name.to_le_bytes());
    bytes.extend_from_slice(&value.to_le_bytes());
    bytes.extend_from_slice(&size.to_le_bytes());
    bytes.push(info);
    bytes.push(other);
    bytes.extend_from_slice(&shndx.to_le_bytes());
}

fn build_reltab(
    relocs: &[crate::reloc::Relocation],
    section_symtab_index: &HashMap<SectionId, u32>,
    global_symtab_index: &HashMap<u32, u32>,
) -> Vec<u8> {
    let mut bytes = Vec::new();
    for reloc in relocs {
        let sym_index = match reloc.target {
            RelocTarget::SectionSym(id) => section_symtab_index[&id],
            RelocTarget::Global(slot) => global_symtab_index.get(&slot).copied().unwrap_or(0),
        };
        let r_info = (sym_index << 8) | reloc.ty as u8 as u32;
        bytes.extend_from_slice(&reloc.offset.to_le_bytes());
        bytes.extend_from_slice(&r_info.to_le_bytes());
    }
    bytes
}
