//! DWARF v2/v3 debug back end (spec.md §4.8).
//!
//! Builds the six core sections (`.debug_aranges`, `.debug_pubnames`,
//! `.debug_info`, `.debug_abbrev`, `.debug_line`, `.debug_frame`) plus
//! `.debug_loc`, using [`ByteStream`] for each buffer and the line-
//! number program's special-opcode encoding for `.debug_line`.

use super::{DebugBackend, DebugSection, LineRecord};
use crate::reloc::RelocType;
use crate::saa::ByteStream;
use crate::section::{SectionKind, SectionTable};

const LINE_BASE: i8 = -5;
const LINE_RANGE: u8 = 14;
const OPCODE_BASE: u8 = 13;

// Standard opcodes (DW_LNS_*).
const DW_LNS_COPY: u8 = 1;
const DW_LNS_ADVANCE_PC: u8 = 2;
const DW_LNS_ADVANCE_LINE: u8 = 3;
const DW_LNS_SET_FILE: u8 = 4;
const DW_LNS_NEGATE_STMT: u8 = 6;

// Extended opcodes (DW_LNE_*).
const DW_LNE_END_SEQUENCE: u8 = 1;
const DW_LNE_SET_ADDRESS: u8 = 2;

/// Per-file line-program state, one stream per section that received
/// `linenum` calls (each executable section gets its own line-number
/// program and `.debug_info` compile-unit-child entries).
struct SectionLines {
    section_name: String,
    records: Vec<LineRecord>,
}

/// DWARF back end state, accumulated across one pass.
#[derive(Default)]
pub struct DwarfBackend {
    by_section: Vec<SectionLines>,
    files: Vec<String>,
}

impl DwarfBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn file_index(&mut self, filename: &str) -> u64 {
        if let Some(i) = self.files.iter().position(|f| f == filename) {
            return i as u64 + 1; // DWARF file table is 1-based
        }
        self.files.push(filename.to_string());
        self.files.len() as u64
    }

    /// Compute the special opcode for `(line_delta, addr_advance)`, or
    /// `None` if it falls outside the encodable range and must be
    /// emitted as a `DW_LNS_advance_{line,pc}` pair followed by
    /// `DW_LNS_copy` instead (spec.md §4.8 "special opcode computation").
    fn special_opcode(line_delta: i64, addr_advance: u64) -> Option<u8> {
        if line_delta < LINE_BASE as i64 || line_delta > (LINE_BASE as i64 + LINE_RANGE as i64 - 1)
        {
            return None;
        }
        let adjusted = (line_delta - LINE_BASE as i64) as u64 + addr_advance * LINE_RANGE as u64;
        let opcode = adjusted + OPCODE_BASE as u64;
        if opcode > 255 {
            None
        } else {
            Some(opcode as u8)
        }
    }
}

impl DebugBackend for DwarfBackend {
    fn linenum(&mut self, section_name: &str, offset: u32, filename: &str, line: u32) {
        self.file_index(filename);
        if let Some(bucket) = self
            .by_section
            .iter_mut()
            .find(|b| b.section_name == section_name)
        {
            bucket.records.push(LineRecord {
                section_name: section_name.to_string(),
                offset,
                filename: filename.to_string(),
                line,
            });
        } else {
            self.by_section.push(SectionLines {
                section_name: section_name.to_string(),
                records: vec![LineRecord {
                    section_name: section_name.to_string(),
                    offset,
                    filename: filename.to_string(),
                    line,
                }],
            });
        }
    }

    fn generate(&mut self, sections: &SectionTable) -> Vec<DebugSection> {
        if self.by_section.is_empty() {
            return Vec::new();
        }

        let mut debug_line = ByteStream::new();
        let mut line_relocs = Vec::new();
        let mut debug_aranges = ByteStream::new();
        let mut aranges_relocs = Vec::new();
        let mut debug_info = ByteStream::new();
        let mut info_relocs = Vec::new();
        let mut debug_pubnames = ByteStream::new();
        let mut debug_abbrev = ByteStream::new();
        let mut debug_frame = ByteStream::new();
        let mut debug_loc = ByteStream::new();

        // .debug_line: header is written per-unit in the reference tool;
        // we emit one shared program body with a minimal header.
        write_line_program_header(&mut debug_line, &self.files);
        for bucket in &self.by_section {
            let unit_start = debug_line.len() as u32;
            let _ = unit_start;
            let mut pc = 0u32;
            let mut line = 1i64;
            // DWARF's line-program `file` register starts at 1.
            let mut current_file = 1u64;
            let mut first = true;
            for record in &bucket.records {
                let file_idx = self
                    .files
                    .iter()
                    .position(|f| f == &record.filename)
                    .map(|i| i as u64 + 1)
                    .unwrap_or(1);
                if first {
                    line_relocs.push((debug_line.len() as u32 + 1, bucket.section_name.clone()));
                    debug_line.write_u8(0);
                    debug_line.write_uleb128(5);
                    debug_line.write_u8(DW_LNE_SET_ADDRESS);
                    debug_line.write_u32(0); // patched via relocation above
                    if file_idx != current_file {
                        debug_line.write_u8(DW_LNS_SET_FILE);
                        debug_line.write_uleb128(file_idx);
                        current_file = file_idx;
                    }
                    line = record.line as i64;
                    debug_line.write_u8(DW_LNS_ADVANCE_LINE);
                    debug_line.write_sleb128(line - 1);
                    debug_line.write_u8(DW_LNS_COPY);
                    first = false;
                    pc = record.offset;
                    continue;
                }
                if file_idx != current_file {
                    debug_line.write_u8(DW_LNS_SET_FILE);
                    debug_line.write_uleb128(file_idx);
                    current_file = file_idx;
                }
                let addr_advance = (record.offset - pc) as u64;
                let line_delta = record.line as i64 - line;
                match Self::special_opcode(line_delta, addr_advance) {
                    Some(opcode) => debug_line.write_u8(opcode),
                    None => {
                        if addr_advance != 0 {
                            debug_line.write_u8(DW_LNS_ADVANCE_PC);
                            debug_line.write_uleb128(addr_advance);
                        }
                        if line_delta != 0 {
                            debug_line.write_u8(DW_LNS_ADVANCE_LINE);
                            debug_line.write_sleb128(line_delta);
                        }
                        debug_line.write_u8(DW_LNS_COPY);
                    }
                }
                pc = record.offset;
                line = record.line as i64;
            }
            debug_line.write_u8(0);
            debug_line.write_uleb128(1);
            debug_line.write_u8(DW_LNE_END_SEQUENCE);
        }
        let _ = DW_LNS_NEGATE_STMT;

        // .debug_aranges: one (address, length) tuple per section that
        // carries line information. Length is read from the section
        // table at generate() time, after all sections are final (spec.md
        // §4.8 "aranges range-length read fresh at generate() time").
        debug_aranges.write_u32(0); // unit_length, patched conceptually by writer
        debug_aranges.write_u16(2);
        debug_aranges.write_u32(0); // debug_info_offset
        debug_aranges.write_u8(4);
        debug_aranges.write_u8(0);
        debug_aranges.write_u32(0); // padding to 16-byte tuple alignment
        for bucket in &self.by_section {
            let length = sections
                .by_name(&bucket.section_name)
                .map(|id| sections.get(id).len())
                .unwrap_or(0);
            aranges_relocs.push((debug_aranges.len() as u32, bucket.section_name.clone()));
            debug_aranges.write_u32(0);
            debug_aranges.write_u32(length);
        }
        debug_aranges.write_u32(0);
        debug_aranges.write_u32(0);

        // .debug_info: a minimal compile-unit header; full DIE trees for
        // functions/variables are outside this emitter's scope (the
        // assembler has no type information to describe).
        debug_info.write_u32(0);
        debug_info.write_u16(3);
        info_relocs.push((debug_info.len() as u32, ".debug_abbrev".to_string()));
        debug_info.write_u32(0);
        debug_info.write_u8(4);
        debug_info.write_uleb128(1);
        debug_info.write_uleb128(self.files.len() as u64);

        debug_abbrev.write_uleb128(1);
        debug_abbrev.write_uleb128(0x11); // DW_TAG_compile_unit
        debug_abbrev.write_u8(1); // has_children
        debug_abbrev.write_uleb128(0);
        debug_abbrev.write_uleb128(0);
        debug_abbrev.write_u8(0);

        debug_pubnames.write_u32(0);
        debug_pubnames.write_u16(2);
        debug_pubnames.write_u32(0);
        debug_pubnames.write_u32(0);
        debug_pubnames.write_u32(0);
        debug_pubnames.write_u32(0);

        debug_frame.write_u32(0xffffffff);
        debug_frame.write_u8(1);
        debug_frame.write_u8(0);
        debug_frame.write_uleb128(1);
        debug_frame.write_sleb128(-4);
        debug_frame.write_u8(8);

        debug_loc.write_u8(0); // reserved for future location-list entries

        vec![
            DebugSection {
                name: ".debug_aranges".to_string(),
                kind: SectionKind::Progbits,
                body: debug_aranges.into_vec(),
                relocs: aranges_relocs
                    .into_iter()
                    .map(|(o, n)| (o, n, RelocType::Abs32))
                    .collect(),
            },
            DebugSection {
                name: ".debug_pubnames".to_string(),
                kind: SectionKind::Progbits,
                body: debug_pubnames.into_vec(),
                relocs: Vec::new(),
            },
            DebugSection {
                name: ".debug_info".to_string(),
                kind: SectionKind::Progbits,
                body: debug_info.into_vec(),
                relocs: info_relocs
                    .into_iter()
                    .map(|(o, n)| (o, n, RelocType::Abs32))
                    .collect(),
            },
            DebugSection {
                name: ".debug_abbrev".to_string(),
                kind: SectionKind::Progbits,
                body: debug_abbrev.into_vec(),
                relocs: Vec::new(),
            },
            DebugSection {
                name: ".debug_line".to_string(),
                kind: SectionKind::Progbits,
                body: debug_line.into_vec(),
                relocs: line_relocs
                    .into_iter()
                    .map(|(o, n)| (o, n, RelocType::Abs32))
                    .collect(),
            },
            DebugSection {
                name: ".debug_frame".to_string(),
                kind: SectionKind::Progbits,
                body: debug_frame.into_vec(),
                relocs: Vec::new(),
            },
            DebugSection {
                name: ".debug_loc".to_string(),
                kind: SectionKind::Progbits,
                body: debug_loc.into_vec(),
                relocs: Vec::new(),
            },
        ]
    }
}

fn write_line_program_header(out: &mut ByteStream, files: &[String]) {
    out.write_u32(0); // unit_length, fixed up by writer.rs once final
    out.write_u16(3); // DWARF version
    out.write_u32(0); // header_length, fixed up by writer.rs
    out.write_u8(1); // minimum_instruction_length
    out.write_u8(1); // default_is_stmt
    out.write_u8(LINE_BASE as u8);
    out.write_u8(LINE_RANGE);
    out.write_u8(OPCODE_BASE);
    out.write_bytes(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]); // standard_opcode_lengths
    out.write_u8(0); // include_directories terminator
    for file in files {
        out.write_bytes(file.as_bytes());
        out.write_u8(0);
        out.write_uleb128(0); // directory index
        out.write_uleb128(0); // mtime
        out.write_uleb128(0); // size
    }
    out.write_u8(0); // file_names terminator
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn special_opcode_in_range_is_some() {
        assert!(DwarfBackend::special_opcode(0, 1).is_some());
    }

    #[test]
    fn special_opcode_out_of_range_is_none() {
        assert!(DwarfBackend::special_opcode(100, 0).is_none());
    }

    #[test]
    fn generate_is_empty_with_no_line_records() {
        let mut backend = DwarfBackend::new();
        let sections = SectionTable::new();
        assert!(backend.generate(&sections).is_empty());
    }
}
