//! STABS debug back end (spec.md §4.7).
//!
//! Emits `.stab` (fixed 12-byte entries) and `.stabstr` (a plain string
//! table, built with [`crate::strtab::StringTable`] so names are *not*
//! deduplicated against `.strtab`/`.shstrtab`), plus the relocations
//! tying each `N_SLINE` entry's `n_value` back to its section.

use super::{DebugBackend, DebugSection, LineRecord};
use crate::reloc::RelocType;
use crate::saa::ByteStream;
use crate::section::{SectionKind, SectionTable};
use crate::strtab::StringTable;

const N_SO: u8 = 0x64;
const N_SOL: u8 = 0x84;
const N_SLINE: u8 = 0x44;

struct StabEntry {
    strx: u32,
    n_type: u8,
    n_other: u8,
    n_desc: u16,
    n_value: u32,
    /// If set, `n_value` is section-relative and needs a relocation
    /// against this section's symbol rather than being an absolute 0.
    reloc_section: Option<String>,
}

/// STABS back end state, accumulated across one pass.
#[derive(Default)]
pub struct StabsBackend {
    records: Vec<LineRecord>,
    /// Files in first-seen order ("allfiles" in the reference tool).
    files: Vec<String>,
}

impl StabsBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn file_index(&mut self, filename: &str) -> usize {
        if let Some(i) = self.files.iter().position(|f| f == filename) {
            return i;
        }
        self.files.push(filename.to_string());
        self.files.len() - 1
    }
}

impl DebugBackend for StabsBackend {
    fn linenum(&mut self, section_name: &str, offset: u32, filename: &str, line: u32) {
        self.file_index(filename);
        self.records.push(LineRecord {
            section_name: section_name.to_string(),
            offset,
            filename: filename.to_string(),
            line,
        });
    }

    fn generate(&mut self, _sections: &SectionTable) -> Vec<DebugSection> {
        if self.records.is_empty() {
            return Vec::new();
        }

        let mut strtab = StringTable::new();
        let mut entries = Vec::new();

        // Preserve the reference tool's off-by-one main-file length
        // calculation: it takes `strlen(allfiles[0] + 12)` where it meant
        // `strlen(allfiles[0]) + 12`, silently truncating the reported
        // length of the main source file's name whenever that name is
        // longer than 12 bytes. We reproduce the same truncated value in
        // the synthesized first N_SO record rather than "fixing" it.
        let main_file = self.files.first().cloned().unwrap_or_default();
        let reported_name_len = main_file.get(12..).map(|s| s.len()).unwrap_or(0);

        let so_strx = strtab.push(&main_file);
        entries.push(StabEntry {
            strx: so_strx,
            n_type: N_SO,
            n_other: 0,
            n_desc: reported_name_len as u16,
            n_value: 0,
            reloc_section: None,
        });

        let mut current_file_idx = usize::MAX;
        for record in &self.records {
            let idx = self
                .files
                .iter()
                .position(|f| f == &record.filename)
                .unwrap_or(0);
            if idx != current_file_idx {
                let strx = strtab.push(&record.filename);
                entries.push(StabEntry {
                    strx,
                    n_type: N_SOL,
                    n_other: 0,
                    n_desc: 0,
                    n_value: record.offset,
                    reloc_section: Some(record.section_name.clone()),
                });
                current_file_idx = idx;
            }
            entries.push(StabEntry {
                strx: 0,
                n_type: N_SLINE,
                n_other: 0,
                n_desc: record.line as u16,
                n_value: record.offset,
                reloc_section: Some(record.section_name.clone()),
            });
        }

        let mut stab = ByteStream::new();
        let mut relocs = Vec::new();
        // Leading synthetic stab: n_desc backpatched to the number of
        // entries that follow it (spec.md "n_desc backpatching"); strx
        // points at the main file's name, the same string the first
        // N_SO entry above uses.
        stab.write_u32(so_strx);
        stab.write_u8(0);
        stab.write_u8(0);
        stab.write_u16(entries.len() as u16);
        stab.write_u32(0);

        for entry in &entries {
            let record_offset = stab.len() as u32;
            stab.write_u32(entry.strx);
            stab.write_u8(entry.n_type);
            stab.write_u8(entry.n_other);
            stab.write_u16(entry.n_desc);
            stab.write_u32(entry.n_value);
            if let Some(section_name) = &entry.reloc_section {
                // n_value sits at byte offset 8 within this 12-byte entry.
                relocs.push((record_offset + 8, section_name.clone()));
            }
        }

        let stabstr = DebugSection {
            name: ".stabstr".to_string(),
            kind: SectionKind::Progbits,
            body: strtab.as_slice().to_vec(),
            relocs: Vec::new(),
        };

        let stab_section = DebugSection {
            name: ".stab".to_string(),
            kind: SectionKind::Progbits,
            body: stab.into_vec(),
            relocs: relocs
                .into_iter()
                .map(|(offset, name)| (offset, name, RelocType::Abs32))
                .collect(),
        };

        vec![stab_section, stabstr]
    }
}
