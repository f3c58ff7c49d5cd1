//! A small mutable ELF64 relocatable-object graph.
//!
//! The rest of this converter treats the ELF reader/writer as a
//! collaborator named only by the interface it consumes ("open a file
//! into an in-memory graph of sections/symbols/relocations, write one
//! back"). No crate in the ecosystem exposes exactly that interface, so both
//! directions are hand-assembled with `byteorder`, the same technique
//! `tools/gen_relocs/src/writer.rs` uses to hand-assemble dylib images.
//! Relocation sections are kept as graph nodes in their own right
//! rather than folded into the section they apply to: this tool needs
//! to move a subset of one section's relocations into a newly named
//! section while the rest stay put, which a reader that unifies
//! relocations onto their target section cannot express. The `object`
//! crate stays a dependency for test
//! fixtures only (`object::write::Object`, the same builder
//! `tools/gen_relocs/src/relocatable.rs` uses to fabricate objects).
//!
//! Scope: ELF64, little- or big-endian. 32-bit ELF is out of scope for
//! this tool (kernel livepatch targets are practically always 64-bit
//! architectures); see DESIGN.md.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use crate::error::{format_error, structural_error, Error};

pub const SHN_UNDEF: u16 = 0;
pub const SHN_ABS: u16 = 0xfff1;
pub const SHN_COMMON: u16 = 0xfff2;
/// Pseudo-section index the kernel module loader recognizes for
/// livepatch-converted symbols.
pub const SHN_LIVEPATCH: u16 = 0xff20;

pub const SHT_NULL: u32 = 0;
pub const SHT_SYMTAB: u32 = 2;
pub const SHT_STRTAB: u32 = 3;
pub const SHT_RELA: u32 = 4;
pub const SHT_NOBITS: u32 = 8;
pub const SHT_REL: u32 = 9;

/// Flag bit the livepatch loader looks for on a converted relocation
/// section, so it resolves those entries against arbitrary kernel
/// objects instead of only the module's direct dependencies.
pub const SHF_RELA_LIVEPATCH: u64 = 0x0010_0000;

/// `st_name` sentinel meaning "this symbol's real name is carried
/// out-of-band (via the `.klp.sym.` name this converter assigned it in
/// memory), not through the string table".
pub const ST_NAME_OOB: u32 = 0xffff_ffff;

pub const STB_LOCAL: u8 = 0;

const EHDR_SIZE: usize = 64;
const SHDR_SIZE: usize = 64;
const SYM_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    fn from_ei_data(b: u8) -> Result<Self, Error> {
        match b {
            1 => Ok(Endian::Little),
            2 => Ok(Endian::Big),
            _ => Err(format_error("not a valid ELF64 object: bad data encoding")),
        }
    }

    pub fn read_u16(self, b: &[u8]) -> u16 {
        match self {
            Endian::Little => LittleEndian::read_u16(b),
            Endian::Big => BigEndian::read_u16(b),
        }
    }

    pub fn read_u32(self, b: &[u8]) -> u32 {
        match self {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        }
    }

    pub fn read_u64(self, b: &[u8]) -> u64 {
        match self {
            Endian::Little => LittleEndian::read_u64(b),
            Endian::Big => BigEndian::read_u64(b),
        }
    }

    pub fn read_i64(self, b: &[u8]) -> i64 {
        match self {
            Endian::Little => LittleEndian::read_i64(b),
            Endian::Big => BigEndian::read_i64(b),
        }
    }
}

pub type SectionId = usize;
pub type SymbolId = usize;

#[derive(Debug, Clone)]
pub struct Relocation {
    pub offset: u64,
    pub symbol: SymbolId,
    pub r_type: u32,
    pub addend: i64,
    /// Set once the rewriter decides this relocation is being converted;
    /// names the section it will move into.
    pub klp_target: Option<SectionId>,
}

#[derive(Debug, Clone)]
pub struct Section {
    pub name: String,
    pub sh_type: u32,
    pub sh_flags: u64,
    pub sh_link: u32,
    pub sh_addralign: u64,
    pub sh_entsize: u64,
    /// Raw bytes, meaningful only for non-relocation sections.
    pub data: Vec<u8>,
    /// For `SHT_RELA`/`SHT_REL` sections: the section these relocations
    /// apply to.
    pub base: Option<SectionId>,
    /// Meaningful only for `SHT_RELA`/`SHT_REL` sections.
    pub relocations: Vec<Relocation>,
    pub removed: bool,
}

impl Section {
    pub fn is_rela(&self) -> bool {
        self.sh_type == SHT_RELA || self.sh_type == SHT_REL
    }
}

#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    /// Original symbol-table index; symbol 0 is the reserved null entry.
    pub index: u32,
    pub raw_shndx: u16,
    /// The section this symbol is defined in, if any ordinary section.
    pub section: Option<SectionId>,
    pub value: u64,
    pub size: u64,
    pub bind: u8,
    pub sym_type: u8,
    pub other: u8,
    /// Set by the rewriter once this symbol has been renamed into the
    /// livepatch wire form.
    pub converted: bool,
    pub removed: bool,
}

impl Symbol {
    pub fn is_undefined(&self) -> bool {
        self.raw_shndx == SHN_UNDEF
    }
}

pub struct ElfGraph {
    pub endian: Endian,
    e_machine: u16,
    e_flags: u32,
    e_type: u16,
    symtab_info: u32,
    sections: Vec<Section>,
    symbols: Vec<Symbol>,
}

/// A section header exactly as read off disk, before any of it is
/// folded into `Section`/`Relocation`/`Symbol`.
struct RawShdr {
    sh_name: u32,
    sh_type: u32,
    sh_flags: u64,
    sh_offset: u64,
    sh_size: u64,
    sh_link: u32,
    sh_info: u32,
    sh_addralign: u64,
    sh_entsize: u64,
}

fn slice_at(data: &[u8], offset: u64, size: u64) -> Result<&[u8], Error> {
    let start = offset as usize;
    let end = start
        .checked_add(size as usize)
        .ok_or_else(|| format_error("section extends past end of file"))?;
    data.get(start..end)
        .ok_or_else(|| format_error("section extends past end of file"))
}

fn str_at(table: &[u8], offset: u32) -> String {
    let start = offset as usize;
    if start >= table.len() {
        return String::new();
    }
    let end = table[start..]
        .iter()
        .position(|&b| b == 0)
        .map_or(table.len(), |p| start + p);
    String::from_utf8_lossy(&table[start..end]).into_owned()
}

impl ElfGraph {
    pub fn open(path: &Path) -> Result<Self, Error> {
        let data = fs::read(path).map_err(|e| Error::Io {
            msg: format!("unable to read elf file {}: {e}", path.display()).into(),
        })?;
        Self::parse(&data)
    }

    /// Parses an in-memory ELF64 relocatable object into a graph.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        if data.len() < EHDR_SIZE || &data[0..4] != b"\x7fELF" {
            return Err(format_error("not a valid ELF64 object: bad magic"));
        }
        if data[4] != 2 {
            return Err(format_error("not a valid ELF64 object: not ELFCLASS64"));
        }
        let endian = Endian::from_ei_data(data[5])?;

        let e_type = endian.read_u16(&data[16..18]);
        let e_machine = endian.read_u16(&data[18..20]);
        let e_flags = endian.read_u32(&data[48..52]);
        let e_shoff = endian.read_u64(&data[40..48]);
        let e_shentsize = endian.read_u16(&data[58..60]) as usize;
        let e_shnum = endian.read_u16(&data[60..62]) as usize;
        let e_shstrndx = endian.read_u16(&data[62..64]) as usize;

        if e_shoff == 0 || e_shnum == 0 {
            return Err(format_error("object has no section headers"));
        }
        if e_shentsize < SHDR_SIZE {
            return Err(format_error("section header entry too small"));
        }

        let mut raw_shdrs = Vec::with_capacity(e_shnum);
        for i in 0..e_shnum {
            let start = e_shoff as usize + i * e_shentsize;
            let s = data
                .get(start..start + SHDR_SIZE)
                .ok_or_else(|| format_error("section header table truncated"))?;
            raw_shdrs.push(RawShdr {
                sh_name: endian.read_u32(&s[0..4]),
                sh_type: endian.read_u32(&s[4..8]),
                sh_flags: endian.read_u64(&s[8..16]),
                sh_offset: endian.read_u64(&s[24..32]),
                sh_size: endian.read_u64(&s[32..40]),
                sh_link: endian.read_u32(&s[40..44]),
                sh_info: endian.read_u32(&s[44..48]),
                sh_addralign: endian.read_u64(&s[48..56]),
                sh_entsize: endian.read_u64(&s[56..64]),
            });
        }

        let shstrtab = raw_shdrs
            .get(e_shstrndx)
            .map(|s| slice_at(data, s.sh_offset, s.sh_size))
            .transpose()?
            .unwrap_or(&[]);

        let mut sections = Vec::with_capacity(raw_shdrs.len());
        for s in &raw_shdrs {
            let name = str_at(shstrtab, s.sh_name);
            let raw_data = if matches!(s.sh_type, SHT_NULL | SHT_NOBITS | SHT_RELA | SHT_REL) {
                Vec::new()
            } else {
                slice_at(data, s.sh_offset, s.sh_size)
                    .map(|d| d.to_vec())
                    .unwrap_or_default()
            };
            sections.push(Section {
                name,
                sh_type: s.sh_type,
                sh_flags: s.sh_flags,
                sh_link: s.sh_link,
                sh_addralign: s.sh_addralign,
                sh_entsize: s.sh_entsize,
                data: raw_data,
                base: None,
                relocations: Vec::new(),
                removed: false,
            });
        }

        // Relocation sections keep their own identity (see module doc):
        // decode their entries here rather than folding them onto `base`.
        let mut symtab_info = 0u32;
        for (idx, s) in raw_shdrs.iter().enumerate() {
            if s.sh_type == SHT_SYMTAB {
                symtab_info = s.sh_info;
                continue;
            }
            if s.sh_type != SHT_RELA && s.sh_type != SHT_REL {
                continue;
            }
            sections[idx].base = Some(s.sh_info as usize);
            let raw = slice_at(data, s.sh_offset, s.sh_size)?;
            let is_rela = s.sh_type == SHT_RELA;
            let entsize = if is_rela { 24 } else { 16 };
            let mut off = 0usize;
            while off + entsize <= raw.len() {
                let r_offset = endian.read_u64(&raw[off..off + 8]);
                let r_info = endian.read_u64(&raw[off + 8..off + 16]);
                let r_addend = if is_rela {
                    endian.read_i64(&raw[off + 16..off + 24])
                } else {
                    0
                };
                let symbol = (r_info >> 32) as usize;
                let r_type = (r_info & 0xffff_ffff) as u32;
                sections[idx].relocations.push(Relocation {
                    offset: r_offset,
                    symbol,
                    r_type,
                    addend: r_addend,
                    klp_target: None,
                });
                off += entsize;
            }
        }

        // Symbols, decoded from the one symbol table this tool expects a
        // relocatable object to carry.
        let mut symbols = Vec::new();
        if let Some(symtab_idx) = raw_shdrs.iter().position(|s| s.sh_type == SHT_SYMTAB) {
            let sym_data = &sections[symtab_idx].data;
            let strtab_idx = raw_shdrs[symtab_idx].sh_link as usize;
            let strtab = raw_shdrs
                .get(strtab_idx)
                .map(|s| slice_at(data, s.sh_offset, s.sh_size))
                .transpose()?
                .unwrap_or(&[]);

            let count = sym_data.len() / SYM_SIZE;
            for i in 0..count {
                let base = i * SYM_SIZE;
                let b = &sym_data[base..base + SYM_SIZE];
                let st_name = endian.read_u32(&b[0..4]);
                let st_info = b[4];
                let st_other = b[5];
                let st_shndx = endian.read_u16(&b[6..8]);
                let st_value = endian.read_u64(&b[8..16]);
                let st_size = endian.read_u64(&b[16..24]);
                let section = if st_shndx != SHN_UNDEF && st_shndx < SHN_ABS {
                    Some(st_shndx as usize)
                } else {
                    None
                };
                symbols.push(Symbol {
                    name: str_at(strtab, st_name),
                    index: i as u32,
                    raw_shndx: st_shndx,
                    section,
                    value: st_value,
                    size: st_size,
                    bind: st_info >> 4,
                    sym_type: st_info & 0xf,
                    other: st_other,
                    converted: false,
                    removed: false,
                });
            }
        }

        Ok(ElfGraph {
            endian,
            e_machine,
            e_flags,
            e_type,
            symtab_info,
            sections,
            symbols,
        })
    }

    // -- accessors -----------------------------------------------------

    pub fn section_ids(&self) -> impl Iterator<Item = SectionId> + '_ {
        (0..self.sections.len()).filter(|&i| !self.sections[i].removed)
    }

    pub fn section(&self, id: SectionId) -> &Section {
        &self.sections[id]
    }

    pub fn section_mut(&mut self, id: SectionId) -> &mut Section {
        &mut self.sections[id]
    }

    pub fn find_section_by_name(&self, name: &str) -> Option<SectionId> {
        self.sections
            .iter()
            .position(|s| !s.removed && s.name == name)
    }

    pub fn symbol_ids(&self) -> impl Iterator<Item = SymbolId> + '_ {
        (0..self.symbols.len()).filter(|&i| !self.symbols[i].removed)
    }

    pub fn symbol(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id]
    }

    pub fn symbol_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id]
    }

    // -- mutation: annotation extractor ---------------------------------

    pub fn remove_section(&mut self, id: SectionId) {
        self.sections[id].removed = true;
    }

    pub fn remove_symbol(&mut self, id: SymbolId) {
        self.symbols[id].removed = true;
    }

    /// Removes every relocation across every section that references
    /// `symbol`. Used when deleting symbols that only existed to serve
    /// now-removed annotation sections.
    pub fn remove_relocations_referencing(&mut self, symbol: SymbolId) {
        for sec in &mut self.sections {
            sec.relocations.retain(|r| r.symbol != symbol);
        }
    }

    // -- mutation: rewriter ----------------------------------------------

    /// Finds an existing section named `name`, or creates a new
    /// relocation section bound to `base`. The livepatch flag is always
    /// set on return (bit-or, never cleared).
    pub fn get_or_create_rela_section(&mut self, name: &str, base: SectionId) -> SectionId {
        if let Some(id) = self.find_section_by_name(name) {
            self.sections[id].sh_flags |= SHF_RELA_LIVEPATCH;
            return id;
        }
        let sh_type = self
            .sections
            .iter()
            .find(|s| s.is_rela())
            .map(|s| s.sh_type)
            .unwrap_or(SHT_RELA);
        let id = self.sections.len();
        self.sections.push(Section {
            name: name.to_string(),
            sh_type,
            sh_flags: SHF_RELA_LIVEPATCH,
            sh_link: 0,
            sh_addralign: 8,
            sh_entsize: if sh_type == SHT_RELA { 24 } else { 16 },
            data: Vec::new(),
            base: Some(base),
            relocations: Vec::new(),
            removed: false,
        });
        id
    }

    /// Moves the relocation at `index` within `from`'s list onto the
    /// tail of `to`'s list. Caller is responsible for only calling this
    /// in the second pass over a section (see `rewriter::rewrite`).
    pub fn move_relocation(&mut self, from: SectionId, index: usize, to: SectionId) {
        let reloc = self.sections[from].relocations.remove(index);
        self.sections[to].relocations.push(reloc);
    }

    /// Renames a symbol into the livepatch wire form, clearing its
    /// defining section and marking it converted. The caller (rewriter)
    /// computes `wire_name` and is responsible for the 3-digit position
    /// bound (4+ digit positions are rejected before this is called,
    /// never truncated).
    pub fn rename_symbol(&mut self, id: SymbolId, wire_name: String) -> Result<(), Error> {
        let sym = self
            .symbols
            .get_mut(id)
            .ok_or_else(|| structural_error("symbol index out of range during rename"))?;
        sym.name = wire_name;
        sym.section = None;
        sym.raw_shndx = SHN_LIVEPATCH;
        sym.converted = true;
        Ok(())
    }

    // -- serialization ---------------------------------------------------

    pub fn write(&self, path: &Path) -> Result<(), Error> {
        let bytes = writer::serialize(self)?;
        fs::write(path, bytes).map_err(|e| Error::Io {
            msg: format!("unable to write elf file {}: {e}", path.display()).into(),
        })
    }

    pub(crate) fn header_fields(&self) -> (u16, u16, u32) {
        (self.e_type, self.e_machine, self.e_flags)
    }

    pub(crate) fn symtab_info(&self) -> u32 {
        self.symtab_info
    }
}

#[cfg(test)]
impl ElfGraph {
    /// Builds a graph directly from parts, bypassing `parse`. Lets the
    /// other modules' unit tests exercise annotation/sanity/resolver/
    /// rewriter logic against a small synthetic graph instead of a real
    /// ELF byte stream.
    pub(crate) fn for_test(sections: Vec<Section>, symbols: Vec<Symbol>) -> Self {
        ElfGraph {
            endian: Endian::Little,
            e_machine: 0,
            e_flags: 0,
            e_type: 1, // ET_REL
            symtab_info: 1,
            sections,
            symbols,
        }
    }
}

mod writer {
    use super::*;
    use std::io::Write as _;

    macro_rules! wr {
        ($endian:expr, $buf:expr, $ty:ident, $val:expr) => {
            match $endian {
                Endian::Little => paste_write::$ty::<LittleEndian>($buf, $val),
                Endian::Big => paste_write::$ty::<BigEndian>($buf, $val),
            }
        };
    }

    mod paste_write {
        use byteorder::{ByteOrder, WriteBytesExt};
        pub fn u16<E: ByteOrder>(buf: &mut Vec<u8>, v: u16) {
            buf.write_u16::<E>(v).unwrap();
        }
        pub fn u32<E: ByteOrder>(buf: &mut Vec<u8>, v: u32) {
            buf.write_u32::<E>(v).unwrap();
        }
        pub fn u64<E: ByteOrder>(buf: &mut Vec<u8>, v: u64) {
            buf.write_u64::<E>(v).unwrap();
        }
        pub fn i64<E: ByteOrder>(buf: &mut Vec<u8>, v: i64) {
            buf.write_i64::<E>(v).unwrap();
        }
    }

    fn align_up(n: u64, align: u64) -> u64 {
        if align <= 1 {
            return n;
        }
        n.div_ceil(align) * align
    }

    pub fn serialize(graph: &ElfGraph) -> Result<Vec<u8>, Error> {
        let endian = graph.endian;
        let (e_type, e_machine, e_flags) = graph.header_fields();

        // 1. Build the final section list: surviving original sections in
        //    order, with their relocation payload re-encoded, followed by
        //    freshly rebuilt .symtab/.strtab/.shstrtab.
        let mut shstrtab = StrTab::new();
        let mut strtab = StrTab::new();

        struct OutSection {
            name_off: u32,
            sh_type: u32,
            sh_flags: u64,
            sh_link: u32,
            sh_info: u32,
            sh_addralign: u64,
            sh_entsize: u64,
            data: Vec<u8>,
        }

        let mut out_sections: Vec<OutSection> = Vec::new();
        // NULL section.
        out_sections.push(OutSection {
            name_off: 0,
            sh_type: SHT_NULL,
            sh_flags: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 0,
            sh_entsize: 0,
            data: Vec::new(),
        });

        // old_id -> new_id, for sections that survive verbatim (everything
        // except the symtab/strtab/shstrtab, which are rebuilt below).
        let mut id_map = vec![None; graph.sections.len()];

        for old_id in graph.section_ids() {
            let sec = graph.section(old_id);
            if sec.sh_type == SHT_SYMTAB || sec.sh_type == SHT_STRTAB {
                continue;
            }
            let name_off = shstrtab.intern(&sec.name);
            let data = if sec.is_rela() {
                encode_relocations(endian, sec)
            } else {
                sec.data.clone()
            };
            id_map[old_id] = Some(out_sections.len());
            out_sections.push(OutSection {
                name_off,
                sh_type: sec.sh_type,
                sh_flags: sec.sh_flags,
                sh_link: 0, // patched for rela sections below
                sh_info: 0, // patched for rela sections below
                sh_addralign: sec.sh_addralign.max(1),
                sh_entsize: sec.sh_entsize,
                data,
            });
        }

        // Patch sh_link/sh_info for relocation sections now that every
        // section has a final index.
        let symtab_index_placeholder = out_sections.len() as u32; // filled in once symtab is appended
        for old_id in graph.section_ids() {
            let sec = graph.section(old_id);
            if !sec.is_rela() {
                continue;
            }
            let new_id = id_map[old_id].expect("rela section must survive");
            let base_new = sec.base.and_then(|b| id_map[b]).unwrap_or(0) as u32;
            out_sections[new_id].sh_link = symtab_index_placeholder;
            out_sections[new_id].sh_info = base_new;
        }

        // 2. Rebuild .symtab / .strtab from the (possibly renamed) symbol
        //    list. Orphaned old names for converted symbols are still
        //    interned into .strtab and never freed.
        let mut sym_bytes = Vec::new();
        // null symbol
        sym_bytes.extend_from_slice(&[0u8; SYM_SIZE]);
        for id in graph.symbol_ids() {
            if id == 0 {
                continue;
            }
            let sym = &graph.symbols[id];
            let (st_name, st_shndx) = if sym.converted {
                strtab.intern(&sym.name); // orphaned, intentionally unreferenced
                (ST_NAME_OOB, SHN_LIVEPATCH)
            } else {
                let off = strtab.intern(&sym.name);
                let shndx = match sym.section.and_then(|s| id_map[s]) {
                    Some(new_id) => new_id as u16,
                    None => sym.raw_shndx,
                };
                (off, shndx)
            };
            let mut buf = Vec::with_capacity(24);
            wr!(endian, &mut buf, u32, st_name);
            buf.push((sym.bind << 4) | (sym.sym_type & 0xf));
            buf.push(sym.other);
            wr!(endian, &mut buf, u16, st_shndx);
            wr!(endian, &mut buf, u64, sym.value);
            wr!(endian, &mut buf, u64, sym.size);
            sym_bytes.extend_from_slice(&buf);
        }

        let strtab_name = shstrtab.intern(".strtab");
        let symtab_name = shstrtab.intern(".symtab");
        let shstrtab_name = shstrtab.intern(".shstrtab");

        let symtab_new_id = out_sections.len();
        out_sections.push(OutSection {
            name_off: symtab_name,
            sh_type: SHT_SYMTAB,
            sh_flags: 0,
            sh_link: 0, // patched below once strtab index is known
            sh_info: graph.symtab_info(),
            sh_addralign: 8,
            sh_entsize: SYM_SIZE as u64,
            data: sym_bytes,
        });

        let strtab_new_id = out_sections.len();
        out_sections.push(OutSection {
            name_off: strtab_name,
            sh_type: SHT_STRTAB,
            sh_flags: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            data: strtab.into_bytes(),
        });
        out_sections[symtab_new_id].sh_link = strtab_new_id as u32;

        // Now that the real symtab index is known, patch the placeholder
        // sh_link on every relocation section.
        for sec in out_sections.iter_mut() {
            if (sec.sh_type == SHT_RELA || sec.sh_type == SHT_REL)
                && sec.sh_link == symtab_index_placeholder
            {
                sec.sh_link = symtab_new_id as u32;
            }
        }

        let shstrtab_new_id = out_sections.len();
        out_sections.push(OutSection {
            name_off: shstrtab_name,
            sh_type: SHT_STRTAB,
            sh_flags: 0,
            sh_link: 0,
            sh_info: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            data: Vec::new(), // filled in after shstrtab stops growing
        });
        out_sections[shstrtab_new_id].data = shstrtab.into_bytes();

        // 3. Lay out section data after the ELF header, section-header
        //    table immediately after (ET_REL objects have no program
        //    headers, so this is the whole file).
        let shnum = out_sections.len() as u64;
        let mut offset = EHDR_SIZE as u64;
        let mut data_offsets = vec![0u64; out_sections.len()];
        for (i, sec) in out_sections.iter().enumerate() {
            if sec.sh_type == SHT_NULL || sec.data.is_empty() {
                data_offsets[i] = offset;
                continue;
            }
            offset = align_up(offset, sec.sh_addralign.max(1));
            data_offsets[i] = offset;
            offset += sec.data.len() as u64;
        }
        let shoff = align_up(offset, 8);

        let mut out = Vec::with_capacity(shoff as usize + out_sections.len() * SHDR_SIZE);
        write_ehdr(
            &mut out,
            endian,
            e_type,
            e_machine,
            e_flags,
            shoff,
            shnum,
            shstrtab_new_id as u16,
        );
        debug_assert_eq!(out.len(), EHDR_SIZE);

        for (i, sec) in out_sections.iter().enumerate() {
            if sec.sh_type == SHT_NULL || sec.data.is_empty() {
                continue;
            }
            while (out.len() as u64) < data_offsets[i] {
                out.push(0);
            }
            out.write_all(&sec.data).unwrap();
        }
        while (out.len() as u64) < shoff {
            out.push(0);
        }

        for (i, sec) in out_sections.iter().enumerate() {
            write_shdr(
                &mut out,
                endian,
                sec.name_off,
                sec.sh_type,
                sec.sh_flags,
                data_offsets[i],
                sec.data.len() as u64,
                sec.sh_link,
                sec.sh_info,
                sec.sh_addralign.max(1),
                sec.sh_entsize,
            );
        }

        Ok(out)
    }

    fn encode_relocations(endian: Endian, sec: &Section) -> Vec<u8> {
        let is_rela = sec.sh_type == SHT_RELA;
        let mut buf = Vec::with_capacity(sec.relocations.len() * if is_rela { 24 } else { 16 });
        for r in &sec.relocations {
            let r_info = ((r.symbol as u64) << 32) | (r.r_type as u64 & 0xffff_ffff);
            wr!(endian, &mut buf, u64, r.offset);
            wr!(endian, &mut buf, u64, r_info);
            if is_rela {
                wr!(endian, &mut buf, i64, r.addend);
            }
        }
        buf
    }

    #[allow(clippy::too_many_arguments)]
    fn write_ehdr(
        out: &mut Vec<u8>,
        endian: Endian,
        e_type: u16,
        e_machine: u16,
        e_flags: u32,
        shoff: u64,
        shnum: u64,
        shstrndx: u16,
    ) {
        out.extend_from_slice(&[0x7f, b'E', b'L', b'F']);
        out.push(2); // ELFCLASS64
        out.push(if endian == Endian::Little { 1 } else { 2 }); // ELFDATA2LSB/MSB
        out.push(1); // EI_VERSION
        out.extend_from_slice(&[0u8; 9]); // EI_PAD
        wr!(endian, out, u16, e_type);
        wr!(endian, out, u16, e_machine);
        wr!(endian, out, u32, 1); // e_version
        wr!(endian, out, u64, 0); // e_entry
        wr!(endian, out, u64, 0); // e_phoff
        wr!(endian, out, u64, shoff);
        wr!(endian, out, u32, e_flags);
        wr!(endian, out, u16, EHDR_SIZE as u16);
        wr!(endian, out, u16, 0); // e_phentsize
        wr!(endian, out, u16, 0); // e_phnum
        wr!(endian, out, u16, SHDR_SIZE as u16);
        wr!(endian, out, u16, shnum as u16);
        wr!(endian, out, u16, shstrndx);
    }

    #[allow(clippy::too_many_arguments)]
    fn write_shdr(
        out: &mut Vec<u8>,
        endian: Endian,
        sh_name: u32,
        sh_type: u32,
        sh_flags: u64,
        sh_offset: u64,
        sh_size: u64,
        sh_link: u32,
        sh_info: u32,
        sh_addralign: u64,
        sh_entsize: u64,
    ) {
        wr!(endian, out, u32, sh_name);
        wr!(endian, out, u32, sh_type);
        wr!(endian, out, u64, sh_flags);
        wr!(endian, out, u64, 0); // sh_addr
        wr!(endian, out, u64, sh_offset);
        wr!(endian, out, u64, sh_size);
        wr!(endian, out, u32, sh_link);
        wr!(endian, out, u32, sh_info);
        wr!(endian, out, u64, sh_addralign);
        wr!(endian, out, u64, sh_entsize);
    }

    struct StrTab {
        bytes: Vec<u8>,
        seen: HashMap<String, u32>,
    }

    impl StrTab {
        fn new() -> Self {
            StrTab {
                bytes: vec![0],
                seen: HashMap::new(),
            }
        }

        /// Interns `s`, returning its offset. Intentionally not
        /// deduplication-free across converted/old names: callers that
        /// want the "orphaned leak" behavior call this unconditionally
        /// even when the offset is discarded.
        fn intern(&mut self, s: &str) -> u32 {
            if let Some(&off) = self.seen.get(s) {
                return off;
            }
            let off = self.bytes.len() as u32;
            self.bytes.extend_from_slice(s.as_bytes());
            self.bytes.push(0);
            self.seen.insert(s.to_string(), off);
            off
        }

        fn into_bytes(self) -> Vec<u8> {
            self.bytes
        }
    }
}
