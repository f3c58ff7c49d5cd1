//! Annotation extractor.
//!
//! Decodes the `KLP_MODULE_RELOC`/`KLP_SYMPOS` hints a developer
//! embeds in the input object as `.klp.module_relocs.<object>`
//! sections, each paired with a `.rela.klp.module_relocs.<object>`
//! relocation section that names the symbol each record annotates.

use crate::elfgraph::{ElfGraph, SectionId};
use crate::error::{format_error, Error};

pub const MODULE_RELOCS_PREFIX: &str = ".klp.module_relocs.";
pub const MODULE_RELOCS_RELA_PREFIX: &str = ".rela.klp.module_relocs.";

/// Kernel's `MODULE_NAME_LEN`; bounds how much of a `module_relocs`
/// section name can be the object-name tail.
pub const MODULE_NAME_LEN: usize = 56;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Annotation {
    pub object: String,
    pub name: String,
    pub position: u32,
}

/// Truncates `name` to the `%55s`-equivalent `MODULE_NAME_LEN - 1` bytes
/// the original's `sscanf` buffer holds, at a `char` boundary. Overlong
/// object-name tails are truncated, not rejected, matching the kernel
/// tool's own buffer-bounded scan.
fn truncate_object_name(name: &str) -> String {
    let limit = MODULE_NAME_LEN - 1;
    if name.len() <= limit {
        return name.to_string();
    }
    let mut end = limit;
    while end > 0 && !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Extracts every annotation out of `graph`, deleting the sections
/// that carried them, and any symbol that existed only to serve them,
/// as it goes.
pub fn extract(graph: &mut ElfGraph) -> Result<Vec<Annotation>, Error> {
    let mut annotations = Vec::new();

    let targets: Vec<(SectionId, String)> = graph
        .section_ids()
        .filter_map(|id| {
            graph
                .section(id)
                .name
                .strip_prefix(MODULE_RELOCS_PREFIX)
                .map(|obj| (id, obj.to_string()))
        })
        .collect();

    for (section_id, object) in targets {
        // The kernel's own `sscanf(sec->name, ".klp.module_relocs.%55s",
        // objname)` silently truncates an overlong tail rather than
        // rejecting it; matched here rather than failing the run.
        let object = truncate_object_name(&object);

        let rela_name = format!("{MODULE_RELOCS_RELA_PREFIX}{object}");
        let rela_id = graph
            .find_section_by_name(&rela_name)
            .ok_or_else(|| format_error(format!("{rela_name} missing for annotation section")))?;

        let section_name = graph.section(section_id).name.clone();
        let data = &graph.section(section_id).data;
        if data.len() % 4 != 0 {
            return Err(format_error(format!(
                "{section_name} has a size not a multiple of 4"
            )));
        }
        let endian = graph.endian;
        let positions: Vec<u32> = data.chunks_exact(4).map(|c| endian.read_u32(c)).collect();

        let reloc_count = graph.section(rela_id).relocations.len();
        if positions.len() != reloc_count {
            return Err(format_error(format!(
                "{section_name} has {} records but {rela_name} has {reloc_count} relocations",
                positions.len()
            )));
        }

        for (reloc, position) in graph.section(rela_id).relocations.iter().zip(positions) {
            annotations.push(Annotation {
                object: object.clone(),
                name: graph.symbol(reloc.symbol).name.clone(),
                position,
            });
        }

        graph.remove_section(section_id);
        graph.remove_section(rela_id);

        let orphaned: Vec<_> = graph
            .symbol_ids()
            .filter(|&sid| graph.symbol(sid).section == Some(section_id))
            .collect();
        for sid in orphaned {
            graph.remove_relocations_referencing(sid);
            graph.remove_symbol(sid);
        }
    }

    Ok(annotations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elfgraph::{Relocation, Section, Symbol};

    fn sym(name: &str, section: Option<usize>) -> Symbol {
        Symbol {
            name: name.to_string(),
            index: 0,
            raw_shndx: section.map(|s| s as u16).unwrap_or(0),
            section,
            value: 0,
            size: 0,
            bind: 0,
            sym_type: 0,
            other: 0,
            converted: false,
            removed: false,
        }
    }

    fn section(name: &str, sh_type: u32) -> Section {
        Section {
            name: name.to_string(),
            sh_type,
            sh_flags: 0,
            sh_link: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            data: Vec::new(),
            base: None,
            relocations: Vec::new(),
            removed: false,
        }
    }

    #[test]
    fn extracts_one_annotation_and_removes_its_sections() {
        // sections: 0 = module_relocs.mod, 1 = rela.klp.module_relocs.mod
        // symbols: 0 = null, 1 = driver_name (undefined)
        let mut sections = vec![
            section(".klp.module_relocs.mod", crate::elfgraph::SHT_NOBITS),
            section(".rela.klp.module_relocs.mod", crate::elfgraph::SHT_RELA),
        ];
        sections[0].data = 1u32.to_le_bytes().to_vec();
        sections[1].relocations.push(Relocation {
            offset: 0,
            symbol: 1,
            r_type: 0,
            addend: 0,
            klp_target: None,
        });

        let symbols = vec![sym("", None), sym("driver_name", None)];
        let mut graph = ElfGraph::for_test(sections, symbols);

        let annotations = extract(&mut graph).unwrap();
        assert_eq!(
            annotations,
            vec![Annotation {
                object: "mod".to_string(),
                name: "driver_name".to_string(),
                position: 1,
            }]
        );
        assert!(graph.find_section_by_name(".klp.module_relocs.mod").is_none());
        assert!(graph
            .find_section_by_name(".rela.klp.module_relocs.mod")
            .is_none());
    }

    #[test]
    fn rejects_mismatched_record_and_relocation_counts() {
        let mut sections = vec![
            section(".klp.module_relocs.mod", crate::elfgraph::SHT_NOBITS),
            section(".rela.klp.module_relocs.mod", crate::elfgraph::SHT_RELA),
        ];
        sections[0].data = [1u32, 2u32]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        // Only one relocation for two records.
        sections[1].relocations.push(Relocation {
            offset: 0,
            symbol: 1,
            r_type: 0,
            addend: 0,
            klp_target: None,
        });

        let symbols = vec![sym("", None), sym("driver_name", None)];
        let mut graph = ElfGraph::for_test(sections, symbols);

        assert!(extract(&mut graph).is_err());
    }

    #[test]
    fn removes_symbols_defined_only_in_the_annotation_section() {
        let mut sections = vec![
            section(".klp.module_relocs.mod", crate::elfgraph::SHT_NOBITS),
            section(".rela.klp.module_relocs.mod", crate::elfgraph::SHT_RELA),
        ];
        sections[0].data = 1u32.to_le_bytes().to_vec();
        sections[1].relocations.push(Relocation {
            offset: 0,
            symbol: 1,
            r_type: 0,
            addend: 0,
            klp_target: None,
        });

        let symbols = vec![
            sym("", None),
            sym("driver_name", None),
            // A local symbol whose only purpose was describing the
            // annotation section itself.
            sym("section_marker", Some(0)),
        ];
        let mut graph = ElfGraph::for_test(sections, symbols);

        extract(&mut graph).unwrap();
        assert!(graph.symbol(2).removed);
    }

    #[test]
    fn truncates_overlong_object_name_instead_of_rejecting() {
        let long = "a".repeat(MODULE_NAME_LEN + 10);
        let truncated = truncate_object_name(&long);
        assert_eq!(truncated.len(), MODULE_NAME_LEN - 1);
        assert!(long.starts_with(&truncated));
    }

    #[test]
    fn leaves_short_object_name_untouched() {
        assert_eq!(truncate_object_name("vmlinux"), "vmlinux");
    }
}
