//! Relocation rewriter.
//!
//! Converts one input relocation section at a time into the
//! kernel's cross-object livepatch form, then renames every resolved
//! symbol once every section has been processed.

use log::debug;

use crate::annotation::Annotation;
use crate::catalog::Catalog;
use crate::elfgraph::{ElfGraph, SectionId};
use crate::error::{format_error, unsupported_error, Error};
use crate::resolver::Resolver;

pub const RELA_PREFIX: &str = ".klp.rela.";
pub const SYM_PREFIX: &str = ".klp.sym.";

const ALWAYS_ALLOWED: &[&str] = &[
    ".rela.data",
    ".rela.rodata",
    ".rela.sdata",
    ".rela.text",
    ".rela.toc",
];

const JUMP_TABLE_PREFIX: &str = ".rela__jump_table";
const VMLINUX: &str = "vmlinux";

/// Whether the core is willing to convert relocations out of a
/// section named `rela_name`, given the object the symbol resolved
/// to.
pub fn supported_section(rela_name: &str, object: &str) -> bool {
    if ALWAYS_ALLOWED.iter().any(|p| rela_name.starts_with(p)) {
        return true;
    }
    rela_name.starts_with(JUMP_TABLE_PREFIX) && object == VMLINUX
}

fn target_section_name(object: &str, base_name: &str) -> String {
    let tail = base_name.strip_prefix('.').unwrap_or(base_name);
    format!("{RELA_PREFIX}{object}.{tail}")
}

/// A section is eligible for conversion only if it is a relocation
/// section and its name doesn't already carry the livepatch prefix
/// (otherwise a second run would reprocess already-converted output).
pub fn is_candidate_section(graph: &ElfGraph, section: SectionId) -> bool {
    let sec = graph.section(section);
    sec.is_rela() && !sec.name.starts_with(RELA_PREFIX)
}

/// Phase 1 + phase 2 of the rewrite for one section: resolve every
/// relocation's symbol, decide (and record) its target section, then
/// move the ones that resolved. Errors accumulate in `errors` rather
/// than aborting, so one run surfaces every problem in the section.
pub fn rewrite_section(
    graph: &mut ElfGraph,
    catalog: &Catalog,
    annotations: &[Annotation],
    resolver: &mut Resolver,
    section: SectionId,
    errors: &mut Vec<Error>,
) {
    let rela_name = graph.section(section).name.clone();
    let base = match graph.section(section).base {
        Some(b) => b,
        None => return,
    };
    let count = graph.section(section).relocations.len();

    // Phase 1: allocate/reuse target sections. Does not mutate
    // `section`'s relocation list, so this loop's indices stay valid.
    for i in 0..count {
        let symbol = graph.section(section).relocations[i].symbol;
        if Resolver::skip_symbol(graph, catalog, symbol) {
            continue;
        }
        let resolution = match resolver.resolve(graph, catalog, annotations, symbol) {
            Ok(r) => r,
            Err(e) => {
                errors.push(e);
                continue;
            }
        };
        if !supported_section(&rela_name, &resolution.object) {
            errors.push(unsupported_error(format!(
                "{rela_name} is not a supported relocation family for object {}",
                resolution.object
            )));
            continue;
        }
        let base_name = graph.section(base).name.clone();
        let target_name = target_section_name(&resolution.object, &base_name);
        let target = graph.get_or_create_rela_section(&target_name, base);
        debug!("{rela_name}[{i}] -> {target_name}");
        graph.section_mut(section).relocations[i].klp_target = Some(target);
    }

    // Phase 2: move. Walk in reverse so earlier indices are never
    // invalidated by a `Vec::remove` at a later index.
    for i in (0..count).rev() {
        let target = graph.section(section).relocations[i].klp_target;
        if let Some(target) = target {
            graph.move_relocation(section, i, target);
        }
    }
}

/// Renames every symbol with a cached resolution into its livepatch
/// wire form. Run only after every candidate section has been
/// processed with zero accumulated errors.
pub fn rename_symbols(graph: &mut ElfGraph, resolver: &Resolver) -> Result<(), Error> {
    for (symbol, resolution) in resolver.resolutions() {
        if resolution.position >= 1000 {
            return Err(format_error(format!(
                "position {} for {}.{} would overflow the 3-digit wire form",
                resolution.position, resolution.object, resolution.name
            )));
        }
        let wire_name = format!(
            "{SYM_PREFIX}{}.{},{}",
            resolution.object, resolution.name, resolution.position
        );
        graph.rename_symbol(symbol, wire_name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elfgraph::{Relocation, Section, Symbol, SHN_UNDEF, SHT_NOBITS, SHT_RELA};
    use std::io::Write;

    fn catalog_from(contents: &str) -> Catalog {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        Catalog::load(f.path()).unwrap()
    }

    fn undefined_symbol(name: &str) -> Symbol {
        Symbol {
            name: name.to_string(),
            index: 0,
            raw_shndx: SHN_UNDEF,
            section: None,
            value: 0,
            size: 0,
            bind: 0,
            sym_type: 0,
            other: 0,
            converted: false,
            removed: false,
        }
    }

    fn null_symbol() -> Symbol {
        Symbol {
            name: String::new(),
            index: 0,
            raw_shndx: 0,
            section: None,
            value: 0,
            size: 0,
            bind: 0,
            sym_type: 0,
            other: 0,
            converted: false,
            removed: false,
        }
    }

    #[test]
    fn supported_section_allows_known_prefixes_only() {
        assert!(supported_section(".rela.text", "vmlinux"));
        assert!(supported_section(".rela.text.unlikely", "vmlinux"));
        assert!(!supported_section(".rela.init.data", "vmlinux"));
    }

    #[test]
    fn jump_table_allowed_only_for_vmlinux() {
        assert!(supported_section(".rela__jump_table", "vmlinux"));
        assert!(!supported_section(".rela__jump_table", "some_module"));
    }

    #[test]
    fn moves_relocation_into_new_klp_rela_section_and_renames_symbol() {
        let text = Section {
            name: ".text".to_string(),
            sh_type: 1,
            sh_flags: 0,
            sh_link: 0,
            sh_addralign: 16,
            sh_entsize: 0,
            data: Vec::new(),
            base: None,
            relocations: Vec::new(),
            removed: false,
        };
        let mut rela_text = Section {
            name: ".rela.text".to_string(),
            sh_type: SHT_RELA,
            sh_flags: 0,
            sh_link: 0,
            sh_addralign: 8,
            sh_entsize: 24,
            data: Vec::new(),
            base: Some(0),
            relocations: Vec::new(),
            removed: false,
        };
        rela_text.relocations.push(Relocation {
            offset: 0,
            symbol: 1,
            r_type: 0,
            addend: 0,
            klp_target: None,
        });

        let mut graph = ElfGraph::for_test(vec![text, rela_text], vec![
            null_symbol(),
            undefined_symbol("saved_command_line"),
        ]);
        let catalog = catalog_from("klp-convert-symbol-data.0.1\n*vmlinux\nsaved_command_line\n");
        let mut resolver = Resolver::new();
        let mut errors = Vec::new();

        rewrite_section(&mut graph, &catalog, &[], &mut resolver, 1, &mut errors);
        assert!(errors.is_empty());

        let target = graph.find_section_by_name(".klp.rela.vmlinux.text").unwrap();
        assert_eq!(graph.section(target).relocations.len(), 1);
        assert!(graph.section(target).sh_flags & crate::elfgraph::SHF_RELA_LIVEPATCH != 0);
        assert!(graph.section(1).relocations.is_empty());

        rename_symbols(&mut graph, &resolver).unwrap();
        let sym = graph.symbol(1);
        assert_eq!(sym.name, ".klp.sym.vmlinux.saved_command_line,0");
        assert_eq!(sym.raw_shndx, crate::elfgraph::SHN_LIVEPATCH);
        assert!(sym.converted);
    }

    #[test]
    fn unsupported_section_is_an_accumulated_error() {
        let init_data = Section {
            name: ".init.data".to_string(),
            sh_type: 1,
            sh_flags: 0,
            sh_link: 0,
            sh_addralign: 8,
            sh_entsize: 0,
            data: Vec::new(),
            base: None,
            relocations: Vec::new(),
            removed: false,
        };
        let mut rela = Section {
            name: ".rela.init.data".to_string(),
            sh_type: SHT_RELA,
            sh_flags: 0,
            sh_link: 0,
            sh_addralign: 8,
            sh_entsize: 24,
            data: Vec::new(),
            base: Some(0),
            relocations: Vec::new(),
            removed: false,
        };
        rela.relocations.push(Relocation {
            offset: 0,
            symbol: 1,
            r_type: 0,
            addend: 0,
            klp_target: None,
        });

        let mut graph = ElfGraph::for_test(vec![init_data, rela], vec![
            null_symbol(),
            undefined_symbol("saved_command_line"),
        ]);
        let catalog = catalog_from("klp-convert-symbol-data.0.1\n*vmlinux\nsaved_command_line\n");
        let mut resolver = Resolver::new();
        let mut errors = Vec::new();

        rewrite_section(&mut graph, &catalog, &[], &mut resolver, 1, &mut errors);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], Error::Unsupported { .. }));
    }

    #[test]
    fn is_candidate_section_excludes_already_converted() {
        let already = Section {
            name: ".klp.rela.vmlinux.text".to_string(),
            sh_type: SHT_RELA,
            sh_flags: crate::elfgraph::SHF_RELA_LIVEPATCH,
            sh_link: 0,
            sh_addralign: 8,
            sh_entsize: 24,
            data: Vec::new(),
            base: Some(0),
            relocations: Vec::new(),
            removed: false,
        };
        let other = Section {
            name: ".other".to_string(),
            sh_type: SHT_NOBITS,
            sh_flags: 0,
            sh_link: 0,
            sh_addralign: 1,
            sh_entsize: 0,
            data: Vec::new(),
            base: None,
            relocations: Vec::new(),
            removed: false,
        };
        let graph = ElfGraph::for_test(vec![already, other], vec![null_symbol()]);
        assert!(!is_candidate_section(&graph, 0));
        assert!(!is_candidate_section(&graph, 1));
    }
}
