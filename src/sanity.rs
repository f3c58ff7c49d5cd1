//! Sanity checker.
//!
//! Scans the annotation set extracted by [`crate::annotation`] for
//! internal conflicts and orphans before the resolver ever sees it.

use log::warn;

use crate::annotation::Annotation;
use crate::elfgraph::ElfGraph;
use crate::error::{conflict_error, Error};

/// For every ordered pair `(a, b)` with `a` earlier than `b`, if they
/// share `object` and `name` but differ in `position`, that pair is a
/// conflict. Checked as an asymmetric scan (each pair once, in file
/// order) rather than a symmetric all-pairs scan, so the reported
/// conflict is always the first one in annotation order.
pub fn check_conflicts(annotations: &[Annotation]) -> Result<(), Error> {
    for (i, a) in annotations.iter().enumerate() {
        for b in &annotations[i + 1..] {
            if a.object == b.object && a.name == b.name && a.position != b.position {
                return Err(conflict_error(format!(
                    "{}.{} annotated with both position {} and position {}",
                    a.object, a.name, a.position, b.position
                )));
            }
        }
    }
    Ok(())
}

/// Warns (or, with `strict`, fails) on every annotation with no
/// relocation anywhere in the object referencing a symbol of that
/// name. The upstream tool only ever warns here; `strict` is this
/// reimplementation's answer to that being left an open question.
pub fn check_orphans(graph: &ElfGraph, annotations: &[Annotation], strict: bool) -> Result<(), Error> {
    for a in annotations {
        let referenced = graph.section_ids().any(|sid| {
            graph
                .section(sid)
                .relocations
                .iter()
                .any(|r| graph.symbol(r.symbol).name == a.name)
        });
        if referenced {
            continue;
        }
        if strict {
            return Err(conflict_error(format!(
                "annotation {}.{},{} has no matching relocation",
                a.object, a.name, a.position
            )));
        }
        warn!(
            "annotation {}.{},{} has no matching relocation",
            a.object, a.name, a.position
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::elfgraph::{Relocation, Section, Symbol};

    fn ann(object: &str, name: &str, position: u32) -> Annotation {
        Annotation {
            object: object.to_string(),
            name: name.to_string(),
            position,
        }
    }

    #[test]
    fn detects_first_conflicting_pair_in_order() {
        let annotations = vec![
            ann("mod", "x", 1),
            ann("mod", "y", 0),
            ann("mod", "x", 2),
        ];
        let err = check_conflicts(&annotations).unwrap_err();
        assert!(matches!(err, Error::Conflict { .. }));
    }

    #[test]
    fn allows_consistent_repeats() {
        let annotations = vec![ann("mod", "x", 1), ann("mod", "x", 1)];
        assert!(check_conflicts(&annotations).is_ok());
    }

    #[test]
    fn warns_without_failing_by_default_on_orphan() {
        let graph = ElfGraph::for_test(Vec::new(), vec![Symbol {
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
        }]);
        let annotations = vec![ann("mod", "nowhere", 0)];
        assert!(check_orphans(&graph, &annotations, false).is_ok());
    }

    #[test]
    fn fails_on_orphan_when_strict() {
        let graph = ElfGraph::for_test(Vec::new(), vec![Symbol {
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
        }]);
        let annotations = vec![ann("mod", "nowhere", 0)];
        assert!(check_orphans(&graph, &annotations, true).is_err());
    }

    #[test]
    fn accepts_referenced_annotation() {
        let mut sec = Section {
            name: ".rela.text".to_string(),
            sh_type: crate::elfgraph::SHT_RELA,
            sh_flags: 0,
            sh_link: 0,
            sh_addralign: 1,
            sh_entsize: 24,
            data: Vec::new(),
            base: Some(0),
            relocations: Vec::new(),
            removed: false,
        };
        sec.relocations.push(Relocation {
            offset: 0,
            symbol: 1,
            r_type: 0,
            addend: 0,
            klp_target: None,
        });
        let symbols = vec![
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
            },
            Symbol {
                name: "driver_name".to_string(),
                index: 1,
                raw_shndx: 0,
                section: None,
                value: 0,
                size: 0,
                bind: 0,
                sym_type: 0,
                other: 0,
                converted: false,
                removed: false,
            },
        ];
        let graph = ElfGraph::for_test(vec![sec], symbols);
        let annotations = vec![ann("mod", "driver_name", 1)];
        assert!(check_orphans(&graph, &annotations, true).is_ok());
    }
}
