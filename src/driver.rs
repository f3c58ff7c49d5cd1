//! Top-level driver.
//!
//! Orchestrates opening the ELF object, loading the catalog, annotation
//! extraction, sanity checking, per-section resolution and conversion,
//! then commits the result by writing the object back, but only if
//! nothing failed.

use std::path::Path;

use crate::annotation;
use crate::catalog::Catalog;
use crate::elfgraph::ElfGraph;
use crate::error::Error;
use crate::resolver::Resolver;
use crate::rewriter;
use crate::sanity;

/// Run-time configuration beyond the three positional paths.
pub struct Options {
    /// Promotes "annotation with no matching relocation" from a
    /// warning to a fatal conflict.
    pub strict_orphans: bool,
}

/// Runs the whole pipeline. On any failure, nothing is written to
/// `output_path` and every accumulated error is returned.
pub fn run(
    catalog_path: &Path,
    input_path: &Path,
    output_path: &Path,
    options: &Options,
) -> Result<(), Vec<Error>> {
    let mut graph = ElfGraph::open(input_path).map_err(|e| vec![e])?;
    let catalog = Catalog::load(catalog_path).map_err(|e| vec![e])?;

    let annotations = annotation::extract(&mut graph).map_err(|e| vec![e])?;
    sanity::check_conflicts(&annotations).map_err(|e| vec![e])?;
    sanity::check_orphans(&graph, &annotations, options.strict_orphans).map_err(|e| vec![e])?;

    let mut resolver = Resolver::new();
    let mut errors = Vec::new();

    let candidates: Vec<_> = graph
        .section_ids()
        .filter(|&id| rewriter::is_candidate_section(&graph, id))
        .collect();
    for section in candidates {
        rewriter::rewrite_section(
            &mut graph,
            &catalog,
            &annotations,
            &mut resolver,
            section,
            &mut errors,
        );
        if !errors.is_empty() {
            return Err(errors);
        }
    }

    rewriter::rename_symbols(&mut graph, &resolver).map_err(|e| vec![e])?;
    graph.write(output_path).map_err(|e| vec![e])?;
    Ok(())
}
