//! Symbol resolver.
//!
//! Decides, for each unresolved relocation symbol, the unique
//! `(object, name, position)` triple the kernel's livepatch loader
//! will use to find it at patch-apply time.

use std::collections::HashMap;

use log::{trace, warn};

use crate::annotation::Annotation;
use crate::catalog::Catalog;
use crate::elfgraph::{ElfGraph, SymbolId};
use crate::error::{resolution_error, Error};

/// The architecture-reserved symbol some ABIs (ppc64 ELFv1) carry;
/// never a candidate for conversion.
const TOC_SYMBOL: &str = ".TOC.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub object: String,
    pub name: String,
    pub position: u32,
}

#[derive(Debug, Default)]
pub struct Resolver {
    cache: HashMap<SymbolId, Resolution>,
}

impl Resolver {
    pub fn new() -> Self {
        Resolver::default()
    }

    /// Every cached resolution, for the rewriter's final renaming pass.
    pub fn resolutions(&self) -> impl Iterator<Item = (SymbolId, &Resolution)> {
        self.cache.iter().map(|(&k, v)| (k, v))
    }

    /// True if `symbol` should never be considered for conversion:
    /// already defined, the reserved null entry, the architecture's
    /// `.TOC.` symbol, or an exported symbol.
    pub fn skip_symbol(graph: &ElfGraph, catalog: &Catalog, symbol: SymbolId) -> bool {
        let sym = graph.symbol(symbol);
        !sym.is_undefined()
            || symbol == 0
            || sym.name == TOC_SYMBOL
            || catalog.is_exported(&sym.name)
    }

    /// Resolves `symbol`, consulting (and updating) the cache.
    pub fn resolve(
        &mut self,
        graph: &ElfGraph,
        catalog: &Catalog,
        annotations: &[Annotation],
        symbol: SymbolId,
    ) -> Result<Resolution, Error> {
        if let Some(cached) = self.cache.get(&symbol) {
            trace!("symbol {symbol} resolved from cache: {cached:?}");
            return Ok(cached.clone());
        }

        let name = graph.symbol(symbol).name.clone();

        if let Some(annotation) = annotations.iter().find(|a| a.name == name) {
            let resolution = Resolution {
                object: annotation.object.clone(),
                name: annotation.name.clone(),
                position: annotation.position,
            };
            validate_annotation(catalog, &resolution)?;
            self.cache.insert(symbol, resolution.clone());
            return Ok(resolution);
        }

        let candidates = catalog.matches_by_name(&name);
        match candidates.len() {
            1 => {
                let resolution = Resolution {
                    object: candidates[0].object.clone(),
                    name: candidates[0].name.clone(),
                    position: 0,
                };
                self.cache.insert(symbol, resolution.clone());
                Ok(resolution)
            }
            0 => Err(resolution_error(format!("symbol {name} not found in catalog"))),
            _ => {
                warn!("ambiguous symbol {name}, annotation required");
                print_candidates(catalog, &name);
                Err(resolution_error(format!(
                    "symbol {name} is ambiguous, annotation required"
                )))
            }
        }
    }
}

/// Validates an annotation-derived resolution against the catalog.
/// `position == 0` requires exactly one `(object, name)` match;
/// `position >= 1` requires that many-th (1-based) catalog occurrence
/// to exist.
fn validate_annotation(catalog: &Catalog, resolution: &Resolution) -> Result<(), Error> {
    let matches = catalog.matches(&resolution.object, &resolution.name);
    let valid = if resolution.position == 0 {
        matches.len() == 1
    } else {
        (resolution.position as usize) <= matches.len()
    };
    if valid {
        return Ok(());
    }
    warn!(
        "annotation {}.{},{} does not match the catalog",
        resolution.object, resolution.name, resolution.position
    );
    print_candidates(catalog, &resolution.name);
    Err(resolution_error(format!(
        "annotation {}.{},{} does not match the catalog",
        resolution.object, resolution.name, resolution.position
    )))
}

/// Prints every catalog candidate for `name`, grouped by object, as
/// the annotation macros a developer would paste into source.
fn print_candidates(catalog: &Catalog, name: &str) {
    let mut current_object: Option<&str> = None;
    let mut position = 0u32;
    for entry in catalog.regular() {
        if entry.name != name {
            continue;
        }
        if current_object != Some(entry.object.as_str()) {
            if current_object.is_some() {
                eprintln!("}}");
            }
            eprintln!("KLP_MODULE_RELOC({}){{", entry.object);
            current_object = Some(entry.object.as_str());
            position = 0;
        }
        eprintln!("\tKLP_SYMPOS({name},{position})");
        position += 1;
    }
    if current_object.is_some() {
        eprintln!("}}");
    }
}
