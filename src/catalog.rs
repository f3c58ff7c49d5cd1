//! Symbol-catalog loader.
//!
//! Parses the kernel-wide `symbols.klp` list into two ordered tables.
//! Catalog order matters: within one object, the position of a repeated
//! name is its 0-based order of appearance here, and the resolver and
//! sanity checker rely on that order being preserved exactly as read.

use std::fs;
use std::path::Path;

use crate::error::{format_error, Error};

/// First line of a valid catalog file. Matched as a prefix rather than
/// exact equality; trailing bytes on that line are not otherwise
/// significant.
pub const VERSION_TAG: &str = "klp-convert-symbol-data.0.1";

/// Symbols whose name starts with this are exported via `EXPORT_SYMBOL`
/// and are never livepatch-converted.
pub const EXPORTED_PREFIX: &str = "__ksymtab_";

/// One `(object, symbol)` pair drawn from the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogEntry {
    pub object: String,
    pub name: String,
}

/// The catalog, split into non-exported and exported tables.
#[derive(Debug, Default)]
pub struct Catalog {
    regular: Vec<CatalogEntry>,
    exported: Vec<CatalogEntry>,
}

impl Catalog {
    pub fn regular(&self) -> &[CatalogEntry] {
        &self.regular
    }

    pub fn exported(&self) -> &[CatalogEntry] {
        &self.exported
    }

    /// Loads and parses a `symbols.klp`-style file.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let text = fs::read_to_string(path).map_err(|e| Error::Io {
            msg: format!("unable to open symbol list {}: {e}", path.display()).into(),
        })?;

        let mut lines = text.lines();
        let version = lines
            .next()
            .ok_or_else(|| format_error("symbol list is empty"))?;
        if !version.starts_with(VERSION_TAG) {
            return Err(format_error("symbol list is in unknown format"));
        }

        let mut catalog = Catalog::default();
        let mut current_object: Option<String> = None;

        for line in lines {
            let line = line.trim_end_matches(['\r', '\n']);
            if line.is_empty() {
                continue;
            }
            if let Some(name) = line.strip_prefix('*') {
                current_object = Some(name.to_string());
                continue;
            }

            let object = current_object
                .clone()
                .ok_or_else(|| format_error("symbol line with no preceding object marker"))?;

            let entry = CatalogEntry {
                object,
                name: line.to_string(),
            };
            if entry.name.starts_with(EXPORTED_PREFIX) {
                catalog.exported.push(entry);
            } else {
                catalog.regular.push(entry);
            }
        }

        Ok(catalog)
    }

    /// Entries in the regular table matching `(object, name)`, in catalog
    /// order. Position `N` (1-based) is the `N`-th element of this slice.
    pub fn matches<'a>(&'a self, object: &str, name: &str) -> Vec<&'a CatalogEntry> {
        self.regular
            .iter()
            .filter(|e| e.object == object && e.name == name)
            .collect()
    }

    /// All regular entries whose name matches, regardless of object, in
    /// catalog order. Used both for ambiguous-name resolution and for
    /// printing the candidate list on a failed annotation.
    pub fn matches_by_name<'a>(&'a self, name: &str) -> Vec<&'a CatalogEntry> {
        self.regular.iter().filter(|e| e.name == name).collect()
    }

    /// True if `name` appears in the exported table once the
    /// `__ksymtab_` prefix is stripped; compares against the bare name,
    /// not the prefixed entry itself.
    pub fn is_exported(&self, name: &str) -> bool {
        self.exported
            .iter()
            .any(|e| e.name.len() > EXPORTED_PREFIX.len() && &e.name[EXPORTED_PREFIX.len()..] == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_catalog(contents: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(contents.as_bytes()).unwrap();
        f
    }

    #[test]
    fn parses_objects_and_symbols() {
        let f = write_catalog(
            "klp-convert-symbol-data.0.1\n*vmlinux\nprintk\nsaved_command_line\n*some_module\ndriver_name\ndriver_name\n__ksymtab_foo\n",
        );
        let catalog = Catalog::load(f.path()).unwrap();
        assert_eq!(catalog.regular().len(), 4);
        assert_eq!(catalog.exported().len(), 1);
        assert_eq!(catalog.matches("some_module", "driver_name").len(), 2);
        assert!(catalog.is_exported("foo"));
        assert!(!catalog.is_exported("__ksymtab_foo"));
    }

    #[test]
    fn rejects_bad_version_tag() {
        let f = write_catalog("not-the-right-tag\n*vmlinux\nprintk\n");
        assert!(Catalog::load(f.path()).is_err());
    }

    #[test]
    fn rejects_symbol_without_object_marker() {
        let f = write_catalog("klp-convert-symbol-data.0.1\nprintk\n");
        assert!(Catalog::load(f.path()).is_err());
    }

    #[test]
    fn preserves_catalog_order_for_positions() {
        let f = write_catalog(
            "klp-convert-symbol-data.0.1\n*mod\ndriver_name\nother\ndriver_name\n",
        );
        let catalog = Catalog::load(f.path()).unwrap();
        let matches = catalog.matches("mod", "driver_name");
        assert_eq!(matches.len(), 2);
    }
}
