//! This crate provides symbol resolution over the guest's binary (only
//! ELF for now).
//!
//! Only the symbol table of the object file is consumed: entries with a
//! function type and a non-zero address are retained, everything else is
//! ignored. Lookup is by name.

mod error;

pub use self::error::{Error, Result};

use std::collections::HashMap;
use std::path::Path;

use goblin::elf::Elf;

/// One symbol of the guest binary.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol {
    /// Symbol name.
    pub name: String,

    /// Guest virtual address of the symbol.
    pub addr: u64,
}

/// Read-only table of the guest binary's function symbols.
///
/// Loaded once from disk; immutable thereafter.
#[derive(Default)]
pub struct SymbolTable {
    symbols: HashMap<String, Symbol>,
}

impl SymbolTable {
    /// Loads function symbols from an ELF object file on disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read(path).map_err(|e| Error::File(path.to_path_buf(), e))?;

        let table = Self::from_elf_bytes(&data)?;

        tracing::debug!(
            path = %path.display(),
            count = table.len(),
            "symbols loaded"
        );

        Ok(table)
    }

    /// Parses function symbols out of in-memory ELF bytes.
    pub fn from_elf_bytes(data: &[u8]) -> Result<Self> {
        let elf = Elf::parse(data)?;

        Ok(Self::collect(elf.syms.iter().filter_map(|sym| {
            let name = elf.strtab.get_at(sym.st_name)?;
            Some((name, sym.st_value, sym.is_function()))
        })))
    }

    /// Builds a table from `(name, address, is_function)` entries,
    /// keeping only function symbols with a non-zero address.
    pub fn collect<'a>(entries: impl IntoIterator<Item = (&'a str, u64, bool)>) -> Self {
        let symbols = entries
            .into_iter()
            .filter(|&(_, addr, is_function)| is_function && addr > 0)
            .map(|(name, addr, _)| {
                (
                    name.to_owned(),
                    Symbol {
                        name: name.to_owned(),
                        addr,
                    },
                )
            })
            .collect();

        Self { symbols }
    }

    /// Looks up a symbol by name.
    pub fn lookup(&self, name: &str) -> Result<&Symbol> {
        self.symbols
            .get(name)
            .ok_or_else(|| Error::NoSuchSymbol(name.to_owned()))
    }

    /// Iterates over the known symbols, in unspecified order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol> {
        self.symbols.values()
    }

    /// Number of known symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Whether the table holds no symbol.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }
}
