//! The debug symbol table
//!
//! A symbol file is a concatenation of records: a big-endian 16-bit
//! address followed by the label bytes and a NUL terminator.  The table
//! keeps two stable secondary orders so lookups by address and by label
//! both return contiguous slices.

use std::fmt;
use thiserror::Error;

/// An (address, label) pair
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol {
    pub addr: u16,
    pub label: String,
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:04x})", self.label, self.addr)
    }
}

/// Errors raised by [`Symbols::parse`]
#[derive(Debug, Error)]
pub enum SymbolsError {
    #[error("truncated symbol record at offset {0:#06x}")]
    Truncated(usize),
    #[error("unterminated label for {addr:#06x} at offset {offset:#06x}")]
    Unterminated { addr: u16, offset: usize },
}

/// The parsed table, immutable once built
#[derive(Default, Debug)]
pub struct Symbols {
    /// Records in file order, kept for re-emission
    records: Vec<Symbol>,
    /// Stable-sorted by address
    by_addr: Vec<Symbol>,
    /// Stable-sorted by label
    by_label: Vec<Symbol>,
}

impl Symbols {
    /// Parses the binary symbol stream
    pub fn parse(bytes: &[u8]) -> Result<Self, SymbolsError> {
        let mut records = Vec::new();
        let mut rest = bytes;
        while !rest.is_empty() {
            let offset = bytes.len() - rest.len();
            if rest.len() < 3 {
                return Err(SymbolsError::Truncated(offset));
            }
            let addr = u16::from_be_bytes([rest[0], rest[1]]);
            rest = &rest[2..];
            let Some(end) = rest.iter().position(|&b| b == 0) else {
                return Err(SymbolsError::Unterminated {
                    addr,
                    offset: offset + 2,
                });
            };
            records.push(Symbol {
                addr,
                label: String::from_utf8_lossy(&rest[..end]).into_owned(),
            });
            rest = &rest[end + 1..];
        }

        let mut by_addr = records.clone();
        by_addr.sort_by_key(|s| s.addr);
        let mut by_label = records.clone();
        by_label.sort_by(|a, b| a.label.cmp(&b.label));
        Ok(Self {
            records,
            by_addr,
            by_label,
        })
    }

    /// Reconstructs the byte stream this table was parsed from
    pub fn emit(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for s in &self.records {
            out.extend_from_slice(&s.addr.to_be_bytes());
            out.extend_from_slice(s.label.as_bytes());
            out.push(0);
        }
        out
    }

    /// Number of symbols in the table
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Checks whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// All symbols at exactly `addr`
    pub fn for_addr(&self, addr: u16) -> &[Symbol] {
        let lo = self.by_addr.partition_point(|s| s.addr < addr);
        let hi = self.by_addr.partition_point(|s| s.addr <= addr);
        &self.by_addr[lo..hi]
    }

    /// All symbols labelled exactly `label`
    pub fn with_label(&self, label: &str) -> &[Symbol] {
        let lo = self.by_label.partition_point(|s| s.label.as_str() < label);
        let hi = self.by_label.partition_point(|s| s.label.as_str() <= label);
        &self.by_label[lo..hi]
    }

    /// All symbols whose label starts with `prefix`
    pub fn with_label_prefix(&self, prefix: &str) -> &[Symbol] {
        let lo = self
            .by_label
            .partition_point(|s| s.label.as_str() < prefix);
        let hi = self.by_label[lo..]
            .partition_point(|s| s.label.starts_with(prefix))
            + lo;
        &self.by_label[lo..hi]
    }

    /// Resolves a textual reference
    ///
    /// A 16-bit hex number resolves to a synthetic unlabelled symbol; a
    /// trailing `*` selects every label with the prefix; anything else is
    /// an exact label lookup.
    pub fn resolve(&self, text: &str) -> Vec<Symbol> {
        if let Ok(addr) = u16::from_str_radix(text, 16) {
            return vec![Symbol {
                addr,
                label: String::new(),
            }];
        }
        if let Some(prefix) = text.strip_suffix('*') {
            return self.with_label_prefix(prefix).to_vec();
        }
        self.with_label(text).to_vec()
    }
}
