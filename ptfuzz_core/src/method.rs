//! Mutation methods and their yields.
use std::fmt;

/// Technique that produced a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum MethodKind {
    Unknown = 0,
    Redqueen,
    Se,
    Bitflip8,
    Bitflip16,
    Bitflip32,
    Arith8,
    Arith16,
    Arith32,
    Interesting8,
    Interesting16,
    Interesting32,
    Havoc,
    Splicing,
    Radamsa,
    Import,
    DictBf,
}

pub const METHOD_KINDS: [MethodKind; 17] = [
    MethodKind::Unknown,
    MethodKind::Redqueen,
    MethodKind::Se,
    MethodKind::Bitflip8,
    MethodKind::Bitflip16,
    MethodKind::Bitflip32,
    MethodKind::Arith8,
    MethodKind::Arith16,
    MethodKind::Arith32,
    MethodKind::Interesting8,
    MethodKind::Interesting16,
    MethodKind::Interesting32,
    MethodKind::Havoc,
    MethodKind::Splicing,
    MethodKind::Radamsa,
    MethodKind::Import,
    MethodKind::DictBf,
];

impl MethodKind {
    pub fn name(self) -> &'static str {
        match self {
            MethodKind::Unknown => "unknown",
            MethodKind::Redqueen => "redqueen",
            MethodKind::Se => "se",
            MethodKind::Bitflip8 => "bitflip 8",
            MethodKind::Bitflip16 => "bitflip 16",
            MethodKind::Bitflip32 => "bitflip 32",
            MethodKind::Arith8 => "arith 8",
            MethodKind::Arith16 => "arith 16",
            MethodKind::Arith32 => "arith 32",
            MethodKind::Interesting8 => "interesting 8",
            MethodKind::Interesting16 => "interesting 16",
            MethodKind::Interesting32 => "interesting 32",
            MethodKind::Havoc => "havoc",
            MethodKind::Splicing => "splicing",
            MethodKind::Radamsa => "radamsa",
            MethodKind::Import => "import",
            MethodKind::DictBf => "dict-bf",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        METHOD_KINDS.iter().copied().find(|k| k.name() == name)
    }
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Default for MethodKind {
    fn default() -> Self {
        MethodKind::Unknown
    }
}

/// Metadata of the mutation that produced one candidate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FuzzMethod {
    pub kind: MethodKind,
    /// Compare instructions a redqueen candidate was derived from, as hex addresses.
    pub redqueen_cmp: Vec<String>,
    /// Input offsets touched by the mutation.
    pub input_byte: Vec<usize>,
}

impl FuzzMethod {
    pub fn new(kind: MethodKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }
}

impl From<MethodKind> for FuzzMethod {
    fn from(kind: MethodKind) -> Self {
        Self::new(kind)
    }
}

/// Number of accepted nodes per method.
#[derive(Debug, Clone, Default)]
pub struct Yields {
    counts: [u64; METHOD_KINDS.len()],
}

impl Yields {
    #[inline]
    pub fn add(&mut self, kind: MethodKind) {
        self.counts[kind as usize] += 1;
    }

    #[inline]
    pub fn get(&self, kind: MethodKind) -> u64 {
        self.counts[kind as usize]
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }

    /// One line per method, names padded to the same width.
    pub fn report(&self) -> String {
        let width = METHOD_KINDS
            .iter()
            .map(|k| k.name().len())
            .max()
            .unwrap_or(0);
        let mut out = String::new();
        for k in METHOD_KINDS.iter() {
            out += &format!("{:<width$}: {}\n", k.name(), self.get(*k), width = width);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_round_trip() {
        for k in METHOD_KINDS.iter() {
            assert_eq!(MethodKind::from_name(k.name()), Some(*k));
        }
    }

    #[test]
    fn yields_report() {
        let mut y = Yields::default();
        y.add(MethodKind::Havoc);
        y.add(MethodKind::Havoc);
        y.add(MethodKind::Redqueen);
        assert_eq!(y.total(), 3);
        let report = y.report();
        assert_eq!(report.lines().count(), METHOD_KINDS.len());
        assert!(report.lines().any(|l| l.starts_with("havoc") && l.ends_with(": 2")));
    }
}
