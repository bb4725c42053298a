//! Parse the compare log produced by an instrumented run.
use regex::Regex;
use std::{fmt, str::FromStr};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CmpType {
    Cmp,
    Sub,
    Str,
    Lea,
}

impl FromStr for CmpType {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CMP" => Ok(CmpType::Cmp),
            "SUB" => Ok(CmpType::Sub),
            "STR" => Ok(CmpType::Str),
            "LEA" => Ok(CmpType::Lea),
            _ => Err(()),
        }
    }
}

/// One operand pair observed at a compare instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookLine {
    pub addr: u64,
    pub ty: CmpType,
    /// Operand size in bits.
    pub size: usize,
    pub is_imm: bool,
    pub lhs: Vec<u8>,
    pub rhs: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub line: String,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "malformed compare record: '{}'", self.line)
    }
}

impl std::error::Error for ParseError {}

/// Parser of hook lines, `<addr> <type> <bits> <lhs>-<rhs>[ IMM]`.
pub struct HookParser {
    re: Regex,
}

impl Default for HookParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HookParser {
    pub fn new() -> Self {
        let re = Regex::new(
            r"([a-fA-F0-9]+)\s+(CMP|SUB|STR|LEA)\s+(8|16|32|64|512)\s+([a-fA-F0-9]+)\s*-\s*([a-fA-F0-9]+)\s*(IMM)?",
        )
        .unwrap();
        Self { re }
    }

    pub fn parse_line(&self, line: &str) -> Result<HookLine, ParseError> {
        let err = || ParseError {
            line: line.to_string(),
        };
        let caps = self.re.captures(line).ok_or_else(err)?;
        let addr = u64::from_str_radix(&caps[1], 16).map_err(|_| err())?;
        let ty = caps[2].parse().map_err(|_| err())?;
        let size: usize = caps[3].parse().map_err(|_| err())?;
        let lhs = hex::decode(&caps[4]).map_err(|_| err())?;
        let rhs = hex::decode(&caps[5]).map_err(|_| err())?;
        if lhs.len() != size / 8 || rhs.len() != size / 8 {
            return Err(err());
        }
        Ok(HookLine {
            addr,
            ty,
            size,
            is_imm: caps.get(6).is_some(),
            lhs,
            rhs,
        })
    }

    /// Parse every non-empty line, malformed ones are skipped.
    pub fn parse(&self, content: &str) -> Vec<HookLine> {
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .filter_map(|l| match self.parse_line(l) {
                Ok(h) => Some(h),
                Err(e) => {
                    log::debug!("{}", e);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_cmp() {
        let p = HookParser::new();
        let h = p.parse_line("7fff1234 CMP 32 41424344-deadbeef").unwrap();
        assert_eq!(h.addr, 0x7fff1234);
        assert_eq!(h.ty, CmpType::Cmp);
        assert_eq!(h.size, 32);
        assert!(!h.is_imm);
        assert_eq!(h.lhs, b"ABCD");
        assert_eq!(h.rhs, vec![0xde, 0xad, 0xbe, 0xef]);

        let h = p.parse_line("10 SUB 8 01 - 02 IMM").unwrap();
        assert!(h.is_imm);
        assert_eq!(h.ty, CmpType::Sub);
    }

    #[test]
    fn reject_malformed() {
        let p = HookParser::new();
        assert!(p.parse_line("garbage").is_err());
        // operand length must agree with size
        assert!(p.parse_line("10 CMP 32 01-02").is_err());
        let lines = p.parse("10 CMP 8 01-02\n\nbroken\n20 LEA 16 0102-0304 IMM\n");
        assert_eq!(lines.len(), 2);
    }
}
