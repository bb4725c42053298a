//! Dictionary tokens: supplied by the user or discovered by redqueen.
use crate::{HashMap, HashSet, RngType, MAX_PAYLOAD_SIZE};
use rand::prelude::*;
use std::fmt;

/// Address seen with too many distinct values is not bruteforced any more.
pub const MAX_VALUES_PER_ADDR: usize = 32;
/// Dictionary bruteforce only runs on payloads shorter than this.
pub const DICT_BF_MAX_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictError {
    pub line: usize,
    pub reason: &'static str,
}

impl fmt::Display for DictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line {}: {}", self.line, self.reason)
    }
}

impl std::error::Error for DictError {}

#[derive(Debug, Clone, Default)]
pub struct Dictionary {
    tokens: Vec<Vec<u8>>,
    redqueen: HashMap<u64, HashSet<Vec<u8>>>,
}

impl Dictionary {
    /// Parse dictionary in `name="value"` format, `#` starts a comment.
    pub fn parse(content: &str) -> Result<Self, DictError> {
        let mut tokens = Vec::new();
        for (n, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let start = line.find('"').ok_or(DictError {
                line: n + 1,
                reason: "missing opening quote",
            })?;
            if !line.ends_with('"') || line.len() - start < 2 {
                return Err(DictError {
                    line: n + 1,
                    reason: "missing closing quote",
                });
            }
            let token = unescape(&line[start + 1..line.len() - 1]).map_err(|reason| DictError {
                line: n + 1,
                reason,
            })?;
            if !token.is_empty() {
                tokens.push(token);
            }
        }
        Ok(Self {
            tokens,
            redqueen: HashMap::default(),
        })
    }

    #[inline]
    pub fn tokens(&self) -> &[Vec<u8>] {
        &self.tokens
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty() && self.redqueen.is_empty()
    }

    pub fn add_redqueen(&mut self, addr: u64, value: Vec<u8>) {
        if !value.is_empty() {
            self.redqueen.entry(addr).or_default().insert(value);
        }
    }

    pub fn clear_redqueen(&mut self) {
        self.redqueen.clear();
    }

    pub fn redqueen(&self) -> &HashMap<u64, HashSet<Vec<u8>>> {
        &self.redqueen
    }

    /// Pick a token, user tokens and redqueen values are equally likely.
    pub fn choose(&self, rng: &mut RngType) -> Option<&[u8]> {
        let use_redqueen = !self.redqueen.is_empty() && (self.tokens.is_empty() || rng.gen());
        if use_redqueen {
            let values = self.redqueen.values().choose(rng)?;
            values.iter().choose(rng).map(|v| &v[..])
        } else {
            self.tokens.choose(rng).map(|v| &v[..])
        }
    }
}

fn unescape(s: &str) -> Result<Vec<u8>, &'static str> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'\\' {
            out.push(bytes[i]);
            i += 1;
            continue;
        }
        match bytes.get(i + 1) {
            Some(b'\\') => out.push(b'\\'),
            Some(b'"') => out.push(b'"'),
            Some(b'x') => {
                let hex = bytes.get(i + 2..i + 4).ok_or("truncated hex escape")?;
                let hex = std::str::from_utf8(hex).map_err(|_| "bad hex escape")?;
                out.push(u8::from_str_radix(hex, 16).map_err(|_| "bad hex escape")?);
                i += 2;
            }
            _ => return Err("bad escape"),
        }
        i += 2;
    }
    Ok(out)
}

/// Overwrite `data` with `token` at `pos`, growing it if needed.
pub fn apply_token(data: &[u8], token: &[u8], pos: usize) -> Vec<u8> {
    let pos = pos.min(data.len());
    let mut out = Vec::with_capacity(data.len().max(pos + token.len()));
    out.extend_from_slice(&data[..pos]);
    out.extend_from_slice(token);
    if pos + token.len() < data.len() {
        out.extend_from_slice(&data[pos + token.len()..]);
    }
    out.truncate(MAX_PAYLOAD_SIZE);
    out
}

/// Places every redqueen value at every offset, each value only once per address.
#[derive(Debug, Default)]
pub struct DictBruteforce {
    seen: HashMap<u64, HashSet<Vec<u8>>>,
}

impl DictBruteforce {
    /// Run the stage, returns the number of candidates produced.
    pub fn run(&mut self, data: &[u8], dict: &Dictionary, mut emit: impl FnMut(&[u8])) -> u64 {
        let mut n = 0;
        if data.len() >= DICT_BF_MAX_LEN {
            return n;
        }
        for (addr, values) in dict.redqueen() {
            for v in values {
                let seen = self.seen.entry(*addr).or_default();
                if seen.len() > MAX_VALUES_PER_ADDR || seen.contains(v) {
                    continue;
                }
                seen.insert(v.clone());
                for i in 0..data.len() {
                    emit(&apply_token(data, v, i));
                    n += 1;
                }
            }
        }
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{prelude::SmallRng, SeedableRng};

    #[test]
    fn parse_dict() {
        let content = "# comment\nkw1=\"GET\"\n\n\"\\x00\\xffA\"\nq=\"a\\\"b\\\\\"\n";
        let d = Dictionary::parse(content).unwrap();
        assert_eq!(
            d.tokens(),
            &[b"GET".to_vec(), vec![0x00, 0xff, b'A'], b"a\"b\\".to_vec()]
        );
    }

    #[test]
    fn parse_errors() {
        assert_eq!(Dictionary::parse("abc").unwrap_err().line, 1);
        assert!(Dictionary::parse("a=\"\\x4\"").is_err());
        assert!(Dictionary::parse("a=\"x").is_err());
    }

    #[test]
    fn apply() {
        assert_eq!(apply_token(b"abcdef", b"XY", 1), b"aXYdef".to_vec());
        assert_eq!(apply_token(b"abc", b"XYZ", 2), b"abXYZ".to_vec());
        assert_eq!(apply_token(b"", b"XY", 3), b"XY".to_vec());
    }

    #[test]
    fn choose_from_both() {
        let mut rng = SmallRng::from_entropy();
        let mut d = Dictionary::default();
        assert!(d.choose(&mut rng).is_none());
        d.add_redqueen(0x1000, b"magic".to_vec());
        assert_eq!(d.choose(&mut rng), Some(&b"magic"[..]));
    }

    #[test]
    fn bruteforce_once_per_value() {
        let mut d = Dictionary::default();
        d.add_redqueen(0x10, b"ab".to_vec());
        let mut bf = DictBruteforce::default();
        let mut out = Vec::new();
        assert_eq!(bf.run(b"xyz", &d, |c| out.push(c.to_vec())), 3);
        assert_eq!(out[0], b"abz".to_vec());
        assert_eq!(bf.run(b"xyz", &d, |_| ()), 0);
        assert_eq!(bf.run(&[0; DICT_BF_MAX_LEN], &d, |_| ()), 0);
    }
}
