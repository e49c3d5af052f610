use crate::error::{DebugError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where the program under debug comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProgramSource {
    /// A single fixed program, given as hex.
    Inline { bytecode: String },
    /// A hex file.
    File { path: PathBuf },
    /// A directory of compiled `*.hex` samples.
    Directory {
        path: PathBuf,
        #[serde(default)]
        sample: Option<String>,
    },
}

impl ProgramSource {
    pub fn load(&self) -> Result<Vec<u8>> {
        match self {
            ProgramSource::Inline { bytecode } => parse_hex(bytecode),
            ProgramSource::File { path } => read_hex_file(path),
            ProgramSource::Directory { path, sample } => {
                let samples = list_samples(path)?;
                let chosen = match sample {
                    Some(name) => samples
                        .iter()
                        .find(|p| p.file_stem().and_then(|s| s.to_str()) == Some(name.as_str()))
                        .ok_or_else(|| {
                            DebugError::Config(format!(
                                "sample '{}' not found in {}",
                                name,
                                path.display()
                            ))
                        })?,
                    None => samples.first().ok_or_else(|| {
                        DebugError::Config(format!("no .hex samples in {}", path.display()))
                    })?,
                };
                info!(sample = %chosen.display(), "loading sample");
                read_hex_file(chosen)
            }
        }
    }

    /// Samples available from this source (one entry for the single-program forms).
    pub fn list(&self) -> Result<Vec<String>> {
        match self {
            ProgramSource::Inline { .. } => Ok(vec!["<inline>".to_string()]),
            ProgramSource::File { path } => Ok(vec![path.display().to_string()]),
            ProgramSource::Directory { path, .. } => Ok(list_samples(path)?
                .iter()
                .filter_map(|p| p.file_stem().and_then(|s| s.to_str()).map(str::to_string))
                .collect()),
        }
    }
}

fn list_samples(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut samples = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|e| e.to_str()) == Some("hex") {
            samples.push(path);
        }
    }
    samples.sort();
    debug!(dir = %dir.display(), count = samples.len(), "listed samples");
    Ok(samples)
}

fn read_hex_file(path: &Path) -> Result<Vec<u8>> {
    let text = fs::read_to_string(path)?;
    parse_hex(&text)
}

/// Decode hex text. Accepts an optional `0x` prefix and ignores whitespace.
pub fn parse_hex(text: &str) -> Result<Vec<u8>> {
    let trimmed = text.trim();
    let body = trimmed
        .strip_prefix("0x")
        .or_else(|| trimmed.strip_prefix("0X"))
        .unwrap_or(trimmed);
    let digits: Vec<u8> = body
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();

    if digits.len() % 2 != 0 {
        return Err(DebugError::InvalidHex(format!(
            "odd number of digits ({})",
            digits.len()
        )));
    }

    digits
        .chunks(2)
        .map(|pair| {
            let hi = hex_value(pair[0])?;
            let lo = hex_value(pair[1])?;
            Ok((hi << 4) | lo)
        })
        .collect()
}

fn hex_value(digit: u8) -> Result<u8> {
    match digit {
        b'0'..=b'9' => Ok(digit - b'0'),
        b'a'..=b'f' => Ok(digit - b'a' + 10),
        b'A'..=b'F' => Ok(digit - b'A' + 10),
        _ => Err(DebugError::InvalidHex(format!(
            "unexpected character '{}'",
            digit as char
        ))),
    }
}

/// Address written as decimal or `0x` hex.
pub fn parse_address(text: &str) -> Result<usize> {
    let t = text.trim();
    let parsed = match t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16),
        None => t.parse(),
    };
    parsed.map_err(|_| DebugError::InvalidHex(format!("bad address '{}'", t)))
}

pub fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{:02x}", b));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_hex_variants() {
        assert_eq!(parse_hex("0x6005").ok(), Some(vec![0x60, 0x05]));
        assert_eq!(parse_hex("60 05\n").ok(), Some(vec![0x60, 0x05]));
        assert_eq!(parse_hex("").ok(), Some(vec![]));
        assert!(parse_hex("600").is_err());
        assert!(parse_hex("zz").is_err());
    }

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x1a").ok(), Some(26));
        assert_eq!(parse_address("26").ok(), Some(26));
        assert!(parse_address("label").is_err());
    }

    #[test]
    fn test_to_hex() {
        assert_eq!(to_hex(&[0x00, 0xab]), "0x00ab");
    }

    #[test]
    fn test_directory_source_picks_sample() {
        let dir = std::env::temp_dir().join(format!("evm-debugger-samples-{}", std::process::id()));
        let _ = fs::create_dir_all(&dir);
        fs::write(dir.join("b.sol.hex"), "6001").expect("write sample");
        fs::write(dir.join("a.sol.hex"), "6002").expect("write sample");
        fs::write(dir.join("notes.txt"), "ignored").expect("write note");

        let first = ProgramSource::Directory {
            path: dir.clone(),
            sample: None,
        };
        assert_eq!(first.load().ok(), Some(vec![0x60, 0x02]));
        assert_eq!(
            first.list().ok(),
            Some(vec!["a.sol".to_string(), "b.sol".to_string()])
        );

        let named = ProgramSource::Directory {
            path: dir.clone(),
            sample: Some("b.sol".to_string()),
        };
        assert_eq!(named.load().ok(), Some(vec![0x60, 0x01]));

        let missing = ProgramSource::Directory {
            path: dir.clone(),
            sample: Some("nope".to_string()),
        };
        assert!(matches!(missing.load(), Err(DebugError::Config(_))));

        let _ = fs::remove_dir_all(&dir);
    }
}
