// src/io/codec.rs
//
// Payload codec: conversion between user text and raw bytes for the six
// supported display/send encodings, plus line-ending byte sequences.
//
// Encoding is fallible (malformed user input is rejected with a CodecError
// naming the offending token). Decoding is total: every byte sequence has a
// rendering in every encoding, so the message log is always displayable.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::error::CodecError;

// ============================================================================
// Types
// ============================================================================

/// Text <-> bytes encoding used for sending and displaying payloads
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    Hex,
    Binary,
    Ascii,
    Decimal,
    Utf8,
    Base64,
}

impl Default for Encoding {
    fn default() -> Self {
        Encoding::Ascii
    }
}

impl Encoding {
    pub const ALL: [Encoding; 6] = [
        Encoding::Hex,
        Encoding::Binary,
        Encoding::Ascii,
        Encoding::Decimal,
        Encoding::Utf8,
        Encoding::Base64,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Hex => "hex",
            Encoding::Binary => "binary",
            Encoding::Ascii => "ascii",
            Encoding::Decimal => "decimal",
            Encoding::Utf8 => "utf8",
            Encoding::Base64 => "base64",
        }
    }
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hex" => Ok(Encoding::Hex),
            "binary" | "bin" => Ok(Encoding::Binary),
            "ascii" => Ok(Encoding::Ascii),
            "decimal" | "dec" => Ok(Encoding::Decimal),
            "utf8" | "utf-8" => Ok(Encoding::Utf8),
            "base64" => Ok(Encoding::Base64),
            _ => Err(format!("Unknown encoding: {}", s)),
        }
    }
}

/// Line ending appended to outgoing data
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineEnding {
    None,
    Cr,
    Lf,
    Crlf,
    Custom,
}

impl Default for LineEnding {
    fn default() -> Self {
        LineEnding::None
    }
}

impl FromStr for LineEnding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(LineEnding::None),
            "cr" => Ok(LineEnding::Cr),
            "lf" => Ok(LineEnding::Lf),
            "crlf" => Ok(LineEnding::Crlf),
            "custom" => Ok(LineEnding::Custom),
            _ => Err(format!("Unknown line ending: {}", s)),
        }
    }
}

/// Result of encoding user text
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EncodedPayload {
    pub bytes: Vec<u8>,
    /// Canonical display form of `bytes` in the requested encoding
    pub rendered_text: String,
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode user text into bytes using the given encoding.
pub fn encode(text: &str, encoding: Encoding) -> Result<EncodedPayload, CodecError> {
    let bytes = match encoding {
        Encoding::Hex => encode_hex(text)?,
        Encoding::Binary => encode_binary(text)?,
        Encoding::Decimal => encode_decimal(text)?,
        Encoding::Base64 => encode_base64(text)?,
        Encoding::Ascii => encode_ascii(text),
        Encoding::Utf8 => text.as_bytes().to_vec(),
    };

    let rendered_text = match encoding {
        Encoding::Ascii | Encoding::Utf8 => text.to_string(),
        _ => decode(&bytes, encoding),
    };

    Ok(EncodedPayload {
        bytes,
        rendered_text,
    })
}

/// Split on whitespace and commas, dropping empty tokens
fn tokens(text: &str) -> Vec<&str> {
    text.split(|c: char| c.is_whitespace() || c == ',')
        .filter(|t| !t.is_empty())
        .collect()
}

fn strip_prefix_ci<'a>(token: &'a str, prefix: &str) -> Option<&'a str> {
    match token.get(..prefix.len()) {
        Some(head) if head.eq_ignore_ascii_case(prefix) => Some(&token[prefix.len()..]),
        _ => None,
    }
}

fn encode_hex(text: &str) -> Result<Vec<u8>, CodecError> {
    let tokens = tokens(text);
    if tokens.is_empty() {
        return Err(CodecError::new("No hex bytes found"));
    }

    let prefixed = tokens.iter().any(|t| strip_prefix_ci(t, "0x").is_some());
    if prefixed {
        let mut bytes = Vec::new();
        for token in tokens {
            let digits = strip_prefix_ci(token, "0x")
                .ok_or_else(|| CodecError::token(token, "Expected a 0x-prefixed hex value"))?;
            if digits.is_empty() || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
                return Err(CodecError::token(token, "Invalid hex value"));
            }
            let padded = if digits.len() % 2 == 1 {
                format!("0{}", digits)
            } else {
                digits.to_string()
            };
            let decoded =
                hex::decode(&padded).map_err(|e| CodecError::token(token, e.to_string()))?;
            bytes.extend(decoded);
        }
        return Ok(bytes);
    }

    let cleaned: String = tokens.concat();
    if let Some(bad) = cleaned.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(CodecError::token(&bad.to_string(), "Invalid hex character"));
    }
    if cleaned.len() % 2 != 0 {
        return Err(CodecError::new(
            "Hex input must have an even number of digits",
        ));
    }
    hex::decode(&cleaned).map_err(|e| CodecError::new(e.to_string()))
}

fn bits_to_bytes(bits: &str, token: &str) -> Result<Vec<u8>, CodecError> {
    bits.as_bytes()
        .chunks(8)
        .map(|chunk| {
            // chunk is ASCII '0'/'1' only, checked by callers
            let s = std::str::from_utf8(chunk).unwrap_or_default();
            u8::from_str_radix(s, 2).map_err(|_| CodecError::token(token, "Invalid binary value"))
        })
        .collect()
}

fn encode_binary(text: &str) -> Result<Vec<u8>, CodecError> {
    let tokens = tokens(text);
    if tokens.is_empty() {
        return Err(CodecError::new("No binary bytes found"));
    }

    let prefixed = tokens.iter().any(|t| strip_prefix_ci(t, "0b").is_some());
    if prefixed {
        let mut bytes = Vec::new();
        for token in tokens {
            let bits = strip_prefix_ci(token, "0b")
                .ok_or_else(|| CodecError::token(token, "Expected a 0b-prefixed binary value"))?;
            if bits.is_empty() || !bits.chars().all(|c| c == '0' || c == '1') {
                return Err(CodecError::token(token, "Invalid binary value"));
            }
            // Right-pad to whole bytes
            let width = (bits.len() + 7) / 8 * 8;
            let padded = format!("{:0<width$}", bits, width = width);
            bytes.extend(bits_to_bytes(&padded, token)?);
        }
        return Ok(bytes);
    }

    let cleaned: String = tokens.concat();
    if let Some(bad) = cleaned.chars().find(|c| *c != '0' && *c != '1') {
        return Err(CodecError::token(&bad.to_string(), "Invalid binary character"));
    }
    if cleaned.len() % 8 != 0 {
        return Err(CodecError::new(
            "Binary input length must be a multiple of 8 bits",
        ));
    }
    bits_to_bytes(&cleaned, &cleaned)
}

fn encode_decimal(text: &str) -> Result<Vec<u8>, CodecError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.is_empty() {
        return Err(CodecError::new("No decimal values found"));
    }

    tokens
        .into_iter()
        .map(|token| {
            let value: i64 = token
                .parse()
                .map_err(|_| CodecError::token(token, "Invalid decimal value"))?;
            u8::try_from(value)
                .map_err(|_| CodecError::token(token, "Decimal value out of range (0-255)"))
        })
        .collect()
}

fn encode_base64(text: &str) -> Result<Vec<u8>, CodecError> {
    let trimmed = text.trim();
    // Accept data URLs: data:<mime>;base64,<payload>
    let payload = match trimmed.find(";base64,") {
        Some(idx) if trimmed.starts_with("data:") => &trimmed[idx + ";base64,".len()..],
        _ => trimmed,
    };
    let cleaned: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
    if cleaned.is_empty() {
        return Err(CodecError::new("No base64 data found"));
    }
    STANDARD
        .decode(cleaned.as_bytes())
        .map_err(|e| CodecError::new(format!("Invalid base64: {}", e)))
}

/// Non-ASCII characters become '?'
fn encode_ascii(text: &str) -> Vec<u8> {
    text.chars()
        .map(|c| if c.is_ascii() { c as u8 } else { b'?' })
        .collect()
}

// ============================================================================
// Decoding
// ============================================================================

/// Render bytes in the given encoding. Never fails.
pub fn decode(bytes: &[u8], encoding: Encoding) -> String {
    match encoding {
        Encoding::Hex => bytes
            .iter()
            .map(|b| hex::encode_upper([*b]))
            .collect::<Vec<_>>()
            .join(" "),
        Encoding::Binary => bytes
            .iter()
            .map(|b| format!("{:08b}", b))
            .collect::<Vec<_>>()
            .join(" "),
        Encoding::Decimal => bytes
            .iter()
            .map(|b| b.to_string())
            .collect::<Vec<_>>()
            .join(" "),
        Encoding::Ascii => bytes
            .iter()
            .map(|&b| if b.is_ascii() { b as char } else { char::REPLACEMENT_CHARACTER })
            .collect(),
        Encoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
        Encoding::Base64 => STANDARD.encode(bytes),
    }
}

// ============================================================================
// Line Endings
// ============================================================================

/// Bytes for a line ending. `Custom` uses the custom string's UTF-8 bytes;
/// a missing or empty custom string yields no bytes.
pub fn line_ending_bytes(ending: LineEnding, custom: Option<&str>) -> Vec<u8> {
    match ending {
        LineEnding::None => Vec::new(),
        LineEnding::Cr => vec![0x0D],
        LineEnding::Lf => vec![0x0A],
        LineEnding::Crlf => vec![0x0D, 0x0A],
        LineEnding::Custom => custom.map(|s| s.as_bytes().to_vec()).unwrap_or_default(),
    }
}

// ============================================================================
// Tests
// ============================================================================
