//! Handshake challenge decoding and solving
//!
//! The challenge header is base64 text holding an object literal in a relaxed
//! JavaScript notation: bare keys, single-quoted strings and trailing commas
//! are all accepted. It is normalized to JSON and parsed as data.

use crate::error::AuthError;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Decoded challenge
#[derive(Debug, Clone, PartialEq)]
pub struct Challenge {
    pub server_hashes: Vec<String>,
    /// Raw strings, hashed locally before being sent back
    pub client_hashes: Vec<String>,
    /// Opaque value echoed back as `signals`
    pub signal: Value,
}

#[derive(Serialize)]
struct Solution<'a> {
    server_hashes: &'a [String],
    client_hashes: Vec<String>,
    signals: &'a Value,
}

impl Challenge {
    /// Decode a raw `x-vqd-hash-1` header value
    pub fn decode(header: &str) -> Result<Self, AuthError> {
        let header = header.trim();
        let bytes = STANDARD
            .decode(header)
            .or_else(|_| STANDARD_NO_PAD.decode(header.trim_end_matches('=')))
            .map_err(|e| AuthError::MalformedChallenge(format!("invalid base64: {}", e)))?;
        let text = String::from_utf8(bytes)
            .map_err(|_| AuthError::MalformedChallenge("payload is not UTF-8".to_string()))?;
        Self::parse(&text)
    }

    /// Parse the decoded payload text, taking the first object literal that
    /// carries a hash array
    pub fn parse(text: &str) -> Result<Self, AuthError> {
        let value = text
            .match_indices('{')
            .filter_map(|(start, _)| balanced_object(&text[start..]))
            .filter_map(|literal| serde_json::from_str::<Value>(&normalize_literal(literal)).ok())
            .find(|v| v.get("server_hashes").is_some() || v.get("client_hashes").is_some())
            .ok_or_else(|| {
                AuthError::MalformedChallenge("no challenge object found".to_string())
            })?;

        let server_hashes = string_array(&value, "server_hashes")?;
        let client_hashes = string_array(&value, "client_hashes")?;
        let signal = value
            .get("signal")
            .or_else(|| value.get("signals"))
            .cloned()
            .unwrap_or_else(|| Value::Object(Default::default()));

        Ok(Self {
            server_hashes,
            client_hashes,
            signal,
        })
    }

    /// base64(SHA-256) of each client hash, in order
    pub fn client_digests(&self) -> Vec<String> {
        self.client_hashes
            .iter()
            .map(|raw| STANDARD.encode(Sha256::digest(raw.as_bytes())))
            .collect()
    }

    /// The `x-vqd-hash-1` value to send with the chat call
    pub fn solve(&self) -> String {
        let solution = Solution {
            server_hashes: &self.server_hashes,
            client_hashes: self.client_digests(),
            signals: &self.signal,
        };
        // serializing strings and an already-parsed Value cannot fail
        let json = serde_json::to_vec(&solution).unwrap_or_default();
        STANDARD.encode(json)
    }
}

fn string_array(value: &Value, key: &'static str) -> Result<Vec<String>, AuthError> {
    let items = value
        .get(key)
        .and_then(Value::as_array)
        .ok_or_else(|| AuthError::MalformedChallenge(format!("'{}' is not an array", key)))?;

    items
        .iter()
        .map(|item| match item {
            Value::String(s) => Ok(s.clone()),
            Value::Number(n) => Ok(n.to_string()),
            _ => Err(AuthError::MalformedChallenge(format!(
                "'{}' holds a non-string entry",
                key
            ))),
        })
        .collect()
}

/// The balanced `{...}` span opening at the start of `text`, skipping
/// braces inside quotes
fn balanced_object(text: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut quote: Option<char> = None;
    let mut escaped = false;

    for (offset, c) in text.char_indices() {
        if let Some(q) = quote {
            if escaped {
                escaped = false;
            } else if c == '\\' {
                escaped = true;
            } else if c == q {
                quote = None;
            }
            continue;
        }
        match c {
            '"' | '\'' | '`' => quote = Some(c),
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[..offset + c.len_utf8()]);
                }
            }
            _ => {}
        }
    }
    None
}

/// Rewrite a relaxed object literal as JSON
fn normalize_literal(literal: &str) -> String {
    let chars: Vec<char> = literal.chars().collect();
    let mut out = String::with_capacity(literal.len() + 16);
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            '"' => {
                let end = copy_double_quoted(&chars, i, &mut out);
                i = end;
            }
            '\'' | '`' => {
                let end = convert_quoted(&chars, i, c, &mut out);
                i = end;
            }
            ',' => {
                let next = next_significant(&chars, i + 1);
                if !matches!(next, Some('}') | Some(']')) {
                    out.push(',');
                }
                i += 1;
            }
            c if c.is_alphabetic() || c == '_' || c == '$' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '$')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().collect();
                if next_significant(&chars, i) == Some(':') {
                    out.push('"');
                    out.push_str(&ident);
                    out.push('"');
                } else {
                    out.push_str(&ident);
                }
            }
            _ => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn copy_double_quoted(chars: &[char], start: usize, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        out.push(c);
        i += 1;
        if c == '\\' && i < chars.len() {
            out.push(chars[i]);
            i += 1;
        } else if c == '"' {
            break;
        }
    }
    i
}

fn convert_quoted(chars: &[char], start: usize, quote: char, out: &mut String) -> usize {
    out.push('"');
    let mut i = start + 1;
    while i < chars.len() {
        let c = chars[i];
        i += 1;
        match c {
            '\\' if i < chars.len() => {
                let escaped = chars[i];
                i += 1;
                if escaped == quote {
                    out.push(escaped);
                } else {
                    out.push('\\');
                    out.push(escaped);
                }
            }
            '"' => out.push_str("\\\""),
            c if c == quote => break,
            c => out.push(c),
        }
    }
    out.push('"');
    i
}

fn next_significant(chars: &[char], from: usize) -> Option<char> {
    chars[from.min(chars.len())..]
        .iter()
        .copied()
        .find(|c| !c.is_whitespace())
}
