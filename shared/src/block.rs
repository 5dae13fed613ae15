use std::io::{self, Write};

use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use serde_json::{ser::Formatter, Value};

use crate::types::PreliminaryHash;

/// Candidate block carried by a mining task.
///
/// `index`, `timestamp`, `data` and `previous_hash` are fixed once the block
/// is built from a task; only [`Block::solve`] touches `hash` and `nonce`.
/// Field order matches the dictionary form the coordinator expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    index: u64,
    timestamp: i64,
    #[serde(default)]
    hash: String,
    previous_hash: String,
    #[serde(default)]
    nonce: u64,
    data: Value,
}

impl Block {
    pub fn new(index: u64, timestamp: i64, data: Value, previous_hash: String, hash: String) -> Self {
        Self {
            index,
            timestamp,
            hash,
            previous_hash,
            nonce: 0,
            data,
        }
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The hash assigned by the task issuer, used to correlate broadcast events.
    pub fn preliminary_hash(&self) -> PreliminaryHash {
        PreliminaryHash(self.hash.clone())
    }

    /// `md5(index ++ timestamp ++ canonical(data) ++ previous_hash)`
    pub fn content_hash(&self) -> String {
        let input = format!(
            "{}{}{}{}",
            self.index,
            self.timestamp,
            canonical_json(&self.data),
            self.previous_hash
        );
        md5_hex(input.as_bytes())
    }

    /// Record a verified solution.
    pub fn solve(&mut self, nonce: u64, hash: String) {
        self.nonce = nonce;
        self.hash = hash;
    }
}

/// `md5(nonce ++ content_hash)` as lowercase hex.
pub fn final_hash(nonce: u64, content_hash: &str) -> String {
    md5_hex(format!("{nonce}{content_hash}").as_bytes())
}

pub fn md5_hex(input: &[u8]) -> String {
    hex::encode(Md5::digest(input))
}

/// Case-sensitive prefix match of `challenge` against the lowercase hex
/// rendering of `digest`, without allocating the hex string.
pub fn digest_matches(digest: &[u8], challenge: &str) -> bool {
    const HEX: &[u8; 16] = b"0123456789abcdef";

    let prefix = challenge.as_bytes();
    if prefix.len() > digest.len() * 2 {
        return false;
    }
    prefix.iter().enumerate().all(|(i, &c)| {
        let byte = digest[i / 2];
        let nibble = if i % 2 == 0 { byte >> 4 } else { byte & 0x0f };
        HEX[nibble as usize] == c
    })
}

/// Compact JSON with keys in received order, numbers in their received text
/// and every character outside printable ASCII written as a `\uXXXX` escape.
/// Peers hash this exact text.
pub fn canonical_json(value: &Value) -> String {
    let mut buf = Vec::new();
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, AsciiFormatter);
    value.serialize(&mut ser).expect("serializing a json value into memory cannot fail");
    String::from_utf8_lossy(&buf).into_owned()
}

struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + Write, {
        for ch in fragment.chars() {
            if (' '..='~').contains(&ch) {
                writer.write_all(&[ch as u8])?;
            } else {
                let mut units = [0u16; 2];
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}
