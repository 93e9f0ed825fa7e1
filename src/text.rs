//! Text key=value buffers used by login negotiation and Text requests
//!
//! Wire form is `key=value\0` repeated (RFC 3720 Section 5.1). Keys are kept in
//! insertion order; lookups see the first occurrence of a key only.

use crate::error::{IscsiError, ScsiResult};

/// Ordered list of text parameters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    lines: Vec<(String, String)>,
}

impl TextBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode a text data segment
    pub fn parse(data: &[u8]) -> ScsiResult<Self> {
        Ok(TextBuffer {
            lines: parse_text_parameters(data)?,
        })
    }

    /// Append a pair, even if the key is already present
    pub fn add(&mut self, key: &str, value: &str) {
        self.lines.push((key.to_string(), value.to_string()));
    }

    /// Value of the first pair with this key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Update the first pair with this key in place, or append a new one
    pub fn set(&mut self, key: &str, value: &str) {
        match self.lines.iter_mut().find(|(k, _)| k == key) {
            Some((_, v)) => *v = value.to_string(),
            None => self.add(key, value),
        }
    }

    /// Drop every pair with this key
    pub fn remove(&mut self, key: &str) {
        self.lines.retain(|(k, _)| k != key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn lines(&self) -> impl Iterator<Item = (&str, &str)> {
        self.lines.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Encoded size in bytes (unpadded)
    pub fn size(&self) -> usize {
        self.lines.iter().map(|(k, v)| k.len() + v.len() + 2).sum()
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serialize_text_parameters(&self.lines)
    }
}

/// Parse iSCSI text parameters (null-terminated key=value pairs)
///
/// Empty records (padding NULs) are skipped. A record without `=` is malformed.
pub fn parse_text_parameters(data: &[u8]) -> ScsiResult<Vec<(String, String)>> {
    let mut params = Vec::new();

    let mut pos = 0;
    while pos < data.len() {
        if data[pos] == 0 {
            pos += 1;
            continue;
        }

        let record = &data[pos..];
        let record_end = record.iter().position(|&b| b == 0).unwrap_or(record.len());
        let eq_pos = record[..record_end]
            .iter()
            .position(|&b| b == b'=')
            .ok_or_else(|| {
                IscsiError::Protocol(format!(
                    "Malformed text parameter (missing '='): {:?}",
                    String::from_utf8_lossy(&record[..record_end])
                ))
            })?;

        let key = String::from_utf8_lossy(&record[..eq_pos]).into_owned();
        let value = String::from_utf8_lossy(&record[eq_pos + 1..record_end]).into_owned();
        params.push((key, value));

        pos += record_end + 1;
    }

    Ok(params)
}

/// Serialize text parameters to null-terminated format
pub fn serialize_text_parameters(params: &[(String, String)]) -> Vec<u8> {
    let mut data = Vec::new();
    for (key, value) in params {
        data.extend_from_slice(key.as_bytes());
        data.push(b'=');
        data.extend_from_slice(value.as_bytes());
        data.push(0);
    }
    data
}
