//! Vocabulary and Token Id Mapping
//!
//! # Overview
//!
//! Loads the textual vocabulary format and maps between token strings and
//! integer ids. The id contract is what the rest of the engine depends on;
//! the text surface here is deliberately small.
//!
//! # File Format
//!
//! UTF-8 lines of `TOKEN FREQUENCY`. Blank lines and lines starting with
//! `#` are ignored. Ids are assigned by insertion order after the four
//! reserved entries:
//!
//! ```text
//! id 0  <unk>   unknown token
//! id 1  <bos>   beginning of sequence
//! id 2  <eos>   end of sequence
//! id 3  <pad>   padding
//! ```
//!
//! # Encoding
//!
//! Greedy longest-match within whitespace-separated words; characters no
//! vocabulary entry covers produce `<unk>`.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use crate::errors::{EngineError, EngineResult};

/// Reserved token ids
pub const UNK_ID: u32 = 0;
pub const BOS_ID: u32 = 1;
pub const EOS_ID: u32 = 2;
pub const PAD_ID: u32 = 3;

const RESERVED: [&str; 4] = ["<unk>", "<bos>", "<eos>", "<pad>"];

/// Token vocabulary
#[derive(Debug)]
pub struct Vocabulary {
    tokens: Vec<String>,
    index: HashMap<String, u32>,
    /// Longest token length in bytes, bounds the greedy matcher
    max_token_len: usize,
}

impl Vocabulary {
    /// Empty vocabulary holding only the reserved entries
    pub fn new() -> Self {
        let mut vocab = Self {
            tokens: Vec::new(),
            index: HashMap::new(),
            max_token_len: 0,
        };
        for tok in RESERVED {
            vocab.insert(tok);
        }
        vocab
    }

    /// Load from a vocabulary file
    pub fn load_file(path: &Path) -> EngineResult<Self> {
        let file = std::fs::File::open(path)?;
        Self::load(BufReader::new(file))
    }

    /// Load from any reader
    pub fn load<R: Read>(reader: R) -> EngineResult<Self> {
        let mut vocab = Self::new();
        let reader = BufReader::new(reader);

        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }

            let mut parts = trimmed.split_whitespace();
            let token = parts.next().expect("non-empty after trim");
            let freq = parts.next().ok_or_else(|| EngineError::SchemaMismatch {
                context: format!("vocabulary line {}: missing frequency", line_no + 1),
            })?;
            freq.parse::<u64>()
                .map_err(|_| EngineError::SchemaMismatch {
                    context: format!("vocabulary line {}: frequency '{}'", line_no + 1, freq),
                })?;

            if !vocab.index.contains_key(token) {
                vocab.insert(token);
            }
        }

        tracing::info!(tokens = vocab.len(), "vocabulary loaded");
        Ok(vocab)
    }

    fn insert(&mut self, token: &str) {
        let id = self.tokens.len() as u32;
        self.tokens.push(token.to_string());
        self.index.insert(token.to_string(), id);
        self.max_token_len = self.max_token_len.max(token.len());
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        false // reserved entries are always present
    }

    /// Id of a token string
    pub fn token_id(&self, token: &str) -> Option<u32> {
        self.index.get(token).copied()
    }

    /// Token string for an id
    pub fn token(&self, id: u32) -> Option<&str> {
        self.tokens.get(id as usize).map(|s| s.as_str())
    }

    /// Greedy longest-match encoding
    pub fn encode(&self, text: &str) -> Vec<u32> {
        let mut ids = Vec::new();
        for word in text.split_whitespace() {
            let mut pos = 0;
            while pos < word.len() {
                let rest = &word[pos..];
                let limit = rest.len().min(self.max_token_len);
                let mut matched = None;
                for end in (1..=limit).rev() {
                    if !rest.is_char_boundary(end) {
                        continue;
                    }
                    if let Some(&id) = self.index.get(&rest[..end]) {
                        matched = Some((id, end));
                        break;
                    }
                }
                match matched {
                    Some((id, end)) => {
                        ids.push(id);
                        pos += end;
                    }
                    None => {
                        ids.push(UNK_ID);
                        pos += rest.chars().next().map(|c| c.len_utf8()).unwrap_or(1);
                    }
                }
            }
        }
        ids
    }

    /// Decode ids back to text
    ///
    /// Reserved control ids decode to nothing; unknown ids render as the
    /// unknown marker.
    pub fn decode(&self, ids: &[u32]) -> String {
        let mut out = String::new();
        for &id in ids {
            match id {
                BOS_ID | EOS_ID | PAD_ID => {}
                _ => match self.tokens.get(id as usize) {
                    Some(tok) => out.push_str(tok),
                    None => out.push_str(&self.tokens[UNK_ID as usize]),
                },
            }
        }
        out
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new()
    }
}
