//! Vocabulary table and the greedy tokenizer built on it.
//!
//! Text is split into words with the GPT-2 pre-tokenization classes, then each word's
//! bytes are matched greedily against the vocabulary, longest prefix first.

use std::collections::HashMap;
use tracing::warn;

pub type TokenId = u32;

/// Text of the end-of-text marker in GPT-2 style vocabularies.
pub const END_OF_TEXT: &str = "<|endoftext|>";

#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
    id_to_token: Vec<Vec<u8>>,
    token_to_id: HashMap<Vec<u8>, TokenId>,
    max_token_len: usize,
}

impl Vocabulary {
    /// Ids are assigned by position. A repeated entry resolves to its last id.
    pub fn from_tokens(tokens: Vec<Vec<u8>>) -> Self {
        let mut token_to_id = HashMap::with_capacity(tokens.len());
        let mut max_token_len = 0;
        for (id, token) in tokens.iter().enumerate() {
            max_token_len = max_token_len.max(token.len());
            token_to_id.insert(token.clone(), id as TokenId);
        }
        Self {
            id_to_token: tokens,
            token_to_id,
            max_token_len,
        }
    }

    pub fn len(&self) -> usize {
        self.id_to_token.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_token.is_empty()
    }

    pub fn token(&self, id: TokenId) -> Option<&[u8]> {
        self.id_to_token.get(id as usize).map(Vec::as_slice)
    }

    pub fn id(&self, token: &[u8]) -> Option<TokenId> {
        self.token_to_id.get(token).copied()
    }

    pub fn tokens(&self) -> impl Iterator<Item = &[u8]> {
        self.id_to_token.iter().map(Vec::as_slice)
    }

    pub fn tokenize(&self, text: &str) -> Vec<TokenId> {
        let mut ids = Vec::new();
        for word in split_words(text) {
            let bytes = word.as_bytes();
            let mut start = 0;
            while start < bytes.len() {
                let longest = (start + self.max_token_len).min(bytes.len());
                let matched = (start + 1..=longest)
                    .rev()
                    .find_map(|end| self.id(&bytes[start..end]).map(|id| (id, end)));
                match matched {
                    Some((id, end)) => {
                        ids.push(id);
                        start = end;
                    }
                    None => {
                        warn!(word, byte = start, "no vocabulary entry, skipping byte");
                        start += 1;
                    }
                }
            }
        }
        ids
    }

    /// Concatenated token bytes. Ids beyond the table contribute nothing.
    pub fn decode_bytes(&self, ids: &[TokenId]) -> Vec<u8> {
        ids.iter()
            .filter_map(|&id| self.token(id))
            .flatten()
            .copied()
            .collect()
    }

    pub fn decode(&self, ids: &[TokenId]) -> String {
        String::from_utf8_lossy(&self.decode_bytes(ids)).into_owned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Letter,
    Digit,
    Space,
    Other,
}

impl CharClass {
    fn of(c: char) -> Self {
        if c.is_alphabetic() {
            CharClass::Letter
        } else if c.is_numeric() {
            CharClass::Digit
        } else if c.is_whitespace() {
            CharClass::Space
        } else {
            CharClass::Other
        }
    }
}

const CONTRACTIONS: [&str; 7] = ["'s", "'t", "'re", "'ve", "'m", "'ll", "'d"];

fn split_words(text: &str) -> Vec<&str> {
    let mut words = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let len = next_word_len(rest);
        words.push(&rest[..len]);
        rest = &rest[len..];
    }
    words
}

/// Byte length of the word at the head of a non-empty `text`.
fn next_word_len(text: &str) -> usize {
    if let Some(contraction) = CONTRACTIONS.iter().find(|c| text.starts_with(**c)) {
        return contraction.len();
    }

    let mut chars = text.chars();
    let Some(first) = chars.next() else {
        return 0;
    };

    // A single space glues onto the following non-space run.
    let (start, lead) = match (first, chars.next()) {
        (' ', Some(next)) if !next.is_whitespace() => (1, next),
        _ => (0, first),
    };

    if CharClass::of(lead) == CharClass::Space {
        let run = text
            .char_indices()
            .find(|(_, c)| !c.is_whitespace())
            .map_or(text.len(), |(idx, _)| idx);
        if run == text.len() {
            return run;
        }
        // Leave the last whitespace character to the word that follows.
        let last = text[..run].chars().next_back().map_or(0, char::len_utf8);
        return if run > last { run - last } else { run };
    }

    let class = CharClass::of(lead);
    let body: usize = text[start..]
        .chars()
        .take_while(|c| CharClass::of(*c) == class)
        .map(char::len_utf8)
        .sum();
    start + body
}
