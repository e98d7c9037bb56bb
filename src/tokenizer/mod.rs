//! Byte-level BPE tokenizer.
//!
//! Built once from a vocabulary and an ordered merge table, then shared
//! read-only between sessions. Encoding runs three stages:
//!
//! 1. added (special) tokens such as `<|user|>` are cut out verbatim,
//! 2. the remaining text is split with the GPT-2 pre-tokenizer regex,
//! 3. each piece is mapped byte-by-byte to base symbols and merged pairwise,
//!    lowest merge rank first, until no rule applies.
//!
//! Decoding is the inverse byte mapping, concatenated in order.

mod byte_level;

pub use byte_level::bytes_to_unicode;

use std::collections::HashMap;
use std::path::Path;

use aho_corasick::{AhoCorasick, MatchKind};
use fancy_regex::Regex;
use rustc_hash::FxHashMap;
use serde::Deserialize;
use thiserror::Error;

/// Token identifier. Dense in `[0, vocab_size)`.
pub type TokenId = u32;

/// Merge priority. Position in the merge table, lower merges first.
type Rank = u32;

/// The GPT-2 byte-level pre-tokenizer pattern.
const GPT2_PATTERN: &str =
    r"'s|'t|'re|'ve|'m|'ll|'d| ?\p{L}+| ?\p{N}+| ?[^\s\p{L}\p{N}]+|\s+(?!\S)|\s+";

/// Errors from building or running the tokenizer.
#[derive(Debug, Error)]
pub enum TokenizerError {
    #[error("malformed vocabulary: {0}")]
    MalformedVocabulary(String),

    #[error("unknown token id: {0}")]
    UnknownToken(TokenId),

    #[error("byte 0x{0:02X} has no base symbol in the vocabulary")]
    UnrepresentableByte(u8),

    #[error("pre-tokenizer split failed: {0}")]
    Split(String),

    #[error("failed to read tokenizer config: {0}")]
    Io(#[from] std::io::Error),
}

/// A special token matched verbatim before BPE runs.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AddedToken {
    pub id: TokenId,
    pub content: String,
}

// ---------------------------------------------------------------------------
// tokenizer.json schema
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
struct TokenizerJson {
    #[serde(default)]
    model: Option<ModelJson>,
    #[serde(default)]
    added_tokens: Vec<AddedToken>,
}

#[derive(Deserialize)]
struct ModelJson {
    #[serde(default)]
    vocab: Option<HashMap<String, TokenId>>,
    #[serde(default)]
    merges: Option<Vec<MergeJson>>,
}

/// Merge rules come either as `"a b"` or as `["a", "b"]`.
#[derive(Deserialize)]
#[serde(untagged)]
enum MergeJson {
    Joined(String),
    Pair(String, String),
}

impl MergeJson {
    fn into_pair(self, rank: usize) -> Result<(String, String), TokenizerError> {
        match self {
            MergeJson::Pair(a, b) => Ok((a, b)),
            MergeJson::Joined(s) => s
                .split_once(' ')
                .map(|(a, b)| (a.to_string(), b.to_string()))
                .ok_or_else(|| {
                    TokenizerError::MalformedVocabulary(format!(
                        "merge {rank} is not a space-separated pair: {s:?}"
                    ))
                }),
        }
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

/// Byte-level BPE tokenizer. Immutable after construction.
pub struct Tokenizer {
    /// Symbol string (GPT-2 alphabet) or added-token content → id.
    symbol_to_id: FxHashMap<String, TokenId>,
    /// Symbol string per id, indexed by id.
    id_to_symbol: Vec<String>,
    /// Raw decoded bytes per id, indexed by id.
    id_to_bytes: Vec<Vec<u8>>,
    /// (left, right) → (rank, merged).
    merges: FxHashMap<(TokenId, TokenId), (Rank, TokenId)>,
    /// Base symbol for each byte value.
    byte_ids: [Option<TokenId>; 256],
    added_matcher: Option<AhoCorasick>,
    added_ids: Vec<TokenId>,
    splitter: Regex,
}

impl Tokenizer {
    /// Build from a vocabulary, an ordered merge list and added tokens.
    ///
    /// # Errors
    ///
    /// [`TokenizerError::MalformedVocabulary`] if the vocabulary or merge
    /// table is empty, a merge references a fragment (or result) missing
    /// from the vocabulary, or the ids are not dense.
    pub fn new(
        vocab: HashMap<String, TokenId>,
        merges: Vec<(String, String)>,
        added_tokens: Vec<AddedToken>,
    ) -> Result<Self, TokenizerError> {
        if vocab.is_empty() {
            return Err(TokenizerError::MalformedVocabulary(
                "vocabulary is empty".into(),
            ));
        }
        if merges.is_empty() {
            return Err(TokenizerError::MalformedVocabulary(
                "merge table is empty".into(),
            ));
        }

        let max_id = vocab
            .values()
            .chain(added_tokens.iter().map(|t| &t.id))
            .copied()
            .max()
            .unwrap_or(0) as usize;

        // A dense table has at most one id per entry; anything larger is
        // sparse and must not size the allocation below.
        let entries = vocab.len() + added_tokens.len();
        if max_id >= entries {
            return Err(TokenizerError::MalformedVocabulary(format!(
                "ids are not dense: max id {max_id} exceeds {entries} entries"
            )));
        }

        let mut id_to_symbol: Vec<Option<String>> = vec![None; max_id + 1];
        let mut symbol_to_id =
            FxHashMap::with_capacity_and_hasher(vocab.len(), Default::default());

        for (symbol, &id) in &vocab {
            let slot = &mut id_to_symbol[id as usize];
            if slot.is_some() {
                return Err(TokenizerError::MalformedVocabulary(format!(
                    "id {id} is assigned to more than one symbol"
                )));
            }
            *slot = Some(symbol.clone());
            symbol_to_id.insert(symbol.clone(), id);
        }

        // Added tokens may repeat a base vocab entry under the same id.
        let mut added_bytes: FxHashMap<TokenId, Vec<u8>> = FxHashMap::default();
        for token in &added_tokens {
            if token.content.is_empty() {
                return Err(TokenizerError::MalformedVocabulary(format!(
                    "added token {} has empty content",
                    token.id
                )));
            }
            let idx = token.id as usize;
            match &id_to_symbol[idx] {
                Some(existing) if *existing != token.content => {
                    return Err(TokenizerError::MalformedVocabulary(format!(
                        "added token {:?} collides with id {}",
                        token.content, token.id
                    )));
                }
                Some(_) => {}
                None => id_to_symbol[idx] = Some(token.content.clone()),
            }
            symbol_to_id.insert(token.content.clone(), token.id);
            added_bytes.insert(token.id, token.content.as_bytes().to_vec());
        }

        let id_to_symbol = id_to_symbol
            .into_iter()
            .enumerate()
            .map(|(id, symbol)| {
                symbol.ok_or_else(|| {
                    TokenizerError::MalformedVocabulary(format!(
                        "ids are not dense: id {id} is missing (max id {max_id})"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let id_to_bytes = id_to_symbol
            .iter()
            .enumerate()
            .map(|(id, symbol)| match added_bytes.remove(&(id as TokenId)) {
                Some(bytes) => bytes,
                None => byte_level::symbol_to_bytes(symbol),
            })
            .collect();

        let mut merge_table = FxHashMap::default();
        for (rank, (left, right)) in merges.iter().enumerate() {
            let lookup = |symbol: &str| {
                vocab.get(symbol).copied().ok_or_else(|| {
                    TokenizerError::MalformedVocabulary(format!(
                        "merge {rank} references unknown symbol {symbol:?}"
                    ))
                })
            };
            let left_id = lookup(left.as_str())?;
            let right_id = lookup(right.as_str())?;
            let merged_id = lookup(format!("{left}{right}").as_str())?;
            // First occurrence wins.
            merge_table
                .entry((left_id, right_id))
                .or_insert((rank as Rank, merged_id));
        }

        let mut byte_ids = [None; 256];
        for b in 0..=255u8 {
            byte_ids[b as usize] = vocab.get(&byte_level::byte_to_char(b).to_string()).copied();
        }

        let (added_matcher, added_ids) = if added_tokens.is_empty() {
            (None, Vec::new())
        } else {
            let patterns: Vec<&str> = added_tokens.iter().map(|t| t.content.as_str()).collect();
            let matcher = AhoCorasick::builder()
                .match_kind(MatchKind::LeftmostLongest)
                .build(&patterns)
                .map_err(|e| TokenizerError::MalformedVocabulary(e.to_string()))?;
            (Some(matcher), added_tokens.iter().map(|t| t.id).collect())
        };

        let splitter = Regex::new(GPT2_PATTERN)
            .map_err(|e| TokenizerError::Split(e.to_string()))?;

        Ok(Self {
            symbol_to_id,
            id_to_symbol,
            id_to_bytes,
            merges: merge_table,
            byte_ids,
            added_matcher,
            added_ids,
            splitter,
        })
    }

    /// Build from the text of a HuggingFace-style `tokenizer.json`.
    ///
    /// Reads `model.vocab`, `model.merges` and `added_tokens`; everything
    /// else in the blob is ignored.
    pub fn from_json_str(json: &str) -> Result<Self, TokenizerError> {
        let parsed: TokenizerJson = serde_json::from_str(json)
            .map_err(|e| TokenizerError::MalformedVocabulary(e.to_string()))?;

        let model = parsed.model.ok_or_else(|| {
            TokenizerError::MalformedVocabulary("missing `model` section".into())
        })?;
        let vocab = model.vocab.ok_or_else(|| {
            TokenizerError::MalformedVocabulary("missing `model.vocab`".into())
        })?;
        let merges = model
            .merges
            .ok_or_else(|| TokenizerError::MalformedVocabulary("missing `model.merges`".into()))?
            .into_iter()
            .enumerate()
            .map(|(rank, m)| m.into_pair(rank))
            .collect::<Result<Vec<_>, _>>()?;

        Self::new(vocab, merges, parsed.added_tokens)
    }

    /// Load a `tokenizer.json` from disk.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, TokenizerError> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Number of ids, base vocabulary plus added tokens.
    pub fn vocab_size(&self) -> usize {
        self.id_to_symbol.len()
    }

    pub fn token_to_id(&self, symbol: &str) -> Option<TokenId> {
        self.symbol_to_id.get(symbol).copied()
    }

    pub fn id_to_token(&self, id: TokenId) -> Option<&str> {
        self.id_to_symbol.get(id as usize).map(String::as_str)
    }

    /// Encode text into token ids.
    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>, TokenizerError> {
        let mut ids = Vec::with_capacity(text.len() / 3 + 1);
        let mut cursor = 0;

        if let Some(matcher) = &self.added_matcher {
            for m in matcher.find_iter(text) {
                self.encode_ordinary(&text[cursor..m.start()], &mut ids)?;
                ids.push(self.added_ids[m.pattern().as_usize()]);
                cursor = m.end();
            }
        }
        self.encode_ordinary(&text[cursor..], &mut ids)?;

        Ok(ids)
    }

    /// Encode text that contains no added tokens.
    fn encode_ordinary(&self, text: &str, out: &mut Vec<TokenId>) -> Result<(), TokenizerError> {
        for piece in self.splitter.find_iter(text) {
            let piece = piece.map_err(|e| TokenizerError::Split(e.to_string()))?;
            let mut symbols = piece
                .as_str()
                .bytes()
                .map(|b| self.byte_ids[b as usize].ok_or(TokenizerError::UnrepresentableByte(b)))
                .collect::<Result<Vec<_>, _>>()?;
            self.merge(&mut symbols);
            out.extend_from_slice(&symbols);
        }
        Ok(())
    }

    /// Apply merges in rank order until none applies. Ties go to the
    /// leftmost pair.
    fn merge(&self, symbols: &mut Vec<TokenId>) {
        while symbols.len() >= 2 {
            let best = symbols
                .windows(2)
                .enumerate()
                .filter_map(|(i, pair)| {
                    self.merges
                        .get(&(pair[0], pair[1]))
                        .map(|&(rank, merged)| (rank, i, merged))
                })
                .min_by_key(|&(rank, i, _)| (rank, i));

            let Some((_, i, merged)) = best else { break };
            symbols[i] = merged;
            symbols.remove(i + 1);
        }
    }

    /// Raw bytes of one token.
    ///
    /// A single token may end in the middle of a multi-byte character, so
    /// streaming callers should buffer these bytes rather than decode each
    /// token to a `String` on its own.
    pub fn token_bytes(&self, id: TokenId) -> Result<&[u8], TokenizerError> {
        self.id_to_bytes
            .get(id as usize)
            .map(Vec::as_slice)
            .ok_or(TokenizerError::UnknownToken(id))
    }

    /// Decode ids back into text. Invalid UTF-8 is replaced with U+FFFD.
    pub fn decode(&self, ids: &[TokenId]) -> Result<String, TokenizerError> {
        let mut bytes = Vec::with_capacity(ids.len() * 4);
        for &id in ids {
            bytes.extend_from_slice(self.token_bytes(id)?);
        }
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn fixture_shape() {
        let tok = fixture();
        assert_eq!(tok.vocab_size(), 265);
        assert_eq!(tok.token_to_id("<|end|>"), Some(END));
        assert_eq!(tok.id_to_token(257), Some("Fol"));
    }

    #[test]
    fn merges_apply_in_rank_order() {
        let tok = fixture();
        // F+o (0), Fo+l (1), then l+o (2); "w" stays a byte.
        assert_eq!(tok.encode("Follow").unwrap(), vec![257, 258, b'w' as TokenId]);
        assert_eq!(tok.encode(" me").unwrap(), vec![259, b'e' as TokenId]);
    }

    #[test]
    fn lower_rank_wins_over_position() {
        let mut vocab: HashMap<String, TokenId> = bytes_to_unicode()
            .iter()
            .enumerate()
            .map(|(b, c)| (c.to_string(), b as TokenId))
            .collect();
        vocab.insert("bc".into(), 256);
        vocab.insert("ab".into(), 257);
        let merges = vec![("b".into(), "c".into()), ("a".into(), "b".into())];
        let tok = Tokenizer::new(vocab, merges, Vec::new()).unwrap();

        assert_eq!(tok.encode("abc").unwrap(), vec![b'a' as TokenId, 256]);
    }

    #[test]
    fn added_tokens_are_matched_verbatim() {
        let tok = fixture();
        let ids = tok.encode("<|user|>\nFollow me.<|end|>").unwrap();
        assert_eq!(ids[0], USER);
        assert_eq!(ids[1], b'\n' as TokenId);
        assert_eq!(*ids.last().unwrap(), END);
        assert_eq!(tok.decode(&ids).unwrap(), "<|user|>\nFollow me.<|end|>");
    }

    #[test]
    fn empty_text_encodes_to_nothing() {
        assert!(fixture().encode("").unwrap().is_empty());
    }

    #[test]
    fn single_token_decode() {
        let tok = fixture();
        assert_eq!(tok.decode(&[257]).unwrap(), "Fol");
        assert_eq!(tok.decode(&[ASSISTANT]).unwrap(), "<|assistant|>");
        assert_eq!(tok.token_bytes(259).unwrap(), b" m");
    }

    #[test]
    fn unknown_id_fails_decode() {
        let err = fixture().decode(&[9999]).unwrap_err();
        assert!(matches!(err, TokenizerError::UnknownToken(9999)));
    }

    #[test]
    fn split_multibyte_char_decodes_lossily_alone() {
        let tok = fixture();
        let ids = tok.encode("é").unwrap();
        assert_eq!(ids, vec![0xC3, 0xA9]);
        assert_eq!(tok.decode(&ids[..1]).unwrap(), "\u{FFFD}");
        assert_eq!(tok.decode(&ids).unwrap(), "é");
    }

    #[test]
    fn empty_vocab_is_malformed() {
        let err = Tokenizer::new(HashMap::new(), vec![("a".into(), "b".into())], Vec::new())
            .err()
            .unwrap();
        assert!(matches!(err, TokenizerError::MalformedVocabulary(_)));
    }

    #[test]
    fn empty_merges_are_malformed() {
        let vocab = HashMap::from([("a".to_string(), 0)]);
        let err = Tokenizer::new(vocab, Vec::new(), Vec::new()).err().unwrap();
        assert!(matches!(err, TokenizerError::MalformedVocabulary(_)));
    }

    #[test]
    fn sparse_ids_are_malformed() {
        let vocab = HashMap::from([
            ("a".to_string(), 0),
            ("b".to_string(), 1),
            ("ab".to_string(), 5),
        ]);
        let err = Tokenizer::new(vocab, vec![("a".into(), "b".into())], Vec::new())
            .err()
            .unwrap();
        assert!(matches!(err, TokenizerError::MalformedVocabulary(msg) if msg.contains("dense")));
    }

    #[test]
    fn huge_id_is_malformed_not_allocated() {
        let vocab = HashMap::from([
            ("a".to_string(), 0),
            ("b".to_string(), 1),
            ("ab".to_string(), TokenId::MAX),
        ]);
        let err = Tokenizer::new(vocab, vec![("a".into(), "b".into())], Vec::new())
            .err()
            .unwrap();
        assert!(matches!(err, TokenizerError::MalformedVocabulary(msg) if msg.contains("dense")));

        let vocab = HashMap::from([
            ("a".to_string(), 0),
            ("b".to_string(), 1),
            ("ab".to_string(), 2),
        ]);
        let added = vec![AddedToken {
            id: TokenId::MAX - 1,
            content: "<|end|>".into(),
        }];
        let err = Tokenizer::new(vocab, vec![("a".into(), "b".into())], added)
            .err()
            .unwrap();
        assert!(matches!(err, TokenizerError::MalformedVocabulary(_)));
    }

    #[test]
    fn merge_with_unknown_fragment_is_malformed() {
        let vocab = HashMap::from([("a".to_string(), 0), ("b".to_string(), 1)]);
        let err = Tokenizer::new(vocab, vec![("a".into(), "b".into())], Vec::new())
            .err()
            .unwrap();
        assert!(matches!(err, TokenizerError::MalformedVocabulary(msg) if msg.contains("\"ab\"")));
    }

    #[test]
    fn json_accepts_both_merge_formats() {
        let json = r#"{
            "model": {
                "type": "BPE",
                "vocab": { "a": 0, "b": 1, "c": 2, "ab": 3, "abc": 4 },
                "merges": ["a b", ["ab", "c"]]
            },
            "added_tokens": [{ "id": 5, "content": "<|end|>", "special": true }]
        }"#;
        let tok = Tokenizer::from_json_str(json).unwrap();
        assert_eq!(tok.vocab_size(), 6);
        assert_eq!(tok.encode("abc").unwrap(), vec![4]);
    }

    #[test]
    fn json_without_model_is_malformed() {
        let err = Tokenizer::from_json_str(r#"{ "added_tokens": [] }"#).err().unwrap();
        assert!(matches!(err, TokenizerError::MalformedVocabulary(_)));
    }

    #[test]
    fn json_with_negative_id_is_malformed() {
        let json = r#"{ "model": { "vocab": { "a": -1 }, "merges": ["a a"] } }"#;
        let err = Tokenizer::from_json_str(json).err().unwrap();
        assert!(matches!(err, TokenizerError::MalformedVocabulary(_)));
    }

    proptest! {
        #[test]
        fn decode_inverts_encode(text in any::<String>()) {
            let tok = fixture();
            let ids = tok.encode(&text).unwrap();
            prop_assert_eq!(tok.decode(&ids).unwrap(), text);
        }
    }
}
