use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Width of one stored token id.
pub type TokenId = u16;

/// Largest vocabulary a `TokenId` can address.
pub const MAX_VOCAB_SIZE: usize = TokenId::MAX as usize + 1;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum VocabError {
    #[error("character {ch:?} at position {position} is not in the vocabulary")]
    UnknownChar { ch: char, position: usize },
    #[error("token id {0} is not in the vocabulary")]
    UnknownId(u32),
    #[error("{0} distinct characters do not fit in 16-bit token ids")]
    TooLarge(usize),
}

/// Character-level vocabulary: the sorted distinct characters of a corpus
/// mapped to dense ids.
#[derive(Debug, Clone, PartialEq)]
pub struct Vocabulary {
    itos: Vec<char>,
    stoi: HashMap<char, TokenId>,
}

impl Vocabulary {
    /// Build over every character of `text`, ids assigned in code point order.
    pub fn build(text: &str) -> Result<Self, VocabError> {
        let chars: BTreeSet<char> = text.chars().collect();
        Self::from_sorted(chars.into_iter().collect())
    }

    fn from_sorted(itos: Vec<char>) -> Result<Self, VocabError> {
        if itos.len() > MAX_VOCAB_SIZE {
            return Err(VocabError::TooLarge(itos.len()));
        }
        let stoi = itos
            .iter()
            .enumerate()
            .map(|(id, &ch)| (ch, id as TokenId))
            .collect();
        Ok(Self { itos, stoi })
    }

    pub fn len(&self) -> usize {
        self.itos.len()
    }

    pub fn is_empty(&self) -> bool {
        self.itos.is_empty()
    }

    pub fn chars(&self) -> &[char] {
        &self.itos
    }

    pub fn id(&self, ch: char) -> Option<TokenId> {
        self.stoi.get(&ch).copied()
    }

    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>, VocabError> {
        text.chars()
            .enumerate()
            .map(|(position, ch)| self.id(ch).ok_or(VocabError::UnknownChar { ch, position }))
            .collect()
    }

    pub fn decode<I>(&self, ids: I) -> Result<String, VocabError>
    where
        I: IntoIterator,
        I::Item: Into<u32>,
    {
        ids.into_iter()
            .map(|id| {
                let id = id.into();
                self.itos
                    .get(id as usize)
                    .copied()
                    .ok_or(VocabError::UnknownId(id))
            })
            .collect()
    }
}

/// Persisted vocabulary record, `meta.json` next to the token arrays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VocabMeta {
    pub vocab_size: usize,
    pub itos: BTreeMap<TokenId, char>,
    pub stoi: BTreeMap<char, TokenId>,
    /// Separator the records were formatted with.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sep: Option<String>,
    /// Stop token closing every record.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eos: Option<String>,
}

impl VocabMeta {
    pub fn new(vocab: &Vocabulary, sep: Option<&str>, eos: Option<&str>) -> Self {
        Self {
            vocab_size: vocab.len(),
            itos: vocab
                .itos
                .iter()
                .enumerate()
                .map(|(id, &ch)| (id as TokenId, ch))
                .collect(),
            stoi: vocab.stoi.iter().map(|(&ch, &id)| (ch, id)).collect(),
            sep: sep.map(str::to_string),
            eos: eos.map(str::to_string),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json).with_context(|| format!("writing {}", path.display()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("vocabulary metadata not found at {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }

    /// Rebuild the vocabulary, checking that the three fields agree.
    pub fn vocabulary(&self) -> Result<Vocabulary> {
        anyhow::ensure!(
            self.itos.len() == self.vocab_size && self.stoi.len() == self.vocab_size,
            "vocab_size {} does not match itos ({}) / stoi ({})",
            self.vocab_size,
            self.itos.len(),
            self.stoi.len()
        );
        let itos: Vec<char> = self.itos.values().copied().collect();
        for (expected, (&id, ch)) in self.itos.iter().enumerate() {
            anyhow::ensure!(
                id as usize == expected && self.stoi.get(ch) == Some(&id),
                "itos and stoi disagree at id {id}"
            );
        }
        Ok(Vocabulary::from_sorted(itos)?)
    }

    pub fn sep(&self) -> &str {
        self.sep.as_deref().unwrap_or("=")
    }

    pub fn eos(&self) -> &str {
        self.eos.as_deref().unwrap_or("\n")
    }
}

#[cfg(test)]
mod vocab_tests {
    use super::*;

    #[test]
    fn ids_follow_code_point_order() -> Result<()> {
        let vocab = Vocabulary::build("1+1=2\n2+2=4\n")?;
        assert_eq!(vocab.chars(), &['\n', '+', '1', '2', '4', '=']);
        assert_eq!(vocab.id('\n'), Some(0));
        assert_eq!(vocab.id('+'), Some(1));
        assert_eq!(vocab.id('='), Some(5));
        assert_eq!(vocab.encode("1+1=2\n")?, vec![2, 1, 2, 5, 3, 0]);
        Ok(())
    }

    #[test]
    fn decode_inverts_encode() -> Result<()> {
        let text = "12+34=46\n99+99=198\n";
        let vocab = Vocabulary::build(text)?;
        for record in text.split_inclusive('\n') {
            let ids = vocab.encode(record)?;
            assert_eq!(vocab.decode(ids)?, record);
        }
        Ok(())
    }

    #[test]
    fn unknown_symbols_are_errors() -> Result<()> {
        let vocab = Vocabulary::build("1+1=2\n")?;
        assert_eq!(
            vocab.encode("1+7"),
            Err(VocabError::UnknownChar {
                ch: '7',
                position: 2
            })
        );
        assert_eq!(vocab.decode([0u32, 9]), Err(VocabError::UnknownId(9)));
        Ok(())
    }

    #[test]
    fn meta_round_trips_through_json() -> Result<()> {
        let vocab = Vocabulary::build("1+1=2\n")?;
        let meta = VocabMeta::new(&vocab, Some("="), Some("\n"));
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("meta.json");
        meta.save(&path)?;

        let loaded = VocabMeta::load(&path)?;
        assert_eq!(loaded, meta);
        assert_eq!(loaded.vocab_size, 5);
        assert_eq!(loaded.itos[&0u16], '\n');
        assert_eq!(loaded.stoi[&'='], 4);
        assert_eq!(loaded.vocabulary()?, vocab);
        Ok(())
    }

    #[test]
    fn meta_without_format_fields_uses_defaults() -> Result<()> {
        let raw = r#"{"vocab_size": 2, "itos": {"0": "\n", "1": "1"}, "stoi": {"\n": 0, "1": 1}}"#;
        let meta: VocabMeta = serde_json::from_str(raw)?;
        assert_eq!(meta.sep(), "=");
        assert_eq!(meta.eos(), "\n");
        assert_eq!(meta.vocabulary()?.len(), 2);
        Ok(())
    }

    #[test]
    fn missing_meta_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = VocabMeta::load(&dir.path().join("meta.json")).unwrap_err();
        assert!(format!("{err}").contains("meta.json"));
    }
}
