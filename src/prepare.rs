//! Corpus preparation: JSONL samples in, `train.bin`, `val.bin` and
//! `meta.json` out.
//!
//! Each stage is its own type and only exposes the transition to the next
//! one, so the order format -> vocabulary -> shuffle -> split -> encode ->
//! persist is checked at compile time. Shuffling is the only optional stage.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::{info, warn};

use crate::config::PrepareConfig;
use crate::corpus::{read_jsonl, RecordFormat};
use crate::generator::{seeded_rng, Sample};
use crate::split::{Split, TestSize};
use crate::token_bin::write_tokens;
use crate::vocab::{TokenId, VocabMeta, Vocabulary};
use crate::{Args, PrepareCmd};

/// Samples rendered into training records.
#[derive(Debug)]
pub struct FormattedCorpus {
    records: Vec<String>,
    format: RecordFormat,
}

impl FormattedCorpus {
    pub fn new(samples: &[Sample], format: RecordFormat) -> Self {
        let records = samples.iter().map(|s| format.render(s)).collect();
        Self { records, format }
    }

    #[cfg(test)]
    pub fn records(&self) -> &[String] {
        &self.records
    }

    /// Build the vocabulary over every record, before any split.
    pub fn build_vocab(self) -> Result<IndexedCorpus> {
        let text = self.records.concat();
        info!("total characters in dataset: {}", text.chars().count());
        let vocab = Vocabulary::build(&text)?;
        info!("unique characters: {}", vocab.len());
        info!("vocab: {:?}", vocab.chars().iter().collect::<String>());
        Ok(IndexedCorpus {
            records: self.records,
            format: self.format,
            vocab,
        })
    }
}

/// Records with their vocabulary fixed.
#[derive(Debug)]
pub struct IndexedCorpus {
    records: Vec<String>,
    format: RecordFormat,
    vocab: Vocabulary,
}

impl IndexedCorpus {
    pub fn records(&self) -> &[String] {
        &self.records
    }

    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    /// Permute the records. Does not touch the vocabulary.
    pub fn shuffle<R: Rng>(mut self, rng: &mut R) -> Self {
        self.records.shuffle(rng);
        self
    }

    pub fn split(self, test_size: TestSize) -> PartitionedCorpus {
        PartitionedCorpus {
            split: Split::new(self.records, test_size),
            format: self.format,
            vocab: self.vocab,
        }
    }
}

#[derive(Debug)]
pub struct PartitionedCorpus {
    split: Split<String>,
    format: RecordFormat,
    vocab: Vocabulary,
}

impl PartitionedCorpus {
    #[cfg(test)]
    pub fn split(&self) -> &Split<String> {
        &self.split
    }

    /// Encode each partition as one token stream. Any character outside the
    /// vocabulary is an error.
    pub fn encode(self) -> Result<EncodedCorpus> {
        let train = self.vocab.encode(&self.split.train().concat())?;
        let val = match &self.split {
            Split::Memorize(_) => train.clone(),
            Split::Holdout { .. } => self.vocab.encode(&self.split.val().concat())?,
        };
        info!("train tokens: {}", train.len());
        info!("val tokens: {}", val.len());
        Ok(EncodedCorpus {
            train,
            val,
            format: self.format,
            vocab: self.vocab,
        })
    }
}

#[derive(Debug)]
pub struct EncodedCorpus {
    pub train: Vec<TokenId>,
    pub val: Vec<TokenId>,
    format: RecordFormat,
    vocab: Vocabulary,
}

/// Where a preparation run wrote its outputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifacts {
    pub train_bin: PathBuf,
    pub val_bin: PathBuf,
    pub meta: PathBuf,
}

impl Artifacts {
    pub fn in_dir(out_dir: &Path) -> Self {
        Self {
            train_bin: out_dir.join("train.bin"),
            val_bin: out_dir.join("val.bin"),
            meta: out_dir.join("meta.json"),
        }
    }
}

impl EncodedCorpus {
    #[cfg(test)]
    pub fn vocab(&self) -> &Vocabulary {
        &self.vocab
    }

    pub fn meta(&self) -> VocabMeta {
        VocabMeta::new(
            &self.vocab,
            Some(&self.format.sep),
            Some(&self.format.stop_token),
        )
    }

    pub fn persist(&self, out_dir: &Path) -> Result<Artifacts> {
        fs::create_dir_all(out_dir)
            .with_context(|| format!("creating output directory {}", out_dir.display()))?;
        let artifacts = Artifacts::in_dir(out_dir);
        self.meta().save(&artifacts.meta)?;
        write_tokens(&artifacts.train_bin, &self.train)?;
        write_tokens(&artifacts.val_bin, &self.val)?;
        info!("wrote artifacts to {}", out_dir.display());
        Ok(artifacts)
    }
}

/// Run every stage for `config` and persist the result.
pub fn prepare(config: PrepareConfig) -> Result<Artifacts> {
    let test_size = TestSize::new(config.test_size)?;
    let corpus = read_jsonl(&config.file)?;
    if corpus.skipped > 0 {
        warn!("skipped {} malformed lines", corpus.skipped);
    }

    let format = RecordFormat {
        sep: config.sep,
        stop_token: config.stop_token,
    };
    let mut indexed = FormattedCorpus::new(&corpus.samples, format).build_vocab()?;
    if indexed.vocab().is_empty() {
        warn!("no valid samples in {}", config.file.display());
    }
    info!("formatted {} records", indexed.records().len());
    if config.shuffle {
        indexed = indexed.shuffle(&mut seeded_rng(config.seed));
    }
    indexed
        .split(test_size)
        .encode()?
        .persist(&config.out_dir)
}

pub fn run(args: &PrepareCmd, _common_args: &Args) -> Result<()> {
    let config = PrepareConfig::new(
        args.file.clone(),
        args.out_dir.clone(),
        &args.sep,
        &args.stop_token,
        args.test_size,
        args.shuffle,
        args.seed,
    )?;
    prepare(config)?;
    Ok(())
}
