use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;

/// Options of a single preparation run, passed by value into the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct PrepareConfig {
    pub file: PathBuf,
    pub out_dir: PathBuf,
    pub sep: String,
    pub stop_token: String,
    pub test_size: f64,
    pub shuffle: bool,
    pub seed: Option<u64>,
}

impl PrepareConfig {
    pub fn new(
        file: PathBuf,
        out_dir: Option<PathBuf>,
        sep: &str,
        stop_token: &str,
        test_size: f64,
        shuffle: bool,
        seed: Option<u64>,
    ) -> Result<Self> {
        let out_dir = out_dir.unwrap_or_else(|| default_out_dir(&file));
        let sep = unescape(sep)?;
        let stop_token = unescape(stop_token)?;
        if stop_token.is_empty() {
            bail!("stop token must not be empty");
        }
        Ok(Self {
            file,
            out_dir,
            sep,
            stop_token,
            test_size,
            shuffle,
            seed,
        })
    }
}

// Artifacts land next to the corpus unless told otherwise.
fn default_out_dir(file: &Path) -> PathBuf {
    match file.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Expand `\n`, `\t`, `\r` and `\\` so control characters can be passed as flags.
pub fn unescape(raw: &str) -> Result<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some('r') => out.push('\r'),
            Some('\\') => out.push('\\'),
            Some(other) => bail!("unsupported escape sequence '\\{other}' in {raw:?}"),
            None => bail!("dangling '\\' at the end of {raw:?}"),
        }
    }
    Ok(out)
}

/// Shape of the checkpointed char model. Everything but `n_head` is read off
/// the tensor shapes of the checkpoint, `n_head` off its `model_args`.
#[derive(Debug, Copy, Clone, PartialEq)]
pub struct GptConfig {
    pub vocab_size: usize,
    pub block_size: usize,
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub bias: bool,
}

/// Settings shared by the `evaluate` and `sample` commands.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InferenceConfig {
    pub out_dir: PathBuf,
    pub checkpoint: String,
    pub data_dir: PathBuf,
    pub dataset: String,
    pub num_samples: usize,
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_k: usize,
    pub seed: u64,
    /// Head count for checkpoints that do not record their `model_args`.
    pub n_head: Option<usize>,
    pub digits: usize,
    pub start: String,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("out/intermediate"),
            checkpoint: "ckpt.pt".to_string(),
            data_dir: PathBuf::from("data"),
            dataset: "intermediate".to_string(),
            num_samples: 100,
            max_new_tokens: 10,
            temperature: 0.8,
            top_k: 200,
            seed: 1337,
            n_head: None,
            digits: 0,
            start: "\n".to_string(),
        }
    }
}

/// Recognized override keys, see `InferenceConfig::apply_override`.
pub const INFERENCE_KEYS: &[&str] = &[
    "out_dir",
    "checkpoint",
    "data_dir",
    "dataset",
    "num_samples",
    "max_new_tokens",
    "temperature",
    "top_k",
    "seed",
    "n_head",
    "digits",
    "start",
];

impl InferenceConfig {
    /// Defaults, then an optional JSON file, then `key=value` overrides.
    pub fn load(file: Option<&Path>, overrides: &[String]) -> Result<Self> {
        let mut cfg = match file {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("reading config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("parsing config file {}", path.display()))?
            }
            None => Self::default(),
        };
        for arg in overrides {
            cfg.apply_override(arg)?;
        }
        Ok(cfg)
    }

    /// Apply one `key=value` argument. The key decides the type the value is
    /// parsed into; unknown keys and unparseable values are errors.
    pub fn apply_override(&mut self, arg: &str) -> Result<()> {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got {arg:?}"))?;
        match key {
            "out_dir" => self.out_dir = PathBuf::from(value),
            "checkpoint" => self.checkpoint = value.to_string(),
            "data_dir" => self.data_dir = PathBuf::from(value),
            "dataset" => self.dataset = value.to_string(),
            "num_samples" => self.num_samples = parse_value(key, value)?,
            "max_new_tokens" => self.max_new_tokens = parse_value(key, value)?,
            "temperature" => self.temperature = parse_value(key, value)?,
            "top_k" => self.top_k = parse_value(key, value)?,
            "seed" => self.seed = parse_value(key, value)?,
            "n_head" => self.n_head = Some(parse_value(key, value)?),
            "digits" => self.digits = parse_value(key, value)?,
            "start" => self.start = unescape(value)?,
            _ => bail!(
                "unknown config key {key:?}, expected one of: {}",
                INFERENCE_KEYS.join(", ")
            ),
        }
        Ok(())
    }

    pub fn checkpoint_path(&self) -> PathBuf {
        self.out_dir.join(&self.checkpoint)
    }

    pub fn meta_path(&self) -> PathBuf {
        self.data_dir.join(&self.dataset).join("meta.json")
    }

    /// Operand digit count for evaluation prompts. Explicit `digits` wins,
    /// otherwise 1-digit datasets are recognized by name and everything else
    /// is treated as 2-digit.
    pub fn operand_digits(&self) -> usize {
        if self.digits > 0 {
            self.digits
        } else if self.dataset.contains("basic") || self.dataset.contains("1digit") {
            1
        } else {
            2
        }
    }

    /// Resolve the `start` prompt, reading it from disk for `FILE:path`.
    pub fn start_prompt(&self) -> Result<String> {
        match self.start.strip_prefix("FILE:") {
            Some(path) => std::fs::read_to_string(path)
                .with_context(|| format!("reading prompt file {path}")),
            None => Ok(self.start.clone()),
        }
    }
}

fn parse_value<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| anyhow!("invalid value {value:?} for {key}: {e}"))
}
