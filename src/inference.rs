use anyhow::{bail, Result};
use candle_core::{DType, Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use tracing::info;

use crate::config::InferenceConfig;
use crate::model::Gpt;
use crate::utils_tensor::device;
use crate::vocab::VocabMeta;
use crate::{Args, InferenceCmd};

/// Autoregressive token generation, the only thing evaluation needs from a
/// trained model.
pub trait Generator {
    /// Extend `prompt` by up to `max_new_tokens` ids, stopping right after
    /// `stop_token` is produced. Returns the prompt followed by the new ids.
    fn generate(
        &mut self,
        prompt: &[u32],
        max_new_tokens: usize,
        stop_token: Option<u32>,
    ) -> Result<Vec<u32>>;
}

pub fn sampling(temperature: f64, top_k: usize) -> Sampling {
    if temperature <= 0.0 {
        Sampling::ArgMax
    } else if top_k == 0 {
        Sampling::All { temperature }
    } else {
        Sampling::TopK { k: top_k, temperature }
    }
}

pub struct AutoregressiveWrapper {
    net: Gpt,
    device: Device,
    logits_processor: LogitsProcessor,
}

impl AutoregressiveWrapper {
    pub fn new(net: Gpt, device: Device, seed: u64, sampling: Sampling) -> Self {
        Self {
            net,
            device,
            logits_processor: LogitsProcessor::from_sampling(seed, sampling),
        }
    }
}

impl Generator for AutoregressiveWrapper {
    fn generate(
        &mut self,
        prompt: &[u32],
        max_new_tokens: usize,
        stop_token: Option<u32>,
    ) -> Result<Vec<u32>> {
        if prompt.is_empty() {
            bail!("cannot generate from an empty prompt");
        }
        let block_size = self.net.config().block_size;
        let mut output = prompt.to_vec();
        for _ in 0..max_new_tokens {
            // the model only sees the last block_size tokens
            let context = &output[output.len().saturating_sub(block_size)..];
            let input = Tensor::from_slice(context, (1, context.len()), &self.device)?;
            let logits = self.net.forward(&input)?.squeeze(0)?.to_dtype(DType::F32)?;
            let next = self.logits_processor.sample(&logits)?;
            output.push(next);
            if Some(next) == stop_token {
                break;
            }
        }
        Ok(output)
    }
}

/// Load the checkpoint and vocabulary named by `cfg`.
pub fn load_generator(
    cfg: &InferenceConfig,
    common_args: &Args,
) -> Result<(AutoregressiveWrapper, VocabMeta)> {
    let meta_path = cfg.meta_path();
    info!("loading meta from {}", meta_path.display());
    let meta = VocabMeta::load(&meta_path)?;

    let device = device(common_args.cpu)?;
    let checkpoint = cfg.checkpoint_path();
    info!("loading model from {}", checkpoint.display());
    let net = Gpt::from_checkpoint(&checkpoint, cfg.n_head, &device)?;
    if net.config().vocab_size < meta.vocab_size {
        bail!(
            "checkpoint vocabulary ({}) is smaller than {} ({})",
            net.config().vocab_size,
            meta_path.display(),
            meta.vocab_size
        );
    }
    let wrapper = AutoregressiveWrapper::new(
        net,
        device,
        cfg.seed,
        sampling(cfg.temperature, cfg.top_k),
    );
    Ok((wrapper, meta))
}

/// Print `num_samples` completions of the `start` prompt.
pub fn run_sample(args: &InferenceCmd, common_args: &Args) -> Result<()> {
    let cfg = InferenceConfig::load(args.config.as_deref(), &args.overrides)?;
    let (mut generator, meta) = load_generator(&cfg, common_args)?;
    let vocab = meta.vocabulary()?;

    let mut eos = meta.eos().chars();
    let stop_token = match (eos.next(), eos.next()) {
        (Some(ch), None) => vocab.id(ch).map(u32::from),
        _ => None,
    };
    let prompt: Vec<u32> = vocab
        .encode(&cfg.start_prompt()?)?
        .into_iter()
        .map(u32::from)
        .collect();

    for _ in 0..cfg.num_samples {
        let output = generator.generate(&prompt, cfg.max_new_tokens, stop_token)?;
        println!("{}", vocab.decode(output)?);
        println!("---------------");
    }
    Ok(())
}
