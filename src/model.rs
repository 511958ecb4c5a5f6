//! Inference-only char model matching the nanoGPT checkpoint layout: learned
//! token and position embeddings, pre-norm blocks of causal self-attention and
//! a GELU MLP, a final layer norm and a (possibly tied) language-model head.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{anyhow, bail, ensure, Context, Result};
use candle_core::pickle::{Object, Stack};
use candle_core::{DType, Device, IndexOp, Module, Tensor, D};
use candle_nn::{embedding, linear_b, Embedding, LayerNorm, Linear, VarBuilder};
use tracing::{info, instrument, warn};

use crate::config::GptConfig;
use crate::utils_tensor::{causal_mask, masked_fill};

const LAYER_NORM_EPS: f64 = 1e-5;

// Prefix torch.compile adds to every parameter name.
const COMPILED_PREFIX: &str = "_orig_mod.";

fn layer_norm(size: usize, bias: bool, vb: VarBuilder) -> candle_core::Result<LayerNorm> {
    let weight = vb.get(size, "weight")?;
    if bias {
        let bias = vb.get(size, "bias")?;
        Ok(LayerNorm::new(weight, bias, LAYER_NORM_EPS))
    } else {
        Ok(LayerNorm::new_no_bias(weight, LAYER_NORM_EPS))
    }
}

#[derive(Debug)]
struct CausalSelfAttention {
    c_attn: Linear,
    c_proj: Linear,
    n_head: usize,
    span: tracing::Span,
}

impl CausalSelfAttention {
    fn load(cfg: &GptConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let span = tracing::span!(tracing::Level::TRACE, "attn");
        let c_attn = linear_b(cfg.n_embd, 3 * cfg.n_embd, cfg.bias, vb.pp("c_attn"))?;
        let c_proj = linear_b(cfg.n_embd, cfg.n_embd, cfg.bias, vb.pp("c_proj"))?;
        Ok(Self {
            c_attn,
            c_proj,
            n_head: cfg.n_head,
            span,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let _enter = self.span.enter();
        let (b, t, c) = x.dims3()?;
        let head_dim = c / self.n_head;
        let qkv = self.c_attn.forward(x)?;
        let heads = |i: usize| {
            qkv.narrow(D::Minus1, i * c, c)?
                .reshape((b, t, self.n_head, head_dim))?
                .transpose(1, 2)?
                .contiguous()
        };
        let (q, k, v) = (heads(0)?, heads(1)?, heads(2)?);

        let scale = 1f64 / (head_dim as f64).sqrt();
        let att = (q.matmul(&k.t()?.contiguous()?)? * scale)?;
        let att = masked_fill(&att, mask, f32::NEG_INFINITY)?;
        let att = candle_nn::ops::softmax_last_dim(&att)?;
        let y = att.matmul(&v)?.transpose(1, 2)?.reshape((b, t, c))?;
        self.c_proj.forward(&y)
    }
}

#[derive(Debug)]
struct Mlp {
    c_fc: Linear,
    c_proj: Linear,
}

impl Mlp {
    fn load(cfg: &GptConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let c_fc = linear_b(cfg.n_embd, 4 * cfg.n_embd, cfg.bias, vb.pp("c_fc"))?;
        let c_proj = linear_b(4 * cfg.n_embd, cfg.n_embd, cfg.bias, vb.pp("c_proj"))?;
        Ok(Self { c_fc, c_proj })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        self.c_proj.forward(&self.c_fc.forward(x)?.gelu_erf()?)
    }
}

#[derive(Debug)]
struct Block {
    ln_1: LayerNorm,
    attn: CausalSelfAttention,
    ln_2: LayerNorm,
    mlp: Mlp,
}

impl Block {
    fn load(cfg: &GptConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        Ok(Self {
            ln_1: layer_norm(cfg.n_embd, cfg.bias, vb.pp("ln_1"))?,
            attn: CausalSelfAttention::load(cfg, vb.pp("attn"))?,
            ln_2: layer_norm(cfg.n_embd, cfg.bias, vb.pp("ln_2"))?,
            mlp: Mlp::load(cfg, vb.pp("mlp"))?,
        })
    }

    fn forward(&self, x: &Tensor, mask: &Tensor) -> candle_core::Result<Tensor> {
        let x = (x + self.attn.forward(&self.ln_1.forward(x)?, mask)?)?;
        &x + self.mlp.forward(&self.ln_2.forward(&x)?)?
    }
}

#[derive(Debug)]
pub struct Gpt {
    wte: Embedding,
    wpe: Embedding,
    blocks: Vec<Block>,
    ln_f: LayerNorm,
    lm_head: Linear,
    cfg: GptConfig,
}

impl Gpt {
    pub fn load(cfg: GptConfig, vb: VarBuilder) -> Result<Self> {
        ensure!(
            cfg.n_head > 0 && cfg.n_embd % cfg.n_head == 0,
            "n_embd ({}) must be divisible by n_head ({})",
            cfg.n_embd,
            cfg.n_head
        );
        let wte = embedding(cfg.vocab_size, cfg.n_embd, vb.pp("transformer.wte"))?;
        let wpe = embedding(cfg.block_size, cfg.n_embd, vb.pp("transformer.wpe"))?;
        let blocks = (0..cfg.n_layer)
            .map(|i| Block::load(&cfg, vb.pp(format!("transformer.h.{i}"))))
            .collect::<candle_core::Result<Vec<_>>>()?;
        let ln_f = layer_norm(cfg.n_embd, cfg.bias, vb.pp("transformer.ln_f"))?;
        // nanoGPT ties the head to the token embedding
        let lm_head = if vb.contains_tensor("lm_head.weight") {
            linear_b(cfg.n_embd, cfg.vocab_size, false, vb.pp("lm_head"))?
        } else {
            Linear::new(wte.embeddings().clone(), None)
        };
        Ok(Self {
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            cfg,
        })
    }

    /// Load a checkpoint from disk, reading the model shape off its tensors.
    /// The head count comes from the checkpoint's `model_args` when it has
    /// them, `n_head` is only needed for files that do not.
    pub fn from_checkpoint(path: &Path, n_head: Option<usize>, device: &Device) -> Result<Self> {
        let n_head = resolve_n_head(checkpoint_n_head(path)?, n_head)?;
        let tensors = load_checkpoint(path)?;
        let cfg = infer_config(&tensors, n_head)?;
        info!("loaded {} with {cfg:?}", path.display());
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::load(cfg, vb)
    }

    pub fn config(&self) -> &GptConfig {
        &self.cfg
    }

    /// Logits of the last position, shape `(batch, vocab_size)`.
    #[instrument(skip_all)]
    pub fn forward(&self, idx: &Tensor) -> Result<Tensor> {
        let (_b, t) = idx.dims2()?;
        ensure!(
            t > 0 && t <= self.cfg.block_size,
            "sequence length {t} outside 1..={}",
            self.cfg.block_size
        );
        let pos = Tensor::arange(0u32, t as u32, idx.device())?;
        let mut x = self
            .wte
            .forward(idx)?
            .broadcast_add(&self.wpe.forward(&pos)?)?;
        let mask = causal_mask(t, idx.device())?;
        for block in &self.blocks {
            x = block.forward(&x, &mask)?;
        }
        let x = self.ln_f.forward(&x)?.i((.., t - 1, ..))?;
        Ok(self.lm_head.forward(&x)?)
    }
}

/// Read every tensor of a nanoGPT `ckpt.pt` (state dict under `model`), a
/// plain `.pt` state dict or a `.safetensors` file. Names lose the
/// torch.compile prefix.
pub fn load_checkpoint(path: &Path) -> Result<HashMap<String, Tensor>> {
    let tensors: Vec<(String, Tensor)> = match path.extension().and_then(|e| e.to_str()) {
        Some("safetensors") => candle_core::safetensors::load(path, &Device::Cpu)
            .with_context(|| format!("loading checkpoint {}", path.display()))?
            .into_iter()
            .collect(),
        _ => candle_core::pickle::read_all_with_key(path, Some("model"))
            .or_else(|_| candle_core::pickle::read_all(path))
            .with_context(|| format!("loading checkpoint {}", path.display()))?,
    };
    Ok(tensors
        .into_iter()
        .map(|(name, tensor)| {
            let name = match name.strip_prefix(COMPILED_PREFIX) {
                Some(stripped) => stripped.to_string(),
                None => name,
            };
            (name, tensor)
        })
        .collect())
}

/// `model_args["n_head"]` of a torch checkpoint, `None` for safetensors files
/// and for pickles without that entry.
pub fn checkpoint_n_head(path: &Path) -> Result<Option<usize>> {
    if path.extension().is_some_and(|e| e == "safetensors") {
        return Ok(None);
    }
    let file =
        File::open(path).with_context(|| format!("loading checkpoint {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(BufReader::new(file))
        .with_context(|| format!("{} is not a torch checkpoint", path.display()))?;
    let Some(pkl) = archive
        .file_names()
        .find(|name| name.ends_with("data.pkl"))
        .map(str::to_string)
    else {
        return Ok(None);
    };
    let mut reader = BufReader::new(archive.by_name(&pkl)?);
    let mut stack = Stack::empty();
    if let Err(err) = stack.read_loop(&mut reader) {
        warn!("cannot read model_args from {}: {err}", path.display());
        return Ok(None);
    }
    Ok(model_args_n_head(stack.finalize()?))
}

fn dict_get(obj: Object, key: &str) -> Option<Object> {
    obj.dict()
        .ok()?
        .into_iter()
        .find(|(k, _)| matches!(k, Object::Unicode(k) if k == key))
        .map(|(_, v)| v)
}

fn model_args_n_head(obj: Object) -> Option<usize> {
    let n_head = dict_get(dict_get(obj, "model_args")?, "n_head")?.int().ok()?;
    usize::try_from(n_head).ok()
}

/// Pick the head count, refusing a configured value the checkpoint contradicts.
pub fn resolve_n_head(stored: Option<usize>, configured: Option<usize>) -> Result<usize> {
    match (stored, configured) {
        (Some(stored), Some(configured)) if stored != configured => bail!(
            "n_head={configured} does not match the checkpoint, which was trained with n_head={stored}"
        ),
        (Some(n_head), _) | (None, Some(n_head)) => Ok(n_head),
        (None, None) => bail!("checkpoint does not record n_head, set it with n_head=<heads>"),
    }
}

pub fn infer_config(tensors: &HashMap<String, Tensor>, n_head: usize) -> Result<GptConfig> {
    let dims2 = |name: &str| -> Result<(usize, usize)> {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| anyhow!("checkpoint has no tensor {name}"))?;
        Ok(tensor.dims2()?)
    };
    let (vocab_size, n_embd) = dims2("transformer.wte.weight")?;
    let (block_size, _) = dims2("transformer.wpe.weight")?;
    let n_layer = (0..)
        .take_while(|i| tensors.contains_key(&format!("transformer.h.{i}.ln_1.weight")))
        .count();
    ensure!(n_layer > 0, "checkpoint has no transformer blocks");
    Ok(GptConfig {
        vocab_size,
        block_size,
        n_layer,
        n_head,
        n_embd,
        bias: tensors.contains_key("transformer.h.0.attn.c_attn.bias"),
    })
}

#[cfg(test)]
mod model_tests {
    use super::*;

    fn tiny(bias: bool) -> GptConfig {
        GptConfig {
            vocab_size: 6,
            block_size: 8,
            n_layer: 2,
            n_head: 2,
            n_embd: 8,
            bias,
        }
    }

    #[test]
    fn forward_returns_last_position_logits() -> Result<()> {
        for bias in [true, false] {
            let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
            let model = Gpt::load(tiny(bias), vb)?;
            let idx = Tensor::new(&[[2u32, 1, 2, 5]], &Device::Cpu)?;
            let logits = model.forward(&idx)?;
            assert_eq!(logits.dims(), &[1, 6]);
        }
        Ok(())
    }

    #[test]
    fn rejects_context_longer_than_block() -> Result<()> {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let model = Gpt::load(tiny(true), vb)?;
        let idx = Tensor::zeros((1, 9), DType::U32, &Device::Cpu)?;
        assert!(model.forward(&idx).is_err());
        Ok(())
    }

    #[test]
    fn rejects_indivisible_heads() {
        let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
        let cfg = GptConfig {
            n_head: 3,
            ..tiny(true)
        };
        assert!(Gpt::load(cfg, vb).is_err());
    }

    fn checkpoint_tensors(cfg: &GptConfig, prefix: &str) -> Result<HashMap<String, Tensor>> {
        let dev = &Device::Cpu;
        let c = cfg.n_embd;
        let mut tensors = HashMap::new();
        let mut add = |name: String, shape: &[usize]| -> Result<()> {
            tensors.insert(format!("{prefix}{name}"), Tensor::zeros(shape, DType::F32, dev)?);
            Ok(())
        };
        add("transformer.wte.weight".into(), &[cfg.vocab_size, c])?;
        add("transformer.wpe.weight".into(), &[cfg.block_size, c])?;
        add("transformer.ln_f.weight".into(), &[c])?;
        add("transformer.ln_f.bias".into(), &[c])?;
        add("lm_head.weight".into(), &[cfg.vocab_size, c])?;
        for i in 0..cfg.n_layer {
            let h = format!("transformer.h.{i}");
            add(format!("{h}.ln_1.weight"), &[c])?;
            add(format!("{h}.ln_1.bias"), &[c])?;
            add(format!("{h}.ln_2.weight"), &[c])?;
            add(format!("{h}.ln_2.bias"), &[c])?;
            add(format!("{h}.attn.c_attn.weight"), &[3 * c, c])?;
            add(format!("{h}.attn.c_attn.bias"), &[3 * c])?;
            add(format!("{h}.attn.c_proj.weight"), &[c, c])?;
            add(format!("{h}.attn.c_proj.bias"), &[c])?;
            add(format!("{h}.mlp.c_fc.weight"), &[4 * c, c])?;
            add(format!("{h}.mlp.c_fc.bias"), &[4 * c])?;
            add(format!("{h}.mlp.c_proj.weight"), &[c, 4 * c])?;
            add(format!("{h}.mlp.c_proj.bias"), &[c])?;
        }
        Ok(tensors)
    }

    #[test]
    fn infers_shape_from_tensors() -> Result<()> {
        let tensors = checkpoint_tensors(&tiny(true), "")?;
        assert_eq!(infer_config(&tensors, 2)?, tiny(true));
        assert!(infer_config(&HashMap::new(), 2).is_err());
        Ok(())
    }

    #[test]
    fn loads_compiled_safetensors_checkpoint() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ckpt.safetensors");
        candle_core::safetensors::save(&checkpoint_tensors(&tiny(true), COMPILED_PREFIX)?, &path)?;

        let tensors = load_checkpoint(&path)?;
        assert!(tensors.contains_key("transformer.wte.weight"));
        assert!(tensors.keys().all(|k| !k.starts_with(COMPILED_PREFIX)));

        let model = Gpt::from_checkpoint(&path, Some(2), &Device::Cpu)?;
        assert_eq!(model.config(), &tiny(true));
        assert!(Gpt::from_checkpoint(&path, None, &Device::Cpu).is_err());
        let logits = model.forward(&Tensor::new(&[[0u32, 3]], &Device::Cpu)?)?;
        assert_eq!(logits.dims(), &[1, 6]);
        Ok(())
    }

    fn pickle_str(out: &mut Vec<u8>, s: &str) {
        out.push(b'X');
        out.extend((s.len() as u32).to_le_bytes());
        out.extend(s.as_bytes());
    }

    // {"model_args": {"n_layer": 1, "n_head": n_head, "n_embd": 12}, "iter_num": 0}
    fn pickled_checkpoint(n_head: u8) -> Vec<u8> {
        let mut out = vec![0x80, 2, b'}', b'('];
        pickle_str(&mut out, "model_args");
        out.extend([b'}', b'(']);
        for (key, value) in [("n_layer", 1), ("n_head", n_head), ("n_embd", 12)] {
            pickle_str(&mut out, key);
            out.extend([b'K', value]);
        }
        out.push(b'u');
        pickle_str(&mut out, "iter_num");
        out.extend([b'K', 0, b'u', b'.']);
        out
    }

    fn write_torch_archive(path: &Path, pickle: &[u8]) -> Result<()> {
        use std::io::Write;
        let mut zip = zip::ZipWriter::new(File::create(path)?);
        let options = zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored);
        zip.start_file("ckpt/data.pkl", options)?;
        zip.write_all(pickle)?;
        zip.finish()?;
        Ok(())
    }

    #[test]
    fn reads_head_count_from_model_args() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ckpt.pt");
        write_torch_archive(&path, &pickled_checkpoint(3))?;
        assert_eq!(checkpoint_n_head(&path)?, Some(3));

        let safetensors = dir.path().join("ckpt.safetensors");
        assert_eq!(checkpoint_n_head(&safetensors)?, None);
        Ok(())
    }

    #[test]
    fn head_count_mismatch_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("ckpt.pt");
        write_torch_archive(&path, &pickled_checkpoint(3))?;

        let stored = checkpoint_n_head(&path)?;
        assert_eq!(resolve_n_head(stored, None)?, 3);
        assert_eq!(resolve_n_head(stored, Some(3))?, 3);
        assert!(resolve_n_head(stored, Some(4)).is_err());
        assert!(Gpt::from_checkpoint(&path, Some(4), &Device::Cpu).is_err());
        assert_eq!(resolve_n_head(None, Some(4))?, 4);
        assert!(resolve_n_head(None, None).is_err());
        Ok(())
    }
}
