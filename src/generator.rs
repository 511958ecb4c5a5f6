use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use clap::ValueEnum;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{Args, GenerateCmd};

/// One addition problem and its answer, e.g. `12+34` / `46`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sample {
    pub input: String,
    pub output: String,
}

impl Sample {
    pub fn addition(a: u64, b: u64) -> Self {
        Self {
            input: format!("{a}+{b}"),
            output: (a + b).to_string(),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum GenerationMode {
    /// Every ordered operand pair, `a` major.
    Exhaustive,
    /// `count` uniform draws with replacement.
    Random { count: usize },
}

/// Exclusive upper bound of a `digits`-digit operand.
pub fn operand_limit(digits: u32) -> Result<u64> {
    if !(1..=9).contains(&digits) {
        bail!("operand digits must be between 1 and 9, got {digits}");
    }
    Ok(10u64.pow(digits))
}

pub fn addition_samples<R: Rng>(
    digits: u32,
    mode: GenerationMode,
    rng: &mut R,
) -> Result<Vec<Sample>> {
    let limit = operand_limit(digits)?;
    let samples = match mode {
        GenerationMode::Exhaustive => {
            info!("generating exhaustive dataset for {digits}-digit addition");
            (0..limit)
                .flat_map(|a| (0..limit).map(move |b| Sample::addition(a, b)))
                .collect()
        }
        GenerationMode::Random { count } => {
            info!("generating {count} random samples for {digits}-digit addition");
            (0..count)
                .map(|_| Sample::addition(rng.gen_range(0..limit), rng.gen_range(0..limit)))
                .collect()
        }
    };
    Ok(samples)
}

/// Write one JSON object per line, in sample order.
pub fn write_jsonl(path: &Path, samples: &[Sample]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {}", parent.display()))?;
    }
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for sample in samples {
        serde_json::to_writer(&mut writer, sample)?;
        writer.write_all(b"\n")?;
    }
    writer
        .flush()
        .with_context(|| format!("writing {}", path.display()))?;
    info!("saved {} samples to {}", samples.len(), path.display());
    Ok(())
}

/// The stock datasets used by the addition experiments.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum Preset {
    /// 1-digit, exhaustive (100 samples).
    Basic,
    /// 2-digit, exhaustive (10000 samples).
    Intermediate,
    /// 3-digit, 10000 random samples.
    Random3,
    /// All of the above.
    All,
}

impl Preset {
    fn expand(self) -> Vec<(&'static str, u32, GenerationMode)> {
        let basic = ("addition_basic.jsonl", 1, GenerationMode::Exhaustive);
        let intermediate = ("addition_intermediate.jsonl", 2, GenerationMode::Exhaustive);
        let random3 = (
            "addition_3digit_random.jsonl",
            3,
            GenerationMode::Random { count: 10_000 },
        );
        match self {
            Preset::Basic => vec![basic],
            Preset::Intermediate => vec![intermediate],
            Preset::Random3 => vec![random3],
            Preset::All => vec![basic, intermediate, random3],
        }
    }
}

pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

pub fn run(args: &GenerateCmd, _common_args: &Args) -> Result<()> {
    let mut rng = seeded_rng(args.seed);

    if let Some(preset) = args.preset {
        for (name, digits, mode) in preset.expand() {
            let samples = addition_samples(digits, mode, &mut rng)?;
            write_jsonl(&args.out_dir.join(name), &samples)?;
        }
        return Ok(());
    }

    let (Some(digits), Some(out)) = (args.digits, args.out.as_deref()) else {
        bail!("either --preset or both --digits and --out are required");
    };
    let mode = match args.samples {
        Some(count) => GenerationMode::Random { count },
        None => GenerationMode::Exhaustive,
    };
    let samples = addition_samples(digits, mode, &mut rng)?;
    write_jsonl(out, &samples)
}

#[cfg(test)]
mod generator_tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn exhaustive_one_digit_covers_every_pair() -> Result<()> {
        let samples = addition_samples(1, GenerationMode::Exhaustive, &mut seeded_rng(Some(0)))?;
        assert_eq!(samples.len(), 100);

        let inputs: HashSet<_> = samples.iter().map(|s| s.input.as_str()).collect();
        assert_eq!(inputs.len(), 100);
        for a in 0..10 {
            for b in 0..10 {
                assert!(inputs.contains(format!("{a}+{b}").as_str()));
            }
        }

        assert_eq!(samples[0], Sample::addition(0, 0));
        assert_eq!(samples[1].input, "0+1");
        assert_eq!(samples[10].input, "1+0");
        let last = samples.last().unwrap();
        assert_eq!(last.input, "9+9");
        assert_eq!(last.output, "18");
        Ok(())
    }

    #[test]
    fn exhaustive_two_digit_count() -> Result<()> {
        let samples = addition_samples(2, GenerationMode::Exhaustive, &mut seeded_rng(None))?;
        assert_eq!(samples.len(), 10_000);
        assert_eq!(samples[9_999].output, "198");
        Ok(())
    }

    #[test]
    fn random_samples_stay_in_range() -> Result<()> {
        let samples = addition_samples(
            3,
            GenerationMode::Random { count: 500 },
            &mut seeded_rng(Some(7)),
        )?;
        assert_eq!(samples.len(), 500);
        for sample in &samples {
            let (a, b) = sample.input.split_once('+').unwrap();
            let (a, b): (u64, u64) = (a.parse()?, b.parse()?);
            assert!(a < 1000 && b < 1000);
            assert_eq!(sample.output, (a + b).to_string());
        }
        Ok(())
    }

    #[test]
    fn same_seed_same_draws() -> Result<()> {
        let mode = GenerationMode::Random { count: 20 };
        let first = addition_samples(2, mode, &mut seeded_rng(Some(42)))?;
        let second = addition_samples(2, mode, &mut seeded_rng(Some(42)))?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn rejects_out_of_range_digits() {
        assert!(operand_limit(0).is_err());
        assert!(operand_limit(10).is_err());
        assert_eq!(operand_limit(3).unwrap(), 1000);
    }

    #[test]
    fn writes_one_object_per_line() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("nested/addition.jsonl");
        write_jsonl(&path, &[Sample::addition(1, 1), Sample::addition(12, 34)])?;

        let text = fs::read_to_string(&path)?;
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(
            lines,
            [
                r#"{"input":"1+1","output":"2"}"#,
                r#"{"input":"12+34","output":"46"}"#
            ]
        );
        Ok(())
    }

    #[test]
    fn presets_expand_to_stock_datasets() {
        assert_eq!(Preset::All.expand().len(), 3);
        assert_eq!(
            Preset::Random3.expand(),
            vec![(
                "addition_3digit_random.jsonl",
                3,
                GenerationMode::Random { count: 10_000 }
            )]
        );
    }
}
