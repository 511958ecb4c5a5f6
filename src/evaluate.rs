use anyhow::{anyhow, bail, Result};
use kdam::tqdm;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::InferenceConfig;
use crate::corpus::RecordFormat;
use crate::inference::{load_generator, Generator};
use crate::vocab::Vocabulary;
use crate::{Args, InferenceCmd};

/// Number of cases echoed for manual inspection.
const ECHOED_CASES: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct EvalCase {
    pub prompt: String,
    pub answer: String,
    /// `None` when the answer is not an integer.
    pub predicted: Option<i64>,
    pub target: i64,
}

impl EvalCase {
    pub fn is_correct(&self) -> bool {
        self.predicted == Some(self.target)
    }
}

impl std::fmt::Display for EvalCase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mark = if self.is_correct() { "OK" } else { "FAIL" };
        write!(
            f,
            "[{mark}] {} -> Predicted: '{}' (Target: {})",
            self.prompt.escape_debug(),
            self.answer.escape_debug(),
            self.target
        )
    }
}

#[derive(Debug, Default)]
pub struct EvalReport {
    pub cases: Vec<EvalCase>,
}

impl EvalReport {
    pub fn correct(&self) -> usize {
        self.cases.iter().filter(|c| c.is_correct()).count()
    }

    pub fn total(&self) -> usize {
        self.cases.len()
    }

    /// Exact-match accuracy in percent, zero for an empty run.
    pub fn accuracy(&self) -> f64 {
        if self.cases.is_empty() {
            0.0
        } else {
            self.correct() as f64 * 100.0 / self.total() as f64
        }
    }
}

/// Prompts random addition problems and scores the generated answers.
pub struct Evaluator<'a> {
    vocab: &'a Vocabulary,
    format: RecordFormat,
    stop_id: u32,
    operand_limit: i64,
    max_new_tokens: usize,
}

impl<'a> Evaluator<'a> {
    pub fn new(
        vocab: &'a Vocabulary,
        format: RecordFormat,
        digits: usize,
        max_new_tokens: usize,
    ) -> Result<Self> {
        let mut stop = format.stop_token.chars();
        let stop_char = match (stop.next(), stop.next()) {
            (Some(ch), None) => ch,
            _ => bail!(
                "evaluation needs a single-character stop token, got {:?}",
                format.stop_token
            ),
        };
        let stop_id = vocab
            .id(stop_char)
            .ok_or_else(|| anyhow!("stop token {stop_char:?} is not in the vocabulary"))?;
        let operand_limit = u32::try_from(digits)
            .ok()
            .filter(|d| (1..=9).contains(d))
            .map(|d| 10i64.pow(d))
            .ok_or_else(|| anyhow!("operand digits must be between 1 and 9, got {digits}"))?;
        Ok(Self {
            vocab,
            format,
            stop_id: u32::from(stop_id),
            operand_limit,
            max_new_tokens,
        })
    }

    /// Ask `generator` for `a + b` and score its answer.
    pub fn case<G: Generator>(&self, generator: &mut G, a: i64, b: i64) -> Result<EvalCase> {
        let prompt = self.format.prompt(&format!("{a}+{b}"));
        let prompt_ids: Vec<u32> = self
            .vocab
            .encode(&prompt)?
            .into_iter()
            .map(u32::from)
            .collect();
        let output = generator.generate(&prompt_ids, self.max_new_tokens, Some(self.stop_id))?;
        let decoded = self.vocab.decode(output)?;
        let answer = extract_answer(&decoded, &prompt, &self.format.stop_token);
        Ok(EvalCase {
            predicted: answer.parse().ok(),
            answer,
            target: a + b,
            prompt,
        })
    }

    pub fn run<G: Generator, R: Rng>(
        &self,
        generator: &mut G,
        num_samples: usize,
        rng: &mut R,
    ) -> Result<EvalReport> {
        let mut report = EvalReport::default();
        for i in tqdm!(0..num_samples, total = num_samples, desc = "Evaluating") {
            let a = rng.gen_range(0..self.operand_limit);
            let b = rng.gen_range(0..self.operand_limit);
            let case = self.case(generator, a, b)?;
            if i < ECHOED_CASES {
                println!("{case}");
            }
            report.cases.push(case);
        }
        Ok(report)
    }
}

/// The text between the prompt and the first stop token, trimmed.
pub fn extract_answer(decoded: &str, prompt: &str, stop_token: &str) -> String {
    let generated = decoded
        .strip_prefix(prompt)
        .unwrap_or_else(|| decoded.get(prompt.len()..).unwrap_or(""));
    let answer = match generated.find(stop_token) {
        Some(end) => &generated[..end],
        None => generated,
    };
    answer.trim().to_string()
}

pub fn run(args: &InferenceCmd, common_args: &Args) -> Result<()> {
    let cfg = InferenceConfig::load(args.config.as_deref(), &args.overrides)?;
    let (mut generator, meta) = load_generator(&cfg, common_args)?;
    let vocab = meta.vocabulary()?;
    let format = RecordFormat {
        sep: meta.sep().to_string(),
        stop_token: meta.eos().to_string(),
    };
    let evaluator = Evaluator::new(&vocab, format, cfg.operand_digits(), cfg.max_new_tokens)?;

    println!("\nStarting evaluation (N={})...", cfg.num_samples);
    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let report = evaluator.run(&mut generator, cfg.num_samples, &mut rng)?;

    println!("{}", "-".repeat(30));
    println!("Final Result: {}/{} Correct", report.correct(), report.total());
    println!("Accuracy: {:.2}%", report.accuracy());
    Ok(())
}
