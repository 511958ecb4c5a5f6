use anyhow::Result;

use crate::token_bin::read_tokens;
use crate::vocab::VocabMeta;
use crate::{Args, InspectCmd};

/// Decode a token array and return its first `lines` records.
pub fn decoded_records(meta: &VocabMeta, tokens: &[u16], lines: usize) -> Result<Vec<String>> {
    let vocab = meta.vocabulary()?;
    let text = vocab.decode(tokens.iter().copied())?;
    Ok(text
        .split_inclusive(meta.eos())
        .take(lines)
        .map(str::to_string)
        .collect())
}

pub fn run(args: &InspectCmd, _common_args: &Args) -> Result<()> {
    let meta = VocabMeta::load(&args.data_dir.join("meta.json"))?;
    let bin = args.data_dir.join(format!("{}.bin", args.split));
    let tokens = read_tokens(&bin)?;

    println!("vocab size: {}", meta.vocab_size);
    println!("vocab: {:?}", meta.itos.values().collect::<String>());
    println!("{}: {} tokens", bin.display(), tokens.len());
    for record in decoded_records(&meta, &tokens, args.lines)? {
        println!("{:?}", record);
    }
    Ok(())
}
