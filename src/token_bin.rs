//! Token arrays on disk: a flat run of little-endian `u16` ids, no header.
//! The element count is the file size divided by two.

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::vocab::TokenId;

pub const TOKEN_BYTES: usize = std::mem::size_of::<TokenId>();

pub fn write_tokens(path: &Path, tokens: &[TokenId]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    for token in tokens {
        writer.write_all(&token.to_le_bytes())?;
    }
    writer
        .flush()
        .with_context(|| format!("writing {}", path.display()))
}

pub fn read_tokens(path: &Path) -> Result<Vec<TokenId>> {
    let bytes = fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    if bytes.len() % TOKEN_BYTES != 0 {
        bail!(
            "{} is {} bytes, not a whole number of {TOKEN_BYTES}-byte tokens",
            path.display(),
            bytes.len()
        );
    }
    Ok(bytes
        .chunks_exact(TOKEN_BYTES)
        .map(|chunk| TokenId::from_le_bytes([chunk[0], chunk[1]]))
        .collect())
}
