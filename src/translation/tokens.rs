/*!
 * Local token counting.
 *
 * Providers do not always report usage. When a `tokenizer.json` is
 * configured, chunks translated without reported usage get a token count
 * computed locally over the rendered prompt and the generated text.
 */

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use tokenizers::Tokenizer;

/// Token counter backed by a Hugging Face `tokenizer.json`
pub struct TokenCounter {
    tokenizer: Tokenizer,
    source: PathBuf,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").field("source", &self.source).finish()
    }
}

impl TokenCounter {
    /// Load from a directory containing `tokenizer.json` or from the file
    /// itself
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = Self::resolve(path.as_ref())?;
        let tokenizer = Tokenizer::from_file(&json)
            .map_err(|e| anyhow!("Failed to load tokenizer from {}: {}", json.display(), e))?;
        Ok(Self {
            tokenizer,
            source: json,
        })
    }

    fn resolve(path: &Path) -> Result<PathBuf> {
        if path.is_dir() {
            let json = path.join("tokenizer.json");
            if json.is_file() {
                return Ok(json);
            }
            bail!("No tokenizer.json found in directory: {}", path.display());
        }

        if path.is_file() {
            let is_json = path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));
            if is_json {
                return Ok(path.to_path_buf());
            }
            bail!("Not a tokenizer.json file: {}", path.display());
        }

        bail!("Tokenizer path does not exist: {}", path.display());
    }

    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Token ids of `text`, without special tokens
    pub fn encode(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .tokenizer
            .encode(text, false)
            .map_err(|e| anyhow!("Failed to encode text: {}", e))?;
        Ok(encoding.get_ids().to_vec())
    }

    pub fn count(&self, text: &str) -> Result<usize> {
        Ok(self.encode(text)?.len())
    }
}
