/*!
 * Custom dictionary attached to a session.
 *
 * The dictionary is free text with one `source=target` pair per line.
 * Blank lines and `#` comments are ignored; lines without `=` or with an
 * empty source term are skipped.
 */

use log::debug;

/// One forced translation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictionaryEntry {
    pub source: String,
    pub target: String,
}

/// Parsed custom dictionary
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomDictionary {
    entries: Vec<DictionaryEntry>,
}

impl CustomDictionary {
    /// Parse dictionary text
    pub fn parse(text: &str) -> Self {
        let mut entries: Vec<DictionaryEntry> = Vec::new();

        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((source, target)) = line.split_once('=') else {
                debug!("Dictionary line {} has no '=', skipped: {}", line_no + 1, line);
                continue;
            };
            let (source, target) = (source.trim(), target.trim());
            if source.is_empty() {
                debug!("Dictionary line {} has an empty source term, skipped", line_no + 1);
                continue;
            }

            // Later lines override earlier ones for the same term
            entries.retain(|e| e.source != source);
            entries.push(DictionaryEntry {
                source: source.to_string(),
                target: target.to_string(),
            });
        }

        Self { entries }
    }

    /// Parse an optional session dictionary
    pub fn from_session(dictionary: Option<&str>) -> Self {
        dictionary.map(Self::parse).unwrap_or_default()
    }

    pub fn entries(&self) -> &[DictionaryEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Prompt block listing the forced translations, empty when there are none
    pub fn render_block(&self) -> String {
        if self.entries.is_empty() {
            return String::new();
        }

        let mut block = String::from("Always translate these terms exactly as listed:\n");
        for entry in &self.entries {
            block.push_str(&format!("- {} => {}\n", entry.source, entry.target));
        }
        block
    }
}
