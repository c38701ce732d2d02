/*!
 * Splits source text into ordered chunks.
 *
 * Sizes are counted in chars (Unicode scalar values). A chunk never exceeds
 * the target size; inside each window the cut prefers, in order, the last
 * paragraph break, line break, sentence end and whitespace, as long as the
 * cut keeps at least half a window. Failing that the window is cut hard,
 * stepping back so combining sequences and `\r\n` pairs stay intact.
 * Concatenating the chunks always gives back the input.
 */

use once_cell::sync::Lazy;
use regex::Regex;

use crate::errors::{EngineError, EngineResult};

/// Sentence terminators. Latin punctuation needs trailing whitespace, CJK
/// full-width punctuation stands alone.
static SENTENCE_END: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[.!?…][\)\]\x22'»”’]*\s|[。！？][」』）]*").expect("sentence regex is valid")
});

/// Split `text` into chunks of at most `target_chars` chars
pub fn split_text(text: &str, target_chars: usize) -> EngineResult<Vec<String>> {
    if text.is_empty() {
        return Err(EngineError::Validation("source text is empty".to_string()));
    }
    if target_chars == 0 {
        return Err(EngineError::Validation("chunk size must be greater than zero".to_string()));
    }

    let mut chunks = Vec::new();
    let mut rest = text;

    while !rest.is_empty() {
        // Byte offset just past the first `target_chars` chars, if the rest is longer
        let Some((window_end, _)) = rest.char_indices().nth(target_chars) else {
            chunks.push(rest.to_string());
            break;
        };

        let window = Window { rest, end: window_end };
        let cut = window
            .soft_boundary(target_chars)
            .unwrap_or_else(|| window.hard_boundary());

        chunks.push(rest[..cut].to_string());
        rest = &rest[cut..];
    }

    Ok(chunks)
}

/// The first `target_chars` chars of the remaining text
struct Window<'a> {
    rest: &'a str,
    end: usize,
}

impl Window<'_> {
    fn text(&self) -> &str {
        &self.rest[..self.end]
    }

    /// Whether cutting at byte offset `cut` keeps sequences intact
    fn is_safe(&self, cut: usize) -> bool {
        match (self.rest[..cut].chars().next_back(), self.rest[cut..].chars().next()) {
            (Some(before), Some(after)) => is_safe_cut(before, after),
            _ => false,
        }
    }

    /// Preferred cut, if one keeps at least half the window
    fn soft_boundary(&self, target_chars: usize) -> Option<usize> {
        let window = self.text();
        let min_chars = (target_chars / 2).max(1);
        let acceptable = |cut: &usize| window[..*cut].chars().count() >= min_chars && self.is_safe(*cut);

        let paragraph = ["\n\n", "\n\r\n"]
            .iter()
            .filter_map(|sep| window.rfind(sep).map(|i| i + sep.len()))
            .max();
        let line = window.rfind('\n').map(|i| i + 1);
        let sentence = SENTENCE_END.find_iter(window).last().map(|m| m.end());
        let space = window
            .char_indices()
            .rev()
            .filter(|(_, c)| c.is_whitespace())
            .map(|(i, c)| i + c.len_utf8())
            .find(|cut| acceptable(cut));

        [paragraph, line, sentence, space]
            .into_iter()
            .flatten()
            .find(|cut| acceptable(cut))
    }

    /// Cut at the window end, stepping back over positions that would break
    /// a combining sequence. Falls back to the window end when no position
    /// is safe.
    fn hard_boundary(&self) -> usize {
        let mut cut = self.end;
        while cut > 0 {
            if self.is_safe(cut) {
                return cut;
            }
            cut = self.rest[..cut]
                .char_indices()
                .next_back()
                .map(|(i, _)| i)
                .unwrap_or(0);
        }
        self.end
    }
}

/// Whether the text may be cut between `before` and `after`
fn is_safe_cut(before: char, after: char) -> bool {
    !(before == '\r' && after == '\n') && before != '\u{200D}' && !is_extending(after)
}

/// Chars that attach to the preceding char
fn is_extending(c: char) -> bool {
    matches!(c as u32,
        0x0300..=0x036F      // combining diacritical marks
        | 0x0483..=0x0489    // cyrillic combining marks
        | 0x0591..=0x05BD    // hebrew points
        | 0x064B..=0x065F    // arabic harakat
        | 0x0900..=0x0903    // devanagari signs
        | 0x093A..=0x094F
        | 0x1AB0..=0x1AFF    // combining diacritical marks extended
        | 0x1DC0..=0x1DFF    // combining diacritical marks supplement
        | 0x200C..=0x200D    // ZWNJ, ZWJ
        | 0x20D0..=0x20FF    // combining marks for symbols
        | 0x3099..=0x309A    // kana voiced sound marks
        | 0xFE00..=0xFE0F    // variation selectors
        | 0xFE20..=0xFE2F    // combining half marks
        | 0x1F3FB..=0x1F3FF  // emoji skin tone modifiers
        | 0xE0020..=0xE007F  // tags
        | 0xE0100..=0xE01EF  // variation selectors supplement
    )
}
