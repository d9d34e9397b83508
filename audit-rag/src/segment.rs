//! Sentence segmentation.
//!
//! Segmentation is an external collaborator; [`PunctuationSegmenter`] is the
//! built-in default.

/// Splits page text into an ordered list of sentences.
///
/// Implementations return an empty `Vec` for empty input.
pub trait SentenceSegmenter: Send + Sync {
    fn segment(&self, text: &str) -> Vec<String>;
}

/// Splits on blank lines, then on `.`, `!` or `?` followed by whitespace.
///
/// Line breaks inside a paragraph are folded into spaces and every sentence
/// is trimmed; empty pieces are dropped.
///
/// # Example
///
/// ```rust,ignore
/// use audit_rag::{PunctuationSegmenter, SentenceSegmenter};
///
/// let sentences = PunctuationSegmenter.segment("One. Two!\n\nThree");
/// assert_eq!(sentences, ["One.", "Two!", "Three"]);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct PunctuationSegmenter;

/// Split `text` after each terminator that is followed by whitespace,
/// keeping the terminator attached to the preceding sentence.
fn split_after_terminators(text: &str) -> Vec<&str> {
    let mut result = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();

    while let Some((pos, c)) = chars.next() {
        if matches!(c, '.' | '!' | '?') {
            if let Some(&(next_pos, next)) = chars.peek() {
                if next.is_whitespace() {
                    result.push(&text[start..next_pos]);
                    start = next_pos;
                }
            } else {
                result.push(&text[start..pos + c.len_utf8()]);
                start = text.len();
            }
        }
    }

    if start < text.len() {
        result.push(&text[start..]);
    }

    result
}

impl SentenceSegmenter for PunctuationSegmenter {
    fn segment(&self, text: &str) -> Vec<String> {
        let mut sentences = Vec::new();
        for paragraph in text.split("\n\n") {
            let folded = paragraph.split_whitespace().collect::<Vec<_>>().join(" ");
            for piece in split_after_terminators(&folded) {
                let piece = piece.trim();
                if !piece.is_empty() {
                    sentences.push(piece.to_string());
                }
            }
        }
        sentences
    }
}
