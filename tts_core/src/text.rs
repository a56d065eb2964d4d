/// Punctuation the synthesizer can voice or pause on.
const SPEAKABLE_PUNCTUATION: &str = "，。！？、；：“”‘’（）【】《》-,.!?;:'\"()";

/// CJK unified ideographs, ASCII letters and digits, whitespace and common
/// punctuation.
pub fn is_speakable(c: char) -> bool {
    matches!(c, '\u{4e00}'..='\u{9fa5}')
        || c.is_ascii_alphanumeric()
        || c.is_whitespace()
        || SPEAKABLE_PUNCTUATION.contains(c)
}

/// Strip everything the synthesizer should not read aloud (emoji, markdown
/// symbols and the like) and trim the result.
pub fn filter_speakable(text: &str) -> String {
    text.chars()
        .filter(|c| is_speakable(*c))
        .collect::<String>()
        .trim()
        .to_string()
}

/// Filtered chunk text, or `None` when nothing but punctuation and
/// whitespace would be left to say.
pub fn speakable_text(chunk: &str) -> Option<String> {
    let text = filter_speakable(chunk);
    text.chars().any(char::is_alphanumeric).then_some(text)
}
