use crate::models::DEFAULT_CHAT_TITLE;
use once_cell::sync::Lazy;
use regex::Regex;

pub const TITLE_MAX_WORDS: usize = 6;
pub const TITLE_MAX_CHARS: usize = 50;
const ELLIPSIS: &str = "...";

static HEADING: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s{0,3}#{1,6}\s*").unwrap());
static QUOTE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?m)^\s*>\s?").unwrap());
static LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"!?\[([^\]]*)\]\([^)]*\)").unwrap());
static MARKERS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*~`]+").unwrap());
static UNDERSCORES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(^|\s)_+|_+(\s|$)").unwrap());

fn strip_markdown(text: &str) -> String {
    let text = HEADING.replace_all(text, "");
    let text = QUOTE.replace_all(&text, "");
    let text = LINK.replace_all(&text, "$1");
    let text = MARKERS.replace_all(&text, "");
    UNDERSCORES.replace_all(&text, " ").into_owned()
}

/// Derives a chat title from the first message of a conversation.
///
/// Takes the first six words of the markdown-stripped text. When words were
/// dropped or the result runs past fifty characters, it is shortened so that
/// the title including the trailing ellipsis stays within fifty characters.
pub fn generate_title(text: &str) -> String {
    let plain = strip_markdown(text);
    let words: Vec<&str> = plain.split_whitespace().collect();
    if words.is_empty() {
        return DEFAULT_CHAT_TITLE.to_string();
    }

    let title = words
        .iter()
        .take(TITLE_MAX_WORDS)
        .copied()
        .collect::<Vec<_>>()
        .join(" ");

    if words.len() <= TITLE_MAX_WORDS && title.chars().count() <= TITLE_MAX_CHARS {
        return title;
    }

    let keep = TITLE_MAX_CHARS - ELLIPSIS.len();
    let mut short: String = title.chars().take(keep).collect();
    short.truncate(short.trim_end().len());
    short.push_str(ELLIPSIS);
    short
}
