//! Text helpers for the streaming dialogue path: punctuation segmentation,
//! emoji/Markdown stripping, wake-word matching and tool-call JSON
//! extraction.

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use regex::Regex;

/// Sentence terminators recognized by the stream segmenter: CJK and ASCII.
const PUNCTUATION: &[char] = &[
    '。', '！', '？', '；', '：', '，', '、', '.', '!', '?', ';', ':', ',',
];

/// Wake phrases answered from the quick-reply cache on the first round.
const WAKE_WORDS: &[&str] = &[
    "你好", "你好呀", "在吗", "在么", "hello", "hi", "hey", "hey there",
];

/// Find the last punctuation boundary in `text` and split there.
///
/// Returns the segment up to and including the punctuation mark, plus the
/// number of bytes consumed from `text`. Returns `None` when `text`
/// contains no boundary yet — the caller keeps accumulating.
pub fn split_at_last_punctuation(text: &str) -> Option<(&str, usize)> {
    let mut boundary = None;
    for (idx, ch) in text.char_indices() {
        if PUNCTUATION.contains(&ch) {
            boundary = Some(idx + ch.len_utf8());
        }
    }
    boundary.map(|end| (&text[..end], end))
}

/// Split `text` into sentences at every punctuation boundary, keeping the
/// trailing remainder as its own segment. Empty segments are dropped.
pub fn split_by_punctuation(text: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, ch) in text.char_indices() {
        if PUNCTUATION.contains(&ch) {
            let end = idx + ch.len_utf8();
            let seg = text[start..end].trim();
            if !seg.is_empty() {
                out.push(seg.to_string());
            }
            start = end;
        }
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        out.push(tail.to_string());
    }
    out
}

/// Strip all punctuation and whitespace. Used for exact-match command
/// comparison (exit intent, wake words).
pub fn remove_all_punctuation(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_ascii_punctuation() && !c.is_whitespace() && !PUNCTUATION.contains(c))
        .collect()
}

/// Remove emoji and other pictographic codepoints.
pub fn remove_emoji(text: &str) -> String {
    text.chars()
        .filter(|&c| {
            let cp = c as u32;
            // Misc symbols, dingbats, emoji blocks, variation selectors.
            !((0x1F000..=0x1FAFF).contains(&cp)
                || (0x2600..=0x27BF).contains(&cp)
                || (0xFE00..=0xFE0F).contains(&cp)
                || (0x1F1E6..=0x1F1FF).contains(&cp)
                || cp == 0x200D)
        })
        .collect()
}

static MD_LINK: Lazy<Regex> = Lazy::new(|| Regex::new(r"\[([^\]]*)\]\([^)]*\)").unwrap());
static MD_CODE_FENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"```[^`]*```").unwrap());
static MD_MARKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[*_~`#>]+").unwrap());

/// Strip Markdown syntax so it never reaches the synthesizer.
pub fn remove_markdown(text: &str) -> String {
    let no_fence = MD_CODE_FENCE.replace_all(text, " ");
    let no_links = MD_LINK.replace_all(&no_fence, "$1");
    MD_MARKS.replace_all(&no_links, "").to_string()
}

/// Exact wake-word match on the punctuation-stripped utterance.
pub fn is_wake_up_word(text: &str) -> bool {
    let cleaned = remove_all_punctuation(text).to_lowercase();
    WAKE_WORDS.iter().any(|w| cleaned == w.to_lowercase())
}

/// True when `text` equals one of the configured quick-reply phrases after
/// punctuation stripping.
pub fn is_quick_reply_hit(text: &str, words: &[String]) -> bool {
    let cleaned = remove_all_punctuation(text);
    words.iter().any(|w| remove_all_punctuation(w) == cleaned)
}

/// Pick a random element of `items`.
pub fn random_select(items: &[String]) -> Option<&String> {
    items.choose(&mut rand::thread_rng())
}

/// Extract the first balanced JSON object embedded in `text`.
///
/// Some models emit tool calls as `<tool_call>{"name": ..., "arguments":
/// ...}</tool_call>` text instead of structured deltas.
pub fn extract_json_object(text: &str) -> Option<serde_json::Value> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_str = false;
    let mut escape = false;
    for (idx, ch) in text[start..].char_indices() {
        if escape {
            escape = false;
            continue;
        }
        match ch {
            '\\' if in_str => escape = true,
            '"' => in_str = !in_str,
            '{' if !in_str => depth += 1,
            '}' if !in_str => {
                depth -= 1;
                if depth == 0 {
                    let candidate = &text[start..start + idx + 1];
                    return serde_json::from_str(candidate).ok();
                }
            }
            _ => {}
        }
    }
    None
}

/// Truncate to at most `max_chars` characters on a char boundary.
pub fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Music files live in a dedicated library and are never deleted by the
/// egress cleanup.
pub fn is_music_file(path: &str) -> bool {
    path.split('/').any(|part| part == "music")
        || path.ends_with(".mp3")
        || path.ends_with(".flac")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_at_last_punctuation_ascii() {
        let (seg, consumed) = split_at_last_punctuation("It's 3 o'clock. And then").unwrap();
        assert_eq!(seg, "It's 3 o'clock.");
        assert_eq!(consumed, seg.len());
    }

    #[test]
    fn test_split_at_last_punctuation_cjk() {
        let text = "今天天气不错。我们出去走走吧，好";
        let (seg, consumed) = split_at_last_punctuation(text).unwrap();
        assert!(seg.ends_with('，'));
        assert_eq!(&text[consumed..], "好");
    }

    #[test]
    fn test_split_at_last_punctuation_none() {
        assert!(split_at_last_punctuation("no boundary yet").is_none());
    }

    #[test]
    fn test_split_by_punctuation() {
        let segs = split_by_punctuation("One. Two! Three");
        assert_eq!(segs, vec!["One.", "Two!", "Three"]);
    }

    #[test]
    fn test_remove_all_punctuation() {
        assert_eq!(remove_all_punctuation("再见。"), "再见");
        assert_eq!(remove_all_punctuation("good bye!"), "goodbye");
    }

    #[test]
    fn test_remove_emoji() {
        assert_eq!(remove_emoji("hello 😀 world ☀️"), "hello  world ");
    }

    #[test]
    fn test_remove_markdown() {
        assert_eq!(remove_markdown("**bold** and [link](http://x)"), "bold and link");
        assert_eq!(remove_markdown("`code` # heading"), "code  heading");
    }

    #[test]
    fn test_wake_word() {
        assert!(is_wake_up_word("你好！"));
        assert!(is_wake_up_word("Hello."));
        assert!(!is_wake_up_word("what time is it"));
    }

    #[test]
    fn test_quick_reply_hit() {
        let words = vec!["我在呢".to_string(), "哎".to_string()];
        assert!(is_quick_reply_hit("我在呢。", &words));
        assert!(!is_quick_reply_hit("别的话", &words));
    }

    #[test]
    fn test_extract_json_object() {
        let text = "<tool_call>{\"name\": \"weather\", \"arguments\": {\"city\": \"Paris\"}}</tool_call>";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["name"], "weather");
        assert_eq!(v["arguments"]["city"], "Paris");
    }

    #[test]
    fn test_extract_json_object_nested_braces_in_string() {
        let text = "junk {\"a\": \"br{ace}\"} tail";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["a"], "br{ace}");
    }

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("abcdef", 3), "abc");
        assert_eq!(truncate_chars("短句", 10), "短句");
    }

    #[test]
    fn test_is_music_file() {
        assert!(is_music_file("/data/music/song.opus"));
        assert!(is_music_file("track.mp3"));
        assert!(!is_music_file("/tmp/tts_42.wav"));
    }
}
