//! Output-line heuristics used while supervising a tool.
//!
//! Each predicate is a pure function over one line of tool output so that the
//! policies can be tested without spawning processes.

use std::sync::LazyLock;

use regex::Regex;

/// Maximum length (in chars) of a normalized loop signature.
pub const SIGNATURE_MAX_CHARS: usize = 300;

/// Substrings that mark a line as describing a repeated operation.
const OPERATION_KEYWORDS: &[&str] = &[
    "test", "run", "build", "generate", "fix", "optimi", "重构", "优化", "测试", "生成", "运行",
];

/// Phrases that, together with a question mark, mark a confirmation prompt.
const CONFIRM_TRIGGERS: &[&str] = &[
    "proceed", "confirm", "continue", "y/n", "yes/no", "是否", "确认", "继续",
];

static DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\d+").unwrap());
static SPACE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());
static PROGRESS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b\d{1,3}\s?%|\beta\b|remaining|progress|\bmin(ute)?s?\b|预计|还需|分钟|完成了")
        .unwrap()
});

/// Normalize a line into a loop-detection signature.
///
/// Lowercases, trims, replaces digit runs with `<n>`, collapses whitespace and
/// truncates. Blank lines normalize to the empty string.
pub fn normalize_signature(line: &str) -> String {
    let lowered = line.trim().to_lowercase();
    if lowered.is_empty() {
        return String::new();
    }
    let without_digits = DIGITS_RE.replace_all(&lowered, "<n>");
    let collapsed = SPACE_RE.replace_all(&without_digits, " ");
    collapsed.chars().take(SIGNATURE_MAX_CHARS).collect()
}

/// True if the line describes an operation worth flagging when repeated.
pub fn looks_like_operation(line: &str) -> bool {
    let lowered = line.to_lowercase();
    OPERATION_KEYWORDS.iter().any(|key| lowered.contains(key))
}

/// True if the line looks like a yes/no confirmation prompt.
pub fn should_auto_confirm(line: &str) -> bool {
    if !line.contains('?') && !line.contains('？') {
        return false;
    }
    let lowered = line.to_lowercase();
    CONFIRM_TRIGGERS.iter().any(|trigger| lowered.contains(trigger))
}

/// True if the line carries a recognizable progress statement.
pub fn has_clear_progress(line: &str) -> bool {
    PROGRESS_RE.is_match(&line.to_lowercase())
}

/// Return the first deny-list keyword contained in `line`, ignoring case on
/// both sides. Blank keywords never match.
pub fn find_error_keyword<'a>(line: &str, keywords: &'a [String]) -> Option<&'a str> {
    let lowered = line.to_lowercase();
    keywords.iter().map(String::as_str).find(|keyword| {
        let keyword = keyword.trim();
        !keyword.is_empty() && lowered.contains(&keyword.to_lowercase())
    })
}

/// Line prefixes that carry no summary value (tool chatter, JSON events).
const NOISE_PREFIXES: &[&str] = &[
    "tokens used",
    "thinking",
    "plan update",
    "exec",
    "mcp",
    "user",
    "assistant to=",
    "{",
];

const SUMMARY_MAX_CHARS: usize = 220;

/// Pick the most recent non-noise output line as a summary.
pub fn pick_summary_line(lines: &[String]) -> Option<String> {
    lines.iter().rev().find_map(|raw| {
        let line = raw.trim();
        if line.is_empty() {
            return None;
        }
        let lowered = line.to_lowercase();
        if NOISE_PREFIXES.iter().any(|prefix| lowered.starts_with(prefix)) {
            return None;
        }
        Some(truncate_chars(line, SUMMARY_MAX_CHARS))
    })
}

/// Truncate to `max` chars, appending `...` when shortened.
pub fn truncate_chars(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let kept: String = text.chars().take(max).collect();
    format!("{}...", kept.trim_end())
}
