//! Directives addressed to the service account in change bodies and comments.
//!
//! A directive is `@<account>` followed by whitespace and a directive word:
//!
//! - The mention is case-insensitive, like hosting-service mentions
//! - The mention must be at a word boundary (not preceded by an alphanumeric char)
//! - Directive words (`retest`, `ignore`) are case-insensitive
//! - The first valid directive in the text wins

/// An instruction to the service account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    /// Rebuild without a new commit
    Retest,
    /// Stop building this change
    Ignore,
}

impl Directive {
    pub fn as_str(&self) -> &'static str {
        match self {
            Directive::Retest => "retest",
            Directive::Ignore => "ignore",
        }
    }
}

/// Parses the first directive addressed to `account` (without the `@`).
///
/// ```
/// use tripwire_core::directive::{parse_directive, Directive};
///
/// assert_eq!(parse_directive("@ci-bot retest", "ci-bot"), Some(Directive::Retest));
/// assert_eq!(parse_directive("please @CI-Bot  IGNORE", "ci-bot"), Some(Directive::Ignore));
/// assert_eq!(parse_directive("mail@ci-bot retest", "ci-bot"), None);
/// assert_eq!(parse_directive("@ci-bot retesting", "ci-bot"), None);
/// ```
pub fn parse_directive(text: &str, account: &str) -> Option<Directive> {
    if account.is_empty() {
        return None;
    }
    let trigger = format!("@{account}");
    let mut search_start = 0;
    while let Some(abs_pos) = find_mention(text, search_start, &trigger) {
        let after = &text[abs_pos + trigger.len()..];
        if let Some(directive) = directive_after_mention(after) {
            return Some(directive);
        }
        search_start = abs_pos + trigger.len();
    }
    None
}

/// `true` if `text` carries `directive` addressed to `account`.
pub fn has_directive(text: &str, account: &str, directive: Directive) -> bool {
    parse_directive(text, account) == Some(directive)
}

/// Byte position of the next `@account` mention at a word boundary.
fn find_mention(text: &str, start: usize, trigger: &str) -> Option<usize> {
    let mut search_pos = start;
    while search_pos < text.len() {
        let abs_pos = search_pos + text[search_pos..].find('@')?;

        // `get` fails when the end lands inside a multi-byte char.
        if let Some(candidate) = text.get(abs_pos..abs_pos + trigger.len()) {
            if candidate.eq_ignore_ascii_case(trigger) {
                let at_boundary = text[..abs_pos]
                    .chars()
                    .next_back()
                    .map_or(true, |prev| !prev.is_alphanumeric());
                // `@ci-bot2` is a different account.
                let account_ends = text[abs_pos + trigger.len()..]
                    .chars()
                    .next()
                    .map_or(true, |next| !(next.is_alphanumeric() || next == '-' || next == '_'));
                if at_boundary && account_ends {
                    return Some(abs_pos);
                }
            }
        }
        search_pos = abs_pos + 1;
    }
    None
}

fn directive_after_mention(text: &str) -> Option<Directive> {
    let text = text.strip_prefix(|c: char| c.is_whitespace())?;
    let text = text.trim_start();
    let word_end = text
        .find(|c: char| !c.is_alphanumeric())
        .unwrap_or(text.len());

    match text[..word_end].to_ascii_lowercase().as_str() {
        "retest" => Some(Directive::Retest),
        "ignore" => Some(Directive::Ignore),
        _ => None,
    }
}
