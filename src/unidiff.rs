use aho_corasick::{AhoCorasick, MatchKind};
use imara_diff::{
    intern::{Interner, Token},
    Algorithm,
};
use serde::{Deserialize, Serialize};
use std::{ops::Range, sync::LazyLock};

/// Line- and word-level changes extracted from one unified diff.
///
/// The serialized field names match the keys attached to enriched revision records.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffDecomposition {
    /// Added lines without a paired removal.
    #[serde(rename = "Added_Lines")]
    pub added_lines: Vec<String>,
    /// Removed lines without a paired addition.
    #[serde(rename = "Removed_Lines")]
    pub removed_lines: Vec<String>,
    /// Words only present in the added half of a substitution pair.
    #[serde(rename = "Added_Words")]
    pub added_words: Vec<String>,
    /// Words only present in the removed half of a substitution pair.
    #[serde(rename = "Removed_Words")]
    pub removed_words: Vec<String>,
}

impl DiffDecomposition {
    pub fn is_empty(&self) -> bool {
        self.added_lines.is_empty()
            && self.removed_lines.is_empty()
            && self.added_words.is_empty()
            && self.removed_words.is_empty()
    }
}

/// Classification of a single line of a unified diff body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HunkLine<'a> {
    /// `@@`, `---` or `+++` marker
    Header,
    /// `-` prefixed line, text after the marker (untrimmed)
    Removal(&'a str),
    /// `+` prefixed line, text after the marker (untrimmed)
    Addition(&'a str),
    /// anything else, including unchanged context
    Context,
}

impl<'a> HunkLine<'a> {
    pub fn classify(line: &'a str) -> Self {
        if line.starts_with("@@") || line.starts_with("---") || line.starts_with("+++") {
            HunkLine::Header
        } else if let Some(rest) = line.strip_prefix('-') {
            HunkLine::Removal(rest)
        } else if let Some(rest) = line.strip_prefix('+') {
            HunkLine::Addition(rest)
        } else {
            HunkLine::Context
        }
    }
}

/// Every sequence that terminates a line. `\r\n` counts as one terminator.
const LINE_BREAKS: [&str; 11] = [
    "\r\n", "\n", "\r", "\x0b", "\x0c", "\x1c", "\x1d", "\x1e", "\u{85}", "\u{2028}", "\u{2029}",
];

static LINE_BREAK_MATCHER: LazyLock<AhoCorasick> = LazyLock::new(|| {
    AhoCorasick::builder()
        .match_kind(MatchKind::LeftmostLongest)
        .build(LINE_BREAKS)
        .unwrap() /* patterns are static */
});

/// Split `text` into lines.
///
/// `\n`, `\r\n`, a lone `\r`, the vertical tab and form feed, the ASCII file, group and record
/// separators, `U+0085` and the Unicode line and paragraph separators all terminate a line. A
/// terminator at the very end of the input does not produce a trailing empty line, and empty
/// input produces no lines at all.
pub fn split_lines(text: &str) -> impl Iterator<Item = &str> + '_ {
    let mut rest = text;
    std::iter::from_fn(move || {
        if rest.is_empty() {
            return None;
        }

        match LINE_BREAK_MATCHER.find(rest) {
            Some(m) => {
                let line = &rest[..m.start()];
                rest = &rest[m.end()..];
                Some(line)
            }
            None => {
                let line = rest;
                rest = "";
                Some(line)
            }
        }
    })
}

/// Characters that separate words and are trimmed from line ends.
///
/// Unicode whitespace plus the ASCII information separators `\x1c`..=`\x1f`.
fn is_separator(c: char) -> bool {
    c.is_whitespace() || ('\x1c'..='\x1f').contains(&c)
}

/// Decompose a unified diff into added/removed lines and added/removed words.
///
/// A removal immediately followed by an addition is treated as an in-place edit of one line and
/// reported at word granularity; every other change is reported at line granularity. Only one
/// line of lookahead is used, so in a block of several removals followed by several additions
/// only the last removal is paired with the first addition.
///
/// This never fails: input without any recognizable markers simply yields empty lists.
pub fn decompose(diff_text: &str) -> DiffDecomposition {
    let mut result = DiffDecomposition::default();
    let mut lines = split_lines(diff_text).peekable();

    while let Some(line) = lines.next() {
        match HunkLine::classify(line) {
            HunkLine::Header | HunkLine::Context => {}
            HunkLine::Removal(removed) => {
                // any `+` line pairs, even one that would otherwise look like a `+++` header
                if let Some(added) = lines.next_if(|next| next.starts_with('+')) {
                    diff_words(
                        removed.trim_matches(is_separator),
                        added[1..].trim_matches(is_separator),
                        &mut result,
                    );
                } else {
                    result.removed_lines.push(removed.trim_matches(is_separator).to_string());
                }
            }
            HunkLine::Addition(added) => {
                result.added_lines.push(added.trim_matches(is_separator).to_string());
            }
        }
    }

    result
}

fn diff_words(removed_line: &str, added_line: &str, result: &mut DiffDecomposition) {
    let old: Vec<&str> = words(removed_line).collect();
    let new: Vec<&str> = words(added_line).collect();

    let mut interner = Interner::new(old.len() + new.len());
    let old_tokens: Vec<Token> = old.iter().map(|&word| interner.intern(word)).collect();
    let new_tokens: Vec<Token> = new.iter().map(|&word| interner.intern(word)).collect();

    for (tag, token) in diff_tokens(&old_tokens, &new_tokens, interner.num_tokens()) {
        match tag {
            ChangeTag::Equal => {}
            ChangeTag::Delete => result.removed_words.push(interner[token].to_string()),
            ChangeTag::Insert => result.added_words.push(interner[token].to_string()),
        }
    }
}

fn words(line: &str) -> impl Iterator<Item = &str> + '_ {
    line.split(is_separator).filter(|word| !word.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeTag {
    Equal,
    Delete,
    Insert,
}

/// Align two token sequences and return the full edit script.
///
/// Uses the minimal Myers algorithm, so the `Equal` entries form a longest common subsequence.
/// Within a changed region the deleted tokens are emitted before the inserted ones.
pub fn diff_tokens(
    old: &[Token],
    new: &[Token],
    total_interned_tokens: u32,
) -> Vec<(ChangeTag, Token)> {
    let mut result = Vec::with_capacity(old.len().max(new.len()));

    let mut last_old_pos = 0;
    imara_diff::diff_with_tokens(
        Algorithm::MyersMinimal,
        old,
        new,
        total_interned_tokens,
        |before: Range<u32>, after: Range<u32>| {
            for token in &old[last_old_pos as usize..before.start as usize] {
                result.push((ChangeTag::Equal, *token));
            }
            last_old_pos = before.end;

            for token in &old[before.start as usize..before.end as usize] {
                result.push((ChangeTag::Delete, *token));
            }

            for token in &new[after.start as usize..after.end as usize] {
                result.push((ChangeTag::Insert, *token));
            }
        },
    );

    for token in &old[last_old_pos as usize..] {
        result.push((ChangeTag::Equal, *token));
    }

    result
}
