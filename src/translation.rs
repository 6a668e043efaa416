//! Rewrites neutral `@name` / `:name` parameter markers into the form each driver binds.

use std::borrow::Cow;

mod scanner;

use scanner::{
    State, closes_dollar_quote, is_block_comment_end, is_block_comment_start,
    is_line_comment_start, scan_identifier, try_start_dollar_quote,
};

use crate::types::{Provider, trim_parameter_prefix};

/// Target marker style for translation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerStyle {
    /// PostgreSQL positional placeholders like `$1`.
    Dollar,
    /// tiberius positional placeholders like `@P1`.
    AtP,
    /// Oracle named binds like `:name`.
    Colon,
}

impl MarkerStyle {
    #[must_use]
    pub fn for_provider(provider: Provider) -> Self {
        match provider {
            Provider::Postgres => MarkerStyle::Dollar,
            Provider::SqlServer => MarkerStyle::AtP,
            Provider::Oracle => MarkerStyle::Colon,
        }
    }
}

/// Translate named markers into `style`, numbering them by their position in `names`.
///
/// Only markers naming one of `names` (compared case-insensitively, prefix ignored) are
/// rewritten. Quoted strings, comments, dollar-quoted blocks, `::` casts and `@@` globals
/// are left alone:
/// ```rust
/// use sqlbridge::translation::{MarkerStyle, translate_markers};
///
/// let sql = "select @@rowcount, x::text from t where a = @id and b = ':id'";
/// let out = translate_markers(sql, MarkerStyle::Dollar, &["id"]);
/// assert_eq!(out, "select @@rowcount, x::text from t where a = $1 and b = ':id'");
/// ```
/// Returns a borrowed `Cow` when no changes are needed.
#[must_use]
pub fn translate_markers<'a>(sql: &'a str, style: MarkerStyle, names: &[&str]) -> Cow<'a, str> {
    if names.is_empty() {
        return Cow::Borrowed(sql);
    }

    let mut out: Option<Vec<u8>> = None;
    let mut state = State::Normal;
    let mut idx = 0;
    let bytes = sql.as_bytes();

    while idx < bytes.len() {
        let b = bytes[idx];
        let mut consumed = 1;
        let mut replacement: Option<String> = None;
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                b'[' if style == MarkerStyle::AtP => state = State::BracketQuoted,
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => state = State::BlockComment(1),
                b'$' => {
                    if let Some((tag, close)) = try_start_dollar_quote(bytes, idx) {
                        state = State::DollarQuoted(tag);
                        consumed = close - idx + 1;
                    }
                }
                b'@' | b':' if bytes.get(idx + 1) == Some(&b) => consumed = 2,
                b'@' | b':' => {
                    if let Some((end, ident)) = scan_identifier(bytes, idx + 1)
                        && let Some(position) = position_of(names, ident)
                    {
                        replacement = Some(render(style, position, names[position]));
                        consumed = end - idx;
                    }
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        consumed = 2;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        consumed = 2;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::BracketQuoted => {
                if b == b']' {
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if is_block_comment_start(bytes, idx) {
                    state = State::BlockComment(depth + 1);
                    consumed = 2;
                } else if is_block_comment_end(bytes, idx) {
                    state = if depth == 1 {
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                    consumed = 2;
                }
            }
            State::DollarQuoted(ref tag) => {
                if closes_dollar_quote(bytes, idx, tag) {
                    consumed = tag.len() + 2;
                    state = State::Normal;
                }
            }
        }

        let end = (idx + consumed).min(bytes.len());
        match replacement {
            Some(text) => out
                .get_or_insert_with(|| bytes[..idx].to_vec())
                .extend_from_slice(text.as_bytes()),
            None => {
                if let Some(buf) = out.as_mut() {
                    buf.extend_from_slice(&bytes[idx..end]);
                }
            }
        }
        idx = end;
    }

    match out {
        // Only ASCII was substituted, so the buffer stays valid UTF-8.
        Some(buf) => Cow::Owned(String::from_utf8_lossy(&buf).into_owned()),
        None => Cow::Borrowed(sql),
    }
}

fn position_of(names: &[&str], ident: &str) -> Option<usize> {
    names
        .iter()
        .position(|name| trim_parameter_prefix(name).eq_ignore_ascii_case(ident))
}

fn render(style: MarkerStyle, position: usize, name: &str) -> String {
    match style {
        MarkerStyle::Dollar => format!("${}", position + 1),
        MarkerStyle::AtP => format!("@P{}", position + 1),
        MarkerStyle::Colon => format!(":{}", trim_parameter_prefix(name)),
    }
}
