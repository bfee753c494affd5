//! The digest scanner: one forward pass over the statement bytes.
//!
//! The scanner interleaves comment parsing (three syntaxes), string and
//! numeric literal recognition, whitespace collapsing and list collapsing,
//! driven by a one-byte lookbehind and small lookahead. Replacing a literal
//! with `?` works by remembering the output length when a literal starts and
//! truncating back to it when the literal ends.

use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::classify::{
    is_arithmetic_op, is_digit_char, is_digit_string, is_space_char, is_token_char,
};
use crate::config::DigestConfig;

/// Capacity of the first-comment and executable-comment buffers. Comments
/// longer than this are consumed to the end but not stored.
pub const FIRST_COMMENT_MAX_LENGTH: usize = 1024;

static BYTES_SCANNED: AtomicU64 = AtomicU64::new(0);

/// Total bytes examined by the digest scanner since process start.
///
/// Coarse telemetry only: updated once per call with relaxed ordering.
pub fn bytes_scanned() -> u64 {
    BYTES_SCANNED.load(Ordering::Relaxed)
}

/// Digest of one SQL statement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Digest {
    /// The statement with literals replaced by `?`, comments removed and
    /// whitespace collapsed.
    pub digest: Vec<u8>,
    /// Body of the first `/* ... */` comment, whitespace-normalized.
    pub first_comment: Option<Vec<u8>>,
}

impl Digest {
    /// The digest as text. Non-UTF-8 bytes copied through from the input are
    /// replaced lossily.
    pub fn digest_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.digest)
    }

    pub fn first_comment_str(&self) -> Option<Cow<'_, str>> {
        self.first_comment.as_deref().map(String::from_utf8_lossy)
    }
}

/// Scanner mode. Every non-normal mode remembers the output position it was
/// entered at so the consumed span can be rewound when the mode ends.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Normal,
    BlockComment,
    HashComment,
    DashComment,
    Str,
    Num,
}

/// First-comment capture progress; capture happens at most once per call.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Capture {
    Pending,
    Active,
    Done,
}

/// Digests a statement: literals become `?`, comments are dropped
/// (executable `/*! ... */` bodies are spliced back in), whitespace
/// collapses, long parenthesized lists collapse to `(?,?,?,...)`, and the
/// first `/* ... */` comment body is captured on the side.
pub fn query_digest(sql: &[u8], cfg: &DigestConfig) -> Digest {
    let mut out = Vec::with_capacity(sql.len().min(cfg.max_query_length) + 1);
    let first_comment = query_digest_into(sql, cfg, &mut out);
    Digest {
        digest: out,
        first_comment,
    }
}

/// Buffer-reusing variant of [`query_digest`]: clears `out`, writes the
/// digest into it and returns the first comment if one was seen.
pub fn query_digest_into(
    sql: &[u8],
    cfg: &DigestConfig,
    out: &mut Vec<u8>,
) -> Option<Vec<u8>> {
    out.clear();

    let len = sql.len().min(cfg.max_query_length);
    let s = &sql[..len];
    BYTES_SCANNED.fetch_add(len as u64, Ordering::Relaxed);

    let mut i = 0usize;
    let mut mode = Mode::Normal;
    // Output length at entry into the current non-normal mode.
    let mut mark = 0usize;
    let mut prev_char = 0u8;
    let mut prev_space = false;
    let mut quote = 0u8;
    let mut seen_token = false;

    let mut first_comment: Option<Vec<u8>> = None;
    let mut capture = Capture::Pending;
    // Executable-comment body, buffered until the comment closes.
    let mut exec = false;
    let mut exec_buf: Vec<u8> = Vec::new();

    let mut grouping_active = false;
    let mut grouping_count = 0usize;
    let mut grouping_exceeded = false;

    while i < len {
        let mut c = s[i];
        let mut cur_space = is_space_char(c);

        if mode == Mode::Normal {
            mark = out.len();

            if prev_char == b'/' && c == b'*' {
                exec_buf.clear();
                mode = Mode::BlockComment;
                if i != len - 1 && s[i + 1] == b'!' {
                    exec = true;
                }
            } else if c == b'#' {
                mode = Mode::HashComment;
            } else if i != len - 1 && prev_char == b'-' && c == b'-' && is_space_char(s[i + 1]) {
                mode = Mode::DashComment;
            } else if i != len - 1 && c == b'-' && s[i + 1] == b'-' {
                // an adjacent dash pair opens the comment unless this byte is
                // already the second dash of one
                if prev_char != b'-' || i == 0 {
                    mode = Mode::DashComment;
                }
            } else if c == b'\'' || c == b'"' {
                mode = Mode::Str;
                quote = c;
            } else if is_token_char(prev_char) && is_digit_char(c) {
                if cfg.no_digits {
                    out.push(b'?');
                    while i < len && is_digit_char(s[i]) {
                        i += 1;
                    }
                    if i >= len {
                        break;
                    }
                    c = s[i];
                    cur_space = is_space_char(c);
                } else {
                    mode = Mode::Num;
                    if i + 1 == len {
                        // nothing copied yet; the replacement happens on the
                        // next pass over this byte
                        continue;
                    }
                }
            } else {
                if !seen_token && cur_space {
                    i += 1;
                    continue;
                }
                seen_token = true;
                if prev_space && cur_space {
                    prev_char = b' ';
                    i += 1;
                    continue;
                }
                if cfg.no_digits && !is_digit_char(prev_char) && is_digit_char(c) {
                    out.push(b'?');
                    while i < len && is_digit_char(s[i]) {
                        i += 1;
                    }
                    if i >= len {
                        break;
                    }
                    c = s[i];
                    cur_space = is_space_char(c);
                }
                // a space binds an arithmetic operator to a placeholder
                if out.len() >= 2
                    && prev_space
                    && is_arithmetic_op(c)
                    && out[out.len() - 1] == b' '
                    && out[out.len() - 2] == b'?'
                {
                    prev_char = c;
                    prev_space = false;
                    out.pop();
                    out.push(c);
                    i += 1;
                    continue;
                }
                // spaces on either side of a comma
                if out.len() >= 2
                    && prev_space
                    && out[out.len() - 1] == b' '
                    && (c == b',' || out[out.len() - 2] == b',')
                {
                    out.pop();
                    // inside a collapsed list the comma itself is dropped
                    if !grouping_exceeded {
                        out.push(c);
                    }
                    prev_char = b',';
                    prev_space = false;
                    i += 1;
                    continue;
                }
                // space between a collapsed list's `.` and the closing paren
                if out.len() >= 2
                    && prev_space
                    && c == b')'
                    && out[out.len() - 1] == b' '
                    && out[out.len() - 2] == b'.'
                {
                    prev_char = c;
                    prev_space = false;
                    out.pop();
                    out.push(c);
                    i += 1;
                    continue;
                }
                // `=` binds tight against the value that follows
                if prev_space && c == b'=' && out.last() == Some(&b' ') {
                    out.pop();
                    out.push(b'=');
                    prev_char = b'=';
                    prev_space = false;
                    i += 1;
                    continue;
                }
                if cfg.replace_null
                    && (c == b'n' || c == b'N')
                    && i > 0
                    && is_token_char(prev_char)
                    && len >= 4
                    && i < len - 3
                    && (s[i + 1] == b'u' || s[i + 1] == b'U')
                    && (s[i + 2] == b'l' || s[i + 2] == b'L')
                    && (s[i + 3] == b'l' || s[i + 3] == b'L')
                {
                    if i == len - 4 {
                        trim_before_placeholder(out);
                        out.push(b'?');
                        return first_comment;
                    }
                    if is_token_char(s[i + 4]) {
                        trim_before_placeholder(out);
                        out.push(b'?');
                        i += 4;
                        c = s[i];
                    }
                }
            }
        } else {
            if mode == Mode::BlockComment {
                if exec && exec_buf.len() < FIRST_COMMENT_MAX_LENGTH - 1 {
                    exec_buf.push(c);
                }
                if capture == Capture::Pending {
                    capture = Capture::Active;
                    first_comment = Some(Vec::with_capacity(FIRST_COMMENT_MAX_LENGTH));
                }
                if capture == Capture::Active {
                    if let Some(fc) = first_comment.as_mut() {
                        if fc.len() < FIRST_COMMENT_MAX_LENGTH - 1 {
                            fc.push(if cur_space { b' ' } else { c });
                        }
                        if prev_char == b'*' && c == b'/' {
                            if fc.len() >= 2 {
                                fc.truncate(fc.len() - 2);
                            }
                            while fc.last() == Some(&b' ') {
                                fc.pop();
                            }
                            capture = Capture::Done;
                        }
                    }
                }
            }

            let closing = match mode {
                Mode::BlockComment => prev_char == b'*' && c == b'/',
                Mode::HashComment | Mode::DashComment => {
                    c == b'\n' || c == b'\r' || i == len - 1
                }
                _ => false,
            };
            if closing {
                let mut back = mark;
                if mode == Mode::BlockComment || i == len - 1 {
                    back = back.saturating_sub(1);
                }
                out.truncate(back);
                if exec {
                    splice_executable_comment(out, &exec_buf);
                    exec = false;
                }
                prev_char = b' ';
                prev_space = true;
                mode = Mode::Normal;
                i += 1;
                continue;
            }

            if mode == Mode::Str {
                if i + 1 == len {
                    // string still open at end of input
                    out.truncate(mark);
                    trim_before_placeholder(out);
                    out.push(b'?');
                    mode = Mode::Normal;
                    break;
                }
                if out.len() > mark + 1
                    && ((prev_char == b'\\' && c == b'\\')
                        || (prev_char == b'\\' && c == quote)
                        || (prev_char == quote && c == quote))
                {
                    // escape pair consumed; poison the lookbehind so the
                    // second byte cannot pair again
                    prev_char = b'X';
                    prev_space = false;
                    i += 1;
                    continue;
                }
                if c == quote && s[i + 1] != quote {
                    out.truncate(mark);
                    trim_before_placeholder(out);
                    out.push(b'?');
                    mode = Mode::Normal;
                    i += 1;
                    continue;
                }
            } else if mode == Mode::Num {
                if mark == out.len() {
                    // single digit deferred at end of input
                    trim_before_placeholder(out);
                    out.push(b'?');
                    i += 1;
                    continue;
                }
                if c == b'.' || c == b'e' || ((c == b'+' || c == b'-') && prev_char == b'e') {
                    prev_char = c;
                    prev_space = false;
                    i += 1;
                    continue;
                }
                if is_token_char(c) || i + 1 == len {
                    if is_digit_string(&out[mark..]) {
                        out.truncate(mark);
                        let before = out.last().copied();
                        let before3 = out.len().checked_sub(3).map(|k| out[k]);
                        trim_before_placeholder(out);
                        if before == Some(b'(') || before3 == Some(b'(') {
                            grouping_active = true;
                        }
                        if grouping_count < cfg.grouping_limit {
                            out.push(b'?');
                            if grouping_active {
                                grouping_count += 1;
                            }
                        } else if !grouping_exceeded {
                            out.extend_from_slice(b"...");
                            grouping_exceeded = true;
                        }
                        if i + 1 == len {
                            if is_token_char(c) {
                                out.push(c);
                            }
                            i += 1;
                            continue;
                        }
                    }
                    mode = Mode::Normal;
                }
            }
        }

        // a byte that cannot belong to a placeholder list ends the current
        // grouping
        if (grouping_active || grouping_count > 0 || grouping_exceeded)
            && c != b','
            && !cur_space
            && !is_digit_char(c)
        {
            grouping_active = false;
            grouping_count = 0;
            grouping_exceeded = false;
        }
        if !(grouping_active && grouping_exceeded && c == b',') {
            out.push(if cur_space {
                b' '
            } else if cfg.lowercase {
                c.to_ascii_lowercase()
            } else {
                c
            });
        }
        prev_char = c;
        prev_space = cur_space;
        i += 1;
    }

    // a comment left open at end of input contributes nothing
    if matches!(
        mode,
        Mode::BlockComment | Mode::HashComment | Mode::DashComment
    ) {
        out.truncate(mark.saturating_sub(1));
    }

    // a comment can leave two trailing spaces behind
    if out.last() == Some(&b' ') {
        out.pop();
        if out.last() == Some(&b' ') {
            out.pop();
        }
    }

    first_comment
}

/// Tightens the output tail before a `?` replaces a literal: a sign that
/// binds to the value is consumed, and a space left between the value and a
/// preceding operator or separator is dropped.
fn trim_before_placeholder(out: &mut Vec<u8>) {
    let n = out.len();
    if n < 2 {
        return;
    }
    if matches!(out[n - 1], b'+' | b'-') && matches!(out[n - 2], b',' | b'(' | b' ') {
        out.pop();
    } else if out[n - 1] == b' '
        && matches!(
            out[n - 2],
            b'+' | b'-' | b'*' | b'/' | b'%' | b',' | b'.' | b'='
        )
    {
        out.pop();
    }
}

/// Splices an executable comment's payload into the digest, dropping the
/// closing `*/` and the leading version prefix (any initial run of `/`, `*`,
/// `!`, digits and spaces). `/*!40001 SQL_NO_CACHE */` contributes
/// `SQL_NO_CACHE `.
fn splice_executable_comment(out: &mut Vec<u8>, buf: &[u8]) {
    if buf.len() < 2 {
        return;
    }
    let body = &buf[..buf.len() - 2];
    let Some(start) = body
        .iter()
        .position(|&b| !matches!(b, b'/' | b'*' | b'!' | b'0'..=b'9' | b' '))
    else {
        return;
    };
    let mut rest = &body[start..];
    while rest.last() == Some(&b' ') {
        rest = &rest[..rest.len() - 1];
    }
    out.extend_from_slice(rest);
    out.push(b' ');
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario_config() -> DigestConfig {
        DigestConfig {
            replace_null: true,
            ..DigestConfig::default()
        }
    }

    fn digest_of(sql: &str, cfg: &DigestConfig) -> String {
        let d = query_digest(sql.as_bytes(), cfg);
        d.digest_str().into_owned()
    }

    fn comment_of(sql: &str, cfg: &DigestConfig) -> Option<String> {
        let d = query_digest(sql.as_bytes(), cfg);
        d.first_comment_str().map(|c| c.into_owned())
    }

    #[test]
    fn collapses_whitespace_and_replaces_numbers() {
        let cfg = scenario_config();
        assert_eq!(
            digest_of("SELECT  *  FROM  t  WHERE  id = 42", &cfg),
            "SELECT * FROM t WHERE id=?"
        );
    }

    #[test]
    fn collapses_long_in_lists() {
        let cfg = scenario_config();
        assert_eq!(
            digest_of("SELECT * FROM t WHERE x IN (1,2,3,4,5,6)", &cfg),
            "SELECT * FROM t WHERE x IN (?,?,?,...)"
        );
    }

    #[test]
    fn unwraps_executable_comment() {
        let cfg = scenario_config();
        let d = query_digest(
            b"/*!40001 SQL_NO_CACHE */ SELECT 'a''b' FROM t",
            &cfg,
        );
        assert_eq!(d.digest_str(), "SQL_NO_CACHE SELECT ? FROM t");
        assert_eq!(d.first_comment_str().as_deref(), Some("!40001 SQL_NO_CACHE"));
    }

    #[test]
    fn consumes_signs_bound_to_literals() {
        let cfg = scenario_config();
        assert_eq!(
            digest_of("SELECT -1 , +2 FROM t", &cfg),
            "SELECT ?,? FROM t"
        );
    }

    #[test]
    fn rewrites_null_at_end() {
        let cfg = scenario_config();
        assert_eq!(
            digest_of("SELECT * FROM t WHERE c = NULL", &cfg),
            "SELECT * FROM t WHERE c=?"
        );
    }

    #[test]
    fn rewrites_null_mid_statement() {
        let cfg = scenario_config();
        assert_eq!(
            digest_of("SELECT * FROM t WHERE c = NULL AND d = 2", &cfg),
            "SELECT * FROM t WHERE c=? AND d=?"
        );
        assert_eq!(digest_of("SELECT * FROM t WHERE c = nUlL", &cfg), "SELECT * FROM t WHERE c=?");
    }

    #[test]
    fn null_alone_is_not_a_value() {
        let cfg = scenario_config();
        assert_eq!(digest_of("NULL", &cfg), "NULL");
    }

    #[test]
    fn null_kept_when_disabled() {
        let cfg = DigestConfig::default();
        assert_eq!(
            digest_of("SELECT NULL FROM t", &cfg),
            "SELECT NULL FROM t"
        );
    }

    #[test]
    fn drops_dash_comment_line() {
        let cfg = scenario_config();
        assert_eq!(digest_of("-- comment\nSELECT 1", &cfg), "SELECT ?");
    }

    #[test]
    fn drops_trailing_dash_comment() {
        let cfg = scenario_config();
        assert_eq!(digest_of("SELECT 1 -- done", &cfg), "SELECT ?");
    }

    #[test]
    fn drops_hash_comment() {
        let cfg = scenario_config();
        assert_eq!(digest_of("SELECT 1 # trailing", &cfg), "SELECT ?");
        assert_eq!(digest_of("# leading\nSELECT 1", &cfg), "SELECT ?");
    }

    #[test]
    fn doubled_quotes_stay_inside_the_string() {
        let cfg = scenario_config();
        assert_eq!(digest_of("SELECT \"he said \"\"hi\"\"\"", &cfg), "SELECT ?");
        assert_eq!(digest_of("SELECT 'a''b' FROM t", &cfg), "SELECT ? FROM t");
    }

    #[test]
    fn backslash_escapes_stay_inside_the_string() {
        let cfg = scenario_config();
        assert_eq!(digest_of("SELECT 'it\\'s' FROM t", &cfg), "SELECT ? FROM t");
        assert_eq!(digest_of("SELECT 'a\\\\' FROM t", &cfg), "SELECT ? FROM t");
    }

    #[test]
    fn empty_and_whitespace_only_inputs() {
        let cfg = scenario_config();
        assert_eq!(digest_of("", &cfg), "");
        assert_eq!(digest_of("   \t\n  ", &cfg), "");
    }

    #[test]
    fn unterminated_string_becomes_placeholder() {
        let cfg = scenario_config();
        assert_eq!(digest_of("SELECT 'abc", &cfg), "SELECT ?");
    }

    #[test]
    fn hex_literal_becomes_placeholder() {
        let cfg = scenario_config();
        assert_eq!(digest_of("SELECT 0xDEADBEEF", &cfg), "SELECT ?");
        assert_eq!(
            digest_of("SELECT * FROM t WHERE k = 0x1f2B", &cfg),
            "SELECT * FROM t WHERE k=?"
        );
    }

    #[test]
    fn float_literal_becomes_placeholder() {
        let cfg = scenario_config();
        assert_eq!(digest_of("SELECT 1.5e-3", &cfg), "SELECT ?");
        assert_eq!(
            digest_of("SELECT * FROM t WHERE p = 10.25", &cfg),
            "SELECT * FROM t WHERE p=?"
        );
    }

    #[test]
    fn captures_only_the_first_comment() {
        let cfg = scenario_config();
        let d = query_digest(b"/*a*/ SELECT /*b*/ 1", &cfg);
        assert_eq!(d.digest_str(), "SELECT ?");
        assert_eq!(d.first_comment_str().as_deref(), Some("a"));
    }

    #[test]
    fn comment_whitespace_is_normalized_in_capture() {
        let cfg = scenario_config();
        assert_eq!(
            comment_of("/* route:\treplica1 */ SELECT 1", &cfg).as_deref(),
            Some(" route: replica1")
        );
    }

    #[test]
    fn no_comment_no_capture() {
        let cfg = scenario_config();
        assert_eq!(comment_of("SELECT 1 -- not captured", &cfg), None);
        assert_eq!(comment_of("SELECT '/* not a comment */'", &cfg), None);
    }

    #[test]
    fn executable_comment_without_version_prefix() {
        let cfg = scenario_config();
        let d = query_digest(b"SELECT /*! STRAIGHT_JOIN */ * FROM t", &cfg);
        assert_eq!(d.digest_str(), "SELECT STRAIGHT_JOIN * FROM t");
        assert_eq!(d.first_comment_str().as_deref(), Some("! STRAIGHT_JOIN"));
    }

    #[test]
    fn unterminated_block_comment_is_dropped() {
        let cfg = scenario_config();
        let d = query_digest(b"SELECT 1 /* pending", &cfg);
        assert_eq!(d.digest_str(), "SELECT ?");
        assert_eq!(d.first_comment_str().as_deref(), Some(" pending"));
    }

    #[test]
    fn grouping_resets_between_lists() {
        let cfg = scenario_config();
        assert_eq!(
            digest_of(
                "SELECT * FROM t WHERE a IN (1,2,3,4) AND b IN (5,6,7,8)",
                &cfg
            ),
            "SELECT * FROM t WHERE a IN (?,?,?,...) AND b IN (?,?,?,...)"
        );
    }

    #[test]
    fn short_lists_are_not_collapsed() {
        let cfg = scenario_config();
        assert_eq!(
            digest_of("SELECT * FROM t WHERE a IN (1,2,3)", &cfg),
            "SELECT * FROM t WHERE a IN (?,?,?)"
        );
    }

    #[test]
    fn lowercases_copied_bytes() {
        let cfg = DigestConfig {
            lowercase: true,
            ..scenario_config()
        };
        assert_eq!(
            digest_of("SELECT Name FROM Users WHERE Id = 10", &cfg),
            "select name from users where id=?"
        );
    }

    #[test]
    fn no_digits_rewrites_digit_runs() {
        let cfg = DigestConfig {
            no_digits: true,
            ..scenario_config()
        };
        assert_eq!(digest_of("SELECT 123 FROM t7", &cfg), "SELECT ? FROM t?");
    }

    #[test]
    fn truncates_at_max_query_length() {
        let cfg = DigestConfig {
            max_query_length: 9,
            ..scenario_config()
        };
        assert_eq!(digest_of("SELECT 999 FROM t", &cfg), "SELECT ?");
    }

    #[test]
    fn digesting_a_digest_is_identity() {
        let cfg = scenario_config();
        for sql in [
            "SELECT  *  FROM  t  WHERE  id = 42",
            "SELECT * FROM t WHERE x IN (1,2,3,4,5,6)",
            "SELECT -1 , +2 FROM t",
            "SELECT 'a''b' FROM t",
        ] {
            let once = digest_of(sql, &cfg);
            assert_eq!(digest_of(&once, &cfg), once, "input: {sql}");
        }
    }

    #[test]
    fn output_is_bounded_by_input_length() {
        let cfg = scenario_config();
        for sql in [
            "SELECT * FROM t WHERE id = 42",
            "   padded   input   ",
            "SELECT 'x', 'y', 'z'",
        ] {
            assert!(digest_of(sql, &cfg).len() <= sql.len(), "input: {sql}");
        }
    }

    #[test]
    fn into_variant_reuses_the_buffer() {
        let cfg = scenario_config();
        let mut out = Vec::new();
        query_digest_into(b"SELECT 1", &cfg, &mut out);
        assert_eq!(out, b"SELECT ?");
        let fc = query_digest_into(b"/*hint*/ SELECT 2", &cfg, &mut out);
        assert_eq!(out, b"SELECT ?");
        assert_eq!(fc.as_deref(), Some(b"hint".as_slice()));
    }

    #[test]
    fn counts_scanned_bytes() {
        let cfg = scenario_config();
        let before = bytes_scanned();
        query_digest(b"SELECT 1 FROM t", &cfg);
        assert!(bytes_scanned() - before >= 15);
    }

    #[test]
    fn operator_binds_to_placeholder() {
        let cfg = scenario_config();
        assert_eq!(digest_of("SELECT 1 + 2", &cfg), "SELECT ?+?");
    }

    #[test]
    fn identifiers_with_digits_survive() {
        let cfg = scenario_config();
        assert_eq!(
            digest_of("SELECT col1 FROM tbl2 WHERE x9 = 3", &cfg),
            "SELECT col1 FROM tbl2 WHERE x9=?"
        );
    }
}
