//! Comment stripping without literal rewriting.
//!
//! A structural subset of the digest scanner: the same comment modes, the
//! same whitespace collapsing, but strings and numbers are copied through
//! untouched.

use crate::classify::is_space_char;
use crate::config::DigestConfig;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Normal,
    BlockComment,
    HashComment,
    DashComment,
}

/// Removes comments from `sql` and collapses whitespace runs to single
/// spaces. Honors `cfg.lowercase` only; literals are left alone and the full
/// input length is read.
pub fn strip_comments(sql: &[u8], cfg: &DigestConfig) -> Vec<u8> {
    let len = sql.len();
    let mut out = Vec::with_capacity(len + 1);

    let mut i = 0usize;
    let mut mode = Mode::Normal;
    // Output length at entry into the current comment.
    let mut mark = 0usize;
    let mut prev_char = 0u8;
    let mut seen_token = false;

    while i < len {
        let c = sql[i];

        if mode == Mode::Normal {
            mark = out.len();

            if prev_char == b'/' && c == b'*' {
                mode = Mode::BlockComment;
            } else if c == b'#' {
                mode = Mode::HashComment;
            } else if prev_char == b'-' && c == b'-' && i + 1 < len && is_space_char(sql[i + 1])
            {
                mode = Mode::DashComment;
            } else {
                if !seen_token && is_space_char(c) {
                    i += 1;
                    continue;
                }
                seen_token = true;
                if is_space_char(prev_char) && is_space_char(c) {
                    prev_char = b' ';
                    i += 1;
                    continue;
                }
            }
        } else {
            let closing = match mode {
                Mode::BlockComment => prev_char == b'*' && c == b'/',
                _ => c == b'\n' || c == b'\r' || i == len - 1,
            };
            if closing {
                let mut back = mark;
                if mode == Mode::BlockComment || i == len - 1 {
                    back = back.saturating_sub(1);
                }
                out.truncate(back);
                prev_char = b' ';
                mode = Mode::Normal;
                i += 1;
                continue;
            }
        }

        out.push(if is_space_char(c) {
            b' '
        } else if cfg.lowercase {
            c.to_ascii_lowercase()
        } else {
            c
        });
        prev_char = c;
        i += 1;
    }

    // a comment left open at end of input contributes nothing
    if mode != Mode::Normal {
        out.truncate(mark.saturating_sub(1));
    }

    if out.last() == Some(&b' ') {
        out.pop();
    }

    out
}
