use serde::{Deserialize, Serialize};

/// Knobs controlling how a statement is digested.
///
/// One record is read per invocation; a call never observes a mid-call
/// configuration change. The defaults mirror a production proxy's settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Hard cap on bytes examined per statement; the excess is dropped.
    pub max_query_length: usize,
    /// ASCII-lowercase every copied byte.
    pub lowercase: bool,
    /// Rewrite the bare token `NULL` (any ASCII case) to `?`.
    pub replace_null: bool,
    /// Rewrite bare digit runs to `?` without numeric-literal analysis.
    pub no_digits: bool,
    /// Placeholders allowed in one parenthesized list before the remainder
    /// collapses to `...`.
    pub grouping_limit: usize,
}

impl Default for DigestConfig {
    fn default() -> Self {
        Self {
            max_query_length: 2048,
            lowercase: false,
            replace_null: false,
            no_digits: false,
            grouping_limit: 3,
        }
    }
}
