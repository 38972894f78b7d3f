//! Canonical-dialect → engine-specific SQL rewriting.
//!
//! Every query in this codebase is written once, against the sqlite surface
//! syntax: `?` positional placeholders, `INSERT OR IGNORE INTO`, and the bare
//! identifier `user`. For sqlite the rewrite is the identity; for PostgreSQL
//! three ordered text passes translate those constructs. The passes are pure
//! functions over the query string: no I/O, no shared state, no failure mode.
//! Malformed SQL (an unterminated literal) produces malformed but
//! deterministic output; the passes assume syntactically valid input.

use std::borrow::Cow;

use super::Dialect;

/// Rewrite a canonical-dialect query for the target engine.
///
/// Sqlite is the canonical dialect, so the sqlite branch is guaranteed to
/// return the input unchanged. The postgres branch applies, in order:
/// reserved-identifier quoting, insert-or-ignore translation, and placeholder
/// renumbering. Order matters: later passes must not reinterpret text the
/// earlier passes inserted.
pub fn rewrite(dialect: Dialect, query: &str) -> Cow<'_, str> {
    match dialect {
        Dialect::Sqlite => Cow::Borrowed(query),
        Dialect::Postgres => {
            let q = quote_user_identifier(query);
            let q = rewrite_insert_or_ignore(&q);
            Cow::Owned(renumber_placeholders(&q))
        }
    }
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Length in bytes of the UTF-8 character starting at `b`. The scanners only
/// stop on ASCII bytes, so every copy position is a character boundary.
fn utf8_len(b: u8) -> usize {
    match b {
        0..=0x7f => 1,
        0xc0..=0xdf => 2,
        0xe0..=0xef => 3,
        _ => 4,
    }
}

/// Pass 1: quote the reserved identifier `user`.
///
/// PostgreSQL treats `user` as a keyword, so the bare table/column name must
/// become `"user"`. Matching is token-based: a maximal `[A-Za-z0-9_]` run
/// equal to `user` case-insensitively. Runs like `username` or `user_id` are
/// left alone, as is anything inside single- or double-quoted literals
/// (doubled quotes inside a literal are escapes, not terminators).
fn quote_user_identifier(query: &str) -> String {
    let bytes = query.as_bytes();
    let mut out = String::with_capacity(query.len() + 16);
    let mut in_single = false;
    let mut in_double = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\'' && !in_double {
            if in_single && bytes.get(i + 1) == Some(&b'\'') {
                out.push_str("''");
                i += 2;
                continue;
            }
            in_single = !in_single;
            out.push('\'');
            i += 1;
            continue;
        }
        if b == b'"' && !in_single {
            if in_double && bytes.get(i + 1) == Some(&b'"') {
                out.push_str("\"\"");
                i += 2;
                continue;
            }
            in_double = !in_double;
            out.push('"');
            i += 1;
            continue;
        }
        if in_single || in_double {
            // Literals are opaque; copy the character through verbatim.
            let len = utf8_len(b);
            out.push_str(&query[i..i + len]);
            i += len;
            continue;
        }
        if is_ident_byte(b) {
            let mut j = i + 1;
            while j < bytes.len() && is_ident_byte(bytes[j]) {
                j += 1;
            }
            let token = &query[i..j];
            if token.eq_ignore_ascii_case("user") {
                out.push_str("\"user\"");
            } else {
                out.push_str(token);
            }
            i = j;
            continue;
        }
        let len = utf8_len(b);
        out.push_str(&query[i..i + len]);
        i += len;
    }
    out
}

const INSERT_OR_IGNORE: &str = "INSERT OR IGNORE INTO";

/// Pass 2: translate the sqlite upsert form to PostgreSQL's.
///
/// Only the first occurrence is rewritten; callers issue one statement per
/// query string, so a second occurrence would be part of a literal or a
/// malformed batch and is deliberately left untouched.
fn rewrite_insert_or_ignore(query: &str) -> Cow<'_, str> {
    let upper = query.to_ascii_uppercase();
    let Some(idx) = upper.find(INSERT_OR_IGNORE) else {
        return Cow::Borrowed(query);
    };
    let mut out = String::with_capacity(query.len() + 32);
    out.push_str(&query[..idx]);
    out.push_str("INSERT INTO");
    out.push_str(&query[idx + INSERT_OR_IGNORE.len()..]);
    let mut out = out.trim_end_matches(trailing_junk).to_string();
    out.push_str(" ON CONFLICT DO NOTHING");
    Cow::Owned(out)
}

fn trailing_junk(c: char) -> bool {
    c == ';' || c.is_ascii_whitespace()
}

/// Pass 3: renumber `?` placeholders to `$1`, `$2`, …
///
/// Placeholder order must match the positional order of the caller's argument
/// list exactly; that is what lets a single argument slice satisfy both
/// drivers. Only single-quoted literals are tracked here; a `?` can never
/// occur inside a quoted identifier in valid SQL produced by pass 1.
fn renumber_placeholders(query: &str) -> String {
    let bytes = query.as_bytes();
    let mut out = String::with_capacity(query.len() + 16);
    let mut in_single = false;
    let mut n = 1u32;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b == b'\'' {
            if in_single && bytes.get(i + 1) == Some(&b'\'') {
                out.push_str("''");
                i += 2;
                continue;
            }
            in_single = !in_single;
            out.push('\'');
            i += 1;
            continue;
        }
        if b == b'?' && !in_single {
            out.push('$');
            out.push_str(&n.to_string());
            n += 1;
            i += 1;
            continue;
        }
        let len = utf8_len(b);
        out.push_str(&query[i..i + len]);
        i += len;
    }
    out
}

/// Trim trailing semicolons/whitespace so a suffix clause can be appended.
/// Shared by pass 2 and the returning-id path.
pub(crate) fn trim_statement_end(query: &str) -> &str {
    query.trim_end_matches(trailing_junk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pg(q: &str) -> String {
        rewrite(Dialect::Postgres, q).into_owned()
    }

    #[test]
    fn sqlite_is_identity() {
        let queries = [
            "SELECT * FROM user WHERE user = ?",
            "INSERT OR IGNORE INTO x VALUES(?)",
            "totally not sql ' \" ? ;;",
            "",
        ];
        for q in queries {
            assert_eq!(rewrite(Dialect::Sqlite, q), q);
        }
    }

    #[test]
    fn quotes_user_table_and_column() {
        assert_eq!(
            pg("SELECT * FROM user WHERE user = ?"),
            "SELECT * FROM \"user\" WHERE \"user\" = $1"
        );
    }

    #[test]
    fn user_quoting_is_case_insensitive() {
        assert_eq!(pg("SELECT id FROM USER"), "SELECT id FROM \"user\"");
        assert_eq!(pg("SELECT id FROM User"), "SELECT id FROM \"user\"");
    }

    #[test]
    fn longer_identifiers_are_not_touched() {
        assert_eq!(
            pg("SELECT username, user_id, a_user FROM forward"),
            "SELECT username, user_id, a_user FROM forward"
        );
    }

    #[test]
    fn user_inside_single_quoted_literal_is_opaque() {
        assert_eq!(
            pg("SELECT 'it''s a user' AS note WHERE user = ?"),
            "SELECT 'it''s a user' AS note WHERE \"user\" = $1"
        );
    }

    #[test]
    fn user_inside_double_quoted_identifier_is_opaque() {
        assert_eq!(
            pg("SELECT \"user\" FROM \"user\""),
            "SELECT \"user\" FROM \"user\""
        );
    }

    #[test]
    fn doubled_double_quotes_are_escapes() {
        // "a""user""b" is one identifier containing literal quotes.
        assert_eq!(
            pg("SELECT \"a\"\"user\"\"b\" FROM node"),
            "SELECT \"a\"\"user\"\"b\" FROM node"
        );
    }

    #[test]
    fn insert_or_ignore_becomes_on_conflict() {
        assert_eq!(
            pg("INSERT OR IGNORE INTO user_group_user(user_group_id,user_id) VALUES(?,?)"),
            "INSERT INTO user_group_user(user_group_id,user_id) VALUES($1,$2) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn insert_or_ignore_strips_trailing_semicolon() {
        assert_eq!(
            pg("INSERT OR IGNORE INTO t(a) VALUES(?);\n"),
            "INSERT INTO t(a) VALUES($1) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn insert_or_ignore_is_case_insensitive() {
        assert_eq!(
            pg("insert or ignore into t(a) values(?)"),
            "INSERT INTO t(a) values($1) ON CONFLICT DO NOTHING"
        );
    }

    #[test]
    fn plain_insert_is_unchanged_by_pass_two() {
        assert_eq!(
            pg("INSERT INTO node(name) VALUES(?)"),
            "INSERT INTO node(name) VALUES($1)"
        );
    }

    #[test]
    fn placeholders_number_left_to_right() {
        assert_eq!(
            pg("UPDATE forward SET status = ?, updated_time = ? WHERE id = ?"),
            "UPDATE forward SET status = $1, updated_time = $2 WHERE id = $3"
        );
    }

    #[test]
    fn question_mark_inside_literal_is_not_a_placeholder() {
        assert_eq!(
            pg("SELECT * FROM tunnel WHERE name = '?' AND id = ?"),
            "SELECT * FROM tunnel WHERE name = '?' AND id = $1"
        );
    }

    #[test]
    fn escaped_quote_then_placeholder() {
        assert_eq!(
            pg("SELECT 'don''t?' WHERE id = ?"),
            "SELECT 'don''t?' WHERE id = $1"
        );
    }

    #[test]
    fn placeholder_count_matches_and_has_no_gaps() {
        let q = "SELECT ? , ?, '?' , ? FROM t WHERE a = ? OR b = ?";
        let rewritten = pg(q);
        for n in 1..=5 {
            assert!(rewritten.contains(&format!("${n}")), "missing ${n} in {rewritten}");
        }
        assert!(!rewritten.contains("$6"));
        assert!(!rewritten.contains('?') || rewritten.contains("'?'"));
    }

    #[test]
    fn unterminated_literal_swallows_the_rest() {
        // Garbage in, deterministic garbage out: everything after the broken
        // quote is treated as literal text.
        assert_eq!(pg("SELECT 'oops user = ?"), "SELECT 'oops user = ?");
    }

    #[test]
    fn multibyte_text_survives_all_passes() {
        assert_eq!(
            pg("SELECT '隧道 user ?' AS label FROM tunnel WHERE name = ?"),
            "SELECT '隧道 user ?' AS label FROM tunnel WHERE name = $1"
        );
    }

    #[test]
    fn empty_and_no_op_queries() {
        assert_eq!(pg(""), "");
        assert_eq!(pg("SELECT 1"), "SELECT 1");
    }

    #[test]
    fn trim_statement_end_handles_mixed_junk() {
        assert_eq!(trim_statement_end("SELECT 1 ; \t\n;"), "SELECT 1");
        assert_eq!(trim_statement_end("SELECT 1"), "SELECT 1");
    }
}
