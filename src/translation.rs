use std::borrow::Cow;

mod scanner;

use scanner::{
    State, is_block_comment_end, is_block_comment_start, is_line_comment_start, is_word_byte,
    scan_digits,
};

/// Rewrite `$N` and `?N` placeholders into SQL Server's `@PN` form; a bare `?` takes the next
/// free ordinal.
///
/// String literals, quoted and `[bracketed]` identifiers and comments are left untouched:
/// ```rust
/// use sql_conduit::translation::translate_placeholders;
///
/// let sql = "SELECT [a$1], '?2' FROM t WHERE id = $1 AND kind = ?2 -- $3";
/// assert_eq!(
///     translate_placeholders(sql, true),
///     "SELECT [a$1], '?2' FROM t WHERE id = @P1 AND kind = @P2 -- $3"
/// );
/// ```
/// Returns a borrowed `Cow` when no changes are needed.
#[must_use]
pub fn translate_placeholders(sql: &str, enabled: bool) -> Cow<'_, str> {
    if !enabled {
        return Cow::Borrowed(sql);
    }

    let mut out: Option<String> = None;
    let mut copied = 0;
    let mut next_ordinal = 1_usize;
    let mut state = State::Normal;
    let mut idx = 0;
    let bytes = sql.as_bytes();

    while idx < bytes.len() {
        let b = bytes[idx];
        match state {
            State::Normal => match b {
                b'\'' => state = State::SingleQuoted,
                b'"' => state = State::DoubleQuoted,
                b'[' => state = State::Bracketed,
                _ if is_line_comment_start(bytes, idx) => state = State::LineComment,
                _ if is_block_comment_start(bytes, idx) => {
                    state = State::BlockComment(1);
                    idx += 1;
                }
                b'$' | b'?' if idx == 0 || !is_word_byte(bytes[idx - 1]) => {
                    let replacement = match scan_digits(bytes, idx + 1) {
                        Some((end, digits)) => {
                            if let Ok(n) = digits.parse::<usize>() {
                                next_ordinal = next_ordinal.max(n + 1);
                            }
                            Some((end, format!("@P{digits}")))
                        }
                        None if b == b'?' => {
                            let n = next_ordinal;
                            next_ordinal += 1;
                            Some((idx + 1, format!("@P{n}")))
                        }
                        None => None,
                    };
                    if let Some((end, placeholder)) = replacement {
                        let buf = out.get_or_insert_with(|| String::with_capacity(sql.len() + 8));
                        buf.push_str(&sql[copied..idx]);
                        buf.push_str(&placeholder);
                        copied = end;
                        idx = end;
                        continue;
                    }
                }
                _ => {}
            },
            State::SingleQuoted => {
                if b == b'\'' {
                    if bytes.get(idx + 1) == Some(&b'\'') {
                        idx += 1; // escaped quote
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::DoubleQuoted => {
                if b == b'"' {
                    if bytes.get(idx + 1) == Some(&b'"') {
                        idx += 1;
                    } else {
                        state = State::Normal;
                    }
                }
            }
            State::Bracketed => {
                if b == b']' {
                    if bytes.get(idx + 1) == Some(&b']') {
                        idx += 1;
                    } else {
                        state = State::Normal;
                    }
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
                    idx += 1;
                } else if is_block_comment_end(bytes, idx) {
                    state = if depth == 1 {
                        State::Normal
                    } else {
                        State::BlockComment(depth - 1)
                    };
                    idx += 1;
                }
            }
        }
        idx += 1;
    }

    match out {
        Some(mut buf) => {
            buf.push_str(&sql[copied..]);
            Cow::Owned(buf)
        }
        None => Cow::Borrowed(sql),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_numbered_placeholders() {
        let sql = "select * from t where a = ?1 and b = $2";
        let res = translate_placeholders(sql, true);
        assert_eq!(res, "select * from t where a = @P1 and b = @P2");
    }

    #[test]
    fn bare_question_marks_are_numbered_in_order() {
        let sql = "insert into t values(?, ?, ?)";
        let res = translate_placeholders(sql, true);
        assert_eq!(res, "insert into t values(@P1, @P2, @P3)");
    }

    #[test]
    fn skips_inside_literals_identifiers_and_comments() {
        let sql = "select 'it''s ?1', [col?2]], x], \"$3\", $1 -- $2\n/* ?3 /* $4 */ */ from t";
        let res = translate_placeholders(sql, true);
        assert_eq!(
            res,
            "select 'it''s ?1', [col?2]], x], \"$3\", @P1 -- $2\n/* ?3 /* $4 */ */ from t"
        );
    }

    #[test]
    fn leaves_variables_and_non_ascii_text_alone() {
        let sql = "declare @x$1 int; select N'é', @x$1, ?1 from t";
        let res = translate_placeholders(sql, true);
        assert_eq!(res, "declare @x$1 int; select N'é', @x$1, @P1 from t");
    }

    #[test]
    fn respects_disabled_flag() {
        let sql = "select * from t where a = ?1";
        let res = translate_placeholders(sql, false);
        assert!(matches!(res, Cow::Borrowed(_)));
        let untouched = translate_placeholders("select 1", true);
        assert!(matches!(untouched, Cow::Borrowed(_)));
    }
}
