//! Row-filtering conditions (`Case`), evaluated per value.
//!
//! A `Case` pairs an operator with its already-typed operand(s). This
//! replaces the source's class-hierarchy-plus-`SYMBOL_MAP` dispatch with
//! one tagged enum (Design Notes §9).

use crate::errors::{DbError, Result};
use crate::field::{FieldType, FieldValue};

#[derive(Debug, Clone)]
pub enum Case {
    Eq(FieldValue),
    NotEq(FieldValue),
    Lt(FieldValue),
    Le(FieldValue),
    Gt(FieldValue),
    Ge(FieldValue),
    In(Vec<FieldValue>),
    NotIn(Vec<FieldValue>),
    Like(String),
    Range(FieldValue, FieldValue),
}

impl Case {
    /// True if this condition can be served by a B+-tree index (i.e. it
    /// isn't LIKE, which has no useful tree translation).
    pub fn is_indexable(&self) -> bool {
        !matches!(self, Case::Like(_))
    }

    pub fn evaluate(&self, value: &FieldValue, ty: FieldType) -> Result<bool> {
        if value.is_null() {
            return Ok(false);
        }
        use std::cmp::Ordering::*;
        Ok(match self {
            Case::Eq(v) => value.cmp_value(v) == Equal,
            Case::NotEq(v) => value.cmp_value(v) != Equal,
            Case::Lt(v) => value.cmp_value(v) == Less,
            Case::Le(v) => value.cmp_value(v) != Greater,
            Case::Gt(v) => value.cmp_value(v) == Greater,
            Case::Ge(v) => value.cmp_value(v) != Less,
            Case::In(vs) => vs.iter().any(|v| value.cmp_value(v) == Equal),
            Case::NotIn(vs) => !vs.iter().any(|v| value.cmp_value(v) == Equal),
            Case::Range(lo, hi) => value.cmp_value(lo) != Less && value.cmp_value(hi) != Greater,
            Case::Like(pattern) => {
                if ty != FieldType::Text {
                    return Err(DbError::Constraint("LIKE only applies to TEXT columns".into()));
                }
                let FieldValue::Text(text) = value else { return Ok(false) };
                like_matches(pattern, text)
            }
        })
    }
}

/// SQL wildcard matching: `_` = any one character, `%` = any run
/// (including empty) of characters. Implemented directly rather than via
/// a translated regex, since the match is a small recursive scan.
fn like_matches(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    like_rec(&p, &t)
}

fn like_rec(p: &[char], t: &[char]) -> bool {
    match p.first() {
        None => t.is_empty(),
        Some('%') => like_rec(&p[1..], t) || (!t.is_empty() && like_rec(p, &t[1..])),
        Some('_') => !t.is_empty() && like_rec(&p[1..], &t[1..]),
        Some(c) => !t.is_empty() && t[0] == *c && like_rec(&p[1..], &t[1..]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn eq_and_range() {
        assert!(Case::Eq(FieldValue::Int(5)).evaluate(&FieldValue::Int(5), FieldType::Int).unwrap());
        assert!(Case::Range(FieldValue::Int(1), FieldValue::Int(10))
            .evaluate(&FieldValue::Int(10), FieldType::Int)
            .unwrap());
        assert!(!Case::Range(FieldValue::Int(1), FieldValue::Int(10))
            .evaluate(&FieldValue::Int(11), FieldType::Int)
            .unwrap());
    }

    #[test]
    fn like_wildcards() {
        assert!(like_matches("a%c", "abbbc"));
        assert!(like_matches("a_c", "abc"));
        assert!(!like_matches("a_c", "ac"));
        assert!(like_matches("%", "anything"));
    }

    #[test]
    fn in_and_not_in() {
        let case = Case::In(vec![FieldValue::Int(1), FieldValue::Int(2)]);
        assert!(case.evaluate(&FieldValue::Int(1), FieldType::Int).unwrap());
        let not_case = Case::NotIn(vec![FieldValue::Int(1)]);
        assert!(not_case.evaluate(&FieldValue::Int(2), FieldType::Int).unwrap());
    }
}
