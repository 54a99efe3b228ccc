//! Nested-field path accessor (§4.1).
//!
//! Resolves path expressions like `floors[1].sensors[0].readings['temperature']`
//! against a [`NestedValue`], returning `Null` for any absent step rather than
//! erroring — parse failures are the only thing reported, and only once, at
//! compile time.

use std::sync::Arc;

use dashmap::DashMap;
use once_cell::sync::Lazy;

use crate::error::{EngineError, Result};
use crate::types::NestedValue;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Field(String),
    Index(i64),
    Key(String),
}

/// A parsed, cacheable path expression.
#[derive(Debug, Clone)]
pub struct CompiledPath {
    source: String,
    tokens: Vec<Token>,
}

impl PartialEq for CompiledPath {
    fn eq(&self, other: &Self) -> bool {
        self.tokens == other.tokens
    }
}

static PATH_CACHE: Lazy<DashMap<String, Arc<CompiledPath>>> = Lazy::new(DashMap::new);

impl CompiledPath {
    /// Parse `source` into a `CompiledPath`, consulting (and populating) the
    /// process-wide memoization cache. Parse failures are reported here, at
    /// compile time, never per-row.
    pub fn compile(source: &str) -> Result<Arc<CompiledPath>> {
        if let Some(hit) = PATH_CACHE.get(source) {
            return Ok(hit.clone());
        }
        let tokens = tokenize(source)?;
        let compiled = Arc::new(CompiledPath { source: source.to_string(), tokens });
        PATH_CACHE.insert(source.to_string(), compiled.clone());
        Ok(compiled)
    }

    /// Parse without touching the shared cache; used by tests that want an
    /// isolated instance.
    pub fn parse(source: &str) -> Result<CompiledPath> {
        Ok(CompiledPath { source: source.to_string(), tokens: tokenize(source)? })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// The top-level field this path starts from (used by
    /// `referenced_fields` in the expression evaluator).
    pub fn root_field(&self) -> Option<&str> {
        match self.tokens.first() {
            Some(Token::Field(f)) => Some(f.as_str()),
            _ => None,
        }
    }

    /// Resolve this path against `root`. Any absent step, out-of-range
    /// index, or access through `Null` yields `Null`.
    pub fn resolve(&self, root: &NestedValue) -> NestedValue {
        let mut current = root;
        for tok in &self.tokens {
            let next = match (tok, current) {
                (Token::Field(name), NestedValue::Map(m)) => m.get(name),
                (Token::Key(key), NestedValue::Map(m)) => m.get(key),
                (Token::Index(idx), NestedValue::List(list)) => index_list(list, *idx),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => return NestedValue::Null,
            }
        }
        current.clone()
    }

    /// Canonical string form; round-trips through `parse` for any path that
    /// was itself produced by `to_string`.
    pub fn to_canonical_string(&self) -> String {
        let mut out = String::new();
        for (i, tok) in self.tokens.iter().enumerate() {
            match tok {
                Token::Field(f) => {
                    if i > 0 {
                        out.push('.');
                    }
                    out.push_str(f);
                }
                Token::Index(idx) => {
                    out.push('[');
                    out.push_str(&idx.to_string());
                    out.push(']');
                }
                Token::Key(k) => {
                    out.push_str("['");
                    out.push_str(k);
                    out.push_str("']");
                }
            }
        }
        out
    }
}

fn index_list(list: &[NestedValue], idx: i64) -> Option<&NestedValue> {
    let len = list.len() as i64;
    let resolved = if idx < 0 { len + idx } else { idx };
    if resolved < 0 || resolved >= len {
        return None;
    }
    list.get(resolved as usize)
}

fn tokenize(source: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = source.chars().collect();
    let mut pos = 0usize;
    let mut tokens = Vec::new();
    let mut expect_field = true;

    while pos < chars.len() {
        if expect_field {
            let start = pos;
            while pos < chars.len() && is_ident_char(chars[pos]) {
                pos += 1;
            }
            if pos == start {
                return Err(EngineError::compile(format!(
                    "expected identifier at offset {} in path '{}'",
                    pos, source
                )));
            }
            tokens.push(Token::Field(chars[start..pos].iter().collect()));
            expect_field = false;
            continue;
        }

        match chars[pos] {
            '.' => {
                pos += 1;
                let start = pos;
                while pos < chars.len() && is_ident_char(chars[pos]) {
                    pos += 1;
                }
                if pos == start {
                    return Err(EngineError::compile(format!(
                        "expected identifier after '.' at offset {} in path '{}'",
                        pos, source
                    )));
                }
                tokens.push(Token::Field(chars[start..pos].iter().collect()));
            }
            '[' => {
                pos += 1;
                if pos >= chars.len() {
                    return Err(EngineError::compile(format!("unmatched '[' in path '{}'", source)));
                }
                if chars[pos] == '\'' || chars[pos] == '"' {
                    let quote = chars[pos];
                    pos += 1;
                    let start = pos;
                    while pos < chars.len() && chars[pos] != quote {
                        pos += 1;
                    }
                    if pos >= chars.len() {
                        return Err(EngineError::compile(format!(
                            "unterminated quoted key in path '{}'",
                            source
                        )));
                    }
                    let key: String = chars[start..pos].iter().collect();
                    pos += 1; // closing quote
                    if pos >= chars.len() || chars[pos] != ']' {
                        return Err(EngineError::compile(format!("expected ']' in path '{}'", source)));
                    }
                    pos += 1;
                    tokens.push(Token::Key(key));
                } else {
                    let start = pos;
                    if chars[pos] == '-' {
                        pos += 1;
                    }
                    let digits_start = pos;
                    while pos < chars.len() && chars[pos].is_ascii_digit() {
                        pos += 1;
                    }
                    if pos == digits_start {
                        return Err(EngineError::compile(format!(
                            "expected integer index in path '{}'",
                            source
                        )));
                    }
                    let idx_str: String = chars[start..pos].iter().collect();
                    let idx: i64 = idx_str
                        .parse()
                        .map_err(|_| EngineError::compile(format!("invalid index '{}' in path '{}'", idx_str, source)))?;
                    if pos >= chars.len() || chars[pos] != ']' {
                        return Err(EngineError::compile(format!("unmatched '[' in path '{}'", source)));
                    }
                    pos += 1;
                    tokens.push(Token::Index(idx));
                }
            }
            c => {
                return Err(EngineError::compile(format!(
                    "unexpected character '{}' at offset {} in path '{}'",
                    c, pos, source
                )))
            }
        }
    }

    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::HashMap;

    fn map(pairs: Vec<(&str, NestedValue)>) -> NestedValue {
        NestedValue::Map(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn simple_dotted_path() {
        let root = map(vec![("device", map(vec![("info", map(vec![("name", NestedValue::String("S1".into()))]))]))]);
        let path = CompiledPath::parse("device.info.name").unwrap();
        assert_eq!(path.resolve(&root), NestedValue::String("S1".into()));
    }

    #[test]
    fn mixed_access_with_negative_index_and_quoted_key() {
        let root = map(vec![(
            "floors",
            NestedValue::List(vec![
                NestedValue::Null,
                map(vec![(
                    "sensors",
                    NestedValue::List(vec![map(vec![(
                        "readings",
                        map(vec![("temperature", NestedValue::Float(21.5))]),
                    )])]),
                )]),
            ]),
        )]);
        let path = CompiledPath::parse("floors[-1].sensors[0].readings['temperature']").unwrap();
        assert_eq!(path.resolve(&root), NestedValue::Float(21.5));
    }

    #[test]
    fn out_of_range_index_is_null_not_error() {
        let root = map(vec![("tags", NestedValue::List(vec![]))]);
        let path = CompiledPath::parse("tags[-1]").unwrap();
        assert_eq!(path.resolve(&root), NestedValue::Null);
    }

    #[test]
    fn access_on_null_is_null() {
        let path = CompiledPath::parse("a.b.c").unwrap();
        assert_eq!(path.resolve(&NestedValue::Null), NestedValue::Null);
    }

    #[test]
    fn unmatched_bracket_is_compile_time_error() {
        assert!(CompiledPath::parse("a[0").is_err());
        assert!(CompiledPath::parse("a['x'").is_err());
    }

    #[test]
    fn compile_caches_identical_paths() {
        let a = CompiledPath::compile("x.y.z").unwrap();
        let b = CompiledPath::compile("x.y.z").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn canonical_round_trip() {
        let p = CompiledPath::parse("a.b[0]['k']").unwrap();
        let s = p.to_canonical_string();
        let p2 = CompiledPath::parse(&s).unwrap();
        assert_eq!(p2.to_canonical_string(), s);
    }

    fn arb_path_source() -> impl Strategy<Value = String> {
        let segment = "[a-z][a-z0-9_]{0,5}";
        let step = prop_oneof![
            segment.prop_map(|f| format!(".{f}")),
            (-8i64..8i64).prop_map(|i| format!("[{i}]")),
            "[a-z]{1,4}".prop_map(|k| format!("['{k}']")),
        ];
        (segment, prop::collection::vec(step, 0..6)).prop_map(|(root, steps)| {
            let mut s = root;
            for step in steps {
                s.push_str(&step);
            }
            s
        })
    }

    proptest! {
        /// Any path built from `to_canonical_string` parses back to tokens
        /// that stringify to the same text (§4.1).
        #[test]
        fn canonical_string_round_trips(source in arb_path_source()) {
            let parsed = CompiledPath::parse(&source).unwrap();
            let canonical = parsed.to_canonical_string();
            let reparsed = CompiledPath::parse(&canonical).unwrap();
            prop_assert_eq!(reparsed.to_canonical_string(), canonical);
        }

        /// A negative list index always resolves the same element a
        /// positive `len + idx` index would, for any index and list length.
        #[test]
        fn negative_index_matches_positive_equivalent(len in 1usize..20, idx in -20i64..20i64) {
            let list: Vec<NestedValue> = (0..len as i64).map(NestedValue::Int).collect();
            let root = NestedValue::List(list.clone());
            let negative = CompiledPath::parse(&format!("x[{idx}]")).unwrap();
            let resolved = negative.resolve(&map(vec![("x", root.clone())]));

            let in_range = if idx < 0 { len as i64 + idx } else { idx };
            let expected = if in_range >= 0 && in_range < len as i64 {
                NestedValue::Int(in_range)
            } else {
                NestedValue::Null
            };
            prop_assert_eq!(resolved, expected);
        }
    }
}
