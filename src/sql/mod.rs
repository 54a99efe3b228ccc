//! Reference SQL-surface compiler (§10, supplemented): turns the subset of
//! SQL spec.md §6 names into a [`StreamConfig`]. This is not a general SQL
//! front-end — it implements exactly the grammar below, nothing more, and a
//! caller is always free to build a `StreamConfig` directly instead.
//!
//! Grammar: `SELECT [DISTINCT] field_list FROM source [WHERE cond]
//! [GROUP BY col_list[, WindowFn(args)]] [HAVING cond] [LIMIT n]
//! [WITH (TIMESTAMP='path', TIMEUNIT='ss'|'ms'|'mi'|'hh'|'dd',
//! MAXOUTOFORDERNESS='5s', ALLOWEDLATENESS='2s', IDLETIMEOUT='10s')]`.
//!
//! Clause and SELECT-item boundaries are found with a small paren/quote-aware
//! scanner; the text inside each boundary is handed verbatim to
//! [`crate::expr::CompiledExpr::compile`], which already implements the full
//! expression grammar — this module never re-parses an expression itself.

mod validate;

use std::time::Duration;

use crate::error::{EngineError, Result};
use crate::expr::{CompiledExpr, Expr, SelectKind};
use crate::function_registry::FunctionRegistry;
use crate::types::{FieldExpression, StreamConfig, TimeCharacteristic, TimeUnit, WindowConfig, WindowKind};

const WINDOW_FNS: [&str; 4] = ["tumblingwindow", "slidingwindow", "countingwindow", "sessionwindow"];

/// Compile a SQL string into a [`StreamConfig`].
pub fn compile(sql: &str, registry: &FunctionRegistry) -> Result<StreamConfig> {
    let scan = Scan::new(sql);

    let select_kw = scan.find_keyword("SELECT", 0).ok_or_else(|| EngineError::compile("query must start with SELECT"))?;
    let from_kw = scan
        .find_keyword("FROM", select_kw + 6)
        .ok_or_else(|| EngineError::compile("missing FROM clause"))?;

    if scan.text(from_kw + 4, scan.next_non_ident(from_kw + 4)).trim().is_empty() {
        return Err(EngineError::compile("expected a source name after FROM"));
    }

    // Walk the remaining optional clauses in their fixed relative order,
    // recording each one's keyword start and content start.
    let mut markers: Vec<(&'static str, usize, usize)> = Vec::new();
    let mut cursor = from_kw + 4;

    if let Some(p) = scan.find_keyword("WHERE", cursor) {
        markers.push(("WHERE", p, p + 5));
        cursor = p + 5;
    }
    if let Some(p) = scan.find_keyword("GROUP", cursor) {
        let by_region_start = p + 5;
        let by = scan.find_keyword("BY", by_region_start);
        match by {
            Some(bp) if scan.text(by_region_start, bp).trim().is_empty() => {
                markers.push(("GROUP BY", p, bp + 2));
                cursor = bp + 2;
            }
            _ => return Err(EngineError::compile("expected BY after GROUP")),
        }
    }
    if let Some(p) = scan.find_keyword("HAVING", cursor) {
        markers.push(("HAVING", p, p + 6));
        cursor = p + 6;
    }
    if let Some(p) = scan.find_keyword("LIMIT", cursor) {
        markers.push(("LIMIT", p, p + 5));
        cursor = p + 5;
    }
    if let Some(p) = scan.find_keyword("WITH", cursor) {
        markers.push(("WITH", p, p + 4));
        cursor = p + 4;
    }
    let _ = cursor;

    let total_len = scan.len();
    let clause_span = |idx: usize| -> (usize, usize) {
        let (_, _, content_start) = markers[idx];
        let content_end = markers.get(idx + 1).map(|m| m.1).unwrap_or(total_len);
        (content_start, content_end)
    };
    let find_clause = |name: &str| markers.iter().position(|m| m.0 == name);

    let select_list_end = markers.first().map(|m| m.1).unwrap_or(total_len);

    let mut config = StreamConfig::default();

    compile_select_list(&scan, select_kw + 6, select_list_end, registry, &mut config)?;

    if let Some(idx) = find_clause("WHERE") {
        let (s, e) = clause_span(idx);
        let text = scan.text(s, e).trim().to_string();
        if !text.is_empty() {
            CompiledExpr::compile(&text, registry)?; // validated eagerly, compiled again at execute time
            config.where_clause = Some(text);
        }
    }

    let mut window_kind: Option<WindowKind> = None;
    if let Some(idx) = find_clause("GROUP BY") {
        let (s, e) = clause_span(idx);
        window_kind = compile_group_by(&scan, s, e, &mut config)?;
    }

    if let Some(idx) = find_clause("HAVING") {
        let (s, e) = clause_span(idx);
        let text = scan.text(s, e).trim().to_string();
        if !text.is_empty() {
            CompiledExpr::compile(&text, registry)?;
            config.having = Some(text);
        }
    }

    if let Some(idx) = find_clause("LIMIT") {
        let (s, e) = clause_span(idx);
        let text = scan.text(s, e).trim().to_string();
        config.limit = text
            .parse()
            .map_err(|_| EngineError::compile(format!("invalid LIMIT value '{}'", text)))?;
    }

    if let Some(kind) = window_kind {
        let mut window_config = WindowConfig {
            kind,
            group_by_key: config.group_fields.clone(),
            ..WindowConfig::default()
        };
        if let Some(idx) = find_clause("WITH") {
            let (s, e) = clause_span(idx);
            apply_with_options(&scan, s, e, &mut window_config)?;
        }
        config.need_window = true;
        config.window_config = Some(window_config);
    } else if find_clause("WITH").is_some() {
        return Err(EngineError::compile("WITH clause requires a window function in GROUP BY"));
    } else if !config.group_fields.is_empty() {
        return Err(EngineError::compile("GROUP BY requires a window function (TumblingWindow/SlidingWindow/CountingWindow/SessionWindow)"));
    }

    validate::validate(&config)?;
    Ok(config)
}

fn compile_select_list(
    scan: &Scan,
    mut start: usize,
    end: usize,
    registry: &FunctionRegistry,
    config: &mut StreamConfig,
) -> Result<()> {
    let list_text = scan.text(start, end);
    let trimmed_leading = list_text.len() - list_text.trim_start().len();
    start += trimmed_leading;
    if let Some(rest) = strip_leading_keyword(&scan.text(start, end), "DISTINCT") {
        config.distinct = true;
        start = end - rest.len();
    }

    let items = scan.split_commas(start, end);
    let mut expr_index = 0usize;
    for (item_start, item_end) in items {
        let (expr_span, alias_override) = match scan.find_top_level_as(item_start, item_end) {
            Some(as_pos) => ((item_start, as_pos), Some(scan.text(as_pos + 2, item_end).trim().to_string())),
            None => ((item_start, item_end), None),
        };
        let expr_text = scan.text(expr_span.0, expr_span.1).trim().to_string();
        if expr_text.is_empty() {
            return Err(EngineError::compile("empty SELECT item"));
        }
        compile_select_item(&expr_text, alias_override, expr_index, registry, config)?;
        expr_index += 1;
    }
    if config.field_order.is_empty() {
        return Err(EngineError::compile("SELECT list must name at least one field"));
    }
    Ok(())
}

fn strip_leading_keyword<'a>(text: &'a str, kw: &str) -> Option<&'a str> {
    let trimmed = text.trim_start();
    if trimmed.len() < kw.len() || !trimmed[..kw.len()].eq_ignore_ascii_case(kw) {
        return None;
    }
    let after = &trimmed[kw.len()..];
    let boundary_ok = after.chars().next().map(|c| !c.is_alphanumeric() && c != '_').unwrap_or(true);
    if boundary_ok {
        Some(after.trim_start())
    } else {
        None
    }
}

fn compile_select_item(
    expr_text: &str,
    alias_override: Option<String>,
    expr_index: usize,
    registry: &FunctionRegistry,
    config: &mut StreamConfig,
) -> Result<()> {
    if expr_text == "*" {
        let alias = alias_override.unwrap_or_else(|| "*".to_string());
        config.select_fields.insert(alias.clone(), String::new());
        config.simple_fields.push("*".to_string());
        config.field_order.push(alias);
        return Ok(());
    }

    if let Some((name, inner)) = match_count_star(expr_text) {
        if !name.eq_ignore_ascii_case("count") {
            return Err(EngineError::compile(format!("'*' argument is only supported for COUNT, got '{}'", name)));
        }
        let _ = inner;
        registry.lookup("count")?;
        let alias = alias_override.unwrap_or_else(|| "count".to_string());
        config.select_fields.insert(alias.clone(), "count".to_string());
        config.field_order.push(alias);
        return Ok(());
    }

    let compiled = CompiledExpr::compile(expr_text, registry)?;
    match compiled.classify(registry) {
        SelectKind::Simple => {
            let alias = alias_override.unwrap_or_else(|| expr_text.to_string());
            config.field_alias.insert(alias.clone(), expr_text.to_string());
            config.select_fields.insert(alias.clone(), String::new());
            if alias == expr_text {
                config.simple_fields.push(expr_text.to_string());
            } else {
                config.simple_fields.push(format!("{}:{}", expr_text, alias));
            }
            config.field_order.push(alias);
        }
        SelectKind::Expression => {
            let alias = alias_override.unwrap_or_else(|| format!("expr{}", expr_index + 1));
            config.field_expressions.insert(
                alias.clone(),
                FieldExpression {
                    expression_text: expr_text.to_string(),
                    referenced_fields: compiled.referenced_fields().to_vec(),
                },
            );
            config.select_fields.insert(alias.clone(), "expression".to_string());
            config.field_order.push(alias);
        }
        SelectKind::Aggregate(func_name) => {
            let is_bare_call = matches!(compiled.ast(), Expr::Call { name, .. } if name.eq_ignore_ascii_case(&func_name));
            if !is_bare_call {
                return Err(EngineError::compile(format!(
                    "nested aggregate expression '{}' is not supported by the reference compiler; \
                     put the aggregate call at the top level of the SELECT item",
                    expr_text
                )));
            }
            let alias = alias_override.unwrap_or_else(|| func_name.clone());
            let inner = call_inner_text(expr_text)?.trim().to_string();
            if func_name.eq_ignore_ascii_case("count") && inner.is_empty() {
                // COUNT() — count-star, no input.
            } else {
                let inner_compiled = CompiledExpr::compile(&inner, registry)?;
                match inner_compiled.classify(registry) {
                    SelectKind::Simple => {
                        config.field_alias.insert(alias.clone(), inner);
                    }
                    _ => {
                        config.field_expressions.insert(
                            alias.clone(),
                            FieldExpression {
                                expression_text: inner,
                                referenced_fields: inner_compiled.referenced_fields().to_vec(),
                            },
                        );
                    }
                }
            }
            config.select_fields.insert(alias.clone(), func_name);
            config.field_order.push(alias);
        }
    }
    Ok(())
}

/// Detect the literal `name(*)` form, which `CompiledExpr::compile` cannot
/// parse (its tokenizer has no bare `*` primary — only the binary operator).
fn match_count_star(expr_text: &str) -> Option<(&str, &str)> {
    let open = expr_text.find('(')?;
    let name = expr_text[..open].trim();
    if name.is_empty() || !name.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return None;
    }
    let inner = call_inner_text(expr_text).ok()?;
    if inner.trim() == "*" {
        Some((name, inner))
    } else {
        None
    }
}

/// Slice the text between a call's outer parens, respecting quotes and
/// nested parens. `call_text` must contain exactly one top-level call.
fn call_inner_text(call_text: &str) -> Result<&str> {
    let chars: Vec<char> = call_text.chars().collect();
    let open = chars
        .iter()
        .position(|&c| c == '(')
        .ok_or_else(|| EngineError::compile(format!("expected '(' in '{}'", call_text)))?;
    let mut depth = 1i32;
    let mut quote: Option<char> = None;
    let mut close = None;
    let mut i = open + 1;
    while i < chars.len() {
        let c = chars[i];
        if let Some(q) = quote {
            if c == q {
                quote = None;
            }
        } else if c == '\'' || c == '"' {
            quote = Some(c);
        } else if c == '(' {
            depth += 1;
        } else if c == ')' {
            depth -= 1;
            if depth == 0 {
                close = Some(i);
                break;
            }
        }
        i += 1;
    }
    let close = close.ok_or_else(|| EngineError::compile(format!("unmatched '(' in '{}'", call_text)))?;
    let start_byte: usize = chars[..open + 1].iter().map(|c| c.len_utf8()).sum();
    let end_byte: usize = chars[..close].iter().map(|c| c.len_utf8()).sum();
    Ok(&call_text[start_byte..end_byte])
}

fn compile_group_by(scan: &Scan, start: usize, end: usize, config: &mut StreamConfig) -> Result<Option<WindowKind>> {
    let mut window_kind = None;
    for (item_start, item_end) in scan.split_commas(start, end) {
        let item = scan.text(item_start, item_end).trim().to_string();
        if item.is_empty() {
            continue;
        }
        match item.find('(') {
            None => config.group_fields.push(item),
            Some(paren) => {
                let name = item[..paren].trim();
                if !WINDOW_FNS.iter().any(|w| w.eq_ignore_ascii_case(name)) {
                    return Err(EngineError::compile(format!("unknown window function '{}' in GROUP BY", name)));
                }
                if window_kind.is_some() {
                    return Err(EngineError::compile("GROUP BY may contain at most one window function"));
                }
                let inner = call_inner_text(&item)?;
                let args = Scan::new(inner)
                    .split_commas(0, inner.chars().count())
                    .into_iter()
                    .map(|(s, e)| strip_quotes(Scan::new(inner).text(s, e).trim()))
                    .collect::<Vec<_>>();
                window_kind = Some(build_window_kind(name, &args)?);
            }
        }
    }
    Ok(window_kind)
}

fn build_window_kind(name: &str, args: &[String]) -> Result<WindowKind> {
    let lower = name.to_ascii_lowercase();
    match lower.as_str() {
        "tumblingwindow" => {
            let size = parse_duration_literal(args.get(0).ok_or_else(|| EngineError::compile("TumblingWindow requires a size argument"))?)?;
            Ok(WindowKind::Tumbling { size })
        }
        "slidingwindow" => {
            let size = parse_duration_literal(args.get(0).ok_or_else(|| EngineError::compile("SlidingWindow requires size and slide arguments"))?)?;
            let slide = parse_duration_literal(args.get(1).ok_or_else(|| EngineError::compile("SlidingWindow requires size and slide arguments"))?)?;
            Ok(WindowKind::Sliding { size, slide })
        }
        "countingwindow" => {
            let raw = args.get(0).ok_or_else(|| EngineError::compile("CountingWindow requires a threshold argument"))?;
            let threshold: usize = raw.parse().map_err(|_| EngineError::config(format!("invalid CountingWindow threshold '{}'", raw)))?;
            Ok(WindowKind::Counting { threshold })
        }
        "sessionwindow" => {
            let timeout = parse_duration_literal(args.get(0).ok_or_else(|| EngineError::compile("SessionWindow requires a timeout argument"))?)?;
            Ok(WindowKind::Session { timeout })
        }
        _ => unreachable!("checked against WINDOW_FNS before dispatch"),
    }
}

fn apply_with_options(scan: &Scan, start: usize, end: usize, window_config: &mut WindowConfig) -> Result<()> {
    let text = scan.text(start, end);
    let trimmed = text.trim();
    let inner = trimmed
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| EngineError::compile("WITH clause must be parenthesized, e.g. WITH (TIMESTAMP='ts')"))?;
    let inner_scan = Scan::new(inner);
    for (s, e) in inner_scan.split_commas(0, inner.chars().count()) {
        let item = inner_scan.text(s, e);
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        let eq = item.find('=').ok_or_else(|| EngineError::compile(format!("malformed WITH option '{}'", item)))?;
        let key = item[..eq].trim().to_ascii_uppercase();
        let value = strip_quotes(item[eq + 1..].trim());
        match key.as_str() {
            "TIMESTAMP" => {
                window_config.ts_prop = Some(value);
                window_config.time_characteristic = TimeCharacteristic::EventTime;
            }
            "TIMEUNIT" => window_config.time_unit = parse_time_unit(&value)?,
            "MAXOUTOFORDERNESS" => window_config.max_out_of_orderness = parse_duration_literal(&value)?,
            "ALLOWEDLATENESS" => window_config.allowed_lateness = parse_duration_literal(&value)?,
            "IDLETIMEOUT" => window_config.idle_timeout = parse_duration_literal(&value)?,
            other => return Err(EngineError::compile(format!("unknown WITH option '{}'", other))),
        }
    }
    Ok(())
}

fn parse_time_unit(code: &str) -> Result<TimeUnit> {
    match code.to_ascii_lowercase().as_str() {
        "ss" => Ok(TimeUnit::S),
        "ms" => Ok(TimeUnit::Ms),
        "mi" => Ok(TimeUnit::M),
        "hh" => Ok(TimeUnit::H),
        "dd" => Ok(TimeUnit::D),
        other => Err(EngineError::config(format!("unknown TIMEUNIT '{}'", other))),
    }
}

fn strip_quotes(s: &str) -> String {
    let bytes = s.as_bytes();
    if bytes.len() >= 2 && (bytes[0] == b'\'' || bytes[0] == b'"') && bytes[bytes.len() - 1] == bytes[0] {
        s[1..s.len() - 1].to_string()
    } else {
        s.to_string()
    }
}

/// Parse a duration literal like `'5s'`, `'30s'`, `'5m'` (already unquoted).
fn parse_duration_literal(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.').unwrap_or(s.len());
    let (num_part, unit_part) = s.split_at(split);
    if num_part.is_empty() {
        return Err(EngineError::config(format!("invalid duration '{}'", s)));
    }
    let amount: f64 = num_part.parse().map_err(|_| EngineError::config(format!("invalid duration '{}'", s)))?;
    let nanos = match unit_part.trim() {
        "ns" => amount,
        "ms" => amount * 1_000_000.0,
        "s" | "" => amount * 1_000_000_000.0,
        "m" => amount * 60.0 * 1_000_000_000.0,
        "h" => amount * 3_600.0 * 1_000_000_000.0,
        "d" => amount * 86_400.0 * 1_000_000_000.0,
        other => return Err(EngineError::config(format!("unknown duration unit '{}' in '{}'", other, s))),
    };
    if !nanos.is_finite() || nanos < 0.0 {
        return Err(EngineError::config(format!("invalid duration '{}'", s)));
    }
    Ok(Duration::from_nanos(nanos as u64))
}

/// A paren/quote-aware view over a SQL string: every char position carries
/// the paren nesting depth and whether it falls inside a quoted literal, so
/// clause keywords, SELECT items, and call arguments can be split without
/// re-implementing expression parsing.
struct Scan {
    chars: Vec<char>,
    depths: Vec<i32>,
    in_str: Vec<bool>,
}

impl Scan {
    fn new(s: &str) -> Self {
        let chars: Vec<char> = s.chars().collect();
        let mut depths = Vec::with_capacity(chars.len());
        let mut in_str = Vec::with_capacity(chars.len());
        let mut depth = 0i32;
        let mut quote: Option<char> = None;
        for &c in &chars {
            if let Some(q) = quote {
                in_str.push(true);
                depths.push(depth);
                if c == q {
                    quote = None;
                }
                continue;
            }
            if c == '\'' || c == '"' {
                quote = Some(c);
                in_str.push(true);
                depths.push(depth);
                continue;
            }
            in_str.push(false);
            match c {
                '(' => {
                    depths.push(depth);
                    depth += 1;
                }
                ')' => {
                    depth -= 1;
                    depths.push(depth);
                }
                _ => depths.push(depth),
            }
        }
        Scan { chars, depths, in_str }
    }

    fn len(&self) -> usize {
        self.chars.len()
    }

    fn text(&self, start: usize, end: usize) -> String {
        let start = start.min(self.chars.len());
        let end = end.min(self.chars.len()).max(start);
        self.chars[start..end].iter().collect()
    }

    fn is_ident_char(c: char) -> bool {
        c.is_alphanumeric() || c == '_'
    }

    fn next_non_ident(&self, from: usize) -> usize {
        let mut i = from;
        while i < self.chars.len() && Self::is_ident_char(self.chars[i]) {
            i += 1;
        }
        i
    }

    /// Find a whole-word, case-insensitive keyword at paren depth 0 outside
    /// any quoted literal, starting from `from`.
    fn find_keyword(&self, kw: &str, from: usize) -> Option<usize> {
        let kwc: Vec<char> = kw.chars().collect();
        let n = kwc.len();
        if n == 0 {
            return None;
        }
        let mut i = from;
        while i + n <= self.chars.len() {
            if self.depths[i] == 0
                && !self.in_str[i]
                && (0..n).all(|j| self.chars[i + j].eq_ignore_ascii_case(&kwc[j]))
                && (i == 0 || !Self::is_ident_char(self.chars[i - 1]))
                && (i + n == self.chars.len() || !Self::is_ident_char(self.chars[i + n]))
            {
                return Some(i);
            }
            i += 1;
        }
        None
    }

    /// Split `[start, end)` on commas at the paren depth found at `start`.
    fn split_commas(&self, start: usize, end: usize) -> Vec<(usize, usize)> {
        let start = start.min(self.chars.len());
        let end = end.min(self.chars.len()).max(start);
        let base_depth = self.depths.get(start).copied().unwrap_or(0);
        let mut parts = Vec::new();
        let mut part_start = start;
        for i in start..end {
            if self.depths[i] == base_depth && !self.in_str[i] && self.chars[i] == ',' {
                parts.push((part_start, i));
                part_start = i + 1;
            }
        }
        parts.push((part_start, end));
        parts
    }

    /// Find a top-level `AS` keyword inside `[start, end)`.
    fn find_top_level_as(&self, start: usize, end: usize) -> Option<usize> {
        let start = start.min(self.chars.len());
        let end = end.min(self.chars.len()).max(start);
        let base_depth = self.depths.get(start).copied().unwrap_or(0);
        let mut i = start;
        while i + 2 <= end {
            if self.depths[i] == base_depth
                && !self.in_str[i]
                && self.chars[i].eq_ignore_ascii_case(&'a')
                && self.chars[i + 1].eq_ignore_ascii_case(&'s')
                && (i == start || !Self::is_ident_char(self.chars[i - 1]))
                && (i + 2 == end || !Self::is_ident_char(self.chars[i + 2]))
            {
                return Some(i);
            }
            i += 1;
        }
        None
    }
}
