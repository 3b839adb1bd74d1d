//! SQL Text Scanning
//!
//! Lightweight, quote- and parenthesis-aware helpers for working with SQL text.
//! These are not a parser: they locate top-level clause keywords and `FROM`/`JOIN`
//! targets well enough for composition, validation and filter injection.
//! Every function here is total and never panics on malformed input.

use lazy_static::lazy_static;
use regex::Regex;
use std::collections::HashSet;

/// Top-level clauses of a single SELECT statement, in the order they must appear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clause {
    Select,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Limit,
}

impl Clause {
    pub const ORDERED: [Clause; 7] = [
        Clause::Select,
        Clause::From,
        Clause::Where,
        Clause::GroupBy,
        Clause::Having,
        Clause::OrderBy,
        Clause::Limit,
    ];

    pub fn keyword(&self) -> &'static str {
        match self {
            Clause::Select => "SELECT",
            Clause::From => "FROM",
            Clause::Where => "WHERE",
            Clause::GroupBy => "GROUP BY",
            Clause::Having => "HAVING",
            Clause::OrderBy => "ORDER BY",
            Clause::Limit => "LIMIT",
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            Clause::Select => &SELECT_RE,
            Clause::From => &FROM_RE,
            Clause::Where => &WHERE_RE,
            Clause::GroupBy => &GROUP_BY_RE,
            Clause::Having => &HAVING_RE,
            Clause::OrderBy => &ORDER_BY_RE,
            Clause::Limit => &LIMIT_RE,
        }
    }
}

lazy_static! {
    static ref SELECT_RE: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref FROM_RE: Regex = Regex::new(r"(?i)\bFROM\b").unwrap();
    static ref WHERE_RE: Regex = Regex::new(r"(?i)\bWHERE\b").unwrap();
    static ref GROUP_BY_RE: Regex = Regex::new(r"(?i)\bGROUP\s+BY\b").unwrap();
    static ref HAVING_RE: Regex = Regex::new(r"(?i)\bHAVING\b").unwrap();
    static ref ORDER_BY_RE: Regex = Regex::new(r"(?i)\bORDER\s+BY\b").unwrap();
    static ref LIMIT_RE: Regex = Regex::new(r"(?i)\b(?:LIMIT|OFFSET|FETCH)\b").unwrap();

    // Functions whose argument list legally contains the word FROM.
    static ref FROM_FUNCTION_RE: Regex =
        Regex::new(r"(?i)\b(?:EXTRACT|SUBSTRING|TRIM|POSITION|OVERLAY)\s*\([^()]*\)").unwrap();

    static ref TABLE_REF_RE: Regex = Regex::new(
        r#"(?i)\b(FROM|JOIN)\s+([A-Za-z_\["][A-Za-z0-9_\.\[\]"]*)(?:\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?"#
    )
    .unwrap();

    // A further relation in a comma-separated FROM list.
    static ref FROM_LIST_ITEM_RE: Regex = Regex::new(
        r#"(?i)^,\s*([A-Za-z_\["][A-Za-z0-9_\.\[\]"]*)(?:\s+(?:AS\s+)?([A-Za-z_][A-Za-z0-9_]*))?"#
    )
    .unwrap();

    // Where a FROM list ends at its own nesting level.
    static ref FROM_LIST_END_RE: Regex = Regex::new(
        r"(?i)\b(?:WHERE|GROUP\s+BY|HAVING|ORDER\s+BY|LIMIT|OFFSET|FETCH|UNION|INTERSECT|EXCEPT|WINDOW)\b|;"
    )
    .unwrap();

    static ref BOOLEAN_WORD_RE: Regex = Regex::new(r"(?i)\b(?:AND|OR|BETWEEN|CASE|END)\b").unwrap();

    /// Words that can follow a table name but are never an alias.
    pub static ref SQL_KEYWORDS: HashSet<&'static str> = [
        "select", "from", "where", "join", "inner", "left", "right", "full", "outer",
        "cross", "natural", "lateral", "on", "using", "group", "order", "by", "having",
        "limit", "offset", "fetch", "union", "intersect", "except", "as", "and", "or",
        "not", "with", "window", "top", "into", "set", "values", "is", "null", "in",
        "between", "like", "case", "when", "then", "else", "end", "asc", "desc",
    ]
    .into_iter()
    .collect();
}

/// A `FROM <name> [alias]` or `JOIN <name> [alias]` occurrence. Relations
/// listed after a comma in a FROM list are reported with keyword `FROM`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableRef {
    /// `FROM` or `JOIN`, upper-cased.
    pub keyword: String,
    /// Relation name, lower-cased, brackets/quotes and schema prefix removed.
    pub name: String,
    /// Relation name exactly as written.
    pub raw_name: String,
    /// Alias as written, if a usable (non-keyword) alias token follows the name.
    pub alias: Option<String>,
    /// Byte offset where the keyword starts (the name, for comma-listed items).
    pub start: usize,
    /// Byte offset just past the alias (or the name, when no alias was found).
    pub end: usize,
    /// Parenthesis depth: 0 for the main query, more inside subqueries.
    pub depth: i32,
}

impl TableRef {
    /// The identifier other clauses use to qualify this relation's columns.
    pub fn effective_alias(&self) -> &str {
        self.alias.as_deref().unwrap_or(&self.raw_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Token {
    Code,
    /// Body of a `'...'`, `E'...'` or `$tag$...$tag$` string.
    Literal,
    /// Body of a `"..."` identifier.
    Identifier,
    /// A whole `--` or `/* */` comment, delimiters included.
    Comment,
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Index of the closing `quote` at or after `from`, or `bytes.len()` if the
/// string is never closed. Doubled quotes are escapes, as are backslashes
/// when `backslash_escapes` is set.
fn quoted_end(bytes: &[u8], from: usize, quote: u8, backslash_escapes: bool) -> usize {
    let mut j = from;
    while j < bytes.len() {
        let b = bytes[j];
        if backslash_escapes && b == b'\\' {
            j += 2;
        } else if b == quote {
            if bytes.get(j + 1) == Some(&quote) {
                j += 2;
            } else {
                return j;
            }
        } else {
            j += 1;
        }
    }
    bytes.len()
}

/// `$tag$` opening a dollar-quoted string at `i`, if any.
fn dollar_tag(bytes: &[u8], i: usize) -> Option<usize> {
    if i > 0 && (is_ident_byte(bytes[i - 1]) || bytes[i - 1] == b'$') {
        return None;
    }
    let mut j = i + 1;
    if j < bytes.len() && (bytes[j].is_ascii_alphabetic() || bytes[j] == b'_') {
        while j < bytes.len() && is_ident_byte(bytes[j]) {
            j += 1;
        }
    }
    (bytes.get(j) == Some(&b'$')).then_some(j + 1)
}

/// Split SQL into code, string bodies, identifier bodies and comments,
/// following Postgres quoting rules. Quote delimiters stay in the code spans.
fn lex(sql: &str) -> Vec<(Token, usize, usize)> {
    let bytes = sql.as_bytes();
    let len = bytes.len();
    let mut spans = Vec::new();
    let mut code_start = 0;
    let mut i = 0;

    let push = |spans: &mut Vec<(Token, usize, usize)>, token: Token, start: usize, end: usize| {
        if start < end {
            spans.push((token, start, end));
        }
    };

    while i < len {
        let (token, body_start, body_end, resume) = match bytes[i] {
            b'\'' => {
                let escapes = i > 0
                    && matches!(bytes[i - 1], b'e' | b'E')
                    && (i == 1 || !is_ident_byte(bytes[i - 2]));
                let end = quoted_end(bytes, i + 1, b'\'', escapes);
                (Token::Literal, i + 1, end, end)
            }
            b'"' => {
                let end = quoted_end(bytes, i + 1, b'"', false);
                (Token::Identifier, i + 1, end, end)
            }
            b'$' => match dollar_tag(bytes, i) {
                Some(body_start) => {
                    let tag = &sql[i..body_start];
                    let end = sql[body_start..]
                        .find(tag)
                        .map(|p| body_start + p)
                        .unwrap_or(len);
                    (Token::Literal, body_start, end, end)
                }
                None => {
                    i += 1;
                    continue;
                }
            },
            b'-' if bytes.get(i + 1) == Some(&b'-') => {
                let end = sql[i..].find('\n').map(|p| i + p).unwrap_or(len);
                (Token::Comment, i, end, end)
            }
            b'/' if bytes.get(i + 1) == Some(&b'*') => {
                let mut depth = 0usize;
                let mut j = i;
                while j < len {
                    if bytes[j] == b'/' && bytes.get(j + 1) == Some(&b'*') {
                        depth += 1;
                        j += 2;
                    } else if bytes[j] == b'*' && bytes.get(j + 1) == Some(&b'/') {
                        depth -= 1;
                        j += 2;
                        if depth == 0 {
                            break;
                        }
                    } else {
                        j += 1;
                    }
                }
                let end = j.min(len);
                (Token::Comment, i, end, end)
            }
            _ => {
                i += 1;
                continue;
            }
        };

        let body_start = body_start.min(len);
        push(&mut spans, Token::Code, code_start, body_start);
        push(&mut spans, token, body_start, body_end);
        code_start = resume;
        // Step past the closing delimiter; it is re-read as code.
        i = if token == Token::Comment { resume } else { resume + 1 };
    }
    push(&mut spans, Token::Code, code_start, len);
    spans
}

/// Blank out string literal bodies (including `E'...'` and dollar-quoted
/// strings) and comments, and neutralize quoted identifiers to identifier
/// characters. Quote delimiters are kept. The result has exactly the same byte
/// length, so offsets map back to the input.
pub fn mask_literals(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for (token, start, end) in lex(sql) {
        let text = &sql[start..end];
        match token {
            Token::Code => out.push_str(text),
            Token::Literal => out.extend(std::iter::repeat(' ').take(text.len())),
            Token::Identifier => out.extend(
                text.bytes()
                    .map(|b| if is_ident_byte(b) { b as char } else { '_' }),
            ),
            Token::Comment => out.extend(
                text.bytes()
                    .map(|b| if b == b'\n' { '\n' } else { ' ' }),
            ),
        }
    }
    out
}

/// Remove `--` and `/* */` comments, leaving string literals and quoted
/// identifiers untouched. A block comment becomes a single space.
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for (token, start, end) in lex(sql) {
        match token {
            Token::Comment if sql[start..].starts_with("/*") => out.push(' '),
            Token::Comment => {}
            _ => out.push_str(&sql[start..end]),
        }
    }
    out
}

/// Apply `f` to every stretch of code, copying literals, quoted identifiers
/// and comments through unchanged.
pub fn map_code<F>(sql: &str, f: F) -> String
where
    F: Fn(&str) -> String,
{
    lex(sql)
        .into_iter()
        .map(|(token, start, end)| match token {
            Token::Code => f(&sql[start..end]),
            _ => sql[start..end].to_string(),
        })
        .collect()
}

/// Mask literals plus the bodies of functions such as `EXTRACT(YEAR FROM x)`,
/// so that keyword scans only see structural SQL.
pub fn mask_for_scan(sql: &str) -> String {
    let masked = mask_literals(sql);
    FROM_FUNCTION_RE
        .replace_all(&masked, |caps: &regex::Captures| " ".repeat(caps[0].len()))
        .into_owned()
}

/// Parenthesis depth at every byte offset of `masked`.
fn depth_map(masked: &str) -> Vec<i32> {
    let mut depths = Vec::with_capacity(masked.len() + 1);
    let mut depth = 0i32;
    for b in masked.bytes() {
        depths.push(depth);
        match b {
            b'(' => depth += 1,
            b')' => depth = (depth - 1).max(0),
            _ => {}
        }
    }
    depths.push(depth);
    depths
}

/// First top-level (paren depth 0) occurrence of `clause` at or after `from`.
/// Returns the byte span of the keyword itself.
pub fn find_top_level(sql: &str, clause: Clause, from: usize) -> Option<(usize, usize)> {
    let masked = mask_for_scan(sql);
    let depths = depth_map(&masked);
    find_top_level_masked(&masked, &depths, clause, from)
}

fn find_top_level_masked(
    masked: &str,
    depths: &[i32],
    clause: Clause,
    from: usize,
) -> Option<(usize, usize)> {
    if from > masked.len() {
        return None;
    }
    clause
        .pattern()
        .find_iter(masked)
        .filter(|m| m.start() >= from)
        .find(|m| depths.get(m.start()).copied().unwrap_or(0) == 0)
        .map(|m| (m.start(), m.end()))
}

/// The top-level clauses of a single SELECT statement.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SqlClauses {
    pub select: String,
    pub from: Option<String>,
    pub where_clause: Option<String>,
    pub group_by: Option<String>,
    pub having: Option<String>,
    pub order_by: Option<String>,
    pub limit: Option<String>,
}

/// Split a SELECT statement into its top-level clause bodies (keywords removed,
/// whitespace trimmed). Returns `None` if the text does not start with SELECT.
pub fn split_clauses(sql: &str) -> Option<SqlClauses> {
    let trimmed = sql.trim();
    let masked = mask_for_scan(trimmed);
    let depths = depth_map(&masked);

    let (select_start, _) = find_top_level_masked(&masked, &depths, Clause::Select, 0)?;
    if select_start != 0 {
        return None;
    }

    // (clause, keyword start, body start)
    let mut markers: Vec<(Clause, usize, usize)> = Vec::new();
    let mut cursor = 0;
    for clause in Clause::ORDERED {
        if let Some((start, end)) = find_top_level_masked(&masked, &depths, clause, cursor) {
            markers.push((clause, start, end));
            cursor = end;
        }
    }

    let mut clauses = SqlClauses::default();
    for (idx, (clause, _, body_start)) in markers.iter().enumerate() {
        let body_end = markers
            .get(idx + 1)
            .map(|(_, next_start, _)| *next_start)
            .unwrap_or(trimmed.len());
        let body = trimmed[*body_start..body_end].trim().to_string();
        match clause {
            Clause::Select => clauses.select = body,
            Clause::From => clauses.from = Some(body),
            Clause::Where => clauses.where_clause = Some(body),
            Clause::GroupBy => clauses.group_by = Some(body),
            Clause::Having => clauses.having = Some(body),
            Clause::OrderBy => clauses.order_by = Some(body),
            Clause::Limit => {
                // Keep the keyword: LIMIT/OFFSET/FETCH are not interchangeable.
                let (_, kw_start, _) = markers[idx];
                clauses.limit = Some(trimmed[kw_start..body_end].trim().to_string());
            }
        }
    }

    Some(clauses)
}

/// Split on commas that are not nested in parentheses or string literals.
pub fn split_top_level_commas(text: &str) -> Vec<String> {
    let masked = mask_literals(text);
    let depths = depth_map(&masked);
    let mut parts = Vec::new();
    let mut last = 0;
    for (idx, b) in masked.bytes().enumerate() {
        if b == b',' && depths[idx] == 0 {
            parts.push(text[last..idx].trim().to_string());
            last = idx + 1;
        }
    }
    parts.push(text[last..].trim().to_string());
    parts.into_iter().filter(|p| !p.is_empty()).collect()
}

/// Byte spans of the top-level `AND` operands of a boolean expression, or
/// `None` if the expression has a top-level `OR`. `BETWEEN x AND y` and
/// `CASE ... END` stay inside one operand.
pub fn top_level_conjuncts(text: &str) -> Option<Vec<(usize, usize)>> {
    let masked = mask_for_scan(text);
    let depths = depth_map(&masked);
    let mut spans = Vec::new();
    let mut last = 0;
    let mut case_depth = 0usize;
    let mut in_between = false;

    for m in BOOLEAN_WORD_RE.find_iter(&masked) {
        if depths[m.start()] != 0 {
            continue;
        }
        match m.as_str().to_uppercase().as_str() {
            "CASE" => case_depth += 1,
            "END" => case_depth = case_depth.saturating_sub(1),
            _ if case_depth > 0 => {}
            "BETWEEN" => in_between = true,
            "AND" if in_between => in_between = false,
            "AND" => {
                spans.push((last, m.start()));
                last = m.end();
            }
            _ => return None,
        }
    }
    spans.push((last, text.len()));
    Some(spans)
}

/// Every `FROM`/`JOIN` target in the text, in order of appearance, including
/// comma-separated FROM list items. `FROM (` subqueries are not table
/// references and are skipped.
pub fn table_refs(sql: &str) -> Vec<TableRef> {
    let masked = mask_for_scan(sql);
    let depths = depth_map(&masked);

    let mut refs: Vec<TableRef> = TABLE_REF_RE
        .captures_iter(&masked)
        .filter_map(|caps| {
            let keyword = caps.get(1)?;
            build_table_ref(
                sql,
                &depths,
                keyword.as_str().to_uppercase(),
                keyword.start(),
                caps.get(2)?,
                caps.get(3),
            )
        })
        .collect();

    for from in FROM_RE.find_iter(&masked) {
        let depth = depths[from.start()];
        let stop = FROM_LIST_END_RE
            .find_iter(&masked[from.end()..])
            .map(|m| from.end() + m.start())
            .find(|&p| depths[p] == depth)
            .unwrap_or(masked.len());

        for idx in from.end()..stop {
            if depths[idx] < depth {
                break;
            }
            if depths[idx] != depth || masked.as_bytes()[idx] != b',' {
                continue;
            }
            let Some(caps) = FROM_LIST_ITEM_RE.captures(&masked[idx..]) else {
                continue;
            };
            let Some(name) = caps.get(1) else {
                continue;
            };
            if SQL_KEYWORDS.contains(name.as_str().to_lowercase().as_str()) {
                continue;
            }
            let shifted = |m: regex::Match| (idx + m.start(), idx + m.end());
            let (name_start, name_end) = shifted(name);
            if let Some(item) = table_ref_from_spans(
                sql,
                &depths,
                "FROM".to_string(),
                name_start,
                (name_start, name_end),
                caps.get(2).map(shifted),
            ) {
                refs.push(item);
            }
        }
    }

    refs.sort_by_key(|r| r.start);
    refs
}

fn build_table_ref(
    sql: &str,
    depths: &[i32],
    keyword: String,
    start: usize,
    name: regex::Match,
    alias: Option<regex::Match>,
) -> Option<TableRef> {
    table_ref_from_spans(
        sql,
        depths,
        keyword,
        start,
        (name.start(), name.end()),
        alias.map(|a| (a.start(), a.end())),
    )
}

/// Spans index the masked text, which has the same byte layout as `sql`.
fn table_ref_from_spans(
    sql: &str,
    depths: &[i32],
    keyword: String,
    start: usize,
    name: (usize, usize),
    alias: Option<(usize, usize)>,
) -> Option<TableRef> {
    let raw_name = sql.get(name.0..name.1)?.to_string();
    let normalized = normalize_relation_name(&raw_name);
    if normalized.is_empty() {
        return None;
    }

    let (alias, end) = match alias.and_then(|(s, e)| Some((sql.get(s..e)?, e))) {
        Some((a, e)) if !SQL_KEYWORDS.contains(a.to_lowercase().as_str()) => {
            (Some(a.to_string()), e)
        }
        _ => (None, name.1),
    };

    Some(TableRef {
        keyword,
        name: normalized,
        raw_name,
        alias,
        start,
        end,
        depth: depths.get(start).copied().unwrap_or(0),
    })
}

/// `[dbo].[STU]` -> `stu`, `"public"."llm_x"` -> `llm_x`.
pub fn normalize_relation_name(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .filter(|c| !matches!(c, '[' | ']' | '"'))
        .collect();
    cleaned
        .rsplit('.')
        .next()
        .unwrap_or("")
        .trim()
        .to_lowercase()
}

/// Render a list of SQL fragments as `(a, b, c)`.
pub fn paren_list<I, S>(items: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let joined: Vec<String> = items.into_iter().map(|s| s.as_ref().to_string()).collect();
    format!("({})", joined.join(", "))
}

/// Quote a string as a SQL literal, doubling embedded quotes.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_literals_preserves_length() {
        let sql = "SELECT 'it''s from here' FROM t";
        let masked = mask_literals(sql);
        assert_eq!(masked.len(), sql.len());
        assert!(!masked.contains("from here"));
        assert!(masked.ends_with("FROM t"));
    }

    #[test]
    fn test_mask_follows_postgres_quoting() {
        let sql = r#"SELECT x."a'" FROM t WHERE y = E'\'' AND z = $q$it's$q$ -- it's"#;
        let masked = mask_literals(sql);
        assert_eq!(masked.len(), sql.len());
        assert!(masked.contains(r#"x."a_" FROM t"#));
        assert!(masked.contains("y = E'  ' AND"));
        assert!(masked.contains("z = $q$    $q$"));
        assert!(!masked.contains("--"));
        assert_eq!(masked.matches('\'').count(), 2);
    }

    #[test]
    fn test_mask_nested_block_comment_and_unclosed_literal() {
        let masked = mask_literals("SELECT /* a /* b */ c */ 1, 'open");
        assert_eq!(masked, "SELECT                   1, '    ");
    }

    #[test]
    fn test_positional_parameter_is_not_a_dollar_quote() {
        let sql = "SELECT a FROM t WHERE b = $1 AND c = $2";
        assert_eq!(mask_literals(sql), sql);
    }

    #[test]
    fn test_strip_comments_keeps_literals() {
        assert_eq!(
            strip_comments("SELECT 'a--b', \"c/*d\" /* gone */ FROM t -- tail"),
            "SELECT 'a--b', \"c/*d\"   FROM t "
        );
    }

    #[test]
    fn test_map_code_skips_literals_and_identifiers() {
        let out = map_code("select 'select' AS \"select\"", |code| code.to_uppercase());
        assert_eq!(out, "SELECT 'select' AS \"select\"");
    }

    #[test]
    fn test_split_clauses_basic() {
        let clauses = split_clauses(
            "SELECT s.ID, s.LN FROM STU s WHERE s.DEL = 0 AND s.TG = '' ORDER BY s.LN",
        )
        .unwrap();
        assert_eq!(clauses.select, "s.ID, s.LN");
        assert_eq!(clauses.from.as_deref(), Some("STU s"));
        assert_eq!(clauses.where_clause.as_deref(), Some("s.DEL = 0 AND s.TG = ''"));
        assert_eq!(clauses.order_by.as_deref(), Some("s.LN"));
        assert!(clauses.group_by.is_none());
    }

    #[test]
    fn test_split_clauses_ignores_nested_where() {
        let clauses = split_clauses(
            "SELECT a.x FROM llm_a a WHERE a.id IN (SELECT b.id FROM llm_b b WHERE b.y = 1) GROUP BY a.x",
        )
        .unwrap();
        assert_eq!(
            clauses.where_clause.as_deref(),
            Some("a.id IN (SELECT b.id FROM llm_b b WHERE b.y = 1)")
        );
        assert_eq!(clauses.group_by.as_deref(), Some("a.x"));
    }

    #[test]
    fn test_split_clauses_rejects_non_select() {
        assert!(split_clauses("DELETE FROM stu").is_none());
    }

    #[test]
    fn test_table_refs_with_aliases() {
        let refs = table_refs(
            "SELECT * FROM llm_student_demographics d JOIN [dbo].[STU] AS s ON s.ID = d.student_id WHERE 1=1",
        );
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].name, "llm_student_demographics");
        assert_eq!(refs[0].alias.as_deref(), Some("d"));
        assert_eq!(refs[1].name, "stu");
        assert_eq!(refs[1].alias.as_deref(), Some("s"));
    }

    #[test]
    fn test_table_refs_keyword_is_not_alias() {
        let refs = table_refs("SELECT * FROM llm_schools WHERE llm_schools.school_id = 1");
        assert_eq!(refs.len(), 1);
        assert!(refs[0].alias.is_none());
        assert_eq!(refs[0].effective_alias(), "llm_schools");
    }

    #[test]
    fn test_table_refs_include_comma_listed_relations() {
        let refs = table_refs("SELECT t.FN FROM llm_schools s, stu t, llm_student_grades WHERE s.school_id = 1");
        let names: Vec<&str> = refs.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["llm_schools", "stu", "llm_student_grades"]);
        assert_eq!(refs[1].keyword, "FROM");
        assert_eq!(refs[1].alias.as_deref(), Some("t"));
        assert!(refs[2].alias.is_none());
        assert!(refs.iter().all(|r| r.depth == 0));
    }

    #[test]
    fn test_table_refs_comma_lists_stay_in_their_subquery() {
        let refs = table_refs(
            "SELECT a.x, a.y FROM llm_a a WHERE a.id IN (SELECT b.id FROM llm_b b, llm_c c WHERE b.id = c.id) ORDER BY a.x, a.y",
        );
        let named: Vec<(&str, i32)> = refs.iter().map(|r| (r.name.as_str(), r.depth)).collect();
        assert_eq!(named, vec![("llm_a", 0), ("llm_b", 1), ("llm_c", 1)]);
    }

    #[test]
    fn test_table_refs_skip_lateral_and_derived_items() {
        let refs = table_refs("SELECT * FROM llm_a a, LATERAL (SELECT 1) l, (SELECT 2) d");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "llm_a");
    }

    #[test]
    fn test_table_refs_keep_quoted_names_as_written() {
        let refs = table_refs(r#"SELECT * FROM "llm_schools" "S""#);
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].raw_name, "\"llm_schools\"");
        assert_eq!(refs[0].name, "llm_schools");
    }

    #[test]
    fn test_extract_from_is_not_a_table() {
        let refs = table_refs("SELECT EXTRACT(YEAR FROM a.enter_date) FROM llm_student_enrollment a");
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].name, "llm_student_enrollment");
    }

    #[test]
    fn test_top_level_conjuncts() {
        let text = "s.DEL = 0 AND s.GR BETWEEN 9 AND 12 AND (a OR b) AND CASE WHEN x AND y THEN 1 END = 1";
        let parts: Vec<&str> = top_level_conjuncts(text)
            .unwrap()
            .into_iter()
            .map(|(s, e)| text[s..e].trim())
            .collect();
        assert_eq!(
            parts,
            vec!["s.DEL = 0", "s.GR BETWEEN 9 AND 12", "(a OR b)", "CASE WHEN x AND y THEN 1 END = 1"]
        );
    }

    #[test]
    fn test_top_level_or_has_no_conjuncts() {
        assert!(top_level_conjuncts("s.SC = 3 OR s.SC = 9").is_none());
        assert!(top_level_conjuncts("a = 'x OR y' AND b = 1").is_some());
    }

    #[test]
    fn test_split_top_level_commas() {
        let parts = split_top_level_commas("a, COALESCE(b, 'x,y'), c");
        assert_eq!(parts, vec!["a", "COALESCE(b, 'x,y')", "c"]);
    }

    #[test]
    fn test_quote_literal_doubles_quotes() {
        assert_eq!(quote_literal("O'Brien"), "'O''Brien'");
    }
}
