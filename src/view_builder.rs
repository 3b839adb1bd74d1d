//! View Query Builder
//!
//! Cleans raw model output into a single SQL statement and injects the
//! mandatory scope predicates. These are best-effort text transforms: when the
//! SQL does not have the expected shape the input is returned unchanged, so
//! callers must re-validate (and re-check scope) after injection.

use crate::sql_text::{
    find_top_level, map_code, mask_literals, split_top_level_commas, strip_comments, table_refs,
    Clause, TableRef,
};
use crate::views::{ROSTER_VIEW, TENANT_COLUMN};
use itertools::Itertools;
use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    static ref SQL_FENCE_RE: Regex = Regex::new(r"(?s)```[A-Za-z]*[ \t]*\r?\n?(.*?)```").unwrap();
    static ref SELECT_WORD_RE: Regex = Regex::new(r"(?i)\bSELECT\b").unwrap();
    static ref PROSE_RE: Regex = Regex::new(
        r"(?im)^[ \t]*(?:#{1,6}(?:[ \t]|$)|\*\*|this query|this will|this sql|the query|the above|explanation|note:|notes:|here is|here's)"
    )
    .unwrap();
    static ref WHITESPACE_RE: Regex = Regex::new(r"\s+").unwrap();
    static ref FORMAT_KEYWORD_RE: Regex = Regex::new(
        r"(?i)\b(select|distinct|from|where|group\s+by|order\s+by|having|limit|offset|left|right|full|inner|outer|cross|join|on|and|or|not|in|is|null|as|case|when|then|else|end|between|like|asc|desc|count|sum|avg|min|max|coalesce)\b"
    )
    .unwrap();
    static ref FORMAT_BREAK_RE: Regex = Regex::new(
        r"\s+\b(FROM|WHERE|GROUP BY|HAVING|ORDER BY|LIMIT|(?:(?:LEFT|RIGHT|FULL)(?: OUTER)? |INNER |CROSS )?JOIN)\b"
    )
    .unwrap();
}

/// Extract the SQL statement from a model reply.
///
/// Never fails: in the worst case the trimmed input is returned and the
/// validator rejects it.
pub fn clean_llm_response(text: &str) -> String {
    let fenced = SQL_FENCE_RE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string());

    let candidate = match fenced {
        Some(inner) => inner,
        None => {
            let from_select = match SELECT_WORD_RE.find(text) {
                Some(m) => &text[m.start()..],
                None => text,
            };
            // Cut at the first line that looks like commentary.
            match PROSE_RE.find(from_select) {
                Some(m) if m.start() > 0 => from_select[..m.start()].to_string(),
                _ => from_select.to_string(),
            }
        }
    };

    let mut sql = strip_comments(&candidate).trim().to_string();
    while sql.ends_with(';') {
        sql.pop();
        sql = sql.trim_end().to_string();
    }

    let collapsed = sql
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");

    if collapsed.trim().is_empty() {
        text.trim().to_string()
    } else {
        collapsed.trim().to_string()
    }
}

/// The main query's `FROM <relation> [alias]`, if it is a plain top-level reference.
pub fn main_from(sql: &str) -> Option<TableRef> {
    let (from_start, _) = find_top_level(sql, Clause::From, 0)?;
    table_refs(sql)
        .into_iter()
        .find(|r| r.keyword == "FROM" && r.start == from_start)
}

/// Scope the main view to the caller's schools.
///
/// An empty list means the caller is not school-restricted and the SQL is
/// returned unchanged; that decision belongs to the caller.
pub fn inject_security_filters(sql: &str, tenant_ids: &[i64]) -> String {
    if tenant_ids.is_empty() {
        return sql.to_string();
    }
    let Some(target) = main_from(sql) else {
        return sql.to_string();
    };

    inject_tenant_filters(sql, &[target.effective_alias()], TENANT_COLUMN, tenant_ids)
}

/// Scope several relations of the main query at once. The combined
/// predicate from [`tenant_filters`] goes ahead of the existing conditions.
pub fn inject_tenant_filters(sql: &str, aliases: &[&str], column: &str, tenant_ids: &[i64]) -> String {
    if tenant_ids.is_empty() || aliases.is_empty() {
        return sql.to_string();
    }
    insert_where_predicate(sql, &tenant_filters(aliases, column, tenant_ids))
}

/// `a.column IN (1, 2) AND b.column IN (1, 2)`, each alias once.
pub fn tenant_filters(aliases: &[&str], column: &str, tenant_ids: &[i64]) -> String {
    aliases
        .iter()
        .unique()
        .map(|alias| tenant_predicate(alias, column, tenant_ids))
        .join(" AND ")
}

/// `alias.column IN (1, 2)`
pub fn tenant_predicate(alias: &str, column: &str, tenant_ids: &[i64]) -> String {
    format!("{}.{} IN ({})", alias, column, tenant_ids.iter().join(", "))
}

/// Span of the main query's WHERE clause: keyword start, body start and
/// body end (the next top-level clause or the end of the text).
pub fn main_where(sql: &str) -> Option<(usize, usize, usize)> {
    let (where_start, where_end) = find_top_level(sql, Clause::Where, 0)?;
    let body_end = [Clause::GroupBy, Clause::Having, Clause::OrderBy, Clause::Limit]
        .iter()
        .filter_map(|c| find_top_level(sql, *c, where_end).map(|(s, _)| s))
        .min()
        .unwrap_or(sql.len());
    Some((where_start, where_end, body_end))
}

/// AND a predicate into the main query so it binds before grouping, HAVING
/// and ordering. Existing conditions are parenthesized so a top-level OR
/// cannot widen the result. Re-applying the same predicate is a no-op.
pub fn insert_where_predicate(sql: &str, predicate: &str) -> String {
    let sql = sql.trim().trim_end_matches(';').trim_end();

    if let Some((where_start, where_end, body_end)) = main_where(sql) {
        let body = sql[where_end..body_end].trim();

        if is_already_scoped(body, predicate) {
            return sql.to_string();
        }

        let rest = sql[body_end..].trim();
        let mut out = format!(
            "{}WHERE {} AND ({})",
            &sql[..where_start],
            predicate,
            body
        );
        if !rest.is_empty() {
            out.push(' ');
            out.push_str(rest);
        }
        return out;
    }

    let insert_at = [Clause::GroupBy, Clause::Having, Clause::OrderBy, Clause::Limit]
        .iter()
        .filter_map(|c| find_top_level(sql, *c, 0).map(|(s, _)| s))
        .min();

    match insert_at {
        Some(pos) => format!(
            "{} WHERE {} {}",
            sql[..pos].trim_end(),
            predicate,
            &sql[pos..]
        ),
        None => format!("{} WHERE {}", sql, predicate),
    }
}

/// True if `body` is exactly `predicate`, or `predicate AND (<one group>)`.
fn is_already_scoped(body: &str, predicate: &str) -> bool {
    if body == predicate {
        return true;
    }
    let Some(rest) = body.strip_prefix(predicate) else {
        return false;
    };
    let rest = rest.trim_start();
    let Some(group) = rest
        .get(..4)
        .filter(|kw| kw.eq_ignore_ascii_case("AND "))
        .map(|_| rest[4..].trim())
    else {
        return false;
    };
    is_single_group(group)
}

/// `(...)` where the opening parenthesis closes at the last character.
fn is_single_group(text: &str) -> bool {
    let masked = mask_literals(text);
    if !masked.starts_with('(') || !masked.ends_with(')') {
        return false;
    }
    let mut depth = 0i32;
    for (idx, b) in masked.bytes().enumerate() {
        match b {
            b'(' => depth += 1,
            b')' => {
                depth -= 1;
                if depth == 0 && idx != masked.len() - 1 {
                    return false;
                }
            }
            _ => {}
        }
    }
    depth == 0
}

/// Restrict the main view to students on a teacher's roster.
pub fn inject_teacher_filter(sql: &str, teacher_id: i64) -> String {
    let sql_trimmed = sql.trim().trim_end_matches(';').trim_end();
    let Some(target) = main_from(sql_trimmed) else {
        return sql.to_string();
    };

    const ROSTER_ALIASES: [&str; 3] = ["r", "tr", "roster_scope"];

    // Already roster-scoped for this teacher, under any of our aliases.
    let already_joined = ROSTER_ALIASES.iter().any(|r| {
        sql_trimmed.contains(&format!(
            "JOIN {view} {r} ON {alias}.student_id = {r}.student_id AND {r}.teacher_id = {teacher}",
            view = ROSTER_VIEW,
            r = r,
            alias = target.effective_alias(),
            teacher = teacher_id
        ))
    });
    if already_joined {
        return sql_trimmed.to_string();
    }

    let taken: Vec<String> = table_refs(sql_trimmed)
        .iter()
        .map(|r| r.effective_alias().to_lowercase())
        .collect();
    let roster_alias = ROSTER_ALIASES
        .into_iter()
        .find(|a| !taken.iter().any(|t| t == a))
        .unwrap_or("roster_scope");

    let join = format!(
        " JOIN {view} {r} ON {alias}.student_id = {r}.student_id AND {r}.teacher_id = {teacher}",
        view = ROSTER_VIEW,
        r = roster_alias,
        alias = target.effective_alias(),
        teacher = teacher_id
    );

    format!(
        "{}{}{}",
        &sql_trimmed[..target.end],
        join,
        &sql_trimmed[target.end..]
    )
}

/// Cosmetic formatting for display: upper-case keywords, one clause per
/// line, one select item per line. Literals are left untouched.
pub fn format_sql(sql: &str) -> String {
    let normalized = map_code(sql.trim(), |segment| {
        let single = WHITESPACE_RE.replace_all(segment, " ");
        let upper = FORMAT_KEYWORD_RE.replace_all(&single, |caps: &regex::Captures| {
            WHITESPACE_RE.replace_all(&caps[0].to_uppercase(), " ").into_owned()
        });
        FORMAT_BREAK_RE.replace_all(&upper, "\n$1").into_owned()
    });

    let mut lines: Vec<String> = normalized.lines().map(|l| l.trim().to_string()).collect();
    if let Some(first) = lines.first_mut() {
        if let Some(body) = first.strip_prefix("SELECT ") {
            let items = split_top_level_commas(body);
            if items.len() > 1 {
                *first = format!("SELECT\n  {}", items.join(",\n  "));
            }
        }
    }
    lines.retain(|l| !l.is_empty());
    lines.join("\n")
}
