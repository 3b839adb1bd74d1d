//! Fragment Composer
//!
//! Deterministically assembles one SQL statement from a fragment library
//! snapshot and a normalized interpretation. No I/O; the same inputs always
//! produce byte-identical output.
//!
//! Structural problems (missing base, conflicts, missing dependencies) are
//! returned as [`CompositionError`]s inside an unsuccessful
//! [`CompositionResult`]. Hallucinated fragment ids and unresolved
//! placeholders only produce warnings.

use crate::fragments::{Fragment, FragmentId, FragmentLibrary, FragmentType, ParameterType, PLACEHOLDER_RE};
use crate::interpretation::AIInterpretation;
use crate::sql_text::{find_top_level, mask_literals, paren_list, quote_literal, split_clauses, split_top_level_commas, Clause};
use crate::view_builder::format_sql;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, warn};

lazy_static! {
    static ref EQUALITY_FILTER_RE: Regex = Regex::new(
        r"(?i)^([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)\s*=\s*('(?:[^']|'')*'|-?\d+(?:\.\d+)?)$"
    )
    .unwrap();
    static ref IN_FILTER_RE: Regex = Regex::new(
        r"(?i)^([A-Za-z_][A-Za-z0-9_]*(?:\.[A-Za-z_][A-Za-z0-9_]*)?)\s+IN\s*\(([^()]*)\)$"
    )
    .unwrap();
    static ref LEADING_KEYWORD_RE: Regex = Regex::new(r"(?i)^\s*(?:WHERE|AND)\s+").unwrap();
    static ref LEADING_ORDER_BY_RE: Regex = Regex::new(r"(?i)^\s*ORDER\s+BY\s+").unwrap();
    static ref LEADING_SELECT_RE: Regex = Regex::new(r"(?i)^\s*SELECT\s+").unwrap();
    static ref TOP_LEVEL_OR_RE: Regex = Regex::new(r"(?i)\bOR\b").unwrap();
    static ref NUMERIC_LITERAL_RE: Regex = Regex::new(r"^-?\d+(?:\.\d+)?$").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CompositionErrorCode {
    MissingBase,
    Conflict,
    MissingDependency,
}

impl fmt::Display for CompositionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            CompositionErrorCode::MissingBase => "MISSING_BASE",
            CompositionErrorCode::Conflict => "CONFLICT",
            CompositionErrorCode::MissingDependency => "MISSING_DEPENDENCY",
        };
        write!(f, "{}", code)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionError {
    pub code: CompositionErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fragment_ids: Vec<FragmentId>,
}

impl CompositionError {
    fn new(code: CompositionErrorCode, message: String, fragment_ids: Vec<FragmentId>) -> Self {
        Self {
            code,
            message,
            fragment_ids,
        }
    }
}

impl fmt::Display for CompositionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Simple,
    Moderate,
    Complex,
}

impl Complexity {
    pub fn estimate(joins: usize, filters: usize, has_aggregation: bool) -> Self {
        if joins >= 3 || (joins >= 2 && has_aggregation) {
            Complexity::Complex
        } else if joins >= 1 || filters >= 3 || has_aggregation {
            Complexity::Moderate
        } else {
            Complexity::Simple
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionMetadata {
    pub fragments_used: Vec<FragmentId>,
    pub tables: BTreeSet<String>,
    pub estimated_complexity: Complexity,
    pub parameters_applied: BTreeMap<String, Value>,
}

impl Default for CompositionMetadata {
    fn default() -> Self {
        Self {
            fragments_used: Vec::new(),
            tables: BTreeSet::new(),
            estimated_complexity: Complexity::Simple,
            parameters_applied: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompositionResult {
    pub success: bool,
    pub query: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_query: Option<String>,
    pub explanation: String,
    pub errors: Vec<CompositionError>,
    pub warnings: Vec<String>,
    pub metadata: CompositionMetadata,
}

impl CompositionResult {
    fn failed(errors: Vec<CompositionError>, warnings: Vec<String>) -> Self {
        Self {
            success: false,
            errors,
            warnings,
            ..Default::default()
        }
    }
}

/// The pieces of an aggregation fragment's snippet.
#[derive(Debug, Default)]
struct AggregationParts {
    select: Option<String>,
    group_by: Option<String>,
    having: Option<String>,
    order_by: Option<String>,
}

impl AggregationParts {
    fn parse(snippet: &str) -> Self {
        let text = snippet.trim();
        let markers: Vec<(Clause, usize, usize)> = [Clause::GroupBy, Clause::Having, Clause::OrderBy]
            .into_iter()
            .filter_map(|c| find_top_level(text, c, 0).map(|(s, e)| (c, s, e)))
            .collect();

        let select_end = markers.iter().map(|(_, s, _)| *s).min().unwrap_or(text.len());
        let select = LEADING_SELECT_RE
            .replace(text[..select_end].trim(), "")
            .trim()
            .to_string();

        let mut parts = AggregationParts {
            select: Some(select).filter(|s| !s.is_empty()),
            ..Default::default()
        };

        for (clause, _, body_start) in &markers {
            let body_end = markers
                .iter()
                .map(|(_, s, _)| *s)
                .filter(|s| s > body_start)
                .min()
                .unwrap_or(text.len());
            let body = Some(text[*body_start..body_end].trim().to_string()).filter(|b| !b.is_empty());
            match clause {
                Clause::GroupBy => parts.group_by = body,
                Clause::Having => parts.having = body,
                Clause::OrderBy => parts.order_by = body,
                _ => {}
            }
        }
        parts
    }
}

/// Composes SQL from one library snapshot.
pub struct FragmentComposer<'a> {
    index: HashMap<&'a str, &'a Fragment>,
    default_base: Option<String>,
}

impl<'a> FragmentComposer<'a> {
    pub fn new(library: &'a FragmentLibrary) -> Self {
        Self {
            index: library.index(),
            default_base: None,
        }
    }

    /// Base fragment to fall back on when the interpretation's base is unknown.
    pub fn with_default_base(mut self, id: impl Into<String>) -> Self {
        self.default_base = Some(id.into());
        self
    }

    pub fn compose(&self, interpretation: &AIInterpretation) -> CompositionResult {
        let mut warnings = Vec::new();

        // 1. Base
        let base = match self.resolve_base(&interpretation.fragments.base, &mut warnings) {
            Ok(base) => base,
            Err(error) => return CompositionResult::failed(vec![error], warnings),
        };

        // 2. Drop unknown ids
        let selected = self.select_fragments(interpretation, base, &mut warnings);

        // 3. Conflicts among what was asked for
        let mut candidates = vec![base];
        candidates.extend(selected.iter().copied());
        let conflicts = find_conflicts(&candidates);
        if !conflicts.is_empty() {
            return CompositionResult::failed(conflicts, warnings);
        }

        // 4. Dependencies
        let mut ordered: Vec<&Fragment> = Vec::new();
        let mut resolved: HashSet<&str> = HashSet::new();
        resolved.insert(base.id.as_str());
        let mut errors = Vec::new();
        for &fragment in &selected {
            self.resolve_dependencies(fragment, &mut resolved, &mut ordered, &mut errors);
        }
        if !errors.is_empty() {
            return CompositionResult::failed(errors, warnings);
        }

        // Dependencies may have pulled in a conflicting fragment.
        let mut closure = vec![base];
        closure.extend(ordered.iter().copied());
        let conflicts = find_conflicts(&closure);
        if !conflicts.is_empty() {
            return CompositionResult::failed(conflicts, warnings);
        }

        // 5. Assemble
        let assembled = match assemble(base, &ordered, &mut warnings) {
            Ok(sql) => sql,
            Err(error) => return CompositionResult::failed(vec![error], warnings),
        };

        // 6. Substitute
        let (query, parameters_applied) =
            substitute_parameters(&assembled, &closure, &interpretation.parameters, &mut warnings);

        // 7. Complexity
        let count = |t: FragmentType| ordered.iter().filter(|f| f.fragment_type == t).count();
        let estimated_complexity = Complexity::estimate(
            count(FragmentType::Join),
            count(FragmentType::Filter),
            count(FragmentType::Aggregation) > 0,
        );

        let metadata = CompositionMetadata {
            fragments_used: closure.iter().map(|f| f.id.clone()).collect(),
            tables: closure.iter().flat_map(|f| f.tables.iter().cloned()).collect(),
            estimated_complexity,
            parameters_applied,
        };

        debug!(
            "Composed query from {} fragments ({:?})",
            metadata.fragments_used.len(),
            estimated_complexity
        );

        CompositionResult {
            success: true,
            formatted_query: Some(format_sql(&query)),
            explanation: explain(base, &ordered),
            query,
            errors: Vec::new(),
            warnings,
            metadata,
        }
    }

    fn resolve_base(
        &self,
        requested: &str,
        warnings: &mut Vec<String>,
    ) -> Result<&'a Fragment, CompositionError> {
        let as_base = |id: &str| {
            self.index
                .get(id)
                .copied()
                .filter(|f| f.fragment_type == FragmentType::Base)
        };

        if let Some(base) = as_base(requested) {
            return Ok(base);
        }

        if let Some(default_id) = self.default_base.as_deref() {
            if let Some(base) = as_base(default_id) {
                warn!("Unknown base fragment '{}', using '{}'", requested, default_id);
                warnings.push(format!(
                    "Base fragment '{}' not found; using default base '{}'",
                    requested, default_id
                ));
                return Ok(base);
            }
        }

        Err(CompositionError::new(
            CompositionErrorCode::MissingBase,
            format!("Base fragment '{}' not found", requested),
            vec![requested.to_string()],
        ))
    }

    /// Known, non-base fragments from every list, deduplicated, in
    /// joins/filters/columns/aggregations/ordering order.
    fn select_fragments(
        &self,
        interpretation: &AIInterpretation,
        base: &Fragment,
        warnings: &mut Vec<String>,
    ) -> Vec<&'a Fragment> {
        let f = &interpretation.fragments;
        let lists: [(&str, &Vec<FragmentId>); 5] = [
            ("joins", &f.joins),
            ("filters", &f.filters),
            ("columns", &f.columns),
            ("aggregations", &f.aggregations),
            ("ordering", &f.ordering),
        ];

        let mut seen: HashSet<&str> = HashSet::new();
        seen.insert(base.id.as_str());
        let mut selected = Vec::new();

        for (list, ids) in lists {
            for id in ids {
                match self.index.get(id.as_str()).copied() {
                    None => {
                        warn!("Dropping unknown fragment '{}' from {}", id, list);
                        warnings.push(format!("Unknown fragment '{}' in {} was ignored", id, list));
                    }
                    Some(fragment) if fragment.fragment_type == FragmentType::Base => {
                        if fragment.id != base.id {
                            warnings.push(format!(
                                "Base fragment '{}' listed in {} was ignored",
                                id, list
                            ));
                        }
                    }
                    Some(fragment) => {
                        if seen.insert(fragment.id.as_str()) {
                            selected.push(fragment);
                        }
                    }
                }
            }
        }
        selected
    }

    /// Depth-first; a fragment is marked on entry so each is visited at most
    /// once, and dependencies land before the fragment that needs them.
    fn resolve_dependencies(
        &self,
        fragment: &'a Fragment,
        resolved: &mut HashSet<&'a str>,
        ordered: &mut Vec<&'a Fragment>,
        errors: &mut Vec<CompositionError>,
    ) {
        if !resolved.insert(fragment.id.as_str()) {
            return;
        }

        for dep in &fragment.dependencies {
            match self.index.get(dep.as_str()).copied() {
                None => errors.push(CompositionError::new(
                    CompositionErrorCode::MissingDependency,
                    format!("Fragment '{}' depends on unknown fragment '{}'", fragment.id, dep),
                    vec![fragment.id.clone(), dep.clone()],
                )),
                // The composition root already provides the base.
                Some(d) if d.fragment_type == FragmentType::Base => {}
                Some(d) => self.resolve_dependencies(d, resolved, ordered, errors),
            }
        }

        ordered.push(fragment);
    }
}

/// Every unordered pair where either side lists the other in `conflicts`.
fn find_conflicts(fragments: &[&Fragment]) -> Vec<CompositionError> {
    let mut errors = Vec::new();
    for (i, a) in fragments.iter().enumerate() {
        for b in &fragments[i + 1..] {
            if a.conflicts.contains(&b.id) || b.conflicts.contains(&a.id) {
                let (first, second) = if a.id <= b.id { (a, b) } else { (b, a) };
                errors.push(CompositionError::new(
                    CompositionErrorCode::Conflict,
                    format!("Fragment '{}' conflicts with '{}'", first.id, second.id),
                    vec![first.id.clone(), second.id.clone()],
                ));
            }
        }
    }
    errors
}

fn assemble(
    base: &Fragment,
    fragments: &[&Fragment],
    warnings: &mut Vec<String>,
) -> Result<String, CompositionError> {
    let missing_base = || {
        CompositionError::new(
            CompositionErrorCode::MissingBase,
            format!("Base fragment '{}' has no SELECT ... FROM", base.id),
            vec![base.id.clone()],
        )
    };
    let clauses = split_clauses(&base.snippet).ok_or_else(missing_base)?;
    let from = clauses.from.clone().filter(|f| !f.is_empty()).ok_or_else(missing_base)?;

    let of_type = |t: FragmentType| -> Vec<&Fragment> {
        fragments.iter().copied().filter(|f| f.fragment_type == t).collect()
    };
    let joins = of_type(FragmentType::Join);
    let filters = of_type(FragmentType::Filter);
    let columns = of_type(FragmentType::Column);
    let aggregations = of_type(FragmentType::Aggregation);
    let orders = of_type(FragmentType::Order);

    // SELECT
    let mut select_items = split_top_level_commas(&clauses.select);
    let aggregation = aggregations.first().map(|f| AggregationParts::parse(&f.snippet));
    for extra in aggregations.iter().skip(1) {
        warnings.push(format!("Only one aggregation is applied; '{}' was ignored", extra.id));
    }

    match &aggregation {
        Some(agg) => {
            if let Some(select) = &agg.select {
                select_items = split_top_level_commas(select);
            } else if let Some(group_by) = &agg.group_by {
                select_items = split_top_level_commas(group_by);
                select_items.push("COUNT(*) AS record_count".to_string());
            }
            for column in &columns {
                warnings.push(format!(
                    "Column fragment '{}' was ignored because the query is aggregated",
                    column.id
                ));
            }
        }
        None => {
            for column in &columns {
                let snippet = LEADING_SELECT_RE.replace(column.snippet.trim(), "");
                select_items.extend(split_top_level_commas(snippet.trim_matches(|c: char| c == ',' || c.is_whitespace())));
            }
        }
    }

    // FROM
    let mut from_parts = vec![from];
    from_parts.extend(joins.iter().map(|j| j.snippet.trim().to_string()));

    // WHERE
    let mut predicates: Vec<String> = Vec::new();
    if let Some(base_where) = clauses.where_clause.as_deref().filter(|w| !w.is_empty()) {
        predicates.push(parenthesize_if_or(base_where));
    }
    predicates.extend(coalesce_filters(&filters));

    // GROUP BY / HAVING
    let group_by = aggregation
        .as_ref()
        .and_then(|a| a.group_by.clone())
        .or_else(|| clauses.group_by.clone());
    let having = aggregation
        .as_ref()
        .and_then(|a| a.having.clone())
        .or_else(|| clauses.having.clone());

    // ORDER BY
    let fragment_order = orders.first().map(|o| {
        LEADING_ORDER_BY_RE
            .replace(o.snippet.trim(), "")
            .trim()
            .to_string()
    });
    let bundled_order = aggregation.as_ref().and_then(|a| a.order_by.clone());
    if bundled_order.is_some() {
        for order in &orders {
            warnings.push(format!(
                "Ordering '{}' was superseded by the aggregation's ordering",
                order.id
            ));
        }
    } else {
        for extra in orders.iter().skip(1) {
            warnings.push(format!("Only one ordering is applied; '{}' was ignored", extra.id));
        }
    }
    let order_by = bundled_order.or(fragment_order).or_else(|| clauses.order_by.clone());

    let mut sql = format!("SELECT {} FROM {}", select_items.join(", "), from_parts.join(" "));
    if !predicates.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&predicates.join(" AND "));
    }
    if let Some(group_by) = group_by {
        sql.push_str(" GROUP BY ");
        sql.push_str(&group_by);
    }
    if let Some(having) = having {
        sql.push_str(" HAVING ");
        sql.push_str(&having);
    }
    if let Some(order_by) = order_by {
        sql.push_str(" ORDER BY ");
        sql.push_str(&order_by);
    }
    if let Some(limit) = clauses.limit {
        sql.push(' ');
        sql.push_str(&limit);
    }
    Ok(sql)
}

/// Filter predicates ANDed together, except that simple `col = literal` and
/// `col IN (...)` filters on the same column are merged into one `IN` list at
/// the position of the first one.
fn coalesce_filters(filters: &[&Fragment]) -> Vec<String> {
    enum Slot {
        Raw(String),
        Column(String),
    }

    let mut slots: Vec<Slot> = Vec::new();
    let mut by_column: HashMap<String, (String, Vec<String>)> = HashMap::new();

    for filter in filters {
        let predicate = LEADING_KEYWORD_RE.replace(filter.snippet.trim(), "").trim().to_string();
        if predicate.is_empty() {
            continue;
        }

        match equality_values(&predicate) {
            Some((column, values)) => {
                let key = column.to_lowercase();
                let entry = by_column.entry(key.clone()).or_insert_with(|| {
                    slots.push(Slot::Column(key.clone()));
                    (column.clone(), Vec::new())
                });
                for value in values {
                    if !entry.1.contains(&value) {
                        entry.1.push(value);
                    }
                }
            }
            None => slots.push(Slot::Raw(parenthesize_if_or(&predicate))),
        }
    }

    slots
        .into_iter()
        .filter_map(|slot| match slot {
            Slot::Raw(p) => Some(p),
            Slot::Column(key) => by_column
                .get(&key)
                .map(|(column, values)| format!("{} IN {}", column, paren_list(values))),
        })
        .collect()
}

/// `s.SC = 3` -> ("s.SC", ["3"]); `s.SC IN (3, 4)` -> ("s.SC", ["3", "4"]).
fn equality_values(predicate: &str) -> Option<(String, Vec<String>)> {
    if let Some(caps) = EQUALITY_FILTER_RE.captures(predicate) {
        return Some((caps[1].to_string(), vec![caps[2].to_string()]));
    }
    let caps = IN_FILTER_RE.captures(predicate)?;
    let values = split_top_level_commas(&caps[2]);
    let literal = |v: &String| {
        (v.starts_with('\'') && v.ends_with('\'') && v.len() >= 2) || NUMERIC_LITERAL_RE.is_match(v)
    };
    if values.is_empty() || !values.iter().all(literal) {
        return None;
    }
    Some((caps[1].to_string(), values))
}

fn parenthesize_if_or(predicate: &str) -> String {
    let masked = mask_literals(predicate);
    let top_level_or = TOP_LEVEL_OR_RE.find_iter(&masked).any(|m| {
        let depth = masked[..m.start()].bytes().fold(0i32, |d, b| match b {
            b'(' => d + 1,
            b')' => d - 1,
            _ => d,
        });
        depth == 0
    });
    if top_level_or {
        format!("({})", predicate)
    } else {
        predicate.to_string()
    }
}

/// Replace `{{name}}` placeholders. Values come from the interpretation, then
/// from the declaring fragment's default. Anything unresolvable is left as is.
fn substitute_parameters(
    sql: &str,
    fragments: &[&Fragment],
    parameters: &BTreeMap<String, Value>,
    warnings: &mut Vec<String>,
) -> (String, BTreeMap<String, Value>) {
    let mut applied = BTreeMap::new();
    let mut unresolved: BTreeSet<String> = BTreeSet::new();
    let mut out = String::with_capacity(sql.len());
    let mut last = 0;

    for caps in PLACEHOLDER_RE.captures_iter(sql) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let name = name.as_str();
        out.push_str(&sql[last..whole.start()]);
        last = whole.end();

        let declared = fragments.iter().find_map(|f| f.parameter(name));
        let value = parameters
            .get(name)
            .or_else(|| declared.and_then(|p| p.default.as_ref()));

        match value.and_then(|v| render_value(v, declared.map(|p| p.param_type))) {
            Some(rendered) => {
                out.push_str(&rendered);
                if let Some(v) = value {
                    applied.insert(name.to_string(), v.clone());
                }
            }
            None => {
                out.push_str(whole.as_str());
                unresolved.insert(name.to_string());
            }
        }
    }
    out.push_str(&sql[last..]);

    for name in unresolved {
        warn!("Placeholder '{}' left unsubstituted", name);
        warnings.push(format!("No usable value for parameter '{{{{{}}}}}'", name));
    }
    (out, applied)
}

fn render_value(value: &Value, declared: Option<ParameterType>) -> Option<String> {
    match value {
        Value::Array(items) => {
            if items.is_empty() {
                return None;
            }
            let rendered: Option<Vec<String>> = items
                .iter()
                .map(|item| match item {
                    Value::Array(_) => None,
                    other => render_scalar(other, None),
                })
                .collect();
            rendered.map(paren_list)
        }
        scalar => {
            let rendered = render_scalar(scalar, declared)?;
            if declared == Some(ParameterType::Array) {
                Some(format!("({})", rendered))
            } else {
                Some(rendered)
            }
        }
    }
}

fn render_scalar(value: &Value, declared: Option<ParameterType>) -> Option<String> {
    match value {
        Value::String(s) => match declared {
            Some(ParameterType::Number) if NUMERIC_LITERAL_RE.is_match(s.trim()) => {
                Some(s.trim().to_string())
            }
            Some(ParameterType::Boolean) => match s.trim().to_lowercase().as_str() {
                "true" | "1" | "yes" => Some("1".to_string()),
                "false" | "0" | "no" => Some("0".to_string()),
                _ => Some(quote_literal(s)),
            },
            _ => Some(quote_literal(s)),
        },
        Value::Number(n) => match declared {
            Some(ParameterType::String) | Some(ParameterType::Date) => {
                Some(quote_literal(&n.to_string()))
            }
            _ => Some(n.to_string()),
        },
        Value::Bool(b) => Some(if *b { "1" } else { "0" }.to_string()),
        Value::Null | Value::Object(_) | Value::Array(_) => None,
    }
}

fn explain(base: &Fragment, fragments: &[&Fragment]) -> String {
    let mut sections = vec![format!(
        "Base: {} ({})\n  {}",
        base.name,
        base.id,
        base.snippet.trim()
    )];

    let groups = [
        (FragmentType::Join, "Joins"),
        (FragmentType::Filter, "Filters"),
        (FragmentType::Column, "Columns"),
        (FragmentType::Aggregation, "Aggregation"),
        (FragmentType::Order, "Ordering"),
    ];
    for (fragment_type, title) in groups {
        let lines: Vec<String> = fragments
            .iter()
            .filter(|f| f.fragment_type == fragment_type)
            .map(|f| format!("  - {} ({}): {}", f.name, f.id, f.snippet.trim()))
            .collect();
        if !lines.is_empty() {
            sections.push(format!("{}:\n{}", title, lines.join("\n")));
        }
    }
    sections.join("\n\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::test_support::fragment;
    use crate::fragments::Parameter;
    use crate::interpretation::InterpretedFragments;
    use serde_json::json;

    fn library() -> FragmentLibrary {
        let base = fragment(
            "students_base",
            FragmentType::Base,
            "SELECT s.ID AS student_id, s.FN AS first_name, s.LN AS last_name FROM STU s WHERE s.DEL = 0",
        );

        let jefferson = fragment("school_jefferson", FragmentType::Filter, "s.SC = 3");
        let lincoln = fragment("school_lincoln", FragmentType::Filter, "s.SC = 5");

        let mut programs = fragment("programs_join", FragmentType::Join, "LEFT JOIN PGM p ON p.PID = s.ID");
        programs.tables.insert("PGM".to_string());
        programs.dependencies = vec!["students_base".to_string()];

        let mut has_iep = fragment("has_iep", FragmentType::Filter, "p.CD = '144'");
        has_iep.dependencies = vec!["programs_join".to_string()];

        let mut no_iep = fragment("no_iep", FragmentType::Filter, "p.CD IS NULL");
        no_iep.conflicts = vec!["has_iep".to_string()];
        no_iep.dependencies = vec!["programs_join".to_string()];

        let mut grade = fragment("grade_is", FragmentType::Filter, "s.GR = {{grade}}");
        grade.parameters = vec![Parameter {
            name: "grade".to_string(),
            param_type: ParameterType::Number,
            required: true,
            default: None,
            validation: None,
            options: None,
        }];

        let mut language = fragment("language_in", FragmentType::Filter, "s.HL IN {{languages}}");
        language.parameters = vec![Parameter {
            name: "languages".to_string(),
            param_type: ParameterType::Array,
            required: false,
            default: Some(json!(["01"])),
            validation: None,
            options: None,
        }];

        let email = fragment("email_column", FragmentType::Column, "s.SEM AS email");
        let by_grade = fragment(
            "count_by_grade",
            FragmentType::Aggregation,
            "SELECT s.GR AS grade, COUNT(*) AS student_count GROUP BY s.GR ORDER BY s.GR",
        );
        let group_only = fragment("group_by_gender", FragmentType::Aggregation, "GROUP BY s.SX");
        let by_name = fragment("order_by_name", FragmentType::Order, "ORDER BY s.LN, s.FN");
        let by_id = fragment("order_by_id", FragmentType::Order, "s.ID DESC");

        let mut broken = fragment("attendance_filter", FragmentType::Filter, "a.AB > 10");
        broken.dependencies = vec!["attendance_join".to_string()];

        let mut staff = fragment("staff_join", FragmentType::Join, "JOIN TCH t ON t.SC = s.SC");
        staff.conflicts = vec!["programs_join".to_string()];
        let mut staff_filter = fragment("staff_active", FragmentType::Filter, "t.TG = ' '");
        staff_filter.dependencies = vec!["staff_join".to_string()];

        FragmentLibrary::from_fragments(vec![
            base, jefferson, lincoln, programs, has_iep, no_iep, grade, language, email,
            by_grade, group_only, by_name, by_id, broken, staff, staff_filter,
        ])
    }

    fn interpretation(f: InterpretedFragments) -> AIInterpretation {
        AIInterpretation {
            fragments: f,
            confidence: 0.9,
            ..Default::default()
        }
    }

    fn ids(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_school_filter_coalesced_with_iep_predicate() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            filters: ids(&["school_jefferson", "has_iep"]),
            ordering: ids(&["order_by_name"]),
            ..Default::default()
        }));

        assert!(result.success, "{:?}", result.errors);
        assert_eq!(
            result.query,
            "SELECT s.ID AS student_id, s.FN AS first_name, s.LN AS last_name FROM STU s LEFT JOIN PGM p ON p.PID = s.ID WHERE s.DEL = 0 AND s.SC IN (3) AND p.CD IN ('144') ORDER BY s.LN, s.FN"
        );
        assert_eq!(result.query.matches("s.SC").count(), 1);
        assert_eq!(result.metadata.estimated_complexity, Complexity::Moderate);
    }

    #[test]
    fn test_same_column_filters_merge_into_one_in_list() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            filters: ids(&["school_jefferson", "school_lincoln"]),
            ..Default::default()
        }));
        assert!(result.query.contains("WHERE s.DEL = 0 AND s.SC IN (3, 5)"));
        assert!(!result.query.contains("s.SC = "));
    }

    #[test]
    fn test_compose_is_deterministic() {
        let library = library();
        let composer = FragmentComposer::new(&library);
        let request = interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            filters: ids(&["has_iep", "school_lincoln", "grade_is"]),
            columns: ids(&["email_column"]),
            ordering: ids(&["order_by_id"]),
            ..Default::default()
        });
        let first = composer.compose(&request);
        let second = FragmentComposer::new(&library).compose(&request);
        assert_eq!(first.query, second.query);
        assert_eq!(first.explanation, second.explanation);
    }

    #[test]
    fn test_dependencies_are_closed_and_ordered() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            filters: ids(&["has_iep"]),
            ..Default::default()
        }));
        assert!(result.success);
        let used = &result.metadata.fragments_used;
        assert_eq!(used, &ids(&["students_base", "programs_join", "has_iep"]));
        assert!(result.metadata.tables.contains("PGM"));

        let index = library.index();
        for id in used {
            for dep in &index[id.as_str()].dependencies {
                assert!(used.contains(dep), "{} missing dependency {}", id, dep);
            }
        }
    }

    #[test]
    fn test_conflict_is_symmetric() {
        let library = library();
        for filters in [["has_iep", "no_iep"], ["no_iep", "has_iep"]] {
            let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
                base: "students_base".to_string(),
                filters: ids(&filters),
                ..Default::default()
            }));
            assert!(!result.success);
            assert_eq!(result.errors.len(), 1);
            assert_eq!(result.errors[0].code, CompositionErrorCode::Conflict);
            assert_eq!(result.errors[0].fragment_ids, ids(&["has_iep", "no_iep"]));
        }
    }

    #[test]
    fn test_conflict_introduced_by_dependency() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            filters: ids(&["has_iep", "staff_active"]),
            ..Default::default()
        }));
        assert!(!result.success);
        assert_eq!(result.errors[0].code, CompositionErrorCode::Conflict);
    }

    #[test]
    fn test_unknown_ids_are_warnings() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            joins: ids(&["made_up_join"]),
            filters: ids(&["school_jefferson", "imaginary_filter"]),
            columns: ids(&["ghost"]),
            aggregations: ids(&["nope"]),
            ordering: ids(&["order_by_nothing"]),
        }));
        assert!(result.success);
        assert!(result.errors.is_empty());
        assert_eq!(
            result.warnings.iter().filter(|w| w.starts_with("Unknown fragment")).count(),
            5
        );
    }

    #[test]
    fn test_missing_base_and_default_fallback() {
        let library = library();
        let request = interpretation(InterpretedFragments {
            base: "teachers_base".to_string(),
            ..Default::default()
        });

        let result = FragmentComposer::new(&library).compose(&request);
        assert!(!result.success);
        assert_eq!(result.errors[0].code, CompositionErrorCode::MissingBase);

        let result = FragmentComposer::new(&library)
            .with_default_base("students_base")
            .compose(&request);
        assert!(result.success);
        assert!(result.warnings[0].contains("default base"));
    }

    #[test]
    fn test_missing_dependency_names_requiring_fragment() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            filters: ids(&["attendance_filter"]),
            ..Default::default()
        }));
        assert!(!result.success);
        assert_eq!(result.errors[0].code, CompositionErrorCode::MissingDependency);
        assert_eq!(result.errors[0].fragment_ids, ids(&["attendance_filter", "attendance_join"]));
    }

    #[test]
    fn test_aggregation_replaces_select_and_supersedes_ordering() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            columns: ids(&["email_column"]),
            aggregations: ids(&["count_by_grade"]),
            ordering: ids(&["order_by_name"]),
            ..Default::default()
        }));
        assert!(result.success);
        assert_eq!(
            result.query,
            "SELECT s.GR AS grade, COUNT(*) AS student_count FROM STU s WHERE s.DEL = 0 GROUP BY s.GR ORDER BY s.GR"
        );
        assert_eq!(result.warnings.len(), 2);
    }

    #[test]
    fn test_group_only_aggregation_counts_records() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            aggregations: ids(&["group_by_gender"]),
            ..Default::default()
        }));
        assert!(result.query.starts_with("SELECT s.SX, COUNT(*) AS record_count FROM STU s"));
        assert!(result.query.ends_with("GROUP BY s.SX"));
    }

    #[test]
    fn test_columns_appended_without_aggregation() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            columns: ids(&["email_column"]),
            ..Default::default()
        }));
        assert!(result.query.starts_with("SELECT s.ID AS student_id, s.FN AS first_name, s.LN AS last_name, s.SEM AS email FROM"));
    }

    #[test]
    fn test_parameter_substitution() {
        let library = library();
        let mut request = interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            filters: ids(&["grade_is", "language_in"]),
            ..Default::default()
        });
        request.parameters.insert("grade".to_string(), json!("9"));

        let result = FragmentComposer::new(&library).compose(&request);
        assert!(result.query.contains("s.GR = 9"));
        assert!(result.query.contains("s.HL IN ('01')"));
        assert_eq!(result.metadata.parameters_applied.get("languages"), Some(&json!(["01"])));

        request.parameters.insert("languages".to_string(), json!(["O'Brien", 2, true]));
        let result = FragmentComposer::new(&library).compose(&request);
        assert!(result.query.contains("s.HL IN ('O''Brien', 2, 1)"));
    }

    #[test]
    fn test_number_parameter_must_look_numeric() {
        let number = Some(ParameterType::Number);
        assert_eq!(render_scalar(&json!(" 12 "), number), Some("12".to_string()));
        assert_eq!(render_scalar(&json!("-2.5"), number), Some("-2.5".to_string()));
        assert_eq!(render_scalar(&json!("NaN"), number), Some("'NaN'".to_string()));
        assert_eq!(render_scalar(&json!("inf"), number), Some("'inf'".to_string()));
        assert_eq!(render_scalar(&json!("1e9"), number), Some("'1e9'".to_string()));
        assert_eq!(render_scalar(&json!("+5"), number), Some("'+5'".to_string()));
    }

    #[test]
    fn test_missing_parameter_left_verbatim() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            filters: ids(&["grade_is"]),
            ..Default::default()
        }));
        assert!(result.success);
        assert!(result.query.contains("s.GR = {{grade}}"));
        assert!(result.warnings.iter().any(|w| w.contains("{{grade}}")));
    }

    #[test]
    fn test_complexity_tiers() {
        assert_eq!(Complexity::estimate(0, 2, false), Complexity::Simple);
        assert_eq!(Complexity::estimate(0, 3, false), Complexity::Moderate);
        assert_eq!(Complexity::estimate(1, 0, false), Complexity::Moderate);
        assert_eq!(Complexity::estimate(0, 0, true), Complexity::Moderate);
        assert_eq!(Complexity::estimate(2, 0, true), Complexity::Complex);
        assert_eq!(Complexity::estimate(3, 0, false), Complexity::Complex);
    }

    #[test]
    fn test_explanation_lists_used_sections() {
        let library = library();
        let result = FragmentComposer::new(&library).compose(&interpretation(InterpretedFragments {
            base: "students_base".to_string(),
            filters: ids(&["has_iep"]),
            ..Default::default()
        }));
        assert!(result.explanation.starts_with("Base: students base (students_base)"));
        assert!(result.explanation.contains("Joins:\n  - programs join (programs_join): LEFT JOIN PGM p ON p.PID = s.ID"));
        assert!(result.explanation.contains("Filters:"));
        assert!(!result.explanation.contains("Ordering:"));
    }
}
