//! View-Based SQL Validator
//!
//! Decides whether model-authored SQL may run against the view surface.
//! All rules run on every call so one result carries every problem found.

use crate::sql_text::{mask_for_scan, table_refs, SQL_KEYWORDS};
use crate::views::{ViewCatalog, SUGGESTION_PREFIXES};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use strsim::jaro_winkler;

lazy_static! {
    static ref SELECT_START_RE: Regex = Regex::new(r"(?i)^SELECT\b").unwrap();
    static ref TRAILING_STATEMENT_RE: Regex = Regex::new(r";\s*\S").unwrap();
    static ref SUBQUERY_FROM_RE: Regex = Regex::new(r"(?i)\bFROM\s*\(").unwrap();
    static ref COLUMN_REF_RE: Regex =
        Regex::new(r"\b([A-Za-z_][A-Za-z0-9_]*)\.([A-Za-z_][A-Za-z0-9_]*)\b").unwrap();
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub referenced_views: Vec<String>,
}

/// Validates raw SQL against a [`ViewCatalog`].
pub struct ViewSqlValidator<'a> {
    catalog: &'a ViewCatalog,
    keyword_patterns: Vec<(String, KeywordPattern)>,
}

enum KeywordPattern {
    Word(Regex),
    Literal(String),
}

impl Default for ViewSqlValidator<'static> {
    fn default() -> Self {
        Self::new(ViewCatalog::standard())
    }
}

impl<'a> ViewSqlValidator<'a> {
    pub fn new(catalog: &'a ViewCatalog) -> Self {
        let keyword_patterns = catalog
            .blocked_keywords
            .iter()
            .filter_map(|kw| {
                let pattern = if kw.chars().all(|c| c.is_ascii_alphabetic()) {
                    KeywordPattern::Word(
                        Regex::new(&format!(r"(?i)\b{}\b", regex::escape(kw))).ok()?,
                    )
                } else {
                    KeywordPattern::Literal(kw.to_lowercase())
                };
                Some((kw.clone(), pattern))
            })
            .collect();

        Self {
            catalog,
            keyword_patterns,
        }
    }

    pub fn catalog(&self) -> &ViewCatalog {
        self.catalog
    }

    pub fn validate(&self, sql: &str) -> ValidationResult {
        let mut errors: Vec<String> = Vec::new();
        let mut warnings: Vec<String> = Vec::new();
        let mut referenced: Vec<String> = Vec::new();

        let trimmed = sql.trim();

        // Statement shape
        if trimmed.is_empty() {
            errors.push("SQL query is empty".to_string());
        } else if !SELECT_START_RE.is_match(trimmed) {
            errors.push("Only SELECT statements are allowed; the query must start with SELECT".to_string());
        }
        if TRAILING_STATEMENT_RE.is_match(trimmed) {
            errors.push("Multiple statements are not allowed (found ';' followed by more SQL)".to_string());
        }

        // Blocked keywords
        let lowered = trimmed.to_lowercase();
        for (keyword, pattern) in &self.keyword_patterns {
            let hit = match pattern {
                KeywordPattern::Word(re) => re.is_match(trimmed),
                KeywordPattern::Literal(lit) => lowered.contains(lit.as_str()),
            };
            if hit {
                errors.push(format!("Blocked keyword detected: {}", keyword));
            }
        }

        // Table and view references
        let refs = table_refs(trimmed);
        for table in &refs {
            let name = table.name.as_str();
            if self.catalog.is_allowed_view(name) {
                if !referenced.iter().any(|v| v == name) {
                    referenced.push(name.to_string());
                }
            } else if self.catalog.is_blocked_table(name) {
                push_unique(
                    &mut errors,
                    format!(
                        "Direct access to base table '{}' is not allowed; use the corresponding {}* view instead",
                        name, self.catalog.prefix
                    ),
                );
            } else if !self.catalog.has_view_prefix(name) {
                push_unique(
                    &mut errors,
                    format!(
                        "Invalid table/view '{}': only {}* views may be queried",
                        name, self.catalog.prefix
                    ),
                );
            } else {
                push_unique(
                    &mut warnings,
                    format!("View '{}' is not in the approved view list", name),
                );
            }
        }

        if SUBQUERY_FROM_RE.is_match(&mask_for_scan(trimmed)) {
            warnings.push(
                "Subquery in FROM clause detected; nested query could not be fully verified".to_string(),
            );
        }

        if referenced.is_empty() && errors.is_empty() {
            warnings.push("Query does not reference any approved views".to_string());
        }

        // Column checks
        let (col_errors, col_warnings) = self.check_columns(trimmed);
        for e in col_errors {
            push_unique(&mut errors, e);
        }
        for w in col_warnings {
            push_unique(&mut warnings, w);
        }

        ValidationResult {
            valid: errors.is_empty(),
            errors,
            warnings,
            referenced_views: referenced,
        }
    }

    /// alias (lower-cased) -> view name (lower-cased), from FROM/JOIN clauses.
    /// A view referenced without an alias is reachable by its own name.
    pub fn extract_aliases(&self, sql: &str) -> HashMap<String, String> {
        let mut aliases = HashMap::new();
        for table in table_refs(sql) {
            aliases.insert(table.name.clone(), table.name.clone());
            if let Some(alias) = &table.alias {
                let alias = alias.to_lowercase();
                if !SQL_KEYWORDS.contains(alias.as_str()) {
                    aliases.insert(alias, table.name.clone());
                }
            }
        }
        aliases
    }

    fn check_columns(&self, sql: &str) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let aliases = self.extract_aliases(sql);
        let masked = mask_for_scan(sql);

        let mut checked: BTreeSet<(String, String)> = BTreeSet::new();
        for caps in COLUMN_REF_RE.captures_iter(&masked) {
            let alias = caps[1].to_lowercase();
            let column = caps[2].to_lowercase();
            if !checked.insert((alias.clone(), column.clone())) {
                continue;
            }
            let Some(view) = aliases.get(&alias) else {
                continue;
            };

            if self.catalog.is_allowed_view(view) {
                if !self.catalog.has_column(view, &column) {
                    let suggestions = self.suggest_columns(view, &column);
                    let hint = if suggestions.is_empty() {
                        String::new()
                    } else {
                        format!(" Did you mean: {}?", suggestions.join(", "))
                    };
                    errors.push(format!(
                        "Column '{}' does not exist in view '{}' (referenced as {}.{}).{}",
                        column, view, &caps[1], &caps[2], hint
                    ));
                }
            } else if self.catalog.has_view_prefix(view) {
                warnings.push(format!(
                    "Cannot validate column '{}' on unrecognized view '{}'",
                    column, view
                ));
            }
        }

        (errors, warnings)
    }

    /// Up to three columns of `view` that look like `column`.
    pub fn suggest_columns(&self, view: &str, column: &str) -> Vec<String> {
        let Some(columns) = self.catalog.columns(view) else {
            return Vec::new();
        };
        let wanted = strip_prefixes(&column.to_lowercase());
        if wanted.is_empty() {
            return Vec::new();
        }

        let mut candidates: Vec<(&String, f64)> = columns
            .iter()
            .filter(|c| {
                let core = strip_prefixes(c);
                !core.is_empty() && (core.contains(&wanted) || wanted.contains(&core))
            })
            .map(|c| (c, jaro_winkler(&wanted, &strip_prefixes(c))))
            .collect();
        candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        candidates.into_iter().take(3).map(|(c, _)| c.clone()).collect()
    }
}

fn strip_prefixes(name: &str) -> String {
    let mut core = name;
    for prefix in SUGGESTION_PREFIXES {
        if let Some(rest) = core.strip_prefix(prefix) {
            core = rest;
            break;
        }
    }
    core.to_string()
}

fn push_unique(list: &mut Vec<String>, message: String) {
    if !list.contains(&message) {
        list.push(message);
    }
}
