//! Access scope
//!
//! The caller's school authorization, supplied per request by the
//! authentication layer, and the fragment-mode pass that forces composed SQL
//! to match it. Scope never comes from model output.

use crate::error::{QueryError, Result};
use crate::sql_text::{mask_literals, top_level_conjuncts};
use crate::view_builder::{insert_where_predicate, main_where};
use itertools::Itertools;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use tracing::warn;

pub type SchoolId = i64;
pub type TeacherId = i64;

/// Which schools the caller may read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchoolAccess {
    /// Unrestricted.
    District,
    /// Exactly these schools. Empty means no access at all.
    Schools(BTreeSet<SchoolId>),
}

/// The school the caller is currently working in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActiveSchool {
    All,
    School(SchoolId),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccessScope {
    pub active_school: ActiveSchool,
    pub allowed_schools: SchoolAccess,
    #[serde(default)]
    pub roster_teacher: Option<TeacherId>,
    /// Privileged callers receive per-attempt diagnostics on failure.
    #[serde(default)]
    pub diagnostics: bool,
}

/// How a response reports the scope that was applied.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SchoolScope {
    District,
    Schools(Vec<SchoolId>),
}

impl AccessScope {
    pub fn district() -> Self {
        Self {
            active_school: ActiveSchool::All,
            allowed_schools: SchoolAccess::District,
            roster_teacher: None,
            diagnostics: false,
        }
    }

    pub fn schools(ids: impl IntoIterator<Item = SchoolId>) -> Self {
        Self {
            active_school: ActiveSchool::All,
            allowed_schools: SchoolAccess::Schools(ids.into_iter().collect()),
            roster_teacher: None,
            diagnostics: false,
        }
    }

    pub fn with_active_school(mut self, school: SchoolId) -> Self {
        self.active_school = ActiveSchool::School(school);
        self
    }

    pub fn with_roster_teacher(mut self, teacher: TeacherId) -> Self {
        self.roster_teacher = Some(teacher);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: bool) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    pub fn has_access(&self) -> bool {
        match &self.allowed_schools {
            SchoolAccess::District => true,
            SchoolAccess::Schools(ids) => !ids.is_empty(),
        }
    }

    /// Schools every query must be filtered to: `None` for district-wide
    /// access, otherwise a non-empty sorted list. An active school outside
    /// the allowed set is ignored.
    pub fn effective_schools(&self) -> Result<Option<Vec<SchoolId>>> {
        match (&self.allowed_schools, self.active_school) {
            (SchoolAccess::District, ActiveSchool::All) => Ok(None),
            (SchoolAccess::District, ActiveSchool::School(id)) => Ok(Some(vec![id])),
            (SchoolAccess::Schools(ids), _) if ids.is_empty() => Err(QueryError::Scope(
                "caller has no school access".to_string(),
            )),
            (SchoolAccess::Schools(ids), ActiveSchool::School(id)) if ids.contains(&id) => {
                Ok(Some(vec![id]))
            }
            (SchoolAccess::Schools(ids), _) => Ok(Some(ids.iter().copied().collect())),
        }
    }

    pub fn summary(&self) -> SchoolScope {
        match self.effective_schools() {
            Ok(Some(ids)) => SchoolScope::Schools(ids),
            Ok(None) => SchoolScope::District,
            Err(_) => SchoolScope::Schools(Vec::new()),
        }
    }
}

/// Outcome of [`enforce_fragment_scope`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeEnforcement {
    pub sql: String,
    /// True if a predicate was replaced or added.
    pub corrected: bool,
}

/// Make composed SQL obey the caller's schools.
///
/// Only `<column> = n` / `<column> IN (...)` predicates that are top-level
/// AND conjuncts of the main WHERE count as scope. Fully in-scope ones are
/// kept; anything else among them is narrowed to its in-scope ids or, if none
/// remain, replaced by the caller's full set. Matches anywhere else (select
/// list, CASE, JOIN ON, OR branches) do not scope the query, so when no
/// conjunct qualifies the caller's predicate is added to the main WHERE.
pub fn enforce_fragment_scope(
    sql: &str,
    column: &str,
    schools: Option<&[SchoolId]>,
) -> ScopeEnforcement {
    let Some(schools) = schools.filter(|s| !s.is_empty()) else {
        return ScopeEnforcement {
            sql: sql.to_string(),
            corrected: false,
        };
    };
    let sql = sql.trim().trim_end_matches(';').trim_end();

    let pattern = format!(
        r"(?i)^{}\s*(?:=\s*(-?\d+)|IN\s*\(([^()]*)\))$",
        regex::escape(column)
    );
    let re = match Regex::new(&pattern) {
        Ok(re) => re,
        Err(e) => {
            warn!("Invalid scope column '{}': {}", column, e);
            return ScopeEnforcement {
                sql: insert_where_predicate(sql, &scope_predicate(column, schools)),
                corrected: true,
            };
        }
    };

    let mut out = String::with_capacity(sql.len());
    let mut last = 0;
    let mut found = false;
    let mut corrected = false;

    if let Some((_, body_start, body_end)) = main_where(sql) {
        let body = &sql[body_start..body_end];
        let masked = mask_literals(body);

        for (from, to) in top_level_conjuncts(body).unwrap_or_default() {
            let raw = &masked[from..to];
            let conjunct = raw.trim();
            let Some(caps) = re.captures(conjunct) else {
                continue;
            };
            let start = body_start + from + (raw.len() - raw.trim_start().len());
            let end = start + conjunct.len();
            found = true;

            let ids: Option<Vec<SchoolId>> = match (caps.get(1), caps.get(2)) {
                (Some(single), _) => single.as_str().parse().ok().map(|id| vec![id]),
                (None, Some(list)) => list
                    .as_str()
                    .split(',')
                    .map(|v| v.trim().parse::<SchoolId>().ok())
                    .collect(),
                _ => None,
            };

            let in_scope: Vec<SchoolId> = ids
                .as_deref()
                .unwrap_or(&[])
                .iter()
                .copied()
                .filter(|id| schools.contains(id))
                .collect();

            let all_in_scope =
                matches!(&ids, Some(list) if !list.is_empty() && list.len() == in_scope.len());
            if all_in_scope {
                continue;
            }

            let replacement = if in_scope.is_empty() {
                scope_predicate(column, schools)
            } else {
                scope_predicate(column, &in_scope)
            };
            warn!(
                "Replacing out-of-scope predicate '{}' with '{}'",
                &sql[start..end],
                replacement
            );
            out.push_str(&sql[last..start]);
            out.push_str(&replacement);
            last = end;
            corrected = true;
        }
    }
    out.push_str(&sql[last..]);

    if !found {
        warn!("Composed query has no top-level school predicate; adding one");
        return ScopeEnforcement {
            sql: insert_where_predicate(&out, &scope_predicate(column, schools)),
            corrected: true,
        };
    }

    ScopeEnforcement {
        sql: out,
        corrected,
    }
}

fn scope_predicate(column: &str, schools: &[SchoolId]) -> String {
    format!("{} IN ({})", column, schools.iter().join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_schools() {
        assert_eq!(AccessScope::district().effective_schools().unwrap(), None);
        assert_eq!(
            AccessScope::district().with_active_school(4).effective_schools().unwrap(),
            Some(vec![4])
        );
        assert_eq!(
            AccessScope::schools([5, 3]).effective_schools().unwrap(),
            Some(vec![3, 5])
        );
        assert_eq!(
            AccessScope::schools([3, 5]).with_active_school(5).effective_schools().unwrap(),
            Some(vec![5])
        );
        // An active school the caller cannot see falls back to the allowed set.
        assert_eq!(
            AccessScope::schools([3, 5]).with_active_school(9).effective_schools().unwrap(),
            Some(vec![3, 5])
        );
    }

    #[test]
    fn test_empty_school_set_is_no_access() {
        let scope = AccessScope::schools([]);
        assert!(!scope.has_access());
        assert!(matches!(scope.effective_schools(), Err(QueryError::Scope(_))));
    }

    #[test]
    fn test_summary_serialization() {
        assert_eq!(
            serde_json::to_value(AccessScope::district().summary()).unwrap(),
            serde_json::json!("district")
        );
        assert_eq!(
            serde_json::to_value(AccessScope::schools([3, 4]).summary()).unwrap(),
            serde_json::json!({"schools": [3, 4]})
        );
    }

    #[test]
    fn test_out_of_scope_predicate_is_replaced() {
        let out = enforce_fragment_scope(
            "SELECT s.ID FROM STU s WHERE s.DEL = 0 AND s.SC IN (9)",
            "s.SC",
            Some(&[3, 4]),
        );
        assert!(out.corrected);
        assert_eq!(out.sql, "SELECT s.ID FROM STU s WHERE s.DEL = 0 AND s.SC IN (3, 4)");

        let out = enforce_fragment_scope("SELECT s.ID FROM STU s WHERE s.SC = 9", "s.SC", Some(&[3]));
        assert_eq!(out.sql, "SELECT s.ID FROM STU s WHERE s.SC IN (3)");
    }

    #[test]
    fn test_in_scope_narrower_predicate_is_kept() {
        let sql = "SELECT s.ID FROM STU s WHERE s.SC IN (3) AND s.GR = 9";
        let out = enforce_fragment_scope(sql, "s.SC", Some(&[3, 4]));
        assert!(!out.corrected);
        assert_eq!(out.sql, sql);
    }

    #[test]
    fn test_partially_in_scope_predicate_is_narrowed() {
        let out = enforce_fragment_scope(
            "SELECT s.ID FROM STU s WHERE s.SC IN (3, 9) ORDER BY s.LN",
            "s.SC",
            Some(&[3, 4]),
        );
        assert_eq!(out.sql, "SELECT s.ID FROM STU s WHERE s.SC IN (3) ORDER BY s.LN");
    }

    #[test]
    fn test_missing_predicate_is_added() {
        let out = enforce_fragment_scope(
            "SELECT s.ID FROM STU s WHERE s.DEL = 0 ORDER BY s.LN",
            "s.SC",
            Some(&[3, 4]),
        );
        assert!(out.corrected);
        assert_eq!(
            out.sql,
            "SELECT s.ID FROM STU s WHERE s.SC IN (3, 4) AND (s.DEL = 0) ORDER BY s.LN"
        );
    }

    #[test]
    fn test_district_wide_is_untouched() {
        let sql = "SELECT s.ID FROM STU s WHERE s.SC = 9";
        let out = enforce_fragment_scope(sql, "s.SC", None);
        assert_eq!(out.sql, sql);
        assert!(!out.corrected);
    }

    #[test]
    fn test_other_columns_and_literals_are_ignored() {
        let sql = "SELECT s.ID FROM STU s WHERE s.SCH = 9 AND s.NM = 's.SC = 9'";
        let out = enforce_fragment_scope(sql, "s.SC", Some(&[3]));
        assert_eq!(
            out.sql,
            "SELECT s.ID FROM STU s WHERE s.SC IN (3) AND (s.SCH = 9 AND s.NM = 's.SC = 9')"
        );
    }

    #[test]
    fn test_match_in_select_list_does_not_scope() {
        let out = enforce_fragment_scope(
            "SELECT s.ID, CASE WHEN s.SC = 3 THEN 'J' END AS lbl FROM STU s WHERE s.DEL = 0",
            "s.SC",
            Some(&[3, 4]),
        );
        assert!(out.corrected);
        assert_eq!(
            out.sql,
            "SELECT s.ID, CASE WHEN s.SC = 3 THEN 'J' END AS lbl FROM STU s WHERE s.SC IN (3, 4) AND (s.DEL = 0)"
        );
    }

    #[test]
    fn test_match_in_join_condition_does_not_scope() {
        let out = enforce_fragment_scope(
            "SELECT s.ID FROM STU s LEFT JOIN ATT a ON a.SC = s.SC AND s.SC = 3",
            "s.SC",
            Some(&[3]),
        );
        assert!(out.corrected);
        assert!(out.sql.ends_with("AND s.SC = 3 WHERE s.SC IN (3)"), "{}", out.sql);
    }

    #[test]
    fn test_match_in_or_branch_does_not_scope() {
        let out = enforce_fragment_scope(
            "SELECT s.ID FROM STU s WHERE s.SC = 3 OR s.DEL = 0",
            "s.SC",
            Some(&[3]),
        );
        assert!(out.corrected);
        assert_eq!(
            out.sql,
            "SELECT s.ID FROM STU s WHERE s.SC IN (3) AND (s.SC = 3 OR s.DEL = 0)"
        );
    }

    #[test]
    fn test_match_inside_case_in_where_does_not_scope() {
        let out = enforce_fragment_scope(
            "SELECT s.ID FROM STU s WHERE CASE WHEN 1 = 0 AND s.SC = 3 AND 1 = 1 THEN 1 ELSE 1 END = 1",
            "s.SC",
            Some(&[3]),
        );
        assert!(out.corrected);
        assert!(out.sql.contains("WHERE s.SC IN (3) AND (CASE WHEN"), "{}", out.sql);
    }

    #[test]
    fn test_match_in_subquery_does_not_scope() {
        let out = enforce_fragment_scope(
            "SELECT s.ID FROM STU s WHERE s.ID IN (SELECT x.ID FROM STU x WHERE s.SC = 3)",
            "s.SC",
            Some(&[3]),
        );
        assert!(out.corrected);
        assert!(out.sql.contains("WHERE s.SC IN (3) AND (s.ID IN (SELECT"), "{}", out.sql);
    }

    #[test]
    fn test_quoted_values_are_replaced() {
        let out = enforce_fragment_scope(
            "SELECT s.ID FROM STU s WHERE s.SC IN ('3', '4')",
            "s.SC",
            Some(&[3]),
        );
        assert_eq!(out.sql, "SELECT s.ID FROM STU s WHERE s.SC IN (3)");
    }
}
