//! View Catalog
//!
//! The fixed surface the raw-SQL generation mode may touch: whitelisted
//! `llm_` views and their columns, the base tables that must never be read
//! directly, and the blocked keyword list.

use lazy_static::lazy_static;
use std::collections::{BTreeMap, BTreeSet};

/// Every generated view carries this prefix.
pub const VIEW_PREFIX: &str = "llm_";

/// Tenant (school) column present on every scoped view.
pub const TENANT_COLUMN: &str = "school_id";

/// View used to restrict teachers to their own students.
pub const ROSTER_VIEW: &str = "llm_teacher_rosters";

/// Whitelisted views and their columns.
pub const VIEW_COLUMNS: &[(&str, &[&str])] = &[
    (
        "llm_student_demographics",
        &[
            "student_id", "school_id", "school_name", "student_number", "first_name",
            "last_name", "middle_name", "grade", "gender", "birth_date", "ethnicity",
            "home_language", "language_fluency", "enter_date", "leave_date", "is_active",
            "counselor_id",
        ],
    ),
    (
        "llm_student_enrollment",
        &[
            "student_id", "school_id", "school_name", "academic_year", "grade",
            "enter_date", "leave_date", "enter_code", "leave_code", "track", "is_current",
        ],
    ),
    (
        "llm_student_programs",
        &[
            "student_id", "school_id", "program_code", "program_name", "has_iep",
            "has_504", "is_english_learner", "is_gate", "is_foster", "is_homeless",
            "free_reduced_lunch", "eligibility_start", "eligibility_end",
        ],
    ),
    (
        "llm_attendance_summary",
        &[
            "student_id", "school_id", "academic_year", "days_enrolled", "days_present",
            "days_absent", "days_excused", "days_unexcused", "days_tardy", "days_suspended",
            "attendance_rate", "is_chronically_absent",
        ],
    ),
    (
        "llm_student_grades",
        &[
            "student_id", "school_id", "academic_year", "term", "course_id",
            "course_title", "section_id", "teacher_id", "mark", "credit_attempted",
            "credit_earned", "grade_points",
        ],
    ),
    (
        "llm_course_sections",
        &[
            "section_id", "school_id", "course_id", "course_title", "teacher_id",
            "teacher_name", "period", "room", "term", "max_seats", "enrolled_count",
        ],
    ),
    (
        "llm_teacher_rosters",
        &[
            "teacher_id", "teacher_name", "student_id", "school_id", "section_id",
            "course_id", "course_title", "period", "term",
        ],
    ),
    (
        "llm_test_scores",
        &[
            "student_id", "school_id", "test_id", "test_name", "test_part",
            "test_date", "scale_score", "performance_level", "grade_tested",
        ],
    ),
    (
        "llm_discipline_incidents",
        &[
            "incident_id", "student_id", "school_id", "incident_date", "incident_code",
            "incident_description", "disposition_code", "days_suspended", "location",
        ],
    ),
    (
        "llm_schools",
        &[
            "school_id", "school_name", "school_type", "low_grade", "high_grade",
            "principal_name", "address", "phone",
        ],
    ),
];

/// Raw student-information tables. Reading them bypasses the views.
pub const BLOCKED_TABLES: &[&str] = &[
    "stu", "tch", "enr", "att", "day", "his", "crs", "mst", "sec", "sse", "tst",
    "ads", "dsp", "con", "pgm", "fre", "loc", "sch", "usr", "grd", "gpa", "tsc",
    "stu_archive", "tch_archive",
];

/// Destructive statements, server extensions, comment markers and catalog access.
/// Letter-only entries match on word boundaries, the rest as literal substrings.
pub const BLOCKED_KEYWORDS: &[&str] = &[
    "DROP", "DELETE", "INSERT", "UPDATE", "ALTER", "CREATE", "TRUNCATE", "MERGE",
    "REPLACE", "EXEC", "EXECUTE", "GRANT", "REVOKE", "DENY", "INTO", "DBCC",
    "sp_", "xp_", "OPENQUERY", "OPENROWSET", "OPENDATASOURCE", "BULK",
    "--", "/*", "*/", "UNION",
    "INFORMATION_SCHEMA", "sys.", "sysobjects", "syscolumns", "pg_catalog", "pg_",
    "WAITFOR", "SHUTDOWN", "BACKUP", "RESTORE", "KILL",
];

/// Column-name prefixes stripped before fuzzy suggestion matching.
pub const SUGGESTION_PREFIXES: &[&str] = &[
    "student_", "school_", "teacher_", "course_", "test_", "incident_", "is_",
    "has_", "days_", "total_", "num_",
];

lazy_static! {
    static ref DEFAULT_CATALOG: ViewCatalog = ViewCatalog::default_catalog();
}

/// The schema surface handed to the validator.
#[derive(Debug, Clone)]
pub struct ViewCatalog {
    pub prefix: String,
    pub tenant_column: String,
    pub views: BTreeMap<String, Vec<String>>,
    pub blocked_tables: BTreeSet<String>,
    pub blocked_keywords: Vec<String>,
}

impl ViewCatalog {
    fn default_catalog() -> Self {
        Self {
            prefix: VIEW_PREFIX.to_string(),
            tenant_column: TENANT_COLUMN.to_string(),
            views: VIEW_COLUMNS
                .iter()
                .map(|(view, cols)| {
                    (
                        view.to_string(),
                        cols.iter().map(|c| c.to_string()).collect(),
                    )
                })
                .collect(),
            blocked_tables: BLOCKED_TABLES.iter().map(|t| t.to_string()).collect(),
            blocked_keywords: BLOCKED_KEYWORDS.iter().map(|k| k.to_string()).collect(),
        }
    }

    /// Shared instance of the built-in catalog.
    pub fn standard() -> &'static ViewCatalog {
        &DEFAULT_CATALOG
    }

    pub fn is_allowed_view(&self, name: &str) -> bool {
        self.views.contains_key(&name.to_lowercase())
    }

    pub fn columns(&self, view: &str) -> Option<&[String]> {
        self.views.get(&view.to_lowercase()).map(|c| c.as_slice())
    }

    pub fn has_column(&self, view: &str, column: &str) -> bool {
        let column = column.to_lowercase();
        self.columns(view)
            .map(|cols| cols.iter().any(|c| *c == column))
            .unwrap_or(false)
    }

    pub fn is_blocked_table(&self, name: &str) -> bool {
        self.blocked_tables.contains(&name.to_lowercase())
    }

    pub fn has_view_prefix(&self, name: &str) -> bool {
        name.to_lowercase().starts_with(&self.prefix)
    }

    /// Render the catalog for the view-mode system prompt.
    pub fn describe(&self) -> String {
        self.views
            .iter()
            .map(|(view, cols)| format!("- {}({})", view, cols.join(", ")))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_view_is_prefixed_and_scoped() {
        let catalog = ViewCatalog::standard();
        for (view, cols) in &catalog.views {
            assert!(view.starts_with(VIEW_PREFIX), "{} lacks prefix", view);
            assert!(
                cols.iter().any(|c| c == TENANT_COLUMN),
                "{} lacks {}",
                view,
                TENANT_COLUMN
            );
        }
    }

    #[test]
    fn test_case_insensitive_lookups() {
        let catalog = ViewCatalog::standard();
        assert!(catalog.is_allowed_view("LLM_Student_Demographics"));
        assert!(catalog.has_column("llm_student_demographics", "Last_Name"));
        assert!(catalog.is_blocked_table("STU"));
        assert!(!catalog.is_allowed_view("stu"));
    }

    #[test]
    fn test_roster_view_has_join_columns() {
        let catalog = ViewCatalog::standard();
        assert!(catalog.has_column(ROSTER_VIEW, "student_id"));
        assert!(catalog.has_column(ROSTER_VIEW, "teacher_id"));
    }
}
