//! Prompt Builder
//!
//! System prompts for both generation modes and the correction messages sent
//! back to the model on retry.

use crate::fragments::FragmentLibrary;
use crate::views::ViewCatalog;

/// Response contract for fragment mode.
pub const FRAGMENT_RESPONSE_FORMAT: &str = r#"Respond with a single JSON object and nothing else:
{
  "fragments": {
    "base": "<one base fragment id>",
    "joins": ["<join id>", ...],
    "filters": ["<filter id>", ...],
    "columns": ["<column id>", ...],
    "aggregations": ["<aggregation id>"],
    "ordering": ["<order id>"]
  },
  "parameters": {"<placeholder name>": <string | number | boolean | array>},
  "confidence": <0.0 - 1.0>,
  "clarifications": [{"question": "...", "options": ["...", "..."]}],
  "warnings": ["..."]
}"#;

const FRAGMENT_RULES: &str = r#"## Rules

1. Use ONLY fragment ids listed in the catalog. Never invent ids and never write SQL.
2. Choose exactly one base fragment.
3. Dependencies are added automatically; you do not need to list them.
4. Never combine fragments that are marked as conflicting.
5. Provide a value for every {{placeholder}} used by the fragments you choose.
6. Do not pick school filters to restrict access; access scope is applied separately.
7. If the request is ambiguous, lower your confidence and add a clarification with concrete options."#;

const VIEW_RULES: &str = r#"## Rules

1. Write ONE PostgreSQL SELECT statement. No other statement types.
2. Read ONLY from the views listed above, always with a short alias (e.g. FROM llm_student_demographics d).
3. Qualify every column with its alias and use only the listed columns.
4. Never reference base tables, system catalogs or functions outside standard SQL.
5. Do not use UNION, comments, semicolons or subqueries in FROM.
6. Do NOT filter on school_id for access control; the caller's school scope is applied automatically.
7. Return only the SQL, without explanation."#;

/// System prompt listing every fragment, grouped by category and subcategory.
pub fn fragment_system_prompt(library: &FragmentLibrary) -> String {
    let mut catalog = String::new();
    for (category, subcategories) in &library.categories {
        catalog.push_str(&format!("\n### {}\n", category));
        for (subcategory, fragments) in subcategories {
            if !subcategory.is_empty() {
                catalog.push_str(&format!("#### {}\n", subcategory));
            }
            for fragment in fragments {
                catalog.push_str(&format!(
                    "- `{}` [{}] {}",
                    fragment.id, fragment.fragment_type, fragment.name
                ));
                if !fragment.description.is_empty() {
                    catalog.push_str(&format!(": {}", fragment.description));
                }
                if !fragment.parameters.is_empty() {
                    let params: Vec<String> = fragment
                        .parameters
                        .iter()
                        .map(|p| {
                            let kind = serde_json::to_value(p.param_type)
                                .ok()
                                .and_then(|v| v.as_str().map(str::to_string))
                                .unwrap_or_default();
                            if p.required {
                                format!("{}: {} (required)", p.name, kind)
                            } else {
                                format!("{}: {}", p.name, kind)
                            }
                        })
                        .collect();
                    catalog.push_str(&format!(" (parameters: {})", params.join(", ")));
                }
                if !fragment.conflicts.is_empty() {
                    catalog.push_str(&format!(" (conflicts with: {})", fragment.conflicts.join(", ")));
                }
                catalog.push('\n');
            }
        }
    }

    let bases = library.base_ids();
    let base_line = if bases.is_empty() {
        String::new()
    } else {
        format!("\nAvailable base fragments: {}\n", bases.join(", "))
    };

    format!(
        "You translate school staff requests into a selection of predefined SQL fragments for a student information system.\n\n## Fragment catalog\n{}{}\n{}\n\n{}",
        catalog, base_line, FRAGMENT_RULES, FRAGMENT_RESPONSE_FORMAT
    )
}

/// System prompt for raw SQL over the approved views.
pub fn view_system_prompt(catalog: &ViewCatalog) -> String {
    format!(
        "You write read-only SQL for a school district's student information system.\n\n## Available views\n{}\n\n{}",
        catalog.describe(),
        VIEW_RULES
    )
}

/// Correction turn for a SQL attempt that failed validation.
pub fn view_correction_prompt(previous_sql: &str, errors: &[String]) -> String {
    let listed: Vec<String> = errors.iter().map(|e| format!("- {}", e)).collect();
    format!(
        "The previous query was rejected:\n\n{}\n\nErrors:\n{}\n\nFix every error and return only the corrected SQL.",
        previous_sql,
        listed.join("\n")
    )
}

/// Correction turn for a fragment-mode reply that could not be parsed.
pub fn interpretation_correction_prompt() -> String {
    format!(
        "Your previous reply could not be parsed as a fragment selection with a valid base fragment.\n\n{}",
        FRAGMENT_RESPONSE_FORMAT
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragments::test_support::fragment;
    use crate::fragments::{FragmentType, Parameter, ParameterType};

    #[test]
    fn test_fragment_prompt_lists_catalog() {
        let mut grade = fragment("grade_is", FragmentType::Filter, "s.GR = {{grade}}");
        grade.description = "Students in one grade".to_string();
        grade.parameters = vec![Parameter {
            name: "grade".to_string(),
            param_type: ParameterType::Number,
            required: true,
            default: None,
            validation: None,
            options: None,
        }];
        let base = fragment("students_base", FragmentType::Base, "SELECT s.ID FROM STU s");
        let library = FragmentLibrary::from_fragments(vec![base, grade]);

        let prompt = fragment_system_prompt(&library);
        assert!(prompt.contains("- `grade_is` [filter] grade is: Students in one grade (parameters: grade: number (required))"));
        assert!(prompt.contains("Available base fragments: students_base"));
        assert!(prompt.contains("\"fragments\""));
    }

    #[test]
    fn test_view_prompt_mentions_views_and_scope_rule() {
        let prompt = view_system_prompt(ViewCatalog::standard());
        assert!(prompt.contains("llm_student_demographics("));
        assert!(prompt.contains("Do NOT filter on school_id"));
    }

    #[test]
    fn test_correction_prompt_lists_errors() {
        let prompt = view_correction_prompt(
            "SELECT * FROM stu",
            &["Direct access to base table 'stu' is not allowed".to_string()],
        );
        assert!(prompt.contains("SELECT * FROM stu"));
        assert!(prompt.contains("- Direct access to base table 'stu'"));
    }
}
