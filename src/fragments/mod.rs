//! Fragment Library
//!
//! Named, reusable SQL snippets and the catalog that groups them by
//! category and subcategory. The catalog is owned by an external store and
//! is only ever read here.

pub mod store;

pub use store::*;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

pub type FragmentId = String;

lazy_static! {
    pub static ref PLACEHOLDER_RE: Regex = Regex::new(r"\{\{\s*([A-Za-z_][A-Za-z0-9_]*)\s*\}\}").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentType {
    Base,
    Join,
    Filter,
    Column,
    Aggregation,
    Order,
}

impl fmt::Display for FragmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FragmentType::Base => "base",
            FragmentType::Join => "join",
            FragmentType::Filter => "filter",
            FragmentType::Column => "column",
            FragmentType::Aggregation => "aggregation",
            FragmentType::Order => "order",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParameterType {
    String,
    Number,
    Date,
    Array,
    Boolean,
}

/// Documents a `{{name}}` placeholder in a fragment's snippet.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parameter {
    pub name: String,
    #[serde(rename = "type")]
    pub param_type: ParameterType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub validation: Option<String>,
    #[serde(default)]
    pub options: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fragment {
    pub id: FragmentId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub snippet: String,
    #[serde(rename = "type")]
    pub fragment_type: FragmentType,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub subcategory: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub tables: BTreeSet<String>,
    #[serde(default)]
    pub dependencies: Vec<FragmentId>,
    #[serde(default)]
    pub conflicts: Vec<FragmentId>,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default)]
    pub output_columns: Vec<String>,
}

impl Fragment {
    /// Placeholder names used in the snippet, in order of first appearance.
    pub fn placeholders(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        PLACEHOLDER_RE
            .captures_iter(&self.snippet)
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .filter(|name| seen.insert(name.clone()))
            .collect()
    }

    pub fn parameter(&self, name: &str) -> Option<&Parameter> {
        self.parameters.iter().find(|p| p.name == name)
    }
}

/// category -> subcategory -> ordered fragments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FragmentLibrary {
    pub categories: BTreeMap<String, BTreeMap<String, Vec<Fragment>>>,
}

/// A problem found by [`FragmentLibrary::validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LibraryIssue {
    DuplicateId(FragmentId),
    SelfDependency(FragmentId),
    DanglingDependency { fragment: FragmentId, dependency: FragmentId },
    DependencyCycle(Vec<FragmentId>),
    UndeclaredPlaceholder { fragment: FragmentId, placeholder: String },
}

impl fmt::Display for LibraryIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LibraryIssue::DuplicateId(id) => write!(f, "duplicate fragment id '{}'", id),
            LibraryIssue::SelfDependency(id) => write!(f, "fragment '{}' depends on itself", id),
            LibraryIssue::DanglingDependency { fragment, dependency } => write!(
                f,
                "fragment '{}' depends on unknown fragment '{}'",
                fragment, dependency
            ),
            LibraryIssue::DependencyCycle(path) => {
                write!(f, "dependency cycle: {}", path.join(" -> "))
            }
            LibraryIssue::UndeclaredPlaceholder { fragment, placeholder } => write!(
                f,
                "fragment '{}' uses undeclared placeholder '{{{{{}}}}}'",
                fragment, placeholder
            ),
        }
    }
}

impl FragmentLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a library from a flat list, grouping by each fragment's own
    /// category and subcategory.
    pub fn from_fragments(fragments: impl IntoIterator<Item = Fragment>) -> Self {
        let mut library = Self::new();
        for fragment in fragments {
            library.insert(fragment);
        }
        library
    }

    pub fn insert(&mut self, fragment: Fragment) {
        self.categories
            .entry(fragment.category.clone())
            .or_default()
            .entry(fragment.subcategory.clone())
            .or_default()
            .push(fragment);
    }

    /// All fragments in catalog order.
    pub fn iter(&self) -> impl Iterator<Item = &Fragment> {
        self.categories
            .values()
            .flat_map(|subs| subs.values())
            .flat_map(|list| list.iter())
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }

    /// Index by id. On duplicate ids the first one in catalog order wins.
    pub fn index(&self) -> HashMap<&str, &Fragment> {
        let mut index = HashMap::new();
        for fragment in self.iter() {
            index.entry(fragment.id.as_str()).or_insert(fragment);
        }
        index
    }

    pub fn get(&self, id: &str) -> Option<&Fragment> {
        self.iter().find(|f| f.id == id)
    }

    pub fn base_ids(&self) -> Vec<&str> {
        self.iter()
            .filter(|f| f.fragment_type == FragmentType::Base)
            .map(|f| f.id.as_str())
            .collect()
    }

    /// Check the catalog invariants. Never fails; returns every issue found.
    pub fn validate(&self) -> Vec<LibraryIssue> {
        let mut issues = Vec::new();
        let mut seen = HashSet::new();
        for fragment in self.iter() {
            if !seen.insert(fragment.id.as_str()) {
                issues.push(LibraryIssue::DuplicateId(fragment.id.clone()));
            }
        }

        let index = self.index();
        for fragment in self.iter() {
            for dep in &fragment.dependencies {
                if dep == &fragment.id {
                    issues.push(LibraryIssue::SelfDependency(fragment.id.clone()));
                } else if !index.contains_key(dep.as_str()) {
                    issues.push(LibraryIssue::DanglingDependency {
                        fragment: fragment.id.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
            for placeholder in fragment.placeholders() {
                if fragment.parameter(&placeholder).is_none() {
                    issues.push(LibraryIssue::UndeclaredPlaceholder {
                        fragment: fragment.id.clone(),
                        placeholder,
                    });
                }
            }
        }

        issues.extend(find_cycles(&index).into_iter().map(LibraryIssue::DependencyCycle));
        issues
    }
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

fn find_cycles(index: &HashMap<&str, &Fragment>) -> Vec<Vec<FragmentId>> {
    let mut marks: HashMap<&str, Mark> = HashMap::new();
    let mut cycles = Vec::new();

    let mut ids: Vec<&str> = index.keys().copied().collect();
    ids.sort_unstable();

    for id in ids {
        let mut path = Vec::new();
        visit(id, index, &mut marks, &mut path, &mut cycles);
    }
    cycles
}

fn visit<'a>(
    id: &'a str,
    index: &HashMap<&'a str, &'a Fragment>,
    marks: &mut HashMap<&'a str, Mark>,
    path: &mut Vec<&'a str>,
    cycles: &mut Vec<Vec<FragmentId>>,
) {
    match marks.get(id) {
        Some(Mark::Done) => return,
        Some(Mark::Visiting) => {
            if let Some(pos) = path.iter().position(|p| *p == id) {
                let mut cycle: Vec<FragmentId> = path[pos..].iter().map(|s| s.to_string()).collect();
                cycle.push(id.to_string());
                // A self-dependency is reported separately.
                if cycle.len() > 2 {
                    cycles.push(cycle);
                }
            }
            return;
        }
        None => {}
    }

    let Some(&fragment) = index.get(id) else {
        return;
    };

    marks.insert(id, Mark::Visiting);
    path.push(id);
    for dep in &fragment.dependencies {
        if let Some((&dep_id, _)) = index.get_key_value(dep.as_str()) {
            visit(dep_id, index, marks, path, cycles);
        }
    }
    path.pop();
    marks.insert(id, Mark::Done);
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn fragment(id: &str, fragment_type: FragmentType, snippet: &str) -> Fragment {
        Fragment {
            id: id.to_string(),
            name: id.replace('_', " "),
            description: String::new(),
            snippet: snippet.to_string(),
            fragment_type,
            category: fragment_type.to_string(),
            subcategory: "general".to_string(),
            tags: BTreeSet::new(),
            tables: BTreeSet::new(),
            dependencies: Vec::new(),
            conflicts: Vec::new(),
            parameters: Vec::new(),
            output_columns: Vec::new(),
        }
    }
}
