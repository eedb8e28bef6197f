//! Discovery graph types and slug normalization.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};

/// Canonical dedup key: ASCII lower-case, every run of other characters
/// collapsed to one `-`, no leading or trailing `-`.
///
/// Idempotent: `normalize_slug(&normalize_slug(x)) == normalize_slug(x)`.
pub fn normalize_slug(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_hyphen = false;
    for c in raw.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_hyphen && !out.is_empty() {
                out.push('-');
            }
            pending_hyphen = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    out
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !value.is_empty() && !list.contains(&value) {
        list.push(value);
    }
}

fn fill_if_empty(slot: &mut String, value: &str) {
    if slot.trim().is_empty() && !value.trim().is_empty() {
        *slot = value.to_string();
    }
}

// ─── Graph Types ────────────────────────────────────────────────────────────

/// Reads an explicit `null` the same as a missing key.
fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectInfo {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(deserialize_with = "null_as_default")]
    pub language: String,
    #[serde(deserialize_with = "null_as_default")]
    pub build_system: String,
    #[serde(deserialize_with = "null_as_default")]
    pub entry_points: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    Low,
    #[default]
    Medium,
    High,
}

impl fmt::Display for Complexity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Complexity::Low => write!(f, "low"),
            Complexity::Medium => write!(f, "medium"),
            Complexity::High => write!(f, "high"),
        }
    }
}

/// Model output varies in case; anything unrecognized reads as `medium`.
impl<'de> Deserialize<'de> for Complexity {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Option::<String>::deserialize(deserializer)?.unwrap_or_default();
        Ok(match raw.trim().to_ascii_lowercase().as_str() {
            "low" => Complexity::Low,
            "high" => Complexity::High,
            _ => Complexity::Medium,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Component {
    #[serde(deserialize_with = "null_as_default")]
    pub id: String,
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub path: String,
    #[serde(deserialize_with = "null_as_default")]
    pub purpose: String,
    #[serde(deserialize_with = "null_as_default")]
    pub key_files: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub dependencies: BTreeSet<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub dependents: BTreeSet<String>,
    pub complexity: Complexity,
    #[serde(deserialize_with = "null_as_default")]
    pub category: String,
}

impl Component {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            ..Self::default()
        }
    }

    /// Slug the id (falling back to the name) and every referenced id.
    pub fn normalize(&mut self) {
        let source = if self.id.trim().is_empty() {
            self.name.as_str()
        } else {
            self.id.as_str()
        };
        self.id = normalize_slug(source);

        let own = self.id.clone();
        let slug_set = |set: &BTreeSet<String>| -> BTreeSet<String> {
            set.iter()
                .map(|d| normalize_slug(d))
                .filter(|d| !d.is_empty() && *d != own)
                .collect()
        };
        self.dependencies = slug_set(&self.dependencies);
        self.dependents = slug_set(&self.dependents);

        let mut files = Vec::with_capacity(self.key_files.len());
        for f in self.key_files.drain(..) {
            push_unique(&mut files, f.trim().to_string());
        }
        self.key_files = files;
    }

    /// Fold a duplicate into `self`: empty scalars are filled, lists unioned.
    fn absorb(&mut self, other: Component) {
        fill_if_empty(&mut self.name, &other.name);
        fill_if_empty(&mut self.path, &other.path);
        fill_if_empty(&mut self.purpose, &other.purpose);
        fill_if_empty(&mut self.category, &other.category);
        for f in other.key_files {
            push_unique(&mut self.key_files, f);
        }
        self.dependencies.extend(other.dependencies);
        self.dependents.extend(other.dependents);
        self.dependencies.remove(&self.id);
        self.dependents.remove(&self.id);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Category {
    #[serde(deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveryGraph {
    pub project: ProjectInfo,
    pub components: Vec<Component>,
    pub categories: Vec<Category>,
    #[serde(deserialize_with = "null_as_default")]
    pub architecture_notes: String,
}

impl DiscoveryGraph {
    /// Empty seed for a first iteration.
    pub fn seed(project_name: impl Into<String>) -> Self {
        Self {
            project: ProjectInfo {
                name: project_name.into(),
                ..ProjectInfo::default()
            },
            ..Self::default()
        }
    }

    pub fn component(&self, id: &str) -> Option<&Component> {
        let id = normalize_slug(id);
        self.components.iter().find(|c| c.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty() && self.categories.is_empty()
    }

    /// Slug every id and collapse duplicates, keeping first-seen order.
    ///
    /// Components that normalize to an empty id are dropped. Categories are
    /// deduplicated by trimmed, case-insensitive name.
    pub fn normalize(&mut self) {
        let mut merged: Vec<Component> = Vec::with_capacity(self.components.len());
        for mut component in self.components.drain(..) {
            component.normalize();
            if component.id.is_empty() {
                continue;
            }
            match merged.iter_mut().find(|c| c.id == component.id) {
                Some(existing) => existing.absorb(component),
                None => merged.push(component),
            }
        }
        self.components = merged;

        let mut categories: Vec<Category> = Vec::with_capacity(self.categories.len());
        for mut category in self.categories.drain(..) {
            category.name = category.name.trim().to_string();
            if category.name.is_empty() {
                continue;
            }
            match categories
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(&category.name))
            {
                Some(existing) => fill_if_empty(&mut existing.description, &category.description),
                None => categories.push(category),
            }
        }
        self.categories = categories;

        let mut entry_points = Vec::with_capacity(self.project.entry_points.len());
        for e in self.project.entry_points.drain(..) {
            push_unique(&mut entry_points, e.trim().to_string());
        }
        self.project.entry_points = entry_points;
    }
}

// ─── Themes & Merge Result ──────────────────────────────────────────────────

/// An area the merge step says is not covered yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Theme {
    #[serde(deserialize_with = "null_as_default")]
    pub theme: String,
    #[serde(deserialize_with = "null_as_default")]
    pub description: String,
    #[serde(deserialize_with = "null_as_default")]
    pub hints: BTreeSet<String>,
}

impl Theme {
    pub fn new(theme: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            theme: theme.into(),
            description: description.into(),
            hints: BTreeSet::new(),
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hints.insert(hint.into());
        self
    }

    pub fn normalize(&mut self) {
        self.theme = normalize_slug(&self.theme);
        self.hints = self
            .hints
            .iter()
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .collect();
    }
}

/// Fold `incoming` into a deduplicated worklist. Matching themes union hints.
pub fn merge_themes(worklist: &mut Vec<Theme>, incoming: impl IntoIterator<Item = Theme>) {
    for mut theme in incoming {
        theme.normalize();
        if theme.theme.is_empty() {
            continue;
        }
        match worklist.iter_mut().find(|t| t.theme == theme.theme) {
            Some(existing) => {
                fill_if_empty(&mut existing.description, &theme.description);
                existing.hints.extend(theme.hints);
            }
            None => worklist.push(theme),
        }
    }
}

/// One parsed merge response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeResult {
    pub graph: DiscoveryGraph,
    #[serde(default)]
    pub new_themes: Vec<Theme>,
    pub converged: bool,
    #[serde(default)]
    pub coverage: f64,
    #[serde(default)]
    pub reason: String,
}
