use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// A fully-qualified three-tier category, broad to specific.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CategoryPath {
    pub tier1: String,
    pub tier2: String,
    pub tier3: String,
}

impl CategoryPath {
    pub fn new(tier1: &str, tier2: &str, tier3: &str) -> Self {
        CategoryPath {
            tier1: tier1.to_string(),
            tier2: tier2.to_string(),
            tier3: tier3.to_string(),
        }
    }
}

impl fmt::Display for CategoryPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} > {} > {}", self.tier1, self.tier2, self.tier3)
    }
}

/// Parses the display form, `Tier1 > Tier2 > Tier3`.
impl FromStr for CategoryPath {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split('>').map(str::trim).collect();
        match parts.as_slice() {
            [t1, t2, t3] if !t1.is_empty() && !t2.is_empty() && !t3.is_empty() => Ok(CategoryPath::new(t1, t2, t3)),
            _ => Err(format!("Expected 'Tier1 > Tier2 > Tier3', got '{s}'")),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaxonomyError {
    #[error("Failed to parse category tree: {0}")]
    Parse(String),
    #[error("Duplicate category '{name}' under '{parent}'")]
    Duplicate { parent: String, name: String },
    #[error("Empty category name under '{0}'")]
    EmptyName(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier2Node {
    pub name: String,
    #[serde(default, rename = "tier3")]
    pub leaves: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tier1Node {
    pub name: String,
    #[serde(default, rename = "tier2")]
    pub children: Vec<Tier2Node>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TreeFile {
    #[serde(default)]
    tier1: Vec<Tier1Node>,
}

/// Read-only three-level taxonomy. Sibling names are unique at every level.
#[derive(Debug, Clone, Default)]
pub struct CategoryTree {
    roots: Vec<Tier1Node>,
}

impl CategoryTree {
    pub fn new(roots: Vec<Tier1Node>) -> Result<Self, TaxonomyError> {
        let tree = CategoryTree { roots };
        tree.validate()?;
        Ok(tree)
    }

    pub fn from_toml(content: &str) -> Result<Self, TaxonomyError> {
        let file: TreeFile =
            toml::from_str(content).map_err(|e| TaxonomyError::Parse(e.to_string()))?;
        Self::new(file.tier1)
    }

    fn validate(&self) -> Result<(), TaxonomyError> {
        check_unique("<root>", self.roots.iter().map(|n| n.name.as_str()))?;
        for t1 in &self.roots {
            check_unique(&t1.name, t1.children.iter().map(|n| n.name.as_str()))?;
            for t2 in &t1.children {
                let parent = format!("{} > {}", t1.name, t2.name);
                check_unique(&parent, t2.leaves.iter().map(String::as_str))?;
            }
        }
        Ok(())
    }

    pub fn roots(&self) -> &[Tier1Node] {
        &self.roots
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// True if `path` names an existing leaf. Comparison is exact.
    pub fn contains(&self, path: &CategoryPath) -> bool {
        self.roots
            .iter()
            .filter(|t1| t1.name == path.tier1)
            .flat_map(|t1| t1.children.iter())
            .filter(|t2| t2.name == path.tier2)
            .any(|t2| t2.leaves.iter().any(|l| *l == path.tier3))
    }

    /// Inserts `path` if absent, creating intermediate nodes as needed.
    pub fn ensure(&mut self, path: &CategoryPath) {
        let i = match self.roots.iter().position(|n| n.name == path.tier1) {
            Some(i) => i,
            None => {
                self.roots.push(Tier1Node { name: path.tier1.clone(), children: Vec::new() });
                self.roots.len() - 1
            }
        };
        let t1 = &mut self.roots[i];
        let j = match t1.children.iter().position(|n| n.name == path.tier2) {
            Some(j) => j,
            None => {
                t1.children.push(Tier2Node { name: path.tier2.clone(), leaves: Vec::new() });
                t1.children.len() - 1
            }
        };
        let t2 = &mut t1.children[j];
        if !t2.leaves.contains(&path.tier3) {
            t2.leaves.push(path.tier3.clone());
        }
    }

    /// Indented plain-text rendering, one tier2 per line with its leaves.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        for t1 in &self.roots {
            out.push_str(&t1.name);
            out.push_str(":\n");
            for t2 in &t1.children {
                out.push_str(&format!("  - {}: {}\n", t2.name, t2.leaves.join(", ")));
            }
        }
        out
    }
}

fn check_unique<'a>(
    parent: &str,
    names: impl Iterator<Item = &'a str>,
) -> Result<(), TaxonomyError> {
    let mut seen = HashSet::new();
    for name in names {
        if name.trim().is_empty() {
            return Err(TaxonomyError::EmptyName(parent.to_string()));
        }
        if !seen.insert(name) {
            return Err(TaxonomyError::Duplicate {
                parent: parent.to_string(),
                name: name.to_string(),
            });
        }
    }
    Ok(())
}

/// Leaves the categorization engine assigns on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedCategories {
    pub internal_transfer: CategoryPath,
    pub needs_review: CategoryPath,
}

impl Default for ReservedCategories {
    fn default() -> Self {
        ReservedCategories {
            internal_transfer: CategoryPath::new("Transfers", "Internal Transfer", "Between Own Accounts"),
            needs_review: CategoryPath::new("Uncategorized", "Needs Review", "Unknown Transaction"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TREE: &str = r#"
        [[tier1]]
        name = "Living"
        [[tier1.tier2]]
        name = "Groceries"
        tier3 = ["Supermarket", "Bakery"]
        [[tier1.tier2]]
        name = "Housing"
        tier3 = ["Rent"]

        [[tier1]]
        name = "Income"
        [[tier1.tier2]]
        name = "Salary"
        tier3 = ["Monthly"]
    "#;

    #[test]
    fn parses_and_looks_up_leaves() {
        let tree = CategoryTree::from_toml(TREE).unwrap();
        assert!(tree.contains(&CategoryPath::new("Living", "Groceries", "Bakery")));
        assert!(!tree.contains(&CategoryPath::new("Living", "Groceries", "Rent")));
        assert!(!tree.contains(&CategoryPath::new("Income", "Housing", "Rent")));
    }

    #[test]
    fn category_path_parses_display_form() {
        let path: CategoryPath = " Living >Groceries>  Bakery ".parse().unwrap();
        assert_eq!(path, CategoryPath::new("Living", "Groceries", "Bakery"));
        assert_eq!(path.to_string().parse::<CategoryPath>().unwrap(), path);
        assert!("Living > Groceries".parse::<CategoryPath>().is_err());
        assert!("Living > > Bakery".parse::<CategoryPath>().is_err());
        assert!("a > b > c > d".parse::<CategoryPath>().is_err());
    }

    #[test]
    fn duplicate_sibling_rejected() {
        let bad = r#"
            [[tier1]]
            name = "Living"
            [[tier1.tier2]]
            name = "Groceries"
            tier3 = ["Bakery", "Bakery"]
        "#;
        assert_eq!(
            CategoryTree::from_toml(bad).unwrap_err(),
            TaxonomyError::Duplicate { parent: "Living > Groceries".into(), name: "Bakery".into() }
        );
    }

    #[test]
    fn same_name_under_different_parents_is_fine() {
        let ok = r#"
            [[tier1]]
            name = "A"
            [[tier1.tier2]]
            name = "Other"
            tier3 = ["Other"]
            [[tier1]]
            name = "B"
            [[tier1.tier2]]
            name = "Other"
            tier3 = ["Other"]
        "#;
        assert!(CategoryTree::from_toml(ok).is_ok());
    }

    #[test]
    fn ensure_inserts_reserved_leaf_once() {
        let mut tree = CategoryTree::from_toml(TREE).unwrap();
        let reserved = ReservedCategories::default();
        tree.ensure(&reserved.needs_review);
        tree.ensure(&reserved.needs_review);
        assert!(tree.contains(&reserved.needs_review));
        assert_eq!(tree.roots().len(), 3);
    }

    #[test]
    fn summary_lists_every_leaf() {
        let tree = CategoryTree::from_toml(TREE).unwrap();
        let summary = tree.summary();
        assert!(summary.contains("Living:\n"));
        assert!(summary.contains("  - Groceries: Supermarket, Bakery\n"));
    }
}
