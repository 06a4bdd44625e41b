use fincon_core::{CategoryPath, CategoryTree, Transaction};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::RwLock;
use thiserror::Error;

use crate::text::{account_base, fold};

#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("Failed to parse rules: {0}")]
    Parse(String),
    #[error("Rule '{0}' has no conditions")]
    NoPredicates(String),
    #[error("Rule '{rule}' targets unknown category '{category}'")]
    UnknownCategory { rule: String, category: CategoryPath },
    #[error("Rule '{0}' has amount_min greater than amount_max")]
    InvalidRange(String),
    #[error("Rule '{rule}' has a blank {field} condition")]
    BlankCondition { rule: String, field: &'static str },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleOrigin {
    #[default]
    Manual,
    Learned,
}

impl RuleOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            RuleOrigin::Manual => "manual",
            RuleOrigin::Learned => "learned",
        }
    }
}

impl std::str::FromStr for RuleOrigin {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "manual" => Ok(RuleOrigin::Manual),
            "learned" => Ok(RuleOrigin::Learned),
            other => Err(format!("Unknown rule origin: '{other}'")),
        }
    }
}

/// Predicates of a rule. Every declared predicate must hold.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleConditions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub institution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_account: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub counterparty_name_contains: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variable_symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub type_contains: Option<String>,
    /// Inclusive, compared against the signed original amount.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_min: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount_max: Option<Decimal>,
}

impl RuleConditions {
    pub fn predicate_count(&self) -> usize {
        [
            self.description_contains.is_some(),
            self.institution.is_some(),
            self.counterparty_account.is_some(),
            self.counterparty_name_contains.is_some(),
            self.variable_symbol.is_some(),
            self.type_contains.is_some(),
            self.amount_min.is_some(),
            self.amount_max.is_some(),
        ]
        .into_iter()
        .filter(|declared| *declared)
        .count()
    }

    /// Structural checks that need no taxonomy. A text condition that folds to
    /// nothing would match every transaction.
    pub fn check(&self, rule: &str) -> Result<(), RuleError> {
        if self.predicate_count() == 0 {
            return Err(RuleError::NoPredicates(rule.to_string()));
        }
        let folded = [
            ("description_contains", &self.description_contains),
            ("counterparty_name_contains", &self.counterparty_name_contains),
            ("type_contains", &self.type_contains),
        ];
        let trimmed = [
            ("institution", &self.institution),
            ("counterparty_account", &self.counterparty_account),
            ("variable_symbol", &self.variable_symbol),
        ];
        let blank = folded
            .iter()
            .find(|(_, v)| v.as_deref().is_some_and(|n| fold(n).is_empty()))
            .or_else(|| trimmed.iter().find(|(_, v)| v.as_deref().is_some_and(|n| n.trim().is_empty())));
        if let Some((field, _)) = blank {
            return Err(RuleError::BlankCondition { rule: rule.to_string(), field: *field });
        }
        if let (Some(min), Some(max)) = (self.amount_min, self.amount_max) {
            if min > max {
                return Err(RuleError::InvalidRange(rule.to_string()));
            }
        }
        Ok(())
    }

    pub fn matches(&self, tx: &Transaction) -> bool {
        fn contains(haystack: Option<&str>, needle: &Option<String>) -> bool {
            needle
                .as_ref()
                .map_or(true, |n| haystack.is_some_and(|h| fold(h).contains(&fold(n))))
        }

        if let Some(min) = self.amount_min {
            if tx.amount < min {
                return false;
            }
        }
        if let Some(max) = self.amount_max {
            if tx.amount > max {
                return false;
            }
        }
        if let Some(inst) = &self.institution {
            if !tx.institution.eq_ignore_ascii_case(inst.trim()) {
                return false;
            }
        }
        if let Some(acct) = &self.counterparty_account {
            let acct = acct.trim();
            let Some(theirs) = tx.counterparty.account.as_deref().map(str::trim) else {
                return false;
            };
            let bank_insensitive = !acct.contains('/') && account_base(theirs) == acct;
            if theirs != acct && !bank_insensitive {
                return false;
            }
        }
        if let Some(vs) = &self.variable_symbol {
            let ours = tx.symbols.variable_symbol.as_deref().map(|s| s.trim().trim_start_matches('0'));
            if ours != Some(vs.trim().trim_start_matches('0')) {
                return false;
            }
        }

        contains(Some(&tx.description), &self.description_contains)
            && contains(tx.counterparty.name.as_deref(), &self.counterparty_name_contains)
            && contains(tx.transaction_type.as_deref(), &self.type_contains)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategorizationRule {
    /// Store key, absent for rules read from the rules file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub name: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub when: RuleConditions,
    #[serde(flatten)]
    pub category: CategoryPath,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(default)]
    pub origin: RuleOrigin,
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl CategorizationRule {
    pub fn validate(&self, tree: &CategoryTree) -> Result<(), RuleError> {
        self.when.check(&self.name)?;
        if !tree.contains(&self.category) {
            return Err(RuleError::UnknownCategory {
                rule: self.name.clone(),
                category: self.category.clone(),
            });
        }
        Ok(())
    }

    /// Same conditions and same target, regardless of name, priority or origin.
    pub fn is_equivalent(&self, other: &CategorizationRule) -> bool {
        self.category == other.category && self.owner == other.owner && same_conditions(&self.when, &other.when)
    }
}

fn same_conditions(a: &RuleConditions, b: &RuleConditions) -> bool {
    let folded = |v: &Option<String>| v.as_deref().map(fold);
    folded(&a.description_contains) == folded(&b.description_contains)
        && folded(&a.counterparty_name_contains) == folded(&b.counterparty_name_contains)
        && folded(&a.type_contains) == folded(&b.type_contains)
        && a.institution.as_deref().map(str::to_lowercase) == b.institution.as_deref().map(str::to_lowercase)
        && a.counterparty_account == b.counterparty_account
        && a.variable_symbol == b.variable_symbol
        && a.amount_min == b.amount_min
        && a.amount_max == b.amount_max
}

#[derive(Debug, Default, Deserialize)]
struct RulesFile {
    #[serde(default)]
    rule: Vec<CategorizationRule>,
}

/// Priority-ordered rule set shared between the engine and the learning loop.
#[derive(Debug, Default)]
pub struct RuleBook {
    rules: RwLock<Vec<CategorizationRule>>,
}

impl RuleBook {
    /// Validates every rule against `tree`. Inactive rules are kept but never match.
    pub fn new(rules: Vec<CategorizationRule>, tree: &CategoryTree) -> Result<Self, RuleError> {
        for rule in &rules {
            rule.validate(tree)?;
        }
        let mut rules = rules;
        // Highest priority first; ties keep declaration order.
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(Self { rules: RwLock::new(rules) })
    }

    pub fn from_toml(content: &str, tree: &CategoryTree) -> Result<Self, RuleError> {
        let file: RulesFile = toml::from_str(content).map_err(|e| RuleError::Parse(e.to_string()))?;
        Self::new(file.rule, tree)
    }

    pub fn find_matching_rule(&self, tx: &Transaction) -> Option<CategorizationRule> {
        self.read()
            .iter()
            .find(|r| r.active && r.when.matches(tx))
            .cloned()
    }

    /// Adds `rule` unless an equivalent one exists. Returns whether it was added.
    pub fn install(&self, rule: CategorizationRule) -> bool {
        let mut rules = match self.rules.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if rules.iter().any(|r| r.is_equivalent(&rule)) {
            return false;
        }
        let at = rules
            .iter()
            .position(|r| r.priority < rule.priority)
            .unwrap_or(rules.len());
        rules.insert(at, rule);
        true
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn snapshot(&self) -> Vec<CategorizationRule> {
        self.read().clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<CategorizationRule>> {
        self.rules.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
