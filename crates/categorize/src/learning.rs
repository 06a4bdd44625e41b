use fincon_core::{CategoryPath, Transaction};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::rules::{CategorizationRule, RuleBook, RuleConditions, RuleOrigin};
use crate::text::description_pattern;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    pub enabled: bool,
    /// Occurrences of one (pattern, category) pairing before a rule is synthesized.
    pub min_occurrences: u32,
    pub priority: i32,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self { enabled: true, min_occurrences: 3, priority: 50 }
    }
}

/// Tallies confident categorizations per description pattern and turns
/// recurring pairings into learned rules.
#[derive(Debug)]
pub struct LearningLoop {
    min_occurrences: u32,
    priority: i32,
    tallies: Mutex<HashMap<String, HashMap<CategoryPath, u32>>>,
}

impl LearningLoop {
    pub fn new(config: &LearningConfig) -> Self {
        Self {
            min_occurrences: config.min_occurrences.max(1),
            priority: config.priority,
            tallies: Mutex::new(HashMap::new()),
        }
    }

    /// Counts an accepted AI verdict.
    pub fn record(&self, tx: &Transaction, category: &CategoryPath) {
        self.count(&tx.description, category);
    }

    /// Counts a manual correction of a transaction with `description`.
    /// Corrections weigh the same as AI verdicts.
    pub fn record_correction(&self, description: &str, category: &CategoryPath) {
        self.count(description, category);
    }

    fn count(&self, description: &str, category: &CategoryPath) {
        let Some(pattern) = description_pattern(description) else { return };
        let mut tallies = self.tallies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *tallies.entry(pattern).or_default().entry(category.clone()).or_insert(0) += 1;
    }

    /// Synthesizes rules for pairings seen at least `min_occurrences` times and
    /// installs them into `book`. Returns only rules that were actually added.
    pub fn promote(&self, book: &RuleBook) -> Vec<CategorizationRule> {
        let candidates = {
            let tallies = self.tallies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let mut candidates: Vec<(String, CategoryPath)> = tallies
                .iter()
                .filter_map(|(pattern, counts)| {
                    // Most frequent category for the pattern; ties go to the first by name.
                    let (category, count) = counts
                        .iter()
                        .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.to_string().cmp(&a.0.to_string())))?;
                    (*count >= self.min_occurrences).then(|| (pattern.clone(), category.clone()))
                })
                .collect();
            candidates.sort_by(|a, b| a.0.cmp(&b.0));
            candidates
        };

        let mut added = Vec::new();
        for (pattern, category) in candidates {
            let rule = CategorizationRule {
                id: None,
                name: format!("learned: {pattern}"),
                priority: self.priority,
                when: RuleConditions { description_contains: Some(pattern), ..Default::default() },
                category,
                owner: None,
                origin: RuleOrigin::Learned,
                active: true,
            };
            if let Err(e) = rule.when.check(&rule.name) {
                warn!("Not promoting pattern: {e}");
                continue;
            }
            if book.install(rule.clone()) {
                info!("Learned rule '{}' -> {}", rule.name, rule.category);
                added.push(rule);
            }
        }
        added
    }

    pub fn tally(&self, description: &str, category: &CategoryPath) -> u32 {
        let Some(pattern) = description_pattern(description) else { return 0 };
        let tallies = self.tallies.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        tallies
            .get(&pattern)
            .and_then(|counts| counts.get(category))
            .copied()
            .unwrap_or(0)
    }
}
