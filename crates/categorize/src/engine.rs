use fincon_core::{CategoryPath, CategoryTree, Provenance, ReservedCategories, Transaction};
use governor::clock::{Clock, DefaultClock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::ai::{fingerprint, AiVerdict, Classifier};
use crate::learning::LearningLoop;
use crate::limiter::AiRateLimiter;
use crate::rules::{CategorizationRule, RuleBook, RuleOrigin};
use crate::transfer::TransferDetector;

/// Decision stages, evaluated in order. The needs-review leaf is the implicit terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    InternalTransfer,
    Rules,
    Ai,
}

pub const DEFAULT_STAGES: [Stage; 3] = [Stage::InternalTransfer, Stage::Rules, Stage::Ai];

#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Decided {
        category: CategoryPath,
        provenance: Provenance,
        confidence: Option<u8>,
        owner: Option<String>,
    },
    PassThrough,
}

/// `categorize_batch` stopped between rows. The first `processed` rows keep
/// their decisions.
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
#[error("Categorization cancelled after {processed} rows")]
pub struct Cancelled {
    pub processed: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategorizeStats {
    pub internal_transfer: usize,
    pub manual_rule: usize,
    pub learned: usize,
    pub ai: usize,
    pub uncategorized: usize,
    pub ai_calls: usize,
    pub ai_cache_hits: usize,
    pub ai_failures: usize,
}

impl CategorizeStats {
    fn count(&mut self, provenance: Provenance) {
        match provenance {
            Provenance::InternalTransfer => self.internal_transfer += 1,
            Provenance::ManualRule => self.manual_rule += 1,
            Provenance::Learned => self.learned += 1,
            Provenance::Ai => self.ai += 1,
            Provenance::Uncategorized => self.uncategorized += 1,
        }
    }

    /// Adds the counts of a later batch.
    pub fn absorb(&mut self, other: CategorizeStats) {
        self.internal_transfer += other.internal_transfer;
        self.manual_rule += other.manual_rule;
        self.learned += other.learned;
        self.ai += other.ai;
        self.uncategorized += other.uncategorized;
        self.ai_calls += other.ai_calls;
        self.ai_cache_hits += other.ai_cache_hits;
        self.ai_failures += other.ai_failures;
    }
}

pub struct CategorizationEngine<C: Clock = DefaultClock> {
    tree: CategoryTree,
    reserved: ReservedCategories,
    stages: Vec<Stage>,
    transfers: TransferDetector,
    rules: Arc<RuleBook>,
    classifier: Option<Arc<dyn Classifier>>,
    limiter: Arc<AiRateLimiter<C>>,
    threshold: u8,
    ai_cache: Mutex<HashMap<String, AiVerdict>>,
    learning: Option<Arc<LearningLoop>>,
}

impl<C: Clock> CategorizationEngine<C> {
    /// The reserved leaves are added to `tree` if it lacks them.
    pub fn new(
        mut tree: CategoryTree,
        rules: Arc<RuleBook>,
        transfers: TransferDetector,
        limiter: Arc<AiRateLimiter<C>>,
    ) -> Self {
        let reserved = ReservedCategories::default();
        tree.ensure(&reserved.internal_transfer);
        tree.ensure(&reserved.needs_review);
        Self {
            tree,
            reserved,
            stages: DEFAULT_STAGES.to_vec(),
            transfers,
            rules,
            classifier: None,
            limiter,
            threshold: 75,
            ai_cache: Mutex::new(HashMap::new()),
            learning: None,
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn Classifier>, threshold: u8) -> Self {
        self.classifier = Some(classifier);
        self.threshold = threshold;
        self
    }

    pub fn with_learning(mut self, learning: Arc<LearningLoop>) -> Self {
        self.learning = Some(learning);
        self
    }

    pub fn tree(&self) -> &CategoryTree {
        &self.tree
    }

    /// Feeds a manual correction into learning. Returns false when `category`
    /// is not a leaf of the tree.
    pub fn record_correction(&self, description: &str, category: &CategoryPath) -> bool {
        if !self.tree.contains(category) {
            return false;
        }
        if let Some(learning) = &self.learning {
            learning.record_correction(description, category);
        }
        true
    }

    /// Assigns a category to every transaction. Same-day pairing looks across
    /// the whole slice, so pass same-day transactions together. `cancel` is
    /// checked before each row.
    pub async fn categorize_batch(
        &self,
        batch: &mut [Transaction],
        ai_enabled: bool,
        cancel: &CancellationToken,
    ) -> Result<CategorizeStats, Cancelled> {
        let paired = self.transfers.pair_same_day(batch);
        let mut stats = CategorizeStats::default();

        for (i, tx) in batch.iter_mut().enumerate() {
            if cancel.is_cancelled() {
                return Err(Cancelled { processed: i });
            }
            let decision = self.decide(tx, paired.contains(&i), ai_enabled, &mut stats).await;
            let Decision::Decided { category, provenance, confidence, owner } = decision else {
                continue;
            };
            debug!(id = %tx.id, %category, %provenance, "Categorized");
            tx.assign(category, provenance, confidence);
            if owner.is_some() {
                tx.owner = owner;
            }
            stats.count(provenance);
        }

        info!(
            "Categorized {} transactions: {} transfers, {} by rule, {} learned, {} by AI, {} uncategorized",
            batch.len(),
            stats.internal_transfer,
            stats.manual_rule,
            stats.learned,
            stats.ai,
            stats.uncategorized
        );
        Ok(stats)
    }

    /// Runs the stages for one transaction. Always returns `Decided`.
    pub async fn decide(
        &self,
        tx: &Transaction,
        paired: bool,
        ai_enabled: bool,
        stats: &mut CategorizeStats,
    ) -> Decision {
        for stage in &self.stages {
            let decision = match stage {
                Stage::InternalTransfer => self.transfer_stage(tx, paired),
                Stage::Rules => self.rule_stage(tx),
                Stage::Ai if ai_enabled => self.ai_stage(tx, stats).await,
                Stage::Ai => Decision::PassThrough,
            };
            if decision != Decision::PassThrough {
                return decision;
            }
        }
        Decision::Decided {
            category: self.reserved.needs_review.clone(),
            provenance: Provenance::Uncategorized,
            confidence: None,
            owner: None,
        }
    }

    fn transfer_stage(&self, tx: &Transaction, paired: bool) -> Decision {
        if paired || self.transfers.is_transfer(tx) {
            Decision::Decided {
                category: self.reserved.internal_transfer.clone(),
                provenance: Provenance::InternalTransfer,
                confidence: None,
                owner: None,
            }
        } else {
            Decision::PassThrough
        }
    }

    fn rule_stage(&self, tx: &Transaction) -> Decision {
        let Some(rule) = self.rules.find_matching_rule(tx) else {
            return Decision::PassThrough;
        };
        let provenance = match rule.origin {
            RuleOrigin::Manual => Provenance::ManualRule,
            RuleOrigin::Learned => Provenance::Learned,
        };
        Decision::Decided {
            category: rule.category,
            provenance,
            confidence: None,
            owner: rule.owner,
        }
    }

    async fn ai_stage(&self, tx: &Transaction, stats: &mut CategorizeStats) -> Decision {
        let Some(classifier) = &self.classifier else {
            return Decision::PassThrough;
        };

        let key = fingerprint(tx);
        let cached = self
            .ai_cache
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&key)
            .cloned();

        let verdict = match cached {
            Some(verdict) => {
                stats.ai_cache_hits += 1;
                verdict
            }
            None => {
                if !self.limiter.try_acquire() {
                    debug!(id = %tx.id, "AI rate limit reached, skipping");
                    stats.ai_failures += 1;
                    return Decision::PassThrough;
                }
                stats.ai_calls += 1;
                match classifier.classify(tx, &self.tree).await {
                    Ok(verdict) => {
                        self.ai_cache
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner())
                            .insert(key, verdict.clone());
                        verdict
                    }
                    Err(e) => {
                        warn!(id = %tx.id, "AI categorization failed: {e}");
                        stats.ai_failures += 1;
                        return Decision::PassThrough;
                    }
                }
            }
        };

        if verdict.confidence < self.threshold {
            debug!(id = %tx.id, "AI confidence {} below threshold {}", verdict.confidence, self.threshold);
            return Decision::PassThrough;
        }
        if !self.tree.contains(&verdict.category) {
            warn!(id = %tx.id, "AI proposed unknown category {}", verdict.category);
            return Decision::PassThrough;
        }
        if let Some(learning) = &self.learning {
            learning.record(tx, &verdict.category);
        }
        Decision::Decided {
            category: verdict.category,
            provenance: Provenance::Ai,
            confidence: Some(verdict.confidence),
            owner: None,
        }
    }

    /// Promotes recurring AI verdicts into the live rule book.
    pub fn promote_learned(&self) -> Vec<CategorizationRule> {
        self.learning
            .as_ref()
            .map(|l| l.promote(&self.rules))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::AiError;
    use crate::learning::LearningConfig;
    use crate::rules::tests::{make_rule, make_tx, tree};
    use crate::transfer::TransferConfig;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio_util::sync::CancellationToken;

    struct FixedClassifier {
        verdict: AiVerdict,
        calls: AtomicUsize,
    }

    impl FixedClassifier {
        fn new(category: CategoryPath, confidence: u8) -> Arc<Self> {
            Arc::new(Self { verdict: AiVerdict { category, confidence }, calls: AtomicUsize::new(0) })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Classifier for FixedClassifier {
        async fn classify(&self, _tx: &Transaction, _tree: &CategoryTree) -> Result<AiVerdict, AiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.verdict.clone())
        }
    }

    struct FailingClassifier;

    #[async_trait]
    impl Classifier for FailingClassifier {
        async fn classify(&self, _tx: &Transaction, _tree: &CategoryTree) -> Result<AiVerdict, AiError> {
            Err(AiError::Timeout)
        }
    }

    fn music() -> CategoryPath {
        CategoryPath::new("Subscriptions", "Media", "Music")
    }

    fn engine(rules: Vec<CategorizationRule>, per_minute: u32) -> CategorizationEngine {
        let transfers = TransferDetector::new(&TransferConfig {
            own_accounts: vec!["2900123456/2010".into()],
            ..Default::default()
        });
        CategorizationEngine::new(
            tree(),
            Arc::new(RuleBook::new(rules, &tree()).unwrap()),
            transfers,
            Arc::new(AiRateLimiter::new(per_minute, 1000)),
        )
    }

    fn batch(n: usize) -> Vec<Transaction> {
        (0..n).map(|i| make_tx(&format!("merchant {}", ["alpha", "beta", "gamma", "delta", "omega"][i % 5]), "-100")).collect()
    }

    #[tokio::test]
    async fn internal_transfer_beats_matching_rule() {
        let rule = make_rule("savings", "savings", music(), 100);
        let engine = engine(vec![rule], 10);
        let mut tx = make_tx("Savings deposit", "-5000");
        tx.counterparty.account = Some("2900123456/2010".into());

        let stats = engine.categorize_batch(std::slice::from_mut(&mut tx), false, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.internal_transfer, 1);
        assert_eq!(tx.provenance, Provenance::InternalTransfer);
        assert!(tx.is_internal_transfer);
        assert_eq!(tx.category, Some(ReservedCategories::default().internal_transfer));
    }

    #[tokio::test]
    async fn rule_owner_and_learned_provenance_are_applied() {
        let mut manual = make_rule("spotify", "spotify", music(), 10);
        manual.owner = Some("Alice".into());
        let mut learned = make_rule("learned: lidl", "lidl", CategoryPath::new("Living", "Groceries", "Supermarket"), 50);
        learned.origin = RuleOrigin::Learned;
        let engine = engine(vec![manual, learned], 10);

        let mut txs = vec![make_tx("SPOTIFY P123", "-199"), make_tx("LIDL PRAHA", "-420")];
        let stats = engine.categorize_batch(&mut txs, false, &CancellationToken::new()).await.unwrap();
        assert_eq!(txs[0].provenance, Provenance::ManualRule);
        assert_eq!(txs[0].owner.as_deref(), Some("Alice"));
        assert_eq!(txs[1].provenance, Provenance::Learned);
        assert_eq!((stats.manual_rule, stats.learned), (1, 1));
    }

    #[tokio::test]
    async fn rate_limit_ceiling_sends_nothing_beyond_quota() {
        let classifier = FixedClassifier::new(music(), 90);
        let engine = engine(Vec::new(), 2).with_classifier(classifier.clone(), 75);

        let mut txs = batch(5);
        let stats = engine.categorize_batch(&mut txs, true, &CancellationToken::new()).await.unwrap();
        assert_eq!(classifier.calls(), 2);
        assert_eq!(stats.ai, 2);
        assert_eq!(stats.uncategorized, 3);
        assert_eq!(stats.ai_failures, 3);
        let needs_review = ReservedCategories::default().needs_review;
        assert!(txs[2..].iter().all(|t| t.category.as_ref() == Some(&needs_review)));
    }

    #[tokio::test]
    async fn ai_disabled_for_upload_makes_no_calls() {
        let classifier = FixedClassifier::new(music(), 90);
        let engine = engine(Vec::new(), 10).with_classifier(classifier.clone(), 75);
        let stats = engine.categorize_batch(&mut batch(3), false, &CancellationToken::new()).await.unwrap();
        assert_eq!(classifier.calls(), 0);
        assert_eq!(stats.uncategorized, 3);
    }

    #[tokio::test]
    async fn low_confidence_and_unknown_categories_fall_through() {
        let low = FixedClassifier::new(music(), 60);
        let engine_low = engine(Vec::new(), 10).with_classifier(low, 75);
        let mut txs = batch(1);
        engine_low.categorize_batch(&mut txs, true, &CancellationToken::new()).await.unwrap();
        assert_eq!(txs[0].provenance, Provenance::Uncategorized);

        let unknown = FixedClassifier::new(CategoryPath::new("Living", "Groceries", "Caviar"), 99);
        let engine_unknown = engine(Vec::new(), 10).with_classifier(unknown, 75);
        let mut txs = batch(1);
        engine_unknown.categorize_batch(&mut txs, true, &CancellationToken::new()).await.unwrap();
        assert_eq!(txs[0].provenance, Provenance::Uncategorized);
    }

    #[tokio::test]
    async fn failures_fall_through_to_uncategorized() {
        let engine = engine(Vec::new(), 10).with_classifier(Arc::new(FailingClassifier), 75);
        let stats = engine.categorize_batch(&mut batch(2), true, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.ai_failures, 2);
        assert_eq!(stats.uncategorized, 2);
    }

    #[tokio::test]
    async fn verdicts_are_cached_by_fingerprint() {
        let classifier = FixedClassifier::new(music(), 90);
        let engine = engine(Vec::new(), 10).with_classifier(classifier.clone(), 75);
        let mut txs = vec![make_tx("SPOTIFY", "-199.00"), make_tx("spotify", "-199.20")];
        let stats = engine.categorize_batch(&mut txs, true, &CancellationToken::new()).await.unwrap();
        assert_eq!(classifier.calls(), 1);
        assert_eq!(stats.ai_cache_hits, 1);
        assert_eq!(txs[1].confidence, Some(90));
    }

    #[tokio::test]
    async fn accepted_verdicts_feed_learning() {
        let classifier = FixedClassifier::new(music(), 90);
        let learning = Arc::new(LearningLoop::new(&LearningConfig::default()));
        let engine = engine(Vec::new(), 10)
            .with_classifier(classifier, 75)
            .with_learning(learning);

        let mut txs: Vec<_> = (0..3).map(|i| make_tx(&format!("SPOTIFY P{i}"), &format!("-{}", 100 + i * 10))).collect();
        engine.categorize_batch(&mut txs, true, &CancellationToken::new()).await.unwrap();
        let promoted = engine.promote_learned();
        assert_eq!(promoted.len(), 1);

        let mut next = vec![make_tx("Spotify P77", "-555")];
        let stats = engine.categorize_batch(&mut next, true, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.learned, 1);
        assert!(engine.promote_learned().is_empty());
    }

    #[tokio::test]
    async fn minute_ceiling_holds_while_the_clock_runs() {
        use governor::clock::FakeRelativeClock;
        use std::time::Duration;

        let clock = FakeRelativeClock::default();
        let limiter = Arc::new(AiRateLimiter::with_clock(3, 1000, clock.clone()));
        let classifier = FixedClassifier::new(music(), 90);
        let engine = CategorizationEngine::new(
            tree(),
            Arc::new(RuleBook::default()),
            TransferDetector::new(&TransferConfig::default()),
            limiter,
        );
        let engine = engine.with_classifier(classifier.clone(), 75);

        // Distinct amounts so the verdict cache never answers.
        for second in 0..60 {
            let mut tx = vec![make_tx("shop", &format!("-{}", 10 + second))];
            engine.categorize_batch(&mut tx, true, &CancellationToken::new()).await.unwrap();
            clock.advance(Duration::from_secs(1));
        }
        assert_eq!(classifier.calls(), 3);
    }

    #[tokio::test]
    async fn cancellation_stops_between_rows() {
        let classifier = FixedClassifier::new(music(), 90);
        let engine = engine(Vec::new(), 10).with_classifier(classifier.clone(), 75);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let mut txs = batch(3);
        let result = engine.categorize_batch(&mut txs, true, &cancel).await;
        assert_eq!(result, Err(Cancelled { processed: 0 }));
        assert_eq!(classifier.calls(), 0);
        assert!(txs.iter().all(|t| t.category.is_none()));
    }

    #[tokio::test]
    async fn corrections_reach_learning_only_for_known_leaves() {
        let learning = Arc::new(LearningLoop::new(&LearningConfig { min_occurrences: 2, ..Default::default() }));
        let engine = engine(Vec::new(), 10).with_learning(learning.clone());

        assert!(!engine.record_correction("PEKARNA 1", &CategoryPath::new("Living", "Groceries", "Caviar")));
        assert!(engine.record_correction("PEKARNA 1", &music()));
        assert!(engine.record_correction("pekarna 2", &music()));
        assert_eq!(engine.promote_learned().len(), 1);
    }

    #[tokio::test]
    async fn same_day_pairs_are_transfers() {
        let transfers = TransferDetector::new(&TransferConfig { same_day_pairing: true, ..Default::default() });
        let engine = CategorizationEngine::new(
            tree(),
            Arc::new(RuleBook::default()),
            transfers,
            Arc::new(AiRateLimiter::new(10, 1000)),
        );
        let out = make_tx("to revolut", "-300");
        let mut inc = make_tx("top-up", "300");
        inc.account = Some("REVOLUT".into());
        let mut txs = vec![out, inc];
        let stats = engine.categorize_batch(&mut txs, false, &CancellationToken::new()).await.unwrap();
        assert_eq!(stats.internal_transfer, 2);
    }
}
