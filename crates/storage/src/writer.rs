use fincon_categorize::CategorizationRule;
use fincon_core::Transaction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::error::{StoreError, WriteError};
use crate::store::{DimensionIds, TransactionStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteMode {
    /// Existing identifiers are left untouched.
    #[default]
    Append,
    /// Existing identifiers are replaced.
    Overwrite,
}

impl std::str::FromStr for WriteMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "append" => Ok(WriteMode::Append),
            "overwrite" => Ok(WriteMode::Overwrite),
            other => Err(format!("Unknown write mode '{other}' (expected append or overwrite)")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub added: usize,
    pub updated: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Outcome {
    Added,
    Updated,
    Skipped,
}

/// Per-batch memo of dimension keys, so each entity is looked up once.
#[derive(Default)]
struct DimensionMemo {
    institutions: HashMap<String, i64>,
    owners: HashMap<String, i64>,
    accounts: HashMap<(i64, String), i64>,
}

impl DimensionMemo {
    async fn resolve(&mut self, store: &dyn TransactionStore, tx: &Transaction) -> Result<DimensionIds, StoreError> {
        let institution = match self.institutions.get(&tx.institution) {
            Some(id) => *id,
            None => {
                let id = store.institution_id(&tx.institution).await?;
                self.institutions.insert(tx.institution.clone(), id);
                id
            }
        };

        let owner = match tx.owner.as_deref().map(str::trim).filter(|o| !o.is_empty()) {
            Some(name) => Some(match self.owners.get(name) {
                Some(id) => *id,
                None => {
                    let id = store.owner_id(name).await?;
                    self.owners.insert(name.to_string(), id);
                    id
                }
            }),
            None => None,
        };

        let account = match tx.account.as_deref().map(str::trim).filter(|a| !a.is_empty()) {
            Some(number) => {
                let key = (institution, number.to_string());
                Some(match self.accounts.get(&key) {
                    Some(id) => *id,
                    None => {
                        let id = store.account_id(institution, number, owner).await?;
                        self.accounts.insert(key, id);
                        id
                    }
                })
            }
            None => None,
        };

        Ok(DimensionIds { institution, account, owner })
    }
}

/// Row-at-a-time writer for one upload. Dimension lookups are memoized for
/// its whole lifetime, so a file written in chunks resolves each entity once.
pub struct BatchWriter<'a> {
    store: &'a dyn TransactionStore,
    mode: WriteMode,
    memo: DimensionMemo,
    summary: WriteSummary,
}

impl<'a> BatchWriter<'a> {
    /// Fails only when the store is unreachable.
    pub async fn open(store: &'a dyn TransactionStore, mode: WriteMode) -> Result<Self, WriteError> {
        store.ping().await.map_err(WriteError::Unavailable)?;
        Ok(Self { store, mode, memo: DimensionMemo::default(), summary: WriteSummary::default() })
    }

    /// Upserts one transaction. A failure is logged and counted, never returned.
    pub async fn write(&mut self, tx: &Transaction) {
        match write_one(self.store, &mut self.memo, tx, self.mode).await {
            Ok(Outcome::Added) => self.summary.added += 1,
            Ok(Outcome::Updated) => self.summary.updated += 1,
            Ok(Outcome::Skipped) => {
                debug!(id = %tx.id, "Already stored, skipping");
                self.summary.skipped += 1;
            }
            Err(e) => {
                warn!(id = %tx.id, "Failed to store transaction: {e}");
                self.summary.failed += 1;
            }
        }
    }

    /// Logs and returns the totals.
    pub fn finish(self) -> WriteSummary {
        let summary = self.summary;
        info!(
            "Stored {} transactions: {} added, {} updated, {} skipped, {} failed",
            summary.added + summary.updated + summary.skipped + summary.failed,
            summary.added,
            summary.updated,
            summary.skipped,
            summary.failed
        );
        summary
    }
}

/// Upserts `txs` by identifier. A failing row is logged and counted; only an
/// unreachable store at batch start fails the whole call.
pub async fn write_transactions(
    store: &dyn TransactionStore,
    txs: &[Transaction],
    mode: WriteMode,
) -> Result<WriteSummary, WriteError> {
    let mut writer = BatchWriter::open(store, mode).await?;
    for tx in txs {
        writer.write(tx).await;
    }
    Ok(writer.finish())
}

async fn write_one(
    store: &dyn TransactionStore,
    memo: &mut DimensionMemo,
    tx: &Transaction,
    mode: WriteMode,
) -> Result<Outcome, StoreError> {
    let exists = store.contains(&tx.id).await?;
    if exists && mode == WriteMode::Append {
        return Ok(Outcome::Skipped);
    }
    let dims = memo.resolve(store, tx).await?;
    if exists {
        store.replace(tx, dims).await?;
        Ok(Outcome::Updated)
    } else {
        store.insert(tx, dims).await?;
        Ok(Outcome::Added)
    }
}

/// Saves rules that have no equivalent in the store yet. Returns how many were saved.
pub async fn persist_rules(store: &dyn TransactionStore, rules: &[CategorizationRule]) -> Result<usize, StoreError> {
    let mut saved = 0;
    for rule in rules {
        if store.rule_exists(rule).await? {
            continue;
        }
        store.save_rule(rule).await?;
        saved += 1;
    }
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_db;
    use crate::store::SqliteStore;
    use crate::testing::sample_tx;
    use async_trait::async_trait;
    use fincon_categorize::{RuleConditions, RuleOrigin};
    use crate::store::CorrectionOutcome;
    use fincon_core::{CategoryPath, Provenance, TransactionId};
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryState {
        rows: HashMap<String, Transaction>,
        institutions: Vec<String>,
        owners: Vec<String>,
        accounts: Vec<(i64, String)>,
        institution_lookups: usize,
        rules: Vec<CategorizationRule>,
    }

    #[derive(Default)]
    struct MemoryStore {
        state: Mutex<MemoryState>,
        fail_on: HashSet<String>,
        down: bool,
    }

    fn position<T: PartialEq>(list: &mut Vec<T>, item: T) -> i64 {
        let idx = match list.iter().position(|x| *x == item) {
            Some(i) => i,
            None => {
                list.push(item);
                list.len() - 1
            }
        };
        idx as i64 + 1
    }

    #[async_trait]
    impl TransactionStore for MemoryStore {
        async fn ping(&self) -> Result<(), StoreError> {
            if self.down {
                return Err(StoreError::Unavailable("connection refused".into()));
            }
            Ok(())
        }

        async fn institution_id(&self, code: &str) -> Result<i64, StoreError> {
            let mut state = self.state.lock().unwrap();
            state.institution_lookups += 1;
            Ok(position(&mut state.institutions, code.to_string()))
        }

        async fn owner_id(&self, name: &str) -> Result<i64, StoreError> {
            Ok(position(&mut self.state.lock().unwrap().owners, name.to_string()))
        }

        async fn account_id(&self, institution: i64, number: &str, _owner: Option<i64>) -> Result<i64, StoreError> {
            Ok(position(&mut self.state.lock().unwrap().accounts, (institution, number.to_string())))
        }

        async fn contains(&self, id: &TransactionId) -> Result<bool, StoreError> {
            Ok(self.state.lock().unwrap().rows.contains_key(id.as_str()))
        }

        async fn insert(&self, tx: &Transaction, _dims: DimensionIds) -> Result<(), StoreError> {
            if self.fail_on.contains(tx.id.as_str()) {
                return Err(StoreError::Unavailable("disk full".into()));
            }
            self.state.lock().unwrap().rows.insert(tx.id.as_str().to_string(), tx.clone());
            Ok(())
        }

        async fn replace(&self, tx: &Transaction, dims: DimensionIds) -> Result<(), StoreError> {
            self.insert(tx, dims).await
        }

        async fn load_rules(&self) -> Result<Vec<CategorizationRule>, StoreError> {
            Ok(self.state.lock().unwrap().rules.clone())
        }

        async fn save_rule(&self, rule: &CategorizationRule) -> Result<i64, StoreError> {
            let mut state = self.state.lock().unwrap();
            state.rules.push(rule.clone());
            Ok(state.rules.len() as i64)
        }

        async fn apply_correction(
            &self,
            id: &TransactionId,
            category: &CategoryPath,
        ) -> Result<CorrectionOutcome, StoreError> {
            let mut state = self.state.lock().unwrap();
            let Some(tx) = state.rows.get_mut(id.as_str()) else {
                return Ok(CorrectionOutcome::NotFound);
            };
            tx.assign(category.clone(), Provenance::ManualRule, None);
            Ok(CorrectionOutcome::Applied { description: tx.description.clone() })
        }

        async fn load_corrections(&self) -> Result<Vec<(String, CategoryPath)>, StoreError> {
            Ok(Vec::new())
        }
    }

    fn batch() -> Vec<Transaction> {
        vec![sample_tx("ALBERT", "-250.50"), sample_tx("LIDL", "-99"), sample_tx("SALARY", "45000")]
    }

    #[tokio::test]
    async fn append_is_idempotent() {
        let store = MemoryStore::default();
        let first = write_transactions(&store, &batch(), WriteMode::Append).await.unwrap();
        assert_eq!(first, WriteSummary { added: 3, ..Default::default() });

        let second = write_transactions(&store, &batch(), WriteMode::Append).await.unwrap();
        assert_eq!(second, WriteSummary { skipped: 3, ..Default::default() });
    }

    #[tokio::test]
    async fn overwrite_replaces_existing_rows() {
        let store = MemoryStore::default();
        write_transactions(&store, &batch()[..1], WriteMode::Append).await.unwrap();
        let summary = write_transactions(&store, &batch(), WriteMode::Overwrite).await.unwrap();
        assert_eq!(summary, WriteSummary { added: 2, updated: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn failing_row_does_not_abort_batch() {
        let txs = batch();
        let store = MemoryStore {
            fail_on: HashSet::from([txs[1].id.as_str().to_string()]),
            ..Default::default()
        };
        let summary = write_transactions(&store, &txs, WriteMode::Append).await.unwrap();
        assert_eq!(summary, WriteSummary { added: 2, failed: 1, ..Default::default() });
    }

    #[tokio::test]
    async fn unavailable_store_fails_batch() {
        let store = MemoryStore { down: true, ..Default::default() };
        let result = write_transactions(&store, &batch(), WriteMode::Append).await;
        assert!(matches!(result, Err(WriteError::Unavailable(_))));
    }

    #[tokio::test]
    async fn dimensions_are_looked_up_once_per_batch() {
        let store = MemoryStore::default();
        let mut txs = batch();
        txs[0].owner = Some("Alice".into());
        txs[1].owner = Some("Alice".into());
        write_transactions(&store, &txs, WriteMode::Append).await.unwrap();
        let state = store.state.lock().unwrap();
        assert_eq!(state.institution_lookups, 1);
        assert_eq!(state.owners, vec!["Alice".to_string()]);
        assert_eq!(state.accounts.len(), 1);
    }

    #[tokio::test]
    async fn chunked_writes_share_one_dimension_memo() {
        let store = MemoryStore::default();
        let txs = batch();
        let mut writer = BatchWriter::open(&store, WriteMode::Append).await.unwrap();
        for chunk in txs.chunks(1) {
            for tx in chunk {
                writer.write(tx).await;
            }
        }
        assert_eq!(writer.finish(), WriteSummary { added: 3, ..Default::default() });
        assert_eq!(store.state.lock().unwrap().institution_lookups, 1);
    }

    #[tokio::test]
    async fn sqlite_reupload_skips_everything() {
        let store = SqliteStore::new(create_memory_db().await.unwrap());
        let mut txs = batch();
        txs[0].owner = Some("Alice".into());

        let first = write_transactions(&store, &txs, WriteMode::Append).await.unwrap();
        assert_eq!(first.added, 3);
        let second = write_transactions(&store, &txs, WriteMode::Append).await.unwrap();
        assert_eq!(second, WriteSummary { skipped: 3, ..Default::default() });
        assert_eq!(store.transaction_count().await.unwrap(), 3);
        assert_eq!(store.dimension_counts().await.unwrap(), (1, 1, 1));
    }

    #[tokio::test]
    async fn persist_rules_skips_equivalents() {
        let store = MemoryStore::default();
        let rule = CategorizationRule {
            id: None,
            name: "learned: lidl".into(),
            priority: 50,
            when: RuleConditions { description_contains: Some("lidl".into()), ..Default::default() },
            category: CategoryPath::new("Living", "Groceries", "Supermarket"),
            owner: None,
            origin: RuleOrigin::Learned,
            active: true,
        };
        assert_eq!(persist_rules(&store, &[rule.clone()]).await.unwrap(), 1);
        assert_eq!(persist_rules(&store, &[rule]).await.unwrap(), 0);
    }
}
