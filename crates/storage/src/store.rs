use async_trait::async_trait;
use fincon_categorize::{CategorizationRule, RuleConditions, RuleOrigin};
use fincon_core::{CategoryPath, Provenance, ReservedCategories, Transaction, TransactionId};
use sqlx::sqlite::SqliteArguments;
use sqlx::Sqlite;

use crate::db::DbPool;
use crate::error::StoreError;

/// Store keys of the dimension rows a transaction references.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DimensionIds {
    pub institution: i64,
    pub account: Option<i64>,
    pub owner: Option<i64>,
}

#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Cheap round trip used before a batch starts.
    async fn ping(&self) -> Result<(), StoreError>;

    async fn institution_id(&self, code: &str) -> Result<i64, StoreError>;

    async fn owner_id(&self, name: &str) -> Result<i64, StoreError>;

    /// Account numbers are unique per institution.
    async fn account_id(&self, institution: i64, number: &str, owner: Option<i64>) -> Result<i64, StoreError>;

    async fn contains(&self, id: &TransactionId) -> Result<bool, StoreError>;

    async fn insert(&self, tx: &Transaction, dims: DimensionIds) -> Result<(), StoreError>;

    async fn replace(&self, tx: &Transaction, dims: DimensionIds) -> Result<(), StoreError>;

    /// Active rules, highest priority first.
    async fn load_rules(&self) -> Result<Vec<CategorizationRule>, StoreError>;

    async fn save_rule(&self, rule: &CategorizationRule) -> Result<i64, StoreError>;

    async fn rule_exists(&self, rule: &CategorizationRule) -> Result<bool, StoreError> {
        Ok(self.load_rules().await?.iter().any(|r| r.is_equivalent(rule)))
    }

    /// Recategorizes a stored transaction by hand and records the correction.
    async fn apply_correction(
        &self,
        id: &TransactionId,
        category: &CategoryPath,
    ) -> Result<CorrectionOutcome, StoreError>;

    /// Every recorded correction as (description, category).
    async fn load_corrections(&self) -> Result<Vec<(String, CategoryPath)>, StoreError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// No transaction with that identifier.
    NotFound,
    /// The transaction was already corrected to this category.
    Unchanged { description: String },
    Applied { description: String },
}

pub struct SqliteStore {
    pool: DbPool,
}

const TRANSACTION_COLUMNS: &str = "id, date, amount, currency, amount_base, exchange_rate, rate_source, \
     description, counterparty_name, counterparty_account, counterparty_bank_code, \
     institution_id, account_id, owner_id, transaction_type, tier1, tier2, tier3, \
     provenance, confidence, is_internal_transfer, variable_symbol, constant_symbol, \
     specific_symbol, reference, note, source_file, processed_at";

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

fn bind_transaction<'q>(query: Query<'q>, tx: &'q Transaction, dims: DimensionIds) -> Query<'q> {
    let category = tx.category.as_ref();
    query
        .bind(tx.id.as_str())
        .bind(tx.date)
        .bind(tx.amount.to_string())
        .bind(tx.currency.as_str())
        .bind(tx.amount_base.to_string())
        .bind(tx.exchange_rate.to_string())
        .bind(tx.rate_source.as_str())
        .bind(tx.description.as_str())
        .bind(tx.counterparty.name.as_deref())
        .bind(tx.counterparty.account.as_deref())
        .bind(tx.counterparty.bank_code.as_deref())
        .bind(dims.institution)
        .bind(dims.account)
        .bind(dims.owner)
        .bind(tx.transaction_type.as_deref())
        .bind(category.map(|c| c.tier1.as_str()))
        .bind(category.map(|c| c.tier2.as_str()))
        .bind(category.map(|c| c.tier3.as_str()))
        .bind(tx.provenance.as_str())
        .bind(tx.confidence.map(i64::from))
        .bind(tx.is_internal_transfer)
        .bind(tx.symbols.variable_symbol.as_deref())
        .bind(tx.symbols.constant_symbol.as_deref())
        .bind(tx.symbols.specific_symbol.as_deref())
        .bind(tx.symbols.reference.as_deref())
        .bind(tx.symbols.note.as_deref())
        .bind(tx.source_file.as_str())
        .bind(tx.processed_at)
}

fn placeholders() -> String {
    vec!["?"; TRANSACTION_COLUMNS.split(',').count()].join(", ")
}

impl SqliteStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub async fn transaction_count(&self) -> Result<i64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM transactions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Stored category and provenance of one transaction.
    pub async fn category_of(
        &self,
        id: &TransactionId,
    ) -> Result<Option<(Option<CategoryPath>, Provenance)>, StoreError> {
        let row = sqlx::query_as::<_, (Option<String>, Option<String>, Option<String>, String)>(
            "SELECT tier1, tier2, tier3, provenance FROM transactions WHERE id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(t1, t2, t3, provenance)| {
            let provenance = provenance
                .parse::<Provenance>()
                .map_err(|message| StoreError::Corrupt { field: "provenance", message })?;
            let category = match (t1, t2, t3) {
                (Some(t1), Some(t2), Some(t3)) => Some(CategoryPath::new(&t1, &t2, &t3)),
                _ => None,
            };
            Ok((category, provenance))
        })
        .transpose()
    }

    /// Row counts of (institutions, owners, accounts).
    pub async fn dimension_counts(&self) -> Result<(i64, i64, i64), StoreError> {
        let row = sqlx::query_as::<_, (i64, i64, i64)>(
            "SELECT (SELECT COUNT(*) FROM institutions), (SELECT COUNT(*) FROM owners), (SELECT COUNT(*) FROM accounts)",
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }
}

#[async_trait]
impl TransactionStore for SqliteStore {
    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    async fn institution_id(&self, code: &str) -> Result<i64, StoreError> {
        sqlx::query("INSERT INTO institutions (code) VALUES (?) ON CONFLICT(code) DO NOTHING")
            .bind(code)
            .execute(&self.pool)
            .await?;
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM institutions WHERE code = ?")
            .bind(code)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn owner_id(&self, name: &str) -> Result<i64, StoreError> {
        sqlx::query("INSERT INTO owners (name) VALUES (?) ON CONFLICT(name) DO NOTHING")
            .bind(name)
            .execute(&self.pool)
            .await?;
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM owners WHERE name = ?")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn account_id(&self, institution: i64, number: &str, owner: Option<i64>) -> Result<i64, StoreError> {
        sqlx::query(
            "INSERT INTO accounts (institution_id, number, owner_id) VALUES (?, ?, ?) \
             ON CONFLICT(institution_id, number) DO NOTHING",
        )
        .bind(institution)
        .bind(number)
        .bind(owner)
        .execute(&self.pool)
        .await?;
        let (id,): (i64,) = sqlx::query_as("SELECT id FROM accounts WHERE institution_id = ? AND number = ?")
            .bind(institution)
            .bind(number)
            .fetch_one(&self.pool)
            .await?;
        Ok(id)
    }

    async fn contains(&self, id: &TransactionId) -> Result<bool, StoreError> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM transactions WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.is_some())
    }

    async fn insert(&self, tx: &Transaction, dims: DimensionIds) -> Result<(), StoreError> {
        let sql = format!("INSERT INTO transactions ({TRANSACTION_COLUMNS}) VALUES ({})", placeholders());
        bind_transaction(sqlx::query(&sql), tx, dims)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn replace(&self, tx: &Transaction, dims: DimensionIds) -> Result<(), StoreError> {
        let updates = TRANSACTION_COLUMNS
            .split(',')
            .map(str::trim)
            .filter(|c| *c != "id")
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "INSERT INTO transactions ({TRANSACTION_COLUMNS}) VALUES ({}) ON CONFLICT(id) DO UPDATE SET {updates}",
            placeholders()
        );
        bind_transaction(sqlx::query(&sql), tx, dims)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn load_rules(&self) -> Result<Vec<CategorizationRule>, StoreError> {
        let rows = sqlx::query_as::<_, (i64, String, i64, String, String, String, String, Option<String>, String)>(
            "SELECT id, name, priority, conditions, tier1, tier2, tier3, owner, origin \
             FROM categorization_rules WHERE active = 1 ORDER BY priority DESC, id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, name, priority, conditions, t1, t2, t3, owner, origin)| {
                let when: RuleConditions = serde_json::from_str(&conditions)
                    .map_err(|e| StoreError::Corrupt { field: "rule conditions", message: e.to_string() })?;
                let origin = origin
                    .parse::<RuleOrigin>()
                    .map_err(|message| StoreError::Corrupt { field: "rule origin", message })?;
                let priority = i32::try_from(priority)
                    .map_err(|e| StoreError::Corrupt { field: "rule priority", message: e.to_string() })?;
                Ok(CategorizationRule {
                    id: Some(id),
                    name,
                    priority,
                    when,
                    category: CategoryPath::new(&t1, &t2, &t3),
                    owner,
                    origin,
                    active: true,
                })
            })
            .collect()
    }

    async fn save_rule(&self, rule: &CategorizationRule) -> Result<i64, StoreError> {
        let conditions = serde_json::to_string(&rule.when)
            .map_err(|e| StoreError::Corrupt { field: "rule conditions", message: e.to_string() })?;
        let result = sqlx::query(
            "INSERT INTO categorization_rules (name, priority, conditions, tier1, tier2, tier3, owner, origin, active) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&rule.name)
        .bind(rule.priority)
        .bind(conditions)
        .bind(&rule.category.tier1)
        .bind(&rule.category.tier2)
        .bind(&rule.category.tier3)
        .bind(rule.owner.as_deref())
        .bind(rule.origin.as_str())
        .bind(rule.active)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    async fn apply_correction(
        &self,
        id: &TransactionId,
        category: &CategoryPath,
    ) -> Result<CorrectionOutcome, StoreError> {
        let Some((description,)) = sqlx::query_as::<_, (String,)>("SELECT description FROM transactions WHERE id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?
        else {
            return Ok(CorrectionOutcome::NotFound);
        };

        let previous = sqlx::query_as::<_, (String, String, String)>(
            "SELECT tier1, tier2, tier3 FROM corrections WHERE transaction_id = ?",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;
        if previous.is_some_and(|(t1, t2, t3)| CategoryPath::new(&t1, &t2, &t3) == *category) {
            return Ok(CorrectionOutcome::Unchanged { description });
        }

        let internal = *category == ReservedCategories::default().internal_transfer;
        let mut db = self.pool.begin().await?;
        sqlx::query(
            "UPDATE transactions SET tier1 = ?, tier2 = ?, tier3 = ?, provenance = ?, confidence = NULL, \
             is_internal_transfer = ? WHERE id = ?",
        )
        .bind(&category.tier1)
        .bind(&category.tier2)
        .bind(&category.tier3)
        .bind(Provenance::ManualRule.as_str())
        .bind(internal)
        .bind(id.as_str())
        .execute(&mut *db)
        .await?;
        sqlx::query(
            "INSERT INTO corrections (transaction_id, tier1, tier2, tier3) VALUES (?, ?, ?, ?) \
             ON CONFLICT(transaction_id) DO UPDATE SET tier1 = excluded.tier1, tier2 = excluded.tier2, \
             tier3 = excluded.tier3, corrected_at = datetime('now')",
        )
        .bind(id.as_str())
        .bind(&category.tier1)
        .bind(&category.tier2)
        .bind(&category.tier3)
        .execute(&mut *db)
        .await?;
        db.commit().await?;
        Ok(CorrectionOutcome::Applied { description })
    }

    async fn load_corrections(&self) -> Result<Vec<(String, CategoryPath)>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT t.description, c.tier1, c.tier2, c.tier3 FROM corrections c \
             JOIN transactions t ON t.id = c.transaction_id ORDER BY c.corrected_at, c.transaction_id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(description, t1, t2, t3)| (description, CategoryPath::new(&t1, &t2, &t3)))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_memory_db;
    use crate::testing::sample_tx;

    async fn store() -> SqliteStore {
        SqliteStore::new(create_memory_db().await.unwrap())
    }

    #[tokio::test]
    async fn dimensions_are_created_once() {
        let store = store().await;
        let a = store.institution_id("csob").await.unwrap();
        let b = store.institution_id("csob").await.unwrap();
        let c = store.institution_id("fio").await.unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let owner = store.owner_id("Alice").await.unwrap();
        let acct = store.account_id(a, "111/0300", Some(owner)).await.unwrap();
        assert_eq!(store.account_id(a, "111/0300", None).await.unwrap(), acct);
        assert_ne!(store.account_id(c, "111/0300", None).await.unwrap(), acct);
        assert_eq!(store.dimension_counts().await.unwrap(), (2, 1, 2));
    }

    #[tokio::test]
    async fn replace_overwrites_stored_fields() {
        let store = store().await;
        let institution = store.institution_id("csob").await.unwrap();
        let dims = DimensionIds { institution, ..Default::default() };

        let mut tx = sample_tx("ALBERT", "-250.50");
        store.insert(&tx, dims).await.unwrap();
        assert!(store.contains(&tx.id).await.unwrap());
        assert!(store.insert(&tx, dims).await.is_err());

        tx.assign(CategoryPath::new("Living", "Groceries", "Supermarket"), Provenance::ManualRule, None);
        store.replace(&tx, dims).await.unwrap();
        let (category, provenance) = store.category_of(&tx.id).await.unwrap().unwrap();
        assert_eq!(category.unwrap().tier3, "Supermarket");
        assert_eq!(provenance, Provenance::ManualRule);
        assert_eq!(store.transaction_count().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn learned_rules_round_trip_through_json_conditions() {
        let store = store().await;
        let rule = CategorizationRule {
            id: None,
            name: "learned: spotify".into(),
            priority: 50,
            when: RuleConditions { description_contains: Some("spotify".into()), ..Default::default() },
            category: CategoryPath::new("Subscriptions", "Media", "Music"),
            owner: None,
            origin: RuleOrigin::Learned,
            active: true,
        };
        assert!(!store.rule_exists(&rule).await.unwrap());
        let id = store.save_rule(&rule).await.unwrap();

        let loaded = store.load_rules().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, Some(id));
        assert_eq!(loaded[0].origin, RuleOrigin::Learned);
        assert!(store.rule_exists(&rule).await.unwrap());
    }

    #[tokio::test]
    async fn corrections_update_the_row_and_are_replayable() {
        let store = store().await;
        let institution = store.institution_id("csob").await.unwrap();
        let tx = sample_tx("PEKARNA U MOSTU 12", "-80");
        store.insert(&tx, DimensionIds { institution, ..Default::default() }).await.unwrap();
        let bakery = CategoryPath::new("Living", "Groceries", "Bakery");

        let outcome = store.apply_correction(&tx.id, &bakery).await.unwrap();
        assert_eq!(outcome, CorrectionOutcome::Applied { description: "PEKARNA U MOSTU 12".into() });
        let (category, provenance) = store.category_of(&tx.id).await.unwrap().unwrap();
        assert_eq!(category, Some(bakery.clone()));
        assert_eq!(provenance, Provenance::ManualRule);

        assert!(matches!(
            store.apply_correction(&tx.id, &bakery).await.unwrap(),
            CorrectionOutcome::Unchanged { .. }
        ));
        let missing = TransactionId::from_content(tx.date, tx.amount, "other", "", "csob");
        assert_eq!(store.apply_correction(&missing, &bakery).await.unwrap(), CorrectionOutcome::NotFound);

        assert_eq!(store.load_corrections().await.unwrap(), vec![("PEKARNA U MOSTU 12".to_string(), bakery)]);
    }
}
