use fincon_categorize::{
    AiError, AiRateLimiter, Cancelled, CategorizationEngine, CategorizeStats, Classifier, LearningLoop, RuleBook,
    TransferDetector,
};
use fincon_core::{CategoryPath, CategoryTree, DateRange, Transaction, TransactionId};
use fincon_fx::CurrencyConverter;
use fincon_import::{CompiledFormat, FileError, FormatRegistry, Normalizer, RecordStream};
use fincon_storage::{
    persist_rules, BatchWriter, CorrectionOutcome, SqliteStore, StoreError, TransactionStore, WriteError, WriteMode,
    WriteSummary,
};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{read, ConfigError, Settings};

pub const DEFAULT_CHUNK_ROWS: usize = 500;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("Unknown institution '{0}'")]
    UnknownInstitution(String),
    #[error("No institution format matches '{0}'")]
    Undetected(String),
    #[error("Cannot read {filename}: {source}")]
    File { filename: String, source: FileError },
    #[error("Import cancelled after {0} rows")]
    Cancelled(usize),
    #[error("No stored transaction '{0}'")]
    NotFound(String),
    #[error("Category {0} is not in the tree")]
    UnknownCategory(CategoryPath),
    #[error(transparent)]
    Persistence(#[from] WriteError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Import task failed: {0}")]
    Join(String),
}

/// One uploaded file.
#[derive(Debug, Clone, Default)]
pub struct ImportRequest {
    pub bytes: Vec<u8>,
    pub filename: String,
    /// Detected from `filename` when absent.
    pub institution: Option<String>,
    pub mode: WriteMode,
    pub ai_enabled: bool,
    pub dry_run: bool,
    pub date_range: DateRange,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ImportReport {
    pub filename: String,
    pub institution: String,
    pub rows_parsed: usize,
    pub rows_filtered: usize,
    pub rows_failed: usize,
    pub rows_out_of_range: usize,
    pub categorization: CategorizeStats,
    pub write: WriteSummary,
    pub learned_rules: usize,
    pub dry_run: bool,
    pub log: Vec<String>,
}

impl ImportReport {
    fn note(&mut self, line: impl Into<String>) {
        self.log.push(line.into());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CorrectionReport {
    pub id: String,
    pub category: CategoryPath,
    /// False when the transaction already carried this correction.
    pub applied: bool,
    pub learned_rules: usize,
}

/// Everything an import needs, shared between concurrent jobs.
pub struct Pipeline {
    registry: Arc<FormatRegistry>,
    converter: Arc<CurrencyConverter>,
    engine: Arc<CategorizationEngine>,
    store: Arc<dyn TransactionStore>,
    chunk_rows: usize,
}

impl Pipeline {
    pub fn new(
        registry: Arc<FormatRegistry>,
        converter: Arc<CurrencyConverter>,
        engine: Arc<CategorizationEngine>,
        store: Arc<dyn TransactionStore>,
    ) -> Self {
        Self { registry, converter, engine, store, chunk_rows: DEFAULT_CHUNK_ROWS }
    }

    /// Minimum rows per categorize-and-store step. A chunk only ends where the
    /// booking date changes, so same-day pairs in a date-ordered export stay together.
    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows.max(1);
        self
    }

    /// Loads every configured resource. Any invalid file fails here, before work starts.
    pub async fn from_settings(settings: &Settings) -> Result<Self, ConfigError> {
        let base = settings.base_currency()?;
        let tree = CategoryTree::from_toml(&read(&settings.categories_file)?)?;

        let pool = fincon_storage::create_db(&settings.database)
            .await
            .map_err(StoreError::from)?;
        let store = Arc::new(SqliteStore::new(pool));

        let book = match &settings.rules_file {
            Some(path) if path.exists() => RuleBook::from_toml(&read(path)?, &tree)?,
            _ => RuleBook::new(Vec::new(), &tree)?,
        };
        let manual = book.len();
        let mut learned = 0;
        for rule in store.load_rules().await? {
            if rule.validate(&tree).is_err() {
                warn!("Ignoring stored rule '{}': category {} not in tree", rule.name, rule.category);
                continue;
            }
            if book.install(rule) {
                learned += 1;
            }
        }
        info!("Loaded {manual} manual and {learned} stored rules");

        let registry = Arc::new(FormatRegistry::open(&settings.formats_dir)?);
        let converter = Arc::new(settings.currency.build(base)?);

        let limiter = Arc::new(AiRateLimiter::new(settings.ai.per_minute, settings.ai.per_day));
        let mut engine = CategorizationEngine::new(
            tree,
            Arc::new(book),
            TransferDetector::new(&settings.transfers),
            limiter,
        );
        if settings.ai.enabled {
            match settings.ai.classifier() {
                Ok(client) => {
                    let client: Arc<dyn Classifier> = Arc::new(client);
                    engine = engine.with_classifier(client, settings.ai.confidence_threshold);
                }
                Err(AiError::MissingKey(var)) => {
                    warn!("AI categorization disabled: set {var} to enable it");
                }
                Err(e) => warn!("AI categorization disabled: {e}"),
            }
        }
        if settings.learning.enabled {
            engine = engine.with_learning(Arc::new(LearningLoop::new(&settings.learning)));
            let corrections = store.load_corrections().await?;
            let replayed = corrections
                .iter()
                .filter(|(description, category)| engine.record_correction(description, category))
                .count();
            if replayed > 0 {
                info!("Replayed {replayed} stored corrections into learning");
            }
        }

        Ok(Self::new(registry, converter, Arc::new(engine), store).with_chunk_rows(settings.chunk_rows))
    }

    pub fn registry(&self) -> &Arc<FormatRegistry> {
        &self.registry
    }

    fn resolve_format(&self, request: &ImportRequest) -> Result<Arc<CompiledFormat>, JobError> {
        let snapshot = self.registry.snapshot();
        match request.institution.as_deref() {
            Some(id) => snapshot.get(id).ok_or_else(|| JobError::UnknownInstitution(id.to_string())),
            None => snapshot
                .detect(&request.filename)
                .ok_or_else(|| JobError::Undetected(request.filename.clone())),
        }
    }

    /// Parses, normalizes, categorizes and stores one file in chunks. `cancel`
    /// is checked before every row in each phase; chunks stored before a
    /// cancellation stay stored.
    pub async fn import(&self, request: ImportRequest, cancel: &CancellationToken) -> Result<ImportReport, JobError> {
        let format = self.resolve_format(&request)?;
        let mut report = ImportReport {
            filename: request.filename.clone(),
            institution: format.id().to_string(),
            dry_run: request.dry_run,
            ..Default::default()
        };
        report.note(format!("{}: using format '{}'", request.filename, format.name()));

        let mut stream = RecordStream::open(&format, &request.bytes).map_err(|source| JobError::File {
            filename: request.filename.clone(),
            source,
        })?;
        let normalizer = Normalizer::new(&format, &self.converter, &request.filename);
        let mut writer = if request.dry_run {
            None
        } else {
            Some(BatchWriter::open(self.store.as_ref(), request.mode).await?)
        };

        let mut chunk: Vec<Transaction> = Vec::new();
        let mut normalize_failures = 0;
        let mut rows_seen = 0;
        for next in stream.by_ref() {
            if cancel.is_cancelled() {
                return Err(cancelled(&request.filename, rows_seen));
            }
            rows_seen += 1;
            let record = match next {
                Ok(record) => record,
                Err(e) => {
                    warn!("{}: skipping {e}", request.filename);
                    report.note(format!("skipped {e}"));
                    continue;
                }
            };
            match normalizer.normalize(record).await {
                Ok(tx) if request.date_range.contains(tx.date) => {
                    let boundary = chunk.last().is_some_and(|last| last.date != tx.date);
                    if chunk.len() >= self.chunk_rows && boundary {
                        let full = std::mem::take(&mut chunk);
                        self.process_chunk(full, &request, writer.as_mut(), &mut report, cancel)
                            .await
                            .map_err(|_| cancelled(&request.filename, rows_seen))?;
                    }
                    report.rows_parsed += 1;
                    chunk.push(tx);
                }
                Ok(_) => report.rows_out_of_range += 1,
                Err(e) => {
                    warn!("{}: skipping {e}", request.filename);
                    report.note(format!("skipped {e}"));
                    normalize_failures += 1;
                }
            }
        }
        if !chunk.is_empty() {
            self.process_chunk(chunk, &request, writer.as_mut(), &mut report, cancel)
                .await
                .map_err(|_| cancelled(&request.filename, rows_seen))?;
        }

        let stats = stream.stats();
        report.rows_filtered = stats.filtered;
        report.rows_failed = stats.failed + normalize_failures;
        if report.rows_out_of_range > 0 {
            report.note(format!(
                "{} rows outside {} ignored",
                report.rows_out_of_range, request.date_range
            ));
        }

        let c = report.categorization;
        report.note(format!(
            "categorized {}: {} transfers, {} by rule, {} learned, {} by AI, {} uncategorized",
            report.rows_parsed, c.internal_transfer, c.manual_rule, c.learned, c.ai, c.uncategorized
        ));
        if request.ai_enabled && c.ai_failures > 0 {
            report.note(format!("{} AI lookups failed or were rate limited", c.ai_failures));
        }

        let learned = self.engine.promote_learned();
        report.learned_rules = learned.len();

        match writer {
            None => report.note("dry run: nothing stored"),
            Some(writer) => {
                report.write = writer.finish();
                let w = report.write;
                report.note(format!(
                    "stored: {} added, {} updated, {} skipped, {} failed",
                    w.added, w.updated, w.skipped, w.failed
                ));
                match persist_rules(self.store.as_ref(), &learned).await {
                    Ok(0) => {}
                    Ok(saved) => report.note(format!("learned {saved} new rules")),
                    Err(e) => {
                        warn!("Failed to persist learned rules: {e}");
                        report.note(format!("learned rules not saved: {e}"));
                    }
                }
            }
        }

        info!(
            "{}: {} parsed, {} filtered, {} failed",
            request.filename, report.rows_parsed, report.rows_filtered, report.rows_failed
        );
        Ok(report)
    }

    /// Categorizes one chunk and stores it row by row.
    async fn process_chunk(
        &self,
        mut chunk: Vec<Transaction>,
        request: &ImportRequest,
        writer: Option<&mut BatchWriter<'_>>,
        report: &mut ImportReport,
        cancel: &CancellationToken,
    ) -> Result<(), Cancelled> {
        let stats = self.engine.categorize_batch(&mut chunk, request.ai_enabled, cancel).await?;
        report.categorization.absorb(stats);

        if let Some(writer) = writer {
            for (processed, tx) in chunk.iter().enumerate() {
                if cancel.is_cancelled() {
                    return Err(Cancelled { processed });
                }
                writer.write(tx).await;
            }
        }
        Ok(())
    }

    /// Recategorizes a stored transaction by hand and feeds the correction into
    /// learning. Repeating an identical correction changes nothing.
    pub async fn correct(&self, id: &str, category: CategoryPath) -> Result<CorrectionReport, JobError> {
        if !self.engine.tree().contains(&category) {
            return Err(JobError::UnknownCategory(category));
        }
        let tx_id = TransactionId::from_stored(id.trim().to_string());

        let applied = match self.store.apply_correction(&tx_id, &category).await? {
            CorrectionOutcome::NotFound => return Err(JobError::NotFound(tx_id.to_string())),
            CorrectionOutcome::Unchanged { .. } => {
                info!(id = %tx_id, "Already corrected to {category}");
                false
            }
            CorrectionOutcome::Applied { description } => {
                info!(id = %tx_id, "Corrected to {category}");
                self.engine.record_correction(&description, &category);
                true
            }
        };

        let learned = self.engine.promote_learned();
        let learned_rules = persist_rules(self.store.as_ref(), &learned).await?;
        Ok(CorrectionReport { id: tx_id.to_string(), category, applied, learned_rules })
    }

    /// Runs [`import`](Self::import) as its own task.
    pub fn spawn_import(
        self: &Arc<Self>,
        request: ImportRequest,
        cancel: CancellationToken,
    ) -> JoinHandle<Result<ImportReport, JobError>> {
        let pipeline = Arc::clone(self);
        tokio::spawn(async move { pipeline.import(request, &cancel).await })
    }
}

fn cancelled(filename: &str, rows: usize) -> JobError {
    warn!("{filename}: import cancelled after {rows} rows");
    JobError::Cancelled(rows)
}
