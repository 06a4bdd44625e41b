use fincon_categorize::{AiConfig, LearningConfig, RuleError, TransferConfig};
use fincon_core::{CurrencyCode, TaxonomyError};
use fincon_fx::{FxConfig, FxError};
use fincon_storage::StoreError;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const CONFIG_ENV: &str = "FINCON_CONFIG";
pub const DEFAULT_CONFIG_FILE: &str = "fincon.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("Invalid settings in {path}: {message}")]
    Parse { path: PathBuf, message: String },
    #[error("Unknown base currency '{0}'")]
    Currency(String),
    #[error("Category tree: {0}")]
    Taxonomy(#[from] TaxonomyError),
    #[error("Rules: {0}")]
    Rules(#[from] RuleError),
    #[error("Institution formats: {0}")]
    Formats(#[from] fincon_import::ConfigError),
    #[error("Currency converter: {0}")]
    Fx(#[from] FxError),
    #[error("Store: {0}")]
    Store(#[from] StoreError),
}

/// Contents of `fincon.toml`. Relative paths resolve against the file's directory.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub base_currency: String,
    pub database: PathBuf,
    pub formats_dir: PathBuf,
    pub categories_file: PathBuf,
    pub rules_file: Option<PathBuf>,
    pub intake_dir: PathBuf,
    /// Rows categorized and stored per step of an import.
    pub chunk_rows: usize,
    pub currency: FxConfig,
    pub transfers: TransferConfig,
    pub ai: AiConfig,
    pub learning: LearningConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            base_currency: "CZK".to_string(),
            database: PathBuf::from("fincon.db"),
            formats_dir: PathBuf::from("institutions"),
            categories_file: PathBuf::from("categories.toml"),
            rules_file: Some(PathBuf::from("rules.toml")),
            intake_dir: PathBuf::from("intake"),
            chunk_rows: 500,
            currency: FxConfig::default(),
            transfers: TransferConfig::default(),
            ai: AiConfig::default(),
            learning: LearningConfig::default(),
        }
    }
}

impl Settings {
    /// `--config` wins over `FINCON_CONFIG`, which wins over `./fincon.toml`.
    pub fn locate(cli: Option<PathBuf>) -> PathBuf {
        cli.or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = read(path)?;
        let mut settings = Self::from_toml(&content).map_err(|message| ConfigError::Parse {
            path: path.to_path_buf(),
            message,
        })?;
        if let Some(dir) = path.parent() {
            settings.resolve_paths(dir);
        }
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        toml::from_str(content).map_err(|e| e.to_string())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let join = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        join(&mut self.database);
        join(&mut self.formats_dir);
        join(&mut self.categories_file);
        join(&mut self.intake_dir);
        if let Some(rules) = self.rules_file.as_mut() {
            join(rules);
        }
        if let Some(cache) = self.currency.cache_file.as_mut() {
            join(cache);
        }
    }

    pub fn base_currency(&self) -> Result<CurrencyCode, ConfigError> {
        CurrencyCode::parse(&self.base_currency).ok_or_else(|| ConfigError::Currency(self.base_currency.clone()))
    }
}

pub(crate) fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io { path: path.to_path_buf(), source })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_fill_in_defaults() {
        let settings = Settings::from_toml(
            r#"
            base_currency = "EUR"

            [currency]
            live = false
            fallback_rates = { CZK = "0.0398" }

            [transfers]
            own_accounts = ["123/0300"]
            same_day_pairing = true

            [ai]
            enabled = true
            per_minute = 5
            "#,
        )
        .unwrap();
        assert_eq!(settings.base_currency().unwrap().as_str(), "EUR");
        assert!(!settings.currency.live);
        assert_eq!(settings.currency.lookback_days, 7);
        assert!(settings.transfers.same_day_pairing);
        assert_eq!(settings.ai.per_minute, 5);
        assert_eq!(settings.ai.per_day, 1000);
        assert_eq!(settings.ai.confidence_threshold, 75);
        assert_eq!(settings.learning.min_occurrences, 3);
        assert_eq!(settings.chunk_rows, 500);
    }

    #[test]
    fn relative_paths_resolve_against_config_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fincon.toml");
        std::fs::write(&path, "database = \"data/fincon.db\"\nformats_dir = \"/etc/fincon/formats\"\n").unwrap();
        let settings = Settings::load(&path).unwrap();
        assert_eq!(settings.database, dir.path().join("data/fincon.db"));
        assert_eq!(settings.formats_dir, PathBuf::from("/etc/fincon/formats"));
        assert_eq!(settings.categories_file, dir.path().join("categories.toml"));
    }

    #[test]
    fn cli_path_wins() {
        assert_eq!(Settings::locate(Some("x.toml".into())), PathBuf::from("x.toml"));
    }

    #[test]
    fn bundled_sample_configuration_loads() {
        let settings = Settings::from_toml(include_str!("../../../config/fincon.toml")).unwrap();
        assert_eq!(settings.base_currency().unwrap().as_str(), "CZK");
        assert_eq!(settings.transfers.own_accounts.len(), 2);

        let tree = fincon_core::CategoryTree::from_toml(include_str!("../../../config/categories.toml")).unwrap();
        let rules = fincon_categorize::RuleBook::from_toml(include_str!("../../../config/rules.toml"), &tree).unwrap();
        assert_eq!(rules.len(), 4);

        for descriptor in [
            include_str!("../../../config/institutions/csob.toml"),
            include_str!("../../../config/institutions/revolut.toml"),
            include_str!("../../../config/institutions/fio.toml"),
        ] {
            fincon_import::CompiledFormat::from_toml(descriptor).unwrap();
        }
    }

    #[test]
    fn unknown_base_currency_is_rejected() {
        let settings = Settings { base_currency: String::new(), ..Default::default() };
        assert!(matches!(settings.base_currency(), Err(ConfigError::Currency(_))));
    }
}
