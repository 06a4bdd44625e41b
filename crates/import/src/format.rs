use encoding_rs::Encoding;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::amount::AmountFormat;
use crate::date::DateFormat;
use crate::error::ConfigError;
use crate::field::{CanonicalField, ColumnRef};
use crate::transform::{check_order, compile_steps, CompiledTransform, Transformation};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Institution {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Detection {
    /// Case-insensitive globs (`*`, `?`) matched against the upload's file name.
    pub filename_patterns: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    #[default]
    Csv,
    Sheet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileFormat {
    pub kind: FileKind,
    /// Any WHATWG label, plus `utf-8-sig`.
    pub encoding: String,
    pub delimiter: char,
    pub skip_rows: usize,
    pub has_header: bool,
    /// First sheet when unset.
    pub sheet_name: Option<String>,
}

impl Default for FileFormat {
    fn default() -> Self {
        Self {
            kind: FileKind::Csv,
            encoding: "utf-8".to_string(),
            delimiter: ',',
            skip_rows: 0,
            has_header: true,
            sheet_name: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Filtering {
    /// A row is dropped when any cell contains any of these substrings.
    pub skip_if_contains: Vec<String>,
}

/// Computed value for a field the file leaves blank.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "derive", rename_all = "snake_case")]
pub enum Derivation {
    /// Regex capture from the source file name, optionally suffixed `/<bank_code>`.
    ExtractFromFilename {
        pattern: String,
        #[serde(default = "first_group")]
        group: usize,
        bank_code: Option<String>,
    },
    /// Value of another field followed by `/<bank_code>`.
    AppendBankCode { from: CanonicalField, bank_code: String },
}

fn first_group() -> usize {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Literal(String),
    Derived(Derivation),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DescriptionRules {
    /// Consulted in order when the description itself is blank.
    pub fallback_fields: Vec<CanonicalField>,
    pub collapse_whitespace: bool,
    /// Regexes removed from the description, in order.
    pub remove_patterns: Vec<String>,
}

impl Default for DescriptionRules {
    fn default() -> Self {
        Self {
            fallback_fields: Vec::new(),
            collapse_whitespace: true,
            remove_patterns: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnerMapping {
    pub default: Option<String>,
    /// Account number (with or without `/bankcode`) to owner.
    pub by_account: BTreeMap<String, String>,
}

/// Declarative description of one institution's export format, as authored in TOML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FormatDescriptor {
    pub institution: Institution,
    #[serde(default)]
    pub detection: Detection,
    #[serde(default)]
    pub format: FileFormat,
    pub columns: BTreeMap<String, ColumnRef>,
    #[serde(default)]
    pub transformations: Vec<Transformation>,
    #[serde(default)]
    pub filtering: Filtering,
    #[serde(default)]
    pub amount: AmountFormat,
    #[serde(default)]
    pub date: DateFormat,
    #[serde(default)]
    pub defaults: BTreeMap<String, DefaultValue>,
    #[serde(default)]
    pub description: DescriptionRules,
    #[serde(default)]
    pub owner: OwnerMapping,
}

impl FormatDescriptor {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validates the descriptor and precompiles everything evaluated per row.
    pub fn compile(self) -> Result<CompiledFormat, ConfigError> {
        let encoding = resolve_encoding(&self.format.encoding)?;
        if self.format.kind == FileKind::Csv && !self.format.delimiter.is_ascii() {
            return Err(ConfigError::Delimiter(self.format.delimiter));
        }

        let columns = self
            .columns
            .iter()
            .map(|(name, col)| Ok((parse_field(name)?, col.clone())))
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let mut defaults = Vec::new();
        for (name, value) in &self.defaults {
            let field = parse_field(name)?;
            let compiled = match value {
                DefaultValue::Literal(v) => CompiledDefault::Literal(v.clone()),
                DefaultValue::Derived(Derivation::ExtractFromFilename { pattern, group, bank_code }) => {
                    CompiledDefault::FromFilename {
                        regex: Regex::new(pattern).map_err(|e| ConfigError::regex(pattern, e))?,
                        group: *group,
                        bank_code: bank_code.clone(),
                    }
                }
                DefaultValue::Derived(Derivation::AppendBankCode { from, bank_code }) => {
                    CompiledDefault::AppendBankCode { from: *from, bank_code: bank_code.clone() }
                }
            };
            defaults.push((field, compiled));
        }
        // Derivations reading other fields run after plain values are in place.
        defaults.sort_by_key(|(_, d)| matches!(d, CompiledDefault::AppendBankCode { .. }));

        let provided = |field: CanonicalField| {
            columns.iter().any(|(f, _)| *f == field) || defaults.iter().any(|(f, _)| *f == field)
        };
        for required in [CanonicalField::Date, CanonicalField::Amount] {
            if !provided(required) {
                return Err(ConfigError::MissingRequiredField(required));
            }
        }
        if self.amount.direction.is_some() && !provided(CanonicalField::Direction) {
            return Err(ConfigError::DirectionUnmapped);
        }

        let detection = self
            .detection
            .filename_patterns
            .iter()
            .map(String::as_str)
            .map(glob_to_regex)
            .collect::<Result<Vec<_>, _>>()?;
        let removals = self
            .description
            .remove_patterns
            .iter()
            .map(|p| Regex::new(p).map_err(|e| ConfigError::regex(p, e)))
            .collect::<Result<Vec<_>, _>>()?;
        let transforms = compile_steps(self.transformations.clone())?;
        // With a header, reads of source columns are settled once the file is open.
        let order_checked = match check_order(&transforms, None) {
            Ok(()) => true,
            Err(e) if self.format.has_header => {
                debug!("{}: {e}; checking again against each file header", self.institution.id);
                false
            }
            Err(e) => return Err(e),
        };

        Ok(CompiledFormat {
            descriptor: self,
            encoding,
            columns,
            transforms,
            order_checked,
            defaults,
            detection,
            removals,
        })
    }
}

fn parse_field(name: &str) -> Result<CanonicalField, ConfigError> {
    name.parse().map_err(ConfigError::UnknownField)
}

pub(crate) fn resolve_encoding(label: &str) -> Result<&'static Encoding, ConfigError> {
    let trimmed = label.trim();
    if trimmed.eq_ignore_ascii_case("utf-8-sig") || trimmed.eq_ignore_ascii_case("utf_8_sig") {
        return Ok(encoding_rs::UTF_8);
    }
    Encoding::for_label(trimmed.as_bytes()).ok_or_else(|| ConfigError::UnknownEncoding(label.to_string()))
}

fn glob_to_regex(glob: &str) -> Result<Regex, ConfigError> {
    let mut pattern = String::from("^");
    for c in glob.chars() {
        match c {
            '*' => pattern.push_str(".*"),
            '?' => pattern.push('.'),
            other => pattern.push_str(&regex::escape(&other.to_string())),
        }
    }
    pattern.push('$');
    RegexBuilder::new(&pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| ConfigError::regex(glob, e))
}

#[derive(Debug, Clone)]
pub enum CompiledDefault {
    Literal(String),
    FromFilename { regex: Regex, group: usize, bank_code: Option<String> },
    AppendBankCode { from: CanonicalField, bank_code: String },
}

/// A validated descriptor with its regexes and transformation chain compiled.
pub struct CompiledFormat {
    pub descriptor: FormatDescriptor,
    pub(crate) encoding: &'static Encoding,
    pub(crate) columns: Vec<(CanonicalField, ColumnRef)>,
    pub(crate) transforms: Vec<CompiledTransform>,
    /// False when the transformation order depends on which columns the file has.
    pub(crate) order_checked: bool,
    pub(crate) defaults: Vec<(CanonicalField, CompiledDefault)>,
    detection: Vec<Regex>,
    pub(crate) removals: Vec<Regex>,
}

impl CompiledFormat {
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        FormatDescriptor::from_toml(content)?.compile()
    }

    pub fn id(&self) -> &str {
        &self.descriptor.institution.id
    }

    pub fn name(&self) -> &str {
        &self.descriptor.institution.name
    }

    pub fn kind(&self) -> FileKind {
        self.descriptor.format.kind
    }

    /// True if any detection glob matches the base name of `filename`.
    pub fn matches_filename(&self, filename: &str) -> bool {
        let base = filename.rsplit(['/', '\\']).next().unwrap_or(filename);
        self.detection.iter().any(|re| re.is_match(base))
    }
}

impl std::fmt::Debug for CompiledFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledFormat")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("encoding", &self.encoding.name())
            .field("columns", &self.columns)
            .field("transforms", &self.transforms.len())
            .finish()
    }
}
