use chrono::Utc;
use fincon_core::{
    round_minor, BankingSymbols, Counterparty, CurrencyCode, Provenance, Transaction, TransactionId,
};
use fincon_fx::CurrencyConverter;
use regex::Regex;
use rust_decimal::Decimal;
use std::sync::OnceLock;
use tracing::debug;

use crate::error::RowError;
use crate::field::CanonicalField;
use crate::format::{CompiledDefault, CompiledFormat};
use crate::tabular::RawRecord;

/// Turns raw records from one file into canonical transactions.
pub struct Normalizer<'a> {
    format: &'a CompiledFormat,
    converter: &'a CurrencyConverter,
    source_file: &'a str,
}

impl<'a> Normalizer<'a> {
    pub fn new(format: &'a CompiledFormat, converter: &'a CurrencyConverter, source_file: &'a str) -> Self {
        Self { format, converter, source_file }
    }

    pub async fn normalize(&self, mut raw: RawRecord) -> Result<Transaction, RowError> {
        self.apply_defaults(&mut raw);
        let row = raw.row;

        let date_raw = raw
            .get(CanonicalField::Date)
            .ok_or(RowError::MissingField { row, field: CanonicalField::Date })?;
        let date = self
            .format
            .descriptor
            .date
            .parse(date_raw)
            .ok_or_else(|| RowError::InvalidDate { row, value: date_raw.to_string() })?;

        let amount_raw = raw
            .get(CanonicalField::Amount)
            .ok_or(RowError::MissingField { row, field: CanonicalField::Amount })?;
        let amount_format = &self.format.descriptor.amount;
        let amount = amount_format
            .parse(amount_raw)
            .map_err(|_| RowError::InvalidAmount { row, value: amount_raw.to_string() })?;
        let amount = amount_format.apply_sign(amount, raw.get(CanonicalField::Direction));

        let currency = raw
            .get(CanonicalField::Currency)
            .and_then(CurrencyCode::parse)
            .unwrap_or_else(|| self.converter.base().clone());
        let quote = self.converter.resolve(&currency, date).await;

        let raw_description = raw.get(CanonicalField::Description).unwrap_or("");
        let account = raw.get(CanonicalField::Account).map(str::to_string);
        let institution = self.format.id().to_string();
        let id = TransactionId::from_content(
            date,
            amount,
            raw_description,
            account.as_deref().unwrap_or(""),
            &institution,
        );

        let counterparty_account = raw.get(CanonicalField::CounterpartyAccount).map(str::to_string);
        let counterparty = Counterparty {
            name: raw.get(CanonicalField::CounterpartyName).map(str::to_string),
            bank_code: raw
                .get(CanonicalField::CounterpartyBankCode)
                .map(str::to_string)
                .or_else(|| {
                    counterparty_account
                        .as_deref()
                        .and_then(|a| a.split_once('/'))
                        .map(|(_, code)| code.trim().to_string())
                }),
            account: counterparty_account,
        };

        let transaction_type = raw
            .get(CanonicalField::TransactionType)
            .map(str::to_string)
            .unwrap_or_else(|| sign_type(amount).to_string());

        let tx = Transaction {
            id,
            date,
            amount,
            currency,
            amount_base: round_minor(amount * quote.rate),
            exchange_rate: quote.rate,
            rate_source: quote.source,
            description: self.clean_description(&raw),
            counterparty,
            owner: self.owner(&raw, account.as_deref()),
            institution,
            account,
            transaction_type: Some(transaction_type),
            category: None,
            provenance: Provenance::Uncategorized,
            confidence: None,
            is_internal_transfer: false,
            symbols: BankingSymbols {
                variable_symbol: raw.get(CanonicalField::VariableSymbol).map(str::to_string),
                constant_symbol: raw.get(CanonicalField::ConstantSymbol).map(str::to_string),
                specific_symbol: raw.get(CanonicalField::SpecificSymbol).map(str::to_string),
                reference: raw.get(CanonicalField::Reference).map(str::to_string),
                note: raw.get(CanonicalField::Note).map(str::to_string),
            },
            source_file: self.source_file.to_string(),
            processed_at: Utc::now(),
        };
        debug!("row {row}: {} {} {} -> {}", tx.date, tx.amount, tx.currency, tx.id);
        Ok(tx)
    }

    fn apply_defaults(&self, raw: &mut RawRecord) {
        for (field, default) in &self.format.defaults {
            if raw.get(*field).is_some() {
                continue;
            }
            let value = match default {
                CompiledDefault::Literal(v) => Some(v.clone()),
                CompiledDefault::FromFilename { regex, group, bank_code } => regex
                    .captures(self.source_file)
                    .and_then(|caps| caps.get(*group))
                    .map(|m| with_bank_code(m.as_str(), bank_code.as_deref())),
                CompiledDefault::AppendBankCode { from, bank_code } => {
                    raw.get(*from).map(|v| with_bank_code(v, Some(bank_code.as_str())))
                }
            };
            if let Some(value) = value {
                raw.set(*field, value);
            }
        }
    }

    /// Fallback fields, optional whitespace collapse, ordered removals, final collapse.
    fn clean_description(&self, raw: &RawRecord) -> String {
        let rules = &self.format.descriptor.description;
        let mut text = std::iter::once(CanonicalField::Description)
            .chain(rules.fallback_fields.iter().copied())
            .find_map(|f| raw.get(f))
            .unwrap_or("")
            .to_string();
        if rules.collapse_whitespace {
            text = collapse_whitespace(&text);
        }
        for re in &self.format.removals {
            text = re.replace_all(&text, "").into_owned();
        }
        collapse_whitespace(&text)
    }

    fn owner(&self, raw: &RawRecord, account: Option<&str>) -> Option<String> {
        let mapping = &self.format.descriptor.owner;
        account
            .and_then(|acc| {
                mapping
                    .by_account
                    .get(acc)
                    .or_else(|| mapping.by_account.get(strip_bank_code(acc)))
            })
            .cloned()
            .or_else(|| raw.get(CanonicalField::Owner).map(str::to_string))
            .or_else(|| mapping.default.clone())
    }
}

fn with_bank_code(value: &str, bank_code: Option<&str>) -> String {
    match bank_code {
        Some(code) if !value.contains('/') => format!("{value}/{code}"),
        _ => value.to_string(),
    }
}

/// Account number without a trailing `/bankcode`.
pub fn strip_bank_code(account: &str) -> &str {
    account.split('/').next().unwrap_or(account).trim()
}

fn sign_type(amount: Decimal) -> &'static str {
    if amount.is_zero() {
        "Zero"
    } else if amount.is_sign_negative() {
        "Debit"
    } else {
        "Credit"
    }
}

fn collapse_whitespace(text: &str) -> String {
    static WS: OnceLock<Regex> = OnceLock::new();
    let re = WS.get_or_init(|| Regex::new(r"\s+").expect("static regex"));
    re.replace_all(text.trim(), " ").into_owned()
}
