use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Raw direction markers that decide the sign of an otherwise unsigned amount.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DirectionValues {
    #[serde(default)]
    pub outgoing: Vec<String>,
    #[serde(default)]
    pub incoming: Vec<String>,
}

/// Locale rules for reading an institution's amount column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmountFormat {
    pub decimal_separator: char,
    pub thousands_separator: Option<char>,
    /// Institution exports expenses as positive numbers.
    pub reverse_sign: bool,
    pub direction: Option<DirectionValues>,
}

impl Default for AmountFormat {
    fn default() -> Self {
        Self {
            decimal_separator: '.',
            thousands_separator: None,
            reverse_sign: false,
            direction: None,
        }
    }
}

fn is_currency_mark(c: char) -> bool {
    c.is_alphabetic() || "€$£¥₽₴".contains(c)
}

impl AmountFormat {
    /// Parses a raw amount cell into an exact decimal.
    ///
    /// Accepts surrounding quotes, (non-breaking) spaces, one currency symbol
    /// or code before or after the number, a leading `+`/`-`/`−` and
    /// accounting parentheses. Letters between digits are an error.
    pub fn parse(&self, raw: &str) -> Result<Decimal, String> {
        let mut s = raw.trim().trim_matches(|c| c == '"' || c == '\'').trim();
        let mut negative = false;
        if s.starts_with('(') && s.ends_with(')') {
            negative = true;
            s = &s[1..s.len() - 1];
        }

        let mut cleaned = String::with_capacity(s.len());
        if let Some(sign) = s.chars().next().filter(|c| matches!(c, '-' | '\u{2212}' | '+')) {
            if sign != '+' {
                cleaned.push('-');
            }
            s = &s[sign.len_utf8()..];
        }
        let body = s
            .trim_start()
            .trim_start_matches(is_currency_mark)
            .trim()
            .trim_end_matches(is_currency_mark)
            .trim_end();

        for c in body.chars() {
            if Some(c) == self.thousands_separator && c != self.decimal_separator {
                continue;
            }
            match c {
                '0'..='9' => cleaned.push(c),
                '-' | '\u{2212}' => cleaned.push('-'),
                '+' => {}
                c if c == self.decimal_separator => cleaned.push('.'),
                c if c.is_whitespace() || c == '\u{a0}' || c == '\u{202f}' => {}
                other => return Err(format!("unexpected character '{other}' in '{raw}'")),
            }
        }

        if !cleaned.chars().any(|c| c.is_ascii_digit()) {
            return Err(format!("no digits in '{raw}'"));
        }
        let value = Decimal::from_str(&cleaned).map_err(|e| format!("'{raw}': {e}"))?;
        Ok(if negative { -value.abs() } else { value })
    }

    /// Renders `value` in this locale. `parse(format(v)) == v` for every decimal.
    pub fn format(&self, value: Decimal) -> String {
        let text = value.abs().to_string();
        let (int_part, frac_part) = match text.split_once('.') {
            Some((i, f)) => (i, Some(f)),
            None => (text.as_str(), None),
        };

        let mut grouped = String::new();
        for (i, digit) in int_part.chars().enumerate() {
            if i > 0 && (int_part.len() - i) % 3 == 0 {
                if let Some(sep) = self.thousands_separator {
                    grouped.push(sep);
                }
            }
            grouped.push(digit);
        }

        let mut out = String::new();
        if value.is_sign_negative() && !value.is_zero() {
            out.push('-');
        }
        out.push_str(&grouped);
        if let Some(frac) = frac_part {
            out.push(self.decimal_separator);
            out.push_str(frac);
        }
        out
    }

    /// Applies sign reversal, then direction markers. A recognized direction
    /// decides the sign outright.
    pub fn apply_sign(&self, amount: Decimal, direction: Option<&str>) -> Decimal {
        let amount = if self.reverse_sign { -amount } else { amount };
        let (Some(values), Some(marker)) = (&self.direction, direction) else {
            return amount;
        };
        let marker = marker.trim().to_lowercase();
        let is = |list: &[String]| list.iter().any(|v| v.trim().to_lowercase() == marker);
        if is(&values.outgoing) {
            -amount.abs()
        } else if is(&values.incoming) {
            amount.abs()
        } else {
            amount
        }
    }
}
