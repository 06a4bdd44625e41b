use chrono::NaiveDate;
use fincon_core::{CategoryPath, DateRange};
use fincon_storage::WriteMode;
use std::path::PathBuf;
use thiserror::Error;

pub const USAGE: &str = "\
usage: fincon [--config PATH] <command>

commands:
  import FILE [--institution ID] [--mode append|overwrite] [--ai] [--dry-run]
              [--from YYYY-MM-DD] [--to YYYY-MM-DD] [--json]
  correct ID CATEGORY
              recategorize a stored transaction; CATEGORY is
              \"Tier1 > Tier2 > Tier3\" or three separate words
  formats     list configured institution formats
  watch       import files dropped into the intake folder [--mode ..] [--ai]
";

#[derive(Debug, Error, PartialEq)]
pub enum UsageError {
    #[error("missing command")]
    MissingCommand,
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("option {0} needs a value")]
    MissingValue(String),
    #[error("import needs a file")]
    MissingFile,
    #[error("correct needs a transaction id and a category")]
    MissingCorrection,
    #[error("invalid value for {option}: {message}")]
    InvalidValue { option: String, message: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportArgs {
    pub file: PathBuf,
    pub institution: Option<String>,
    pub mode: WriteMode,
    pub ai: bool,
    pub dry_run: bool,
    pub date_range: DateRange,
    pub json: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Import(ImportArgs),
    Correct { id: String, category: CategoryPath },
    Formats,
    Watch { mode: WriteMode, ai: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Cli {
    pub config: Option<PathBuf>,
    pub command: Command,
}

impl Cli {
    /// Parses arguments without the program name.
    pub fn parse(args: impl IntoIterator<Item = String>) -> Result<Self, UsageError> {
        let mut args = args.into_iter();
        let mut config = None;
        let mut command_name = None;
        let mut rest = Vec::new();

        while let Some(arg) = args.next() {
            if command_name.is_none() && arg == "--config" {
                config = Some(PathBuf::from(value(&mut args, &arg)?));
            } else if command_name.is_none() && !arg.starts_with('-') {
                command_name = Some(arg);
            } else if command_name.is_some() {
                rest.push(arg);
            } else {
                return Err(UsageError::UnknownOption(arg));
            }
        }

        let command = match command_name.as_deref() {
            None => return Err(UsageError::MissingCommand),
            Some("import") => Command::Import(parse_import(rest)?),
            Some("correct") => parse_correct(rest)?,
            Some("formats") => match rest.into_iter().next() {
                Some(extra) => return Err(UsageError::UnknownOption(extra)),
                None => Command::Formats,
            },
            Some("watch") => {
                let (mut mode, mut ai) = (WriteMode::Append, false);
                let mut rest = rest.into_iter();
                while let Some(arg) = rest.next() {
                    match arg.as_str() {
                        "--mode" => mode = parse_mode(&value(&mut rest, &arg)?)?,
                        "--ai" => ai = true,
                        _ => return Err(UsageError::UnknownOption(arg)),
                    }
                }
                Command::Watch { mode, ai }
            }
            Some(other) => return Err(UsageError::UnknownCommand(other.to_string())),
        };
        Ok(Cli { config, command })
    }
}

fn parse_import(rest: Vec<String>) -> Result<ImportArgs, UsageError> {
    let mut file = None;
    let mut parsed = ImportArgs {
        file: PathBuf::new(),
        institution: None,
        mode: WriteMode::Append,
        ai: false,
        dry_run: false,
        date_range: DateRange::default(),
        json: false,
    };
    let mut rest = rest.into_iter();
    while let Some(arg) = rest.next() {
        match arg.as_str() {
            "--institution" => parsed.institution = Some(value(&mut rest, &arg)?),
            "--mode" => parsed.mode = parse_mode(&value(&mut rest, &arg)?)?,
            "--ai" => parsed.ai = true,
            "--dry-run" => parsed.dry_run = true,
            "--json" => parsed.json = true,
            "--from" => parsed.date_range.start = Some(parse_date(&arg, &value(&mut rest, &arg)?)?),
            "--to" => parsed.date_range.end = Some(parse_date(&arg, &value(&mut rest, &arg)?)?),
            _ if arg.starts_with("--") => return Err(UsageError::UnknownOption(arg)),
            _ if file.is_none() => file = Some(PathBuf::from(arg)),
            _ => return Err(UsageError::UnknownOption(arg)),
        }
    }
    parsed.file = file.ok_or(UsageError::MissingFile)?;
    Ok(parsed)
}

fn parse_correct(rest: Vec<String>) -> Result<Command, UsageError> {
    if let Some(option) = rest.iter().find(|a| a.starts_with("--")) {
        return Err(UsageError::UnknownOption(option.clone()));
    }
    let mut rest = rest.into_iter();
    let id = rest.next().ok_or(UsageError::MissingCorrection)?;
    let words: Vec<String> = rest.collect();
    let category = match words.as_slice() {
        [] => return Err(UsageError::MissingCorrection),
        [t1, t2, t3] if !words.iter().any(|w| w.contains('>')) => CategoryPath::new(t1, t2, t3),
        _ => words.join(" ").parse().map_err(|message| UsageError::InvalidValue {
            option: "CATEGORY".to_string(),
            message,
        })?,
    };
    Ok(Command::Correct { id, category })
}

fn value(args: &mut impl Iterator<Item = String>, option: &str) -> Result<String, UsageError> {
    args.next().ok_or_else(|| UsageError::MissingValue(option.to_string()))
}

fn parse_mode(raw: &str) -> Result<WriteMode, UsageError> {
    raw.parse()
        .map_err(|message| UsageError::InvalidValue { option: "--mode".to_string(), message })
}

fn parse_date(option: &str, raw: &str) -> Result<NaiveDate, UsageError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|e| UsageError::InvalidValue {
        option: option.to_string(),
        message: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Cli, UsageError> {
        Cli::parse(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn parses_import_with_options() {
        let cli = parse(&[
            "--config", "/etc/fincon.toml", "import", "pohyby.csv", "--mode", "overwrite", "--ai", "--from", "2025-10-01",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("/etc/fincon.toml")));
        let Command::Import(args) = cli.command else { panic!("expected import") };
        assert_eq!(args.file, PathBuf::from("pohyby.csv"));
        assert_eq!(args.mode, WriteMode::Overwrite);
        assert!(args.ai);
        assert!(!args.dry_run);
        assert_eq!(args.date_range.start, NaiveDate::from_ymd_opt(2025, 10, 1));
        assert_eq!(args.date_range.end, None);
    }

    #[test]
    fn rejects_bad_input() {
        assert_eq!(parse(&[]), Err(UsageError::MissingCommand));
        assert_eq!(parse(&["import"]), Err(UsageError::MissingFile));
        assert_eq!(parse(&["sync"]), Err(UsageError::UnknownCommand("sync".into())));
        assert_eq!(parse(&["import", "a.csv", "--mode"]), Err(UsageError::MissingValue("--mode".into())));
        assert!(matches!(parse(&["import", "a.csv", "--mode", "merge"]), Err(UsageError::InvalidValue { .. })));
        assert!(matches!(parse(&["import", "a.csv", "--to", "31.10.2025"]), Err(UsageError::InvalidValue { .. })));
    }

    #[test]
    fn parses_correct_in_both_category_forms() {
        let rent = CategoryPath::new("Living", "Housing", "Rent");
        assert_eq!(
            parse(&["correct", "abc123", "Living > Housing > Rent"]).unwrap().command,
            Command::Correct { id: "abc123".into(), category: rent.clone() }
        );
        assert_eq!(
            parse(&["correct", "abc123", "Living", "Housing", "Rent"]).unwrap().command,
            Command::Correct { id: "abc123".into(), category: rent }
        );
        assert_eq!(parse(&["correct", "abc123"]), Err(UsageError::MissingCorrection));
        assert!(matches!(parse(&["correct", "abc123", "Living > Rent"]), Err(UsageError::InvalidValue { .. })));
        assert_eq!(
            parse(&["correct", "abc123", "a", "b", "c", "--json"]),
            Err(UsageError::UnknownOption("--json".into()))
        );
    }

    #[test]
    fn parses_watch_and_formats() {
        assert_eq!(parse(&["formats"]).unwrap().command, Command::Formats);
        assert_eq!(
            parse(&["watch", "--ai"]).unwrap().command,
            Command::Watch { mode: WriteMode::Append, ai: true }
        );
    }
}
