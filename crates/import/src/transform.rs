use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{ConfigError, RowError};
use crate::field::ColumnRef;

/// Header name to zero-based column position.
pub type Header = HashMap<String, usize>;

/// One source row while transformations run. Transformation outputs shadow
/// source cells; names present in the header resolve to their position.
pub struct Row<'h> {
    pub number: usize,
    cells: Vec<String>,
    header: &'h Header,
    derived: HashMap<ColumnRef, String>,
}

impl<'h> Row<'h> {
    pub fn new(number: usize, cells: Vec<String>, header: &'h Header) -> Self {
        Self { number, cells, header, derived: HashMap::new() }
    }

    pub fn cells(&self) -> &[String] {
        &self.cells
    }

    pub fn is_blank(&self) -> bool {
        self.cells.iter().all(|c| c.trim().is_empty())
    }

    fn key(&self, column: &ColumnRef) -> ColumnRef {
        match column {
            ColumnRef::Name(n) => match self.header.get(n) {
                Some(i) => ColumnRef::Index(*i),
                None => column.clone(),
            },
            ColumnRef::Index(_) => column.clone(),
        }
    }

    pub fn get(&self, column: &ColumnRef) -> Option<&str> {
        let key = self.key(column);
        if let Some(v) = self.derived.get(&key) {
            return Some(v.as_str());
        }
        match key {
            ColumnRef::Index(i) => self.cells.get(i).map(String::as_str),
            ColumnRef::Name(_) => None,
        }
    }

    pub fn set(&mut self, column: &ColumnRef, value: String) {
        let key = self.key(column);
        self.derived.insert(key, value);
    }

    fn require(&self, column: &ColumnRef) -> Result<&str, RowError> {
        self.get(column).ok_or_else(|| RowError::MissingColumn {
            row: self.number,
            column: column.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConcatPart {
    Column { column: ColumnRef },
    Literal { literal: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitTarget {
    pub index: usize,
    pub target: ColumnRef,
}

/// A declared field transformation, applied in file order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Transformation {
    /// Joins columns and literals into `target`. Columns absent from a short row are skipped.
    Concatenate {
        target: ColumnRef,
        parts: Vec<ConcatPart>,
        #[serde(default)]
        separator: String,
    },
    /// Trims `chars` (whitespace when unset) from both ends.
    Strip {
        column: ColumnRef,
        target: Option<ColumnRef>,
        chars: Option<String>,
    },
    Replace {
        column: ColumnRef,
        target: Option<ColumnRef>,
        pattern: String,
        #[serde(default)]
        replacement: String,
        #[serde(default)]
        regex: bool,
    },
    Split {
        column: ColumnRef,
        separator: String,
        into: Vec<SplitTarget>,
    },
}

impl Transformation {
    fn inputs(&self) -> Vec<ColumnRef> {
        match self {
            Transformation::Concatenate { parts, .. } => parts
                .iter()
                .filter_map(|p| match p {
                    ConcatPart::Column { column } => Some(column.clone()),
                    ConcatPart::Literal { .. } => None,
                })
                .collect(),
            Transformation::Strip { column, .. }
            | Transformation::Replace { column, .. }
            | Transformation::Split { column, .. } => vec![column.clone()],
        }
    }

    fn outputs(&self) -> Vec<ColumnRef> {
        match self {
            Transformation::Concatenate { target, .. } => vec![target.clone()],
            Transformation::Strip { column, target, .. } | Transformation::Replace { column, target, .. } => {
                vec![target.clone().unwrap_or_else(|| column.clone())]
            }
            Transformation::Split { into, .. } => into.iter().map(|t| t.target.clone()).collect(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Transformation::Concatenate { .. } => "concatenate",
            Transformation::Strip { .. } => "strip",
            Transformation::Replace { .. } => "replace",
            Transformation::Split { .. } => "split",
        }
    }
}

pub struct CompiledTransform {
    step: Transformation,
    regex: Option<Regex>,
    inputs: Vec<ColumnRef>,
    outputs: Vec<ColumnRef>,
}

impl CompiledTransform {
    fn compile(step: Transformation) -> Result<Self, ConfigError> {
        let regex = match &step {
            Transformation::Replace { pattern, regex: true, .. } => {
                Some(Regex::new(pattern).map_err(|e| ConfigError::regex(pattern, e))?)
            }
            _ => None,
        };
        if let Transformation::Split { into, .. } = &step {
            let mut seen = std::collections::HashSet::new();
            for t in into {
                if !seen.insert(t.index) {
                    return Err(ConfigError::DuplicateSplitIndex(t.index));
                }
            }
        }
        Ok(Self { inputs: step.inputs(), outputs: step.outputs(), step, regex })
    }

    /// Writes that bring a column into existence, as opposed to rewriting
    /// one of this step's own inputs in place.
    fn creates(&self, column: &ColumnRef) -> bool {
        self.outputs.contains(column) && !self.inputs.contains(column)
    }

    pub fn apply(&self, row: &mut Row<'_>) -> Result<(), RowError> {
        match &self.step {
            Transformation::Concatenate { target, parts, separator } => {
                let joined = parts
                    .iter()
                    .filter_map(|p| match p {
                        ConcatPart::Column { column } => row.get(column).map(str::to_string),
                        ConcatPart::Literal { literal } => Some(literal.clone()),
                    })
                    .collect::<Vec<_>>()
                    .join(separator);
                row.set(target, joined);
            }
            Transformation::Strip { column, target, chars } => {
                let value = row.require(column)?;
                let stripped = match chars {
                    Some(set) => value.trim_matches(|c| set.contains(c)).to_string(),
                    None => value.trim().to_string(),
                };
                row.set(target.as_ref().unwrap_or(column), stripped);
            }
            Transformation::Replace { column, target, pattern, replacement, .. } => {
                let value = row.require(column)?;
                let replaced = match &self.regex {
                    Some(re) => re.replace_all(value, replacement.as_str()).into_owned(),
                    None => value.replace(pattern.as_str(), replacement),
                };
                row.set(target.as_ref().unwrap_or(column), replaced);
            }
            Transformation::Split { column, separator, into } => {
                let parts: Vec<String> = row
                    .require(column)?
                    .split(separator.as_str())
                    .map(|p| p.trim().to_string())
                    .collect();
                for t in into {
                    let value = parts.get(t.index).ok_or_else(|| RowError::Transform {
                        row: row.number,
                        message: format!(
                            "split of {column} has {} parts, index {} requested",
                            parts.len(),
                            t.index
                        ),
                    })?;
                    row.set(&t.target, value.clone());
                }
            }
        }
        Ok(())
    }
}

pub(crate) fn compile_steps(steps: Vec<Transformation>) -> Result<Vec<CompiledTransform>, ConfigError> {
    steps.into_iter().map(CompiledTransform::compile).collect()
}

/// Rejects cyclic or forward-referencing chains.
///
/// A read binds to the nearest earlier step that creates the column, else to
/// the source cell when `header` lists it. A read with neither but a later
/// creator is a forward reference; if following those bindings loops back, it
/// is a cycle. Without a header every read is checked.
pub fn check_order(steps: &[CompiledTransform], header: Option<&Header>) -> Result<(), ConfigError> {
    let in_source = |column: &ColumnRef| match (header, column) {
        (Some(h), ColumnRef::Name(n)) => h.contains_key(n),
        (Some(h), ColumnRef::Index(i)) => h.values().any(|p| p == i),
        (None, _) => false,
    };

    let n = steps.len();
    let mut edges: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut forward: Option<(usize, ColumnRef)> = None;

    for (j, step) in steps.iter().enumerate() {
        for column in &step.inputs {
            if let Some(i) = (0..j).rev().find(|&i| steps[i].creates(column)) {
                edges[j].push(i);
            } else if in_source(column) {
                // Reads the file's own cell.
            } else if let Some(w) = (j + 1..n).find(|&w| steps[w].creates(column)) {
                edges[j].push(w);
                forward.get_or_insert((j, column.clone()));
            }
        }
    }

    if let Some(cycle) = find_cycle(&edges) {
        let chain = cycle
            .iter()
            .map(|&i| format!("#{} {}", i + 1, steps[i].step.name()))
            .collect::<Vec<_>>()
            .join(" -> ");
        return Err(ConfigError::TransformCycle(chain));
    }
    if let Some((step, column)) = forward {
        return Err(ConfigError::ForwardReference { step: step + 1, column });
    }
    Ok(())
}

fn find_cycle(edges: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        New,
        Active,
        Done,
    }

    fn visit(node: usize, edges: &[Vec<usize>], marks: &mut [Mark], path: &mut Vec<usize>) -> Option<Vec<usize>> {
        marks[node] = Mark::Active;
        path.push(node);
        for &next in &edges[node] {
            match marks[next] {
                Mark::Active => {
                    let start = path.iter().position(|&p| p == next).unwrap_or(0);
                    let mut cycle = path[start..].to_vec();
                    cycle.push(next);
                    return Some(cycle);
                }
                Mark::New => {
                    if let Some(cycle) = visit(next, edges, marks, path) {
                        return Some(cycle);
                    }
                }
                Mark::Done => {}
            }
        }
        path.pop();
        marks[node] = Mark::Done;
        None
    }

    let mut marks = vec![Mark::New; edges.len()];
    let mut path = Vec::new();
    for start in 0..edges.len() {
        if marks[start] == Mark::New {
            if let Some(cycle) = visit(start, edges, &mut marks, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

pub fn apply_all(steps: &[CompiledTransform], row: &mut Row<'_>) -> Result<(), RowError> {
    steps.iter().try_for_each(|s| s.apply(row))
}
