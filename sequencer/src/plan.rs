//! Macro plans and their interchange formats

use crate::MacroError;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_CAPTURES: u32 = 1;
pub const DEFAULT_EXPOSURE_US: u32 = 1000;
pub const DEFAULT_GAIN_PERCENT: u16 = 100;
pub const DEFAULT_PREFIX: &str = "macro_";

const CSV_COLUMNS: [&str; 5] = ["captures", "exposure", "gain", "prefix", "directory"];

/// One row of a macro plan
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MacroStep {
    pub captures: u32,
    pub exposure_us: u32,
    pub gain_percent: u16,
    pub prefix: String,
    /// Unset or empty inherits the global output directory
    #[serde(default)]
    pub directory: Option<PathBuf>,
}

impl Default for MacroStep {
    fn default() -> Self {
        Self {
            captures: DEFAULT_CAPTURES,
            exposure_us: DEFAULT_EXPOSURE_US,
            gain_percent: DEFAULT_GAIN_PERCENT,
            prefix: DEFAULT_PREFIX.to_string(),
            directory: None,
        }
    }
}

impl MacroStep {
    pub fn new(captures: u32, exposure_us: u32, gain_percent: u16, prefix: &str) -> Self {
        Self {
            captures,
            exposure_us,
            gain_percent,
            prefix: prefix.to_string(),
            directory: None,
        }
    }

    pub fn with_directory(mut self, directory: impl Into<PathBuf>) -> Self {
        self.directory = Some(directory.into());
        self
    }
}

/// A step whose directory has been fixed at macro start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStep {
    pub captures: u32,
    pub exposure_us: u32,
    pub gain_percent: u16,
    pub prefix: String,
    pub directory: PathBuf,
}

/// Ordered list of macro steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MacroPlan {
    steps: Vec<MacroStep>,
}

impl MacroPlan {
    pub fn new(steps: Vec<MacroStep>) -> Self {
        Self { steps }
    }

    pub fn push(&mut self, step: MacroStep) {
        self.steps.push(step);
    }

    pub fn steps(&self) -> &[MacroStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Sum of captures over all steps
    /// Saturates at `u32::MAX`; `validate` rejects plans that would overflow
    pub fn total_captures(&self) -> u32 {
        self.steps
            .iter()
            .fold(0u32, |total, s| total.saturating_add(s.captures))
    }

    pub fn validate(&self) -> Result<(), MacroError> {
        let mut total = 0u32;
        for (i, step) in self.steps.iter().enumerate() {
            if step.captures == 0 {
                return Err(MacroError::InvalidPlan(format!(
                    "step {} has zero captures",
                    i + 1
                )));
            }
            total = total.checked_add(step.captures).ok_or_else(|| {
                MacroError::InvalidPlan(format!("capture count overflows at step {}", i + 1))
            })?;
        }
        Ok(())
    }

    /// Fix every unset directory to `global_directory`.
    ///
    /// The result is a snapshot; later changes to the global directory do
    /// not affect it.
    pub fn resolve(&self, global_directory: &Path) -> Vec<ResolvedStep> {
        self.steps
            .iter()
            .map(|step| ResolvedStep {
                captures: step.captures,
                exposure_us: step.exposure_us,
                gain_percent: step.gain_percent,
                prefix: step.prefix.clone(),
                directory: match &step.directory {
                    Some(dir) if !dir.as_os_str().is_empty() => dir.clone(),
                    _ => global_directory.to_path_buf(),
                },
            })
            .collect()
    }

    // =========================================================================
    // INTERCHANGE
    // =========================================================================

    /// Read a plan from delimited text with a header row.
    ///
    /// Missing or unparseable cells take the step defaults; an empty
    /// directory inherits the global directory.
    pub fn read_csv<R: Read>(reader: R) -> Result<Self, MacroError> {
        let mut csv_reader = csv::ReaderBuilder::new()
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = csv_reader.headers()?.clone();
        let column = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));
        let [captures_col, exposure_col, gain_col, prefix_col, directory_col] = CSV_COLUMNS.map(column);

        let mut plan = MacroPlan::default();
        for (row, record) in csv_reader.records().enumerate() {
            let record = record?;
            let cell = |col: Option<usize>| col.and_then(|i| record.get(i)).filter(|s| !s.is_empty());

            plan.push(MacroStep {
                captures: parse_cell(cell(captures_col), DEFAULT_CAPTURES, row, "captures"),
                exposure_us: parse_cell(cell(exposure_col), DEFAULT_EXPOSURE_US, row, "exposure"),
                gain_percent: parse_cell(cell(gain_col), DEFAULT_GAIN_PERCENT, row, "gain"),
                prefix: cell(prefix_col).unwrap_or(DEFAULT_PREFIX).to_string(),
                directory: cell(directory_col).map(PathBuf::from),
            });
        }
        Ok(plan)
    }

    pub fn write_csv<W: Write>(&self, writer: W) -> Result<(), MacroError> {
        let mut csv_writer = csv::Writer::from_writer(writer);
        csv_writer.write_record(CSV_COLUMNS)?;
        for step in &self.steps {
            let directory = step
                .directory
                .as_ref()
                .map(|d| d.to_string_lossy().into_owned())
                .unwrap_or_default();
            csv_writer.write_record([
                step.captures.to_string(),
                step.exposure_us.to_string(),
                step.gain_percent.to_string(),
                step.prefix.clone(),
                directory,
            ])?;
        }
        csv_writer.flush()?;
        Ok(())
    }

    /// Load from `.json`, otherwise from delimited text
    pub fn load(path: &Path) -> Result<Self, MacroError> {
        let reader = BufReader::new(File::open(path)?);
        if is_json(path) {
            Ok(serde_json::from_reader(reader)?)
        } else {
            Self::read_csv(reader)
        }
    }

    /// Save as `.json`, otherwise as delimited text
    pub fn save(&self, path: &Path) -> Result<(), MacroError> {
        let mut writer = BufWriter::new(File::create(path)?);
        if is_json(path) {
            serde_json::to_writer_pretty(&mut writer, self)?;
            writer.flush()?;
            Ok(())
        } else {
            self.write_csv(writer)
        }
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false)
}

fn parse_cell<T: std::str::FromStr + Copy>(cell: Option<&str>, default: T, row: usize, column: &str) -> T {
    match cell {
        None => default,
        Some(text) => text.parse().unwrap_or_else(|_| {
            tracing::warn!("Macro plan row {}: invalid {} '{}', using default", row + 1, column, text);
            default
        }),
    }
}
