//! # qemutrace2drcov
//!
//! Converts qemu `exec_tb` execution traces into drcov basic block coverage
//! logs that coverage explorers such as Lighthouse can load.
//!
//! A trace is produced by running qemu with the `exec_tb` trace event enabled.
//! Consecutive translation blocks of the first traced thread are merged into
//! basic blocks, which are then attributed to a single synthetic module.
//!
//! ## References
//!
//! - DrCov format analysis: <https://www.ayrx.me/drcov-file-format/>
//! - Lighthouse plugin: <https://github.com/gaasedelen/lighthouse>
//!
//! ## Example Usage
//!
//! ```no_run
//! use qemutrace2drcov::Config;
//!
//! let config = Config::default().module_range(0x400000, 0x500000);
//! let trace = qemutrace2drcov::translate_file("target", "trace.log", "out.drcov", &config).unwrap();
//! println!("{} blocks for thread {}", trace.blocks.len(), trace.thread);
//! ```

use std::fmt::{self, Display, Formatter};
use std::io::{self, BufRead, Write};
use std::path::Path;

pub mod config;
pub mod coverage;
pub mod trace;

pub use config::Config;
pub use coverage::{to_file, to_writer, BbEntry, CoverageData, FileHeader, ModuleEntry};
pub use trace::{read_trace, BasicBlock, BlockTrace, Diagnostic, ExecRecord, Records};

/// A specialized `Result` type for trace conversion.
pub type Result<T> = std::result::Result<T, Error>;

/// Represents errors that can occur while converting a trace.
#[derive(Debug)]
pub enum Error {
    /// An I/O error occurred while reading or writing.
    Io(io::Error),
    /// An `exec_tb` record could not be parsed.
    MalformedRecord { line: usize, reason: String },
    /// The trace holds no `exec_tb` record.
    EmptyTrace,
    /// The data failed a validation check (e.g., inconsistent IDs).
    ValidationError(String),
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "I/O error: {e}"),
            Error::MalformedRecord { line, reason } => {
                write!(f, "Malformed record at line {line}: {reason}")
            }
            Error::EmptyTrace => write!(f, "Trace contains no {} records", consts::EXEC_MARKER),
            Error::ValidationError(msg) => write!(f, "Validation error: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// Constants used throughout the library.
mod consts {
    pub(crate) const EXEC_MARKER: &str = "exec_tb";
    pub(crate) const EXEC_NOCACHE_MARKER: &str = "exec_tb_nocache";
    pub(crate) const THREAD_KEY: &str = "pid";
    pub(crate) const PC_KEY: &str = "pc";

    pub(crate) const DEFAULT_STEP: u64 = 4;
    pub(crate) const DEFAULT_MODULE_BASE: u64 = 0x100;
    pub(crate) const DEFAULT_MODULE_END: u64 = 0xFFFFFF;

    pub(crate) const FILE_VERSION: u32 = 2;
    pub(crate) const FLAVOR: &str = "drcov";
    pub(crate) const MODULE_TABLE_VERSION: u32 = 2;
    pub(crate) const VERSION_PREFIX: &str = "DRCOV VERSION: ";
    pub(crate) const FLAVOR_PREFIX: &str = "DRCOV FLAVOR: ";
    pub(crate) const MODULE_TABLE_PREFIX: &str = "Module Table: ";
    pub(crate) const COLUMNS_PREFIX: &str = "Columns: ";
    pub(crate) const MODULE_COLUMNS: &str = "id, base, end, entry, checksum, timestamp, path";
    pub(crate) const BB_TABLE_PREFIX: &str = "BB Table: ";
    pub(crate) const BB_COLUMNS: &str = "module id, start, size:";
}

/// Builds the coverage log for `trace`, attributing every block to the single
/// module named `base_module`.
pub fn coverage_for(base_module: &str, trace: &BlockTrace, config: &Config) -> Result<CoverageData> {
    config.validate()?;
    CoverageData::builder()
        .add_modules(config.module_table(base_module))
        .add_blocks(0, trace.blocks.iter().copied())
        .build()
}

/// Converts a trace read from `reader` and writes the drcov log to `writer`.
///
/// Nothing is written unless the whole trace was read successfully.
pub fn translate<R: BufRead, W: Write>(
    base_module: &str,
    reader: R,
    writer: &mut W,
    config: &Config,
) -> Result<BlockTrace> {
    let trace = read_trace(reader, config)?;
    let coverage = coverage_for(base_module, &trace, config)?;
    to_writer(&coverage, writer)?;
    Ok(trace)
}

/// Converts the trace at `input` and writes the drcov log to `output`.
///
/// `output` is neither created nor truncated when the conversion fails.
pub fn translate_file<P: AsRef<Path>, Q: AsRef<Path>>(
    base_module: &str,
    input: P,
    output: Q,
    config: &Config,
) -> Result<BlockTrace> {
    let trace = trace::from_file(input, config)?;
    let coverage = coverage_for(base_module, &trace, config)?;
    to_file(&coverage, output)?;
    Ok(trace)
}
