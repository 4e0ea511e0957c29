//! Basic block reconstruction from qemu `exec_tb` traces.
//!
//! A trace is a text log in which every executed translation block shows up
//! as a line such as
//!
//! ```text
//! exec_tb 1.991 pid=24415 tb=0x7fd75f70a4e0 pc=0x344
//! ```
//!
//! Only these lines, and the `exec_tb_nocache` lines qemu emits for blocks
//! run outside the translation cache, are significant. Consecutive records of
//! one thread whose program counters advance by a fixed step are merged into a
//! single block.

use std::fmt::{self, Display, Formatter};
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::iter::FusedIterator;
use std::path::Path;

use log::{debug, info, warn};

use crate::{consts, Config, Error, Result};

/// One parsed `exec_tb` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecRecord {
    pub pc: u64,
    pub thread: u64,
}

impl ExecRecord {
    /// Parses a full `exec_tb` or `exec_tb_nocache` line.
    ///
    /// The thread id is read from the decimal `pid=` field and the program
    /// counter from the hex `pc=` field; other tokens are ignored.
    pub fn parse(line: &str) -> std::result::Result<Self, String> {
        let mut tokens = line.split_ascii_whitespace();
        match tokens.next() {
            Some(consts::EXEC_MARKER | consts::EXEC_NOCACHE_MARKER) => {}
            _ => return Err(format!("expected a '{}' record", consts::EXEC_MARKER)),
        }

        let mut thread = None;
        let mut pc = None;
        for (key, value) in tokens.filter_map(|token| token.split_once('=')) {
            match key {
                consts::THREAD_KEY => thread = Some(value),
                consts::PC_KEY => pc = Some(value),
                _ => {}
            }
        }

        let thread = thread.ok_or_else(|| format!("missing '{}=' field", consts::THREAD_KEY))?;
        let pc = pc.ok_or_else(|| format!("missing '{}=' field", consts::PC_KEY))?;

        let thread = thread
            .parse::<u64>()
            .map_err(|_| format!("invalid thread id '{thread}'"))?;
        let digits = pc
            .strip_prefix("0x")
            .or_else(|| pc.strip_prefix("0X"))
            .unwrap_or(pc);
        let pc = u64::from_str_radix(digits, 16)
            .map_err(|_| format!("invalid program counter '{pc}'"))?;

        Ok(Self { pc, thread })
    }
}

fn is_exec_marker(line: &[u8]) -> bool {
    [consts::EXEC_MARKER, consts::EXEC_NOCACHE_MARKER]
        .iter()
        .any(|marker| {
            line.strip_prefix(marker.as_bytes())
                .is_some_and(|rest| rest.first().map_or(true, u8::is_ascii_whitespace))
        })
}

/// Lazy iterator over the `exec_tb` records of a trace.
///
/// Non-record lines are skipped. Iteration ends at end of input, or right
/// after the first error.
#[derive(Debug)]
pub struct Records<R> {
    reader: R,
    buf: Vec<u8>,
    line: usize,
    done: bool,
}

impl<R: BufRead> Records<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buf: Vec::new(),
            line: 0,
            done: false,
        }
    }

    /// 1-based number of the last line read.
    pub fn line_number(&self) -> usize {
        self.line
    }

    fn next_record(&mut self) -> Result<Option<ExecRecord>> {
        loop {
            self.buf.clear();
            if self.reader.read_until(b'\n', &mut self.buf)? == 0 {
                return Ok(None);
            }
            self.line += 1;

            if !is_exec_marker(&self.buf) {
                continue;
            }

            let text = std::str::from_utf8(&self.buf).map_err(|_| Error::MalformedRecord {
                line: self.line,
                reason: "record is not valid UTF-8".to_string(),
            })?;
            return ExecRecord::parse(text)
                .map(Some)
                .map_err(|reason| Error::MalformedRecord {
                    line: self.line,
                    reason,
                });
        }
    }
}

impl<R: BufRead> Iterator for Records<R> {
    type Item = Result<ExecRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: BufRead> FusedIterator for Records<R> {}

/// An executed basic block, reconstructed from address deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BasicBlock {
    /// Address of the first record of the block.
    pub start: u64,
    /// Size in bytes, counted inclusively up to the last recorded address.
    pub size: u64,
}

/// Outcome of feeding one record to a [`BlockBuilder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Advance {
    /// The record continued the open block.
    Extended,
    /// The record started a new block; the closed one is returned.
    Split(BasicBlock),
    /// The record belongs to another thread and was dropped.
    Ignored,
}

/// Block state machine for a single thread.
#[derive(Debug, Clone)]
pub struct BlockBuilder {
    thread: u64,
    step: u64,
    start: u64,
    current: u64,
}

impl BlockBuilder {
    /// Opens the first block at `first`, tracking its thread from now on.
    pub fn new(first: ExecRecord, step: u64) -> Self {
        Self {
            thread: first.thread,
            step,
            start: first.pc,
            current: first.pc,
        }
    }

    pub fn thread(&self) -> u64 {
        self.thread
    }

    pub fn tracks(&self, record: &ExecRecord) -> bool {
        record.thread == self.thread
    }

    /// Whether `pc` directly follows the last address of the open block.
    pub fn chains(&self, pc: u64) -> bool {
        self.current.checked_add(self.step) == Some(pc)
    }

    /// The open block as it would be emitted right now.
    pub fn current_block(&self) -> BasicBlock {
        BasicBlock {
            start: self.start,
            size: (self.current - self.start).saturating_add(1),
        }
    }

    pub fn push(&mut self, record: ExecRecord) -> Advance {
        if !self.tracks(&record) {
            return Advance::Ignored;
        }
        if self.chains(record.pc) {
            self.current = record.pc;
            return Advance::Extended;
        }
        let closed = self.current_block();
        self.start = record.pc;
        self.current = record.pc;
        Advance::Split(closed)
    }

    /// Closes the open block.
    pub fn finish(self) -> BasicBlock {
        self.current_block()
    }
}

/// Non-fatal events observed while reading a trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A record of a thread other than the tracked one was dropped.
    ThreadMismatch { line: usize, thread: u64, pc: u64 },
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::ThreadMismatch { line, thread, pc } => {
                write!(f, "line {line}: ignoring thread {thread} at 0x{pc:x}")
            }
        }
    }
}

/// The blocks reconstructed from one trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockTrace {
    /// Thread id of the first record; the only one tracked.
    pub thread: u64,
    /// Number of `exec_tb` records seen, ignored ones included.
    pub records: usize,
    pub blocks: Vec<BasicBlock>,
    pub diagnostics: Vec<Diagnostic>,
}

impl BlockTrace {
    pub fn covered_bytes(&self) -> u64 {
        self.blocks
            .iter()
            .fold(0u64, |total, bb| total.saturating_add(bb.size))
    }

    pub fn ignored_records(&self) -> usize {
        self.diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::ThreadMismatch { .. }))
            .count()
    }
}

/// Reads a trace file and reconstructs its basic blocks.
pub fn from_file<P: AsRef<Path>>(path: P, config: &Config) -> Result<BlockTrace> {
    read_trace(BufReader::new(File::open(path)?), config)
}

/// Reads a trace from any buffered reader and reconstructs its basic blocks.
///
/// # Errors
/// Returns `MalformedRecord` for an unparsable `exec_tb` line and
/// `EmptyTrace` when the input holds no `exec_tb` line at all.
pub fn read_trace<R: BufRead>(reader: R, config: &Config) -> Result<BlockTrace> {
    config.validate()?;

    let mut records = Records::new(reader);
    let first = match records.next() {
        Some(record) => record?,
        None => return Err(Error::EmptyTrace),
    };
    debug!(
        "tracking thread {} starting at 0x{:x}",
        first.thread, first.pc
    );

    let mut builder = BlockBuilder::new(first, config.step);
    let mut blocks = Vec::new();
    let mut diagnostics = Vec::new();
    let mut count = 1;

    while let Some(record) = records.next() {
        let record = record?;
        count += 1;
        match builder.push(record) {
            Advance::Extended => {}
            Advance::Split(block) => {
                debug!("new block found at 0x{:x}", record.pc);
                blocks.push(block);
            }
            Advance::Ignored => {
                let diagnostic = Diagnostic::ThreadMismatch {
                    line: records.line_number(),
                    thread: record.thread,
                    pc: record.pc,
                };
                warn!("{diagnostic}");
                diagnostics.push(diagnostic);
            }
        }
    }

    let thread = builder.thread();
    blocks.push(builder.finish());
    info!(
        "done parsing trace: {} records, {} blocks for thread {}",
        count,
        blocks.len(),
        thread
    );

    Ok(BlockTrace {
        thread,
        records: count,
        blocks,
        diagnostics,
    })
}
