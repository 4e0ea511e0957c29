//! drcov log encoding.
//!
//! The produced log uses the drcov version 2 header with a version 2 module
//! table. The basic block table is written as text rows of the form
//! `module[<id>]: 0x<start>, <size>` rather than the packed 8-byte records
//! emitted by DynamoRIO.

use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::trace::BasicBlock;
use crate::{consts, Error, Result};

/// drcov file header containing version and tool information.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub flavor: String,
}

impl Default for FileHeader {
    fn default() -> Self {
        Self {
            version: consts::FILE_VERSION,
            flavor: consts::FLAVOR.to_string(),
        }
    }
}

/// A row of the module table.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ModuleEntry {
    pub id: u32,
    pub base: u64,
    pub end: u64,
    pub entry: u64,
    pub checksum: u32,
    pub timestamp: u32,
    pub path: String,
}

impl ModuleEntry {
    /// Returns the size of the module in bytes.
    pub fn size(&self) -> u64 {
        self.end.saturating_sub(self.base)
    }
}

/// A row of the basic block table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BbEntry {
    pub module_id: u32,
    pub block: BasicBlock,
}

/// A builder for creating `CoverageData` instances.
#[derive(Debug, Default)]
pub struct CoverageBuilder {
    data: CoverageData,
}

impl CoverageBuilder {
    /// Adds a new module to the coverage data.
    /// The module ID will be assigned sequentially.
    pub fn add_module(mut self, path: &str, base: u64, end: u64) -> Self {
        let id = self.data.modules.len() as u32;
        self.data.modules.push(ModuleEntry {
            id,
            path: path.to_string(),
            base,
            end,
            ..Default::default()
        });
        self
    }

    /// Adds fully-specified module entries, such as the table built by
    /// [`Config::module_table`](crate::Config::module_table).
    pub fn add_modules<I: IntoIterator<Item = ModuleEntry>>(mut self, modules: I) -> Self {
        self.data.modules.extend(modules);
        self
    }

    /// Adds a single covered block.
    pub fn add_coverage(mut self, module_id: u32, start: u64, size: u64) -> Self {
        self.data.basic_blocks.push(BbEntry {
            module_id,
            block: BasicBlock { start, size },
        });
        self
    }

    /// Attributes every block of `blocks` to `module_id`, keeping their order.
    pub fn add_blocks<I: IntoIterator<Item = BasicBlock>>(mut self, module_id: u32, blocks: I) -> Self {
        self.data
            .basic_blocks
            .extend(blocks.into_iter().map(|block| BbEntry { module_id, block }));
        self
    }

    /// Consumes the builder and returns the final `CoverageData`.
    ///
    /// # Errors
    /// Returns a `ValidationError` if the constructed data is inconsistent.
    pub fn build(self) -> Result<CoverageData> {
        self.data.validate()?;
        Ok(self.data)
    }
}

/// Everything written to a drcov log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CoverageData {
    pub header: FileHeader,
    pub modules: Vec<ModuleEntry>,
    pub basic_blocks: Vec<BbEntry>,
}

impl CoverageData {
    /// Creates a new `CoverageBuilder` to construct `CoverageData`.
    pub fn builder() -> CoverageBuilder {
        CoverageBuilder::default()
    }

    /// Validates the integrity of the coverage data.
    /// Checks for sequential module IDs, valid basic block references and
    /// module paths that fit on a single ASCII line.
    pub fn validate(&self) -> Result<()> {
        for (i, module) in self.modules.iter().enumerate() {
            if module.id != i as u32 {
                return Err(Error::ValidationError(format!(
                    "Non-sequential module ID {} at index {}",
                    module.id, i
                )));
            }
            if !module.path.is_ascii() || module.path.contains(&['\n', '\r'][..]) {
                return Err(Error::ValidationError(format!(
                    "Module path {:?} is not a single line of ASCII",
                    module.path
                )));
            }
        }

        let num_modules = self.modules.len();
        for bb in &self.basic_blocks {
            if bb.module_id as usize >= num_modules {
                return Err(Error::ValidationError(format!(
                    "Basic block references invalid module ID: {}",
                    bb.module_id
                )));
            }
        }
        Ok(())
    }

    /// Encodes the log into its exact byte representation.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        self.validate()?;

        let mut out = Vec::new();
        writeln!(out, "{}{}", consts::VERSION_PREFIX, self.header.version)?;
        writeln!(out, "{}{}", consts::FLAVOR_PREFIX, self.header.flavor)?;
        writeln!(
            out,
            "{}version {}, count {}",
            consts::MODULE_TABLE_PREFIX,
            consts::MODULE_TABLE_VERSION,
            self.modules.len()
        )?;
        writeln!(out, "{}{}", consts::COLUMNS_PREFIX, consts::MODULE_COLUMNS)?;

        let rows: Vec<String> = self.modules.iter().map(module_line).collect();
        writeln!(out, "{}", rows.join("\n"))?;

        writeln!(
            out,
            "{}{} bbs",
            consts::BB_TABLE_PREFIX,
            self.basic_blocks.len()
        )?;
        writeln!(out, "{}", consts::BB_COLUMNS)?;
        let rows: Vec<String> = self.basic_blocks.iter().map(bb_line).collect();
        out.write_all(rows.join("\n").as_bytes())?;

        Ok(out)
    }
}

fn module_line(module: &ModuleEntry) -> String {
    format!(
        "{:>3}, {:#016x}, {:#016x}, {:#016x}, {:#08x}, {:#08x}, {}",
        module.id,
        module.base,
        module.end,
        module.entry,
        module.checksum,
        module.timestamp,
        module.path
    )
}

fn bb_line(bb: &BbEntry) -> String {
    format!(
        "module[{}]: {:#x}, {}",
        bb.module_id, bb.block.start, bb.block.size
    )
}

/// Writes coverage data to a file path.
///
/// The log is encoded fully in memory and then moved into place, so `path` is
/// left untouched when encoding or writing fails.
pub fn to_file<P: AsRef<Path>>(data: &CoverageData, path: P) -> Result<()> {
    let path = path.as_ref();
    let bytes = data.to_bytes()?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let mut file = NamedTempFile::new_in(dir)?;
    file.write_all(&bytes)?;
    file.flush()?;

    // Temporary files are created owner-only.
    if let Ok(meta) = fs::metadata(path) {
        file.as_file().set_permissions(meta.permissions())?;
    }
    file.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(())
}

/// Writes coverage data to any writer.
pub fn to_writer<W: Write>(data: &CoverageData, writer: &mut W) -> Result<()> {
    writer.write_all(&data.to_bytes()?)?;
    Ok(())
}
