use crate::coverage::ModuleEntry;
use crate::{consts, Error, Result};

/// Settings for a single trace-to-coverage run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Distance between two contiguous `exec_tb` addresses.
    pub step: u64,
    /// Base address of the synthetic module.
    pub module_base: u64,
    /// End address of the synthetic module.
    pub module_end: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            step: consts::DEFAULT_STEP,
            module_base: consts::DEFAULT_MODULE_BASE,
            module_end: consts::DEFAULT_MODULE_END,
        }
    }
}

impl Config {
    /// Sets the contiguity step.
    pub fn step(mut self, step: u64) -> Self {
        self.step = step;
        self
    }

    /// Sets the address range of the synthetic module.
    pub fn module_range(mut self, base: u64, end: u64) -> Self {
        self.module_base = base;
        self.module_end = end;
        self
    }

    /// Rejects a zero step and a module range that ends below its base.
    pub fn validate(&self) -> Result<()> {
        if self.step == 0 {
            return Err(Error::ValidationError(
                "Instruction step must be non-zero".to_string(),
            ));
        }
        if self.module_end < self.module_base {
            return Err(Error::ValidationError(format!(
                "Module end 0x{:x} lies below module base 0x{:x}",
                self.module_end, self.module_base
            )));
        }
        Ok(())
    }

    /// Builds the module table for a run: a single module with id 0 whose
    /// path is `base_module`.
    pub fn module_table(&self, base_module: &str) -> Vec<ModuleEntry> {
        vec![ModuleEntry {
            id: 0,
            base: self.module_base,
            end: self.module_end,
            path: base_module.to_string(),
            ..Default::default()
        }]
    }
}
