//! Build options recognized by the program builder.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::primitive::PrimitiveId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TuningMode {
    #[default]
    None,
    TuneAndCache,
    RetuneAndCache,
    UseCache,
}

impl TuningMode {
    /// Tuning modes that run kernels and therefore need a profiling queue.
    pub fn requires_profiling(self) -> bool {
        matches!(self, TuningMode::TuneAndCache | TuningMode::RetuneAndCache)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TuningConfig {
    pub mode: TuningMode,
}

/// Options controlling the optimization pipeline.
#[derive(Debug, Clone, Default)]
pub struct BuildOptions {
    /// Enables fusing, reorder selection, buffer fusing and redundant-reorder
    /// removal.
    pub optimize_data: bool,
    /// Stop after memory-dependency analysis, before kernel compilation.
    pub partial_build_program: bool,
    pub tuning_config: TuningConfig,
    /// Per-node forced implementation keys. Non-empty forcing implies
    /// `optimize_data`.
    pub force_implementations: HashMap<PrimitiveId, String>,
    /// Directory for per-stage `.graph`/`.info`/`.order`/`.optimized` dumps.
    pub graph_dumps_dir: Option<PathBuf>,
    /// Debug builds retain every node as an output at cleanup.
    pub debug: bool,
}
