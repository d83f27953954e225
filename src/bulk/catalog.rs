/// Work item catalog: the staged (resolution x instrument) work list of a run
use std::collections::HashSet;

use tracing::{debug, warn};

use crate::config::OperationContext;
use crate::error::{BulkError, Result};
use crate::types::{DateRange, Instrument, OperationKind, Resolution, WorkItem};

/// All items of one resolution
#[derive(Debug, Clone)]
pub struct Stage {
    pub resolution: Resolution,
    pub items: Vec<WorkItem>,
}

impl Stage {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct WorkCatalog {
    kind: OperationKind,
    stages: Vec<Stage>,
    skipped: Vec<Resolution>,
}

impl WorkCatalog {
    /// Build stages finer to coarser from the enabled resolutions
    pub fn build(kind: OperationKind, ctx: &OperationContext) -> Result<Self> {
        let instruments = unique_instruments(&ctx.instruments);
        if instruments.is_empty() {
            return Err(BulkError::EmptyInstrumentSet);
        }
        if ctx.resolutions.is_empty() {
            return Err(BulkError::NoResolutionEnabled);
        }

        let range = match kind {
            OperationKind::Download => Some(ctx.range.unwrap_or_else(DateRange::full)),
            _ => ctx.range,
        };

        let mut stages = Vec::new();
        let mut skipped = Vec::new();

        // BTreeSet iterates finest first, and Month follows Day
        for &resolution in &ctx.resolutions {
            if kind == OperationKind::Copy
                && resolution.aggregation_source().is_none()
                && !ctx.copies_between_providers()
            {
                warn!(
                    "Skipping {} copy: no coarser source and source provider equals target ({})",
                    resolution, ctx.provider
                );
                skipped.push(resolution);
                continue;
            }

            let items: Vec<WorkItem> = instruments
                .iter()
                .map(|instrument| WorkItem::new(resolution, instrument.clone(), range))
                .collect();
            debug!("Stage {}: {} items", resolution, items.len());
            stages.push(Stage { resolution, items });
        }

        if stages.is_empty() {
            return Err(BulkError::InvalidContext(format!(
                "nothing to {}: every enabled resolution was skipped",
                kind
            )));
        }

        Ok(WorkCatalog { kind, stages, skipped })
    }

    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Resolutions enabled but left out of the run
    pub fn skipped(&self) -> &[Resolution] {
        &self.skipped
    }

    pub fn total_items(&self) -> usize {
        self.stages.iter().map(Stage::len).sum()
    }

    pub fn has_stage(&self, resolution: Resolution) -> bool {
        self.stages.iter().any(|s| s.resolution == resolution)
    }
}

/// Drop duplicate tickers, keeping first occurrence order
fn unique_instruments(instruments: &[Instrument]) -> Vec<Instrument> {
    let mut seen = HashSet::new();
    instruments
        .iter()
        .filter(|i| !i.ticker.trim().is_empty())
        .filter(|i| seen.insert(i.ticker.clone()))
        .cloned()
        .collect()
}
