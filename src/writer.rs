use std::sync::Arc;

use anyhow::{bail, Result};
use arrow::{
    array::{Array, ArrayBuilder, BooleanBuilder, FixedSizeListBuilder, PrimitiveBuilder, StructArray},
    datatypes::{DataType, Field, Float64Type, Int64Type, UInt64Type},
};

use crate::chain::Sample;

/// Events of a chain that are worth reporting next to the draws.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// The trajectory of this draw diverged.
    Divergence {
        iteration: u64,
        tuning: bool,
        energy_error: Option<f64>,
    },
    /// The trajectory was stopped by the maximum tree depth.
    MaxTreeDepth {
        iteration: u64,
        tuning: bool,
        depth: u64,
    },
    /// An adaptation window ended and the metric was replaced.
    MetricUpdated {
        iteration: u64,
        step_size: f64,
        condition_number: f64,
    },
    WarmupComplete { iteration: u64, step_size: f64 },
}

impl Diagnostic {
    pub fn iteration(&self) -> u64 {
        match self {
            Diagnostic::Divergence { iteration, .. }
            | Diagnostic::MaxTreeDepth { iteration, .. }
            | Diagnostic::MetricUpdated { iteration, .. }
            | Diagnostic::WarmupComplete { iteration, .. } => *iteration,
        }
    }
}

/// Destination for the draws and diagnostics of a chain.
pub trait SampleWriter {
    fn append_sample(&mut self, sample: &Sample) -> Result<()>;
    fn append_diagnostic(&mut self, chain: u64, diagnostic: &Diagnostic) -> Result<()>;
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullWriter;

impl SampleWriter for NullWriter {
    fn append_sample(&mut self, _sample: &Sample) -> Result<()> {
        Ok(())
    }

    fn append_diagnostic(&mut self, _chain: u64, _diagnostic: &Diagnostic) -> Result<()> {
        Ok(())
    }
}

struct StatsBuilder {
    logp: PrimitiveBuilder<Float64Type>,
    energy: PrimitiveBuilder<Float64Type>,
    energy_error: PrimitiveBuilder<Float64Type>,
    accept_stat: PrimitiveBuilder<Float64Type>,
    step_size: PrimitiveBuilder<Float64Type>,
    depth: PrimitiveBuilder<UInt64Type>,
    n_steps: PrimitiveBuilder<UInt64Type>,
    index_in_trajectory: PrimitiveBuilder<Int64Type>,
    diverging: BooleanBuilder,
    maxdepth_reached: BooleanBuilder,
    tuning: BooleanBuilder,
}

impl StatsBuilder {
    fn new() -> Self {
        Self {
            logp: PrimitiveBuilder::new(),
            energy: PrimitiveBuilder::new(),
            energy_error: PrimitiveBuilder::new(),
            accept_stat: PrimitiveBuilder::new(),
            step_size: PrimitiveBuilder::new(),
            depth: PrimitiveBuilder::new(),
            n_steps: PrimitiveBuilder::new(),
            index_in_trajectory: PrimitiveBuilder::new(),
            diverging: BooleanBuilder::new(),
            maxdepth_reached: BooleanBuilder::new(),
            tuning: BooleanBuilder::new(),
        }
    }

    fn append_value(&mut self, sample: &Sample) {
        let stats = &sample.stats;
        self.logp.append_value(stats.logp);
        self.energy.append_value(stats.energy);
        self.energy_error.append_value(stats.energy_error);
        self.accept_stat.append_value(stats.accept_stat);
        self.step_size.append_value(stats.step_size);
        self.depth.append_value(stats.depth);
        self.n_steps.append_value(stats.n_steps);
        self.index_in_trajectory
            .append_value(stats.index_in_trajectory);
        self.diverging.append_value(stats.diverging);
        self.maxdepth_reached.append_value(stats.maxdepth_reached);
        self.tuning.append_value(stats.tuning);
    }

    fn fields() -> Vec<Field> {
        vec![
            Field::new("logp", DataType::Float64, false),
            Field::new("energy", DataType::Float64, false),
            Field::new("energy_error", DataType::Float64, false),
            Field::new("accept_stat", DataType::Float64, false),
            Field::new("step_size", DataType::Float64, false),
            Field::new("depth", DataType::UInt64, false),
            Field::new("n_steps", DataType::UInt64, false),
            Field::new("index_in_trajectory", DataType::Int64, false),
            Field::new("diverging", DataType::Boolean, false),
            Field::new("maxdepth_reached", DataType::Boolean, false),
            Field::new("tuning", DataType::Boolean, false),
        ]
    }

    fn finalize(self) -> StructArray {
        let Self {
            mut logp,
            mut energy,
            mut energy_error,
            mut accept_stat,
            mut step_size,
            mut depth,
            mut n_steps,
            mut index_in_trajectory,
            mut diverging,
            mut maxdepth_reached,
            mut tuning,
        } = self;

        let arrays = vec![
            ArrayBuilder::finish(&mut logp),
            ArrayBuilder::finish(&mut energy),
            ArrayBuilder::finish(&mut energy_error),
            ArrayBuilder::finish(&mut accept_stat),
            ArrayBuilder::finish(&mut step_size),
            ArrayBuilder::finish(&mut depth),
            ArrayBuilder::finish(&mut n_steps),
            ArrayBuilder::finish(&mut index_in_trajectory),
            ArrayBuilder::finish(&mut diverging),
            ArrayBuilder::finish(&mut maxdepth_reached),
            ArrayBuilder::finish(&mut tuning),
        ];

        StructArray::new(Self::fields().into(), arrays, None)
    }

    fn inspect(&self) -> StructArray {
        let Self {
            logp,
            energy,
            energy_error,
            accept_stat,
            step_size,
            depth,
            n_steps,
            index_in_trajectory,
            diverging,
            maxdepth_reached,
            tuning,
        } = self;

        let arrays = vec![
            ArrayBuilder::finish_cloned(logp),
            ArrayBuilder::finish_cloned(energy),
            ArrayBuilder::finish_cloned(energy_error),
            ArrayBuilder::finish_cloned(accept_stat),
            ArrayBuilder::finish_cloned(step_size),
            ArrayBuilder::finish_cloned(depth),
            ArrayBuilder::finish_cloned(n_steps),
            ArrayBuilder::finish_cloned(index_in_trajectory),
            ArrayBuilder::finish_cloned(diverging),
            ArrayBuilder::finish_cloned(maxdepth_reached),
            ArrayBuilder::finish_cloned(tuning),
        ];

        StructArray::new(Self::fields().into(), arrays, None)
    }
}

/// The collected trace of one chain.
#[derive(Debug, Clone)]
pub struct ArrowTrace {
    /// A `FixedSizeList` of the draws, one row per draw.
    pub draws: Arc<dyn Array>,
    pub stats: StructArray,
    pub diagnostics: Vec<(u64, Diagnostic)>,
}

/// Keeps the trace of a chain in memory as arrow arrays.
pub struct ArrowTraceWriter {
    dim: usize,
    draws: FixedSizeListBuilder<PrimitiveBuilder<Float64Type>>,
    stats: StatsBuilder,
    diagnostics: Vec<(u64, Diagnostic)>,
}

impl ArrowTraceWriter {
    pub fn new(dim: usize) -> Self {
        let items = PrimitiveBuilder::new();
        let draws = FixedSizeListBuilder::new(items, dim as _);
        Self {
            dim,
            draws,
            stats: StatsBuilder::new(),
            diagnostics: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.draws.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The trace so far, without consuming the writer.
    pub fn inspect(&self) -> ArrowTrace {
        ArrowTrace {
            draws: ArrayBuilder::finish_cloned(&self.draws),
            stats: self.stats.inspect(),
            diagnostics: self.diagnostics.clone(),
        }
    }

    pub fn finalize(mut self) -> ArrowTrace {
        ArrowTrace {
            draws: ArrayBuilder::finish(&mut self.draws),
            stats: self.stats.finalize(),
            diagnostics: self.diagnostics,
        }
    }
}

impl SampleWriter for ArrowTraceWriter {
    fn append_sample(&mut self, sample: &Sample) -> Result<()> {
        if sample.position.len() != self.dim {
            bail!(
                "Draw of chain {} has dimension {}, expected {}",
                sample.chain,
                sample.position.len(),
                self.dim
            );
        }
        self.draws.values().append_slice(&sample.position);
        self.draws.append(true);
        self.stats.append_value(sample);
        Ok(())
    }

    fn append_diagnostic(&mut self, chain: u64, diagnostic: &Diagnostic) -> Result<()> {
        self.diagnostics.push((chain, diagnostic.clone()));
        Ok(())
    }
}
