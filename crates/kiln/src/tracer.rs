//! VM execution tracing.
//!
//! The [`VmTracer`] trait defines hook points at key execution events (instruction dispatch,
//! calls and returns, line changes, exceptions, block setup and teardown, closure cell access).
//! The VM carries the tracer as a type parameter, so with [`NoopTracer`] every hook is
//! monomorphized away, the same way [`NoLimitTracker`](crate::resource::NoLimitTracker)
//! removes resource checks.
//!
//! | Tracer | Purpose |
//! |--------|---------|
//! | [`NoopTracer`] | Zero-cost no-op (production default) |
//! | [`StderrTracer`] | Human-readable execution log to stderr |
//! | [`ProfilingTracer`] | Opcode frequency counters and call depth tracking |
//! | [`CoverageTracer`] | Instruction offset coverage |
//! | [`RecordingTracer`] | Full event recording for post-mortem analysis |
//!
//! An active tracer sees every instruction: the dispatch loop skips its fused
//! instruction pairs while [`VmTracer::is_active`] returns true.

use ahash::{AHashMap, AHashSet};

use crate::{
    bytecode::{BlockKind, Opcode},
    exception_private::ExcType,
};

/// Trace event emitted during VM execution, captured by [`RecordingTracer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceEvent {
    /// An opcode was dispatched at the given offset.
    Instruction {
        ip: usize,
        opcode: Opcode,
        /// Value stack depth of the frame at dispatch.
        stack_depth: usize,
    },
    /// A frame started executing.
    Call { func_name: Option<String>, depth: usize },
    /// A frame finished executing (returned, yielded or raised).
    Return { depth: usize },
    /// Execution moved to a new source line.
    Line { line: u32, depth: usize },
    /// An exception started unwinding a frame.
    Exception { exc_type: ExcType, depth: usize },
    BlockPush { kind: BlockKind, depth: usize },
    BlockPop { kind: BlockKind, depth: usize },
    CellLoad { slot: u32, cells_len: usize },
    CellStore { slot: u32, cells_len: usize },
    MakeFunction { cell_count: usize, defaults_count: usize },
}

/// Trait for VM execution tracing.
///
/// All hooks default to no-ops; implementations override the ones they care about.
pub trait VmTracer: std::fmt::Debug {
    /// Whether the tracer observes execution.
    ///
    /// Returning false lets the dispatch loop take shortcuts that skip instruction hooks.
    #[inline(always)]
    fn is_active(&self) -> bool {
        true
    }

    /// Called before each opcode dispatch.
    ///
    /// This is the hottest hook, keep it lightweight.
    #[inline(always)]
    fn on_instruction(&mut self, _ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {}

    /// Called when a frame starts (or resumes) executing.
    #[inline(always)]
    fn on_call(&mut self, _func_name: Option<&str>, _depth: usize) {}

    /// Called when a frame stops executing. `depth` is the call depth after the pop.
    #[inline(always)]
    fn on_return(&mut self, _depth: usize) {}

    /// Called when the first instruction of a new source line is about to run.
    #[inline(always)]
    fn on_line(&mut self, _line: u32, _depth: usize) {}

    /// Called when an exception starts unwinding the current frame.
    #[inline(always)]
    fn on_exception(&mut self, _exc_type: ExcType, _depth: usize) {}

    /// Called when a block is pushed. `depth` is the block stack depth after the push.
    #[inline(always)]
    fn on_block_push(&mut self, _kind: BlockKind, _depth: usize) {}

    /// Called when a block is popped. `depth` is the block stack depth after the pop.
    #[inline(always)]
    fn on_block_pop(&mut self, _kind: BlockKind, _depth: usize) {}

    #[inline(always)]
    fn on_cell_load(&mut self, _slot: u32, _cells_len: usize) {}

    #[inline(always)]
    fn on_cell_store(&mut self, _slot: u32, _cells_len: usize) {}

    /// Called when a function or closure object is created.
    #[inline(always)]
    fn on_make_function(&mut self, _cell_count: usize, _defaults_count: usize) {}
}

/// A tracer that does nothing and compiles to nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl VmTracer for NoopTracer {
    #[inline(always)]
    fn is_active(&self) -> bool {
        false
    }
}

/// Tracer that prints a human-readable execution log to stderr.
///
/// ```text
/// [    0] LOAD_CONST            stack=0  frames=1
///   >>> CALL fib                depth=2
/// [    0] LOAD_FAST             stack=0  frames=2
///   <<< RETURN                  depth=1
/// ```
#[derive(Debug, Default)]
pub struct StderrTracer {
    /// Stop logging after this many instructions, `None` for unlimited.
    limit: Option<usize>,
    count: usize,
    stopped: bool,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that goes quiet after `limit` instructions.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..Self::default()
        }
    }
}

impl VmTracer for StderrTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, frame_depth: usize) {
        if self.stopped {
            return;
        }
        eprintln!("[{ip:>5}] {:<20}  stack={stack_depth}  frames={frame_depth}", opcode.to_string());
        self.count += 1;
        if let Some(limit) = self.limit
            && self.count >= limit
        {
            eprintln!("--- trace limit reached ({limit} instructions) ---");
            self.stopped = true;
        }
    }

    fn on_call(&mut self, func_name: Option<&str>, depth: usize) {
        if !self.stopped {
            eprintln!("  >>> CALL {:<20} depth={depth}", func_name.unwrap_or("<anonymous>"));
        }
    }

    fn on_return(&mut self, depth: usize) {
        if !self.stopped {
            eprintln!("  <<< RETURN                  depth={depth}");
        }
    }

    fn on_line(&mut self, line: u32, _depth: usize) {
        if !self.stopped {
            eprintln!("  --- line {line}");
        }
    }

    fn on_exception(&mut self, exc_type: ExcType, depth: usize) {
        if !self.stopped {
            eprintln!("  !!! {exc_type:<20} depth={depth}");
        }
    }

    fn on_block_push(&mut self, kind: BlockKind, depth: usize) {
        if !self.stopped {
            eprintln!("  ... SETUP {kind:?} blocks={depth}");
        }
    }

    fn on_block_pop(&mut self, kind: BlockKind, depth: usize) {
        if !self.stopped {
            eprintln!("  ... POP {kind:?} blocks={depth}");
        }
    }

    fn on_make_function(&mut self, cell_count: usize, defaults_count: usize) {
        if self.stopped {
            return;
        }
        if cell_count > 0 {
            eprintln!("  +++ MAKE CLOSURE  cells={cell_count} defaults={defaults_count}");
        } else {
            eprintln!("  +++ MAKE FUNCTION defaults={defaults_count}");
        }
    }
}

/// Tracer that collects execution statistics.
///
/// Retrieve results via [`ProfilingTracer::report`] after execution.
#[derive(Debug, Default)]
pub struct ProfilingTracer {
    opcode_counts: AHashMap<Opcode, u64>,
    total_instructions: u64,
    max_depth: usize,
    total_calls: u64,
    total_exceptions: u64,
    total_cell_loads: u64,
    total_cell_stores: u64,
}

/// Summary report from a profiling trace.
#[derive(Debug)]
pub struct ProfilingReport {
    /// Per-opcode execution counts, most executed first.
    pub opcode_counts: Vec<(Opcode, u64)>,
    pub total_instructions: u64,
    pub max_depth: usize,
    pub total_calls: u64,
    /// Number of times an exception started unwinding a frame.
    pub total_exceptions: u64,
    pub total_cell_loads: u64,
    pub total_cell_stores: u64,
}

impl ProfilingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn report(&self) -> ProfilingReport {
        let mut opcode_counts: Vec<_> = self.opcode_counts.iter().map(|(&k, &v)| (k, v)).collect();
        opcode_counts.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| (a.0 as u8).cmp(&(b.0 as u8))));
        ProfilingReport {
            opcode_counts,
            total_instructions: self.total_instructions,
            max_depth: self.max_depth,
            total_calls: self.total_calls,
            total_exceptions: self.total_exceptions,
            total_cell_loads: self.total_cell_loads,
            total_cell_stores: self.total_cell_stores,
        }
    }
}

impl VmTracer for ProfilingTracer {
    #[inline]
    fn on_instruction(&mut self, _ip: usize, opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        *self.opcode_counts.entry(opcode).or_insert(0) += 1;
        self.total_instructions += 1;
    }

    #[inline]
    fn on_call(&mut self, _func_name: Option<&str>, depth: usize) {
        self.total_calls += 1;
        self.max_depth = self.max_depth.max(depth);
    }

    fn on_exception(&mut self, _exc_type: ExcType, _depth: usize) {
        self.total_exceptions += 1;
    }

    fn on_cell_load(&mut self, _slot: u32, _cells_len: usize) {
        self.total_cell_loads += 1;
    }

    fn on_cell_store(&mut self, _slot: u32, _cells_len: usize) {
        self.total_cell_stores += 1;
    }
}

impl std::fmt::Display for ProfilingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "=== VM Profiling Report ===")?;
        writeln!(f, "Total instructions: {}", self.total_instructions)?;
        writeln!(f, "Total calls:        {}", self.total_calls)?;
        writeln!(f, "Max call depth:     {}", self.max_depth)?;
        writeln!(f, "Exceptions:         {}", self.total_exceptions)?;
        writeln!(f, "Cell loads:         {}", self.total_cell_loads)?;
        writeln!(f, "Cell stores:        {}", self.total_cell_stores)?;
        writeln!(f)?;
        writeln!(f, "--- Opcode Frequency ---")?;
        for (opcode, count) in &self.opcode_counts {
            let pct = (*count as f64 / self.total_instructions.max(1) as f64) * 100.0;
            writeln!(f, "  {:<20} {count:>10}  ({pct:>5.1}%)", opcode.to_string())?;
        }
        Ok(())
    }
}

/// Tracer that records which instruction offsets were executed.
#[derive(Debug, Default)]
pub struct CoverageTracer {
    ips: AHashSet<usize>,
}

impl CoverageTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn covered_ips(&self) -> &AHashSet<usize> {
        &self.ips
    }

    #[must_use]
    pub fn coverage_count(&self) -> usize {
        self.ips.len()
    }
}

impl VmTracer for CoverageTracer {
    #[inline]
    fn on_instruction(&mut self, ip: usize, _opcode: Opcode, _stack_depth: usize, _frame_depth: usize) {
        self.ips.insert(ip);
    }
}

/// Tracer that records every event.
///
/// The most expensive tracer (allocates per event); use it for short executions.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
    limit: Option<usize>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a tracer that stops recording after `limit` events.
    #[must_use]
    pub fn with_limit(limit: usize) -> Self {
        Self {
            events: Vec::with_capacity(limit.min(1024)),
            limit: Some(limit),
        }
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn into_events(self) -> Vec<TraceEvent> {
        self.events
    }

    fn record(&mut self, event: TraceEvent) {
        if self.limit.is_none_or(|l| self.events.len() < l) {
            self.events.push(event);
        }
    }
}

impl VmTracer for RecordingTracer {
    fn on_instruction(&mut self, ip: usize, opcode: Opcode, stack_depth: usize, _frame_depth: usize) {
        self.record(TraceEvent::Instruction {
            ip,
            opcode,
            stack_depth,
        });
    }

    fn on_call(&mut self, func_name: Option<&str>, depth: usize) {
        self.record(TraceEvent::Call {
            func_name: func_name.map(String::from),
            depth,
        });
    }

    fn on_return(&mut self, depth: usize) {
        self.record(TraceEvent::Return { depth });
    }

    fn on_line(&mut self, line: u32, depth: usize) {
        self.record(TraceEvent::Line { line, depth });
    }

    fn on_exception(&mut self, exc_type: ExcType, depth: usize) {
        self.record(TraceEvent::Exception { exc_type, depth });
    }

    fn on_block_push(&mut self, kind: BlockKind, depth: usize) {
        self.record(TraceEvent::BlockPush { kind, depth });
    }

    fn on_block_pop(&mut self, kind: BlockKind, depth: usize) {
        self.record(TraceEvent::BlockPop { kind, depth });
    }

    fn on_cell_load(&mut self, slot: u32, cells_len: usize) {
        self.record(TraceEvent::CellLoad { slot, cells_len });
    }

    fn on_cell_store(&mut self, slot: u32, cells_len: usize) {
        self.record(TraceEvent::CellStore { slot, cells_len });
    }

    fn on_make_function(&mut self, cell_count: usize, defaults_count: usize) {
        self.record(TraceEvent::MakeFunction {
            cell_count,
            defaults_count,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_is_inactive() {
        assert!(!NoopTracer.is_active());
        assert!(ProfilingTracer::new().is_active());
    }

    #[test]
    fn profiling_counts_sorted_by_frequency() {
        let mut tracer = ProfilingTracer::new();
        tracer.on_instruction(0, Opcode::LoadConst, 0, 1);
        tracer.on_instruction(3, Opcode::LoadConst, 1, 1);
        tracer.on_instruction(6, Opcode::ReturnValue, 1, 1);
        tracer.on_call(Some("f"), 3);
        let report = tracer.report();
        assert_eq!(report.opcode_counts[0], (Opcode::LoadConst, 2));
        assert_eq!(report.total_instructions, 3);
        assert_eq!(report.max_depth, 3);
    }

    #[test]
    fn recording_respects_limit() {
        let mut tracer = RecordingTracer::with_limit(2);
        tracer.on_call(None, 1);
        tracer.on_line(4, 1);
        tracer.on_return(0);
        assert_eq!(
            tracer.into_events(),
            vec![
                TraceEvent::Call {
                    func_name: None,
                    depth: 1
                },
                TraceEvent::Line { line: 4, depth: 1 },
            ]
        );
    }
}
