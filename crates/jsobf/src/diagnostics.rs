//! Pipeline tracing infrastructure: a hook trait with three implementations
//! ([`NoopTracer`], [`StderrTracer`], [`RecordingTracer`]), held by the
//! pipeline driver as `Box<dyn ObfuscationTracer>` (see `pipeline.rs` for why
//! a trait object rather than a generic parameter).

use crate::error::PassName;

/// One recorded pipeline event, used by [`RecordingTracer`] to capture a
/// full run for post-mortem inspection or golden-output comparison.
#[derive(Debug, Clone)]
pub enum TraceEvent {
    /// A pass began running over a context (function body or program root).
    PassStart { pass: PassName },
    /// A pass finished running over a context.
    PassEnd { pass: PassName },
    /// A pass examined a subtree and left it unchanged because it failed an
    /// eligibility gate (§7.3's "recoverable skip").
    Skip { pass: PassName, reason: String },
    /// A fresh identifier was minted.
    NameGenerated { name: String },
    /// RGF spawned a nested obfuscator instance.
    NestedPipeline { depth: u32 },
}

/// Hook points the pipeline driver and passes call into during a run.
///
/// All methods default to no-ops, so an implementor only overrides the hooks
/// it actually uses.
pub trait ObfuscationTracer: std::fmt::Debug {
    #[inline(always)]
    fn on_pass_start(&mut self, _pass: PassName) {}

    #[inline(always)]
    fn on_pass_end(&mut self, _pass: PassName) {}

    #[inline(always)]
    fn on_skip(&mut self, _pass: PassName, _reason: &str) {}

    #[inline(always)]
    fn on_name_generated(&mut self, _name: &str) {}

    #[inline(always)]
    fn on_nested_pipeline(&mut self, _depth: u32) {}
}

/// Zero-cost tracer; the default when `Options::verbose` is unset.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl ObfuscationTracer for NoopTracer {}

/// Human-readable trace to stderr, enabled by `Options::verbose`.
#[derive(Debug, Default)]
pub struct StderrTracer {
    skip_count: u64,
}

impl StderrTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl ObfuscationTracer for StderrTracer {
    fn on_pass_start(&mut self, pass: PassName) {
        eprintln!(">>> {pass}");
    }

    fn on_pass_end(&mut self, pass: PassName) {
        eprintln!("<<< {pass}");
    }

    fn on_skip(&mut self, pass: PassName, reason: &str) {
        self.skip_count += 1;
        eprintln!("  ... [{pass}] skip: {reason}");
    }

    fn on_name_generated(&mut self, name: &str) {
        eprintln!("  ... name {name}");
    }

    fn on_nested_pipeline(&mut self, depth: u32) {
        eprintln!("  +++ nested pipeline at depth {depth}");
    }
}

/// Records every event for deterministic comparison in tests.
#[derive(Debug, Default)]
pub struct RecordingTracer {
    events: Vec<TraceEvent>,
}

impl RecordingTracer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }

    #[must_use]
    pub fn skip_count(&self) -> usize {
        self.events.iter().filter(|e| matches!(e, TraceEvent::Skip { .. })).count()
    }
}

impl ObfuscationTracer for RecordingTracer {
    fn on_pass_start(&mut self, pass: PassName) {
        self.events.push(TraceEvent::PassStart { pass });
    }

    fn on_pass_end(&mut self, pass: PassName) {
        self.events.push(TraceEvent::PassEnd { pass });
    }

    fn on_skip(&mut self, pass: PassName, reason: &str) {
        self.events.push(TraceEvent::Skip { pass, reason: reason.to_owned() });
    }

    fn on_name_generated(&mut self, name: &str) {
        self.events.push(TraceEvent::NameGenerated { name: name.to_owned() });
    }

    fn on_nested_pipeline(&mut self, depth: u32) {
        self.events.push(TraceEvent::NestedPipeline { depth });
    }
}
