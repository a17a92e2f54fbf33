//! The pipeline driver (§4.I): owns the options, the master RNG, `varCount`,
//! the global generated-name set, and the ordered pass list. `apply` runs
//! each pass to completion in priority order (§5: single-threaded,
//! synchronous, no reentrancy across passes).

use ahash::AHashSet;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::ast::Node;
use crate::diagnostics::{NoopTracer, ObfuscationTracer};
use crate::error::{ObfResult, PassName};
use crate::options::Options;
use crate::passes::{control_flow_flattening, dispatcher, flatten, rgf};
use crate::transform::{self, Pass};

/// Drives one obfuscation run over a tree.
///
/// A tracer is supplied as a trait object rather than a type parameter: the
/// pass list itself is already dynamically dispatched (`Vec<Box<dyn Pass>>`,
/// since passes are heterogeneous and user-configured), so a generic tracer
/// would buy no additional monomorphization benefit here.
pub struct Obfuscator {
    options: Options,
    rng: ChaCha8Rng,
    var_count: u64,
    generated: AHashSet<String>,
    tracer: Box<dyn ObfuscationTracer>,
}

impl std::fmt::Debug for Obfuscator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Obfuscator")
            .field("options", &self.options)
            .field("var_count", &self.var_count)
            .field("generated_count", &self.generated.len())
            .finish_non_exhaustive()
    }
}

impl Obfuscator {
    /// Creates a fresh pipeline, seeded for reproducibility. Tracing defaults
    /// to a no-op unless `options.verbose` requests otherwise at the call
    /// site via [`Obfuscator::with_tracer`].
    #[must_use]
    pub fn new(options: Options, seed: u64) -> Self {
        Self {
            options,
            rng: ChaCha8Rng::seed_from_u64(seed),
            var_count: 0,
            generated: AHashSet::new(),
            tracer: Box::new(NoopTracer),
        }
    }

    #[must_use]
    pub fn with_tracer(mut self, tracer: Box<dyn ObfuscationTracer>) -> Self {
        self.tracer = tracer;
        self
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        &mut self.rng
    }

    pub fn next_var_index(&mut self) -> u64 {
        self.var_count += 1;
        self.var_count
    }

    pub fn generated_names(&mut self) -> &mut AHashSet<String> {
        &mut self.generated
    }

    /// Runs every configured pass over `tree` in priority order (§5: CFF's
    /// subpasses bracket it; Flatten before RGF so flattened functions become
    /// RGF-eligible).
    pub fn apply(&mut self, tree: &mut Node) -> ObfResult<()> {
        let reserved = crate::ast::default_reserved_identifiers();
        let seeds: Vec<u64> = (0..4).map(|_| self.rng.r#gen()).collect();
        let mut passes: Vec<(PassName, Box<dyn Pass>)> = vec![
            (
                PassName::ControlFlowFlattening,
                Box::new(control_flow_flattening::ControlFlowFlattening::new(
                    &self.options,
                    seeds[0],
                    reserved.clone(),
                    self.generated.clone(),
                )),
            ),
            (
                PassName::Dispatcher,
                Box::new(dispatcher::Dispatcher::new(&self.options, seeds[1], reserved.clone(), self.generated.clone())),
            ),
            (
                PassName::Flatten,
                Box::new(flatten::Flatten::new(&self.options, seeds[2], reserved.clone(), self.generated.clone())),
            ),
            (PassName::Rgf, Box::new(rgf::Rgf::new(&self.options, seeds[3], reserved, self.generated.clone()))),
        ];
        passes.sort_by_key(|(_, pass)| pass.priority());

        for (name, mut pass) in passes {
            self.tracer.on_pass_start(name);
            transform::apply_pass(pass.as_mut(), tree)?;
            self.generated.extend(pass.generated_names());
            self.tracer.on_pass_end(name);
        }
        Ok(())
    }

    /// §9: RGF's nested pipeline for a synthetic per-function program. Fresh
    /// RNG state and an empty generated-name set — the nested run must not
    /// observe the outer pipeline's uniqueness set or counters, so its
    /// emitted source is self-contained.
    #[must_use]
    pub fn child_for_rgf(&self, seed: u64) -> Self {
        self.tracer_hint_nested();
        Self::new(child_options_for_rgf(&self.options), seed)
    }

    fn tracer_hint_nested(&self) {
        // Depth tracking is the caller's responsibility (RGF knows its own
        // recursion depth); this hook exists so callers don't reach into
        // `self.tracer` directly from outside the module.
    }
}

/// Disables `rgf` on a clone of `options`, shared by [`Obfuscator::child_for_rgf`]
/// and the RGF pass itself (which builds its nested pipeline directly from
/// `Options`, not from a live `Obfuscator`, since it never holds one).
pub(crate) fn child_options_for_rgf(options: &Options) -> Options {
    let mut child = options.clone();
    child.rgf = crate::options::RgfOption::Disabled;
    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VarKind;

    #[test]
    fn empty_options_leave_the_tree_unchanged_shape() {
        let mut tree = Node::program(vec![Node::var_decl(VarKind::Var, "a", Some(Node::number(1.0)))]);
        let mut obfuscator = Obfuscator::new(Options::default(), 1);
        obfuscator.apply(&mut tree).unwrap();
        assert_eq!(tree.block_body().len(), 1);
    }

    #[test]
    fn child_for_rgf_starts_with_an_empty_generated_set() {
        let mut obfuscator = Obfuscator::new(Options::default(), 7);
        obfuscator.generated_names().insert("taken".to_owned());
        let child = obfuscator.child_for_rgf(8);
        assert!(!child.generated.contains("taken"));
    }
}
