//! §4.H RGF (Runtime-Generated Functions): extracts eligible function
//! declarations from a var context into entries of a single reference array,
//! compiles each through its own nested, state-isolated pipeline, serializes
//! the result to source text, and installs it as a `new Function(...)` value.
//! Call sites are rewritten to index through the array.
//!
//! The nested pipeline runs synchronously inside [`Rgf::transform`] rather
//! than being scheduled via a deferred `$eval`-style action: since this pass
//! already owns everything the nested run needs (a seed and the parent's
//! resolved [`Options`]), there's no second traversal to defer to.

use ahash::AHashSet;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

use crate::ast::{Node, NodeKind, VarKind};
use crate::codegen;
use crate::error::ObfResult;
use crate::identifiers::{IdentifierGenerator, NameStyle};
use crate::options::{Options, RgfOption};
use crate::pipeline::Obfuscator;
use crate::scope;
use crate::traversal::AncestorKind;
use crate::transform::{ExitCallback, Pass};

pub struct Rgf {
    rng: ChaCha8Rng,
    reserved: AHashSet<String>,
    generated: AHashSet<String>,
    names: IdentifierGenerator,
    rgf: RgfOption,
    options: Options,
}

impl Rgf {
    #[must_use]
    pub fn new(options: &Options, seed: u64, reserved: AHashSet<String>, generated: AHashSet<String>) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            reserved,
            generated,
            names: IdentifierGenerator::new(NameStyle::Mangled),
            rgf: options.rgf.clone(),
            options: options.clone(),
        }
    }

    fn fresh(&mut self) -> String {
        self.names.generate(&mut self.rng, &self.reserved, &mut self.generated)
    }

    /// §4.H candidates: direct function declarations whose body is free of
    /// `this`/`super`/`arguments`, aren't generators, aren't the configured
    /// `lock.countermeasures` name, and whose binding is stable (checked the
    /// same way as Dispatcher and CFF: scan every *other* sibling statement).
    fn candidates(&self, body: &[Node]) -> Vec<(usize, String)> {
        scope::direct_function_declarations(body)
            .into_iter()
            .filter(|(i, name)| {
                if self.options.lock_countermeasures.as_deref() == Some(name.as_str()) {
                    return false;
                }
                let decl = &body[*i];
                if decl.annotations.requires_eval {
                    return false;
                }
                let NodeKind::FunctionDeclaration { body: fn_body, is_generator, .. } = &decl.kind else {
                    return false;
                };
                if *is_generator {
                    return false;
                }
                let usage = scope::scan_own_context(fn_body);
                if usage.uses_this || usage.uses_super || usage.uses_arguments {
                    return false;
                }
                !body.iter().enumerate().any(|(j, stmt)| j != *i && scope::name_is_reassigned_or_redeclared(stmt, name))
            })
            .collect()
    }

    fn decide_context(&mut self, node: &Node) -> bool {
        match &self.rgf {
            RgfOption::Disabled => false,
            RgfOption::All => true,
            RgfOption::ProgramOnly => matches!(node.kind, NodeKind::Program { .. }),
            RgfOption::Chance(p) => self.rng.gen_bool(p.clamp(0.0, 1.0)),
        }
    }

    /// §4.H's fixed-point name-resolution pass: a candidate's reference set is
    /// every free name its body touches. Repeatedly, any candidate with an
    /// empty reference set erases its own name from every other candidate's
    /// set; candidates whose set never empties (they touch a real outer
    /// closure variable, or depend on one that never resolves) are never
    /// extracted, since a `new Function`-compiled body can't close over
    /// anything but its own declared parameter.
    fn resolve_extractable(body: &[Node], candidates: &[(usize, String)]) -> AHashSet<String> {
        let mut ref_sets: HashMap<String, AHashSet<String>> = candidates
            .iter()
            .map(|(i, name)| {
                let NodeKind::FunctionDeclaration { params, body: fn_body, .. } = &body[*i].kind else {
                    unreachable!("candidate index filtered to FunctionDeclaration");
                };
                let param_names: AHashSet<&str> = params.iter().filter_map(Node::as_identifier_name).collect();
                let usage = scope::classify_identifiers(fn_body);
                let refs = usage
                    .input_names()
                    .into_iter()
                    .filter(|n| !param_names.contains(n.as_str()) && n.as_str() != name.as_str())
                    .collect();
                (name.clone(), refs)
            })
            .collect();

        let max_iters = 2 * candidates.len().max(1);
        for _ in 0..max_iters {
            let zero: Vec<String> = ref_sets.iter().filter(|(_, refs)| refs.is_empty()).map(|(n, _)| n.clone()).collect();
            let mut changed = false;
            for name in &zero {
                for (other, refs) in &mut ref_sets {
                    if other != name && refs.remove(name) {
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }
        ref_sets.into_iter().filter(|(_, refs)| refs.is_empty()).map(|(n, _)| n).collect()
    }

    /// Compiles one extracted function through a fresh, state-isolated nested
    /// pipeline (§9: a new seed, an empty generated-name set, RGF disabled so
    /// extraction can't recurse into itself), then serializes the result and
    /// wraps it as `new Function(array_name, source)` (§4.H).
    fn compile_stub(&mut self, array_name: &str, renamed: &str, params: Vec<Node>, fn_body: Node, is_async: bool) -> ObfResult<Node> {
        let seed: u64 = self.rng.r#gen();
        let mut child_options = crate::pipeline::child_options_for_rgf(&self.options);
        child_options.global_variables.insert(array_name.to_owned());
        let mut child = Obfuscator::new(child_options, seed);

        let mut synthetic = Node::program(stub_program(renamed, params, fn_body, is_async));
        child.apply(&mut synthetic)?;
        let body = match synthetic.kind {
            NodeKind::Program { body } => body,
            _ => unreachable!("Obfuscator::apply preserves the root node's kind"),
        };
        let source = codegen::emit_statements(&body);

        Ok(Node::new(NodeKind::NewExpression {
            callee: Box::new(Node::identifier("Function")),
            arguments: vec![Node::string_literal(array_name), Node::string_literal(source)],
        }))
    }
}

/// `function <renamed>(params){body} return <renamed>.call(undefined, ...Array.prototype.slice.call(arguments, 1));`
/// — the `new Function`-compiled stub's own first (and only declared)
/// parameter is the reference array name itself, so a call site threading
/// `R` through as the real first argument lands in `arguments[0]`.
fn stub_program(renamed: &str, params: Vec<Node>, fn_body: Node, is_async: bool) -> Vec<Node> {
    let inner_fn = Node::new(NodeKind::FunctionDeclaration {
        id: Box::new(Node::identifier(renamed)),
        params,
        body: Box::new(fn_body),
        is_async,
        is_generator: false,
    });
    let sliced = Node::new(NodeKind::CallExpression {
        callee: Box::new(dot(dot(dot(Node::identifier("Array"), "prototype"), "slice"), "call")),
        arguments: vec![Node::identifier("arguments"), Node::number(1.0)],
    });
    let forward_call = Node::new(NodeKind::CallExpression {
        callee: Box::new(dot(Node::identifier(renamed), "call")),
        arguments: vec![Node::identifier("undefined"), Node::new(NodeKind::SpreadElement { argument: Box::new(sliced) })],
    });
    let return_stmt = Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(forward_call)) });
    vec![inner_fn, return_stmt]
}

fn dot(object: Node, prop: &str) -> Node {
    Node::new(NodeKind::MemberExpression { object: Box::new(object), property: Box::new(Node::identifier(prop)), computed: false })
}

fn index_member(array_name: &str, idx: usize) -> Node {
    Node::new(NodeKind::MemberExpression {
        object: Box::new(Node::identifier(array_name)),
        property: Box::new(Node::number(idx as f64)),
        computed: true,
    })
}

impl Pass for Rgf {
    fn priority(&self) -> i32 {
        40
    }

    fn matches(&mut self, node: &Node, _ancestors: &[AncestorKind]) -> bool {
        // Arrow functions don't open a var context (`Node::is_var_context`
        // already excludes them), which is exactly RGF's no-op boundary case.
        if !node.is_var_context() || node.annotations.last_transform.as_deref() == Some("rgf") {
            return false;
        }
        if self.candidates(node.block_body()).is_empty() {
            return false;
        }
        self.decide_context(node)
    }

    fn transform<'a>(&'a mut self, node: &mut Node, _ancestors: &[AncestorKind]) -> ObfResult<Option<ExitCallback<'a>>> {
        let body = std::mem::take(node.block_body_mut());
        let candidates = self.candidates(&body);
        let extractable = Self::resolve_extractable(&body, &candidates);

        let array_name = self.fresh();
        let mut entries: Vec<Node> = Vec::new();
        let mut rest = Vec::with_capacity(body.len());
        let mut slot_of: HashMap<String, usize> = HashMap::new();
        let mut pending: Vec<(String, Vec<Node>, Node, bool)> = Vec::new();

        for (i, stmt) in body.into_iter().enumerate() {
            let is_extracted = candidates.iter().any(|(idx, name)| *idx == i && extractable.contains(name));
            if is_extracted {
                let NodeKind::FunctionDeclaration { id, params, body: fn_body, is_async, .. } = stmt.kind else {
                    unreachable!("candidate index filtered to FunctionDeclaration");
                };
                let name = id.as_identifier_name().unwrap_or("anonymous").to_owned();
                slot_of.insert(name.clone(), pending.len());
                pending.push((name, params, *fn_body, is_async));
            } else {
                rest.push(stmt);
            }
        }

        for (name, params, mut fn_body, is_async) in pending {
            rewrite_refs_mut(&mut fn_body, &array_name, &slot_of);
            let renamed = format!("__rgf_{name}");
            entries.push(self.compile_stub(&array_name, &renamed, params, fn_body, is_async)?);
        }

        for stmt in &mut rest {
            rewrite_refs_mut(stmt, &array_name, &slot_of);
        }

        let array_decl = Node::var_decl(
            VarKind::Var,
            array_name,
            Some(Node::new(NodeKind::ArrayExpression { elements: entries.into_iter().map(Some).collect() })),
        );

        let mut new_body = Vec::with_capacity(rest.len() + 1);
        new_body.push(array_decl);
        new_body.extend(rest);
        *node.block_body_mut() = new_body;
        node.annotations.last_transform = Some("rgf".to_owned());
        Ok(None)
    }

    fn generated_names(&self) -> AHashSet<String> {
        self.generated.clone()
    }
}

/// Rewrites every reference to an extracted name. A direct call `name(args)`
/// becomes `R[i](R, args)` — the stub's sole declared parameter is `R`
/// itself, so threading it through as the first real argument is what lets
/// the compiled body see it. A passive (non-calling) reference is wrapped in
/// a forwarding closure, since whoever holds it may call it later with `R`
/// nowhere in scope.
fn rewrite_refs_mut(node: &mut Node, array_name: &str, slot_of: &HashMap<String, usize>) {
    if let NodeKind::CallExpression { callee, arguments } = &mut node.kind {
        if let Some(&slot) = callee.as_identifier_name().and_then(|name| slot_of.get(name)) {
            for arg in arguments.iter_mut() {
                rewrite_refs_mut(arg, array_name, slot_of);
            }
            let mut new_args = vec![Node::identifier(array_name)];
            new_args.append(arguments);
            node.kind = NodeKind::CallExpression { callee: Box::new(index_member(array_name, slot)), arguments: new_args };
            return;
        }
    }
    if let NodeKind::Identifier { name } = &node.kind {
        if let Some(&slot) = slot_of.get(name) {
            *node = passive_wrapper(array_name, slot);
            return;
        }
    }
    for child in crate::traversal::children_mut(node) {
        rewrite_refs_mut(child, array_name, slot_of);
    }
}

/// `(function(){ return R[i].apply(undefined, [R].concat(Array.prototype.slice.call(arguments))); })`
fn passive_wrapper(array_name: &str, slot: usize) -> Node {
    let sliced = Node::new(NodeKind::CallExpression {
        callee: Box::new(dot(dot(dot(Node::identifier("Array"), "prototype"), "slice"), "call")),
        arguments: vec![Node::identifier("arguments")],
    });
    let concatenated = Node::new(NodeKind::CallExpression {
        callee: Box::new(dot(Node::new(NodeKind::ArrayExpression { elements: vec![Some(Node::identifier(array_name))] }), "concat")),
        arguments: vec![sliced],
    });
    let applied = Node::new(NodeKind::CallExpression {
        callee: Box::new(dot(index_member(array_name, slot), "apply")),
        arguments: vec![Node::identifier("undefined"), concatenated],
    });
    let body = Node::block(vec![Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(applied)) })]);
    Node::new(NodeKind::FunctionExpression { id: None, params: vec![], body: Box::new(body), is_async: false, is_generator: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::apply_pass;

    fn two_function_program() -> Node {
        Node::program(vec![
            Node::new(NodeKind::FunctionDeclaration {
                id: Box::new(Node::identifier("alpha")),
                params: vec![],
                body: Box::new(Node::block(vec![Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::number(1.0))) })])),
                is_async: false,
                is_generator: false,
            }),
            Node::new(NodeKind::FunctionDeclaration {
                id: Box::new(Node::identifier("beta")),
                params: vec![],
                body: Box::new(Node::block(vec![Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::number(2.0))) })])),
                is_async: false,
                is_generator: false,
            }),
            Node::expr_stmt(Node::new(NodeKind::CallExpression { callee: Box::new(Node::identifier("alpha")), arguments: vec![] })),
        ])
    }

    #[test]
    fn program_only_mode_extracts_into_a_single_reference_array() {
        let mut tree = two_function_program();
        let options = Options { rgf: RgfOption::ProgramOnly, ..Options::default() };
        let mut pass = Rgf::new(&options, 4, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();

        let body = tree.block_body();
        assert!(!body.iter().any(|n| matches!(n.kind, NodeKind::FunctionDeclaration { .. })));
        let NodeKind::VariableDeclaration { declarations, .. } = &body[0].kind else { panic!("expected the array decl") };
        let Some(init) = &declarations[0].init else { panic!("array decl always has an initializer") };
        let NodeKind::ArrayExpression { elements } = &init.kind else { panic!("expected an array literal") };
        assert_eq!(elements.len(), 2);
        for entry in elements.iter().flatten() {
            assert!(matches!(entry.kind, NodeKind::NewExpression { .. }), "each slot is a `new Function(...)` value");
        }
    }

    #[test]
    fn disabled_rgf_never_extracts_anything() {
        let mut tree = two_function_program();
        let options = Options { rgf: RgfOption::Disabled, ..Options::default() };
        let mut pass = Rgf::new(&options, 4, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();
        let fn_count = tree.block_body().iter().filter(|n| matches!(n.kind, NodeKind::FunctionDeclaration { .. })).count();
        assert_eq!(fn_count, 2);
    }

    #[test]
    fn lock_countermeasures_name_is_never_extracted() {
        let mut tree = two_function_program();
        let options = Options {
            rgf: RgfOption::ProgramOnly,
            lock_countermeasures: Some("alpha".to_owned()),
            ..Options::default()
        };
        let mut pass = Rgf::new(&options, 4, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();
        let alpha_still_declared = tree.block_body().iter().any(|n| matches!(&n.kind, NodeKind::FunctionDeclaration{ id, .. } if id.as_identifier_name() == Some("alpha")));
        assert!(alpha_still_declared);
    }

    #[test]
    fn a_candidate_calling_a_sibling_candidate_still_extracts_both() {
        // function a(){ return b(); } function b(){ return 1; }
        let mut tree = Node::program(vec![
            Node::new(NodeKind::FunctionDeclaration {
                id: Box::new(Node::identifier("a")),
                params: vec![],
                body: Box::new(Node::block(vec![Node::new(NodeKind::ReturnStatement {
                    argument: Some(Box::new(Node::new(NodeKind::CallExpression { callee: Box::new(Node::identifier("b")), arguments: vec![] }))),
                })])),
                is_async: false,
                is_generator: false,
            }),
            Node::new(NodeKind::FunctionDeclaration {
                id: Box::new(Node::identifier("b")),
                params: vec![],
                body: Box::new(Node::block(vec![Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::number(1.0))) })])),
                is_async: false,
                is_generator: false,
            }),
        ]);
        let options = Options { rgf: RgfOption::ProgramOnly, ..Options::default() };
        let mut pass = Rgf::new(&options, 9, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();

        let body = tree.block_body();
        assert!(!body.iter().any(|n| matches!(n.kind, NodeKind::FunctionDeclaration { .. })));
        let NodeKind::VariableDeclaration { declarations, .. } = &body[0].kind else { panic!("expected the array decl") };
        let init = declarations[0].init.as_ref().unwrap();
        let NodeKind::ArrayExpression { elements } = &init.kind else { panic!("expected an array literal") };
        assert_eq!(elements.len(), 2, "both a and b resolve once b's own reference set is empty");
    }

    #[test]
    fn a_candidate_referencing_a_true_outer_variable_is_never_extracted() {
        // var shared = 1; function a(){ return shared; }
        let mut tree = Node::program(vec![
            Node::var_decl(VarKind::Var, "shared", Some(Node::number(1.0))),
            Node::new(NodeKind::FunctionDeclaration {
                id: Box::new(Node::identifier("a")),
                params: vec![],
                body: Box::new(Node::block(vec![Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::identifier("shared"))) })])),
                is_async: false,
                is_generator: false,
            }),
        ]);
        let options = Options { rgf: RgfOption::ProgramOnly, ..Options::default() };
        let mut pass = Rgf::new(&options, 9, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();
        let a_still_declared = tree.block_body().iter().any(|n| matches!(&n.kind, NodeKind::FunctionDeclaration { id, .. } if id.as_identifier_name() == Some("a")));
        assert!(a_still_declared, "a captures `shared`, which a new Function stub can never see");
    }
}
