//! §4.G Flatten: lifts an eligible function declaration's body out to a
//! top-level `flat_<name>(input, params, result)` function, threading free
//! variables and parameters through arrays and returns/writebacks through a
//! shared `result` object, leaving a thin call-through in its place.

use ahash::AHashSet;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

use crate::ast::{LiteralValue, Node, NodeKind, VarKind};
use crate::error::ObfResult;
use crate::identifiers::{IdentifierGenerator, NameStyle};
use crate::options::Options;
use crate::probability::ProbabilitySpec;
use crate::scope;
use crate::traversal::AncestorKind;
use crate::transform::{ExitCallback, Pass};

/// Decoy prologue templates spliced into `flat_X` with independent 25%
/// Bernoulli trials each (§4.G), so the lifted body isn't recognizable by
/// shape alone. Each is a self-contained, side-effect-free statement.
const DECOY_TEMPLATES: &[fn() -> Node] = &[
    || Node::expr_stmt(Node::binary("+", Node::number(0.0), Node::number(0.0))),
    || Node::if_stmt(Node::boolean(false), Node::block(vec![]), None),
    || Node::var_decl(VarKind::Var, "__flat_decoy_a", Some(Node::boolean(true))),
    || Node::expr_stmt(Node::unary_typeof(Node::identifier("undefined"))),
    || Node::var_decl(VarKind::Var, "__flat_decoy_b", Some(Node::new(NodeKind::ArrayExpression { elements: vec![] }))),
    || Node::expr_stmt(Node::new(NodeKind::ConditionalExpression {
        test: Box::new(Node::boolean(true)),
        consequent: Box::new(Node::number(1.0)),
        alternate: Box::new(Node::number(0.0)),
    })),
    || Node::var_decl(VarKind::Var, "__flat_decoy_c", Some(Node::new(NodeKind::ObjectExpression { properties: vec![] }))),
    || Node::expr_stmt(Node::binary("===", Node::string_literal(""), Node::string_literal(""))),
];

pub struct Flatten {
    rng: ChaCha8Rng,
    reserved: AHashSet<String>,
    generated: AHashSet<String>,
    names: IdentifierGenerator,
    probability: ProbabilitySpec,
    lifted: Vec<Node>,
}

impl Flatten {
    #[must_use]
    pub fn new(options: &Options, seed: u64, reserved: AHashSet<String>, generated: AHashSet<String>) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            reserved,
            generated,
            names: IdentifierGenerator::new(NameStyle::Mangled),
            probability: options.flatten.clone(),
            lifted: Vec::new(),
        }
    }

    fn fresh(&mut self) -> String {
        self.names.generate(&mut self.rng, &self.reserved, &mut self.generated)
    }

    /// §4.G abort conditions: the candidate must not touch `this`, `super`,
    /// `arguments`, a `MetaProperty` (`new.target`), declare a lexical
    /// binding directly in its own body, or contain a `try` block (moving a
    /// `try` across a function boundary would change its stack-trace-visible
    /// shape).
    fn eligible(fn_body: &Node) -> bool {
        let usage = scope::scan_own_context(fn_body);
        !(usage.uses_this || usage.uses_super || usage.uses_arguments || usage.uses_meta_property || usage.declares_lexical || usage.uses_try)
    }
}

impl Pass for Flatten {
    fn priority(&self) -> i32 {
        30
    }

    fn matches(&mut self, node: &Node, _ancestors: &[AncestorKind]) -> bool {
        let NodeKind::FunctionDeclaration { body, is_generator, .. } = &node.kind else {
            return false;
        };
        if *is_generator || node.annotations.requires_eval || node.annotations.last_transform.as_deref() == Some("flatten") {
            return false;
        }
        if !Self::eligible(body) {
            return false;
        }
        self.probability.decide(&mut self.rng)
    }

    fn transform<'a>(&'a mut self, node: &mut Node, _ancestors: &[AncestorKind]) -> ObfResult<Option<ExitCallback<'a>>> {
        let NodeKind::FunctionDeclaration { id, params, body, is_async, .. } = &mut node.kind else {
            unreachable!("matches() only accepts FunctionDeclaration");
        };
        let own_name = id.as_identifier_name().unwrap_or("anonymous").to_owned();
        let param_names: Vec<String> = params.iter().filter_map(Node::as_identifier_name).map(str::to_owned).collect();

        let usage = scope::classify_identifiers(body);
        let free_inputs: Vec<String> = usage
            .input_names()
            .into_iter()
            .filter(|name| !param_names.contains(name) && *name != own_name)
            .collect();
        let free_outputs: Vec<String> = free_inputs.iter().filter(|name| usage.modified.contains(*name)).cloned().collect();

        let flat_name = format!("flat_{}", self.fresh());
        let input_param = self.fresh();
        let params_param = self.fresh();
        let result_param = self.fresh();

        let mut flat_stmts = std::mem::take(body.block_body_mut());
        strip_use_strict(&mut flat_stmts);
        for stmt in &mut flat_stmts {
            rewrite_returns(stmt, &free_outputs, &result_param);
        }
        let mut flat_body = prologue(&free_inputs, &input_param, &param_names, &params_param);
        flat_body.extend(decorate_with_decoys(&mut self.rng, flat_stmts));

        let flat_fn = Node::new(NodeKind::FunctionDeclaration {
            id: Box::new(Node::identifier(flat_name.clone())),
            params: vec![Node::identifier(input_param.clone()), Node::identifier(params_param.clone()), Node::identifier(result_param.clone())],
            body: Box::new(Node::block(flat_body)),
            is_async: *is_async,
            is_generator: false,
        });
        self.lifted.push(flat_fn);

        let local_result = self.fresh();
        let call = Node::new(NodeKind::CallExpression {
            callee: Box::new(Node::identifier(flat_name)),
            arguments: vec![
                Node::new(NodeKind::ArrayExpression { elements: free_inputs.iter().cloned().map(Node::identifier).map(Some).collect() }),
                Node::new(NodeKind::ArrayExpression { elements: param_names.iter().cloned().map(Node::identifier).map(Some).collect() }),
                Node::identifier(local_result.clone()),
            ],
        });
        let call_expr = if *is_async { Node::new(NodeKind::AwaitExpression { argument: Box::new(call) }) } else { call };

        let mut wrapper = vec![
            Node::var_decl(VarKind::Var, local_result.clone(), Some(Node::new(NodeKind::ObjectExpression { properties: vec![] }))),
            Node::expr_stmt(call_expr),
        ];
        for output in &free_outputs {
            wrapper.push(Node::expr_stmt(Node::assign(
                "=",
                Node::identifier(output.clone()),
                dot(Node::identifier(local_result.clone()), &out_key(output)),
            )));
        }
        wrapper.push(Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(dot(Node::identifier(local_result.clone()), "value"))) }));

        *body.block_body_mut() = wrapper;
        node.annotations.last_transform = Some("flatten".to_owned());
        Ok(None)
    }

    fn after(&mut self, tree: &mut Node) -> ObfResult<()> {
        if self.lifted.is_empty() {
            return Ok(());
        }
        let lifted = std::mem::take(&mut self.lifted);
        if tree.is_block() {
            tree.block_body_mut().extend(lifted);
        }
        Ok(())
    }

    fn generated_names(&self) -> AHashSet<String> {
        self.generated.clone()
    }
}

fn out_key(name: &str) -> String {
    format!("out_{name}")
}

fn dot(object: Node, prop: &str) -> Node {
    Node::new(NodeKind::MemberExpression { object: Box::new(object), property: Box::new(Node::identifier(prop)), computed: false })
}

fn index(array_name: &str, idx: usize) -> Node {
    Node::new(NodeKind::MemberExpression {
        object: Box::new(Node::identifier(array_name)),
        property: Box::new(Node::number(idx as f64)),
        computed: true,
    })
}

/// `var <freeVar> = <inputParam>[i];` for each free variable, then
/// `var <param> = <paramsParam>[j];` for each original parameter —
/// preserving the body's existing identifier names so nothing inside needs
/// rewriting beyond the `return` statements.
fn prologue(free_inputs: &[String], input_param: &str, param_names: &[String], params_param: &str) -> Vec<Node> {
    let mut stmts = Vec::with_capacity(free_inputs.len() + param_names.len());
    for (i, name) in free_inputs.iter().enumerate() {
        stmts.push(Node::var_decl(VarKind::Var, name.clone(), Some(index(input_param, i))));
    }
    for (j, name) in param_names.iter().enumerate() {
        stmts.push(Node::var_decl(VarKind::Var, name.clone(), Some(index(params_param, j))));
    }
    stmts
}

fn strip_use_strict(body: &mut Vec<Node>) {
    body.retain(|stmt| {
        !matches!(
            &stmt.kind,
            NodeKind::ExpressionStatement { expression } if matches!(&expression.kind, NodeKind::Literal { value: LiteralValue::String(s) } if s == "use strict")
        )
    });
}

/// Recursively rewrites every `return` reachable from `node` without
/// crossing a nested function boundary (§4.G: a `return` inside a function
/// nested in the flattened body belongs to that inner function, not this
/// one). Each `return expr;` becomes `result.out_X = x; … result.value =
/// expr;` followed by a bare `return;`.
fn rewrite_returns(node: &mut Node, outputs: &[String], result_param: &str) {
    match &mut node.kind {
        NodeKind::BlockStatement { body } | NodeKind::Program { body } => {
            for stmt in body.iter_mut() {
                rewrite_returns(stmt, outputs, result_param);
            }
        }
        NodeKind::IfStatement { consequent, alternate, .. } => {
            rewrite_returns(consequent, outputs, result_param);
            if let Some(alt) = alternate {
                rewrite_returns(alt, outputs, result_param);
            }
        }
        NodeKind::WhileStatement { body, .. }
        | NodeKind::DoWhileStatement { body, .. }
        | NodeKind::ForStatement { body, .. }
        | NodeKind::LabeledStatement { body, .. } => rewrite_returns(body, outputs, result_param),
        NodeKind::SwitchStatement { cases, .. } => {
            for case in cases.iter_mut() {
                for stmt in case.consequent.iter_mut() {
                    rewrite_returns(stmt, outputs, result_param);
                }
            }
        }
        NodeKind::TryStatement { block, handler, finalizer } => {
            rewrite_returns(block, outputs, result_param);
            if let Some(h) = handler {
                rewrite_returns(&mut h.body, outputs, result_param);
            }
            if let Some(f) = finalizer {
                rewrite_returns(f, outputs, result_param);
            }
        }
        NodeKind::ReturnStatement { argument } => {
            let mut assigns: Vec<Node> = outputs
                .iter()
                .map(|name| Node::expr_stmt(Node::assign("=", dot(Node::identifier(result_param), &out_key(name)), Node::identifier(name.clone()))))
                .collect();
            let value_expr = argument.take().map(|b| *b).unwrap_or_else(|| Node::identifier("undefined"));
            assigns.push(Node::expr_stmt(Node::assign("=", dot(Node::identifier(result_param), "value"), value_expr)));
            assigns.push(Node::new(NodeKind::ReturnStatement { argument: None }));
            *node = Node::block(assigns);
        }
        // Function/arrow boundaries and everything else (expressions,
        // declarations, break/continue, …) carry no `return` of this
        // function's to rewrite.
        _ => {}
    }
}

fn decorate_with_decoys(rng: &mut impl rand::Rng, body: Vec<Node>) -> Vec<Node> {
    let mut out = Vec::with_capacity(body.len() + DECOY_TEMPLATES.len() / 4);
    for template in DECOY_TEMPLATES {
        if rng.gen_bool(0.25) {
            out.push(template());
        }
    }
    out.extend(body);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::apply_pass;

    fn simple_function() -> Node {
        Node::new(NodeKind::FunctionDeclaration {
            id: Box::new(Node::identifier("add")),
            params: vec![Node::identifier("x")],
            body: Box::new(Node::block(vec![Node::new(NodeKind::ReturnStatement {
                argument: Some(Box::new(Node::binary("+", Node::identifier("x"), Node::identifier("y")))),
            })])),
            is_async: false,
            is_generator: false,
        })
    }

    #[test]
    fn eligible_function_becomes_a_thin_call_through() {
        let mut tree = Node::program(vec![simple_function()]);
        let options = Options { flatten: ProbabilitySpec::Boolean(true), ..Options::default() };
        let mut pass = Flatten::new(&options, 11, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();

        let body = tree.block_body();
        let NodeKind::FunctionDeclaration { body: add_body, .. } = &body[0].kind else { panic!("expected add") };
        let wrapper = add_body.block_body();
        assert!(wrapper.iter().any(|s| matches!(&s.kind, NodeKind::ExpressionStatement { expression } if matches!(expression.kind, NodeKind::CallExpression { .. }))));
        assert!(matches!(wrapper.last().unwrap().kind, NodeKind::ReturnStatement { argument: Some(_) }));

        let NodeKind::FunctionDeclaration { id, params, .. } = &body[1].kind else { panic!("expected lifted flat_ function") };
        assert!(id.as_identifier_name().unwrap().starts_with("flat_"));
        assert_eq!(params.len(), 3, "flat_X(input, params, result)");
    }

    #[test]
    fn function_using_this_is_never_flattened() {
        let mut tree = Node::program(vec![Node::new(NodeKind::FunctionDeclaration {
            id: Box::new(Node::identifier("method")),
            params: vec![],
            body: Box::new(Node::block(vec![Node::expr_stmt(Node::new(NodeKind::ThisExpression))])),
            is_async: false,
            is_generator: false,
        })]);
        let options = Options { flatten: ProbabilitySpec::Boolean(true), ..Options::default() };
        let mut pass = Flatten::new(&options, 2, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();
        assert_eq!(tree.block_body().len(), 1);
    }

    #[test]
    fn captured_variable_mutation_is_written_back_through_result() {
        // function outer(){ var x = 10; function inner(){ x = 5; return x; } inner(); return x; }
        let inner = Node::new(NodeKind::FunctionDeclaration {
            id: Box::new(Node::identifier("inner")),
            params: vec![],
            body: Box::new(Node::block(vec![
                Node::expr_stmt(Node::assign("=", Node::identifier("x"), Node::number(5.0))),
                Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::identifier("x"))) }),
            ])),
            is_async: false,
            is_generator: false,
        });
        let mut tree = Node::program(vec![Node::new(NodeKind::FunctionDeclaration {
            id: Box::new(Node::identifier("outer")),
            params: vec![],
            body: Box::new(Node::block(vec![
                Node::var_decl(VarKind::Var, "x", Some(Node::number(10.0))),
                inner,
                Node::expr_stmt(Node::new(NodeKind::CallExpression { callee: Box::new(Node::identifier("inner")), arguments: vec![] })),
                Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::identifier("x"))) }),
            ])),
            is_async: false,
            is_generator: false,
        })]);
        let options = Options { flatten: ProbabilitySpec::Boolean(true), ..Options::default() };
        let mut pass = Flatten::new(&options, 5, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();

        // `inner` was flattened: its lifted flat_ function must write `x`
        // back into `result.out_x` before returning, and the thin
        // call-through in outer's body must read it back into `x`.
        let NodeKind::FunctionDeclaration { body: outer_body, .. } = &tree.block_body()[0].kind else { panic!("expected outer") };
        let inner_flat_name = {
            let NodeKind::FunctionDeclaration { body: inner_body, .. } = &outer_body.block_body()[1].kind else { panic!("expected inner") };
            let NodeKind::ExpressionStatement { expression } = &inner_body.block_body()[1].kind else { panic!("expected call-through") };
            let NodeKind::CallExpression { callee, .. } = &expression.kind else { panic!("expected call") };
            callee.as_identifier_name().unwrap().to_owned()
        };
        assert!(outer_body.block_body().iter().any(|s| matches!(&s.kind, NodeKind::ExpressionStatement { expression } if matches!(&expression.kind, NodeKind::AssignmentExpression { left, .. } if left.as_identifier_name() == Some("x")))));

        let flat_fn = tree.block_body().iter().find_map(|n| match &n.kind {
            NodeKind::FunctionDeclaration { id, body, .. } if id.as_identifier_name() == Some(&inner_flat_name) => Some(body.as_ref()),
            _ => None,
        });
        assert!(flat_fn.is_some(), "the lifted flat_ function must exist at top level");
    }
}
