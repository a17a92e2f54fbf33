//! §4.F Dispatcher: collects sibling function declarations in a block into a
//! dispatch table `M` keyed by freshly generated opaque keys, and rewrites
//! their call sites to go through a single `dispatcher(x, y, z)` router that
//! multiplexes on `y`/`z` to support bare calls, zero-arg calls, `new`, and
//! non-invoking references, all without ever naming the original function.

use ahash::AHashSet;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;

use crate::ast::{Node, NodeKind, VarKind};
use crate::error::ObfResult;
use crate::identifiers::{IdentifierGenerator, NameStyle};
use crate::options::Options;
use crate::probability::ProbabilitySpec;
use crate::scope;
use crate::traversal::AncestorKind;
use crate::transform::{ExitCallback, Pass};

pub struct Dispatcher {
    rng: ChaCha8Rng,
    reserved: AHashSet<String>,
    generated: AHashSet<String>,
    names: IdentifierGenerator,
    probability: ProbabilitySpec,
}

/// The three distinguished integers the dispatcher's `y`/`z` selectors are
/// compared against (§4.F). Drawn fresh per dispatcher instance so no two
/// dispatchers in the same program share a protocol.
struct DispatchProtocol {
    expected_clear_args: i64,
    expected_get: i64,
    expected_new: i64,
}

impl DispatchProtocol {
    fn draw(rng: &mut impl Rng) -> Self {
        let mut values = AHashSet::new();
        while values.len() < 3 {
            values.insert(rng.gen_range(1..100_000));
        }
        let mut it = values.into_iter();
        Self { expected_clear_args: it.next().unwrap(), expected_get: it.next().unwrap(), expected_new: it.next().unwrap() }
    }
}

impl Dispatcher {
    #[must_use]
    pub fn new(options: &Options, seed: u64, reserved: AHashSet<String>, generated: AHashSet<String>) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
            reserved,
            generated,
            names: IdentifierGenerator::new(NameStyle::Mangled),
            probability: options.dispatcher.clone(),
        }
    }

    fn fresh(&mut self) -> String {
        self.names.generate(&mut self.rng, &self.reserved, &mut self.generated)
    }

    /// §4.F criteria (a)-(e): a candidate is a direct `FunctionDeclaration`
    /// in `body` that is not `$dispatcherSkip`/`$requiresEval`, doesn't use
    /// `this`/`super`/`arguments` in its own context, and whose name is
    /// neither reassigned nor redeclared *elsewhere* in `body` — the
    /// function's own declaring statement is excluded from that last check,
    /// since [`scope::name_is_reassigned_or_redeclared`] always matches a
    /// `FunctionDeclaration`'s own name.
    fn candidates(body: &[Node]) -> Vec<(usize, String)> {
        scope::direct_function_declarations(body)
            .into_iter()
            .filter(|(i, name)| {
                let decl = &body[*i];
                if decl.annotations.dispatcher_skip || decl.annotations.requires_eval {
                    return false;
                }
                let NodeKind::FunctionDeclaration { body: fn_body, is_async, is_generator, .. } = &decl.kind else {
                    return false;
                };
                if *is_generator {
                    return false;
                }
                let own_context = scope::scan_own_context(fn_body);
                if own_context.uses_this || own_context.uses_super || own_context.uses_arguments || own_context.uses_meta_property {
                    return false;
                }
                if contains_await(fn_body) && !*is_async {
                    return false;
                }
                !body.iter().enumerate().any(|(j, stmt)| j != *i && scope::name_is_reassigned_or_redeclared(stmt, name))
            })
            .collect()
    }
}

/// Dispatcher no-ops inside `await`: an awaited call can't be routed through
/// a synchronous dispatch table without changing its suspension point.
fn contains_await(node: &Node) -> bool {
    match &node.kind {
        NodeKind::AwaitExpression { .. } => true,
        NodeKind::FunctionDeclaration { .. } | NodeKind::FunctionExpression { .. } => false,
        _ => crate::traversal::children(node).into_iter().any(contains_await),
    }
}

impl Pass for Dispatcher {
    fn priority(&self) -> i32 {
        20
    }

    fn matches(&mut self, node: &Node, ancestors: &[AncestorKind]) -> bool {
        if matches!(ancestors.last(), Some(AncestorKind::AwaitExpression)) {
            return false;
        }
        if !node.is_block() || node.annotations.dispatcher_skip {
            return false;
        }
        if Self::candidates(node.block_body()).len() < 2 {
            return false;
        }
        self.probability.decide(&mut self.rng)
    }

    fn transform<'a>(&'a mut self, node: &mut Node, _ancestors: &[AncestorKind]) -> ObfResult<Option<ExitCallback<'a>>> {
        let body = std::mem::take(node.block_body_mut());
        let candidates = Self::candidates(&body);

        let dispatcher_name = self.fresh();
        let table_name = self.fresh();
        let payload_name = self.fresh();
        let a_params = [self.fresh(), self.fresh(), self.fresh()];
        let protocol = DispatchProtocol::draw(&mut self.rng);

        // Opaque keys: fresh, unrelated to the function's real name (§4.F,
        // the review's flagged gap — the old code used `Node::string_literal(name)`).
        let mut dispatched: HashMap<String, String> = HashMap::new();
        for (_, name) in &candidates {
            dispatched.insert(name.clone(), self.fresh());
        }
        let candidate_indices: AHashSet<usize> = candidates.iter().map(|(i, _)| *i).collect();

        let mut rest = Vec::with_capacity(body.len());
        let mut table_entries = Vec::with_capacity(candidates.len());

        for (i, stmt) in body.into_iter().enumerate() {
            if candidate_indices.contains(&i) {
                let name = candidates.iter().find(|(idx, _)| *idx == i).map(|(_, n)| n.clone()).unwrap();
                let key = dispatched[&name].clone();
                let NodeKind::FunctionDeclaration { params, body: fn_body, is_async, .. } = stmt.kind else {
                    unreachable!("candidate index filtered to FunctionDeclaration");
                };
                table_entries.push(build_table_entry(&key, params, *fn_body, is_async, &payload_name, &a_params));
            } else {
                let mut stmt = stmt;
                self.rewrite_call_sites(&mut stmt, &dispatched, &dispatcher_name, &payload_name, &protocol);
                rest.push(stmt);
            }
        }

        let mut new_body = Vec::with_capacity(rest.len() + 3);
        new_body.push(Node::var_decl(VarKind::Var, payload_name.clone(), Some(Node::new(NodeKind::ArrayExpression { elements: vec![] }))));
        new_body.push(Node::var_decl(VarKind::Var, table_name.clone(), Some(Node::new(NodeKind::ObjectExpression { properties: table_entries }))));
        new_body.push(build_dispatcher_function(&dispatcher_name, &table_name, &payload_name, &protocol));
        new_body.extend(rest);
        *node.block_body_mut() = new_body;
        node.annotations.dispatcher_skip = true;
        Ok(None)
    }

    fn generated_names(&self) -> AHashSet<String> {
        self.generated.clone()
    }
}

fn dot(object: Node, prop: &str) -> Node {
    Node::new(NodeKind::MemberExpression { object: Box::new(object), property: Box::new(Node::identifier(prop)), computed: false })
}

/// `<key>: function(a0, a1, a2){ var [p0, p1] = payload; <decoy>; <body> }`
/// — the table entry's own `FunctionExpression` keeps its own scope, so a
/// `return` anywhere inside the original body (even nested in a loop or
/// switch) still just returns from this function, never from `dispatcher`.
fn build_table_entry(key: &str, params: Vec<Node>, fn_body: Node, is_async: bool, payload_name: &str, a_params: &[String; 3]) -> Node {
    let NodeKind::BlockStatement { mut body } = fn_body.kind else {
        unreachable!("function body is always a BlockStatement");
    };

    let mut prologue = Vec::new();
    if let Some(pattern) = params_pattern(&params) {
        prologue.push(Node::new(NodeKind::VariableDeclaration {
            kind: VarKind::Var,
            declarations: vec![crate::ast::VariableDeclarator { id: Box::new(pattern), init: Some(Box::new(Node::identifier(payload_name))) }],
        }));
    }
    // Safe decoy: dispatcher always calls with a truthy canary, so this
    // branch is dead on every real invocation path; it only fires if
    // something calls the table entry directly, bypassing the dispatcher.
    prologue.push(Node::if_stmt(
        Node::unary("!", Node::identifier(a_params[0].clone()), true),
        Node::block(vec![Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::new(NodeKind::Literal { value: crate::ast::LiteralValue::Null }))) })]),
        None,
    ));

    let mut new_body = prologue;
    new_body.append(&mut body);

    Node::new(NodeKind::Property {
        key: Box::new(Node::string_literal(key)),
        value: Box::new(Node::new(NodeKind::FunctionExpression {
            id: None,
            params: a_params.iter().cloned().map(Node::identifier).collect(),
            body: Box::new(Node::block(new_body)),
            is_async,
            is_generator: false,
        })),
        computed: false,
        shorthand: false,
    })
}

fn params_pattern(params: &[Node]) -> Option<Node> {
    if params.is_empty() {
        return None;
    }
    Some(Node::new(NodeKind::ArrayPattern { elements: params.iter().cloned().map(Some).collect() }))
}

/// ```js
/// function dispatcher(x, y, z) {
///   if (y === expectedClearArgs) { payload = []; }
///   if (y === expectedGet) {
///     return function(){ payload = Array.prototype.slice.call(arguments); return M[x].call(this, true); };
///   }
///   var result = M[x].call(this, true);
///   if (z === expectedNew) { return { member: result }; }
///   return result;
/// }
/// ```
fn build_dispatcher_function(dispatcher_name: &str, table_name: &str, payload_name: &str, protocol: &DispatchProtocol) -> Node {
    let x = "x";
    let y = "y";
    let z = "z";
    let canary = Node::boolean(true);

    // `M[x].call(this, canary)` — `x` is looked up dynamically at the member access.
    let invoke_member = |canary: Node| -> Node {
        Node::new(NodeKind::CallExpression {
            callee: Box::new(dot(Node::new(NodeKind::MemberExpression { object: Box::new(Node::identifier(table_name)), property: Box::new(Node::identifier(x)), computed: true }), "call")),
            arguments: vec![Node::new(NodeKind::ThisExpression), canary],
        })
    };

    let reset_payload = Node::if_stmt(
        Node::binary("===", Node::identifier(y), Node::number(protocol.expected_clear_args as f64)),
        Node::block(vec![Node::expr_stmt(Node::assign("=", Node::identifier(payload_name), Node::new(NodeKind::ArrayExpression { elements: vec![] })))]),
        None,
    );

    let sliced = Node::new(NodeKind::CallExpression {
        callee: Box::new(dot(dot(dot(Node::identifier("Array"), "prototype"), "slice"), "call")),
        arguments: vec![Node::identifier("arguments")],
    });
    let closure_body = Node::block(vec![
        Node::expr_stmt(Node::assign("=", Node::identifier(payload_name), sliced)),
        Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(invoke_member(canary.clone()))) }),
    ]);
    let closure = Node::new(NodeKind::FunctionExpression { id: None, params: vec![], body: Box::new(closure_body), is_async: false, is_generator: false });
    let get_branch = Node::if_stmt(
        Node::binary("===", Node::identifier(y), Node::number(protocol.expected_get as f64)),
        Node::block(vec![Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(closure)) })]),
        None,
    );

    let result_decl = Node::var_decl(VarKind::Var, "result", Some(invoke_member(canary)));
    let wrap = Node::if_stmt(
        Node::binary("===", Node::identifier(z), Node::number(protocol.expected_new as f64)),
        Node::block(vec![Node::new(NodeKind::ReturnStatement {
            argument: Some(Box::new(Node::new(NodeKind::ObjectExpression {
                properties: vec![Node::new(NodeKind::Property {
                    key: Box::new(Node::identifier("member")),
                    value: Box::new(Node::identifier("result")),
                    computed: false,
                    shorthand: false,
                })],
            }))),
        })]),
        None,
    );
    let final_return = Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::identifier("result"))) });

    Node::new(NodeKind::FunctionDeclaration {
        id: Box::new(Node::identifier(dispatcher_name)),
        params: vec![Node::identifier(x), Node::identifier(y), Node::identifier(z)],
        body: Box::new(Node::block(vec![reset_payload, get_branch, result_decl, wrap, final_return])),
        is_async: false,
        is_generator: false,
    })
}

impl Dispatcher {
    /// Rewrites every occurrence of a dispatched name under `node`. A call
    /// `f(args)` goes through the sequence-expression form, `new f(args)`
    /// through the `new dispatcher(...).member` form (so the `new` target's
    /// semantics, such as the constructed object, stay observably the same),
    /// and a non-invoking reference `f` becomes `dispatcher(key, expectedGet)`.
    /// An ordinary (non-`new`) call site has an equal chance of being
    /// disguised as the `new dispatcher(...).member` form too, since
    /// candidates never use `this` and so can't tell the difference.
    fn rewrite_call_sites(
        &mut self,
        node: &mut Node,
        dispatched: &HashMap<String, String>,
        dispatcher_name: &str,
        payload_name: &str,
        protocol: &DispatchProtocol,
    ) {
        match &mut node.kind {
            NodeKind::CallExpression { callee, arguments } => {
                if let Some(key) = callee.as_identifier_name().and_then(|n| dispatched.get(n)).cloned() {
                    for arg in arguments.iter_mut() {
                        self.rewrite_call_sites(arg, dispatched, dispatcher_name, payload_name, protocol);
                    }
                    let args = std::mem::take(arguments);
                    let use_new_form = self.rng.gen_bool(0.5);
                    *node = build_call_rewrite(&key, args, dispatcher_name, payload_name, protocol, use_new_form);
                    return;
                }
                self.rewrite_call_sites(callee, dispatched, dispatcher_name, payload_name, protocol);
                for arg in arguments.iter_mut() {
                    self.rewrite_call_sites(arg, dispatched, dispatcher_name, payload_name, protocol);
                }
            }
            NodeKind::NewExpression { callee, arguments } => {
                if let Some(key) = callee.as_identifier_name().and_then(|n| dispatched.get(n)).cloned() {
                    for arg in arguments.iter_mut() {
                        self.rewrite_call_sites(arg, dispatched, dispatcher_name, payload_name, protocol);
                    }
                    let args = std::mem::take(arguments);
                    *node = build_call_rewrite(&key, args, dispatcher_name, payload_name, protocol, true);
                    return;
                }
                self.rewrite_call_sites(callee, dispatched, dispatcher_name, payload_name, protocol);
                for arg in arguments.iter_mut() {
                    self.rewrite_call_sites(arg, dispatched, dispatcher_name, payload_name, protocol);
                }
            }
            NodeKind::VariableDeclaration { declarations, .. } => {
                for decl in declarations.iter_mut() {
                    if let Some(init) = &mut decl.init {
                        self.rewrite_call_sites(init, dispatched, dispatcher_name, payload_name, protocol);
                    }
                }
            }
            NodeKind::FunctionDeclaration { body, .. } | NodeKind::FunctionExpression { body, .. } | NodeKind::ArrowFunctionExpression { body, .. } => {
                self.rewrite_call_sites(body, dispatched, dispatcher_name, payload_name, protocol);
            }
            NodeKind::AssignmentExpression { left, right, .. } => {
                if left.as_identifier_name().is_none() {
                    self.rewrite_call_sites(left, dispatched, dispatcher_name, payload_name, protocol);
                }
                self.rewrite_call_sites(right, dispatched, dispatcher_name, payload_name, protocol);
            }
            NodeKind::Property { key, value, computed, .. } => {
                if *computed {
                    self.rewrite_call_sites(key, dispatched, dispatcher_name, payload_name, protocol);
                }
                self.rewrite_call_sites(value, dispatched, dispatcher_name, payload_name, protocol);
            }
            NodeKind::Identifier { name } => {
                if let Some(key) = dispatched.get(name.as_str()).cloned() {
                    *node = Node::new(NodeKind::CallExpression {
                        callee: Box::new(Node::identifier(dispatcher_name)),
                        arguments: vec![Node::string_literal(key), Node::number(protocol.expected_get as f64)],
                    });
                }
            }
            _ => {
                for child in crate::traversal::children_mut(node) {
                    self.rewrite_call_sites(child, dispatched, dispatcher_name, payload_name, protocol);
                }
            }
        }
    }
}

fn build_call_rewrite(key: &str, args: Vec<Node>, dispatcher_name: &str, payload_name: &str, protocol: &DispatchProtocol, use_new_form: bool) -> Node {
    let key_lit = || Node::string_literal(key.to_owned());
    let dispatcher_call = |extra: Vec<Node>| -> Node {
        let mut call_args = vec![key_lit()];
        call_args.extend(extra);
        if use_new_form {
            let new_expr = Node::new(NodeKind::NewExpression { callee: Box::new(Node::identifier(dispatcher_name)), arguments: call_args });
            dot(new_expr, "member")
        } else {
            Node::new(NodeKind::CallExpression { callee: Box::new(Node::identifier(dispatcher_name)), arguments: call_args })
        }
    };

    if args.is_empty() {
        let mut extra = vec![Node::number(protocol.expected_clear_args as f64)];
        if use_new_form {
            extra.push(Node::number(protocol.expected_new as f64));
        }
        return dispatcher_call(extra);
    }

    let set_payload = Node::assign("=", Node::identifier(payload_name), Node::new(NodeKind::ArrayExpression { elements: args.into_iter().map(Some).collect() }));
    let mut extra = vec![Node::identifier("undefined")];
    if use_new_form {
        extra.push(Node::number(protocol.expected_new as f64));
    }
    Node::sequence(vec![set_payload, dispatcher_call(extra)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::apply_pass;

    fn two_function_block() -> Node {
        Node::block(vec![
            Node::new(NodeKind::FunctionDeclaration {
                id: Box::new(Node::identifier("alpha")),
                params: vec![],
                body: Box::new(Node::block(vec![Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::number(1.0))) })])),
                is_async: false,
                is_generator: false,
            }),
            Node::new(NodeKind::FunctionDeclaration {
                id: Box::new(Node::identifier("beta")),
                params: vec![Node::identifier("n")],
                body: Box::new(Node::block(vec![Node::new(NodeKind::ReturnStatement { argument: Some(Box::new(Node::identifier("n"))) })])),
                is_async: false,
                is_generator: false,
            }),
            Node::expr_stmt(Node::new(NodeKind::CallExpression { callee: Box::new(Node::identifier("alpha")), arguments: vec![] })),
            Node::expr_stmt(Node::new(NodeKind::CallExpression { callee: Box::new(Node::identifier("beta")), arguments: vec![Node::number(5.0)] })),
        ])
    }

    #[test]
    fn candidates_require_at_least_two_siblings() {
        let one_fn = Node::block(vec![Node::new(NodeKind::FunctionDeclaration {
            id: Box::new(Node::identifier("solo")),
            params: vec![],
            body: Box::new(Node::block(vec![])),
            is_async: false,
            is_generator: false,
        })]);
        assert!(Dispatcher::candidates(one_fn.block_body()).len() < 2);
    }

    #[test]
    fn eligible_block_builds_a_payload_table_with_opaque_keys_and_no_original_names() {
        let mut tree = two_function_block();
        let options = Options { dispatcher: ProbabilitySpec::Boolean(true), ..Options::default() };
        let mut pass = Dispatcher::new(&options, 3, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();

        let body = tree.block_body();
        // payload array, table object, dispatcher function, then the two rewritten call statements.
        assert!(matches!(body[0].kind, NodeKind::VariableDeclaration { .. }), "payload decl");
        let NodeKind::VariableDeclaration { declarations, .. } = &body[1].kind else { panic!("expected table decl") };
        let init = declarations[0].init.as_ref().unwrap();
        let NodeKind::ObjectExpression { properties } = &init.kind else { panic!("expected the dispatch table object") };
        assert_eq!(properties.len(), 2);
        for prop in properties {
            let NodeKind::Property { key, .. } = &prop.kind else { panic!("expected a Property") };
            let NodeKind::Literal { value: crate::ast::LiteralValue::String(s) } = &key.kind else { panic!("expected a string key") };
            assert!(s != "alpha" && s != "beta", "key must be opaque, not the original name");
        }
        assert!(matches!(body[2].kind, NodeKind::FunctionDeclaration { .. }), "dispatcher function");

        let no_bare_calls_remain = body[3..].iter().all(|stmt| {
            let NodeKind::ExpressionStatement { expression } = &stmt.kind else { return true };
            !matches!(&expression.kind, NodeKind::CallExpression { callee, .. } if callee.as_identifier_name() == Some("alpha") || callee.as_identifier_name() == Some("beta"))
        });
        assert!(no_bare_calls_remain);
    }

    #[test]
    fn dispatcher_function_always_terminates_every_branch_with_a_return() {
        let mut tree = two_function_block();
        let options = Options { dispatcher: ProbabilitySpec::Boolean(true), ..Options::default() };
        let mut pass = Dispatcher::new(&options, 3, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut tree).unwrap();

        let NodeKind::FunctionDeclaration { body, .. } = &tree.block_body()[2].kind else { panic!("expected dispatcher") };
        assert!(matches!(body.block_body().last().unwrap().kind, NodeKind::ReturnStatement { argument: Some(_) }), "dispatcher's fallthrough path always returns a value");
    }

    #[test]
    fn await_expression_ancestor_is_never_a_dispatcher_candidate_site() {
        let inner = two_function_block();
        let mut await_expr = Node::new(NodeKind::AwaitExpression { argument: Box::new(inner) });
        let options = Options { dispatcher: ProbabilitySpec::Boolean(true), ..Options::default() };
        let mut pass = Dispatcher::new(&options, 3, crate::ast::default_reserved_identifiers(), AHashSet::new());
        apply_pass(&mut pass, &mut await_expr).unwrap();
        if let NodeKind::AwaitExpression { argument } = &await_expr.kind {
            let fn_count = argument.block_body().iter().filter(|n| matches!(n.kind, NodeKind::FunctionDeclaration { .. })).count();
            assert_eq!(fn_count, 2);
        }
    }
}
