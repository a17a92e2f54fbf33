//! The traversal framework (component B): a depth-first, mutation-safe walk
//! over [`Node`] trees with pre/post visitation and short-circuit exit.

use crate::ast::{Node, NodeKind};

/// A coarse tag for an ancestor node, used by passes to gate on ancestor
/// shape (e.g. CFF's "grandparent is not an `IfStatement`/`ForStatement`/
/// `WhileStatement`" eligibility check) without needing simultaneous mutable
/// access to the ancestor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AncestorKind {
    Program,
    BlockStatement,
    IfStatement,
    SwitchStatement,
    WhileStatement,
    DoWhileStatement,
    ForStatement,
    FunctionDeclaration,
    FunctionExpression,
    ArrowFunctionExpression,
    TryStatement,
    LabeledStatement,
    AwaitExpression,
    Other,
}

impl AncestorKind {
    #[must_use]
    pub fn of(node: &Node) -> Self {
        match &node.kind {
            NodeKind::Program { .. } => Self::Program,
            NodeKind::BlockStatement { .. } => Self::BlockStatement,
            NodeKind::IfStatement { .. } => Self::IfStatement,
            NodeKind::SwitchStatement { .. } => Self::SwitchStatement,
            NodeKind::WhileStatement { .. } => Self::WhileStatement,
            NodeKind::DoWhileStatement { .. } => Self::DoWhileStatement,
            NodeKind::ForStatement { .. } => Self::ForStatement,
            NodeKind::FunctionDeclaration { .. } => Self::FunctionDeclaration,
            NodeKind::FunctionExpression { .. } => Self::FunctionExpression,
            NodeKind::ArrowFunctionExpression { .. } => Self::ArrowFunctionExpression,
            NodeKind::TryStatement { .. } => Self::TryStatement,
            NodeKind::LabeledStatement { .. } => Self::LabeledStatement,
            NodeKind::AwaitExpression { .. } => Self::AwaitExpression,
            _ => Self::Other,
        }
    }
}

/// What a visitor wants to happen next at a given node.
pub enum Step {
    /// Continue the pre-order descent into this node's children.
    Continue,
    /// Abort the entire traversal immediately (the original's `"EXIT"`).
    Exit,
    /// Descend into children, then run this callback once all children
    /// (and their subtrees) have been visited.
    PostOrder(Box<dyn FnOnce(&mut Node)>),
}

/// Depth-first pre-order walk. `visitor` is invoked for every node reached,
/// with the node and the ancestor-kind stack (closest ancestor first).
///
/// Returns `true` if the walk completed, `false` if a visitor requested
/// [`Step::Exit`].
pub fn walk(node: &mut Node, ancestors: &mut Vec<AncestorKind>, visitor: &mut impl FnMut(&mut Node, &[AncestorKind]) -> Step) -> bool {
    match visitor(node, ancestors) {
        Step::Exit => return false,
        Step::Continue => {
            if !descend(node, ancestors, visitor) {
                return false;
            }
        }
        Step::PostOrder(callback) => {
            if !descend(node, ancestors, visitor) {
                return false;
            }
            callback(node);
        }
    }
    true
}

fn descend(node: &mut Node, ancestors: &mut Vec<AncestorKind>, visitor: &mut impl FnMut(&mut Node, &[AncestorKind]) -> Step) -> bool {
    ancestors.push(AncestorKind::of(node));
    let mut completed = true;
    for child in children_mut(node) {
        if !walk(child, ancestors, visitor) {
            completed = false;
            break;
        }
    }
    ancestors.pop();
    completed
}

/// The fixed per-kind child table: every `Node` slot reachable directly from
/// `node`, in evaluation order. Children taken here are the *pre-order entry*
/// references — per §3's invariant, a mutation performed inside a
/// [`Step::PostOrder`] callback on a *replacement* subtree is only picked up
/// if that replacement is explicitly re-walked.
pub fn children_mut(node: &mut Node) -> Vec<&mut Node> {
    match &mut node.kind {
        NodeKind::Program { body } | NodeKind::BlockStatement { body } => body.iter_mut().collect(),
        NodeKind::IfStatement { test, consequent, alternate } => {
            let mut out = vec![test.as_mut(), consequent.as_mut()];
            if let Some(alt) = alternate {
                out.push(alt.as_mut());
            }
            out
        }
        NodeKind::SwitchStatement { discriminant, cases } => {
            let mut out = vec![discriminant.as_mut()];
            for case in cases {
                if let Some(test) = &mut case.test {
                    out.push(test.as_mut());
                }
                out.extend(case.consequent.iter_mut());
            }
            out
        }
        NodeKind::WhileStatement { test, body } => vec![test.as_mut(), body.as_mut()],
        NodeKind::DoWhileStatement { body, test } => vec![body.as_mut(), test.as_mut()],
        NodeKind::ForStatement { init, test, update, body } => {
            let mut out = Vec::with_capacity(4);
            if let Some(n) = init {
                out.push(n.as_mut());
            }
            if let Some(n) = test {
                out.push(n.as_mut());
            }
            if let Some(n) = update {
                out.push(n.as_mut());
            }
            out.push(body.as_mut());
            out
        }
        NodeKind::FunctionDeclaration { id, params, body, .. } => {
            let mut out = vec![id.as_mut()];
            out.extend(params.iter_mut());
            out.push(body.as_mut());
            out
        }
        NodeKind::FunctionExpression { id, params, body, .. } => {
            let mut out = Vec::with_capacity(params.len() + 2);
            if let Some(id) = id {
                out.push(id.as_mut());
            }
            out.extend(params.iter_mut());
            out.push(body.as_mut());
            out
        }
        NodeKind::ArrowFunctionExpression { params, body, .. } => {
            let mut out: Vec<&mut Node> = params.iter_mut().collect();
            out.push(body.as_mut());
            out
        }
        NodeKind::VariableDeclaration { declarations, .. } => {
            let mut out = Vec::with_capacity(declarations.len() * 2);
            for decl in declarations {
                out.push(decl.id.as_mut());
                if let Some(init) = &mut decl.init {
                    out.push(init.as_mut());
                }
            }
            out
        }
        NodeKind::Identifier { .. } | NodeKind::Literal { .. } | NodeKind::ThisExpression | NodeKind::Super | NodeKind::EmptyStatement | NodeKind::Goto { .. } => {
            vec![]
        }
        NodeKind::BinaryExpression { left, right, .. }
        | NodeKind::LogicalExpression { left, right, .. }
        | NodeKind::AssignmentExpression { left, right, .. } => vec![left.as_mut(), right.as_mut()],
        NodeKind::UnaryExpression { argument, .. } | NodeKind::UpdateExpression { argument, .. } => vec![argument.as_mut()],
        NodeKind::MemberExpression { object, property, .. } => vec![object.as_mut(), property.as_mut()],
        NodeKind::CallExpression { callee, arguments } | NodeKind::NewExpression { callee, arguments } => {
            let mut out = vec![callee.as_mut()];
            out.extend(arguments.iter_mut());
            out
        }
        NodeKind::SequenceExpression { expressions } => expressions.iter_mut().collect(),
        NodeKind::ConditionalExpression { test, consequent, alternate } => vec![test.as_mut(), consequent.as_mut(), alternate.as_mut()],
        NodeKind::ReturnStatement { argument } => argument.as_mut().map_or_else(Vec::new, |n| vec![n.as_mut()]),
        NodeKind::ThrowStatement { argument } => vec![argument.as_mut()],
        NodeKind::LabeledStatement { body, .. } => vec![body.as_mut()],
        NodeKind::BreakStatement { .. } | NodeKind::ContinueStatement { .. } => vec![],
        NodeKind::ArrayPattern { elements } | NodeKind::ArrayExpression { elements } => elements.iter_mut().flatten().collect(),
        NodeKind::ObjectExpression { properties } | NodeKind::ObjectPattern { properties } => properties.iter_mut().collect(),
        NodeKind::Property { key, value, .. } => vec![key.as_mut(), value.as_mut()],
        NodeKind::RestElement { argument } | NodeKind::SpreadElement { argument } => vec![argument.as_mut()],
        NodeKind::AssignmentPattern { left, right } => vec![left.as_mut(), right.as_mut()],
        NodeKind::MethodDefinition { key, value, .. } => vec![key.as_mut(), value.as_mut()],
        NodeKind::MetaProperty { .. } => vec![],
        NodeKind::TryStatement { block, handler, finalizer } => {
            let mut out = vec![block.as_mut()];
            if let Some(h) = handler {
                if let Some(param) = &mut h.param {
                    out.push(param.as_mut());
                }
                out.push(h.body.as_mut());
            }
            if let Some(f) = finalizer {
                out.push(f.as_mut());
            }
            out
        }
        NodeKind::ExpressionStatement { expression } => vec![expression.as_mut()],
        NodeKind::AwaitExpression { argument } => vec![argument.as_mut()],
    }
}

/// Read-only counterpart of [`children_mut`], used by analyses (§4.G's
/// identifier classification, CFF's lexical-binding scan) that only need to
/// read the subtree.
#[must_use]
pub fn children(node: &Node) -> Vec<&Node> {
    match &node.kind {
        NodeKind::Program { body } | NodeKind::BlockStatement { body } => body.iter().collect(),
        NodeKind::IfStatement { test, consequent, alternate } => {
            let mut out = vec![test.as_ref(), consequent.as_ref()];
            if let Some(alt) = alternate {
                out.push(alt.as_ref());
            }
            out
        }
        NodeKind::SwitchStatement { discriminant, cases } => {
            let mut out = vec![discriminant.as_ref()];
            for case in cases {
                if let Some(test) = &case.test {
                    out.push(test.as_ref());
                }
                out.extend(case.consequent.iter());
            }
            out
        }
        NodeKind::WhileStatement { test, body } => vec![test.as_ref(), body.as_ref()],
        NodeKind::DoWhileStatement { body, test } => vec![body.as_ref(), test.as_ref()],
        NodeKind::ForStatement { init, test, update, body } => {
            let mut out = Vec::with_capacity(4);
            if let Some(n) = init {
                out.push(n.as_ref());
            }
            if let Some(n) = test {
                out.push(n.as_ref());
            }
            if let Some(n) = update {
                out.push(n.as_ref());
            }
            out.push(body.as_ref());
            out
        }
        NodeKind::FunctionDeclaration { id, params, body, .. } => {
            let mut out = vec![id.as_ref()];
            out.extend(params.iter());
            out.push(body.as_ref());
            out
        }
        NodeKind::FunctionExpression { id, params, body, .. } => {
            let mut out = Vec::with_capacity(params.len() + 2);
            if let Some(id) = id {
                out.push(id.as_ref());
            }
            out.extend(params.iter());
            out.push(body.as_ref());
            out
        }
        NodeKind::ArrowFunctionExpression { params, body, .. } => {
            let mut out: Vec<&Node> = params.iter().collect();
            out.push(body.as_ref());
            out
        }
        NodeKind::VariableDeclaration { declarations, .. } => {
            let mut out = Vec::with_capacity(declarations.len() * 2);
            for decl in declarations {
                out.push(decl.id.as_ref());
                if let Some(init) = &decl.init {
                    out.push(init.as_ref());
                }
            }
            out
        }
        NodeKind::Identifier { .. } | NodeKind::Literal { .. } | NodeKind::ThisExpression | NodeKind::Super | NodeKind::EmptyStatement | NodeKind::Goto { .. } => {
            vec![]
        }
        NodeKind::BinaryExpression { left, right, .. }
        | NodeKind::LogicalExpression { left, right, .. }
        | NodeKind::AssignmentExpression { left, right, .. } => vec![left.as_ref(), right.as_ref()],
        NodeKind::UnaryExpression { argument, .. } | NodeKind::UpdateExpression { argument, .. } => vec![argument.as_ref()],
        NodeKind::MemberExpression { object, property, .. } => vec![object.as_ref(), property.as_ref()],
        NodeKind::CallExpression { callee, arguments } | NodeKind::NewExpression { callee, arguments } => {
            let mut out = vec![callee.as_ref()];
            out.extend(arguments.iter());
            out
        }
        NodeKind::SequenceExpression { expressions } => expressions.iter().collect(),
        NodeKind::ConditionalExpression { test, consequent, alternate } => vec![test.as_ref(), consequent.as_ref(), alternate.as_ref()],
        NodeKind::ReturnStatement { argument } => argument.as_ref().map_or_else(Vec::new, |n| vec![n.as_ref()]),
        NodeKind::ThrowStatement { argument } => vec![argument.as_ref()],
        NodeKind::LabeledStatement { body, .. } => vec![body.as_ref()],
        NodeKind::BreakStatement { .. } | NodeKind::ContinueStatement { .. } => vec![],
        NodeKind::ArrayPattern { elements } | NodeKind::ArrayExpression { elements } => elements.iter().flatten().collect(),
        NodeKind::ObjectExpression { properties } | NodeKind::ObjectPattern { properties } => properties.iter().collect(),
        NodeKind::Property { key, value, .. } => vec![key.as_ref(), value.as_ref()],
        NodeKind::RestElement { argument } | NodeKind::SpreadElement { argument } => vec![argument.as_ref()],
        NodeKind::AssignmentPattern { left, right } => vec![left.as_ref(), right.as_ref()],
        NodeKind::MethodDefinition { key, value, .. } => vec![key.as_ref(), value.as_ref()],
        NodeKind::MetaProperty { .. } => vec![],
        NodeKind::TryStatement { block, handler, finalizer } => {
            let mut out = vec![block.as_ref()];
            if let Some(h) = handler {
                if let Some(param) = &h.param {
                    out.push(param.as_ref());
                }
                out.push(h.body.as_ref());
            }
            if let Some(f) = finalizer {
                out.push(f.as_ref());
            }
            out
        }
        NodeKind::ExpressionStatement { expression } => vec![expression.as_ref()],
        NodeKind::AwaitExpression { argument } => vec![argument.as_ref()],
    }
}

/// `isBlock(n)`.
#[must_use]
pub fn is_block(node: &Node) -> bool {
    node.is_block()
}

/// `getBlockBody(n)`.
#[must_use]
pub fn get_block_body(node: &Node) -> &[Node] {
    node.block_body()
}

/// `isVarContext(n)`.
#[must_use]
pub fn is_var_context(node: &Node) -> bool {
    node.is_var_context()
}

/// `getVarContext(n, ancestors)`: returns the index of the nearest enclosing
/// var context in `ancestors` (closest first), or `None` if `node` itself is
/// the outermost context (the `Program`).
#[must_use]
pub fn nearest_var_context(ancestors: &[AncestorKind]) -> Option<usize> {
    ancestors.iter().position(|a| {
        matches!(
            a,
            AncestorKind::Program | AncestorKind::FunctionDeclaration | AncestorKind::FunctionExpression
        )
    })
}
