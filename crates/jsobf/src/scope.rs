//! Identifier-usage classification and var-context helpers shared by every
//! pass. Per spec.md's Non-goals, this performs *no alias analysis* — an
//! identifier is classified purely from its syntactic position (declarator,
//! assignment target, or read), never from data-flow.

use ahash::AHashSet;

use crate::ast::{Node, NodeKind};

/// The three buckets §4.G classifies every identifier name into.
#[derive(Debug, Default, Clone)]
pub struct IdentifierUsage {
    /// Declared somewhere in the scanned subtree: a `var`/`let`/`const`
    /// declarator, a function declaration's own name, or a parameter name.
    pub defined: AHashSet<String>,
    /// Read in a value position.
    pub referenced: AHashSet<String>,
    /// The target of an assignment or update expression.
    pub modified: AHashSet<String>,
}

impl IdentifierUsage {
    /// Flatten's `input = modified ∪ referenced − defined`.
    #[must_use]
    pub fn input_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .modified
            .union(&self.referenced)
            .filter(|name| !self.defined.contains(*name))
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Flatten's `output = modified`.
    #[must_use]
    pub fn output_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modified.iter().cloned().collect();
        names.sort();
        names
    }
}

/// Deep scan of `node`'s subtree (descends into nested functions too) that
/// buckets every identifier occurrence. Used by Flatten (§4.G) and RGF's
/// free-variable analysis (§4.H), both of which need the full closure of
/// names a body touches, not just its own top-level statements.
#[must_use]
pub fn classify_identifiers(node: &Node) -> IdentifierUsage {
    let mut usage = IdentifierUsage::default();
    walk_classify(node, &mut usage, false);
    usage
}

fn walk_classify(node: &Node, usage: &mut IdentifierUsage, is_binding_target: bool) {
    match &node.kind {
        NodeKind::Identifier { name } => {
            if is_binding_target {
                usage.defined.insert(name.clone());
            } else {
                usage.referenced.insert(name.clone());
            }
        }
        NodeKind::VariableDeclaration { declarations, .. } => {
            for decl in declarations {
                walk_classify(&decl.id, usage, true);
                if let Some(init) = &decl.init {
                    walk_classify(init, usage, false);
                }
            }
        }
        NodeKind::FunctionDeclaration { id, params, body, .. } => {
            walk_classify(id, usage, true);
            for p in params {
                walk_classify(p, usage, true);
            }
            walk_classify(body, usage, false);
        }
        NodeKind::FunctionExpression { id, params, body, .. } => {
            if let Some(id) = id {
                walk_classify(id, usage, true);
            }
            for p in params {
                walk_classify(p, usage, true);
            }
            walk_classify(body, usage, false);
        }
        NodeKind::ArrowFunctionExpression { params, body, .. } => {
            for p in params {
                walk_classify(p, usage, true);
            }
            walk_classify(body, usage, false);
        }
        NodeKind::AssignmentExpression { left, right, .. } => {
            walk_classify(left, usage, false);
            mark_modified(left, usage);
            walk_classify(right, usage, false);
        }
        NodeKind::UpdateExpression { argument, .. } => {
            walk_classify(argument, usage, false);
            mark_modified(argument, usage);
        }
        NodeKind::RestElement { argument } => walk_classify(argument, usage, is_binding_target),
        NodeKind::ArrayPattern { elements } => {
            for el in elements.iter().flatten() {
                walk_classify(el, usage, is_binding_target);
            }
        }
        NodeKind::ObjectPattern { properties } => {
            for p in properties {
                walk_classify(p, usage, is_binding_target);
            }
        }
        NodeKind::AssignmentPattern { left, right } => {
            walk_classify(left, usage, is_binding_target);
            walk_classify(right, usage, false);
        }
        NodeKind::Property { key, value, computed, .. } => {
            if *computed {
                walk_classify(key, usage, false);
            }
            walk_classify(value, usage, is_binding_target);
        }
        NodeKind::MemberExpression { object, property, computed } => {
            // The member's base is a read even when the whole expression is
            // an assignment target (`obj.x = 1` reads `obj`).
            walk_classify(object, usage, false);
            if *computed {
                walk_classify(property, usage, false);
            }
        }
        _ => {
            for child in crate::traversal::children(node) {
                walk_classify(child, usage, false);
            }
        }
    }
}

fn mark_modified(target: &Node, usage: &mut IdentifierUsage) {
    if let Some(name) = target.as_identifier_name() {
        usage.modified.insert(name.to_owned());
    }
    // `obj.x += 1` / array-pattern destructuring assignment targets: the
    // base identifier is a read (handled above), not itself modified.
}

/// Whether `node`'s subtree contains a `let`/`const` declaration anywhere,
/// without descending into nested function bodies (their own lexical
/// bindings don't change CFF's hoisting semantics for the outer block).
#[must_use]
pub fn contains_lexical_bindings(node: &Node) -> bool {
    match &node.kind {
        NodeKind::VariableDeclaration { kind, .. } if kind.is_lexical() => true,
        NodeKind::FunctionDeclaration { .. } | NodeKind::FunctionExpression { .. } | NodeKind::ArrowFunctionExpression { .. } => false,
        _ => any_immediate_child(node, contains_lexical_bindings),
    }
}

/// Own-context scan used by Dispatcher (§4.F eligibility (d)) and Flatten
/// (§4.G abort conditions): does this subtree reference `this`, `super`, or
/// `arguments` *without* crossing into a nested ordinary function (arrow
/// functions are transparent to `this`/`arguments`, so they don't stop the
/// scan)?
#[derive(Debug, Default, Clone, Copy)]
pub struct OwnContextUsage {
    pub uses_this: bool,
    pub uses_super: bool,
    pub uses_arguments: bool,
    pub uses_meta_property: bool,
    pub uses_try: bool,
    pub declares_lexical: bool,
}

#[must_use]
pub fn scan_own_context(node: &Node) -> OwnContextUsage {
    let mut usage = OwnContextUsage::default();
    walk_own_context(node, &mut usage);
    usage
}

fn walk_own_context(node: &Node, usage: &mut OwnContextUsage) {
    match &node.kind {
        NodeKind::ThisExpression => usage.uses_this = true,
        NodeKind::Super => usage.uses_super = true,
        NodeKind::Identifier { name } if name == "arguments" => usage.uses_arguments = true,
        NodeKind::MetaProperty { .. } => usage.uses_meta_property = true,
        NodeKind::TryStatement { .. } => {
            usage.uses_try = true;
            any_immediate_child(node, |child| {
                walk_own_context(child, usage);
                false
            });
        }
        NodeKind::VariableDeclaration { kind, .. } if kind.is_lexical() => {
            usage.declares_lexical = true;
        }
        // Arrow functions are transparent: keep scanning into their body.
        NodeKind::FunctionDeclaration { .. } | NodeKind::FunctionExpression { .. } => {
            // Nested ordinary functions own their own `this`/`arguments`/`super`.
        }
        _ => {
            any_immediate_child(node, |child| {
                walk_own_context(child, usage);
                false
            });
        }
    }
}

/// Calls `f` on every direct `Node` child of `node` (via the traversal
/// child table) purely for reading; returns `true` if any call returned
/// `true` (short-circuit `any`).
fn any_immediate_child(node: &Node, mut f: impl FnMut(&Node) -> bool) -> bool {
    for child in crate::traversal::children(node) {
        if f(child) {
            return true;
        }
    }
    false
}

/// Returns the set of function-declaration names directly owned by `body`
/// (not nested deeper), used by Dispatcher (§4.F) and CFF's hoisting
/// analysis (§4.E) to find candidates and detect redefinitions.
#[must_use]
pub fn direct_function_declarations(body: &[Node]) -> Vec<(usize, String)> {
    body.iter()
        .enumerate()
        .filter_map(|(i, n)| match &n.kind {
            NodeKind::FunctionDeclaration { id, .. } => id.as_identifier_name().map(|name| (i, name.to_owned())),
            _ => None,
        })
        .collect()
}

/// True if `name` is reassigned or redeclared anywhere in `node`'s subtree
/// (outside of its own declaration slot), used to abort a hoist/extraction
/// when the static analysis can't prove the function binding is stable.
#[must_use]
pub fn name_is_reassigned_or_redeclared(node: &Node, name: &str) -> bool {
    match &node.kind {
        NodeKind::AssignmentExpression { left, .. } => {
            if left.as_identifier_name() == Some(name) {
                return true;
            }
            any_immediate_child(node, |c| name_is_reassigned_or_redeclared(c, name))
        }
        NodeKind::VariableDeclaration { declarations, .. } => declarations.iter().any(|d| {
            d.id.as_identifier_name() == Some(name) || d.init.as_ref().is_some_and(|i| name_is_reassigned_or_redeclared(i, name))
        }),
        NodeKind::FunctionDeclaration { id, body, .. } => {
            id.as_identifier_name() == Some(name) || name_is_reassigned_or_redeclared(body, name)
        }
        _ => any_immediate_child(node, |c| name_is_reassigned_or_redeclared(c, name)),
    }
}
