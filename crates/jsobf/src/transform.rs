//! The shared pass lifecycle (§4.C): every pass provides `matches`/`transform`
//! and the base `apply` runs `before` subpasses, walks the tree invoking
//! `transform` wherever `matches` is true, then runs `after` subpasses.

use crate::ast::Node;
use crate::error::ObfResult;
use crate::traversal::AncestorKind;

/// An optional post-order callback a pass may schedule for a matched node,
/// mirroring the traversal framework's exit-callback contract (§4.B).
pub type ExitCallback<'a> = Box<dyn FnOnce(&mut Node) + 'a>;

/// One obfuscation pass, operated by the pipeline driver (§4.I).
pub trait Pass {
    /// Lower priority runs earlier. Matches §5's ordering guarantee
    /// (Flatten before RGF, CFF's subpasses around itself).
    fn priority(&self) -> i32;

    /// Decides whether `node` is a candidate, given its ancestor chain
    /// (closest first). Takes `&mut self` because eligibility for several
    /// passes includes a probability-oracle draw from the pass's own RNG.
    fn matches(&mut self, node: &Node, ancestors: &[AncestorKind]) -> bool;

    /// Names this pass minted during its run, merged into the pipeline's
    /// global generated-name set once the pass completes. Default: none.
    fn generated_names(&self) -> ahash::AHashSet<String> {
        ahash::AHashSet::new()
    }

    /// Rewrites `node` in place. Passes that need to act after descendants
    /// are visited return an exit callback instead of mutating immediately.
    fn transform<'a>(&'a mut self, node: &mut Node, ancestors: &[AncestorKind]) -> ObfResult<Option<ExitCallback<'a>>>;

    /// Runs before the main walk. Default: no-op.
    fn before(&mut self, _tree: &mut Node) -> ObfResult<()> {
        Ok(())
    }

    /// Runs after the main walk. Default: no-op.
    fn after(&mut self, _tree: &mut Node) -> ObfResult<()> {
        Ok(())
    }
}

/// Runs one pass's full lifecycle over `tree`: `before`, the matching walk,
/// `after`.
pub fn apply_pass(pass: &mut dyn Pass, tree: &mut Node) -> ObfResult<()> {
    pass.before(tree)?;
    walk_and_transform(pass, tree, &mut Vec::new())?;
    pass.after(tree)?;
    Ok(())
}

fn walk_and_transform(pass: &mut dyn Pass, node: &mut Node, ancestors: &mut Vec<AncestorKind>) -> ObfResult<()> {
    if pass.matches(node, ancestors) {
        let callback = pass.transform(node, ancestors)?;
        if let Some(callback) = callback {
            let kind = AncestorKind::of(node);
            for child in crate::traversal::children_mut(node) {
                ancestors.push(kind);
                walk_and_transform(pass, child, ancestors)?;
                ancestors.pop();
            }
            callback(node);
            return Ok(());
        }
    }
    let kind = AncestorKind::of(node);
    ancestors.push(kind);
    for child in crate::traversal::children_mut(node) {
        walk_and_transform(pass, child, ancestors)?;
    }
    ancestors.pop();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::NodeKind;

    struct RenameNumbers;

    impl Pass for RenameNumbers {
        fn priority(&self) -> i32 {
            0
        }

        fn matches(&mut self, node: &Node, _ancestors: &[AncestorKind]) -> bool {
            matches!(node.kind, NodeKind::Literal { .. })
        }

        fn transform<'a>(&'a mut self, node: &mut Node, _ancestors: &[AncestorKind]) -> ObfResult<Option<ExitCallback<'a>>> {
            if let NodeKind::Literal { value: crate::ast::LiteralValue::Number(n) } = &mut node.kind {
                *n += 100.0;
            }
            Ok(None)
        }
    }

    #[test]
    fn base_apply_visits_every_matching_node() {
        let mut tree = Node::block(vec![
            Node::expr_stmt(Node::number(1.0)),
            Node::expr_stmt(Node::number(2.0)),
        ]);
        let mut pass = RenameNumbers;
        apply_pass(&mut pass, &mut tree).unwrap();
        let body = tree.block_body();
        for stmt in body {
            if let NodeKind::ExpressionStatement { expression } = &stmt.kind
                && let NodeKind::Literal { value: crate::ast::LiteralValue::Number(n) } = &expression.kind
            {
                assert!(*n >= 100.0);
            }
        }
    }
}
