//! A minimal AST-to-source printer, used only by RGF (§4.H) to turn the
//! nested-pipeline's output into the string `new Function(...)` compiles at
//! runtime. This is not a general source generator: parsing/printing the
//! *input* program is the external collaborator's job (§2); RGF is the one
//! pass whose own output format is a source string rather than a subtree, so
//! it carries its own narrow printer rather than reaching for one.
//!
//! Output favors correctness over readability: no pretty-printing, minimal
//! parenthesization (every binary/logical/conditional/assignment operand is
//! wrapped), since the string is never read by a person.

use crate::ast::{CatchClause, LiteralValue, MethodKind, Node, NodeKind, VarKind, VariableDeclarator};

#[must_use]
pub fn emit_statements(body: &[Node]) -> String {
    let mut out = String::new();
    for stmt in body {
        emit_stmt(stmt, &mut out);
    }
    out
}

fn emit_stmt(node: &Node, out: &mut String) {
    match &node.kind {
        NodeKind::Program { body } | NodeKind::BlockStatement { body } => {
            out.push('{');
            for stmt in body {
                emit_stmt(stmt, out);
            }
            out.push('}');
        }
        NodeKind::VariableDeclaration { kind, declarations } => {
            out.push_str(var_kind_keyword(*kind));
            out.push(' ');
            for (i, decl) in declarations.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_declarator(decl, out);
            }
            out.push(';');
        }
        NodeKind::FunctionDeclaration { id, params, body, is_async, is_generator } => {
            emit_function(Some(id), params, body, *is_async, *is_generator, out);
        }
        NodeKind::ExpressionStatement { expression } => {
            emit_expr(expression, out);
            out.push(';');
        }
        NodeKind::ReturnStatement { argument } => {
            out.push_str("return");
            if let Some(arg) = argument {
                out.push(' ');
                emit_expr(arg, out);
            }
            out.push(';');
        }
        NodeKind::IfStatement { test, consequent, alternate } => {
            out.push_str("if(");
            emit_expr(test, out);
            out.push(')');
            emit_stmt(consequent, out);
            if let Some(alt) = alternate {
                out.push_str("else ");
                emit_stmt(alt, out);
            }
        }
        NodeKind::WhileStatement { test, body } => {
            out.push_str("while(");
            emit_expr(test, out);
            out.push(')');
            emit_stmt(body, out);
        }
        NodeKind::DoWhileStatement { body, test } => {
            out.push_str("do ");
            emit_stmt(body, out);
            out.push_str("while(");
            emit_expr(test, out);
            out.push_str(");");
        }
        NodeKind::ForStatement { init, test, update, body } => {
            out.push_str("for(");
            if let Some(n) = init {
                emit_for_head_fragment(n, out);
            }
            out.push(';');
            if let Some(n) = test {
                emit_expr(n, out);
            }
            out.push(';');
            if let Some(n) = update {
                emit_expr(n, out);
            }
            out.push(')');
            emit_stmt(body, out);
        }
        NodeKind::SwitchStatement { discriminant, cases } => {
            out.push_str("switch(");
            emit_expr(discriminant, out);
            out.push_str("){");
            for case in cases {
                match &case.test {
                    Some(test) => {
                        out.push_str("case ");
                        emit_expr(test, out);
                        out.push(':');
                    }
                    None => out.push_str("default:"),
                }
                for stmt in &case.consequent {
                    emit_stmt(stmt, out);
                }
            }
            out.push('}');
        }
        NodeKind::LabeledStatement { label, body } => {
            out.push_str(label);
            out.push(':');
            emit_stmt(body, out);
        }
        NodeKind::BreakStatement { label } => {
            out.push_str("break");
            if let Some(l) = label {
                out.push(' ');
                out.push_str(l);
            }
            out.push(';');
        }
        NodeKind::ContinueStatement { label } => {
            out.push_str("continue");
            if let Some(l) = label {
                out.push(' ');
                out.push_str(l);
            }
            out.push(';');
        }
        NodeKind::TryStatement { block, handler, finalizer } => {
            out.push_str("try");
            emit_stmt(block, out);
            if let Some(CatchClause { param, body }) = handler {
                out.push_str("catch");
                if let Some(p) = param {
                    out.push('(');
                    emit_expr(p, out);
                    out.push(')');
                }
                emit_stmt(body, out);
            }
            if let Some(f) = finalizer {
                out.push_str("finally");
                emit_stmt(f, out);
            }
        }
        NodeKind::ThrowStatement { argument } => {
            out.push_str("throw ");
            emit_expr(argument, out);
            out.push(';');
        }
        NodeKind::EmptyStatement => out.push(';'),
        NodeKind::Goto { label } => {
            // Never emitted in practice: CFF resolves every `Goto` to a real
            // control-flow form before a pass boundary. Kept for exhaustiveness.
            out.push_str("goto ");
            out.push_str(label);
            out.push(';');
        }
        // Anything else reaching statement position is an expression used as
        // a statement (shouldn't occur structurally, but stay total).
        _ => {
            emit_expr(node, out);
            out.push(';');
        }
    }
}

fn emit_for_head_fragment(node: &Node, out: &mut String) {
    if let NodeKind::VariableDeclaration { kind, declarations } = &node.kind {
        out.push_str(var_kind_keyword(*kind));
        out.push(' ');
        for (i, decl) in declarations.iter().enumerate() {
            if i > 0 {
                out.push(',');
            }
            emit_declarator(decl, out);
        }
    } else {
        emit_expr(node, out);
    }
}

fn emit_declarator(decl: &VariableDeclarator, out: &mut String) {
    emit_expr(&decl.id, out);
    if let Some(init) = &decl.init {
        out.push('=');
        emit_expr(init, out);
    }
}

fn var_kind_keyword(kind: VarKind) -> &'static str {
    match kind {
        VarKind::Var => "var",
        VarKind::Let => "let",
        VarKind::Const => "const",
    }
}

fn emit_function(id: Option<&Node>, params: &[Node], body: &Node, is_async: bool, is_generator: bool, out: &mut String) {
    if is_async {
        out.push_str("async ");
    }
    out.push_str("function");
    if is_generator {
        out.push('*');
    }
    if let Some(id) = id {
        out.push(' ');
        emit_expr(id, out);
    }
    out.push('(');
    emit_param_list(params, out);
    out.push(')');
    emit_stmt(body, out);
}

fn emit_param_list(params: &[Node], out: &mut String) {
    for (i, param) in params.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_expr(param, out);
    }
}

fn emit_expr(node: &Node, out: &mut String) {
    match &node.kind {
        NodeKind::Identifier { name } => out.push_str(name),
        NodeKind::Literal { value } => emit_literal(value, out),
        NodeKind::ThisExpression => out.push_str("this"),
        NodeKind::Super => out.push_str("super"),
        NodeKind::BinaryExpression { operator, left, right } | NodeKind::LogicalExpression { operator, left, right } => {
            out.push('(');
            emit_expr(left, out);
            out.push_str(operator);
            emit_expr(right, out);
            out.push(')');
        }
        NodeKind::AssignmentExpression { operator, left, right } => {
            out.push('(');
            emit_expr(left, out);
            out.push_str(operator);
            emit_expr(right, out);
            out.push(')');
        }
        NodeKind::UnaryExpression { operator, argument, prefix } => {
            out.push('(');
            if *prefix {
                out.push_str(operator);
                if operator.chars().next().is_some_and(char::is_alphabetic) {
                    out.push(' ');
                }
                emit_expr(argument, out);
            } else {
                emit_expr(argument, out);
                out.push_str(operator);
            }
            out.push(')');
        }
        NodeKind::UpdateExpression { operator, argument, prefix } => {
            out.push('(');
            if *prefix {
                out.push_str(operator);
                emit_expr(argument, out);
            } else {
                emit_expr(argument, out);
                out.push_str(operator);
            }
            out.push(')');
        }
        NodeKind::MemberExpression { object, property, computed } => {
            emit_expr(object, out);
            if *computed {
                out.push('[');
                emit_expr(property, out);
                out.push(']');
            } else {
                out.push('.');
                emit_expr(property, out);
            }
        }
        NodeKind::CallExpression { callee, arguments } => {
            emit_expr(callee, out);
            out.push('(');
            emit_arg_list(arguments, out);
            out.push(')');
        }
        NodeKind::NewExpression { callee, arguments } => {
            out.push_str("new ");
            emit_expr(callee, out);
            out.push('(');
            emit_arg_list(arguments, out);
            out.push(')');
        }
        NodeKind::SequenceExpression { expressions } => {
            out.push('(');
            for (i, expr) in expressions.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_expr(expr, out);
            }
            out.push(')');
        }
        NodeKind::ConditionalExpression { test, consequent, alternate } => {
            out.push('(');
            emit_expr(test, out);
            out.push('?');
            emit_expr(consequent, out);
            out.push(':');
            emit_expr(alternate, out);
            out.push(')');
        }
        NodeKind::FunctionExpression { id, params, body, is_async, is_generator } => {
            emit_function(id.as_deref(), params, body, *is_async, *is_generator, out);
        }
        NodeKind::ArrowFunctionExpression { params, body, is_async } => {
            if *is_async {
                out.push_str("async ");
            }
            out.push('(');
            emit_param_list(params, out);
            out.push_str(")=>");
            emit_stmt(body, out);
        }
        NodeKind::ArrayExpression { elements } | NodeKind::ArrayPattern { elements } => {
            out.push('[');
            for (i, el) in elements.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                if let Some(el) = el {
                    emit_expr(el, out);
                }
            }
            out.push(']');
        }
        NodeKind::ObjectExpression { properties } | NodeKind::ObjectPattern { properties } => {
            out.push('{');
            for (i, prop) in properties.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                emit_expr(prop, out);
            }
            out.push('}');
        }
        NodeKind::Property { key, value, computed, shorthand } => {
            if *shorthand {
                emit_expr(value, out);
            } else {
                if *computed {
                    out.push('[');
                    emit_expr(key, out);
                    out.push(']');
                } else {
                    emit_expr(key, out);
                }
                out.push(':');
                emit_expr(value, out);
            }
        }
        NodeKind::RestElement { argument } => {
            out.push_str("...");
            emit_expr(argument, out);
        }
        NodeKind::SpreadElement { argument } => {
            out.push_str("...");
            emit_expr(argument, out);
        }
        NodeKind::AssignmentPattern { left, right } => {
            emit_expr(left, out);
            out.push('=');
            emit_expr(right, out);
        }
        NodeKind::MethodDefinition { key, value, kind, is_static } => {
            if *is_static {
                out.push_str("static ");
            }
            match kind {
                MethodKind::Get => out.push_str("get "),
                MethodKind::Set => out.push_str("set "),
                MethodKind::Method | MethodKind::Constructor => {}
            }
            emit_expr(key, out);
            if let NodeKind::FunctionExpression { params, body, is_async, is_generator, .. } = &value.kind {
                if *is_async {
                    out.push_str("async ");
                }
                if *is_generator {
                    out.push('*');
                }
                out.push('(');
                emit_param_list(params, out);
                out.push(')');
                emit_stmt(body, out);
            }
        }
        NodeKind::MetaProperty { meta, property } => {
            out.push_str(meta);
            out.push('.');
            out.push_str(property);
        }
        NodeKind::AwaitExpression { argument } => {
            out.push_str("(await ");
            emit_expr(argument, out);
            out.push(')');
        }
        // Statement-only kinds reaching expression position (shouldn't occur
        // structurally); emit as a parenthesized IIFE-free block expression
        // stand-in so the printer stays total rather than panicking.
        _ => emit_stmt(node, out),
    }
}

fn emit_arg_list(args: &[Node], out: &mut String) {
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        emit_expr(arg, out);
    }
}

fn emit_literal(value: &LiteralValue, out: &mut String) {
    match value {
        LiteralValue::Number(n) => out.push_str(&format_number(*n)),
        LiteralValue::String(s) => {
            out.push('"');
            for c in s.chars() {
                match c {
                    '"' => out.push_str("\\\""),
                    '\\' => out.push_str("\\\\"),
                    '\n' => out.push_str("\\n"),
                    '\r' => out.push_str("\\r"),
                    _ => out.push(c),
                }
            }
            out.push('"');
        }
        LiteralValue::Boolean(b) => out.push_str(if *b { "true" } else { "false" }),
        LiteralValue::Null => out.push_str("null"),
        LiteralValue::RegExp { pattern, flags } => {
            out.push('/');
            out.push_str(pattern);
            out.push('/');
            out.push_str(flags);
        }
    }
}

fn format_number(n: f64) -> String {
    if n == n.trunc() && n.is_finite() && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::VarKind;

    #[test]
    fn emits_a_function_declaration_and_call() {
        let body = vec![
            Node::new(NodeKind::FunctionDeclaration {
                id: Box::new(Node::identifier("f")),
                params: vec![Node::identifier("x")],
                body: Box::new(Node::block(vec![Node::new(NodeKind::ReturnStatement {
                    argument: Some(Box::new(Node::binary("+", Node::identifier("x"), Node::number(1.0)))),
                })])),
                is_async: false,
                is_generator: false,
            }),
            Node::var_decl(VarKind::Var, "y", Some(Node::new(NodeKind::CallExpression {
                callee: Box::new(Node::identifier("f")),
                arguments: vec![Node::number(2.0)],
            }))),
        ];
        let source = emit_statements(&body);
        assert_eq!(source, "function f(x){return(x+1);}var y=f(2);");
    }

    #[test]
    fn strings_are_escaped() {
        let body = vec![Node::expr_stmt(Node::string_literal("a\"b\\c"))];
        assert_eq!(emit_statements(&body), "\"a\\\"b\\\\c\";");
    }
}
