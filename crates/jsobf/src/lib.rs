#![doc = include_str!("../../../README.md")]

mod ast;
mod codegen;
mod diagnostics;
mod error;
mod identifiers;
mod options;
mod passes;
mod pipeline;
mod probability;
mod scope;
mod transform;
mod traversal;

pub use crate::ast::{
    Annotations, CatchClause, LiteralValue, MethodKind, Node, NodeKind, PendingAction, SwitchCase, VarKind,
    VariableDeclarator, default_reserved_identifiers,
};
pub use crate::diagnostics::{NoopTracer, ObfuscationTracer, RecordingTracer, StderrTracer, TraceEvent};
pub use crate::error::{ObfResult, ObfuscateError, PassName};
pub use crate::identifiers::{IdentifierGenerator, NameStyle, PlaceholderGenerator};
pub use crate::options::{IdentifierGeneratorOption, Options, RgfOption};
pub use crate::pipeline::Obfuscator;
pub use crate::probability::ProbabilitySpec;
pub use crate::transform::{ExitCallback, Pass, apply_pass};
pub use crate::traversal::{AncestorKind, Step, walk};
