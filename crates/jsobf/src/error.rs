//! Error types for the obfuscation pipeline, per §7's three-kind taxonomy:
//! user-input errors, internal invariant violations, and recoverable skips.
//! Skips are not represented here at all — a pass that decides a subtree is
//! ineligible returns the subtree unchanged, never an `Err`.

use std::fmt;

use strum::{Display, EnumString};

/// Result alias used throughout the pipeline and its passes.
pub type ObfResult<T> = Result<T, ObfuscateError>;

/// The class of a failing pass, attached to internal errors so the pipeline
/// driver can annotate re-raised failures without guessing which pass threw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum PassName {
    Dispatcher,
    Flatten,
    ControlFlowFlattening,
    Rgf,
    Pipeline,
}

/// Top-level obfuscation error.
#[derive(Debug, Clone)]
pub enum ObfuscateError {
    /// An option value was missing, malformed, or out of its documented
    /// domain (§7.1). `field` names the offending key, matching the option
    /// surface's dotted naming (e.g. `"lock.countermeasures"`).
    InvalidOption { field: &'static str, message: String },
    /// An internal invariant the pipeline relies on did not hold (§7.2) —
    /// always a bug in the pass, never user input. `pass` records which
    /// pass's class detected it.
    Invariant { pass: PassName, message: String },
}

impl ObfuscateError {
    #[must_use]
    pub fn invalid_option(field: &'static str, message: impl fmt::Display) -> Self {
        Self::InvalidOption { field, message: message.to_string() }
    }

    #[must_use]
    pub fn invariant(pass: PassName, message: impl fmt::Display) -> Self {
        Self::Invariant { pass, message: message.to_string() }
    }
}

impl fmt::Display for ObfuscateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidOption { field, message } => write!(f, "invalid option `{field}`: {message}"),
            Self::Invariant { pass, message } => write!(f, "[{pass}] internal invariant violated: {message}"),
        }
    }
}

impl std::error::Error for ObfuscateError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_option_names_the_offending_field() {
        let err = ObfuscateError::invalid_option("identifierGenerator", "unknown mode `foo`");
        assert_eq!(err.to_string(), "invalid option `identifierGenerator`: unknown mode `foo`");
    }

    #[test]
    fn invariant_error_is_tagged_with_pass_name() {
        let err = ObfuscateError::invariant(PassName::Dispatcher, "missing labelToStates entry");
        assert!(err.to_string().starts_with("[Dispatcher]"));
    }
}
