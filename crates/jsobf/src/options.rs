//! The obfuscator's recognized option surface (§6). Every field here is a
//! user-input error surface: an unrecognized `identifierGenerator` string or
//! an out-of-range probability is rejected at the point of consumption, not
//! silently coerced.

use ahash::AHashSet;
use serde::{Deserialize, Serialize};

use crate::error::{ObfResult, ObfuscateError};
use crate::identifiers::NameStyle;
use crate::probability::ProbabilitySpec;

/// Top-level obfuscator configuration, deserializable from the same JSON
/// shape a CLI config file or embedding host would hand the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    pub control_flow_flattening: ProbabilitySpec,
    pub dispatcher: ProbabilitySpec,
    pub flatten: ProbabilitySpec,
    pub rgf: RgfOption,
    pub identifier_generator: IdentifierGeneratorOption,
    /// Names treated as pre-declared globals — never renamed or hoisted over.
    pub global_variables: AHashSet<String>,
    /// `lock.countermeasures`: a function name RGF must never extract.
    pub lock_countermeasures: Option<String>,
    pub verbose: bool,
    pub debug_comments: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            control_flow_flattening: ProbabilitySpec::Boolean(false),
            dispatcher: ProbabilitySpec::Boolean(false),
            flatten: ProbabilitySpec::Boolean(false),
            rgf: RgfOption::Disabled,
            identifier_generator: IdentifierGeneratorOption::Single(NameStyle::Randomized),
            global_variables: AHashSet::new(),
            lock_countermeasures: None,
            verbose: false,
            debug_comments: false,
        }
    }
}

/// `rgf`'s distinct spec shape: `"all"` enables at every var context, `true`
/// only at `Program`, `false` disables, and a number/callable throttles via
/// the probability resolver per-context.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RgfOption {
    All,
    ProgramOnly,
    Disabled,
    Chance(f64),
}

impl RgfOption {
    #[must_use]
    pub fn from_spec(spec: &ProbabilitySpec) -> Self {
        match spec {
            ProbabilitySpec::Boolean(true) => Self::ProgramOnly,
            ProbabilitySpec::Boolean(false) => Self::Disabled,
            ProbabilitySpec::Chance(p) => Self::Chance(*p),
            ProbabilitySpec::WeightedChoice(_) => Self::Chance(0.5),
        }
    }
}

/// `identifierGenerator`: one fixed mode, or a weighted composite resolved
/// per-name through the probability resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IdentifierGeneratorOption {
    Single(NameStyle),
    Weighted(Vec<(NameStyle, f64)>),
}

impl IdentifierGeneratorOption {
    pub fn parse(raw: &str) -> ObfResult<Self> {
        let style = match raw {
            "randomized" => NameStyle::Randomized,
            "hexadecimal" => NameStyle::Hexadecimal,
            "mangled" => NameStyle::Mangled,
            "number" => NameStyle::Number,
            "zeroWidth" => NameStyle::ZeroWidth,
            other => {
                return Err(ObfuscateError::invalid_option(
                    "identifierGenerator",
                    format!("unknown mode `{other}`"),
                ));
            }
        };
        Ok(Self::Single(style))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_identifier_generator_mode_is_rejected() {
        let err = IdentifierGeneratorOption::parse("uwu").unwrap_err();
        assert!(matches!(err, ObfuscateError::InvalidOption { field: "identifierGenerator", .. }));
    }

    #[test]
    fn default_options_disable_every_pass() {
        let opts = Options::default();
        assert!(matches!(opts.rgf, RgfOption::Disabled));
        assert!(matches!(opts.control_flow_flattening, ProbabilitySpec::Boolean(false)));
    }
}
