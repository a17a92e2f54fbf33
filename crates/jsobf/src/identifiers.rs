//! The five identifier-generation modes from §4.C, plus the placeholder
//! names the transform base mints for internal bookkeeping labels.

use ahash::AHashSet;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::ast::RESERVED_KEYWORDS;

/// `identifierGenerator` option values (§6).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameStyle {
    Randomized,
    Hexadecimal,
    Mangled,
    Number,
    ZeroWidth,
}

/// Stateful generator: one per pass invocation that needs independently
/// countered names, matching §4.C's "a pass may obtain an independent
/// generator with its own counter."
#[derive(Debug, Clone)]
pub struct IdentifierGenerator {
    style: NameStyle,
    counter: u64,
    mangled_index: u64,
}

impl IdentifierGenerator {
    #[must_use]
    pub fn new(style: NameStyle) -> Self {
        Self { style, counter: 0, mangled_index: 0 }
    }

    /// Generates one name, retrying against `reserved` and `generated` until
    /// a fresh, non-reserved name is produced.
    pub fn generate(&mut self, rng: &mut impl Rng, reserved: &AHashSet<String>, generated: &mut AHashSet<String>) -> String {
        loop {
            let candidate = match self.style {
                NameStyle::Randomized => random_identifier(rng, 6, 8),
                NameStyle::Hexadecimal => hexadecimal_identifier(rng),
                NameStyle::Mangled => {
                    let name = mangled_identifier(self.mangled_index);
                    self.mangled_index += 1;
                    name
                }
                NameStyle::Number => {
                    let name = format!("var_{}", self.counter);
                    self.counter += 1;
                    name
                }
                NameStyle::ZeroWidth => zero_width_identifier(self.counter),
            };
            if is_reserved(&candidate, reserved) {
                continue;
            }
            if generated.insert(candidate.clone()) {
                return candidate;
            }
        }
    }
}

fn is_reserved(name: &str, reserved: &AHashSet<String>) -> bool {
    RESERVED_KEYWORDS.contains(&name) || reserved.contains(name)
}

const ALPHA: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";
const ALNUM: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789_";

fn random_identifier(rng: &mut impl Rng, min_len: usize, max_len: usize) -> String {
    let len = rng.gen_range(min_len..=max_len);
    let mut s = String::with_capacity(len);
    s.push(ALPHA[rng.gen_range(0..ALPHA.len())] as char);
    for _ in 1..len {
        s.push(ALNUM[rng.gen_range(0..ALNUM.len())] as char);
    }
    s
}

fn hexadecimal_identifier(rng: &mut impl Rng) -> String {
    let len = rng.gen_range(6..=8);
    let mut s = String::from("_0x");
    for _ in 0..len {
        s.push(char::from_digit(rng.gen_range(0..16), 16).unwrap().to_ascii_uppercase());
    }
    s
}

/// Excel-column-like generator: a, b, ..., z, aa, ab, ..., skipping names
/// that collide with a reserved word (the caller's `is_reserved` retry loop
/// also catches this, but the column math itself never needs to "skip" —
/// it enumerates densely and the retry loop filters).
fn mangled_identifier(index: u64) -> String {
    let mut n = index;
    let mut chars = Vec::new();
    loop {
        let rem = n % 26;
        chars.push((b'a' + u8::try_from(rem).unwrap()) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    chars.iter().rev().collect()
}

/// A keyword followed by `count + 1` zero-width non-joiner characters
/// (U+200C), per §4.C.
fn zero_width_identifier(count: u64) -> String {
    const ZWNJ: char = '\u{200C}';
    let mut s = String::from("_");
    for _ in 0..=count {
        s.push(ZWNJ);
    }
    s
}

/// Placeholder names produced by the base: `__p_` + 10 decimal digits,
/// unique within a pass invocation (§3 invariant).
#[derive(Debug, Default)]
pub struct PlaceholderGenerator {
    counter: u64,
}

impl PlaceholderGenerator {
    pub fn next(&mut self) -> String {
        self.counter += 1;
        format!("__p_{:010}", self.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    #[test]
    fn generated_names_are_unique_and_not_reserved() {
        let mut rng = ChaCha8Rng::seed_from_u64(7);
        let mut r#gen = IdentifierGenerator::new(NameStyle::Randomized);
        let reserved = crate::ast::default_reserved_identifiers();
        let mut generated = AHashSet::new();
        let mut names = Vec::new();
        for _ in 0..200 {
            names.push(r#gen.generate(&mut rng, &reserved, &mut generated));
        }
        let unique: AHashSet<_> = names.iter().cloned().collect();
        assert_eq!(unique.len(), names.len());
        for name in &names {
            assert!(!RESERVED_KEYWORDS.contains(&name.as_str()));
            assert!(!reserved.contains(name));
        }
    }

    #[test]
    fn mangled_sequence_matches_excel_columns() {
        assert_eq!(mangled_identifier(0), "a");
        assert_eq!(mangled_identifier(25), "z");
        assert_eq!(mangled_identifier(26), "aa");
        assert_eq!(mangled_identifier(27), "ab");
    }

    #[test]
    fn placeholder_names_follow_the_fixed_prefix_and_width() {
        let mut r#gen = PlaceholderGenerator::default();
        let first = r#gen.next();
        let second = r#gen.next();
        assert_eq!(first.len(), 14);
        assert!(first.starts_with("__p_"));
        assert_ne!(first, second);
    }

    #[test]
    fn number_style_is_sequential() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut r#gen = IdentifierGenerator::new(NameStyle::Number);
        let reserved = AHashSet::new();
        let mut generated = AHashSet::new();
        assert_eq!(r#gen.generate(&mut rng, &reserved, &mut generated), "var_0");
        assert_eq!(r#gen.generate(&mut rng, &reserved, &mut generated), "var_1");
    }
}
