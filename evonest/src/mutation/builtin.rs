//! Packaged built-in mutation set.
//!
//! These ship with the engine, are read-only at runtime, and carry no TTL.
//! Ids are stable: config toggles (`personas.<id>`) and progress statistics
//! key on them.

use super::{Adversarial, Persona, PersonaGroup};

fn persona(id: &str, name: &str, group: PersonaGroup, perspective: &str) -> Persona {
    Persona {
        id: id.to_string(),
        name: name.to_string(),
        group,
        perspective: perspective.to_string(),
        enabled: true,
        weight: 1.0,
        created_cycle: None,
        ttl_cycles: None,
    }
}

fn adversarial(id: &str, name: &str, challenge: &str) -> Adversarial {
    Adversarial {
        id: id.to_string(),
        name: name.to_string(),
        challenge: challenge.to_string(),
        enabled: true,
        weight: 1.0,
        created_cycle: None,
        ttl_cycles: None,
    }
}

/// The built-in persona roster.
pub fn builtin_personas() -> Vec<Persona> {
    vec![
        persona(
            "architect",
            "Architect",
            PersonaGroup::Tech,
            "You think in module boundaries, dependency direction, and coupling. \
             Look for structural debt: cyclic imports, god modules, leaky layers, \
             and interfaces that force callers to know internals.",
        ),
        persona(
            "performance-engineer",
            "Performance Engineer",
            PersonaGroup::Tech,
            "You care about allocations, algorithmic complexity, and I/O patterns. \
             Look for accidental quadratic loops, repeated parsing, unbounded \
             buffers, and hot paths that could be measured before being touched.",
        ),
        persona(
            "reliability-engineer",
            "Reliability Engineer",
            PersonaGroup::Tech,
            "You assume the process will crash mid-write and the network will \
             fail. Look for unhandled errors, partial writes, missing retries, \
             and state that cannot be recovered after an interruption.",
        ),
        persona(
            "test-engineer",
            "Test Engineer",
            PersonaGroup::Quality,
            "You read the code through its test suite. Look for untested \
             branches, edge cases with no coverage, flaky patterns, and tests \
             that assert implementation details instead of behavior.",
        ),
        persona(
            "refactoring-surgeon",
            "Refactoring Surgeon",
            PersonaGroup::Quality,
            "You make small, behavior-preserving cuts. Look for duplicated \
             logic, overlong functions, dead code, and names that lie about \
             what the code does.",
        ),
        persona(
            "security-auditor",
            "Security Auditor",
            PersonaGroup::Quality,
            "You read every input as hostile. Look for path traversal, shell \
             injection, unvalidated deserialization, and secrets that leak into \
             logs or version control.",
        ),
        persona(
            "product-strategist",
            "Product Strategist",
            PersonaGroup::Biz,
            "You ask what the project is for and whether the code serves it. \
             Look for features nobody asked for, missing capabilities the \
             mission implies, and mismatches between README promises and \
             reality.",
        ),
        persona(
            "user-champion",
            "User Champion",
            PersonaGroup::Biz,
            "You experience the project as a first-time user. Look for \
             confusing errors, missing documentation, rough installation, and \
             defaults that surprise people.",
        ),
        persona(
            "ecosystem-watcher",
            "Ecosystem Watcher",
            PersonaGroup::Biz,
            "You track the surrounding ecosystem. Look for deprecated \
             dependencies, newer idioms the community has settled on, and \
             integration points the project is missing.",
        ),
    ]
}

/// The built-in adversarial roster.
pub fn builtin_adversarials() -> Vec<Adversarial> {
    vec![
        adversarial(
            "chaos-monkey",
            "Chaos Monkey",
            "Assume every external call fails, every file is half-written, and \
             every process dies at the worst moment. Which improvement survives \
             that world?",
        ),
        adversarial(
            "skeptical-reviewer",
            "Skeptical Reviewer",
            "Challenge each proposed improvement: what concrete evidence shows \
             it matters? Reject anything justified only by taste.",
        ),
        adversarial(
            "maintainer-of-2030",
            "Maintainer of 2030",
            "Read the code as the person stuck maintaining it years from now. \
             Which change rots fastest, and what would make it rot slower?",
        ),
        adversarial(
            "minimalist",
            "Minimalist",
            "Before adding anything, ask what could be deleted instead. Prefer \
             improvements that shrink the codebase.",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn ids_are_unique_and_kebab_case() {
        let personas = builtin_personas();
        let mut seen = HashSet::new();
        for p in &personas {
            assert!(seen.insert(p.id.clone()), "duplicate persona id {}", p.id);
            assert!(p
                .id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        }
        let adversarials = builtin_adversarials();
        let mut seen = HashSet::new();
        for a in &adversarials {
            assert!(seen.insert(a.id.clone()), "duplicate adversarial id {}", a.id);
        }
    }

    #[test]
    fn every_group_is_represented() {
        let personas = builtin_personas();
        for group in [PersonaGroup::Tech, PersonaGroup::Biz, PersonaGroup::Quality] {
            assert!(personas.iter().any(|p| p.group == group));
        }
    }
}
