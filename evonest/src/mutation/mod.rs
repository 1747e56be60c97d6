//! Mutations: personas and adversarial challenges.
//!
//! A mutation is data, not behavior — a record with a prompt body that biases
//! the LM's viewpoint for one cycle. Built-in mutations ship with the engine
//! and are immutable; dynamic ones are proposed by the meta-observe gate,
//! live inside `.evonest/`, and expire after a TTL.

mod builtin;
mod catalog;

pub use builtin::{builtin_adversarials, builtin_personas};
pub use catalog::MutationCatalog;

use serde::{Deserialize, Serialize};

/// Lower clamp for every mutation weight.
pub const WEIGHT_MIN: f64 = 0.2;
/// Upper clamp for every mutation weight.
pub const WEIGHT_MAX: f64 = 3.0;

/// Clamp a recomputed weight into the legal band.
pub fn clamp_weight(weight: f64) -> f64 {
    weight.clamp(WEIGHT_MIN, WEIGHT_MAX)
}

/// Persona grouping used by the `active_groups` config filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PersonaGroup {
    Tech,
    Biz,
    Quality,
}

impl std::fmt::Display for PersonaGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tech => write!(f, "tech"),
            Self::Biz => write!(f, "biz"),
            Self::Quality => write!(f, "quality"),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_weight() -> f64 {
    1.0
}

/// A perspective the LM adopts for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Kebab-case id, unique among personas.
    pub id: String,
    pub name: String,
    pub group: PersonaGroup,
    /// Free-text prompt fragment describing the viewpoint.
    pub perspective: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Set only on dynamic entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_cycle: Option<u64>,
    /// Set only on dynamic entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_cycles: Option<u64>,
}

impl Persona {
    pub fn is_dynamic(&self) -> bool {
        self.created_cycle.is_some()
    }

    /// Whether a dynamic entry has outlived its TTL at `current_cycle`.
    pub fn is_expired(&self, current_cycle: u64) -> bool {
        match (self.created_cycle, self.ttl_cycles) {
            (Some(created), Some(ttl)) => current_cycle.saturating_sub(created) > ttl,
            _ => false,
        }
    }
}

/// A destructive challenge optionally paired with a persona.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adversarial {
    /// Kebab-case id, unique among adversarials.
    pub id: String,
    pub name: String,
    /// Free-text prompt fragment describing the challenge.
    pub challenge: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_cycle: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_cycles: Option<u64>,
}

impl Adversarial {
    pub fn is_dynamic(&self) -> bool {
        self.created_cycle.is_some()
    }

    pub fn is_expired(&self, current_cycle: u64) -> bool {
        match (self.created_cycle, self.ttl_cycles) {
            (Some(created), Some(ttl)) => current_cycle.saturating_sub(created) > ttl,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weight_clamps_to_band() {
        assert_eq!(clamp_weight(0.0), WEIGHT_MIN);
        assert_eq!(clamp_weight(10.0), WEIGHT_MAX);
        assert_eq!(clamp_weight(1.5), 1.5);
    }

    #[test]
    fn ttl_expiry_is_strictly_greater() {
        let persona = Persona {
            id: "p".into(),
            name: "P".into(),
            group: PersonaGroup::Tech,
            perspective: String::new(),
            enabled: true,
            weight: 1.0,
            created_cycle: Some(10),
            ttl_cycles: Some(5),
        };
        assert!(!persona.is_expired(15)); // age == ttl → still alive
        assert!(persona.is_expired(16));
    }

    #[test]
    fn builtin_entries_never_expire() {
        for persona in builtin_personas() {
            assert!(!persona.is_dynamic());
            assert!(!persona.is_expired(u64::MAX));
        }
    }
}
