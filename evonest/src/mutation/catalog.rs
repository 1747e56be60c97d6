//! Merged view of built-in and dynamic mutations.
//!
//! Built-ins are packaged constants; dynamic entries live in
//! `.evonest/dynamic-personas.json` / `dynamic-adversarials.json` and are
//! written only by the meta-observe apply step and the TTL pruner here.

use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineResult;
use crate::mutation::{builtin_adversarials, builtin_personas, Adversarial, Persona};
use crate::state::ProjectState;

/// The full mutation set for one run, with enablement resolved.
#[derive(Debug, Clone)]
pub struct MutationCatalog {
    personas: Vec<Persona>,
    adversarials: Vec<Adversarial>,
}

impl MutationCatalog {
    /// Load built-ins, merge project-local dynamic entries, and resolve each
    /// entry's final `enabled` from the config toggles and group filter.
    pub fn load(state: &ProjectState, config: &EngineConfig) -> EngineResult<Self> {
        let mut personas = builtin_personas();
        for dynamic in state.read_dynamic_personas()? {
            if personas.iter().any(|p| p.id == dynamic.id) {
                warn!(id = %dynamic.id, "dynamic persona shadows a built-in; ignored");
                continue;
            }
            personas.push(dynamic);
        }

        let mut adversarials = builtin_adversarials();
        for dynamic in state.read_dynamic_adversarials()? {
            if adversarials.iter().any(|a| a.id == dynamic.id) {
                warn!(id = %dynamic.id, "dynamic adversarial shadows a built-in; ignored");
                continue;
            }
            adversarials.push(dynamic);
        }

        for persona in &mut personas {
            let toggled_on = config.personas.get(&persona.id).copied().unwrap_or(true);
            let group_on =
                config.active_groups.is_empty() || config.active_groups.contains(&persona.group);
            persona.enabled = persona.enabled && toggled_on && group_on;
        }
        for adv in &mut adversarials {
            let toggled_on = config.adversarials.get(&adv.id).copied().unwrap_or(true);
            adv.enabled = adv.enabled && toggled_on;
        }

        Ok(Self {
            personas,
            adversarials,
        })
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    pub fn personas_mut(&mut self) -> &mut [Persona] {
        &mut self.personas
    }

    pub fn adversarials(&self) -> &[Adversarial] {
        &self.adversarials
    }

    pub fn adversarials_mut(&mut self) -> &mut [Adversarial] {
        &mut self.adversarials
    }

    pub fn enabled_personas(&self) -> Vec<&Persona> {
        self.personas.iter().filter(|p| p.enabled).collect()
    }

    pub fn enabled_adversarials(&self) -> Vec<&Adversarial> {
        self.adversarials.iter().filter(|a| a.enabled).collect()
    }

    pub fn persona(&self, id: &str) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    pub fn adversarial(&self, id: &str) -> Option<&Adversarial> {
        self.adversarials.iter().find(|a| a.id == id)
    }

    /// Count of dynamic (project-local) personas currently loaded.
    pub fn dynamic_persona_count(&self) -> usize {
        self.personas.iter().filter(|p| p.is_dynamic()).count()
    }

    pub fn dynamic_adversarial_count(&self) -> usize {
        self.adversarials.iter().filter(|a| a.is_dynamic()).count()
    }

    /// Drop TTL-expired dynamic entries and persist the survivors.
    ///
    /// Runs at the start of every meta-observe gate, before new dynamic
    /// mutations are applied. Returns how many entries were removed.
    pub fn expire_dynamic(
        &mut self,
        state: &ProjectState,
        current_cycle: u64,
    ) -> EngineResult<usize> {
        let before = self.personas.len() + self.adversarials.len();
        self.personas
            .retain(|p| !p.is_dynamic() || !p.is_expired(current_cycle));
        self.adversarials
            .retain(|a| !a.is_dynamic() || !a.is_expired(current_cycle));
        let removed = before - self.personas.len() - self.adversarials.len();
        if removed > 0 {
            debug!(removed, current_cycle, "expired dynamic mutations");
            self.persist_dynamic(state)?;
        }
        Ok(removed)
    }

    /// Add meta-observe-proposed personas, honoring the dynamic cap.
    /// Returns how many were actually admitted.
    pub fn add_dynamic_personas(
        &mut self,
        state: &ProjectState,
        mut incoming: Vec<Persona>,
        cap: usize,
    ) -> EngineResult<usize> {
        let mut admitted = 0;
        for persona in incoming.drain(..) {
            if self.dynamic_persona_count() >= cap {
                warn!(cap, "dynamic persona cap reached; dropping remainder");
                break;
            }
            if self.personas.iter().any(|p| p.id == persona.id) {
                debug!(id = %persona.id, "dynamic persona already exists; skipped");
                continue;
            }
            self.personas.push(persona);
            admitted += 1;
        }
        if admitted > 0 {
            self.persist_dynamic(state)?;
        }
        Ok(admitted)
    }

    /// Add meta-observe-proposed adversarials, honoring the dynamic cap.
    pub fn add_dynamic_adversarials(
        &mut self,
        state: &ProjectState,
        mut incoming: Vec<Adversarial>,
        cap: usize,
    ) -> EngineResult<usize> {
        let mut admitted = 0;
        for adv in incoming.drain(..) {
            if self.dynamic_adversarial_count() >= cap {
                warn!(cap, "dynamic adversarial cap reached; dropping remainder");
                break;
            }
            if self.adversarials.iter().any(|a| a.id == adv.id) {
                debug!(id = %adv.id, "dynamic adversarial already exists; skipped");
                continue;
            }
            self.adversarials.push(adv);
            admitted += 1;
        }
        if admitted > 0 {
            self.persist_dynamic(state)?;
        }
        Ok(admitted)
    }

    fn persist_dynamic(&self, state: &ProjectState) -> EngineResult<()> {
        let dynamic_personas: Vec<Persona> = self
            .personas
            .iter()
            .filter(|p| p.is_dynamic())
            .cloned()
            .collect();
        state.write_dynamic_personas(&dynamic_personas)?;
        let dynamic_adversarials: Vec<Adversarial> = self
            .adversarials
            .iter()
            .filter(|a| a.is_dynamic())
            .cloned()
            .collect();
        state.write_dynamic_adversarials(&dynamic_adversarials)
    }
}
