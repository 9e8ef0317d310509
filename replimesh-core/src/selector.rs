//! Instance selection policy
//!
//! - explicit instance: used unchanged
//! - read with role: uniform random among the role's instances
//! - read without role: uniform random among all instances
//! - write without explicit instance: rejected

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::debug;

use crate::directory::InstanceDirectory;
use crate::error::{MeshError, Result};
use crate::instance::InstanceId;
use crate::operation::OperationKind;
use crate::role::Role;

#[derive(Clone)]
pub struct InstanceSelector {
    directory: Arc<InstanceDirectory>,
    rng: Arc<Mutex<StdRng>>,
}

impl InstanceSelector {
    pub fn new(directory: Arc<InstanceDirectory>) -> Self {
        Self {
            directory,
            rng: Arc::new(Mutex::new(StdRng::from_entropy())),
        }
    }

    /// Deterministic selection for tests
    pub fn with_seed(directory: Arc<InstanceDirectory>, seed: u64) -> Self {
        Self {
            directory,
            rng: Arc::new(Mutex::new(StdRng::seed_from_u64(seed))),
        }
    }

    pub fn directory(&self) -> &InstanceDirectory {
        &self.directory
    }

    pub fn select(
        &self,
        explicit: Option<&InstanceId>,
        role: Option<Role>,
        is_read: bool,
    ) -> Result<InstanceId> {
        if let Some(instance) = explicit {
            return Ok(instance.clone());
        }

        if !is_read {
            return Err(MeshError::InstanceRequiredForWrite);
        }

        let chosen = match role {
            Some(role) => {
                let candidates = self.directory.instances_for_role(role);
                self.choose(candidates)
                    .ok_or(MeshError::NoInstanceAvailable { role: Some(role) })?
            }
            None => self
                .choose(self.directory.all_instances())
                .ok_or(MeshError::NoInstanceAvailable { role: None })?,
        };

        debug!(instance = %chosen, role = ?role, "read routed to random instance");
        Ok(chosen)
    }

    pub fn select_for(
        &self,
        kind: OperationKind,
        explicit: Option<&InstanceId>,
        role: Option<Role>,
    ) -> Result<InstanceId> {
        self.select(explicit, role, kind.is_read())
    }

    fn choose(&self, candidates: &[InstanceId]) -> Option<InstanceId> {
        // A poisoned lock only means another selection panicked; the rng is still usable.
        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
        candidates.choose(&mut *rng).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn selector() -> InstanceSelector {
        let directory = InstanceDirectory::builder()
            .instance("ins1", "memory://1")
            .instance("ins2", "memory://2")
            .instance("ins3", "memory://3")
            .role(Role::Guardian, ["ins1", "ins2"])
            .build()
            .unwrap();
        InstanceSelector::with_seed(Arc::new(directory), 7)
    }

    #[test]
    fn test_explicit_instance_wins() {
        let s = selector();
        let explicit = InstanceId::new("elsewhere");
        let chosen = s.select(Some(&explicit), Some(Role::Guardian), false).unwrap();
        assert_eq!(chosen, explicit);
    }

    #[test]
    fn test_read_with_role_stays_in_role() {
        let s = selector();
        let allowed = s.directory().instances_for_role(Role::Guardian).to_vec();
        let mut seen = HashSet::new();
        for _ in 0..200 {
            let chosen = s.select(None, Some(Role::Guardian), true).unwrap();
            assert!(allowed.contains(&chosen));
            seen.insert(chosen);
        }
        assert_eq!(seen.len(), 2, "both instances should be picked eventually");
    }

    #[test]
    fn test_read_without_role_uses_all() {
        let s = selector();
        let mut seen = HashSet::new();
        for _ in 0..300 {
            seen.insert(s.select(None, None, true).unwrap());
        }
        assert_eq!(seen.len(), 3);
    }

    #[test]
    fn test_unconfigured_role_has_no_instance() {
        let s = selector();
        let err = s.select(None, Some(Role::Tutor), true).unwrap_err();
        assert!(matches!(
            err,
            MeshError::NoInstanceAvailable {
                role: Some(Role::Tutor)
            }
        ));
    }

    #[test]
    fn test_write_requires_explicit_instance() {
        let s = selector();
        for kind in OperationKind::ALL.iter().filter(|k| k.is_write()) {
            let err = s.select_for(*kind, None, Some(Role::Guardian)).unwrap_err();
            assert!(matches!(err, MeshError::InstanceRequiredForWrite), "{}", kind);
        }
    }
}
