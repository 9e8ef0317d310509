//! Instance directory
//!
//! Static lookup tables built once from configuration: role -> instances and
//! instance -> connection URL. No I/O happens here.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use crate::config::MeshConfig;
use crate::error::{MeshError, Result};
use crate::instance::InstanceId;
use crate::role::Role;

#[derive(Debug, Clone, Default)]
pub struct InstanceDirectory {
    urls: BTreeMap<InstanceId, String>,
    roles: HashMap<Role, Vec<InstanceId>>,
    all: Vec<InstanceId>,
}

impl InstanceDirectory {
    pub fn builder() -> DirectoryBuilder {
        DirectoryBuilder::default()
    }

    pub fn from_config(config: &MeshConfig) -> Result<Self> {
        let mut builder = Self::builder();
        for (id, url) in &config.instances {
            builder = builder.instance(id.as_str(), url.clone());
        }
        for (role, ids) in config.role_assignments()? {
            builder = builder.role(role, ids.iter().map(|id| id.as_str()));
        }
        builder.build()
    }

    /// Instances serving a role, in configured order.
    ///
    /// An unconfigured role yields an empty slice and a warning; callers
    /// decide whether that is fatal.
    pub fn instances_for_role(&self, role: Role) -> &[InstanceId] {
        match self.roles.get(&role) {
            Some(instances) => instances,
            None => {
                warn!(role = %role, "role not recognized by instance directory");
                &[]
            }
        }
    }

    pub fn url_for_instance(&self, instance: &InstanceId) -> Option<&str> {
        let url = self.urls.get(instance).map(String::as_str);
        if url.is_none() {
            warn!(instance = %instance, "no connection URL for instance");
        }
        url
    }

    /// Every known instance (with or without a URL), sorted
    pub fn all_instances(&self) -> &[InstanceId] {
        &self.all
    }

    /// Configured roles, in declaration order of [`Role::ALL`]
    pub fn roles(&self) -> Vec<Role> {
        Role::ALL
            .iter()
            .copied()
            .filter(|role| self.roles.contains_key(role))
            .collect()
    }

    /// Roles an instance serves
    pub fn roles_for_instance(&self, instance: &InstanceId) -> Vec<Role> {
        self.roles()
            .into_iter()
            .filter(|role| {
                self.roles
                    .get(role)
                    .map(|ids| ids.contains(instance))
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Instances holding data of any of `roles`, excluding `source`.
    /// De-duplicated, first-seen order.
    pub fn affected_instances(&self, roles: &[Role], source: &InstanceId) -> Vec<InstanceId> {
        let mut seen = BTreeSet::new();
        let mut out = Vec::new();
        for role in roles {
            for instance in self.instances_for_role(*role) {
                if instance != source && seen.insert(instance.clone()) {
                    out.push(instance.clone());
                }
            }
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.all.is_empty()
    }
}

/// Incremental construction, mostly for tests and the env loader
#[derive(Debug, Default)]
pub struct DirectoryBuilder {
    urls: BTreeMap<InstanceId, String>,
    roles: Vec<(Role, Vec<InstanceId>)>,
}

impl DirectoryBuilder {
    pub fn instance(mut self, id: impl Into<InstanceId>, url: impl Into<String>) -> Self {
        self.urls.insert(id.into(), url.into());
        self
    }

    pub fn role<I, S>(mut self, role: Role, instances: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<InstanceId>,
    {
        self.roles
            .push((role, instances.into_iter().map(Into::into).collect()));
        self
    }

    /// Every role must map to at least one instance; duplicates are dropped.
    pub fn build(self) -> Result<InstanceDirectory> {
        let mut roles: HashMap<Role, Vec<InstanceId>> = HashMap::new();
        let mut all: BTreeSet<InstanceId> = self.urls.keys().cloned().collect();

        for (role, instances) in self.roles {
            if instances.is_empty() {
                return Err(MeshError::config(format!(
                    "role {} has no instances",
                    role
                )));
            }
            let entry = roles.entry(role).or_default();
            for instance in instances {
                if !entry.contains(&instance) {
                    all.insert(instance.clone());
                    entry.push(instance);
                }
            }
        }

        Ok(InstanceDirectory {
            urls: self.urls,
            roles,
            all: all.into_iter().collect(),
        })
    }
}
