//! Deployment generations and rollback.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::build::{BuildOutput, MachineArtifact};
use crate::error::{EngineError, Result};
use crate::state::Field;

use super::{DeployOptions, Deployment};

const GENERATIONS: Field<Vec<Generation>> = Field::with_default("generations", Vec::new);
const CURRENT_GENERATION: Field<Option<u64>> = Field::optional("current_generation");

/// One successfully activated configuration of the deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Generation {
    /// Number, increasing from 1.
    pub number: u64,
    /// Build output the machines were activated from.
    pub build_path: String,
    /// Artifact of every machine.
    pub machines: BTreeMap<String, MachineArtifact>,
    /// Resources that were active.
    pub resources: Vec<String>,
    /// When it was activated.
    pub created_at: DateTime<Utc>,
}

impl Generation {
    fn same_configuration(&self, other: &Self) -> bool {
        self.build_path == other.build_path
            && self.machines == other.machines
            && self.resources == other.resources
    }
}

impl Deployment {
    /// Every retained generation, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored history cannot be decoded.
    pub fn generations(&self) -> Result<Vec<Generation>> {
        self.attrs.get(&GENERATIONS)
    }

    /// Number of the generation the machines are running.
    ///
    /// # Errors
    ///
    /// Returns an error if the stored value cannot be decoded.
    pub fn current_generation(&self) -> Result<Option<u64>> {
        self.attrs.get(&CURRENT_GENERATION)
    }

    /// Records the configuration that was just activated. Nothing is
    /// recorded when it matches the current generation. Without rollback
    /// only the latest generation is kept.
    pub(super) fn record_generation(&self, build: &BuildOutput) -> Result<()> {
        self.db.transaction(|| {
            let mut generations = self.generations()?;
            let current = self.current_generation()?;
            let latest = generations.last().map_or(0, |g| g.number);
            let candidate = Generation {
                number: latest.max(current.unwrap_or(0)) + 1,
                build_path: build.path.to_string_lossy().to_string(),
                machines: build.machines.clone(),
                resources: self.active().map(|r| r.name().to_string()).collect(),
                created_at: Utc::now(),
            };

            let unchanged = generations
                .iter()
                .find(|g| Some(g.number) == current)
                .is_some_and(|g| g.same_configuration(&candidate));
            if unchanged {
                return Ok(());
            }

            info!(deployment = %self.uuid, "Recording generation {}", candidate.number);
            let number = candidate.number;
            if !self.rollback_enabled() {
                generations.clear();
            }
            generations.push(candidate);
            self.attrs.set(&GENERATIONS, &generations)?;
            self.attrs.set(&CURRENT_GENERATION, &Some(number))
        })
    }

    /// Switches the machines back to a recorded generation. Resources that
    /// were not part of it are marked obsolete; nothing is created.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::UnknownGeneration`] if `number` is not
    /// retained, or the copy or activation failure.
    pub async fn rollback(&mut self, number: u64, options: &DeployOptions) -> Result<()> {
        let _lock = self.lock()?;
        let generation = self
            .generations()?
            .into_iter()
            .find(|g| g.number == number)
            .ok_or(EngineError::UnknownGeneration { generation: number })?;
        info!(deployment = %self.uuid, "Rolling back to generation {number}");

        self.db.transaction(|| {
            for resource in self.resources.values() {
                let obsolete = !generation.resources.iter().any(|n| n == resource.name());
                resource.handle().set_obsolete(obsolete)?;
            }
            Ok(())
        })?;

        let mut machines = BTreeMap::new();
        for (name, artifact) in &generation.machines {
            if self.resources.contains_key(name) {
                machines.insert(name.clone(), artifact.clone());
            } else {
                warn!(resource = %name, "No longer in the deployment; skipping");
            }
        }
        let build = BuildOutput {
            path: PathBuf::from(&generation.build_path),
            machines,
        };

        let concurrency = options
            .max_concurrent_copy
            .unwrap_or(self.env.settings.max_concurrent_copy);
        let staged = self
            .copy_artifacts(&build, &options.filter, concurrency, true)
            .await?;
        self.activate(staged, options.create).await?;
        self.attrs.set(&CURRENT_GENERATION, &Some(number))?;
        info!(deployment = %self.uuid, "Now at generation {number}");
        Ok(())
    }
}
