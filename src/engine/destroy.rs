//! Tearing resources down in reverse dependency order.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::error::Result;
use crate::resource::Resource;
use crate::scheduler::DependencyGraph;

use super::{Deployment, Filter};

impl Deployment {
    /// Destroys the selected resources, obsolete ones included. A resource
    /// is destroyed only after everything recorded as depending on it.
    ///
    /// # Errors
    ///
    /// Returns the failure, or an aggregate naming every failed or skipped
    /// resource. Records of resources destroyed before the failure are
    /// gone.
    pub async fn destroy_resources(&mut self, filter: &Filter, wipe: bool) -> Result<()> {
        let _lock = self.lock()?;
        let names: BTreeSet<String> = self
            .resources
            .keys()
            .filter(|name| filter.matches(name))
            .cloned()
            .collect();
        if names.is_empty() {
            info!(deployment = %self.uuid, "Nothing to destroy");
            return Ok(());
        }
        info!(deployment = %self.uuid, "Destroying {} resource(s)", names.len());
        self.destroy_selected(&names, wipe).await
    }

    /// Destroys `names` without taking the lock.
    pub(super) async fn destroy_selected(
        &mut self,
        names: &BTreeSet<String>,
        wipe: bool,
    ) -> Result<()> {
        let all: Vec<Arc<dyn Resource>> = self.resources.values().cloned().collect();
        let mut waits_for: BTreeMap<String, BTreeSet<String>> = names
            .iter()
            .map(|name| (name.clone(), BTreeSet::new()))
            .collect();
        for resource in &all {
            for later in resource.destroy_before(&all) {
                if let Some(waiting) = waits_for.get_mut(&later) {
                    waiting.insert(resource.name().to_string());
                }
            }
        }

        let mut graph = DependencyGraph::new();
        for (name, waiting) in waits_for {
            graph.add_node(name, waiting);
        }
        let selected: Vec<(String, Arc<dyn Resource>)> = all
            .iter()
            .filter(|r| names.contains(r.name()))
            .map(|r| (r.name().to_string(), Arc::clone(r)))
            .collect();

        let selected = Arc::new(selected);
        let forgotten = Arc::new(Mutex::new(BTreeSet::new()));
        let db = self.db.clone();
        let report = {
            let forgotten = Arc::clone(&forgotten);
            graph
                .run(move |name| {
                    let resource = selected
                        .iter()
                        .find(|(n, _)| *n == name)
                        .map(|(_, r)| Arc::clone(r));
                    let forgotten = Arc::clone(&forgotten);
                    let db = db.clone();
                    async move {
                        let Some(resource) = resource else {
                            return Ok(());
                        };
                        if resource.destroy(wipe).await? {
                            db.delete_resource(resource.handle().id())?;
                            forgotten.lock().insert(name);
                        } else {
                            info!(resource = %name, "Keeping the record");
                        }
                        Ok(())
                    }
                })
                .await?
        };

        let forgotten = std::mem::take(&mut *forgotten.lock());
        self.resources.retain(|name, _| !forgotten.contains(name));
        report.into_result()
    }
}
