//! Dependency resolution and execution.
//!
//! The orchestrator owns the registry, the dependency graph, the variable
//! store and every script's state. One call to [`Orchestrator::resolve_and_run`]
//! walks the target's missing inputs depth-first, runs their producers, then
//! runs the target. Scripts run one at a time.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use varflow_core::error::{Result, VarflowError};
use varflow_core::event::EventBus;
use varflow_core::traits::{ScriptExecutor, ScriptSource};
use varflow_core::types::{EngineEvent, Registry, ScriptDescriptor, ScriptState};
use varflow_store::VariableStore;

use crate::graph::DependencyGraph;
use crate::scanner::build_registry;

pub struct Orchestrator {
    executor: Arc<dyn ScriptExecutor>,
    store: VariableStore,
    event_bus: Arc<EventBus>,
    registry: Registry,
    graph: DependencyGraph,
    states: BTreeMap<String, ScriptState>,
    source: Option<Arc<dyn ScriptSource>>,
}

impl Orchestrator {
    pub fn new(
        executor: Arc<dyn ScriptExecutor>,
        store: VariableStore,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            executor,
            store,
            event_bus,
            registry: Registry::new(),
            graph: DependencyGraph::default(),
            states: BTreeMap::new(),
            source: None,
        }
    }

    /// Re-read scripts from `source` before every resolution, so edits made
    /// while the process runs are picked up.
    pub fn with_source(mut self, source: Arc<dyn ScriptSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn graph(&self) -> &DependencyGraph {
        &self.graph
    }

    pub fn store(&self) -> &VariableStore {
        &self.store
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    /// Current state of `path`. Unknown scripts read as idle.
    pub fn state(&self, path: &str) -> ScriptState {
        self.states.get(path).copied().unwrap_or_default()
    }

    pub fn states(&self) -> &BTreeMap<String, ScriptState> {
        &self.states
    }

    /// Rebuild the registry from `source`, returning the scripts that could
    /// not be read.
    pub fn rescan(&mut self, source: &dyn ScriptSource) -> Vec<VarflowError> {
        let report = build_registry(source);
        self.set_registry(report.registry);
        report.failures
    }

    /// Re-read the attached source and rebuild the registry if any script
    /// changed. Returns the scripts that could not be read.
    pub fn refresh(&mut self) -> Vec<VarflowError> {
        let Some(source) = self.source.clone() else {
            return Vec::new();
        };
        let report = build_registry(source.as_ref());
        if report.registry != self.registry {
            info!("Script sources changed");
            self.set_registry(report.registry);
        }
        report.failures
    }

    /// Replace the registry wholesale and rebuild the graph.
    ///
    /// Scripts whose descriptor is unchanged keep their state; new or edited
    /// scripts start idle.
    pub fn set_registry(&mut self, registry: Registry) {
        let graph = DependencyGraph::build(&registry);
        for (variable, producers) in graph.ambiguous_variables() {
            warn!(
                variable = %variable,
                producers = ?producers,
                "Variable has several producers; the first to succeed wins"
            );
        }

        let previous = std::mem::take(&mut self.states);
        self.states = registry
            .iter()
            .map(|(path, descriptor)| {
                let state = match self.registry.get(path) {
                    Some(old) if old == descriptor => {
                        previous.get(path).copied().unwrap_or_default()
                    }
                    _ => ScriptState::Idle,
                };
                (path.clone(), state)
            })
            .collect();

        info!(
            scripts = registry.len(),
            edges = graph.edge_count(),
            "Registry rebuilt"
        );
        self.event_bus.publish(EngineEvent::RegistryRebuilt {
            scripts: registry.len(),
            edges: graph.edge_count(),
        });
        self.registry = registry;
        self.graph = graph;
    }

    /// Map a path or bare file name to a registry key.
    pub fn find_script(&self, key: &str) -> Result<String> {
        if self.registry.contains_key(key) {
            return Ok(key.to_string());
        }
        if let Ok(canonical) = std::fs::canonicalize(key) {
            let canonical = canonical.display().to_string();
            if self.registry.contains_key(&canonical) {
                return Ok(canonical);
            }
        }
        let file_name = Path::new(key)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| key.to_string());
        let matches: Vec<&ScriptDescriptor> = self
            .registry
            .values()
            .filter(|d| d.name == file_name)
            .collect();
        match matches.as_slice() {
            [only] => Ok(only.path.clone()),
            [] => Err(VarflowError::UnknownScript(key.to_string())),
            many => Err(VarflowError::UnknownScript(format!(
                "{} is ambiguous ({} scripts share that name)",
                key,
                many.len()
            ))),
        }
    }

    /// Return every script to idle and clear the store.
    pub fn reset(&mut self) {
        for state in self.states.values_mut() {
            *state = ScriptState::Idle;
        }
        self.store.reset();
        self.persist_store();
        info!("Orchestrator state reset");
        self.event_bus.publish(EngineEvent::StateReset);
    }

    /// Resolve `target`'s inputs and run it.
    ///
    /// Returns the target's final state. Already finished targets are a
    /// no-op unless `force` is set; a forced target also runs when some of
    /// its inputs cannot be produced.
    pub async fn resolve_and_run(
        &mut self,
        target: &str,
        stop_at_first_produce: bool,
        force: bool,
    ) -> Result<ScriptState> {
        self.refresh();
        let path = self.find_script(target)?;
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        info!(
            run_id = %run_id,
            target = %path,
            partial = stop_at_first_produce,
            force,
            "Resolving script"
        );

        let result = self
            .resolve(path.clone(), stop_at_first_produce, force, Vec::new())
            .await;

        let elapsed_ms = start.elapsed().as_millis() as u64;
        match result {
            Ok(state) => {
                info!(run_id = %run_id, target = %path, state = %state, elapsed_ms, "Resolution finished");
            }
            Err(ref e) => {
                warn!(run_id = %run_id, target = %path, kind = e.kind(), error = %e, elapsed_ms, "Resolution failed");
            }
        }
        result
    }

    fn resolve<'a>(
        &'a mut self,
        path: String,
        stop_at_first_produce: bool,
        force: bool,
        mut chain: Vec<String>,
    ) -> BoxFuture<'a, Result<ScriptState>> {
        Box::pin(async move {
            let current = self.state(&path);
            if current.is_done() && !force {
                debug!(script = %path, state = %current, "Already done, skipping");
                return Ok(current);
            }

            let descriptor = self
                .registry
                .get(&path)
                .cloned()
                .ok_or_else(|| VarflowError::UnknownScript(path.clone()))?;
            chain.push(path.clone());

            for variable in self.store.missing(&descriptor.requires) {
                // An earlier producer may have bound it as a side product.
                if self.store.contains(&variable) {
                    continue;
                }
                for producer in self.graph.producers_for(&path, &variable) {
                    if self.state(&producer) != ScriptState::Idle {
                        continue;
                    }
                    if chain.contains(&producer) {
                        let mut cycle = chain.clone();
                        cycle.push(producer);
                        let err = VarflowError::Cycle {
                            target: path.clone(),
                            path: cycle,
                        };
                        self.set_state(&path, ScriptState::Error, Some(err.to_string()));
                        return Err(err);
                    }

                    match self.resolve(producer.clone(), false, false, chain.clone()).await {
                        Ok(_) if self.store.contains(&variable) => break,
                        Ok(state) => {
                            debug!(
                                producer = %producer,
                                variable = %variable,
                                state = %state,
                                "Producer did not bind variable"
                            );
                        }
                        Err(e @ VarflowError::Cycle { .. }) => {
                            self.set_state(&path, ScriptState::Error, Some(e.to_string()));
                            return Err(e);
                        }
                        Err(e) => {
                            warn!(
                                consumer = %path,
                                producer = %producer,
                                variable = %variable,
                                error = %e,
                                "Producer failed"
                            );
                        }
                    }
                }
            }

            let unsatisfied = self.store.missing(&descriptor.requires);
            if !unsatisfied.is_empty() {
                if !force {
                    let err = VarflowError::DependencyUnsatisfied {
                        target: path.clone(),
                        variables: unsatisfied,
                    };
                    self.set_state(&path, ScriptState::Error, Some(err.to_string()));
                    return Err(err);
                }
                warn!(
                    script = %path,
                    missing = ?unsatisfied,
                    "Forced run with unsatisfied inputs"
                );
            }

            self.execute(&descriptor, stop_at_first_produce).await
        })
    }

    async fn execute(
        &mut self,
        descriptor: &ScriptDescriptor,
        stop_at_first_produce: bool,
    ) -> Result<ScriptState> {
        let path = descriptor.path.clone();
        self.set_state(&path, ScriptState::Running, None);

        let inputs = self.store.subset(&descriptor.requires);
        let executor = Arc::clone(&self.executor);
        let output = match executor
            .execute(descriptor, inputs, stop_at_first_produce)
            .await
        {
            Ok(output) => output,
            Err(e) => {
                error!(script = %path, error = %e, "Script failed");
                self.set_state(&path, ScriptState::Error, Some(e.to_string()));
                return Err(e);
            }
        };

        let unbound: Vec<&String> = descriptor
            .produces
            .iter()
            .filter(|n| !output.values.contains_key(*n))
            .collect();
        if !unbound.is_empty() && !output.is_partial() {
            warn!(script = %path, unbound = ?unbound, "Declared variables were not produced");
        }

        self.event_bus.publish(EngineEvent::ScriptOutput {
            path: path.clone(),
            stdout: output.stdout.clone(),
            stderr: output.stderr.clone(),
        });

        let names: Vec<String> = output.values.keys().cloned().collect();
        if !names.is_empty() {
            self.store.set_many(&path, output.values);
            self.persist_store();
            self.event_bus.publish(EngineEvent::VariablesUpdated {
                producer: path.clone(),
                names,
            });
        }

        let state = if stop_at_first_produce && output.partial_stop.is_some() {
            ScriptState::PartialFinished
        } else {
            ScriptState::Finished
        };
        self.set_state(&path, state, None);
        Ok(state)
    }

    fn persist_store(&self) {
        if let Err(e) = self.store.persist() {
            warn!(error = %e, "Failed to persist variable snapshot");
            self.event_bus.publish(EngineEvent::PersistenceFailed {
                message: e.to_string(),
            });
        }
    }

    fn set_state(&mut self, path: &str, state: ScriptState, message: Option<String>) {
        debug!(script = %path, state = %state, "Script state changed");
        self.states.insert(path.to_string(), state);
        self.event_bus.publish(EngineEvent::ScriptStateChanged {
            path: path.to_string(),
            state,
            message,
        });
    }
}
