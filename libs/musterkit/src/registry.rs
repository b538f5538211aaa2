//! Module dependency graph.
//!
//! Modules are registered by name with an optional factory; factory-less
//! modules are groups that only name a set of dependencies. Resolving a set of
//! targets yields the concrete modules to run, dependencies first.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::{Arc, OnceLock};

use thiserror::Error;

use crate::client_hub::ClientHub;
use crate::context::ModuleCtx;
use crate::module_service::{DependencyLookup, ModuleService};
use crate::service::{Service, WeakService};

/// Builds the service of one module.
pub type ModuleFactory = Arc<dyn Fn(&ModuleCtx) -> anyhow::Result<Service> + Send + Sync>;

/// Whether a module is listed to users. Never affects resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Visibility {
    UserVisible,
    UserInvisible,
}

struct ModuleEntry {
    factory: Option<ModuleFactory>,
    visibility: Visibility,
    deps: BTreeSet<String>,
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("has_factory", &self.factory.is_some())
            .field("visibility", &self.visibility)
            .field("deps", &self.deps)
            .finish()
    }
}

#[derive(Default, Debug)]
pub struct ModuleRegistry {
    modules: BTreeMap<String, ModuleEntry>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_module<F>(
        &mut self,
        name: impl Into<String>,
        factory: F,
        visibility: Visibility,
    ) -> Result<(), RegistryError>
    where
        F: Fn(&ModuleCtx) -> anyhow::Result<Service> + Send + Sync + 'static,
    {
        self.insert(name.into(), Some(Arc::new(factory)), visibility)
    }

    /// Register a factory-less module that only names its dependencies.
    pub fn register_group(&mut self, name: impl Into<String>) -> Result<(), RegistryError> {
        self.insert(name.into(), None, Visibility::UserVisible)
    }

    fn insert(
        &mut self,
        name: String,
        factory: Option<ModuleFactory>,
        visibility: Visibility,
    ) -> Result<(), RegistryError> {
        if self.modules.contains_key(&name) {
            return Err(RegistryError::DuplicateModule(name));
        }
        self.modules.insert(
            name,
            ModuleEntry {
                factory,
                visibility,
                deps: BTreeSet::new(),
            },
        );
        Ok(())
    }

    /// Make `name` depend on every module in `deps`.
    ///
    /// Fails without touching the graph if any name is unknown or an edge
    /// would close a cycle.
    pub fn add_dependency(&mut self, name: &str, deps: &[&str]) -> Result<(), RegistryError> {
        if !self.modules.contains_key(name) {
            return Err(RegistryError::UnknownModule(name.to_string()));
        }
        for &dep in deps {
            if !self.modules.contains_key(dep) {
                return Err(RegistryError::UnknownDependency {
                    module: name.to_string(),
                    depends_on: dep.to_string(),
                });
            }
        }

        // Check the graph as it would look with the new edges.
        let names: Vec<&str> = self.modules.keys().map(String::as_str).collect();
        let idx: BTreeMap<&str, usize> = names.iter().enumerate().map(|(i, &n)| (n, i)).collect();
        let mut adj = vec![Vec::<usize>::new(); names.len()];
        for (module, entry) in &self.modules {
            let u = idx[module.as_str()];
            adj[u].extend(entry.deps.iter().map(|d| idx[d.as_str()]));
        }
        let u = idx[name];
        adj[u].extend(deps.iter().map(|d| idx[d]));

        if let Some(path) = detect_cycle_with_path(&names, &adj) {
            return Err(RegistryError::CycleDetected { path });
        }

        if let Some(entry) = self.modules.get_mut(name) {
            entry.deps.extend(deps.iter().map(|d| d.to_string()));
        }
        Ok(())
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    /// Sorted names of the modules registered as user visible.
    pub fn user_visible_module_names(&self) -> Vec<String> {
        self.modules
            .iter()
            .filter(|(_, e)| e.visibility == Visibility::UserVisible)
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Concrete modules required by `targets`, dependencies first and ties
    /// broken by name.
    pub fn resolve<S: AsRef<str>>(&self, targets: &[S]) -> Result<Vec<String>, RegistryError> {
        let targets: Vec<&str> = targets.iter().map(|t| t.as_ref()).collect();
        let mut closure = BTreeSet::new();
        for &target in &targets {
            if !self.modules.contains_key(target) {
                return Err(RegistryError::UnknownModule(target.to_string()));
            }
            self.collect_deps(target, &mut closure);
            closure.insert(target.to_string());
        }

        // Kahn's algorithm over the closure, groups included so that modules
        // reached through a group are still ordered after it.
        let mut indeg: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for name in &closure {
            let deps = &self.modules[name].deps;
            indeg.insert(name.as_str(), deps.len());
            for dep in deps {
                dependents.entry(dep.as_str()).or_default().push(name.as_str());
            }
        }

        let mut ready: BTreeSet<&str> = indeg
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&n, _)| n)
            .collect();
        let mut order = Vec::with_capacity(closure.len());
        while let Some(n) = ready.pop_first() {
            order.push(n);
            for &w in dependents.get(n).into_iter().flatten() {
                if let Some(d) = indeg.get_mut(w) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(w);
                    }
                }
            }
        }

        let resolved: Vec<String> = order
            .into_iter()
            .filter(|n| self.modules[*n].factory.is_some())
            .map(str::to_string)
            .collect();

        tracing::debug!(?targets, modules = ?resolved, "module dependency order resolved");
        Ok(resolved)
    }

    fn collect_deps(&self, name: &str, out: &mut BTreeSet<String>) {
        let Some(entry) = self.modules.get(name) else {
            return;
        };
        for dep in &entry.deps {
            if out.insert(dep.clone()) {
                self.collect_deps(dep, out);
            }
        }
    }

    /// Every module `name` transitively depends on, groups included.
    pub fn dependencies_of(&self, name: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_deps(name, &mut out);
        out
    }

    /// Modules of `within` that transitively depend on `name`.
    ///
    /// Derived by walking the edges backwards; no back-links are stored.
    pub fn dependents_of(&self, name: &str, within: &BTreeSet<String>) -> BTreeSet<String> {
        let mut reverse: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
        for (module, entry) in &self.modules {
            for dep in &entry.deps {
                reverse.entry(dep.as_str()).or_default().push(module.as_str());
            }
        }

        let mut seen = BTreeSet::new();
        let mut queue = VecDeque::from([name]);
        while let Some(n) = queue.pop_front() {
            for &m in reverse.get(n).into_iter().flatten() {
                if seen.insert(m) {
                    queue.push_back(m);
                }
            }
        }

        seen.into_iter()
            .filter(|m| within.contains(*m))
            .map(str::to_string)
            .collect()
    }

    /// Instantiate every module required by `targets`.
    ///
    /// Factories run in dependency order and each result is wrapped in a
    /// [`ModuleService`] that waits on the other modules of this run.
    pub fn init_module_services<S: AsRef<str>>(
        &self,
        targets: &[S],
        hub: Arc<ClientHub>,
    ) -> Result<BTreeMap<String, Service>, RegistryError> {
        let order = self.resolve(targets)?;
        let run: BTreeSet<String> = order.iter().cloned().collect();

        // Filled once every module exists; wrappers only hold weak handles.
        let directory: Arc<OnceLock<BTreeMap<String, WeakService>>> = Arc::default();
        let mut services = BTreeMap::new();

        for name in &order {
            let Some(factory) = self.modules.get(name).and_then(|e| e.factory.clone()) else {
                continue;
            };

            let ctx = ModuleCtx::new(name.clone(), Arc::clone(&hub));
            let inner = factory(&ctx).map_err(|source| RegistryError::Init {
                module: name.clone(),
                source,
            })?;

            let start_deps: Vec<String> = self
                .dependencies_of(name)
                .into_iter()
                .filter(|d| run.contains(d))
                .collect();
            let stop_deps: Vec<String> = self.dependents_of(name, &run).into_iter().collect();
            tracing::debug!(module = %name, ?start_deps, ?stop_deps, "module initialised");

            let svc = ModuleService::wrap(
                name.clone(),
                inner,
                lookup(&directory, start_deps),
                lookup(&directory, stop_deps),
            );
            services.insert(name.clone(), svc);
        }

        directory.get_or_init(|| {
            services
                .iter()
                .map(|(n, s)| (n.clone(), s.downgrade()))
                .collect()
        });
        Ok(services)
    }
}

fn lookup(
    directory: &Arc<OnceLock<BTreeMap<String, WeakService>>>,
    names: Vec<String>,
) -> DependencyLookup {
    let directory = Arc::clone(directory);
    Arc::new(move |_module: &str| {
        let Some(services) = directory.get() else {
            return BTreeMap::new();
        };
        names
            .iter()
            .filter_map(|n| {
                services
                    .get(n)
                    .and_then(WeakService::upgrade)
                    .map(|s| (n.clone(), s))
            })
            .collect()
    })
}

/// DFS over `module -> dependency` edges. Returns the cycle path, closed by
/// repeating its first node.
fn detect_cycle_with_path(names: &[&str], adj: &[Vec<usize>]) -> Option<Vec<String>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Color {
        White, // unvisited
        Gray,  // on current path
        Black, // finished
    }

    fn dfs(
        node: usize,
        names: &[&str],
        adj: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<String>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &neighbor in &adj[node] {
            match colors[neighbor] {
                Color::Gray => {
                    if let Some(start) = path.iter().position(|&n| n == neighbor) {
                        let mut cycle: Vec<String> =
                            path[start..].iter().map(|&i| names[i].to_string()).collect();
                        cycle.push(names[neighbor].to_string());
                        return Some(cycle);
                    }
                }
                Color::White => {
                    if let Some(cycle) = dfs(neighbor, names, adj, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; names.len()];
    let mut path = Vec::new();
    for i in 0..names.len() {
        if colors[i] == Color::White {
            if let Some(cycle) = dfs(i, names, adj, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}

/// Structured errors for the module registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{0}' is already registered")]
    DuplicateModule(String),
    #[error("unknown module '{0}'")]
    UnknownModule(String),
    #[error("module '{module}' depends on unknown '{depends_on}'")]
    UnknownDependency { module: String, depends_on: String },
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CycleDetected { path: Vec<String> },
    #[error("initialization failed for module '{module}'")]
    Init {
        module: String,
        #[source]
        source: anyhow::Error,
    },
}
