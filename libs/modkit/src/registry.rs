//! Dependency-ordered module registry.
//!
//! Modules are registered with a [`ModuleDecl`] (name, version, dependency
//! names). `initialize` validates the graph, resolves a deterministic
//! topological order and runs every enabled module's `init` in that order;
//! `shutdown` walks the modules that actually started in reverse.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::context::ModuleCtx;
use crate::contracts::Module;
use crate::events::LifecycleEvent;

/// Registration-time metadata of a module.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleDecl {
    pub name: String,
    pub version: String,
    pub deps: Vec<String>,
}

impl ModuleDecl {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: "0.1.0".to_string(),
            deps: Vec::new(),
        }
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for d in deps {
            let d = d.into();
            if !self.deps.contains(&d) {
                self.deps.push(d);
            }
        }
        self
    }
}

pub struct ModuleEntry {
    decl: ModuleDecl,
    core: Arc<dyn Module>,
}

impl ModuleEntry {
    pub fn name(&self) -> &str {
        &self.decl.name
    }
    pub fn version(&self) -> &str {
        &self.decl.version
    }
    pub fn deps(&self) -> &[String] {
        &self.decl.deps
    }
    pub fn module(&self) -> &Arc<dyn Module> {
        &self.core
    }
}

impl std::fmt::Debug for ModuleEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleEntry")
            .field("name", &self.decl.name)
            .field("version", &self.decl.version)
            .field("deps", &self.decl.deps)
            .field("enabled", &self.core.is_enabled())
            .finish()
    }
}

/// `Uninitialized -> Initializing -> Ready -> ShuttingDown -> Uninitialized`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ManagerState {
    Uninitialized,
    Initializing,
    Ready,
    ShuttingDown,
}

impl ManagerState {
    #[inline]
    pub const fn as_u8(self) -> u8 {
        match self {
            ManagerState::Uninitialized => 0,
            ManagerState::Initializing => 1,
            ManagerState::Ready => 2,
            ManagerState::ShuttingDown => 3,
        }
    }
    #[inline]
    pub const fn from_u8(x: u8) -> Self {
        match x {
            1 => ManagerState::Initializing,
            2 => ManagerState::Ready,
            3 => ManagerState::ShuttingDown,
            _ => ManagerState::Uninitialized,
        }
    }
}

/// Adjacency view over the registered modules: `adj[i]` holds the indices of
/// the modules `i` depends on, in declaration order. Rebuilt on every resolve.
#[derive(Debug)]
pub struct DependencyGraph<'a> {
    names: Vec<&'a str>,
    adj: Vec<Vec<usize>>,
}

impl<'a> DependencyGraph<'a> {
    /// Fails with `MissingDependency` on the first (registration order) dangling edge.
    pub fn build(entries: &'a [ModuleEntry]) -> Result<Self, RegistryError> {
        let names: Vec<&'a str> = entries.iter().map(|e| e.name()).collect();
        let idx: HashMap<&str, usize> = names.iter().enumerate().map(|(i, &n)| (n, i)).collect();

        let mut adj = Vec::with_capacity(entries.len());
        for e in entries {
            let mut edges = Vec::with_capacity(e.deps().len());
            for d in e.deps() {
                let v = *idx
                    .get(d.as_str())
                    .ok_or_else(|| RegistryError::MissingDependency {
                        module: e.name().to_string(),
                        depends_on: d.clone(),
                    })?;
                edges.push(v);
            }
            adj.push(edges);
        }
        Ok(Self { names, adj })
    }

    /// DFS with an explicit recursion stack. Returns the module that was
    /// revisited while still on the stack, plus the closed cycle path.
    pub fn find_cycle(&self) -> Option<(&'a str, Vec<&'a str>)> {
        #[derive(Clone, Copy, PartialEq)]
        enum Color {
            White, // unvisited
            Gray,  // on the current path
            Black, // finished
        }

        fn dfs<'a>(
            node: usize,
            g: &DependencyGraph<'a>,
            colors: &mut [Color],
            path: &mut Vec<usize>,
        ) -> Option<(&'a str, Vec<&'a str>)> {
            colors[node] = Color::Gray;
            path.push(node);

            for &next in &g.adj[node] {
                match colors[next] {
                    Color::Gray => {
                        let start = path.iter().position(|&n| n == next).unwrap_or(0);
                        let mut cycle: Vec<&'a str> =
                            path[start..].iter().map(|&i| g.names[i]).collect();
                        cycle.push(g.names[next]);
                        return Some((g.names[next], cycle));
                    }
                    Color::White => {
                        if let Some(found) = dfs(next, g, colors, path) {
                            return Some(found);
                        }
                    }
                    Color::Black => {}
                }
            }

            path.pop();
            colors[node] = Color::Black;
            None
        }

        let mut colors = vec![Color::White; self.names.len()];
        let mut path = Vec::new();
        for i in 0..self.names.len() {
            if colors[i] == Color::White {
                if let Some(found) = dfs(i, self, &mut colors, &mut path) {
                    return Some(found);
                }
            }
        }
        None
    }

    /// Post-order DFS in registration order: dependencies first, then the node.
    /// Only meaningful on an acyclic graph.
    pub fn topo_order(&self) -> Vec<usize> {
        fn visit(node: usize, adj: &[Vec<usize>], seen: &mut [bool], out: &mut Vec<usize>) {
            if seen[node] {
                return;
            }
            seen[node] = true;
            for &dep in &adj[node] {
                visit(dep, adj, seen, out);
            }
            out.push(node);
        }

        let mut seen = vec![false; self.names.len()];
        let mut out = Vec::with_capacity(self.names.len());
        for i in 0..self.names.len() {
            visit(i, &self.adj, &mut seen, &mut out);
        }
        out
    }
}

/// Owns the registered modules and drives their ordered lifecycle.
pub struct ModuleManager {
    modules: Vec<ModuleEntry>, // registration order
    index: HashMap<String, usize>,
    state: AtomicU8,
    // indices of modules whose init succeeded, in init order
    started: Mutex<Vec<usize>>,
}

impl Default for ModuleManager {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ModuleManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleManager")
            .field("modules", &self.names())
            .field("state", &self.state())
            .finish()
    }
}

impl ModuleManager {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
            index: HashMap::new(),
            state: AtomicU8::new(ManagerState::Uninitialized.as_u8()),
            started: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn state(&self) -> ManagerState {
        ManagerState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn store_state(&self, s: ManagerState) {
        self.state.store(s.as_u8(), Ordering::Release);
    }

    fn transition(&self, from: ManagerState, to: ManagerState) -> Result<(), ManagerState> {
        self.state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ManagerState::from_u8)
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == ManagerState::Ready
    }

    fn ensure_mutable(&self) -> Result<(), RegistryError> {
        match self.state() {
            ManagerState::Uninitialized => Ok(()),
            other => Err(RegistryError::InvalidState(other)),
        }
    }

    pub fn register(
        &mut self,
        decl: ModuleDecl,
        module: Arc<dyn Module>,
    ) -> Result<(), RegistryError> {
        self.ensure_mutable()?;
        if self.index.contains_key(&decl.name) {
            return Err(RegistryError::DuplicateName(decl.name));
        }
        tracing::debug!(module = %decl.name, version = %decl.version, deps = ?decl.deps, "module registered");
        self.index.insert(decl.name.clone(), self.modules.len());
        self.modules.push(ModuleEntry { decl, core: module });
        Ok(())
    }

    pub fn unregister(&mut self, name: &str) -> Result<Arc<dyn Module>, RegistryError> {
        self.ensure_mutable()?;
        let pos = *self
            .index
            .get(name)
            .ok_or_else(|| RegistryError::NotFound(name.to_string()))?;

        let dependents: Vec<String> = self
            .modules
            .iter()
            .filter(|e| e.deps().iter().any(|d| d == name))
            .map(|e| e.name().to_string())
            .collect();
        if !dependents.is_empty() {
            return Err(RegistryError::DependentsExist {
                module: name.to_string(),
                dependents,
            });
        }

        let removed = self.modules.remove(pos);
        self.index = self
            .modules
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name().to_string(), i))
            .collect();
        tracing::debug!(module = name, "module unregistered");
        Ok(removed.core)
    }

    pub fn modules(&self) -> &[ModuleEntry] {
        &self.modules
    }

    pub fn names(&self) -> Vec<&str> {
        self.modules.iter().map(|e| e.name()).collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Module>> {
        self.index.get(name).map(|&i| self.modules[i].core.clone())
    }

    /// Typed access to a registered module.
    pub fn get_as<T: 'static>(&self, name: &str) -> Option<&T> {
        let &i = self.index.get(name)?;
        self.modules[i].core.as_any().downcast_ref::<T>()
    }

    fn resolve_order(&self) -> Result<Vec<usize>, RegistryError> {
        let graph = DependencyGraph::build(&self.modules)?;
        if let Some((module, path)) = graph.find_cycle() {
            return Err(RegistryError::CircularDependency {
                module: module.to_string(),
                path: path.into_iter().map(str::to_string).collect(),
            });
        }
        Ok(graph.topo_order())
    }

    /// Resolved initialization order (all modules, enabled or not) without running any hook.
    pub fn initialization_order(&self) -> Result<Vec<&str>, RegistryError> {
        Ok(self
            .resolve_order()?
            .into_iter()
            .map(|i| self.modules[i].name())
            .collect())
    }

    /// Validate, order and initialize every enabled module. Fail-fast: the first
    /// failing `init` aborts the sequence; modules already started are left as they are.
    pub async fn initialize(&self, ctx: &ModuleCtx) -> Result<(), RegistryError> {
        if let Err(current) = self.transition(ManagerState::Uninitialized, ManagerState::Initializing)
        {
            tracing::warn!(state = ?current, "initialize() ignored: modules already initialized");
            return Ok(());
        }

        let order = match self.resolve_order() {
            Ok(order) => order,
            Err(e) => {
                self.store_state(ManagerState::Uninitialized);
                return Err(e);
            }
        };

        tracing::info!(
            modules = ?order.iter().map(|&i| self.modules[i].name()).collect::<Vec<_>>(),
            "Module dependency order resolved (topo)"
        );

        let mut started = Vec::with_capacity(order.len());
        for i in order {
            let e = &self.modules[i];
            let name = e.name();

            if !e.core.is_enabled() {
                tracing::info!(module = name, "module disabled; skipping");
                ctx.publish(LifecycleEvent::ModuleSkipped {
                    module: name.to_string(),
                });
                continue;
            }
            for dep in e.deps() {
                if self.get(dep).is_some_and(|m| !m.is_enabled()) {
                    tracing::warn!(module = name, dependency = %dep, "module depends on a disabled module");
                }
            }

            ctx.publish(LifecycleEvent::ModuleInitializing {
                module: name.to_string(),
            });
            let mctx = ctx.clone().for_module(name);
            if let Err(source) = e.core.init(&mctx).await {
                tracing::error!(module = name, error = %source, "module initialization failed");
                ctx.publish(LifecycleEvent::ModuleFailed {
                    module: name.to_string(),
                    error: format!("{source:#}"),
                });
                if !started.is_empty() {
                    tracing::warn!(
                        already_started = ?started.iter().map(|&i: &usize| self.modules[i].name()).collect::<Vec<_>>(),
                        "initialization aborted; started modules are not rolled back"
                    );
                }
                self.store_state(ManagerState::Uninitialized);
                return Err(RegistryError::Init {
                    module: name.to_string(),
                    source,
                });
            }
            tracing::info!(module = name, version = e.version(), "module initialized");
            ctx.publish(LifecycleEvent::ModuleInitialized {
                module: name.to_string(),
            });
            started.push(i);
        }

        *self.started.lock() = started;
        self.store_state(ManagerState::Ready);
        ctx.publish(LifecycleEvent::ModulesReady);
        Ok(())
    }

    /// Shut started modules down in reverse order. Every module gets its attempt;
    /// failures are logged and summarized in `ShutdownIncomplete`.
    pub async fn shutdown(&self, ctx: &ModuleCtx) -> Result<(), RegistryError> {
        if let Err(current) = self.transition(ManagerState::Ready, ManagerState::ShuttingDown) {
            tracing::warn!(state = ?current, "shutdown() ignored: modules are not initialized");
            return Ok(());
        }

        let started = std::mem::take(&mut *self.started.lock());
        let mut failed = Vec::new();
        for i in started.into_iter().rev() {
            let e = &self.modules[i];
            let name = e.name();
            let mctx = ctx.clone().for_module(name);
            match e.core.shutdown(&mctx).await {
                Ok(()) => {
                    tracing::info!(module = name, "module stopped");
                    ctx.publish(LifecycleEvent::ModuleStopped {
                        module: name.to_string(),
                    });
                }
                Err(err) => {
                    tracing::warn!(module = name, error = %err, "Failed to stop module");
                    ctx.publish(LifecycleEvent::ModuleStopFailed {
                        module: name.to_string(),
                        error: format!("{err:#}"),
                    });
                    failed.push(name.to_string());
                }
            }
        }

        self.store_state(ManagerState::Uninitialized);
        ctx.publish(LifecycleEvent::ModulesStopped);

        if failed.is_empty() {
            Ok(())
        } else {
            Err(RegistryError::ShutdownIncomplete { failed })
        }
    }
}

/// Structured errors for the module registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("module '{0}' is already registered")]
    DuplicateName(String),
    #[error("module '{0}' is not registered")]
    NotFound(String),
    #[error("module '{module}' is still required by: {}", dependents.join(", "))]
    DependentsExist {
        module: String,
        dependents: Vec<String>,
    },
    #[error("module '{module}' depends on unknown '{depends_on}'")]
    MissingDependency { module: String, depends_on: String },
    #[error("cyclic dependency detected at '{module}': {}", path.join(" -> "))]
    CircularDependency { module: String, path: Vec<String> },
    #[error("initialization failed for module '{module}'")]
    Init {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("shutdown incomplete; failing modules: {}", failed.join(", "))]
    ShutdownIncomplete { failed: Vec<String> },
    #[error("module registry is {0:?}; changes are only allowed before initialization")]
    InvalidState(ManagerState),
}
