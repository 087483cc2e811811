//! External collaborators and interception bundles
//!
//! Vendor profilers, OpenMP tool hooks, communication-library interception
//! and coverage post-processing live outside the runtime. They plug in
//! through the narrow [`Component`] contract and are grouped by
//! [`ComponentKind`] into [`InterceptionBundle`]s, which start their members
//! in registration order and stop them in reverse.

use crate::error::Result;
use std::collections::BTreeMap;
use std::fmt;

/// Contract implemented by every external collaborator
pub trait Component: Send {
    fn name(&self) -> &str;

    fn setup(&mut self) -> Result<()>;

    fn shutdown(&mut self) -> Result<()>;

    fn post_process(&mut self) -> Result<()> {
        Ok(())
    }
}

/// When a component is set up and torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ComponentKind {
    /// Started once both `init` and `set_mpi` have run
    PreInit,
    /// Pre-activation bundle started by `init_tooling`
    Thread,
    Gpu,
    OpenMp,
    Communication,
    Coverage,
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentKind::PreInit => "preinit",
            ComponentKind::Thread => "thread",
            ComponentKind::Gpu => "gpu",
            ComponentKind::OpenMp => "openmp",
            ComponentKind::Communication => "communication",
            ComponentKind::Coverage => "coverage",
        };
        f.write_str(name)
    }
}

/// Ordered group of components started and stopped together
pub struct InterceptionBundle {
    kind: ComponentKind,
    components: Vec<Box<dyn Component>>,
    started: bool,
}

impl fmt::Debug for InterceptionBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptionBundle")
            .field("kind", &self.kind)
            .field("components", &self.names())
            .field("started", &self.started)
            .finish()
    }
}

impl InterceptionBundle {
    pub fn new(kind: ComponentKind) -> Self {
        Self {
            kind,
            components: Vec::new(),
            started: false,
        }
    }

    pub fn push(&mut self, component: Box<dyn Component>) {
        self.components.push(component);
    }

    /// Set up every component in order; failures are logged and skipped
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        self.started = true;
        for component in &mut self.components {
            match component.setup() {
                Ok(()) => tracing::debug!("[{}] {} set up", self.kind, component.name()),
                Err(err) => {
                    tracing::warn!("[{}] {} setup failed: {err}", self.kind, component.name())
                }
            }
        }
    }

    /// Shut every component down in reverse order
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        for component in self.components.iter_mut().rev() {
            if let Err(err) = component.shutdown() {
                tracing::warn!("[{}] {} shutdown failed: {err}", self.kind, component.name());
            }
        }
    }

    pub fn post_process(&mut self) {
        for component in &mut self.components {
            if let Err(err) = component.post_process() {
                tracing::warn!(
                    "[{}] {} post-processing failed: {err}",
                    self.kind,
                    component.name()
                );
            }
        }
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.components.iter().map(|c| c.name()).collect()
    }
}

/// Every registered component, bundled by kind
#[derive(Debug, Default)]
pub struct ComponentSet {
    bundles: BTreeMap<ComponentKind, InterceptionBundle>,
}

impl ComponentSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, kind: ComponentKind, component: Box<dyn Component>) {
        self.bundle(kind).push(component);
    }

    /// Bundle of `kind`, created empty on first use
    pub fn bundle(&mut self, kind: ComponentKind) -> &mut InterceptionBundle {
        self.bundles
            .entry(kind)
            .or_insert_with(|| InterceptionBundle::new(kind))
    }

    pub fn start(&mut self, kind: ComponentKind) {
        self.bundle(kind).start();
    }

    pub fn stop(&mut self, kind: ComponentKind) {
        if let Some(bundle) = self.bundles.get_mut(&kind) {
            bundle.stop();
        }
    }

    pub fn post_process(&mut self, kind: ComponentKind) {
        if let Some(bundle) = self.bundles.get_mut(&kind) {
            bundle.post_process();
        }
    }

    pub fn is_started(&self, kind: ComponentKind) -> bool {
        self.bundles.get(&kind).is_some_and(|b| b.is_started())
    }
}
