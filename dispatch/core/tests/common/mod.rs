//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use dispatch_core::backend::ModelInfo;
use dispatch_core::config::DispatchConfig;
use dispatch_core::context::RouterContext;
use dispatch_core::routing::test_utils::{ScriptedBackend, ScriptedLister};
use dispatch_core::routing::{Catalog, LOCAL_BACKEND};
use dispatch_core::{ManualClock, TextGenerator};

/// A dispatcher wired to scripted backends and a manual clock
pub struct Harness {
    pub ctx: RouterContext,
    pub clock: Arc<ManualClock>,
    pub local: Arc<ScriptedBackend>,
    pub lister: Arc<ScriptedLister>,
}

/// Builder for [`Harness`]
pub struct HarnessBuilder {
    config: DispatchConfig,
    local: ScriptedBackend,
    lister: ScriptedLister,
    remotes: Vec<Arc<ScriptedBackend>>,
    preferred: Option<String>,
}

pub fn harness() -> HarnessBuilder {
    HarnessBuilder {
        config: DispatchConfig::default(),
        local: ScriptedBackend::new(LOCAL_BACKEND),
        lister: installed(),
        remotes: Vec::new(),
        preferred: None,
    }
}

/// Two installed local models: a small chat model and a larger code model
pub fn installed() -> ScriptedLister {
    ScriptedLister::new(installed_models())
}

pub fn installed_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo::new("llama3.2:3b", 2_000_000_000),
        ModelInfo::new("qwen2.5-coder:7b", 4_700_000_000),
    ]
}

impl HarnessBuilder {
    pub fn config(mut self, edit: impl FnOnce(&mut DispatchConfig)) -> Self {
        edit(&mut self.config);
        self
    }

    pub fn local(mut self, local: ScriptedBackend) -> Self {
        self.local = local;
        self
    }

    pub fn local_unreachable(mut self) -> Self {
        self.lister = ScriptedLister::unreachable();
        self
    }

    /// Enable a catalog remote backed by `backend`
    pub fn remote(mut self, backend: &Arc<ScriptedBackend>) -> Self {
        self.remotes.push(Arc::clone(backend));
        self
    }

    pub fn preferred(mut self, backend: &str) -> Self {
        self.preferred = Some(backend.to_string());
        self
    }

    pub fn build(self) -> Harness {
        let clock = Arc::new(ManualClock::starting_now());
        let local = Arc::new(self.local);
        let lister = Arc::new(self.lister);

        let mut catalog = Catalog::builtin();
        for remote in &self.remotes {
            catalog.set_enabled(remote.name(), true);
        }

        let mut config = self.config;
        config.router.preferred_backend = self.preferred;

        let mut builder = RouterContext::builder(config)
            .with_clock(clock.clone())
            .with_catalog(catalog)
            .with_local(local.clone(), lister.clone());
        for remote in self.remotes {
            builder = builder.with_remote(remote);
        }

        Harness {
            ctx: builder.build(),
            clock,
            local,
            lister,
        }
    }
}
