//! Lifecycle hook registry.
//!
//! Extensions register hooks against a fixed set of hook kinds; dispatch runs
//! them in priority order. Whether a failing hook aborts the surrounding
//! operation is decided per realm by its `HookFailureStrategy`.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::HookFailureStrategy;
use crate::error::{Error, Result};

/// Priority levels for hook execution; higher runs first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Priority(pub i32);

impl Priority {
    pub const LOWEST: Priority = Priority(-100);
    pub const LOW: Priority = Priority(-50);
    pub const NORMAL: Priority = Priority(0);
    pub const HIGH: Priority = Priority(50);
    pub const HIGHEST: Priority = Priority(100);
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORMAL
    }
}

/// The fixed set of dispatch points
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookKind {
    /// Before a user row is inserted; the place for content validation
    PreUserCreate,
    PostUserCreate,
    PreUserUpdate,
    PostUserUpdate,
    PreUserDelete,
    PostUserDelete,
    /// Before credentials are checked
    PreAuthenticate,
    /// After a successful authentication, before tokens are minted
    PostAuthenticate,
    PostTokenIssue,
    PostTokenRefresh,
    PrePasswordReset,
    PostPasswordReset,
}

/// Payload handed to every hook at dispatch
#[derive(Debug, Clone)]
pub struct HookContext {
    pub realm: String,
    pub kind: HookKind,
    pub payload: Value,
}

impl HookContext {
    pub fn new(realm: impl Into<String>, kind: HookKind, payload: Value) -> Self {
        Self {
            realm: realm.into(),
            kind,
            payload,
        }
    }
}

/// A registered lifecycle collaborator
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    /// Name for logging and failure reports
    fn name(&self) -> &str;

    fn priority(&self) -> Priority {
        Priority::NORMAL
    }

    async fn run(&self, ctx: &HookContext) -> Result<()>;
}

struct Registration {
    hook: Arc<dyn LifecycleHook>,
    extension_id: Option<String>,
}

/// Outcome of a CONTINUE-strategy dispatch
#[derive(Debug, Default)]
pub struct HookReport {
    pub executed: usize,
    pub failures: Vec<(String, Error)>,
}

impl HookReport {
    pub fn all_succeeded(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Registry mapping hook kinds to their collaborators
pub struct HookRegistry {
    hooks: RwLock<HashMap<HookKind, Vec<Registration>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self {
            hooks: RwLock::new(HashMap::new()),
        }
    }

    /// Register a hook, keeping the kind's list sorted by priority
    pub fn register(
        &self,
        kind: HookKind,
        hook: Arc<dyn LifecycleHook>,
        extension_id: Option<String>,
    ) {
        let mut hooks = self.hooks.write();
        let entries = hooks.entry(kind).or_default();
        entries.push(Registration { hook, extension_id });
        entries.sort_by(|a, b| b.hook.priority().cmp(&a.hook.priority()));
    }

    /// Remove every hook registered by an extension
    pub fn remove_extension(&self, extension_id: &str) {
        let mut hooks = self.hooks.write();
        for entries in hooks.values_mut() {
            entries.retain(|r| r.extension_id.as_deref() != Some(extension_id));
        }
    }

    pub fn count(&self, kind: HookKind) -> usize {
        self.hooks.read().get(&kind).map(Vec::len).unwrap_or(0)
    }

    /// Dispatch a hook kind under the given failure strategy.
    ///
    /// `FailFast` returns the first error and stops. `Continue` runs every
    /// hook, logs failures, and returns the composite report.
    pub async fn dispatch(
        &self,
        ctx: &HookContext,
        strategy: HookFailureStrategy,
    ) -> Result<HookReport> {
        let hooks: Vec<Arc<dyn LifecycleHook>> = {
            let map = self.hooks.read();
            map.get(&ctx.kind)
                .map(|entries| entries.iter().map(|r| r.hook.clone()).collect())
                .unwrap_or_default()
        };

        let mut report = HookReport::default();
        for hook in hooks {
            match hook.run(ctx).await {
                Ok(()) => report.executed += 1,
                Err(e) => match strategy {
                    HookFailureStrategy::FailFast => {
                        return Err(Error::Hook {
                            hook: hook.name().to_string(),
                            message: e.to_string(),
                        });
                    }
                    HookFailureStrategy::Continue => {
                        tracing::warn!(
                            hook = hook.name(),
                            realm = %ctx.realm,
                            error = %e,
                            "Hook failed; continuing"
                        );
                        report.executed += 1;
                        report.failures.push((hook.name().to_string(), e));
                    }
                },
            }
        }

        Ok(report)
    }
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct RecordingHook {
        name: String,
        priority: Priority,
        order: Arc<Mutex<Vec<String>>>,
        fail: bool,
    }

    #[async_trait]
    impl LifecycleHook for RecordingHook {
        fn name(&self) -> &str {
            &self.name
        }

        fn priority(&self) -> Priority {
            self.priority
        }

        async fn run(&self, _ctx: &HookContext) -> Result<()> {
            self.order.lock().push(self.name.clone());
            if self.fail {
                Err(Error::internal("boom"))
            } else {
                Ok(())
            }
        }
    }

    fn hook(
        name: &str,
        priority: Priority,
        order: Arc<Mutex<Vec<String>>>,
        fail: bool,
    ) -> Arc<dyn LifecycleHook> {
        Arc::new(RecordingHook {
            name: name.to_string(),
            priority,
            order,
            fail,
        })
    }

    #[tokio::test]
    async fn test_priority_order() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        registry.register(
            HookKind::PreUserCreate,
            hook("low", Priority::LOW, order.clone(), false),
            None,
        );
        registry.register(
            HookKind::PreUserCreate,
            hook("high", Priority::HIGH, order.clone(), false),
            None,
        );

        let ctx = HookContext::new("acme", HookKind::PreUserCreate, serde_json::json!({}));
        registry
            .dispatch(&ctx, HookFailureStrategy::Continue)
            .await
            .unwrap();

        assert_eq!(*order.lock(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_fail_fast_aborts() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        registry.register(
            HookKind::PreUserCreate,
            hook("first", Priority::HIGH, order.clone(), true),
            None,
        );
        registry.register(
            HookKind::PreUserCreate,
            hook("second", Priority::LOW, order.clone(), false),
            None,
        );

        let ctx = HookContext::new("acme", HookKind::PreUserCreate, serde_json::json!({}));
        let result = registry.dispatch(&ctx, HookFailureStrategy::FailFast).await;

        assert!(matches!(result, Err(Error::Hook { .. })));
        assert_eq!(*order.lock(), vec!["first"]); // second never ran
    }

    #[tokio::test]
    async fn test_continue_collects_failures() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        registry.register(
            HookKind::PostAuthenticate,
            hook("bad", Priority::NORMAL, order.clone(), true),
            None,
        );
        registry.register(
            HookKind::PostAuthenticate,
            hook("good", Priority::NORMAL, order.clone(), false),
            None,
        );

        let ctx = HookContext::new("acme", HookKind::PostAuthenticate, serde_json::json!({}));
        let report = registry
            .dispatch(&ctx, HookFailureStrategy::Continue)
            .await
            .unwrap();

        assert_eq!(report.executed, 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "bad");
    }

    #[tokio::test]
    async fn test_remove_extension() {
        let registry = HookRegistry::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        registry.register(
            HookKind::PreUserDelete,
            hook("ext_hook", Priority::NORMAL, order.clone(), false),
            Some("ext-1".to_string()),
        );
        assert_eq!(registry.count(HookKind::PreUserDelete), 1);

        registry.remove_extension("ext-1");
        assert_eq!(registry.count(HookKind::PreUserDelete), 0);
    }
}
