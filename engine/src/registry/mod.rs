//! Tool Registry
//!
//! The single source of truth for what can run. Maps tool names to their
//! capability contract and implementation. Shared across concurrent jobs.
//!
//! Registration is mutually exclusive per name: the first writer wins, an
//! identical re-registration is a no-op, and a conflicting one is rejected
//! with `NameCollision`. Specs are never silently overwritten; `replace` is
//! the explicit way to swap an implementation.

use shield_sdk::errors::ShieldError;
use shield_sdk::tool_spec::ToolSpec;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

use crate::tools::PrivacyTool;

/// Result of a successful `register`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    Added,
    /// Same name and identity already present
    Unchanged,
}

struct Entry {
    spec: ToolSpec,
    tool: Arc<dyn PrivacyTool>,
}

#[derive(Default)]
pub struct ToolRegistry {
    entries: RwLock<BTreeMap<String, Entry>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Capability contract for `name`, if registered
    pub fn lookup(&self, name: &str) -> Option<ToolSpec> {
        self.read().get(name).map(|e| e.spec.clone())
    }

    /// Implementation for `name`, if registered
    pub fn get(&self, name: &str) -> Option<Arc<dyn PrivacyTool>> {
        self.read().get(name).map(|e| Arc::clone(&e.tool))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().contains_key(name)
    }

    /// Register a tool under the name its spec declares
    pub fn register(&self, tool: Arc<dyn PrivacyTool>) -> Result<Registration, ShieldError> {
        let spec = tool.spec();
        let mut entries = self.write();

        if let Some(existing) = entries.get(&spec.name) {
            if existing.spec.identity() == spec.identity() {
                debug!(tool = %spec.name, "Identical tool already registered");
                return Ok(Registration::Unchanged);
            }
            warn!(tool = %spec.name, "Rejected conflicting registration");
            return Err(ShieldError::NameCollision(spec.name));
        }

        info!(tool = %spec.name, kind = ?spec.kind, origin = ?spec.origin, "Registered tool");
        entries.insert(spec.name.clone(), Entry { spec, tool });
        Ok(Registration::Added)
    }

    /// Registered names in sorted order
    pub fn names(&self) -> Vec<String> {
        self.read().keys().cloned().collect()
    }

    /// All registered specs in name order
    pub fn specs(&self) -> Vec<ToolSpec> {
        self.read().values().map(|e| e.spec.clone()).collect()
    }

    /// Register every tool in `tools`, stopping at the first collision
    pub fn register_all(
        &self,
        tools: impl IntoIterator<Item = Arc<dyn PrivacyTool>>,
    ) -> Result<(), ShieldError> {
        for tool in tools {
            self.register(tool)?;
        }
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, BTreeMap<String, Entry>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, BTreeMap<String, Entry>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::{ScriptedTool, StageContext};
    use shield_sdk::tool_spec::ToolKind;

    fn generated(name: &str, hash: &str) -> Arc<dyn PrivacyTool> {
        Arc::new(ScriptedTool::new(ToolSpec::generated(
            name,
            ToolKind::Composite,
            "test",
            hash,
        )))
    }

    #[test]
    fn test_lookup_absent() {
        let registry = ToolRegistry::new();
        assert!(registry.lookup("blur_faces").is_none());
        assert!(registry.get("blur_faces").is_none());
    }

    #[test]
    fn test_identical_reregistration_is_noop() {
        let registry = ToolRegistry::new();
        assert_eq!(
            registry.register(generated("blur_plates", "aa")).unwrap(),
            Registration::Added
        );
        assert_eq!(
            registry.register(generated("blur_plates", "aa")).unwrap(),
            Registration::Unchanged
        );
        assert_eq!(registry.names(), vec!["blur_plates"]);
    }

    #[test]
    fn test_conflicting_registration_rejected() {
        let registry = ToolRegistry::new();
        registry.register(generated("blur_plates", "aa")).unwrap();
        let err = registry.register(generated("blur_plates", "bb")).unwrap_err();
        assert!(matches!(err, ShieldError::NameCollision(name) if name == "blur_plates"));
        assert_eq!(
            registry.lookup("blur_plates").unwrap().content_hash.as_deref(),
            Some("aa")
        );
    }

    #[tokio::test]
    async fn test_get_returns_callable_tool() {
        let registry = ToolRegistry::new();
        registry.register(generated("detect_plates", "cc")).unwrap();
        let tool = registry.get("detect_plates").unwrap();
        let dir = tempfile::tempdir().unwrap();
        let ctx = StageContext::for_test(dir.path());
        let out = tool
            .apply(&ctx, &serde_json::Map::new(), None)
            .await
            .unwrap();
        assert!(out.output_path.starts_with(dir.path()));
    }

    #[test]
    fn test_concurrent_registration_first_writer_wins() {
        let registry = Arc::new(ToolRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    let hash = if i % 2 == 0 { "same" } else { "other" };
                    registry.register(generated("blur_plates", hash))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let added = results
            .iter()
            .filter(|r| matches!(r, Ok(Registration::Added)))
            .count();
        assert_eq!(added, 1);

        let winner = registry.lookup("blur_plates").unwrap().content_hash.unwrap();
        for r in results {
            match r {
                Ok(_) => {}
                Err(ShieldError::NameCollision(_)) => {}
                Err(e) => panic!("unexpected error {e}"),
            }
        }
        assert!(winner == "same" || winner == "other");
    }
}
