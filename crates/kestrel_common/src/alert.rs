//! Administrative alert catalog and routing.
//!
//! Each component registers, at initialization, the fixed set of alert
//! types it may ever emit together with a human-readable description. The
//! router forwards `(component, type, message)` tuples to a pluggable
//! transport, refusing any emit whose type the component never declared —
//! an undeclared emit is a bug in the emitting component, not a message
//! worth delivering.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{KestrelError, KestrelResult};

/// Declared alert types for one component, insertion-ordered.
#[derive(Debug, Clone, Default)]
pub struct AlertCatalog {
    /// (alert type, description), in declaration order.
    alerts: Vec<(String, String)>,
}

impl AlertCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn declare(mut self, alert_type: &str, description: &str) -> Self {
        self.alerts
            .push((alert_type.to_string(), description.to_string()));
        self
    }

    pub fn contains(&self, alert_type: &str) -> bool {
        self.alerts.iter().any(|(t, _)| t == alert_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.alerts.iter().map(|(t, d)| (t.as_str(), d.as_str()))
    }
}

/// Receives validated alerts. Out-of-scope transports (JMX, SNMP, mail)
/// implement this; the default logs through tracing.
pub trait AlertTransport: Send + Sync {
    fn forward(&self, component_id: &str, alert_type: &str, message: &str);
}

/// Default transport: structured log lines.
pub struct LogTransport;

impl AlertTransport for LogTransport {
    fn forward(&self, component_id: &str, alert_type: &str, message: &str) {
        tracing::warn!(component = component_id, alert = alert_type, "{message}");
    }
}

/// Routes alerts from components to the transport, enforcing each
/// component's declared catalog.
pub struct AlertRouter {
    catalogs: RwLock<HashMap<String, AlertCatalog>>,
    transport: Box<dyn AlertTransport>,
    forwarded: AtomicU64,
    rejected: AtomicU64,
}

impl AlertRouter {
    pub fn new(transport: Box<dyn AlertTransport>) -> Self {
        Self {
            catalogs: RwLock::new(HashMap::new()),
            transport,
            forwarded: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// Register a component's catalog. Re-registration replaces the old
    /// catalog (component restart).
    pub fn register(&self, component_id: &str, catalog: AlertCatalog) {
        self.catalogs
            .write()
            .insert(component_id.to_string(), catalog);
    }

    /// Validate and forward one alert.
    pub fn raise(
        &self,
        component_id: &str,
        alert_type: &str,
        message: &str,
    ) -> KestrelResult<()> {
        let declared = {
            let catalogs = self.catalogs.read();
            match catalogs.get(component_id) {
                Some(catalog) => catalog.contains(alert_type),
                None => false,
            }
        };
        if !declared {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::error!(
                component = component_id,
                alert = alert_type,
                "alert type not declared in component catalog — dropping"
            );
            return Err(KestrelError::internal_bug(
                "E-ALERT-001",
                format!("component '{component_id}' emitted undeclared alert '{alert_type}'"),
            ));
        }
        self.transport.forward(component_id, alert_type, message);
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn forwarded_count(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<(String, String, String)>>);

    impl AlertTransport for &'static Capture {
        fn forward(&self, component_id: &str, alert_type: &str, message: &str) {
            self.0.lock().unwrap().push((
                component_id.to_string(),
                alert_type.to_string(),
                message.to_string(),
            ));
        }
    }

    fn catalog() -> AlertCatalog {
        AlertCatalog::new()
            .declare("store-degraded", "The entry store backend reported failures")
            .declare("import-orphans", "A bulk import finished with orphaned entries")
    }

    #[test]
    fn declared_alerts_forward() {
        static SINK: Capture = Capture(Mutex::new(Vec::new()));
        let router = AlertRouter::new(Box::new(&SINK));
        router.register("entry-store", catalog());

        router
            .raise("entry-store", "store-degraded", "backend unreachable")
            .unwrap();
        assert_eq!(router.forwarded_count(), 1);
        let seen = SINK.0.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].1, "store-degraded");
    }

    #[test]
    fn undeclared_alerts_rejected() {
        static SINK: Capture = Capture(Mutex::new(Vec::new()));
        let router = AlertRouter::new(Box::new(&SINK));
        router.register("entry-store", catalog());

        assert!(router.raise("entry-store", "disk-on-fire", "boom").is_err());
        assert!(router.raise("unknown-component", "store-degraded", "x").is_err());
        assert_eq!(router.rejected_count(), 2);
        assert!(SINK.0.lock().unwrap().is_empty());
    }

    #[test]
    fn catalog_preserves_declaration_order() {
        let catalog = catalog();
        let types: Vec<&str> = catalog.iter().map(|(t, _)| t).collect();
        assert_eq!(types, ["store-degraded", "import-orphans"]);
    }
}
