//! Phase-ordered startup and shutdown of lifecycle-managed components.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::ListenerError;

/// A component that takes part in coordinated startup and shutdown.
#[async_trait]
pub trait SmartLifecycle: Send + Sync {
    async fn start(&self) -> Result<(), ListenerError>;

    async fn stop(&self, timeout: Duration) -> Result<(), ListenerError>;

    fn is_running(&self) -> bool;

    /// Ordering key. Lower phases start first and stop last.
    fn phase(&self) -> i32 {
        0
    }

    /// Whether [`LifecycleRegistry::start_all`] starts this component.
    fn is_auto_startup(&self) -> bool {
        true
    }
}

/// Starts and stops registered components by phase.
#[derive(Default)]
pub struct LifecycleRegistry {
    components: Vec<Arc<dyn SmartLifecycle>>,
}

impl LifecycleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, component: Arc<dyn SmartLifecycle>) {
        self.components.push(component);
    }

    pub fn len(&self) -> usize {
        self.components.len()
    }

    pub fn is_empty(&self) -> bool {
        self.components.is_empty()
    }

    /// Starts auto-startup components in ascending phase order.
    ///
    /// Stops at the first component that fails to start.
    pub async fn start_all(&self) -> Result<(), ListenerError> {
        for component in self.ordered(false) {
            if !component.is_auto_startup() || component.is_running() {
                continue;
            }
            info!(phase = component.phase(), "Starting lifecycle component");
            component.start().await?;
        }
        Ok(())
    }

    /// Stops running components in descending phase order, giving each up to `timeout`.
    ///
    /// Every component is asked to stop even if an earlier one fails; the
    /// first failure is returned.
    pub async fn stop_all(&self, timeout: Duration) -> Result<(), ListenerError> {
        let mut first_error = None;
        for component in self.ordered(true) {
            if !component.is_running() {
                continue;
            }
            info!(phase = component.phase(), "Stopping lifecycle component");
            if let Err(e) = component.stop(timeout).await {
                warn!(phase = component.phase(), error = %e, "Lifecycle component failed to stop");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn ordered(&self, reverse: bool) -> Vec<Arc<dyn SmartLifecycle>> {
        let mut components = self.components.clone();
        // Stable sort keeps registration order within a phase.
        components.sort_by_key(|c| c.phase());
        if reverse {
            components.reverse();
        }
        components
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Recorder {
        name: &'static str,
        phase: i32,
        auto_startup: bool,
        running: AtomicBool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &'static str, phase: i32, auto_startup: bool, log: Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Recorder {
                name,
                phase,
                auto_startup,
                running: AtomicBool::new(false),
                log,
            })
        }
    }

    #[async_trait]
    impl SmartLifecycle for Recorder {
        async fn start(&self) -> Result<(), ListenerError> {
            self.running.store(true, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("start {}", self.name));
            Ok(())
        }

        async fn stop(&self, _timeout: Duration) -> Result<(), ListenerError> {
            self.running.store(false, Ordering::SeqCst);
            self.log.lock().unwrap().push(format!("stop {}", self.name));
            Ok(())
        }

        fn is_running(&self) -> bool {
            self.running.load(Ordering::SeqCst)
        }

        fn phase(&self) -> i32 {
            self.phase
        }

        fn is_auto_startup(&self) -> bool {
            self.auto_startup
        }
    }

    #[tokio::test]
    async fn test_phase_ordering() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut registry = LifecycleRegistry::new();
        registry.register(Recorder::new("late", 100, true, log.clone()));
        registry.register(Recorder::new("early", -5, true, log.clone()));
        registry.register(Recorder::new("manual", 0, false, log.clone()));
        registry.register(Recorder::new("middle", 0, true, log.clone()));

        registry.start_all().await.unwrap();
        registry.stop_all(Duration::from_secs(1)).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "start early",
                "start middle",
                "start late",
                "stop late",
                "stop middle",
                "stop early",
            ]
        );
    }
}
