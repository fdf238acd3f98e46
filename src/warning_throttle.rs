use moka::sync::Cache;
use std::time::Duration;

/// Suppresses repeated diagnostics while a provider is flapping.
///
/// Each key is remembered for `cooldown`; `should_log` answers true only for
/// the first call per key inside that window. Entries expire on their own, so
/// the next call after the window logs again. Nothing is persisted.
#[derive(Clone)]
pub struct WarningThrottle {
    emitted: Cache<String, ()>,
}

impl WarningThrottle {
    pub fn new(cooldown: Duration) -> Self {
        let emitted = Cache::builder()
            .time_to_live(cooldown)
            .max_capacity(10_000)
            .build();
        Self { emitted }
    }

    pub fn should_log(&self, key: &str) -> bool {
        self.emitted.entry(key.to_string()).or_insert(()).is_fresh()
    }
}

impl Default for WarningThrottle {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_call_logs_then_suppresses() {
        let throttle = WarningThrottle::default();
        assert!(throttle.should_log("clearance_unavailable"));
        assert!(!throttle.should_log("clearance_unavailable"));
        assert!(!throttle.should_log("clearance_unavailable"));
    }

    #[test]
    fn test_keys_are_independent() {
        let throttle = WarningThrottle::default();
        assert!(throttle.should_log("toolkit_timeout"));
        assert!(throttle.should_log("portal_timeout"));
        assert!(!throttle.should_log("toolkit_timeout"));
    }

    #[test]
    fn test_logs_again_after_cooldown() {
        let throttle = WarningThrottle::new(Duration::from_millis(50));
        assert!(throttle.should_log("flapping"));
        assert!(!throttle.should_log("flapping"));

        std::thread::sleep(Duration::from_millis(120));
        assert!(throttle.should_log("flapping"));
    }
}
