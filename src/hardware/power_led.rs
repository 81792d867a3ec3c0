// src/hardware/power_led.rs - Reference-counted warning/error indicator
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerLedMode {
    Normal,
    Warning,
    Error,
}

/// Power button LED. Warning and error scopes nest, the LED returns to
/// normal only once every scope has been left.
#[derive(Debug, Default)]
pub struct PowerLed {
    warnings: AtomicUsize,
    errors: AtomicUsize,
}

impl PowerLed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> PowerLedMode {
        if self.errors.load(Ordering::SeqCst) > 0 {
            PowerLedMode::Error
        } else if self.warnings.load(Ordering::SeqCst) > 0 {
            PowerLedMode::Warning
        } else {
            PowerLedMode::Normal
        }
    }

    pub fn warning_scope(self: &Arc<Self>) -> IndicatorGuard {
        self.warnings.fetch_add(1, Ordering::SeqCst);
        IndicatorGuard { led: Arc::clone(self), error: false }
    }

    pub fn error_scope(self: &Arc<Self>) -> IndicatorGuard {
        self.errors.fetch_add(1, Ordering::SeqCst);
        IndicatorGuard { led: Arc::clone(self), error: true }
    }
}

/// Leaves the warning or error scope when dropped.
#[derive(Debug)]
pub struct IndicatorGuard {
    led: Arc<PowerLed>,
    error: bool,
}

impl Drop for IndicatorGuard {
    fn drop(&mut self) {
        let counter = if self.error { &self.led.errors } else { &self.led.warnings };
        counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_scopes() {
        let led = Arc::new(PowerLed::new());
        assert_eq!(led.mode(), PowerLedMode::Normal);
        let outer = led.warning_scope();
        let inner = led.warning_scope();
        drop(outer);
        assert_eq!(led.mode(), PowerLedMode::Warning);
        let err = led.error_scope();
        assert_eq!(led.mode(), PowerLedMode::Error);
        drop(err);
        assert_eq!(led.mode(), PowerLedMode::Warning);
        drop(inner);
        assert_eq!(led.mode(), PowerLedMode::Normal);
    }
}
