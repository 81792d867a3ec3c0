// src/exposure/resin.rs - Resin consumption and tank level tracking
use crate::config::ResinConfig;

/// Result of one accounting pass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResinLevel {
    pub remain_ml: f64,
    pub warn: bool,
    pub low: bool,
}

/// Tracks measured volume against the resin used by exposed layers.
#[derive(Debug, Clone)]
pub struct ResinAccountant {
    low_warn_ml: f64,
    feed_wait_ml: f64,
    max_volume_ml: f64,
    /// Tank volume at the last measurement or refill, `None` when untracked.
    volume_ml: Option<f64>,
}

impl ResinAccountant {
    pub fn new(config: &ResinConfig) -> Self {
        Self {
            low_warn_ml: config.low_warn_ml,
            feed_wait_ml: config.feed_wait_ml,
            max_volume_ml: config.max_volume_ml,
            volume_ml: None,
        }
    }

    /// Start tracking from a fresh measurement. Resin already used in this
    /// job is added back so `remain = volume - count` stays consistent.
    pub fn set_measured(&mut self, measured_ml: f64, resin_count_ml: f64) -> f64 {
        let volume = measured_ml + resin_count_ml.trunc();
        self.volume_ml = Some(volume);
        volume
    }

    /// The tank was filled up to its capacity.
    pub fn refill(&mut self, resin_count_ml: f64) -> f64 {
        let volume = self.max_volume_ml + resin_count_ml;
        self.volume_ml = Some(volume);
        volume
    }

    pub fn update(&self, resin_count_ml: f64) -> Option<ResinLevel> {
        let volume = self.volume_ml?;
        let remain_ml = volume - resin_count_ml;
        Some(ResinLevel {
            remain_ml,
            warn: remain_ml < self.low_warn_ml,
            low: remain_ml < self.feed_wait_ml,
        })
    }
}

/// Volume in ml cured by `white_pixels` lit pixels at the given layer height.
pub fn layer_volume_ml(white_pixels: u64, pixel_size_nm: u64, layer_height_nm: i64) -> f64 {
    white_pixels as f64 * (pixel_size_nm as f64).powi(2) * layer_height_nm as f64 / 1e21
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_untracked_without_measurement() {
        let accountant = ResinAccountant::new(&ResinConfig::default());
        assert_eq!(accountant.update(10.0), None);
    }

    #[test]
    fn test_thresholds() {
        let mut accountant = ResinAccountant::new(&ResinConfig::default());
        accountant.set_measured(100.0, 0.0);
        let level = accountant.update(30.0).unwrap();
        assert_eq!(level, ResinLevel { remain_ml: 70.0, warn: false, low: false });
        let level = accountant.update(45.0).unwrap();
        assert!(level.warn && !level.low);
        let level = accountant.update(55.0).unwrap();
        assert!(level.warn && level.low);
    }

    #[test]
    fn test_refill_resets_remaining_to_capacity() {
        let mut accountant = ResinAccountant::new(&ResinConfig::default());
        accountant.set_measured(80.0, 0.0);
        assert!(accountant.update(35.5).unwrap().low);
        accountant.refill(35.5);
        let level = accountant.update(35.5).unwrap();
        assert_eq!(level.remain_ml, 200.0);
        assert!(!level.warn);
    }

    #[test]
    fn test_layer_volume() {
        // Full 1440x2560 frame at 47 um pixels and 50 um layers
        let ml = layer_volume_ml(1440 * 2560, 47_250, 50_000);
        assert!((ml - 0.411_505_92).abs() < 1e-6, "{ml}");
        assert_eq!(layer_volume_ml(0, 47_250, 50_000), 0.0);
    }
}
