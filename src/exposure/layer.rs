// src/exposure/layer.rs - Area-fill driven selection of the peel profile
use crate::project::{ExposureProfile, LayerProfile};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProfileChoice {
    BelowAreaFill,
    AboveAreaFill,
}

impl ProfileChoice {
    pub fn profile(self, profiles: &ExposureProfile) -> &LayerProfile {
        match self {
            ProfileChoice::BelowAreaFill => &profiles.below_area_fill,
            ProfileChoice::AboveAreaFill => &profiles.above_area_fill,
        }
    }

    pub fn is_slow(self) -> bool {
        self == ProfileChoice::AboveAreaFill
    }
}

/// Lit area of a frame in percent, unrounded.
pub fn area_fill_percent(white_pixels: u64, pixels_per_percent: f64) -> f64 {
    white_pixels as f64 / pixels_per_percent
}

/// Picks the slow profile after large frames and keeps it for a configured
/// height, and always for the first slow layers.
#[derive(Debug, Clone)]
pub struct FillTracker {
    area_fill: u32,
    force_slow_height_nm: i64,
    first_slow_layers: usize,
    large_fill_remain_nm: i64,
}

impl FillTracker {
    pub fn new(area_fill: u32, force_slow_height_nm: i64, first_slow_layers: usize) -> Self {
        Self {
            area_fill,
            force_slow_height_nm,
            first_slow_layers,
            large_fill_remain_nm: 0,
        }
    }

    pub fn large_fill_remain_nm(&self) -> i64 {
        self.large_fill_remain_nm
    }

    pub fn select(&mut self, current_area_fill: f64, actual_layer: usize, layer_height_nm: i64) -> ProfileChoice {
        let mut large = current_area_fill > f64::from(self.area_fill);
        if large {
            self.large_fill_remain_nm = self.force_slow_height_nm;
        } else if self.large_fill_remain_nm > 0 {
            self.large_fill_remain_nm -= layer_height_nm;
            large = true;
        }
        if actual_layer < self.first_slow_layers {
            large = true;
        }
        if large {
            ProfileChoice::AboveAreaFill
        } else {
            ProfileChoice::BelowAreaFill
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_slow_layers() {
        let mut tracker = FillTracker::new(45, 0, 13);
        for layer in 0..13 {
            assert_eq!(tracker.select(0.0, layer, 50_000), ProfileChoice::AboveAreaFill);
        }
        assert_eq!(tracker.select(0.0, 13, 50_000), ProfileChoice::BelowAreaFill);
        assert_eq!(tracker.select(46.0, 14, 50_000), ProfileChoice::AboveAreaFill);
        assert_eq!(tracker.select(45.0, 15, 50_000), ProfileChoice::BelowAreaFill);
    }

    #[test]
    fn test_force_slow_height_window() {
        let mut tracker = FillTracker::new(45, 150_000, 0);
        assert_eq!(tracker.select(80.0, 20, 50_000), ProfileChoice::AboveAreaFill);
        assert_eq!(tracker.large_fill_remain_nm(), 150_000);
        // Three small layers still use the slow profile
        for layer in 21..24 {
            assert_eq!(tracker.select(5.0, layer, 50_000), ProfileChoice::AboveAreaFill);
        }
        assert_eq!(tracker.large_fill_remain_nm(), 0);
        assert_eq!(tracker.select(5.0, 24, 50_000), ProfileChoice::BelowAreaFill);
        // A large layer resets the window
        tracker.select(5.0, 25, 50_000);
        assert_eq!(tracker.select(50.0, 26, 50_000), ProfileChoice::AboveAreaFill);
        assert_eq!(tracker.large_fill_remain_nm(), 150_000);
    }

    #[test]
    fn test_area_fill_percent() {
        assert_eq!(area_fill_percent(0, 36_864.0), 0.0);
        assert_eq!(area_fill_percent(36_864 * 50, 36_864.0), 50.0);
        assert!(ProfileChoice::AboveAreaFill.is_slow());
        let profiles = ExposureProfile::default();
        assert_eq!(ProfileChoice::BelowAreaFill.profile(&profiles), &profiles.below_area_fill);
    }

    #[test]
    fn test_fractional_fill_exceeds_threshold() {
        let fill = area_fill_percent(36_864 * 91 / 2, 36_864.0);
        assert_eq!(fill, 45.5);
        let mut tracker = FillTracker::new(45, 0, 0);
        assert_eq!(tracker.select(fill, 50, 50_000), ProfileChoice::AboveAreaFill);
        assert_eq!(tracker.select(45.0, 51, 50_000), ProfileChoice::BelowAreaFill);
    }
}
