// src/simulator/axis.rs - Virtual tower and tilt axes
use async_trait::async_trait;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::{SimEvent, SimState};
use crate::errors::AxisError;
use crate::hardware::{Axis, ProfileSet};
use crate::project::LayerProfile;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisKind {
    Tower,
    Tilt,
}

#[derive(Debug)]
struct AxisPosition {
    position: i64,
    profile: String,
    synced: bool,
}

/// An axis that moves instantly, apart from a configurable settle time,
/// and fails on demand.
pub struct VirtualAxis {
    kind: AxisKind,
    profiles: ProfileSet,
    position: Mutex<AxisPosition>,
    sim: Arc<Mutex<SimState>>,
    move_time: Duration,
}

impl VirtualAxis {
    pub(crate) fn new(kind: AxisKind, profiles: ProfileSet, sim: Arc<Mutex<SimState>>, move_time: Duration) -> Self {
        Self {
            kind,
            profiles,
            position: Mutex::new(AxisPosition {
                position: 0,
                profile: "homingFast".to_string(),
                synced: false,
            }),
            sim,
            move_time,
        }
    }

    fn pos(&self) -> MutexGuard<'_, AxisPosition> {
        self.position.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sim(&self) -> MutexGuard<'_, SimState> {
        self.sim.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn move_failed(&self) -> AxisError {
        match self.kind {
            AxisKind::Tower => AxisError::TowerMoveFailed,
            AxisKind::Tilt => AxisError::TiltMoveFailed,
        }
    }

    fn home_failed(&self) -> AxisError {
        match self.kind {
            AxisKind::Tower => AxisError::TowerHomeFailed,
            AxisKind::Tilt => AxisError::TiltHomeFailed,
        }
    }

    async fn settle(&self) {
        if self.move_time.is_zero() {
            tokio::task::yield_now().await;
        } else {
            tokio::time::sleep(self.move_time).await;
        }
    }

    pub fn set_synced(&self, synced: bool) {
        self.pos().synced = synced;
    }
}

#[async_trait]
impl Axis for VirtualAxis {
    fn name(&self) -> &str {
        match self.kind {
            AxisKind::Tower => "tower",
            AxisKind::Tilt => "tilt",
        }
    }

    fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }

    fn actual_profile(&self) -> String {
        self.pos().profile.clone()
    }

    fn set_actual_profile(&self, name: &str) -> Result<(), AxisError> {
        self.profiles.get(name)?;
        self.pos().profile = name.to_string();
        Ok(())
    }

    fn synced(&self) -> bool {
        self.pos().synced
    }

    fn position(&self) -> i64 {
        self.pos().position
    }

    async fn move_to(&self, position: i64) -> Result<(), AxisError> {
        let fail = self.kind == AxisKind::Tower && self.sim().faults.tower_move_fails;
        if fail {
            return Err(self.move_failed());
        }
        self.pos().position = position;
        if self.kind == AxisKind::Tower {
            self.sim().record(SimEvent::TowerMove(position));
        }
        self.settle().await;
        Ok(())
    }

    async fn move_and_wait(&self, position: i64, retries: u32) -> Result<(), AxisError> {
        let mut attempt = 0;
        loop {
            match self.move_to(position).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < retries => {
                    attempt += 1;
                    tracing::warn!("{} move attempt {} failed: {}", self.name(), attempt, e);
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sync_and_wait(&self, retries: u32) -> Result<(), AxisError> {
        for attempt in 0..=retries {
            let fail = {
                let mut sim = self.sim();
                let failures = match self.kind {
                    AxisKind::Tower => &mut sim.faults.tower_home_failures,
                    AxisKind::Tilt => &mut sim.faults.tilt_home_failures,
                };
                if *failures > 0 {
                    *failures -= 1;
                    true
                } else {
                    false
                }
            };
            self.settle().await;
            if !fail {
                let mut pos = self.pos();
                pos.position = 0;
                pos.synced = true;
                return Ok(());
            }
            tracing::warn!("{} homing attempt {} failed", self.name(), attempt + 1);
        }
        self.pos().synced = false;
        Err(self.home_failed())
    }

    async fn wait_to_stop(&self) -> Result<(), AxisError> {
        self.settle().await;
        Ok(())
    }

    async fn release(&self) -> Result<(), AxisError> {
        self.pos().synced = false;
        if self.kind == AxisKind::Tilt {
            self.sim().record(SimEvent::TiltReleased);
        }
        Ok(())
    }

    async fn layer_peel_moves(
        &self,
        profile: &LayerProfile,
        target_position_nm: i64,
        last_layer: bool,
    ) -> Result<(), AxisError> {
        let stuck = {
            let mut sim = self.sim();
            sim.record(SimEvent::Peel {
                profile: profile.clone(),
                target_nm: target_position_nm,
                last_layer,
            });
            if sim.faults.peel_failures > 0 {
                sim.faults.peel_failures -= 1;
                true
            } else {
                false
            }
        };
        self.settle().await;
        if stuck {
            self.pos().synced = false;
            return Err(AxisError::TiltHomeFailed);
        }
        Ok(())
    }

    async fn stir_resin(&self, _profile: &LayerProfile) -> Result<(), AxisError> {
        if !self.synced() {
            return Err(AxisError::TiltHomeFailed);
        }
        self.sim().record(SimEvent::Stir);
        self.settle().await;
        Ok(())
    }

    async fn layer_down_wait(&self, _profile: &LayerProfile) -> Result<(), AxisError> {
        if !self.synced() {
            return Err(AxisError::TiltHomeFailed);
        }
        self.sim().record(SimEvent::TiltLayerDown);
        self.settle().await;
        Ok(())
    }
}
