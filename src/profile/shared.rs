//! Active profile shared between the controller and the running pass.

use super::{Mode, ModeProfile};
use crate::calibration::MeasurementPoint;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Per-index result slots; `None` means unset.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResultSlots {
    /// Measured (normalized) averages
    pub measured: Vec<Option<f64>>,
    /// Reference minus measured
    pub differences: Vec<Option<f64>>,
    /// Sample standard deviations
    pub std_devs: Vec<Option<f64>>,
}

impl ResultSlots {
    fn unset(len: usize) -> Self {
        Self {
            measured: vec![None; len],
            differences: vec![None; len],
            std_devs: vec![None; len],
        }
    }

    /// Whether no slot holds a value.
    pub fn is_unset(&self) -> bool {
        self.measured.iter().all(Option::is_none)
            && self.differences.iter().all(Option::is_none)
            && self.std_devs.iter().all(Option::is_none)
    }

    /// Number of slots holding a measured value.
    pub fn filled(&self) -> usize {
        self.measured.iter().filter(|slot| slot.is_some()).count()
    }

    fn store(&mut self, index: usize, point: &MeasurementPoint) -> bool {
        if index >= self.measured.len() {
            return false;
        }
        self.measured[index] = Some(point.measured_average);
        self.differences[index] = Some(point.difference);
        self.std_devs[index] = Some(point.std_dev);
        true
    }
}

/// Profile and generation captured at the start of a pass.
#[derive(Debug, Clone)]
pub struct ProfileSnapshot {
    /// Copy of the tables
    pub profile: ModeProfile,
    /// Generation the pass writes against
    pub generation: u64,
}

#[derive(Debug)]
struct ProfileState {
    profile: ModeProfile,
    generation: u64,
    results: ResultSlots,
    linearity: ResultSlots,
}

impl ProfileState {
    fn new(profile: ModeProfile, generation: u64) -> Self {
        let results = ResultSlots::unset(profile.len());
        let linearity = ResultSlots::unset(profile.linear_references.len());
        Self {
            profile,
            generation,
            results,
            linearity,
        }
    }
}

/// Handle to the active profile and its result slots.
///
/// Selecting a mode or clearing bumps the generation; a pass only writes
/// slots while the generation it started with is still current, so a mode
/// switch during a run never lands stale values in the new tables.
#[derive(Debug, Clone)]
pub struct SharedProfile {
    state: Arc<RwLock<ProfileState>>,
}

impl SharedProfile {
    /// Share `profile` with all slots unset.
    pub fn new(profile: ModeProfile) -> Self {
        Self {
            state: Arc::new(RwLock::new(ProfileState::new(profile, 0))),
        }
    }

    /// Share the table for `mode`.
    pub fn for_mode(mode: Mode) -> Self {
        Self::new(ModeProfile::for_mode(mode))
    }

    /// Replace the profile with the table for `mode` and reset every slot.
    pub async fn select(&self, mode: Mode) {
        self.replace(ModeProfile::for_mode(mode)).await;
    }

    /// Replace the profile with an arbitrary table and reset every slot.
    pub async fn replace(&self, profile: ModeProfile) {
        let mut state = self.state.write().await;
        let generation = state.generation + 1;
        *state = ProfileState::new(profile, generation);
    }

    /// Reset every slot, keeping the tables.
    pub async fn clear(&self) {
        let mut state = self.state.write().await;
        state.generation += 1;
        state.results = ResultSlots::unset(state.profile.len());
        state.linearity = ResultSlots::unset(state.profile.linear_references.len());
    }

    /// Copy of the current tables and generation.
    pub async fn snapshot(&self) -> ProfileSnapshot {
        let state = self.state.read().await;
        ProfileSnapshot {
            profile: state.profile.clone(),
            generation: state.generation,
        }
    }

    /// Currently selected mode.
    pub async fn mode(&self) -> Mode {
        self.state.read().await.profile.mode
    }

    /// Store a main-table point. Returns `false` when the generation moved on.
    pub async fn record(&self, generation: u64, point: &MeasurementPoint) -> bool {
        let mut state = self.state.write().await;
        state.generation == generation && state.results.store(point.point_index, point)
    }

    /// Store a linearity point. Returns `false` when the generation moved on.
    pub async fn record_linearity(&self, generation: u64, point: &MeasurementPoint) -> bool {
        let mut state = self.state.write().await;
        state.generation == generation && state.linearity.store(point.point_index, point)
    }

    /// Copy of the main result slots.
    pub async fn results(&self) -> ResultSlots {
        self.state.read().await.results.clone()
    }

    /// Copy of the linearity result slots.
    pub async fn linearity_results(&self) -> ResultSlots {
        self.state.read().await.linearity.clone()
    }
}
