//! Records owned by the volume actors and exposed over the API.

mod engine;
mod node;
mod progress;
mod replica;
mod snapshot;
mod volume;

pub use engine::*;
pub use node::*;
pub use progress::*;
pub use replica::*;
pub use snapshot::*;
pub use volume::*;

#[cfg(test)]
pub(crate) use replica::test_replica;

use holdfast_events::{ProgressState, Robustness, VolumeState};
use holdfast_reconcile::ConvergenceStatus;
use serde::{Deserialize, Serialize};

/// Everything one volume actor owns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRecord {
    pub volume: Volume,
    pub engine: Engine,
    /// Second engine while a live migration is in flight.
    pub migration_engine: Option<Engine>,
    pub replicas: Vec<Replica>,
}

impl VolumeRecord {
    pub fn new(volume: Volume) -> Self {
        let engine = Engine::new(volume.size, &volume.current_image);
        Self {
            volume,
            engine,
            migration_engine: None,
            replicas: Vec::new(),
        }
    }

    pub fn replica(&self, name: &str) -> Option<&Replica> {
        self.replicas.iter().find(|r| r.name.to_string() == name)
    }

    pub fn replica_mut(&mut self, name: &str) -> Option<&mut Replica> {
        self.replicas.iter_mut().find(|r| r.name.to_string() == name)
    }

    pub fn healthy_rw_count(&self) -> usize {
        self.replicas.iter().filter(|r| r.is_healthy_rw()).count()
    }

    /// Engines that currently exist, origin first.
    pub fn controllers(&self) -> Vec<Engine> {
        let mut controllers = Vec::with_capacity(2);
        if self.engine.running || self.engine.host_id.is_some() || self.migration_engine.is_none() {
            controllers.push(self.engine.clone());
        }
        if let Some(target) = &self.migration_engine {
            controllers.push(target.clone());
        }
        controllers
    }

    pub fn convergence(&self) -> ConvergenceStatus {
        let volume = &self.volume;
        let board_error = self
            .engine
            .rebuild_status
            .iter()
            .map(|s| s.progress.state)
            .chain(self.engine.restore_status.iter().map(|s| s.progress.state))
            .any(|state| state == ProgressState::Error);

        if volume.robustness == Robustness::Faulted || board_error {
            return ConvergenceStatus::Diverged;
        }
        let busy = self.engine.is_rebuilding()
            || self.engine.is_restoring()
            || self.engine.is_purging()
            || self.migration_engine.is_some()
            || matches!(
                volume.state,
                VolumeState::Attaching | VolumeState::Detaching | VolumeState::Creating
            );
        if busy {
            return ConvergenceStatus::Converging;
        }
        match (volume.state, volume.robustness) {
            (VolumeState::Attached, Robustness::Healthy) | (VolumeState::Detached, _) => {
                ConvergenceStatus::Converged
            }
            (VolumeState::Attached, Robustness::Degraded) => ConvergenceStatus::Converging,
            _ => ConvergenceStatus::Unknown,
        }
    }

    pub fn view(&self) -> VolumeView {
        VolumeView {
            volume: self.volume.clone(),
            controllers: self.controllers(),
            replicas: self.replicas.clone(),
            convergence: self.convergence(),
        }
    }
}

/// Polling surface for one volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeView {
    #[serde(flatten)]
    pub volume: Volume,
    pub controllers: Vec<Engine>,
    pub replicas: Vec<Replica>,
    pub convergence: ConvergenceStatus,
}

impl VolumeView {
    /// The origin engine.
    pub fn engine(&self) -> Option<&Engine> {
        self.controllers.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holdfast_id::VolumeName;

    fn record() -> VolumeRecord {
        let volume = VolumeSpec::new(VolumeName::parse("vol-a").unwrap(), 16 << 20)
            .into_volume(3, "holdfast/engine:v1")
            .unwrap();
        VolumeRecord::new(volume)
    }

    #[test]
    fn test_detached_volume_has_one_controller() {
        let record = record();
        let view = record.view();
        assert_eq!(view.controllers.len(), 1);
        assert!(!view.controllers[0].running);
        assert_eq!(view.convergence, ConvergenceStatus::Converged);
    }

    #[test]
    fn test_migration_shows_both_controllers() {
        let mut record = record();
        record.engine.running = true;
        record.migration_engine = Some(Engine::new(16 << 20, "holdfast/engine:v1"));
        assert_eq!(record.controllers().len(), 2);
        assert_eq!(record.convergence(), ConvergenceStatus::Converging);
    }

    #[test]
    fn test_view_flattens_volume_fields() {
        let json = serde_json::to_value(record().view()).unwrap();
        assert_eq!(json["name"], "vol-a");
        assert_eq!(json["state"], "detached");
        assert!(json["controllers"].is_array());
    }
}
