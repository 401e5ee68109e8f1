//! Robustness derivation for a volume's replica set.

use holdfast_events::{ReplicaMode, Robustness, VolumeState};

use crate::model::Replica;

/// Derives robustness from the replica set.
///
/// While attached: no healthy RW replica is faulted, a full set of healthy
/// RW replicas with nothing else attached is healthy, anything between is
/// degraded. A detached volume whose every replica has failed is faulted;
/// otherwise robustness is not meaningful while detached.
pub fn derive_robustness(state: VolumeState, replicas: &[Replica], target: u32) -> Robustness {
    match state {
        VolumeState::Attached => {
            let healthy = replicas.iter().filter(|r| r.is_healthy_rw()).count();
            if healthy == 0 {
                Robustness::Faulted
            } else if healthy >= target as usize
                && replicas.iter().all(|r| r.mode == Some(ReplicaMode::ReadWrite))
            {
                Robustness::Healthy
            } else {
                Robustness::Degraded
            }
        }
        VolumeState::Detached => {
            if !replicas.is_empty() && replicas.iter().all(Replica::is_failed) {
                Robustness::Faulted
            } else {
                Robustness::Unknown
            }
        }
        _ => Robustness::Unknown,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::test_replica;
    use chrono::Utc;
    use proptest::prelude::*;
    use rstest::rstest;

    fn replicas(modes: &[Option<ReplicaMode>]) -> Vec<Replica> {
        modes
            .iter()
            .enumerate()
            .map(|(i, mode)| {
                let mut r = test_replica(&format!("node-{i}"));
                r.mode = *mode;
                if *mode == Some(ReplicaMode::Error) {
                    r.mark_failed(Utc::now());
                }
                r
            })
            .collect()
    }

    const RW: Option<ReplicaMode> = Some(ReplicaMode::ReadWrite);
    const WO: Option<ReplicaMode> = Some(ReplicaMode::WriteOnly);
    const ERR: Option<ReplicaMode> = Some(ReplicaMode::Error);

    #[rstest]
    #[case(&[RW, RW, RW], 3, Robustness::Healthy)]
    #[case(&[RW, RW], 3, Robustness::Degraded)]
    #[case(&[RW, RW, WO], 3, Robustness::Degraded)]
    #[case(&[RW, ERR, ERR], 3, Robustness::Degraded)]
    #[case(&[ERR, ERR, ERR], 3, Robustness::Faulted)]
    #[case(&[WO], 1, Robustness::Faulted)]
    #[case(&[], 3, Robustness::Faulted)]
    fn test_attached_robustness(
        #[case] modes: &[Option<ReplicaMode>],
        #[case] target: u32,
        #[case] expected: Robustness,
    ) {
        assert_eq!(
            derive_robustness(VolumeState::Attached, &replicas(modes), target),
            expected
        );
    }

    #[test]
    fn test_detached_robustness() {
        assert_eq!(
            derive_robustness(VolumeState::Detached, &replicas(&[ERR, ERR]), 2),
            Robustness::Faulted
        );
        assert_eq!(
            derive_robustness(VolumeState::Detached, &replicas(&[ERR, None]), 2),
            Robustness::Unknown
        );
        assert_eq!(
            derive_robustness(VolumeState::Detached, &[], 2),
            Robustness::Unknown
        );
        assert_eq!(
            derive_robustness(VolumeState::Attaching, &replicas(&[RW]), 1),
            Robustness::Unknown
        );
    }

    fn mode() -> impl Strategy<Value = Option<ReplicaMode>> {
        prop_oneof![Just(RW), Just(WO), Just(ERR), Just(None)]
    }

    proptest! {
        #[test]
        fn prop_healthy_implies_all_rw(
            modes in proptest::collection::vec(mode(), 0..6),
            target in 1u32..5,
        ) {
            let set = replicas(&modes);
            if derive_robustness(VolumeState::Attached, &set, target) == Robustness::Healthy {
                prop_assert!(set.iter().all(|r| r.mode == Some(ReplicaMode::ReadWrite)));
                prop_assert!(set.len() >= target as usize);
            }
        }
    }
}
