// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Migration phase state and routing.
//!
//! The phase decides which store is authoritative (serves reads and takes the
//! synchronous write) and which one, if any, receives asynchronous replication:
//!
//! ```text
//! Phase                    authoritative   replica
//! ─────────────────────────────────────────────────
//! PrimaryOnly              legacy          -
//! DualWritePrimaryRead     legacy          target
//! DualWriteSecondaryRead   target          legacy
//! SecondaryOnly            target          -
//! ```
//!
//! Phases only move forward, one step at a time. The two cutover steps are
//! gated on the health of replication: no dead-lettered sync items and a full
//! reconciliation pass completed in the current phase before reads move to
//! the target, and additionally no unresolved discrepancies before the legacy
//! store is dropped.
//!
//! Every accepted transition bumps the phase generation. Reconciliation
//! evidence is tagged with the generation it was gathered in, so a pass from
//! an earlier phase never opens a later gate.

use std::fmt;
use std::str::FromStr;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MigrationPhase {
    #[default]
    PrimaryOnly,
    DualWritePrimaryRead,
    DualWriteSecondaryRead,
    SecondaryOnly,
}

impl MigrationPhase {
    pub const ALL: [MigrationPhase; 4] = [
        Self::PrimaryOnly,
        Self::DualWritePrimaryRead,
        Self::DualWriteSecondaryRead,
        Self::SecondaryOnly,
    ];

    #[must_use]
    pub fn ordinal(self) -> u8 {
        self as u8
    }

    /// The only phase this one may advance to
    #[must_use]
    pub fn next(self) -> Option<Self> {
        Self::ALL.get(self.ordinal() as usize + 1).copied()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PrimaryOnly => "PrimaryOnly",
            Self::DualWritePrimaryRead => "DualWritePrimaryRead",
            Self::DualWriteSecondaryRead => "DualWriteSecondaryRead",
            Self::SecondaryOnly => "SecondaryOnly",
        }
    }

    #[must_use]
    pub fn read_target(self) -> StoreRole {
        self.write_targets().authoritative
    }

    #[must_use]
    pub fn write_targets(self) -> WriteTargets {
        let (authoritative, replica) = match self {
            Self::PrimaryOnly => (StoreRole::Legacy, None),
            Self::DualWritePrimaryRead => (StoreRole::Legacy, Some(StoreRole::Target)),
            Self::DualWriteSecondaryRead => (StoreRole::Target, Some(StoreRole::Legacy)),
            Self::SecondaryOnly => (StoreRole::Target, None),
        };
        WriteTargets {
            authoritative,
            replica,
        }
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationPhase {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| EngineError::Config(format!("unknown migration phase '{}'", s)))
    }
}

/// Which of the two stores a call addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreRole {
    Legacy,
    Target,
}

impl StoreRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Target => "target",
        }
    }

    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::Legacy => Self::Target,
            Self::Target => Self::Legacy,
        }
    }
}

impl fmt::Display for StoreRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StoreRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "legacy" => Ok(Self::Legacy),
            "target" => Ok(Self::Target),
            other => Err(format!("unknown store role '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteTargets {
    /// Takes the synchronous write
    pub authoritative: StoreRole,
    /// Receives the write through the sync queue
    pub replica: Option<StoreRole>,
}

/// Thresholds for the two cutover transitions
#[derive(Debug, Clone, Copy, Default)]
pub struct CutoverGates {
    pub max_dead_lettered: usize,
    pub max_unresolved_discrepancies: usize,
}

/// Replication health observed just before a transition
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CutoverChecks {
    pub dead_lettered: usize,
    pub unresolved_discrepancies: usize,
    /// Phase generation in which the last full reconciliation pass ran from
    /// start to finish
    pub reconciled_generation: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
struct PhaseState {
    phase: MigrationPhase,
    generation: u64,
}

/// Holds the active phase. Shared by `Arc`; every read goes through the lock.
#[derive(Debug)]
pub struct MigrationPhaseManager {
    current: RwLock<PhaseState>,
    tx: watch::Sender<MigrationPhase>,
    gates: CutoverGates,
}

impl MigrationPhaseManager {
    #[must_use]
    pub fn new(initial: MigrationPhase, gates: CutoverGates) -> Self {
        let (tx, _rx) = watch::channel(initial);
        crate::metrics::set_migration_phase(initial);
        Self {
            current: RwLock::new(PhaseState {
                phase: initial,
                generation: 0,
            }),
            tx,
            gates,
        }
    }

    #[must_use]
    pub fn current(&self) -> MigrationPhase {
        self.current.read().phase
    }

    /// Number of accepted transitions so far
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.current.read().generation
    }

    #[must_use]
    pub fn read_target(&self) -> StoreRole {
        self.current().read_target()
    }

    #[must_use]
    pub fn write_targets(&self) -> WriteTargets {
        self.current().write_targets()
    }

    /// Receiver that observes every accepted transition
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<MigrationPhase> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn gates(&self) -> CutoverGates {
        self.gates
    }

    /// Move to `to`. Returns `Ok(false)` when `to` is already active.
    pub fn set_phase(&self, to: MigrationPhase, checks: &CutoverChecks) -> Result<bool, EngineError> {
        let mut current = self.current.write();
        let from = current.phase;
        if from == to {
            return Ok(false);
        }

        if let Err(reason) = self.check_transition(*current, to, checks) {
            warn!(%from, %to, %reason, "Phase transition rejected");
            crate::metrics::record_phase_transition(from, to, false);
            return Err(EngineError::PhaseTransitionRejected { from, to, reason });
        }

        current.phase = to;
        current.generation += 1;
        self.tx.send_replace(to);
        drop(current);

        info!(%from, %to, "Migration phase changed");
        crate::metrics::record_phase_transition(from, to, true);
        crate::metrics::set_migration_phase(to);
        Ok(true)
    }

    fn check_transition(&self, state: PhaseState, to: MigrationPhase, checks: &CutoverChecks) -> Result<(), String> {
        let from = state.phase;
        if to.ordinal() < from.ordinal() {
            return Err("phases only move forward".into());
        }
        if from.next() != Some(to) {
            return Err(format!(
                "must advance one phase at a time (next is {})",
                from.next().map_or("none", MigrationPhase::as_str)
            ));
        }

        if !matches!(to, MigrationPhase::DualWriteSecondaryRead | MigrationPhase::SecondaryOnly) {
            return Ok(());
        }
        if checks.dead_lettered > self.gates.max_dead_lettered {
            return Err(format!(
                "{} dead-lettered sync items (allowed: {})",
                checks.dead_lettered, self.gates.max_dead_lettered
            ));
        }
        if checks.reconciled_generation != Some(state.generation) {
            return Err(format!("no full reconciliation pass has completed since {} began", from));
        }
        if to == MigrationPhase::SecondaryOnly
            && checks.unresolved_discrepancies > self.gates.max_unresolved_discrepancies
        {
            return Err(format!(
                "{} unresolved reconciliation discrepancies (allowed: {})",
                checks.unresolved_discrepancies, self.gates.max_unresolved_discrepancies
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager(initial: MigrationPhase) -> MigrationPhaseManager {
        MigrationPhaseManager::new(initial, CutoverGates::default())
    }

    /// Healthy replication with a full pass in the manager's current phase
    fn clean(m: &MigrationPhaseManager) -> CutoverChecks {
        CutoverChecks {
            reconciled_generation: Some(m.generation()),
            ..CutoverChecks::default()
        }
    }

    #[test]
    fn test_routing_table() {
        use MigrationPhase::*;
        use StoreRole::*;

        let expected = [
            (PrimaryOnly, Legacy, None),
            (DualWritePrimaryRead, Legacy, Some(Target)),
            (DualWriteSecondaryRead, Target, Some(Legacy)),
            (SecondaryOnly, Target, None),
        ];
        for (phase, authoritative, replica) in expected {
            let targets = phase.write_targets();
            assert_eq!(targets.authoritative, authoritative, "{}", phase);
            assert_eq!(targets.replica, replica, "{}", phase);
            assert_eq!(phase.read_target(), authoritative);
        }
    }

    #[test]
    fn test_forward_one_step_at_a_time() {
        let m = manager(MigrationPhase::PrimaryOnly);
        for (n, phase) in MigrationPhase::ALL[1..].iter().enumerate() {
            assert!(m.set_phase(*phase, &clean(&m)).unwrap());
            assert_eq!(m.current(), *phase);
            assert_eq!(m.generation(), n as u64 + 1);
        }
    }

    #[test]
    fn test_resetting_current_phase_is_noop() {
        let m = manager(MigrationPhase::DualWritePrimaryRead);
        assert!(!m.set_phase(MigrationPhase::DualWritePrimaryRead, &clean(&m)).unwrap());
        assert_eq!(m.generation(), 0);
    }

    #[test]
    fn test_skipping_is_rejected() {
        let m = manager(MigrationPhase::PrimaryOnly);
        let err = m.set_phase(MigrationPhase::SecondaryOnly, &clean(&m)).unwrap_err();

        match err {
            EngineError::PhaseTransitionRejected { from, to, reason } => {
                assert_eq!(from, MigrationPhase::PrimaryOnly);
                assert_eq!(to, MigrationPhase::SecondaryOnly);
                assert!(reason.contains("DualWritePrimaryRead"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(m.current(), MigrationPhase::PrimaryOnly);
    }

    #[test]
    fn test_moving_backwards_is_rejected() {
        let m = manager(MigrationPhase::DualWriteSecondaryRead);
        let err = m.set_phase(MigrationPhase::DualWritePrimaryRead, &clean(&m)).unwrap_err();
        assert!(err.to_string().contains("only move forward"));
        assert_eq!(m.current(), MigrationPhase::DualWriteSecondaryRead);
    }

    #[test]
    fn test_dead_letters_block_read_cutover() {
        let m = manager(MigrationPhase::DualWritePrimaryRead);
        let checks = CutoverChecks {
            dead_lettered: 1,
            ..clean(&m)
        };

        let err = m.set_phase(MigrationPhase::DualWriteSecondaryRead, &checks).unwrap_err();
        assert!(err.to_string().contains("dead-lettered"));
        assert_eq!(m.current(), MigrationPhase::DualWritePrimaryRead);
    }

    #[test]
    fn test_read_cutovers_need_a_pass_in_the_current_phase() {
        let m = manager(MigrationPhase::DualWritePrimaryRead);

        let never = CutoverChecks::default();
        let err = m.set_phase(MigrationPhase::DualWriteSecondaryRead, &never).unwrap_err();
        assert!(err.to_string().contains("reconciliation pass"));

        let earlier = clean(&m);
        assert!(m.set_phase(MigrationPhase::DualWriteSecondaryRead, &earlier).unwrap());

        // The pass from the previous phase no longer counts
        assert!(m.set_phase(MigrationPhase::SecondaryOnly, &earlier).is_err());
        assert_eq!(m.current(), MigrationPhase::DualWriteSecondaryRead);
        assert!(m.set_phase(MigrationPhase::SecondaryOnly, &clean(&m)).unwrap());
    }

    #[test]
    fn test_discrepancies_block_final_cutover_within_gate() {
        let gates = CutoverGates {
            max_dead_lettered: 0,
            max_unresolved_discrepancies: 2,
        };
        let m = MigrationPhaseManager::new(MigrationPhase::DualWriteSecondaryRead, gates);

        let over = CutoverChecks {
            unresolved_discrepancies: 3,
            ..clean(&m)
        };
        assert!(m.set_phase(MigrationPhase::SecondaryOnly, &over).is_err());

        let within = CutoverChecks {
            unresolved_discrepancies: 2,
            ..clean(&m)
        };
        assert!(m.set_phase(MigrationPhase::SecondaryOnly, &within).unwrap());
    }

    #[test]
    fn test_first_dual_write_step_is_ungated() {
        let m = manager(MigrationPhase::PrimaryOnly);
        let unhealthy = CutoverChecks {
            dead_lettered: 100,
            unresolved_discrepancies: 100,
            reconciled_generation: None,
        };
        assert!(m.set_phase(MigrationPhase::DualWritePrimaryRead, &unhealthy).unwrap());
    }

    #[tokio::test]
    async fn test_transitions_are_broadcast() {
        let m = manager(MigrationPhase::PrimaryOnly);
        let mut rx = m.subscribe();

        m.set_phase(MigrationPhase::DualWritePrimaryRead, &clean(&m)).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), MigrationPhase::DualWritePrimaryRead);
    }

    #[test]
    fn test_parse_phase() {
        assert_eq!("dualwriteprimaryread".parse::<MigrationPhase>().unwrap(), MigrationPhase::DualWritePrimaryRead);
        assert!("Sideways".parse::<MigrationPhase>().is_err());
        assert_eq!(serde_json::to_string(&MigrationPhase::SecondaryOnly).unwrap(), "\"SecondaryOnly\"");
        assert_eq!(serde_json::to_string(&StoreRole::Legacy).unwrap(), "\"legacy\"");
    }
}
