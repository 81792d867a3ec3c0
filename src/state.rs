// src/state.rs - Exposure lifecycle states and pre-print check identifiers
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one exposure job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExposureState {
    Init,
    ReadingProject,
    Confirm,
    PourInResin,
    HomingAxis,
    Checks,
    Printing,
    GoingUp,
    GoingDown,
    Waiting,
    CoverOpen,
    Stirring,
    FeedMe,
    PendingAction,
    Stuck,
    StuckRecovery,
    CoolingDown,
    CheckWarning,
    Finished,
    Canceled,
    Failure,
    Done,
}

/// Transient states entered from `Printing` (and, for the cover and warning
/// states, from `Checks`). They may hand over to each other.
const PRINT_SUBSTATES: &[ExposureState] = &[
    ExposureState::GoingUp,
    ExposureState::GoingDown,
    ExposureState::Waiting,
    ExposureState::CoverOpen,
    ExposureState::Stirring,
    ExposureState::FeedMe,
    ExposureState::PendingAction,
    ExposureState::Stuck,
    ExposureState::StuckRecovery,
    ExposureState::CoolingDown,
    ExposureState::CheckWarning,
];

impl ExposureState {
    pub const ALL: [ExposureState; 22] = [
        ExposureState::Init,
        ExposureState::ReadingProject,
        ExposureState::Confirm,
        ExposureState::PourInResin,
        ExposureState::HomingAxis,
        ExposureState::Checks,
        ExposureState::Printing,
        ExposureState::GoingUp,
        ExposureState::GoingDown,
        ExposureState::Waiting,
        ExposureState::CoverOpen,
        ExposureState::Stirring,
        ExposureState::FeedMe,
        ExposureState::PendingAction,
        ExposureState::Stuck,
        ExposureState::StuckRecovery,
        ExposureState::CoolingDown,
        ExposureState::CheckWarning,
        ExposureState::Finished,
        ExposureState::Canceled,
        ExposureState::Failure,
        ExposureState::Done,
    ];

    pub fn finished_states() -> &'static [ExposureState] {
        &[
            ExposureState::Failure,
            ExposureState::Canceled,
            ExposureState::Finished,
            ExposureState::Done,
        ]
    }

    pub fn is_finished(self) -> bool {
        Self::finished_states().contains(&self)
    }

    pub fn is_print_substate(self) -> bool {
        PRINT_SUBSTATES.contains(&self)
    }

    /// Every state a job may move to from `self`.
    pub fn successors(self) -> Vec<ExposureState> {
        use ExposureState::*;
        match self {
            Init => vec![ReadingProject, Failure],
            ReadingProject => vec![Confirm, Failure],
            Confirm => vec![HomingAxis, PourInResin, Canceled, Failure, Done],
            HomingAxis => vec![PourInResin, Canceled, Failure],
            PourInResin => vec![Checks, Canceled, Failure],
            Checks => vec![CoverOpen, CheckWarning, Printing, Canceled, Failure],
            Printing => {
                let mut next = PRINT_SUBSTATES.to_vec();
                next.extend([Finished, Canceled, Failure]);
                next
            }
            sub if sub.is_print_substate() => {
                let mut next: Vec<ExposureState> =
                    PRINT_SUBSTATES.iter().copied().filter(|s| *s != sub).collect();
                next.push(Printing);
                if matches!(sub, CoverOpen | CheckWarning) {
                    next.push(Checks);
                }
                next.extend([Canceled, Failure]);
                next
            }
            Finished | Canceled | Failure => vec![Done],
            _ => Vec::new(),
        }
    }

    pub fn can_transition_to(self, next: ExposureState) -> bool {
        self.successors().contains(&next)
    }
}

impl fmt::Display for ExposureState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| format!("{:?}", self));
        f.write_str(&name)
    }
}

/// Pre-print checks in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExposureCheck {
    Temperature,
    Project,
    Fan,
    Cover,
    Resin,
    StartPositions,
    Stirring,
}

impl ExposureCheck {
    pub const ALL: [ExposureCheck; 7] = [
        ExposureCheck::Temperature,
        ExposureCheck::Project,
        ExposureCheck::Fan,
        ExposureCheck::Cover,
        ExposureCheck::Resin,
        ExposureCheck::StartPositions,
        ExposureCheck::Stirring,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExposureCheckResult {
    Scheduled,
    Running,
    Success,
    Failure,
    Warning,
    Disabled,
}
