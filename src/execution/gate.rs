//! Environment Gates
//!
//! Models deployment-environment approval as a suspend/resume barrier.
//! A gate opens for review when a referencing job instance first becomes
//! otherwise eligible to run; the instance stays blocked until the
//! configured approval quorum is met. Rejection is terminal and turns
//! into cancellation, not an error.

use std::collections::{HashMap, HashSet};

use log::{debug, info, warn};

use crate::workflow::model::{branch_matches, EnvironmentSpec, EventContext, WorkflowDefinition};

/// Reviewer decision delivered over the approval boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Approved,
    Rejected,
}

/// One inbound approval event: `{gate, decision, reviewer}`.
#[derive(Debug, Clone)]
pub struct ApprovalSignal {
    /// Gate (environment) name
    pub gate: String,
    /// The reviewer's verdict
    pub decision: Decision,
    /// Who reviewed
    pub reviewer: String,
}

/// Gate lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// No referencing instance has become eligible yet
    Idle,
    /// Waiting for the approval quorum
    AwaitingApproval,
    /// Quorum met; referencing instances may run
    Approved,
    /// Terminal; referencing instances are cancelled
    Rejected,
}

/// One environment gate.
#[derive(Debug)]
pub struct Gate {
    name: String,
    spec: EnvironmentSpec,
    state: GateState,
    approved_by: HashSet<String>,
}

impl Gate {
    /// Creates an idle gate from its environment spec.
    pub fn new(name: impl Into<String>, spec: EnvironmentSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            state: GateState::Idle,
            approved_by: HashSet::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> GateState {
        self.state
    }

    /// Opens the gate for review when an instance becomes eligible.
    ///
    /// A branch filter that does not match the run's ref rejects
    /// immediately. Signals recorded before opening count toward the
    /// quorum, so a pre-approved gate opens straight into `Approved`.
    pub fn open(&mut self, event: &EventContext) -> GateState {
        if self.state != GateState::Idle {
            return self.state;
        }

        if !self.spec.branches.is_empty()
            && !self.spec.branches.iter().any(|b| branch_matches(b, event))
        {
            warn!(
                "Gate '{}' rejected: ref '{}' is outside its branch filter",
                self.name, event.ref_name
            );
            self.state = GateState::Rejected;
            return self.state;
        }

        self.state = if self.approved_by.len() >= self.spec.approvals {
            GateState::Approved
        } else {
            info!(
                "Gate '{}' awaiting approval ({}/{})",
                self.name,
                self.approved_by.len(),
                self.spec.approvals
            );
            GateState::AwaitingApproval
        };
        self.state
    }

    /// Records a reviewer decision.
    ///
    /// Reviewers outside the configured set are ignored; a duplicate
    /// approval from the same reviewer does not count twice; a single
    /// rejection is terminal.
    pub fn record(&mut self, signal: &ApprovalSignal) -> GateState {
        if matches!(self.state, GateState::Approved | GateState::Rejected) {
            debug!("Gate '{}' already settled; signal ignored", self.name);
            return self.state;
        }

        if !self.spec.reviewers.is_empty() && !self.spec.reviewers.contains(&signal.reviewer) {
            warn!(
                "Gate '{}': '{}' is not a configured reviewer; signal ignored",
                self.name, signal.reviewer
            );
            return self.state;
        }

        match signal.decision {
            Decision::Rejected => {
                info!("Gate '{}' rejected by '{}'", self.name, signal.reviewer);
                self.state = GateState::Rejected;
            }
            Decision::Approved => {
                self.approved_by.insert(signal.reviewer.clone());
                debug!(
                    "Gate '{}' approval {}/{} ('{}')",
                    self.name,
                    self.approved_by.len(),
                    self.spec.approvals,
                    signal.reviewer
                );
                if self.state == GateState::AwaitingApproval
                    && self.approved_by.len() >= self.spec.approvals
                {
                    info!("Gate '{}' approved", self.name);
                    self.state = GateState::Approved;
                }
            }
        }
        self.state
    }
}

/// All gates of one run, keyed by environment name.
#[derive(Debug, Default)]
pub struct GateRegistry {
    gates: HashMap<String, Gate>,
}

impl GateRegistry {
    /// Builds the registry from a definition's environments.
    pub fn from_definition(def: &WorkflowDefinition) -> Self {
        let gates = def
            .environments
            .iter()
            .map(|(name, spec)| (name.clone(), Gate::new(name.clone(), spec.clone())))
            .collect();
        Self { gates }
    }

    /// Opens a gate, creating a permissive one if the definition never
    /// declared it (the validator normally prevents that).
    pub fn open(&mut self, name: &str, event: &EventContext) -> GateState {
        self.gates
            .entry(name.to_string())
            .or_insert_with(|| {
                warn!("Gate '{}' was not declared; treating as unreviewed", name);
                Gate::new(name, EnvironmentSpec::default())
            })
            .open(event)
    }

    /// Routes a signal to its gate. Returns the gate's state, or None
    /// for a signal naming an unknown gate.
    pub fn record(&mut self, signal: &ApprovalSignal) -> Option<GateState> {
        match self.gates.get_mut(&signal.gate) {
            Some(gate) => Some(gate.record(signal)),
            None => {
                warn!("Approval signal for unknown gate '{}'", signal.gate);
                None
            }
        }
    }

    /// Current state of a gate, if declared.
    pub fn state(&self, name: &str) -> Option<GateState> {
        self.gates.get(name).map(Gate::state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(reviewers: &[&str], approvals: usize) -> EnvironmentSpec {
        EnvironmentSpec {
            reviewers: reviewers.iter().map(|s| s.to_string()).collect(),
            approvals,
            branches: Vec::new(),
        }
    }

    fn approve(gate: &str, reviewer: &str) -> ApprovalSignal {
        ApprovalSignal {
            gate: gate.to_string(),
            decision: Decision::Approved,
            reviewer: reviewer.to_string(),
        }
    }

    fn reject(gate: &str, reviewer: &str) -> ApprovalSignal {
        ApprovalSignal {
            gate: gate.to_string(),
            decision: Decision::Rejected,
            reviewer: reviewer.to_string(),
        }
    }

    #[test]
    fn test_open_then_approve() {
        let mut gate = Gate::new("prod", spec(&["alice"], 1));
        assert_eq!(gate.state(), GateState::Idle);

        assert_eq!(gate.open(&EventContext::default()), GateState::AwaitingApproval);
        assert_eq!(gate.record(&approve("prod", "alice")), GateState::Approved);
    }

    #[test]
    fn test_rejection_is_terminal() {
        let mut gate = Gate::new("prod", spec(&["alice", "bob"], 1));
        gate.open(&EventContext::default());

        assert_eq!(gate.record(&reject("prod", "bob")), GateState::Rejected);
        // A later approval cannot revive it.
        assert_eq!(gate.record(&approve("prod", "alice")), GateState::Rejected);
    }

    #[test]
    fn test_quorum_of_two() {
        let mut gate = Gate::new("prod", spec(&["alice", "bob", "carol"], 2));
        gate.open(&EventContext::default());

        assert_eq!(gate.record(&approve("prod", "alice")), GateState::AwaitingApproval);
        // Same reviewer again does not count twice.
        assert_eq!(gate.record(&approve("prod", "alice")), GateState::AwaitingApproval);
        assert_eq!(gate.record(&approve("prod", "bob")), GateState::Approved);
    }

    #[test]
    fn test_unknown_reviewer_ignored() {
        let mut gate = Gate::new("prod", spec(&["alice"], 1));
        gate.open(&EventContext::default());

        assert_eq!(gate.record(&approve("prod", "mallory")), GateState::AwaitingApproval);
        assert_eq!(gate.record(&reject("prod", "mallory")), GateState::AwaitingApproval);
    }

    #[test]
    fn test_anyone_may_review_when_unconfigured() {
        let mut gate = Gate::new("prod", spec(&[], 1));
        gate.open(&EventContext::default());
        assert_eq!(gate.record(&approve("prod", "anyone")), GateState::Approved);
    }

    #[test]
    fn test_pre_approval_counts_at_open() {
        let mut gate = Gate::new("prod", spec(&["alice"], 1));
        gate.record(&approve("prod", "alice"));
        assert_eq!(gate.state(), GateState::Idle);

        assert_eq!(gate.open(&EventContext::default()), GateState::Approved);
    }

    #[test]
    fn test_branch_filter_rejects() {
        let mut gate = Gate::new(
            "prod",
            EnvironmentSpec {
                reviewers: Vec::new(),
                approvals: 1,
                branches: vec!["main".to_string()],
            },
        );

        let feature = EventContext::new("push").with_ref("refs/heads/feature/x");
        assert_eq!(gate.open(&feature), GateState::Rejected);
    }

    #[test]
    fn test_registry_routing() {
        let mut def = WorkflowDefinition::default();
        def.environments
            .insert("prod".to_string(), spec(&["alice"], 1));
        let mut registry = GateRegistry::from_definition(&def);

        assert_eq!(registry.state("prod"), Some(GateState::Idle));
        assert_eq!(
            registry.open("prod", &EventContext::default()),
            GateState::AwaitingApproval
        );
        assert_eq!(
            registry.record(&approve("prod", "alice")),
            Some(GateState::Approved)
        );
        assert!(registry.record(&approve("ghost", "alice")).is_none());
    }

    #[test]
    fn test_registry_undeclared_gate_is_permissive() {
        // An undeclared gate gets a zero-quorum spec and opens approved.
        let mut registry = GateRegistry::default();
        assert_eq!(
            registry.open("adhoc", &EventContext::default()),
            GateState::Approved
        );
    }
}
