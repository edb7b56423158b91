//! Commit negotiation state machine
//!
//! Pure transition logic: every [`CommitEvent`] yields the commands the
//! driver has to run. Nothing here awaits, so the rules can be tested
//! without a runtime.

use crate::deposit::{Balance, DepositCalculator, DepositTier};
use crate::error::{CommitError, Result};
use crate::canonical::canonical_eq;
use crate::permission::{PermissionKey, PermissionSlot, PermissionTicket, PermissionView, WritePermission};
use crate::prepare::{CommitRequest, PreparedCommit};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tracing::{debug, error, info, warn};

/// Negotiation state of one executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitState {
    Idle,
    Preparing,
    AwaitingDecision,
    AutoSubmitting,
    ManualSubmitting,
    Submitted,
    Failed,
}

impl CommitState {
    /// Preparing or submitting; new triggers are refused
    pub fn is_busy(&self) -> bool {
        matches!(
            self,
            CommitState::Preparing | CommitState::AutoSubmitting | CommitState::ManualSubmitting
        )
    }

    pub fn is_submitting(&self) -> bool {
        matches!(self, CommitState::AutoSubmitting | CommitState::ManualSubmitting)
    }

    /// Accepts a fresh negotiation without carrying over the permission lookup
    fn is_settled(&self) -> bool {
        matches!(self, CommitState::Idle | CommitState::Submitted | CommitState::Failed)
    }
}

impl fmt::Display for CommitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommitState::Idle => "idle",
            CommitState::Preparing => "preparing",
            CommitState::AwaitingDecision => "awaiting_decision",
            CommitState::AutoSubmitting => "auto_submitting",
            CommitState::ManualSubmitting => "manual_submitting",
            CommitState::Submitted => "submitted",
            CommitState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// User decision on a prepared commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Confirmation {
    pub extra_tier: DepositTier,
    /// Let the resource make similar writes without asking again
    pub delegate_future: bool,
}

/// Ledger entry point a submission goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitPath {
    /// Delegated key already holds write permission
    Write,
    /// Grant the delegated key and write, atomically
    WriteWithGrant,
}

/// Permission to persist once a submission lands
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionUpdate {
    pub key: PermissionKey,
    pub permission: WritePermission,
}

/// A write handed to the ledger
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub id: u64,
    pub account_id: String,
    pub path: SubmitPath,
    pub payload: Value,
    pub deposit: Balance,
    pub permission_update: Option<PermissionUpdate>,
}

/// Inputs to the machine
#[derive(Debug, Clone)]
pub enum CommitEvent {
    RequestChanged(CommitRequest),
    Retry,
    Cancel,
    Confirmed(Confirmation),
    PermissionLoaded {
        ticket: PermissionTicket,
        permission: WritePermission,
    },
    Prepared {
        generation: u64,
        outcome: Result<Option<PreparedCommit>>,
    },
    Settled {
        submission: u64,
        outcome: Result<()>,
    },
}

/// Work the driver performs on the machine's behalf
#[derive(Debug, Clone, PartialEq)]
pub enum CommitCommand {
    LoadPermission(PermissionTicket),
    Prepare { generation: u64, request: CommitRequest },
    Submit(Submission),
    NotifyCommitted { diff: Value },
    NotifyFailed { error: CommitError },
    ResetPreparer,
}

#[derive(Debug, Clone)]
struct InFlight {
    id: u64,
    diff: Value,
    permission_update: Option<PermissionUpdate>,
}

/// Observable state of an executor
#[derive(Debug, Clone, PartialEq)]
pub struct CommitSnapshot {
    pub state: CommitState,
    pub request: Option<CommitRequest>,
    pub prepared: Option<PreparedCommit>,
    /// Deposit the prepared commit needs without extra storage
    pub mandatory_deposit: Balance,
    pub permission: PermissionView,
    /// Current default of the "don't ask again" toggle
    pub delegate_future: bool,
    pub last_error: Option<CommitError>,
    /// A submission has not reported back yet
    pub in_flight: bool,
    /// Permission lookups dropped because they were superseded
    pub stale_permission_reads: u64,
}

impl CommitSnapshot {
    /// Waiting on the user to confirm
    pub fn needs_decision(&self) -> bool {
        self.state == CommitState::AwaitingDecision
    }

    /// Not preparing, not submitting, and nothing left in flight
    pub fn is_settled(&self) -> bool {
        !self.state.is_busy() && !self.in_flight
    }
}

/// Commit negotiation state machine
#[derive(Debug)]
pub struct CommitMachine {
    state: CommitState,
    calculator: DepositCalculator,
    request: Option<CommitRequest>,
    prepared: Option<PreparedCommit>,
    permission: PermissionSlot,
    delegate_future: bool,
    prepare_generation: u64,
    next_submission: u64,
    in_flight: Option<InFlight>,
    last_error: Option<CommitError>,
}

impl CommitMachine {
    pub fn new(calculator: DepositCalculator) -> Self {
        Self {
            state: CommitState::Idle,
            calculator,
            request: None,
            prepared: None,
            permission: PermissionSlot::new(),
            delegate_future: false,
            prepare_generation: 0,
            next_submission: 0,
            in_flight: None,
            last_error: None,
        }
    }

    pub fn state(&self) -> CommitState {
        self.state
    }

    pub fn request(&self) -> Option<&CommitRequest> {
        self.request.as_ref()
    }

    pub fn prepared(&self) -> Option<&PreparedCommit> {
        self.prepared.as_ref()
    }

    pub fn permission(&self) -> &PermissionView {
        self.permission.view()
    }

    pub fn last_error(&self) -> Option<&CommitError> {
        self.last_error.as_ref()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight.is_some()
    }

    pub fn snapshot(&self) -> CommitSnapshot {
        CommitSnapshot {
            state: self.state,
            request: self.request.clone(),
            prepared: self.prepared.clone(),
            mandatory_deposit: self
                .prepared
                .as_ref()
                .map(|p| self.calculator.total_deposit(p.deposit_bytes, DepositTier::None))
                .unwrap_or_default(),
            permission: self.permission.view().clone(),
            delegate_future: self.delegate_future,
            last_error: self.last_error.clone(),
            in_flight: self.in_flight.is_some(),
            stale_permission_reads: self.permission.discarded(),
        }
    }

    /// Apply one event
    ///
    /// Errors are refusals: the machine is left exactly as it was.
    pub fn handle(&mut self, event: CommitEvent) -> Result<Vec<CommitCommand>> {
        match event {
            CommitEvent::RequestChanged(request) => self.on_request(request),
            CommitEvent::Retry => self.on_retry(),
            CommitEvent::Cancel => Ok(self.on_cancel()),
            CommitEvent::Confirmed(confirmation) => self.on_confirm(confirmation),
            CommitEvent::PermissionLoaded { ticket, permission } => {
                Ok(self.on_permission(ticket, permission))
            }
            CommitEvent::Prepared { generation, outcome } => Ok(self.on_prepared(generation, outcome)),
            CommitEvent::Settled { submission, outcome } => Ok(self.on_settled(submission, outcome)),
        }
    }

    fn on_request(&mut self, request: CommitRequest) -> Result<Vec<CommitCommand>> {
        if request.account_id.is_none() {
            warn!("Commit request without an account refused");
            return Err(CommitError::NotAuthenticated);
        }
        if self.state.is_busy() {
            warn!(state = %self.state, "Commit request refused while busy");
            return Err(CommitError::Busy(self.state));
        }
        if self.state == CommitState::AwaitingDecision && !request.force {
            if let Some(current) = &self.request {
                if current.same_pair(&request) && canonical_eq(&current.payload, &request.payload) {
                    debug!("Commit request unchanged");
                    return Ok(Vec::new());
                }
            }
        }

        let pair_changed = self
            .request
            .as_ref()
            .map_or(true, |current| !current.same_pair(&request));
        let mut commands = Vec::new();
        if pair_changed || self.state.is_settled() {
            commands.extend(self.refresh_permission(&request));
        }
        self.request = Some(request.clone());
        commands.push(self.start_prepare(request));
        Ok(commands)
    }

    fn on_retry(&mut self) -> Result<Vec<CommitCommand>> {
        if self.state.is_busy() {
            return Err(CommitError::Busy(self.state));
        }
        let request = self.request.clone().ok_or(CommitError::NoRequest)?;
        let mut commands = vec![CommitCommand::ResetPreparer];
        if self.state.is_settled() {
            commands.extend(self.refresh_permission(&request));
        }
        commands.push(self.start_prepare(request));
        Ok(commands)
    }

    fn on_cancel(&mut self) -> Vec<CommitCommand> {
        if self.state != CommitState::Idle {
            info!(state = %self.state, in_flight = self.in_flight.is_some(), "Commit negotiation cancelled");
        }
        self.state = CommitState::Idle;
        self.prepare_generation += 1;
        self.prepared = None;
        vec![CommitCommand::ResetPreparer]
    }

    fn on_confirm(&mut self, confirmation: Confirmation) -> Result<Vec<CommitCommand>> {
        if self.in_flight.is_some() || self.state.is_busy() {
            warn!(state = %self.state, "Confirmation refused while busy");
            return Err(CommitError::Busy(self.state));
        }
        if self.state != CommitState::AwaitingDecision {
            return Err(CommitError::NoPreparedCommit);
        }
        let has_diff = self.prepared.as_ref().is_some_and(PreparedCommit::has_changes);
        if !has_diff {
            return Err(CommitError::NothingToCommit);
        }
        Ok(self
            .submit(
                CommitState::ManualSubmitting,
                confirmation.extra_tier,
                confirmation.delegate_future,
            )
            .into_iter()
            .collect())
    }

    fn on_permission(&mut self, ticket: PermissionTicket, permission: WritePermission) -> Vec<CommitCommand> {
        if !self.permission.resolve(&ticket, permission.clone()) {
            return Vec::new();
        }
        debug!(key = %ticket.key, ?permission, "Permission loaded");
        self.delegate_future = !permission.is_denied();
        self.try_auto_submit().into_iter().collect()
    }

    fn on_prepared(&mut self, generation: u64, outcome: Result<Option<PreparedCommit>>) -> Vec<CommitCommand> {
        if generation != self.prepare_generation || self.state != CommitState::Preparing {
            debug!(generation, current = self.prepare_generation, "Discarding superseded preparation");
            return Vec::new();
        }
        match outcome {
            Ok(None) => {
                self.state = CommitState::Idle;
                Vec::new()
            }
            Ok(Some(prepared)) => {
                self.prepared = Some(prepared);
                self.state = CommitState::AwaitingDecision;
                self.try_auto_submit().into_iter().collect()
            }
            Err(e) => {
                error!(error = %e, "Commit preparation failed");
                self.state = CommitState::Failed;
                self.last_error = Some(e.clone());
                vec![CommitCommand::ResetPreparer, CommitCommand::NotifyFailed { error: e }]
            }
        }
    }

    fn on_settled(&mut self, submission: u64, outcome: Result<()>) -> Vec<CommitCommand> {
        let flight = match self.in_flight.take() {
            Some(flight) if flight.id == submission => flight,
            other => {
                self.in_flight = other;
                debug!(submission, "Ignoring unknown submission result");
                return Vec::new();
            }
        };
        let current = self.state.is_submitting();

        let mut commands = match outcome {
            Ok(()) => {
                info!(submission, current, "Commit submitted");
                if let Some(update) = flight.permission_update {
                    if self.permission.active() == Some(&update.key) {
                        self.delegate_future = !update.permission.is_denied();
                    }
                    self.permission.store(&update.key, update.permission);
                }
                if current {
                    self.state = CommitState::Submitted;
                    self.last_error = None;
                }
                vec![
                    CommitCommand::NotifyCommitted { diff: flight.diff },
                    CommitCommand::ResetPreparer,
                ]
            }
            Err(e) => {
                error!(submission, error = %e, "Commit submission failed");
                if current {
                    self.state = CommitState::Failed;
                    self.last_error = Some(e.clone());
                }
                vec![CommitCommand::NotifyFailed { error: e }, CommitCommand::ResetPreparer]
            }
        };
        commands.extend(self.try_auto_submit());
        commands
    }

    fn refresh_permission(&mut self, request: &CommitRequest) -> Option<CommitCommand> {
        match request.permission_key() {
            Some(key) => Some(CommitCommand::LoadPermission(self.permission.begin(key))),
            None => {
                self.permission.detach();
                self.delegate_future = false;
                None
            }
        }
    }

    fn start_prepare(&mut self, request: CommitRequest) -> CommitCommand {
        self.prepare_generation += 1;
        self.state = CommitState::Preparing;
        self.prepared = None;
        self.last_error = None;
        debug!(generation = self.prepare_generation, force = request.force, "Preparing commit");
        CommitCommand::Prepare {
            generation: self.prepare_generation,
            request,
        }
    }

    /// Whether the prepared commit may go out without asking
    fn auto_eligible(&self) -> bool {
        let (Some(request), Some(prepared)) = (&self.request, &self.prepared) else {
            return false;
        };
        let Some(diff) = &prepared.diff else {
            return false;
        };
        let Some(WritePermission::Grant(grant)) = self.permission.current() else {
            return false;
        };
        self.calculator
            .total_deposit(prepared.deposit_bytes, DepositTier::None)
            .is_zero()
            && prepared.permission_granted
            && grant.covers(&request.account_data(diff))
    }

    fn try_auto_submit(&mut self) -> Option<CommitCommand> {
        if self.state != CommitState::AwaitingDecision || self.in_flight.is_some() || !self.auto_eligible() {
            return None;
        }
        self.submit(CommitState::AutoSubmitting, DepositTier::None, true)
    }

    fn submit(&mut self, state: CommitState, extra_tier: DepositTier, delegate_future: bool) -> Option<CommitCommand> {
        let request = self.request.as_ref()?;
        let prepared = self.prepared.as_ref()?;
        let diff = prepared.diff.clone()?;
        let account_id = request.account_id.clone()?;

        let path = if prepared.permission_granted {
            SubmitPath::Write
        } else {
            SubmitPath::WriteWithGrant
        };
        let deposit = self.calculator.total_deposit(prepared.deposit_bytes, extra_tier);
        let permission_update = request.permission_key().map(|key| {
            let prior = if self.permission.active() == Some(&key) {
                self.permission.current().cloned().unwrap_or_default()
            } else {
                WritePermission::Unknown
            };
            PermissionUpdate {
                permission: prior.after_commit(&request.account_data(&diff), delegate_future),
                key,
            }
        });

        self.next_submission += 1;
        let id = self.next_submission;
        self.in_flight = Some(InFlight {
            id,
            diff: diff.clone(),
            permission_update: permission_update.clone(),
        });
        self.state = state;
        info!(
            submission = id,
            account_id = %account_id,
            ?path,
            deposit = %deposit,
            extra_tier = %extra_tier,
            auto = state == CommitState::AutoSubmitting,
            "Submitting commit"
        );

        Some(CommitCommand::Submit(Submission {
            id,
            account_id,
            path,
            payload: diff,
            deposit,
            permission_update,
        }))
    }
}
