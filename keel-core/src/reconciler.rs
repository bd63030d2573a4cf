//! Reconciler - Drive one resource to its desired state
//!
//! A Reconciler owns the lifecycle of a single resource instance:
//!
//! ```text
//! Absent -> Creating -> Present -> { Updating -> Present | Replacing -> Creating }
//!        -> Deleting -> Absent | DeleteFailed
//! ```
//!
//! Each pass diffs the last applied desired state against the new one and
//! issues at most one logical create, update or delete request per
//! transition. Replacement always deletes and verifies deletion before it
//! creates the new resource. Retries of individual requests are the
//! accessor's business.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::accessor::{Accessor, AccessorError};
use crate::clock::{Clock, TokioClock};
use crate::decoder::{DecodeError, DiscriminatedDecoder};
use crate::differ::{self, DiffError};
use crate::plan::{Action, ReconciliationPlan};
use crate::property::{DesiredState, Phase, PropertySet};
use crate::resource::{LifecycleState, RemoteState, ResourceId, ResourceKind};

/// Reconciler configuration
#[derive(Debug, Clone, PartialEq)]
pub struct ReconcilerConfig {
    /// Wait between two destroy verification reads
    pub poll_interval: Duration,
    /// Give up destroy verification after this many reads; `None` polls until
    /// a terminal signal or until the caller cancels
    pub max_polls: Option<u32>,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            max_polls: Some(120),
        }
    }
}

/// Why destroy verification failed
#[derive(Debug, thiserror::Error)]
pub enum DestroyCause {
    #[error("{0}")]
    Accessor(#[source] AccessorError),

    #[error("cancelled: {0}")]
    Cancelled(#[source] AccessorError),

    #[error("still present after {attempts} reads (last status: {last_status})")]
    AttemptsExhausted { attempts: u32, last_status: String },
}

/// Error during reconciliation
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Required property '{name}' was removed")]
    MissingRequiredProperty { name: String },

    #[error("{transition} failed: {source}")]
    Accessor {
        transition: LifecycleState,
        #[source]
        source: AccessorError,
    },

    #[error("Destroy of '{identifier}' could not be verified: {cause}")]
    DestroyVerification {
        identifier: String,
        #[source]
        cause: DestroyCause,
    },

    #[error("Replacement of '{identifier}' returned the same identifier")]
    ReplacementIdentity { identifier: String },

    #[error("Update changed identifier from '{before}' to '{after}'")]
    UpdateIdentityChanged { before: String, after: String },

    #[error("Response decoding failed: {0}")]
    Decode(#[from] DecodeError),

    #[error("{id} cannot be {operation} in state {state}")]
    InvalidState {
        id: ResourceId,
        state: LifecycleState,
        operation: &'static str,
    },
}

impl From<DiffError> for ReconcileError {
    fn from(e: DiffError) -> Self {
        match e {
            DiffError::MissingRequiredProperty { name } => {
                ReconcileError::MissingRequiredProperty { name }
            }
        }
    }
}

impl ReconcileError {
    /// Returns true for destroy verification failures caused by cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ReconcileError::DestroyVerification {
                cause: DestroyCause::Cancelled(_),
                ..
            }
        )
    }
}

pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciliation {
    pub plan: ReconciliationPlan,
    pub state: RemoteState,
}

/// What a reconciler remembers between passes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub state: LifecycleState,
    pub identifier: Option<String>,
    pub time_created: Option<DateTime<Utc>>,
    /// Last successfully applied desired state
    pub applied: Option<DesiredState>,
}

/// Reconciler for a single resource instance
pub struct Reconciler<A: Accessor, C: Clock = TokioClock> {
    kind: ResourceKind,
    id: ResourceId,
    accessor: A,
    clock: C,
    config: ReconcilerConfig,
    decoder: Option<DiscriminatedDecoder>,
    state: LifecycleState,
    identifier: Option<String>,
    time_created: Option<DateTime<Utc>>,
    applied: Option<DesiredState>,
}

impl<A: Accessor> Reconciler<A, TokioClock> {
    pub fn new(kind: ResourceKind, name: impl Into<String>, accessor: A) -> Self {
        let id = kind.resource_id(name);
        Self {
            kind,
            id,
            accessor,
            clock: TokioClock,
            config: ReconcilerConfig::default(),
            decoder: None,
            state: LifecycleState::Absent,
            identifier: None,
            time_created: None,
            applied: None,
        }
    }
}

impl<A: Accessor, C: Clock> Reconciler<A, C> {
    pub fn with_clock<C2: Clock>(self, clock: C2) -> Reconciler<A, C2> {
        Reconciler {
            kind: self.kind,
            id: self.id,
            accessor: self.accessor,
            clock,
            config: self.config,
            decoder: self.decoder,
            state: self.state,
            identifier: self.identifier,
            time_created: self.time_created,
            applied: self.applied,
        }
    }

    pub fn with_config(mut self, config: ReconcilerConfig) -> Self {
        self.config = config;
        self
    }

    /// Decode response bodies with this decoder, using the kind's
    /// discriminator field
    pub fn with_decoder(mut self, decoder: DiscriminatedDecoder) -> Self {
        self.decoder = Some(decoder);
        self
    }

    pub fn id(&self) -> &ResourceId {
        &self.id
    }

    pub fn kind(&self) -> &ResourceKind {
        &self.kind
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    pub fn identifier(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub fn time_created(&self) -> Option<DateTime<Utc>> {
        self.time_created
    }

    pub fn applied(&self) -> Option<&DesiredState> {
        self.applied.as_ref()
    }

    pub fn accessor(&self) -> &A {
        &self.accessor
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            state: self.state,
            identifier: self.identifier.clone(),
            time_created: self.time_created,
            applied: self.applied.clone(),
        }
    }

    /// Resume from a snapshot taken by an earlier reconciler
    pub fn restore(mut self, snapshot: Snapshot) -> Self {
        self.state = snapshot.state;
        self.identifier = snapshot.identifier;
        self.time_created = snapshot.time_created;
        self.applied = snapshot.applied;
        self
    }

    /// Compute the plan for `desired` without side effects
    ///
    /// Only `Absent` and `Present` can be planned. A reconciler left in
    /// `Deleting` or `DeleteFailed` (a failed verification, or a `destroy`
    /// dropped by the caller's timeout) must be finished with [`Self::destroy`].
    pub fn plan(&self, desired: &DesiredState) -> ReconcileResult<ReconciliationPlan> {
        match (self.state, &self.applied) {
            (LifecycleState::Absent, _) => Ok(ReconciliationPlan::creation()),
            (LifecycleState::Present, Some(prior)) => Ok(differ::diff(prior, desired)?),
            (state, _) => Err(self.invalid_state(state, "planned")),
        }
    }

    /// Resolve a property table for the current phase and reconcile it
    ///
    /// Create values are used while the resource does not exist, update
    /// values once it does.
    pub async fn reconcile_properties(
        &mut self,
        properties: &PropertySet,
    ) -> ReconcileResult<Reconciliation> {
        let phase = if self.applied.is_none() {
            Phase::Create
        } else {
            Phase::Update
        };
        self.reconcile(&properties.resolve(phase)).await
    }

    /// Run one reconciliation pass
    pub async fn reconcile(&mut self, desired: &DesiredState) -> ReconcileResult<Reconciliation> {
        if self.state == LifecycleState::Absent {
            return self.create(desired).await;
        }

        let plan = self.plan(desired)?;
        log::debug!("{}: {}", self.id, plan);

        match plan.action {
            Action::NoOp => match self.refresh().await {
                Ok(state) => Ok(Reconciliation { plan, state }),
                Err(ReconcileError::Accessor { source, .. }) if source.is_not_found() => {
                    self.recreate_missing(desired).await
                }
                Err(e) => Err(e),
            },
            Action::UpdateInPlace => self.update(plan, desired).await,
            Action::Replace => self.replace(plan, desired).await,
        }
    }

    /// Read the current remote state
    pub async fn refresh(&self) -> ReconcileResult<RemoteState> {
        let identifier = self.require_identifier("read")?;
        let mut state = self
            .accessor
            .read(&self.id, identifier)
            .await
            .map_err(|source| ReconcileError::Accessor {
                transition: self.state,
                source,
            })?;

        if self.kind.is_deleted(&state.lifecycle_status) {
            return Err(ReconcileError::Accessor {
                transition: self.state,
                source: AccessorError::not_found(format!(
                    "{} is {}",
                    identifier, state.lifecycle_status
                ))
                .for_resource(self.id.clone()),
            });
        }

        state.time_created = state.time_created.or(self.time_created);
        self.decode_response(&mut state)?;
        Ok(state)
    }

    /// Delete the resource and wait until the remote confirms it is gone
    ///
    /// Safe to call again from `Deleting` or `DeleteFailed`; the delete
    /// request is reissued (not-found counts as done) and verification
    /// starts over.
    pub async fn destroy(&mut self) -> ReconcileResult<()> {
        let Some(identifier) = self.identifier.clone() else {
            self.forget();
            return Ok(());
        };

        let previous = self.state;
        self.delete(&identifier, previous).await?;
        self.forget();
        Ok(())
    }

    /// Poll until `identifier` reports a terminal deleted status or is not found
    pub async fn verify_destroyed(&self, identifier: &str) -> ReconcileResult<()> {
        let failed = |cause| ReconcileError::DestroyVerification {
            identifier: identifier.to_string(),
            cause,
        };

        let mut attempts: u32 = 0;
        loop {
            attempts = attempts.saturating_add(1);

            let last_status = match self.accessor.read(&self.id, identifier).await {
                Err(e) if e.is_not_found() => {
                    log::debug!("{}: {} not found after {} reads", self.id, identifier, attempts);
                    return Ok(());
                }
                Err(e) if e.is_cancelled() => return Err(failed(DestroyCause::Cancelled(e))),
                Err(e) => return Err(failed(DestroyCause::Accessor(e))),
                Ok(state) if self.kind.is_deleted(&state.lifecycle_status) => {
                    log::debug!(
                        "{}: {} reached {} after {} reads",
                        self.id,
                        identifier,
                        state.lifecycle_status,
                        attempts
                    );
                    return Ok(());
                }
                Ok(state) => state.lifecycle_status,
            };

            if let Some(max) = self.config.max_polls
                && attempts >= max
            {
                return Err(failed(DestroyCause::AttemptsExhausted {
                    attempts,
                    last_status,
                }));
            }

            log::debug!(
                "{}: waiting for {} to be deleted (status {}, read {})",
                self.id,
                identifier,
                last_status,
                attempts
            );
            self.clock.sleep(self.config.poll_interval).await;
        }
    }

    async fn create(&mut self, desired: &DesiredState) -> ReconcileResult<Reconciliation> {
        self.state = LifecycleState::Creating;
        log::info!("{}: creating", self.id);

        let created = self.accessor.create(&self.id, &desired.values).await;
        let mut state = match created {
            Ok(state) if state.identifier.is_some() => state,
            Ok(_) => {
                self.state = LifecycleState::Absent;
                return Err(ReconcileError::Accessor {
                    transition: LifecycleState::Creating,
                    source: AccessorError::new("create returned no identifier")
                        .for_resource(self.id.clone()),
                });
            }
            Err(source) => {
                self.state = LifecycleState::Absent;
                return Err(ReconcileError::Accessor {
                    transition: LifecycleState::Creating,
                    source,
                });
            }
        };

        let time_created = state.time_created.unwrap_or_else(|| self.clock.now());
        state.time_created = Some(time_created);

        self.state = LifecycleState::Present;
        self.identifier = state.identifier.clone();
        self.time_created = Some(time_created);
        self.applied = Some(desired.clone());
        log::info!(
            "{}: created {}",
            self.id,
            self.identifier.as_deref().unwrap_or_default()
        );

        self.decode_response(&mut state)?;
        Ok(Reconciliation {
            plan: ReconciliationPlan::creation(),
            state,
        })
    }

    async fn update(
        &mut self,
        plan: ReconciliationPlan,
        desired: &DesiredState,
    ) -> ReconcileResult<Reconciliation> {
        let identifier = self.require_identifier("updated")?.to_string();
        let changed = differ::update_payload(&plan, desired);

        self.state = LifecycleState::Updating;
        log::info!("{}: updating {} in place", self.id, identifier);

        let result = self.accessor.update(&self.id, &identifier, &changed).await;
        self.state = LifecycleState::Present;
        let mut state = result.map_err(|source| ReconcileError::Accessor {
            transition: LifecycleState::Updating,
            source,
        })?;

        match state.identifier.as_deref() {
            Some(after) if after != identifier => {
                return Err(ReconcileError::UpdateIdentityChanged {
                    before: identifier,
                    after: after.to_string(),
                });
            }
            Some(_) => {}
            None => state.identifier = Some(identifier),
        }
        state.time_created = state.time_created.or(self.time_created);
        self.applied = Some(desired.clone());

        self.decode_response(&mut state)?;
        Ok(Reconciliation { plan, state })
    }

    async fn replace(
        &mut self,
        plan: ReconciliationPlan,
        desired: &DesiredState,
    ) -> ReconcileResult<Reconciliation> {
        let old = self.require_identifier("replaced")?.to_string();
        log::info!(
            "{}: replacing {} ({})",
            self.id,
            old,
            plan.replacement_causes
                .iter()
                .map(String::as_str)
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.state = LifecycleState::Replacing;
        self.delete(&old, LifecycleState::Present).await?;
        self.forget();

        let created = self.create(desired).await?;
        if self.identifier.as_deref() == Some(old.as_str()) {
            return Err(ReconcileError::ReplacementIdentity { identifier: old });
        }

        Ok(Reconciliation {
            plan,
            state: created.state,
        })
    }

    /// Recreate a resource that disappeared outside of this reconciler
    async fn recreate_missing(
        &mut self,
        desired: &DesiredState,
    ) -> ReconcileResult<Reconciliation> {
        log::warn!(
            "{}: {} no longer exists, recreating",
            self.id,
            self.identifier.as_deref().unwrap_or_default()
        );
        self.forget();
        self.create(desired).await
    }

    /// Issue the delete request and verify it. `fallback` is the state kept
    /// when the request itself fails; an interrupted request may already have
    /// reached the remote, so it leaves `DeleteFailed` instead.
    async fn delete(
        &mut self,
        identifier: &str,
        fallback: LifecycleState,
    ) -> ReconcileResult<()> {
        self.state = LifecycleState::Deleting;
        log::info!("{}: deleting {}", self.id, identifier);

        match self.accessor.delete(&self.id, identifier).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                log::debug!("{}: {} already gone", self.id, identifier);
            }
            Err(e) if e.is_cancelled() => {
                log::warn!("{}: delete of {} interrupted: {}", self.id, identifier, e);
                self.state = LifecycleState::DeleteFailed;
                return Err(ReconcileError::DestroyVerification {
                    identifier: identifier.to_string(),
                    cause: DestroyCause::Cancelled(e),
                });
            }
            Err(source) => {
                self.state = fallback;
                return Err(ReconcileError::Accessor {
                    transition: LifecycleState::Deleting,
                    source,
                });
            }
        }

        if let Err(e) = self.verify_destroyed(identifier).await {
            log::warn!("{}: {}", self.id, e);
            self.state = LifecycleState::DeleteFailed;
            return Err(e);
        }
        log::info!("{}: deleted {}", self.id, identifier);
        Ok(())
    }

    fn forget(&mut self) {
        self.state = LifecycleState::Absent;
        self.identifier = None;
        self.time_created = None;
        self.applied = None;
    }

    fn decode_response(&self, state: &mut RemoteState) -> ReconcileResult<()> {
        let (Some(field), Some(decoder)) = (&self.kind.discriminator, &self.decoder) else {
            return Ok(());
        };
        let decoded = decoder.decode(&state.attributes, field)?;
        state.variant = Some(decoded.tag().to_string());
        Ok(())
    }

    fn require_identifier(&self, operation: &'static str) -> ReconcileResult<&str> {
        match (self.state, self.identifier.as_deref()) {
            (LifecycleState::DeleteFailed, _) | (_, None) => {
                Err(self.invalid_state(self.state, operation))
            }
            (_, Some(identifier)) => Ok(identifier),
        }
    }

    fn invalid_state(&self, state: LifecycleState, operation: &'static str) -> ReconcileError {
        ReconcileError::InvalidState {
            id: self.id.clone(),
            state,
            operation,
        }
    }
}
