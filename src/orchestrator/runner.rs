//! Drives one mission from admission to a terminal state.
//!
//! All status changes go through `advance`, which holds the mission lock for
//! the whole transition: deadline check, legality check, evidence, store
//! write and subscriber fan-out. That lock is the per-mission serialization
//! point; missions never share one.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{OwnedSemaphorePermit, oneshot};
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::Inner;
use super::entry::MissionEntry;
use crate::collaborators::{GenerationError, SandboxRef};
use crate::error::MissionError;
use crate::evidence::Evidence;
use crate::heal::{NextStep, RetryController};
use crate::model::{BuildPlan, ExecutionResult, Failure, Mission, MissionId, MissionResult};
use crate::policy::Verdict;
use crate::sandbox::SandboxError;
use crate::state::{MissionStatus, Transition};

pub struct MissionRunner {
    inner: Arc<Inner>,
    entry: Arc<MissionEntry>,
    id: MissionId,
    granted: oneshot::Receiver<OwnedSemaphorePermit>,
}

impl MissionRunner {
    pub fn new(
        inner: Arc<Inner>,
        entry: Arc<MissionEntry>,
        id: MissionId,
        granted: oneshot::Receiver<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            inner,
            entry,
            id,
            granted,
        }
    }

    pub async fn run(mut self) {
        let admitted = self.admit().await;
        let outcome = match &admitted {
            Ok(_) => self.drive().await,
            Err(e) => Err(e.clone()),
        };
        match outcome {
            Ok(result) => {
                let summary = result.url.clone().unwrap_or_else(|| "verified".to_string());
                if let Err(e) = self
                    .advance(MissionStatus::Succeeded, format!("mission complete: {summary}"), |m| {
                        m.result = Some(result);
                    })
                    .await
                {
                    self.fail(e).await;
                }
            }
            Err(e) => self.fail(e).await,
        }
        // The slot is held until the mission is terminal.
        drop(admitted);
    }

    /// Wait for a slot. The mission stays PENDING meanwhile.
    async fn admit(&mut self) -> Result<OwnedSemaphorePermit, MissionError> {
        let deadline = self.entry.clock.deadline();
        tokio::select! {
            biased;
            () = self.entry.cancel.cancelled() => Err(MissionError::Aborted),
            () = tokio::time::sleep_until(deadline) => Err(MissionError::MissionTimeout),
            granted = &mut self.granted => granted.map_err(|_| MissionError::Aborted),
        }
    }

    async fn drive(&self) -> Result<MissionResult, MissionError> {
        let (intent, options) = {
            let mission = self.entry.mission.lock().await;
            (mission.intent.clone(), mission.options)
        };
        let timeouts = &self.inner.config.orchestrator;

        self.advance(MissionStatus::Architecting, "drafting plan", |_| {})
            .await?;
        let mut plan = self
            .bounded(
                timeouts.generation_timeout(),
                "generator",
                self.inner.generator.draft(&intent),
                MissionError::Generation,
            )
            .await?;
        plan.check_shape()
            .map_err(|e| MissionError::Generation(GenerationError::InvalidPlan(e).to_string()))?;
        let mut attempt = 0;
        self.attach_plan(&plan, attempt).await?;
        self.advance(MissionStatus::Validating, format!("plan {:?} drafted", plan.name), |_| {})
            .await?;

        loop {
            if let Verdict::Reject { rule, reasons } = self.inner.policy.validate(&plan) {
                self.attach(
                    format!("policy rejected plan ({rule})"),
                    Evidence::PolicyRejection {
                        rule: rule.to_string(),
                        reasons: reasons.clone(),
                    },
                    |_| {},
                )
                .await?;
                return Err(MissionError::PolicyViolation { reasons });
            }

            self.advance(MissionStatus::Executing, format!("attempt {attempt}"), |m| {
                m.verified = false;
            })
            .await?;
            let result = self.execute(&plan, attempt).await?;
            self.record_execution(attempt, &result).await?;

            match self.inner.retry.next_step(attempt, &plan, &result) {
                NextStep::Publish => break,
                NextStep::Exhausted(e) => return Err(e),
                NextStep::Heal(context) => {
                    let fingerprint = context.fingerprint();
                    self.advance(
                        MissionStatus::Healing,
                        format!("attempt {attempt} failed: {}", RetryController::classify(&result)),
                        |_| {},
                    )
                    .await?;
                    self.attach(
                        "heal requested",
                        Evidence::HealRequest {
                            attempt,
                            fingerprint,
                        },
                        |_| {},
                    )
                    .await?;

                    let healed = self
                        .bounded(
                            timeouts.generation_timeout(),
                            "healer",
                            self.inner.healer.heal(*context),
                            MissionError::HealFailed,
                        )
                        .await?;
                    healed.check_shape().map_err(|e| {
                        MissionError::HealFailed(GenerationError::InvalidPlan(e).to_string())
                    })?;
                    attempt += 1;
                    self.attach_plan(&healed, attempt).await?;
                    self.advance(MissionStatus::Validating, format!("healed plan for attempt {attempt}"), |_| {})
                        .await?;
                    plan = healed;
                }
            }
        }

        self.advance(MissionStatus::Publishing, format!("attempt {attempt} verified"), |_| {})
            .await?;
        let mut result = MissionResult::default();

        let deployed = match (&self.inner.deploy, options.deploy) {
            (Some(target), true) => {
                let sandbox = SandboxRef {
                    mission_id: self.id,
                    attempt,
                    label: self.label(attempt),
                };
                let deployed = self
                    .bounded(
                        timeouts.publish_timeout(),
                        "deploy",
                        target.deploy(&plan, &sandbox),
                        MissionError::PublishFailed,
                    )
                    .await?;
                self.attach(
                    format!("deployed to {}", deployed.url),
                    Evidence::Deployment {
                        url: deployed.url.clone(),
                    },
                    |_| {},
                )
                .await?;
                result.url = Some(deployed.url.clone());
                Some(deployed)
            }
            (None, _) => {
                self.skip("deploy", "no deploy target configured").await?;
                None
            }
            (Some(_), false) => {
                self.skip("deploy", "disabled for this mission").await?;
                None
            }
        };

        match (&self.inner.publish, options.publish) {
            (Some(target), true) => {
                let published = self
                    .bounded(
                        timeouts.publish_timeout(),
                        "publish",
                        target.publish(&plan, deployed.as_ref()),
                        MissionError::PublishFailed,
                    )
                    .await?;
                self.attach(
                    format!("published as {}", published.reference),
                    Evidence::Publication {
                        reference: published.reference.clone(),
                    },
                    |_| {},
                )
                .await?;
                result.reference = Some(published.reference);
            }
            (None, _) => self.skip("publish", "no publish target configured").await?,
            (Some(_), false) => self.skip("publish", "disabled for this mission").await?,
        }

        Ok(result)
    }

    /// Run the plan in a fresh sandbox, cancelling it if the mission deadline
    /// arrives first. Teardown has finished by the time this returns.
    async fn execute(&self, plan: &BuildPlan, attempt: u32) -> Result<ExecutionResult, MissionError> {
        let remaining = self.entry.clock.remaining();
        if remaining.is_zero() {
            return Err(MissionError::MissionTimeout);
        }
        let label = self.label(attempt);
        let limits = self.inner.limits.bounded_by(remaining);
        let token = self.entry.cancel.child_token();

        let run = self.inner.sandbox.run(&label, plan, &limits, &token);
        tokio::pin!(run);
        let (outcome, expired) = tokio::select! {
            biased;
            outcome = &mut run => (outcome, false),
            () = tokio::time::sleep_until(self.entry.clock.deadline()) => {
                token.cancel();
                (run.await, true)
            }
        };

        match outcome {
            Ok(result) => {
                info!(
                    attempt,
                    exit_code = result.exit_code,
                    timed_out = result.timed_out,
                    duration_ms = u64::try_from(result.duration.as_millis()).unwrap_or(u64::MAX),
                    "execution finished"
                );
                Ok(result)
            }
            Err(SandboxError::Cancelled) if expired => Err(MissionError::MissionTimeout),
            Err(SandboxError::Cancelled) => Err(MissionError::Aborted),
            Err(SandboxError::Infrastructure { stage, message }) => Err(MissionError::Infrastructure {
                stage: stage.to_string(),
                message,
            }),
        }
    }

    /// Await a collaborator call under its own timeout, the mission deadline
    /// and operator abort, whichever comes first.
    async fn bounded<T, E: fmt::Display>(
        &self,
        limit: Duration,
        what: &str,
        call: impl Future<Output = Result<T, E>>,
        fail: impl FnOnce(String) -> MissionError,
    ) -> Result<T, MissionError> {
        tokio::select! {
            biased;
            () = self.entry.cancel.cancelled() => Err(MissionError::Aborted),
            () = tokio::time::sleep_until(self.entry.clock.deadline()) => Err(MissionError::MissionTimeout),
            answered = tokio::time::timeout(limit, call) => match answered {
                Ok(Ok(value)) => Ok(value),
                Ok(Err(e)) => Err(fail(e.to_string())),
                Err(_) => Err(fail(format!("{what} did not answer within {}s", limit.as_secs()))),
            },
        }
    }

    fn label(&self, attempt: u32) -> String {
        format!("{}-{attempt}", self.id.short())
    }

    /// The single transition function.
    async fn advance(
        &self,
        to: MissionStatus,
        detail: impl Into<String>,
        mutate: impl FnOnce(&mut Mission),
    ) -> Result<(), MissionError> {
        let mut mission = self.entry.mission.lock().await;
        if mission.is_terminal() {
            return Err(MissionError::Aborted);
        }

        // The deadline outranks every other rule.
        let now = Instant::now();
        if self.entry.clock.is_past(now) {
            let failure = MissionError::MissionTimeout.to_failure();
            let at = self.entry.clock.deadline_utc();
            self.apply(&mut mission, MissionStatus::Failed, at, failure.message.clone(), Some(failure))
                .await;
            return Err(MissionError::MissionTimeout);
        }

        let from = mission.status;
        if !from.can_transition_to(to) {
            return Err(illegal(from, to, "not a legal transition"));
        }
        if to == MissionStatus::Publishing && !mission.verified {
            return Err(illegal(from, to, "latest execution was not green"));
        }

        mutate(&mut mission);
        let at = self.entry.clock.stamp(now);
        self.apply(&mut mission, to, at, detail.into(), None).await;
        Ok(())
    }

    async fn fail(&self, err: MissionError) {
        let mut mission = self.entry.mission.lock().await;
        if mission.is_terminal() {
            return;
        }

        let now = Instant::now();
        let (err, at) = if self.entry.clock.is_past(now) {
            (MissionError::MissionTimeout, self.entry.clock.deadline_utc())
        } else {
            (err, self.entry.clock.stamp(now))
        };
        match &err {
            MissionError::Infrastructure { stage, message } => {
                error!(stage = %stage, message = %message, kind = "infrastructure", "mission failed on infrastructure");
            }
            other => warn!(reason = %other.reason(), error = %other, "mission failed"),
        }
        let failure = err.to_failure();
        self.apply(&mut mission, MissionStatus::Failed, at, failure.message.clone(), Some(failure))
            .await;
    }

    /// Commit a status change already checked by the caller.
    async fn apply(
        &self,
        mission: &mut Mission,
        to: MissionStatus,
        at: DateTime<Utc>,
        detail: String,
        failure: Option<Failure>,
    ) {
        let from = mission.status;
        let reason = failure.as_ref().map(|f| f.reason);
        mission.status = to;
        mission.updated_at = at;
        if let Some(failure) = &failure {
            mission.failure = Some(failure.clone());
        }

        let evidence = &self.inner.evidence;
        let event = evidence
            .record(
                self.id,
                at,
                to,
                detail.clone(),
                Some(Evidence::Transition {
                    from,
                    to,
                    failure: reason,
                }),
            )
            .await;
        if let Some(failure) = failure {
            evidence
                .record(self.id, at, to, failure.message.clone(), Some(Evidence::Failure { failure }))
                .await;
        }
        if let Err(e) = self.inner.store.update(mission).await {
            warn!(error = %e, "mission snapshot not persisted");
        }

        if from == MissionStatus::Executing {
            self.inner.gauge.leave();
        }
        if to == MissionStatus::Executing {
            self.inner.gauge.enter();
        }

        info!(%from, %to, attempt = mission.attempt, "{detail}");
        self.entry.notify(Transition {
            mission_id: self.id,
            seq: event.seq,
            from,
            to,
            at,
            attempt: mission.attempt,
            detail,
            failure: reason,
        });
    }

    /// Record an artifact in the current phase without changing status.
    async fn attach(
        &self,
        detail: impl Into<String>,
        evidence: Evidence,
        mutate: impl FnOnce(&mut Mission),
    ) -> Result<(), MissionError> {
        let mut mission = self.entry.mission.lock().await;
        if mission.is_terminal() {
            return Err(MissionError::Aborted);
        }
        mutate(&mut mission);
        let at = self.entry.clock.stamp_now();
        self.inner
            .evidence
            .record(self.id, at, mission.status, detail, Some(evidence))
            .await;
        Ok(())
    }

    async fn attach_plan(&self, plan: &BuildPlan, attempt: u32) -> Result<(), MissionError> {
        let digest = plan.digest();
        self.attach(
            format!("plan for attempt {attempt}: {}", &digest[..12]),
            Evidence::Plan {
                attempt,
                digest,
                plan: plan.clone(),
            },
            |m| {
                m.plan = Some(plan.clone());
                m.attempt = attempt;
            },
        )
        .await
    }

    async fn record_execution(&self, attempt: u32, result: &ExecutionResult) -> Result<(), MissionError> {
        let detail = if result.is_green() {
            format!("attempt {attempt} passed")
        } else if result.timed_out {
            format!("attempt {attempt} timed out")
        } else {
            format!("attempt {attempt} exited with {}", result.exit_code)
        };
        let green = result.is_green();
        self.attach(
            detail,
            Evidence::Execution {
                attempt,
                result: result.clone(),
            },
            |m| m.verified = green,
        )
        .await
    }

    async fn skip(&self, step: &str, reason: &str) -> Result<(), MissionError> {
        self.attach(
            format!("{step} skipped: {reason}"),
            Evidence::Skipped {
                step: step.to_string(),
                reason: reason.to_string(),
            },
            |_| {},
        )
        .await
    }
}

fn illegal(from: MissionStatus, to: MissionStatus, why: &str) -> MissionError {
    error!(%from, %to, why, kind = "infrastructure", "refused transition");
    MissionError::Infrastructure {
        stage: "state machine".to_string(),
        message: format!("{from} -> {to}: {why}"),
    }
}
