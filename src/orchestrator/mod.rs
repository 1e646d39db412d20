//! The orchestrator: admits missions, runs each to a terminal state and
//! answers status queries.
//!
//! Every admitted mission runs as its own task. The admission gate bounds how
//! many are past PENDING at once, which in turn bounds how many can be
//! EXECUTING. Cancellation flows from one shutdown token down to each
//! mission and from there into its sandbox run.

mod admission;
mod entry;
mod runner;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use tokio::sync::{Semaphore, mpsc};
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, info, info_span};

use crate::collaborators::{DeployTarget, PlanGenerator, PlanHealer, PublishTarget};
use crate::config::{Config, RuntimeKind};
use crate::evidence::{Event, EvidenceRecorder};
use crate::heal::RetryController;
use crate::model::{Mission, MissionId, SubmitOptions};
use crate::policy::{PolicyError, PolicyGate};
use crate::profiles::ProfileRegistry;
use crate::sandbox::docker::DockerRuntime;
use crate::sandbox::local::LocalRuntime;
use crate::sandbox::{Sandbox, SandboxLimits, SandboxRuntime};
use crate::state::{MissionStatus, Transition};
use crate::store::{MemoryStore, MissionStore, StoreError};

use admission::{ExecutionGauge, Ticket};
use entry::{MissionClock, MissionEntry};
use runner::MissionRunner;

pub use entry::TransitionStream;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("no {0} configured")]
    MissingCollaborator(&'static str),

    #[error("{0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("the orchestrator must be built inside a tokio runtime")]
    NoRuntime,

    #[error("mission {0} not found")]
    UnknownMission(MissionId),

    #[error("mission {id} is {status}; only FAILED missions can be retried")]
    NotRetryable { id: MissionId, status: MissionStatus },

    #[error("orchestrator is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Store(#[from] StoreError),
}

struct Inner {
    config: Config,
    policy: PolicyGate,
    retry: RetryController,
    sandbox: Sandbox,
    limits: SandboxLimits,
    generator: Arc<dyn PlanGenerator>,
    healer: Arc<dyn PlanHealer>,
    deploy: Option<Arc<dyn DeployTarget>>,
    publish: Option<Arc<dyn PublishTarget>>,
    store: Arc<dyn MissionStore>,
    evidence: EvidenceRecorder,
    missions: RwLock<HashMap<MissionId, Arc<MissionEntry>>>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    tickets: mpsc::UnboundedSender<Ticket>,
    gauge: ExecutionGauge,
}

impl Inner {
    fn entry(&self, id: MissionId) -> Option<Arc<MissionEntry>> {
        self.missions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }
}

/// Handle to a running orchestrator. Cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<Inner>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runtime", &self.inner.sandbox.runtime_name())
            .field("max_concurrent", &self.inner.config.orchestrator.max_concurrent)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    pub fn builder(config: &Config) -> OrchestratorBuilder {
        OrchestratorBuilder::new(config.clone())
    }

    /// Submit with default options (deploy and publish if configured).
    pub async fn submit(&self, intent: &str) -> Result<MissionId, OrchestratorError> {
        self.submit_with(intent, SubmitOptions::default()).await
    }

    pub async fn submit_with(
        &self,
        intent: &str,
        options: SubmitOptions,
    ) -> Result<MissionId, OrchestratorError> {
        self.launch(intent, options, None).await
    }

    async fn launch(
        &self,
        intent: &str,
        options: SubmitOptions,
        retry_of: Option<MissionId>,
    ) -> Result<MissionId, OrchestratorError> {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return Err(OrchestratorError::ShuttingDown);
        }

        let clock = MissionClock::start(inner.config.orchestrator.mission_timeout());
        let mut mission = Mission::new(
            intent,
            inner.retry.max_attempts(),
            clock.submitted_at(),
            clock.deadline_utc(),
            options,
        );
        mission.retry_of = retry_of;
        let id = mission.id;

        inner.store.create(&mission).await?;
        let detail = retry_of.map_or_else(
            || "submitted".to_string(),
            |previous| format!("submitted as a retry of {previous}"),
        );
        inner
            .evidence
            .record(id, clock.submitted_at(), MissionStatus::Pending, detail, None)
            .await;

        let entry = Arc::new(MissionEntry::new(
            mission,
            clock,
            inner.shutdown.child_token(),
            inner.config.orchestrator.subscriber_buffer,
        ));
        inner
            .missions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, Arc::clone(&entry));

        let (grant, granted) = tokio::sync::oneshot::channel();
        inner
            .tickets
            .send(Ticket { id, grant })
            .map_err(|_| OrchestratorError::ShuttingDown)?;

        let runner = MissionRunner::new(Arc::clone(inner), entry, id, granted);
        let span = info_span!("mission", id = %id.short());
        inner.tracker.spawn(runner.run().instrument(span));
        info!(mission = %id, "mission submitted");
        Ok(id)
    }

    /// Latest snapshot, from memory for live missions and from the store
    /// otherwise.
    pub async fn status(&self, id: MissionId) -> Result<Mission, OrchestratorError> {
        if let Some(entry) = self.inner.entry(id) {
            return Ok(entry.snapshot().await);
        }
        self.inner
            .store
            .load(id)
            .await?
            .ok_or(OrchestratorError::UnknownMission(id))
    }

    pub async fn events(&self, id: MissionId) -> Result<Vec<Event>, OrchestratorError> {
        let events = self.inner.evidence.events_for(id).await;
        if events.is_empty() && self.inner.entry(id).is_none() && self.inner.store.load(id).await?.is_none() {
            return Err(OrchestratorError::UnknownMission(id));
        }
        Ok(events)
    }

    /// Live transitions. A mission that has already finished yields an empty
    /// stream.
    pub async fn subscribe(&self, id: MissionId) -> Result<TransitionStream, OrchestratorError> {
        if let Some(entry) = self.inner.entry(id) {
            return Ok(entry.subscribe());
        }
        match self.inner.store.load(id).await? {
            Some(_) => Ok(Box::pin(tokio_stream::empty::<Transition>())),
            None => Err(OrchestratorError::UnknownMission(id)),
        }
    }

    /// Missions known to this process and the store, newest first.
    pub async fn list(&self, limit: usize) -> Result<Vec<Mission>, OrchestratorError> {
        let live: Vec<Arc<MissionEntry>> = self
            .inner
            .missions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut by_id: HashMap<MissionId, Mission> = HashMap::new();
        for mission in self.inner.store.list(limit).await? {
            by_id.insert(mission.id, mission);
        }
        for entry in live {
            let mission = entry.snapshot().await;
            by_id.insert(mission.id, mission);
        }

        let mut missions: Vec<Mission> = by_id.into_values().collect();
        missions.sort_by(|a, b| b.submitted_at.cmp(&a.submitted_at).then_with(|| a.id.cmp(&b.id)));
        missions.truncate(limit);
        Ok(missions)
    }

    /// Start a new mission with the intent and options of a failed one.
    pub async fn retry(&self, id: MissionId) -> Result<MissionId, OrchestratorError> {
        let previous = self.status(id).await?;
        if previous.status != MissionStatus::Failed {
            return Err(OrchestratorError::NotRetryable {
                id,
                status: previous.status,
            });
        }
        let new_id = self.launch(&previous.intent, previous.options, Some(id)).await?;
        info!(mission = %new_id, retry_of = %id, "retrying failed mission");
        Ok(new_id)
    }

    /// Block until the mission is terminal and return its final snapshot.
    pub async fn wait(&self, id: MissionId) -> Result<Mission, OrchestratorError> {
        let mut updates = self.subscribe(id).await?;
        while updates.next().await.is_some() {}
        self.status(id).await
    }

    /// Cancel every in-flight mission and stop admitting new ones. Sandboxes
    /// are released and the missions end FAILED(Aborted).
    pub fn abort(&self) {
        if !self.inner.shutdown.is_cancelled() {
            info!("aborting all missions");
        }
        self.inner.shutdown.cancel();
    }

    /// Abort and wait until every mission task (and its teardown) is done.
    pub async fn shutdown(&self) {
        self.abort();
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
    }

    /// Number of missions in EXECUTING right now.
    pub fn executing(&self) -> usize {
        self.inner.gauge.current()
    }

    /// Highest number of missions ever observed in EXECUTING at once.
    pub fn peak_executing(&self) -> usize {
        self.inner.gauge.peak()
    }

    pub fn max_concurrent(&self) -> usize {
        self.inner.config.orchestrator.max_concurrent
    }
}

pub struct OrchestratorBuilder {
    config: Config,
    generator: Option<Arc<dyn PlanGenerator>>,
    healer: Option<Arc<dyn PlanHealer>>,
    deploy: Option<Arc<dyn DeployTarget>>,
    publish: Option<Arc<dyn PublishTarget>>,
    store: Option<Arc<dyn MissionStore>>,
    runtime: Option<Arc<dyn SandboxRuntime>>,
}

impl OrchestratorBuilder {
    fn new(config: Config) -> Self {
        Self {
            config,
            generator: None,
            healer: None,
            deploy: None,
            publish: None,
            store: None,
            runtime: None,
        }
    }

    #[must_use]
    pub fn generator(mut self, generator: Arc<dyn PlanGenerator>) -> Self {
        self.generator = Some(generator);
        self
    }

    #[must_use]
    pub fn healer(mut self, healer: Arc<dyn PlanHealer>) -> Self {
        self.healer = Some(healer);
        self
    }

    /// One collaborator that both drafts and heals.
    #[must_use]
    pub fn collaborator<C>(mut self, collaborator: Arc<C>) -> Self
    where
        C: PlanGenerator + PlanHealer + 'static,
    {
        self.generator = Some(Arc::clone(&collaborator) as Arc<dyn PlanGenerator>);
        self.healer = Some(collaborator as Arc<dyn PlanHealer>);
        self
    }

    #[must_use]
    pub fn deploy(mut self, target: Arc<dyn DeployTarget>) -> Self {
        self.deploy = Some(target);
        self
    }

    #[must_use]
    pub fn publish(mut self, target: Arc<dyn PublishTarget>) -> Self {
        self.publish = Some(target);
        self
    }

    #[must_use]
    pub fn store(mut self, store: Arc<dyn MissionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Override the runtime chosen by `sandbox.runtime`.
    #[must_use]
    pub fn runtime(mut self, runtime: Arc<dyn SandboxRuntime>) -> Self {
        self.runtime = Some(runtime);
        self
    }

    /// Start the admission dispatcher and return a handle. Must be called
    /// from within a tokio runtime.
    pub fn build(self) -> Result<Orchestrator, OrchestratorError> {
        tokio::runtime::Handle::try_current().map_err(|_| OrchestratorError::NoRuntime)?;
        let config = self.config;
        config
            .check()
            .map_err(|e| OrchestratorError::InvalidConfig(e.to_string()))?;
        let generator = self
            .generator
            .ok_or(OrchestratorError::MissingCollaborator("plan generator"))?;
        let healer = self
            .healer
            .ok_or(OrchestratorError::MissingCollaborator("plan healer"))?;

        let policy = PolicyGate::new(&config.policy)?;
        let runtime = self.runtime.unwrap_or_else(|| default_runtime(&config));
        let profiles = Arc::new(ProfileRegistry::from_config(&config.sandbox.profiles));
        let sandbox = Sandbox::new(
            runtime,
            profiles,
            config.sandbox.output_tail_bytes,
            config.sandbox.teardown_timeout(),
        );
        let retry = RetryController::from_config(config.orchestrator.max_attempts, &config.heal);
        let limits = SandboxLimits::from_config(&config.sandbox);
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryStore::default()) as Arc<dyn MissionStore>);
        let evidence = EvidenceRecorder::new(Arc::clone(&store));

        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let (tickets, queue) = mpsc::unbounded_channel();
        let slots = Arc::new(Semaphore::new(config.orchestrator.max_concurrent));
        admission::spawn_dispatcher(&tracker, slots, queue, shutdown.clone());

        info!(
            runtime = sandbox.runtime_name(),
            max_concurrent = config.orchestrator.max_concurrent,
            max_attempts = config.orchestrator.max_attempts,
            "orchestrator ready"
        );

        Ok(Orchestrator {
            inner: Arc::new(Inner {
                config,
                policy,
                retry,
                sandbox,
                limits,
                generator,
                healer,
                deploy: self.deploy,
                publish: self.publish,
                store,
                evidence,
                missions: RwLock::default(),
                shutdown,
                tracker,
                tickets,
                gauge: ExecutionGauge::default(),
            }),
        })
    }
}

fn default_runtime(config: &Config) -> Arc<dyn SandboxRuntime> {
    match config.sandbox.runtime {
        RuntimeKind::Docker => Arc::new(DockerRuntime::from_config(&config.sandbox)),
        RuntimeKind::Local => Arc::new(LocalRuntime::new()),
    }
}
