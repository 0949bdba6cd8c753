// constitution-service-rs/src/builder.rs
// Wires the pipeline components from configuration plus the external
// collaborators supplied by the caller.

use std::sync::Arc;

use compliance_ledger::MetricsRecorder;
use error_handling::{Error, ErrorKind, Result};
use guardian::{Generator, Guardian, RestrictedWindow};
use policy_engine::{AllowListResolver, ExternalReferenceResolver, FactSource, PolicyCheck};
use resource_guard::ResourceGuard;
use self_correct::{queue_from_config, CorrectionEngine, EscalationQueue, ExecutableVerifier};
use shared_types::{Artifact, ConstitutionConfig, Task};
use tracing::info;

use crate::{ConstitutionService, SERVICE_NAME};

pub struct ServiceBuilder {
    config: ConstitutionConfig,
    generator: Option<Arc<dyn Generator>>,
    resolver: Arc<dyn ExternalReferenceResolver>,
    facts: Option<Arc<dyn FactSource>>,
    verifier: Option<Arc<dyn ExecutableVerifier>>,
    window: Option<Arc<dyn RestrictedWindow>>,
    escalations: Option<Arc<dyn EscalationQueue>>,
    pre_checks: Vec<(Arc<dyn PolicyCheck<Task>>, i32)>,
    post_checks: Vec<(Arc<dyn PolicyCheck<Artifact>>, i32)>,
}

impl ServiceBuilder {
    pub fn new(config: ConstitutionConfig) -> Self {
        Self {
            config,
            generator: None,
            resolver: Arc::new(AllowListResolver::with_std_roots()),
            facts: None,
            verifier: None,
            window: None,
            escalations: None,
            pre_checks: Vec::new(),
            post_checks: Vec::new(),
        }
    }

    pub fn generator(mut self, generator: Arc<dyn Generator>) -> Self {
        self.generator = Some(generator);
        self
    }

    pub fn reference_resolver(mut self, resolver: Arc<dyn ExternalReferenceResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Enables claim verification against `facts`.
    pub fn fact_source(mut self, facts: Arc<dyn FactSource>) -> Self {
        self.facts = Some(facts);
        self
    }

    pub fn verifier(mut self, verifier: Arc<dyn ExecutableVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Replaces the configured schedule of restricted windows.
    pub fn restricted_window(mut self, window: Arc<dyn RestrictedWindow>) -> Self {
        self.window = Some(window);
        self
    }

    pub fn escalation_queue(mut self, queue: Arc<dyn EscalationQueue>) -> Self {
        self.escalations = Some(queue);
        self
    }

    /// Adds a check to the PRE registry alongside the built-in ones.
    pub fn pre_check(mut self, check: Arc<dyn PolicyCheck<Task>>, priority: i32) -> Self {
        self.pre_checks.push((check, priority));
        self
    }

    /// Adds a check to the POST registry alongside the built-in ones.
    pub fn post_check(mut self, check: Arc<dyn PolicyCheck<Artifact>>, priority: i32) -> Self {
        self.post_checks.push((check, priority));
        self
    }

    /// Must be called inside a tokio runtime: the metrics recorder is
    /// spawned here.
    pub fn build(self) -> Result<ConstitutionService> {
        let config = self.config;
        config.validate()?;

        let generator = self.generator.ok_or_else(|| {
            Error::new(ErrorKind::Configuration, "no generator configured").service(SERVICE_NAME)
        })?;

        let mut pre = policy_engine::pre_registry(&config.guardian)?;
        for (check, priority) in self.pre_checks {
            pre.register(check, priority)?;
        }
        let mut post = policy_engine::post_registry(&config.policies, self.resolver, self.facts)?;
        for (check, priority) in self.post_checks {
            post.register(check, priority)?;
        }

        let resource_guard = Arc::new(ResourceGuard::from_config(&config.resource_guard));
        let mut guardian = Guardian::new(&config.guardian, pre, post, Arc::clone(&resource_guard))?;
        if let Some(window) = self.window {
            guardian = guardian.with_restricted_window(window);
        }

        let (recorder, recorder_task) = MetricsRecorder::from_config(&config.metrics)?;
        let escalations = self
            .escalations
            .unwrap_or_else(|| queue_from_config(&config.escalation));

        let mut engine = CorrectionEngine::new(
            Arc::new(guardian),
            generator,
            escalations,
            recorder.clone(),
            config.correction.max_iterations,
        );
        if let Some(verifier) = self.verifier {
            engine = engine.with_verifier(verifier);
        }

        info!(
            mode = %config.guardian.mode,
            max_iterations = engine.max_iterations(),
            durable_audit = config.metrics.audit_log_path.is_some(),
            durable_escalations = config.escalation.queue_path.is_some(),
            "constitution service ready"
        );

        Ok(ConstitutionService {
            engine,
            resource_guard,
            recorder,
            recorder_task,
            config: Arc::new(config),
        })
    }
}
