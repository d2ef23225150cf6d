//! Cached, hierarchy-aware permission evaluation.
//!
//! Subjects are asked in priority order (user, primary character, other
//! characters, corporations, alliances, roles). The first subject whose rules
//! allow the permission grants it; the first subject whose rules explicitly
//! deny it denies it; subjects with no matching rule are skipped. When no
//! subject answers, the permission is denied.

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, trace, warn};

use super::circuit_breaker::CircuitBreaker;
use super::options::GuardOptions;
use crate::audit::{AuditLogEntry, AuditLogger, AuditOperation, AuditResult};
use crate::cache::AuthzCache;
use crate::context::RequestContext;
use crate::engine::{EngineDecision, RuleEngine};
use crate::error::{ErrorCode, KeystoneError};
use crate::hierarchy::{HierarchyResolver, ResolutionError};
use crate::models::{CharacterId, UserId};
use crate::policy::PermissionId;
use crate::subject::{append_roles, build_subjects, Subject};
use crate::telemetry::GuardMetrics;

/// Outcome of one permission evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    pub allowed: bool,
    /// Served from the decision cache.
    pub cached: bool,
    /// Subject whose rules decided, when one did.
    pub matched_subject: Option<Subject>,
    pub decision: Option<EngineDecision>,
    pub subjects_checked: usize,
    /// Primary character of the resolved hierarchy. Unset on cache hits.
    pub primary_character_id: Option<CharacterId>,
}

impl Evaluation {
    fn from_cache(allowed: bool) -> Self {
        Self {
            allowed,
            cached: true,
            matched_subject: None,
            decision: None,
            subjects_checked: 0,
            primary_character_id: None,
        }
    }
}

/// Why an evaluation produced no answer.
#[derive(Debug, Error)]
pub enum EvaluationError {
    /// A collaborator failed, timed out, was cancelled or is short-circuited.
    #[error("evaluation subsystem unavailable: {0}")]
    Unavailable(#[source] KeystoneError),

    /// Stored data is inconsistent; retrying will not help.
    #[error("evaluation failed: {0}")]
    Fault(#[source] KeystoneError),
}

impl EvaluationError {
    pub fn is_subsystem_failure(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }

    pub fn error(&self) -> &KeystoneError {
        match self {
            Self::Unavailable(e) | Self::Fault(e) => e,
        }
    }
}

impl From<EvaluationError> for KeystoneError {
    fn from(error: EvaluationError) -> Self {
        match error {
            EvaluationError::Unavailable(e) | EvaluationError::Fault(e) => e,
        }
    }
}

/// Evaluates permissions for a user. Cheap to clone; all state is shared.
#[derive(Clone)]
pub struct Evaluator {
    engine: Arc<dyn RuleEngine>,
    resolver: HierarchyResolver,
    cache: AuthzCache,
    audit: AuditLogger,
    breaker: Option<Arc<CircuitBreaker>>,
    options: Arc<GuardOptions>,
}

impl std::fmt::Debug for Evaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Evaluator")
            .field("engine", &self.engine.name())
            .field("breaker", &self.breaker)
            .field("options", &self.options)
            .finish()
    }
}

impl Evaluator {
    pub fn new(
        engine: Arc<dyn RuleEngine>,
        resolver: HierarchyResolver,
        cache: AuthzCache,
        audit: AuditLogger,
        options: Arc<GuardOptions>,
    ) -> Self {
        let breaker = options
            .circuit_breaker()
            .map(|cb| Arc::new(CircuitBreaker::new("evaluation", cb.failure_threshold, cb.recovery_timeout)));

        Self {
            engine,
            resolver,
            cache,
            audit,
            breaker,
            options,
        }
    }

    pub fn options(&self) -> &GuardOptions {
        &self.options
    }

    pub fn breaker(&self) -> Option<&Arc<CircuitBreaker>> {
        self.breaker.as_ref()
    }

    pub fn engine(&self) -> &Arc<dyn RuleEngine> {
        &self.engine
    }

    pub fn resolver(&self) -> &HierarchyResolver {
        &self.resolver
    }

    pub fn cache(&self) -> &AuthzCache {
        &self.cache
    }

    pub fn audit(&self) -> &AuditLogger {
        &self.audit
    }

    /// Evaluate through the decision cache.
    pub async fn evaluate(
        &self,
        user_id: &UserId,
        permission: &PermissionId,
        ctx: &RequestContext,
    ) -> Result<Evaluation, EvaluationError> {
        self.run(user_id, permission, ctx, true).await
    }

    /// Evaluate against the engine, neither reading nor writing the cache.
    pub async fn evaluate_uncached(
        &self,
        user_id: &UserId,
        permission: &PermissionId,
        ctx: &RequestContext,
    ) -> Result<Evaluation, EvaluationError> {
        self.run(user_id, permission, ctx, false).await
    }

    async fn run(
        &self,
        user_id: &UserId,
        permission: &PermissionId,
        ctx: &RequestContext,
        use_cache: bool,
    ) -> Result<Evaluation, EvaluationError> {
        let started = Instant::now();
        let ctx = ctx.clone().or_timeout(self.options.call_timeout());
        let resource = permission.engine_resource();
        let action = permission.action();

        if use_cache {
            match ctx.run("decision_cache.get", self.cache.get_decision(user_id, &resource, action)).await {
                Ok(Some(allowed)) => {
                    GuardMetrics::decision_cache(true);
                    self.stage("cache_hit", started, permission);
                    GuardMetrics::evaluation_duration(started.elapsed(), true);
                    self.audit_decision(user_id, permission, if allowed { AuditResult::Allowed } else { AuditResult::Denied })
                        .await;
                    return Ok(Evaluation::from_cache(allowed));
                }
                Ok(None) => GuardMetrics::decision_cache(false),
                Err(e) if e.code() == ErrorCode::Cancelled => return Err(EvaluationError::Unavailable(e)),
                Err(e) => {
                    GuardMetrics::decision_cache(false);
                    warn!(user_id = %user_id, error = %e, "Decision cache read failed; treating as miss");
                }
            }
            self.stage("cache_miss", started, permission);
        }

        let admission = match &self.breaker {
            Some(breaker) => match breaker.try_admit() {
                Some(admission) => Some(admission),
                None => {
                    self.stage("circuit_open", started, permission);
                    return Err(EvaluationError::Unavailable(KeystoneError::new(
                        ErrorCode::CircuitOpen,
                        "Permission evaluation is temporarily unavailable",
                    )));
                }
            },
            None => None,
        };

        // Dropping this future mid-call drops the admission, which gives a
        // half-open trial back.
        let outcome = self.evaluate_subjects(user_id, &resource, action, &ctx, started, permission).await;
        if let Some(admission) = admission {
            match &outcome {
                Ok(_) | Err(EvaluationError::Fault(_)) => admission.succeeded(),
                Err(EvaluationError::Unavailable(inner)) if inner.code() == ErrorCode::Cancelled => admission.abandon(),
                Err(EvaluationError::Unavailable(_)) => admission.failed(),
            }
        }
        let evaluation = outcome?;

        if use_cache {
            if let Err(e) = ctx
                .run(
                    "decision_cache.set",
                    self.cache.set_decision(user_id, &resource, action, evaluation.allowed),
                )
                .await
            {
                warn!(user_id = %user_id, error = %e, "Decision cache write failed");
            }
        }

        GuardMetrics::evaluation_duration(started.elapsed(), false);
        self.stage("decided", started, permission);
        self.audit_decision(
            user_id,
            permission,
            if evaluation.allowed { AuditResult::Allowed } else { AuditResult::Denied },
        )
        .await;

        Ok(evaluation)
    }

    async fn evaluate_subjects(
        &self,
        user_id: &UserId,
        resource: &str,
        action: &str,
        ctx: &RequestContext,
        started: Instant,
        permission: &PermissionId,
    ) -> Result<Evaluation, EvaluationError> {
        let hierarchy = self.resolver.resolve(user_id, ctx).await.map_err(|e| match e {
            ResolutionError::Unavailable(inner) => EvaluationError::Unavailable(inner),
            integrity @ ResolutionError::Integrity { .. } => EvaluationError::Fault(integrity.into()),
        })?;
        self.stage("hierarchy_resolved", started, permission);

        let mut subjects = build_subjects(&hierarchy);
        let domain = self.options.domain();

        if self.options.role_subjects() {
            let user_subject = Subject::user(user_id);
            match ctx
                .run("engine.roles_for_subject", self.engine.roles_for_subject(&user_subject, domain))
                .await
            {
                Ok(roles) => append_roles(&mut subjects, roles),
                Err(e) if e.code() == ErrorCode::Cancelled => return Err(EvaluationError::Unavailable(e)),
                Err(e) => warn!(user_id = %user_id, error = %e, "Role lookup failed; evaluating without role subjects"),
            }
        }
        self.stage("subjects_built", started, permission);

        let mut checked = 0;
        for subject in &subjects {
            checked += 1;
            let decision = ctx
                .run("engine.decide", self.engine.decide(subject, resource, action, domain))
                .await
                .map_err(|e| {
                    if e.code() != ErrorCode::Cancelled {
                        GuardMetrics::engine_error();
                    }
                    EvaluationError::Unavailable(e)
                })?;

            trace!(subject = %subject, ?decision, "Subject evaluated");

            match decision {
                EngineDecision::NoMatch => continue,
                EngineDecision::Allow | EngineDecision::Deny => {
                    return Ok(Evaluation {
                        allowed: decision.is_allowed(),
                        cached: false,
                        matched_subject: Some(subject.clone()),
                        decision: Some(decision),
                        subjects_checked: checked,
                        primary_character_id: hierarchy.primary_character_id.clone(),
                    });
                }
            }
        }

        Ok(Evaluation {
            allowed: false,
            cached: false,
            matched_subject: None,
            decision: None,
            subjects_checked: checked,
            primary_character_id: hierarchy.primary_character_id.clone(),
        })
    }

    /// Append a `check` entry when decision auditing is on.
    pub async fn audit_decision(&self, user_id: &UserId, permission: &PermissionId, result: AuditResult) {
        if !self.options.audit_decisions() {
            return;
        }
        let entry = AuditLogEntry::new(AuditOperation::Check, user_id.as_str())
            .subject(&Subject::user(user_id))
            .resource(permission.engine_resource())
            .action(permission.action())
            .result(result);
        self.audit.record(entry).await;
    }

    fn stage(&self, stage: &'static str, started: Instant, permission: &PermissionId) {
        let elapsed_us = started.elapsed().as_micros() as u64;
        if self.options.debug_logging() {
            debug!(stage, elapsed_us, permission = %permission, "Evaluation stage");
        } else {
            trace!(stage, elapsed_us, permission = %permission, "Evaluation stage");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::engine::{MemoryRuleEngine, PolicyRule};
    use crate::hierarchy::{CharacterDirectory, CharacterRecord, InMemoryDirectory};
    use crate::models::{Effect, GLOBAL_DOMAIN};

    async fn setup() -> (Evaluator, MemoryRuleEngine, Arc<InMemoryDirectory>) {
        let engine = MemoryRuleEngine::new();
        let directory = Arc::new(InMemoryDirectory::new());
        directory
            .replace_characters(
                &UserId::new("U"),
                &[
                    CharacterRecord::new("C1", "Main", "CORP1").in_alliance("ALL1").primary(),
                    CharacterRecord::new("C2", "Alt", "CORP2"),
                ],
            )
            .await
            .unwrap();

        let cache = AuthzCache::in_memory();
        let evaluator = Evaluator::new(
            Arc::new(engine.clone()),
            HierarchyResolver::new(directory.clone(), cache.clone()),
            cache,
            AuditLogger::inline(Arc::new(InMemoryAuditSink::new())),
            Arc::new(GuardOptions::development()),
        );
        (evaluator, engine, directory)
    }

    fn perm(s: &str) -> PermissionId {
        PermissionId::parse(s).unwrap()
    }

    async fn grant(engine: &MemoryRuleEngine, subject: Subject, permission: &str, effect: Effect) {
        let p = perm(permission);
        engine
            .add_policy(&PolicyRule::new(subject, p.engine_resource(), p.action(), GLOBAL_DOMAIN, effect))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_alliance_grant_is_inherited() {
        let (evaluator, engine, _) = setup().await;
        grant(&engine, Subject::alliance("ALL1"), "fleet:ops:join", Effect::Allow).await;

        let eval = evaluator
            .evaluate(&UserId::new("U"), &perm("fleet:ops:join"), &RequestContext::new())
            .await
            .unwrap();
        assert!(eval.allowed);
        assert_eq!(eval.matched_subject, Some(Subject::alliance("ALL1")));
    }

    #[tokio::test]
    async fn test_character_deny_beats_alliance_allow() {
        let (evaluator, engine, _) = setup().await;
        grant(&engine, Subject::alliance("ALL1"), "fleet:ops:join", Effect::Allow).await;
        grant(&engine, Subject::character("C1"), "fleet:ops:join", Effect::Deny).await;

        let eval = evaluator
            .evaluate_uncached(&UserId::new("U"), &perm("fleet:ops:join"), &RequestContext::new())
            .await
            .unwrap();
        assert!(!eval.allowed);
        assert_eq!(eval.matched_subject, Some(Subject::character("C1")));
        assert_eq!(eval.decision, Some(EngineDecision::Deny));
    }

    #[tokio::test]
    async fn test_default_deny_checks_every_subject() {
        let (evaluator, _, _) = setup().await;

        let eval = evaluator
            .evaluate(&UserId::new("U"), &perm("secret:ops:execute"), &RequestContext::new())
            .await
            .unwrap();
        assert!(!eval.allowed);
        assert!(eval.matched_subject.is_none());
        // user, C1, C2, CORP1, CORP2, ALL1
        assert_eq!(eval.subjects_checked, 6);
    }

    #[tokio::test]
    async fn test_second_call_is_cached() {
        let (evaluator, engine, _) = setup().await;
        grant(&engine, Subject::corporation("CORP2"), "a:b:c", Effect::Allow).await;
        let ctx = RequestContext::new();

        let first = evaluator.evaluate(&UserId::new("U"), &perm("a:b:c"), &ctx).await.unwrap();
        let second = evaluator.evaluate(&UserId::new("U"), &perm("a:b:c"), &ctx).await.unwrap();
        assert!(!first.cached);
        assert!(second.cached);
        assert!(second.allowed);
    }

    #[tokio::test]
    async fn test_role_subjects_are_lowest_priority() {
        let (evaluator, engine, _) = setup().await;
        engine.add_role_for_subject(&Subject::user("U"), "ops", GLOBAL_DOMAIN, None).await.unwrap();
        grant(&engine, Subject::role("ops"), "a:b:c", Effect::Allow).await;

        let eval = evaluator
            .evaluate(&UserId::new("U"), &perm("a:b:c"), &RequestContext::new())
            .await
            .unwrap();
        assert!(eval.allowed);
        assert_eq!(eval.matched_subject, Some(Subject::role("ops")));
        assert_eq!(eval.subjects_checked, 7);
    }

    #[tokio::test]
    async fn test_integrity_fault_is_not_a_subsystem_failure() {
        let (evaluator, _, directory) = setup().await;
        directory
            .replace_characters(
                &UserId::new("V"),
                &[
                    CharacterRecord::new("X1", "A", "CORP1").primary(),
                    CharacterRecord::new("X2", "B", "CORP1").primary(),
                ],
            )
            .await
            .unwrap();

        let err = evaluator
            .evaluate(&UserId::new("V"), &perm("a:b:c"), &RequestContext::new())
            .await
            .unwrap_err();
        assert!(!err.is_subsystem_failure());
        assert_eq!(err.error().code(), ErrorCode::IntegrityViolation);
    }
}
