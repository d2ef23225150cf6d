//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use axum::http::{header, HeaderMap, HeaderValue};
use parking_lot::Mutex;

use keystone_core::audit::{AuditFilter, AuditLogEntry, AuditPage, AuditSink, InMemoryAuditSink};
use keystone_core::auth::{Claims, JwtConfig, JwtValidator};
use keystone_core::engine::{EngineDecision, MemoryRuleEngine, PolicyRule, RuleEngine};
use keystone_core::error::{KeystoneError, Result};
use keystone_core::factory::GuardStack;
use keystone_core::guard::GuardOptions;
use keystone_core::hierarchy::CharacterRecord;
use keystone_core::models::UserId;
use keystone_core::policy::{HierarchySync, PolicyGrant};
use keystone_core::subject::Subject;

pub const SECRET: &str = "integration-test-secret";
pub const ADMIN: &str = "admin-user";

// ============================================================================
// Tokens
// ============================================================================

pub fn issuer() -> JwtValidator {
    JwtValidator::new(JwtConfig::builder().jwt_secret(SECRET).build()).unwrap()
}

pub fn token_for(user_id: &str) -> String {
    issuer().issue(&Claims::builder(user_id).build()).unwrap()
}

pub fn bearer(user_id: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::AUTHORIZATION,
        HeaderValue::from_str(&format!("Bearer {}", token_for(user_id))).unwrap(),
    );
    headers
}

// ============================================================================
// Stacks
// ============================================================================

pub struct Harness {
    pub stack: GuardStack,
    pub engine: Arc<ScriptedEngine>,
    pub audit: Arc<InMemoryAuditSink>,
}

impl Harness {
    pub fn new(options: GuardOptions) -> Self {
        let engine = Arc::new(ScriptedEngine::new());
        let audit = Arc::new(InMemoryAuditSink::new());
        let stack = GuardStack::builder()
            .jwt_secret(SECRET)
            .engine(engine.clone())
            .audit_sink(audit.clone())
            .inline_audit()
            .options(options)
            .build()
            .unwrap();
        Self { stack, engine, audit }
    }

    pub fn development() -> Self {
        Self::new(GuardOptions::development())
    }

    pub async fn sync(&self, user_id: &str, characters: Vec<CharacterRecord>) {
        self.stack
            .policy
            .sync_hierarchy(
                HierarchySync {
                    user_id: UserId::new(user_id),
                    characters,
                },
                &UserId::new(ADMIN),
            )
            .await
            .unwrap();
    }

    pub async fn allow(&self, subject: Subject, resource: &str, action: &str) {
        self.stack
            .policy
            .grant_policy(PolicyGrant::allow(subject, resource, action), &UserId::new(ADMIN))
            .await
            .unwrap();
    }

    pub async fn deny(&self, subject: Subject, resource: &str, action: &str) {
        self.stack
            .policy
            .grant_policy(PolicyGrant::deny(subject, resource, action), &UserId::new(ADMIN))
            .await
            .unwrap();
    }

    /// Give `user_id` the full admin permission set.
    pub async fn make_admin(&self, user_id: &str) {
        self.allow(Subject::user(user_id), "authz:admin", "manage").await;
    }
}

/// One character in `CORP1`/`ALLY1` plus one alt in `CORP2` without alliance.
pub fn pilot_characters() -> Vec<CharacterRecord> {
    vec![
        CharacterRecord::new("C1", "Main", "CORP1").in_alliance("ALLY1").primary(),
        CharacterRecord::new("C2", "Alt", "CORP2"),
    ]
}

// ============================================================================
// Scripted collaborators
// ============================================================================

/// In-memory engine that can be told to fail or stall its decisions, and
/// records which resources were asked about.
pub struct ScriptedEngine {
    inner: MemoryRuleEngine,
    failing: AtomicBool,
    delay: Mutex<Option<Duration>>,
    decide_calls: AtomicUsize,
    asked: Mutex<Vec<String>>,
}

impl ScriptedEngine {
    pub fn new() -> Self {
        Self {
            inner: MemoryRuleEngine::new(),
            failing: AtomicBool::new(false),
            delay: Mutex::new(None),
            decide_calls: AtomicUsize::new(0),
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn stall(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn decide_calls(&self) -> usize {
        self.decide_calls.load(Ordering::SeqCst)
    }

    /// Distinct `resource:action` pairs asked about, in first-asked order.
    pub fn asked(&self) -> Vec<String> {
        self.asked.lock().clone()
    }

    pub fn reset_counters(&self) {
        self.decide_calls.store(0, Ordering::SeqCst);
        self.asked.lock().clear();
    }
}

#[async_trait]
impl RuleEngine for ScriptedEngine {
    async fn enforce(&self, subject: &Subject, resource: &str, action: &str, domain: &str) -> Result<bool> {
        Ok(self.decide(subject, resource, action, domain).await?.is_allowed())
    }

    async fn decide(&self, subject: &Subject, resource: &str, action: &str, domain: &str) -> Result<EngineDecision> {
        self.decide_calls.fetch_add(1, Ordering::SeqCst);
        {
            let key = format!("{}:{}", resource, action);
            let mut asked = self.asked.lock();
            if !asked.contains(&key) {
                asked.push(key);
            }
        }

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(KeystoneError::rule_engine("connection reset by peer"));
        }
        self.inner.decide(subject, resource, action, domain).await
    }

    async fn add_policy(&self, rule: &PolicyRule) -> Result<bool> {
        self.inner.add_policy(rule).await
    }

    async fn remove_policy(&self, rule: &PolicyRule) -> Result<bool> {
        self.inner.remove_policy(rule).await
    }

    async fn add_role_for_subject(
        &self,
        subject: &Subject,
        role: &str,
        domain: &str,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        self.inner.add_role_for_subject(subject, role, domain, expires_at).await
    }

    async fn remove_role_for_subject(&self, subject: &Subject, role: &str, domain: &str) -> Result<bool> {
        self.inner.remove_role_for_subject(subject, role, domain).await
    }

    async fn roles_for_subject(&self, subject: &Subject, domain: &str) -> Result<Vec<String>> {
        self.inner.roles_for_subject(subject, domain).await
    }

    async fn permissions_for_subject(&self, subject: &Subject) -> Result<Vec<PolicyRule>> {
        self.inner.permissions_for_subject(subject).await
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Audit store that is always down.
pub struct DownAuditSink;

#[async_trait]
impl AuditSink for DownAuditSink {
    async fn append(&self, _: &AuditLogEntry) -> Result<()> {
        Err(KeystoneError::internal("audit store unreachable"))
    }

    async fn query(&self, _: &AuditFilter, _: u32, _: u32) -> Result<AuditPage> {
        Err(KeystoneError::internal("audit store unreachable"))
    }

    fn name(&self) -> &'static str {
        "down"
    }
}
