//! Immutable guard configuration and named profiles.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::models::GLOBAL_DOMAIN;

/// Named option presets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    /// Verbose stage logging, generous timeouts, no circuit breaker.
    Development,
    /// Quiet logging, tight timeouts, circuit breaker on.
    #[default]
    Production,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Development => "development",
            Self::Production => "production",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerOptions {
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
}

/// Guard configuration, fixed at construction and shared by reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuardOptions {
    profile: Profile,
    debug_logging: bool,
    fallback_to_auth_only: bool,
    circuit_breaker: Option<CircuitBreakerOptions>,
    call_timeout: Option<Duration>,
    domain: String,
    role_subjects: bool,
    audit_decisions: bool,
    decision_ttl: Duration,
    hierarchy_ttl: Duration,
    cookie_name: String,
}

impl Default for GuardOptions {
    fn default() -> Self {
        Self::for_profile(Profile::default())
    }
}

impl GuardOptions {
    pub fn builder() -> GuardOptionsBuilder {
        GuardOptionsBuilder {
            options: Self::default(),
        }
    }

    pub fn for_profile(profile: Profile) -> Self {
        let base = Self {
            profile,
            debug_logging: false,
            fallback_to_auth_only: true,
            circuit_breaker: None,
            call_timeout: None,
            domain: GLOBAL_DOMAIN.to_string(),
            role_subjects: true,
            audit_decisions: false,
            decision_ttl: Duration::from_secs(5 * 60),
            hierarchy_ttl: Duration::from_secs(15 * 60),
            cookie_name: "access_token".to_string(),
        };

        match profile {
            Profile::Development => Self {
                debug_logging: true,
                call_timeout: Some(Duration::from_secs(2)),
                ..base
            },
            Profile::Production => Self {
                circuit_breaker: Some(CircuitBreakerOptions {
                    failure_threshold: 5,
                    recovery_timeout: Duration::from_secs(30),
                }),
                call_timeout: Some(Duration::from_millis(500)),
                ..base
            },
        }
    }

    pub fn development() -> Self {
        Self::for_profile(Profile::Development)
    }

    pub fn production() -> Self {
        Self::for_profile(Profile::Production)
    }

    /// A builder seeded with these options.
    pub fn to_builder(&self) -> GuardOptionsBuilder {
        GuardOptionsBuilder { options: self.clone() }
    }

    pub fn profile(&self) -> Profile {
        self.profile
    }

    pub fn debug_logging(&self) -> bool {
        self.debug_logging
    }

    pub fn fallback_to_auth_only(&self) -> bool {
        self.fallback_to_auth_only
    }

    pub fn circuit_breaker(&self) -> Option<CircuitBreakerOptions> {
        self.circuit_breaker
    }

    pub fn call_timeout(&self) -> Option<Duration> {
        self.call_timeout
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn role_subjects(&self) -> bool {
        self.role_subjects
    }

    pub fn audit_decisions(&self) -> bool {
        self.audit_decisions
    }

    pub fn decision_ttl(&self) -> Duration {
        self.decision_ttl
    }

    pub fn hierarchy_ttl(&self) -> Duration {
        self.hierarchy_ttl
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }
}

#[derive(Debug, Clone)]
pub struct GuardOptionsBuilder {
    options: GuardOptions,
}

impl GuardOptionsBuilder {
    pub fn debug_logging(mut self, enabled: bool) -> Self {
        self.options.debug_logging = enabled;
        self
    }

    pub fn fallback_to_auth_only(mut self, enabled: bool) -> Self {
        self.options.fallback_to_auth_only = enabled;
        self
    }

    pub fn circuit_breaker(mut self, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        self.options.circuit_breaker = Some(CircuitBreakerOptions {
            failure_threshold,
            recovery_timeout,
        });
        self
    }

    pub fn without_circuit_breaker(mut self) -> Self {
        self.options.circuit_breaker = None;
        self
    }

    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.options.call_timeout = Some(timeout);
        self
    }

    pub fn without_call_timeout(mut self) -> Self {
        self.options.call_timeout = None;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.options.domain = domain.into();
        self
    }

    pub fn role_subjects(mut self, enabled: bool) -> Self {
        self.options.role_subjects = enabled;
        self
    }

    pub fn audit_decisions(mut self, enabled: bool) -> Self {
        self.options.audit_decisions = enabled;
        self
    }

    pub fn decision_ttl(mut self, ttl: Duration) -> Self {
        self.options.decision_ttl = ttl;
        self
    }

    pub fn hierarchy_ttl(mut self, ttl: Duration) -> Self {
        self.options.hierarchy_ttl = ttl;
        self
    }

    pub fn cookie_name(mut self, name: impl Into<String>) -> Self {
        self.options.cookie_name = name.into();
        self
    }

    pub fn build(self) -> GuardOptions {
        self.options
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profiles() {
        let dev = GuardOptions::development();
        assert!(dev.debug_logging());
        assert!(dev.fallback_to_auth_only());
        assert!(dev.circuit_breaker().is_none());

        let prod = GuardOptions::production();
        assert!(!prod.debug_logging());
        assert!(prod.fallback_to_auth_only());
        assert_eq!(prod.circuit_breaker().unwrap().failure_threshold, 5);
        assert_eq!(prod.call_timeout(), Some(Duration::from_millis(500)));
    }

    #[test]
    fn test_builder_overrides() {
        let options = GuardOptions::production()
            .to_builder()
            .fallback_to_auth_only(false)
            .without_circuit_breaker()
            .audit_decisions(true)
            .build();

        assert!(!options.fallback_to_auth_only());
        assert!(options.circuit_breaker().is_none());
        assert!(options.audit_decisions());
        assert_eq!(options.profile(), Profile::Production);
        assert_eq!(options.domain(), GLOBAL_DOMAIN);
    }

    #[test]
    fn test_profile_deserializes_lowercase() {
        let p: Profile = serde_json::from_str("\"development\"").unwrap();
        assert_eq!(p, Profile::Development);
        assert_eq!(Profile::default(), Profile::Production);
    }
}
