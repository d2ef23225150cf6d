//! Permission identifiers, stored grants and the administration service.
//!
//! - [`PermissionId`]: parsed `resource:category:action`
//! - [`PolicyStore`]: metadata rows behind every engine rule and role link
//! - [`PolicyService`]: grant / revoke / assign / sync / cleanup

mod models;
mod permission;
mod service;
mod store;

pub use models::{
    BulkFailure, BulkOutcome, CleanupReport, EffectivePermission, GrantOutcome, HierarchySync, PermissionPolicy,
    PermissionSource, PolicyFilter, PolicyGrant, PolicyKey, RevokeOutcome, RoleAssignment, RoleGrant,
};
pub use permission::{validate_role_name, validate_rule_parts, PermissionId};
pub use service::PolicyService;
pub use store::{InMemoryPolicyStore, PolicyStore};
