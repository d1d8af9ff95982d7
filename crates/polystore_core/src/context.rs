//! Per-call request context.

use crate::error::{CoreError, CoreResult};

/// Who is calling, on behalf of which tenant, and how to correlate the call.
///
/// Passed explicitly to every [`crate::Database`] operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    /// Tenant the call is scoped to.
    pub tenant_id: String,
    /// Acting user or service.
    pub actor_id: String,
    /// Roles held by the actor, recorded in audit entries.
    pub roles: Vec<String>,
    /// Distributed trace id.
    pub trace_id: Option<String>,
    /// Request id.
    pub request_id: Option<String>,
    /// Lifts tenant scoping from reads and lets creates name their tenant.
    pub admin_bypass: bool,
}

impl RequestContext {
    /// Creates a context for `actor_id` acting within `tenant_id`.
    pub fn new(tenant_id: impl Into<String>, actor_id: impl Into<String>) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            actor_id: actor_id.into(),
            roles: Vec::new(),
            trace_id: None,
            request_id: None,
            admin_bypass: false,
        }
    }

    /// Sets the actor's roles.
    #[must_use]
    pub fn roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles = roles.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the trace id.
    #[must_use]
    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    /// Sets the request id.
    #[must_use]
    pub fn request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// Enables administrative bypass of tenant scoping.
    #[must_use]
    pub fn admin_bypass(mut self, bypass: bool) -> Self {
        self.admin_bypass = bypass;
        self
    }

    pub(crate) fn require_tenant(&self) -> CoreResult<&str> {
        if self.tenant_id.trim().is_empty() {
            return Err(CoreError::MissingTenant);
        }
        Ok(&self.tenant_id)
    }
}
