//! Hierarchical authorization: service rules, then handler rules, then method
//! rules.
//!
//! Each scope carries zero or more [`AuthorizeData`] rules:
//!
//! - no rules: the scope inherits its parent's decision (the service scope's
//!   parent always allows);
//! - `AllowAnonymous`: always passes;
//! - `Override`: the scope's own rules decide, the parent is ignored;
//! - `Authorize`: the parent must allow and every rule of the scope must pass.
//!
//! A rule passes for an authenticated principal holding any of its roles (any
//! role when the list is empty).

use std::collections::BTreeMap;

use rowsync_core::metadata::{AuthorizeData, MethodInfoData, MethodOwner, ServiceMetadata};
use rowsync_core::types::Principal;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthorizationError {
    #[error("access denied for '{principal}' to method '{method}'")]
    AccessDenied { principal: String, method: String },
}

#[derive(Debug, Default)]
struct HandlerNode {
    rules: Vec<AuthorizeData>,
    methods: BTreeMap<String, Vec<AuthorizeData>>,
}

/// Authorization tree for one set of methods, built once per operation.
#[derive(Debug, Default)]
pub struct AuthorizationTree {
    service: Vec<AuthorizeData>,
    handlers: BTreeMap<String, HandlerNode>,
    bare_methods: BTreeMap<String, Vec<AuthorizeData>>,
}

impl AuthorizationTree {
    /// Groups `methods` under their owning handlers. Handlers and methods are
    /// deduplicated by name.
    #[must_use]
    pub fn build<'a, I>(metadata: &ServiceMetadata, methods: I) -> Self
    where
        I: IntoIterator<Item = &'a MethodInfoData>,
    {
        let mut tree = Self {
            service: metadata.authorize.clone(),
            ..Self::default()
        };
        for method in methods {
            match &method.owner {
                MethodOwner::Service => {
                    tree.bare_methods
                        .entry(method.method_name.clone())
                        .or_insert_with(|| method.authorize.clone());
                }
                MethodOwner::Handler(name) => {
                    let node = tree.handlers.entry(name.clone()).or_insert_with(|| HandlerNode {
                        rules: metadata
                            .handlers
                            .get(name)
                            .map(|h| h.authorize.clone())
                            .unwrap_or_default(),
                        methods: BTreeMap::new(),
                    });
                    node.methods
                        .entry(method.method_name.clone())
                        .or_insert_with(|| method.authorize.clone());
                }
            }
        }
        tree
    }

    /// Number of distinct methods in the tree.
    #[must_use]
    pub fn method_count(&self) -> usize {
        self.bare_methods.len() + self.handlers.values().map(|h| h.methods.len()).sum::<usize>()
    }

    /// Checks every method. Fails on the first denied method.
    ///
    /// # Errors
    ///
    /// Returns [`AuthorizationError::AccessDenied`] naming the principal and
    /// the first method it may not call.
    pub fn authorize(&self, principal: &Principal) -> Result<(), AuthorizationError> {
        let service_ok = resolve_scope(&self.service, true, principal);
        for (name, rules) in &self.bare_methods {
            if !resolve_scope(rules, service_ok, principal) {
                return Err(denied(principal, name));
            }
        }
        for (handler, node) in &self.handlers {
            let handler_ok = resolve_scope(&node.rules, service_ok, principal);
            debug!(handler = %handler, allowed = handler_ok, "handler scope resolved");
            for (name, rules) in &node.methods {
                if !resolve_scope(rules, handler_ok, principal) {
                    return Err(denied(principal, name));
                }
            }
        }
        Ok(())
    }
}

fn denied(principal: &Principal, method: &str) -> AuthorizationError {
    warn!(principal = principal.display_name(), method, "access denied");
    AuthorizationError::AccessDenied {
        principal: principal.display_name().to_string(),
        method: method.to_string(),
    }
}

/// Decision of one scope given its parent's decision.
fn resolve_scope(rules: &[AuthorizeData], parent_allowed: bool, principal: &Principal) -> bool {
    if rules.is_empty() {
        return parent_allowed;
    }
    if rules.iter().any(|r| matches!(r, AuthorizeData::AllowAnonymous)) {
        return true;
    }
    let overrides = rules.iter().any(|r| matches!(r, AuthorizeData::Override { .. }));
    let own = rules.iter().all(|r| rule_passes(r, principal));
    if overrides {
        own
    } else {
        parent_allowed && own
    }
}

fn rule_passes(rule: &AuthorizeData, principal: &Principal) -> bool {
    match rule {
        AuthorizeData::AllowAnonymous => true,
        AuthorizeData::Authorize { roles } | AuthorizeData::Override { roles } => {
            principal.authenticated
                && (roles.is_empty() || roles.iter().any(|r| principal.is_in_role(r)))
        }
    }
}

/// Authorizes one batch of methods against `metadata`.
///
/// # Errors
///
/// See [`AuthorizationTree::authorize`].
pub fn authorize_methods<'a, I>(
    metadata: &ServiceMetadata,
    principal: &Principal,
    methods: I,
) -> Result<(), AuthorizationError>
where
    I: IntoIterator<Item = &'a MethodInfoData>,
{
    let tree = AuthorizationTree::build(metadata, methods);
    debug!(methods = tree.method_count(), "authorizing");
    tree.authorize(principal)
}
