use serde::{Deserialize, Serialize};
use std::collections::HashSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CredentialSource {
    ApiKey,
    Session,
    Jwt,
    None,
}

/// Exists only for the lifetime of one request; attached to the request by
/// the auth boundary, never persisted, never handed to plugin code.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestContext {
    pub subject: String,
    pub scopes: HashSet<String>,
    pub is_admin: bool,
    pub source: CredentialSource,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
}

impl RequestContext {
    pub fn has_scope(&self, scope: &str) -> bool {
        if self.scopes.contains("*") || self.scopes.contains(scope) {
            return true;
        }
        if let Some((namespace, _)) = scope.split_once('.') {
            if self.scopes.contains(&format!("{namespace}.*")) {
                return true;
            }
        }
        false
    }
}
