use kernel_core::error::{KernelError, KernelResult};
use kernel_core::request_context::RequestContext;
use std::collections::HashMap;
use std::sync::LazyLock;

/// `service action name → required scope`. Small and compile-time-known,
/// so a plain static table beats reaching for a build-time perfect-hash
/// dependency.
static ACTION_SCOPES: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("devices.list", "devices.read"),
        ("devices.get", "devices.read"),
        ("devices.set_state", "devices.write"),
        ("devices.remove", "devices.write"),
        ("automation.list", "automation.read"),
        ("automation.create", "automation.write"),
        ("automation.update", "automation.write"),
        ("automation.delete", "automation.write"),
        ("integrations.list", "integrations.read"),
        ("integrations.configure", "integrations.write"),
    ])
});

/// A pure function layer above auth: no storage access, no side effects.
/// `resource` is accepted for future per-object ACLs and currently
/// ignored.
pub fn check(ctx: Option<&RequestContext>, action: &str, _resource: Option<&str>) -> bool {
    let Some(ctx) = ctx else {
        return false;
    };
    if ctx.is_admin {
        return true;
    }
    if ctx.scopes.contains("*") {
        return true;
    }
    if action.starts_with("admin.") {
        return ctx.has_scope("admin.*");
    }
    match ACTION_SCOPES.get(action) {
        Some(scope) => ctx.has_scope(scope),
        None => false,
    }
}

pub fn require(ctx: Option<&RequestContext>, action: &str, resource: Option<&str>) -> KernelResult<()> {
    if check(ctx, action, resource) {
        Ok(())
    } else {
        Err(KernelError::Unauthorized)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_core::request_context::CredentialSource;
    use std::collections::HashSet;

    fn ctx(scopes: &[&str], is_admin: bool) -> RequestContext {
        RequestContext {
            subject: "u1".into(),
            scopes: scopes.iter().map(|s| s.to_string()).collect(),
            is_admin,
            source: CredentialSource::ApiKey,
            user_id: None,
            session_id: None,
        }
    }

    #[test]
    fn no_context_is_always_denied() {
        assert!(!check(None, "devices.list", None));
    }

    #[test]
    fn admin_flag_bypasses_scope_check() {
        assert!(check(Some(&ctx(&[], true)), "devices.set_state", None));
    }

    #[test]
    fn wildcard_scope_grants_everything() {
        assert!(check(Some(&ctx(&["*"], false)), "devices.set_state", None));
    }

    #[test]
    fn admin_action_requires_admin_wildcard_scope() {
        assert!(!check(Some(&ctx(&["devices.read"], false)), "admin.restart", None));
        assert!(check(Some(&ctx(&["admin.*"], false)), "admin.restart", None));
    }

    #[test]
    fn mapped_action_requires_matching_scope() {
        assert!(check(Some(&ctx(&["devices.read"], false)), "devices.list", None));
        assert!(!check(Some(&ctx(&["devices.read"], false)), "devices.set_state", None));
    }

    #[test]
    fn unmapped_action_is_denied() {
        assert!(!check(Some(&ctx(&["devices.read"], false)), "nonexistent.action", None));
    }

    #[test]
    fn require_raises_on_false() {
        assert!(require(None, "devices.list", None).is_err());
        assert!(require(Some(&ctx(&["devices.read"], false)), "devices.list", None).is_ok());
    }
}
