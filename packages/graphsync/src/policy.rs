//! Permission collaborator
//!
//! The evaluator only relies on the boolean contract of [`AccessPolicy`].
//! [`RulePolicy`] is a declarative implementation loaded from JSON:
//!
//! ```json
//! {
//!   "models": {
//!     "Todo": { "view": ["*"], "send": ["active", "find"] },
//!     "User": { "view": ["id", "email"], "require_principal": true },
//!     "Audit": { "view": ["*"], "roles": ["admin"] }
//!   }
//! }
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::store::Datum;

/// Identity the permission checks of one batch run against
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActingPrincipal {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl ActingPrincipal {
    pub fn anonymous() -> Self {
        Self::default()
    }

    pub fn user(id: impl Into<String>) -> Self {
        ActingPrincipal {
            id: Some(id.into()),
            roles: Vec::new(),
        }
    }

    pub fn with_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.roles.extend(roles.into_iter().map(Into::into));
        self
    }

    pub fn is_anonymous(&self) -> bool {
        self.id.is_none()
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    View,
    Send,
    Create,
    Update,
    Destroy,
}

impl Permission {
    fn verb(&self) -> &'static str {
        match self {
            Permission::View => "view",
            Permission::Send => "send",
            Permission::Create => "create",
            Permission::Update => "update",
            Permission::Destroy => "destroy",
        }
    }
}

/// Boolean permission contract. Create, update and destroy are denied unless
/// a policy opts in.
pub trait AccessPolicy: Send + Sync {
    fn view_permitted(&self, principal: &ActingPrincipal, subject: &Datum, attribute: &str) -> bool;

    fn send_permitted(&self, principal: &ActingPrincipal, subject: &Datum, method: &str) -> bool;

    fn create_permitted(&self, _principal: &ActingPrincipal, _subject: &Datum) -> bool {
        false
    }

    fn update_permitted(&self, _principal: &ActingPrincipal, _subject: &Datum) -> bool {
        false
    }

    fn destroy_permitted(&self, _principal: &ActingPrincipal, _subject: &Datum) -> bool {
        false
    }
}

/// Run one check and turn a denial into [`SyncError::AccessViolation`]
pub fn check_permission(
    policy: &dyn AccessPolicy,
    principal: &ActingPrincipal,
    subject: &Datum,
    permission: Permission,
    name: &str,
) -> Result<()> {
    let permitted = match permission {
        Permission::View => policy.view_permitted(principal, subject, name),
        Permission::Send => policy.send_permitted(principal, subject, name),
        Permission::Create => policy.create_permitted(principal, subject),
        Permission::Update => policy.update_permitted(principal, subject),
        Permission::Destroy => policy.destroy_permitted(principal, subject),
    };
    if permitted {
        return Ok(());
    }
    let who = principal.id.as_deref().unwrap_or("anonymous");
    Err(SyncError::AccessViolation(format!(
        "{} may not {} {} on {}",
        who,
        permission.verb(),
        name,
        subject.describe()
    )))
}

/// Allows every view and send
#[derive(Debug, Clone, Copy, Default)]
pub struct PermitAll;

impl AccessPolicy for PermitAll {
    fn view_permitted(&self, _: &ActingPrincipal, _: &Datum, _: &str) -> bool {
        true
    }

    fn send_permitted(&self, _: &ActingPrincipal, _: &Datum, _: &str) -> bool {
        true
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelRules {
    /// Viewable attributes; `"*"` allows all
    #[serde(default)]
    pub view: Vec<String>,
    /// Callable methods, associations and scopes; `"*"` allows all
    #[serde(default)]
    pub send: Vec<String>,
    /// Deny everything to anonymous principals
    #[serde(default)]
    pub require_principal: bool,
    /// When non-empty, the principal must hold one of these roles
    #[serde(default)]
    pub roles: Vec<String>,
    #[serde(default)]
    pub create: bool,
    #[serde(default)]
    pub update: bool,
    #[serde(default)]
    pub destroy: bool,
}

impl ModelRules {
    fn admits(&self, principal: &ActingPrincipal) -> bool {
        if self.require_principal && principal.is_anonymous() {
            return false;
        }
        self.roles.is_empty() || self.roles.iter().any(|role| principal.has_role(role))
    }
}

fn listed(names: &[String], name: &str) -> bool {
    names.iter().any(|n| n == "*" || n == name)
}

/// Per-model allowlists. Models without rules deny everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RulePolicy {
    #[serde(default)]
    pub models: HashMap<String, ModelRules>,
}

impl RulePolicy {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn allow(mut self, model: &str, rules: ModelRules) -> Self {
        self.models.insert(model.to_string(), rules);
        self
    }

    fn rules(&self, principal: &ActingPrincipal, subject: &Datum) -> Option<&ModelRules> {
        let rules = self.models.get(subject.model_name()?)?;
        rules.admits(principal).then_some(rules)
    }
}

impl AccessPolicy for RulePolicy {
    fn view_permitted(&self, principal: &ActingPrincipal, subject: &Datum, attribute: &str) -> bool {
        self.rules(principal, subject)
            .is_some_and(|r| listed(&r.view, attribute))
    }

    fn send_permitted(&self, principal: &ActingPrincipal, subject: &Datum, method: &str) -> bool {
        self.rules(principal, subject)
            .is_some_and(|r| listed(&r.send, method))
    }

    fn create_permitted(&self, principal: &ActingPrincipal, subject: &Datum) -> bool {
        self.rules(principal, subject).is_some_and(|r| r.create)
    }

    fn update_permitted(&self, principal: &ActingPrincipal, subject: &Datum) -> bool {
        self.rules(principal, subject).is_some_and(|r| r.update)
    }

    fn destroy_permitted(&self, principal: &ActingPrincipal, subject: &Datum) -> bool {
        self.rules(principal, subject).is_some_and(|r| r.destroy)
    }
}
