//! Connection scopes and delivery targets.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::RegistrationError;
use crate::ids::{PrincipalId, ProjectId};

/// Addressing dimension of a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Personal channel of a principal.
    User,
    /// Channel of one project.
    Project,
    /// Dashboard-wide channel.
    Dashboard,
}

impl Scope {
    /// Wire name of the scope.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Project => "project",
            Self::Dashboard => "dashboard",
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scope {
    type Err = RegistrationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "user" => Ok(Self::User),
            "project" => Ok(Self::Project),
            "dashboard" => Ok(Self::Dashboard),
            other => Err(RegistrationError::InvalidScope(other.to_owned())),
        }
    }
}

/// The one scope binding a connection holds for its whole lifetime.
///
/// The project id lives inside the `Project` variant, so a project id is
/// present exactly when the scope is `Project`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum ScopeBinding {
    /// Bound to the owning principal's personal channel.
    User,
    /// Bound to a project channel.
    Project {
        /// The project this connection listens to.
        #[serde(rename = "projectId")]
        project_id: ProjectId,
    },
    /// Bound to the dashboard channel.
    Dashboard,
}

impl ScopeBinding {
    /// Build a binding from the loose `(scope, project_id?)` pair received at
    /// upgrade time.
    pub fn from_parts(
        scope: Scope,
        project_id: Option<ProjectId>,
    ) -> Result<Self, RegistrationError> {
        let project_id = project_id.filter(|p| !p.is_blank());
        match (scope, project_id) {
            (Scope::Project, Some(project_id)) => Ok(Self::Project { project_id }),
            (Scope::Project, None) => Err(RegistrationError::MissingProject),
            (Scope::User, None) => Ok(Self::User),
            (Scope::Dashboard, None) => Ok(Self::Dashboard),
            (scope, Some(_)) => Err(RegistrationError::UnexpectedProject(scope)),
        }
    }

    /// The scope this binding belongs to.
    pub fn scope(&self) -> Scope {
        match self {
            Self::User => Scope::User,
            Self::Project { .. } => Scope::Project,
            Self::Dashboard => Scope::Dashboard,
        }
    }

    /// Project id for project-scoped bindings.
    pub fn project_id(&self) -> Option<&ProjectId> {
        match self {
            Self::Project { project_id } => Some(project_id),
            Self::User | Self::Dashboard => None,
        }
    }
}

/// Where a message is delivered.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "snake_case")]
pub enum Target {
    /// User-scope connections of one principal.
    User(PrincipalId),
    /// Connections bound to one project.
    Project(ProjectId),
    /// All dashboard-scope connections.
    Dashboard,
    /// Every project-scope connection owned by one principal.
    UserProjects(PrincipalId),
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Project(id) => write!(f, "project:{id}"),
            Self::Dashboard => f.write_str("dashboard"),
            Self::UserProjects(id) => write!(f, "user_projects:{id}"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
