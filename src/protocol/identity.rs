//! Client identities and roles.

use crate::error::DaqError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Logical channel a client belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Cryogenics coordinator
    Cryo,
    /// Magnetism coordinator
    Magnetism,
    /// Dashboard in a browser
    #[serde(rename = "webbrowser")]
    Browser,
}

impl Role {
    /// Both measuring roles, in the order they are addressed.
    pub const COORDINATORS: [Role; 2] = [Role::Cryo, Role::Magnetism];

    /// Prefix used in idn strings.
    pub fn prefix(&self) -> &'static str {
        match self {
            Role::Cryo => "cryo",
            Role::Magnetism => "magnetism",
            Role::Browser => "webbrowser",
        }
    }

    /// Whether this role measures steps.
    pub fn is_coordinator(&self) -> bool {
        !matches!(self, Role::Browser)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Transport connection handle, unique for the lifetime of a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Parsed `role_hwid` identity string.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientIdentity {
    /// Role taken from the prefix
    pub role: Role,
    /// Everything after the first underscore
    pub hardware_id: String,
}

impl ClientIdentity {
    /// Builds an identity from its parts.
    pub fn new(role: Role, hardware_id: impl Into<String>) -> Self {
        Self {
            role,
            hardware_id: hardware_id.into(),
        }
    }

    /// Identity for this machine, using the host name unless overridden.
    pub fn local(role: Role, hardware_id: Option<&str>) -> Self {
        let hardware_id = match hardware_id {
            Some(id) => id.to_string(),
            None => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "unknown".to_string()),
        };
        Self::new(role, hardware_id)
    }
}

impl fmt::Display for ClientIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.role.prefix(), self.hardware_id)
    }
}

impl FromStr for ClientIdentity {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, hardware_id) = s
            .split_once('_')
            .ok_or_else(|| DaqError::InvalidIdentity(s.to_string()))?;
        if hardware_id.is_empty() {
            return Err(DaqError::InvalidIdentity(s.to_string()));
        }
        let role = match prefix {
            "cryo" => Role::Cryo,
            "magnetism" => Role::Magnetism,
            "webbrowser" => Role::Browser,
            _ => return Err(DaqError::InvalidIdentity(s.to_string())),
        };
        Ok(Self::new(role, hardware_id))
    }
}
