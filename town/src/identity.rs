//! Agent identities: path-style addresses, roles, and session naming.
//!
//! An address is `<rig>/<role>/<name>` for rig-scoped agents, or the
//! top-level singletons `mayor` and `deacon`. Addresses arrive with and
//! without trailing slashes (`mayor`, `mayor/`); they are normalized at
//! ingress and stored in one canonical form.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Marks the current process as a polecat. Polecats may not sling.
pub const POLECAT_ENV: &str = "GT_POLECAT";

/// Carries the current process's own address.
pub const SELF_ENV: &str = "GT_SELF";

/// Agent roles. Polecats are ephemeral per-work-item agents; crew are
/// persistent named workers; dogs are the deacon's helper pool; witness
/// and refinery are the per-rig patrol agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Mayor,
    Deacon,
    Polecat,
    Crew,
    Dog,
    Witness,
    Refinery,
}

impl Role {
    fn segment(self) -> &'static str {
        match self {
            Role::Mayor => "mayor",
            Role::Deacon => "deacon",
            Role::Polecat => "polecats",
            Role::Crew => "crew",
            Role::Dog => "dogs",
            Role::Witness => "witness",
            Role::Refinery => "refinery",
        }
    }

    fn from_segment(s: &str) -> Option<Role> {
        match s {
            "polecats" => Some(Role::Polecat),
            "crew" => Some(Role::Crew),
            "dogs" => Some(Role::Dog),
            "witness" => Some(Role::Witness),
            "refinery" => Some(Role::Refinery),
            _ => None,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.segment())
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("unknown role segment in address: {0}")]
    UnknownRole(String),
    #[error("malformed address: {0}")]
    Malformed(String),
}

/// A normalized agent address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    /// Rig the agent belongs to; `None` for the top-level singletons.
    pub rig: Option<String>,
    pub role: Role,
    /// Instance name. Singleton roles (mayor, deacon, witness, refinery)
    /// carry no name.
    pub name: Option<String>,
}

impl Address {
    pub fn mayor() -> Self {
        Self { rig: None, role: Role::Mayor, name: None }
    }

    pub fn deacon() -> Self {
        Self { rig: None, role: Role::Deacon, name: None }
    }

    pub fn polecat(rig: &str, name: &str) -> Self {
        Self {
            rig: Some(rig.to_string()),
            role: Role::Polecat,
            name: Some(name.to_string()),
        }
    }

    pub fn crew(rig: &str, name: &str) -> Self {
        Self {
            rig: Some(rig.to_string()),
            role: Role::Crew,
            name: Some(name.to_string()),
        }
    }

    pub fn witness(rig: &str) -> Self {
        Self { rig: Some(rig.to_string()), role: Role::Witness, name: None }
    }

    /// Dogs live under the deacon; `deacon` stands in for the rig
    /// segment so the address reads `deacon/dogs/<name>`.
    pub fn dog(name: &str) -> Self {
        Self {
            rig: Some("deacon".to_string()),
            role: Role::Dog,
            name: Some(name.to_string()),
        }
    }

    /// Terminal-multiplexer session name: `gt-<rig>-<role>[-<name>]`,
    /// `gt-mayor` / `gt-deacon` for the singletons.
    pub fn session_name(&self) -> String {
        let mut s = String::from("gt");
        if let Some(rig) = &self.rig {
            s.push('-');
            s.push_str(rig);
        }
        s.push('-');
        s.push_str(self.role.segment());
        if let Some(name) = &self.name {
            s.push('-');
            s.push_str(name);
        }
        s
    }

    /// Slug used for the agent's record bead id: `hq-agent-<slug>`.
    pub fn agent_bead_id(&self) -> String {
        format!("hq-agent-{}", self.to_string().replace('/', "-"))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.rig, &self.name) {
            (Some(rig), Some(name)) => write!(f, "{rig}/{}/{name}", self.role.segment()),
            (Some(rig), None) => write!(f, "{rig}/{}", self.role.segment()),
            (None, Some(name)) => write!(f, "{}/{name}", self.role.segment()),
            (None, None) => f.write_str(self.role.segment()),
        }
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim().trim_end_matches('/');
        if trimmed.is_empty() {
            return Err(AddressError::Empty);
        }

        let parts: Vec<&str> = trimmed.split('/').collect();
        match parts.as_slice() {
            ["mayor"] => Ok(Address::mayor()),
            ["deacon"] => Ok(Address::deacon()),
            ["deacon", "dogs"] => Ok(Address {
                rig: Some("deacon".to_string()),
                role: Role::Dog,
                name: None,
            }),
            ["deacon", "dogs", name] => Ok(Address::dog(name)),
            [rig, role] => {
                let role = Role::from_segment(role)
                    .ok_or_else(|| AddressError::UnknownRole(role.to_string()))?;
                Ok(Address { rig: Some(rig.to_string()), role, name: None })
            }
            [rig, role, name] => {
                let role = Role::from_segment(role)
                    .ok_or_else(|| AddressError::UnknownRole(role.to_string()))?;
                Ok(Address {
                    rig: Some(rig.to_string()),
                    role,
                    name: Some(name.to_string()),
                })
            }
            _ => Err(AddressError::Malformed(raw.to_string())),
        }
    }
}

/// Whether the current process is a polecat (`GT_POLECAT=1`).
pub fn is_polecat() -> bool {
    std::env::var(POLECAT_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// The current process's own address from `GT_SELF`, defaulting to mayor.
pub fn self_address() -> Address {
    std::env::var(SELF_ENV)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(Address::mayor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_top_level() {
        assert_eq!("mayor".parse::<Address>().unwrap(), Address::mayor());
        // Trailing slash normalizes away.
        assert_eq!("mayor/".parse::<Address>().unwrap(), Address::mayor());
        assert_eq!("deacon".parse::<Address>().unwrap(), Address::deacon());
    }

    #[test]
    fn test_parse_rig_scoped() {
        let addr: Address = "gastown/polecats/nux".parse().unwrap();
        assert_eq!(addr, Address::polecat("gastown", "nux"));
        assert_eq!(addr.to_string(), "gastown/polecats/nux");

        let witness: Address = "gastown/witness".parse().unwrap();
        assert_eq!(witness, Address::witness("gastown"));
    }

    #[test]
    fn test_parse_dogs_pool() {
        let pool: Address = "deacon/dogs".parse().unwrap();
        assert_eq!(pool.role, Role::Dog);
        assert!(pool.name.is_none());

        let named: Address = "deacon/dogs/rex".parse().unwrap();
        assert_eq!(named, Address::dog("rex"));
    }

    #[test]
    fn test_parse_rejects_unknown_role() {
        assert!(matches!(
            "gastown/pirates/bob".parse::<Address>(),
            Err(AddressError::UnknownRole(_))
        ));
        assert!(matches!("".parse::<Address>(), Err(AddressError::Empty)));
    }

    #[test]
    fn test_session_names() {
        assert_eq!(Address::mayor().session_name(), "gt-mayor");
        assert_eq!(
            Address::polecat("gastown", "nux").session_name(),
            "gt-gastown-polecats-nux"
        );
        assert_eq!(Address::witness("gastown").session_name(), "gt-gastown-witness");
    }

    #[test]
    fn test_agent_bead_id() {
        assert_eq!(
            Address::polecat("gastown", "nux").agent_bead_id(),
            "hq-agent-gastown-polecats-nux"
        );
        assert_eq!(Address::mayor().agent_bead_id(), "hq-agent-mayor");
    }
}
