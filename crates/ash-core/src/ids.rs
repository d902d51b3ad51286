//! Newtype identifiers.
//!
//! Bare `Uuid`/`String` ids let a session id slide into a sandbox-id slot
//! without the compiler noticing. Each id below wraps a `Uuid` (or, for
//! `TenantId`, an interned-ish string) so the two can never be confused at
//! a call site.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }

        impl From<Uuid> for $name {
            fn from(id: Uuid) -> Self {
                Self(id)
            }
        }
    };
}

uuid_id!(AgentId);
uuid_id!(SessionId);
uuid_id!(SandboxId);
uuid_id!(RunnerId);

/// Tenant id. Opaque string, default `"default"` — not a UUID because
/// deployments commonly want a human-chosen slug here.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

impl TenantId {
    pub const DEFAULT: &'static str = "default";

    pub fn default_tenant() -> Self {
        Self(Self::DEFAULT.to_string())
    }
}

impl Default for TenantId {
    fn default() -> Self {
        Self::default_tenant()
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        if s.is_empty() {
            Self::default_tenant()
        } else {
            Self(s.to_string())
        }
    }
}

impl From<Option<&str>> for TenantId {
    fn from(s: Option<&str>) -> Self {
        s.map(TenantId::from).unwrap_or_default()
    }
}
