use std::{fmt, str::FromStr};
use thiserror::Error;

/// Instance number handed out when nothing usable has been persisted yet
pub const DEFAULT_INSTANCE: u32 = 50;

/// Electrical role a metering channel plays on the energy-management bus
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoleName {
    Grid,
    PvInverter,
    Genset,
    AcLoad,
    GenericSource,
}

impl RoleName {
    pub fn as_str(self) -> &'static str {
        match self {
            RoleName::Grid => "grid",
            RoleName::PvInverter => "pvinverter",
            RoleName::Genset => "genset",
            RoleName::AcLoad => "acload",
            RoleName::GenericSource => "genericsource",
        }
    }
}

impl fmt::Display for RoleName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown role `{0}`")]
pub struct UnknownRole(pub String);

impl FromStr for RoleName {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "grid" => Ok(RoleName::Grid),
            "pvinverter" => Ok(RoleName::PvInverter),
            "genset" => Ok(RoleName::Genset),
            "acload" => Ok(RoleName::AcLoad),
            "genericsource" => Ok(RoleName::GenericSource),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}

/// Ordered, non-empty set of roles a channel may take. The first entry is the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllowedRoles(Vec<RoleName>);

impl AllowedRoles {
    /// Returns `None` for an empty list
    pub fn new(roles: Vec<RoleName>) -> Option<Self> {
        if roles.is_empty() {
            None
        } else {
            Some(Self(roles))
        }
    }

    /// A relay with metering can only ever be a switched AC load
    pub fn switch_with_metering() -> Self {
        Self(vec![RoleName::AcLoad])
    }

    /// Grid is left out: the device refresh rate is too low for a grid meter
    pub fn metering_only() -> Self {
        Self(vec![
            RoleName::AcLoad,
            RoleName::PvInverter,
            RoleName::Genset,
        ])
    }

    pub fn default_role(&self) -> RoleName {
        self.0[0]
    }

    pub fn contains(&self, role: RoleName) -> bool {
        self.0.contains(&role)
    }

    /// Membership test for a raw string, as written by a bus client
    pub fn allows(&self, role: &str) -> Option<RoleName> {
        role.parse::<RoleName>().ok().filter(|r| self.contains(*r))
    }

    pub fn iter(&self) -> impl Iterator<Item = RoleName> + '_ {
        self.0.iter().copied()
    }

    pub fn to_strings(&self) -> Vec<String> {
        self.iter().map(|r| r.to_string()).collect()
    }
}

/// Decoded form of the persisted `"{role}:{instance}"` setting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleInstance {
    /// `None` when the stored role is missing or not a known role
    pub role: Option<RoleName>,
    pub instance: u32,
}

impl RoleInstance {
    pub fn new(role: RoleName, instance: u32) -> Self {
        Self {
            role: Some(role),
            instance,
        }
    }

    /// Decodes a stored setting. Anything unusable degrades to "no role" and
    /// the default instance rather than failing.
    pub fn decode(value: Option<&str>) -> Self {
        let Some(value) = value else {
            return Self {
                role: None,
                instance: DEFAULT_INSTANCE,
            };
        };
        let (role, instance) = match value.rsplit_once(':') {
            Some((role, instance)) => (role, instance.trim().parse().ok()),
            None => (value, None),
        };
        Self {
            role: role.trim().parse().ok(),
            instance: instance.unwrap_or(DEFAULT_INSTANCE),
        }
    }

    /// Encodes with `role` in place of whatever role is held
    pub fn encode_as(&self, role: RoleName) -> String {
        format!("{}:{}", role, self.instance)
    }
}
