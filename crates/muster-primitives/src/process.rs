//! Process and federation descriptors

use crate::error::PrimitiveError;
use std::fmt;

/// Kind of process participating in the runtime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(i32)]
pub enum ProcessType {
    /// Unknown / not yet handshaken
    #[default]
    None = 0,
    /// Headless scripted agent
    Agent = 1,
    /// In-process head-up display adapter
    Headup = 2,
    /// Player client
    Player = 3,
    /// Server daemon
    Daemon = 5,
    /// In-process module
    Module = 6,
}

impl ProcessType {
    /// Whether this process type lives inside the local process
    pub fn is_local(self) -> bool {
        matches!(self, ProcessType::Headup | ProcessType::Module)
    }

    /// Wire discriminant
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl TryFrom<i32> for ProcessType {
    type Error = PrimitiveError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Agent),
            2 => Ok(Self::Headup),
            3 => Ok(Self::Player),
            5 => Ok(Self::Daemon),
            6 => Ok(Self::Module),
            other => Err(PrimitiveError::UnknownDiscriminant(other)),
        }
    }
}

impl fmt::Display for ProcessType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessType::None => "-",
            ProcessType::Agent => "Agent",
            ProcessType::Headup => "Headup",
            ProcessType::Player => "Player",
            ProcessType::Daemon => "Daemon",
            ProcessType::Module => "Module",
        };
        write!(f, "{}", name)
    }
}

/// Kind of federation, informational only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum FederationType {
    /// Not yet typed
    #[default]
    None = 0,
    /// Match lobby scope
    Lobby = 1,
    /// Battle scope
    Battle = 2,
}

impl fmt::Display for FederationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FederationType::None => "-",
            FederationType::Lobby => "Lobby",
            FederationType::Battle => "Battle",
        };
        write!(f, "{}", name)
    }
}

/// Kind of object change carried in a session message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i32)]
pub enum ObjectChange {
    /// No change
    #[default]
    None = 0,
    /// Object newly discovered by the sender
    Discover = 1,
    /// Property values updated
    Update = 2,
    /// Object deleted
    Delete = 3,
}

impl TryFrom<i32> for ObjectChange {
    type Error = PrimitiveError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Discover),
            2 => Ok(Self::Update),
            3 => Ok(Self::Delete),
            other => Err(PrimitiveError::UnknownDiscriminant(other)),
        }
    }
}

/// Network address of a peer process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessAddr {
    /// Host name or address
    pub host: String,
    /// Port, as a string to allow symbolic values
    pub port: String,
}

/// Authentication credentials of a process subject
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessAuth {
    /// Stable subject identifier
    pub subject_id: String,
    /// Display nickname
    pub nickname: String,
    /// Avatar image URL
    pub image_url: String,
    /// Opaque access token
    pub access_token: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_process_type_round_trip() {
        for t in [
            ProcessType::None,
            ProcessType::Agent,
            ProcessType::Headup,
            ProcessType::Player,
            ProcessType::Daemon,
            ProcessType::Module,
        ] {
            assert_eq!(ProcessType::try_from(t.as_i32()).unwrap(), t);
        }
    }

    #[test]
    fn test_process_type_unknown() {
        assert!(ProcessType::try_from(4).is_err());
        assert!(ProcessType::try_from(99).is_err());
    }

    #[test]
    fn test_process_type_local() {
        assert!(ProcessType::Headup.is_local());
        assert!(ProcessType::Module.is_local());
        assert!(!ProcessType::Daemon.is_local());
        assert!(!ProcessType::Player.is_local());
    }

    #[test]
    fn test_process_type_display() {
        assert_eq!(ProcessType::Daemon.to_string(), "Daemon");
        assert_eq!(ProcessType::None.to_string(), "-");
    }

    #[test]
    fn test_object_change_round_trip() {
        for c in [
            ObjectChange::None,
            ObjectChange::Discover,
            ObjectChange::Update,
            ObjectChange::Delete,
        ] {
            assert_eq!(ObjectChange::try_from(c as i32).unwrap(), c);
        }
        assert!(ObjectChange::try_from(7).is_err());
    }

    #[test]
    fn test_federation_type_display() {
        assert_eq!(FederationType::Battle.to_string(), "Battle");
        assert_eq!(FederationType::Lobby.to_string(), "Lobby");
    }

    #[test]
    fn test_process_auth_default() {
        let auth = ProcessAuth::default();
        assert!(auth.subject_id.is_empty());
        assert!(auth.access_token.is_empty());
    }
}
