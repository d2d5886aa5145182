//! Entity classes and cross-class references.

use crate::ids::{EntityId, IdError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The class of a persistent entity.
///
/// Stateful classes are driven by the scheduler through their declared state
/// machines; the remaining classes are plain associations that the scheduler
/// reads while planning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassTag {
    /// A managed server.
    Host,
    /// LNet configuration of one host.
    LnetConfiguration,
    /// Corosync configuration of one host.
    CorosyncConfiguration,
    /// Pacemaker configuration of one host.
    PacemakerConfiguration,
    /// NTP configuration of one host.
    NtpConfiguration,
    /// An MGS, MDT or OST.
    Target,
    /// A Lustre filesystem.
    Filesystem,
    /// A filesystem mounted on a client host.
    ClientMount,
    /// An HSM copytool attached to a client mount.
    Copytool,
    /// Association of a target with a host that can mount it.
    TargetMount,
    /// A block device identity.
    Volume,
    /// The per-host view of a volume.
    VolumeNode,
    /// A versioned Lustre tunable.
    ConfParam,
}

impl ClassTag {
    /// Every class, in storage-tag order.
    pub const ALL: [Self; 13] = [
        Self::Host,
        Self::LnetConfiguration,
        Self::CorosyncConfiguration,
        Self::PacemakerConfiguration,
        Self::NtpConfiguration,
        Self::Target,
        Self::Filesystem,
        Self::ClientMount,
        Self::Copytool,
        Self::TargetMount,
        Self::Volume,
        Self::VolumeNode,
        Self::ConfParam,
    ];

    /// Convert to a byte for storage keys.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        match self {
            Self::Host => 1,
            Self::LnetConfiguration => 2,
            Self::CorosyncConfiguration => 3,
            Self::PacemakerConfiguration => 4,
            Self::NtpConfiguration => 5,
            Self::Target => 6,
            Self::Filesystem => 7,
            Self::ClientMount => 8,
            Self::Copytool => 9,
            Self::TargetMount => 10,
            Self::Volume => 11,
            Self::VolumeNode => 12,
            Self::ConfParam => 13,
        }
    }

    /// Convert from a storage byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Host),
            2 => Some(Self::LnetConfiguration),
            3 => Some(Self::CorosyncConfiguration),
            4 => Some(Self::PacemakerConfiguration),
            5 => Some(Self::NtpConfiguration),
            6 => Some(Self::Target),
            7 => Some(Self::Filesystem),
            8 => Some(Self::ClientMount),
            9 => Some(Self::Copytool),
            10 => Some(Self::TargetMount),
            11 => Some(Self::Volume),
            12 => Some(Self::VolumeNode),
            13 => Some(Self::ConfParam),
            _ => None,
        }
    }

    /// The wire name of the class.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::LnetConfiguration => "lnet_configuration",
            Self::CorosyncConfiguration => "corosync_configuration",
            Self::PacemakerConfiguration => "pacemaker_configuration",
            Self::NtpConfiguration => "ntp_configuration",
            Self::Target => "target",
            Self::Filesystem => "filesystem",
            Self::ClientMount => "client_mount",
            Self::Copytool => "copytool",
            Self::TargetMount => "target_mount",
            Self::Volume => "volume",
            Self::VolumeNode => "volume_node",
            Self::ConfParam => "conf_param",
        }
    }

    /// Whether instances of this class carry a scheduler-managed state.
    #[must_use]
    pub const fn is_stateful(self) -> bool {
        !matches!(
            self,
            Self::TargetMount | Self::Volume | Self::VolumeNode | Self::ConfParam
        )
    }
}

impl fmt::Display for ClassTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClassTag {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|class| class.as_str() == s)
            .ok_or_else(|| IdError::UnknownClass(s.to_string()))
    }
}

/// A `(class_tag, id)` pair naming one entity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityRef {
    /// Entity class.
    #[serde(rename = "class_tag")]
    pub class: ClassTag,
    /// Entity id within the class.
    pub id: EntityId,
}

impl EntityRef {
    /// Create a reference.
    #[must_use]
    pub const fn new(class: ClassTag, id: EntityId) -> Self {
        Self { class, id }
    }

    /// Storage key: class byte followed by the big-endian id.
    #[must_use]
    pub fn to_key(self) -> [u8; 9] {
        let mut key = [0u8; 9];
        key[0] = self.class.as_u8();
        key[1..].copy_from_slice(&self.id.to_be_bytes());
        key
    }

    /// Decode a storage key produced by [`EntityRef::to_key`].
    ///
    /// # Errors
    ///
    /// Returns an error if the key is malformed.
    pub fn from_key(key: &[u8]) -> Result<Self, IdError> {
        let (&tag, rest) = key.split_first().ok_or(IdError::InvalidLength {
            expected: 9,
            got: 0,
        })?;
        let class =
            ClassTag::from_u8(tag).ok_or_else(|| IdError::UnknownClass(tag.to_string()))?;
        Ok(Self::new(class, EntityId::from_be_slice(rest)?))
    }
}

impl fmt::Debug for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.id)
    }
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.class, self.id)
    }
}

impl FromStr for EntityRef {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (class, id) = s
            .split_once(':')
            .ok_or_else(|| IdError::MalformedRef(s.to_string()))?;
        Ok(Self::new(class.parse()?, id.parse()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn class_tag_byte_roundtrip() {
        for class in ClassTag::ALL {
            assert_eq!(ClassTag::from_u8(class.as_u8()), Some(class));
        }
        assert_eq!(ClassTag::from_u8(0), None);
    }

    #[test]
    fn class_tag_wire_names_match_serde() {
        for class in ClassTag::ALL {
            let json = serde_json::to_string(&class).unwrap();
            assert_eq!(json, format!("\"{}\"", class.as_str()));
        }
    }

    #[test]
    fn associations_are_not_stateful() {
        assert!(ClassTag::Host.is_stateful());
        assert!(ClassTag::Copytool.is_stateful());
        assert!(!ClassTag::TargetMount.is_stateful());
        assert!(!ClassTag::ConfParam.is_stateful());
    }

    #[test]
    fn entity_ref_key_roundtrip() {
        let r = EntityRef::new(ClassTag::Target, EntityId::new(300));
        assert_eq!(EntityRef::from_key(&r.to_key()).unwrap(), r);
    }

    #[test]
    fn entity_ref_parse() {
        let r: EntityRef = "lnet_configuration:12".parse().unwrap();
        assert_eq!(r.class, ClassTag::LnetConfiguration);
        assert_eq!(r.id, EntityId::new(12));
        assert!("bogus:1".parse::<EntityRef>().is_err());
        assert!("host".parse::<EntityRef>().is_err());
    }

    #[test]
    fn entity_ref_json_shape() {
        let r = EntityRef::new(ClassTag::Host, EntityId::new(3));
        let value = serde_json::to_value(r).unwrap();
        assert_eq!(value, serde_json::json!({"class_tag": "host", "id": 3}));
    }
}
