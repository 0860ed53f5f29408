// ── Domain model ──
//
// Canonical types shared by the orchestrator, the providers, and the
// repository collaborators.

/// Declares a `Uuid` newtype with the usual string conversions.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord,
            serde::Serialize, serde::Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(uuid::Uuid);

        impl $name {
            pub fn as_uuid(&self) -> &uuid::Uuid {
                &self.0
            }
        }

        impl From<uuid::Uuid> for $name {
            fn from(id: uuid::Uuid) -> Self {
                Self(id)
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }

        impl std::str::FromStr for $name {
            type Err = crate::error::CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                uuid::Uuid::parse_str(s)
                    .map(Self)
                    .map_err(|_| crate::error::CoreError::validation(format!(
                        "'{s}' is not a valid {}",
                        stringify!($name)
                    )))
            }
        }
    };
}

pub(crate) use uuid_id;

pub mod keys;
pub mod peer;
pub mod remote;
pub mod tunnel;

pub use keys::{Keypair, validate_preshared_key};
pub use peer::{Peer, PeerId, PeerState};
pub use remote::{InterfaceAddress, InterfaceInfo, RemoteProviderPeer};
pub use tunnel::{Profile, ProfileId, Tunnel, TunnelId, TunnelInterface};

/// Serde helpers for optional secrets. Secrets are only ever written to
/// the state snapshot; `Debug` output stays redacted.
pub(crate) mod secret_serde {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(
        value: &Option<SecretString>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        value
            .as_ref()
            .map(ExposeSecret::expose_secret)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<SecretString>, D::Error> {
        Ok(Option::<String>::deserialize(deserializer)?.map(SecretString::from))
    }
}
