#![warn(missing_docs)]
//! Core primitives shared across the workspace.

/// Declare a `u8`-tagged enum with stable wire tags and log keys.
macro_rules! wire_tag {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal => $key:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ::serde::Serialize, ::serde::Deserialize)]
        #[repr(u8)]
        $vis enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl $name {
            /// Stable numeric tag used on the wire.
            pub const fn as_u8(self) -> u8 {
                self as u8
            }

            /// Decode a wire tag.
            pub const fn from_u8(value: u8) -> Option<Self> {
                match value {
                    $($value => Some(Self::$variant),)+
                    _ => None,
                }
            }

            /// Canonical string key used in configs/logs.
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $key),+
                }
            }
        }
    };
}

pub mod full_sync;
pub mod input;
pub mod phase;
pub mod room_code;
pub mod snapshot;

use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};

// Re-export commonly used types
pub use full_sync::{
    CollectibleSpawn, FullSyncPayload, LevelLayout, NpcSpawn, Obstacle, SyncSummary,
};
pub use input::InputKeys;
pub use phase::{GameMode, RoundOutcome, SessionPhase};
pub use room_code::{RoomCode, RoomCodeError, PEER_ID_PREFIX, ROOM_CODE_ALPHABET, ROOM_CODE_LEN};
pub use snapshot::{
    ActiveEvent, ActorKind, ActorState, CollectibleKind, CollectibleState, EnvironmentTimers,
    EventKind, NpcKind, NpcState, ScorePair, Snapshot, TrafficState, VehicleState,
};

/// Host simulation tick carried in every snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SimTick(pub u64);

impl SimTick {
    /// First tick of any round.
    pub const ZERO: Self = Self(0);

    /// Advance by `delta` ticks.
    pub fn advance(self, delta: u64) -> Self {
        Self(self.0 + delta)
    }
}

/// Which side of the session a peer plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// Runs the authoritative simulation and decides every phase transition.
    Host,
    /// Mirrors host state and sends input upstream.
    Guest,
}

impl Role {
    /// The other side of the session.
    pub const fn peer(self) -> Self {
        match self {
            Self::Host => Self::Guest,
            Self::Guest => Self::Host,
        }
    }

    /// Canonical string key used in logs.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Host => "host",
            Self::Guest => "guest",
        }
    }
}

/// Reproducible RNG for a round layout, seeded by session + round domains.
pub fn round_rng(session_seed: u64, round: u32) -> StdRng {
    let seed = session_seed ^ (u64::from(round)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    StdRng::seed_from_u64(seed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    #[test]
    fn role_peer_is_symmetric() {
        assert_eq!(Role::Host.peer(), Role::Guest);
        assert_eq!(Role::Guest.peer().peer(), Role::Guest);
    }

    #[test]
    fn round_rng_is_reproducible() {
        let a: u64 = round_rng(42, 3).gen();
        let b: u64 = round_rng(42, 3).gen();
        let c: u64 = round_rng(42, 4).gen();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
