//! Short human-typeable room codes.
//!
//! A room code is the only thing two players exchange out of band. It is used
//! to derive the signaling identifier during rendezvous and is never sent once
//! the data channel is open.

use rand::Rng;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of characters in every room code.
pub const ROOM_CODE_LEN: usize = 6;

/// Characters a room code may contain.
///
/// Excludes `0 O 1 I L`, which are easily confused when read aloud or handwritten.
pub const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKMNPQRSTUVWXYZ23456789";

/// Prefix joined with the code to form the identifier registered for signaling.
pub const PEER_ID_PREFIX: &str = "tandem-";

/// Reasons a user-entered code is rejected before any network activity.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoomCodeError {
    /// Wrong number of characters after trimming.
    #[error("room code must be {expected} characters, got {actual}")]
    Length {
        /// Required length.
        expected: usize,
        /// Length that was entered.
        actual: usize,
    },
    /// A character outside [`ROOM_CODE_ALPHABET`].
    #[error("room code contains invalid character {0:?}")]
    InvalidChar(char),
}

/// Validated, upper-case room code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RoomCode(String);

impl RoomCode {
    /// Draw a fresh code from `rng`.
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let code = (0..ROOM_CODE_LEN)
            .map(|_| ROOM_CODE_ALPHABET[rng.gen_range(0..ROOM_CODE_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// Parse user input: surrounding whitespace is trimmed and case is ignored.
    pub fn parse(input: &str) -> Result<Self, RoomCodeError> {
        let normalized = input.trim().to_ascii_uppercase();

        let actual = normalized.chars().count();
        if actual != ROOM_CODE_LEN {
            return Err(RoomCodeError::Length {
                expected: ROOM_CODE_LEN,
                actual,
            });
        }

        if let Some(bad) = normalized
            .chars()
            .find(|c| !c.is_ascii() || !ROOM_CODE_ALPHABET.contains(&(*c as u8)))
        {
            return Err(RoomCodeError::InvalidChar(bad));
        }

        Ok(Self(normalized))
    }

    /// The code as typed by players.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Identifier registered with the signaling service for this room.
    pub fn peer_id(&self) -> String {
        format!("{PEER_ID_PREFIX}{}", self.0)
    }
}

impl fmt::Display for RoomCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RoomCode {
    type Err = RoomCodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    #[test]
    fn generated_codes_use_fixed_length_and_alphabet() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..500 {
            let code = RoomCode::generate(&mut rng);
            assert_eq!(code.as_str().len(), ROOM_CODE_LEN);
            assert!(code
                .as_str()
                .bytes()
                .all(|b| ROOM_CODE_ALPHABET.contains(&b)));
        }
    }

    #[test]
    fn alphabet_has_no_confusable_characters() {
        for c in [b'0', b'O', b'1', b'I', b'L'] {
            assert!(!ROOM_CODE_ALPHABET.contains(&c));
        }
    }

    #[test]
    fn parse_trims_and_ignores_case() {
        let code = RoomCode::parse("  abc234\n").expect("valid code");
        assert_eq!(code.as_str(), "ABC234");
        assert_eq!(code.peer_id(), "tandem-ABC234");
    }

    #[test]
    fn parse_rejects_wrong_length() {
        assert_eq!(
            RoomCode::parse("ABC"),
            Err(RoomCodeError::Length {
                expected: ROOM_CODE_LEN,
                actual: 3
            })
        );
    }

    #[test]
    fn parse_rejects_confusable_characters() {
        assert_eq!(
            RoomCode::parse("ABCD0E"),
            Err(RoomCodeError::InvalidChar('0'))
        );
        assert!(RoomCode::parse("ABCDé2").is_err());
    }

    #[test]
    fn generated_code_round_trips_through_parse() {
        let mut rng = StdRng::seed_from_u64(99);
        let code = RoomCode::generate(&mut rng);
        assert_eq!(code.to_string().parse::<RoomCode>(), Ok(code));
    }
}
