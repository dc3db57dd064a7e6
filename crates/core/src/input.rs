//! Opaque input bitmask produced by the input layer.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};

bitflags! {
    /// Keys held by the guest during one frame.
    ///
    /// The sync layer stores and forwards the mask; it never interprets it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
    pub struct InputKeys: u16 {
        /// Accelerate / move up.
        const UP = 1 << 0;
        /// Reverse / move down.
        const DOWN = 1 << 1;
        /// Steer left.
        const LEFT = 1 << 2;
        /// Steer right.
        const RIGHT = 1 << 3;
        /// Primary action.
        const ACTION = 1 << 4;
        /// Speed boost.
        const BOOST = 1 << 5;
        /// Handbrake.
        const BRAKE = 1 << 6;
        /// Pause request.
        const PAUSE = 1 << 7;
    }
}
