//! Known datagram layouts of the "data out" protocol.
//!
//! The protocol carries no version field, so the total datagram length is
//! the only dispatch key. Every layout starts with the same 232-byte sled
//! block; the dash block follows at a layout-specific offset.

/// Length of the common sled block present in every layout.
pub const SLED_LEN: usize = 232;

/// Total length of the dashboard layout.
pub const DASH_LEN: usize = 311;

/// Total length of the open-world ("horizon") layout: sled, 12 reserved
/// bytes, dash block, one trailing unknown byte.
pub const HORIZON_LEN: usize = 324;

/// Total length of the extended car-dash layout: dash layout plus four f32
/// tire wear channels and a track ordinal.
pub const CAR_DASH_LEN: usize = 331;

/// Byte length of the dash block shared by all layouts.
pub const DASH_BLOCK_LEN: usize = 79;

/// One known wire layout, keyed by total datagram length.
///
/// New protocol revisions are added as a new variant plus a row in
/// [`PacketLayout::for_len`]; nothing dispatches on embedded version
/// numbers because the wire provides none.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLayout {
    Dash,
    Horizon,
    CarDash,
}

impl PacketLayout {
    /// Smallest decodable datagram. Anything shorter is truncated.
    pub const MIN_LEN: usize = DASH_LEN;

    /// Look up the layout for a datagram length.
    pub fn for_len(len: usize) -> Option<Self> {
        match len {
            DASH_LEN => Some(PacketLayout::Dash),
            HORIZON_LEN => Some(PacketLayout::Horizon),
            CAR_DASH_LEN => Some(PacketLayout::CarDash),
            _ => None,
        }
    }

    /// Total datagram length of this layout.
    pub fn len(self) -> usize {
        match self {
            PacketLayout::Dash => DASH_LEN,
            PacketLayout::Horizon => HORIZON_LEN,
            PacketLayout::CarDash => CAR_DASH_LEN,
        }
    }

    /// Absolute offset of the dash block.
    pub fn dash_offset(self) -> usize {
        match self {
            PacketLayout::Dash | PacketLayout::CarDash => SLED_LEN,
            // 12 reserved bytes between sled and dash blocks.
            PacketLayout::Horizon => SLED_LEN + 12,
        }
    }

    /// Absolute offset of the track ordinal, where the layout carries one.
    pub fn track_ordinal_offset(self) -> Option<usize> {
        match self {
            // Dash block, then 4 x f32 tire wear.
            PacketLayout::CarDash => Some(SLED_LEN + DASH_BLOCK_LEN + 16),
            PacketLayout::Dash | PacketLayout::Horizon => None,
        }
    }
}

// Sled block field offsets (absolute).
pub(super) const SLED_IS_RACE_ON: usize = 0;
pub(super) const SLED_TIMESTAMP: usize = 4;
pub(super) const SLED_CURRENT_RPM: usize = 16;
pub(super) const SLED_CAR_ORDINAL: usize = 212;
pub(super) const SLED_CAR_CLASS: usize = 216;
pub(super) const SLED_CAR_PI: usize = 220;

// Dash block field offsets (relative to the dash block).
pub(super) const DASH_POS_X: usize = 0;
pub(super) const DASH_POS_Y: usize = 4;
pub(super) const DASH_POS_Z: usize = 8;
pub(super) const DASH_SPEED: usize = 12;
pub(super) const DASH_DISTANCE: usize = 48;
pub(super) const DASH_BEST_LAP: usize = 52;
pub(super) const DASH_LAST_LAP: usize = 56;
pub(super) const DASH_CURRENT_LAP: usize = 60;
pub(super) const DASH_LAP_NUMBER: usize = 68;
pub(super) const DASH_ACCEL: usize = 71;
pub(super) const DASH_BRAKE: usize = 72;
pub(super) const DASH_GEAR: usize = 75;
pub(super) const DASH_STEER: usize = 76;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_lookup_covers_known_lengths() {
        assert_eq!(PacketLayout::for_len(DASH_LEN), Some(PacketLayout::Dash));
        assert_eq!(PacketLayout::for_len(HORIZON_LEN), Some(PacketLayout::Horizon));
        assert_eq!(PacketLayout::for_len(CAR_DASH_LEN), Some(PacketLayout::CarDash));
        assert_eq!(PacketLayout::for_len(SLED_LEN), None);
        assert_eq!(PacketLayout::for_len(0), None);
        assert_eq!(PacketLayout::for_len(312), None);
    }

    #[test]
    fn dash_block_fits_every_layout() {
        for layout in [PacketLayout::Dash, PacketLayout::Horizon, PacketLayout::CarDash] {
            assert!(layout.dash_offset() + DASH_BLOCK_LEN <= layout.len());
            if let Some(off) = layout.track_ordinal_offset() {
                assert!(off + 4 <= layout.len());
            }
        }
    }
}
