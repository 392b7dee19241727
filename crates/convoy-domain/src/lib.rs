//! # Convoy Interlocking Simulation - Domain Model
//!
//! Value objects, identifiers and enums shared by the simulator core and the
//! persistence layer. Everything that survives a save/restore cycle derives
//! `Serialize`/`Deserialize` here so both layers agree on one wire shape.

use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// CONSTANTS
// =============================================================================

/// Movement steps a vehicle needs to cross one tile.
pub const STEPS_PER_TILE: u32 = 256;

/// Car units per tile; vehicle lengths are given in car units.
pub const CARUNITS_PER_TILE: u32 = 16;

/// Movement steps per car unit.
pub const STEPS_PER_CARUNIT: u32 = STEPS_PER_TILE / CARUNITS_PER_TILE;

/// Months of financial history kept per convoy.
pub const MAX_MONTHS: usize = 12;

// =============================================================================
// VALUE OBJECTS
// =============================================================================

/// Tile coordinate on the grid. `z` is the ground height level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TileCoord {
    pub x: i16,
    pub y: i16,
    pub z: i8,
}

impl TileCoord {
    #[must_use]
    pub const fn new(x: i16, y: i16, z: i8) -> Self {
        Self { x, y, z }
    }

    /// Planar neighbour in a single direction, keeping the height.
    #[must_use]
    pub fn step(&self, dir: Ribi) -> Self {
        let (dx, dy) = dir.delta();
        Self {
            x: self.x.saturating_add(dx),
            y: self.y.saturating_add(dy),
            z: self.z,
        }
    }

    /// Manhattan distance in the plane, ignoring height.
    #[must_use]
    pub fn distance(&self, other: &TileCoord) -> u32 {
        u32::from(self.x.abs_diff(other.x)) + u32::from(self.y.abs_diff(other.y))
    }
}

impl fmt::Display for TileCoord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{},{})", self.x, self.y, self.z)
    }
}

/// Direction bitset: north, east, south, west. Diagonals set two bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct Ribi(pub u8);

impl Ribi {
    pub const NONE: Ribi = Ribi(0);
    pub const NORTH: Ribi = Ribi(1);
    pub const EAST: Ribi = Ribi(2);
    pub const SOUTH: Ribi = Ribi(4);
    pub const WEST: Ribi = Ribi(8);
    pub const ALL: Ribi = Ribi(15);

    pub const SINGLES: [Ribi; 4] = [Ribi::NORTH, Ribi::EAST, Ribi::SOUTH, Ribi::WEST];

    /// Direction of travel from one tile to another (planar).
    #[must_use]
    pub fn between(from: &TileCoord, to: &TileCoord) -> Ribi {
        let mut bits = 0;
        if to.y < from.y {
            bits |= Ribi::NORTH.0;
        }
        if to.x > from.x {
            bits |= Ribi::EAST.0;
        }
        if to.y > from.y {
            bits |= Ribi::SOUTH.0;
        }
        if to.x < from.x {
            bits |= Ribi::WEST.0;
        }
        Ribi(bits)
    }

    #[must_use]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn is_single(self) -> bool {
        self.0.count_ones() == 1
    }

    #[must_use]
    pub const fn contains(self, other: Ribi) -> bool {
        other.0 != 0 && self.0 & other.0 == other.0
    }

    #[must_use]
    pub const fn union(self, other: Ribi) -> Ribi {
        Ribi(self.0 | other.0)
    }

    /// Opposite direction; works for diagonals too.
    #[must_use]
    pub const fn reverse(self) -> Ribi {
        Ribi(((self.0 << 2) | (self.0 >> 2)) & 0x0f)
    }

    /// Quarter turn clockwise (north becomes east).
    #[must_use]
    pub const fn rotate_cw(self) -> Ribi {
        Ribi(((self.0 << 1) | (self.0 >> 3)) & 0x0f)
    }

    /// Quarter turn counter-clockwise (north becomes west).
    #[must_use]
    pub const fn rotate_ccw(self) -> Ribi {
        Ribi(((self.0 >> 1) | (self.0 << 3)) & 0x0f)
    }

    #[must_use]
    pub const fn is_perpendicular(self, other: Ribi) -> bool {
        self.is_single()
            && other.is_single()
            && (self.rotate_cw().0 == other.0 || self.rotate_ccw().0 == other.0)
    }

    /// True for directions whose vehicles use the "back" road lane
    /// (west, south and the south-west diagonal).
    #[must_use]
    pub const fn is_backward(self) -> bool {
        self.0 == Ribi::WEST.0 || self.0 == Ribi::SOUTH.0 || self.0 == (Ribi::SOUTH.0 | Ribi::WEST.0)
    }

    /// Planar offset of a single direction.
    #[must_use]
    pub const fn delta(self) -> (i16, i16) {
        let mut dx = 0;
        let mut dy = 0;
        if self.0 & Ribi::NORTH.0 != 0 {
            dy -= 1;
        }
        if self.0 & Ribi::EAST.0 != 0 {
            dx += 1;
        }
        if self.0 & Ribi::SOUTH.0 != 0 {
            dy += 1;
        }
        if self.0 & Ribi::WEST.0 != 0 {
            dx -= 1;
        }
        (dx, dy)
    }
}

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Arena handle of a convoy. The generation makes stale handles detectable.
///
/// Serialized as `"<index>v<generation>"` so it can key JSON maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct ConvoyId {
    pub index: u32,
    pub generation: u32,
}

impl ConvoyId {
    #[must_use]
    pub const fn new(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }
}

impl From<ConvoyId> for String {
    fn from(id: ConvoyId) -> Self {
        format!("{}v{}", id.index, id.generation)
    }
}

impl TryFrom<String> for ConvoyId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = value.split_once('v').and_then(|(index, generation)| {
            Some(Self::new(index.parse().ok()?, generation.parse().ok()?))
        });
        parsed.ok_or(DomainError::MalformedId(value))
    }
}

impl fmt::Display for ConvoyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cnv#{}v{}", self.index, self.generation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StationId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LineId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct PlayerId(pub u8);

impl fmt::Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "halt#{}", self.0)
    }
}

impl fmt::Display for PlayerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "player#{}", self.0)
    }
}

// =============================================================================
// ENUMS
// =============================================================================

/// Kind of way a vehicle runs on
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WayType {
    Road,
    Track,
    Monorail,
    Maglev,
    NarrowGauge,
    Water,
    Air,
}

impl WayType {
    /// Rail-like ways use block reservation and signals.
    #[must_use]
    pub const fn is_rail_like(&self) -> bool {
        matches!(
            self,
            Self::Track | Self::Monorail | Self::Maglev | Self::NarrowGauge
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Road => "ROAD",
            Self::Track => "TRACK",
            Self::Monorail => "MONORAIL",
            Self::Maglev => "MAGLEV",
            Self::NarrowGauge => "NARROW_GAUGE",
            Self::Water => "WATER",
            Self::Air => "AIR",
        }
    }
}

/// Height change when moving between two tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Slope {
    Flat,
    Up,
    Down,
}

/// Lane a road vehicle occupies on a tile, from back to front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Lane {
    SidewalkBack,
    RoadBack,
    Middle,
    RoadFront,
    SidewalkFront,
}

impl Lane {
    #[must_use]
    pub const fn index(&self) -> u8 {
        match self {
            Self::SidewalkBack => 0,
            Self::RoadBack => 1,
            Self::Middle => 2,
            Self::RoadFront => 3,
            Self::SidewalkFront => 4,
        }
    }

    #[must_use]
    pub const fn from_index(index: u8) -> Option<Self> {
        match index {
            0 => Some(Self::SidewalkBack),
            1 => Some(Self::RoadBack),
            2 => Some(Self::Middle),
            3 => Some(Self::RoadFront),
            4 => Some(Self::SidewalkFront),
            _ => None,
        }
    }

    /// Road lane for a vehicle heading in `dir`; `passing` selects the
    /// oncoming lane used while overtaking.
    #[must_use]
    pub const fn for_travel(dir: Ribi, passing: bool, drive_left: bool) -> Self {
        let back = dir.is_backward() != drive_left;
        match (back, passing) {
            (true, false) | (false, true) => Self::RoadBack,
            (false, false) | (true, true) => Self::RoadFront,
        }
    }

    /// The other road lane.
    #[must_use]
    pub const fn opposite(&self) -> Self {
        match self {
            Self::SidewalkBack => Self::SidewalkFront,
            Self::RoadBack => Self::RoadFront,
            Self::Middle => Self::Middle,
            Self::RoadFront => Self::RoadBack,
            Self::SidewalkFront => Self::SidewalkBack,
        }
    }
}

/// Forced lane selection for a road convoy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaneAffinity {
    #[default]
    None,
    Traffic,
    Passing,
}

impl LaneAffinity {
    /// -1 traffic lane, 0 free, 1 passing lane
    #[must_use]
    pub const fn sign(&self) -> i8 {
        match self {
            Self::None => 0,
            Self::Traffic => -1,
            Self::Passing => 1,
        }
    }

    #[must_use]
    pub const fn from_sign(sign: i8) -> Self {
        match sign {
            s if s < 0 => Self::Traffic,
            s if s > 0 => Self::Passing,
            _ => Self::None,
        }
    }
}

/// Signal variants gating block reservation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalKind {
    Block,
    PreSignal,
    Priority,
    LongBlock,
    Choose,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Block => "BLOCK",
            Self::PreSignal => "PRE_SIGNAL",
            Self::Priority => "PRIORITY",
            Self::LongBlock => "LONG_BLOCK",
            Self::Choose => "CHOOSE",
        }
    }
}

/// Financial history columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CostType {
    Capacity,
    TransportedGoods,
    Revenue,
    Operations,
    Profit,
    Distance,
    MaxSpeed,
    WayToll,
}

impl CostType {
    pub const COUNT: usize = 8;

    #[must_use]
    pub const fn index(&self) -> usize {
        match self {
            Self::Capacity => 0,
            Self::TransportedGoods => 1,
            Self::Revenue => 2,
            Self::Operations => 3,
            Self::Profit => 4,
            Self::Distance => 5,
            Self::MaxSpeed => 6,
            Self::WayToll => 7,
        }
    }
}

// =============================================================================
// NESTED VALUE OBJECTS
// =============================================================================

/// Signal standing on a tile, guarding entry in `direction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Signal {
    pub kind: SignalKind,
    pub direction: Ribi,
}

impl Signal {
    #[must_use]
    pub const fn new(kind: SignalKind, direction: Ribi) -> Self {
        Self { kind, direction }
    }

    /// Whether a vehicle entering the tile while travelling `dir` must obey it.
    #[must_use]
    pub const fn applies_to(&self, dir: Ribi) -> bool {
        self.direction.0 & dir.0 != 0
    }
}

/// Immutable vehicle description, shared by all vehicles of one type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VehicleDesc {
    pub name: String,
    pub waytype: WayType,
    pub power_kw: u32,
    /// Gear factor in percent (100 = 1.0)
    pub gear_pct: u32,
    pub weight_kg: u32,
    pub capacity: u16,
    pub top_speed_kmh: u32,
    /// Length in car units (16 per tile)
    pub length: u8,
    pub needs_electrification: bool,
    /// Running cost per tile travelled
    pub running_cost: i64,
    pub price: i64,
}

impl VehicleDesc {
    /// Length in movement steps.
    #[must_use]
    pub fn length_in_steps(&self) -> u32 {
        u32::from(self.length) * STEPS_PER_CARUNIT
    }
}

/// Departures allowed every `interval_ticks`, shifted by `offset_ticks`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepartureSlot {
    pub interval_ticks: u32,
    pub offset_ticks: u32,
}

impl DepartureSlot {
    /// First slot strictly after `tick`.
    #[must_use]
    pub fn next_after(&self, tick: u64) -> u64 {
        let interval = u64::from(self.interval_ticks.max(1));
        let offset = u64::from(self.offset_ticks) % interval;
        if tick < offset {
            return offset;
        }
        ((tick - offset) / interval + 1) * interval + offset
    }
}

/// One stop of a cyclic schedule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleEntry {
    pub tile: TileCoord,
    /// Minimum loading in percent before departure
    pub minimum_loading: u8,
    /// Depart after this many ticks even if not loaded
    pub max_wait_ticks: Option<u32>,
    /// Departure timetable at this stop
    #[serde(default)]
    pub departure: Option<DepartureSlot>,
    /// Ticks past the scheduled departure a leader waits for a follower
    /// coupling here
    #[serde(default)]
    pub coupling_delay_tolerance_ticks: Option<u32>,
}

impl ScheduleEntry {
    #[must_use]
    pub const fn waypoint(tile: TileCoord) -> Self {
        Self {
            tile,
            minimum_loading: 0,
            max_wait_ticks: None,
            departure: None,
            coupling_delay_tolerance_ticks: None,
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Domain-level errors
#[derive(Debug, thiserror::Error)]
pub enum DomainError {
    #[error("Invalid lane index: {0}")]
    InvalidLane(u8),

    #[error("Tiles {from} and {to} are not adjacent")]
    NotAdjacent { from: TileCoord, to: TileCoord },

    #[error("Empty schedule")]
    EmptySchedule,

    #[error("Minimum loading {0}% exceeds 100%")]
    InvalidLoading(u8),

    #[error("Malformed convoy id: {0:?}")]
    MalformedId(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ribi_between_and_reverse() {
        let a = TileCoord::new(3, 3, 0);
        assert_eq!(Ribi::between(&a, &TileCoord::new(4, 3, 0)), Ribi::EAST);
        assert_eq!(Ribi::between(&a, &TileCoord::new(3, 2, 0)), Ribi::NORTH);
        assert_eq!(Ribi::EAST.reverse(), Ribi::WEST);
        assert_eq!(Ribi::NORTH.reverse(), Ribi::SOUTH);
        assert_eq!(Ribi(Ribi::NORTH.0 | Ribi::EAST.0).reverse(), Ribi(Ribi::SOUTH.0 | Ribi::WEST.0));
    }

    #[test]
    fn test_ribi_rotation() {
        assert_eq!(Ribi::NORTH.rotate_cw(), Ribi::EAST);
        assert_eq!(Ribi::WEST.rotate_cw(), Ribi::NORTH);
        assert_eq!(Ribi::NORTH.rotate_ccw(), Ribi::WEST);
        assert!(Ribi::NORTH.is_perpendicular(Ribi::EAST));
        assert!(!Ribi::NORTH.is_perpendicular(Ribi::SOUTH));
    }

    #[test]
    fn test_step_matches_between() {
        let origin = TileCoord::new(0, 0, 0);
        for dir in Ribi::SINGLES {
            let next = origin.step(dir);
            assert_eq!(Ribi::between(&origin, &next), dir);
            assert_eq!(origin.distance(&next), 1);
        }
    }

    #[test]
    fn test_lane_for_travel() {
        assert_eq!(Lane::for_travel(Ribi::EAST, false, false), Lane::RoadFront);
        assert_eq!(Lane::for_travel(Ribi::WEST, false, false), Lane::RoadBack);
        assert_eq!(Lane::for_travel(Ribi::EAST, true, false), Lane::RoadBack);
        assert_eq!(Lane::for_travel(Ribi::EAST, false, true), Lane::RoadBack);
        assert_eq!(Lane::RoadBack.opposite(), Lane::RoadFront);
        assert_eq!(Lane::from_index(4), Some(Lane::SidewalkFront));
        assert_eq!(Lane::from_index(5), None);
    }

    #[test]
    fn test_signal_direction() {
        let sig = Signal::new(SignalKind::Block, Ribi::EAST);
        assert!(sig.applies_to(Ribi::EAST));
        assert!(!sig.applies_to(Ribi::WEST));
    }

    #[test]
    fn test_departure_slot_is_strictly_later() {
        let slot = DepartureSlot {
            interval_ticks: 40,
            offset_ticks: 0,
        };
        assert_eq!(slot.next_after(0), 40);
        assert_eq!(slot.next_after(39), 40);
        assert_eq!(slot.next_after(40), 80);

        let shifted = DepartureSlot {
            interval_ticks: 40,
            offset_ticks: 5,
        };
        assert_eq!(shifted.next_after(3), 5);
        assert_eq!(shifted.next_after(5), 45);
        assert_eq!(shifted.next_after(50), 85);
    }

    #[test]
    fn test_schedule_entry_fields_default_when_absent() {
        let json = r#"{"tile":{"x":1,"y":2,"z":0},"minimum_loading":0,"max_wait_ticks":null}"#;
        let entry: ScheduleEntry = serde_json::from_str(json).unwrap();
        assert_eq!(entry, ScheduleEntry::waypoint(TileCoord::new(1, 2, 0)));
    }

    #[test]
    fn test_serde_shapes() {
        let json = serde_json::to_string(&WayType::NarrowGauge).unwrap();
        assert_eq!(json, "\"NARROW_GAUGE\"");
        let id: ConvoyId = serde_json::from_str(r#""3v1""#).unwrap();
        assert_eq!(id, ConvoyId::new(3, 1));
        assert_eq!(serde_json::to_string(&ConvoyId::new(7, 0)).unwrap(), "\"7v0\"");
        assert!(serde_json::from_str::<ConvoyId>(r#""cnv7""#).is_err());
    }
}
