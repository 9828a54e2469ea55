use bitvec::BitArr;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Maximum number of lanes per warp.
pub const MAX_LANES: usize = 32;

/// Number of workgroup slots per cluster.
pub const NUM_SLOTS: usize = 2;

/// Per-lane mask.
///
/// Bitmask where a 1 at position i means that lane i takes part in the access.
pub type LaneMask = BitArr!(for MAX_LANES, in u32);

/// Values of one warp, one entry per lane.
pub type LaneValues = SmallVec<[u32; 16]>;

/// Register kind.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::EnumIter, Serialize, Deserialize,
)]
pub enum Kind {
    Vector,
    Scalar,
    Predicate,
    VectorSpecial,
    ScalarSpecial,
    Immediate,
}

impl Kind {
    /// Whether the kind is backed by banked storage.
    ///
    /// Special registers are computed from the workgroup geometry or held in
    /// dedicated control-mask flops; immediates are part of the instruction.
    #[must_use]
    pub fn is_banked(self) -> bool {
        matches!(self, Self::Vector | Self::Scalar | Self::Predicate)
    }

    /// Whether the kind holds one value per lane.
    #[must_use]
    pub fn is_per_lane(self) -> bool {
        matches!(self, Self::Vector | Self::Predicate | Self::VectorSpecial)
    }

    #[must_use]
    pub fn prefix(self) -> &'static str {
        match self {
            Self::Vector => "v",
            Self::Scalar => "s",
            Self::Predicate => "p",
            Self::VectorSpecial => "vs",
            Self::ScalarSpecial => "ss",
            Self::Immediate => "#",
        }
    }
}

/// A fully resolved register reference.
///
/// For `Kind::Immediate`, `row` carries the literal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Register {
    pub kind: Kind,
    pub row: usize,
    /// Warp (register file column).
    pub col: usize,
    /// Workgroup slot.
    pub slot: usize,
}

impl Register {
    #[must_use]
    pub fn new(kind: Kind, row: usize, col: usize, slot: usize) -> Self {
        Self {
            kind,
            row,
            col,
            slot,
        }
    }

    #[must_use]
    pub fn vector(row: usize, col: usize, slot: usize) -> Self {
        Self::new(Kind::Vector, row, col, slot)
    }

    #[must_use]
    pub fn scalar(row: usize, slot: usize) -> Self {
        Self::new(Kind::Scalar, row, 0, slot)
    }

    #[must_use]
    pub fn predicate(row: usize, col: usize, slot: usize) -> Self {
        Self::new(Kind::Predicate, row, col, slot)
    }

    #[must_use]
    pub fn special(special: Special, col: usize, slot: usize) -> Self {
        Self::new(special.kind(), special.row(), col, slot)
    }

    #[must_use]
    pub fn immediate(value: u32) -> Self {
        Self::new(Kind::Immediate, value as usize, 0, 0)
    }

    /// Identity used by the scoreboard.
    ///
    /// Vector and predicate writes are tracked for the whole row,
    /// since an instruction writes every warp of the row.
    #[must_use]
    pub fn identity(&self) -> (Kind, usize, usize) {
        (self.kind, self.row, self.slot)
    }

    #[must_use]
    pub fn as_special(&self) -> Option<Special> {
        Special::from_register(self.kind, self.row)
    }
}

impl std::fmt::Display for Register {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            Kind::Immediate => write!(f, "#{}", self.row),
            Kind::VectorSpecial | Kind::ScalarSpecial => match self.as_special() {
                Some(special) => write!(f, "{special}[{}]@slot{}", self.col, self.slot),
                None => write!(
                    f,
                    "{}{}[{}]@slot{}",
                    self.kind.prefix(),
                    self.row,
                    self.col,
                    self.slot
                ),
            },
            _ => write!(
                f,
                "{}{}[{}]@slot{}",
                self.kind.prefix(),
                self.row,
                self.col,
                self.slot
            ),
        }
    }
}

/// Control mask register.
///
/// Per-lane bits governing divergence and reconvergence.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::EnumIter, Serialize, Deserialize,
)]
pub enum ControlMask {
    Run,
    Break,
    Return,
    Exit,
}

/// Special register.
///
/// Vector specials have one value per lane, scalar specials are uniform
/// across the workgroup. Except for the control masks, special registers
/// are derived from the workgroup geometry and never stored.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::EnumIter,
    strum::Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "snake_case")]
pub enum Special {
    // vector specials
    ThreadIdX,
    ThreadIdY,
    LaneId,
    WarpId,
    Run,
    Break,
    Return,
    Exit,
    /// Derived: run and not (break, return or exit).
    LaneActive,
    // scalar specials
    WorkgroupOffsetX,
    WorkgroupOffsetY,
    WorkgroupWidth,
    ThreadSpaceX,
    ThreadSpaceY,
    LastWarp,
    /// Tile height in threads.
    WorkgroupHeight,
    /// Linear index of the workgroup's first thread in a buffer shaped like
    /// the thread space.
    TransferBase,
    /// Words between two tile rows in a buffer shaped like the thread space.
    TransferStride,
    /// Tile rows inside the thread space.
    TransferRows,
}

const VECTOR_SPECIALS: [Special; Special::NUM_VECTOR] = [
    Special::ThreadIdX,
    Special::ThreadIdY,
    Special::LaneId,
    Special::WarpId,
    Special::Run,
    Special::Break,
    Special::Return,
    Special::Exit,
    Special::LaneActive,
];

const SCALAR_SPECIALS: [Special; Special::NUM_SCALAR] = [
    Special::WorkgroupOffsetX,
    Special::WorkgroupOffsetY,
    Special::WorkgroupWidth,
    Special::ThreadSpaceX,
    Special::ThreadSpaceY,
    Special::LastWarp,
    Special::WorkgroupHeight,
    Special::TransferBase,
    Special::TransferStride,
    Special::TransferRows,
];

impl Special {
    pub const NUM_VECTOR: usize = 9;
    pub const NUM_SCALAR: usize = 10;

    #[must_use]
    pub fn kind(self) -> Kind {
        if VECTOR_SPECIALS.contains(&self) {
            Kind::VectorSpecial
        } else {
            Kind::ScalarSpecial
        }
    }

    #[must_use]
    pub fn row(self) -> usize {
        VECTOR_SPECIALS
            .iter()
            .position(|s| *s == self)
            .or_else(|| SCALAR_SPECIALS.iter().position(|s| *s == self))
            .unwrap_or_default()
    }

    #[must_use]
    pub fn from_register(kind: Kind, row: usize) -> Option<Self> {
        match kind {
            Kind::VectorSpecial => VECTOR_SPECIALS.get(row).copied(),
            Kind::ScalarSpecial => SCALAR_SPECIALS.get(row).copied(),
            _ => None,
        }
    }

    #[must_use]
    pub fn control_mask(self) -> Option<ControlMask> {
        match self {
            Self::Run => Some(ControlMask::Run),
            Self::Break => Some(ControlMask::Break),
            Self::Return => Some(ControlMask::Return),
            Self::Exit => Some(ControlMask::Exit),
            _ => None,
        }
    }

    /// Whether the pipeline may write this register.
    #[must_use]
    pub fn is_writable(self) -> bool {
        self.control_mask().is_some()
    }
}

/// Build a lane mask with the first `lanes` lanes set.
#[must_use]
pub fn full_mask(lanes: usize) -> LaneMask {
    let mut mask = LaneMask::ZERO;
    mask[..lanes.min(MAX_LANES)].fill(true);
    mask
}
