use crate::config::{BankScheme, Config};
use crate::register::{Kind, Register};
use bitvec::BitArr;

/// Maximum number of register accesses of one external transfer beat.
pub const MAX_BUS_WIDTH: usize = 8;

/// Conflict flags of a pipeline read batch (one bit per source operand).
pub type IssueMask = BitArr!(for 3, in u8);

/// Activity or conflict flags of a transfer beat.
pub type BusMask = BitArr!(for MAX_BUS_WIDTH, in u8);

/// Physical location of a register access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Location {
    pub kind: Kind,
    pub slot: usize,
    pub bank: usize,
    /// Storage row inside the bank.
    pub row: usize,
}

impl Location {
    /// Same bank, different row.
    #[must_use]
    pub fn conflicts_with(&self, other: &Self) -> bool {
        self.kind == other.kind
            && self.slot == other.slot
            && self.bank == other.bank
            && self.row != other.row
    }
}

/// Register bank hazard detection.
///
/// Conflicts are only reported. Callers stall or defer conflicting accesses
/// and treat any conflict that remains at access time as fatal.
pub trait HazardPolicy: std::fmt::Debug + Send + Sync + 'static {
    /// Map a register to its bank and storage row.
    ///
    /// Returns `None` for registers without banked storage.
    #[must_use]
    fn locate(&self, reg: &Register) -> Option<Location>;

    /// Conflicts between the (up to three) operand reads of one issue.
    #[must_use]
    fn issue_conflicts(&self, accesses: &[Option<Register>; 3]) -> IssueMask;

    /// Conflicts between the accesses of one transfer beat.
    ///
    /// Accesses are scanned in index order, an access conflicts if it maps
    /// to the bank of an earlier, active and unconflicted access with a
    /// different row.
    #[must_use]
    fn transfer_conflicts(&self, accesses: &[Register], active: &BusMask) -> BusMask {
        assert!(
            accesses.len() <= MAX_BUS_WIDTH,
            "transfer beat of {} accesses exceeds bus width {}",
            accesses.len(),
            MAX_BUS_WIDTH
        );
        let mut conflicts = BusMask::ZERO;
        let mut granted: Vec<Location> = Vec::with_capacity(accesses.len());
        for (i, reg) in accesses.iter().enumerate() {
            if !active[i] {
                continue;
            }
            let Some(loc) = self.locate(reg) else {
                continue;
            };
            if granted.iter().any(|earlier| earlier.conflicts_with(&loc)) {
                conflicts.set(i, true);
            } else {
                granted.push(loc);
            }
        }
        conflicts
    }

    /// Whether an external-store access and a pipeline access collide.
    ///
    /// Access and execute run in different clock domains, so they must never
    /// touch the same slot at the same time. Immediates never collide.
    #[must_use]
    fn access_execute_hazard(&self, store: &Register, pipeline: &Register) -> bool {
        store.kind != Kind::Immediate
            && pipeline.kind != Kind::Immediate
            && store.slot == pipeline.slot
    }
}

/// Build the hazard policy selected by the configuration.
#[must_use]
pub fn from_config(config: &Config) -> Box<dyn HazardPolicy> {
    let geometry = Geometry {
        num_banks: config.num_banks,
        warps: config.warps_per_slot(),
    };
    match config.bank_scheme {
        BankScheme::SinglePort => Box::new(SinglePort(geometry)),
        BankScheme::MultiPort => Box::new(MultiPort(geometry)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub num_banks: usize,
    /// Register file columns per slot.
    pub warps: usize,
}

impl Geometry {
    fn linear(&self, reg: &Register) -> Option<usize> {
        if !reg.kind.is_banked() {
            return None;
        }
        if reg.kind.is_per_lane() {
            Some(reg.row * self.warps + reg.col)
        } else {
            Some(reg.row)
        }
    }
}

/// One read port per bank.
///
/// Rows are interleaved across banks with a per-warp skew, so consecutive
/// warps of one row fall into different banks. With a single read port,
/// operand 1 wins over operand 0, which wins over operand 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinglePort(pub Geometry);

impl SinglePort {
    /// Priority of the pipeline operands on a single read port.
    pub const PRIORITY: [usize; 3] = [1, 0, 2];
}

impl HazardPolicy for SinglePort {
    fn locate(&self, reg: &Register) -> Option<Location> {
        let linear = self.0.linear(reg)?;
        let skew = if reg.kind.is_per_lane() { reg.col } else { 0 };
        Some(Location {
            kind: reg.kind,
            slot: reg.slot,
            bank: (reg.row + skew) % self.0.num_banks,
            row: linear / self.0.num_banks,
        })
    }

    fn issue_conflicts(&self, accesses: &[Option<Register>; 3]) -> IssueMask {
        let mut conflicts = IssueMask::ZERO;
        let mut granted: Vec<Location> = Vec::with_capacity(3);
        for i in Self::PRIORITY {
            let Some(loc) = accesses[i].as_ref().and_then(|reg| self.locate(reg)) else {
                continue;
            };
            if granted.iter().any(|earlier| earlier.conflicts_with(&loc)) {
                log::trace!(
                    "bank conflict: operand {} ({:?}) loses against {:?}",
                    i,
                    accesses[i],
                    granted
                );
                conflicts.set(i, true);
            } else {
                granted.push(loc);
            }
        }
        conflicts
    }
}

/// Three read ports per bank.
///
/// Pipeline reads never collide, rows are interleaved across banks
/// without skew.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MultiPort(pub Geometry);

impl HazardPolicy for MultiPort {
    fn locate(&self, reg: &Register) -> Option<Location> {
        let linear = self.0.linear(reg)?;
        Some(Location {
            kind: reg.kind,
            slot: reg.slot,
            bank: linear % self.0.num_banks,
            row: linear / self.0.num_banks,
        })
    }

    fn issue_conflicts(&self, _accesses: &[Option<Register>; 3]) -> IssueMask {
        IssueMask::ZERO
    }
}
