use bitvec::{array::BitArray, BitArr};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{EnumCount, IntoEnumIterator};

/// Configuration error.
///
/// Configuration errors are detected once before the simulation starts.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("scheduling options {0} and {1} are mutually exclusive")]
    ConflictingOptions(SchedulingOption, SchedulingOption),

    #[error("bank scheme {scheme} requires {expected} read port(s) per bank, but {read_ports} are configured")]
    PortSchemeMismatch {
        scheme: BankScheme,
        expected: usize,
        read_ports: usize,
    },

    #[error("invalid {field} = {value}: {reason}")]
    Invalid {
        field: &'static str,
        value: usize,
        reason: &'static str,
    },

    #[error("unknown scheduling option {0:?}")]
    UnknownOption(String),
}

/// A scheduling option.
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
    strum::EnumCount,
    strum::EnumString,
    strum::Display,
    Serialize,
    Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
#[repr(usize)]
pub enum SchedulingOption {
    /// Admit workgroups into the two slots of a cluster pairwise.
    PairwiseWorkgroups = 0,
    /// Do not issue instructions while either slot transfers to or from the scratchpad.
    ForbidParallelComputeScratchpad = 1,
    /// Do not run bulk-memory and scratchpad transfers at the same time.
    ForbidParallelBulkScratchpad = 2,
    /// Stop the simulation as soon as the kernel finished.
    StopOnKernelFinish = 3,
    /// Stop the simulation only once all memory traffic drained.
    StopOnMemoryDrain = 4,
}

pub type OptionBits = BitArr!(for SchedulingOption::COUNT, in u8);

/// Scheduling option bit-set.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "Vec<SchedulingOption>", from = "Vec<SchedulingOption>")]
pub struct SchedulingOptions(OptionBits);

impl SchedulingOptions {
    pub const EMPTY: Self = Self(BitArray::ZERO);

    #[must_use]
    pub fn with(mut self, option: SchedulingOption) -> Self {
        self.set(option, true);
        self
    }

    pub fn set(&mut self, option: SchedulingOption, enabled: bool) {
        self.0.set(option as usize, enabled);
    }

    #[must_use]
    pub fn contains(&self, option: SchedulingOption) -> bool {
        self.0[option as usize]
    }

    pub fn iter(&self) -> impl Iterator<Item = SchedulingOption> + '_ {
        SchedulingOption::iter().filter(|option| self.contains(*option))
    }

    /// Reject contradictory option combinations.
    pub fn validate(&self) -> Result<(), Error> {
        use SchedulingOption::{ForbidParallelBulkScratchpad, ForbidParallelComputeScratchpad};
        if self.contains(ForbidParallelComputeScratchpad)
            && self.contains(ForbidParallelBulkScratchpad)
        {
            return Err(Error::ConflictingOptions(
                ForbidParallelComputeScratchpad,
                ForbidParallelBulkScratchpad,
            ));
        }
        Ok(())
    }
}

impl From<Vec<SchedulingOption>> for SchedulingOptions {
    fn from(options: Vec<SchedulingOption>) -> Self {
        options.into_iter().fold(Self::EMPTY, Self::with)
    }
}

impl From<SchedulingOptions> for Vec<SchedulingOption> {
    fn from(options: SchedulingOptions) -> Self {
        options.iter().collect()
    }
}

impl FromStr for SchedulingOptions {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .try_fold(Self::EMPTY, |options, name| {
                let option = SchedulingOption::from_str(name)
                    .map_err(|_| Error::UnknownOption(name.to_string()))?;
                Ok(options.with(option))
            })
    }
}

impl std::fmt::Display for SchedulingOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.iter().map(|option| option.to_string()).collect();
        write!(f, "[{}]", names.join(","))
    }
}

/// Register bank hazard detection scheme.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display, Serialize, Deserialize,
)]
pub enum BankScheme {
    /// One read port per bank, rows interleaved across banks with a per-warp skew.
    SinglePort,
    /// Three read ports per bank: pipeline reads never collide with each other.
    MultiPort,
}

impl BankScheme {
    #[must_use]
    pub fn required_read_ports(self) -> usize {
        match self {
            Self::SinglePort => 1,
            Self::MultiPort => 3,
        }
    }
}

/// Simulator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Number of SIMD clusters fed by the work scheduler
    pub num_clusters: usize,
    /// Lanes per warp
    pub lanes: usize,
    /// Thread capacity of one workgroup slot
    pub max_threads_per_slot: usize,
    /// Vector register rows
    pub vector_rows: usize,
    /// Scalar register rows
    pub scalar_rows: usize,
    /// Predicate register rows
    pub predicate_rows: usize,
    /// Banks per register kind
    pub num_banks: usize,
    /// Read ports per bank
    pub read_ports: usize,
    pub bank_scheme: BankScheme,
    /// Number of decode stages (1 or 3)
    pub decode_stages: usize,
    /// Execute pipeline depth
    pub execute_depth: usize,
    /// Compute cycles per external-memory cycle
    pub clock_ratio: usize,
    /// Register accesses per memory cycle on the bulk-memory interface
    pub bulk_bus_width: usize,
    /// Register accesses per memory cycle on each scratchpad interface
    pub scratchpad_bus_width: usize,
    /// Bulk-memory latency in memory cycles
    pub bulk_latency: usize,
    /// Scratchpad latency in memory cycles
    pub scratchpad_latency: usize,
    /// Bulk-memory burst size used to estimate program load latency
    pub bulk_burst_bytes: usize,
    /// Divergence stack entries per slot
    pub ctrl_stack_depth: usize,
    /// Capacity of the cross-clock hand-off queues
    pub handoff_queue_size: usize,
    /// Capacity of the workgroup stream
    pub workgroup_queue_size: usize,
    pub options: SchedulingOptions,
    pub cycle_limit: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            num_clusters: 1,
            lanes: 8,
            max_threads_per_slot: 1024,
            vector_rows: 64,
            scalar_rows: 32,
            predicate_rows: 4,
            num_banks: 4,
            read_ports: 1,
            bank_scheme: BankScheme::SinglePort,
            decode_stages: 1,
            execute_depth: 4,
            clock_ratio: 2,
            bulk_bus_width: 4,
            scratchpad_bus_width: 8,
            bulk_latency: 20,
            scratchpad_latency: 4,
            bulk_burst_bytes: 64,
            ctrl_stack_depth: 16,
            handoff_queue_size: 4,
            workgroup_queue_size: 2,
            options: SchedulingOptions::EMPTY,
            cycle_limit: None,
        }
    }
}

fn invalid(field: &'static str, value: usize, reason: &'static str) -> Error {
    Error::Invalid {
        field,
        value,
        reason,
    }
}

impl Config {
    /// Validate the configuration.
    ///
    /// Must be called before any simulation state is built.
    pub fn validate(&self) -> Result<(), Error> {
        self.options.validate()?;

        if self.num_clusters == 0 {
            return Err(invalid("num_clusters", 0, "need at least one cluster"));
        }
        if !self.lanes.is_power_of_two() {
            return Err(invalid("lanes", self.lanes, "must be a power of two"));
        }
        if self.lanes > crate::register::MAX_LANES {
            return Err(invalid("lanes", self.lanes, "at most 32 lanes per warp"));
        }
        if !self.num_banks.is_power_of_two() {
            return Err(invalid("num_banks", self.num_banks, "must be a power of two"));
        }
        if self.max_threads_per_slot < crate::workgroup::MIN_WORKGROUP_WIDTH
            || self.max_threads_per_slot % self.lanes != 0
        {
            return Err(invalid(
                "max_threads_per_slot",
                self.max_threads_per_slot,
                "must be a multiple of lanes and at least 32",
            ));
        }
        for (field, rows) in [
            ("vector_rows", self.vector_rows),
            ("scalar_rows", self.scalar_rows),
            ("predicate_rows", self.predicate_rows),
        ] {
            if rows == 0 {
                return Err(invalid(field, rows, "need at least one row"));
            }
        }
        if !matches!(self.read_ports, 1 | 3) {
            return Err(invalid("read_ports", self.read_ports, "must be 1 or 3"));
        }
        let expected = self.bank_scheme.required_read_ports();
        if self.read_ports != expected {
            return Err(Error::PortSchemeMismatch {
                scheme: self.bank_scheme,
                expected,
                read_ports: self.read_ports,
            });
        }
        if !matches!(self.decode_stages, 1 | 3) {
            return Err(invalid("decode_stages", self.decode_stages, "must be 1 or 3"));
        }
        if self.execute_depth == 0 {
            return Err(invalid("execute_depth", 0, "must be at least 1"));
        }
        if self.clock_ratio == 0 {
            return Err(invalid("clock_ratio", 0, "must be at least 1"));
        }
        for (field, width) in [
            ("bulk_bus_width", self.bulk_bus_width),
            ("scratchpad_bus_width", self.scratchpad_bus_width),
        ] {
            if !matches!(width, 4 | 8) {
                return Err(invalid(field, width, "must be 4 or 8"));
            }
        }
        if self.ctrl_stack_depth == 0 {
            return Err(invalid("ctrl_stack_depth", 0, "must be at least 1"));
        }
        if self.handoff_queue_size == 0 || self.workgroup_queue_size == 0 {
            return Err(invalid(
                "handoff_queue_size",
                self.handoff_queue_size.min(self.workgroup_queue_size),
                "queues need at least one entry",
            ));
        }
        Ok(())
    }

    /// Warps (register file columns) per slot.
    #[must_use]
    pub fn warps_per_slot(&self) -> usize {
        self.max_threads_per_slot / self.lanes
    }

    /// Stages between fetch and writeback (inclusive of operand read and writeback).
    #[must_use]
    pub fn pipeline_depth(&self) -> usize {
        // fetch + decode + operand read + execute + writeback
        1 + self.decode_stages + 1 + self.execute_depth + 1
    }

    /// Maximum number of outstanding scoreboard entries.
    #[must_use]
    pub fn scoreboard_capacity(&self) -> usize {
        self.pipeline_depth()
    }

    /// Rows of a register kind.
    #[must_use]
    pub fn rows(&self, kind: crate::register::Kind) -> usize {
        use crate::register::Kind;
        match kind {
            Kind::Vector => self.vector_rows,
            Kind::Scalar => self.scalar_rows,
            Kind::Predicate => self.predicate_rows,
            Kind::VectorSpecial => crate::register::Special::NUM_VECTOR,
            Kind::ScalarSpecial => crate::register::Special::NUM_SCALAR,
            Kind::Immediate => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{BankScheme, Config, Error, SchedulingOption, SchedulingOptions};
    use pretty_assertions_sorted as diff;

    #[test]
    fn test_default_config_is_valid() {
        assert_eq!(Config::default().validate(), Ok(()));
        assert_eq!(Config::default().warps_per_slot(), 128);
    }

    #[test]
    fn test_forbid_parallel_options_are_mutually_exclusive() {
        let options = SchedulingOptions::EMPTY
            .with(SchedulingOption::ForbidParallelComputeScratchpad)
            .with(SchedulingOption::ForbidParallelBulkScratchpad);
        let config = Config {
            options,
            ..Config::default()
        };
        diff::assert_eq!(
            config.validate(),
            Err(Error::ConflictingOptions(
                SchedulingOption::ForbidParallelComputeScratchpad,
                SchedulingOption::ForbidParallelBulkScratchpad,
            ))
        );

        // each one on its own is fine
        let single = SchedulingOptions::EMPTY.with(SchedulingOption::ForbidParallelBulkScratchpad);
        assert_eq!(single.validate(), Ok(()));
    }

    #[test]
    fn test_port_scheme_mismatch_is_rejected() {
        let config = Config {
            bank_scheme: BankScheme::MultiPort,
            read_ports: 1,
            ..Config::default()
        };
        assert_eq!(
            config.validate(),
            Err(Error::PortSchemeMismatch {
                scheme: BankScheme::MultiPort,
                expected: 3,
                read_ports: 1,
            })
        );
        let config = Config {
            bank_scheme: BankScheme::MultiPort,
            read_ports: 3,
            ..Config::default()
        };
        assert_eq!(config.validate(), Ok(()));
    }

    #[test]
    fn test_invalid_geometry_is_rejected() {
        let config = Config {
            lanes: 6,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Invalid { field: "lanes", .. })
        ));
        let config = Config {
            decode_stages: 2,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(Error::Invalid {
                field: "decode_stages",
                ..
            })
        ));
    }

    #[test]
    fn test_parse_scheduling_options() -> Result<(), Error> {
        let options: SchedulingOptions = "pairwise-workgroups, stop-on-kernel-finish".parse()?;
        assert!(options.contains(SchedulingOption::PairwiseWorkgroups));
        assert!(options.contains(SchedulingOption::StopOnKernelFinish));
        assert!(!options.contains(SchedulingOption::StopOnMemoryDrain));
        assert_eq!(
            options.to_string(),
            "[pairwise-workgroups,stop-on-kernel-finish]"
        );
        assert_eq!(
            "warp-speed".parse::<SchedulingOptions>(),
            Err(Error::UnknownOption("warp-speed".to_string()))
        );
        Ok(())
    }
}
