use serde::{Deserialize, Serialize};

#[derive(
    Debug,
    Copy,
    Clone,
    strum::EnumIter,
    strum::EnumCount,
    Hash,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
)]
pub enum Unit {
    Fetch,
    Decode,
    Execute,
    Writeback,
    BulkMemory,
    Scratchpad,
}

/// Per-unit active cycle counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Units {
    pub fetch: u64,
    pub decode: u64,
    pub execute: u64,
    pub writeback: u64,
    pub bulk_memory: u64,
    pub scratchpad: u64,
}

impl Units {
    pub fn inc(&mut self, unit: Unit) {
        *self.get_mut(unit) += 1;
    }

    #[must_use]
    pub fn get(&self, unit: Unit) -> u64 {
        match unit {
            Unit::Fetch => self.fetch,
            Unit::Decode => self.decode,
            Unit::Execute => self.execute,
            Unit::Writeback => self.writeback,
            Unit::BulkMemory => self.bulk_memory,
            Unit::Scratchpad => self.scratchpad,
        }
    }

    fn get_mut(&mut self, unit: Unit) -> &mut u64 {
        match unit {
            Unit::Fetch => &mut self.fetch,
            Unit::Decode => &mut self.decode,
            Unit::Execute => &mut self.execute,
            Unit::Writeback => &mut self.writeback,
            Unit::BulkMemory => &mut self.bulk_memory,
            Unit::Scratchpad => &mut self.scratchpad,
        }
    }
}

impl std::ops::AddAssign for Units {
    fn add_assign(&mut self, other: Self) {
        self.fetch += other.fetch;
        self.decode += other.decode;
        self.execute += other.execute;
        self.writeback += other.writeback;
        self.bulk_memory += other.bulk_memory;
        self.scratchpad += other.scratchpad;
    }
}
