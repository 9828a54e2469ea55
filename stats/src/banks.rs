use serde::{Deserialize, Serialize};

/// Register bank utilization.
///
/// One counter per bank, summed over all register kinds and both slots.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Banks {
    pub reads: Vec<u64>,
    pub writes: Vec<u64>,
    pub conflicts: u64,
}

impl Banks {
    #[must_use]
    pub fn new(num_banks: usize) -> Self {
        Self {
            reads: vec![0; num_banks],
            writes: vec![0; num_banks],
            conflicts: 0,
        }
    }

    pub fn read(&mut self, bank: usize) {
        if let Some(count) = self.reads.get_mut(bank) {
            *count += 1;
        }
    }

    pub fn write(&mut self, bank: usize) {
        if let Some(count) = self.writes.get_mut(bank) {
            *count += 1;
        }
    }

    #[must_use]
    pub fn total_accesses(&self) -> u64 {
        self.reads.iter().chain(self.writes.iter()).sum()
    }
}

impl std::ops::AddAssign for Banks {
    fn add_assign(&mut self, other: Self) {
        let num_banks = self.reads.len().max(other.reads.len());
        self.reads.resize(num_banks, 0);
        self.writes.resize(num_banks, 0);
        for (total, count) in self.reads.iter_mut().zip(other.reads) {
            *total += count;
        }
        for (total, count) in self.writes.iter_mut().zip(other.writes) {
            *total += count;
        }
        self.conflicts += other.conflicts;
    }
}
