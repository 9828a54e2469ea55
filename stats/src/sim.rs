use serde::{Deserialize, Serialize};

#[derive(Clone, Default, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sim {
    /// Total simulated compute cycles.
    pub cycles: u64,
    /// Cycles from kick-off until the cluster completion notice.
    pub elapsed_cycles: u64,
    /// Cycles spent uploading the program and buffer table.
    pub load_cycles: u64,
    pub num_threads: u64,
    pub num_workgroups: u64,
    /// Warp instructions that reached writeback.
    pub instructions: u64,
}

impl std::ops::AddAssign for Sim {
    fn add_assign(&mut self, other: Self) {
        self.cycles = self.cycles.max(other.cycles);
        self.elapsed_cycles = self.elapsed_cycles.max(other.elapsed_cycles);
        self.load_cycles = self.load_cycles.max(other.load_cycles);
        self.num_threads += other.num_threads;
        self.num_workgroups += other.num_workgroups;
        self.instructions += other.instructions;
    }
}
