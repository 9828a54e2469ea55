#![allow(clippy::module_name_repetitions)]

pub mod banks;
pub mod scheduler;
pub mod sim;
pub mod units;

pub use banks::Banks;
pub use scheduler::Scheduler;
pub use sim::Sim;
pub use units::{Unit, Units};

use serde::{Deserialize, Serialize};

/// Read-only statistics snapshot taken at kernel completion.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub sim: Sim,
    pub units: Units,
    pub scheduler: Scheduler,
    pub banks: Banks,
}

impl Stats {
    #[must_use]
    pub fn new(num_banks: usize) -> Self {
        Self {
            sim: Sim::default(),
            units: Units::default(),
            scheduler: Scheduler::default(),
            banks: Banks::new(num_banks),
        }
    }
}

impl std::ops::AddAssign for Stats {
    fn add_assign(&mut self, other: Self) {
        self.sim += other.sim;
        self.units += other.units;
        self.scheduler += other.scheduler;
        self.banks += other.banks;
    }
}
