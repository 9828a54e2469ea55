use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scheduler {
    pub num_issued: u64,
    pub issue_raw_hazard_stall: u64,
    pub issue_ctrl_stack_stall: u64,
    pub issue_bank_conflict_stall: u64,
    pub issue_warp_enumeration_stall: u64,
    pub fetch_policy_stall: u64,
}

impl std::ops::AddAssign for Scheduler {
    fn add_assign(&mut self, other: Self) {
        self.num_issued += other.num_issued;
        self.issue_raw_hazard_stall += other.issue_raw_hazard_stall;
        self.issue_ctrl_stack_stall += other.issue_ctrl_stack_stall;
        self.issue_bank_conflict_stall += other.issue_bank_conflict_stall;
        self.issue_warp_enumeration_stall += other.issue_warp_enumeration_stall;
        self.fetch_policy_stall += other.fetch_policy_stall;
    }
}
