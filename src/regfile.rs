use crate::config::Config;
use crate::hazard::{self, BusMask, HazardPolicy};
use crate::register::{
    full_mask, ControlMask, Kind, LaneMask, LaneValues, Register, Special, NUM_SLOTS,
};
use crate::workgroup::Workgroup;

/// External-store port of the register file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, strum::Display)]
pub enum StorePort {
    BulkMemory,
    /// One scratchpad port per slot.
    Scratchpad(usize),
}

/// One register access of an external transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StoreAccess {
    pub data: Register,
    /// Per-lane index register of a lane-indexed transfer.
    pub index: Option<Register>,
}

impl StoreAccess {
    #[must_use]
    pub fn new(data: Register) -> Self {
        Self { data, index: None }
    }

    #[must_use]
    pub fn indexed(data: Register, index: Register) -> Self {
        Self {
            data,
            index: Some(index),
        }
    }
}

/// Result of reading one register through an external-store port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreRead {
    pub values: LaneValues,
    /// Per-lane index of a lane-indexed transfer.
    pub indices: Option<LaneValues>,
    /// Lanes taking part in the transfer.
    pub active: LaneMask,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PendingWrite {
    reg: Register,
    mask: LaneMask,
    values: LaneValues,
}

#[derive(Debug, Clone, Default)]
struct Slot {
    workgroup: Option<Workgroup>,
    vector: Vec<u32>,
    scalar: Vec<u32>,
    predicate: Vec<LaneMask>,
    /// Control masks, one lane mask per warp.
    run: Vec<LaneMask>,
    brk: Vec<LaneMask>,
    ret: Vec<LaneMask>,
    exit: Vec<LaneMask>,
    finished: bool,
}

impl Slot {
    fn mask(&self, mask: ControlMask) -> &Vec<LaneMask> {
        match mask {
            ControlMask::Run => &self.run,
            ControlMask::Break => &self.brk,
            ControlMask::Return => &self.ret,
            ControlMask::Exit => &self.exit,
        }
    }

    fn mask_mut(&mut self, mask: ControlMask) -> &mut Vec<LaneMask> {
        match mask {
            ControlMask::Run => &mut self.run,
            ControlMask::Break => &mut self.brk,
            ControlMask::Return => &mut self.ret,
            ControlMask::Exit => &mut self.exit,
        }
    }

    fn lane_active(&self, col: usize) -> LaneMask {
        self.run[col] & !self.brk[col] & !self.ret[col] & !self.exit[col]
    }
}

/// Banked register file of one cluster.
///
/// Holds vector, scalar and predicate registers and the control masks for
/// both workgroup slots. Special registers are derived from the workgroup
/// geometry.
///
/// Writes are buffered and become visible with [`RegFile::commit`], except
/// for control mask writes: they update the derived lane active mask and the
/// finished flag of the slot in the same cycle.
#[derive(Debug)]
pub struct RegFile {
    pub cluster_id: usize,
    lanes: usize,
    warps: usize,
    vector_rows: usize,
    scalar_rows: usize,
    predicate_rows: usize,
    policy: Box<dyn HazardPolicy>,
    slots: [Slot; NUM_SLOTS],
    pending: Vec<PendingWrite>,
    cycle: u64,
    /// Slots accessed by the pipeline during this cycle.
    pipeline_slots: [bool; NUM_SLOTS],
    /// Slots accessed by an external-store port during this cycle.
    store_slots: [Option<StorePort>; NUM_SLOTS],
    pub stats: stats::Banks,
}

impl RegFile {
    #[must_use]
    pub fn new(cluster_id: usize, config: &Config) -> Self {
        let warps = config.warps_per_slot();
        let lanes = config.lanes;
        let slot = Slot {
            workgroup: None,
            vector: vec![0; config.vector_rows * warps * lanes],
            scalar: vec![0; config.scalar_rows],
            predicate: vec![LaneMask::ZERO; config.predicate_rows * warps],
            run: vec![LaneMask::ZERO; warps],
            brk: vec![LaneMask::ZERO; warps],
            ret: vec![LaneMask::ZERO; warps],
            exit: vec![LaneMask::ZERO; warps],
            finished: false,
        };
        Self {
            cluster_id,
            lanes,
            warps,
            vector_rows: config.vector_rows,
            scalar_rows: config.scalar_rows,
            predicate_rows: config.predicate_rows,
            policy: hazard::from_config(config),
            slots: [slot.clone(), slot],
            pending: Vec::new(),
            cycle: 0,
            pipeline_slots: [false; NUM_SLOTS],
            store_slots: [None; NUM_SLOTS],
            stats: stats::Banks::new(config.num_banks),
        }
    }

    #[must_use]
    pub fn policy(&self) -> &dyn HazardPolicy {
        self.policy.as_ref()
    }

    #[must_use]
    pub fn lanes(&self) -> usize {
        self.lanes
    }

    #[must_use]
    pub fn warps(&self) -> usize {
        self.warps
    }

    #[must_use]
    pub fn workgroup(&self, slot: usize) -> Option<&Workgroup> {
        self.slots[slot].workgroup.as_ref()
    }

    /// Load a new workgroup into a slot.
    ///
    /// Resets the control masks and the finished flag of the slot.
    pub fn load_workgroup(&mut self, slot: usize, workgroup: Workgroup) {
        assert!(
            workgroup.last_warp < self.warps,
            "cycle {} cluster {}: workgroup {} needs {} warps, but slot {} has {}",
            self.cycle,
            self.cluster_id,
            workgroup.id,
            workgroup.last_warp + 1,
            slot,
            self.warps,
        );
        let lanes = self.lanes;
        let state = &mut self.slots[slot];
        for col in 0..self.warps {
            let mut run = LaneMask::ZERO;
            if col <= workgroup.last_warp {
                for lane in 0..lanes {
                    run.set(lane, workgroup.contains(col * lanes + lane));
                }
            }
            state.run[col] = run;
            state.brk[col] = LaneMask::ZERO;
            state.ret[col] = LaneMask::ZERO;
            state.exit[col] = LaneMask::ZERO;
        }
        state.finished = false;
        log::debug!(
            "cycle {} cluster {}: slot {} loads workgroup {} (offset={}, last warp={})",
            self.cycle,
            self.cluster_id,
            slot,
            workgroup.id,
            workgroup.offset,
            workgroup.last_warp
        );
        state.workgroup = Some(workgroup);
        self.pending.retain(|write| write.reg.slot != slot);
    }

    /// Release the workgroup of a slot.
    pub fn unload_workgroup(&mut self, slot: usize) {
        self.slots[slot].workgroup = None;
        self.slots[slot].finished = false;
    }

    /// Whether every lane of the slot's workgroup stopped running or exited.
    #[must_use]
    pub fn workgroup_finished(&self, slot: usize) -> bool {
        self.slots[slot].finished
    }

    /// Lanes of a warp that are running and neither broke, returned nor exited.
    #[must_use]
    pub fn lane_active(&self, slot: usize, col: usize) -> LaneMask {
        self.check_col(slot, col);
        self.slots[slot].lane_active(col)
    }

    #[must_use]
    pub fn control_mask(&self, slot: usize, col: usize, mask: ControlMask) -> LaneMask {
        self.check_col(slot, col);
        self.slots[slot].mask(mask)[col]
    }

    /// Whether any lane of the slot's workgroup is active.
    #[must_use]
    pub fn any_lane_active(&self, slot: usize) -> bool {
        let Some(last_warp) = self.slots[slot].workgroup.as_ref().map(|wg| wg.last_warp) else {
            return false;
        };
        (0..=last_warp).any(|col| self.slots[slot].lane_active(col).any())
    }

    fn update_finished(&mut self, slot: usize) {
        let state = &mut self.slots[slot];
        let Some(last_warp) = state.workgroup.as_ref().map(|wg| wg.last_warp) else {
            return;
        };
        let finished = (0..=last_warp).all(|col| (state.run[col] & !state.exit[col]).not_any());
        if finished && !state.finished {
            log::debug!(
                "cycle {} cluster {}: slot {} workgroup finished",
                self.cycle,
                self.cluster_id,
                slot
            );
        }
        state.finished = finished;
    }

    fn check_col(&self, slot: usize, col: usize) {
        assert!(
            slot < NUM_SLOTS && col < self.warps,
            "cycle {} cluster {}: column {} of slot {} out of range ({} warps)",
            self.cycle,
            self.cluster_id,
            col,
            slot,
            self.warps
        );
    }

    fn check(&self, reg: &Register) {
        let rows = match reg.kind {
            Kind::Vector => self.vector_rows,
            Kind::Scalar => self.scalar_rows,
            Kind::Predicate => self.predicate_rows,
            Kind::VectorSpecial => Special::NUM_VECTOR,
            Kind::ScalarSpecial => Special::NUM_SCALAR,
            Kind::Immediate => return,
        };
        assert!(
            reg.row < rows && reg.col < self.warps && reg.slot < NUM_SLOTS,
            "cycle {} cluster {}: register {} out of range (rows={}, warps={})",
            self.cycle,
            self.cluster_id,
            reg,
            rows,
            self.warps
        );
    }

    fn vector_index(&self, reg: &Register) -> usize {
        (reg.row * self.warps + reg.col) * self.lanes
    }

    /// Read the current value of a register.
    fn value(&self, reg: &Register) -> LaneValues {
        self.check(reg);
        let lanes = self.lanes;
        let state = &self.slots[reg.slot];
        match reg.kind {
            Kind::Vector => {
                let start = self.vector_index(reg);
                state.vector[start..start + lanes].iter().copied().collect()
            }
            Kind::Scalar => std::iter::repeat(state.scalar[reg.row]).take(lanes).collect(),
            Kind::Predicate => {
                let bits = state.predicate[reg.row * self.warps + reg.col];
                (0..lanes).map(|lane| u32::from(bits[lane])).collect()
            }
            Kind::Immediate => {
                let value = u32::try_from(reg.row).unwrap_or(u32::MAX);
                std::iter::repeat(value).take(lanes).collect()
            }
            Kind::VectorSpecial | Kind::ScalarSpecial => self.special_value(reg),
        }
    }

    fn special_value(&self, reg: &Register) -> LaneValues {
        let lanes = self.lanes;
        let state = &self.slots[reg.slot];
        let special = reg.as_special().unwrap_or_else(|| {
            panic!(
                "cycle {} cluster {}: {} is not a special register",
                self.cycle, self.cluster_id, reg
            )
        });
        let bits = |mask: LaneMask| -> LaneValues {
            (0..lanes).map(|lane| u32::from(mask[lane])).collect()
        };
        let broadcast =
            |value: usize| -> LaneValues { std::iter::repeat(value as u32).take(lanes).collect() };
        if let Some(mask) = special.control_mask() {
            return bits(state.mask(mask)[reg.col]);
        }
        if special == Special::LaneActive {
            return bits(state.lane_active(reg.col));
        }
        let wg = state.workgroup.as_ref().unwrap_or_else(|| {
            panic!(
                "cycle {} cluster {}: read of {} in empty slot {}",
                self.cycle, self.cluster_id, reg, reg.slot
            )
        });
        let thread = |lane: usize| wg.thread_id(reg.col * lanes + lane);
        match special {
            Special::ThreadIdX => (0..lanes).map(|lane| thread(lane).x as u32).collect(),
            Special::ThreadIdY => (0..lanes).map(|lane| thread(lane).y as u32).collect(),
            Special::LaneId => (0..lanes).map(|lane| lane as u32).collect(),
            Special::WarpId => broadcast(reg.col),
            Special::WorkgroupOffsetX => broadcast(wg.offset.x),
            Special::WorkgroupOffsetY => broadcast(wg.offset.y),
            Special::WorkgroupWidth => broadcast(wg.width),
            Special::ThreadSpaceX => broadcast(wg.thread_space.x),
            Special::ThreadSpaceY => broadcast(wg.thread_space.y),
            Special::LastWarp => broadcast(wg.last_warp),
            Special::WorkgroupHeight => broadcast(wg.height),
            Special::TransferBase => broadcast(wg.offset.y * wg.thread_space.x + wg.offset.x),
            Special::TransferStride => broadcast(wg.thread_space.x),
            Special::TransferRows => broadcast(
                wg.thread_space
                    .y
                    .saturating_sub(wg.offset.y)
                    .min(wg.height),
            ),
            Special::Run
            | Special::Break
            | Special::Return
            | Special::Exit
            | Special::LaneActive => unreachable!(),
        }
    }

    /// Read up to three operands for the pipeline.
    ///
    /// # Panics
    /// If the operands still conflict, or an external-store port accesses
    /// the same slot during this cycle.
    pub fn pipeline_read(&mut self, accesses: &[Option<Register>; 3]) -> [Option<LaneValues>; 3] {
        let conflicts = self.policy.issue_conflicts(accesses);
        assert!(
            conflicts.not_any(),
            "cycle {} cluster {}: unresolved bank conflict at operand read: {:?} (conflicts={})",
            self.cycle,
            self.cluster_id,
            accesses,
            conflicts
        );
        let mut values: [Option<LaneValues>; 3] = [None, None, None];
        for (value, reg) in values.iter_mut().zip(accesses.iter()) {
            let Some(reg) = reg else {
                continue;
            };
            self.touch_pipeline(reg);
            if let Some(loc) = self.policy.locate(reg) {
                self.stats.read(loc.bank);
            }
            *value = Some(self.value(reg));
        }
        values
    }

    /// Write a register from the pipeline.
    ///
    /// Only lanes set in `mask` are written. Control mask writes take
    /// effect immediately, all other writes at the end of the cycle.
    ///
    /// # Panics
    /// If the register is not writable.
    pub fn pipeline_write(&mut self, reg: Register, mask: LaneMask, values: LaneValues) {
        self.check(&reg);
        self.touch_pipeline(&reg);
        match reg.kind {
            Kind::Vector | Kind::Scalar | Kind::Predicate => {
                if let Some(loc) = self.policy.locate(&reg) {
                    self.stats.write(loc.bank);
                }
                self.pending.push(PendingWrite { reg, mask, values });
            }
            Kind::VectorSpecial => match reg.as_special().and_then(Special::control_mask) {
                Some(control) => self.write_control_mask(reg, control, mask, &values),
                None => panic!(
                    "cycle {} cluster {}: write to read-only special register {}",
                    self.cycle, self.cluster_id, reg
                ),
            },
            Kind::ScalarSpecial | Kind::Immediate => panic!(
                "cycle {} cluster {}: write to read-only register {}",
                self.cycle, self.cluster_id, reg
            ),
        }
    }

    fn write_control_mask(
        &mut self,
        reg: Register,
        control: ControlMask,
        mask: LaneMask,
        values: &LaneValues,
    ) {
        let lanes = self.lanes;
        let bits = &mut self.slots[reg.slot].mask_mut(control)[reg.col];
        for lane in mask.iter_ones().take_while(|lane| *lane < lanes) {
            bits.set(lane, values.get(lane).copied().unwrap_or_default() != 0);
        }
        log::trace!(
            "cycle {} cluster {}: {} <= {}",
            self.cycle,
            self.cluster_id,
            reg,
            bits
        );
        self.update_finished(reg.slot);
    }

    fn touch_pipeline(&mut self, reg: &Register) {
        if reg.kind == Kind::Immediate {
            return;
        }
        if let Some(port) = self.store_slots[reg.slot] {
            let store = Register::new(Kind::Vector, 0, 0, reg.slot);
            assert!(
                !self.policy.access_execute_hazard(&store, reg),
                "cycle {} cluster {}: pipeline access to {} while {} port accesses slot {}",
                self.cycle,
                self.cluster_id,
                reg,
                port,
                reg.slot
            );
        }
        self.pipeline_slots[reg.slot] = true;
    }

    fn touch_store(&mut self, port: StorePort, reg: &Register) {
        assert!(
            matches!(reg.kind, Kind::Vector | Kind::Scalar),
            "cycle {} cluster {}: {} port cannot transfer {}",
            self.cycle,
            self.cluster_id,
            port,
            reg
        );
        if self.pipeline_slots[reg.slot] {
            let pipeline = Register::new(Kind::Vector, 0, 0, reg.slot);
            assert!(
                !self.policy.access_execute_hazard(reg, &pipeline),
                "cycle {} cluster {}: {} port accesses {} while the pipeline accesses slot {}",
                self.cycle,
                self.cluster_id,
                port,
                reg,
                reg.slot
            );
        }
        self.store_slots[reg.slot] = Some(port);
    }

    /// Bank conflicts of one transfer beat.
    ///
    /// Data registers and the index registers of a lane-indexed transfer
    /// are checked separately, an access conflicts if either does.
    #[must_use]
    pub fn transfer_conflicts(&self, accesses: &[StoreAccess], active: &BusMask) -> BusMask {
        let data: Vec<Register> = accesses.iter().map(|access| access.data).collect();
        let mut conflicts = self.policy.transfer_conflicts(&data, active);

        let mut indexed = *active;
        for (i, access) in accesses.iter().enumerate() {
            if access.index.is_none() {
                indexed.set(i, false);
            }
        }
        if indexed.any() {
            let indices: Vec<Register> = accesses
                .iter()
                .map(|access| access.index.unwrap_or(access.data))
                .collect();
            let index_conflicts = self.policy.transfer_conflicts(&indices, &indexed);
            for i in index_conflicts.iter_ones() {
                conflicts.set(i, true);
            }
        }
        conflicts
    }

    fn check_store_conflicts(&self, port: StorePort, accesses: &[StoreAccess], active: &BusMask) {
        let conflicts = self.transfer_conflicts(accesses, active);
        assert!(
            conflicts.not_any(),
            "cycle {} cluster {}: unresolved bank conflict on {} port: {:?} (conflicts={})",
            self.cycle,
            self.cluster_id,
            port,
            accesses,
            conflicts
        );
    }

    fn read_index(&mut self, port: StorePort, index: &Register) -> LaneValues {
        self.check(index);
        self.touch_store(port, index);
        if let Some(loc) = self.policy.locate(index) {
            self.stats.read(loc.bank);
        }
        self.value(index)
    }

    fn store_lanes(&self, reg: &Register) -> LaneMask {
        match reg.kind {
            Kind::Vector => self.slots[reg.slot].lane_active(reg.col),
            _ => full_mask(self.lanes),
        }
    }

    /// Read registers through an external-store port.
    ///
    /// # Panics
    /// If the accesses conflict or the pipeline accesses the same slot.
    pub fn store_read(
        &mut self,
        port: StorePort,
        accesses: &[StoreAccess],
        active: &BusMask,
    ) -> Vec<Option<StoreRead>> {
        self.check_store_conflicts(port, accesses, active);
        accesses
            .iter()
            .enumerate()
            .map(|(i, access)| {
                if !active[i] {
                    return None;
                }
                self.touch_store(port, &access.data);
                if let Some(loc) = self.policy.locate(&access.data) {
                    self.stats.read(loc.bank);
                }
                let indices = access.index.map(|index| self.read_index(port, &index));
                Some(StoreRead {
                    values: self.value(&access.data),
                    indices,
                    active: self.store_lanes(&access.data),
                })
            })
            .collect()
    }

    /// Write registers through an external-store port.
    ///
    /// Only active lanes of the slot are written.
    ///
    /// # Panics
    /// If the accesses conflict or the pipeline accesses the same slot.
    pub fn store_write(
        &mut self,
        port: StorePort,
        accesses: &[(StoreAccess, LaneValues)],
        active: &BusMask,
    ) {
        let regs: Vec<StoreAccess> = accesses.iter().map(|(access, _)| *access).collect();
        self.check_store_conflicts(port, &regs, active);
        for (i, (access, values)) in accesses.iter().enumerate() {
            if !active[i] {
                continue;
            }
            self.check(&access.data);
            self.touch_store(port, &access.data);
            if let Some(loc) = self.policy.locate(&access.data) {
                self.stats.write(loc.bank);
            }
            let mask = self.store_lanes(&access.data);
            self.pending.push(PendingWrite {
                reg: access.data,
                mask,
                values: values.clone(),
            });
        }
    }

    /// Read the per-lane indices of a lane-indexed load.
    ///
    /// # Panics
    /// If the accesses conflict or the pipeline accesses the same slot.
    pub fn store_indices(
        &mut self,
        port: StorePort,
        accesses: &[StoreAccess],
        active: &BusMask,
    ) -> Vec<Option<LaneValues>> {
        self.check_store_conflicts(port, accesses, active);
        accesses
            .iter()
            .enumerate()
            .map(|(i, access)| {
                let index = access.index.filter(|_| active[i])?;
                Some(self.read_index(port, &index))
            })
            .collect()
    }

    /// Apply the writes of this cycle.
    ///
    /// # Panics
    /// If two writes of this cycle target the same storage location.
    pub fn commit(&mut self) {
        let mut written = std::collections::HashSet::new();
        for write in std::mem::take(&mut self.pending) {
            let PendingWrite { reg, mask, values } = write;
            assert!(
                written.insert(reg),
                "cycle {} cluster {}: register {} written twice in one cycle",
                self.cycle,
                self.cluster_id,
                reg
            );
            let lanes = self.lanes;
            let start = self.vector_index(&reg);
            let pred = reg.row * self.warps + reg.col;
            let state = &mut self.slots[reg.slot];
            match reg.kind {
                Kind::Vector => {
                    for lane in mask.iter_ones().take_while(|lane| *lane < lanes) {
                        if let Some(value) = values.get(lane) {
                            state.vector[start + lane] = *value;
                        }
                    }
                }
                Kind::Scalar => {
                    if let Some(lane) = mask.first_one() {
                        if let Some(value) = values.get(lane) {
                            state.scalar[reg.row] = *value;
                        }
                    }
                }
                Kind::Predicate => {
                    for lane in mask.iter_ones().take_while(|lane| *lane < lanes) {
                        let bit = values.get(lane).copied().unwrap_or_default() != 0;
                        state.predicate[pred].set(lane, bit);
                    }
                }
                _ => unreachable!(),
            }
            log::trace!(
                "cycle {} cluster {}: commit {} = {:?}",
                self.cycle,
                self.cluster_id,
                reg,
                values
            );
        }
        self.pipeline_slots = [false; NUM_SLOTS];
        self.store_slots = [None; NUM_SLOTS];
        self.cycle += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::{RegFile, StoreAccess, StorePort};
    use crate::config::Config;
    use crate::hazard::BusMask;
    use crate::register::{full_mask, ControlMask, LaneMask, LaneValues, Register, Special};
    use crate::workgroup::{Dim, Workgroup};
    use pretty_assertions_sorted as diff;

    fn workgroup(last_warp: usize) -> Workgroup {
        Workgroup {
            id: 0,
            offset: Dim::new(32, 0),
            width: 32,
            height: 32,
            thread_space: Dim::new(64, 64),
            last_warp,
        }
    }

    fn lane_indices(lanes: usize) -> LaneValues {
        (0..lanes as u32).collect()
    }

    #[test]
    fn test_write_then_read_vector_row() {
        crate::testing::init_logging();
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        let lanes = config.lanes;
        regfile.load_workgroup(0, workgroup(7));
        for col in 0..8 {
            regfile.pipeline_write(
                Register::vector(0, col, 0),
                full_mask(lanes),
                lane_indices(lanes),
            );
        }
        regfile.commit();
        let values = regfile.pipeline_read(&[Some(Register::vector(0, 0, 0)), None, None]);
        diff::assert_eq!(values[0].as_deref(), Some(lane_indices(lanes).as_slice()));

        // other slot is untouched
        let values = regfile.pipeline_read(&[Some(Register::vector(0, 0, 1)), None, None]);
        diff::assert_eq!(values[0].as_deref(), Some(vec![0; lanes].as_slice()));
    }

    #[test]
    fn test_writes_become_visible_after_commit() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        let reg = Register::scalar(3, 1);
        regfile.pipeline_write(reg, full_mask(config.lanes), LaneValues::from_elem(9, 8));
        let first = regfile.pipeline_read(&[Some(reg), None, None]);
        let second = regfile.pipeline_read(&[Some(reg), None, None]);
        assert_eq!(first, second);
        assert_eq!(first[0].as_deref(), Some([0; 8].as_slice()));

        regfile.commit();
        let after = regfile.pipeline_read(&[Some(reg), None, None]);
        assert_eq!(after[0].as_deref(), Some([9; 8].as_slice()));
    }

    #[test]
    fn test_special_registers_follow_geometry() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        regfile.load_workgroup(1, workgroup(127));
        let values = regfile.pipeline_read(&[
            Some(Register::special(Special::ThreadIdX, 5, 1)),
            Some(Register::special(Special::ThreadIdY, 5, 1)),
            Some(Register::special(Special::WorkgroupOffsetX, 0, 1)),
        ]);
        // warp 5 holds threads 40..48 => x = 32 + 8.., y = 1
        diff::assert_eq!(
            values[0].as_deref(),
            Some([40, 41, 42, 43, 44, 45, 46, 47].as_slice())
        );
        diff::assert_eq!(values[1].as_deref(), Some([1; 8].as_slice()));
        diff::assert_eq!(values[2].as_deref(), Some([32; 8].as_slice()));
    }

    #[test]
    fn test_transfer_specials_describe_the_tile() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        // second tile row of a 64x40 thread space: 8 of 32 rows remain
        regfile.load_workgroup(
            0,
            Workgroup {
                offset: Dim::new(32, 32),
                thread_space: Dim::new(64, 40),
                ..workgroup(3)
            },
        );
        let scalar = |special| Some(Register::special(special, 0, 0));
        let values = regfile.pipeline_read(&[
            scalar(Special::TransferBase),
            scalar(Special::TransferStride),
            scalar(Special::TransferRows),
        ]);
        diff::assert_eq!(values[0].as_deref(), Some([32 * 64 + 32; 8].as_slice()));
        diff::assert_eq!(values[1].as_deref(), Some([64; 8].as_slice()));
        diff::assert_eq!(values[2].as_deref(), Some([8; 8].as_slice()));

        let values = regfile.pipeline_read(&[scalar(Special::WorkgroupHeight), None, None]);
        diff::assert_eq!(values[0].as_deref(), Some([32; 8].as_slice()));

        // the thread id of any lane follows from base and stride
        let tid = regfile.pipeline_read(&[
            Some(Register::special(Special::ThreadIdX, 5, 0)),
            Some(Register::special(Special::ThreadIdY, 5, 0)),
            None,
        ]);
        let (Some(x), Some(y)) = (tid[0].as_ref(), tid[1].as_ref()) else {
            unreachable!("both thread ids were read");
        };
        for (lane, (x, y)) in x.iter().zip(y.iter()).enumerate() {
            let local = 5 * 8 + lane;
            let linear = (32 * 64 + 32) + (local / 32) * 64 + local % 32;
            assert_eq!((y * 64 + x) as usize, linear, "lane {lane}");
        }
    }

    #[test]
    fn test_clearing_run_finishes_workgroup() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        let last_warp = 3;
        regfile.load_workgroup(0, workgroup(last_warp));
        assert!(!regfile.workgroup_finished(0));
        assert!(regfile.any_lane_active(0));

        for col in 0..=last_warp {
            assert!(!regfile.workgroup_finished(0));
            regfile.pipeline_write(
                Register::special(Special::Run, col, 0),
                full_mask(config.lanes),
                LaneValues::from_elem(0, config.lanes),
            );
        }
        // visible in the same cycle
        assert!(regfile.workgroup_finished(0));
        assert!(regfile.lane_active(0, last_warp).not_any());
        assert!(!regfile.any_lane_active(0));

        // loading a new workgroup clears the flag
        regfile.commit();
        regfile.load_workgroup(0, workgroup(last_warp));
        assert!(!regfile.workgroup_finished(0));
    }

    #[test]
    fn test_exit_of_last_lane_finishes_workgroup() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        regfile.load_workgroup(0, workgroup(1));
        let exit = |col| Register::special(Special::Exit, col, 0);
        let ones = LaneValues::from_elem(1, config.lanes);

        regfile.pipeline_write(exit(0), full_mask(config.lanes), ones.clone());
        assert!(!regfile.workgroup_finished(0));

        let mut partial = full_mask(config.lanes);
        partial.set(config.lanes - 1, false);
        regfile.pipeline_write(exit(1), partial, ones.clone());
        assert!(!regfile.workgroup_finished(0));

        let mut last = LaneMask::ZERO;
        last.set(config.lanes - 1, true);
        regfile.pipeline_write(exit(1), last, ones);
        assert!(regfile.workgroup_finished(0));
        assert_eq!(
            regfile.control_mask(0, 1, ControlMask::Exit),
            full_mask(config.lanes)
        );
    }

    #[test]
    #[should_panic(expected = "unresolved bank conflict")]
    fn test_unresolved_conflict_is_fatal() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        let _ = regfile.pipeline_read(&[
            Some(Register::scalar(0, 0)),
            Some(Register::scalar(4, 0)),
            None,
        ]);
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_out_of_range_register_is_fatal() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        let _ = regfile.pipeline_read(&[Some(Register::vector(64, 0, 0)), None, None]);
    }

    #[test]
    #[should_panic(expected = "while the pipeline accesses slot 0")]
    fn test_access_execute_overlap_is_fatal() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        regfile.load_workgroup(0, workgroup(0));
        let _ = regfile.pipeline_read(&[Some(Register::vector(0, 0, 0)), None, None]);
        let mut active = BusMask::ZERO;
        active.set(0, true);
        let _ = regfile.store_read(
            StorePort::Scratchpad(0),
            &[StoreAccess::new(Register::vector(1, 0, 0))],
            &active,
        );
    }

    fn index_conflict() -> [StoreAccess; 2] {
        // data rows 2 and 3 fall into different banks, index rows 5 and 1 into bank 1
        [
            StoreAccess::indexed(Register::vector(2, 0, 0), Register::vector(5, 0, 0)),
            StoreAccess::indexed(Register::vector(3, 0, 0), Register::vector(1, 0, 0)),
        ]
    }

    #[test]
    fn test_index_registers_take_part_in_transfer_conflicts() {
        let config = Config::default();
        let regfile = RegFile::new(0, &config);
        let mut active = BusMask::ZERO;
        active[..2].fill(true);

        let conflicts = regfile.transfer_conflicts(&index_conflict(), &active);
        assert_eq!(conflicts.iter_ones().collect::<Vec<_>>(), vec![1]);

        let [first, second] = index_conflict();
        let unindexed = [first, StoreAccess::new(second.data)];
        assert!(regfile.transfer_conflicts(&unindexed, &active).not_any());

        // an inactive access does not claim its index bank
        active.set(0, false);
        assert!(regfile.transfer_conflicts(&index_conflict(), &active).not_any());
    }

    #[test]
    fn test_store_indices_reads_through_the_port() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        regfile.load_workgroup(0, workgroup(0));
        let mut one = BusMask::ZERO;
        one.set(0, true);
        let index = Register::vector(5, 0, 0);
        regfile.store_write(
            StorePort::BulkMemory,
            &[(StoreAccess::new(index), lane_indices(config.lanes))],
            &one,
        );
        regfile.commit();

        let [first, second] = index_conflict();
        let accesses = [first, StoreAccess::new(second.data)];
        let mut active = BusMask::ZERO;
        active[..2].fill(true);
        let indices = regfile.store_indices(StorePort::BulkMemory, &accesses, &active);
        diff::assert_eq!(indices, vec![Some(lane_indices(config.lanes)), None]);
        diff::assert_eq!(regfile.stats.reads, vec![0, 1, 0, 0]);
    }

    #[test]
    #[should_panic(expected = "unresolved bank conflict")]
    fn test_conflicting_load_indices_are_fatal() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        let mut active = BusMask::ZERO;
        active[..2].fill(true);
        let _ = regfile.store_indices(StorePort::Scratchpad(0), &index_conflict(), &active);
    }

    #[test]
    #[should_panic(expected = "while the pipeline accesses slot 0")]
    fn test_load_index_overlapping_pipeline_is_fatal() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        regfile.load_workgroup(0, workgroup(0));
        let _ = regfile.pipeline_read(&[Some(Register::vector(0, 0, 0)), None, None]);
        let mut active = BusMask::ZERO;
        active.set(0, true);
        let _ = regfile.store_indices(StorePort::BulkMemory, &index_conflict()[..1], &active);
    }

    #[test]
    fn test_store_write_respects_lane_activity() {
        let config = Config::default();
        let mut regfile = RegFile::new(0, &config);
        // thread space 36 wide: lanes of x >= 36 do not run
        regfile.load_workgroup(
            0,
            Workgroup {
                thread_space: Dim::new(36, 1),
                ..workgroup(0)
            },
        );
        let mut active = BusMask::ZERO;
        active.set(0, true);
        let reg = Register::vector(2, 0, 0);
        regfile.store_write(
            StorePort::BulkMemory,
            &[(StoreAccess::new(reg), LaneValues::from_elem(5, 8))],
            &active,
        );
        regfile.commit();

        let read = regfile.store_read(StorePort::BulkMemory, &[StoreAccess::new(reg)], &active);
        let read = read[0].clone().expect("active access");
        diff::assert_eq!(read.values.as_slice(), &[5, 5, 5, 5, 0, 0, 0, 0]);
        assert_eq!(read.active.count_ones(), 4);
    }
}
