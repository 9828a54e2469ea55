use crate::config::{self, Config, SchedulingOptions};
use crate::fifo::Fifo;
use crate::imem::{IMem, LOAD_WIDTH};
use crate::instruction::{Instruction, Space, MAX_BUFFERS};
use crate::workgroup::{Dim, GeometryError, Raster, Workgroup};
use crate::xlat::{BufferToPhysXlat, Descriptor};
use console::style;
use serde::{Deserialize, Serialize};

/// Bytes per encoded instruction, used to estimate the program load latency.
pub const INSTRUCTION_BYTES: usize = 8;

/// Kernel launch descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkDescriptor {
    #[serde(default)]
    pub name: String,
    pub thread_space: Dim,
    /// Workgroup width exponent: tiles are `32 * 2^workgroup_width` threads wide.
    #[serde(default)]
    pub workgroup_width: u32,
    pub program: Vec<Instruction>,
    #[serde(default)]
    pub bulk_buffers: Vec<Descriptor>,
    #[serde(default)]
    pub scratchpad_buffers: Vec<Descriptor>,
    #[serde(default)]
    pub options: SchedulingOptions,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    #[error("work scheduler is busy with kernel {0:?}")]
    Busy(String),

    #[error("kernel {0:?} has an empty program")]
    EmptyProgram(String),

    #[error("{count} {space:?} buffer bindings exceed the limit of {MAX_BUFFERS}")]
    TooManyBuffers { space: Space, count: usize },

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Options(#[from] config::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum State {
    Idle,
    LoadingKernel,
    EnumeratingWorkgroups,
    AwaitingFinish,
}

#[derive(Debug, Clone)]
struct Loading {
    /// Remaining cycles of the estimated program transfer.
    latency: u64,
    next_pc: usize,
    /// Buffer bindings still to upload.
    buffers: Vec<(Space, u8, Descriptor)>,
}

/// Completion report of a kernel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Completion {
    pub elapsed_cycles: u64,
    pub load_cycles: u64,
}

/// Accepts a kernel, loads its program and buffer bindings and enumerates
/// its thread space into workgroups.
#[derive(Debug)]
pub struct WorkScheduler {
    state: State,
    descriptor: Option<WorkDescriptor>,
    options: SchedulingOptions,
    loading: Option<Loading>,
    raster: Option<Raster>,
    /// Workgroup stream pulled by the clusters.
    pub stream: Fifo<Workgroup>,
    last_issued: bool,
    kick_off_cycle: u64,
    load_done_cycle: u64,
    completion: Option<Completion>,

    capacity: usize,
    lanes: usize,
    base_options: SchedulingOptions,
    load_latency: u64,
    burst_bytes: usize,

    pub num_threads: u64,
    pub num_workgroups: u64,
}

impl WorkScheduler {
    #[must_use]
    pub fn new(config: &Config) -> Self {
        Self {
            state: State::Idle,
            descriptor: None,
            options: config.options,
            loading: None,
            raster: None,
            stream: Fifo::new(Some(config.workgroup_queue_size)),
            last_issued: false,
            kick_off_cycle: 0,
            load_done_cycle: 0,
            completion: None,
            capacity: config.max_threads_per_slot,
            lanes: config.lanes,
            base_options: config.options,
            load_latency: (config.bulk_latency * config.clock_ratio) as u64,
            burst_bytes: config.bulk_burst_bytes.max(1),
            num_threads: 0,
            num_workgroups: 0,
        }
    }

    #[must_use]
    pub fn state(&self) -> State {
        self.state
    }

    /// Effective scheduling options of the running kernel.
    #[must_use]
    pub fn options(&self) -> SchedulingOptions {
        self.options
    }

    /// All workgroups of the kernel have been enumerated.
    #[must_use]
    pub fn last_issued(&self) -> bool {
        self.last_issued
    }

    #[must_use]
    pub fn descriptor(&self) -> Option<&WorkDescriptor> {
        self.descriptor.as_ref()
    }

    /// Completion report of the last finished kernel.
    #[must_use]
    pub fn completion(&self) -> Option<Completion> {
        self.completion
    }

    /// Estimated program load latency in compute cycles.
    #[must_use]
    pub fn estimate_load_latency(&self, program_len: usize) -> u64 {
        let bursts = (program_len * INSTRUCTION_BYTES).div_ceil(self.burst_bytes);
        self.load_latency + bursts as u64
    }

    /// Kick off a kernel.
    pub fn launch(&mut self, descriptor: WorkDescriptor, cycle: u64) -> Result<(), LaunchError> {
        if self.state != State::Idle {
            let name = self
                .descriptor
                .as_ref()
                .map(|desc| desc.name.clone())
                .unwrap_or_default();
            return Err(LaunchError::Busy(name));
        }
        if descriptor.program.is_empty() {
            return Err(LaunchError::EmptyProgram(descriptor.name));
        }
        for (space, buffers) in [
            (Space::BulkMemory, &descriptor.bulk_buffers),
            (Space::Scratchpad, &descriptor.scratchpad_buffers),
        ] {
            if buffers.len() > MAX_BUFFERS {
                return Err(LaunchError::TooManyBuffers {
                    space,
                    count: buffers.len(),
                });
            }
        }
        let mut options = self.base_options;
        for option in descriptor.options.iter() {
            options.set(option, true);
        }
        options.validate()?;
        let raster = Raster::new(
            descriptor.thread_space,
            descriptor.workgroup_width,
            self.capacity,
            self.lanes,
        )?;

        let buffers = descriptor
            .bulk_buffers
            .iter()
            .enumerate()
            .map(|(handle, desc)| (Space::BulkMemory, handle as u8, *desc))
            .chain(
                descriptor
                    .scratchpad_buffers
                    .iter()
                    .enumerate()
                    .map(|(handle, desc)| (Space::Scratchpad, handle as u8, *desc)),
            )
            .collect();

        log::info!(
            "launch kernel {:?}: thread space {}, {} workgroups of {}, {} instructions",
            descriptor.name,
            descriptor.thread_space,
            raster.num_workgroups(),
            raster.tile(),
            descriptor.program.len()
        );
        self.loading = Some(Loading {
            latency: self.estimate_load_latency(descriptor.program.len()),
            next_pc: 0,
            buffers,
        });
        self.options = options;
        self.raster = Some(raster);
        self.descriptor = Some(descriptor);
        self.last_issued = false;
        self.completion = None;
        self.kick_off_cycle = cycle;
        self.num_threads = 0;
        self.num_workgroups = 0;
        self.state = State::LoadingKernel;
        Ok(())
    }

    /// Advance the scheduler by one compute cycle.
    ///
    /// `clusters_idle` reports whether every cluster has both slots empty
    /// and nothing left to pull.
    #[tracing::instrument(name = "scheduler_cycle", skip_all)]
    pub fn cycle<'a>(
        &mut self,
        cycle: u64,
        imem: &mut IMem,
        xlats: impl IntoIterator<Item = &'a mut BufferToPhysXlat>,
        clusters_idle: bool,
    ) {
        log::debug!(
            "{}",
            style(format!("cycle {cycle:03} work scheduler: {}", self.state)).cyan()
        );
        match self.state {
            State::Idle => {}
            State::LoadingKernel => self.load(cycle, imem, xlats),
            State::EnumeratingWorkgroups => self.enumerate(),
            State::AwaitingFinish => {
                if clusters_idle && self.stream.is_empty() {
                    let completion = Completion {
                        elapsed_cycles: cycle.saturating_sub(self.kick_off_cycle),
                        load_cycles: self.load_done_cycle.saturating_sub(self.kick_off_cycle),
                    };
                    log::info!(
                        "kernel {:?} finished after {} cycles ({} load cycles)",
                        self.descriptor.as_ref().map(|desc| desc.name.as_str()).unwrap_or_default(),
                        completion.elapsed_cycles,
                        completion.load_cycles
                    );
                    self.completion = Some(completion);
                    self.state = State::Idle;
                }
            }
        }
    }

    fn load<'a>(
        &mut self,
        cycle: u64,
        imem: &mut IMem,
        xlats: impl IntoIterator<Item = &'a mut BufferToPhysXlat>,
    ) {
        let (Some(loading), Some(descriptor)) = (self.loading.as_mut(), self.descriptor.as_ref())
        else {
            unreachable!("loading without kernel");
        };
        if loading.next_pc == 0 {
            imem.reset();
        }
        loading.latency = loading.latency.saturating_sub(1);

        let program = &descriptor.program;
        if loading.next_pc < program.len() {
            let end = (loading.next_pc + LOAD_WIDTH).min(program.len());
            imem.write(loading.next_pc, &program[loading.next_pc..end]);
            loading.next_pc = end;
        }

        // one translation entry per cycle, broadcast to every cluster
        let entry = if loading.buffers.is_empty() {
            None
        } else {
            Some(loading.buffers.remove(0))
        };
        for xlat in xlats {
            xlat.cycle();
            if let Some((space, handle, desc)) = entry {
                xlat.write(space, handle, desc);
            }
        }

        log::debug!(
            "loading kernel: {}/{} instructions, {} buffers left, {} latency cycles left",
            loading.next_pc,
            program.len(),
            loading.buffers.len(),
            loading.latency
        );
        if loading.latency == 0 && loading.next_pc == program.len() && loading.buffers.is_empty() {
            self.loading = None;
            self.load_done_cycle = cycle + 1;
            self.state = State::EnumeratingWorkgroups;
        }
    }

    fn enumerate(&mut self) {
        if self.stream.full() {
            return;
        }
        let Some(raster) = self.raster.as_mut() else {
            unreachable!("enumerating without raster");
        };
        match raster.next() {
            Some(workgroup) => {
                log::debug!("work scheduler: issue {}", workgroup);
                self.num_threads += workgroup.num_threads() as u64;
                self.num_workgroups += 1;
                self.stream.enqueue(workgroup);
            }
            None => {
                log::debug!(
                    "work scheduler: last workgroup issued ({} workgroups)",
                    self.num_workgroups
                );
                self.last_issued = true;
                self.raster = None;
                self.state = State::AwaitingFinish;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LaunchError, State, WorkDescriptor, WorkScheduler};
    use crate::config::{Config, SchedulingOption, SchedulingOptions};
    use crate::imem::IMem;
    use crate::instruction::{Instruction, Space};
    use crate::workgroup::{Dim, GeometryError};
    use crate::xlat::{BufferToPhysXlat, Descriptor};
    use pretty_assertions_sorted as diff;

    fn descriptor(dims: Dim) -> WorkDescriptor {
        WorkDescriptor {
            name: "test".to_string(),
            thread_space: dims,
            workgroup_width: 0,
            program: vec![Instruction::nop(); 6],
            bulk_buffers: vec![Descriptor::new(0x100, 64, 1), Descriptor::new(0x200, 64, 1)],
            scratchpad_buffers: vec![Descriptor::new(0, 32, 1)],
            options: SchedulingOptions::EMPTY,
        }
    }

    #[test]
    fn test_emits_two_workgroups_then_last() -> color_eyre::eyre::Result<()> {
        crate::testing::init_logging();
        let config = Config::default();
        let mut scheduler = WorkScheduler::new(&config);
        let mut imem = IMem::new();
        let mut xlat = BufferToPhysXlat::new();
        scheduler.launch(descriptor(Dim::new(64, 1)), 0)?;
        assert_eq!(scheduler.state(), State::LoadingKernel);

        let mut offsets = Vec::new();
        let mut cycle = 0;
        while !scheduler.last_issued() {
            scheduler.cycle(cycle, &mut imem, [&mut xlat], false);
            while let Some(wg) = scheduler.stream.dequeue() {
                offsets.push(wg.offset);
            }
            cycle += 1;
            assert!(cycle < 1000);
        }
        diff::assert_eq!(offsets, vec![Dim::new(0, 0), Dim::new(32, 0)]);
        assert_eq!(scheduler.state(), State::AwaitingFinish);
        assert_eq!(scheduler.num_workgroups, 2);
        assert_eq!(scheduler.num_threads, 64);

        // program and buffers were uploaded
        assert_eq!(imem.len(), 6);
        assert_eq!(xlat.read(Space::BulkMemory, 1), Descriptor::new(0x200, 64, 1));
        assert_eq!(xlat.read(Space::Scratchpad, 0), Descriptor::new(0, 32, 1));

        // loading takes at least the estimated transfer latency
        let completion_cycle = cycle + 5;
        scheduler.cycle(completion_cycle, &mut imem, [&mut xlat], true);
        assert_eq!(scheduler.state(), State::Idle);
        let completion = scheduler.completion().expect("completed");
        assert_eq!(completion.elapsed_cycles, completion_cycle);
        assert_eq!(
            completion.load_cycles,
            scheduler.estimate_load_latency(6)
        );
        Ok(())
    }

    #[test]
    fn test_stream_backpressure() -> color_eyre::eyre::Result<()> {
        let config = Config {
            workgroup_queue_size: 1,
            ..Config::default()
        };
        let mut scheduler = WorkScheduler::new(&config);
        let mut imem = IMem::new();
        scheduler.launch(descriptor(Dim::new(32 * 4, 1)), 0)?;
        for cycle in 0..200 {
            scheduler.cycle(cycle, &mut imem, [], false);
        }
        assert_eq!(scheduler.stream.len(), 1);
        assert_eq!(scheduler.state(), State::EnumeratingWorkgroups);
        assert!(!scheduler.last_issued());
        Ok(())
    }

    #[test]
    fn test_launch_errors() {
        let config = Config::default();
        let mut scheduler = WorkScheduler::new(&config);

        let empty = WorkDescriptor {
            program: vec![],
            ..descriptor(Dim::new(32, 1))
        };
        assert_eq!(
            scheduler.launch(empty, 0),
            Err(LaunchError::EmptyProgram("test".to_string()))
        );

        let too_wide = WorkDescriptor {
            workgroup_width: 6,
            ..descriptor(Dim::new(32, 1))
        };
        assert_eq!(
            scheduler.launch(too_wide, 0),
            Err(LaunchError::Geometry(GeometryError::WidthOutOfRange(6)))
        );

        let conflicting = WorkDescriptor {
            options: SchedulingOptions::EMPTY
                .with(SchedulingOption::ForbidParallelComputeScratchpad)
                .with(SchedulingOption::ForbidParallelBulkScratchpad),
            ..descriptor(Dim::new(32, 1))
        };
        assert!(matches!(
            scheduler.launch(conflicting, 0),
            Err(LaunchError::Options(_))
        ));

        let too_many = WorkDescriptor {
            bulk_buffers: vec![Descriptor::new(0, 1, 1); 33],
            ..descriptor(Dim::new(32, 1))
        };
        assert_eq!(
            scheduler.launch(too_many, 0),
            Err(LaunchError::TooManyBuffers {
                space: Space::BulkMemory,
                count: 33
            })
        );

        assert!(scheduler.launch(descriptor(Dim::new(32, 1)), 0).is_ok());
        assert_eq!(
            scheduler.launch(descriptor(Dim::new(32, 1)), 1),
            Err(LaunchError::Busy("test".to_string()))
        );
    }
}
