#![allow(
    clippy::too_many_arguments,
    clippy::missing_panics_doc,
    clippy::missing_errors_doc,
    clippy::too_many_lines,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation
)]

pub mod cluster;
pub mod config;
pub mod ctrl_stack;
pub mod exec;
pub mod fifo;
pub mod hazard;
pub mod ifetch;
pub mod imem;
pub mod instruction;
pub mod memory;
#[cfg(feature = "parallel")]
pub mod parallel;
pub mod pipeline;
pub mod regfile;
pub mod register;
pub mod scoreboard;
pub mod work_scheduler;
pub mod workgroup;
pub mod xlat;

#[cfg(test)]
pub mod testing;

use cluster::SimdCluster;
use config::{Config, SchedulingOption};
use exec::{ExecuteUnit, Move};
use imem::IMem;
use memory::TransferEngine;
use work_scheduler::{LaunchError, State, WorkDescriptor, WorkScheduler};

use color_eyre::eyre;
use console::style;

/// Cycle-level simulator of the accelerator.
///
/// Drives the work scheduler, all SIMD clusters and the external memory
/// engine. Memory runs once every `clock_ratio` compute cycles.
pub struct Simulator<E> {
    pub config: Config,
    pub engine: E,
    pub scheduler: WorkScheduler,
    pub imem: IMem,
    pub clusters: Vec<SimdCluster>,
    cycle: u64,
    #[cfg(feature = "parallel")]
    pool: Option<rayon::ThreadPool>,
}

impl<E> std::fmt::Debug for Simulator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("cycle", &self.cycle)
            .field("clusters", &self.clusters.len())
            .field("scheduler", &self.scheduler.state())
            .finish()
    }
}

impl<E> Simulator<E>
where
    E: TransferEngine,
{
    /// Create a simulator using [`Move`] as the execute unit of every cluster.
    pub fn new(config: Config, engine: E) -> eyre::Result<Self> {
        Self::with_execute_units(config, engine, |_| Box::new(Move))
    }

    /// Create a simulator with one execute unit per cluster.
    pub fn with_execute_units(
        config: Config,
        engine: E,
        mut exec: impl FnMut(usize) -> Box<dyn ExecuteUnit>,
    ) -> eyre::Result<Self> {
        config.validate()?;
        let clusters = (0..config.num_clusters)
            .map(|cluster_id| SimdCluster::new(cluster_id, &config, exec(cluster_id)))
            .collect();

        #[cfg(feature = "parallel")]
        let pool = if config.num_clusters > 1 {
            let num_threads = parallel::get_num_threads()?
                .unwrap_or_else(num_cpus::get_physical)
                .min(config.num_clusters);
            Some(parallel::rayon_pool(num_threads)?)
        } else {
            None
        };

        Ok(Self {
            scheduler: WorkScheduler::new(&config),
            imem: IMem::new(),
            clusters,
            engine,
            cycle: 0,
            #[cfg(feature = "parallel")]
            pool,
            config,
        })
    }

    #[must_use]
    pub fn cycle_count(&self) -> u64 {
        self.cycle
    }

    /// Kick off a kernel.
    pub fn launch(&mut self, descriptor: WorkDescriptor) -> Result<(), LaunchError> {
        self.scheduler.launch(descriptor, self.cycle)?;
        for cluster in &mut self.clusters {
            cluster.xlat.reset();
        }
        Ok(())
    }

    #[must_use]
    pub fn reached_limit(&self) -> bool {
        matches!(self.config.cycle_limit, Some(limit) if self.cycle >= limit)
    }

    /// No memory traffic left anywhere.
    #[must_use]
    pub fn memory_drained(&self) -> bool {
        self.engine.is_idle() && self.clusters.iter().all(|c| c.handoff.is_empty())
    }

    /// Advance the simulation by one compute cycle.
    pub fn cycle(&mut self) {
        let cycle = self.cycle;
        let options = self.scheduler.options();
        log::info!("======== cycle {cycle} ========");

        if cycle % self.config.clock_ratio as u64 == 0 {
            let memory_cycle = cycle / self.config.clock_ratio as u64;
            for cluster in &mut self.clusters {
                self.engine.cycle(memory_cycle, options, cluster.port());
            }
        }

        let clusters_idle = self.clusters.iter().all(SimdCluster::is_idle);
        self.scheduler.cycle(
            cycle,
            &mut self.imem,
            self.clusters.iter_mut().map(|cluster| &mut cluster.xlat),
            clusters_idle,
        );
        let last_issued = self.scheduler.last_issued();
        for cluster in &mut self.clusters {
            cluster.admit(cycle, &mut self.scheduler.stream, last_issued, options);
        }

        #[cfg(feature = "parallel")]
        if let Some(pool) = self.pool.as_ref() {
            parallel::cluster_cycles(pool, &mut self.clusters, cycle, &self.imem, options);
            self.cycle += 1;
            return;
        }
        for cluster in &mut self.clusters {
            cluster.cycle(cycle, &self.imem, options);
        }
        self.cycle += 1;
    }

    /// Run the launched kernel until it finished or the cycle budget is spent.
    ///
    /// Every transfer holds fetch of its slot until the completion notice is
    /// consumed, so a finished kernel leaves no traffic behind and both stop
    /// rules end the run on the same cycle. Waiting for the drain only
    /// matters for engines that keep traffic in flight past the notice.
    pub fn run_to_completion(&mut self) -> eyre::Result<stats::Stats> {
        if self.scheduler.state() == State::Idle {
            eyre::bail!("no kernel launched");
        }
        let options = self.scheduler.options();
        let wait_for_drain = options.contains(SchedulingOption::StopOnMemoryDrain)
            && !options.contains(SchedulingOption::StopOnKernelFinish);
        loop {
            if self.reached_limit() {
                log::warn!(
                    "{}",
                    style(format!("reached cycle limit {}", self.cycle)).red()
                );
                break;
            }
            self.cycle();
            if self.scheduler.completion().is_some() && (!wait_for_drain || self.memory_drained())
            {
                break;
            }
        }
        Ok(self.stats())
    }

    /// Statistics snapshot of the last kernel.
    #[must_use]
    pub fn stats(&self) -> stats::Stats {
        let mut stats = stats::Stats::new(self.config.num_banks);
        for cluster in &self.clusters {
            stats += cluster.stats();
        }
        stats.units += self.engine.stats();
        stats.sim.cycles = self.cycle;
        stats.sim.num_threads = self.scheduler.num_threads;
        stats.sim.num_workgroups = self.scheduler.num_workgroups;
        if let Some(completion) = self.scheduler.completion() {
            stats.sim.elapsed_cycles = completion.elapsed_cycles;
            stats.sim.load_cycles = completion.load_cycles;
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::Simulator;
    use crate::config::{self, Config, SchedulingOption, SchedulingOptions};
    use crate::exec::Binary;
    use crate::instruction::{Instruction, Operand, Space};
    use crate::memory::FixedLatency;
    use crate::register::Special;
    use crate::work_scheduler::WorkDescriptor;
    use crate::workgroup::Dim;
    use crate::xlat::Descriptor;
    use color_eyre::eyre;
    use pretty_assertions_sorted as diff;

    fn vector_add(n: usize) -> WorkDescriptor {
        WorkDescriptor {
            name: "vectoradd".to_string(),
            thread_space: Dim::new(n, 1),
            workgroup_width: 0,
            program: vec![
                Instruction::load(Space::BulkMemory, 0, 1),
                Instruction::load(Space::BulkMemory, 1, 2),
                Instruction::alu(
                    1,
                    Operand::vector(3),
                    [Some(Operand::vector(1)), Some(Operand::vector(2)), None],
                ),
                Instruction::store(Space::BulkMemory, 2, 3, true),
            ],
            bulk_buffers: vec![
                Descriptor::new(0, n, 1),
                Descriptor::new(n as u64, n, 1),
                Descriptor::new(2 * n as u64, n, 1),
            ],
            scratchpad_buffers: vec![],
            options: SchedulingOptions::EMPTY,
        }
    }

    fn simulator(config: Config, n: usize) -> eyre::Result<Simulator<FixedLatency>> {
        let mut engine = FixedLatency::new(&config, 3 * n, 256);
        for i in 0..n {
            engine.bulk_memory_mut()[i] = i as u32;
            engine.bulk_memory_mut()[n + i] = 1000 * i as u32;
        }
        Simulator::with_execute_units(config, engine, |_| Box::new(Binary::default()))
    }

    #[test]
    fn test_vector_add() -> eyre::Result<()> {
        crate::testing::init_logging();
        let n = 64;
        let mut sim = simulator(Config::default(), n)?;
        sim.launch(vector_add(n))?;
        let stats = sim.run_to_completion()?;

        let expected: Vec<u32> = (0..n as u32).map(|i| i + 1000 * i).collect();
        diff::assert_eq!(&sim.engine.bulk_memory()[2 * n..], expected.as_slice());
        assert_eq!(stats.sim.num_workgroups, 2);
        assert_eq!(stats.sim.num_threads, n as u64);
        assert!(stats.sim.load_cycles > 0);
        assert!(stats.sim.elapsed_cycles > stats.sim.load_cycles);
        // three transfers and one vector instruction over 4 warps per workgroup
        assert_eq!(stats.sim.instructions, 2 * (3 + 4));
        assert!(stats.units.bulk_memory > 0);
        assert_eq!(stats.units.scratchpad, 0);
        assert!(stats.banks.total_accesses() > 0);
        Ok(())
    }

    #[test]
    fn test_partial_workgroups_only_touch_thread_space() -> eyre::Result<()> {
        crate::testing::init_logging();
        let (x, y) = (40, 3);
        let config = Config::default();
        let engine = FixedLatency::new(&config, x * y + 16, 0);
        let mut sim = Simulator::new(config, engine)?;
        sim.launch(WorkDescriptor {
            name: "thread_ids".to_string(),
            thread_space: Dim::new(x, y),
            program: vec![
                Instruction::mov(Operand::vector(0), Operand::Special(Special::ThreadIdX)),
                Instruction::mov(Operand::vector(1), Operand::Special(Special::ThreadIdY)),
                Instruction::alu(
                    1,
                    Operand::vector(2),
                    [Some(Operand::vector(0)), Some(Operand::vector(1)), None],
                ),
                Instruction::store(Space::BulkMemory, 0, 0, true),
            ],
            bulk_buffers: vec![Descriptor::new(0, x, y)],
            ..WorkDescriptor::default()
        })?;
        let stats = sim.run_to_completion()?;

        let expected: Vec<u32> = (0..y).flat_map(|_| 0..x as u32).collect();
        diff::assert_eq!(&sim.engine.bulk_memory()[..x * y], expected.as_slice());
        // guard words after the buffer stay untouched
        assert!(sim.engine.bulk_memory()[x * y..].iter().all(|word| *word == 0));
        assert_eq!(stats.sim.num_workgroups, 2);
        assert_eq!(stats.sim.num_threads, (x * y) as u64);
        Ok(())
    }

    #[test]
    fn test_scratchpad_round_trip() -> eyre::Result<()> {
        crate::testing::init_logging();
        let n = 32;
        let config = Config::default();
        let mut engine = FixedLatency::new(&config, 2 * n, n);
        for (i, word) in engine.bulk_memory_mut()[..n].iter_mut().enumerate() {
            *word = 7 * i as u32;
        }
        let mut sim = Simulator::new(config, engine)?;
        sim.launch(WorkDescriptor {
            name: "scratchpad".to_string(),
            thread_space: Dim::new(n, 1),
            program: vec![
                Instruction::load(Space::BulkMemory, 0, 1),
                Instruction::store(Space::Scratchpad, 0, 1, false),
                Instruction::load(Space::Scratchpad, 0, 2),
                Instruction::store(Space::BulkMemory, 1, 2, true),
            ],
            bulk_buffers: vec![Descriptor::new(0, n, 1), Descriptor::new(n as u64, n, 1)],
            scratchpad_buffers: vec![Descriptor::new(0, n, 1)],
            ..WorkDescriptor::default()
        })?;
        let stats = sim.run_to_completion()?;

        let memory = sim.engine.bulk_memory();
        diff::assert_eq!(&memory[n..], &memory[..n]);
        diff::assert_eq!(sim.engine.scratchpad(0), &memory[..n]);
        assert!(stats.units.scratchpad > 0);
        Ok(())
    }

    #[test]
    fn test_pairwise_admission_with_trailing_workgroup() -> eyre::Result<()> {
        crate::testing::init_logging();
        let n = 96;
        let mut sim = simulator(Config::default(), n)?;
        let mut kernel = vector_add(n);
        kernel.options = SchedulingOptions::EMPTY.with(SchedulingOption::PairwiseWorkgroups);
        sim.launch(kernel)?;
        let stats = sim.run_to_completion()?;

        let expected: Vec<u32> = (0..n as u32).map(|i| i + 1000 * i).collect();
        diff::assert_eq!(&sim.engine.bulk_memory()[2 * n..], expected.as_slice());
        assert_eq!(stats.sim.num_workgroups, 3);
        Ok(())
    }

    #[test]
    fn test_multiple_clusters() -> eyre::Result<()> {
        crate::testing::init_logging();
        let n = 256;
        let config = Config {
            num_clusters: 2,
            workgroup_queue_size: 4,
            ..Config::default()
        };
        let mut sim = simulator(config, n)?;
        sim.launch(vector_add(n))?;
        let stats = sim.run_to_completion()?;

        let expected: Vec<u32> = (0..n as u32).map(|i| i + 1000 * i).collect();
        diff::assert_eq!(&sim.engine.bulk_memory()[2 * n..], expected.as_slice());
        assert_eq!(stats.sim.num_workgroups, 8);
        assert!(sim.clusters.iter().all(|c| c.stats().sim.instructions > 0));
        Ok(())
    }

    #[test]
    fn test_identical_runs_are_deterministic() -> eyre::Result<()> {
        let run = || -> eyre::Result<(stats::Stats, Vec<u32>)> {
            let n = 128;
            let config = Config {
                num_clusters: 2,
                ..Config::default()
            };
            let mut sim = simulator(config, n)?;
            sim.launch(vector_add(n))?;
            let stats = sim.run_to_completion()?;
            Ok((stats, sim.engine.bulk_memory().to_vec()))
        };
        let (first_stats, first_memory) = run()?;
        let (second_stats, second_memory) = run()?;
        diff::assert_eq!(first_stats, second_stats);
        assert_eq!(first_memory, second_memory);
        Ok(())
    }

    #[test]
    fn test_stop_rules_agree_when_transfers_block() -> eyre::Result<()> {
        let run = |option: SchedulingOption| -> eyre::Result<_> {
            let config = Config {
                options: SchedulingOptions::EMPTY.with(option),
                ..Config::default()
            };
            let mut sim = simulator(config, 64)?;
            sim.launch(vector_add(64))?;
            let stats = sim.run_to_completion()?;
            assert!(sim.memory_drained());
            Ok(stats)
        };
        let on_finish = run(SchedulingOption::StopOnKernelFinish)?;
        let on_drain = run(SchedulingOption::StopOnMemoryDrain)?;
        diff::assert_eq!(on_finish, on_drain);
        Ok(())
    }

    #[test]
    fn test_cycle_limit_stops_the_run() -> eyre::Result<()> {
        let config = Config {
            cycle_limit: Some(10),
            ..Config::default()
        };
        let mut sim = simulator(config, 64)?;
        sim.launch(vector_add(64))?;
        let stats = sim.run_to_completion()?;
        assert_eq!(stats.sim.cycles, 10);
        assert_eq!(stats.sim.elapsed_cycles, 0);
        assert!(sim.scheduler.completion().is_none());
        Ok(())
    }

    #[test]
    fn test_conflicting_options_are_rejected_before_simulation() {
        let options = SchedulingOptions::EMPTY
            .with(SchedulingOption::ForbidParallelComputeScratchpad)
            .with(SchedulingOption::ForbidParallelBulkScratchpad);
        let config = Config {
            options,
            ..Config::default()
        };
        let engine = FixedLatency::new(&config, 0, 0);
        let err = Simulator::new(config, engine).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<config::Error>(),
            Some(config::Error::ConflictingOptions(..))
        ));
    }

    #[test]
    fn test_run_without_kernel_fails() -> eyre::Result<()> {
        let config = Config::default();
        let engine = FixedLatency::new(&config, 0, 0);
        let mut sim = Simulator::new(config, engine)?;
        assert!(sim.run_to_completion().is_err());
        Ok(())
    }
}
