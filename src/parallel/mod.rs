use crate::cluster::SimdCluster;
use crate::config::SchedulingOptions;
use crate::imem::IMem;
use rayon::prelude::*;

pub fn get_num_threads() -> Result<Option<usize>, std::num::ParseIntError> {
    let count = std::env::var("NUM_THREADS")
        .ok()
        .as_deref()
        .map(str::parse)
        .transpose()?;
    Ok(count)
}

pub fn rayon_pool(num_threads: usize) -> Result<rayon::ThreadPool, rayon::ThreadPoolBuildError> {
    rayon::ThreadPoolBuilder::new()
        .num_threads(num_threads)
        .build()
}

/// Cycle all clusters in parallel.
///
/// Clusters share no mutable state within a compute cycle, so the result
/// does not depend on the order in which they are cycled.
pub fn cluster_cycles(
    pool: &rayon::ThreadPool,
    clusters: &mut [SimdCluster],
    cycle: u64,
    imem: &IMem,
    options: SchedulingOptions,
) {
    pool.install(|| {
        clusters
            .par_iter_mut()
            .for_each(|cluster| cluster.cycle(cycle, imem, options));
    });
}
