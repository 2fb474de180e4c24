use std::sync::{Arc, Barrier, Mutex};
use std::thread;

use crate::errors::{Result, TrainError};

/// Collective communication between replicas running in lockstep.
///
/// Every replica must issue the same sequence of collective calls; a replica
/// that stops calling blocks the others forever.
pub trait ProcessGroup: Send + Sync {
    fn rank(&self) -> usize;

    fn world_size(&self) -> usize;

    /// Element-wise sum of `values` over all replicas, written back in place
    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<()>;

    /// Block until every replica reaches the barrier
    fn barrier(&self) -> Result<()>;

    fn is_primary(&self) -> bool {
        self.rank() == 0
    }
}

/// Mean of `values` over all replicas
pub fn reduce_mean(group: &dyn ProcessGroup, values: &mut [f32]) -> Result<()> {
    group.all_reduce_sum(values)?;
    let world = group.world_size() as f32;
    for v in values.iter_mut() {
        *v /= world;
    }
    Ok(())
}

/// Overwrite `values` on every replica with those of rank 0
pub fn broadcast_from_primary(group: &dyn ProcessGroup, values: &mut [f32]) -> Result<()> {
    if !group.is_primary() {
        values.fill(0.0);
    }
    group.all_reduce_sum(values)
}

/// Group of one, every collective is the identity
#[derive(Debug, Clone, Copy, Default)]
pub struct SingleProcess;

impl ProcessGroup for SingleProcess {
    fn rank(&self) -> usize {
        0
    }

    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, _values: &mut [f32]) -> Result<()> {
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Reduction {
    buffer: Vec<f32>,
    arrived: usize,
    mismatch: bool,
}

#[derive(Debug)]
struct Shared {
    reduction: Mutex<Reduction>,
    barrier: Barrier,
}

/// One replica per thread, collectives through shared memory
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    rank: usize,
    world_size: usize,
    shared: Arc<Shared>,
}

impl ThreadGroup {
    /// Create the handles of all `world_size` replicas, indexed by rank
    pub fn create(world_size: usize) -> Vec<ThreadGroup> {
        let world_size = world_size.max(1);
        let shared = Arc::new(Shared {
            reduction: Mutex::new(Reduction::default()),
            barrier: Barrier::new(world_size),
        });
        (0..world_size)
            .map(|rank| ThreadGroup {
                rank,
                world_size,
                shared: shared.clone(),
            })
            .collect()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Reduction>> {
        self.shared
            .reduction
            .lock()
            .map_err(|_| TrainError::Distributed(format!("replica {} found a poisoned reduction", self.rank)))
    }
}

impl ProcessGroup for ThreadGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn world_size(&self) -> usize {
        self.world_size
    }

    fn all_reduce_sum(&self, values: &mut [f32]) -> Result<()> {
        {
            let mut state = self.lock()?;
            if state.arrived == 0 {
                state.buffer.clear();
                state.buffer.extend_from_slice(values);
                state.mismatch = false;
            } else if state.buffer.len() != values.len() {
                state.mismatch = true;
            } else {
                for (acc, v) in state.buffer.iter_mut().zip(values.iter()) {
                    *acc += *v;
                }
            }
            state.arrived += 1;
        }

        // Everyone has contributed
        self.shared.barrier.wait();

        let mismatch = {
            let state = self.lock()?;
            if !state.mismatch {
                values.copy_from_slice(&state.buffer);
            }
            state.mismatch
        };

        // Everyone has read the sum, the leader resets for the next round
        if self.shared.barrier.wait().is_leader() {
            let mut state = self.lock()?;
            state.arrived = 0;
        }
        self.shared.barrier.wait();

        if mismatch {
            return Err(TrainError::Distributed(format!(
                "replica {} reduced {} values but the group disagrees on the length",
                self.rank,
                values.len()
            )));
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.shared.barrier.wait();
        Ok(())
    }
}

/// Run `replica` once per rank and collect the results in rank order.
///
/// A single replica runs on the calling thread with a [`SingleProcess`] group.
pub fn launch_replicas<T, F>(world_size: usize, replica: F) -> Result<Vec<T>>
where
    T: Send,
    F: Fn(Arc<dyn ProcessGroup>) -> Result<T> + Sync,
{
    if world_size <= 1 {
        return Ok(vec![replica(Arc::new(SingleProcess))?]);
    }

    let groups = ThreadGroup::create(world_size);
    let replica = &replica;
    thread::scope(|scope| {
        let handles: Vec<_> = groups
            .into_iter()
            .map(|group| scope.spawn(move || replica(Arc::new(group))))
            .collect();

        handles
            .into_iter()
            .enumerate()
            .map(|(rank, handle)| {
                handle.join().map_err(|_| {
                    TrainError::Distributed(format!("replica {} panicked", rank))
                })?
            })
            .collect()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_process_is_identity() {
        let mut values = vec![1.0, 2.0];
        reduce_mean(&SingleProcess, &mut values).unwrap();
        assert_eq!(values, vec![1.0, 2.0]);
        assert!(SingleProcess.is_primary());
    }

    #[test]
    fn test_thread_group_sums_and_averages() {
        let results = launch_replicas(3, |group| {
            let rank = group.rank() as f32;
            let mut sum = vec![rank, 1.0];
            group.all_reduce_sum(&mut sum)?;
            let mut mean = vec![rank * 2.0];
            reduce_mean(group.as_ref(), &mut mean)?;
            Ok((sum, mean))
        })
        .unwrap();

        assert_eq!(results.len(), 3);
        for (sum, mean) in results {
            assert_eq!(sum, vec![3.0, 3.0]);
            assert_eq!(mean, vec![2.0]);
        }
    }

    #[test]
    fn test_broadcast_copies_rank_zero() {
        let results = launch_replicas(3, |group| {
            let mut values = vec![group.rank() as f32 + 1.5, -2.0];
            broadcast_from_primary(group.as_ref(), &mut values)?;
            Ok(values)
        })
        .unwrap();
        assert!(results.iter().all(|v| v == &vec![1.5, -2.0]));
    }

    #[test]
    fn test_repeated_rounds_do_not_leak() {
        let results = launch_replicas(2, |group| {
            let mut totals = Vec::new();
            for round in 0..20 {
                let mut v = vec![(group.rank() + round) as f32];
                group.all_reduce_sum(&mut v)?;
                totals.push(v[0]);
            }
            Ok(totals)
        })
        .unwrap();

        let expected: Vec<f32> = (0..20).map(|r| (2 * r + 1) as f32).collect();
        assert_eq!(results[0], expected);
        assert_eq!(results[1], expected);
    }

    #[test]
    fn test_length_mismatch_is_an_error() {
        let results = launch_replicas(2, |group| {
            let mut v = vec![0.0; group.rank() + 1];
            Ok(group.all_reduce_sum(&mut v).is_err())
        })
        .unwrap();
        assert_eq!(results, vec![true, true]);
    }
}
