//! Priority lanes of pending requests.
//!
//! Lane 0 is the highest priority. Dequeue always takes from the first
//! non-empty lane the calling worker may serve; within a lane the order is
//! FIFO or LIFO as configured.

use std::collections::VecDeque;

use crate::config::{LaneAffinity, ProcessingMode, QueueConfig};
use crate::error::{CacheError, CacheResult};

/// Pending requests, one deque per priority lane.
#[derive(Debug)]
pub struct Lanes<J> {
    lanes: Vec<VecDeque<J>>,
    affinity: Vec<LaneAffinity>,
    processing: ProcessingMode,
}

impl<J> Lanes<J> {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            lanes: (0..config.lanes).map(|_| VecDeque::new()).collect(),
            affinity: (0..config.lanes).map(|l| config.affinity_of(l)).collect(),
            processing: config.processing,
        }
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// Whether `lane` is served by exactly one worker.
    pub fn is_pinned(&self, lane: usize) -> bool {
        matches!(self.affinity.get(lane), Some(LaneAffinity::Worker(_)))
    }

    fn serves(&self, lane: usize, worker: usize) -> bool {
        match self.affinity[lane] {
            LaneAffinity::Any => true,
            LaneAffinity::Worker(w) => w == worker,
        }
    }

    /// Append `job` to lane `priority`.
    pub fn push(&mut self, job: J, priority: usize) -> CacheResult<()> {
        let count = self.lanes.len();
        let lane = self.lanes.get_mut(priority).ok_or_else(|| {
            CacheError::configuration(format!("priority {priority} out of range 0..{count}"))
        })?;
        match self.processing {
            ProcessingMode::Fifo => lane.push_back(job),
            ProcessingMode::Lifo => lane.push_front(job),
        }
        Ok(())
    }

    /// Take the next job `worker` may run from the highest-priority non-empty lane.
    pub fn pop_for(&mut self, worker: usize) -> Option<J> {
        let lane = (0..self.lanes.len()).find(|&l| !self.lanes[l].is_empty() && self.serves(l, worker))?;
        self.lanes[lane].pop_front()
    }

    /// Whether `worker` has anything to do.
    pub fn has_work_for(&self, worker: usize) -> bool {
        (0..self.lanes.len()).any(|l| !self.lanes[l].is_empty() && self.serves(l, worker))
    }

    /// Remove every job in lane `priority`.
    pub fn drain_lane(&mut self, priority: usize) -> CacheResult<Vec<J>> {
        let count = self.lanes.len();
        let lane = self.lanes.get_mut(priority).ok_or_else(|| {
            CacheError::configuration(format!("priority {priority} out of range 0..{count}"))
        })?;
        Ok(lane.drain(..).collect())
    }

    /// Remove jobs matching `pred` from every lane; returns how many were removed.
    pub fn remove_where<F: FnMut(&J) -> bool>(&mut self, mut pred: F) -> usize {
        let before = self.len();
        for lane in &mut self.lanes {
            lane.retain(|j| !pred(j));
        }
        before - self.len()
    }

    pub fn clear(&mut self) -> usize {
        let n = self.len();
        for lane in &mut self.lanes {
            lane.clear();
        }
        n
    }

    pub fn len(&self) -> usize {
        self.lanes.iter().map(VecDeque::len).sum()
    }

    pub fn lane_len(&self, priority: usize) -> usize {
        self.lanes.get(priority).map_or(0, VecDeque::len)
    }

    pub fn is_empty(&self) -> bool {
        self.lanes.iter().all(VecDeque::is_empty)
    }
}
