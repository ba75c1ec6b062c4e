//! In-process sched_ext host.
//!
//! Models user DSQs as FIFOs and each CPU as a running slot plus a local
//! FIFO, which is all the policy can observe through [`ScxBackend`].

use std::collections::{BTreeMap, VecDeque};

use log::error;

use crate::{
    error::SchedError,
    sched::{SCX_DSQ_FLAG_BUILTIN, ScxBackend, Task, local_cpu},
};

/// A task sitting in a queue with the slice it was granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Queued {
    pub tid: i32,
    pub slice_ns: u64,
}

#[derive(Debug, Default)]
pub struct SimCpu {
    pub running: Option<i32>,
    pub local: VecDeque<Queued>,
}

impl SimCpu {
    pub fn is_idle(&self) -> bool {
        self.running.is_none() && self.local.is_empty()
    }
}

#[derive(Debug)]
pub struct SimHost {
    cpus: Vec<SimCpu>,
    dsqs: BTreeMap<u64, VecDeque<Queued>>,
    current_cpu: i32,
    /// Set by any insert; lets the driver skip `enqueue` after a direct
    /// placement in `select_cpu`.
    inserted: bool,
    fail_create: Option<u64>,
    error: Option<SchedError>,
}

impl SimHost {
    pub fn new(nr_cpus: usize) -> Self {
        Self {
            cpus: (0..nr_cpus).map(|_| SimCpu::default()).collect(),
            dsqs: BTreeMap::new(),
            current_cpu: 0,
            inserted: false,
            fail_create: None,
            error: None,
        }
    }

    /// Makes creation of `dsq_id` fail.
    pub fn fail_create_of(mut self, dsq_id: u64) -> Self {
        self.fail_create = Some(dsq_id);
        self
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpus.len()
    }

    pub fn cpu(&self, cpu: i32) -> &SimCpu {
        &self.cpus[cpu as usize]
    }

    pub fn cpu_mut(&mut self, cpu: i32) -> &mut SimCpu {
        &mut self.cpus[cpu as usize]
    }

    pub fn set_current_cpu(&mut self, cpu: i32) {
        self.current_cpu = cpu;
    }

    pub fn take_inserted(&mut self) -> bool {
        std::mem::take(&mut self.inserted)
    }

    /// First runtime error raised by a kfunc, if any.
    pub fn take_error(&mut self) -> Option<SchedError> {
        self.error.take()
    }

    pub fn queued(&self, dsq_id: u64) -> usize {
        self.dsqs.get(&dsq_id).map_or(0, VecDeque::len)
    }

    pub fn has_dsq(&self, dsq_id: u64) -> bool {
        self.dsqs.contains_key(&dsq_id)
    }

    fn raise(&mut self, err: SchedError) {
        error!("{err}");
        self.error.get_or_insert(err);
    }
}

impl ScxBackend for SimHost {
    fn create_dsq(&mut self, dsq_id: u64, _node: i32) -> Result<(), SchedError> {
        let reason = if self.fail_create == Some(dsq_id) {
            Some("allocation failed")
        } else if dsq_id & SCX_DSQ_FLAG_BUILTIN != 0 {
            Some("builtin id")
        } else if self.dsqs.contains_key(&dsq_id) {
            Some("already exists")
        } else {
            None
        };
        if let Some(reason) = reason {
            return Err(SchedError::CreateDsq {
                dsq_id,
                reason: reason.to_string(),
            });
        }
        self.dsqs.insert(dsq_id, VecDeque::new());
        Ok(())
    }

    fn destroy_dsq(&mut self, dsq_id: u64) {
        self.dsqs.remove(&dsq_id);
    }

    fn dsq_insert(&mut self, task: &Task, dsq_id: u64, slice_ns: u64, _enq_flags: u64) {
        let entry = Queued {
            tid: task.tid,
            slice_ns,
        };
        self.inserted = true;

        if let Some(cpu) = local_cpu(dsq_id) {
            match self.cpus.get_mut(cpu as usize) {
                Some(target) => target.local.push_back(entry),
                None => self.raise(SchedError::UnknownDsq(dsq_id)),
            }
            return;
        }
        match self.dsqs.get_mut(&dsq_id) {
            Some(queue) => queue.push_back(entry),
            None => self.raise(SchedError::UnknownDsq(dsq_id)),
        }
    }

    fn dsq_move_to_local(&mut self, dsq_id: u64) -> bool {
        let Some(entry) = self.dsqs.get_mut(&dsq_id).and_then(VecDeque::pop_front) else {
            return false;
        };
        let cpu = self.current_cpu as usize;
        self.cpus[cpu].local.push_back(entry);
        true
    }

    fn select_cpu_dfl(&mut self, task: &Task, prev_cpu: i32, _wake_flags: u64) -> (i32, bool) {
        let usable = |cpu: i32, cpus: &[SimCpu]| {
            task.cpus_allowed.contains(cpu) && cpus[cpu as usize].is_idle()
        };
        if (0..self.cpus.len() as i32).contains(&prev_cpu) && usable(prev_cpu, &self.cpus) {
            return (prev_cpu, true);
        }
        match (0..self.cpus.len() as i32).find(|cpu| usable(*cpu, &self.cpus)) {
            Some(cpu) => (cpu, true),
            None => (prev_cpu, false),
        }
    }

    fn current_cpu(&self) -> i32 {
        self.current_cpu
    }
}
