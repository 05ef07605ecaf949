//! Transfer scheduler: a bounded queue of named jobs driven forward one `tick` at a time.
//!
//! Each tick assigns idle jobs to free, enabled, CONNECTED channels (subject to the
//! parallel cap), sends one chunk on every occupied channel, and drops finished jobs.
//! Nothing blocks and a failure never aborts the run: the failing channel is freed and
//! the job is picked up again on a later tick, resuming at its recorded offset.
//! Chunks are sent at most once; there is no resend of a chunk the sink accepted.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;

use crate::arbiter::{self, Policy};
use crate::config::SchedulerConfig;
use crate::registry::{ChannelKind, ChannelStatus, Registry, CHANNEL_COUNT};
use crate::transport::Clock;
use crate::wire::TransferHeader;

/// Minimum number of finished names `is_complete` remembers; a larger queue capacity raises it.
pub const COMPLETED_HISTORY: usize = 32;

/// One named transfer. `data` is a shared handle; queuing never copies the bytes.
#[derive(Debug, Clone)]
pub struct TransferJob {
    pub id: u64,
    pub name: String,
    pub data: Bytes,
    pub policy: Policy,
    pub chunked: bool,
    pub bytes_sent: usize,
    pub complete: bool,
    /// Clock time in ms when the job was (re)queued.
    pub queued_at: u32,
}

impl TransferJob {
    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.bytes_sent)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchedulerError {
    #[error("transfer queue full ({0} jobs)")]
    QueueFull(usize),
    #[error("job name of {0} bytes is too long")]
    NameTooLong(usize),
    #[error("job of {0} bytes exceeds the u32 session header")]
    TooLarge(usize),
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Jobs that got a channel this tick.
    pub assigned: Vec<(String, ChannelKind)>,
    /// Successful body sends (chunks or immediate whole payloads).
    pub chunks_sent: usize,
    /// Failed sends of any kind.
    pub failures: usize,
    /// Jobs that finished this tick.
    pub completed: Vec<String>,
}

pub struct Scheduler {
    queue: Vec<TransferJob>,
    capacity: usize,
    chunk_size: usize,
    /// Per channel: id of the job occupying it.
    assignments: [Option<u64>; CHANNEL_COUNT],
    enabled: [bool; CHANNEL_COUNT],
    parallel: bool,
    max_parallel: usize,
    /// Most recently finished names, oldest first.
    completed: VecDeque<String>,
    completed_limit: usize,
    next_id: u64,
    ticks: u64,
    clock: Arc<dyn Clock + Send + Sync>,
}

impl Scheduler {
    pub fn new(config: &SchedulerConfig, clock: Arc<dyn Clock + Send + Sync>) -> Self {
        let mut enabled = [true; CHANNEL_COUNT];
        for kind in &config.disabled_channels {
            enabled[kind.index()] = false;
        }
        Self {
            queue: Vec::with_capacity(config.queue_capacity),
            capacity: config.queue_capacity,
            chunk_size: config.chunk_size.max(1),
            assignments: [None; CHANNEL_COUNT],
            enabled,
            parallel: config.parallel,
            max_parallel: config.max_parallel,
            completed: VecDeque::new(),
            completed_limit: config.queue_capacity.max(COMPLETED_HISTORY),
            next_id: 1,
            ticks: 0,
            clock,
        }
    }

    /// Queue `data` under `name`. An existing job with that name is updated in place
    /// with its progress reset; a new name fails when the queue is full.
    pub fn queue_data(
        &mut self,
        name: impl Into<String>,
        data: Bytes,
        policy: Policy,
        chunked: bool,
    ) -> Result<(), SchedulerError> {
        let name = name.into();
        if u32::try_from(name.len()).is_err() {
            return Err(SchedulerError::NameTooLong(name.len()));
        }
        if u32::try_from(data.len()).is_err() {
            return Err(SchedulerError::TooLarge(data.len()));
        }
        self.completed.retain(|n| *n != name);
        let now = self.clock.now_ms();

        if let Some(pos) = self.queue.iter().position(|j| j.name == name) {
            let id = self.queue[pos].id;
            // A job already on a channel restarts its session from the header.
            for slot in self.assignments.iter_mut() {
                if *slot == Some(id) {
                    *slot = None;
                }
            }
            let job = &mut self.queue[pos];
            job.data = data;
            job.policy = policy;
            job.chunked = chunked;
            job.bytes_sent = 0;
            job.complete = false;
            job.queued_at = now;
            tracing::debug!(name = %job.name, len = job.data.len(), "transfer re-queued");
            return Ok(());
        }

        if self.queue.len() >= self.capacity {
            return Err(SchedulerError::QueueFull(self.capacity));
        }
        let id = self.next_id;
        self.next_id += 1;
        tracing::debug!(%name, len = data.len(), ?policy, chunked, "transfer queued");
        self.queue.push(TransferJob {
            id,
            name,
            data,
            policy,
            chunked,
            bytes_sent: 0,
            complete: false,
            queued_at: now,
        });
        Ok(())
    }

    pub fn set_channel_enabled(&mut self, kind: ChannelKind, enabled: bool) {
        self.enabled[kind.index()] = enabled;
    }

    pub fn is_channel_enabled(&self, kind: ChannelKind) -> bool {
        self.enabled[kind.index()]
    }

    /// The cap applies only while parallel mode is on.
    pub fn set_parallel_mode(&mut self, enabled: bool, max_channels: usize) {
        self.parallel = enabled;
        self.max_parallel = max_channels;
    }

    /// True once the named job finished; stays true after it leaves the queue until
    /// the name is queued again or drops out of the bounded completion history.
    pub fn is_complete(&self, name: &str) -> bool {
        self.completed.iter().any(|n| n == name)
    }

    pub fn job(&self, name: &str) -> Option<&TransferJob> {
        self.queue.iter().find(|j| j.name == name)
    }

    pub fn jobs(&self) -> &[TransferJob] {
        &self.queue
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Occupied channel slots.
    pub fn active_count(&self) -> usize {
        self.assignments.iter().filter(|a| a.is_some()).count()
    }

    /// Name of the job occupying `kind`, if any.
    pub fn assignment(&self, kind: ChannelKind) -> Option<&str> {
        let id = self.assignments[kind.index()]?;
        self.queue.iter().find(|j| j.id == id).map(|j| j.name.as_str())
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    /// Advance every transfer by at most one step. Never blocks.
    pub fn tick(&mut self, registry: &mut Registry) -> TickReport {
        self.ticks += 1;
        let mut report = TickReport::default();
        if self.queue.is_empty() {
            return report;
        }
        self.assign_idle_jobs(registry, &mut report);
        self.advance_active(registry, &mut report);

        // Compact, preserving order.
        let completed = &mut self.completed;
        self.queue.retain(|job| {
            if job.complete {
                completed.push_back(job.name.clone());
            }
            !job.complete
        });
        while self.completed.len() > self.completed_limit {
            self.completed.pop_front();
        }
        report
    }

    fn occupies(&self, id: u64) -> bool {
        self.assignments.contains(&Some(id))
    }

    fn free(&mut self, kind: ChannelKind) {
        self.assignments[kind.index()] = None;
    }

    fn assign_idle_jobs(&mut self, registry: &mut Registry, report: &mut TickReport) {
        let mut active = self.active_count();
        for idx in 0..self.queue.len() {
            let job = &self.queue[idx];
            if job.complete || self.occupies(job.id) {
                continue;
            }
            if self.parallel && active >= self.max_parallel {
                break;
            }
            let enabled = self.enabled;
            let assignments = self.assignments;
            let Some(kind) = arbiter::best_for_policy(registry, job.policy, |k| {
                enabled[k.index()] && assignments[k.index()].is_none()
            }) else {
                tracing::trace!(name = %job.name, "no eligible channel this tick");
                continue;
            };

            // Unchunked jobs that fit go out whole; everything else in chunk_size increments.
            let chunk_size = if job.chunked || job.data.len() > self.chunk_size {
                self.chunk_size
            } else {
                job.data.len()
            };
            let header = TransferHeader::new(
                job.data.len() as u32,
                chunk_size as u32,
                job.name.len() as u32,
            );
            let opened = registry.dispatch(kind, &header.to_bytes())
                && (job.name.is_empty() || registry.dispatch(kind, job.name.as_bytes()));
            if !opened {
                report.failures += 1;
                tracing::debug!(name = %job.name, %kind, "session header failed");
                continue;
            }

            self.assignments[kind.index()] = Some(job.id);
            active += 1;
            report.assigned.push((job.name.clone(), kind));
            tracing::debug!(name = %job.name, %kind, "transfer assigned");

            let job = &mut self.queue[idx];
            if job.data.is_empty() {
                job.complete = true;
            } else if !job.chunked && job.data.len() <= self.chunk_size {
                if registry.dispatch(kind, &job.data) {
                    job.bytes_sent = job.data.len();
                    job.complete = true;
                    report.chunks_sent += 1;
                } else {
                    report.failures += 1;
                }
            } else {
                continue;
            }
            // Immediate send finished (or failed); the channel is free again this tick.
            if job.complete {
                tracing::info!(name = %job.name, len = job.data.len(), %kind, "transfer complete");
                report.completed.push(job.name.clone());
            }
            self.free(kind);
            active -= 1;
        }
    }

    fn advance_active(&mut self, registry: &mut Registry, report: &mut TickReport) {
        for kind in ChannelKind::ALL {
            let Some(id) = self.assignments[kind.index()] else {
                continue;
            };
            let Some(job) = self.queue.iter_mut().find(|j| j.id == id) else {
                self.free(kind);
                continue;
            };
            if job.complete {
                self.free(kind);
                continue;
            }
            if registry.status(kind) != ChannelStatus::Connected {
                tracing::debug!(name = %job.name, %kind, "channel left CONNECTED; releasing");
                self.free(kind);
                continue;
            }

            let end = job.bytes_sent + job.remaining().min(self.chunk_size);
            let chunk = job.data.slice(job.bytes_sent..end);
            if registry.dispatch(kind, &chunk) {
                job.bytes_sent = end;
                report.chunks_sent += 1;
                if job.bytes_sent >= job.data.len() {
                    job.complete = true;
                    tracing::info!(name = %job.name, len = job.data.len(), %kind, "transfer complete");
                    report.completed.push(job.name.clone());
                    self.free(kind);
                }
            } else {
                report.failures += 1;
                tracing::debug!(name = %job.name, %kind, offset = job.bytes_sent, "chunk failed; releasing channel");
                self.free(kind);
            }
        }
    }
}
