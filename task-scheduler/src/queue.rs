//! Priority-based task queue.
//!
//! Four FIFO lanes, popped strictly by priority. The scheduler decides which
//! lanes are eligible under the current activity level.

use std::collections::VecDeque;
use tokio_util::sync::CancellationToken;

use crate::tasks::Task;

/// Priority level for tasks.
///
/// Higher priorities run first; which priorities run at all depends on the
/// activity mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum TaskPriority {
    /// Runs only in SleepMode (summaries, consolidation, lifecycle).
    Batch = 0,

    /// Runs in SleepMode, after Normal drains.
    Low = 1,

    /// Runs in LowActivity and SleepMode.
    Normal = 2,

    /// Runs in every mode, including HighActivity.
    Urgent = 3,
}

/// One scheduled task with its cancellation token and retry count.
pub struct ScheduledTask {
    pub task: Task,
    pub cancel: CancellationToken,
    pub attempts: u32,
}

/// A priority-based task queue.
#[derive(Default)]
pub struct TaskQueue {
    urgent: VecDeque<ScheduledTask>,
    normal: VecDeque<ScheduledTask>,
    low: VecDeque<ScheduledTask>,
    batch: VecDeque<ScheduledTask>,
}

impl TaskQueue {
    /// Creates a new empty task queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lane_mut(&mut self, priority: TaskPriority) -> &mut VecDeque<ScheduledTask> {
        match priority {
            TaskPriority::Urgent => &mut self.urgent,
            TaskPriority::Normal => &mut self.normal,
            TaskPriority::Low => &mut self.low,
            TaskPriority::Batch => &mut self.batch,
        }
    }

    /// Adds a task to its lane.
    pub fn push(&mut self, task: ScheduledTask) {
        let priority = task.task.priority();
        self.lane_mut(priority).push_back(task);
    }

    /// Pops the next task of exactly `priority`.
    pub fn pop(&mut self, priority: TaskPriority) -> Option<ScheduledTask> {
        self.lane_mut(priority).pop_front()
    }

    /// Pops the highest-priority task from any lane.
    pub fn pop_any(&mut self) -> Option<ScheduledTask> {
        self.urgent
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
            .or_else(|| self.batch.pop_front())
    }

    /// Cancels and drains the Low and Batch lanes (shutdown path).
    pub fn cancel_background(&mut self) -> usize {
        let mut cancelled = 0;
        for lane in [&mut self.low, &mut self.batch] {
            for task in lane.iter() {
                task.cancel.cancel();
                cancelled += 1;
            }
            lane.clear();
        }
        cancelled
    }

    /// Per-lane queue depths.
    pub fn stats(&self) -> QueueStats {
        QueueStats {
            urgent_count: self.urgent.len(),
            normal_count: self.normal.len(),
            low_count: self.low.len(),
            batch_count: self.batch.len(),
        }
    }

    /// Total pending tasks.
    pub fn len(&self) -> usize {
        self.urgent.len() + self.normal.len() + self.low.len() + self.batch.len()
    }

    /// Whether every lane is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Statistics about the task queue.
#[derive(Debug, Clone)]
pub struct QueueStats {
    pub urgent_count: usize,
    pub normal_count: usize,
    pub low_count: usize,
    pub batch_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::NodeId;

    fn scheduled(task: Task) -> ScheduledTask {
        ScheduledTask {
            task,
            cancel: CancellationToken::new(),
            attempts: 0,
        }
    }

    fn embed_fast(id: &str) -> Task {
        Task::EmbedFast {
            message_id: NodeId::new(id),
            text: "test".to_string(),
        }
    }

    #[test]
    fn test_priority_ordering() {
        let mut queue = TaskQueue::new();

        queue.push(scheduled(Task::Reconcile)); // Batch
        queue.push(scheduled(Task::ExtractEntities {
            message_id: NodeId::new("m"),
            text: "t".to_string(),
        })); // Normal
        queue.push(scheduled(embed_fast("m"))); // Urgent
        queue.push(scheduled(Task::EmbedAccurate {
            message_id: NodeId::new("m"),
            text: "t".to_string(),
        })); // Low

        assert_eq!(queue.pop_any().unwrap().task.priority(), TaskPriority::Urgent);
        assert_eq!(queue.pop_any().unwrap().task.priority(), TaskPriority::Normal);
        assert_eq!(queue.pop_any().unwrap().task.priority(), TaskPriority::Low);
        assert_eq!(queue.pop_any().unwrap().task.priority(), TaskPriority::Batch);
        assert!(queue.pop_any().is_none());
    }

    #[test]
    fn test_pop_specific_lane() {
        let mut queue = TaskQueue::new();
        queue.push(scheduled(embed_fast("m")));
        queue.push(scheduled(Task::Reconcile));

        assert!(queue.pop(TaskPriority::Normal).is_none());
        assert!(queue.pop(TaskPriority::Urgent).is_some());
        assert_eq!(queue.stats().batch_count, 1);
    }

    #[test]
    fn test_cancel_background_drains_low_and_batch() {
        let mut queue = TaskQueue::new();
        queue.push(scheduled(embed_fast("m"))); // Urgent stays
        let accurate = scheduled(Task::EmbedAccurate {
            message_id: NodeId::new("m"),
            text: "t".to_string(),
        });
        let accurate_token = accurate.cancel.clone();
        queue.push(accurate);
        queue.push(scheduled(Task::Reconcile));

        let cancelled = queue.cancel_background();
        assert_eq!(cancelled, 2);
        assert!(accurate_token.is_cancelled());
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.stats().urgent_count, 1);
    }
}
