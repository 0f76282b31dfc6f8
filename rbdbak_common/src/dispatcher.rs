// rbdbak_common is the shared library implementing the backup orchestration engine.
// Copyright (C) 2024  Himbeer <himbeerserverde@gmail.com>
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use crate::task::{Task, TaskResult};

use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender};

/// Observable lifecycle of a single worker thread. Each worker publishes its
/// current state into a shared `Arc<Mutex<WorkerStatus>>` so `shutdown` can
/// poll for completion without blocking on a thread that is stuck (e.g. a
/// worker waiting on a hung child process).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerStatus {
    Ready,
    Wait,
    Run,
    Rest,
    Stop,
}

/// How long `shutdown` polls for workers to reach [`WorkerStatus::Stop`]
/// before giving up and leaking whatever is still running.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);
const SHUTDOWN_POLL_INTERVAL: Duration = Duration::from_millis(50);

enum TaskMsg {
    Run(Box<dyn Task + Send>),
    Stop,
}

/// A bounded pool of worker threads pulling from a shared task queue and
/// pushing completed [`TaskResult`]s onto a shared results queue. Many
/// producers may submit tasks and drain results concurrently (spec.md §4.6);
/// the pool itself owns no backup-domain knowledge, only dispatch.
pub struct WorkerPool {
    task_tx: Sender<TaskMsg>,
    result_rx: Receiver<TaskResult>,
    handles: Vec<JoinHandle<()>>,
    statuses: Vec<Arc<Mutex<WorkerStatus>>>,
}

impl WorkerPool {
    /// Spawns `worker_count` threads, each looping on the shared task channel
    /// until it receives `TaskMsg::Stop`. `queue_depth` bounds how many
    /// pending tasks may be buffered before `submit` blocks.
    pub fn new(worker_count: usize, queue_depth: usize) -> Self {
        let (task_tx, task_rx) = bounded::<TaskMsg>(queue_depth);
        let (result_tx, result_rx) = bounded::<TaskResult>(queue_depth);

        let mut handles = Vec::with_capacity(worker_count);
        let mut statuses = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let task_rx = task_rx.clone();
            let result_tx = result_tx.clone();
            let label = format!("worker-{id}");
            let status = Arc::new(Mutex::new(WorkerStatus::Ready));
            let thread_status = status.clone();

            let handle = thread::Builder::new()
                .name(label.clone())
                .spawn(move || {
                    tracing::debug!(worker = %label, "started");
                    loop {
                        *thread_status.lock().unwrap() = WorkerStatus::Wait;
                        let msg = match task_rx.recv() {
                            Ok(msg) => msg,
                            Err(_) => break,
                        };

                        match msg {
                            TaskMsg::Run(mut task) => {
                                *thread_status.lock().unwrap() = WorkerStatus::Run;
                                tracing::debug!(worker = %label, task = task.name(), "running task");
                                let result = task.execute(&label);
                                if result_tx.send(result).is_err() {
                                    // results receiver gone, nothing left to report to
                                    break;
                                }
                            }
                            TaskMsg::Stop => break,
                        }
                    }
                    *thread_status.lock().unwrap() = WorkerStatus::Stop;
                    tracing::debug!(worker = %label, "stopped");
                })
                .expect("failed to spawn worker thread");

            handles.push(handle);
            statuses.push(status);
        }

        Self {
            task_tx,
            result_rx,
            handles,
            statuses,
        }
    }

    /// Enqueues `task`, blocking if the queue is at `queue_depth`.
    pub fn submit(&self, task: Box<dyn Task + Send>) {
        let _ = self.task_tx.send(TaskMsg::Run(task));
    }

    /// Blocks until a task result is available, or returns `None` once every
    /// worker has stopped and the results queue is drained.
    pub fn recv_result(&self) -> Option<TaskResult> {
        self.result_rx.recv().ok()
    }

    /// Non-blocking poll for a task result.
    pub fn try_recv_result(&self) -> Option<TaskResult> {
        self.result_rx.try_recv().ok()
    }

    pub fn worker_count(&self) -> usize {
        self.handles.len()
    }

    /// Sends one `Stop` per worker, then polls worker status for a bounded
    /// countdown rather than joining unconditionally: a worker stuck on a
    /// pathological child process (e.g. `rbd` wedged) must not be able to
    /// block the orchestrator forever. When `force` is set the stop messages
    /// are sent immediately; otherwise callers should have already drained
    /// all expected results before calling this. Workers still running after
    /// the countdown are leaked (their `JoinHandle` is dropped without
    /// joining) and the pool returns anyway.
    pub fn shutdown(self, force: bool) {
        self.shutdown_with_timeout(force, SHUTDOWN_TIMEOUT, SHUTDOWN_POLL_INTERVAL)
    }

    fn shutdown_with_timeout(mut self, force: bool, timeout: Duration, poll_interval: Duration) {
        if force {
            // best effort: drop anything still queued ahead of the stop messages
            while self.task_tx.try_send(TaskMsg::Stop).is_err() {
                if self.result_rx.try_recv().is_err() {
                    break;
                }
            }
        }

        for _ in 0..self.handles.len() {
            let _ = self.task_tx.send(TaskMsg::Stop);
        }

        let deadline = Instant::now() + timeout;
        loop {
            let all_stopped = self
                .statuses
                .iter()
                .all(|status| *status.lock().unwrap() == WorkerStatus::Stop);
            if all_stopped || Instant::now() >= deadline {
                break;
            }
            thread::sleep(poll_interval);
        }

        for (handle, status) in self.handles.drain(..).zip(self.statuses.iter()) {
            if *status.lock().unwrap() == WorkerStatus::Stop {
                let _ = handle.join();
            } else {
                tracing::warn!("worker thread did not stop within the shutdown countdown, leaking it");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{TaskKind, TaskState, TaskStatus};
    use chrono::Utc;

    struct DummyTask {
        state: TaskState,
        id: String,
        sleep_ms: u64,
    }

    impl Task for DummyTask {
        fn execute(&mut self, worker_label: &str) -> TaskResult {
            self.state.status = TaskStatus::Running;
            if self.sleep_ms > 0 {
                thread::sleep(std::time::Duration::from_millis(self.sleep_ms));
            }
            self.state.status = TaskStatus::Complete;
            let now = Utc::now().naive_utc();
            TaskResult {
                kind: TaskKind::SnapshotCreate,
                name: self.name().to_string(),
                worker_label: worker_label.to_string(),
                status: TaskStatus::Complete,
                command: Vec::new(),
                exit_code: Some(0),
                stdout_capture: Vec::new(),
                error_message: None,
                init_ts: self.state.init_ts,
                start_ts: Some(now),
                complete_ts: Some(now),
                task_id: self.id.clone(),
                snap_name: None,
                dest_path: None,
            }
        }

        fn name(&self) -> &str {
            "dummy"
        }

        fn status(&self) -> TaskStatus {
            self.state.status
        }

        fn task_id(&self) -> &str {
            &self.id
        }
    }

    #[test]
    fn runs_all_submitted_tasks_and_collects_results() {
        let pool = WorkerPool::new(3, 16);

        for i in 0..8 {
            pool.submit(Box::new(DummyTask {
                state: TaskState::new(),
                id: format!("img{i}"),
                sleep_ms: 0,
            }));
        }

        let mut collected = Vec::new();
        for _ in 0..8 {
            collected.push(pool.recv_result().unwrap());
        }

        assert_eq!(collected.len(), 8);
        assert!(collected.iter().all(|r| r.status == TaskStatus::Complete));

        pool.shutdown(false);
    }

    #[test]
    fn shutdown_joins_every_worker_thread() {
        let pool = WorkerPool::new(2, 4);
        assert_eq!(pool.worker_count(), 2);
        pool.shutdown(false);
    }

    #[test]
    fn shutdown_gives_up_on_a_stuck_worker_within_the_countdown() {
        let pool = WorkerPool::new(1, 4);
        pool.submit(Box::new(DummyTask {
            state: TaskState::new(),
            id: "stuck".to_string(),
            sleep_ms: 10_000,
        }));

        let started = std::time::Instant::now();
        pool.shutdown_with_timeout(true, Duration::from_millis(200), Duration::from_millis(10));

        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
