//! Background task scheduling for periodic maintenance work

use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

/// A repeating task. Returning `false` deregisters it.
pub type RepeatingTask = Box<dyn FnMut() -> bool + Send>;

/// Source of periodic background execution.
///
/// [`ConnectionPool`](crate::ConnectionPool) registers its health-check sweep
/// through this trait so callers can supply their own runtime instead of
/// [`WorkerScheduler`].
pub trait Scheduler: Send + Sync {
   /// Run `task` every `interval`, starting one interval from now, until it
   /// returns `false` or the scheduler shuts down.
   fn schedule_repeating(&self, interval: Duration, task: RepeatingTask);
}

struct ScheduledTask {
   next_run: Instant,
   interval: Duration,
   task: RepeatingTask,
}

struct SchedulerState {
   tasks: Vec<ScheduledTask>,
   running: bool,
}

struct SchedulerShared {
   state: Mutex<SchedulerState>,
   wakeup: Condvar,
}

/// A small fixed pool of worker threads executing repeating tasks.
///
/// Tasks run at-most-once concurrently per registration: a due task is taken
/// off the queue while it runs and re-inserted afterward, so a slow sweep can
/// never overlap with itself.
pub struct WorkerScheduler {
   shared: Arc<SchedulerShared>,
   workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerScheduler {
   /// Start `worker_threads` workers (at least one).
   pub fn new(worker_threads: usize) -> Self {
      let shared = Arc::new(SchedulerShared {
         state: Mutex::new(SchedulerState {
            tasks: Vec::new(),
            running: true,
         }),
         wakeup: Condvar::new(),
      });

      let count = worker_threads.max(1);
      let mut workers = Vec::with_capacity(count);
      for _ in 0..count {
         let shared = Arc::clone(&shared);
         workers.push(std::thread::spawn(move || worker_loop(&shared)));
      }
      debug!(workers = count, "scheduler started");

      Self {
         shared,
         workers: Mutex::new(workers),
      }
   }

   /// Stop the workers and join them.
   ///
   /// Pending tasks are dropped without running again. Idempotent; safe to
   /// call from any thread except a worker.
   pub fn shutdown(&self) {
      {
         let mut state = self.shared.state.lock();
         if !state.running {
            return;
         }
         state.running = false;
         state.tasks.clear();
      }
      self.shared.wakeup.notify_all();

      let workers = std::mem::take(&mut *self.workers.lock());
      for handle in workers {
         // A worker that panicked already tore down its task; nothing left
         // to salvage from the join error.
         let _ = handle.join();
      }
      debug!("scheduler shut down");
   }
}

impl Scheduler for WorkerScheduler {
   fn schedule_repeating(&self, interval: Duration, task: RepeatingTask) {
      let mut state = self.shared.state.lock();
      if !state.running {
         return;
      }
      state.tasks.push(ScheduledTask {
         next_run: Instant::now() + interval,
         interval,
         task,
      });
      drop(state);
      self.shared.wakeup.notify_one();
   }
}

impl Drop for WorkerScheduler {
   fn drop(&mut self) {
      self.shutdown();
   }
}

impl std::fmt::Debug for WorkerScheduler {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      let state = self.shared.state.lock();
      f.debug_struct("WorkerScheduler")
         .field("tasks", &state.tasks.len())
         .field("running", &state.running)
         .finish_non_exhaustive()
   }
}

fn worker_loop(shared: &SchedulerShared) {
   let mut state = shared.state.lock();
   loop {
      if !state.running {
         return;
      }

      let now = Instant::now();
      if let Some(idx) = state.tasks.iter().position(|t| t.next_run <= now) {
         let mut due = state.tasks.swap_remove(idx);
         drop(state);

         let keep = (due.task)();

         state = shared.state.lock();
         if keep && state.running {
            due.next_run = Instant::now() + due.interval;
            state.tasks.push(due);
         }
         continue;
      }

      match state.tasks.iter().map(|t| t.next_run).min() {
         Some(next) => {
            let now = Instant::now();
            if next > now {
               shared.wakeup.wait_for(&mut state, next - now);
            }
         }
         None => shared.wakeup.wait(&mut state),
      }
   }
}
