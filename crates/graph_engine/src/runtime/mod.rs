//! Task-DAG runtime
//!
//! A [`Taskflow`] is a reusable DAG of closures; an [`Executor`] runs it on a
//! worker pool, releasing each task once all of its dependencies retired.
//! One taskflow can be run many times; per-run state (dependency counters,
//! completion) lives in the run, not in the flow.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crossbeam::channel::{unbounded, Receiver, Sender};

/// Index of a task within its taskflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(usize);

struct Task {
    name: String,
    work: Arc<dyn Fn() + Send + Sync>,
    successors: Vec<usize>,
    dependency_count: usize,
}

/// A reusable DAG of named tasks
#[derive(Default)]
pub struct Taskflow {
    tasks: Vec<Task>,
}

impl Taskflow {
    /// Empty flow
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task; dependencies are wired afterwards with
    /// [`add_dependency`](Self::add_dependency)
    pub fn add_task(
        &mut self,
        name: impl Into<String>,
        work: impl Fn() + Send + Sync + 'static,
    ) -> TaskId {
        self.tasks.push(Task {
            name: name.into(),
            work: Arc::new(work),
            successors: Vec::new(),
            dependency_count: 0,
        });
        TaskId(self.tasks.len() - 1)
    }

    /// Make `to` wait for `from`
    pub fn add_dependency(&mut self, from: TaskId, to: TaskId) {
        self.tasks[from.0].successors.push(to.0);
        self.tasks[to.0].dependency_count += 1;
    }

    /// Number of tasks in the flow
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Name of a task
    pub fn task_name(&self, id: TaskId) -> &str {
        &self.tasks[id.0].name
    }
}

struct Completion {
    done: Mutex<bool>,
    condvar: Condvar,
}

impl Completion {
    fn mark_done(&self) {
        let mut done = self
            .done
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        *done = true;
        self.condvar.notify_all();
    }

    fn wait(&self) {
        let mut done = self
            .done
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        while !*done {
            done = self
                .condvar
                .wait(done)
                .unwrap_or_else(std::sync::PoisonError::into_inner);
        }
    }

    fn is_done(&self) -> bool {
        *self
            .done
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Handle on one in-flight run of a taskflow.
///
/// Dropping a token waits for the run to finish; a run is never silently
/// cancelled.
pub struct RunToken {
    completion: Arc<Completion>,
    waited: bool,
}

impl RunToken {
    /// Block until the run completes
    pub fn wait(mut self) {
        self.wait_in_place();
    }

    /// Whether the run already completed
    pub fn is_finished(&self) -> bool {
        self.completion.is_done()
    }

    fn wait_in_place(&mut self) {
        if !self.waited {
            self.completion.wait();
            self.waited = true;
        }
    }
}

impl Drop for RunToken {
    fn drop(&mut self) {
        self.wait_in_place();
    }
}

struct RunState {
    tasks: Arc<Vec<RunTask>>,
    remaining_dependencies: Vec<AtomicUsize>,
    pending_tasks: AtomicUsize,
    completion: Arc<Completion>,
}

struct RunTask {
    name: String,
    work: Arc<dyn Fn() + Send + Sync>,
    successors: Vec<usize>,
}

type Job = Box<dyn FnOnce() + Send + 'static>;

struct Worker {
    handle: Option<thread::JoinHandle<()>>,
}

impl Worker {
    fn new(receiver: Receiver<Job>) -> Self {
        let handle = thread::spawn(move || {
            while let Ok(job) = receiver.recv() {
                job();
            }
        });
        Self {
            handle: Some(handle),
        }
    }
}

/// Worker pool running taskflows
pub struct Executor {
    workers: Vec<Worker>,
    sender: Option<Sender<Job>>,
}

impl Executor {
    /// Pool with `worker_count` threads (at least one)
    pub fn new(worker_count: usize) -> Self {
        let (sender, receiver) = unbounded::<Job>();
        let workers = (0..worker_count.max(1))
            .map(|_| Worker::new(receiver.clone()))
            .collect();
        Self {
            workers,
            sender: Some(sender),
        }
    }

    /// Pool sized to the machine, capped at eight workers
    pub fn with_default_workers() -> Self {
        let workers = thread::available_parallelism()
            .map(std::num::NonZeroUsize::get)
            .unwrap_or(2)
            .min(8);
        Self::new(workers)
    }

    /// Launch one asynchronous run of `taskflow`
    pub fn run(&self, taskflow: &Taskflow) -> RunToken {
        let completion = Arc::new(Completion {
            done: Mutex::new(false),
            condvar: Condvar::new(),
        });
        if taskflow.tasks.is_empty() {
            completion.mark_done();
            return RunToken {
                completion,
                waited: false,
            };
        }

        let run_tasks: Vec<RunTask> = taskflow
            .tasks
            .iter()
            .map(|task| RunTask {
                name: task.name.clone(),
                work: task.work.clone(),
                successors: task.successors.clone(),
            })
            .collect();
        let state = Arc::new(RunState {
            remaining_dependencies: taskflow
                .tasks
                .iter()
                .map(|task| AtomicUsize::new(task.dependency_count))
                .collect(),
            pending_tasks: AtomicUsize::new(run_tasks.len()),
            tasks: Arc::new(run_tasks),
            completion: completion.clone(),
        });

        let sender = self.sender.clone().expect("executor already shut down");
        for (index, task) in taskflow.tasks.iter().enumerate() {
            if task.dependency_count == 0 {
                Self::enqueue(&sender, &state, index);
            }
        }
        RunToken {
            completion,
            waited: false,
        }
    }

    fn enqueue(sender: &Sender<Job>, state: &Arc<RunState>, index: usize) {
        let state = state.clone();
        let sender_for_successors = sender.clone();
        let job: Job = Box::new(move || {
            let task = &state.tasks[index];
            let outcome = catch_unwind(AssertUnwindSafe(|| (task.work)()));
            if outcome.is_err() {
                log::error!("task '{}' panicked; continuing the graph", task.name);
            }
            for &successor in &task.successors {
                if state.remaining_dependencies[successor].fetch_sub(1, Ordering::AcqRel) == 1 {
                    Self::enqueue(&sender_for_successors, &state, successor);
                }
            }
            if state.pending_tasks.fetch_sub(1, Ordering::AcqRel) == 1 {
                state.completion.mark_done();
            }
        });
        // Send can only fail after shutdown, which waits for runs first.
        let _ = sender.send(job);
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        drop(self.sender.take());
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn dependencies_impose_happens_before() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut taskflow = Taskflow::new();
        let record = |label: &'static str, order: Arc<Mutex<Vec<&'static str>>>| {
            move || order.lock().unwrap().push(label)
        };
        let a = taskflow.add_task("a", record("a", order.clone()));
        let b = taskflow.add_task("b", record("b", order.clone()));
        let c = taskflow.add_task("c", record("c", order.clone()));
        taskflow.add_dependency(a, b);
        taskflow.add_dependency(b, c);

        let executor = Executor::new(4);
        executor.run(&taskflow).wait();

        assert_eq!(*order.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn diamond_runs_every_task_exactly_once_per_run() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut taskflow = Taskflow::new();
        let bump = |counter: Arc<AtomicU32>| move || {
            counter.fetch_add(1, Ordering::Relaxed);
        };
        let root = taskflow.add_task("root", bump(counter.clone()));
        let left = taskflow.add_task("left", bump(counter.clone()));
        let right = taskflow.add_task("right", bump(counter.clone()));
        let sink = taskflow.add_task("sink", bump(counter.clone()));
        taskflow.add_dependency(root, left);
        taskflow.add_dependency(root, right);
        taskflow.add_dependency(left, sink);
        taskflow.add_dependency(right, sink);

        let executor = Executor::new(4);
        for run in 1..=3 {
            executor.run(&taskflow).wait();
            assert_eq!(counter.load(Ordering::Relaxed), run * 4);
        }
    }

    #[test]
    fn a_panicking_task_does_not_wedge_the_run() {
        let mut taskflow = Taskflow::new();
        let reached = Arc::new(AtomicU32::new(0));
        let reached_clone = reached.clone();
        let bad = taskflow.add_task("bad", || panic!("injected"));
        let after = taskflow.add_task("after", move || {
            reached_clone.fetch_add(1, Ordering::Relaxed);
        });
        taskflow.add_dependency(bad, after);

        let executor = Executor::new(2);
        executor.run(&taskflow).wait();
        assert_eq!(reached.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dropping_a_token_waits_for_completion() {
        let done = Arc::new(AtomicU32::new(0));
        let done_clone = done.clone();
        let mut taskflow = Taskflow::new();
        taskflow.add_task("slow", move || {
            thread::sleep(std::time::Duration::from_millis(20));
            done_clone.fetch_add(1, Ordering::Relaxed);
        });

        let executor = Executor::new(1);
        drop(executor.run(&taskflow));
        assert_eq!(done.load(Ordering::Relaxed), 1);
    }
}
