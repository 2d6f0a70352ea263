use crate::handler::EventHandler;
use crate::registry::Holder;
use crossbeam_channel::{unbounded, Receiver, Sender};
use futures::future::BoxFuture;
use parking_lot::{Condvar, Mutex};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::thread::{self, JoinHandle};

/// Schedules a future onto an event loop owned by someone else.
///
/// Configure one via `StoreOptions::task_spawner` to take over the
/// asynchronous results produced by event handlers and autorun bodies.
/// Without one, handler futures are driven on the event loop of the worker
/// which dequeued them, and autorun futures are enqueued onto the
/// side-effect queue.
pub trait TaskSpawner: Send + Sync {
    fn spawn(&self, task: BoxFuture<'static, ()>);
}

/// A unit of work on the side-effect queue.
pub enum Job<E> {
    /// Run the handler with the event. The handler is re-resolved on the
    /// worker; a weakly held handler whose referent has been dropped in
    /// the meantime causes the job to be discarded.
    Handle(Holder<dyn EventHandler<E>>, E),
    /// Drive a future to completion on the worker's event loop.
    Future(BoxFuture<'static, ()>),
    /// Exit sentinel. One is enqueued per worker during shutdown and each
    /// worker consumes exactly one.
    Stop,
}

/// Counts jobs that have been enqueued but not yet finished, so that
/// shutdown can join the queued work.
struct JobCounter {
    count: Mutex<usize>,
    condvar: Condvar,
}

impl JobCounter {
    fn new() -> Self {
        Self {
            count: Mutex::new(0),
            condvar: Condvar::new(),
        }
    }

    fn increment(&self) {
        *self.count.lock() += 1;
    }

    fn decrement(&self) {
        let mut count = self.count.lock();
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.condvar.notify_all();
        }
    }

    fn is_idle(&self) -> bool {
        *self.count.lock() == 0
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.condvar.wait(&mut count);
        }
    }
}

/// The pieces of the pool shared with worker threads and task spawners.
struct PoolShared<E> {
    sender: Sender<Job<E>>,
    counter: JobCounter,
    stopped: AtomicBool,
}

impl<E> PoolShared<E> {
    fn enqueue(&self, job: Job<E>) {
        if self.stopped.load(Ordering::SeqCst) {
            log::warn!("side-effect queue has been stopped, discarding a job");
            return;
        }

        self.counter.increment();
        if self.sender.send(job).is_err() {
            self.counter.decrement();
            log::warn!("side-effect queue is disconnected, discarding a job");
        }
    }
}

/// The environment handed to a [WorkerRunner] for the lifetime of one
/// worker thread.
pub struct WorkerContext<E> {
    index: usize,
    jobs: Receiver<Job<E>>,
    shared: Arc<PoolShared<E>>,
    spawner: Option<Arc<dyn TaskSpawner>>,
}

impl<E> WorkerContext<E> {
    /// This worker's index within the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Block until the next job arrives. Returns `None` once the worker
    /// should exit: either its [Job::Stop] sentinel arrived or the queue
    /// disconnected.
    pub fn next_job(&self) -> Option<Job<E>> {
        match self.jobs.recv() {
            Ok(Job::Stop) | Err(_) => None,
            Ok(job) => Some(job),
        }
    }

    /// Mark a job obtained from [next_job()](WorkerContext::next_job) as
    /// finished. Must be called exactly once per job, after the handler
    /// has returned or its future has been handed off.
    pub fn finish_job(&self) {
        self.shared.counter.decrement();
    }

    /// The externally configured task spawner, if any.
    pub fn task_spawner(&self) -> Option<&Arc<dyn TaskSpawner>> {
        self.spawner.as_ref()
    }
}

/// Runs one worker thread's loop, dequeueing jobs until the pool stops.
///
/// The default [TokioWorkerRunner] is replaceable via
/// `StoreOptions::side_effect_runner`, for example to pin workers or to
/// integrate a different async runtime.
pub trait WorkerRunner<E>: Send + Sync {
    fn run(&self, context: WorkerContext<E>);
}

/// The default worker loop. Each worker owns a current-thread tokio
/// runtime for the lifetime of the thread; handler futures are driven on
/// it unless an external [TaskSpawner] takes them over.
///
/// A panicking handler is contained and logged; the worker continues with
/// the next job.
pub struct TokioWorkerRunner;

impl<E: Send + 'static> WorkerRunner<E> for TokioWorkerRunner {
    fn run(&self, context: WorkerContext<E>) {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                log::error!(
                    "side-effect worker {} failed to build its event loop: {}",
                    context.index(),
                    err
                );
                return;
            }
        };

        while let Some(job) = context.next_job() {
            match job {
                Job::Handle(holder, event) => {
                    let Some(handler) = holder.upgrade() else {
                        log::trace!(
                            "side-effect worker {}: handler was dropped, discarding its event",
                            context.index()
                        );
                        context.finish_job();
                        continue;
                    };

                    match catch_unwind(AssertUnwindSafe(|| handler.handle(event))) {
                        Ok(Some(future)) => match context.task_spawner() {
                            Some(spawner) => spawner.spawn(future),
                            None => {
                                if catch_unwind(AssertUnwindSafe(|| runtime.block_on(future)))
                                    .is_err()
                                {
                                    log::error!(
                                        "side-effect worker {}: event handler panicked",
                                        context.index()
                                    );
                                }
                            }
                        },
                        Ok(None) => {}
                        Err(_) => {
                            log::error!(
                                "side-effect worker {}: event handler panicked",
                                context.index()
                            );
                        }
                    }
                    context.finish_job();
                }
                Job::Future(future) => {
                    if catch_unwind(AssertUnwindSafe(|| runtime.block_on(future))).is_err() {
                        log::error!(
                            "side-effect worker {}: scheduled task panicked",
                            context.index()
                        );
                    }
                    context.finish_job();
                }
                Job::Stop => break,
            }
        }
    }
}

/// Enqueues futures onto the side-effect queue, to be driven on whichever
/// worker dequeues them. The fallback [TaskSpawner] when none was
/// configured.
struct PoolSpawner<E> {
    shared: Arc<PoolShared<E>>,
}

impl<E: Send + 'static> TaskSpawner for PoolSpawner<E> {
    fn spawn(&self, task: BoxFuture<'static, ()>) {
        self.shared.enqueue(Job::Future(task));
    }
}

/// The bounded set of worker threads draining the side-effect queue.
pub(crate) struct SideEffectWorkerPool<E> {
    shared: Arc<PoolShared<E>>,
    receiver: Receiver<Job<E>>,
    runner: Arc<dyn WorkerRunner<E>>,
    task_spawner: Option<Arc<dyn TaskSpawner>>,
    worker_count: usize,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl<E: Send + 'static> SideEffectWorkerPool<E> {
    pub fn new(
        worker_count: usize,
        runner: Arc<dyn WorkerRunner<E>>,
        task_spawner: Option<Arc<dyn TaskSpawner>>,
    ) -> Self {
        let (sender, receiver) = unbounded();
        Self {
            shared: Arc::new(PoolShared {
                sender,
                counter: JobCounter::new(),
                stopped: AtomicBool::new(false),
            }),
            receiver,
            runner,
            task_spawner,
            worker_count: worker_count.max(1),
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn start(&self) {
        let mut workers = self.workers.lock();
        for index in 0..self.worker_count {
            let context = WorkerContext {
                index,
                jobs: self.receiver.clone(),
                shared: self.shared.clone(),
                spawner: self.task_spawner.clone(),
            };
            let runner = self.runner.clone();
            let spawned = thread::Builder::new()
                .name(format!("side-effect-worker-{}", index))
                .spawn(move || runner.run(context));

            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => {
                    log::error!("failed to spawn side-effect worker {}: {}", index, err);
                }
            }
        }
    }

    pub fn enqueue(&self, job: Job<E>) {
        self.shared.enqueue(job);
    }

    /// `true` when no job is queued or in flight.
    pub fn is_idle(&self) -> bool {
        self.shared.counter.is_idle()
    }

    /// Block until every queued and in-flight job has finished.
    pub fn wait_idle(&self) {
        self.shared.counter.wait_idle();
    }

    /// A [TaskSpawner] backed by this pool's queue.
    pub fn spawner(&self) -> Arc<dyn TaskSpawner> {
        Arc::new(PoolSpawner {
            shared: self.shared.clone(),
        })
    }

    /// Stop accepting work, send each worker its exit sentinel, and join
    /// the worker threads.
    pub fn stop_and_join(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);

        let workers = std::mem::take(&mut *self.workers.lock());
        for _ in &workers {
            let _ = self.shared.sender.send(Job::Stop);
        }
        for handle in workers {
            if handle.join().is_err() {
                log::error!("a side-effect worker exited with a panic");
            }
        }
    }
}
