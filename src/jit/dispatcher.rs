//! Concurrent compile dispatcher
//!
//! Background workers pull `CompileRequest`s from a bounded input queue,
//! compile them and push the outcome to an output queue. Nothing compiled
//! here is ever activated by a worker: the engine drains the output queue at
//! safe points on its own thread and decides, by ticket, what to install.

use super::compiler::{CompileRequest, CompiledUnit, SpeculativeCompiler};
use super::tiering::Tier;
use crate::bytecode::FunctionId;
use crate::config::EngineConfig;
use crate::error::Result;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// A finished background compile
#[derive(Debug)]
pub struct CompileOutcome {
    pub function: FunctionId,
    pub tier: Tier,
    pub ticket: u64,
    pub osr_entry: Option<u32>,
    pub result: Result<CompiledUnit>,
}

#[derive(Debug, Default)]
struct Queues {
    input: VecDeque<CompileRequest>,
    output: VecDeque<CompileOutcome>,
    in_flight: usize,
    stopping: bool,
    /// Bumped by `flush`; results of older jobs are dropped
    generation: u64,
}

#[derive(Debug)]
struct Shared {
    queues: Mutex<Queues>,
    work_ready: Condvar,
    job_done: Condvar,
    compiler: SpeculativeCompiler,
    capacity: usize,
    delay: Duration,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Queues> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Worker pool for background compilation
#[derive(Debug)]
pub struct CompileDispatcher {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl CompileDispatcher {
    pub fn new(compiler: SpeculativeCompiler, config: &EngineConfig) -> Self {
        let shared = Arc::new(Shared {
            queues: Mutex::new(Queues::default()),
            work_ready: Condvar::new(),
            job_done: Condvar::new(),
            compiler,
            capacity: config.queue_capacity,
            delay: Duration::from_millis(config.recompilation_delay_ms),
        });
        let mut workers = Vec::with_capacity(config.worker_threads);
        for index in 0..config.worker_threads {
            let worker_shared = Arc::clone(&shared);
            let spawned = thread::Builder::new()
                .name(format!("quicktier-compile-{}", index))
                .spawn(move || worker_loop(&worker_shared));
            match spawned {
                Ok(handle) => workers.push(handle),
                Err(err) => warn!(index, %err, "failed to spawn compile worker"),
            }
        }
        debug!(workers = workers.len(), capacity = config.queue_capacity, "compile dispatcher started");
        Self { shared, workers }
    }

    /// Whether another job fits in the input queue
    pub fn is_queue_available(&self) -> bool {
        self.has_room(&self.shared.lock())
    }

    fn has_room(&self, queues: &Queues) -> bool {
        !self.workers.is_empty()
            && !queues.stopping
            && queues.input.len() + queues.in_flight < self.shared.capacity
    }

    /// Queue a job; a full queue hands the request back
    pub fn queue(&self, request: CompileRequest) -> std::result::Result<(), CompileRequest> {
        let mut queues = self.shared.lock();
        if !self.has_room(&queues) {
            return Err(request);
        }
        trace!(function = %request.function, tier = ?request.tier, ticket = request.ticket, "queued compile job");
        queues.input.push_back(request);
        self.shared.work_ready.notify_one();
        Ok(())
    }

    /// Take every finished outcome
    pub fn take_results(&self) -> Vec<CompileOutcome> {
        self.shared.lock().output.drain(..).collect()
    }

    /// Whether jobs are queued or compiling
    pub fn has_jobs(&self) -> bool {
        let queues = self.shared.lock();
        !queues.input.is_empty() || queues.in_flight > 0
    }

    /// Block until every queued job has been compiled
    pub fn await_idle(&self) {
        let mut queues = self.shared.lock();
        while (!queues.input.is_empty() || queues.in_flight > 0) && !self.workers.is_empty() {
            queues = self
                .shared
                .job_done
                .wait(queues)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Drop queued jobs and finished results. With `blocking`, also wait
    /// for in-flight jobs; their results are dropped either way.
    pub fn flush(&self, blocking: bool) {
        let mut queues = self.shared.lock();
        let dropped = queues.input.len() + queues.output.len();
        queues.input.clear();
        queues.output.clear();
        queues.generation += 1;
        if blocking {
            while queues.in_flight > 0 {
                queues = self
                    .shared
                    .job_done
                    .wait(queues)
                    .unwrap_or_else(PoisonError::into_inner);
            }
        }
        debug!(dropped, blocking, "flushed compile queues");
    }

    /// Flush and join the workers
    pub fn stop(&mut self) {
        self.flush(true);
        self.shared.lock().stopping = true;
        self.shared.work_ready.notify_all();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                warn!("compile worker panicked");
            }
        }
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }
}

impl Drop for CompileDispatcher {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_loop(shared: &Shared) {
    loop {
        let (request, generation) = {
            let mut queues = shared.lock();
            while queues.input.is_empty() && !queues.stopping {
                queues = shared.work_ready.wait(queues).unwrap_or_else(PoisonError::into_inner);
            }
            if queues.stopping {
                return;
            }
            let Some(request) = queues.input.pop_front() else {
                continue;
            };
            queues.in_flight += 1;
            (request, queues.generation)
        };

        if !shared.delay.is_zero() {
            thread::sleep(shared.delay);
        }
        let result = shared.compiler.compile(&request);
        let outcome = CompileOutcome {
            function: request.function,
            tier: request.tier,
            ticket: request.ticket,
            osr_entry: request.osr_entry,
            result,
        };

        let mut queues = shared.lock();
        queues.in_flight -= 1;
        if queues.generation == generation {
            queues.output.push_back(outcome);
        }
        shared.job_done.notify_all();
    }
}
