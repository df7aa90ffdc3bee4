//! The thread pool and its cooperative round-robin scheduler. The pool
//! owns every logical thread, picks the next runnable one after crossing
//! the host event-loop boundary, balances park/unpark counts, and accounts
//! for daemon threads when deciding whether the JVM should shut down.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Duration;

use hashbrown::HashMap;

use crate::instruction::OpcodeTable;
use crate::jvm::interface::{ClassLoader, Host, Jvm, ObjectModel};
use crate::jvm::mem::ObjectHandle;
use crate::jvm::thread::{JavaThread, ThreadStatus};
use crate::jvm::{JavaEnv, SchedulerOptions};

pub struct ThreadPool {
    self_ref: Weak<ThreadPool>,
    env: JavaEnv,
    options: SchedulerOptions,

    threads: RefCell<Vec<Rc<JavaThread>>>,
    running_thread: RefCell<Option<Rc<JavaThread>>>,
    running_index: Cell<usize>,

    // Signed park balance per thread ref; an unpark arriving before the
    // park drives the balance negative and cancels it out.
    park_counts: RefCell<HashMap<ObjectHandle, i64>>,

    // Adaptive yield budget, scoped to this pool
    max_method_resumes: Cell<f64>,
    n_samples: Cell<u32>,

    schedule_queued: Cell<bool>,
    in_shutdown: Cell<bool>,
    empty_callback: RefCell<Option<Box<dyn FnOnce()>>>,
}

impl ThreadPool {
    pub fn new(
        env: JavaEnv,
        options: SchedulerOptions,
        empty_callback: Box<dyn FnOnce()>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|self_ref| ThreadPool {
            self_ref: self_ref.clone(),
            options,
            threads: RefCell::new(Vec::new()),
            running_thread: RefCell::new(None),
            running_index: Cell::new(0),
            park_counts: RefCell::new(HashMap::new()),
            max_method_resumes: Cell::new(options.initial_method_resumes as f64),
            n_samples: Cell::new(0),
            schedule_queued: Cell::new(false),
            in_shutdown: Cell::new(false),
            empty_callback: RefCell::new(Some(empty_callback)),
            env,
        })
    }

    fn handle(&self) -> Rc<ThreadPool> {
        self.self_ref.upgrade().expect("Pool accessed during teardown")
    }

    pub fn class_loader(&self) -> Rc<dyn ClassLoader> {
        self.env.class_loader.clone()
    }

    pub fn objects(&self) -> Rc<dyn ObjectModel> {
        self.env.objects.clone()
    }

    pub fn host(&self) -> Rc<dyn Host> {
        self.env.host.clone()
    }

    pub fn jvm(&self) -> Rc<dyn Jvm> {
        self.env.jvm.clone()
    }

    pub fn opcodes(&self) -> Rc<OpcodeTable> {
        self.env.opcodes.clone()
    }

    /// Register a new logical thread for `java_object`, initially `NEW`.
    pub fn new_thread(&self, java_object: ObjectHandle) -> Rc<JavaThread> {
        let thread = JavaThread::new(&self.handle(), java_object);
        self.threads.borrow_mut().push(thread.clone());
        thread
    }

    pub fn threads(&self) -> Vec<Rc<JavaThread>> {
        self.threads.borrow().clone()
    }

    pub fn running_thread(&self) -> Option<Rc<JavaThread>> {
        self.running_thread.borrow().clone()
    }

    pub fn in_shutdown(&self) -> bool {
        self.in_shutdown.get()
    }

    pub(crate) fn method_resume_budget(&self) -> u64 {
        self.max_method_resumes.get().max(1.0) as u64
    }

    pub fn resume_budget(&self) -> f64 {
        self.max_method_resumes.get()
    }

    pub fn resume_samples(&self) -> u32 {
        self.n_samples.get()
    }

    /// Cumulative moving average pulling `max_method_resumes` toward one
    /// responsiveness target per uninterrupted run.
    pub(crate) fn adapt_resume_budget(&self, elapsed: Duration) {
        let dur_ms = (elapsed.as_secs_f64() * 1000.0).max(0.01);
        let max = self.max_method_resumes.get();
        let responsiveness = self.options.responsiveness.as_secs_f64() * 1000.0;

        let estimate = ((max / dur_ms) * responsiveness).floor();
        let n = self.n_samples.get() as f64;
        let updated = ((estimate + n * max) / (n + 1.0)).floor().max(1.0);

        trace!(
            "Method resume budget {} -> {} after {:.2}ms ({} samples)",
            max,
            updated,
            dur_ms,
            self.n_samples.get() + 1
        );
        self.max_method_resumes.set(updated);
        self.n_samples.set(self.n_samples.get() + 1);
    }

    /// A thread became runnable; if nothing is running, go pick one.
    pub(crate) fn thread_runnable(&self, _thread: &Rc<JavaThread>) {
        if self.running_thread.borrow().is_none() {
            self.schedule_next_thread();
        }
    }

    /// Queue a scheduling pass on the next host tick. The deferral lets the
    /// host service timers and I/O between runs and keeps scheduler
    /// recursion off the native stack.
    pub fn schedule_next_thread(&self) {
        if self.schedule_queued.replace(true) {
            return;
        }

        let pool = self.self_ref.clone();
        self.env.host.defer(Box::new(move || {
            if let Some(pool) = pool.upgrade() {
                pool.find_next_thread();
            }
        }));
    }

    fn find_next_thread(&self) {
        self.schedule_queued.set(false);
        if self.running_thread.borrow().is_some() {
            return;
        }

        let candidate = {
            let threads = self.threads.borrow();
            if threads.is_empty() {
                return;
            }

            // Resume the scan one past the previous pick so a just-yielded
            // thread goes to the back of the line
            let len = threads.len();
            let start = self.running_index.get();
            (1..=len)
                .map(|offset| (start + offset) % len)
                .find(|&idx| threads[idx].status() == ThreadStatus::Runnable)
                .map(|idx| (idx, threads[idx].clone()))
        };

        match candidate {
            None => trace!("No runnable threads; pool idles until an async event"),
            Some((index, thread)) => {
                trace!("Scheduling thread {:?}", thread);
                self.running_index.set(index);
                *self.running_thread.borrow_mut() = Some(thread.clone());
                // Entering RUNNING starts the thread's execution loop
                thread.set_status(ThreadStatus::Running);
            }
        }
    }

    /// The running thread moved to a non-runnable state.
    pub(crate) fn thread_suspended(&self, thread: &Rc<JavaThread>) {
        let was_running = self
            .running_thread
            .borrow()
            .as_ref()
            .map_or(false, |t| Rc::ptr_eq(t, thread));

        if was_running {
            self.running_thread.borrow_mut().take();
            self.schedule_next_thread();
        }
    }

    /// A terminated thread resumed; put it back under scheduler control so
    /// shutdown hooks can run on its identity.
    pub(crate) fn thread_resurrected(&self, thread: &Rc<JavaThread>) {
        let mut threads = self.threads.borrow_mut();
        if !threads.iter().any(|t| Rc::ptr_eq(t, thread)) {
            debug!("Re-registering resurrected thread {:?}", thread);
            threads.push(thread.clone());
        }
    }

    pub(crate) fn thread_terminated(&self, thread: &Rc<JavaThread>) {
        {
            let mut threads = self.threads.borrow_mut();
            let index = threads.iter().position(|t| Rc::ptr_eq(t, thread));
            debug_assert!(index.is_some(), "Terminated thread was not registered");

            if let Some(index) = index {
                threads.remove(index);
                let running_index = self.running_index.get();
                if index <= running_index && running_index > 0 {
                    self.running_index.set(running_index - 1);
                }
            }
        }

        let was_running = self
            .running_thread
            .borrow()
            .as_ref()
            .map_or(false, |t| Rc::ptr_eq(t, thread));
        if was_running {
            self.running_thread.borrow_mut().take();
        }

        if self.any_schedulable_non_daemon() {
            self.schedule_next_thread();
        } else if !self.in_shutdown.replace(true) {
            info!("Last non-daemon thread exited; shutting down on its identity");
            self.env.jvm.initiate_shutdown(thread);
        } else if self.threads.borrow().iter().any(|t| t.is_immortal()) {
            trace!("Pool drained, but immortal threads remain");
        } else {
            let callback = self.empty_callback.borrow_mut().take();
            if let Some(callback) = callback {
                debug!("Thread pool empty; notifying embedder");
                callback();
            }
        }
    }

    fn any_schedulable_non_daemon(&self) -> bool {
        self.threads.borrow().iter().any(|thread| {
            (thread.is_immortal() || !self.env.objects.is_daemon(thread.java_object()))
                && !matches!(
                    thread.status(),
                    ThreadStatus::New | ThreadStatus::Terminated
                )
        })
    }

    /// Park `thread`. A positive balance parks; a balance paid down by
    /// earlier unparks makes this a no-op.
    pub fn park(&self, thread: &Rc<JavaThread>) {
        let count = {
            let mut counts = self.park_counts.borrow_mut();
            let count = counts.entry(thread.java_object()).or_insert(0);
            *count += 1;
            *count
        };

        trace!("Thread {:?} parked (balance {})", thread, count);
        if count > 0 {
            thread.set_status(ThreadStatus::Parked);
        }
    }

    pub fn unpark(&self, thread: &Rc<JavaThread>) {
        let count = {
            let mut counts = self.park_counts.borrow_mut();
            let count = counts.entry(thread.java_object()).or_insert(0);
            *count -= 1;
            *count
        };

        trace!("Thread {:?} unparked (balance {})", thread, count);
        if count <= 0 {
            thread.set_status(ThreadStatus::Runnable);
        }
    }

    /// Zero the park balance and release the thread, used when an interrupt
    /// must cut through pending parks.
    pub fn completely_unpark(&self, thread: &Rc<JavaThread>) {
        let parked = {
            let mut counts = self.park_counts.borrow_mut();
            match counts.get_mut(&thread.java_object()) {
                Some(count) if *count != 0 => {
                    *count = 0;
                    true
                }
                _ => false,
            }
        };

        if parked {
            thread.set_status(ThreadStatus::Runnable);
        }
    }

    pub fn park_count(&self, thread: &JavaThread) -> i64 {
        self.park_counts
            .borrow()
            .get(&thread.java_object())
            .copied()
            .unwrap_or(0)
    }
}
