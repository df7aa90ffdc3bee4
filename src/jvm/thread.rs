//! This module handles the thread lifecycle and the cooperative execution
//! loop. Logical Java threads are multiplexed over the single host thread;
//! at most one is `RUNNING` at a time, and every suspension point hands
//! control back to the pool's scheduler.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};
use std::time::Instant;

use hashbrown::HashMap;
use lazy_static::lazy_static;

use crate::class::MethodInfo;
use crate::jvm::call::{Frame, FrameKind, InternalCallback, InternalFrame, StackTraceFrame};
use crate::jvm::interface::{ClassLoader, JavaClass, Monitor};
use crate::jvm::mem::{JavaValue, ObjectHandle};
use crate::jvm::pool::ThreadPool;

#[cfg(any(test, debug_assertions, feature = "debug"))]
use crate::jvm::mem::FieldDescriptor;

bitflags! {
    /// JVMTI thread state constants, surfaced to Java code through the
    /// `java/lang/Thread.threadStatus` field.
    pub struct JvmtiThreadState: i32 {
        const ALIVE = 0x0001;
        const TERMINATED = 0x0002;
        const RUNNABLE = 0x0004;
        const WAITING_INDEFINITELY = 0x0010;
        const WAITING_WITH_TIMEOUT = 0x0020;
        const BLOCKED_ON_MONITOR_ENTER = 0x0400;
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum ThreadStatus {
    New,
    Runnable,
    Running,
    Blocked,
    UninterruptablyBlocked,
    Waiting,
    TimedWaiting,
    AsyncWaiting,
    Parked,
    Terminated,
}

impl ThreadStatus {
    pub fn jvmti_state(self) -> JvmtiThreadState {
        use ThreadStatus::*;
        match self {
            New => JvmtiThreadState::ALIVE,
            Runnable | Running => JvmtiThreadState::RUNNABLE,
            Blocked | UninterruptablyBlocked => JvmtiThreadState::BLOCKED_ON_MONITOR_ENTER,
            Waiting | AsyncWaiting | Parked => JvmtiThreadState::WAITING_INDEFINITELY,
            TimedWaiting => JvmtiThreadState::WAITING_WITH_TIMEOUT,
            Terminated => JvmtiThreadState::TERMINATED,
        }
    }

    /// States that require a blocking monitor reference on the thread.
    pub fn blocks_on_monitor(self) -> bool {
        use ThreadStatus::*;
        matches!(self, Blocked | UninterruptablyBlocked | Waiting | TimedWaiting)
    }
}

lazy_static! {
    static ref VALID_TRANSITIONS: HashMap<ThreadStatus, &'static [ThreadStatus]> = {
        use ThreadStatus::*;
        let mut table: HashMap<ThreadStatus, &'static [ThreadStatus]> = HashMap::new();
        table.insert(New, &[Runnable, AsyncWaiting, Terminated]);
        table.insert(Runnable, &[Running, AsyncWaiting]);
        table.insert(
            Running,
            &[
                Runnable,
                AsyncWaiting,
                Terminated,
                Blocked,
                Waiting,
                TimedWaiting,
                Parked,
            ],
        );
        table.insert(AsyncWaiting, &[Runnable, Terminated]);
        table.insert(Blocked, &[Runnable]);
        table.insert(Parked, &[Runnable]);
        table.insert(Waiting, &[Runnable, UninterruptablyBlocked]);
        table.insert(TimedWaiting, &[Runnable, UninterruptablyBlocked]);
        table.insert(UninterruptablyBlocked, &[Runnable]);
        table.insert(Terminated, &[New, Runnable, AsyncWaiting]);
        table
    };
}

/// The sparse table of permitted status transitions. Violations fail loudly
/// in debug builds; release builds trust their callers.
pub fn transition_permitted(from: ThreadStatus, to: ThreadStatus) -> bool {
    VALID_TRANSITIONS
        .get(&from)
        .map_or(false, |targets| targets.contains(&to))
}

/// A logical Java thread: a stack of heterogeneous frames plus the
/// lifecycle state observed by the scheduler and by Java code.
pub struct JavaThread {
    self_ref: Weak<JavaThread>,
    status: Cell<ThreadStatus>,
    stack: RefCell<Vec<Rc<Frame>>>,
    interrupted: Cell<bool>,
    // Bootup threads the runtime must never terminate
    immortal: Cell<bool>,
    monitor_block: RefCell<Option<Rc<dyn Monitor>>>,
    java_object: ObjectHandle,
    pool: Weak<ThreadPool>,
    bs_class_loader: Rc<dyn ClassLoader>,
}

impl JavaThread {
    pub(crate) fn new(pool: &Rc<ThreadPool>, java_object: ObjectHandle) -> Rc<Self> {
        let thread = Rc::new_cyclic(|self_ref| JavaThread {
            self_ref: self_ref.clone(),
            status: Cell::new(ThreadStatus::New),
            stack: RefCell::new(Vec::new()),
            interrupted: Cell::new(false),
            immortal: Cell::new(false),
            monitor_block: RefCell::new(None),
            java_object,
            pool: Rc::downgrade(pool),
            bs_class_loader: pool.class_loader(),
        });

        pool.objects()
            .write_thread_status(java_object, ThreadStatus::New.jvmti_state().bits());
        thread
    }

    fn handle(&self) -> Rc<JavaThread> {
        self.self_ref.upgrade().expect("Thread accessed during teardown")
    }

    pub fn pool(&self) -> Rc<ThreadPool> {
        self.pool.upgrade().expect("Thread outlived its pool")
    }

    pub fn java_object(&self) -> ObjectHandle {
        self.java_object
    }

    pub fn bs_class_loader(&self) -> Rc<dyn ClassLoader> {
        self.bs_class_loader.clone()
    }

    pub fn status(&self) -> ThreadStatus {
        self.status.get()
    }

    pub fn is_interrupted(&self) -> bool {
        self.interrupted.get()
    }

    pub fn set_interrupted(&self, interrupted: bool) {
        self.interrupted.set(interrupted);
    }

    pub fn check_and_clear_interrupted(&self) -> bool {
        self.interrupted.replace(false)
    }

    pub fn is_immortal(&self) -> bool {
        self.immortal.get()
    }

    pub fn set_immortal(&self, immortal: bool) {
        self.immortal.set(immortal);
    }

    /// The monitor this thread is blocked on, while in a blocked state.
    pub fn monitor_block(&self) -> Option<Rc<dyn Monitor>> {
        self.monitor_block.borrow().clone()
    }

    pub fn push_frame(&self, frame: Frame) {
        self.stack.borrow_mut().push(Rc::new(frame));
    }

    pub(crate) fn pop_frame(&self) -> Option<Rc<Frame>> {
        self.stack.borrow_mut().pop()
    }

    pub fn top_frame(&self) -> Option<Rc<Frame>> {
        self.stack.borrow().last().cloned()
    }

    pub fn call_stack_depth(&self) -> usize {
        self.stack.borrow().len()
    }

    /// Java-visible trace, top of stack last. Internal frames are absent.
    pub fn stack_trace(&self) -> Vec<StackTraceFrame> {
        self.stack
            .borrow()
            .iter()
            .filter_map(|frame| frame.stack_trace_frame())
            .collect()
    }

    pub fn set_status(&self, status: ThreadStatus) {
        self.transition(status, None);
    }

    /// Transition into a blocked state, recording the monitor responsible.
    pub fn set_status_blocked(&self, status: ThreadStatus, monitor: Rc<dyn Monitor>) {
        self.transition(status, Some(monitor));
    }

    fn transition(&self, new_status: ThreadStatus, monitor: Option<Rc<dyn Monitor>>) {
        let old = self.status.get();
        if old == new_status {
            return;
        }
        if new_status == ThreadStatus::Terminated && self.immortal.get() {
            trace!(
                "Dropping TERMINATED request for immortal thread {:?}",
                self.java_object
            );
            return;
        }
        // A RUNNING thread asked to become RUNNABLE simply keeps running
        if old == ThreadStatus::Running && new_status == ThreadStatus::Runnable {
            return;
        }

        #[cfg(any(test, debug_assertions, feature = "debug"))]
        assert!(
            transition_permitted(old, new_status),
            "Invalid thread status transition {:?} -> {:?}",
            old,
            new_status
        );

        trace!(
            "Thread {:?}: {:?} -> {:?}",
            self.java_object,
            old,
            new_status
        );
        self.status.set(new_status);

        if new_status.blocks_on_monitor() {
            debug_assert!(
                monitor.is_some(),
                "Transition to {:?} requires the blocking monitor",
                new_status
            );
            *self.monitor_block.borrow_mut() = monitor;
        } else {
            self.monitor_block.borrow_mut().take();
        }

        let pool = self.pool();
        pool.objects()
            .write_thread_status(self.java_object, new_status.jvmti_state().bits());

        let this = self.handle();
        match new_status {
            ThreadStatus::Runnable => {
                if old == ThreadStatus::Terminated {
                    pool.thread_resurrected(&this);
                }
                pool.thread_runnable(&this);
            }
            ThreadStatus::Running => {
                debug_assert!(
                    pool.running_thread().map_or(false, |t| Rc::ptr_eq(&t, &this)),
                    "RUNNING thread is not the pool's running thread"
                );
                self.exec();
            }
            ThreadStatus::Terminated => {
                debug_assert!(
                    self.stack.borrow().is_empty(),
                    "Thread terminated with frames on its stack"
                );
                info!("Thread {:?} exited", self.java_object);
                pool.thread_terminated(&this);
            }
            _ => {
                if old == ThreadStatus::Terminated {
                    pool.thread_resurrected(&this);
                }
                if old == ThreadStatus::Running {
                    pool.thread_suspended(&this);
                }
            }
        }
    }

    /// The execution loop, entered when the scheduler moves this thread
    /// into `RUNNING`. Runs top frames until the thread suspends or its
    /// stack empties, yielding to the host once the adaptive resume budget
    /// is spent.
    fn exec(&self) {
        let pool = self.pool();
        let this = self.handle();
        let mut resumes_left = pool.method_resume_budget();
        let start = Instant::now();

        while self.status.get() == ThreadStatus::Running && !self.stack.borrow().is_empty() {
            let top = self.stack.borrow().last().cloned().unwrap();
            top.run(&this);

            resumes_left -= 1;
            if resumes_left == 0 {
                pool.adapt_resume_budget(start.elapsed());
                if self.status.get() == ThreadStatus::Running {
                    // Yield so the host can service timers and I/O
                    self.set_status(ThreadStatus::AsyncWaiting);
                    let thread = self.self_ref.clone();
                    pool.host().defer(Box::new(move || {
                        if let Some(thread) = thread.upgrade() {
                            if thread.status() == ThreadStatus::AsyncWaiting {
                                thread.set_status(ThreadStatus::Runnable);
                            }
                        }
                    }));
                }
            }
        }

        // A suspended thread keeps its frames; an emptied stack while still
        // RUNNING means the thread finished its work.
        if self.status.get() == ThreadStatus::Running && self.stack.borrow().is_empty() {
            self.set_status(ThreadStatus::Terminated);
        }
    }

    /// Complete the topmost invocation with `rv` (and `rv2` for two-slot
    /// values). The caller frame, if any, absorbs the value and advances
    /// past its call site.
    pub fn async_return(&self, rv: Option<JavaValue>, rv2: Option<JavaValue>) {
        #[cfg(any(test, debug_assertions, feature = "debug"))]
        {
            let status = self.status.get();
            assert!(
                matches!(
                    status,
                    ThreadStatus::Running | ThreadStatus::Runnable | ThreadStatus::AsyncWaiting
                ),
                "async_return from {:?}",
                status
            );
        }

        let frame = self
            .stack
            .borrow_mut()
            .pop()
            .expect("async_return on an empty call stack");

        #[cfg(any(test, debug_assertions, feature = "debug"))]
        if let Some(method) = frame.method() {
            validate_return_value(method, &rv, &rv2);
        }
        let _ = frame;

        if let Some(caller) = self.top_frame() {
            caller.schedule_resume(&self.handle(), rv, rv2);
        }
        self.set_status(ThreadStatus::Runnable);
    }

    /// Unwind `exception` through the stack until a frame handles it. An
    /// emptied stack dispatches the exception as uncaught on the Java
    /// thread object.
    pub fn throw_exception(&self, exception: ObjectHandle) {
        #[cfg(any(test, debug_assertions, feature = "debug"))]
        {
            let status = self.status.get();
            assert!(
                matches!(
                    status,
                    ThreadStatus::Running | ThreadStatus::Runnable | ThreadStatus::AsyncWaiting
                ),
                "throw_exception from {:?}",
                status
            );
        }

        debug!(
            "Throwing {:?} on thread {:?}",
            exception, self.java_object
        );

        // An internal frame cannot handle a throw from its own execution
        if self
            .top_frame()
            .map_or(false, |frame| frame.kind() == FrameKind::Internal)
        {
            self.pop_frame();
        }

        // Handlers may themselves be asynchronous
        self.set_status(ThreadStatus::Runnable);

        let this = self.handle();
        loop {
            match self.top_frame() {
                None => {
                    warn!(
                        "Uncaught exception {:?} on thread {:?}",
                        exception, self.java_object
                    );
                    self.pool().objects().dispatch_uncaught(&this, exception);
                    break;
                }
                Some(frame) => {
                    if frame.schedule_exception(&this, exception) {
                        break;
                    }
                    self.pop_frame();
                }
            }
        }
    }

    /// Run a Java method on this thread, invoking `on_done` once it
    /// completes or unwinds. The primitive behind exception construction
    /// and shutdown hooks.
    pub fn run_method(
        &self,
        method: &Rc<MethodInfo>,
        args: Vec<JavaValue>,
        on_done: InternalCallback,
    ) {
        self.push_frame(Frame::Internal(InternalFrame::new(on_done)));
        self.push_frame(Frame::for_method(method.clone(), args));
        self.set_status(ThreadStatus::Runnable);
    }

    /// Construct and throw `class_name` with a `(String)` constructor,
    /// initializing the class first when necessary.
    pub fn throw_new_exception(&self, class_name: &str, message: &str) {
        let loader = self.bs_class_loader();
        let this = self.handle();

        match loader.get_initialized_class(&this, class_name) {
            Some(class) => self.construct_and_throw(&class, message),
            None => {
                self.set_status(ThreadStatus::AsyncWaiting);
                let message = message.to_string();
                loader.initialize_class(
                    &this,
                    class_name,
                    Box::new(move |thread, result| match result {
                        Ok(class) => thread.construct_and_throw(&class, &message),
                        Err(exception) => thread.throw_exception(exception),
                    }),
                    true,
                );
            }
        }
    }

    fn construct_and_throw(&self, class: &Rc<dyn JavaClass>, message: &str) {
        let pool = self.pool();
        let exception = pool.objects().allocate(class);

        match class.lookup_method("<init>", "(Ljava/lang/String;)V") {
            Some(constructor) => {
                let receiver = JavaValue::Reference(Some(exception));
                let text = JavaValue::Reference(Some(pool.objects().intern_string(message)));
                self.run_method(
                    &constructor,
                    vec![receiver, text],
                    Box::new(move |thread, result| match result {
                        // A throwing constructor replaces the original
                        Err(inner) => thread.throw_exception(inner),
                        Ok(_) => thread.throw_exception(exception),
                    }),
                );
            }
            None => {
                warn!(
                    "{} has no (String) constructor; throwing without a message",
                    class.name()
                );
                self.throw_exception(exception);
            }
        }
    }
}

impl std::fmt::Debug for JavaThread {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "JavaThread({:?}, {:?}, {} frames)",
            self.java_object,
            self.status.get(),
            self.stack.borrow().len()
        )
    }
}

#[cfg(any(test, debug_assertions, feature = "debug"))]
fn validate_return_value(
    method: &Rc<MethodInfo>,
    rv: &Option<JavaValue>,
    rv2: &Option<JavaValue>,
) {
    match method.return_type() {
        FieldDescriptor::Void => assert!(
            rv.is_none() && rv2.is_none(),
            "Void method {:?} returned {:?}",
            method,
            rv
        ),
        ret @ FieldDescriptor::Long | ret @ FieldDescriptor::Double => assert!(
            rv.map_or(false, |v| ret.matches(&v)) && rv2.is_some(),
            "Invalid two-slot return from {:?}: {:?}/{:?}",
            method,
            rv,
            rv2
        ),
        ret => assert!(
            rv.map_or(false, |v| ret.matches(&v)),
            "Invalid return value for {:?}: {:?}",
            method,
            rv
        ),
    }
}
