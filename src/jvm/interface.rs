//! Interfaces to the collaborators the execution core drives but does not
//! own: class resolution, monitors, the object model, the embedding JVM,
//! and the host event loop. Asynchronous operations complete through boxed
//! continuations and move threads across `ASYNC_WAITING ↔ RUNNABLE`.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::Rc;
use std::sync::Arc;

use crate::class::MethodInfo;
use crate::jvm::mem::ObjectHandle;
use crate::jvm::thread::JavaThread;

/// Completion of an asynchronous multi-class resolution request. `true`
/// means every requested class resolved.
pub type ResolveCallback = Box<dyn FnOnce(&Rc<JavaThread>, bool)>;

/// Completion of asynchronous class initialization: the initialized class,
/// or the throwable produced by its static initializer.
pub type InitializeCallback =
    Box<dyn FnOnce(&Rc<JavaThread>, Result<Rc<dyn JavaClass>, ObjectHandle>)>;

/// Invoked by a monitor once a previously blocked thread owns the lock.
pub type AcquireCallback = Box<dyn FnOnce(&Rc<JavaThread>)>;

pub trait ClassLoader {
    /// Synchronous lookup; `None` when this loader has not resolved the
    /// class yet.
    fn get_resolved_class(&self, name: &str) -> Option<Rc<dyn JavaClass>>;

    fn get_initialized_class(
        &self,
        thread: &Rc<JavaThread>,
        name: &str,
    ) -> Option<Rc<dyn JavaClass>>;

    /// Resolve every named class, then report overall success. The loader
    /// owns driving the thread through `ASYNC_WAITING` while it works.
    fn resolve_classes(&self, thread: &Rc<JavaThread>, names: &[Arc<str>], done: ResolveCallback);

    fn initialize_class(
        &self,
        thread: &Rc<JavaThread>,
        name: &str,
        done: InitializeCallback,
        init_static: bool,
    );
}

/// A resolved class as seen by the core: enough surface for catch-type
/// matching, constructor lookup, and static method locks.
pub trait JavaClass {
    fn name(&self) -> &str;

    /// Assignment compatibility: would a value of class `other` be accepted
    /// where `self` is declared?
    fn is_assignable_from(&self, other: &dyn JavaClass) -> bool;

    fn lookup_method(&self, name: &str, descriptor: &str) -> Option<Rc<MethodInfo>>;

    /// The `java/lang/Class` instance backing this class.
    fn class_object(&self) -> ObjectHandle;
}

/// An object's intrinsic monitor. Entry either succeeds immediately
/// (`true`) or blocks the thread and arranges `on_acquire` for later
/// (`false`).
pub trait Monitor {
    fn enter(&self, thread: &Rc<JavaThread>, on_acquire: AcquireCallback) -> bool;
    fn exit(&self, thread: &Rc<JavaThread>);
    fn notify_all(&self, thread: &Rc<JavaThread>);

    fn is_waiting(&self, thread: &JavaThread) -> bool;
    fn is_timed_waiting(&self, thread: &JavaThread) -> bool;
    fn is_blocked(&self, thread: &JavaThread) -> bool;
}

/// Bridge to the heap and the `java/lang/Thread` object model.
pub trait ObjectModel {
    fn class_of(&self, obj: ObjectHandle) -> Rc<dyn JavaClass>;
    fn monitor_of(&self, obj: ObjectHandle) -> Rc<dyn Monitor>;
    fn allocate(&self, class: &Rc<dyn JavaClass>) -> ObjectHandle;
    fn intern_string(&self, value: &str) -> ObjectHandle;

    /// Mirror the JVMTI projection of a thread's status into the
    /// `java/lang/Thread.threadStatus` field.
    fn write_thread_status(&self, thread_obj: ObjectHandle, status: i32);

    fn is_daemon(&self, thread_obj: ObjectHandle) -> bool;

    /// Invoke `Thread.dispatchUncaughtException` on the thread's Java
    /// object.
    fn dispatch_uncaught(&self, thread: &Rc<JavaThread>, exception: ObjectHandle);
}

/// The embedding JVM, consulted when the pool runs out of non-daemon
/// threads.
pub trait Jvm {
    /// Run `java/lang/System.exit(0)` on the identity of the exiting
    /// thread, co-opting it for shutdown hooks.
    fn initiate_shutdown(&self, thread: &Rc<JavaThread>);
}

/// The host event loop. Every scheduling decision crosses this boundary so
/// the host can service timers and I/O, and so scheduler recursion cannot
/// grow the native stack.
pub trait Host {
    fn defer(&self, task: Box<dyn FnOnce()>);
}

/// Single-threaded FIFO reactor: the default `Host` for embedders whose
/// environment does not supply one, and for tests.
#[derive(Default)]
pub struct TaskQueue {
    tasks: RefCell<VecDeque<Box<dyn FnOnce()>>>,
}

impl TaskQueue {
    pub fn new() -> Rc<Self> {
        Rc::new(TaskQueue::default())
    }

    pub fn is_idle(&self) -> bool {
        self.tasks.borrow().is_empty()
    }

    /// Run a single queued task. Returns `false` when the queue was empty.
    pub fn run_once(&self) -> bool {
        let task = self.tasks.borrow_mut().pop_front();
        match task {
            Some(task) => {
                task();
                true
            }
            None => false,
        }
    }

    /// Pump the queue until no task remains. Tasks may enqueue more tasks.
    pub fn run_until_idle(&self) {
        while self.run_once() {}
    }
}

impl Host for TaskQueue {
    fn defer(&self, task: Box<dyn FnOnce()>) {
        self.tasks.borrow_mut().push_back(task);
    }
}
