use std::cell::RefCell;
use std::rc::Rc;

use crate::jvm::mem::{JavaValue, ObjectHandle};
use crate::jvm::thread::{JavaThread, ThreadStatus};

/// Continuation invoked when the Java invocation above an internal frame
/// finishes, with either its return value pair or the throwable that
/// unwound into the frame.
pub type InternalCallback =
    Box<dyn FnOnce(&Rc<JavaThread>, Result<(Option<JavaValue>, Option<JavaValue>), ObjectHandle>)>;

enum Completion {
    Return(Option<JavaValue>, Option<JavaValue>),
    Exception(ObjectHandle),
}

/// A synthetic frame that re-enters the embedding runtime when a Java call
/// completes. Never visible in stack traces, and unable to handle an
/// exception thrown during its own execution — the unwinder pops a topmost
/// internal frame before dispatching.
pub struct InternalFrame {
    callback: RefCell<Option<InternalCallback>>,
    completion: RefCell<Completion>,
}

impl InternalFrame {
    pub fn new(callback: InternalCallback) -> Self {
        InternalFrame {
            callback: RefCell::new(Some(callback)),
            completion: RefCell::new(Completion::Return(None, None)),
        }
    }

    pub(crate) fn run(&self, thread: &Rc<JavaThread>) {
        let callback = self
            .callback
            .borrow_mut()
            .take()
            .expect("Internal frame ran twice");
        let completion = std::mem::replace(
            &mut *self.completion.borrow_mut(),
            Completion::Return(None, None),
        );

        // This frame is on top by construction; remove it before
        // re-entering host code so the callback sees a consistent stack.
        let popped = thread.pop_frame();
        debug_assert!(
            matches!(popped.as_deref(), Some(crate::jvm::call::Frame::Internal(_))),
            "Internal frame ran while not on top of the stack"
        );

        thread.set_status(ThreadStatus::AsyncWaiting);
        match completion {
            Completion::Return(rv, rv2) => callback(thread, Ok((rv, rv2))),
            Completion::Exception(exception) => callback(thread, Err(exception)),
        }
    }

    pub(crate) fn schedule_resume(&self, rv: Option<JavaValue>, rv2: Option<JavaValue>) {
        *self.completion.borrow_mut() = Completion::Return(rv, rv2);
    }

    pub(crate) fn schedule_exception(&self, exception: ObjectHandle) -> bool {
        *self.completion.borrow_mut() = Completion::Exception(exception);
        true
    }
}
