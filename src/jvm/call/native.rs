use std::cell::RefCell;
use std::rc::Rc;

use crate::class::MethodInfo;
use crate::jvm::call::StackTraceFrame;
use crate::jvm::mem::{FieldDescriptor, JavaValue};
use crate::jvm::thread::{JavaThread, ThreadStatus};

/// A host function exposed as a Java method. Returns its value directly for
/// synchronous completion, or `None` after arranging `thread.async_return`
/// (having first moved the thread to `ASYNC_WAITING`).
pub type NativeMethod = Rc<dyn Fn(&Rc<JavaThread>, Vec<JavaValue>) -> Option<JavaValue>>;

/// A frame wrapping a native method invocation. Runs exactly once.
pub struct NativeFrame {
    method: Rc<MethodInfo>,
    args: RefCell<Option<Vec<JavaValue>>>,
}

impl NativeFrame {
    pub fn new(method: Rc<MethodInfo>, args: Vec<JavaValue>) -> Self {
        NativeFrame {
            method,
            args: RefCell::new(Some(args)),
        }
    }

    pub fn method(&self) -> &Rc<MethodInfo> {
        &self.method
    }

    pub(crate) fn run(&self, thread: &Rc<JavaThread>) {
        let native = match self.method.native_fn() {
            Some(native) => native,
            None => {
                let signature = self.method.full_signature();
                warn!("Native method {} is not implemented", signature);
                thread.throw_new_exception("java/lang/UnsatisfiedLinkError", &signature);
                return;
            }
        };

        let args = self
            .args
            .borrow_mut()
            .take()
            .expect("Native frame ran twice");
        trace!("Invoking native {:?}", self.method);
        let rv = native(thread, self.method.convert_args(&args));

        // Still running with this method on top means the native returned
        // synchronously; deliver its value to the caller. Anything else was
        // an asynchronous suspension and async_return arrives later.
        let synchronous = thread.status() == ThreadStatus::Running
            && thread
                .top_frame()
                .and_then(|top| top.method().cloned())
                .map_or(false, |m| Rc::ptr_eq(&m, &self.method));

        if synchronous {
            match self.method.return_type() {
                FieldDescriptor::Long | FieldDescriptor::Double => thread.async_return(rv, rv),
                FieldDescriptor::Boolean => thread.async_return(coerce_boolean(rv), None),
                _ => thread.async_return(rv, None),
            }
        }
    }

    pub(crate) fn stack_trace_frame(&self) -> StackTraceFrame {
        StackTraceFrame {
            method: self.method.clone(),
            pc: -1,
            stack: Vec::new(),
            locals: Vec::new(),
        }
    }
}

fn coerce_boolean(rv: Option<JavaValue>) -> Option<JavaValue> {
    match rv {
        Some(JavaValue::Int(x)) => Some(JavaValue::Int((x != 0) as i32)),
        Some(JavaValue::Byte(x)) => Some(JavaValue::Int((x != 0) as i32)),
        x => x,
    }
}
