use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::Arc;

use crate::class::{AccessFlags, MethodInfo};
use crate::instruction::Opcode;
use crate::jvm::call::StackTraceFrame;
use crate::jvm::mem::{verify_computational_types, JavaValue};
use crate::jvm::thread::{JavaThread, ThreadStatus};

/// A frame executing JVM bytecode. Fields sit behind `Cell`/`RefCell` so
/// opcode handlers and monitor callbacks can reach back through the owning
/// thread without aliasing the frame.
pub struct BytecodeFrame {
    method: Rc<MethodInfo>,
    pc: Cell<u32>,
    stack: RefCell<Vec<JavaValue>>,
    locals: RefCell<Vec<JavaValue>>,
    // Set by opcodes that suspend, invoke, or throw; cleared on entry to run
    return_to_thread_loop: Cell<bool>,
    // Shared with the method-lock acquire callback for deferred entry
    locked_method_lock: Rc<Cell<bool>>,
}

impl BytecodeFrame {
    pub fn new(method: Rc<MethodInfo>, mut args: Vec<JavaValue>) -> Self {
        let code = method.expect_code();
        debug_assert!(
            verify_computational_types(&args),
            "Malformed argument vector for {:?}",
            method
        );

        let max_locals = code.max_locals as usize;
        let max_stack = code.max_stack as usize;
        if max_locals > args.len() {
            args.extend(vec![JavaValue::Int(0); max_locals - args.len()]);
        }

        BytecodeFrame {
            method,
            pc: Cell::new(0),
            stack: RefCell::new(Vec::with_capacity(max_stack)),
            locals: RefCell::new(args),
            return_to_thread_loop: Cell::new(false),
            locked_method_lock: Rc::new(Cell::new(false)),
        }
    }

    pub fn method(&self) -> &Rc<MethodInfo> {
        &self.method
    }

    pub fn pc(&self) -> u32 {
        self.pc.get()
    }

    pub fn set_pc(&self, pc: u32) {
        self.pc.set(pc);
    }

    /// Relative branch from the current instruction.
    pub fn offset_pc(&self, offset: i32) {
        self.pc.set((self.pc.get() as i64 + offset as i64) as u32);
    }

    pub fn push(&self, value: JavaValue) {
        self.stack.borrow_mut().push(value);
    }

    pub fn pop(&self) -> JavaValue {
        match self.stack.borrow_mut().pop() {
            Some(value) => value,
            None => panic!("Stack Frame Lower Bounds Violated"),
        }
    }

    pub fn stack_depth(&self) -> usize {
        self.stack.borrow().len()
    }

    pub fn local(&self, index: usize) -> JavaValue {
        self.locals.borrow()[index]
    }

    pub fn set_local(&self, index: usize, value: JavaValue) {
        self.locals.borrow_mut()[index] = value;
    }

    pub fn return_to_thread_loop(&self) -> bool {
        self.return_to_thread_loop.get()
    }

    pub fn set_return_to_thread_loop(&self, flag: bool) {
        self.return_to_thread_loop.set(flag);
    }

    pub fn locked_method_lock(&self) -> bool {
        self.locked_method_lock.get()
    }

    pub(crate) fn run(&self, thread: &Rc<JavaThread>) {
        let method = self.method.clone();
        let code = method.expect_code();

        if self.pc.get() == 0
            && method.access.contains(AccessFlags::SYNCHRONIZED)
            && !self.locked_method_lock.get()
        {
            // Mark the lock held from the acquire callback as well: when
            // entry blocks, the callback runs before this frame is re-run,
            // and the re-run must not attempt a second entry.
            let lock_flag = self.locked_method_lock.clone();
            let acquired = method
                .method_lock(thread, self)
                .enter(thread, Box::new(move |_| lock_flag.set(true)));
            self.locked_method_lock.set(acquired);
            if !acquired {
                // Thread is now BLOCKED on the method lock
                return;
            }
        }

        self.return_to_thread_loop.set(false);
        let opcodes = thread.pool().opcodes();

        while !self.return_to_thread_loop.get() {
            let pc = self.pc.get();
            trace!(
                "\t{}:\t{:?}",
                pc,
                Opcode::from_byte(code.code[pc as usize])
            );
            opcodes.dispatch(thread, self, &code.code, pc);
        }
    }

    /// The callee above this frame returned: step past the invoke opcode
    /// and push its value. Interface invokes carry count and pad bytes;
    /// every other invoke is three bytes wide.
    pub(crate) fn schedule_resume(
        &self,
        _thread: &Rc<JavaThread>,
        rv: Option<JavaValue>,
        rv2: Option<JavaValue>,
    ) {
        let pc = self.pc.get();
        let op = Opcode::from_byte(self.method.expect_code().code[pc as usize]);
        let width = op.and_then(Opcode::invoke_width);

        #[cfg(any(test, debug_assertions, feature = "debug"))]
        assert!(
            width.is_some(),
            "Resumed {:?} at pc {} on non-invoke opcode {:?}",
            self.method,
            pc,
            op
        );

        self.pc.set(pc + width.unwrap_or(3));

        let mut stack = self.stack.borrow_mut();
        if let Some(rv) = rv {
            stack.push(rv);
        }
        if let Some(rv2) = rv2 {
            stack.push(rv2);
        }
    }

    pub(crate) fn schedule_exception(
        &self,
        thread: &Rc<JavaThread>,
        exception: crate::jvm::mem::ObjectHandle,
    ) -> bool {
        let method = self.method.clone();
        let code = method.expect_code();
        let pc = self.pc.get();
        let loader = method.loader(thread);
        let exception_class = thread.pool().objects().class_of(exception);

        let mut handler = None;
        for range in &code.exception_table {
            if !range.contains(pc) {
                continue;
            }

            match &range.catch_type {
                // The universal marker matches anything
                None => {
                    handler = Some(range);
                    break;
                }
                Some(name) => {
                    if method.catch_resolution_failed(name) {
                        continue;
                    }

                    match loader.get_resolved_class(name) {
                        Some(catch_class) => {
                            if catch_class.is_assignable_from(&*exception_class) {
                                handler = Some(range);
                                break;
                            }
                        }
                        None => {
                            // Handler class not yet resolved: resolve every
                            // outstanding catch type in this table, then
                            // re-throw so dispatch restarts from scratch.
                            let unresolved: Vec<Arc<str>> = code
                                .exception_table
                                .iter()
                                .filter_map(|r| r.catch_type.clone())
                                .filter(|n| {
                                    !method.catch_resolution_failed(n)
                                        && loader.get_resolved_class(n).is_none()
                                })
                                .collect();

                            debug!(
                                "Suspending exception dispatch in {:?} to resolve {} catch types",
                                method,
                                unresolved.len()
                            );
                            thread.set_status(ThreadStatus::AsyncWaiting);

                            let requested = unresolved.clone();
                            let method = method.clone();
                            loader.resolve_classes(
                                thread,
                                &unresolved,
                                Box::new(move |thread, ok| {
                                    if !ok {
                                        // Remember the failures so dispatch
                                        // cannot loop on a broken handler
                                        method.mark_failed_catches(requested);
                                    }
                                    thread.throw_exception(exception);
                                }),
                            );
                            return true;
                        }
                    }
                }
            }
        }

        match handler {
            Some(range) => {
                debug!(
                    "Exception caught in {:?}; branching to handler at pc {}",
                    method, range.handler_pc
                );
                let mut stack = self.stack.borrow_mut();
                stack.clear();
                stack.push(JavaValue::Reference(Some(exception)));
                drop(stack);
                self.pc.set(range.handler_pc);
                true
            }
            None => {
                if method.access.contains(AccessFlags::SYNCHRONIZED) {
                    method.method_lock(thread, self).exit(thread);
                }
                false
            }
        }
    }

    pub(crate) fn stack_trace_frame(&self) -> StackTraceFrame {
        StackTraceFrame {
            method: self.method.clone(),
            pc: self.pc.get() as i32,
            stack: self.stack.borrow().clone(),
            locals: self.locals.borrow().clone(),
        }
    }

    pub fn debug_print(&self) {
        debug!("Stack Frame Debug: {:?}", self.method);
        let locals = self.locals.borrow();
        debug!("\tLocal Variables: {}", locals.len());
        for (idx, local) in locals.iter().enumerate() {
            debug!("\t\t{}:\t{:?}", idx, local);
        }

        let stack = self.stack.borrow();
        debug!("\tOperand Stack: {}/{}", stack.len(), stack.capacity());
        for (idx, value) in stack.iter().enumerate() {
            debug!("\t\t{}:\t{:?}", idx, value);
        }
    }
}
