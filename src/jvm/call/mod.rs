//! Call-stack frames. Three disjoint frame shapes share one contract —
//! `run`, `schedule_resume`, `schedule_exception`, and a stack-trace
//! projection — dispatched through a single sum type so a thread's stack is
//! a plain `Vec` of uniform entries.
//!
//! Calling convention: a callee's completed invocation advances the caller
//! past the invoke opcode and leaves the returned value on the caller's
//! operand stack. Two-slot (`long`/`double`) values occupy two stack slots
//! holding the same value.

mod internal;
mod interpreter;
mod native;

use std::fmt::{self, Debug, Formatter};
use std::rc::Rc;

use crate::class::MethodInfo;
use crate::jvm::mem::JavaValue;
use crate::jvm::thread::JavaThread;

pub use internal::{InternalCallback, InternalFrame};
pub use interpreter::BytecodeFrame;
pub use native::{NativeFrame, NativeMethod};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameKind {
    Bytecode,
    Native,
    Internal,
}

pub enum Frame {
    Bytecode(BytecodeFrame),
    Native(NativeFrame),
    Internal(InternalFrame),
}

impl Frame {
    /// Build the frame appropriate for a method: native methods get a
    /// native frame, everything else a bytecode frame.
    pub fn for_method(method: Rc<MethodInfo>, args: Vec<JavaValue>) -> Self {
        if method.access.contains(crate::class::AccessFlags::NATIVE) {
            Frame::Native(NativeFrame::new(method, args))
        } else {
            Frame::Bytecode(BytecodeFrame::new(method, args))
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Bytecode(_) => FrameKind::Bytecode,
            Frame::Native(_) => FrameKind::Native,
            Frame::Internal(_) => FrameKind::Internal,
        }
    }

    /// The method this frame executes; internal frames have none.
    pub fn method(&self) -> Option<&Rc<MethodInfo>> {
        match self {
            Frame::Bytecode(frame) => Some(frame.method()),
            Frame::Native(frame) => Some(frame.method()),
            Frame::Internal(_) => None,
        }
    }

    pub fn expect_bytecode(&self) -> &BytecodeFrame {
        match self {
            Frame::Bytecode(frame) => frame,
            x => panic!("Expected bytecode frame, found {:?} frame", x.kind()),
        }
    }

    /// Execute until this frame pushes further work, completes, or parks
    /// the thread by moving its status away from `RUNNING`.
    pub fn run(&self, thread: &Rc<JavaThread>) {
        match self {
            Frame::Bytecode(frame) => frame.run(thread),
            Frame::Native(frame) => frame.run(thread),
            Frame::Internal(frame) => frame.run(thread),
        }
    }

    /// A callee directly above this frame completed normally; absorb its
    /// return value and advance past the call site.
    pub fn schedule_resume(
        &self,
        thread: &Rc<JavaThread>,
        rv: Option<JavaValue>,
        rv2: Option<JavaValue>,
    ) {
        match self {
            Frame::Bytecode(frame) => frame.schedule_resume(thread, rv, rv2),
            Frame::Native(_) => {}
            Frame::Internal(frame) => frame.schedule_resume(rv, rv2),
        }
    }

    /// Offer an in-flight exception to this frame. `true` means the frame
    /// handles it (possibly after asynchronous work) and unwinding stops;
    /// `false` pops the frame.
    pub fn schedule_exception(&self, thread: &Rc<JavaThread>, exception: crate::jvm::mem::ObjectHandle) -> bool {
        match self {
            Frame::Bytecode(frame) => frame.schedule_exception(thread, exception),
            Frame::Native(_) => false,
            Frame::Internal(frame) => frame.schedule_exception(exception),
        }
    }

    /// Java-visible projection; `None` hides the frame from traces.
    pub fn stack_trace_frame(&self) -> Option<StackTraceFrame> {
        match self {
            Frame::Bytecode(frame) => Some(frame.stack_trace_frame()),
            Frame::Native(frame) => Some(frame.stack_trace_frame()),
            Frame::Internal(_) => None,
        }
    }
}

impl Debug for Frame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Frame::Bytecode(frame) => write!(f, "Bytecode({:?} @ {})", frame.method(), frame.pc()),
            Frame::Native(frame) => write!(f, "Native({:?})", frame.method()),
            Frame::Internal(_) => write!(f, "Internal"),
        }
    }
}

/// One Java-visible stack trace entry. Native frames report `pc == -1`.
pub struct StackTraceFrame {
    pub method: Rc<MethodInfo>,
    pub pc: i32,
    pub stack: Vec<JavaValue>,
    pub locals: Vec<JavaValue>,
}

impl StackTraceFrame {
    pub fn line_number(&self) -> Option<u16> {
        if self.pc < 0 {
            return None;
        }
        self.method.line_number_at(self.pc as u32)
    }
}

impl Debug for StackTraceFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let source = self
            .method
            .code
            .as_ref()
            .and_then(|code| code.source_file.as_deref());

        write!(f, "at {}.{}", self.method.class_name, self.method.name)?;
        match (source, self.line_number()) {
            _ if self.pc < 0 => write!(f, "(Native Method)"),
            (Some(file), Some(line)) => write!(f, "({}:{})", file, line),
            (Some(file), None) => write!(f, "({})", file),
            _ => write!(f, "(pc {})", self.pc),
        }
    }
}
