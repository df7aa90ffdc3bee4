use std::rc::Rc;
use std::time::Duration;

use crate::instruction::OpcodeTable;
use crate::jvm::interface::{ClassLoader, Host, Jvm, ObjectModel};

pub mod call;
pub mod interface;
pub mod mem;
pub mod pool;
pub mod thread;

/// The collaborators a thread pool executes against. Everything here is
/// owned by the embedding JVM and outlives the pool.
pub struct JavaEnv {
    pub class_loader: Rc<dyn ClassLoader>,
    pub objects: Rc<dyn ObjectModel>,
    pub host: Rc<dyn Host>,
    pub jvm: Rc<dyn Jvm>,
    pub opcodes: Rc<OpcodeTable>,
}

/// Tunables for the cooperative scheduler. The resume budget adapts toward
/// the responsiveness target at runtime; these only set the starting point.
#[derive(Copy, Clone, Debug)]
pub struct SchedulerOptions {
    /// Wall-clock target for one uninterrupted run before yielding back to
    /// the host event loop.
    pub responsiveness: Duration,
    /// Initial value of the per-pool `max_method_resumes` budget.
    pub initial_method_resumes: u32,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        SchedulerOptions {
            responsiveness: Duration::from_millis(1000),
            initial_method_resumes: 10_000,
        }
    }
}
