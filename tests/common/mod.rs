//! Mock collaborators for driving the execution core end to end: an
//! in-memory heap and thread-object bridge, a class loader with deferred
//! resolution, a cooperative monitor, and a harness wiring them into a
//! pool with a scripted opcode table.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::{Rc, Weak};
use std::sync::Arc;

use green_jvm::class::{AccessFlags, CodeAttribute, MethodInfo};
use green_jvm::instruction::{Opcode, OpcodeTable};
use green_jvm::jvm::call::Frame;
use green_jvm::jvm::interface::{
    AcquireCallback, ClassLoader, Host, InitializeCallback, JavaClass, Jvm, Monitor, ObjectModel,
    ResolveCallback, TaskQueue,
};
use green_jvm::jvm::mem::{JavaValue, ObjectHandle};
use green_jvm::jvm::pool::ThreadPool;
use green_jvm::jvm::thread::{JavaThread, ThreadStatus};
use green_jvm::jvm::{JavaEnv, SchedulerOptions};

pub struct TestClass {
    name: String,
    class_object: ObjectHandle,
    assignable: RefCell<HashSet<String>>,
    methods: RefCell<HashMap<(String, String), Rc<MethodInfo>>>,
}

impl TestClass {
    pub fn new(name: &str, class_object: ObjectHandle) -> Rc<Self> {
        Rc::new(TestClass {
            name: name.to_string(),
            class_object,
            assignable: RefCell::new(HashSet::new()),
            methods: RefCell::new(HashMap::new()),
        })
    }

    /// Mark instances of `sub` assignable to this class.
    pub fn accept(&self, sub: &str) {
        self.assignable.borrow_mut().insert(sub.to_string());
    }

    pub fn add_method(&self, method: &Rc<MethodInfo>) {
        self.methods.borrow_mut().insert(
            (method.name.to_string(), method.descriptor.to_string()),
            method.clone(),
        );
    }
}

impl JavaClass for TestClass {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_assignable_from(&self, other: &dyn JavaClass) -> bool {
        other.name() == self.name || self.assignable.borrow().contains(other.name())
    }

    fn lookup_method(&self, name: &str, descriptor: &str) -> Option<Rc<MethodInfo>> {
        self.methods
            .borrow()
            .get(&(name.to_string(), descriptor.to_string()))
            .cloned()
    }

    fn class_object(&self) -> ObjectHandle {
        self.class_object
    }
}

#[derive(Default)]
pub struct TestHeap {
    next_id: Cell<u64>,
    classes: RefCell<HashMap<ObjectHandle, Rc<dyn JavaClass>>>,
    monitors: RefCell<HashMap<ObjectHandle, Rc<TestMonitor>>>,
    thread_status: RefCell<HashMap<ObjectHandle, i32>>,
    daemons: RefCell<HashSet<ObjectHandle>>,
    strings: RefCell<HashMap<String, ObjectHandle>>,
    pub uncaught: RefCell<Vec<ObjectHandle>>,
}

impl TestHeap {
    pub fn new() -> Rc<Self> {
        let heap = TestHeap::default();
        heap.next_id.set(1);
        Rc::new(heap)
    }

    fn fresh(&self) -> ObjectHandle {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        ObjectHandle::from_id(id).unwrap()
    }

    pub fn new_class(&self, name: &str) -> Rc<TestClass> {
        TestClass::new(name, self.fresh())
    }

    pub fn new_object(&self, class: &Rc<TestClass>) -> ObjectHandle {
        let obj = self.fresh();
        self.classes
            .borrow_mut()
            .insert(obj, class.clone() as Rc<dyn JavaClass>);
        obj
    }

    pub fn set_daemon(&self, obj: ObjectHandle, daemon: bool) {
        if daemon {
            self.daemons.borrow_mut().insert(obj);
        } else {
            self.daemons.borrow_mut().remove(&obj);
        }
    }

    pub fn thread_status_field(&self, obj: ObjectHandle) -> Option<i32> {
        self.thread_status.borrow().get(&obj).copied()
    }

    pub fn monitor(&self, obj: ObjectHandle) -> Rc<TestMonitor> {
        self.monitors
            .borrow_mut()
            .entry(obj)
            .or_insert_with(TestMonitor::new)
            .clone()
    }
}

impl ObjectModel for TestHeap {
    fn class_of(&self, obj: ObjectHandle) -> Rc<dyn JavaClass> {
        self.classes
            .borrow()
            .get(&obj)
            .cloned()
            .unwrap_or_else(|| panic!("Object {:?} has no class", obj))
    }

    fn monitor_of(&self, obj: ObjectHandle) -> Rc<dyn Monitor> {
        self.monitor(obj) as Rc<dyn Monitor>
    }

    fn allocate(&self, class: &Rc<dyn JavaClass>) -> ObjectHandle {
        let obj = self.fresh();
        self.classes.borrow_mut().insert(obj, class.clone());
        obj
    }

    fn intern_string(&self, value: &str) -> ObjectHandle {
        let mut strings = self.strings.borrow_mut();
        if let Some(existing) = strings.get(value) {
            return *existing;
        }
        let obj = self.fresh();
        strings.insert(value.to_string(), obj);
        obj
    }

    fn write_thread_status(&self, thread_obj: ObjectHandle, status: i32) {
        self.thread_status.borrow_mut().insert(thread_obj, status);
    }

    fn is_daemon(&self, thread_obj: ObjectHandle) -> bool {
        self.daemons.borrow().contains(&thread_obj)
    }

    fn dispatch_uncaught(&self, _thread: &Rc<JavaThread>, exception: ObjectHandle) {
        self.uncaught.borrow_mut().push(exception);
    }
}

/// Cooperative monitor: immediate entry when free or re-entrant, FIFO
/// hand-off on exit.
pub struct TestMonitor {
    self_ref: RefCell<Weak<TestMonitor>>,
    owner: RefCell<Option<(ObjectHandle, u32)>>,
    queue: RefCell<VecDeque<(Rc<JavaThread>, AcquireCallback)>>,
    pub enter_calls: Cell<u32>,
    pub blocked_log: RefCell<Vec<ObjectHandle>>,
}

impl TestMonitor {
    pub fn new() -> Rc<Self> {
        let monitor = Rc::new(TestMonitor {
            self_ref: RefCell::new(Weak::new()),
            owner: RefCell::new(None),
            queue: RefCell::new(VecDeque::new()),
            enter_calls: Cell::new(0),
            blocked_log: RefCell::new(Vec::new()),
        });
        *monitor.self_ref.borrow_mut() = Rc::downgrade(&monitor);
        monitor
    }

    pub fn owner(&self) -> Option<ObjectHandle> {
        self.owner.borrow().map(|(owner, _)| owner)
    }
}

impl Monitor for TestMonitor {
    fn enter(&self, thread: &Rc<JavaThread>, on_acquire: AcquireCallback) -> bool {
        self.enter_calls.set(self.enter_calls.get() + 1);

        let acquired = {
            let mut owner = self.owner.borrow_mut();
            match owner.as_mut() {
                None => {
                    *owner = Some((thread.java_object(), 1));
                    true
                }
                Some((holder, count)) if *holder == thread.java_object() => {
                    *count += 1;
                    true
                }
                Some(_) => false,
            }
        };

        if !acquired {
            self.blocked_log.borrow_mut().push(thread.java_object());
            self.queue.borrow_mut().push_back((thread.clone(), on_acquire));
            let monitor = self.self_ref.borrow().upgrade().unwrap();
            thread.set_status_blocked(ThreadStatus::Blocked, monitor);
        }
        acquired
    }

    fn exit(&self, thread: &Rc<JavaThread>) {
        let released = {
            let mut owner = self.owner.borrow_mut();
            match owner.as_mut() {
                Some((holder, count)) if *holder == thread.java_object() => {
                    *count -= 1;
                    if *count == 0 {
                        *owner = None;
                        true
                    } else {
                        false
                    }
                }
                _ => panic!("Monitor exited by non-owner {:?}", thread),
            }
        };

        if released {
            let next = self.queue.borrow_mut().pop_front();
            if let Some((next, on_acquire)) = next {
                *self.owner.borrow_mut() = Some((next.java_object(), 1));
                on_acquire(&next);
                next.set_status(ThreadStatus::Runnable);
            }
        }
    }

    fn notify_all(&self, _thread: &Rc<JavaThread>) {}

    fn is_waiting(&self, _thread: &JavaThread) -> bool {
        false
    }

    fn is_timed_waiting(&self, _thread: &JavaThread) -> bool {
        false
    }

    fn is_blocked(&self, thread: &JavaThread) -> bool {
        self.queue
            .borrow()
            .iter()
            .any(|(blocked, _)| blocked.java_object() == thread.java_object())
    }
}

pub struct TestLoader {
    self_ref: RefCell<Weak<TestLoader>>,
    host: Rc<TaskQueue>,
    resolved: RefCell<HashMap<String, Rc<TestClass>>>,
    initialized: RefCell<HashSet<String>>,
    lazy: RefCell<HashMap<String, Rc<TestClass>>>,
    init_failures: RefCell<HashMap<String, ObjectHandle>>,
    pub resolve_requests: RefCell<Vec<Vec<String>>>,
}

impl TestLoader {
    pub fn new(host: Rc<TaskQueue>) -> Rc<Self> {
        let loader = Rc::new(TestLoader {
            self_ref: RefCell::new(Weak::new()),
            host,
            resolved: RefCell::new(HashMap::new()),
            initialized: RefCell::new(HashSet::new()),
            lazy: RefCell::new(HashMap::new()),
            init_failures: RefCell::new(HashMap::new()),
            resolve_requests: RefCell::new(Vec::new()),
        });
        *loader.self_ref.borrow_mut() = Rc::downgrade(&loader);
        loader
    }

    /// Resolved and initialized up front.
    pub fn define(&self, class: &Rc<TestClass>) {
        self.resolved
            .borrow_mut()
            .insert(class.name().to_string(), class.clone());
        self.initialized
            .borrow_mut()
            .insert(class.name().to_string());
    }

    /// Only available through asynchronous resolution/initialization.
    pub fn define_lazy(&self, class: &Rc<TestClass>) {
        self.lazy
            .borrow_mut()
            .insert(class.name().to_string(), class.clone());
    }

    pub fn fail_initialization(&self, name: &str, throwable: ObjectHandle) {
        self.init_failures
            .borrow_mut()
            .insert(name.to_string(), throwable);
    }
}

impl ClassLoader for TestLoader {
    fn get_resolved_class(&self, name: &str) -> Option<Rc<dyn JavaClass>> {
        self.resolved
            .borrow()
            .get(name)
            .map(|class| class.clone() as Rc<dyn JavaClass>)
    }

    fn get_initialized_class(
        &self,
        _thread: &Rc<JavaThread>,
        name: &str,
    ) -> Option<Rc<dyn JavaClass>> {
        if self.initialized.borrow().contains(name) {
            self.get_resolved_class(name)
        } else {
            None
        }
    }

    fn resolve_classes(&self, thread: &Rc<JavaThread>, names: &[Arc<str>], done: ResolveCallback) {
        self.resolve_requests
            .borrow_mut()
            .push(names.iter().map(|name| name.to_string()).collect());

        let loader = self.self_ref.borrow().upgrade().unwrap();
        let thread = thread.clone();
        let names: Vec<Arc<str>> = names.to_vec();
        self.host.defer(Box::new(move || {
            let mut ok = true;
            for name in &names {
                let promoted = loader.lazy.borrow_mut().remove(name.as_ref());
                match promoted {
                    Some(class) => {
                        loader.resolved.borrow_mut().insert(name.to_string(), class);
                    }
                    None => {
                        if !loader.resolved.borrow().contains_key(name.as_ref()) {
                            ok = false;
                        }
                    }
                }
            }
            done(&thread, ok);
        }));
    }

    fn initialize_class(
        &self,
        thread: &Rc<JavaThread>,
        name: &str,
        done: InitializeCallback,
        _init_static: bool,
    ) {
        let loader = self.self_ref.borrow().upgrade().unwrap();
        let thread = thread.clone();
        let name = name.to_string();
        self.host.defer(Box::new(move || {
            let failure = loader.init_failures.borrow().get(&name).copied();
            if let Some(throwable) = failure {
                done(&thread, Err(throwable));
                return;
            }

            let class = loader
                .lazy
                .borrow_mut()
                .remove(&name)
                .or_else(|| loader.resolved.borrow().get(&name).cloned());
            match class {
                Some(class) => {
                    loader
                        .resolved
                        .borrow_mut()
                        .insert(name.clone(), class.clone());
                    loader.initialized.borrow_mut().insert(name.clone());
                    done(&thread, Ok(class as Rc<dyn JavaClass>));
                }
                None => panic!("TestLoader cannot initialize unknown class {}", name),
            }
        }));
    }
}

#[derive(Default)]
pub struct TestJvm {
    pub shutdown_calls: Cell<u32>,
    exit_hook: RefCell<Option<Rc<MethodInfo>>>,
}

impl TestJvm {
    pub fn new() -> Rc<Self> {
        Rc::new(TestJvm::default())
    }

    pub fn set_exit_hook(&self, method: &Rc<MethodInfo>) {
        *self.exit_hook.borrow_mut() = Some(method.clone());
    }
}

impl Jvm for TestJvm {
    fn initiate_shutdown(&self, thread: &Rc<JavaThread>) {
        self.shutdown_calls.set(self.shutdown_calls.get() + 1);
        let hook = self.exit_hook.borrow().clone();
        if let Some(hook) = hook {
            thread.run_method(
                &hook,
                Vec::new(),
                Box::new(|thread, _result| {
                    // Shutdown hooks complete; let the thread die again
                    thread.set_status(ThreadStatus::Runnable);
                }),
            );
        }
    }
}

pub struct Fixture {
    pub queue: Rc<TaskQueue>,
    pub heap: Rc<TestHeap>,
    pub loader: Rc<TestLoader>,
    pub jvm: Rc<TestJvm>,
    pub pool: Rc<ThreadPool>,
    pub thread_class: Rc<TestClass>,
    pub methods: Rc<RefCell<HashMap<u16, Rc<MethodInfo>>>>,
    pub log: Rc<RefCell<Vec<String>>>,
    pub empty_calls: Rc<Cell<u32>>,
}

pub fn fixture() -> Fixture {
    fixture_with(SchedulerOptions::default())
}

pub fn fixture_with(options: SchedulerOptions) -> Fixture {
    let _ = pretty_env_logger::try_init();

    let queue = TaskQueue::new();
    let heap = TestHeap::new();
    let loader = TestLoader::new(queue.clone());
    let jvm = TestJvm::new();
    let methods: Rc<RefCell<HashMap<u16, Rc<MethodInfo>>>> = Rc::new(RefCell::new(HashMap::new()));
    let log: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let mut opcodes = OpcodeTable::new();
    install_test_opcodes(&mut opcodes, &methods, &log);

    let thread_class = heap.new_class("java/lang/Thread");
    loader.define(&thread_class);

    let empty_calls = Rc::new(Cell::new(0));
    let empty = empty_calls.clone();
    let env = JavaEnv {
        class_loader: loader.clone(),
        objects: heap.clone(),
        host: queue.clone(),
        jvm: jvm.clone(),
        opcodes: Rc::new(opcodes),
    };
    let pool = ThreadPool::new(env, options, Box::new(move || empty.set(empty.get() + 1)));

    Fixture {
        queue,
        heap,
        loader,
        jvm,
        pool,
        thread_class,
        methods,
        log,
        empty_calls,
    }
}

/// The opcode subset the scripted test methods use. Invokes resolve their
/// callee through the shared method registry by constant-pool index.
fn install_test_opcodes(
    table: &mut OpcodeTable,
    methods: &Rc<RefCell<HashMap<u16, Rc<MethodInfo>>>>,
    log: &Rc<RefCell<Vec<String>>>,
) {
    table.register(Opcode::nop, |_thread, frame, _code, pc| {
        frame.set_pc(pc + 1);
    });

    table.register(Opcode::bipush, |_thread, frame, code, pc| {
        frame.push(JavaValue::Int(code[pc as usize + 1] as i8 as i32));
        frame.set_pc(pc + 2);
    });

    table.register(Opcode::pop, |_thread, frame, _code, pc| {
        frame.pop();
        frame.set_pc(pc + 1);
    });

    table.register(Opcode::goto, |_thread, frame, code, pc| {
        let offset = i16::from_be_bytes([code[pc as usize + 1], code[pc as usize + 2]]);
        frame.offset_pc(offset as i32);
    });

    table.register(Opcode::r#return, |thread, frame, _code, _pc| {
        exit_method_lock(thread, frame);
        frame.set_return_to_thread_loop(true);
        thread.async_return(None, None);
    });

    table.register(Opcode::ireturn, |thread, frame, _code, _pc| {
        let value = frame.pop();
        exit_method_lock(thread, frame);
        frame.set_return_to_thread_loop(true);
        thread.async_return(Some(value), None);
    });

    table.register(Opcode::athrow, |thread, frame, _code, _pc| {
        let exception = frame.pop().expect_reference().expect("athrow on null");
        frame.set_return_to_thread_loop(true);
        thread.throw_exception(exception);
    });

    let registry = methods.clone();
    table.register(Opcode::invokestatic, move |thread, frame, code, pc| {
        let index = u16::from_be_bytes([code[pc as usize + 1], code[pc as usize + 2]]);
        let method = registry
            .borrow()
            .get(&index)
            .cloned()
            .unwrap_or_else(|| panic!("No method registered at #{}", index));
        frame.set_return_to_thread_loop(true);
        thread.push_frame(Frame::for_method(method, Vec::new()));
    });

    let registry = methods.clone();
    table.register(Opcode::invokeinterface, move |thread, frame, code, pc| {
        let index = u16::from_be_bytes([code[pc as usize + 1], code[pc as usize + 2]]);
        let method = registry
            .borrow()
            .get(&index)
            .cloned()
            .unwrap_or_else(|| panic!("No method registered at #{}", index));
        frame.set_return_to_thread_loop(true);
        thread.push_frame(Frame::for_method(method, Vec::new()));
    });

    // Probe used by assertions: records pc and top-of-stack
    let probe_log = log.clone();
    table.register(Opcode::breakpoint, move |_thread, frame, _code, pc| {
        let top = if frame.stack_depth() > 0 {
            let value = frame.pop();
            frame.push(value);
            format!("{:?}", value)
        } else {
            "-".to_string()
        };
        probe_log.borrow_mut().push(format!(
            "probe pc={} depth={} top={}",
            pc,
            frame.stack_depth(),
            top
        ));
        frame.set_pc(pc + 1);
    });
}

fn exit_method_lock(thread: &Rc<JavaThread>, frame: &green_jvm::jvm::call::BytecodeFrame) {
    if frame.method().access.contains(AccessFlags::SYNCHRONIZED) && frame.locked_method_lock() {
        frame.method().method_lock(thread, frame).exit(thread);
    }
}

impl Fixture {
    pub fn define_class(&self, name: &str) -> Rc<TestClass> {
        let class = self.heap.new_class(name);
        self.loader.define(&class);
        class
    }

    pub fn define_lazy_class(&self, name: &str) -> Rc<TestClass> {
        let class = self.heap.new_class(name);
        self.loader.define_lazy(&class);
        class
    }

    pub fn register_method(&self, index: u16, method: &Rc<MethodInfo>) {
        self.methods.borrow_mut().insert(index, method.clone());
    }

    pub fn method(
        &self,
        name: &str,
        descriptor: &str,
        access: AccessFlags,
        code: Vec<u8>,
    ) -> Rc<MethodInfo> {
        Rc::new(
            MethodInfo::new("Harness", name, descriptor, access)
                .with_code(CodeAttribute::new(8, 8, code)),
        )
    }

    pub fn bytecode_method(&self, name: &str, code: Vec<u8>) -> Rc<MethodInfo> {
        self.method(
            name,
            "()V",
            AccessFlags::PUBLIC | AccessFlags::STATIC,
            code,
        )
    }

    pub fn native_method<F>(&self, name: &str, descriptor: &str, body: F) -> Rc<MethodInfo>
    where
        F: Fn(&Rc<JavaThread>, Vec<JavaValue>) -> Option<JavaValue> + 'static,
    {
        let method = Rc::new(MethodInfo::new(
            "Harness",
            name,
            descriptor,
            AccessFlags::PUBLIC | AccessFlags::STATIC | AccessFlags::NATIVE,
        ));
        method.register_native(Rc::new(body));
        method
    }

    /// A native that records `tag`, then yields to the host for one tick.
    pub fn tick_native(&self, tag: &str) -> Rc<MethodInfo> {
        let log = self.log.clone();
        let tag = tag.to_string();
        self.native_method("tick", "()V", move |thread, _args| {
            // At most one RUNNING thread pool-wide
            let pool = thread.pool();
            let running = pool
                .threads()
                .iter()
                .filter(|t| t.status() == ThreadStatus::Running)
                .count();
            assert_eq!(running, 1);
            assert!(pool
                .running_thread()
                .map_or(false, |t| Rc::ptr_eq(&t, thread)));

            log.borrow_mut().push(tag.clone());
            thread.set_status(ThreadStatus::AsyncWaiting);
            let waker = thread.clone();
            pool.host()
                .defer(Box::new(move || waker.async_return(None, None)));
            None
        })
    }

    pub fn spawn(&self) -> Rc<JavaThread> {
        let obj = self.heap.new_object(&self.thread_class);
        self.pool.new_thread(obj)
    }

    pub fn start(&self, thread: &Rc<JavaThread>, method: &Rc<MethodInfo>) {
        self.start_with(thread, method, Vec::new());
    }

    pub fn start_with(
        &self,
        thread: &Rc<JavaThread>,
        method: &Rc<MethodInfo>,
        args: Vec<JavaValue>,
    ) {
        thread.push_frame(Frame::for_method(method.clone(), args));
        thread.set_status(ThreadStatus::Runnable);
    }

    pub fn run(&self) {
        self.queue.run_until_idle();
    }
}
