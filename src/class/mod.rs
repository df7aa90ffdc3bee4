//! Read-only method metadata consumed by the execution core. Class files are
//! parsed and resolved by an external class loader; the core only sees the
//! pieces required to drive frames: access flags, descriptors, code
//! attributes, and the synchronized-method lock.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;

use hashbrown::HashSet;

use crate::jvm::call::{BytecodeFrame, NativeMethod};
use crate::jvm::interface::{ClassLoader, Monitor};
use crate::jvm::mem::{FieldDescriptor, JavaValue};
use crate::jvm::thread::JavaThread;

mod attribute;

pub use attribute::{CodeAttribute, ExceptionRange, LineNumberEntry};

bitflags! {
    pub struct AccessFlags: u16 {
        const PUBLIC = 0x0001;
        const PRIVATE = 0x0002;
        const PROTECTED = 0x0004;
        const STATIC = 0x0008;
        const FINAL = 0x0010;
        const SUPER = 0x0020;
        const SYNCHRONIZED = 0x0020;
        const VOLATILE = 0x0040;
        const BRIDGE = 0x0040;
        const TRANSIENT = 0x0080;
        const VARARGS = 0x0080;
        const NATIVE = 0x0100;
        const INTERFACE = 0x0200;
        const ABSTRACT = 0x0400;
        const STRICT = 0x0800;
        const SYNTHETIC = 0x1000;
        const ANNOTATION = 0x2000;
        const ENUM = 0x4000;
        const MODULE = 0x8000;
    }
}

pub struct MethodInfo {
    pub class_name: Arc<str>,
    pub name: Arc<str>,
    pub descriptor: Arc<str>,
    pub access: AccessFlags,
    pub code: Option<CodeAttribute>,
    desc: FieldDescriptor,
    loader: Option<Rc<dyn ClassLoader>>,
    native: RefCell<Option<NativeMethod>>,
    // Catch types this method already failed to resolve; consulted during
    // exception dispatch so a broken handler class cannot retry forever.
    failed_catches: RefCell<HashSet<Arc<str>>>,
}

impl MethodInfo {
    pub fn new(class_name: &str, name: &str, descriptor: &str, access: AccessFlags) -> Self {
        let desc = match FieldDescriptor::read_str(descriptor) {
            Some(d @ FieldDescriptor::Method { .. }) => d,
            _ => panic!("Malformed method descriptor: {}", descriptor),
        };

        MethodInfo {
            class_name: class_name.into(),
            name: name.into(),
            descriptor: descriptor.into(),
            access,
            code: None,
            desc,
            loader: None,
            native: RefCell::new(None),
            failed_catches: RefCell::new(HashSet::new()),
        }
    }

    pub fn with_code(mut self, code: CodeAttribute) -> Self {
        self.code = Some(code);
        self
    }

    pub fn with_loader(mut self, loader: Rc<dyn ClassLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn full_signature(&self) -> String {
        format!("{}.{}{}", self.class_name, self.name, self.descriptor)
    }

    pub fn return_type(&self) -> &FieldDescriptor {
        match &self.desc {
            FieldDescriptor::Method { returns, .. } => returns,
            _ => unreachable!(),
        }
    }

    pub fn arg_types(&self) -> &[FieldDescriptor] {
        match &self.desc {
            FieldDescriptor::Method { args, .. } => args,
            _ => unreachable!(),
        }
    }

    pub fn expect_code(&self) -> &CodeAttribute {
        match &self.code {
            Some(code) => code,
            None => panic!("Method {} carries no code attribute", self.full_signature()),
        }
    }

    /// The loader that defined this method's class; methods without an
    /// explicit loader belong to the bootstrap loader.
    pub fn loader(&self, thread: &JavaThread) -> Rc<dyn ClassLoader> {
        match &self.loader {
            Some(loader) => loader.clone(),
            None => thread.bs_class_loader(),
        }
    }

    pub fn native_fn(&self) -> Option<NativeMethod> {
        self.native.borrow().clone()
    }

    /// Native registries live outside the core; they bind implementations
    /// after metadata has been constructed.
    pub fn register_native(&self, native: NativeMethod) {
        *self.native.borrow_mut() = Some(native);
    }

    /// The monitor guarding a `synchronized` invocation: the class object's
    /// monitor for static methods, the receiver's monitor otherwise.
    pub fn method_lock(
        &self,
        thread: &Rc<JavaThread>,
        frame: &BytecodeFrame,
    ) -> Rc<dyn Monitor> {
        let pool = thread.pool();
        if self.access.contains(AccessFlags::STATIC) {
            let cls = self
                .loader(thread)
                .get_resolved_class(&self.class_name)
                .unwrap_or_else(|| {
                    panic!("Class {} executing while unresolved", self.class_name)
                });
            pool.objects().monitor_of(cls.class_object())
        } else {
            let receiver = frame
                .local(0)
                .expect_reference()
                .expect("Synchronized instance method entered on null receiver");
            pool.objects().monitor_of(receiver)
        }
    }

    /// Collapse two-slot (`long`/`double`) argument pairs into single values
    /// for the native calling convention.
    pub fn convert_args(&self, args: &[JavaValue]) -> Vec<JavaValue> {
        let mut converted = Vec::with_capacity(args.len());
        let mut idx = 0;

        if !self.access.contains(AccessFlags::STATIC) && !args.is_empty() {
            converted.push(args[0]);
            idx += 1;
        }

        for desc in self.arg_types() {
            debug_assert!(
                idx < args.len(),
                "Argument vector too short for {}",
                self.full_signature()
            );
            converted.push(args[idx]);
            match desc {
                FieldDescriptor::Long | FieldDescriptor::Double => idx += 2,
                _ => idx += 1,
            }
        }

        converted
    }

    pub fn line_number_at(&self, pc: u32) -> Option<u16> {
        let code = self.code.as_ref()?;
        let table = code.line_number_table.as_ref()?;

        let mut best = None;
        for entry in table {
            if entry.start_pc as u32 <= pc {
                best = Some(entry.line_number);
            }
        }
        best
    }

    pub fn catch_resolution_failed(&self, class_name: &str) -> bool {
        self.failed_catches.borrow().contains(class_name)
    }

    pub fn mark_failed_catches<I: IntoIterator<Item = Arc<str>>>(&self, names: I) {
        self.failed_catches.borrow_mut().extend(names);
    }
}

impl std::fmt::Debug for MethodInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.full_signature())
    }
}
