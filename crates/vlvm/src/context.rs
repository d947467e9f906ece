//! The execution context: owns the loaded image, the value stack, the
//! globals and natives maps, and the last-error record.

use std::any::Any;
use std::rc::Rc;

use vlcore::{Value, VlMap, VlStr};

use crate::error::{Error, ErrorRecord};
use crate::image::Image;
use crate::stack::{Stack, DEFAULT_INITIAL_CAPACITY};

/// Level passed to a [`LogHook`], matching the spec's `"log"` / `"error"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Log,
    Error,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Log => "log",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Where a context's diagnostic output goes.
///
/// `Tracing` is the default: it routes through the `tracing` crate so
/// embedders already running a `tracing_subscriber` get structured,
/// filterable logs for free, while still honouring the spec's
/// `"[VL][<level>] <message>\n"` format when no subscriber is installed
/// (`tracing`'s fallback is to drop the event, so `vlc`'s `main` installs a
/// formatter that reproduces it exactly). `Callback` gives embedders the
/// literal `(level, message)` hook shape from spec.md §6.
#[derive(Clone)]
pub enum LogHook {
    Tracing,
    Callback(Rc<dyn Fn(LogLevel, &str)>),
}

impl Default for LogHook {
    fn default() -> Self {
        LogHook::Tracing
    }
}

impl LogHook {
    fn emit(&self, level: LogLevel, message: &str) {
        match self {
            LogHook::Tracing => match level {
                LogLevel::Log => tracing::info!(target: "vlvm", "{message}"),
                LogLevel::Error => tracing::error!(target: "vlvm", "{message}"),
            },
            LogHook::Callback(f) => f(level, message),
        }
    }
}

/// Where `Print` sends its rendered text.
///
/// `Stdout` is the default, matching the spec's reference behaviour; a
/// `Callback` lets embedders (and tests) capture output instead of letting it
/// hit the process's actual stdout.
#[derive(Clone)]
pub enum OutputSink {
    Stdout,
    Callback(Rc<dyn Fn(&str)>),
}

impl Default for OutputSink {
    fn default() -> Self {
        OutputSink::Stdout
    }
}

impl OutputSink {
    fn emit(&self, text: &str) {
        match self {
            OutputSink::Stdout => print!("{text}"),
            OutputSink::Callback(f) => f(text),
        }
    }
}

/// Fault-injection seam standing in for the spec's realloc-style host
/// allocator hook (see SPEC_FULL.md §4.4 for why a real allocator swap
/// isn't the idiomatic fit here). Consulted before the stack grows, before
/// a map rehashes, and before a new global/native name is interned; `false`
/// simulates the host allocator refusing the request.
pub trait AllocProbe {
    fn allow(&self, requested_bytes: usize) -> bool;
}

/// Per-context configuration, built with a small `with_*` builder API
/// instead of a process-global.
#[derive(Clone)]
pub struct ContextConfig {
    pub initial_stack_capacity: usize,
    pub log: LogHook,
    pub output: OutputSink,
    pub alloc_probe: Option<Rc<dyn AllocProbe>>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        ContextConfig {
            initial_stack_capacity: DEFAULT_INITIAL_CAPACITY,
            log: LogHook::default(),
            output: OutputSink::default(),
            alloc_probe: None,
        }
    }
}

impl ContextConfig {
    pub fn with_initial_stack_capacity(mut self, capacity: usize) -> Self {
        self.initial_stack_capacity = capacity;
        self
    }

    pub fn with_log_hook(mut self, log: LogHook) -> Self {
        self.log = log;
        self
    }

    pub fn with_output_sink(mut self, output: OutputSink) -> Self {
        self.output = output;
        self
    }

    pub fn with_alloc_probe(mut self, probe: Rc<dyn AllocProbe>) -> Self {
        self.alloc_probe = Some(probe);
        self
    }

    fn check_alloc(&self, requested_bytes: usize) -> bool {
        match &self.alloc_probe {
            Some(probe) => probe.allow(requested_bytes),
            None => true,
        }
    }
}

/// The record a registered native is stored as. Type-erased into
/// `Value::Native` via `Rc<dyn Any>`; `Context::call_native` downcasts it
/// back before invoking the closure.
pub struct NativeRecord {
    func: Box<dyn Fn(&mut Context, &[Value]) -> Result<Value, Error>>,
}

/// The per-embedding execution unit: code, constant-string pool, stack,
/// globals, natives, and last-error.
pub struct Context {
    config: ContextConfig,
    image: Option<Image>,
    ip: usize,
    stack: Stack,
    globals: VlMap<Value>,
    natives: VlMap<Value>,
    last_error: Option<ErrorRecord>,
}

impl Context {
    /// Creates a fresh, imageless context.
    pub fn create(config: ContextConfig) -> Context {
        let stack = Stack::new(config.initial_stack_capacity);
        Context {
            config,
            image: None,
            ip: 0,
            stack,
            globals: VlMap::new(),
            natives: VlMap::new(),
            last_error: None,
        }
    }

    // -- lifecycle / error inspection ------------------------------------

    pub fn last_error(&self) -> Option<&ErrorRecord> {
        self.last_error.as_ref()
    }

    pub fn clear_error(&mut self) {
        self.last_error = None;
    }

    /// Records `code`/`message`, logs it at `"error"`, and returns `code` —
    /// the one error-reporting path every fallible operation funnels
    /// through.
    pub(crate) fn set_err(&mut self, code: Error, message: impl Into<String>) -> Error {
        let record = ErrorRecord::new(code, message);
        self.config.log.emit(LogLevel::Error, &record.to_string());
        self.last_error = Some(record);
        code
    }

    /// Public counterpart of [`Context::set_err`] for native functions: a
    /// native records its own failure message, then returns the code
    /// `fail` gives back. `CallN` prefixes this message with the native's
    /// name before it reaches the embedder's `last_error`.
    pub fn fail(&mut self, code: Error, message: impl Into<String>) -> Error {
        self.set_err(code, message)
    }

    // -- image loading -----------------------------------------------------

    /// Parses and installs `bytes` as the context's program image.
    ///
    /// On success: `ip = 0`, `sp = 0` (the stack is NOT cleared by the
    /// spec's contract — loading only resets the instruction pointer and
    /// replaces the image; existing stack/global state is untouched, since
    /// an embedder may reload an image mid-session). Any previously loaded
    /// image is dropped first (atomic replacement: on failure the context
    /// is left imageless rather than holding a half-built one).
    pub fn load_from_memory(&mut self, bytes: &[u8]) -> Result<(), Error> {
        self.image = None;
        match Image::load(bytes) {
            Ok(image) => {
                self.image = Some(image);
                self.ip = 0;
                Ok(())
            }
            Err(record) => {
                let code = record.code;
                self.config.log.emit(LogLevel::Error, &record.to_string());
                self.last_error = Some(record);
                Err(code)
            }
        }
    }

    pub fn image(&self) -> Option<&Image> {
        self.image.as_ref()
    }

    pub(crate) fn has_image(&self) -> bool {
        self.image.is_some()
    }

    pub(crate) fn code_len(&self) -> usize {
        self.image.as_ref().map_or(0, |i| i.code().len())
    }

    pub(crate) fn code_byte(&self, idx: usize) -> Option<u8> {
        self.image.as_ref().and_then(|i| i.code().get(idx).copied())
    }

    pub(crate) fn code_slice(&self, start: usize, len: usize) -> Option<&[u8]> {
        let end = start.checked_add(len)?;
        self.image.as_ref().and_then(|i| i.code().get(start..end))
    }

    /// Clones constant-pool string `idx` out, or `None` if out of range.
    pub(crate) fn const_str(&self, idx: u32) -> Option<VlStr> {
        self.image.as_ref().and_then(|i| i.string_at(idx)).cloned()
    }

    pub fn ip(&self) -> usize {
        self.ip
    }

    pub(crate) fn set_ip(&mut self, ip: usize) {
        self.ip = ip;
    }

    pub(crate) fn stack_mut(&mut self) -> &mut Stack {
        &mut self.stack
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn stack_capacity(&self) -> usize {
        self.stack.capacity()
    }

    pub fn peek(&self) -> Option<&Value> {
        self.stack.peek()
    }

    /// Pushes directly onto the value stack (used by embedders setting up
    /// arguments before a manual call, and by tests).
    pub fn push(&mut self, value: Value) -> Result<(), Error> {
        if !self.config.check_alloc(std::mem::size_of::<Value>()) || !self.stack.push(value) {
            return Err(self.set_err(Error::Oom, "stack growth refused"));
        }
        Ok(())
    }

    pub fn pop(&mut self) -> Value {
        self.stack.pop()
    }

    /// Clones the top `argc` values out (bottom-to-top) and removes them,
    /// for `CallN`'s "pass a slice, then pop regardless of outcome"
    /// contract. `None` if `argc > len()`.
    pub(crate) fn take_top(&mut self, argc: usize) -> Option<Vec<Value>> {
        let args = self.stack.top_slice(argc)?.to_vec();
        self.stack.pop_n(argc);
        Some(args)
    }

    // -- natives -----------------------------------------------------------

    /// Interns `name`, allocates a native-function record, and inserts a
    /// `Value::Native` referencing it. Re-registration replaces (and, via
    /// `Rc`, releases once unreferenced) the previous record.
    pub fn register_native(
        &mut self,
        name: &str,
        f: impl Fn(&mut Context, &[Value]) -> Result<Value, Error> + 'static,
    ) -> Result<(), Error> {
        if name.is_empty() {
            return Err(self.set_err(Error::BadArg, "native name must not be empty"));
        }
        if !self.config.check_alloc(name.len()) {
            return Err(self.set_err(Error::Oom, "native registration refused"));
        }
        let record: Rc<dyn Any> = Rc::new(NativeRecord { func: Box::new(f) });
        let key = VlStr::new(name.as_bytes());
        self.natives
            .put(key, Value::Native(record))
            .map_err(|_| self.set_err(Error::Oom, "native map allocation refused"))
    }

    pub fn has_native(&self, name: &str) -> bool {
        self.natives.get_by_bytes(name.as_bytes()).is_some()
    }

    /// Looks up and invokes native `name` with `args`, exactly as `CallN`
    /// does: absence is `NotFound`, and any failure from the native itself
    /// bubbles up with a message prefixed by the native's name.
    pub(crate) fn call_native(&mut self, name: &str, args: &[Value]) -> Result<Value, Error> {
        let record = match self.natives.get_by_bytes(name.as_bytes()) {
            Some(Value::Native(handle)) => handle.clone(),
            _ => return Err(self.set_err(Error::NotFound, format!("native not found: {name}"))),
        };
        self.invoke_native_record(record, name, args)
    }

    /// Resolves `name` (a constant-pool `VlStr`, which may hold bytes that
    /// are not valid UTF-8) in the natives map by exact byte equality.
    /// `CallN` calls this before checking its argc precondition, so an
    /// unregistered name fails `NotFound` even when the stack is also
    /// under-supplied.
    pub(crate) fn resolve_native(&mut self, name: &VlStr) -> Result<Rc<dyn Any>, Error> {
        match self.natives.get(name) {
            Some(Value::Native(handle)) => Ok(handle.clone()),
            _ => {
                let display_name = name.as_str_lossy();
                Err(self.set_err(Error::NotFound, format!("native not found: {display_name}")))
            }
        }
    }

    /// Invokes a native record already resolved by [`Context::resolve_native`].
    pub(crate) fn invoke_native(
        &mut self,
        record: Rc<dyn Any>,
        name: &VlStr,
        args: &[Value],
    ) -> Result<Value, Error> {
        let display_name = name.as_str_lossy().into_owned();
        self.invoke_native_record(record, &display_name, args)
    }

    fn invoke_native_record(
        &mut self,
        record: Rc<dyn Any>,
        name: &str,
        args: &[Value],
    ) -> Result<Value, Error> {
        let rec = record
            .downcast_ref::<NativeRecord>()
            .expect("natives map only ever stores NativeRecord handles");
        // `rec` borrows from `record`, an Rc we hold independently of
        // `self.natives`, so calling back into `self` (the native may
        // push/pop/register further natives) cannot invalidate it.
        let func = &rec.func;
        match func(self, args) {
            Ok(v) => Ok(v),
            Err(code) => {
                let msg = self
                    .last_error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_default();
                Err(self.set_err(code, format!("{name}: {msg}")))
            }
        }
    }

    // -- globals -------------------------------------------------------------

    pub fn set_global(&mut self, name: &str, value: Value) -> Result<(), Error> {
        if name.is_empty() {
            return Err(self.set_err(Error::BadArg, "global name must not be empty"));
        }
        if !self.config.check_alloc(name.len()) {
            return Err(self.set_err(Error::Oom, "global store refused"));
        }
        let key = VlStr::new(name.as_bytes());
        self.globals
            .put(key, value)
            .map_err(|_| self.set_err(Error::Oom, "globals map allocation refused"))
    }

    pub fn get_global(&self, name: &str) -> Option<Value> {
        self.globals.get_by_bytes(name.as_bytes()).cloned()
    }

    pub(crate) fn get_global_by_const(&self, name: &VlStr) -> Option<Value> {
        self.globals.get(name).cloned()
    }

    pub(crate) fn set_global_by_const(&mut self, name: &VlStr, value: Value) -> Result<(), Error> {
        if !self.config.check_alloc(name.len()) {
            return Err(self.set_err(Error::Oom, "globals map allocation refused"));
        }
        self.globals
            .put(name.clone(), value)
            .map_err(|_| self.set_err(Error::Oom, "globals map allocation refused"))
    }

    pub fn log(&self, level: LogLevel, message: &str) {
        self.config.log.emit(level, message);
    }

    pub(crate) fn emit_output(&self, text: &str) {
        self.config.output.emit(text);
    }
}
