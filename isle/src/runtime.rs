//! The process-wide runtime context.
//!
//! `Runtime` owns what every isolate shares: the read-only VM heap with
//! its singletons and stubs, the port registry, flags, embedder callbacks
//! and the optional compiler and debugger collaborators. It is created
//! once and handed to isolates as an `Arc`.

use std::sync::Arc;

use heap::{Heap, HeapError, Space};
use object::{Array, Bool, Header, Null, Value, cid};
use parking_lot::Mutex;

use crate::cobject::CObject;
use crate::compiler::CompilerHook;
use crate::debugger::DebuggerHook;
use crate::error::ApiError;
use crate::flags::VmFlags;
use crate::isolate::{Isolate, IsolateHandle};
use crate::message::Message;
use crate::port::{NativeMessageHandler, NativePort, PortId, PortMap, PortOwner};
use crate::stubs::StubCode;
use crate::thread_pool::PoolConfig;

/// Embedder callbacks. All are optional.
#[derive(Clone, Copy, Default)]
pub struct Callbacks {
    /// Runs on a new isolate before it is returned; false rejects it.
    pub isolate_create: Option<fn(&mut Isolate) -> bool>,
    /// Runs when an interrupt is seen; false unwinds the isolate.
    pub isolate_interrupt: Option<fn(&mut Isolate) -> bool>,
    /// Gets an exception no handler caught while handling a message;
    /// true absorbs it.
    pub isolate_unhandled_exception: Option<fn(&mut Isolate, Value) -> bool>,
    /// Gets the isolate's embedder data on shutdown.
    pub isolate_shutdown: Option<fn(usize)>,
    pub file_open: Option<fn(&str) -> Option<usize>>,
    pub file_write: Option<fn(usize, &[u8])>,
    pub file_close: Option<fn(usize)>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("isolate_create", &self.isolate_create.is_some())
            .field("isolate_interrupt", &self.isolate_interrupt.is_some())
            .field("isolate_unhandled_exception", &self.isolate_unhandled_exception.is_some())
            .field("isolate_shutdown", &self.isolate_shutdown.is_some())
            .field("file_io", &self.file_open.is_some())
            .finish()
    }
}

#[derive(Clone, Default)]
pub struct RuntimeConfig {
    pub flags: VmFlags,
    pub callbacks: Callbacks,
    pub compiler: Option<Arc<dyn CompilerHook>>,
    pub debugger: Option<Arc<dyn DebuggerHook>>,
    /// Workers running native port handlers.
    pub pool: PoolConfig,
}

/// Singletons in the VM heap, shared by every isolate.
#[derive(Debug, Clone, Copy)]
pub struct VmObjects {
    pub null: Value,
    pub true_value: Value,
    pub false_value: Value,
    pub empty_array: Value,
}

pub struct Runtime {
    /// Never collected; only kept alive.
    vm_heap: Mutex<Heap>,
    vm_objects: VmObjects,
    stub_code: StubCode,
    port_map: PortMap,
    flags: VmFlags,
    callbacks: Callbacks,
    compiler: Option<Arc<dyn CompilerHook>>,
    debugger: Option<Arc<dyn DebuggerHook>>,
    perf_map: Mutex<Option<usize>>,
}

impl Runtime {
    pub fn initialize(config: RuntimeConfig) -> Result<Arc<Runtime>, ApiError> {
        let RuntimeConfig {
            flags,
            callbacks,
            compiler,
            debugger,
            pool,
        } = config;
        let mut vm_heap = Heap::new(flags.heap_settings(), crate::trace_object, crate::size_object)
            .map_err(ApiError::Heap)?;
        let vm_objects = bootstrap(&mut vm_heap).map_err(ApiError::Heap)?;
        vm_heap.set_null_value(vm_objects.null);
        let stub_code = StubCode::generate(&mut vm_heap).map_err(ApiError::Heap)?;
        if flags.print_bootstrap {
            log::info!("vm objects: {:?}", vm_objects);
            for (kind, entry) in stub_code.iter() {
                log::info!("stub {:?} at {:#x}", kind, entry);
            }
        }
        vm_heap.write_protect(true);

        let runtime = Arc::new(Runtime {
            vm_heap: Mutex::new(vm_heap),
            vm_objects,
            stub_code,
            port_map: PortMap::new(pool),
            flags,
            callbacks,
            compiler,
            debugger,
            perf_map: Mutex::new(None),
        });
        if runtime.flags.generate_perf_events_symbols {
            runtime.open_perf_map();
            for (kind, entry) in runtime.stub_code.iter() {
                record_perf_symbol(&runtime, entry, crate::assembler::STUB_SIZE, &format!("[Stub] {kind:?}"));
            }
        }
        log::debug!("runtime initialized");
        Ok(runtime)
    }

    pub fn vm_objects(&self) -> &VmObjects {
        &self.vm_objects
    }

    pub fn stub_code(&self) -> &StubCode {
        &self.stub_code
    }

    pub fn port_map(&self) -> &PortMap {
        &self.port_map
    }

    pub fn flags(&self) -> &VmFlags {
        &self.flags
    }

    pub fn callbacks(&self) -> &Callbacks {
        &self.callbacks
    }

    pub fn compiler(&self) -> Option<&Arc<dyn CompilerHook>> {
        self.compiler.as_ref()
    }

    pub fn debugger_hook(&self) -> Option<&Arc<dyn DebuggerHook>> {
        self.debugger.as_ref()
    }

    /// Whether `value` lives in the shared read-only heap.
    pub fn is_vm_object(&self, value: Value) -> bool {
        value.is_heap_object() && self.vm_heap.lock().contains(value.addr())
    }

    // ── Isolates ───────────────────────────────────────────────────

    /// Creates an isolate and enters it on the calling thread.
    pub fn create_isolate(self: &Arc<Self>, name: &str, embedder_data: usize) -> Result<IsolateHandle, ApiError> {
        if IsolateHandle::current().is_some() {
            return Err(ApiError::IsolateAlreadyEntered);
        }
        let isolate = Isolate::new(Arc::clone(self), name, embedder_data)?;
        let handle = IsolateHandle::new(isolate);
        handle.enter()?;
        if let Some(callback) = self.callbacks.isolate_create {
            if !handle.with(callback)? {
                handle.shutdown()?;
                return Err(ApiError::InvalidArgument("the embedder rejected the isolate"));
            }
        }
        log::debug!("created isolate '{}' with main port {}", name, handle.main_port());
        Ok(handle)
    }

    // ── Ports ──────────────────────────────────────────────────────

    /// Posts an already detached message to `port`.
    pub fn post(&self, port: PortId, payload: CObject) -> Result<(), ApiError> {
        self.port_map.post(Message::new(port, payload))
    }

    pub fn post_message(&self, message: Message) -> Result<(), ApiError> {
        self.port_map.post(message)
    }

    /// Opens a port whose messages go to `handler` on the worker pool.
    pub fn new_native_port(&self, name: &str, handler: NativeMessageHandler, handle_concurrently: bool) -> PortId {
        let port = NativePort::new(name, handler, handle_concurrently);
        let id = self.port_map.create_port(PortOwner::Native(port));
        log::debug!("native port '{}' is {}", name, id);
        id
    }

    pub fn close_native_port(&self, port: PortId) -> bool {
        self.port_map.close_port(port)
    }

    // ── Perf map ───────────────────────────────────────────────────

    fn open_perf_map(&self) {
        let Some(open) = self.callbacks.file_open else {
            log::warn!("perf symbols requested without file callbacks");
            return;
        };
        let name = format!("/tmp/perf-{}.map", std::process::id());
        match open(&name) {
            Some(file) => *self.perf_map.lock() = Some(file),
            None => log::warn!("could not open {}", name),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        if let (Some(file), Some(close)) = (self.perf_map.lock().take(), self.callbacks.file_close) {
            close(file);
        }
        self.port_map.shutdown();
    }
}

/// Appends `name` for `[entry, entry + size)` to the perf map, if one is
/// open.
pub(crate) fn record_perf_symbol(runtime: &Runtime, entry: usize, size: usize, name: &str) {
    let Some(file) = *runtime.perf_map.lock() else {
        return;
    };
    if let Some(write) = runtime.callbacks.file_write {
        let line = format!("{entry:x} {size:x} {name}\n");
        write(file, line.as_bytes());
    }
}

// ── Bootstrap ──────────────────────────────────────────────────────

fn allocate_vm_object(heap: &mut Heap, class_id: object::ClassId, size: usize) -> Result<Value, HeapError> {
    let ptr = heap
        .try_allocate(size, Space::Old)
        .ok_or(HeapError::OutOfMemory { space: Space::Old, requested: size })?;
    let addr = ptr.as_ptr() as usize;
    unsafe { Header::initialize(addr, class_id, size) };
    let value = Value::from_addr(addr);
    unsafe { value.header() }.set_canonical();
    Ok(value)
}

fn bootstrap(heap: &mut Heap) -> Result<VmObjects, HeapError> {
    let null = allocate_vm_object(heap, cid::NULL, size_of::<Null>())?;
    let true_value = allocate_vm_object(heap, cid::BOOL, size_of::<Bool>())?;
    unsafe { true_value.as_mut::<Bool>() }.value = Value::from_i64(1);
    let false_value = allocate_vm_object(heap, cid::BOOL, size_of::<Bool>())?;
    unsafe { false_value.as_mut::<Bool>() }.value = Value::from_i64(0);
    let empty_array = allocate_vm_object(heap, cid::ARRAY, Array::allocation_size(0))?;
    let array = unsafe { empty_array.as_mut::<Array>() };
    array.type_arguments = null;
    array.length = Value::from_usize(0);
    Ok(VmObjects {
        null,
        true_value,
        false_value,
        empty_array,
    })
}
