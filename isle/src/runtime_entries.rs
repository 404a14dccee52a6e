//! Runtime entries and native functions.
//!
//! Generated code leaves managed execution through two bridges: runtime
//! entries, implemented here, and embedder-registered native functions.
//! Both receive their arguments in place on the operand stack; the calling
//! frame's stack map keeps them visible to the collector.

use object::{Array, Bigint, Context, Value, cid};

use crate::error::{ApiError, ErrorKind, RuntimeResult};
use crate::function::NativeId;
use crate::handles::{ErrorHandle, Handle};
use crate::isolate::Isolate;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum RuntimeEntry {
    /// `[instance, class id, instantiator type arguments]` → bool.
    InstanceOf,
    /// `[value]` → null.
    Print,
    /// `[value]` → string.
    ToString,
    /// `[a, b]` → string.
    StringConcat,
    /// `[e0 .. en]` → array of the arguments.
    CreateArray,
    /// `[context]` → shallow copy.
    CloneContext,
    /// `[a, b]` → bool, numbers by value.
    Equals,
}

impl RuntimeEntry {
    const ALL: [RuntimeEntry; 7] = [
        RuntimeEntry::InstanceOf,
        RuntimeEntry::Print,
        RuntimeEntry::ToString,
        RuntimeEntry::StringConcat,
        RuntimeEntry::CreateArray,
        RuntimeEntry::CloneContext,
        RuntimeEntry::Equals,
    ];

    pub fn from_id(id: u64) -> Option<RuntimeEntry> {
        Self::ALL.get(usize::try_from(id).ok()?).copied()
    }

    /// Fixed argument count, `None` for variadic entries.
    pub fn argument_count(self) -> Option<usize> {
        match self {
            RuntimeEntry::InstanceOf => Some(3),
            RuntimeEntry::Print | RuntimeEntry::ToString | RuntimeEntry::CloneContext => Some(1),
            RuntimeEntry::StringConcat | RuntimeEntry::Equals => Some(2),
            RuntimeEntry::CreateArray => None,
        }
    }
}

// ── Native functions ───────────────────────────────────────────────

pub type NativeFunction = fn(&mut NativeArguments<'_>) -> Result<(), ErrorHandle>;

#[derive(Debug, Clone)]
pub(crate) struct NativeEntry {
    pub name: String,
    pub argc: usize,
    pub function: NativeFunction,
}

/// Arguments of one native call, in place on the operand stack.
pub struct NativeArguments<'a> {
    isolate: &'a mut Isolate,
    base: usize,
    count: usize,
}

impl NativeArguments<'_> {
    pub fn count(&self) -> usize {
        self.count
    }

    pub fn isolate(&mut self) -> &mut Isolate {
        self.isolate
    }

    /// Raw argument `index`. Not stable across allocation; take a handle
    /// with [`NativeArguments::arg_handle`] to keep it.
    pub fn arg(&self, index: usize) -> Value {
        debug_assert!(index < self.count);
        self.isolate.roots.frames.at(self.base + index)
    }

    pub fn arg_handle(&mut self, index: usize) -> Handle {
        let value = self.arg(index);
        self.isolate.roots.api.new_local(value)
    }

    pub fn arg_as_i64(&self, index: usize) -> Option<i64> {
        self.isolate.integer_value(self.arg(index))
    }

    pub fn arg_as_f64(&self, index: usize) -> Option<f64> {
        self.isolate.double_value(self.arg(index))
    }

    pub fn arg_as_string(&self, index: usize) -> Option<String> {
        self.isolate.string_value(self.arg(index))
    }

    pub fn set_return(&mut self, value: Value) {
        if let Some(slot) = self.isolate.roots.native_results.last_mut() {
            *slot = value;
        }
    }

    pub fn set_return_handle(&mut self, handle: Handle) -> Result<(), ApiError> {
        let value = self.isolate.roots.api.get(handle)?;
        self.set_return(value);
        Ok(())
    }
}

impl Isolate {
    /// Registers `function` under `name`. Functions marked native are bound
    /// to it through [`crate::function::Function::native`].
    pub fn register_native_function(&mut self, name: &str, argc: usize, function: NativeFunction) -> NativeId {
        if let Some(index) = self.natives.iter().position(|n| n.name == name) {
            self.natives[index] = NativeEntry {
                name: name.to_owned(),
                argc,
                function,
            };
            return NativeId(index as u32);
        }
        self.natives.push(NativeEntry {
            name: name.to_owned(),
            argc,
            function,
        });
        NativeId(self.natives.len() as u32 - 1)
    }

    pub fn lookup_native_function(&self, name: &str) -> Option<NativeId> {
        self.natives.iter().position(|n| n.name == name).map(|i| NativeId(i as u32))
    }

    /// Runs a native function inside its own handle scope. An error handle
    /// returned by the native becomes the pending error.
    pub(crate) fn call_native_function(&mut self, id: NativeId, argc: usize) -> RuntimeResult<Value> {
        let Some(entry) = self.natives.get(id.0 as usize) else {
            return Err(self.raise_error(ErrorKind::Api, "unknown native function"));
        };
        if entry.argc != argc {
            let message = format!("native '{}' expects {} arguments, got {}", entry.name, entry.argc, argc);
            return Err(self.raise_error(ErrorKind::Api, &message));
        }
        let function = entry.function;
        let base = self.roots.frames.depth() - 1 - argc;
        let depth = self.roots.api.scope_depth();
        self.roots.api.enter_scope();
        self.roots.native_results.push(self.null());

        let result = {
            let mut args = NativeArguments {
                isolate: self,
                base,
                count: argc,
            };
            function(&mut args)
        };

        let null = self.null();
        let value = self.roots.native_results.pop().unwrap_or(null);
        let outcome = match result {
            Ok(()) => Ok(value),
            Err(error) => {
                let error = self.roots.api.get(error.handle()).unwrap_or(null);
                if error == null {
                    Err(self.raise_error(ErrorKind::Api, "native function failed without an error"))
                } else {
                    Err(self.roots.unwinder.raise(error))
                }
            }
        };
        self.roots.api.unwind_scopes_to(depth);
        outcome
    }

    // ── Runtime entries ────────────────────────────────────────────

    pub(crate) fn call_runtime_entry(&mut self, entry: RuntimeEntry, argc: usize) -> RuntimeResult<Value> {
        if entry.argument_count().is_some_and(|n| n != argc) {
            return Err(self.raise_error(ErrorKind::Api, "runtime entry called with the wrong argument count"));
        }
        match entry {
            RuntimeEntry::InstanceOf => {
                let instance = self.stub_arg(argc, 0);
                let class = self.stub_arg(argc, 1);
                let type_arguments = self.stub_arg(argc, 2);
                let result = self.is_instance_of_class(instance, class.to_i64() as u16, type_arguments);
                Ok(self.bool_value(result))
            }
            RuntimeEntry::Print => {
                let value = self.stub_arg(argc, 0);
                let text = self.value_to_string(value);
                println!("{text}");
                Ok(self.null())
            }
            RuntimeEntry::ToString => {
                let value = self.stub_arg(argc, 0);
                if object::class_id::is_string_cid(self.class_id_of(value)) {
                    return Ok(value);
                }
                let text = self.value_to_string(value);
                self.new_string(&text)
            }
            RuntimeEntry::StringConcat => {
                let a = self.value_to_string(self.stub_arg(argc, 0));
                let b = self.value_to_string(self.stub_arg(argc, 1));
                self.new_string(&(a + &b))
            }
            RuntimeEntry::CreateArray => {
                let array = self.new_array(argc)?;
                for i in 0..argc {
                    let element = self.stub_arg(argc, i);
                    self.array_set(array, i, element);
                }
                Ok(array)
            }
            RuntimeEntry::CloneContext => {
                let context = self.stub_arg(argc, 0);
                if self.class_id_of(context) != cid::CONTEXT {
                    return Err(self.raise_error(ErrorKind::Api, "not a context"));
                }
                let (n, parent) = {
                    let c = unsafe { context.as_ref::<Context>() };
                    (c.num_variables(), c.parent)
                };
                let copy = self.new_context(n, parent)?;
                let source = self.stub_arg(argc, 0);
                for i in 0..n {
                    let value = unsafe { source.as_ref::<Context>() }.at(i);
                    let slot = unsafe { copy.as_ref::<Context>() }.variable_addr(i);
                    self.store_slot(copy, slot, value);
                }
                Ok(copy)
            }
            RuntimeEntry::Equals => {
                let a = self.stub_arg(argc, 0);
                let b = self.stub_arg(argc, 1);
                let same = self.identical_with_number_check(a, b);
                Ok(self.bool_value(same))
            }
        }
    }

    /// Readable rendering of any value, as `toString` would produce for the
    /// built-in kinds.
    pub fn value_to_string(&self, value: Value) -> String {
        if value.is_smi() {
            return value.to_i64().to_string();
        }
        if value == self.null() {
            return "null".to_owned();
        }
        match self.class_id_of(value) {
            cid::BOOL => (value == self.bool_value(true)).to_string(),
            cid::MINT => self.integer_value(value).unwrap_or_default().to_string(),
            cid::BIGINT => {
                let b = unsafe { value.as_ref::<Bigint>() };
                crate::bigint::to_decimal(b.is_negative(), b.digits())
            }
            cid::DOUBLE => format_double(self.double_value(value).unwrap_or(f64::NAN)),
            cid::ARRAY | cid::IMMUTABLE_ARRAY => {
                let array = unsafe { value.as_ref::<Array>() };
                let parts: Vec<String> = (0..array.len()).map(|i| self.value_to_string(array.at(i))).collect();
                format!("[{}]", parts.join(", "))
            }
            cid::CLOSURE => format!("Closure: {}", self.function(self.closure_function(value)).name),
            cid::STACKTRACE => self.stacktrace_to_string(value),
            c if object::class_id::is_string_cid(c) => self.string_value(value).unwrap_or_default(),
            c => match self.class_table.get(c) {
                Some(class) => format!("Instance of '{}'", class.name),
                None => format!("Instance of '{}'", object::class_id::class_name(c)),
            },
        }
    }
}

/// Shortest round-trip decimal, always with a fraction or exponent.
pub fn format_double(d: f64) -> String {
    if d.is_nan() {
        return "NaN".to_owned();
    }
    if d.is_infinite() {
        return if d > 0.0 { "Infinity" } else { "-Infinity" }.to_owned();
    }
    let text = format!("{d:?}");
    if text.contains('e') && !text.contains("e-") {
        text.replace('e', "e+")
    } else {
        text
    }
}
