//! Lazy compilation and optimization.
//!
//! The runtime does not parse source. An embedder supplies a
//! [`CompilerHook`] that builds code with [`CodeBuilder`]; the runtime asks
//! it for unoptimized code the first time a function runs and for optimized
//! code once the function is hot. Implicit accessors and native functions
//! are synthesized here without the hook.

use crate::assembler::CodeBuilder;
use crate::code::CodeId;
use crate::error::{ErrorKind, RuntimeResult};
use crate::function::{FieldId, FunctionId, FunctionKind};
use crate::isolate::Isolate;

/// Produces code for functions on demand.
pub trait CompilerHook: Send + Sync {
    /// Unoptimized code for `function`.
    fn compile(&self, isolate: &mut Isolate, function: FunctionId) -> RuntimeResult<CodeId>;

    /// Optimized code for `function`, or `None` if it cannot be optimized.
    fn optimize(&self, isolate: &mut Isolate, function: FunctionId) -> RuntimeResult<Option<CodeId>> {
        let _ = (isolate, function);
        Ok(None)
    }
}

impl Isolate {
    /// The current code of `function`, compiling it first if needed.
    pub fn ensure_code(&mut self, function: FunctionId) -> RuntimeResult<CodeId> {
        if let Some(code) = self.function(function).code {
            return Ok(code);
        }
        let code = self.compile_unoptimized(function)?;
        self.set_function_code(function, code);
        Ok(code)
    }

    /// Unoptimized code for `function`: the cached one if it exists.
    pub(crate) fn unoptimized_code_for(&mut self, function: FunctionId) -> RuntimeResult<CodeId> {
        match self.function(function).unoptimized_code {
            Some(code) => Ok(code),
            None => {
                let code = self.compile_unoptimized(function)?;
                self.function_mut(function).unoptimized_code = Some(code);
                Ok(code)
            }
        }
    }

    fn compile_unoptimized(&mut self, function: FunctionId) -> RuntimeResult<CodeId> {
        let f = self.function(function);
        if f.is_abstract() {
            let message = format!("abstract function '{}' has no body", f.name);
            return Err(self.raise_error(ErrorKind::Compilation, &message));
        }
        log::debug!("compiling '{}'", f.name);
        match f.kind {
            FunctionKind::ImplicitGetter => return self.compile_implicit_getter(function),
            FunctionKind::ImplicitSetter => return self.compile_implicit_setter(function),
            _ => {}
        }
        if f.is_native() {
            return self.compile_native_call(function);
        }
        let Some(compiler) = self.runtime.compiler().cloned() else {
            let message = format!("no compiler to compile '{}'", self.function(function).name);
            return Err(self.raise_error(ErrorKind::Compilation, &message));
        };
        let code = compiler.compile(self, function)?;
        if self.code(code).is_optimized {
            return Err(self.raise_error(ErrorKind::Compilation, "compile returned optimized code"));
        }
        Ok(code)
    }

    fn accessor_field(&mut self, function: FunctionId) -> RuntimeResult<FieldId> {
        match self.function(function).field {
            Some(field) => Ok(field),
            None => Err(self.raise_error(ErrorKind::Compilation, "implicit accessor without a field")),
        }
    }

    fn compile_implicit_getter(&mut self, function: FunctionId) -> RuntimeResult<CodeId> {
        let field = self.accessor_field(function)?;
        let offset = self.field(field).offset;
        let mut b = CodeBuilder::new(self.function(function).name.clone(), 1, 0);
        b.push_arg(0);
        b.load_field(offset);
        b.ret();
        b.finalize(self, Some(function))
    }

    fn compile_implicit_setter(&mut self, function: FunctionId) -> RuntimeResult<CodeId> {
        let field = self.accessor_field(function)?;
        let offset = self.field(field).offset;
        let mut b = CodeBuilder::new(self.function(function).name.clone(), 2, 0);
        b.push_arg(0);
        b.push_arg(1);
        b.store_field(offset, field);
        b.push_constant(self.null());
        b.ret();
        b.finalize(self, Some(function))
    }

    fn compile_native_call(&mut self, function: FunctionId) -> RuntimeResult<CodeId> {
        let f = self.function(function);
        let Some(native) = f.native else {
            let message = format!("native function '{}' is not bound", f.name);
            return Err(self.raise_error(ErrorKind::Compilation, &message));
        };
        let argc = f.num_parameters();
        let mut b = CodeBuilder::new(f.name.clone(), argc, 0);
        for i in 0..argc {
            b.push_arg(i);
        }
        b.native_call(native, argc);
        b.ret();
        b.finalize(self, Some(function))
    }

    /// Asks the compiler hook for optimized code. A function the hook
    /// declines is never offered again.
    pub(crate) fn optimize_function(&mut self, function: FunctionId) -> RuntimeResult<()> {
        self.function_mut(function).usage_counter = 0;
        if !self.function(function).is_optimizable() {
            return Ok(());
        }
        let compiler = self.runtime.compiler().cloned();
        let optimized = match compiler {
            Some(compiler) => compiler.optimize(self, function)?,
            None => None,
        };
        match optimized {
            Some(code) if self.code(code).is_optimized => {
                self.unoptimized_code_for(function)?;
                log::debug!("optimized '{}' as code {}", self.function(function).name, code.0);
                self.set_function_code(function, code);
            }
            Some(_) => {
                return Err(self.raise_error(ErrorKind::Compilation, "optimize returned unoptimized code"));
            }
            None => {
                log::debug!("'{}' is not optimizable", self.function(function).name);
                self.function_mut(function).set_optimizable(false);
            }
        }
        Ok(())
    }

    /// Records that optimized `code` assumes the current guard of `field`.
    pub fn add_field_dependent_code(&mut self, field: FieldId, code: CodeId) {
        let dependents = &mut self.field_mut(field).dependent_code;
        if !dependents.contains(&code) {
            dependents.push(code);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use object::Value;

    use super::*;
    use crate::class_table::Class;
    use crate::function::{FieldFlags, Function, FunctionFlags};
    use crate::runtime::{Runtime, RuntimeConfig};

    struct Counting {
        compiled: AtomicUsize,
    }

    impl CompilerHook for Counting {
        fn compile(&self, isolate: &mut Isolate, function: FunctionId) -> RuntimeResult<CodeId> {
            self.compiled.fetch_add(1, Ordering::Relaxed);
            let mut b = CodeBuilder::new("seven", 0, 0);
            b.push_smi(7);
            b.ret();
            b.finalize(isolate, Some(function))
        }
    }

    fn runtime_with(hook: Option<Arc<dyn CompilerHook>>) -> Arc<Runtime> {
        let _ = env_logger::builder().is_test(true).try_init();
        let config = RuntimeConfig {
            compiler: hook,
            ..RuntimeConfig::default()
        };
        Runtime::initialize(config).unwrap()
    }

    fn static_function(isolate: &mut Isolate, name: &str) -> FunctionId {
        let owner = isolate.register_class(Class::new("Lib", None));
        let function = Function::new(name, owner, FunctionKind::Regular, 0).with_flags(FunctionFlags::STATIC);
        isolate.add_function(function).unwrap()
    }

    #[test]
    fn compiles_once_and_caches() {
        let hook = Arc::new(Counting {
            compiled: AtomicUsize::new(0),
        });
        let runtime = runtime_with(Some(hook.clone() as Arc<dyn CompilerHook>));
        let handle = runtime.create_isolate("c", 0).unwrap();
        handle
            .with(|isolate| {
                let f = static_function(isolate, "seven");
                let code = isolate.ensure_code(f).unwrap();
                assert_eq!(isolate.ensure_code(f).unwrap(), code);
                assert_eq!(isolate.function(f).unoptimized_code, Some(code));
            })
            .unwrap();
        assert_eq!(hook.compiled.load(Ordering::Relaxed), 1);
        handle.shutdown().unwrap();
    }

    #[test]
    fn missing_compiler_is_a_compilation_error() {
        let runtime = runtime_with(None);
        let handle = runtime.create_isolate("c", 0).unwrap();
        handle
            .with(|isolate| {
                let f = static_function(isolate, "f");
                assert!(isolate.ensure_code(f).is_err());
                assert_eq!(isolate.roots.unwinder.kind(), Some(ErrorKind::Compilation));
                isolate.roots.unwinder.take();
            })
            .unwrap();
        handle.shutdown().unwrap();
    }

    #[test]
    fn accessors_are_synthesized() {
        let runtime = runtime_with(None);
        let handle = runtime.create_isolate("c", 0).unwrap();
        handle
            .with(|isolate| {
                let a = isolate.register_class(Class::new("A", None));
                isolate.add_field(a, "x", FieldFlags::empty()).unwrap();
                isolate.finalize_class(a).unwrap();
                let getter = isolate.resolve_dynamic(a, "get:x", 1).unwrap();
                let setter = isolate.resolve_dynamic(a, "set:x", 2).unwrap();
                assert!(isolate.ensure_code(getter).is_ok());
                assert!(isolate.ensure_code(setter).is_ok());

                let obj = isolate.new_instance(a).unwrap();
                let h = isolate.roots.api.new_persistent(obj);
                isolate.invoke_function(setter, &[obj, Value::from_i64(5)]).unwrap();
                let obj = isolate.roots.api.get(h).unwrap();
                assert_eq!(isolate.invoke_function(getter, &[obj]).unwrap(), Value::from_i64(5));
            })
            .unwrap();
        handle.shutdown().unwrap();
    }

    #[test]
    fn declined_optimization_is_sticky() {
        let hook = Arc::new(Counting {
            compiled: AtomicUsize::new(0),
        });
        let runtime = runtime_with(Some(hook as Arc<dyn CompilerHook>));
        let handle = runtime.create_isolate("c", 0).unwrap();
        handle
            .with(|isolate| {
                let f = static_function(isolate, "seven");
                isolate.ensure_code(f).unwrap();
                isolate.optimize_function(f).unwrap();
                assert!(!isolate.function(f).is_optimizable());
                assert!(!isolate.code(isolate.function(f).code.unwrap()).is_optimized);
            })
            .unwrap();
        handle.shutdown().unwrap();
    }
}
