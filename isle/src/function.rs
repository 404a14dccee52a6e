//! Functions and fields.
//!
//! Both live in per-isolate arenas and are referred to by id. Heap objects
//! that need to name a function (closures, IC entries, stack traces) store
//! the id as a small integer.

use bitflags::bitflags;
use object::{ClassId, Value, cid};

use crate::code::CodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

impl FunctionId {
    pub fn to_value(self) -> Value {
        Value::from_usize(self.0 as usize)
    }

    pub fn from_value(value: Value) -> FunctionId {
        debug_assert!(value.is_smi());
        FunctionId(value.to_usize() as u32)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NativeId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionKind {
    Regular,
    Getter,
    Setter,
    ImplicitGetter,
    ImplicitSetter,
    Constructor,
    Factory,
    Closure,
    Signature,
    MethodExtractor,
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FunctionFlags: u16 {
        const STATIC      = 1 << 0;
        const CONST       = 1 << 1;
        const EXTERNAL    = 1 << 2;
        const ABSTRACT    = 1 << 3;
        const OPTIMIZABLE = 1 << 4;
        const INLINABLE   = 1 << 5;
        const NATIVE      = 1 << 6;
        const VISIBLE     = 1 << 7;
        const INTRINSIC   = 1 << 8;
    }
}

#[derive(Debug, Clone)]
pub struct Function {
    pub id: FunctionId,
    pub name: String,
    pub owner: ClassId,
    pub kind: FunctionKind,
    pub flags: FunctionFlags,
    /// Includes the receiver for instance functions and the closure for
    /// closure functions.
    pub num_fixed_parameters: usize,
    pub num_optional_parameters: usize,
    pub parameter_names: Vec<String>,
    /// `cid::DYNAMIC` accepts anything.
    pub parameter_types: Vec<ClassId>,
    pub code: Option<CodeId>,
    pub unoptimized_code: Option<CodeId>,
    pub usage_counter: u32,
    pub deoptimization_counter: u32,
    pub optimized_instruction_count: u32,
    pub optimized_call_site_count: u32,
    /// The field behind an implicit getter or setter.
    pub field: Option<FieldId>,
    pub native: Option<NativeId>,
}

impl Function {
    pub fn new(name: impl Into<String>, owner: ClassId, kind: FunctionKind, num_fixed: usize) -> Self {
        Self {
            id: FunctionId(u32::MAX),
            name: name.into(),
            owner,
            kind,
            flags: FunctionFlags::OPTIMIZABLE | FunctionFlags::INLINABLE | FunctionFlags::VISIBLE,
            num_fixed_parameters: num_fixed,
            num_optional_parameters: 0,
            parameter_names: Vec::new(),
            parameter_types: Vec::new(),
            code: None,
            unoptimized_code: None,
            usage_counter: 0,
            deoptimization_counter: 0,
            optimized_instruction_count: 0,
            optimized_call_site_count: 0,
            field: None,
            native: None,
        }
    }

    pub fn with_flags(mut self, flags: FunctionFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn with_optional(mut self, count: usize) -> Self {
        self.num_optional_parameters = count;
        self
    }

    pub fn num_parameters(&self) -> usize {
        self.num_fixed_parameters + self.num_optional_parameters
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(FunctionFlags::STATIC)
    }

    pub fn is_abstract(&self) -> bool {
        self.flags.contains(FunctionFlags::ABSTRACT)
    }

    pub fn is_native(&self) -> bool {
        self.flags.contains(FunctionFlags::NATIVE)
    }

    pub fn is_optimizable(&self) -> bool {
        self.flags.contains(FunctionFlags::OPTIMIZABLE) && !self.is_native()
    }

    pub fn set_optimizable(&mut self, value: bool) {
        self.flags.set(FunctionFlags::OPTIMIZABLE, value);
    }

    pub fn is_closure_function(&self) -> bool {
        self.kind == FunctionKind::Closure
    }

    /// Reachable through dynamic dispatch.
    pub fn is_dynamic(&self) -> bool {
        !self.is_static()
            && !matches!(self.kind, FunctionKind::Constructor | FunctionKind::Closure | FunctionKind::Signature)
    }

    pub fn has_code(&self) -> bool {
        self.code.is_some()
    }

    pub fn accepts_argument_count(&self, count: usize) -> bool {
        count >= self.num_fixed_parameters && count <= self.num_parameters()
    }

    /// Code is generated by the runtime rather than the compiler.
    pub fn is_synthetic(&self) -> bool {
        matches!(self.kind, FunctionKind::ImplicitGetter | FunctionKind::ImplicitSetter)
            || self.is_native()
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FieldFlags: u8 {
        const STATIC          = 1 << 0;
        const FINAL           = 1 << 1;
        const CONST           = 1 << 2;
        const HAS_INITIALIZER = 1 << 3;
    }
}

/// Outcome of recording a store against a field's guard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardUpdate {
    Unchanged,
    Updated,
    /// Code that relied on the previous guard must be deoptimized.
    Invalidated,
}

#[derive(Debug, Clone)]
pub struct Field {
    pub id: FieldId,
    pub name: String,
    pub owner: ClassId,
    pub flags: FieldFlags,
    /// Byte offset of an instance field.
    pub offset: usize,
    /// Slot in the isolate's static table for a static field.
    pub static_index: usize,
    pub declared_type: ClassId,
    pub guarded_cid: ClassId,
    pub is_nullable: bool,
    /// Optimized code that assumes the current guard. Weak: dead code is
    /// skipped when the guard changes.
    pub dependent_code: Vec<CodeId>,
}

impl Field {
    pub fn new(name: impl Into<String>, owner: ClassId, flags: FieldFlags) -> Self {
        Self {
            id: FieldId(u32::MAX),
            name: name.into(),
            owner,
            flags,
            offset: 0,
            static_index: 0,
            declared_type: cid::DYNAMIC,
            guarded_cid: cid::ILLEGAL,
            is_nullable: false,
            dependent_code: Vec::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.flags.contains(FieldFlags::STATIC)
    }

    pub fn is_final(&self) -> bool {
        self.flags.intersects(FieldFlags::FINAL | FieldFlags::CONST)
    }

    pub fn getter_name(&self) -> String {
        getter_name(&self.name)
    }

    pub fn setter_name(&self) -> String {
        setter_name(&self.name)
    }

    /// Widens the guard to admit a value of class `value_cid`.
    pub fn record_store(&mut self, value_cid: ClassId) -> GuardUpdate {
        if value_cid == cid::NULL {
            if self.is_nullable {
                return GuardUpdate::Unchanged;
            }
            self.is_nullable = true;
            return if self.dependent_code.is_empty() {
                GuardUpdate::Updated
            } else {
                GuardUpdate::Invalidated
            };
        }
        match self.guarded_cid {
            cid::DYNAMIC => GuardUpdate::Unchanged,
            g if g == value_cid => GuardUpdate::Unchanged,
            cid::ILLEGAL => {
                self.guarded_cid = value_cid;
                GuardUpdate::Updated
            }
            _ => {
                self.guarded_cid = cid::DYNAMIC;
                GuardUpdate::Invalidated
            }
        }
    }
}

pub fn getter_name(field: &str) -> String {
    format!("get:{field}")
}

pub fn setter_name(field: &str) -> String {
    format!("set:{field}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameter_counts() {
        let f = Function::new("m", cid::NUM_PREDEFINED, FunctionKind::Regular, 2).with_optional(1);
        assert_eq!(f.num_parameters(), 3);
        assert!(!f.accepts_argument_count(1));
        assert!(f.accepts_argument_count(2));
        assert!(f.accepts_argument_count(3));
        assert!(!f.accepts_argument_count(4));
    }

    #[test]
    fn static_and_closure_functions_are_not_dynamic() {
        let f = Function::new("s", cid::NUM_PREDEFINED, FunctionKind::Regular, 0)
            .with_flags(FunctionFlags::STATIC);
        assert!(!f.is_dynamic());
        let c = Function::new("c", cid::NUM_PREDEFINED, FunctionKind::Closure, 1);
        assert!(!c.is_dynamic());
        let m = Function::new("m", cid::NUM_PREDEFINED, FunctionKind::Regular, 1);
        assert!(m.is_dynamic());
        assert!(m.is_optimizable());
    }

    #[test]
    fn natives_are_not_optimizable() {
        let f = Function::new("n", cid::NUM_PREDEFINED, FunctionKind::Regular, 1)
            .with_flags(FunctionFlags::NATIVE);
        assert!(!f.is_optimizable());
        assert!(f.is_synthetic());
    }

    #[test]
    fn field_guard_widens_to_dynamic() {
        let mut field = Field::new("x", cid::NUM_PREDEFINED, FieldFlags::empty());
        assert_eq!(field.record_store(cid::SMI), GuardUpdate::Updated);
        assert_eq!(field.guarded_cid, cid::SMI);
        assert_eq!(field.record_store(cid::SMI), GuardUpdate::Unchanged);
        assert_eq!(field.record_store(cid::DOUBLE), GuardUpdate::Invalidated);
        assert_eq!(field.guarded_cid, cid::DYNAMIC);
        assert_eq!(field.record_store(cid::ARRAY), GuardUpdate::Unchanged);
    }

    #[test]
    fn null_store_marks_nullable() {
        let mut field = Field::new("x", cid::NUM_PREDEFINED, FieldFlags::empty());
        assert_eq!(field.record_store(cid::NULL), GuardUpdate::Updated);
        assert!(field.is_nullable);
        assert_eq!(field.guarded_cid, cid::ILLEGAL);

        let mut guarded = Field::new("y", cid::NUM_PREDEFINED, FieldFlags::empty());
        guarded.record_store(cid::SMI);
        guarded.dependent_code.push(CodeId(0));
        assert_eq!(guarded.record_store(cid::NULL), GuardUpdate::Invalidated);
    }

    #[test]
    fn accessor_names() {
        assert_eq!(getter_name("x"), "get:x");
        assert_eq!(setter_name("x"), "set:x");
    }
}
