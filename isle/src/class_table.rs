//! Dense class-id → class mapping.
//!
//! Ids below [`cid::NUM_PREDEFINED`] are the built-in kinds; user classes
//! are registered after them. Lookup is a vector index.

use object::{ClassId, WORD_SIZE, class_id, cid, round_up_to_alignment};

use crate::function::{FieldId, FunctionId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ClassState {
    Allocated,
    PreFinalized,
    BeingFinalized,
    Finalized,
}

#[derive(Debug, Clone)]
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub super_class: Option<ClassId>,
    pub interfaces: Vec<ClassId>,
    /// Allocation size in bytes; 0 for variable-length kinds.
    pub instance_size: usize,
    pub next_field_offset: usize,
    pub type_arguments_field_offset: Option<usize>,
    pub num_type_parameters: usize,
    pub fields: Vec<FieldId>,
    pub functions: Vec<FunctionId>,
    pub state: ClassState,
    pub direct_subclasses: Vec<ClassId>,
    /// Entry point of the per-class allocation stub, once generated.
    pub allocation_stub: Option<usize>,
    pub is_abstract: bool,
    /// Untagged embedder words stored as smis, starting at
    /// `native_fields_offset`.
    pub num_native_fields: usize,
    pub native_fields_offset: usize,
}

impl Class {
    pub fn new(name: impl Into<String>, super_class: Option<ClassId>) -> Self {
        Self {
            id: cid::ILLEGAL,
            name: name.into(),
            super_class,
            interfaces: Vec::new(),
            instance_size: 0,
            next_field_offset: WORD_SIZE,
            type_arguments_field_offset: None,
            num_type_parameters: 0,
            fields: Vec::new(),
            functions: Vec::new(),
            state: ClassState::Allocated,
            direct_subclasses: Vec::new(),
            allocation_stub: None,
            is_abstract: false,
            num_native_fields: 0,
            native_fields_offset: 0,
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.state == ClassState::Finalized
    }

    pub fn has_type_arguments(&self) -> bool {
        self.type_arguments_field_offset.is_some()
    }

    /// Words of tagged fields after the header.
    pub fn num_instance_words(&self) -> usize {
        (self.instance_size - WORD_SIZE) / WORD_SIZE
    }

    pub(crate) fn set_instance_size_from_fields(&mut self) {
        self.instance_size = round_up_to_alignment(self.next_field_offset.max(2 * WORD_SIZE));
    }
}

#[derive(Debug, Default)]
pub struct ClassTable {
    classes: Vec<Option<Class>>,
}

impl ClassTable {
    pub fn new() -> Self {
        let mut table = Self {
            classes: Vec::with_capacity(2 * cid::NUM_PREDEFINED as usize),
        };
        table.register_predefined();
        table
    }

    fn register_predefined(&mut self) {
        for id in 0..cid::NUM_PREDEFINED {
            if id == cid::ILLEGAL || id == cid::FREE_LIST_ELEMENT || id == cid::FORWARDING_CORPSE {
                self.classes.push(None);
                continue;
            }
            let mut class = Class::new(class_id::class_name(id), None);
            class.id = id;
            class.state = ClassState::Finalized;
            self.classes.push(Some(class));
        }
    }

    /// Registers `class` under the next free id.
    pub fn register(&mut self, mut class: Class) -> ClassId {
        let id = self.classes.len();
        assert!(id < cid::DYNAMIC as usize, "class table full");
        let id = id as ClassId;
        class.id = id;
        if let Some(parent) = class.super_class.and_then(|s| self.get_mut(s)) {
            parent.direct_subclasses.push(id);
        }
        if self.classes.len() == self.classes.capacity() {
            self.classes.reserve(self.classes.len());
        }
        self.classes.push(Some(class));
        id
    }

    pub fn len(&self) -> usize {
        self.classes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.classes.is_empty()
    }

    pub fn is_valid(&self, id: ClassId) -> bool {
        self.get(id).is_some()
    }

    #[inline]
    pub fn get(&self, id: ClassId) -> Option<&Class> {
        self.classes.get(id as usize).and_then(Option::as_ref)
    }

    #[inline]
    pub fn get_mut(&mut self, id: ClassId) -> Option<&mut Class> {
        self.classes.get_mut(id as usize).and_then(Option::as_mut)
    }

    /// # Panics
    ///
    /// If `id` is not registered.
    #[inline]
    pub fn at(&self, id: ClassId) -> &Class {
        match self.get(id) {
            Some(class) => class,
            None => panic!("invalid class id {id}"),
        }
    }

    #[inline]
    pub fn at_mut(&mut self, id: ClassId) -> &mut Class {
        match self.get_mut(id) {
            Some(class) => class,
            None => panic!("invalid class id {id}"),
        }
    }

    pub fn lookup(&self, name: &str) -> Option<ClassId> {
        self.iter().find(|c| c.name == name).map(|c| c.id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Class> {
        self.classes.iter().filter_map(Option::as_ref)
    }

    pub fn user_classes(&self) -> impl Iterator<Item = &Class> {
        self.iter().filter(|c| c.id >= cid::NUM_PREDEFINED)
    }

    /// Superclass chain starting at `id` (inclusive).
    pub fn superclass_chain(&self, id: ClassId) -> impl Iterator<Item = ClassId> + '_ {
        let mut next = Some(id);
        std::iter::from_fn(move || {
            let current = next?;
            next = self.get(current).and_then(|c| c.super_class);
            Some(current)
        })
    }

    pub fn is_subclass_of(&self, sub: ClassId, sup: ClassId) -> bool {
        self.superclass_chain(sub).any(|c| c == sup)
    }

    /// Subclass or implementer, transitively through interfaces.
    pub fn is_subtype_of(&self, sub: ClassId, sup: ClassId) -> bool {
        if sub == sup {
            return true;
        }
        let Some(class) = self.get(sub) else {
            return false;
        };
        if class.interfaces.iter().any(|&i| self.is_subtype_of(i, sup)) {
            return true;
        }
        match class.super_class {
            Some(parent) => self.is_subtype_of(parent, sup),
            None => false,
        }
    }

    /// All transitive subclasses of `id`, excluding `id`.
    pub fn all_subclasses(&self, id: ClassId) -> Vec<ClassId> {
        let mut out = Vec::new();
        let mut work = vec![id];
        while let Some(current) = work.pop() {
            if let Some(class) = self.get(current) {
                for &sub in &class.direct_subclasses {
                    out.push(sub);
                    work.push(sub);
                }
            }
        }
        out
    }
}
