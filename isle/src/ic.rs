//! Inline caches, megamorphic caches and subtype test caches.
//!
//! An instance call site carries the id of its [`ICData`]. The check array
//! lives in old space as flat rows of `[cid.., target, count]`, terminated
//! by a row whose first cid is `cid::ILLEGAL`. Once a site has seen more
//! receiver classes than `megamorphic_threshold` it is repatched to the
//! megamorphic lookup stub and a shared hash table keyed by class id.

use heap::Space;
use object::{Array, ClassId, SMI_MAX, Value, cid};

use crate::error::{ErrorKind, RuntimeResult};
use crate::function::FunctionId;
use crate::isolate::Isolate;
use crate::stubs::{StubKind, StubOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ICDataId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MegamorphicCacheId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubtypeTestCacheId(pub u32);

#[derive(Debug)]
pub struct ICData {
    pub id: ICDataId,
    /// Function whose code contains the call site.
    pub owner: Option<FunctionId>,
    pub target_name: String,
    pub deopt_id: u32,
    pub num_args_checked: usize,
    pub(crate) entries: Value,
    pub megamorphic: Option<MegamorphicCacheId>,
}

/// One decoded row of an inline cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ICEntry {
    pub class_ids: Vec<ClassId>,
    pub target: FunctionId,
    pub count: usize,
}

impl ICData {
    fn stride(&self) -> usize {
        self.num_args_checked + 2
    }

    fn array(&self) -> &Array {
        unsafe { self.entries.as_ref::<Array>() }
    }

    pub fn num_checks(&self) -> usize {
        let stride = self.stride();
        let array = self.array();
        (0..array.len() / stride)
            .position(|row| array.at(row * stride) == Value::from_i64(cid::ILLEGAL as i64))
            .unwrap_or(array.len() / stride)
    }

    pub fn entry(&self, index: usize) -> ICEntry {
        let n = self.num_args_checked;
        let base = index * self.stride();
        let array = self.array();
        ICEntry {
            class_ids: (0..n).map(|i| array.at(base + i).to_i64() as ClassId).collect(),
            target: FunctionId::from_value(array.at(base + n)),
            count: array.at(base + n + 1).to_usize(),
        }
    }

    /// Row index and target for `class_ids`.
    pub fn lookup(&self, class_ids: &[ClassId]) -> Option<(usize, FunctionId)> {
        let n = self.num_args_checked;
        let stride = self.stride();
        let array = self.array();
        let mut row = 0;
        loop {
            let base = row * stride;
            if base >= array.len() || array.at(base) == Value::from_i64(cid::ILLEGAL as i64) {
                return None;
            }
            if (0..n).all(|i| array.at(base + i).to_i64() as ClassId == class_ids[i]) {
                return Some((row, FunctionId::from_value(array.at(base + n))));
            }
            row += 1;
        }
    }

    /// Saturates at the largest smi.
    fn increment_count(&self, row: usize) {
        let slot = row * self.stride() + self.num_args_checked + 1;
        let array = self.array();
        let count = array.at(slot).to_i64();
        if count < SMI_MAX {
            array.set_at_raw(slot, Value::from_i64(count + 1));
        }
    }

    pub(crate) fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.entries);
    }
}

// ── Megamorphic cache ──────────────────────────────────────────────

const MEGAMORPHIC_INITIAL_CAPACITY: usize = 8;

/// Open-addressed `cid → target` table shared by every megamorphic site
/// calling the same selector.
#[derive(Debug)]
pub struct MegamorphicCache {
    pub id: MegamorphicCacheId,
    pub target_name: String,
    pub num_args: usize,
    /// `[cid, target]` pairs; empty pairs hold `cid::ILLEGAL`.
    pub(crate) buckets: Value,
    filled: usize,
}

impl MegamorphicCache {
    fn capacity(&self) -> usize {
        unsafe { self.buckets.as_ref::<Array>() }.len() / 2
    }

    fn probe_start(class_id: ClassId, mask: usize) -> usize {
        (class_id as usize * 7) & mask
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn lookup(&self, class_id: ClassId) -> Option<FunctionId> {
        let array = unsafe { self.buckets.as_ref::<Array>() };
        let mask = self.capacity() - 1;
        let mut i = Self::probe_start(class_id, mask);
        loop {
            let key = array.at(2 * i).to_i64() as ClassId;
            if key == class_id {
                return Some(FunctionId::from_value(array.at(2 * i + 1)));
            }
            if key == cid::ILLEGAL {
                return None;
            }
            i = (i + 1) & mask;
        }
    }

    fn insert_unchecked(buckets: &Array, class_id: ClassId, target: FunctionId) -> bool {
        let mask = buckets.len() / 2 - 1;
        let mut i = Self::probe_start(class_id, mask);
        loop {
            let key = buckets.at(2 * i).to_i64() as ClassId;
            if key == cid::ILLEGAL || key == class_id {
                buckets.set_at_raw(2 * i, Value::from_i64(class_id as i64));
                buckets.set_at_raw(2 * i + 1, target.to_value());
                return key == cid::ILLEGAL;
            }
            i = (i + 1) & mask;
        }
    }

    pub(crate) fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.buckets);
    }
}

// ── Subtype test cache ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct SubtypeTestEntry {
    class_id: ClassId,
    instance_type_arguments: Value,
    instantiator_type_arguments: Value,
    result: bool,
}

/// Memoized `instance is target_class` results for one test site.
#[derive(Debug)]
pub struct SubtypeTestCache {
    pub id: SubtypeTestCacheId,
    pub target_class: ClassId,
    entries: Vec<SubtypeTestEntry>,
}

impl SubtypeTestCache {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `checks` selects how many of the keys take part in the match.
    fn lookup(&self, checks: usize, class_id: ClassId, instance_ta: Value, instantiator_ta: Value) -> Option<bool> {
        self.entries
            .iter()
            .find(|e| {
                e.class_id == class_id
                    && (checks < 2 || e.instance_type_arguments == instance_ta)
                    && (checks < 3 || e.instantiator_type_arguments == instantiator_ta)
            })
            .map(|e| e.result)
    }

    pub(crate) fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for entry in &mut self.entries {
            visitor(&mut entry.instance_type_arguments);
            visitor(&mut entry.instantiator_type_arguments);
        }
    }
}

// ── Isolate integration ────────────────────────────────────────────

impl Isolate {
    pub fn new_ic_data(
        &mut self,
        owner: Option<FunctionId>,
        target_name: &str,
        num_args_checked: usize,
        deopt_id: u32,
    ) -> RuntimeResult<ICDataId> {
        let stride = num_args_checked + 2;
        let entries = self.new_array_in(stride, Space::Old)?;
        unsafe { entries.as_ref::<Array>() }.set_at_raw(0, Value::from_i64(cid::ILLEGAL as i64));
        for i in 1..stride {
            unsafe { entries.as_ref::<Array>() }.set_at_raw(i, Value::from_i64(0));
        }
        let id = ICDataId(self.roots.ic_data.len() as u32);
        self.roots.ic_data.push(ICData {
            id,
            owner,
            target_name: target_name.to_owned(),
            deopt_id,
            num_args_checked,
            entries,
            megamorphic: None,
        });
        Ok(id)
    }

    pub fn ic_data(&self, id: ICDataId) -> &ICData {
        &self.roots.ic_data[id.0 as usize]
    }

    /// Appends a check row; the new row starts with a count of 1.
    pub(crate) fn ic_add_check(&mut self, id: ICDataId, class_ids: &[ClassId], target: FunctionId) -> RuntimeResult<()> {
        let (old, stride, checks) = {
            let ic = self.ic_data(id);
            (ic.entries, ic.stride(), ic.num_checks())
        };
        let grown = self.new_array_in((checks + 2) * stride, Space::Old)?;
        let old = if self.roots.ic_data[id.0 as usize].entries == old {
            old
        } else {
            self.roots.ic_data[id.0 as usize].entries
        };
        let (src, dst) = unsafe { (old.as_ref::<Array>(), grown.as_ref::<Array>()) };
        for i in 0..checks * stride {
            dst.set_at_raw(i, src.at(i));
        }
        let base = checks * stride;
        for (i, &class_id) in class_ids.iter().enumerate() {
            dst.set_at_raw(base + i, Value::from_i64(class_id as i64));
        }
        let n = class_ids.len();
        dst.set_at_raw(base + n, target.to_value());
        dst.set_at_raw(base + n + 1, Value::from_i64(1));
        dst.set_at_raw(base + stride, Value::from_i64(cid::ILLEGAL as i64));
        for i in 1..stride {
            dst.set_at_raw(base + stride + i, Value::from_i64(0));
        }
        self.roots.ic_data[id.0 as usize].entries = grown;
        Ok(())
    }

    // ── Megamorphic caches ─────────────────────────────────────────

    pub fn megamorphic_cache(&self, id: MegamorphicCacheId) -> &MegamorphicCache {
        &self.roots.megamorphic_caches[id.0 as usize]
    }

    fn megamorphic_cache_for(&mut self, target_name: &str, num_args: usize) -> RuntimeResult<MegamorphicCacheId> {
        if let Some(cache) = self
            .roots
            .megamorphic_caches
            .iter()
            .find(|c| c.target_name == target_name && c.num_args == num_args)
        {
            return Ok(cache.id);
        }
        let buckets = self.new_empty_buckets(MEGAMORPHIC_INITIAL_CAPACITY)?;
        let id = MegamorphicCacheId(self.roots.megamorphic_caches.len() as u32);
        self.roots.megamorphic_caches.push(MegamorphicCache {
            id,
            target_name: target_name.to_owned(),
            num_args,
            buckets,
            filled: 0,
        });
        Ok(id)
    }

    fn new_empty_buckets(&mut self, capacity: usize) -> RuntimeResult<Value> {
        let buckets = self.new_array_in(2 * capacity, Space::Old)?;
        let array = unsafe { buckets.as_ref::<Array>() };
        for i in 0..capacity {
            array.set_at_raw(2 * i, Value::from_i64(cid::ILLEGAL as i64));
            array.set_at_raw(2 * i + 1, Value::from_i64(0));
        }
        Ok(buckets)
    }

    /// Inserts, doubling the table once it would be more than 3/4 full.
    pub(crate) fn megamorphic_insert(
        &mut self,
        id: MegamorphicCacheId,
        class_id: ClassId,
        target: FunctionId,
    ) -> RuntimeResult<()> {
        let (filled, capacity) = {
            let cache = self.megamorphic_cache(id);
            (cache.filled, cache.capacity())
        };
        if (filled + 1) * 4 > capacity * 3 {
            let grown = self.new_empty_buckets(capacity * 2)?;
            let old = self.megamorphic_cache(id).buckets;
            let (src, dst) = unsafe { (old.as_ref::<Array>(), grown.as_ref::<Array>()) };
            for i in 0..capacity {
                let key = src.at(2 * i).to_i64() as ClassId;
                if key != cid::ILLEGAL {
                    MegamorphicCache::insert_unchecked(dst, key, FunctionId::from_value(src.at(2 * i + 1)));
                }
            }
            self.roots.megamorphic_caches[id.0 as usize].buckets = grown;
        }
        let cache = &mut self.roots.megamorphic_caches[id.0 as usize];
        let buckets = unsafe { cache.buckets.as_ref::<Array>() };
        if MegamorphicCache::insert_unchecked(buckets, class_id, target) {
            cache.filled += 1;
        }
        Ok(())
    }

    // ── Stubs ──────────────────────────────────────────────────────

    /// Classifies the checked arguments, hits or extends the cache, and
    /// tail calls the target.
    pub(crate) fn inline_cache_stub(&mut self, kind: StubKind, argc: usize, rbx: u64) -> RuntimeResult<StubOutcome> {
        let Some((num_checked, optimized)) = kind.inline_cache_args() else {
            return Err(self.raise_error(ErrorKind::Api, "not an inline cache stub"));
        };
        let id = ICDataId(rbx as u32);
        if !optimized {
            self.count_usage_of_ic_owner(id)?;
        }
        let class_ids: Vec<ClassId> = (0..num_checked.min(argc)).map(|i| self.class_id_of(self.stub_arg(argc, i))).collect();

        let hit = self.ic_data(id).lookup(&class_ids);
        let target = match hit {
            Some((row, target)) => {
                self.ic_data(id).increment_count(row);
                target
            }
            None => {
                let Some(target) = self.resolve_ic_miss(id, class_ids[0], argc)? else {
                    return self.no_such_method(id, argc);
                };
                self.ic_add_check(id, &class_ids, target)?;
                log::trace!(
                    "ic {} '{}' miss: {} -> {}",
                    id.0,
                    self.ic_data(id).target_name,
                    object::class_id::class_name(class_ids[0]),
                    self.function(target).name
                );
                if self.ic_data(id).num_checks() > self.runtime.flags().megamorphic_threshold {
                    self.switch_to_megamorphic(id)?;
                }
                target
            }
        };
        let code = self.ensure_code(target)?;
        Ok(StubOutcome::Jump(self.code(code).entry_point()))
    }

    fn resolve_ic_miss(&mut self, id: ICDataId, class_id: ClassId, argc: usize) -> RuntimeResult<Option<FunctionId>> {
        let name = self.ic_data(id).target_name.clone();
        Ok(self.resolve_dynamic(class_id, &name, argc))
    }

    fn count_usage_of_ic_owner(&mut self, id: ICDataId) -> RuntimeResult<()> {
        let Some(owner) = self.ic_data(id).owner else {
            return Ok(());
        };
        let threshold = self.runtime.flags().optimization_counter_threshold;
        let (hot, code) = {
            let function = self.function_mut(owner);
            function.usage_counter = function.usage_counter.saturating_add(1);
            (function.usage_counter >= threshold && function.is_optimizable(), function.code)
        };
        let already_optimized = code.is_some_and(|c| self.code(c).is_optimized);
        if hot && !already_optimized {
            self.optimize_function(owner)?;
        }
        Ok(())
    }

    /// Builds the shared cache from the site's checks and repatches the
    /// call site to the megamorphic lookup stub.
    fn switch_to_megamorphic(&mut self, id: ICDataId) -> RuntimeResult<()> {
        let (name, num_args) = {
            let ic = self.ic_data(id);
            (ic.target_name.clone(), ic.num_args_checked)
        };
        let cache = self.megamorphic_cache_for(&name, num_args)?;
        let checks = self.ic_data(id).num_checks();
        for row in 0..checks {
            let entry = self.ic_data(id).entry(row);
            self.megamorphic_insert(cache, entry.class_ids[0], entry.target)?;
        }
        self.roots.ic_data[id.0 as usize].megamorphic = Some(cache);

        let ret = self.stub_return_address();
        let stub = self.stub_entry(StubKind::MegamorphicLookup);
        crate::patcher::set_instance_call_at(ret, cache.0 as u64, stub);
        log::trace!("ic {} '{}' megamorphic after {} classes", id.0, name, checks);
        Ok(())
    }

    pub(crate) fn megamorphic_lookup_stub(&mut self, argc: usize, rbx: u64) -> RuntimeResult<StubOutcome> {
        let id = MegamorphicCacheId(rbx as u32);
        let receiver = self.stub_arg(argc, 0);
        let class_id = self.class_id_of(receiver);
        let target = match self.megamorphic_cache(id).lookup(class_id) {
            Some(target) => target,
            None => {
                let name = self.megamorphic_cache(id).target_name.clone();
                match self.resolve_dynamic(class_id, &name, argc) {
                    Some(target) => {
                        self.megamorphic_insert(id, class_id, target)?;
                        target
                    }
                    None => {
                        let message = format!(
                            "NoSuchMethodError: Class '{}' has no instance method '{}'",
                            self.class_name_of(class_id),
                            name
                        );
                        return Err(self.throw_message(&message));
                    }
                }
            }
        };
        let code = self.ensure_code(target)?;
        Ok(StubOutcome::Jump(self.code(code).entry_point()))
    }

    /// Redirects to `noSuchMethod(receiver, name, arguments)` when the
    /// receiver's class has one, otherwise throws.
    fn no_such_method(&mut self, id: ICDataId, argc: usize) -> RuntimeResult<StubOutcome> {
        let name = self.ic_data(id).target_name.clone();
        let receiver = self.stub_arg(argc, 0);
        let class_id = self.class_id_of(receiver);
        let Some(handler) = self.resolve_dynamic(class_id, "noSuchMethod", 3) else {
            let message = format!(
                "NoSuchMethodError: Class '{}' has no instance method '{}'",
                self.class_name_of(class_id),
                name
            );
            return Err(self.throw_message(&message));
        };
        let symbol = self.symbol(&name)?;
        let arguments = self.new_array(argc - 1)?;
        for i in 1..argc {
            let value = self.stub_arg(argc, i);
            self.array_set(arguments, i - 1, value);
        }
        let (code, arguments) = self.with_rooted(&[arguments], |isolate, mark| {
            let code = isolate.ensure_code(handler)?;
            Ok((code, isolate.roots.scratch[mark]))
        })?;
        let frames = &mut self.roots.frames;
        let ret = frames.pop_raw();
        let receiver = frames.peek(argc - 1);
        let depth = frames.depth();
        frames.truncate(depth - argc);
        frames.push(receiver);
        frames.push(symbol);
        frames.push(arguments);
        frames.push_raw(ret);
        self.regs.r10 = 3;
        Ok(StubOutcome::Jump(self.code(code).entry_point()))
    }

    pub(crate) fn class_name_of(&self, class_id: ClassId) -> String {
        self.class_table
            .get(class_id)
            .map_or_else(|| object::class_id::class_name(class_id).to_owned(), |c| c.name.clone())
    }

    // ── Subtype tests ──────────────────────────────────────────────

    pub fn new_subtype_test_cache(&mut self, target_class: ClassId) -> SubtypeTestCacheId {
        let id = SubtypeTestCacheId(self.roots.subtype_caches.len() as u32);
        self.roots.subtype_caches.push(SubtypeTestCache {
            id,
            target_class,
            entries: Vec::new(),
        });
        id
    }

    pub fn subtype_test_cache(&self, id: SubtypeTestCacheId) -> &SubtypeTestCache {
        &self.roots.subtype_caches[id.0 as usize]
    }

    fn instance_type_arguments(&self, instance: Value) -> Value {
        if instance.is_smi() {
            return self.null();
        }
        match self.class_table.get(self.class_id_of(instance)).and_then(|c| c.type_arguments_field_offset) {
            Some(offset) => self.instance_field(instance, offset),
            None => self.null(),
        }
    }

    /// `instance is class_id`. Null is only an instance of Null and of
    /// the dynamic type.
    pub fn is_instance_of_class(&self, instance: Value, class_id: ClassId, _instantiator_type_arguments: Value) -> bool {
        if class_id == cid::DYNAMIC {
            return true;
        }
        if instance == self.null() {
            return class_id == cid::NULL;
        }
        self.class_table.is_subtype_of(self.class_id_of(instance), class_id)
    }

    /// `[instance, instantiator type arguments]`, `rbx` = cache id.
    pub(crate) fn subtype_test_cache_stub(&mut self, kind: StubKind, argc: usize, rbx: u64) -> RuntimeResult<StubOutcome> {
        let checks = match kind {
            StubKind::SubtypeTestCache1 => 1,
            StubKind::SubtypeTestCache2 => 2,
            _ => 3,
        };
        let id = SubtypeTestCacheId(rbx as u32);
        let instance = self.stub_arg(argc, 0);
        let instantiator_ta = if argc > 1 { self.stub_arg(argc, 1) } else { self.null() };
        let class_id = self.class_id_of(instance);
        let instance_ta = self.instance_type_arguments(instance);
        if let Some(result) = self.subtype_test_cache(id).lookup(checks, class_id, instance_ta, instantiator_ta) {
            return Ok(StubOutcome::Return(self.bool_value(result)));
        }
        let target = self.subtype_test_cache(id).target_class;
        let result = self.is_instance_of_class(instance, target, instantiator_ta);
        self.roots.subtype_caches[id.0 as usize].entries.push(SubtypeTestEntry {
            class_id,
            instance_type_arguments: instance_ta,
            instantiator_type_arguments: instantiator_ta,
            result,
        });
        log::trace!("subtype cache {} miss: {} is {} = {}", id.0, class_id, target, result);
        Ok(StubOutcome::Return(self.bool_value(result)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::class_table::Class;
    use crate::function::{Function, FunctionKind};
    use crate::runtime::{Runtime, RuntimeConfig};

    fn with_isolate<R>(f: impl FnOnce(&mut Isolate) -> R) -> R {
        let _ = env_logger::builder().is_test(true).try_init();
        let runtime = Runtime::initialize(RuntimeConfig::default()).unwrap();
        let handle = runtime.create_isolate("ic", 0).unwrap();
        let result = handle.with(f).unwrap();
        handle.shutdown().unwrap();
        result
    }

    fn method(isolate: &mut Isolate, owner: ClassId, name: &str) -> FunctionId {
        isolate.add_function(Function::new(name, owner, FunctionKind::Regular, 1)).unwrap()
    }

    // ── Check arrays ───────────────────────────────────────────────

    #[test]
    fn checks_append_and_hit() {
        with_isolate(|isolate| {
            let a = isolate.register_class(Class::new("A", None));
            let f = method(isolate, a, "m");
            let id = isolate.new_ic_data(None, "m", 1, 0).unwrap();
            assert_eq!(isolate.ic_data(id).num_checks(), 0);
            assert!(isolate.ic_data(id).lookup(&[a]).is_none());

            isolate.ic_add_check(id, &[a], f).unwrap();
            let ic = isolate.ic_data(id);
            assert_eq!(ic.num_checks(), 1);
            assert_eq!(ic.entry(0), ICEntry { class_ids: vec![a], target: f, count: 1 });
            let (row, target) = ic.lookup(&[a]).unwrap();
            assert_eq!((row, target), (0, f));
            ic.increment_count(row);
            assert_eq!(isolate.ic_data(id).entry(0).count, 2);
        });
    }

    #[test]
    fn two_argument_checks_match_both_classes() {
        with_isolate(|isolate| {
            let a = isolate.register_class(Class::new("A", None));
            let f = method(isolate, a, "+");
            let id = isolate.new_ic_data(None, "+", 2, 0).unwrap();
            isolate.ic_add_check(id, &[a, cid::SMI], f).unwrap();
            assert!(isolate.ic_data(id).lookup(&[a, cid::SMI]).is_some());
            assert!(isolate.ic_data(id).lookup(&[a, cid::DOUBLE]).is_none());
        });
    }

    #[test]
    fn check_arrays_survive_collection() {
        with_isolate(|isolate| {
            let a = isolate.register_class(Class::new("A", None));
            let f = method(isolate, a, "m");
            let id = isolate.new_ic_data(None, "m", 1, 0).unwrap();
            isolate.ic_add_check(id, &[a], f).unwrap();
            isolate.collect_all_garbage();
            assert_eq!(isolate.ic_data(id).lookup(&[a]), Some((0, f)));
        });
    }

    // ── Megamorphic ────────────────────────────────────────────────

    #[test]
    fn megamorphic_table_grows_and_finds_everything() {
        with_isolate(|isolate| {
            let mut entries = Vec::new();
            for i in 0..20 {
                let c = isolate.register_class(Class::new(format!("C{i}"), None));
                let f = method(isolate, c, "toString");
                entries.push((c, f));
            }
            let id = isolate.megamorphic_cache_for("toString", 1).unwrap();
            for &(c, f) in &entries {
                isolate.megamorphic_insert(id, c, f).unwrap();
            }
            let cache = isolate.megamorphic_cache(id);
            assert_eq!(cache.len(), 20);
            assert!(cache.capacity() >= 32);
            assert!(cache.len() * 4 <= cache.capacity() * 3);
            for &(c, f) in &entries {
                assert_eq!(cache.lookup(c), Some(f));
            }
            assert_eq!(cache.lookup(cid::SMI), None);
            assert_eq!(isolate.megamorphic_cache_for("toString", 1).unwrap(), id);
        });
    }

    // ── Subtype tests ──────────────────────────────────────────────

    #[test]
    fn instance_of_follows_the_hierarchy() {
        with_isolate(|isolate| {
            let a = isolate.register_class(Class::new("A", None));
            isolate.finalize_class(a).unwrap();
            let b = isolate.register_class(Class::new("B", Some(a)));
            isolate.finalize_class(b).unwrap();
            let obj = isolate.new_instance(b).unwrap();
            let null = isolate.null();
            assert!(isolate.is_instance_of_class(obj, a, null));
            assert!(isolate.is_instance_of_class(obj, cid::DYNAMIC, null));
            let a_obj = isolate.new_instance(a).unwrap();
            assert!(!isolate.is_instance_of_class(a_obj, b, null));
            assert!(isolate.is_instance_of_class(null, cid::NULL, null));
            assert!(!isolate.is_instance_of_class(null, a, null));
            assert!(isolate.is_instance_of_class(Value::from_i64(3), cid::SMI, null));
        });
    }
}
