//! Compiled code and the side tables the runtime consults while executing
//! it: pc descriptors, stack maps, deoptimization info, exception handlers
//! and static call targets.
//!
//! The instruction bytes live in an `Instructions` object in code space.
//! Everything else is plain Rust data owned by the isolate's code arena.

use object::{ClassId, Instructions, Value};

use crate::function::FunctionId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub u32);

impl CodeId {
    pub fn to_value(self) -> Value {
        Value::from_usize(self.0 as usize)
    }

    pub fn from_value(value: Value) -> CodeId {
        debug_assert!(value.is_smi());
        CodeId(value.to_usize() as u32)
    }
}

/// Deopt id of sites that cannot deoptimize.
pub const NO_DEOPT_ID: u32 = u32::MAX;
/// Try index of code outside any try block.
pub const NO_TRY_INDEX: i32 = -1;
pub const NO_TOKEN_POS: i32 = -1;

// ── PC descriptors ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcDescriptorKind {
    /// Continuation of an eager deoptimization with the same id.
    Deopt,
    /// Start of the patchable entry region.
    EntryPatch,
    /// First instruction after the entry region.
    PatchCode,
    LazyDeoptJump,
    /// Return address of an instance call.
    IcCall,
    /// Return address of a static or closure call.
    FuncCall,
    Return,
    /// Return address of a runtime or stub call.
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcDescriptor {
    pub pc_offset: u32,
    pub kind: PcDescriptorKind,
    pub deopt_id: u32,
    pub token_pos: i32,
    pub try_index: i32,
}

#[derive(Debug, Clone, Default)]
pub struct PcDescriptors {
    rows: Vec<PcDescriptor>,
}

impl PcDescriptors {
    pub fn new(mut rows: Vec<PcDescriptor>) -> Self {
        rows.sort_by_key(|r| r.pc_offset);
        Self { rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PcDescriptor> {
        self.rows.iter()
    }

    pub fn at_pc(&self, pc_offset: u32) -> impl Iterator<Item = &PcDescriptor> {
        let start = self.rows.partition_point(|r| r.pc_offset < pc_offset);
        self.rows[start..].iter().take_while(move |r| r.pc_offset == pc_offset)
    }

    pub fn find(&self, pc_offset: u32, kind: PcDescriptorKind) -> Option<&PcDescriptor> {
        self.at_pc(pc_offset).find(|r| r.kind == kind)
    }

    pub fn find_by_deopt_id(&self, deopt_id: u32, kind: PcDescriptorKind) -> Option<&PcDescriptor> {
        self.rows.iter().find(|r| r.deopt_id == deopt_id && r.kind == kind)
    }

    /// The try block covering `pc_offset`, taken from the row recorded there.
    pub fn try_index_at(&self, pc_offset: u32) -> i32 {
        self.at_pc(pc_offset).map(|r| r.try_index).max().unwrap_or(NO_TRY_INDEX)
    }

    pub fn token_pos_at(&self, pc_offset: u32) -> i32 {
        self.rows
            .iter()
            .rev()
            .find(|r| r.pc_offset <= pc_offset && r.token_pos != NO_TOKEN_POS)
            .map_or(NO_TOKEN_POS, |r| r.token_pos)
    }

    /// The closest instance call whose return address is at or before
    /// `pc_offset`.
    pub fn ic_call_before(&self, pc_offset: u32) -> Option<&PcDescriptor> {
        self.rows
            .iter()
            .rev()
            .find(|r| r.kind == PcDescriptorKind::IcCall && r.pc_offset <= pc_offset)
    }
}

// ── Stack maps ─────────────────────────────────────────────────────

/// Tagged-slot bitmap of one frame at one safepoint.
///
/// Bit `i` covers the slot `i` words above the frame's pc marker, so locals
/// come first and outgoing arguments last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackMap {
    pub pc_offset: u32,
    slot_count: u16,
    bits: Vec<u8>,
}

impl StackMap {
    pub fn from_slots(pc_offset: u32, tagged: &[bool]) -> Self {
        let mut bits = vec![0u8; tagged.len().div_ceil(8)];
        for (i, &is_object) in tagged.iter().enumerate() {
            if is_object {
                bits[i / 8] |= 1 << (i % 8);
            }
        }
        Self {
            pc_offset,
            slot_count: tagged.len() as u16,
            bits,
        }
    }

    pub fn slot_count(&self) -> usize {
        self.slot_count as usize
    }

    pub fn is_object(&self, slot: usize) -> bool {
        slot < self.slot_count() && self.bits[slot / 8] & (1 << (slot % 8)) != 0
    }
}

#[derive(Debug, Clone, Default)]
pub struct StackMaps {
    maps: Vec<StackMap>,
}

impl StackMaps {
    pub fn new(mut maps: Vec<StackMap>) -> Self {
        maps.sort_by_key(|m| m.pc_offset);
        maps.dedup_by_key(|m| m.pc_offset);
        Self { maps }
    }

    pub fn find(&self, pc_offset: u32) -> Option<&StackMap> {
        self.maps
            .binary_search_by_key(&pc_offset, |m| m.pc_offset)
            .ok()
            .map(|i| &self.maps[i])
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }
}

// ── Deoptimization info ────────────────────────────────────────────

/// How to produce one slot of the unoptimized frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptInstr {
    /// Copy the tagged value of optimized slot `n`.
    StackSlot(u16),
    /// Object pool entry `n` of the optimized code.
    Constant(u16),
    /// Box the raw double held in optimized slot `n`.
    BoxDouble(u16),
    /// Box the raw integer held in optimized slot `n`.
    BoxInt64(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeoptReason {
    CheckSmi,
    CheckClass,
    UnboxDouble,
    UnboxInt64,
    FieldGuard,
    CodeDisabled,
}

#[derive(Debug, Clone)]
struct DeoptInfo {
    /// Instructions unique to this entry.
    prefix: Vec<DeoptInstr>,
    /// Shared tail: `(info index, length)` taken from the end of another
    /// entry's expansion.
    suffix: Option<(usize, usize)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeoptEntry {
    pub deopt_id: u32,
    pub reason: DeoptReason,
    info: usize,
}

/// Deopt entries of one optimized code object. Entries with a common tail
/// share it instead of storing it twice.
#[derive(Debug, Clone, Default)]
pub struct DeoptTable {
    entries: Vec<DeoptEntry>,
    infos: Vec<DeoptInfo>,
}

impl DeoptTable {
    pub fn add(&mut self, deopt_id: u32, reason: DeoptReason, instrs: Vec<DeoptInstr>) {
        let mut best: Option<(usize, usize)> = None;
        for index in 0..self.infos.len() {
            let other = self.expand_info(index);
            let shared = instrs
                .iter()
                .rev()
                .zip(other.iter().rev())
                .take_while(|(a, b)| a == b)
                .count();
            if shared > best.map_or(1, |(_, len)| len) {
                best = Some((index, shared));
            }
        }
        let info = match best {
            Some((index, len)) => DeoptInfo {
                prefix: instrs[..instrs.len() - len].to_vec(),
                suffix: Some((index, len)),
            },
            None => DeoptInfo {
                prefix: instrs,
                suffix: None,
            },
        };
        self.infos.push(info);
        self.entries.push(DeoptEntry {
            deopt_id,
            reason,
            info: self.infos.len() - 1,
        });
    }

    fn expand_info(&self, index: usize) -> Vec<DeoptInstr> {
        let info = &self.infos[index];
        let mut out = info.prefix.clone();
        if let Some((other, len)) = info.suffix {
            let tail = self.expand_info(other);
            out.extend_from_slice(&tail[tail.len() - len..]);
        }
        out
    }

    pub fn find(&self, deopt_id: u32) -> Option<(DeoptEntry, Vec<DeoptInstr>)> {
        let entry = *self.entries.iter().find(|e| e.deopt_id == deopt_id)?;
        Some((entry, self.expand_info(entry.info)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Instructions stored across all entries, after suffix sharing.
    pub fn stored_instructions(&self) -> usize {
        self.infos.iter().map(|i| i.prefix.len()).sum()
    }
}

// ── Exception handlers ─────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionHandler {
    pub try_index: i32,
    pub outer_try_index: i32,
    pub handler_pc: u32,
    /// Operand stack depth (slots above the pc marker) at the handler.
    pub stack_depth: u16,
    /// Empty catches everything.
    pub handled_types: Vec<ClassId>,
}

#[derive(Debug, Clone, Default)]
pub struct ExceptionHandlers {
    handlers: Vec<ExceptionHandler>,
}

impl ExceptionHandlers {
    pub fn new(mut handlers: Vec<ExceptionHandler>) -> Self {
        handlers.sort_by_key(|h| h.try_index);
        Self { handlers }
    }

    pub fn get(&self, try_index: i32) -> Option<&ExceptionHandler> {
        self.handlers.iter().find(|h| h.try_index == try_index)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

// ── Static calls ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticCallEntry {
    /// Offset of the call's return address.
    pub pc_offset: u32,
    pub function: FunctionId,
    pub code: Option<CodeId>,
}

// ── Code ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Code {
    pub id: CodeId,
    pub name: String,
    pub function: Option<FunctionId>,
    /// `Instructions` object in code space. Never moves.
    pub instructions: Value,
    /// Offsets of 8-byte immediates holding old-space object pointers.
    pub pointer_offsets: Vec<u32>,
    pub pc_descriptors: PcDescriptors,
    pub stack_maps: StackMaps,
    pub deopt_table: DeoptTable,
    pub exception_handlers: ExceptionHandlers,
    pub static_calls: Vec<StaticCallEntry>,
    pub object_pool: Vec<Value>,
    pub num_params: usize,
    pub num_locals: usize,
    pub is_optimized: bool,
    /// Cleared when the entry is patched to jump to `fix_callers_target`.
    pub is_alive: bool,
}

impl Code {
    pub fn instructions(&self) -> &Instructions {
        unsafe { self.instructions.as_ref() }
    }

    pub fn entry_point(&self) -> usize {
        self.instructions().entry_point()
    }

    pub fn size(&self) -> usize {
        self.instructions().size()
    }

    pub fn contains(&self, pc: usize) -> bool {
        let entry = self.entry_point();
        pc >= entry && pc < entry + self.size()
    }

    /// Like `contains`, but also accepts the end address: a return address
    /// after a trailing call.
    pub fn contains_return_address(&self, pc: usize) -> bool {
        let entry = self.entry_point();
        pc > entry && pc <= entry + self.size()
    }

    pub fn pc_offset(&self, pc: usize) -> u32 {
        (pc - self.entry_point()) as u32
    }

    pub fn static_call_at(&self, pc_offset: u32) -> Option<&StaticCallEntry> {
        self.static_calls.iter().find(|e| e.pc_offset == pc_offset)
    }

    pub(crate) fn static_call_at_mut(&mut self, pc_offset: u32) -> Option<&mut StaticCallEntry> {
        self.static_calls.iter_mut().find(|e| e.pc_offset == pc_offset)
    }

    /// Visits the object pool and the objects embedded in the instruction
    /// stream.
    pub(crate) fn visit_pointers(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.instructions);
        for slot in &mut self.object_pool {
            visitor(slot);
        }
        let entry = self.entry_point();
        for &offset in &self.pointer_offsets {
            let addr = (entry + offset as usize) as *mut Value;
            unsafe {
                let mut value = addr.read_unaligned();
                visitor(&mut value);
                addr.write_unaligned(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(pc: u32, kind: PcDescriptorKind, deopt_id: u32, try_index: i32) -> PcDescriptor {
        PcDescriptor {
            pc_offset: pc,
            kind,
            deopt_id,
            token_pos: pc as i32,
            try_index,
        }
    }

    // ── Descriptors ────────────────────────────────────────────────

    #[test]
    fn descriptors_are_sorted_and_searchable() {
        let descriptors = PcDescriptors::new(vec![
            row(40, PcDescriptorKind::IcCall, 3, NO_TRY_INDEX),
            row(0, PcDescriptorKind::EntryPatch, NO_DEOPT_ID, NO_TRY_INDEX),
            row(20, PcDescriptorKind::Deopt, 3, 0),
            row(60, PcDescriptorKind::Return, NO_DEOPT_ID, NO_TRY_INDEX),
        ]);
        assert_eq!(descriptors.iter().next().unwrap().kind, PcDescriptorKind::EntryPatch);
        assert_eq!(descriptors.find(40, PcDescriptorKind::IcCall).unwrap().deopt_id, 3);
        assert!(descriptors.find(40, PcDescriptorKind::Deopt).is_none());
        assert_eq!(descriptors.find_by_deopt_id(3, PcDescriptorKind::Deopt).unwrap().pc_offset, 20);
        assert_eq!(descriptors.try_index_at(20), 0);
        assert_eq!(descriptors.try_index_at(40), NO_TRY_INDEX);
        assert_eq!(descriptors.ic_call_before(55).unwrap().pc_offset, 40);
        assert!(descriptors.ic_call_before(39).is_none());
        assert_eq!(descriptors.token_pos_at(45), 40);
    }

    // ── Stack maps ─────────────────────────────────────────────────

    #[test]
    fn stack_map_bits() {
        let map = StackMap::from_slots(12, &[true, false, true, true, false, false, false, false, true]);
        assert_eq!(map.slot_count(), 9);
        assert!(map.is_object(0));
        assert!(!map.is_object(1));
        assert!(map.is_object(8));
        assert!(!map.is_object(9));
    }

    #[test]
    fn stack_maps_find_exact_pc() {
        let maps = StackMaps::new(vec![
            StackMap::from_slots(30, &[true]),
            StackMap::from_slots(10, &[]),
        ]);
        assert_eq!(maps.find(30).unwrap().slot_count(), 1);
        assert!(maps.find(20).is_none());
    }

    // ── Deopt table ────────────────────────────────────────────────

    #[test]
    fn deopt_entries_share_suffixes() {
        let mut table = DeoptTable::default();
        let tail = [DeoptInstr::StackSlot(0), DeoptInstr::StackSlot(1), DeoptInstr::Constant(0)];
        let mut first = vec![DeoptInstr::BoxDouble(4)];
        first.extend_from_slice(&tail);
        let mut second = vec![DeoptInstr::StackSlot(3), DeoptInstr::BoxInt64(5)];
        second.extend_from_slice(&tail);

        table.add(1, DeoptReason::CheckSmi, first.clone());
        table.add(2, DeoptReason::CheckClass, second.clone());

        assert_eq!(table.find(1).unwrap().1, first);
        let (entry, expanded) = table.find(2).unwrap();
        assert_eq!(entry.reason, DeoptReason::CheckClass);
        assert_eq!(expanded, second);
        assert_eq!(table.stored_instructions(), first.len() + 2);
        assert!(table.find(7).is_none());
    }

    #[test]
    fn single_shared_instruction_is_not_worth_a_suffix() {
        let mut table = DeoptTable::default();
        table.add(1, DeoptReason::CheckSmi, vec![DeoptInstr::StackSlot(0)]);
        table.add(2, DeoptReason::CheckSmi, vec![DeoptInstr::StackSlot(0)]);
        assert_eq!(table.stored_instructions(), 2);
    }

    // ── Handlers ───────────────────────────────────────────────────

    #[test]
    fn handlers_by_try_index() {
        let handlers = ExceptionHandlers::new(vec![
            ExceptionHandler {
                try_index: 1,
                outer_try_index: 0,
                handler_pc: 50,
                stack_depth: 2,
                handled_types: vec![],
            },
            ExceptionHandler {
                try_index: 0,
                outer_try_index: NO_TRY_INDEX,
                handler_pc: 80,
                stack_depth: 1,
                handled_types: vec![object::cid::DOUBLE],
            },
        ]);
        assert_eq!(handlers.get(1).unwrap().outer_try_index, 0);
        assert_eq!(handlers.get(0).unwrap().handler_pc, 80);
        assert!(handlers.get(2).is_none());
    }
}
