//! Instruction encoding and the code builder.
//!
//! Call sequences use the x64 byte layouts so that the patcher and the stack
//! walker can recognise a call site from its return address:
//!
//! ```text
//! instance call   48 BB <ic id>  49 BA <argc>  49 BB <target>  41 FF D3
//! static call                    49 BA <argc>  49 BB <target>  41 FF D3
//! stub call      [48 BB <extra>] 49 BA <argc>  49 BB <stub>    41 FF D3
//! ```
//!
//! The call target immediate always sits 11 bytes before the return address.
//! Everything else is a compact stack-machine encoding interpreted by
//! [`crate::interpreter`].

use object::{ClassId, Value};

use crate::code::{
    Code, DeoptInstr, DeoptReason, DeoptTable, ExceptionHandler, ExceptionHandlers,
    NO_DEOPT_ID, NO_TOKEN_POS, NO_TRY_INDEX, PcDescriptor, PcDescriptorKind, PcDescriptors,
    StackMap, StackMaps, StaticCallEntry,
};
use crate::code::CodeId;
use crate::error::RuntimeResult;
use crate::function::{FieldId, FunctionId, NativeId};
use crate::isolate::Isolate;
use crate::runtime_entries::RuntimeEntry;
use crate::stubs::StubKind;

// ── Encoding ───────────────────────────────────────────────────────

pub mod op {
    pub const ENTER: u8 = 0x01;
    pub const PUSH_IMM: u8 = 0x02;
    pub const PUSH_POOL: u8 = 0x03;
    pub const PUSH_ARG: u8 = 0x04;
    pub const PUSH_LOCAL: u8 = 0x05;
    pub const STORE_LOCAL: u8 = 0x06;
    pub const POP: u8 = 0x07;
    pub const DUP: u8 = 0x08;
    pub const ADD: u8 = 0x0A;
    pub const SUB: u8 = 0x0B;
    pub const LESS: u8 = 0x0C;
    pub const IDENTICAL: u8 = 0x0D;
    pub const JUMP: u8 = 0x10;
    pub const JUMP_IF_FALSE: u8 = 0x11;
    pub const JUMP_IF_TRUE: u8 = 0x12;
    pub const CHECK_SAFEPOINT: u8 = 0x13;
    pub const LOAD_FIELD: u8 = 0x14;
    pub const STORE_FIELD: u8 = 0x15;
    pub const LOAD_INDEXED: u8 = 0x16;
    pub const STORE_INDEXED: u8 = 0x17;
    pub const LOAD_CONTEXT_VAR: u8 = 0x18;
    pub const STORE_CONTEXT_VAR: u8 = 0x19;
    pub const LOAD_CLOSURE_CONTEXT: u8 = 0x1A;
    pub const THROW: u8 = 0x1B;
    pub const RETHROW: u8 = 0x1C;
    pub const PUSH_EXCEPTION: u8 = 0x1D;
    pub const PUSH_STACKTRACE: u8 = 0x1E;
    pub const CHECK_SMI: u8 = 0x1F;
    pub const CHECK_CLASS: u8 = 0x20;
    pub const UNBOX_DOUBLE: u8 = 0x21;
    pub const BOX_DOUBLE: u8 = 0x22;
    pub const LOAD_STATIC: u8 = 0x23;
    pub const STORE_STATIC: u8 = 0x24;
    pub const STOP: u8 = 0x25;
    pub const DADD: u8 = 0x26;
    pub const DSUB: u8 = 0x27;
    pub const DMUL: u8 = 0x28;
    pub const MUL: u8 = 0x29;
    pub const UNBOX_INT64: u8 = 0x2B;
    pub const BOX_INT64: u8 = 0x2C;

    pub const REX_W: u8 = 0x48;
    pub const REX_WB: u8 = 0x49;
    pub const REX_B: u8 = 0x41;
    pub const MOV_RBX: u8 = 0xBB;
    pub const MOV_R10: u8 = 0xBA;
    pub const MOV_R11: u8 = 0xBB;
    pub const GROUP5: u8 = 0xFF;
    pub const CALL_R11: u8 = 0xD3;
    pub const JMP_R11: u8 = 0xE3;
    pub const NOP: u8 = 0x90;
    pub const RET: u8 = 0xC3;
    pub const TRAP: u8 = 0xCC;
    /// Replaces `RET` while a return breakpoint is set.
    pub const RET_BREAKPOINT: u8 = 0xCD;
    /// `F1 <kind:u8> <arg:u32>`: body of a stub.
    pub const STUB: u8 = 0xF1;
}

pub const INSTANCE_CALL_SIZE: usize = 33;
pub const CLOSURE_CALL_SIZE: usize = 23;
/// Size of the patchable entry region at the start of every code object.
pub const ENTRY_PATCH_SIZE: usize = 13;
/// Distance from a return address back to the call target immediate.
pub const TARGET_FROM_RETURN: usize = 11;
pub const IC_DATA_FROM_RETURN: usize = 31;
pub const ARGC_FROM_RETURN: usize = 21;
pub const STUB_SIZE: usize = 6;

/// Encodes the body of a stub.
pub fn stub_bytes(kind: StubKind, arg: u32) -> [u8; STUB_SIZE] {
    let a = arg.to_le_bytes();
    [op::STUB, kind as u8, a[0], a[1], a[2], a[3]]
}

// ── Builder ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug, Default)]
struct LabelState {
    pos: Option<usize>,
    types: Option<Vec<bool>>,
    fixups: Vec<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryBlock {
    pub index: i32,
    outer: i32,
    depth: usize,
}

#[derive(Debug, Clone)]
enum Reloc {
    InstanceCall {
        name: String,
        num_args_checked: usize,
        deopt_id: u32,
    },
    StaticCall {
        function: FunctionId,
    },
    Stub {
        kind: StubKind,
    },
    AllocationStub {
        class_id: ClassId,
    },
}

/// Assembles one code object and its side tables.
///
/// Tracks the tagged-ness of every operand stack slot so that a stack map
/// can be recorded after each instruction. The map at the end of an
/// instruction describes the stack as the instruction found it: inputs
/// stay on the stack while the instruction may collect.
pub struct CodeBuilder {
    name: String,
    bytes: Vec<u8>,
    types: Vec<bool>,
    num_params: usize,
    num_locals: usize,
    is_optimized: bool,
    descriptors: Vec<PcDescriptor>,
    stack_maps: Vec<StackMap>,
    deopt_table: DeoptTable,
    handlers: Vec<ExceptionHandler>,
    try_stack: Vec<TryBlock>,
    next_try_index: i32,
    labels: Vec<LabelState>,
    relocs: Vec<(usize, Reloc)>,
    pool: Vec<Value>,
    pointer_offsets: Vec<u32>,
    static_calls: Vec<(u32, FunctionId)>,
    token_pos: i32,
    next_deopt_id: u32,
}

impl CodeBuilder {
    /// Emits the entry region and the frame setup.
    pub fn new(name: impl Into<String>, num_params: usize, num_locals: usize) -> Self {
        let mut builder = Self {
            name: name.into(),
            bytes: Vec::with_capacity(128),
            types: Vec::new(),
            num_params,
            num_locals,
            is_optimized: false,
            descriptors: Vec::new(),
            stack_maps: Vec::new(),
            deopt_table: DeoptTable::default(),
            handlers: Vec::new(),
            try_stack: Vec::new(),
            next_try_index: 0,
            labels: Vec::new(),
            relocs: Vec::new(),
            pool: Vec::new(),
            pointer_offsets: Vec::new(),
            static_calls: Vec::new(),
            token_pos: NO_TOKEN_POS,
            next_deopt_id: 0,
        };
        builder.add_descriptor(PcDescriptorKind::EntryPatch, NO_DEOPT_ID);
        builder.bytes.extend_from_slice(&[op::NOP; ENTRY_PATCH_SIZE]);
        builder.add_descriptor(PcDescriptorKind::PatchCode, NO_DEOPT_ID);
        builder.bytes.push(op::ENTER);
        builder.emit_u16(num_locals as u16);
        builder.types.extend(std::iter::repeat_n(true, num_locals));
        builder.record_stack_map(builder.types.clone());
        builder
    }

    pub fn optimized(mut self) -> Self {
        self.is_optimized = true;
        self
    }

    pub fn set_token_pos(&mut self, pos: i32) {
        self.token_pos = pos;
    }

    /// Operand stack depth above the pc marker, locals included.
    pub fn depth(&self) -> usize {
        self.types.len()
    }

    pub fn offset(&self) -> usize {
        self.bytes.len()
    }

    // ── Raw emission ───────────────────────────────────────────────

    fn emit_u16(&mut self, v: u16) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u64(&mut self, v: u64) {
        self.bytes.extend_from_slice(&v.to_le_bytes());
    }

    fn current_try_index(&self) -> i32 {
        self.try_stack.last().map_or(NO_TRY_INDEX, |t| t.index)
    }

    fn add_descriptor(&mut self, kind: PcDescriptorKind, deopt_id: u32) {
        self.descriptors.push(PcDescriptor {
            pc_offset: self.bytes.len() as u32,
            kind,
            deopt_id,
            token_pos: self.token_pos,
            try_index: self.current_try_index(),
        });
    }

    fn record_stack_map(&mut self, types: Vec<bool>) {
        let pc = self.bytes.len() as u32;
        self.stack_maps.push(StackMap::from_slots(pc, &types));
        if self.current_try_index() != NO_TRY_INDEX
            && !self.descriptors.iter().any(|d| d.pc_offset == pc)
        {
            self.add_descriptor(PcDescriptorKind::Other, NO_DEOPT_ID);
        }
    }

    /// Emits `opcode` with its immediates, records the safepoint after it,
    /// then applies the stack effect.
    fn instr(&mut self, bytes: &[u8], pops: usize, pushes: &[bool]) {
        let before = self.types.clone();
        self.bytes.extend_from_slice(bytes);
        self.record_stack_map(before);
        self.apply(pops, pushes);
    }

    fn apply(&mut self, pops: usize, pushes: &[bool]) {
        debug_assert!(self.types.len() >= pops, "operand stack underflow in {}", self.name);
        let len = self.types.len().saturating_sub(pops);
        self.types.truncate(len);
        self.types.extend_from_slice(pushes);
    }

    fn with_u16(opcode: u8, v: u16) -> [u8; 3] {
        let b = v.to_le_bytes();
        [opcode, b[0], b[1]]
    }

    fn with_u32(opcode: u8, v: u32) -> [u8; 5] {
        let b = v.to_le_bytes();
        [opcode, b[0], b[1], b[2], b[3]]
    }

    // ── Stack ──────────────────────────────────────────────────────

    /// Pushes a constant. Smis and old objects are encoded inline; other
    /// objects go through the object pool.
    pub fn push_constant(&mut self, value: Value) {
        if value.is_smi() || value.is_old_object() {
            let mut bytes = [0u8; 9];
            bytes[0] = op::PUSH_IMM;
            bytes[1..].copy_from_slice(&value.raw().to_le_bytes());
            if value.is_heap_object() {
                self.pointer_offsets.push(self.bytes.len() as u32 + 1);
            }
            self.instr(&bytes, 0, &[true]);
        } else {
            let index = self.add_to_pool(value);
            self.instr(&Self::with_u16(op::PUSH_POOL, index), 0, &[true]);
        }
    }

    pub fn push_smi(&mut self, n: i64) {
        self.push_constant(Value::from_i64(n));
    }

    pub fn add_to_pool(&mut self, value: Value) -> u16 {
        if let Some(i) = self.pool.iter().position(|&v| v == value) {
            return i as u16;
        }
        self.pool.push(value);
        (self.pool.len() - 1) as u16
    }

    pub fn push_arg(&mut self, index: usize) {
        debug_assert!(index < self.num_params);
        self.instr(&Self::with_u16(op::PUSH_ARG, index as u16), 0, &[true]);
    }

    pub fn push_local(&mut self, index: usize) {
        debug_assert!(index < self.num_locals);
        self.instr(&Self::with_u16(op::PUSH_LOCAL, index as u16), 0, &[true]);
    }

    pub fn store_local(&mut self, index: usize) {
        debug_assert!(index < self.num_locals);
        debug_assert!(self.types.last() == Some(&true), "raw value stored to a local");
        self.instr(&Self::with_u16(op::STORE_LOCAL, index as u16), 1, &[]);
    }

    pub fn pop(&mut self) {
        self.instr(&[op::POP], 1, &[]);
    }

    pub fn dup(&mut self) {
        let top = self.types.last().copied().unwrap_or(true);
        self.instr(&[op::DUP], 0, &[top]);
    }

    // ── Arithmetic ─────────────────────────────────────────────────

    pub fn add(&mut self) {
        self.instr(&[op::ADD], 2, &[true]);
    }

    pub fn sub(&mut self) {
        self.instr(&[op::SUB], 2, &[true]);
    }

    pub fn mul(&mut self) {
        self.instr(&[op::MUL], 2, &[true]);
    }

    pub fn less(&mut self) {
        self.instr(&[op::LESS], 2, &[true]);
    }

    pub fn identical(&mut self) {
        self.instr(&[op::IDENTICAL], 2, &[true]);
    }

    pub fn dadd(&mut self) {
        self.instr(&[op::DADD], 2, &[false]);
    }

    pub fn dsub(&mut self) {
        self.instr(&[op::DSUB], 2, &[false]);
    }

    pub fn dmul(&mut self) {
        self.instr(&[op::DMUL], 2, &[false]);
    }

    // ── Control flow ───────────────────────────────────────────────

    pub fn label(&mut self) -> Label {
        self.labels.push(LabelState::default());
        Label(self.labels.len() - 1)
    }

    fn jump_to(&mut self, opcode: u8, label: Label, pops: usize) {
        let before = self.types.clone();
        self.bytes.push(opcode);
        let fixup = self.bytes.len();
        self.emit_u32(0);
        self.record_stack_map(before);
        self.apply(pops, &[]);
        let state = &mut self.labels[label.0];
        match state.pos {
            Some(pos) => {
                let rel = pos as i64 - (fixup as i64 + 4);
                self.bytes[fixup..fixup + 4].copy_from_slice(&(rel as i32).to_le_bytes());
            }
            None => state.fixups.push(fixup),
        }
        if state.types.is_none() {
            state.types = Some(self.types.clone());
        }
        debug_assert_eq!(state.types.as_deref(), Some(&self.types[..]), "stack mismatch at jump");
    }

    pub fn jump(&mut self, label: Label) {
        self.jump_to(op::JUMP, label, 0);
    }

    pub fn jump_if_false(&mut self, label: Label) {
        self.jump_to(op::JUMP_IF_FALSE, label, 1);
    }

    pub fn jump_if_true(&mut self, label: Label) {
        self.jump_to(op::JUMP_IF_TRUE, label, 1);
    }

    /// Binds `label` here. After an unconditional jump the operand stack
    /// is taken from the jumps that target the label.
    pub fn bind(&mut self, label: Label) {
        let pos = self.bytes.len();
        let state = &mut self.labels[label.0];
        debug_assert!(state.pos.is_none(), "label bound twice");
        state.pos = Some(pos);
        for fixup in std::mem::take(&mut state.fixups) {
            let rel = pos as i64 - (fixup as i64 + 4);
            self.bytes[fixup..fixup + 4].copy_from_slice(&(rel as i32).to_le_bytes());
        }
        match &state.types {
            Some(types) => self.types = types.clone(),
            None => state.types = Some(self.types.clone()),
        }
    }

    pub fn check_safepoint(&mut self) {
        self.instr(&[op::CHECK_SAFEPOINT], 0, &[]);
    }

    pub fn ret(&mut self) {
        debug_assert_eq!(self.types.len(), self.num_locals + 1, "unbalanced stack at return");
        self.add_descriptor(PcDescriptorKind::Return, NO_DEOPT_ID);
        self.instr(&[op::RET], 1, &[]);
    }

    pub fn stop(&mut self, message: Value) {
        let index = self.add_to_pool(message);
        self.instr(&Self::with_u16(op::STOP, index), 0, &[]);
    }

    // ── Objects ────────────────────────────────────────────────────

    pub fn load_field(&mut self, offset: usize) {
        self.instr(&Self::with_u16(op::LOAD_FIELD, offset as u16), 1, &[true]);
    }

    /// `[object, value]` → `[]`, with write barrier and field guard.
    pub fn store_field(&mut self, offset: usize, field: FieldId) {
        let mut bytes = [0u8; 7];
        bytes[0] = op::STORE_FIELD;
        bytes[1..3].copy_from_slice(&(offset as u16).to_le_bytes());
        bytes[3..7].copy_from_slice(&field.0.to_le_bytes());
        self.instr(&bytes, 2, &[]);
    }

    /// `[array, index]` → `[value]`.
    pub fn load_indexed(&mut self) {
        self.instr(&[op::LOAD_INDEXED], 2, &[true]);
    }

    /// `[array, index, value]` → `[]`.
    pub fn store_indexed(&mut self) {
        self.instr(&[op::STORE_INDEXED], 3, &[]);
    }

    pub fn load_context_var(&mut self, index: usize) {
        self.instr(&Self::with_u16(op::LOAD_CONTEXT_VAR, index as u16), 1, &[true]);
    }

    /// `[context, value]` → `[]`.
    pub fn store_context_var(&mut self, index: usize) {
        self.instr(&Self::with_u16(op::STORE_CONTEXT_VAR, index as u16), 2, &[]);
    }

    pub fn load_closure_context(&mut self) {
        self.instr(&[op::LOAD_CLOSURE_CONTEXT], 0, &[true]);
    }

    pub fn load_static(&mut self, field: FieldId) {
        self.instr(&Self::with_u32(op::LOAD_STATIC, field.0), 0, &[true]);
    }

    pub fn store_static(&mut self, field: FieldId) {
        self.instr(&Self::with_u32(op::STORE_STATIC, field.0), 1, &[]);
    }

    // ── Exceptions ─────────────────────────────────────────────────

    pub fn throw(&mut self) {
        self.instr(&[op::THROW], 1, &[]);
    }

    /// `[exception, stacktrace]` → never returns.
    pub fn rethrow(&mut self) {
        self.instr(&[op::RETHROW], 2, &[]);
    }

    pub fn push_exception(&mut self) {
        self.instr(&[op::PUSH_EXCEPTION], 0, &[true]);
    }

    pub fn push_stacktrace(&mut self) {
        self.instr(&[op::PUSH_STACKTRACE], 0, &[true]);
    }

    pub fn try_begin(&mut self) -> TryBlock {
        let block = TryBlock {
            index: self.next_try_index,
            outer: self.current_try_index(),
            depth: self.types.len(),
        };
        self.next_try_index += 1;
        self.try_stack.push(block);
        block
    }

    pub fn try_end(&mut self, block: TryBlock) {
        let top = self.try_stack.pop();
        debug_assert_eq!(top, Some(block), "try blocks must nest");
    }

    /// Starts the handler of `block` here. `handled_types` empty catches
    /// everything.
    pub fn catch_entry(&mut self, block: TryBlock, handled_types: Vec<ClassId>) {
        self.types.truncate(block.depth);
        self.handlers.push(ExceptionHandler {
            try_index: block.index,
            outer_try_index: block.outer,
            handler_pc: self.bytes.len() as u32,
            stack_depth: block.depth as u16,
            handled_types,
        });
    }

    // ── Speculation ────────────────────────────────────────────────

    /// A continuation point for eager deoptimization.
    pub fn deopt_point(&mut self) -> u32 {
        let deopt_id = self.take_deopt_id();
        self.add_descriptor(PcDescriptorKind::Deopt, deopt_id);
        deopt_id
    }

    fn take_deopt_id(&mut self) -> u32 {
        let id = self.next_deopt_id;
        self.next_deopt_id += 1;
        id
    }

    pub fn add_deopt_info(&mut self, deopt_id: u32, reason: DeoptReason, instrs: Vec<DeoptInstr>) {
        self.deopt_table.add(deopt_id, reason, instrs);
    }

    pub fn check_smi(&mut self, deopt_id: u32) {
        let top = self.types.last().copied().unwrap_or(true);
        self.instr(&Self::with_u32(op::CHECK_SMI, deopt_id), 1, &[top]);
    }

    pub fn check_class(&mut self, class_id: ClassId, deopt_id: u32) {
        let mut bytes = [0u8; 7];
        bytes[0] = op::CHECK_CLASS;
        bytes[1..3].copy_from_slice(&class_id.to_le_bytes());
        bytes[3..7].copy_from_slice(&deopt_id.to_le_bytes());
        self.instr(&bytes, 1, &[true]);
    }

    pub fn unbox_double(&mut self, deopt_id: u32) {
        self.instr(&Self::with_u32(op::UNBOX_DOUBLE, deopt_id), 1, &[false]);
    }

    pub fn box_double(&mut self) {
        self.instr(&[op::BOX_DOUBLE], 1, &[true]);
    }

    pub fn unbox_int64(&mut self, deopt_id: u32) {
        self.instr(&Self::with_u32(op::UNBOX_INT64, deopt_id), 1, &[false]);
    }

    pub fn box_int64(&mut self) {
        self.instr(&[op::BOX_INT64], 1, &[true]);
    }

    // ── Calls ──────────────────────────────────────────────────────

    fn call_sequence(&mut self, rbx: Option<u64>, argc: usize, target: u64) -> usize {
        let start = self.bytes.len();
        if let Some(rbx) = rbx {
            self.bytes.extend_from_slice(&[op::REX_W, op::MOV_RBX]);
            self.emit_u64(rbx);
        }
        self.bytes.extend_from_slice(&[op::REX_WB, op::MOV_R10]);
        self.emit_u64(argc as u64);
        self.bytes.extend_from_slice(&[op::REX_WB, op::MOV_R11]);
        self.emit_u64(target);
        self.bytes.extend_from_slice(&[op::REX_B, op::GROUP5, op::CALL_R11]);
        start
    }

    fn finish_call(&mut self, before: Vec<bool>, argc: usize, kind: PcDescriptorKind, deopt_id: u32) {
        self.add_descriptor(kind, deopt_id);
        self.record_stack_map(before);
        self.apply(argc, &[true]);
    }

    /// Dynamic call of `name` with `argc` arguments, the receiver first.
    pub fn instance_call(&mut self, name: &str, argc: usize, num_args_checked: usize) -> u32 {
        debug_assert!((1..=3).contains(&num_args_checked) && num_args_checked <= argc);
        let deopt_id = self.take_deopt_id();
        let before = self.types.clone();
        let start = self.call_sequence(Some(0), argc, 0);
        self.relocs.push((
            start,
            Reloc::InstanceCall {
                name: name.to_owned(),
                num_args_checked,
                deopt_id,
            },
        ));
        self.finish_call(before, argc, PcDescriptorKind::IcCall, deopt_id);
        deopt_id
    }

    pub fn static_call(&mut self, function: FunctionId, argc: usize) -> u32 {
        let deopt_id = self.take_deopt_id();
        let before = self.types.clone();
        let start = self.call_sequence(None, argc, 0);
        self.relocs.push((start, Reloc::StaticCall { function }));
        self.static_calls.push(((start + CLOSURE_CALL_SIZE) as u32, function));
        self.finish_call(before, argc, PcDescriptorKind::FuncCall, deopt_id);
        deopt_id
    }

    /// Calls the closure pushed first, with `argc` arguments including it.
    pub fn closure_call(&mut self, argc: usize) -> u32 {
        let deopt_id = self.take_deopt_id();
        let before = self.types.clone();
        let start = self.call_sequence(None, argc, 0);
        self.relocs.push((start, Reloc::Stub { kind: StubKind::ClosureCall }));
        self.finish_call(before, argc, PcDescriptorKind::FuncCall, deopt_id);
        deopt_id
    }

    pub fn stub_call(&mut self, kind: StubKind, argc: usize, rbx: Option<u64>) {
        let before = self.types.clone();
        let start = self.call_sequence(rbx, argc, 0);
        self.relocs.push((start, Reloc::Stub { kind }));
        self.finish_call(before, argc, PcDescriptorKind::Other, NO_DEOPT_ID);
    }

    pub fn runtime_call(&mut self, entry: RuntimeEntry, argc: usize) {
        self.stub_call(StubKind::CallToRuntime, argc, Some(entry as u64));
    }

    pub fn native_call(&mut self, native: NativeId, argc: usize) {
        self.stub_call(StubKind::CallNativeCFunction, argc, Some(native.0 as u64));
    }

    /// `[type arguments]?` → `[instance]`.
    pub fn allocate_object(&mut self, class_id: ClassId, has_type_arguments: bool) {
        let argc = usize::from(has_type_arguments);
        let before = self.types.clone();
        let start = self.call_sequence(None, argc, 0);
        self.relocs.push((start, Reloc::AllocationStub { class_id }));
        self.finish_call(before, argc, PcDescriptorKind::Other, NO_DEOPT_ID);
    }

    /// `[length, type arguments]` → `[array]`.
    pub fn allocate_array(&mut self) {
        self.stub_call(StubKind::AllocateArray, 2, None);
    }

    /// `[parent]` → `[context]`.
    pub fn allocate_context(&mut self, num_variables: usize) {
        self.stub_call(StubKind::AllocateContext, 1, Some(num_variables as u64));
    }

    /// `[]` → `[closure]` without a context, `[context]` → `[closure]` with.
    pub fn allocate_closure(&mut self, function: FunctionId, with_context: bool) {
        let kind = if with_context {
            StubKind::AllocateClosureWithContext
        } else {
            StubKind::AllocateClosure
        };
        self.stub_call(kind, usize::from(with_context), Some(function.0 as u64));
    }

    // ── Finalization ───────────────────────────────────────────────

    /// Copies the instructions into code space, resolves call targets and
    /// registers the code with `isolate`.
    pub fn finalize(self, isolate: &mut Isolate, function: Option<FunctionId>) -> RuntimeResult<CodeId> {
        debug_assert!(self.try_stack.is_empty(), "unterminated try block");
        debug_assert!(self.labels.iter().all(|l| l.fixups.is_empty()), "unbound label");
        let mut bytes = self.bytes;
        for (start, reloc) in &self.relocs {
            let target = match reloc {
                Reloc::InstanceCall {
                    name,
                    num_args_checked,
                    deopt_id,
                } => {
                    let ic = isolate.new_ic_data(function, name, *num_args_checked, *deopt_id)?;
                    write_imm(&mut bytes, start + 2, ic.0 as u64);
                    let kind = StubKind::inline_cache(*num_args_checked, self.is_optimized);
                    isolate.stub_entry(kind)
                }
                Reloc::StaticCall { function } => isolate.static_call_target(*function),
                Reloc::Stub { kind } => isolate.stub_entry(*kind),
                Reloc::AllocationStub { class_id } => isolate.allocation_stub_entry(*class_id)?,
            };
            let call_size = match reloc {
                Reloc::InstanceCall { .. } => INSTANCE_CALL_SIZE,
                _ => call_size_at(&bytes, *start),
            };
            write_imm(&mut bytes, start + call_size - TARGET_FROM_RETURN, target as u64);
        }

        let instructions = isolate.allocate_instructions(&bytes)?;
        let static_calls = self
            .static_calls
            .iter()
            .map(|&(pc_offset, function)| StaticCallEntry {
                pc_offset,
                function,
                code: isolate.function(function).code,
            })
            .collect();
        let code = Code {
            id: CodeId(u32::MAX),
            name: self.name,
            function,
            instructions,
            pointer_offsets: self.pointer_offsets,
            pc_descriptors: PcDescriptors::new(self.descriptors),
            stack_maps: StackMaps::new(self.stack_maps),
            deopt_table: self.deopt_table,
            exception_handlers: ExceptionHandlers::new(self.handlers),
            static_calls,
            object_pool: self.pool,
            num_params: self.num_params,
            num_locals: self.num_locals,
            is_optimized: self.is_optimized,
            is_alive: true,
        };
        Ok(isolate.register_code(code))
    }
}

fn call_size_at(bytes: &[u8], start: usize) -> usize {
    if bytes[start] == op::REX_W {
        INSTANCE_CALL_SIZE
    } else {
        CLOSURE_CALL_SIZE
    }
}

fn write_imm(bytes: &mut [u8], at: usize, value: u64) {
    bytes[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_imm(bytes: &[u8], at: usize) -> u64 {
        u64::from_le_bytes(bytes[at..at + 8].try_into().unwrap())
    }

    #[test]
    fn entry_region_precedes_enter() {
        let builder = CodeBuilder::new("f", 0, 2);
        assert_eq!(&builder.bytes[..ENTRY_PATCH_SIZE], &[op::NOP; ENTRY_PATCH_SIZE]);
        assert_eq!(builder.bytes[ENTRY_PATCH_SIZE], op::ENTER);
        assert_eq!(builder.depth(), 2);
        let map = builder.stack_maps.last().unwrap();
        assert_eq!(map.pc_offset as usize, ENTRY_PATCH_SIZE + 3);
        assert_eq!(map.slot_count(), 2);
    }

    #[test]
    fn instance_call_layout() {
        let mut builder = CodeBuilder::new("f", 1, 0);
        builder.push_arg(0);
        let start = builder.offset();
        builder.instance_call("m", 1, 1);
        let bytes = &builder.bytes[start..];
        assert_eq!(bytes.len(), INSTANCE_CALL_SIZE);
        assert_eq!(&bytes[..2], &[0x48, 0xBB]);
        assert_eq!(&bytes[10..12], &[0x49, 0xBA]);
        assert_eq!(read_imm(bytes, 12), 1);
        assert_eq!(&bytes[20..22], &[0x49, 0xBB]);
        assert_eq!(&bytes[30..], &[0x41, 0xFF, 0xD3]);
        assert_eq!(builder.depth(), 1);
        let ret = (start + INSTANCE_CALL_SIZE) as u32;
        let row = builder.descriptors.iter().find(|d| d.pc_offset == ret).unwrap();
        assert_eq!(row.kind, PcDescriptorKind::IcCall);
        let map = builder.stack_maps.iter().find(|m| m.pc_offset == ret).unwrap();
        assert_eq!(map.slot_count(), 1, "argument is live across the call");
    }

    #[test]
    fn static_call_records_target_row() {
        let mut builder = CodeBuilder::new("f", 0, 0);
        builder.push_smi(1);
        let start = builder.offset();
        builder.static_call(FunctionId(4), 1);
        assert_eq!(builder.offset() - start, CLOSURE_CALL_SIZE);
        assert_eq!(builder.static_calls, vec![((start + CLOSURE_CALL_SIZE) as u32, FunctionId(4))]);
        assert_eq!(call_size_at(&builder.bytes, start), CLOSURE_CALL_SIZE);
    }

    #[test]
    fn maps_describe_inputs() {
        let mut builder = CodeBuilder::new("f", 0, 0);
        builder.push_smi(1);
        builder.push_smi(2);
        builder.add();
        let map = builder.stack_maps.last().unwrap();
        assert_eq!(map.slot_count(), 2);
        assert_eq!(builder.depth(), 1);
    }

    #[test]
    fn unboxed_values_are_untagged_in_maps() {
        let mut builder = CodeBuilder::new("f", 1, 0).optimized();
        builder.push_arg(0);
        builder.unbox_double(0);
        builder.push_arg(0);
        builder.unbox_double(0);
        builder.dadd();
        builder.box_double();
        let map = builder.stack_maps.last().unwrap();
        assert_eq!(map.slot_count(), 1);
        assert!(!map.is_object(0));
    }

    #[test]
    fn forward_and_backward_jumps() {
        let mut builder = CodeBuilder::new("f", 0, 0);
        let top = builder.label();
        let done = builder.label();
        builder.bind(top);
        builder.push_constant(Value::from_i64(0));
        builder.jump_if_false(done);
        builder.jump(top);
        builder.bind(done);
        let jump_at = builder.offset() - 5;
        assert_eq!(builder.bytes[jump_at], op::JUMP);
        let rel = i32::from_le_bytes(builder.bytes[jump_at + 1..jump_at + 5].try_into().unwrap());
        assert_eq!(jump_at as i64 + 5 + rel as i64, (ENTRY_PATCH_SIZE + 3) as i64);
    }

    #[test]
    fn try_blocks_tag_descriptors() {
        let mut builder = CodeBuilder::new("f", 0, 1);
        let block = builder.try_begin();
        builder.push_smi(1);
        builder.throw();
        builder.try_end(block);
        builder.catch_entry(block, vec![]);
        builder.push_exception();
        builder.store_local(0);
        assert_eq!(builder.handlers.len(), 1);
        assert_eq!(builder.handlers[0].stack_depth, 1);
        assert!(builder.descriptors.iter().any(|d| d.try_index == block.index));
        assert_eq!(block.outer, NO_TRY_INDEX);
    }

    #[test]
    fn deopt_ids_are_sequential() {
        let mut builder = CodeBuilder::new("f", 1, 0);
        let a = builder.deopt_point();
        builder.push_arg(0);
        let b = builder.instance_call("m", 1, 1);
        assert_eq!((a, b), (0, 1));
    }

    #[test]
    fn stub_encoding() {
        let bytes = stub_bytes(StubKind::AllocateObject, 0x0102_0304);
        assert_eq!(bytes[0], op::STUB);
        assert_eq!(bytes[1], StubKind::AllocateObject as u8);
        assert_eq!(u32::from_le_bytes(bytes[2..].try_into().unwrap()), 0x0102_0304);
    }
}
