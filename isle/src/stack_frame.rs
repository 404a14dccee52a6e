//! Operand stack, frames and the stack walker.
//!
//! One `Vec<u64>` per isolate holds every managed frame:
//!
//! ```text
//! [args ...] [return address] [saved fp] [pc marker] [locals ...] [temps ...]
//!                             ^ fp
//! ```
//!
//! The pc marker is the entry point of the frame's code. A return address
//! of 0 marks the first frame of an `invoke_dart` entry; the walker then
//! continues at the exit frame that entry saved.

use object::{Instructions, Value};
use rustc_hash::FxHashMap;

use crate::code::{Code, CodeId};

pub(crate) const SAVED_FP_SLOT: usize = 0;
pub(crate) const PC_MARKER_SLOT: usize = 1;
/// Offset from fp of the first local.
pub(crate) const FIRST_SLOT: usize = 2;

/// Slots a deep recursion may use before a stack overflow is thrown.
pub(crate) const DEFAULT_MAX_STACK_SLOTS: usize = 1 << 18;

/// The innermost managed frame as seen from native code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExitFrame {
    /// Safepoint pc inside the frame's code; 0 when no frame is active.
    pub pc: usize,
    pub fp: usize,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct EntryFrame {
    pub saved_exit: ExitFrame,
    pub saved_fp: usize,
    /// Index of the first argument.
    pub base: usize,
    pub argc: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackFrame {
    Dart { pc: usize, fp: usize, code: CodeId },
    /// Boundary to the native caller of `invoke_dart`.
    Entry { index: usize },
}

pub(crate) struct FrameState {
    pub stack: Vec<u64>,
    pub fp: usize,
    pub exit: ExitFrame,
    pub entries: Vec<EntryFrame>,
    /// Caller fp → original return address, for frames that resume in the
    /// lazy deoptimization stub.
    pub lazy_deopt: FxHashMap<usize, usize>,
    pub lazy_deopt_entry: usize,
    pub active_exception: Value,
    pub active_stacktrace: Value,
    pub deopt_scratch: Vec<Value>,
    pub max_slots: usize,
}

impl FrameState {
    pub fn new(null: Value, lazy_deopt_entry: usize) -> Self {
        Self {
            stack: Vec::with_capacity(1024),
            fp: 0,
            exit: ExitFrame::default(),
            entries: Vec::new(),
            lazy_deopt: FxHashMap::default(),
            lazy_deopt_entry,
            active_exception: null,
            active_stacktrace: null,
            deopt_scratch: Vec::new(),
            max_slots: DEFAULT_MAX_STACK_SLOTS,
        }
    }

    // ── Operand stack ──────────────────────────────────────────────

    #[inline(always)]
    pub fn push(&mut self, value: Value) {
        self.stack.push(value.raw());
    }

    #[inline(always)]
    pub fn push_raw(&mut self, raw: u64) {
        self.stack.push(raw);
    }

    #[inline(always)]
    pub fn pop(&mut self) -> Value {
        Value::from_raw(self.stack.pop().unwrap_or(0))
    }

    #[inline(always)]
    pub fn pop_raw(&mut self) -> u64 {
        self.stack.pop().unwrap_or(0)
    }

    /// `depth` 0 is the top of the stack.
    #[inline(always)]
    pub fn peek(&self, depth: usize) -> Value {
        Value::from_raw(self.stack[self.stack.len() - 1 - depth])
    }

    #[inline(always)]
    pub fn set_peek(&mut self, depth: usize, value: Value) {
        let index = self.stack.len() - 1 - depth;
        self.stack[index] = value.raw();
    }

    #[inline(always)]
    pub fn at(&self, index: usize) -> Value {
        Value::from_raw(self.stack[index])
    }

    #[inline(always)]
    pub fn set_at(&mut self, index: usize, value: Value) {
        self.stack[index] = value.raw();
    }

    pub fn depth(&self) -> usize {
        self.stack.len()
    }

    pub fn truncate(&mut self, len: usize) {
        self.stack.truncate(len);
    }

    // ── Frames ─────────────────────────────────────────────────────

    pub fn pc_marker(&self, fp: usize) -> usize {
        self.stack[fp + PC_MARKER_SLOT] as usize
    }

    pub fn code_at(&self, fp: usize) -> CodeId {
        code_id_for_entry(self.pc_marker(fp))
    }

    pub fn saved_fp(&self, fp: usize) -> usize {
        self.stack[fp + SAVED_FP_SLOT] as usize
    }

    pub fn return_address(&self, fp: usize) -> usize {
        self.stack[fp - 1] as usize
    }

    /// Index of the entry frame that owns the frame at `fp`.
    pub fn entry_for(&self, fp: usize) -> Option<usize> {
        self.entries.iter().rposition(|e| e.base <= fp)
    }

    /// The return address as the walker sees it: a frame redirected to the
    /// lazy deoptimization stub still reports its original caller pc.
    pub fn caller_pc(&self, fp: usize) -> usize {
        let ret = self.return_address(fp);
        if ret != 0 && ret == self.lazy_deopt_entry {
            let caller_fp = self.saved_fp(fp);
            return self.lazy_deopt.get(&caller_fp).copied().unwrap_or(ret);
        }
        ret
    }

    pub fn walker(&self) -> StackWalker<'_> {
        let next = if self.exit.pc == 0 {
            Walk::Done
        } else {
            Walk::Frame(self.exit.pc, self.exit.fp)
        };
        StackWalker { frames: self, next }
    }

    /// Dart frames of the innermost entry level only.
    pub fn current_level(&self) -> impl Iterator<Item = (usize, usize, CodeId)> + '_ {
        self.walker().map_while(|frame| match frame {
            StackFrame::Dart { pc, fp, code } => Some((pc, fp, code)),
            StackFrame::Entry { .. } => None,
        })
    }

    /// Drops lazy deoptimization requests of frames at or above `fp`.
    pub fn forget_lazy_deopt_above(&mut self, fp: usize) {
        self.lazy_deopt.retain(|&caller_fp, _| caller_fp < fp);
    }

    // ── GC ─────────────────────────────────────────────────────────

    /// Visits entry arguments, the tagged slots of every frame according to
    /// its stack map, and the exception registers.
    pub fn visit_roots(&mut self, codes: &[Code], visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.active_exception);
        visitor(&mut self.active_stacktrace);
        for value in &mut self.deopt_scratch {
            visitor(value);
        }

        let mut slots = Vec::new();
        for entry in &self.entries {
            slots.extend(entry.base..entry.base + entry.argc);
        }
        for frame in self.walker() {
            let StackFrame::Dart { pc, fp, code } = frame else {
                continue;
            };
            let code = &codes[code.0 as usize];
            // Parameters are always tagged. The caller's map may not cover
            // them after a stub rewrote the arguments.
            slots.extend(fp.saturating_sub(1 + code.num_params)..fp.saturating_sub(1));
            let offset = code.pc_offset(pc);
            let Some(map) = code.stack_maps.find(offset) else {
                log::warn!("no stack map for {} at offset {}", code.name, offset);
                continue;
            };
            for i in 0..map.slot_count() {
                let index = fp + FIRST_SLOT + i;
                if index >= self.stack.len() {
                    break;
                }
                if map.is_object(i) {
                    slots.push(index);
                }
            }
        }

        slots.sort_unstable();
        slots.dedup();
        for index in slots {
            let mut value = Value::from_raw(self.stack[index]);
            if value.is_heap_object() {
                visitor(&mut value);
                self.stack[index] = value.raw();
            }
        }
    }
}

pub(crate) fn code_id_for_entry(entry: usize) -> CodeId {
    CodeId::from_value(unsafe { Instructions::from_entry_point(entry) }.code_id)
}

enum Walk {
    Frame(usize, usize),
    Entry(usize),
    Done,
}

/// Iterates frames from the innermost outwards, across entry frames.
pub struct StackWalker<'a> {
    frames: &'a FrameState,
    next: Walk,
}

impl Iterator for StackWalker<'_> {
    type Item = StackFrame;

    fn next(&mut self) -> Option<StackFrame> {
        match std::mem::replace(&mut self.next, Walk::Done) {
            Walk::Done => None,
            Walk::Frame(pc, fp) => {
                let code = self.frames.code_at(fp);
                let ret = self.frames.caller_pc(fp);
                self.next = if ret == 0 {
                    match self.frames.entry_for(fp) {
                        Some(index) => Walk::Entry(index),
                        None => Walk::Done,
                    }
                } else {
                    Walk::Frame(ret, self.frames.saved_fp(fp))
                };
                Some(StackFrame::Dart { pc, fp, code })
            }
            Walk::Entry(index) => {
                let exit = self.frames.entries[index].saved_exit;
                if exit.pc != 0 {
                    self.next = Walk::Frame(exit.pc, exit.fp);
                }
                Some(StackFrame::Entry { index })
            }
        }
    }
}
