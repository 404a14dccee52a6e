//! Breakpoints.
//!
//! A call breakpoint redirects one call site to a breakpoint stub and keeps
//! the original target; the stub reports to the [`DebuggerHook`] and then
//! continues at that target with the call's registers intact. A return
//! breakpoint swaps a `RET` byte for `RET_BREAKPOINT`.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::assembler::op;
use crate::code::{CodeId, PcDescriptorKind};
use crate::error::{ApiError, RuntimeResult};
use crate::function::FunctionId;
use crate::isolate::Isolate;
use crate::patcher::{call_target_at, set_call_target_at};
use crate::stack_frame::StackFrame;
use crate::stubs::{StubKind, StubOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BreakpointId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakpointKind {
    StaticCall,
    DynamicCall,
    ClosureCall,
    Return,
}

impl BreakpointKind {
    fn stub(self) -> Option<StubKind> {
        match self {
            BreakpointKind::StaticCall => Some(StubKind::BreakpointStatic),
            BreakpointKind::DynamicCall => Some(StubKind::BreakpointDynamic),
            BreakpointKind::ClosureCall => Some(StubKind::BreakpointClosure),
            BreakpointKind::Return => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Breakpoint {
    pub id: BreakpointId,
    pub kind: BreakpointKind,
    pub code: CodeId,
    /// Return address offset for calls, offset of the `RET` for returns.
    pub pc_offset: u32,
    pub token_pos: i32,
    /// The target the call site had before it was patched.
    original_target: usize,
}

/// One Dart frame, innermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActivationFrame {
    pub function: Option<FunctionId>,
    pub code: CodeId,
    pub pc_offset: u32,
    pub token_pos: i32,
}

/// Receives breakpoint events on the thread running the isolate.
pub trait DebuggerHook: Send + Sync {
    fn breakpoint_hit(&self, isolate: &mut Isolate, breakpoint: &Breakpoint);
}

#[derive(Default)]
pub struct Debugger {
    breakpoints: FxHashMap<BreakpointId, Breakpoint>,
    /// Absolute pc of the return address or `RET` → breakpoint.
    by_pc: FxHashMap<usize, BreakpointId>,
    next_id: u32,
    hits: u64,
}

impl Debugger {
    pub fn len(&self) -> usize {
        self.breakpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakpoints.is_empty()
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    /// Records `target` as the resume target of a call breakpoint at
    /// `ret`, if there is one. Returns whether the site is a breakpoint.
    pub(crate) fn update_original_target(&mut self, ret: usize, target: usize) -> bool {
        let Some(id) = self.by_pc.get(&ret) else {
            return false;
        };
        match self.breakpoints.get_mut(id) {
            Some(bp) if bp.kind != BreakpointKind::Return => {
                bp.original_target = target;
                true
            }
            _ => false,
        }
    }
}

impl Isolate {
    // ── Setting and clearing ───────────────────────────────────────

    fn add_breakpoint(&mut self, kind: BreakpointKind, code: CodeId, pc_offset: u32, original_target: usize) -> BreakpointId {
        let token_pos = self.code(code).pc_descriptors.token_pos_at(pc_offset);
        let debugger = &mut self.debugger;
        let id = BreakpointId(debugger.next_id);
        debugger.next_id += 1;
        let pc = self.code(code).entry_point() + pc_offset as usize;
        let bp = Breakpoint {
            id,
            kind,
            code,
            pc_offset,
            token_pos,
            original_target,
        };
        log::debug!("breakpoint {} ({:?}) in '{}' at offset {}", id.0, kind, self.code(code).name, pc_offset);
        self.debugger.breakpoints.insert(id, bp);
        self.debugger.by_pc.insert(pc, id);
        id
    }

    /// Breaks before the call that returns to `ret_offset` in `code`.
    pub fn set_call_breakpoint(&mut self, code: CodeId, ret_offset: u32) -> Result<BreakpointId, ApiError> {
        let c = self.code(code);
        let kind = match c
            .pc_descriptors
            .at_pc(ret_offset)
            .map(|d| d.kind)
            .find(|k| matches!(k, PcDescriptorKind::IcCall | PcDescriptorKind::FuncCall))
        {
            Some(PcDescriptorKind::IcCall) => BreakpointKind::DynamicCall,
            Some(_) if c.static_call_at(ret_offset).is_some() => BreakpointKind::StaticCall,
            Some(_) => BreakpointKind::ClosureCall,
            None => return Err(ApiError::NotFound(format!("call at offset {ret_offset} in '{}'", c.name))),
        };
        let ret = c.entry_point() + ret_offset as usize;
        if self.debugger.by_pc.contains_key(&ret) {
            return Err(ApiError::InvalidArgument("breakpoint already set"));
        }
        let original = call_target_at(ret);
        let stub = kind.stub().map(|k| self.stub_entry(k)).unwrap_or(original);
        set_call_target_at(ret, stub);
        Ok(self.add_breakpoint(kind, code, ret_offset, original))
    }

    /// Breaks when `code` returns through the `RET` at `offset`.
    pub fn set_return_breakpoint(&mut self, code: CodeId, offset: u32) -> Result<BreakpointId, ApiError> {
        let c = self.code(code);
        if c.pc_descriptors.find(offset, PcDescriptorKind::Return).is_none() {
            return Err(ApiError::NotFound(format!("return at offset {offset} in '{}'", c.name)));
        }
        let pc = c.entry_point() + offset as usize;
        if self.debugger.by_pc.contains_key(&pc) {
            return Err(ApiError::InvalidArgument("breakpoint already set"));
        }
        unsafe { (pc as *mut u8).write(op::RET_BREAKPOINT) };
        Ok(self.add_breakpoint(BreakpointKind::Return, code, offset, 0))
    }

    /// Breaks on every return of the current code of `function`.
    pub fn set_function_return_breakpoints(&mut self, function: FunctionId) -> Result<Vec<BreakpointId>, ApiError> {
        let Some(code) = self.function(function).code else {
            return Err(ApiError::NotFound(self.function(function).name.clone()));
        };
        let offsets: Vec<u32> = self
            .code(code)
            .pc_descriptors
            .iter()
            .filter(|d| d.kind == PcDescriptorKind::Return)
            .map(|d| d.pc_offset)
            .collect();
        offsets.into_iter().map(|offset| self.set_return_breakpoint(code, offset)).collect()
    }

    pub fn remove_breakpoint(&mut self, id: BreakpointId) -> Result<(), ApiError> {
        let Some(bp) = self.debugger.breakpoints.remove(&id) else {
            return Err(ApiError::NotFound(format!("breakpoint {}", id.0)));
        };
        let pc = self.code(bp.code).entry_point() + bp.pc_offset as usize;
        self.debugger.by_pc.remove(&pc);
        match bp.kind {
            BreakpointKind::Return => unsafe { (pc as *mut u8).write(op::RET) },
            _ => set_call_target_at(pc, bp.original_target),
        }
        Ok(())
    }

    pub fn breakpoint(&self, id: BreakpointId) -> Option<&Breakpoint> {
        self.debugger.breakpoints.get(&id)
    }

    // ── Hits ───────────────────────────────────────────────────────

    fn report_breakpoint(&mut self, bp: Breakpoint) {
        self.debugger.hits += 1;
        log::debug!("breakpoint {} hit in '{}'", bp.id.0, self.code(bp.code).name);
        if let Some(hook) = self.runtime.debugger_hook().map(Arc::clone) {
            hook.breakpoint_hit(self, &bp);
        }
    }

    /// Body of the breakpoint stubs. The call's registers are untouched,
    /// so the original target runs as if called directly.
    pub(crate) fn breakpoint_stub(&mut self, kind: StubKind) -> RuntimeResult<StubOutcome> {
        let ret = self.stub_return_address();
        let found = self.debugger.by_pc.get(&ret).and_then(|id| self.debugger.breakpoints.get(id)).cloned();
        let Some(bp) = found else {
            let message = format!("{kind:?} reached without a breakpoint");
            return Err(self.raise_error(crate::error::ErrorKind::Api, &message));
        };
        let target = bp.original_target;
        self.report_breakpoint(bp);
        debug_assert_eq!(call_target_at(ret), self.stub_entry(kind));
        Ok(StubOutcome::Jump(target))
    }

    pub(crate) fn return_breakpoint_hit(&mut self, pc: usize) -> RuntimeResult<()> {
        let found = self.debugger.by_pc.get(&pc).and_then(|id| self.debugger.breakpoints.get(id)).cloned();
        if let Some(bp) = found {
            self.report_breakpoint(bp);
        }
        self.check_interrupts()
    }

    // ── Inspection ─────────────────────────────────────────────────

    /// Dart frames of every entry level, innermost first.
    pub fn stack_trace(&self) -> Vec<ActivationFrame> {
        self.roots
            .frames
            .walker()
            .filter_map(|frame| match frame {
                StackFrame::Dart { pc, code, .. } => Some((pc, code)),
                StackFrame::Entry { .. } => None,
            })
            .map(|(pc, code)| {
                let c = self.code(code);
                let pc_offset = c.pc_offset(pc);
                ActivationFrame {
                    function: c.function,
                    code,
                    pc_offset,
                    token_pos: c.pc_descriptors.token_pos_at(pc_offset),
                }
            })
            .collect()
    }
}
