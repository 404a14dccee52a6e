//! The isle runtime: isolates, message passing, inline-cached dispatch
//! and the code artifacts that tie them to the `heap` crate.

pub mod api;
pub mod assembler;
pub mod bigint;
pub mod class_table;
pub mod code;
pub mod cobject;
pub mod compiler;
pub mod debugger;
pub mod deopt;
pub mod error;
pub mod flags;
pub mod function;
pub mod handles;
pub mod heap_profiler;
pub mod ic;
pub mod interpreter;
pub mod isolate;
pub mod message;
pub mod patcher;
pub mod port;
pub mod runtime;
pub mod runtime_entries;
pub mod stack_frame;
pub mod stubs;
pub mod thread_pool;

#[cfg(test)]
mod scenarios;

use object::Value;

pub use api::{ApiResult, HandleScope};
pub use cobject::CObject;
pub use error::{ApiError, ErrorKind, RuntimeResult, Unwind};
pub use flags::{VmFlags, set_vm_flags};
pub use handles::{ErrorHandle, Handle};
pub use isolate::{Isolate, IsolateHandle};
pub use message::{Message, MessageHandler, Priority};
pub use port::{ILLEGAL_PORT, PortId};
pub use runtime::{Callbacks, Runtime, RuntimeConfig};

/// Pointer visitor handed to every heap the runtime creates.
///
/// # Safety
///
/// `obj` must point to a live, fully initialized object.
pub(crate) unsafe fn trace_object(obj: *const u8, visitor: &mut dyn FnMut(&mut Value)) {
    unsafe { object::visit_pointers(obj, visitor) }
}

/// # Safety
///
/// `obj` must point to a live object with an unforwarded header.
pub(crate) unsafe fn size_object(obj: *const u8) -> usize {
    unsafe { object::object_size(obj) }
}
