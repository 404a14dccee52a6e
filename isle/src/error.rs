//! Error kinds and the unwinder.
//!
//! Runtime operations return `Result<T, Unwind>`. `Unwind` carries no data:
//! the error object itself is parked in the isolate's [`Unwinder`], which is
//! a GC root, so it survives any collection that happens while frames and
//! handle scopes are being unwound.

use object::{ClassId, Value, cid};

/// Marker for a pending error. The error object lives in the [`Unwinder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Unwind;

pub type RuntimeResult<T> = Result<T, Unwind>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Embedder misuse of the API.
    Api,
    /// A compile-time error surfaced by lazy compilation.
    Compilation,
    /// A managed exception that escaped the outermost handler.
    UnhandledException,
    /// A request to shut the isolate down. Always propagates.
    Unwind,
}

impl ErrorKind {
    pub fn class_id(self) -> ClassId {
        match self {
            ErrorKind::Api => cid::API_ERROR,
            ErrorKind::Compilation => cid::LANGUAGE_ERROR,
            ErrorKind::UnhandledException => cid::UNHANDLED_EXCEPTION,
            ErrorKind::Unwind => cid::UNWIND_ERROR,
        }
    }

    pub fn from_class_id(class_id: ClassId) -> Option<ErrorKind> {
        match class_id {
            cid::API_ERROR => Some(ErrorKind::Api),
            cid::LANGUAGE_ERROR => Some(ErrorKind::Compilation),
            cid::UNHANDLED_EXCEPTION => Some(ErrorKind::UnhandledException),
            cid::UNWIND_ERROR => Some(ErrorKind::Unwind),
            _ => None,
        }
    }

    /// Whether managed `finally`/catch blocks may observe this error.
    pub fn runs_handlers(self) -> bool {
        self == ErrorKind::UnhandledException
    }
}

/// Embedder-facing failures that do not involve a heap object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    NoCurrentIsolate,
    IsolateAlreadyEntered,
    IsolateOwnedByOtherThread,
    InvalidHandle,
    WrongType { expected: &'static str },
    OutOfRange,
    NotFound(String),
    InvalidArgument(&'static str),
    ClosedPort(u64),
    Flags(String),
    Heap(heap::HeapError),
    /// The isolate is already borrowed on this thread.
    IsolateBusy,
    IsolateShutDown,
}

impl core::fmt::Display for ApiError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ApiError::NoCurrentIsolate => write!(f, "no current isolate"),
            ApiError::IsolateAlreadyEntered => {
                write!(f, "the current thread has already entered an isolate")
            }
            ApiError::IsolateOwnedByOtherThread => {
                write!(f, "isolate is entered by another thread")
            }
            ApiError::InvalidHandle => write!(f, "invalid handle"),
            ApiError::WrongType { expected } => write!(f, "expected {expected}"),
            ApiError::OutOfRange => write!(f, "index out of range"),
            ApiError::NotFound(name) => write!(f, "'{name}' not found"),
            ApiError::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            ApiError::ClosedPort(id) => write!(f, "port {id} is closed"),
            ApiError::Flags(msg) => write!(f, "bad VM flags: {msg}"),
            ApiError::Heap(err) => write!(f, "heap: {err}"),
            ApiError::IsolateBusy => write!(f, "isolate is already in use on this thread"),
            ApiError::IsolateShutDown => write!(f, "isolate has been shut down"),
        }
    }
}

impl std::error::Error for ApiError {}

/// Holds the error being propagated.
///
/// `pending` is null while nothing is unwinding.
#[derive(Debug)]
pub struct Unwinder {
    pub(crate) pending: Value,
    null: Value,
}

impl Unwinder {
    pub fn new(null: Value) -> Self {
        Self { pending: null, null }
    }

    pub fn is_pending(&self) -> bool {
        self.pending != self.null
    }

    pub fn pending(&self) -> Value {
        self.pending
    }

    /// Parks `error` and returns the propagation marker.
    pub fn raise(&mut self, error: Value) -> Unwind {
        debug_assert!(error.is_heap_object());
        self.pending = error;
        Unwind
    }

    pub fn take(&mut self) -> Value {
        std::mem::replace(&mut self.pending, self.null)
    }

    pub fn kind(&self) -> Option<ErrorKind> {
        if !self.is_pending() {
            return None;
        }
        ErrorKind::from_class_id(unsafe { self.pending.header() }.class_id())
    }

    pub(crate) fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.pending);
    }
}
