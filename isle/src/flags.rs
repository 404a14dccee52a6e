//! VM flags.
//!
//! Parsed once, before the runtime is initialized, from an argv-style list
//! (`--verbose_gc`, `--optimization_counter_threshold=100`, ...).

use clap::{ArgAction, Parser};
use heap::HeapSettings;

#[derive(Parser, Debug, Clone)]
#[command(name = "isle", about = "VM flags", disable_help_flag = true, disable_version_flag = true)]
pub struct VmFlags {
    /// Log every collection with before/after sizes
    #[arg(long = "verbose_gc")]
    pub verbose_gc: bool,

    /// Verify the heap before each collection
    #[arg(long = "verify_before_gc")]
    pub verify_before_gc: bool,

    /// Verify the heap after each collection
    #[arg(long = "verify_after_gc")]
    pub verify_after_gc: bool,

    /// Collect before every allocation that may collect
    #[arg(long = "gc_at_alloc")]
    pub gc_at_alloc: bool,

    /// Let allocation stubs bump-allocate without a runtime call
    #[arg(long = "inline_alloc", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = true, default_missing_value = "true")]
    pub inline_alloc: bool,

    /// Force every allocation stub through the runtime
    #[arg(long = "use_slow_path")]
    pub use_slow_path: bool,

    /// Use SSE 4.1 if available
    #[arg(long = "use_sse41", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = true, default_missing_value = "true")]
    pub use_sse41: bool,

    /// Log the message of a STOP instruction before trapping
    #[arg(long = "print_stop_message", action = ArgAction::Set, num_args = 0..=1,
          default_value_t = true, default_missing_value = "true")]
    pub print_stop_message: bool,

    /// Check parameter and field types
    #[arg(long = "enable_type_checks")]
    pub enable_type_checks: bool,

    /// Usage count at which a function is optimized
    #[arg(long = "optimization_counter_threshold", default_value_t = 2000)]
    pub optimization_counter_threshold: u32,

    /// Log calls made through optimized inline caches
    #[arg(long = "trace_optimized_ic_calls")]
    pub trace_optimized_ic_calls: bool,

    /// Log bootstrap objects as they are created
    #[arg(long = "print_bootstrap")]
    pub print_bootstrap: bool,

    /// Checked classes after which a call site goes megamorphic
    #[arg(long = "megamorphic_threshold", default_value_t = 4)]
    pub megamorphic_threshold: usize,

    /// Deoptimizations after which a function is no longer optimized
    #[arg(long = "deoptimization_counter_threshold", default_value_t = 16)]
    pub deoptimization_counter_threshold: u32,

    /// Size of one young semispace in KB
    #[arg(long = "semi_space_size_kb", default_value_t = 2048)]
    pub semi_space_size_kb: usize,

    /// Maximum old generation size in MB
    #[arg(long = "old_gen_heap_size_mb", default_value_t = 512)]
    pub old_gen_heap_size_mb: usize,

    /// Emit a perf symbol map through the file callbacks
    #[arg(long = "generate_perf_events_symbols")]
    pub generate_perf_events_symbols: bool,
}

impl Default for VmFlags {
    fn default() -> Self {
        // Parsing an empty argv cannot fail: every flag has a default.
        VmFlags::parse_from(["isle"])
    }
}

impl VmFlags {
    pub fn heap_settings(&self) -> HeapSettings {
        HeapSettings {
            semi_space_size: self.semi_space_size_kb * 1024,
            old_capacity: self.old_gen_heap_size_mb * 1024 * 1024,
            verbose_gc: self.verbose_gc,
            verify_before_gc: self.verify_before_gc,
            verify_after_gc: self.verify_after_gc,
            gc_at_alloc: self.gc_at_alloc,
            ..HeapSettings::default()
        }
    }

    /// Inline allocation fast paths are usable.
    pub fn allocate_inline(&self) -> bool {
        self.inline_alloc && !self.use_slow_path
    }
}

/// Parses VM flags from an argv list (without the program name).
pub fn set_vm_flags<I, S>(argv: I) -> Result<VmFlags, clap::Error>
where
    I: IntoIterator<Item = S>,
    S: Into<std::ffi::OsString> + Clone,
{
    let args = std::iter::once(std::ffi::OsString::from("isle"))
        .chain(argv.into_iter().map(Into::into));
    VmFlags::try_parse_from(args)
}
