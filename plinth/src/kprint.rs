//! Kernel print utilities.
//!
//! The console itself is a driver concern; this module only owns the macros
//! and a pluggable sink. The embedder installs the sink once the console is
//! up; printing before that point is silently dropped.

use spin_lock::SpinLock;

static SINK: SpinLock<Option<fn(core::fmt::Arguments<'_>)>> = SpinLock::new(None);

/// Install the console sink.
pub fn set_sink(sink: fn(core::fmt::Arguments<'_>)) {
    *SINK.lock() = Some(sink);
}

#[doc(hidden)]
pub fn _print(fmt: core::fmt::Arguments<'_>) {
    if let Some(sink) = *SINK.lock() {
        sink(fmt)
    }
}

/// Prints out the message.
///
/// Use the format! syntax to write data to the console sink.
#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => ($crate::kprint::_print(format_args!($($arg)*)));
}

/// Prints out the message with a newline.
#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", format_args!($($arg)*)));
}

/// Display an information message.
#[macro_export]
macro_rules! info {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[INFO] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Display a warning message.
#[macro_export]
macro_rules! warning {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[WARNING] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}

/// Display a debug message.
#[macro_export]
macro_rules! debug {
    ($($arg:tt)*) => ($crate::kprint::_print(
            format_args!(
                "[DEBUG] {}\n",
                format_args!($($arg)*)
            )
        )
    );
}
