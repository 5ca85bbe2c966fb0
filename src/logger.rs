// Logging macros for the dialogue core.
//
// Library code only talks to the `log` facade; the binary decides where the
// records go (see `setup_logging` in main.rs).

/// Log target shared by every record emitted from this crate.
pub const LOG_TARGET: &str = "llama_chat";

#[macro_export]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        ::log::debug!(target: $crate::logger::LOG_TARGET, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_info {
    ($($arg:tt)*) => {
        ::log::info!(target: $crate::logger::LOG_TARGET, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        ::log::warn!(target: $crate::logger::LOG_TARGET, $($arg)*)
    };
}

#[macro_export]
macro_rules! log_error {
    ($($arg:tt)*) => {
        ::log::error!(target: $crate::logger::LOG_TARGET, $($arg)*)
    };
}

/// Shorten long text for log lines (prompts can be many kilobytes).
pub fn preview(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}
