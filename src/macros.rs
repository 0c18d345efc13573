// src/macros.rs

//
// Logging macros
//
// logging feature enabled  → tracing
// logging feature disabled → only log_error prints to stderr; the other
//                            macros type-check their arguments and do nothing
//

#![allow(unused_macros)]

// --------------------
// ERROR
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_error {
    ($($arg:tt)*) => {
        tracing::error!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_error {
    ($($arg:tt)*) => {
        eprintln!("ERROR {}", format_args!($($arg)*))
    };
}

// --------------------
// WARN
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        tracing::warn!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_warn {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

// --------------------
// INFO
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_info {
    ($($arg:tt)*) => {
        tracing::info!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_info {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

// --------------------
// DEBUG
// --------------------

#[cfg(feature = "logging")]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        tracing::debug!($($arg)*)
    };
}

#[cfg(not(feature = "logging"))]
macro_rules! log_debug {
    ($($arg:tt)*) => {
        if false {
            let _ = format_args!($($arg)*);
        }
    };
}

pub(crate) use log_debug;
pub(crate) use log_error;
pub(crate) use log_info;
pub(crate) use log_warn;

#[cfg(all(test, not(feature = "logging")))]
mod tests {
    // ---
    #[test]
    fn test_only_errors_survive_without_logging() {
        // ---
        let mut evaluated = 0;
        log_warn!("{}", { evaluated += 1; evaluated });
        log_info!("{}", { evaluated += 1; evaluated });
        log_debug!("{}", { evaluated += 1; evaluated });
        assert_eq!(evaluated, 0);

        log_error!("{}", { evaluated += 1; evaluated });
        assert_eq!(evaluated, 1);
    }
}
