//! Structured logging helpers.
//!
//! Every endpoint log line carries a `component` field (`requestor`,
//! `listener`, `producer`, ...) so JSON output can be filtered per role.

/// Emit a structured log entry tagged with a component.
///
/// # Example
///
/// ```rust,ignore
/// log_event!(info, "requestor", "Reply channel ready", destination = %dest);
/// ```
#[macro_export]
macro_rules! log_event {
    (info, $component:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::info!(
            component = $component,
            $($($field)*,)?
            $msg
        )
    };

    (warn, $component:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::warn!(
            component = $component,
            $($($field)*,)?
            $msg
        )
    };

    (error, $component:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::error!(
            component = $component,
            $($($field)*,)?
            $msg
        )
    };

    (debug, $component:expr, $msg:expr $(, $($field:tt)*)?) => {
        tracing::debug!(
            component = $component,
            $($($field)*,)?
            $msg
        )
    };
}

/// Log an event about a correlated exchange with standard fields.
#[macro_export]
macro_rules! log_exchange_event {
    ($level:ident, $component:expr, $msg:expr, $correlation_id:expr $(, $($field:tt)*)?) => {
        tracing::$level!(
            component = $component,
            correlation_id = %$correlation_id,
            $($($field)*,)?
            $msg
        )
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_macros_expand_without_subscriber() {
        let id = "corr-1";
        log_event!(info, "test", "plain event");
        log_event!(warn, "test", "event with fields", attempt = 3);
        log_exchange_event!(debug, "test", "exchange event", id, destination = "queue://a");
    }
}
