//! ---
//! ems_section: "03-persistence-logging"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Structured logging adapters and sinks."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---

/// Emit an event at `$level` carrying the fields of a [`LogContext`](crate::LogContext).
#[doc(hidden)]
#[macro_export]
macro_rules! ewm_event {
    ($level:expr, $ctx:expr, $($arg:tt)+) => {{
        let ctx = &$ctx;
        tracing::event!(
            $level,
            topic = ctx.topic.unwrap_or(""),
            correlation_id = ctx.correlation_id.unwrap_or(""),
            pipeline = ctx.pipeline.unwrap_or(""),
            $($arg)+
        );
    }};
}

/// Emit an informational log enriched with message context.
#[macro_export]
macro_rules! ewm_info {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::ewm_event!(tracing::Level::INFO, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::ewm_event!(tracing::Level::INFO, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a debug log enriched with message context.
#[macro_export]
macro_rules! ewm_debug {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::ewm_event!(tracing::Level::DEBUG, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::ewm_event!(tracing::Level::DEBUG, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit a trace log enriched with message context.
#[macro_export]
macro_rules! ewm_trace {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::ewm_event!(tracing::Level::TRACE, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::ewm_event!(tracing::Level::TRACE, $crate::LogContext::default(), $($arg)+)
    };
}

/// Emit an error log enriched with message context.
#[macro_export]
macro_rules! ewm_error {
    (context = $ctx:expr, $($arg:tt)+) => {
        $crate::ewm_event!(tracing::Level::ERROR, $ctx, $($arg)+)
    };
    ($($arg:tt)+) => {
        $crate::ewm_event!(tracing::Level::ERROR, $crate::LogContext::default(), $($arg)+)
    };
}
