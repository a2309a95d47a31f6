//! Helper macros for the handshake state machine modules.

/// Leave the current state with a [`DoneEvent`](super::events::DoneEvent)
/// carrying [`ProtocolError::Cancelled`](crate::ProtocolError::Cancelled) when
/// the session's cancel flag is raised.
macro_rules! bail_if_cancelled {
    ($plan:expr, $ctx:ident) => {
        if $ctx.cancel.is_cancelled() {
            log::info!("Cancelled");
            return Event::Done(DoneEvent {
                plan: $plan,
                error: Some(crate::error::ProtocolError::Cancelled),
            });
        }
    };
}

/// Evaluate a `Result`, leaving the current state with a
/// [`DoneEvent`](super::events::DoneEvent) carrying the error on failure.
macro_rules! try_or_done {
    ($plan:expr, $result:expr) => {
        match $result {
            Ok(value) => value,
            Err(error) => {
                return Event::Done(DoneEvent {
                    plan: $plan,
                    error: Some(error),
                })
            }
        }
    };
}
