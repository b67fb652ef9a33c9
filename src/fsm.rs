//! The SMTP session state machine's alphabet: states and events.
//! Transition logic itself lives in [`crate::context`], which owns the
//! mutable state the transitions act on (the buffer, queue, and
//! transaction); this module only names the states/events so the
//! dispatch table in `context.rs` reads like the table in the design.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Init,
    WaitEhlo,
    WaitMail,
    WaitRcpt,
    WaitRcptOrData,
    WaitMoreData,
    Error,
    Invalid,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Begin,
    Rset,
    Ehlo,
    Mail,
    Rcpt,
    Data,
    MoreData,
    DataEnd,
    Noop,
    Vrfy,
    Quit,
    Timeout,
    Invalid,
}

/// Outcome of a single transition handler, driving the dispatcher the
/// way §4.F describes: `Succeed` advances state and consumes the
/// line, `Failed` stays put with a response already enqueued,
/// `Wait` stays put pending an async write with the line not yet
/// consumed, `Error` moves to the `Error` state with a `451` enqueued
/// by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepResult {
    Succeed,
    Failed,
    Wait,
    Error,
}

impl State {
    /// Whether this state is terminal: the dispatcher stops feeding it
    /// new commands once the outbound queue drains.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Done | State::Invalid)
    }
}
