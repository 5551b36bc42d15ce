use std::fmt;

/// Recording state of a command buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommandBufferState {
    /// Freshly allocated or reset.
    #[default]
    Initial,
    /// Between `begin` and `end`.
    Recording,
    /// Recorded and ready to submit.
    Executable,
    /// Submitted and not yet known to be complete.
    Pending,
}

impl fmt::Display for CommandBufferState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::Initial => "initial",
            Self::Recording => "recording",
            Self::Executable => "executable",
            Self::Pending => "pending",
        };
        f.write_str(text)
    }
}

/// Operations that move a command buffer between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    Begin,
    End,
    Reset,
    Submit,
    Complete,
}

impl CommandBufferState {
    /// State reached by applying `event`, or `None` if the move is illegal.
    ///
    /// `resettable` tells whether the owning pool allows resetting single
    /// buffers, which is what lets `begin` restart an executable buffer.
    pub fn apply(self, event: StateEvent, resettable: bool) -> Option<Self> {
        use CommandBufferState::{Executable, Initial, Pending, Recording};
        match (self, event) {
            (Initial, StateEvent::Begin) => Some(Recording),
            (Executable, StateEvent::Begin) if resettable => Some(Recording),
            (Recording, StateEvent::End) => Some(Executable),
            (Initial | Recording | Executable, StateEvent::Reset) if resettable => Some(Initial),
            (Executable, StateEvent::Submit) => Some(Pending),
            (Pending, StateEvent::Complete) => Some(Executable),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_submit_complete_cycle() {
        let state = CommandBufferState::default();
        let state = state.apply(StateEvent::Begin, false).unwrap();
        assert_eq!(state, CommandBufferState::Recording);
        let state = state.apply(StateEvent::End, false).unwrap();
        let state = state.apply(StateEvent::Submit, false).unwrap();
        assert_eq!(state, CommandBufferState::Pending);
        assert_eq!(
            state.apply(StateEvent::Complete, false),
            Some(CommandBufferState::Executable)
        );
    }

    #[test]
    fn pending_buffers_cannot_be_touched() {
        let pending = CommandBufferState::Pending;
        assert_eq!(pending.apply(StateEvent::Begin, true), None);
        assert_eq!(pending.apply(StateEvent::Reset, true), None);
        assert_eq!(pending.apply(StateEvent::Submit, true), None);
    }

    #[test]
    fn reset_requires_resettable_pool() {
        let executable = CommandBufferState::Executable;
        assert_eq!(executable.apply(StateEvent::Reset, false), None);
        assert_eq!(executable.apply(StateEvent::Begin, false), None);
        assert_eq!(
            executable.apply(StateEvent::Reset, true),
            Some(CommandBufferState::Initial)
        );
        assert_eq!(
            executable.apply(StateEvent::Begin, true),
            Some(CommandBufferState::Recording)
        );
    }

    #[test]
    fn failed_recording_is_closed_then_reset() {
        let recording = CommandBufferState::Recording;
        let closed = recording.apply(StateEvent::End, true).unwrap();
        assert_eq!(
            closed.apply(StateEvent::Reset, true),
            Some(CommandBufferState::Initial)
        );

        let closed = recording.apply(StateEvent::End, false).unwrap();
        assert_eq!(closed, CommandBufferState::Executable);
        assert_eq!(closed.apply(StateEvent::Reset, false), None);
    }

    #[test]
    fn end_without_begin_is_rejected() {
        assert_eq!(CommandBufferState::Initial.apply(StateEvent::End, true), None);
        assert_eq!(CommandBufferState::Initial.apply(StateEvent::Submit, true), None);
    }
}
