//! Upload state machine

/// Lifecycle of one upload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    /// Nothing sent to the store yet
    Idle,
    /// Session open, no parts dispatched
    Started,
    /// Reader and workers running
    Uploading,
    /// Every part acknowledged, completion in progress
    Finalizing,
    /// Object assembled by the store
    Completed,
    /// Failed or cancelled; terminal
    Aborted,
}

impl UploadState {
    /// Returns true if `next` may follow `self`
    pub fn can_transition_to(self, next: UploadState) -> bool {
        use UploadState::*;
        matches!(
            (self, next),
            (Idle, Started)
                | (Idle, Aborted)
                | (Started, Uploading)
                | (Started, Aborted)
                | (Uploading, Finalizing)
                | (Uploading, Aborted)
                | (Finalizing, Completed)
                | (Finalizing, Aborted)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UploadState::Completed | UploadState::Aborted)
    }
}

impl std::fmt::Display for UploadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}
