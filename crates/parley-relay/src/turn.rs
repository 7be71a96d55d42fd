use parley_core::ids::TurnId;

/// Lifecycle of an in-progress assistant turn.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TurnStatus {
    Active,
    Complete,
    Failed,
}

/// An assistant message being assembled from streamed fragments. Exists
/// only for the duration of one relay invocation and is never persisted
/// until finalized.
pub struct StreamingTurn {
    id: TurnId,
    buffer: String,
    status: TurnStatus,
}

impl StreamingTurn {
    pub fn new(id: TurnId) -> Self {
        Self {
            id,
            buffer: String::new(),
            status: TurnStatus::Active,
        }
    }

    pub fn id(&self) -> &TurnId {
        &self.id
    }

    pub fn status(&self) -> TurnStatus {
        self.status
    }

    pub fn append(&mut self, fragment: &str) {
        debug_assert_eq!(self.status, TurnStatus::Active);
        self.buffer.push_str(fragment);
    }

    /// Accumulated text so far.
    pub fn content(&self) -> &str {
        &self.buffer
    }

    /// Mark the turn complete and take the full text for persistence.
    pub fn finish(mut self) -> String {
        self.status = TurnStatus::Complete;
        std::mem::take(&mut self.buffer)
    }

    /// Mark the turn failed. The partial buffer is discarded, never stored.
    pub fn fail(&mut self) {
        self.status = TurnStatus::Failed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accumulates_fragments_in_order() {
        let mut turn = StreamingTurn::new(TurnId::new());
        turn.append("Hi");
        turn.append(" there");
        assert_eq!(turn.content(), "Hi there");
        assert_eq!(turn.status(), TurnStatus::Active);
    }

    #[test]
    fn finish_yields_full_text() {
        let mut turn = StreamingTurn::new(TurnId::new());
        turn.append("done");
        assert_eq!(turn.finish(), "done");
    }

    #[test]
    fn empty_turn_finishes_empty() {
        let turn = StreamingTurn::new(TurnId::new());
        assert_eq!(turn.finish(), "");
    }

    #[test]
    fn fail_marks_status() {
        let mut turn = StreamingTurn::new(TurnId::new());
        turn.append("partial");
        turn.fail();
        assert_eq!(turn.status(), TurnStatus::Failed);
    }
}
