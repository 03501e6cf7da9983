/// Join barrier for a group of asynchronous close operations.
///
/// The owner registers every close it starts and confirms every close event it receives.
///  The confirmation of the last registered close is the point where the owner is fully torn
///  down and may finalize or restart.
#[derive(Debug, Default)]
pub struct CloseBarrier {
    pending: usize,
}

impl CloseBarrier {
    pub fn new() -> CloseBarrier {
        CloseBarrier::default()
    }

    pub fn register(&mut self) {
        self.pending += 1;
    }

    /// returns `true` iff this confirmation completed the barrier
    pub fn confirm(&mut self) -> bool {
        debug_assert!(self.pending > 0, "close confirmed that was never registered");
        self.pending = self.pending.saturating_sub(1);
        self.pending == 0
    }

    pub fn is_idle(&self) -> bool {
        self.pending == 0
    }

    pub fn pending(&self) -> usize {
        self.pending
    }
}
