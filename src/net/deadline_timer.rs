use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;
use crate::net::{post, spawn_close, EventSink};

/// A re-armable one-shot timer.
///
/// Every `wait()` gets a new generation number which the fire event carries. Re-arming or
///  cancelling the timer starts a new generation, so the owner can recognize and drop fire
///  events that were already queued for an older one.
#[derive(Debug, Default)]
pub struct DeadlineTimer {
    generation: u64,
    task: Option<JoinHandle<()>>,
    open: bool,
}

impl DeadlineTimer {
    pub fn new() -> DeadlineTimer {
        DeadlineTimer::default()
    }

    pub fn wait<E: Send + 'static>(&mut self, timeout: Duration, sink: &EventSink<E>, on_fire: impl FnOnce(u64) -> E + Send + 'static) {
        self.cancel();
        self.open = true;

        let generation = self.generation;
        let sink = sink.clone();
        trace!("arming timer generation {} for {:?}", generation, timeout);
        self.task = Some(tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            post(&sink, on_fire(generation));
        }));
    }

    pub fn cancel(&mut self) {
        self.generation += 1;
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }

    /// `true` if a fire event with this generation belongs to the most recent `wait()`
    pub fn is_current(&self, generation: u64) -> bool {
        self.open && self.generation == generation
    }

    /// Returns `false` if the timer was never armed since the last close; no close event is
    ///  posted then.
    pub fn close<E: Send + 'static>(&mut self, sink: &EventSink<E>, on_closed: impl FnOnce() -> E + Send + 'static) -> bool {
        if !self.open {
            return false;
        }
        self.open = false;
        self.generation += 1;

        let tasks = self.task.take().into_iter().collect();
        spawn_close(tasks, (), sink.clone(), on_closed);
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;
    use tokio::time::advance;

    #[derive(Debug, PartialEq)]
    enum Ev {
        Fired(u64),
        Closed,
    }

    #[tokio::test(start_paused = true)]
    async fn test_fire_and_rearm() {
        let (send, mut recv) = mpsc::unbounded_channel();
        let mut timer = DeadlineTimer::new();

        timer.wait(Duration::from_secs(1), &send, Ev::Fired);
        advance(Duration::from_millis(500)).await;
        timer.wait(Duration::from_secs(1), &send, Ev::Fired);
        advance(Duration::from_millis(700)).await;
        assert!(recv.try_recv().is_err());

        advance(Duration::from_millis(400)).await;
        let ev = recv.recv().await.unwrap();
        match ev {
            Ev::Fired(generation) => assert!(timer.is_current(generation)),
            Ev::Closed => panic!("unexpected close"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation() {
        let (send, mut recv) = mpsc::unbounded_channel();
        let mut timer = DeadlineTimer::new();

        timer.wait(Duration::ZERO, &send, Ev::Fired);
        let Some(Ev::Fired(first)) = recv.recv().await else { panic!() };
        assert!(timer.is_current(first));

        timer.cancel();
        assert!(!timer.is_current(first));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close() {
        let (send, mut recv) = mpsc::unbounded_channel();
        let mut timer = DeadlineTimer::new();

        assert!(!timer.close(&send, || Ev::Closed));

        timer.wait(Duration::from_secs(10), &send, Ev::Fired);
        assert!(timer.close(&send, || Ev::Closed));
        assert_eq!(recv.recv().await, Some(Ev::Closed));

        advance(Duration::from_secs(20)).await;
        assert!(recv.try_recv().is_err());
        assert!(!timer.close(&send, || Ev::Closed));
    }
}
