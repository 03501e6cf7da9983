//! Asynchronous socket primitives.
//!
//! Every primitive is owned by exactly one component (a transport, an announcer, ...) which
//!  processes its events sequentially from a single queue. Starting an operation spawns a small
//!  task that posts a typed completion event back into that queue. Each primitive allows at most
//!  one operation of a given kind in flight.
//!
//! `close()` aborts whatever is in flight, waits for it to finish, releases the OS handle and
//!  then posts the owner's close event. Completions of aborted operations that were already
//!  posted are therefore always queued *before* the close event.

pub mod close_barrier;
pub mod deadline_timer;
pub mod tcp_acceptor;
pub mod tcp_socket;
pub mod udp_socket;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// The queue a primitive posts its completion events to
pub type EventSink<E> = mpsc::UnboundedSender<E>;

fn post<E>(sink: &EventSink<E>, event: E) {
    // the owner already finished when its queue is closed, nobody is left to notify
    let _ = sink.send(event);
}

/// Aborts the given tasks and posts `on_closed` once all of them finished. `resources` is
///  dropped after the tasks, which releases the OS handles they referenced.
fn spawn_close<E: Send + 'static, R: Send + 'static>(
    tasks: Vec<JoinHandle<()>>,
    resources: R,
    sink: EventSink<E>,
    on_closed: impl FnOnce() -> E + Send + 'static,
) {
    for task in &tasks {
        task.abort();
    }
    tokio::spawn(async move {
        for task in tasks {
            let _ = task.await;
        }
        drop(resources);
        post(&sink, on_closed());
    });
}
