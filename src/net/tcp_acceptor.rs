use std::io;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::debug;
use crate::endpoint::Endpoint;
use crate::net::{post, spawn_close, EventSink};

const LISTEN_BACKLOG: u32 = 1024;

#[derive(Default)]
pub struct TcpAcceptor {
    listener: Option<Arc<TcpListener>>,
    accept_task: Option<JoinHandle<()>>,
}

impl TcpAcceptor {
    pub fn new() -> TcpAcceptor {
        TcpAcceptor::default()
    }

    pub fn is_open(&self) -> bool {
        self.listener.is_some()
    }

    /// binds with reuse-address semantics and starts listening
    pub fn bind(&mut self, endpoint: Endpoint) -> io::Result<()> {
        debug_assert!(self.listener.is_none(), "acceptor is already bound");

        let socket = tokio::net::TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(endpoint.to_socket_addr())?;
        let listener = socket.listen(LISTEN_BACKLOG)?;
        debug!("listening on {:?}", listener.local_addr());

        self.listener = Some(Arc::new(listener));
        Ok(())
    }

    pub fn local_endpoint(&self) -> io::Result<Endpoint> {
        match &self.listener {
            Some(listener) => Endpoint::try_from(listener.local_addr()?),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Posts every accepted connection. The first accept error is posted as well and ends the
    ///  accept loop.
    pub fn start_listen<E: Send + 'static>(&mut self, sink: &EventSink<E>, on_accept: impl Fn(io::Result<TcpStream>) -> E + Send + 'static) {
        let Some(listener) = self.listener.clone() else {
            post(sink, on_accept(Err(io::ErrorKind::NotConnected.into())));
            return;
        };

        let sink = sink.clone();
        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {:?}", addr);
                        if sink.send(on_accept(Ok(stream))).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        post(&sink, on_accept(Err(e)));
                        break;
                    }
                }
            }
        }));
    }

    /// Returns `false` if the acceptor was not bound; no close event is posted then.
    pub fn close<E: Send + 'static>(&mut self, sink: &EventSink<E>, on_closed: impl FnOnce() -> E + Send + 'static) -> bool {
        let Some(listener) = self.listener.take() else {
            return false;
        };
        let tasks = self.accept_task.take().into_iter().collect();
        spawn_close(tasks, listener, sink.clone(), on_closed);
        true
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum Ev {
        Accepted(io::Result<TcpStream>),
        Closed,
    }

    #[tokio::test]
    async fn test_accept_and_close() {
        let (send, mut recv) = mpsc::unbounded_channel();
        let mut acceptor = TcpAcceptor::new();
        acceptor.bind(Endpoint::localhost(0)).unwrap();
        let endpoint = acceptor.local_endpoint().unwrap();
        assert_ne!(endpoint.port, 0);

        acceptor.start_listen(&send, Ev::Accepted);
        let _c1 = TcpStream::connect(endpoint.to_socket_addr()).await.unwrap();
        let _c2 = TcpStream::connect(endpoint.to_socket_addr()).await.unwrap();
        assert!(matches!(recv.recv().await, Some(Ev::Accepted(Ok(_)))));
        assert!(matches!(recv.recv().await, Some(Ev::Accepted(Ok(_)))));

        assert!(acceptor.close(&send, || Ev::Closed));
        assert!(matches!(recv.recv().await, Some(Ev::Closed)));
        assert!(!acceptor.close(&send, || Ev::Closed));

        // the port is free again
        let mut rebound = TcpAcceptor::new();
        rebound.bind(endpoint).unwrap();
    }

    #[tokio::test]
    async fn test_bind_conflict() {
        let blocker = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = blocker.local_addr().unwrap().port();

        let mut acceptor = TcpAcceptor::new();
        assert!(acceptor.bind(Endpoint::localhost(port)).is_err());
        assert!(!acceptor.is_open());
    }
}
