use std::io;
use std::io::IoSlice;
use std::sync::Arc;
use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::trace;
use crate::endpoint::Endpoint;
use crate::net::{post, spawn_close, EventSink};

/// A TCP stream with at most one connect, one read and one write in flight.
///
/// Reads and writes work on a shared handle to the stream, so they can be in flight at the same
///  time without splitting it.
#[derive(Default)]
pub struct TcpSocket {
    stream: Option<Arc<TcpStream>>,
    connect_task: Option<JoinHandle<()>>,
    read_task: Option<JoinHandle<()>>,
    write_task: Option<JoinHandle<()>>,
}

impl TcpSocket {
    pub fn new() -> TcpSocket {
        TcpSocket::default()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_some() || self.connect_task.is_some()
    }

    /// The connected stream is handed to `on_done` rather than kept, so the owner decides whether
    ///  it still wants it - it may have been closed in the meantime.
    pub fn connect<E: Send + 'static>(&mut self, endpoint: Endpoint, sink: &EventSink<E>, on_done: impl FnOnce(io::Result<TcpStream>) -> E + Send + 'static) {
        debug_assert!(self.connect_task.is_none(), "connect already in flight");

        let sink = sink.clone();
        self.connect_task = Some(tokio::spawn(async move {
            let result = TcpStream::connect(endpoint.to_socket_addr()).await;
            post(&sink, on_done(result));
        }));
    }

    pub fn attach(&mut self, stream: TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        self.connect_task = None;
        self.stream = Some(Arc::new(stream));
        Ok(())
    }

    pub fn remote_endpoint(&self) -> io::Result<Endpoint> {
        match &self.stream {
            Some(stream) => Endpoint::try_from(stream.peer_addr()?),
            None => Err(io::ErrorKind::NotConnected.into()),
        }
    }

    /// Reads whatever is available into `buf` (at least one byte, or zero on EOF). The buffer
    ///  travels with the completion event and comes back to the owner.
    pub fn read_some<E: Send + 'static>(&mut self, mut buf: Vec<u8>, sink: &EventSink<E>, on_done: impl FnOnce(io::Result<usize>, Vec<u8>) -> E + Send + 'static) {
        debug_assert!(self.read_task.as_ref().map(|t| t.is_finished()).unwrap_or(true), "read already in flight");

        let Some(stream) = self.stream.clone() else {
            post(sink, on_done(Err(io::ErrorKind::NotConnected.into()), buf));
            return;
        };

        let sink = sink.clone();
        self.read_task = Some(tokio::spawn(async move {
            let result = read_available(&stream, &mut buf).await;
            post(&sink, on_done(result, buf));
        }));
    }

    /// Writes all of `buffers`, in order. The completion is posted once everything was written
    ///  or the first error occurred.
    pub fn write_all<E: Send + 'static>(&mut self, buffers: Vec<Bytes>, sink: &EventSink<E>, on_done: impl FnOnce(io::Result<()>) -> E + Send + 'static) {
        debug_assert!(self.write_task.as_ref().map(|t| t.is_finished()).unwrap_or(true), "write already in flight");

        let Some(stream) = self.stream.clone() else {
            post(sink, on_done(Err(io::ErrorKind::NotConnected.into())));
            return;
        };

        let sink = sink.clone();
        self.write_task = Some(tokio::spawn(async move {
            let result = write_gathered(&stream, &buffers).await;
            post(&sink, on_done(result));
        }));
    }

    /// Returns `false` if there was nothing to close; no close event is posted then.
    pub fn close<E: Send + 'static>(&mut self, sink: &EventSink<E>, on_closed: impl FnOnce() -> E + Send + 'static) -> bool {
        if !self.is_open() {
            return false;
        }

        let tasks = [self.connect_task.take(), self.read_task.take(), self.write_task.take()]
            .into_iter()
            .flatten()
            .collect();
        spawn_close(tasks, self.stream.take(), sink.clone(), on_closed);
        true
    }
}

async fn read_available(stream: &TcpStream, buf: &mut [u8]) -> io::Result<usize> {
    loop {
        stream.readable().await?;
        match stream.try_read(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(e),
        }
    }
}

async fn write_gathered(stream: &TcpStream, buffers: &[Bytes]) -> io::Result<()> {
    let mut index = 0;
    let mut offset = 0;

    loop {
        while index < buffers.len() && offset == buffers[index].len() {
            index += 1;
            offset = 0;
        }
        if index == buffers.len() {
            return Ok(());
        }

        stream.writable().await?;

        let written = {
            let mut slices = Vec::with_capacity(buffers.len() - index);
            slices.push(IoSlice::new(&buffers[index][offset..]));
            for b in &buffers[index+1..] {
                if !b.is_empty() {
                    slices.push(IoSlice::new(b));
                }
            }
            match stream.try_write_vectored(&slices) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => 0,
                Err(e) => return Err(e),
            }
        };
        trace!("wrote {} bytes", written);

        let mut remaining = written;
        while remaining > 0 {
            let available = buffers[index].len() - offset;
            if remaining < available {
                offset += remaining;
                remaining = 0;
            }
            else {
                remaining -= available;
                index += 1;
                offset = 0;
            }
        }
    }
}
