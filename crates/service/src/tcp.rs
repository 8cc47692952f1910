use std::{net::SocketAddr, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::{Semaphore, mpsc},
    task::JoinHandle,
};

use crate::reactor::Event;

/// Handles to the pair of tasks pumping one session's tcp socket.
///
/// The reader only pulls bytes off the socket while it can take a window
/// permit, which is how send-window backpressure reaches the tcp peer. The
/// writer drains a bounded queue; when the queue is full the reactor leaves
/// segments in the receive window unacknowledged, which is how slow local
/// writers backpressure the udp peer.
pub(crate) struct Pipe {
    writer: Option<mpsc::Sender<Bytes>>,
    permits: Arc<Semaphore>,
    reader: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Pipe {
    pub fn spawn(
        id: u16,
        stream: TcpStream,
        window: usize,
        segment: usize,
        events: mpsc::UnboundedSender<Event>,
    ) -> Self {
        // Disable the Nagle algorithm. Tunneled streams are interactive
        // often enough that batching hurts more than it helps.
        if let Err(e) = stream.set_nodelay(true) {
            log::warn!("tcp socket set nodelay failed: session={}, err={}", id, e);
        }

        let (read_half, write_half) = stream.into_split();
        let permits = Arc::new(Semaphore::new(window));
        let (writer, writer_rx) = mpsc::channel(window);

        Self {
            reader: tokio::spawn(run_reader(id, read_half, permits.clone(), events.clone(), segment)),
            writer_task: tokio::spawn(run_writer(id, write_half, writer_rx, events)),
            writer: Some(writer),
            permits,
        }
    }

    /// Queue bytes for the local tcp socket. Returns false when the writer
    /// queue is full or the writer is gone; the caller keeps the segment
    /// buffered and retries later.
    pub fn try_write(&self, bytes: Bytes) -> bool {
        match &self.writer {
            Some(writer) => writer.try_send(bytes).is_ok(),
            None => false,
        }
    }

    /// Stop pulling bytes off the local tcp socket.
    pub fn stop_reader(&self) {
        self.permits.close();
        self.reader.abort();
    }

    /// Let the writer drain its queue, send a fin and exit.
    pub fn close_writer(&mut self) {
        self.writer = None;
    }

    pub fn writer_closed(&self) -> bool {
        self.writer.is_none()
    }

    /// Tear both tasks down without flushing.
    pub fn abort(&self) {
        self.reader.abort();
        self.writer_task.abort();
    }
}

/// Read the local tcp socket one segment at a time, gated by the window
/// permits. Each chunk travels to the reactor together with the permit that
/// allowed it; the permit is released when the segment is acknowledged.
async fn run_reader(
    id: u16,
    mut stream: OwnedReadHalf,
    permits: Arc<Semaphore>,
    events: mpsc::UnboundedSender<Event>,
    segment: usize,
) {
    loop {
        let permit = match permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };

        let mut buf = vec![0u8; segment];
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => {
                let _ = events.send(Event::StreamEof { id });
                break;
            }
            Ok(size) => {
                buf.truncate(size);
                let bytes = Bytes::from(buf);
                if events.send(Event::StreamData { id, bytes, permit }).is_err() {
                    break;
                }
            }
        }
    }
}

/// Write reassembled stream bytes back to the local tcp socket. Dropping
/// the queue sender lets the task flush what is queued and send a fin.
async fn run_writer(
    id: u16,
    mut stream: OwnedWriteHalf,
    mut queue: mpsc::Receiver<Bytes>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(bytes) = queue.recv().await {
        if stream.write_all(&bytes).await.is_err() {
            let _ = events.send(Event::StreamBroken { id });
            return;
        }
    }

    let _ = stream.shutdown().await;
}

/// Accept loop for a client rule's listener. Every accepted connection
/// becomes a new session on the owning context.
pub(crate) fn spawn_listener(
    rule: u64,
    listener: TcpListener,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Ok((stream, addr)) = listener.accept().await {
            log::info!("tcp socket accept: addr={:?}, rule={}", addr, rule);
            if events.send(Event::Accepted { rule, stream }).is_err() {
                break;
            }
        }
    })
}

/// Backend connect for a server rule answering a peer connect request.
pub(crate) fn spawn_connector(
    id: u16,
    address: SocketAddr,
    events: mpsc::UnboundedSender<Event>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let result = TcpStream::connect(address).await;
        let _ = events.send(Event::Opened { id, result });
    })
}
