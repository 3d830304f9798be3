//! A peer connection attached to a group worker
//!
//! Each attached connection is split in two. The read half moves into a small
//! reader task that decodes frames and forwards them to the owning worker as
//! `ConnectionEvent`s; the write half stays with the worker, which is the only
//! task that ever writes to member sockets.

use log::debug;
use shared::{read_message, ClientId, Message, ProtocolError};
use std::io;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Events a worker buffers from its readers before they stop reading and
/// let TCP push back on the senders
pub const EVENT_QUEUE_CAPACITY: usize = 1000;

/// Identifier handed to a peer: the numeric value of its socket handle
#[cfg(unix)]
pub fn client_id_of(stream: &TcpStream) -> ClientId {
    use std::os::unix::io::AsRawFd;
    stream.as_raw_fd() as ClientId
}

#[cfg(windows)]
pub fn client_id_of(stream: &TcpStream) -> ClientId {
    use std::os::windows::io::AsRawSocket;
    stream.as_raw_socket() as ClientId
}

/// Events produced by reader tasks, consumed by the owning worker.
///
/// `serial` distinguishes two connections that were handed the same
/// recycled identifier.
#[derive(Debug)]
pub enum ConnectionEvent {
    Message {
        id: ClientId,
        serial: u64,
        message: Message,
    },
    UnknownTag {
        id: ClientId,
        serial: u64,
        tag: u8,
    },
    Closed {
        id: ClientId,
        serial: u64,
        error: ProtocolError,
    },
}

#[derive(Debug)]
pub struct Connection {
    pub serial: u64,
    writer: OwnedWriteHalf,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Splits the stream and starts its reader task.
    pub fn attach(
        id: ClientId,
        serial: u64,
        stream: TcpStream,
        events: mpsc::Sender<ConnectionEvent>,
    ) -> Self {
        let (read_half, writer) = stream.into_split();
        let reader = tokio::spawn(read_loop(id, serial, read_half, events));

        Self {
            serial,
            writer,
            reader,
        }
    }

    /// Writes an already encoded message, bounded by `limit`.
    pub async fn send(&mut self, bytes: &[u8], limit: Duration) -> io::Result<()> {
        match timeout(limit, self.writer.write_all(bytes)).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("send did not complete within {:?}", limit),
            )),
        }
    }

    /// Stops the reader task. The socket closes once both halves are gone.
    pub fn close(self) {
        self.reader.abort();
    }
}

async fn read_loop(
    id: ClientId,
    serial: u64,
    mut reader: OwnedReadHalf,
    events: mpsc::Sender<ConnectionEvent>,
) {
    loop {
        let event = match read_message(&mut reader).await {
            Ok(message) => ConnectionEvent::Message {
                id,
                serial,
                message,
            },
            Err(ProtocolError::UnknownTag(tag)) => ConnectionEvent::UnknownTag { id, serial, tag },
            Err(error) => {
                let _ = events.send(ConnectionEvent::Closed { id, serial, error }).await;
                break;
            }
        };

        // Waits while the worker is busy, so a stalled group stops reading
        if events.send(event).await.is_err() {
            debug!("Worker gone, reader for client {} exiting", id);
            break;
        }
    }
}
