//! Protocol exerciser: a peer that joins a group, greets, and keeps sending
//! position updates while answering its groupmates.

use crate::roster::Roster;
use log::{error, info, warn};
use rand::Rng;
use shared::{
    read_message, write_message, Acknowledgment, ClientId, Greeting, GroupId, Join, Message,
    NameReply, NameRequest, PeerName, Position, ProtocolError, DEFAULT_PORT,
};
use std::io;
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval, MissedTickBehavior};

/// Largest distance moved per axis on each position tick
const MAX_STEP: i32 = 5;

/// Appends the default port when `server` does not name one.
pub fn resolve_server_addr(server: &str) -> String {
    if server.parse::<std::net::SocketAddr>().is_ok() {
        return server.to_string();
    }

    match server.rsplit_once(':') {
        Some((_, port)) if port.parse::<u16>().is_ok() => server.to_string(),
        _ => format!("{}:{}", server, DEFAULT_PORT),
    }
}

pub struct Peer {
    id: ClientId,
    name: PeerName,
    writer: OwnedWriteHalf,
    reader: Option<OwnedReadHalf>,
    sequence: u32,
    position: (i32, i32, i32),
    roster: Roster,
}

impl Peer {
    pub async fn connect(server: &str, group: GroupId, name: &str) -> Result<Self, ProtocolError> {
        let addr = resolve_server_addr(server);
        info!("Connecting to {}...", addr);

        let stream = TcpStream::connect(&addr).await?;
        Self::handshake(stream, group, name).await
    }

    /// Join request, join confirmation, then greeting.
    pub async fn handshake(
        mut stream: TcpStream,
        group: GroupId,
        name: &str,
    ) -> Result<Self, ProtocolError> {
        write_message(&mut stream, &Message::Join(Join { group })).await?;

        let id = match read_message(&mut stream).await? {
            Message::JoinAck(ack) => ack.assigned_id,
            other => return Err(ProtocolError::UnexpectedMessage(other.tag())),
        };
        info!("Joined group {} as client {}", group, id);

        let name = PeerName::new(name);
        write_message(&mut stream, &Message::Greeting(Greeting { name })).await?;

        let (reader, writer) = stream.into_split();
        Ok(Self {
            id,
            name,
            writer,
            reader: Some(reader),
            sequence: 0,
            position: (100, 150, -200),
            roster: Roster::new(),
        })
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    pub fn roster(&self) -> &Roster {
        &self.roster
    }

    /// Moves a small random step and announces the new position.
    pub async fn send_position(&mut self) -> Result<Position, ProtocolError> {
        {
            let mut rng = rand::thread_rng();
            self.position.0 += rng.gen_range(-MAX_STEP..=MAX_STEP);
            self.position.1 += rng.gen_range(-MAX_STEP..=MAX_STEP);
            self.position.2 += rng.gen_range(-MAX_STEP..=MAX_STEP);
        }
        self.sequence += 1;

        let position = Position {
            origin: self.id,
            sequence: self.sequence,
            x: self.position.0,
            y: self.position.1,
            z: self.position.2,
        };
        write_message(&mut self.writer, &Message::Position(position)).await?;
        Ok(position)
    }

    /// Reacts to one message relayed by the server.
    pub async fn handle_message(&mut self, message: Message) -> Result<(), ProtocolError> {
        match message {
            Message::Position(position) => {
                let unknown = self.roster.record_position(position.origin, position.sequence);
                let ack = Acknowledgment {
                    origin: self.id,
                    destination: position.origin,
                    sequence: position.sequence,
                };
                write_message(&mut self.writer, &Message::Acknowledgment(ack)).await?;

                if unknown {
                    let request = NameRequest {
                        origin: self.id,
                        destination: position.origin,
                    };
                    write_message(&mut self.writer, &Message::NameRequest(request)).await?;
                }
            }
            Message::Acknowledgment(ack) => {
                self.roster.record_acknowledgment(ack.sequence);
                if ack.sequence == self.sequence {
                    info!("Client {} acknowledged our latest position", ack.origin);
                }
            }
            Message::NameRequest(request) => {
                let reply = NameReply {
                    origin: self.id,
                    destination: request.origin,
                    name: self.name,
                };
                write_message(&mut self.writer, &Message::NameReply(reply)).await?;
            }
            Message::NameReply(reply) => {
                self.roster.record_name(reply.origin, reply.name.to_string_lossy());
            }
            Message::Greeting(greeting) => {
                info!("{} joined the group", greeting.name);
            }
            Message::Disconnect(notice) => {
                let name = self
                    .roster
                    .forget(notice.origin)
                    .and_then(|neighbour| neighbour.name);
                info!(
                    "Client {} ({}) left the group",
                    notice.origin,
                    name.as_deref().unwrap_or("unknown")
                );
            }
            Message::Join(_) | Message::JoinAck(_) => {
                warn!("Unexpected {:?} from server", message.tag());
            }
        }
        Ok(())
    }

    /// Sends a position every `period` and answers incoming messages until
    /// the server closes the connection.
    pub async fn run(mut self, period: Duration) -> Result<(), ProtocolError> {
        let mut reader = self.reader.take().ok_or_else(|| {
            ProtocolError::Io(io::Error::new(io::ErrorKind::Other, "peer is already running"))
        })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            loop {
                match read_message(&mut reader).await {
                    Ok(message) => {
                        if tx.send(message).is_err() {
                            break;
                        }
                    }
                    Err(ProtocolError::UnknownTag(tag)) => {
                        warn!("Ignoring unknown message 0x{:02X}", tag);
                    }
                    Err(e) => {
                        error!("Connection lost: {}", e);
                        break;
                    }
                }
            }
        });

        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.send_position().await?;
                },
                message = rx.recv() => {
                    match message {
                        Some(message) => self.handle_message(message).await?,
                        None => {
                            info!("Server closed the connection");
                            return Ok(());
                        }
                    }
                },
            }
        }
    }
}
