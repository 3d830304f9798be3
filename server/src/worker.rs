//! Group worker: the per-group relay loop
//!
//! One worker task runs per active group. It owns every connection handed to
//! it by the router, the group's membership set, and the write side of each
//! socket. Reader tasks feed decoded frames in through a single event channel,
//! so the worker handles exactly one event at a time, in arrival order, and
//! never shares its state with another task.
//!
//! Relay policy per message kind:
//! - Greeting: sent to every current member, then the sender becomes a member
//! - Position: sent to every member except the sender
//! - Acknowledgment, NameRequest, NameReply: sent to `destination` only, if it
//!   is a connection attached to this worker
//! - Join, JoinAck, Disconnect: never valid from a peer here, discarded
//!
//! Any failed or timed-out write evicts the recipient the same way a closed
//! read does, and evictions are drained from a work-list so a cascade of
//! failures during a disconnect notice never recurses.

use crate::connection::{Connection, ConnectionEvent, EVENT_QUEUE_CAPACITY};
use crate::membership::Membership;
use log::{debug, error, info, warn};
use shared::{ClientId, Disconnect, GroupId, JoinAck, Message};
use std::collections::HashMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

/// Messages sent from the router to a group worker
#[derive(Debug)]
pub enum WorkerCommand {
    /// Hand a freshly joined connection over to this worker
    Attach { id: ClientId, stream: TcpStream },
    /// Snapshot of the membership set, in greeting order
    Members {
        reply: oneshot::Sender<Vec<ClientId>>,
    },
    Shutdown,
}

pub struct GroupWorker {
    group: GroupId,
    send_timeout: Duration,
    members: Membership,
    connections: HashMap<ClientId, Connection>,
    next_serial: u64,

    commands: mpsc::UnboundedReceiver<WorkerCommand>,
    events_tx: mpsc::Sender<ConnectionEvent>,
    events_rx: mpsc::Receiver<ConnectionEvent>,
}

impl GroupWorker {
    pub fn new(
        group: GroupId,
        send_timeout: Duration,
        commands: mpsc::UnboundedReceiver<WorkerCommand>,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        Self {
            group,
            send_timeout,
            members: Membership::new(),
            connections: HashMap::new(),
            next_serial: 0,
            commands,
            events_tx,
            events_rx,
        }
    }

    /// Starts a worker task for `group`, returning its command channel.
    pub fn spawn(
        group: GroupId,
        send_timeout: Duration,
    ) -> (mpsc::UnboundedSender<WorkerCommand>, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = GroupWorker::new(group, send_timeout, rx);
        let task = tokio::spawn(worker.run());
        (tx, task)
    }

    /// Main dispatch loop. Runs until told to shut down or the router drops
    /// the command channel.
    pub async fn run(mut self) {
        info!("Worker for group {} started", self.group);

        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(WorkerCommand::Attach { id, stream }) => {
                            self.attach(id, stream).await;
                        }
                        Some(WorkerCommand::Members { reply }) => {
                            let _ = reply.send(self.members.to_vec());
                        }
                        Some(WorkerCommand::Shutdown) | None => break,
                    }
                },

                Some(event) = self.events_rx.recv() => {
                    self.handle_event(event).await;
                },
            }
        }

        self.shutdown();
    }

    /// Registers the connection and confirms the join with its identifier.
    /// The connection is not a member until it greets.
    async fn attach(&mut self, id: ClientId, stream: TcpStream) {
        self.next_serial += 1;
        let serial = self.next_serial;

        let connection = Connection::attach(id, serial, stream, self.events_tx.clone());
        if let Some(stale) = self.connections.insert(id, connection) {
            warn!(
                "Group {}: client {} attached over a stale connection",
                self.group, id
            );
            stale.close();
        }
        debug!("Group {}: attached client {}", self.group, id);

        let ack = Message::JoinAck(JoinAck { assigned_id: id });
        if !self.send_to(id, &ack).await {
            self.evict(vec![id]).await;
        }
    }

    async fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Message {
                id,
                serial,
                message,
            } => {
                if self.is_current(id, serial) {
                    self.dispatch(id, message).await;
                } else {
                    debug!("Group {}: dropping message from stale client {}", self.group, id);
                }
            }
            ConnectionEvent::UnknownTag { id, serial, tag } => {
                if self.is_current(id, serial) {
                    warn!(
                        "Group {}: unrecognized message 0x{:02X} from client {}",
                        self.group, tag, id
                    );
                }
            }
            ConnectionEvent::Closed { id, serial, error } => {
                if self.is_current(id, serial) {
                    if error.is_disconnect() {
                        info!("Group {}: client {} disconnected", self.group, id);
                    } else {
                        warn!("Group {}: client {} dropped: {}", self.group, id, error);
                    }
                    self.evict(vec![id]).await;
                }
            }
        }
    }

    fn is_current(&self, id: ClientId, serial: u64) -> bool {
        self.connections
            .get(&id)
            .map(|connection| connection.serial == serial)
            .unwrap_or(false)
    }

    /// Executes the relay policy for one decoded message from `sender`.
    async fn dispatch(&mut self, sender: ClientId, message: Message) {
        match message {
            Message::Greeting(greeting) => {
                debug!(
                    "Group {}: greeting from client {} ({})",
                    self.group, sender, greeting.name
                );
                let failed = self.broadcast(&message, Some(sender)).await;
                if self.members.admit(sender) {
                    info!(
                        "Group {}: client {} joined as {}",
                        self.group, sender, greeting.name
                    );
                }
                self.evict(failed).await;
            }

            Message::Position(_) => {
                let failed = self.broadcast(&message, Some(sender)).await;
                self.evict(failed).await;
            }

            Message::Acknowledgment(_) | Message::NameRequest(_) | Message::NameReply(_) => {
                if let Some(destination) = message.destination() {
                    self.unicast(sender, destination, &message).await;
                }
            }

            Message::Join(_) | Message::JoinAck(_) | Message::Disconnect(_) => {
                warn!(
                    "Group {}: client {} sent {:?}, which is not relayed",
                    self.group,
                    sender,
                    message.tag()
                );
            }
        }
    }

    /// Sends to every member except `except`, returning the recipients the
    /// write failed for. Delivery continues past individual failures.
    async fn broadcast(&mut self, message: &Message, except: Option<ClientId>) -> Vec<ClientId> {
        let bytes = match message.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Group {}: failed to encode {:?}: {}", self.group, message.tag(), e);
                return Vec::new();
            }
        };

        let mut failed = Vec::new();
        for recipient in self.members.recipients_except(except) {
            if !self.send_bytes(recipient, &bytes).await {
                failed.push(recipient);
            }
        }
        failed
    }

    /// Point-to-point delivery. A destination that is not attached here is a
    /// dangling identifier and the message is dropped without a reply.
    async fn unicast(&mut self, sender: ClientId, destination: ClientId, message: &Message) {
        if !self.connections.contains_key(&destination) {
            debug!(
                "Group {}: {:?} from client {} to unknown client {} dropped",
                self.group,
                message.tag(),
                sender,
                destination
            );
            return;
        }

        if !self.send_to(destination, message).await {
            self.evict(vec![destination]).await;
        }
    }

    async fn send_to(&mut self, recipient: ClientId, message: &Message) -> bool {
        match message.encode() {
            Ok(bytes) => self.send_bytes(recipient, &bytes).await,
            Err(e) => {
                error!("Group {}: failed to encode {:?}: {}", self.group, message.tag(), e);
                true
            }
        }
    }

    async fn send_bytes(&mut self, recipient: ClientId, bytes: &[u8]) -> bool {
        let limit = self.send_timeout;
        let connection = match self.connections.get_mut(&recipient) {
            Some(connection) => connection,
            None => return false,
        };

        match connection.send(bytes, limit).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Group {}: send to client {} failed: {}",
                    self.group, recipient, e
                );
                false
            }
        }
    }

    /// Tears down each listed connection: unregister, close, drop from the
    /// membership set and, for members, notify the remaining members.
    /// Recipients that fail to take the notice are queued for the same.
    async fn evict(&mut self, mut pending: Vec<ClientId>) {
        while let Some(id) = pending.pop() {
            let connection = match self.connections.remove(&id) {
                Some(connection) => connection,
                None => continue,
            };
            connection.close();

            if !self.members.remove(id) {
                debug!("Group {}: client {} closed before greeting", self.group, id);
                continue;
            }

            info!(
                "Group {}: client {} left ({} members remain)",
                self.group,
                id,
                self.members.len()
            );
            if self.members.is_empty() {
                continue;
            }
            let notice = Message::Disconnect(Disconnect { origin: id });
            pending.extend(self.broadcast(&notice, None).await);
        }
    }

    fn shutdown(&mut self) {
        info!(
            "Worker for group {} stopping, closing {} connections",
            self.group,
            self.connections.len()
        );
        for (_, connection) in self.connections.drain() {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::client_id_of;
    use shared::{
        read_message, write_message, Acknowledgment, Greeting, NameReply, NameRequest, PeerName,
        Position,
    };
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    const SEND_TIMEOUT: Duration = Duration::from_millis(500);

    struct TestPeer {
        id: ClientId,
        stream: TcpStream,
    }

    impl TestPeer {
        async fn send(&mut self, message: Message) {
            write_message(&mut self.stream, &message).await.unwrap();
        }

        async fn recv(&mut self) -> Message {
            timeout(Duration::from_secs(2), read_message(&mut self.stream))
                .await
                .expect("timed out waiting for a message")
                .unwrap()
        }

        async fn expect_silence(&mut self) {
            let result = timeout(Duration::from_millis(150), read_message(&mut self.stream)).await;
            assert!(result.is_err(), "unexpected message: {:?}", result);
        }

        async fn greet(&mut self, name: &str) {
            self.send(Message::Greeting(Greeting {
                name: PeerName::new(name),
            }))
            .await;
        }
    }

    async fn attach_peer(
        listener: &TcpListener,
        worker: &mpsc::UnboundedSender<WorkerCommand>,
    ) -> TestPeer {
        let addr = listener.local_addr().unwrap();
        let stream = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        let id = client_id_of(&server_side);

        worker
            .send(WorkerCommand::Attach {
                id,
                stream: server_side,
            })
            .unwrap();

        let mut peer = TestPeer { id, stream };
        match peer.recv().await {
            Message::JoinAck(ack) => assert_eq!(ack.assigned_id, id),
            other => panic!("Expected JoinAck, got {:?}", other),
        }
        peer
    }

    async fn members(worker: &mpsc::UnboundedSender<WorkerCommand>) -> Vec<ClientId> {
        let (reply, rx) = oneshot::channel();
        worker.send(WorkerCommand::Members { reply }).unwrap();
        rx.await.unwrap()
    }

    async fn wait_for_members(worker: &mpsc::UnboundedSender<WorkerCommand>, count: usize) {
        for _ in 0..100 {
            if members(worker).await.len() == count {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("membership never reached {} members", count);
    }

    async fn setup() -> (TcpListener, mpsc::UnboundedSender<WorkerCommand>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (worker, _task) = GroupWorker::spawn(3, SEND_TIMEOUT);
        (listener, worker)
    }

    #[tokio::test]
    async fn test_greeting_goes_to_earlier_members_only() {
        let (listener, worker) = setup().await;
        let mut alice = attach_peer(&listener, &worker).await;
        let mut bob = attach_peer(&listener, &worker).await;

        alice.greet("Alice").await;
        wait_for_members(&worker, 1).await;

        bob.greet("Bob").await;
        wait_for_members(&worker, 2).await;

        match alice.recv().await {
            Message::Greeting(greeting) => assert_eq!(greeting.name.to_string_lossy(), "Bob"),
            other => panic!("Expected Bob's greeting, got {:?}", other),
        }

        // Bob never sees Alice's earlier greeting and Alice never sees her own
        bob.expect_silence().await;
        alice.expect_silence().await;

        assert_eq!(members(&worker).await, vec![alice.id, bob.id]);
    }

    #[tokio::test]
    async fn test_position_broadcast_excludes_sender() {
        let (listener, worker) = setup().await;
        let mut alice = attach_peer(&listener, &worker).await;
        let mut bob = attach_peer(&listener, &worker).await;
        let mut carol = attach_peer(&listener, &worker).await;

        alice.greet("Alice").await;
        wait_for_members(&worker, 1).await;
        bob.greet("Bob").await;
        wait_for_members(&worker, 2).await;
        carol.greet("Carol").await;
        wait_for_members(&worker, 3).await;

        // drain greetings
        alice.recv().await;
        alice.recv().await;
        bob.recv().await;

        let position = Message::Position(Position {
            origin: alice.id,
            sequence: 1,
            x: 100,
            y: 150,
            z: -200,
        });
        alice.send(position).await;

        assert_eq!(bob.recv().await, position);
        assert_eq!(carol.recv().await, position);
        alice.expect_silence().await;
        bob.expect_silence().await;
        carol.expect_silence().await;
    }

    #[tokio::test]
    async fn test_directed_messages_reach_destination_only() {
        let (listener, worker) = setup().await;
        let mut alice = attach_peer(&listener, &worker).await;
        let mut bob = attach_peer(&listener, &worker).await;
        let mut carol = attach_peer(&listener, &worker).await;

        let ack = Message::Acknowledgment(Acknowledgment {
            origin: bob.id,
            destination: alice.id,
            sequence: 4,
        });
        let request = Message::NameRequest(NameRequest {
            origin: alice.id,
            destination: carol.id,
        });
        let reply = Message::NameReply(NameReply {
            origin: carol.id,
            destination: alice.id,
            name: PeerName::new("Carol"),
        });

        bob.send(ack).await;
        assert_eq!(alice.recv().await, ack);

        alice.send(request).await;
        assert_eq!(carol.recv().await, request);

        carol.send(reply).await;
        assert_eq!(alice.recv().await, reply);

        alice.expect_silence().await;
        bob.expect_silence().await;
        carol.expect_silence().await;
    }

    #[tokio::test]
    async fn test_disconnect_notifies_remaining_members() {
        let (listener, worker) = setup().await;
        let mut alice = attach_peer(&listener, &worker).await;
        let mut bob = attach_peer(&listener, &worker).await;

        alice.greet("Alice").await;
        wait_for_members(&worker, 1).await;
        bob.greet("Bob").await;
        wait_for_members(&worker, 2).await;
        alice.recv().await;

        let alice_id = alice.id;
        drop(alice);

        assert_eq!(
            bob.recv().await,
            Message::Disconnect(Disconnect { origin: alice_id })
        );
        wait_for_members(&worker, 1).await;
        assert_eq!(members(&worker).await, vec![bob.id]);

        // Acknowledgment to the departed identifier fails quietly
        bob.send(Message::Acknowledgment(Acknowledgment {
            origin: bob.id,
            destination: alice_id,
            sequence: 1,
        }))
        .await;
        bob.expect_silence().await;
        assert_eq!(members(&worker).await, vec![bob.id]);
    }

    #[tokio::test]
    async fn test_close_before_greeting_is_silent() {
        let (listener, worker) = setup().await;
        let mut alice = attach_peer(&listener, &worker).await;
        let lurker = attach_peer(&listener, &worker).await;

        alice.greet("Alice").await;
        wait_for_members(&worker, 1).await;

        drop(lurker);
        alice.expect_silence().await;
        assert_eq!(members(&worker).await, vec![alice.id]);
    }

    #[tokio::test]
    async fn test_unknown_tag_keeps_connection() {
        let (listener, worker) = setup().await;
        let mut alice = attach_peer(&listener, &worker).await;
        let mut bob = attach_peer(&listener, &worker).await;

        bob.greet("Bob").await;
        wait_for_members(&worker, 1).await;

        alice.stream.write_all(&[0x5A]).await.unwrap();
        alice.greet("Alice").await;
        wait_for_members(&worker, 2).await;

        match bob.recv().await {
            Message::Greeting(greeting) => assert_eq!(greeting.name.to_string_lossy(), "Alice"),
            other => panic!("Expected Alice's greeting, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_server_only_messages_are_not_relayed() {
        let (listener, worker) = setup().await;
        let mut alice = attach_peer(&listener, &worker).await;
        let mut bob = attach_peer(&listener, &worker).await;

        bob.greet("Bob").await;
        wait_for_members(&worker, 1).await;

        alice
            .send(Message::Disconnect(Disconnect { origin: bob.id }))
            .await;
        bob.expect_silence().await;
        assert_eq!(members(&worker).await, vec![bob.id]);
    }

    #[tokio::test]
    async fn test_regreeting_does_not_duplicate_member() {
        let (listener, worker) = setup().await;
        let mut alice = attach_peer(&listener, &worker).await;

        alice.greet("Alice").await;
        wait_for_members(&worker, 1).await;
        alice.greet("Alice again").await;

        alice.expect_silence().await;
        assert_eq!(members(&worker).await, vec![alice.id]);
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let (worker, task) = GroupWorker::spawn(8, SEND_TIMEOUT);
        let mut alice = attach_peer(&listener, &worker).await;

        worker.send(WorkerCommand::Shutdown).unwrap();
        task.await.unwrap();

        let result = timeout(Duration::from_secs(2), read_message(&mut alice.stream))
            .await
            .expect("connection was not closed");
        assert!(result.unwrap_err().is_disconnect());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stalled_member_is_evicted_after_send_timeout() {
        let (listener, worker) = setup().await;
        let mut alice = attach_peer(&listener, &worker).await;
        let mut stalled = attach_peer(&listener, &worker).await;
        let mut carol = attach_peer(&listener, &worker).await;

        alice.greet("Alice").await;
        wait_for_members(&worker, 1).await;
        stalled.greet("Stalled").await;
        wait_for_members(&worker, 2).await;
        carol.greet("Carol").await;
        wait_for_members(&worker, 3).await;

        // Carol reads everything until the stalled member's departure
        let stalled_id = stalled.id;
        let watcher = tokio::spawn(async move {
            let mut positions = 0u64;
            loop {
                match carol.recv().await {
                    Message::Position(_) => positions += 1,
                    Message::Disconnect(notice) => return (carol, notice.origin, positions),
                    other => panic!("Unexpected message {:?}", other),
                }
            }
        });

        // Alice floods while the stalled member never reads
        let flood = async {
            let mut sequence = 0;
            loop {
                sequence += 1;
                let position = Message::Position(Position {
                    origin: alice.id,
                    sequence,
                    x: 1,
                    y: 2,
                    z: 3,
                });
                if write_message(&mut alice.stream, &position).await.is_err() {
                    break;
                }
                if sequence % 64 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        };

        let (mut carol, origin, positions) = tokio::select! {
            _ = flood => panic!("flooding connection was closed"),
            outcome = timeout(Duration::from_secs(30), watcher) => {
                outcome.expect("stalled member was never evicted").unwrap()
            }
        };

        assert_eq!(origin, stalled_id);
        assert!(positions > 0);

        // Exactly one notice: whatever is still in flight is positions only
        loop {
            match timeout(Duration::from_millis(300), read_message(&mut carol.stream)).await {
                Err(_) => break,
                Ok(Ok(Message::Position(_))) => continue,
                Ok(other) => panic!("Unexpected message after the notice: {:?}", other),
            }
        }

        assert_eq!(members(&worker).await, vec![alice.id, carol.id]);
        drop(stalled);
    }
}
