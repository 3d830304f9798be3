//! Connection router: accepts peers and hands them to their group worker
//!
//! The router task owns the listening socket, the group registry and the set
//! of connections that have not joined a group yet. Each new connection gets a
//! short handshake task that reads its join request; the outcome comes back to
//! the router, which resolves or creates the group's worker and transfers the
//! socket to it. After that handoff the router has no further interest in the
//! connection, and it never touches a worker's membership set.

use crate::config::RelayConfig;
use crate::connection::client_id_of;
use crate::error::RelayError;
use crate::registry::{GroupHandle, GroupRegistry};
use log::{debug, error, info, warn};
use shared::{read_message, ClientId, GroupId, Message};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{sleep, timeout};

/// Requests sent from a `RelayHandle` to the router task
#[derive(Debug)]
pub enum RouterCommand {
    GroupMembers {
        group: GroupId,
        reply: oneshot::Sender<Option<Vec<ClientId>>>,
    },
    GroupCount {
        reply: oneshot::Sender<usize>,
    },
    Shutdown,
}

/// A connection whose join request has been read
#[derive(Debug)]
pub struct PendingJoin {
    pub stream: TcpStream,
    pub group: GroupId,
}

type HandshakeOutcome = (ClientId, Result<PendingJoin, RelayError>);

/// Handle to a running relay, returned by `start_relay`
#[derive(Debug)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<RouterCommand>,
    task: JoinHandle<()>,
}

impl RelayHandle {
    /// Membership of `group` in greeting order, `None` if no worker exists.
    pub async fn group_members(&self, group: GroupId) -> Option<Vec<ClientId>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(RouterCommand::GroupMembers { group, reply })
            .ok()?;
        rx.await.ok().flatten()
    }

    /// Number of group workers currently registered
    pub async fn group_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(RouterCommand::GroupCount { reply }).is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }

    /// Stops the router and every group worker, closing all connections.
    pub async fn stop(self) {
        let _ = self.commands.send(RouterCommand::Shutdown);
        if let Err(e) = self.task.await {
            error!("Router task ended abnormally: {}", e);
        }
    }
}

/// Binds the listening socket and starts the router task. Returns the
/// control handle and the bound address, useful when port 0 was requested.
pub async fn start_relay(config: RelayConfig) -> io::Result<(RelayHandle, SocketAddr)> {
    let listener = TcpListener::bind(config.bind_addr()).await?;
    let addr = listener.local_addr()?;
    info!("Relay listening on {}", addr);

    let (commands, commands_rx) = mpsc::unbounded_channel();
    let router = Router::new(listener, config, commands_rx);
    let task = tokio::spawn(router.run());

    Ok((RelayHandle { commands, task }, addr))
}

pub struct Router {
    listener: TcpListener,
    config: RelayConfig,
    registry: GroupRegistry,
    /// Connections still in the join handshake
    ungrouped: JoinSet<HandshakeOutcome>,
    commands: mpsc::UnboundedReceiver<RouterCommand>,
}

impl Router {
    pub fn new(
        listener: TcpListener,
        config: RelayConfig,
        commands: mpsc::UnboundedReceiver<RouterCommand>,
    ) -> Self {
        Self {
            listener,
            config,
            registry: GroupRegistry::new(),
            ungrouped: JoinSet::new(),
            commands,
        }
    }

    /// Main router loop coordinating accepts, handshakes and control requests
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                accepted = self.listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => self.accept_ready(stream, addr),
                        Err(e) => {
                            error!("Accept failed: {}", e);
                            sleep(Duration::from_millis(10)).await;
                        }
                    }
                },

                Some(outcome) = self.ungrouped.join_next(), if !self.ungrouped.is_empty() => {
                    self.on_handshake(outcome);
                },

                command = self.commands.recv() => {
                    match command {
                        Some(RouterCommand::GroupMembers { group, reply }) => {
                            self.reply_members(group, reply);
                        }
                        Some(RouterCommand::GroupCount { reply }) => {
                            let _ = reply.send(self.registry.len());
                        }
                        Some(RouterCommand::Shutdown) | None => {
                            info!("Router shutting down");
                            break;
                        }
                    }
                },
            }
        }

        self.ungrouped.shutdown().await;
        self.registry.shutdown().await;
    }

    /// Answers from a separate task so a worker stuck in a slow send never
    /// holds up accepts and handshakes.
    fn reply_members(&self, group: GroupId, reply: oneshot::Sender<Option<Vec<ClientId>>>) {
        match self.registry.get(group) {
            Some(handle) => {
                let members = handle.members();
                tokio::spawn(async move {
                    let _ = reply.send(members.await);
                });
            }
            None => {
                let _ = reply.send(None);
            }
        }
    }

    /// Puts a freshly accepted connection into the ungrouped set.
    fn accept_ready(&mut self, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not disable Nagle for {}: {}", addr, e);
        }

        let id = client_id_of(&stream);
        info!("New connection from {} as client {}", addr, id);

        let limit = self.config.join_timeout;
        self.ungrouped
            .spawn(async move { (id, read_join(stream, limit).await) });
    }

    fn on_handshake(&mut self, outcome: Result<HandshakeOutcome, JoinError>) {
        let (id, result) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                error!("Join handshake task failed: {}", e);
                return;
            }
        };

        let pending = match result {
            Ok(pending) => pending,
            Err(e) => {
                warn!("Client {} failed to join: {}", id, e);
                return;
            }
        };

        let group = pending.group;
        match self.route(id, pending) {
            Ok(()) => debug!("Client {} handed off to group {}", id, group),
            Err(e) => warn!("Client {} refused: {}", id, e),
        }
    }

    /// Resolves or creates the group's worker and transfers the connection.
    /// A refused connection is dropped here, which closes it.
    fn route(&mut self, id: ClientId, pending: PendingJoin) -> Result<(), RelayError> {
        let PendingJoin { stream, group } = pending;

        match self.registry.get(group).map(GroupHandle::is_alive) {
            Some(true) => {}
            Some(false) => {
                error!("Worker for group {} has stopped, restarting it", group);
                self.spawn_worker(group);
            }
            None => {
                if self.config.at_group_capacity(self.registry.len()) {
                    return Err(RelayError::GroupCapacity(self.registry.len()));
                }
                self.spawn_worker(group);
            }
        }

        let stream = match self.registry.get(group).map(|handle| handle.attach(id, stream)) {
            Some(Ok(())) => return Ok(()),
            Some(Err(stream)) => stream,
            None => return Err(RelayError::WorkerGone(group)),
        };

        error!("Worker for group {} is gone, restarting it", group);
        self.spawn_worker(group);
        match self.registry.get(group).map(|handle| handle.attach(id, stream)) {
            Some(Ok(())) => Ok(()),
            _ => Err(RelayError::WorkerGone(group)),
        }
    }

    fn spawn_worker(&mut self, group: GroupId) {
        let handle = GroupHandle::spawn(group, self.config.send_timeout);
        self.registry.insert(group, handle);
        info!(
            "Created worker for group {} ({} groups)",
            group,
            self.registry.len()
        );
    }
}

/// Reads the single join request a new connection must open with.
async fn read_join(mut stream: TcpStream, limit: Duration) -> Result<PendingJoin, RelayError> {
    let message = timeout(limit, read_message(&mut stream))
        .await
        .map_err(|_| RelayError::JoinTimeout)??;

    match message {
        Message::Join(join) if join.group >= 0 => Ok(PendingJoin {
            stream,
            group: join.group,
        }),
        Message::Join(join) => Err(RelayError::NegativeGroup(join.group)),
        other => Err(RelayError::NotAJoin(other.tag())),
    }
}
