use shared::{GroupId, ProtocolError, Tag};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("expected a join request, got {0:?}")]
    NotAJoin(Tag),
    #[error("join request names negative group {0}")]
    NegativeGroup(GroupId),
    #[error("no join request before the handshake deadline")]
    JoinTimeout,
    #[error("group capacity of {0} reached")]
    GroupCapacity(usize),
    #[error("worker for group {0} is gone")]
    WorkerGone(GroupId),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}
