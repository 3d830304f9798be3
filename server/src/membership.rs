//! Membership set of a single group
//!
//! Only the group's own worker touches this, so it is a plain owned value with
//! no locking. Members are kept in the order they greeted, which is also the
//! order broadcasts visit them.

use log::info;
use shared::ClientId;

#[derive(Debug, Default)]
pub struct Membership {
    members: Vec<ClientId>,
}

impl Membership {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a member after its greeting went out
    ///
    /// Returns false if the client was already a member; the set never holds
    /// duplicates.
    pub fn admit(&mut self, id: ClientId) -> bool {
        if self.contains(id) {
            return false;
        }

        self.members.push(id);
        info!("Client {} admitted ({} members)", id, self.members.len());
        true
    }

    /// Removes a member, returning true if it was present
    pub fn remove(&mut self, id: ClientId) -> bool {
        match self.members.iter().position(|m| *m == id) {
            Some(index) => {
                self.members.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: ClientId) -> bool {
        self.members.contains(&id)
    }

    /// Broadcast recipients: every member except `sender`
    pub fn recipients_except(&self, sender: Option<ClientId>) -> Vec<ClientId> {
        self.members
            .iter()
            .copied()
            .filter(|m| Some(*m) != sender)
            .collect()
    }

    pub fn to_vec(&self) -> Vec<ClientId> {
        self.members.clone()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}
