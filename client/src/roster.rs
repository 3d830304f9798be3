use log::debug;
use shared::ClientId;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Neighbour {
    pub name: Option<String>,
    pub last_sequence: u32,
}

/// What the reference peer knows about its groupmates
#[derive(Debug, Default)]
pub struct Roster {
    neighbours: HashMap<ClientId, Neighbour>,
    last_acknowledged: Option<u32>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a position update. Returns true when the sender's name is
    /// still unknown and should be asked for.
    pub fn record_position(&mut self, origin: ClientId, sequence: u32) -> bool {
        let neighbour = self.neighbours.entry(origin).or_default();
        neighbour.last_sequence = neighbour.last_sequence.max(sequence);
        neighbour.name.is_none()
    }

    pub fn record_name(&mut self, id: ClientId, name: String) {
        debug!("Client {} is {}", id, name);
        self.neighbours.entry(id).or_default().name = Some(name);
    }

    pub fn record_acknowledgment(&mut self, sequence: u32) {
        self.last_acknowledged = Some(self.last_acknowledged.unwrap_or(0).max(sequence));
    }

    /// Drops a departed neighbour. Its identifier may be reused afterwards.
    pub fn forget(&mut self, id: ClientId) -> Option<Neighbour> {
        self.neighbours.remove(&id)
    }

    pub fn get(&self, id: ClientId) -> Option<&Neighbour> {
        self.neighbours.get(&id)
    }

    pub fn last_acknowledged(&self) -> Option<u32> {
        self.last_acknowledged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_sender_needs_name() {
        let mut roster = Roster::new();
        assert!(roster.record_position(7, 1));
        assert!(roster.record_position(7, 2));

        roster.record_name(7, "Alice".to_string());
        assert!(!roster.record_position(7, 3));

        let alice = roster.get(7).unwrap();
        assert_eq!(alice.name.as_deref(), Some("Alice"));
        assert_eq!(alice.last_sequence, 3);
    }

    #[test]
    fn test_sequence_never_goes_backwards() {
        let mut roster = Roster::new();
        roster.record_position(9, 10);
        roster.record_position(9, 4);
        assert_eq!(roster.get(9).unwrap().last_sequence, 10);
    }

    #[test]
    fn test_forget_neighbour() {
        let mut roster = Roster::new();
        roster.record_name(7, "Alice".to_string());
        assert!(roster.get(7).is_some());

        let gone = roster.forget(7).unwrap();
        assert_eq!(gone.name.as_deref(), Some("Alice"));
        assert!(roster.get(7).is_none());
        assert!(roster.forget(7).is_none());

        // A recycled identifier starts out unknown again
        assert!(roster.record_position(7, 1));
    }

    #[test]
    fn test_acknowledgments() {
        let mut roster = Roster::new();
        assert_eq!(roster.last_acknowledged(), None);

        roster.record_acknowledgment(3);
        roster.record_acknowledgment(2);
        assert_eq!(roster.last_acknowledged(), Some(3));
    }
}
