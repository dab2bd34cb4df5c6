//! Buffer of events received but not yet consumed

use crate::protocol::Event;
use std::collections::VecDeque;

/// FIFO of events in arrival order
#[derive(Debug, Default, Clone)]
pub struct EventQueue {
    events: VecDeque<Event>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, event: Event) {
        self.events.push_back(event);
    }

    pub fn pop_front(&mut self) -> Option<Event> {
        self.events.pop_front()
    }

    /// Remove the oldest event with the given name, keeping the others in order
    pub fn take_named(&mut self, name: &str) -> Option<Event> {
        let index = self.events.iter().position(|e| e.name == name)?;
        self.events.remove(index)
    }

    pub fn snapshot(&self) -> Vec<Event> {
        self.events.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}
