//!
//! Bounded FIFO history of sent commands, keyed by line number.
//!

use std::collections::{HashMap, VecDeque};

use super::command::Command;
use super::error::TrackerError;

/// Default history capacity, matching a typical firmware input buffer window.
pub const DEFAULT_LIMIT: usize = 127;

///
/// Bounded FIFO history of sent commands.
///
/// Maintains a fixed-size, insertion-ordered mapping of recently sent commands keyed
/// by line number. When the capacity limit is exceeded, the oldest command is evicted.
/// Replacing an existing key preserves its original insertion position rather than
/// moving it to the back.
///
/// FIFO eviction order is correctness-critical and is relied upon to support firmware
/// resend requests: callers must size `limit` to match the largest outstanding window
/// they expect the firmware to request resends within.
///
pub struct CommandTracker {
    order: VecDeque<u32>,
    entries: HashMap<u32, Command>,
    limit: usize,
}

impl CommandTracker {
    ///
    /// Creates a new, empty tracker with the default capacity (127).
    ///
    pub fn new() -> Self {
        Self::with_limit(DEFAULT_LIMIT)
    }

    ///
    /// Creates a new, empty tracker with the given capacity.
    ///
    /// # Parameters:
    /// - `limit`: Maximum number of commands to retain. When exceeded, the oldest
    ///   entries are evicted in FIFO order.
    ///
    pub fn with_limit(limit: usize) -> Self {
        CommandTracker { order: VecDeque::new(), entries: HashMap::new(), limit }
    }

    /// Number of commands currently retained.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no commands are currently retained.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    ///
    /// Records a command as sent.
    ///
    /// Replaces any existing command with the same line number in place, preserving
    /// its original insertion position. If recording exceeds the configured capacity,
    /// the oldest recorded command is evicted.
    ///
    /// # Parameters:
    /// - `command`: The command to record.
    ///
    pub fn record(&mut self, command: Command) {
        let line_number = command.line_number();

        if self.entries.insert(line_number, command).is_none() {
            self.order.push_back(line_number);
        }

        while self.entries.len() > self.limit {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            } else {
                break;
            }
        }
    }

    ///
    /// Fetches a previously sent command by its line number.
    ///
    /// # Parameters:
    /// - `line_number`: Line number of the command to retrieve.
    ///
    /// # Returns:
    /// - A reference to the stored command.
    /// - `TrackerError::NotFound` if the command was never sent, or was evicted.
    ///
    pub fn fetch(&self, line_number: u32) -> Result<&Command, TrackerError> {
        self.entries.get(&line_number).ok_or(TrackerError::NotFound(line_number))
    }
}

impl Default for CommandTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_command(line_number: u32) -> Command {
        Command::new(line_number, "G1 X0", false).unwrap()
    }

    #[test]
    fn initialization_with_default_limit() {
        let tracker = CommandTracker::new();
        assert_eq!(tracker.len(), 0);
        assert_eq!(tracker.limit, 127);
    }

    #[test]
    fn initialization_with_custom_limit() {
        let tracker = CommandTracker::with_limit(50);
        assert_eq!(tracker.len(), 0);
        assert_eq!(tracker.limit, 50);
    }

    #[test]
    fn record_and_fetch_single_command() {
        let mut tracker = CommandTracker::with_limit(3);
        let command = make_command(1);
        tracker.record(command.clone());
        assert_eq!(tracker.fetch(1).unwrap(), &command);
    }

    #[test]
    fn fifo_eviction() {
        let mut tracker = CommandTracker::with_limit(3);

        for line_number in 1..10 {
            tracker.record(make_command(line_number));
        }

        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.fetch(7).unwrap().line_number(), 7);
        assert_eq!(tracker.fetch(8).unwrap().line_number(), 8);
        assert_eq!(tracker.fetch(9).unwrap().line_number(), 9);
    }

    #[test]
    fn replace_maintains_insertion_order() {
        let mut tracker = CommandTracker::with_limit(3);

        for line_number in 1..4 {
            tracker.record(make_command(line_number));
        }

        let command1_new = Command::new(1, "G1 Y5", false).unwrap();
        tracker.record(command1_new.clone());

        assert_eq!(tracker.order, VecDeque::from(vec![1, 2, 3]));
        assert_eq!(tracker.fetch(1).unwrap(), &command1_new);
    }

    #[test]
    fn fetch_nonexistent_command() {
        let tracker = CommandTracker::with_limit(3);
        assert!(matches!(tracker.fetch(99), Err(TrackerError::NotFound(99))));
    }

    #[test]
    fn fetch_evicted_command() {
        let mut tracker = CommandTracker::with_limit(3);
        tracker.record(make_command(1));
        assert!(tracker.fetch(1).is_ok());

        tracker.record(make_command(2));
        tracker.record(make_command(3));
        tracker.record(make_command(4));

        assert!(matches!(tracker.fetch(1), Err(TrackerError::NotFound(1))));
    }
}
