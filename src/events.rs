use std::sync::mpsc;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

/// Notifications a board emits to its session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoardEvent {
    Connected,
    Disconnected,
    /// A program started running on the target
    Start,
    /// The running program ended or was stopped
    Stop,
}

/// Fan-out of [`BoardEvent`]s to any number of subscribers.
/// Cloning shares the subscriber list, so background monitors can emit too.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<BoardEvent>>>>,
}

impl EventEmitter {
    pub fn subscribe(&self) -> mpsc::Receiver<BoardEvent> {
        let (tx, rx) = mpsc::channel();
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn emit(&self, event: BoardEvent) {
        debug!("Board event {:?}", event);
        // Drop subscribers that hung up
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(event).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_subscriber_sees_events() {
        let emitter = EventEmitter::default();
        let first = emitter.subscribe();
        let second = emitter.clone().subscribe();
        emitter.emit(BoardEvent::Start);
        assert_eq!(first.try_recv().unwrap(), BoardEvent::Start);
        assert_eq!(second.try_recv().unwrap(), BoardEvent::Start);
    }

    #[test]
    fn dropped_subscribers_are_pruned() {
        let emitter = EventEmitter::default();
        drop(emitter.subscribe());
        emitter.emit(BoardEvent::Stop);
        assert!(emitter.subscribers.lock().unwrap().is_empty());
    }
}
