//! Closeable publication channels.
//! Publishing never fails: no subscribers, or a closed channel, drop the value.

use std::sync::Mutex;

use tokio::sync::{broadcast, watch};

use crate::core::bluetooth::EVENT_CHANNEL_CAPACITY;

/// Broadcast stream of events
pub struct EventChannel<T: Clone> {
    sender: Mutex<Option<broadcast::Sender<T>>>,
}

impl<T: Clone> EventChannel<T> {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    /// Returns false once the channel is closed
    pub fn publish(&self, value: T) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => {
                let _ = sender.send(value);
                true
            }
            None => false,
        }
    }

    /// After `close` the returned receiver reports `Closed` immediately
    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }
}

impl<T: Clone> Default for EventChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Latest-value channel; new subscribers see the current state
pub struct StateChannel<T: Clone + Default> {
    sender: Mutex<Option<watch::Sender<T>>>,
}

impl<T: Clone + Default> StateChannel<T> {
    pub fn new() -> Self {
        let (sender, _) = watch::channel(T::default());
        Self {
            sender: Mutex::new(Some(sender)),
        }
    }

    pub fn publish(&self, value: T) -> bool {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => {
                sender.send_replace(value);
                true
            }
            None => false,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        match self.sender.lock().unwrap().as_ref() {
            Some(sender) => sender.subscribe(),
            None => watch::channel(T::default()).1,
        }
    }

    pub fn close(&self) {
        self.sender.lock().unwrap().take();
    }
}

impl<T: Clone + Default> Default for StateChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closed_event_channel_ends_receivers() {
        let channel = EventChannel::<i32>::new();
        let mut rx = channel.subscribe();
        assert!(channel.publish(1));
        channel.close();

        assert_eq!(rx.recv().await.unwrap(), 1);
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
        assert!(!channel.publish(2));
        assert!(matches!(channel.subscribe().recv().await, Err(broadcast::error::RecvError::Closed)));
    }

    #[test]
    fn publish_without_listeners_is_fine() {
        let channel = EventChannel::<String>::new();
        assert!(channel.publish("nobody".to_string()));
    }

    #[tokio::test]
    async fn state_channel_replays_latest_value() {
        let channel = StateChannel::<Vec<u8>>::new();
        channel.publish(vec![1, 2]);
        let rx = channel.subscribe();
        assert_eq!(*rx.borrow(), vec![1, 2]);

        channel.close();
        let mut rx = rx;
        assert!(rx.changed().await.is_err());
        assert!(!channel.publish(vec![3]));
    }
}
