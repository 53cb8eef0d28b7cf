//! In-memory raw channels.

use tokio::sync::mpsc;

use super::{RawChannel, CHANNEL_CAPACITY};

/// Create two connected raw channels: frames sent on one arrive on the other.
pub fn memory_pair() -> (RawChannel, RawChannel) {
    let (a_to_b_tx, a_to_b_rx) = mpsc::channel(CHANNEL_CAPACITY);
    let (b_to_a_tx, b_to_a_rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        RawChannel::new(a_to_b_tx, b_to_a_rx),
        RawChannel::new(b_to_a_tx, a_to_b_rx),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frames_cross_over_in_order() {
        let (left, right) = memory_pair();
        let (left_tx, mut left_rx) = left.split();
        let (right_tx, mut right_rx) = right.split();

        left_tx.send("one".to_string()).await.unwrap();
        left_tx.send("two".to_string()).await.unwrap();
        right_tx.send("back".to_string()).await.unwrap();

        assert_eq!(right_rx.recv().await.as_deref(), Some("one"));
        assert_eq!(right_rx.recv().await.as_deref(), Some("two"));
        assert_eq!(left_rx.recv().await.as_deref(), Some("back"));
    }

    #[tokio::test]
    async fn test_dropping_sender_closes_peer_receiver() {
        let (left, right) = memory_pair();
        let (left_tx, _left_rx) = left.split();
        let (_right_tx, mut right_rx) = right.split();

        drop(left_tx);
        assert_eq!(right_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_send_after_peer_dropped_fails() {
        let (left, right) = memory_pair();
        let (left_tx, _left_rx) = left.split();
        drop(right);

        assert!(left_tx.is_closed());
        let err = left_tx.send("late".to_string()).await.unwrap_err();
        assert!(matches!(err, protocol::ProtocolError::ConnectionClosed(_)));
    }
}
