//! Mock construction helpers

use edge_arbiter::error::Result;
use edge_arbiter::publisher::{OutboundMessage, Transport};
use crossbeam_channel::Receiver;
use mockall::mock;
use std::time::Duration;

mock! {
    pub Link {}

    impl Transport for Link {
        fn send(&self, message: &OutboundMessage, timeout: Duration) -> Result<()>;
        fn is_connected(&self) -> bool;
    }
}

/// Decode everything currently waiting on a link
pub fn drain_link(rx: &Receiver<Vec<u8>>) -> Vec<OutboundMessage> {
    rx.try_iter()
        .map(|bytes| OutboundMessage::decode(&bytes).expect("link carries valid messages"))
        .collect()
}

/// Sequences of the data messages in `messages`
pub fn data_sequences(messages: &[OutboundMessage]) -> Vec<u32> {
    messages
        .iter()
        .filter(|m| m.is_data())
        .map(|m| m.sequence())
        .collect()
}
