use std::time::Duration;

use crate::transport::constants::{
    DEFAULT_CIPHER_ACK_TIMEOUT, DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_MAX_PACKET_SIZE,
    DEFAULT_PUBLISH_INTERVAL, DEFAULT_STALL_TIMEOUT,
};

#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// frames beyond this size are a fatal protocol violation
    pub max_packet_size: u32,

    /// a connection that has received nothing for this long is dead
    pub keepalive_timeout: Duration,
    /// a connection whose outbound queue stays full for this long is closed
    ///  so that it cannot drag down the other subscribers
    pub stall_timeout: Duration,
    /// an unacknowledged cipher key rotation closes the connection after this
    pub cipher_ack_timeout: Duration,

    /// measurements are batched per connection for at most this long
    pub publish_interval: Duration,
    /// or until a pending batch reaches this encoded size
    pub max_batch_bytes: usize,
    /// measurements per data packet; larger batches are split
    pub measurements_per_packet: usize,

    /// pending measurement batches per connection before back pressure
    pub batch_queue_capacity: usize,
    /// outbound frames per connection before back pressure
    pub outbound_queue_capacity: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        PublisherConfig {
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            cipher_ack_timeout: DEFAULT_CIPHER_ACK_TIMEOUT,
            publish_interval: DEFAULT_PUBLISH_INTERVAL,
            max_batch_bytes: 32 * 1024,
            measurements_per_packet: 1_000,
            batch_queue_capacity: 256,
            outbound_queue_capacity: 64,
        }
    }
}
