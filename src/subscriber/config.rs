use std::time::Duration;

use crate::transport::constants::{operational_modes, OperationalEncoding, DEFAULT_KEEPALIVE_TIMEOUT, DEFAULT_MAX_PACKET_SIZE};
use crate::util::backoff::RetryBackoff;

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub encoding: OperationalEncoding,
    /// exchange payload data TSSC compressed
    pub compress_payload_data: bool,
    pub compress_metadata: bool,
    pub compress_signal_index_cache: bool,
    pub receive_internal_metadata: bool,
    pub receive_external_metadata: bool,

    /// frames beyond this size are a fatal protocol violation
    pub max_packet_size: u32,
    /// a connection that has received nothing for this long is dead
    pub keepalive_timeout: Duration,

    pub auto_reconnect: bool,
    pub reconnect_backoff: RetryBackoff,

    /// decoded measurements buffered for the reader; a full queue blocks the
    ///  socket reader, which is what backpressure means here
    pub measurement_queue_capacity: usize,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        SubscriberConfig {
            encoding: OperationalEncoding::Utf8,
            compress_payload_data: false,
            compress_metadata: true,
            compress_signal_index_cache: true,
            receive_internal_metadata: true,
            receive_external_metadata: false,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
            auto_reconnect: true,
            reconnect_backoff: RetryBackoff::default(),
            measurement_queue_capacity: 65_536,
        }
    }
}

impl SubscriberConfig {
    /// The operational modes mask this configuration negotiates, sent once
    ///  via `DefineOperationalModes` and immutable afterwards.
    pub fn operational_modes(&self) -> u32 {
        let mut modes = operational_modes::CURRENT_VERSION | operational_modes::USE_COMMON_SERIALIZATION;
        modes |= self.encoding as u32;

        if self.compress_payload_data {
            modes |= operational_modes::COMPRESS_PAYLOAD_DATA;
        }
        if self.compress_metadata {
            modes |= operational_modes::COMPRESS_METADATA;
        }
        if self.compress_signal_index_cache {
            modes |= operational_modes::COMPRESS_SIGNAL_INDEX_CACHE;
        }
        if self.receive_internal_metadata {
            modes |= operational_modes::RECEIVE_INTERNAL_METADATA;
        }
        if self.receive_external_metadata {
            modes |= operational_modes::RECEIVE_EXTERNAL_METADATA;
        }

        modes
    }
}
