use std::time::Duration;

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Frames longer than this are treated as evidence of a corrupted or hostile
///  peer, and the connection is closed.
pub const DEFAULT_MAX_PACKET_SIZE: u32 = 1_572_864;

pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_CIPHER_ACK_TIMEOUT: Duration = Duration::from_secs(5);
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(33);

/// Length prefix preceding every command channel frame.
pub const PAYLOAD_HEADER_SIZE: usize = 4;
/// Receive buffer for UDP data channel datagrams.
pub const UDP_BUFFER_SIZE: usize = 65_536;
/// Response code, echoed command code and the (unused on read) embedded size.
pub const RESPONSE_HEADER_SIZE: usize = 6;

pub const EVEN_KEY: usize = 0;
pub const ODD_KEY: usize = 1;

/// Commands sent by a subscriber and processed by a publisher.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ServerCommand {
    /// only used as part of a connection refused response
    Connect = 0x00,
    MetadataRefresh = 0x01,
    Subscribe = 0x02,
    Unsubscribe = 0x03,
    RotateCipherKeys = 0x04,
    UpdateProcessingInterval = 0x05,
    DefineOperationalModes = 0x06,
    ConfirmNotification = 0x07,
    ConfirmBufferBlock = 0x08,
    ConfirmUpdateCipherKeys = 0x09,
    ConfirmSignalIndexCache = 0x0A,
    UserCommand00 = 0xD0,
    UserCommand01 = 0xD1,
    UserCommand02 = 0xD2,
    UserCommand03 = 0xD3,
    UserCommand04 = 0xD4,
    UserCommand05 = 0xD5,
    UserCommand06 = 0xD6,
    UserCommand07 = 0xD7,
    UserCommand08 = 0xD8,
    UserCommand09 = 0xD9,
    UserCommand10 = 0xDA,
    UserCommand11 = 0xDB,
    UserCommand12 = 0xDC,
    UserCommand13 = 0xDD,
    UserCommand14 = 0xDE,
    UserCommand15 = 0xDF,
    /// keepalive ping; carries no payload and solicits no response
    NoOp = 0xFF,
}

impl ServerCommand {
    pub fn is_user_command(&self) -> bool {
        let code: u8 = (*self).into();
        (0xD0..=0xDF).contains(&code)
    }
}

/// Responses and unsolicited notifications sent by a publisher.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum ServerResponse {
    Succeeded = 0x80,
    Failed = 0x81,
    DataPacket = 0x82,
    UpdateSignalIndexCache = 0x83,
    UpdateBaseTimes = 0x84,
    UpdateCipherKeys = 0x85,
    DataStartTime = 0x86,
    ProcessingComplete = 0x87,
    BufferBlock = 0x88,
    Notify = 0x89,
    ConfigurationChanged = 0x8A,
    UserResponse00 = 0xE0,
    UserResponse01 = 0xE1,
    UserResponse02 = 0xE2,
    UserResponse03 = 0xE3,
    UserResponse04 = 0xE4,
    UserResponse05 = 0xE5,
    UserResponse06 = 0xE6,
    UserResponse07 = 0xE7,
    UserResponse08 = 0xE8,
    UserResponse09 = 0xE9,
    UserResponse10 = 0xEA,
    UserResponse11 = 0xEB,
    UserResponse12 = 0xEC,
    UserResponse13 = 0xED,
    UserResponse14 = 0xEE,
    UserResponse15 = 0xEF,
    /// keepalive ping on an otherwise quiet command channel
    NoOp = 0xFF,
}

/// Per data packet header flags.
pub mod data_packet_flags {
    /// serialized measurements use the compact layout
    pub const COMPACT: u8 = 0x02;
    /// use the odd cipher key (bit clear: even key)
    pub const CIPHER_INDEX: u8 = 0x04;
    /// payload is a TSSC block
    pub const COMPRESSED: u8 = 0x08;
    /// decode against signal index cache slot 1 (bit clear: slot 0)
    pub const CACHE_INDEX: u8 = 0x10;
    pub const NO_FLAGS: u8 = 0x00;
}

/// Session parameters a subscriber requests with `DefineOperationalModes`,
///  immutable for the life of the connection.
pub mod operational_modes {
    /// protocol version, currently 1
    pub const VERSION_MASK: u32 = 0x0000_00FF;
    pub const ENCODING_MASK: u32 = 0x0000_0300;
    pub const USE_COMMON_SERIALIZATION: u32 = 0x0100_0000;
    pub const RECEIVE_EXTERNAL_METADATA: u32 = 0x0200_0000;
    pub const RECEIVE_INTERNAL_METADATA: u32 = 0x0400_0000;
    /// payload measurements travel TSSC compressed
    pub const COMPRESS_PAYLOAD_DATA: u32 = 0x2000_0000;
    pub const COMPRESS_SIGNAL_INDEX_CACHE: u32 = 0x4000_0000;
    pub const COMPRESS_METADATA: u32 = 0x8000_0000;
    pub const NO_FLAGS: u32 = 0x0000_0000;

    pub const CURRENT_VERSION: u32 = 1;
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
#[repr(u32)]
pub enum OperationalEncoding {
    Utf16Le = 0x0000_0000,
    Utf8 = 0x0000_0200,
}

/// Stable tags for the error taxonomy surfaced through error callbacks.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ErrorKind {
    /// malformed frame, unknown command, oversize packet - fatal
    Protocol,
    /// bad filter expression or mode combination - connection survives
    Subscription,
    /// TSSC desync, unknown codec version, index out of range - fatal
    Codec,
    /// socket failure or keepalive timeout - fatal, reconnect may follow
    Transport,
    /// outbound queue stalled or memory pressure - offending connection closed
    Resource,
}

#[cfg(test)]
mod test {
    use rstest::rstest;

    use super::*;

    #[rstest]
    #[case::subscribe(0x02, Some(ServerCommand::Subscribe))]
    #[case::confirm_cache(0x0A, Some(ServerCommand::ConfirmSignalIndexCache))]
    #[case::user(0xD7, Some(ServerCommand::UserCommand07))]
    #[case::noop(0xFF, Some(ServerCommand::NoOp))]
    #[case::hole(0x0B, None)]
    #[case::response_code(0x82, None)]
    fn test_server_command_from_byte(#[case] code: u8, #[case] expected: Option<ServerCommand>) {
        assert_eq!(ServerCommand::try_from(code).ok(), expected);
    }

    #[rstest]
    #[case::data_packet(0x82, Some(ServerResponse::DataPacket))]
    #[case::notify(0x89, Some(ServerResponse::Notify))]
    #[case::user(0xEF, Some(ServerResponse::UserResponse15))]
    #[case::hole(0x8B, None)]
    fn test_server_response_from_byte(#[case] code: u8, #[case] expected: Option<ServerResponse>) {
        assert_eq!(ServerResponse::try_from(code).ok(), expected);
    }

    #[test]
    fn test_user_command_range() {
        assert!(ServerCommand::UserCommand00.is_user_command());
        assert!(ServerCommand::UserCommand15.is_user_command());
        assert!(!ServerCommand::Subscribe.is_user_command());
        assert!(!ServerCommand::NoOp.is_user_command());
    }

    #[test]
    fn test_mode_masks_are_disjoint() {
        use operational_modes::*;
        let all = [VERSION_MASK, ENCODING_MASK, USE_COMMON_SERIALIZATION, RECEIVE_EXTERNAL_METADATA,
                   RECEIVE_INTERNAL_METADATA, COMPRESS_PAYLOAD_DATA, COMPRESS_SIGNAL_INDEX_CACHE, COMPRESS_METADATA];
        for (i, a) in all.iter().enumerate() {
            for b in &all[i + 1..] {
                assert_eq!(a & b, 0, "masks {:08x} and {:08x} overlap", a, b);
            }
        }
    }
}
