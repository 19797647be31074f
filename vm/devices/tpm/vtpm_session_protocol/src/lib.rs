// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire definitions for the secured session between a confidential guest and
//! its out-of-partition vTPM service.
//!
//! Every structure in this crate is bit-exact with the peer implementation.
//! Multi-byte fields are little endian and every header is unaligned, so the
//! structures can be read directly out of an arbitrary byte buffer with
//! [`zerocopy::FromBytes::read_from_prefix`].
//!
//! Layering, outermost first:
//!
//! ```text
//! | channel service header | envelope header | record header | ciphertext | tag |
//!                                             \_ SECURED only _____________________/
//! ```
//!
//! The plaintext inside a record is `app length (u16) || app message || padding`,
//! where the app message is an [`AppMessageHeader`] followed by the payload.

#![forbid(unsafe_code)]

use bitfield_struct::bitfield;
use zerocopy::FromBytes;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;
use zerocopy::Unaligned;
use zerocopy::little_endian::U16 as U16Le;
use zerocopy::little_endian::U32 as U32Le;

/// Defines a transparent newtype over an integer wire discriminant. Unknown
/// values stay representable so that decoding can reject them explicitly.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub struct $name:ident($ty:ty) {
            $(
                $(#[$vmeta:meta])*
                $variant:ident = $value:expr,
            )*
        }
    ) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, PartialEq, Eq, Hash, IntoBytes, FromBytes, Immutable, KnownLayout)]
        pub struct $name(pub $ty);

        impl $name {
            $(
                $(#[$vmeta])*
                pub const $variant: Self = Self($value);
            )*
        }

        impl core::fmt::Debug for $name {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match *self {
                    $(Self::$variant => f.pad(stringify!($variant)),)*
                    Self(value) => write!(f, "{}({:#x})", stringify!($name), value),
                }
            }
        }
    };
}

/// The only envelope version this implementation speaks.
pub const ENVELOPE_VERSION: u8 = 1;

wire_enum! {
    /// Discriminant of the outermost transport envelope.
    #[derive(Unaligned)]
    pub struct MessageType(u8) {
        /// Plaintext handshake message.
        HANDSHAKE = 1,
        /// AEAD-protected record belonging to an established session.
        SECURED = 2,
    }
}

/// Header of the transport envelope.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct EnvelopeHeader {
    /// Header size plus the unpadded payload size.
    pub total_length: U16Le,
    /// Must be [`ENVELOPE_VERSION`].
    pub version: u8,
    /// Kind of payload that follows.
    pub message_type: MessageType,
}

/// Size of [`EnvelopeHeader`] on the wire.
pub const ENVELOPE_HEADER_SIZE: usize = size_of::<EnvelopeHeader>();
static_assertions::const_assert_eq!(ENVELOPE_HEADER_SIZE, 4);

/// Width of the on-wire sequence number field.
pub const SEQUENCE_NUMBER_FIELD_SIZE: usize = 8;

/// Header of a secured record. The serialized header is the AEAD associated
/// data.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct RecordHeader {
    /// Session the record belongs to.
    pub session_id: U32Le,
    /// Little-endian sequence number. Bytes beyond the configured width are
    /// zero.
    pub sequence_number: [u8; SEQUENCE_NUMBER_FIELD_SIZE],
    /// Ciphertext length plus tag length.
    pub length: U16Le,
}

/// Size of [`RecordHeader`] on the wire.
pub const RECORD_HEADER_SIZE: usize = size_of::<RecordHeader>();
static_assertions::const_assert_eq!(RECORD_HEADER_SIZE, 14);

/// AES-256-GCM key size.
pub const AEAD_KEY_SIZE: usize = 32;
/// AES-256-GCM IV and nonce size.
pub const AEAD_IV_SIZE: usize = 12;
/// AES-256-GCM authentication tag size.
pub const AEAD_TAG_SIZE: usize = 16;

/// Size of the application length prefix at the start of the plaintext.
pub const APP_LENGTH_SIZE: usize = size_of::<U16Le>();

wire_enum! {
    /// Discriminant of the decrypted plaintext.
    #[derive(Unaligned)]
    pub struct AppMessageType(u8) {
        /// Session-protocol message (heartbeat, end session, ...).
        GENERIC = 1,
        /// vTPM command or response.
        APPLICATION = 3,
    }
}

/// Header that prefixes every decrypted application message.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct AppMessageHeader {
    /// Kind of message that follows.
    pub message_type: AppMessageType,
}

/// Size of [`AppMessageHeader`] on the wire.
pub const APP_MESSAGE_HEADER_SIZE: usize = size_of::<AppMessageHeader>();

wire_enum! {
    /// AEAD cipher suite negotiated by the key exchange.
    pub struct CipherSuite(u16) {
        /// AES-256-GCM with a 128-bit tag.
        AES_256_GCM = 0x0002,
    }
}

/// Session termination and renegotiation policy, sent with the key exchange.
#[bitfield(u8)]
#[derive(IntoBytes, FromBytes, Immutable, KnownLayout, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Terminate the session when the peer's runtime measurements change.
    pub terminate_on_measurement_update: bool,
    /// Allow the peer to ask for the session to be renegotiated.
    pub allow_renegotiation: bool,
    #[bits(6)]
    _reserved: u8,
}

/// Version of the channel service header.
pub const CHANNEL_SERVICE_VERSION: u8 = 1;

wire_enum! {
    /// Command carried in the channel service header.
    #[derive(Unaligned)]
    pub struct ChannelCommand(u8) {
        /// Deliver an envelope to the vTPM service and wait for its reply.
        VTPM_MESSAGE = 1,
    }
}

/// Header written by the guest in front of each envelope in the shared
/// buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct ChannelRequestHeader {
    /// Must be [`CHANNEL_SERVICE_VERSION`].
    pub version: u8,
    /// Requested service.
    pub command: ChannelCommand,
    /// Reserved, zero.
    pub reserved: [u8; 2],
    /// Length of the envelope that follows.
    pub length: U32Le,
}

/// Header written by the host in front of each reply in the shared buffer.
#[repr(C)]
#[derive(Debug, Copy, Clone, IntoBytes, FromBytes, Immutable, KnownLayout, Unaligned)]
pub struct ChannelResponseHeader {
    /// Must be [`CHANNEL_SERVICE_VERSION`].
    pub version: u8,
    /// Echo of the request command.
    pub command: ChannelCommand,
    /// Host status, zero on success.
    pub status: U16Le,
    /// Length of the envelope that follows.
    pub length: U32Le,
}

/// Size of either channel service header.
pub const CHANNEL_HEADER_SIZE: usize = size_of::<ChannelRequestHeader>();
static_assertions::const_assert_eq!(CHANNEL_HEADER_SIZE, 8);
static_assertions::const_assert_eq!(CHANNEL_HEADER_SIZE, size_of::<ChannelResponseHeader>());

/// Channel status: success.
pub const CHANNEL_STATUS_SUCCESS: u16 = 0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_header_layout() {
        let header = RecordHeader {
            session_id: 7.into(),
            sequence_number: 0x0102_u64.to_le_bytes(),
            length: 0x20.into(),
        };
        assert_eq!(
            header.as_bytes(),
            &[7, 0, 0, 0, 2, 1, 0, 0, 0, 0, 0, 0, 0x20, 0]
        );
    }

    #[test]
    fn unknown_discriminant_is_representable() {
        let (header, _) = EnvelopeHeader::read_from_prefix(&[8, 0, 1, 9]).unwrap();
        assert_eq!(header.message_type, MessageType(9));
        assert_eq!(format!("{:?}", header.message_type), "MessageType(0x9)");
        assert_eq!(format!("{:?}", MessageType::SECURED), "SECURED");
    }

    #[test]
    fn session_policy_bits() {
        let policy = SessionPolicy::new().with_terminate_on_measurement_update(true);
        assert_eq!(policy.into_bits(), 1);
        assert!(!SessionPolicy::from_bits(2).terminate_on_measurement_update());
        assert!(SessionPolicy::from_bits(2).allow_renegotiation());
    }
}
