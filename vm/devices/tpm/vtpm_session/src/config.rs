// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Tunables for the secured vTPM session.

use std::time::Duration;
use thiserror::Error;
use vtpm_session_protocol::CHANNEL_HEADER_SIZE;
use vtpm_session_protocol::SEQUENCE_NUMBER_FIELD_SIZE;
use vtpm_session_protocol::SessionPolicy;

/// Errors returned by [`SessionConfig::validate`].
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An alignment was zero or not a power of two.
    #[error("{field} alignment {value} must be a nonzero power of two")]
    InvalidAlignment {
        /// The offending field.
        field: &'static str,
        /// The configured value.
        value: usize,
    },
    /// The sequence number width is outside `1..=8`.
    #[error("sequence number width {0} must be between 1 and 8 bytes")]
    InvalidSequenceNumberWidth(u8),
    /// The shared channel buffer cannot hold a single header.
    #[error("channel buffer size {size} is smaller than the minimum {minimum}")]
    ChannelBufferTooSmall {
        /// The configured size.
        size: usize,
        /// The smallest usable size.
        minimum: usize,
    },
    /// A zero channel timeout would fail every call.
    #[error("channel timeout must be nonzero")]
    ZeroTimeout,
}

/// Configuration of a [`SessionManager`](crate::SessionManager).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Alignment the transport envelope payload is zero-padded to.
    pub transport_alignment: usize,
    /// Alignment the application message is zero-padded to.
    pub app_alignment: usize,
    /// Upper bound of the random padding appended to each record's plaintext.
    /// Zero disables padding.
    pub max_random_padding: u8,
    /// Number of low-order sequence number bytes carried and compared on the
    /// wire. The internal counters are always 64 bits wide.
    pub sequence_number_width: u8,
    /// Bound on each blocking channel call.
    pub channel_timeout: Duration,
    /// Size of the host-visible buffer shared with the channel.
    pub channel_buffer_size: usize,
    /// Policy passed to the key exchange.
    pub session_policy: SessionPolicy,
    /// Refuse to handshake if the measurement log already evidences a
    /// session attempt.
    pub measure_once: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            transport_alignment: 4,
            app_alignment: 1,
            max_random_padding: 32,
            sequence_number_width: SEQUENCE_NUMBER_FIELD_SIZE as u8,
            channel_timeout: Duration::from_secs(5),
            channel_buffer_size: 0x2000,
            session_policy: SessionPolicy::new(),
            measure_once: false,
        }
    }
}

impl SessionConfig {
    /// Checks that the configuration is usable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("transport", self.transport_alignment),
            ("app", self.app_alignment),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::InvalidAlignment { field, value });
            }
        }

        if !(1..=SEQUENCE_NUMBER_FIELD_SIZE as u8).contains(&self.sequence_number_width) {
            return Err(ConfigError::InvalidSequenceNumberWidth(
                self.sequence_number_width,
            ));
        }

        let minimum = CHANNEL_HEADER_SIZE + self.transport_alignment;
        if self.channel_buffer_size < minimum {
            return Err(ConfigError::ChannelBufferTooSmall {
                size: self.channel_buffer_size,
                minimum,
            });
        }

        if self.channel_timeout.is_zero() {
            return Err(ConfigError::ZeroTimeout);
        }

        if (self.sequence_number_width as usize) < SEQUENCE_NUMBER_FIELD_SIZE {
            tracing::warn!(
                width = self.sequence_number_width,
                "sequence numbers are truncated on the wire; replay checks only \
                 compare the low-order bytes"
            );
        }

        Ok(())
    }
}
