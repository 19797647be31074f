// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! AEAD protection of one application payload per wire record.
//!
//! Record layout:
//!
//! ```text
//! | session id (4) | sequence number (8) | length (2) | ciphertext | tag (16) |
//!  \______________ associated data ______________/
//! ```
//!
//! The plaintext is `payload length (2) || payload || random padding`. The
//! nonce is the direction's IV with the little-endian sequence number XORed
//! into its low-order bytes. Decoding always derives the nonce from the
//! receiver's own counter; the sequence number on the wire is only compared.
//!
//! Both operations are all-or-nothing: the direction's counter advances only
//! when a record was fully produced or fully authenticated and parsed.

use crate::config::SessionConfig;
use crate::cursor::BufWriter;
use crate::store::Direction;
use crate::store::Session;
use openssl::symm::Cipher;
use openssl::symm::decrypt_aead;
use openssl::symm::encrypt_aead;
use thiserror::Error;
use vtpm_session_protocol::AEAD_IV_SIZE;
use vtpm_session_protocol::AEAD_TAG_SIZE;
use vtpm_session_protocol::APP_LENGTH_SIZE;
use vtpm_session_protocol::RECORD_HEADER_SIZE;
use vtpm_session_protocol::RecordHeader;
use vtpm_session_protocol::SEQUENCE_NUMBER_FIELD_SIZE;
use zerocopy::FromBytes;
use zerocopy::IntoBytes;
use zeroize::Zeroizing;

/// Errors from the record codec.
#[derive(Debug, Error)]
pub enum RecordError {
    /// The direction's counter reached its maximum. The session is unusable.
    #[error("{0:?} sequence number exhausted")]
    SequenceNumberExhausted(Direction),
    /// The output buffer cannot hold the worst-case record.
    #[error("output buffer too small, {required} bytes required")]
    BufferTooSmall {
        /// Bytes needed to encode.
        required: usize,
    },
    /// The payload cannot be described by the 16-bit length fields.
    #[error("payload of {0} bytes does not fit in a record")]
    PayloadTooLarge(usize),
    /// The record's sizes are inconsistent.
    #[error("invalid record size: declared {declared}, received {received}")]
    InvalidMessageSize {
        /// Length claimed by the record or its plaintext.
        declared: usize,
        /// Bytes actually available.
        received: usize,
    },
    /// The record belongs to a different session.
    #[error("record for session {received:#x}, expected {expected:#x}")]
    SessionIdMismatch {
        /// The live session id.
        expected: u32,
        /// The id in the record header.
        received: u32,
    },
    /// The record is replayed, reordered or dropped one.
    #[error("sequence number mismatch: expected {expected}, received {received}")]
    SequenceNumberMismatch {
        /// The receiver's counter.
        expected: u64,
        /// The wire value, as far as it is carried.
        received: u64,
    },
    /// The tag did not verify. No plaintext was released.
    #[error("record authentication failed")]
    AuthenticationFailed,
    /// The cipher failed to encrypt.
    #[error("record encryption failed")]
    Encrypt(#[source] openssl::error::ErrorStack),
    /// Random padding could not be generated.
    #[error("failed to generate random padding: {0}")]
    Random(getrandom::Error),
}

impl RecordError {
    /// Whether the error shows that the session can no longer be trusted or
    /// used, as opposed to a local resource problem.
    pub fn is_session_fatal(&self) -> bool {
        match self {
            RecordError::SequenceNumberExhausted(_)
            | RecordError::InvalidMessageSize { .. }
            | RecordError::SessionIdMismatch { .. }
            | RecordError::SequenceNumberMismatch { .. }
            | RecordError::AuthenticationFailed => true,
            RecordError::BufferTooSmall { .. }
            | RecordError::PayloadTooLarge(_)
            | RecordError::Encrypt(_)
            | RecordError::Random(_) => false,
        }
    }
}

/// Encodes and decodes records for one session configuration.
#[derive(Debug, Clone)]
pub struct RecordCodec {
    max_random_padding: u8,
    sequence_number_width: u8,
}

impl RecordCodec {
    /// Creates a codec. `sequence_number_width` must be in `1..=8`.
    pub fn new(max_random_padding: u8, sequence_number_width: u8) -> Self {
        assert!(
            (1..=SEQUENCE_NUMBER_FIELD_SIZE as u8).contains(&sequence_number_width),
            "invalid sequence number width {sequence_number_width}"
        );
        Self {
            max_random_padding,
            sequence_number_width,
        }
    }

    /// Creates a codec from a validated configuration.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.max_random_padding, config.sequence_number_width)
    }

    /// The worst-case record size for a payload of `payload_len` bytes.
    pub fn max_record_size(&self, payload_len: usize) -> usize {
        RECORD_HEADER_SIZE + self.max_ciphertext_len(payload_len)
    }

    /// The largest payload a single record can carry.
    pub fn max_payload_len(&self) -> usize {
        u16::MAX as usize - AEAD_TAG_SIZE - APP_LENGTH_SIZE - self.max_random_padding as usize
    }

    fn max_ciphertext_len(&self, payload_len: usize) -> usize {
        APP_LENGTH_SIZE + payload_len + self.max_random_padding as usize + AEAD_TAG_SIZE
    }

    /// Encrypts `payload` into a record for `direction` of `session`,
    /// returning the number of bytes written to `out`.
    pub fn encode(
        &self,
        session: &mut Session,
        direction: Direction,
        payload: &[u8],
        out: &mut [u8],
    ) -> Result<usize, RecordError> {
        let session_id = session.session_id();
        let keys = session.keys(direction);
        let sequence_number = keys.sequence_number();
        if sequence_number == u64::MAX {
            return Err(RecordError::SequenceNumberExhausted(direction));
        }

        if payload.len() > self.max_payload_len() {
            return Err(RecordError::PayloadTooLarge(payload.len()));
        }
        let required = self.max_record_size(payload.len());
        if out.len() < required {
            return Err(RecordError::BufferTooSmall { required });
        }

        let padding_len = self.random_padding_len()?;
        let mut plaintext =
            Zeroizing::new(vec![0; APP_LENGTH_SIZE + payload.len() + padding_len]);
        let (length, rest) = plaintext.split_at_mut(APP_LENGTH_SIZE);
        length.copy_from_slice(&(payload.len() as u16).to_le_bytes());
        let (body, padding) = rest.split_at_mut(payload.len());
        body.copy_from_slice(payload);
        getrandom::fill(padding).map_err(RecordError::Random)?;

        let header = RecordHeader {
            session_id: session_id.into(),
            sequence_number: self.wire_sequence_number(sequence_number),
            length: ((plaintext.len() + AEAD_TAG_SIZE) as u16).into(),
        };
        let nonce = nonce(keys.iv(), sequence_number);
        let mut tag = [0; AEAD_TAG_SIZE];
        let ciphertext = encrypt_aead(
            Cipher::aes_256_gcm(),
            keys.key(),
            Some(&nonce),
            header.as_bytes(),
            &plaintext,
            &mut tag,
        )
        .map_err(RecordError::Encrypt)?;

        session.keys_mut(direction).advance();

        let mut writer = BufWriter::new(out);
        writer.put_obj(&header);
        writer.put(&ciphertext);
        writer.put(&tag);

        tracing::trace!(
            session_id,
            ?direction,
            sequence_number,
            len = writer.written(),
            "encoded record"
        );
        Ok(writer.written())
    }

    /// Authenticates and decrypts `record` for `direction` of `session`,
    /// returning the application payload.
    pub fn decode(
        &self,
        session: &mut Session,
        direction: Direction,
        record: &[u8],
    ) -> Result<Vec<u8>, RecordError> {
        let session_id = session.session_id();
        let keys = session.keys(direction);
        let expected = keys.sequence_number();
        if expected == u64::MAX {
            return Err(RecordError::SequenceNumberExhausted(direction));
        }
        let nonce = nonce(keys.iv(), expected);

        let (header, body) =
            RecordHeader::read_from_prefix(record).map_err(|_| RecordError::InvalidMessageSize {
                declared: RECORD_HEADER_SIZE,
                received: record.len(),
            })?;
        let length = header.length.get() as usize;
        if length != body.len() || length < AEAD_TAG_SIZE + APP_LENGTH_SIZE {
            return Err(RecordError::InvalidMessageSize {
                declared: length,
                received: body.len(),
            });
        }

        if header.session_id.get() != session_id {
            return Err(RecordError::SessionIdMismatch {
                expected: session_id,
                received: header.session_id.get(),
            });
        }

        if header.sequence_number != self.wire_sequence_number(expected) {
            return Err(RecordError::SequenceNumberMismatch {
                expected,
                received: u64::from_le_bytes(header.sequence_number),
            });
        }

        let (ciphertext, tag) = body.split_at(length - AEAD_TAG_SIZE);
        let plaintext = Zeroizing::new(
            decrypt_aead(
                Cipher::aes_256_gcm(),
                keys.key(),
                Some(&nonce),
                &record[..RECORD_HEADER_SIZE],
                ciphertext,
                tag,
            )
            .map_err(|_| RecordError::AuthenticationFailed)?,
        );

        let (length, rest) = plaintext.split_at(APP_LENGTH_SIZE);
        let payload_len = u16::from_le_bytes([length[0], length[1]]) as usize;
        if payload_len > rest.len() {
            return Err(RecordError::InvalidMessageSize {
                declared: payload_len,
                received: rest.len(),
            });
        }
        let payload = rest[..payload_len].to_vec();

        session.keys_mut(direction).advance();

        tracing::trace!(
            session_id,
            ?direction,
            sequence_number = expected,
            len = payload.len(),
            "decoded record"
        );
        Ok(payload)
    }

    /// Truncates the counter to the configured number of low-order bytes.
    fn wire_sequence_number(&self, sequence_number: u64) -> [u8; SEQUENCE_NUMBER_FIELD_SIZE] {
        let width = self.sequence_number_width as usize;
        let mut field = [0; SEQUENCE_NUMBER_FIELD_SIZE];
        field[..width].copy_from_slice(&sequence_number.to_le_bytes()[..width]);
        field
    }

    fn random_padding_len(&self) -> Result<usize, RecordError> {
        if self.max_random_padding == 0 {
            return Ok(0);
        }
        let max = u16::from(self.max_random_padding);
        // Largest multiple of `max` that fits in a byte; draws above it are
        // rejected so every length is equally likely.
        let limit = 256 - 256 % max;
        loop {
            let mut byte = [0];
            getrandom::fill(&mut byte).map_err(RecordError::Random)?;
            let value = u16::from(byte[0]);
            if value < limit {
                return Ok(1 + (value % max) as usize);
            }
        }
    }
}

fn nonce(iv: &[u8; AEAD_IV_SIZE], sequence_number: u64) -> [u8; AEAD_IV_SIZE] {
    let mut nonce = *iv;
    for (n, s) in nonce.iter_mut().zip(sequence_number.to_le_bytes()) {
        *n ^= s;
    }
    nonce
}
