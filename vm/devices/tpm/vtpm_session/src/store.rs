// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Storage for the one live session and its key material.

use thiserror::Error;
use vtpm_session_protocol::AEAD_IV_SIZE;
use vtpm_session_protocol::AEAD_KEY_SIZE;
use vtpm_session_protocol::CipherSuite;
use vtpm_session_protocol::SessionPolicy;
use zeroize::Zeroize;
use zeroize::ZeroizeOnDrop;

/// Errors from building or storing a session.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store already holds a session and must be cleared first.
    #[error("a session is already stored")]
    SessionAlreadyExists,
    /// Session id zero is reserved for "no session".
    #[error("session id zero is not a valid session")]
    InvalidSessionId,
    /// A key of the wrong length was supplied.
    #[error("key length {0} is invalid, expected {AEAD_KEY_SIZE}")]
    InvalidKeyLength(usize),
    /// An IV of the wrong length was supplied.
    #[error("iv length {0} is invalid, expected {AEAD_IV_SIZE}")]
    InvalidIvLength(usize),
}

/// The two independently keyed directions of a session.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    /// Guest to vTPM service.
    Request,
    /// vTPM service to guest.
    Response,
}

/// Key, IV and sequence counter for one direction. Scrubbed on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
#[cfg_attr(test, derive(Clone))]
pub struct DirectionKeys {
    key: [u8; AEAD_KEY_SIZE],
    iv: [u8; AEAD_IV_SIZE],
    sequence_number: u64,
}

impl std::fmt::Debug for DirectionKeys {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectionKeys")
            .field("sequence_number", &self.sequence_number)
            .finish_non_exhaustive()
    }
}

impl DirectionKeys {
    /// Builds fresh key material with the sequence counter at zero.
    pub fn new(key: &[u8], iv: &[u8]) -> Result<Self, StoreError> {
        let key = key
            .try_into()
            .map_err(|_| StoreError::InvalidKeyLength(key.len()))?;
        let iv = iv
            .try_into()
            .map_err(|_| StoreError::InvalidIvLength(iv.len()))?;
        Ok(Self {
            key,
            iv,
            sequence_number: 0,
        })
    }

    /// The sequence number the next record in this direction will use.
    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }

    pub(crate) fn key(&self) -> &[u8; AEAD_KEY_SIZE] {
        &self.key
    }

    pub(crate) fn iv(&self) -> &[u8; AEAD_IV_SIZE] {
        &self.iv
    }

    /// Moves the counter past a record that was fully processed. Only the
    /// record codec calls this.
    pub(crate) fn advance(&mut self) {
        // The codec refuses to process a record at u64::MAX.
        self.sequence_number += 1;
    }

    #[cfg(test)]
    pub(crate) fn set_sequence_number(&mut self, sequence_number: u64) {
        self.sequence_number = sequence_number;
    }
}

/// A fully established session.
#[derive(Debug)]
#[cfg_attr(test, derive(Clone))]
pub struct Session {
    session_id: u32,
    protocol_version: u8,
    secured_protocol_version: u8,
    cipher_suite: CipherSuite,
    policy: SessionPolicy,
    request: DirectionKeys,
    response: DirectionKeys,
}

impl Session {
    /// Assembles a session from negotiated parameters.
    pub fn new(
        session_id: u32,
        protocol_version: u8,
        secured_protocol_version: u8,
        cipher_suite: CipherSuite,
        policy: SessionPolicy,
        request: DirectionKeys,
        response: DirectionKeys,
    ) -> Result<Self, StoreError> {
        if session_id == 0 {
            return Err(StoreError::InvalidSessionId);
        }
        Ok(Self {
            session_id,
            protocol_version,
            secured_protocol_version,
            cipher_suite,
            policy,
            request,
            response,
        })
    }

    /// The negotiated session id, never zero.
    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// The negotiated protocol version.
    pub fn protocol_version(&self) -> u8 {
        self.protocol_version
    }

    /// The negotiated secured-message version.
    pub fn secured_protocol_version(&self) -> u8 {
        self.secured_protocol_version
    }

    /// The negotiated AEAD suite.
    pub fn cipher_suite(&self) -> CipherSuite {
        self.cipher_suite
    }

    /// The policy the session was established with.
    pub fn policy(&self) -> SessionPolicy {
        self.policy
    }

    /// Key material for `direction`.
    pub fn keys(&self, direction: Direction) -> &DirectionKeys {
        match direction {
            Direction::Request => &self.request,
            Direction::Response => &self.response,
        }
    }

    pub(crate) fn keys_mut(&mut self, direction: Direction) -> &mut DirectionKeys {
        match direction {
            Direction::Request => &mut self.request,
            Direction::Response => &mut self.response,
        }
    }
}

/// Holds at most one session. Empty is the "no session" state.
#[derive(Debug, Default)]
pub struct SessionStore {
    session: Option<Session>,
}

impl SessionStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self { session: None }
    }

    /// Stores a complete session. An existing session is never overwritten.
    pub fn put(&mut self, session: Session) -> Result<(), StoreError> {
        if self.session.is_some() {
            return Err(StoreError::SessionAlreadyExists);
        }
        self.session = Some(session);
        Ok(())
    }

    /// The stored session, if it is valid.
    pub fn get(&self) -> Option<&Session> {
        self.session.as_ref().filter(|s| s.session_id != 0)
    }

    pub(crate) fn get_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut().filter(|s| s.session_id != 0)
    }

    /// Whether a usable session is stored.
    pub fn is_valid(&self) -> bool {
        self.get().is_some()
    }

    /// Drops the stored session, scrubbing its key material. Idempotent.
    pub fn clear(&mut self) {
        if let Some(mut session) = self.session.take() {
            tracing::debug!(session_id = session.session_id, "clearing session");
            session.session_id = 0;
            session.request.zeroize();
            session.response.zeroize();
        }
    }
}
