use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Send,
    Receive,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Receive => f.write_str("receive"),
        }
    }
}

/// One directional request to move a fixed number of bytes through the
/// UART. The buffer is owned by whoever holds the transfer: the caller
/// before submission and after reclaiming it, the driver in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    direction: Direction,
    buffer: Vec<u8>,
}

impl Transfer {
    pub fn send(bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            direction: Direction::Send,
            buffer: bytes.into(),
        }
    }

    /// A zero-filled receive buffer of `len` bytes.
    pub fn receive(len: usize) -> Self {
        Self {
            direction: Direction::Receive,
            buffer: vec![0; len],
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn requested_length(&self) -> usize {
        self.buffer.len()
    }

    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn into_buffer(self) -> Vec<u8> {
        self.buffer
    }
}
