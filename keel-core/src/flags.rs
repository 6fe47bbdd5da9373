//! Connection status flags.
//!
//! Bit positions are stable: applications persist and compare them, and the
//! `USER_*` range is reserved for application state that should travel with
//! the connection.

use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not};

#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct ConnFlags(u32);

impl ConnFlags {
    pub const NONE: Self = Self(0);

    /// Listening socket
    pub const LISTENING: Self = Self(1 << 0);
    /// UDP socket (connected client or listener child)
    pub const UDP: Self = Self(1 << 1);
    /// Waiting for a host name lookup
    pub const RESOLVING: Self = Self(1 << 2);
    /// Outbound connect in progress
    pub const CONNECTING: Self = Self(1 << 3);
    /// TLS session attached
    pub const SSL: Self = Self(1 << 4);
    pub const SSL_HANDSHAKE_DONE: Self = Self(1 << 5);
    /// TLS needs more ciphertext from the peer
    pub const WANT_READ: Self = Self(1 << 6);
    /// TLS has ciphertext waiting for the wire
    pub const WANT_WRITE: Self = Self(1 << 7);
    pub const IS_WEBSOCKET: Self = Self(1 << 8);

    /// Close once the send buffer drains
    pub const SEND_AND_CLOSE: Self = Self(1 << 10);
    /// Close at the next loop iteration, discarding queued output
    pub const CLOSE_IMMEDIATELY: Self = Self(1 << 11);
    /// Allow sending to broadcast addresses (UDP only)
    pub const ENABLE_BROADCAST: Self = Self(1 << 14);

    pub const USER_1: Self = Self(1 << 20);
    pub const USER_2: Self = Self(1 << 21);
    pub const USER_3: Self = Self(1 << 22);
    pub const USER_4: Self = Self(1 << 23);
    pub const USER_5: Self = Self(1 << 24);
    pub const USER_6: Self = Self(1 << 25);

    /// Every bit the application may set or clear freely.
    pub const USER_MASK: Self = Self(0x3f << 20);

    const NAMES: [(Self, &'static str); 18] = [
        (Self::LISTENING, "LISTENING"),
        (Self::UDP, "UDP"),
        (Self::RESOLVING, "RESOLVING"),
        (Self::CONNECTING, "CONNECTING"),
        (Self::SSL, "SSL"),
        (Self::SSL_HANDSHAKE_DONE, "SSL_HANDSHAKE_DONE"),
        (Self::WANT_READ, "WANT_READ"),
        (Self::WANT_WRITE, "WANT_WRITE"),
        (Self::IS_WEBSOCKET, "IS_WEBSOCKET"),
        (Self::SEND_AND_CLOSE, "SEND_AND_CLOSE"),
        (Self::CLOSE_IMMEDIATELY, "CLOSE_IMMEDIATELY"),
        (Self::ENABLE_BROADCAST, "ENABLE_BROADCAST"),
        (Self::USER_1, "USER_1"),
        (Self::USER_2, "USER_2"),
        (Self::USER_3, "USER_3"),
        (Self::USER_4, "USER_4"),
        (Self::USER_5, "USER_5"),
        (Self::USER_6, "USER_6"),
    ];

    #[inline]
    #[must_use]
    pub const fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// True if every bit of `other` is set.
    #[inline]
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// True if any bit of `other` is set.
    #[inline]
    #[must_use]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    #[inline]
    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    #[inline]
    pub fn set(&mut self, other: Self, on: bool) {
        if on {
            self.insert(other);
        } else {
            self.remove(other);
        }
    }
}

impl BitOr for ConnFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for ConnFlags {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl BitAnd for ConnFlags {
    type Output = Self;

    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl Not for ConnFlags {
    type Output = Self;

    fn not(self) -> Self {
        Self(!self.0)
    }
}

impl fmt::Debug for ConnFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        f.write_str("ConnFlags(")?;
        for (flag, name) in Self::NAMES {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        f.write_str(")")
    }
}
