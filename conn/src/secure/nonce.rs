use crate::Error;
use chacha20poly1305::Nonce;

/// Largest counter value (exclusive) that fits in a 96-bit nonce.
const LIMIT: u128 = 1 << 96;

/// Per-direction message counter from which nonces are derived.
///
/// Both sides advance their copy of a direction's counter once per message, so nonces never
/// need to be transmitted.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct Info {
    counter: u128,
}

impl Info {
    /// The nonce for the current message, without advancing.
    ///
    /// Fails with [Error::NonceOverflow] once all 2^96 nonces have been used.
    pub fn current(&self) -> Result<Nonce, Error> {
        if self.counter >= LIMIT {
            return Err(Error::NonceOverflow);
        }
        let bytes = self.counter.to_be_bytes();
        Ok(*Nonce::from_slice(&bytes[4..]))
    }

    /// Move on to the next message. Saturates at the limit.
    pub fn advance(&mut self) {
        if self.counter < LIMIT {
            self.counter += 1;
        }
    }

    /// The nonce for the current message, then advance.
    pub fn next(&mut self) -> Result<Nonce, Error> {
        let nonce = self.current()?;
        self.advance();
        Ok(nonce)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_big_endian_layout() {
        let mut info = Info::default();
        assert_eq!(info.next().unwrap()[..], [0u8; 12]);
        assert_eq!(info.next().unwrap()[..], [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1]);

        let info = Info {
            counter: 0x0102_0304_0506_0708_090a_0b0c,
        };
        assert_eq!(
            info.current().unwrap()[..],
            [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]
        );
    }

    #[test]
    fn test_current_does_not_advance() {
        let mut info = Info::default();
        assert_eq!(info.current().unwrap(), info.current().unwrap());
        let first = info.current().unwrap();
        info.advance();
        assert_ne!(info.current().unwrap(), first);
    }

    #[test]
    fn test_overflow() {
        let mut info = Info { counter: LIMIT - 1 };
        assert_eq!(info.next().unwrap()[..], [0xFF; 12]);
        assert!(matches!(info.next(), Err(Error::NonceOverflow)));

        // Stays overflowed
        info.advance();
        assert_eq!(info.counter, LIMIT);
        assert!(matches!(info.current(), Err(Error::NonceOverflow)));
    }
}
