//! Cryptographic collaborators the engine invokes but never implements
//! (§1 Non-goals: "no cryptographic primitive implementation beyond
//! invoking provided CRC-16, odd-parity, PRNG, Crypto-1 and 3DES
//! routines"). The engine's responsibility stops at calling these at the
//! right protocol moments with the right inputs — IV handling across the
//! UL-C AUTH_1/AUTH_2 exchange in particular must be bit-exact even though
//! the cipher itself is external.

/// A Crypto-1 cipher session, keyed and fed nonces by the caller. Mifare
/// Classic AUTH only needs a keystream word per round; the engine never
/// reconstructs key material from it (that's the key-recovery strategy
/// layer, explicitly out of scope per §1).
pub trait Crypto1Cipher {
    /// Resets the cipher and loads it with `key` and the tag's CUID,
    /// mirroring `crypto1_init`.
    fn init(&mut self, key: u64, cuid: u32);

    /// Feeds `input` through the cipher, returning one 32-bit keystream
    /// word and advancing internal state by one round.
    fn crypt_word(&mut self, input: u32) -> u32;
}

/// A 3DES (EDE) block cipher session in CBC mode, used by the Mifare
/// Ultralight-C AUTH_1/AUTH_2 handshake. The engine owns IV sequencing
/// (reset to zero at AUTH_1, chained across AUTH_1/AUTH_2); the cipher
/// just transforms one 8-byte block at a time.
pub trait TripleDes {
    /// Encrypts one 8-byte block under CBC with the given `iv`.
    fn encrypt_block(&self, block: &[u8; 8], iv: &[u8; 8]) -> [u8; 8];

    /// Decrypts one 8-byte block under CBC with the given `iv`.
    fn decrypt_block(&self, block: &[u8; 8], iv: &[u8; 8]) -> [u8; 8];
}

#[cfg(test)]
pub(crate) mod test_doubles {
    //! Deterministic stand-ins for the two traits above, used only by this
    //! crate's own tests (never by real protocol code) so the emulator's
    //! AUTH dispatch can be exercised without a real cipher.
    use super::{Crypto1Cipher, TripleDes};

    /// XOR "cipher": not remotely secure, just stable and invertible so
    /// AUTH_1/AUTH_2 round trips are checkable in tests.
    #[derive(Default)]
    pub struct XorDes {
        pub key: u8,
    }

    impl TripleDes for XorDes {
        fn encrypt_block(&self, block: &[u8; 8], iv: &[u8; 8]) -> [u8; 8] {
            let mut out = [0u8; 8];
            for i in 0..8 {
                out[i] = block[i] ^ iv[i] ^ self.key;
            }
            out
        }

        fn decrypt_block(&self, block: &[u8; 8], iv: &[u8; 8]) -> [u8; 8] {
            // XOR is self-inverse.
            self.encrypt_block(block, iv)
        }
    }

    #[derive(Default)]
    pub struct CountingCrypto1 {
        pub state: u32,
    }

    impl Crypto1Cipher for CountingCrypto1 {
        fn init(&mut self, key: u64, cuid: u32) {
            self.state = (key as u32) ^ cuid;
        }

        fn crypt_word(&mut self, input: u32) -> u32 {
            self.state = self.state.wrapping_add(1);
            input ^ self.state
        }
    }
}
