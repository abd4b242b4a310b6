//! Shared encoding plumbing: the fixed-capacity instruction byte buffer
//! both architecture encoders fill.

/// Stack-allocated instruction byte buffer — no per-instruction heap
/// allocation on the encoding hot path.
///
/// x86-64 instructions are at most 15 bytes; the RISC-V `li` expansion of a
/// full 64-bit constant needs up to 32. A 32-byte inline buffer covers both.
#[derive(Clone)]
pub struct InstBytes {
    data: [u8; 32],
    len: u8,
}

impl InstBytes {
    /// Create an empty buffer.
    #[inline]
    #[must_use]
    pub const fn new() -> Self {
        Self {
            data: [0; 32],
            len: 0,
        }
    }

    /// Create a buffer pre-filled from a byte slice (max 32 bytes).
    #[inline]
    #[must_use]
    pub fn from_slice(src: &[u8]) -> Self {
        let mut buf = Self::new();
        buf.extend_from_slice(src);
        buf
    }

    /// Append a single byte.
    ///
    /// # Panics
    ///
    /// Panics if the buffer is already full.
    #[inline]
    pub fn push(&mut self, byte: u8) {
        assert!((self.len as usize) < 32, "InstBytes overflow");
        self.data[self.len as usize] = byte;
        self.len += 1;
    }

    /// Append a slice of bytes.
    ///
    /// # Panics
    ///
    /// Panics if appending would exceed the 32-byte capacity.
    #[inline]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        let start = self.len as usize;
        let end = start + bytes.len();
        assert!(end <= 32, "InstBytes overflow: {} bytes", end);
        self.data[start..end].copy_from_slice(bytes);
        self.len = end as u8;
    }

    /// Number of bytes in the buffer.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the buffer is empty.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Replace the whole contents.
    #[inline]
    pub fn set(&mut self, bytes: &[u8]) {
        self.len = 0;
        self.extend_from_slice(bytes);
    }

    /// Convert to a heap-allocated `Vec<u8>`.
    #[inline]
    #[must_use]
    pub fn to_vec(&self) -> Vec<u8> {
        self.as_ref().to_vec()
    }
}

impl Default for InstBytes {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

impl core::ops::Deref for InstBytes {
    type Target = [u8];
    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl core::ops::DerefMut for InstBytes {
    #[inline]
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len as usize]
    }
}

impl AsRef<[u8]> for InstBytes {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl core::fmt::Debug for InstBytes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter()).finish()
    }
}

impl PartialEq for InstBytes {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl Eq for InstBytes {}

impl PartialEq<[u8]> for InstBytes {
    fn eq(&self, other: &[u8]) -> bool {
        **self == *other
    }
}

impl PartialEq<Vec<u8>> for InstBytes {
    fn eq(&self, other: &Vec<u8>) -> bool {
        **self == **other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_and_extend() {
        let mut buf = InstBytes::new();
        assert!(buf.is_empty());
        buf.push(0x48);
        buf.extend_from_slice(&[0x8B, 0xC3]);
        assert_eq!(buf.len(), 3);
        assert_eq!(buf, [0x48u8, 0x8B, 0xC3][..]);
    }

    #[test]
    fn set_replaces_contents() {
        let mut buf = InstBytes::from_slice(&[0xE9, 0, 0, 0, 0]);
        buf.set(&[0xEB, 0x10]);
        assert_eq!(buf.to_vec(), vec![0xEB, 0x10]);
    }

    #[test]
    #[should_panic(expected = "InstBytes overflow")]
    fn overflow_panics() {
        let mut buf = InstBytes::new();
        buf.extend_from_slice(&[0u8; 33]);
    }
}
