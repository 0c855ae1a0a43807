/// Size of the read buffer kept by each banner session.
pub(super) const BANNER_BUFFER_LEN: usize = 512;

/// Read buffer owned by one execution context and reused for every target
/// it handles.
pub struct ReadBuffer {
    buf: Box<[u8; BANNER_BUFFER_LEN]>,
}

impl ReadBuffer {
    pub(super) fn new() -> Self {
        Self {
            buf: Box::new([0u8; BANNER_BUFFER_LEN]),
        }
    }

    pub(super) fn as_bytes(&self, len: usize) -> &[u8] {
        &self.buf[..len.min(BANNER_BUFFER_LEN)]
    }

    pub(super) fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_buffer_slices_are_bounded() {
        let mut buffer = ReadBuffer::new();
        buffer.as_bytes_mut()[..3].copy_from_slice(b"SSH");

        assert_eq!(buffer.as_bytes(3), b"SSH");
        assert_eq!(buffer.as_bytes(10_000).len(), BANNER_BUFFER_LEN);
    }
}
