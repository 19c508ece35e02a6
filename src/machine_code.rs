/// An append-only buffer of x86-64 machine code.
///
/// The buffer grows by appending opcode literals and little-endian
/// immediates; there is no relocation and no alignment handling. The bytes
/// are executed in the tracee exactly as written.
#[derive(Debug, Default)]
pub struct MachineCode {
    bytes: Vec<u8>,
}

impl MachineCode {
    /// Create an empty code buffer.
    #[must_use]
    pub const fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    /// Append a sequence of literal bytes.
    pub fn append_bytes(&mut self, bytes: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(bytes);
        self
    }

    /// Append a 32-bit immediate in little-endian byte order.
    pub fn append_immediate32(&mut self, immediate: u32) -> &mut Self {
        self.bytes.extend_from_slice(&immediate.to_le_bytes());
        self
    }

    /// Append a 64-bit immediate in little-endian byte order.
    pub fn append_immediate64(&mut self, immediate: u64) -> &mut Self {
        self.bytes.extend_from_slice(&immediate.to_le_bytes());
        self
    }

    /// The accumulated code.
    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// The length of the accumulated code in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether no code has been appended yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediates_are_little_endian() {
        let mut code = MachineCode::new();
        code.append_bytes(&[0x48, 0xbf])
            .append_immediate64(0x1122_3344_5566_7788)
            .append_bytes(&[0xbe])
            .append_immediate32(0xdead_beef)
            .append_bytes(&[0xcc]);
        assert_eq!(
            code.bytes(),
            &[
                0x48, 0xbf, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0xbe, 0xef, 0xbe,
                0xad, 0xde, 0xcc,
            ]
        );
    }

    #[test]
    fn empty_buffer() {
        let code = MachineCode::new();
        assert!(code.is_empty());
        assert_eq!(code.len(), 0);
        assert_eq!(code.bytes(), &[] as &[u8]);
    }
}
