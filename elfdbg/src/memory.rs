use crate::{error::Result, tracee::Tracee};

/// Size of the unit the kernel transfers per peek/poke.
pub const WORD_SIZE: usize = 8;

/// Reads `len` bytes starting at `addr`, one word at a time.
///
/// Either every word is read or the whole call fails; a partially filled
/// buffer is never returned.
pub fn read_bytes<T: Tracee + ?Sized>(tracee: &T, addr: u64, len: usize) -> Result<Vec<u8>> {
    let mut bytes = Vec::with_capacity(len + WORD_SIZE);
    let mut word_addr = addr;
    while bytes.len() < len {
        let word = tracee.peek(word_addr)?;
        bytes.extend_from_slice(&word.to_le_bytes());
        word_addr = word_addr.wrapping_add(WORD_SIZE as u64);
    }
    bytes.truncate(len);
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{error::DebuggerError, testing::FakeTracee};

    const SAMPLE: u64 = 0xcafe_babe_cafe_babe;
    const ADDR: u64 = 0x1234;

    #[test]
    fn reads_single_word() {
        let tracee = FakeTracee::new().with_word(ADDR, SAMPLE);
        let bytes = read_bytes(&tracee, ADDR, 8).unwrap();
        assert_eq!(bytes, SAMPLE.to_le_bytes());
        assert_eq!(tracee.syscalls(), 1);
    }

    #[test]
    fn splits_into_word_reads() {
        let tracee = FakeTracee::new()
            .with_word(ADDR, SAMPLE)
            .with_word(ADDR + 8, SAMPLE)
            .with_word(ADDR + 16, SAMPLE);

        let bytes = read_bytes(&tracee, ADDR, 24).unwrap();
        assert_eq!(tracee.syscalls(), 3);
        for chunk in bytes.chunks(WORD_SIZE) {
            assert_eq!(chunk, SAMPLE.to_le_bytes());
        }
    }

    #[test]
    fn trims_partial_trailing_word() {
        let tracee = FakeTracee::new()
            .with_word(ADDR, 0x0807_0605_0403_0201)
            .with_word(ADDR + 8, 0x100f_0e0d_0c0b_0a09);

        let bytes = read_bytes(&tracee, ADDR, 10).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4, 5, 6, 7, 8, 9, 10]);
        assert_eq!(tracee.syscalls(), 2);
    }

    #[test]
    fn empty_read_does_no_syscalls() {
        let tracee = FakeTracee::new();
        assert!(read_bytes(&tracee, ADDR, 0).unwrap().is_empty());
        assert_eq!(tracee.syscalls(), 0);
    }

    #[test]
    fn any_failed_word_fails_the_read() {
        let mut tracee = FakeTracee::new().with_word(ADDR, SAMPLE);
        tracee.fail_peek_at = Some(ADDR + 8);

        let err = read_bytes(&tracee, ADDR, 16).unwrap_err();
        assert!(matches!(err, DebuggerError::Ptrace { op: "peek", .. }));
    }
}
