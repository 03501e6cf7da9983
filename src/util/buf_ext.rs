use anyhow::anyhow;


/// Fallible reads for the fixed-width fields of the wire formats. Plain integers use `Buf`'s own
///  `try_get_*` methods.
pub trait BufExt: bytes::Buf {
    fn try_get_array<const N: usize>(&mut self) -> anyhow::Result<[u8; N]> {
        if self.remaining() < N {
            return Err(anyhow!("buffer underflow"));
        }
        let mut result = [0u8; N];
        self.copy_to_slice(&mut result);
        Ok(result)
    }

    /// Reads a zero-padded string field of fixed width. The field's content ends at the first
    ///  zero byte; bytes that are not valid UTF-8 are replaced rather than rejected.
    fn try_get_fixed_str(&mut self, width: usize) -> anyhow::Result<String> {
        if self.remaining() < width {
            return Err(anyhow!("buffer underflow"));
        }
        let mut raw = vec![0u8; width];
        self.copy_to_slice(&mut raw);
        let len = raw.iter().position(|&b| b == 0).unwrap_or(width);
        Ok(String::from_utf8_lossy(&raw[..len]).into_owned())
    }
}

pub trait BufMutExt: bytes::BufMut {
    /// Writes `s` into a zero-padded field of fixed width. The string is truncated on a
    ///  character boundary so that at least the field's last byte is always zero.
    fn put_fixed_str(&mut self, s: &str, width: usize) {
        let len = truncated_len(s, width.saturating_sub(1));
        self.put_slice(&s.as_bytes()[..len]);
        self.put_bytes(0, width - len);
    }
}

/// the longest prefix of `s` that fits into `max_len` bytes without splitting a character
pub fn truncated_len(s: &str, max_len: usize) -> usize {
    if s.len() <= max_len {
        return s.len();
    }
    let mut len = max_len;
    while !s.is_char_boundary(len) {
        len -= 1;
    }
    len
}


impl <T: bytes::Buf> BufExt for T {
}

impl <T: bytes::BufMut> BufMutExt for T {
}
