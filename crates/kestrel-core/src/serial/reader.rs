//! Binary reader half of the stream codec.
//!
//! Short reads surface as `Deserialization` errors through the `io::Error`
//! conversion, so a truncated cache file fails cleanly instead of yielding
//! garbage values.

use std::io::Read;

use crate::errors::{Error, RunResult};
use crate::serial::MAX_STR_LEN;

#[derive(Debug)]
pub struct DataReader<R: Read> {
    inner: R,
}

impl<R: Read> DataReader<R> {
    pub fn new(inner: R) -> Self {
        DataReader { inner }
    }

    fn fill(&mut self, buf: &mut [u8]) -> RunResult<()> {
        self.inner.read_exact(buf)?;
        Ok(())
    }

    pub fn read_u8(&mut self) -> RunResult<u8> {
        let mut b = [0u8; 1];
        self.fill(&mut b)?;
        Ok(b[0])
    }

    pub fn read_bool(&mut self) -> RunResult<bool> {
        match self.read_u8()? {
            0 => Ok(false),
            1 => Ok(true),
            n => Err(Error::deser(format!("invalid boolean byte {n}"))),
        }
    }

    pub fn read_u16(&mut self) -> RunResult<u16> {
        let mut b = [0u8; 2];
        self.fill(&mut b)?;
        Ok(u16::from_le_bytes(b))
    }

    pub fn read_u32(&mut self) -> RunResult<u32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(u32::from_le_bytes(b))
    }

    pub fn read_i32(&mut self) -> RunResult<i32> {
        let mut b = [0u8; 4];
        self.fill(&mut b)?;
        Ok(i32::from_le_bytes(b))
    }

    pub fn read_u64(&mut self) -> RunResult<u64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(u64::from_le_bytes(b))
    }

    pub fn read_i64(&mut self) -> RunResult<i64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(i64::from_le_bytes(b))
    }

    pub fn read_f64(&mut self) -> RunResult<f64> {
        let mut b = [0u8; 8];
        self.fill(&mut b)?;
        Ok(f64::from_le_bytes(b))
    }

    pub fn read_str(&mut self) -> RunResult<String> {
        let len = self.read_u32()?;
        if len > MAX_STR_LEN {
            return Err(Error::deser(format!("string length {len} exceeds cap")));
        }
        let mut buf = vec![0u8; len as usize];
        self.fill(&mut buf)?;
        String::from_utf8(buf).map_err(|_| Error::deser("string is not valid UTF-8"))
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}
