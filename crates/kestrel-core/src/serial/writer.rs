//! Binary writer half of the stream codec.

use std::io::Write;

use crate::errors::RunResult;

/// Writes little-endian primitives and length-prefixed UTF-8 strings.
#[derive(Debug)]
pub struct DataWriter<W: Write> {
    inner: W,
}

impl<W: Write> DataWriter<W> {
    pub fn new(inner: W) -> Self {
        DataWriter { inner }
    }

    pub fn write_u8(&mut self, v: u8) -> RunResult<()> {
        self.inner.write_all(&[v])?;
        Ok(())
    }

    pub fn write_bool(&mut self, v: bool) -> RunResult<()> {
        self.write_u8(u8::from(v))
    }

    pub fn write_u16(&mut self, v: u16) -> RunResult<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_u32(&mut self, v: u32) -> RunResult<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i32(&mut self, v: i32) -> RunResult<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_u64(&mut self, v: u64) -> RunResult<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_i64(&mut self, v: i64) -> RunResult<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_f64(&mut self, v: f64) -> RunResult<()> {
        self.inner.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    pub fn write_str(&mut self, s: &str) -> RunResult<()> {
        let len = u32::try_from(s.len())
            .map_err(|_| crate::errors::Error::io("string too long to serialize"))?;
        self.write_u32(len)?;
        self.inner.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn write_bytes(&mut self, b: &[u8]) -> RunResult<()> {
        self.inner.write_all(b)?;
        Ok(())
    }

    pub fn flush(&mut self) -> RunResult<()> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
