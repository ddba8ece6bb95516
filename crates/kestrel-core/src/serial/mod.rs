//! Little-endian binary stream primitives for the precompiled module
//! container.

mod reader;
mod writer;

pub use reader::DataReader;
pub use writer::DataWriter;

/// Strings longer than this are rejected on read; a length prefix above the
/// cap means the stream is corrupt, not that someone serialized a 4 GiB
/// identifier.
pub(crate) const MAX_STR_LEN: u32 = 16 * 1024 * 1024;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::io::Cursor;

    #[test]
    fn test_primitives_round_trip() {
        let mut buf = Vec::new();
        {
            let mut w = DataWriter::new(&mut buf);
            w.write_u8(7).unwrap();
            w.write_bool(true).unwrap();
            w.write_u32(0xDEAD_BEEF).unwrap();
            w.write_i32(-5).unwrap();
            w.write_i64(i64::MIN).unwrap();
            w.write_f64(2.5).unwrap();
            w.write_str("héllo").unwrap();
        }
        let mut r = DataReader::new(Cursor::new(buf));
        assert_eq!(r.read_u8().unwrap(), 7);
        assert!(r.read_bool().unwrap());
        assert_eq!(r.read_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(r.read_i32().unwrap(), -5);
        assert_eq!(r.read_i64().unwrap(), i64::MIN);
        assert!((r.read_f64().unwrap() - 2.5).abs() < f64::EPSILON);
        assert_eq!(r.read_str().unwrap(), "héllo");
    }

    #[test]
    fn test_truncated_stream_is_deserialization_error() {
        let mut buf = Vec::new();
        DataWriter::new(&mut buf).write_u32(42).unwrap();
        buf.truncate(2);
        let mut r = DataReader::new(Cursor::new(buf));
        let err = r.read_u32().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Deserialization(_)));
    }

    #[test]
    fn test_oversized_string_length_rejected() {
        let mut buf = Vec::new();
        DataWriter::new(&mut buf).write_u32(u32::MAX).unwrap();
        let mut r = DataReader::new(Cursor::new(buf));
        let err = r.read_str().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Deserialization(_)));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let mut buf = Vec::new();
        DataWriter::new(&mut buf).write_u32(2).unwrap();
        buf.extend_from_slice(&[0xFF, 0xFE]);
        let mut r = DataReader::new(Cursor::new(buf));
        let err = r.read_str().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Deserialization(_)));
    }
}
