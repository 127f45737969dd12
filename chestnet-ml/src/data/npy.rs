//! Reader for NumPy `.npy` arrays (format versions 1.0, 2.0 and 3.0).
//!
//! Only C-ordered little-endian `u1`, `f4` and `f8` arrays are supported, which
//! covers the MedMNIST archives.

use crate::error::MlError;
use std::io::Read;

const MAGIC: &[u8; 6] = b"\x93NUMPY";
/// Headers are a short dict literal; anything longer is corrupt.
const MAX_HEADER_LEN: usize = 64 * 1024;

/// Element type stored in the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NpyDtype {
    U8,
    F32,
    F64,
}

impl NpyDtype {
    fn parse(descr: &str) -> Result<Self, MlError> {
        match descr {
            "|u1" | "<u1" | "u1" | "|b1" => Ok(Self::U8),
            "<f4" => Ok(Self::F32),
            "<f8" => Ok(Self::F64),
            other => Err(MlError::dataset(format!("unsupported npy dtype {other}"))),
        }
    }

    fn size(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::F32 => 4,
            Self::F64 => 8,
        }
    }
}

/// A decoded array, widened to `f32`.
#[derive(Debug, Clone, PartialEq)]
pub struct NpyArray {
    pub dtype: NpyDtype,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

/// Decode one `.npy` stream.
pub fn read_npy(mut reader: impl Read) -> Result<NpyArray, MlError> {
    let mut preamble = [0u8; 8];
    reader.read_exact(&mut preamble)?;
    if &preamble[..6] != MAGIC {
        return Err(MlError::dataset("not an npy file (bad magic)"));
    }
    let header_len = match preamble[6] {
        1 => {
            let mut len = [0u8; 2];
            reader.read_exact(&mut len)?;
            u16::from_le_bytes(len) as usize
        }
        2 | 3 => {
            let mut len = [0u8; 4];
            reader.read_exact(&mut len)?;
            u32::from_le_bytes(len) as usize
        }
        v => return Err(MlError::dataset(format!("unsupported npy version {v}"))),
    };
    if header_len > MAX_HEADER_LEN {
        return Err(MlError::dataset(format!(
            "npy header length {header_len} exceeds {MAX_HEADER_LEN} bytes"
        )));
    }
    let header = read_exact_len(&mut reader, header_len)?;
    let header = String::from_utf8_lossy(&header);

    let descr = header_value(&header, "descr")
        .map(|v| v.trim_matches(|c| c == '\'' || c == '"'))
        .ok_or_else(|| MlError::dataset("npy header has no descr"))?;
    let dtype = NpyDtype::parse(descr)?;
    if header_value(&header, "fortran_order") == Some("True") {
        return Err(MlError::dataset("Fortran-ordered npy arrays are not supported"));
    }
    let shape = parse_shape(
        header_value(&header, "shape").ok_or_else(|| MlError::dataset("npy header has no shape"))?,
    )?;

    let byte_len = shape
        .iter()
        .try_fold(dtype.size(), |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| MlError::dataset(format!("npy shape {shape:?} is too large")))?;
    let raw = read_exact_len(&mut reader, byte_len)?;
    let data = match dtype {
        NpyDtype::U8 => raw.iter().map(|&b| f32::from(b)).collect(),
        NpyDtype::F32 => raw
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
        NpyDtype::F64 => raw
            .chunks_exact(8)
            .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
            .collect(),
    };

    Ok(NpyArray { dtype, shape, data })
}

/// Read exactly `len` bytes, growing the buffer only as data arrives.
fn read_exact_len(reader: &mut impl Read, len: usize) -> Result<Vec<u8>, MlError> {
    let mut buf = Vec::new();
    reader.by_ref().take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("expected {len} bytes, found {}", buf.len()),
        )
        .into());
    }
    Ok(buf)
}

/// Raw text of `key`'s value in the header dict literal.
fn header_value<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let start = header
        .find(&format!("'{key}'"))
        .or_else(|| header.find(&format!("\"{key}\"")))?;
    let after_key = &header[start + key.len() + 2..];
    let value = after_key.trim_start().strip_prefix(':')?.trim_start();
    if value.starts_with('(') {
        let end = value.find(')')?;
        Some(&value[..=end])
    } else {
        let end = value.find([',', '}']).unwrap_or(value.len());
        Some(value[..end].trim())
    }
}

fn parse_shape(literal: &str) -> Result<Vec<usize>, MlError> {
    literal
        .trim_start_matches('(')
        .trim_end_matches(')')
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<usize>()
                .map_err(|_| MlError::dataset(format!("bad npy shape entry {s:?}")))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Encode a version 1.0 npy file.
    pub(crate) fn encode_npy(descr: &str, shape: &[usize], payload: &[u8]) -> Vec<u8> {
        let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
        let shape_lit = match dims.len() {
            1 => format!("({},)", dims[0]),
            _ => format!("({})", dims.join(", ")),
        };
        let mut header =
            format!("{{'descr': '{descr}', 'fortran_order': False, 'shape': {shape_lit}, }}");
        while (10 + header.len() + 1) % 64 != 0 {
            header.push(' ');
        }
        header.push('\n');

        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&[1, 0]);
        out.extend_from_slice(&(header.len() as u16).to_le_bytes());
        out.extend_from_slice(header.as_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn test_read_u8_images() {
        let bytes = encode_npy("|u1", &[2, 2, 2], &[0, 255, 10, 20, 30, 40, 50, 60]);
        let arr = read_npy(bytes.as_slice()).unwrap();
        assert_eq!(arr.dtype, NpyDtype::U8);
        assert_eq!(arr.shape, vec![2, 2, 2]);
        assert_eq!(arr.data[1], 255.0);
    }

    #[test]
    fn test_read_f4_vector() {
        let payload: Vec<u8> = [1.5_f32, -2.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let bytes = encode_npy("<f4", &[2], &payload);
        let arr = read_npy(bytes.as_slice()).unwrap();
        assert_eq!(arr.shape, vec![2]);
        assert_eq!(arr.data, vec![1.5, -2.0]);
    }

    #[test]
    fn test_rejects_bad_magic_and_dtype() {
        assert!(read_npy(&b"NOTNPY\x01\x00\x00\x00"[..]).is_err());
        let bytes = encode_npy(">i8", &[1], &[0; 8]);
        assert!(matches!(read_npy(bytes.as_slice()), Err(MlError::Dataset(_))));
    }

    #[test]
    fn test_overflowing_shape_is_dataset_error() {
        let bytes = encode_npy("<f8", &[usize::MAX / 2, 3], &[]);
        let err = read_npy(bytes.as_slice()).unwrap_err();
        assert!(matches!(err, MlError::Dataset(_)), "{err}");
    }

    #[test]
    fn test_huge_claimed_payload_without_data_is_io_error() {
        // Fits in usize but the stream is empty; must not allocate up front.
        let bytes = encode_npy("|u1", &[1 << 40], &[]);
        assert!(matches!(read_npy(bytes.as_slice()), Err(MlError::Io(_))));
    }

    #[test]
    fn test_oversized_header_length_rejected() {
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&[2, 0]);
        bytes.extend_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(read_npy(bytes.as_slice()), Err(MlError::Dataset(_))));
    }

    #[test]
    fn test_truncated_payload_is_io_error() {
        let bytes = encode_npy("|u1", &[4], &[1, 2]);
        assert!(matches!(read_npy(bytes.as_slice()), Err(MlError::Io(_))));
    }
}
