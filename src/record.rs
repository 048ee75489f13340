//! Fingerprint record codec.
//!
//! Every captured mutation becomes one fixed-schema little-endian record in a
//! per-(vbucket, bin) output file. Records carry enough metadata for an
//! equality diff between two clusters but never the document body itself;
//! the body is reduced to a SHA-512 digest at capture time. The layout must
//! stay bit-identical between source and target captures of the same run.

use sha2::{Digest, Sha512};
use thiserror::Error;
use xxhash_rust::xxh3::xxh3_64;

/// Width of the body digest in bytes (SHA-512 output).
pub const BODY_DIGEST_LEN: usize = 64;

/// Fixed portion of a record: everything before the trailing key bytes.
pub const RECORD_HEADER_LEN: usize = 2 + 8 + 8 + 8 + 4 + 4 + 1 + BODY_DIGEST_LEN;

/// Digest stored for deletions and expirations, which carry no body.
pub const NO_BODY_DIGEST: [u8; BODY_DIGEST_LEN] = [0u8; BODY_DIGEST_LEN];

/// Kind of document operation a record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    Mutation = 0,
    Deletion = 1,
    Expiration = 2,
}

impl OpKind {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(OpKind::Mutation),
            1 => Some(OpKind::Deletion),
            2 => Some(OpKind::Expiration),
            _ => None,
        }
    }
}

/// Errors from encoding or decoding fingerprint records.
#[derive(Error, Debug)]
pub enum RecordError {
    #[error("key length {len} exceeds the record format maximum")]
    KeyTooLong { len: usize },

    #[error("record truncated: {size} bytes, need {need}")]
    Truncated { size: usize, need: usize },

    #[error("unknown op kind: {raw}")]
    UnknownOpKind { raw: u8 },
}

/// A decoded fingerprint record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FingerprintRecord {
    pub key: Vec<u8>,
    pub seqno: u64,
    pub rev_seqno: u64,
    pub cas: u64,
    pub flags: u32,
    pub expiry: u32,
    pub op: OpKind,
    pub body_digest: [u8; BODY_DIGEST_LEN],
}

impl FingerprintRecord {
    /// Serialize into the on-disk little-endian layout:
    /// `key_len:u16 | seqno:u64 | rev_seqno:u64 | cas:u64 | flags:u32 |
    /// expiry:u32 | op:u8 | digest:[u8;64] | key`.
    pub fn encode(&self) -> Result<Vec<u8>, RecordError> {
        let key_len = u16::try_from(self.key.len())
            .map_err(|_| RecordError::KeyTooLong { len: self.key.len() })?;

        let mut buf = Vec::with_capacity(RECORD_HEADER_LEN + self.key.len());
        buf.extend_from_slice(&key_len.to_le_bytes());
        buf.extend_from_slice(&self.seqno.to_le_bytes());
        buf.extend_from_slice(&self.rev_seqno.to_le_bytes());
        buf.extend_from_slice(&self.cas.to_le_bytes());
        buf.extend_from_slice(&self.flags.to_le_bytes());
        buf.extend_from_slice(&self.expiry.to_le_bytes());
        buf.push(self.op as u8);
        buf.extend_from_slice(&self.body_digest);
        buf.extend_from_slice(&self.key);

        Ok(buf)
    }

    /// Decode one record from the front of `data`, returning it together
    /// with the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize), RecordError> {
        if data.len() < RECORD_HEADER_LEN {
            return Err(RecordError::Truncated {
                size: data.len(),
                need: RECORD_HEADER_LEN,
            });
        }

        let key_len = usize::from(read_u16_le(data, 0));
        let total = RECORD_HEADER_LEN + key_len;
        if data.len() < total {
            return Err(RecordError::Truncated {
                size: data.len(),
                need: total,
            });
        }

        let op_raw = data[34];
        let op = OpKind::from_u8(op_raw).ok_or(RecordError::UnknownOpKind { raw: op_raw })?;

        let mut body_digest = [0u8; BODY_DIGEST_LEN];
        body_digest.copy_from_slice(&data[35..35 + BODY_DIGEST_LEN]);

        Ok((
            Self {
                key: data[RECORD_HEADER_LEN..total].to_vec(),
                seqno: read_u64_le(data, 2),
                rev_seqno: read_u64_le(data, 10),
                cas: read_u64_le(data, 18),
                flags: read_u32_le(data, 26),
                expiry: read_u32_le(data, 30),
                op,
                body_digest,
            },
            total,
        ))
    }
}

/// SHA-512 digest of a document body.
pub fn body_digest(body: &[u8]) -> [u8; BODY_DIGEST_LEN] {
    let mut digest = [0u8; BODY_DIGEST_LEN];
    digest.copy_from_slice(&Sha512::digest(body));
    digest
}

/// Bin assignment for a key within its vbucket.
pub fn bin_for_key(key: &[u8], n_bins: u32) -> u32 {
    debug_assert!(n_bins > 0);
    (xxh3_64(key) % u64::from(n_bins)) as u32
}

/// File name for one (vbucket, bin) output file under a capture directory.
pub fn bin_file_name(vbno: u16, bin: u32) -> String {
    format!("{vbno:04}_{bin:03}")
}

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(raw)
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FingerprintRecord {
        FingerprintRecord {
            key: b"airline_10".to_vec(),
            seqno: 42,
            rev_seqno: 3,
            cas: 0x1122_3344_5566_7788,
            flags: 0x0200_0000,
            expiry: 0,
            op: OpKind::Mutation,
            body_digest: body_digest(b"{\"type\":\"airline\"}"),
        }
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let record = sample();
        let encoded = record.encode().expect("encode");
        assert_eq!(encoded.len(), RECORD_HEADER_LEN + record.key.len());

        let (decoded, consumed) = FingerprintRecord::decode(&encoded).expect("decode");
        assert_eq!(consumed, encoded.len());
        assert_eq!(decoded, record);
    }

    #[test]
    fn test_decode_consumes_one_record_from_stream() {
        let a = sample();
        let mut b = sample();
        b.key = b"airline_11".to_vec();
        b.seqno = 43;

        let mut stream = a.encode().expect("encode a");
        stream.extend_from_slice(&b.encode().expect("encode b"));

        let (first, used) = FingerprintRecord::decode(&stream).expect("first");
        let (second, _) = FingerprintRecord::decode(&stream[used..]).expect("second");
        assert_eq!(first.seqno, 42);
        assert_eq!(second.seqno, 43);
        assert_eq!(second.key, b"airline_11");
    }

    #[test]
    fn test_decode_truncated() {
        let encoded = sample().encode().expect("encode");
        let err = FingerprintRecord::decode(&encoded[..RECORD_HEADER_LEN - 1]).unwrap_err();
        assert!(matches!(err, RecordError::Truncated { .. }));

        // Header complete but key cut short.
        let err = FingerprintRecord::decode(&encoded[..encoded.len() - 1]).unwrap_err();
        assert!(matches!(err, RecordError::Truncated { .. }));
    }

    #[test]
    fn test_decode_unknown_op_kind() {
        let mut encoded = sample().encode().expect("encode");
        encoded[34] = 9;
        let err = FingerprintRecord::decode(&encoded).unwrap_err();
        assert!(matches!(err, RecordError::UnknownOpKind { raw: 9 }));
    }

    #[test]
    fn test_encode_rejects_oversized_key() {
        let mut record = sample();
        record.key = vec![b'k'; usize::from(u16::MAX) + 1];
        let err = record.encode().unwrap_err();
        assert!(matches!(err, RecordError::KeyTooLong { .. }));
    }

    #[test]
    fn test_deletion_digest_is_all_zero() {
        assert_eq!(NO_BODY_DIGEST, [0u8; BODY_DIGEST_LEN]);
        assert_ne!(body_digest(b""), NO_BODY_DIGEST);
    }

    #[test]
    fn test_digest_is_deterministic_across_calls() {
        assert_eq!(body_digest(b"doc"), body_digest(b"doc"));
        assert_ne!(body_digest(b"doc"), body_digest(b"doc2"));
    }

    #[test]
    fn test_bin_for_key_stable_and_in_range() {
        for n_bins in [1u32, 2, 10, 1024] {
            for key in [&b"k0"[..], b"airline_10", b"a-much-longer-document-key"] {
                let bin = bin_for_key(key, n_bins);
                assert!(bin < n_bins);
                assert_eq!(bin, bin_for_key(key, n_bins));
            }
        }
    }

    #[test]
    fn test_bin_file_name_layout() {
        assert_eq!(bin_file_name(0, 0), "0000_000");
        assert_eq!(bin_file_name(1023, 9), "1023_009");
    }
}
