use crate::log::Log;
use alloy_primitives::keccak256;
use alloy_rlp::{Decodable, Encodable};

/// Size of the log bloom filter in bytes (2048 bits).
pub const BLOOM_SIZE_BYTES: usize = 256;

/// 2048-bit bloom filter over log addresses and topics.
///
/// For every input, three bits are set; each is selected by the low 11 bits
/// of a non-overlapping 2-byte window of `keccak256(input)` (byte pairs
/// (0,1), (2,3) and (4,5)). The filter may produce false positives but
/// never false negatives.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Bloom(pub [u8; BLOOM_SIZE_BYTES]);

#[cfg(feature = "serde")]
impl serde::Serialize for Bloom {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&alloy_primitives::hex::encode_prefixed(self.0))
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for Bloom {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = <&str as serde::Deserialize>::deserialize(deserializer)?;
        let bytes = alloy_primitives::hex::decode(text).map_err(serde::de::Error::custom)?;
        Ok(Self(bytes.try_into().map_err(|_| {
            serde::de::Error::custom("bloom must be exactly 256 bytes")
        })?))
    }
}

impl Default for Bloom {
    fn default() -> Self {
        Self([0; BLOOM_SIZE_BYTES])
    }
}

impl std::fmt::Debug for Bloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Bloom({})", alloy_primitives::hex::encode(self.0))
    }
}

impl Bloom {
    /// Returns `true` if no bits are set.
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|b| *b == 0)
    }

    /// Folds `input` into the filter.
    pub fn accrue(&mut self, input: &[u8]) {
        for (byte, bit) in bloom_bits(input) {
            self.0[byte] |= bit;
        }
    }

    /// Checks whether `input` may have been accrued. A `false` result is
    /// definitive.
    pub fn contains_input(&self, input: &[u8]) -> bool {
        bloom_bits(input).into_iter().all(|(byte, bit)| self.0[byte] & bit == bit)
    }

    /// Folds a log's address and every topic into the filter.
    pub fn accrue_log(&mut self, log: &Log) {
        self.accrue(log.address.as_slice());
        for topic in &log.topics {
            self.accrue(topic.as_slice());
        }
    }

    /// ORs another filter into this one.
    pub fn accrue_bloom(&mut self, other: &Self) {
        for (byte, other) in self.0.iter_mut().zip(other.0.iter()) {
            *byte |= other;
        }
    }
}

/// The three (byte index, bit mask) positions of `input` in the filter.
fn bloom_bits(input: &[u8]) -> [(usize, u8); 3] {
    let hash = keccak256(input);
    let mut out = [(0usize, 0u8); 3];
    for (i, slot) in out.iter_mut().enumerate() {
        let bit = (u16::from_be_bytes([hash[2 * i], hash[2 * i + 1]]) & 0x7ff) as usize;
        // Bit 0 is the lowest-order bit of the last byte.
        *slot = (BLOOM_SIZE_BYTES - 1 - bit / 8, 1 << (bit % 8));
    }
    out
}

/// Builds the receipt bloom for a set of logs.
pub fn logs_bloom<'a>(logs: impl IntoIterator<Item = &'a Log>) -> Bloom {
    let mut bloom = Bloom::default();
    for log in logs {
        bloom.accrue_log(log);
    }
    bloom
}

impl Encodable for Bloom {
    fn encode(&self, out: &mut dyn alloy_rlp::BufMut) {
        self.0.as_slice().encode(out)
    }

    fn length(&self) -> usize {
        // 3-byte string header + 256 payload bytes.
        3 + BLOOM_SIZE_BYTES
    }
}

impl Decodable for Bloom {
    fn decode(buf: &mut &[u8]) -> alloy_rlp::Result<Self> {
        let bytes = alloy_rlp::Header::decode_bytes(buf, false)?;
        Ok(Self(bytes.try_into().map_err(|_| alloy_rlp::Error::UnexpectedLength)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{Address, B256};

    #[test]
    fn accrued_inputs_always_test_positive() {
        let positive = ["testtest", "test", "hallo", "other"];
        let negative = ["tes", "lo"];

        let mut bloom = Bloom::default();
        for data in positive {
            bloom.accrue(data.as_bytes());
        }
        for data in positive {
            assert!(bloom.contains_input(data.as_bytes()), "expected {data} to test true");
        }
        for data in negative {
            assert!(!bloom.contains_input(data.as_bytes()), "did not expect {data} to test true");
        }
    }

    #[test]
    fn log_bloom_covers_address_and_topics() {
        let log = Log {
            address: Address::repeat_byte(0x11),
            topics: vec![B256::repeat_byte(0x22), B256::repeat_byte(0x33)],
            data: Default::default(),
        };
        let bloom = logs_bloom([&log]);
        assert!(bloom.contains_input(log.address.as_slice()));
        for topic in &log.topics {
            assert!(bloom.contains_input(topic.as_slice()));
        }
        assert!(!bloom.contains_input(Address::repeat_byte(0x44).as_slice()));
    }

    #[test]
    fn empty_bloom_is_zero() {
        assert!(Bloom::default().is_zero());
        assert!(!logs_bloom([&Log {
            address: Address::ZERO,
            topics: vec![],
            data: Default::default()
        }])
        .is_zero());
    }
}
