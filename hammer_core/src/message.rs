use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Bincode configuration shared by binary seed logs and the `bincode` payload format.
pub fn bincode_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error("JSON payload encoding failed: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Bincode payload encoding failed: {0}")]
    BincodeEncode(#[from] EncodeError),
    #[error("Bincode payload decoding failed: {0}")]
    BincodeDecode(#[from] DecodeError),
}

/// One recorded message: the channel it was published on, when, and its serialized body.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub struct LogRecord {
    pub channel: String,
    /// Nanoseconds since the start of the recording.
    pub timestamp_ns: u64,
    pub payload: Vec<u8>,
}

impl LogRecord {
    pub fn new(channel: impl Into<String>, timestamp_ns: u64, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            timestamp_ns,
            payload: payload.into(),
        }
    }
}

/// An ordered, timestamped sequence of channel-tagged messages.
///
/// This is the seed type the fuzzer mutates. Every transforming method below
/// returns a new log and leaves `self` untouched, which is what the log
/// mutations rely on to stay pure.
#[derive(Serialize, Deserialize, Encode, Decode, Debug, Clone, PartialEq, Eq, Default, Hash)]
#[serde(transparent)]
pub struct MessageLog {
    records: Vec<LogRecord>,
}

impl MessageLog {
    pub fn new(records: Vec<LogRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[LogRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&LogRecord> {
        self.records.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &LogRecord> {
        self.records.iter()
    }

    /// Indices of records that carry at least one payload byte.
    pub fn non_empty_payload_indices(&self) -> Vec<usize> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, record)| !record.payload.is_empty())
            .map(|(index, _)| index)
            .collect()
    }

    /// Returns a copy of the log with the record at `index` removed.
    /// Out-of-range indices yield an unchanged copy.
    pub fn without(&self, index: usize) -> Self {
        let mut records = self.records.clone();
        if index < records.len() {
            records.remove(index);
        }
        Self { records }
    }

    /// Returns a copy with the contents of two records exchanged.
    ///
    /// Timestamps stay in their slots so the log remains time-ordered; only
    /// the channel and payload move.
    pub fn with_swapped(&self, first: usize, second: usize) -> Self {
        let mut records = self.records.clone();
        if first < records.len() && second < records.len() && first != second {
            let first_ts = records[first].timestamp_ns;
            let second_ts = records[second].timestamp_ns;
            records.swap(first, second);
            records[first].timestamp_ns = first_ts;
            records[second].timestamp_ns = second_ts;
        }
        Self { records }
    }

    /// Returns a copy where the record at `index` appears twice in a row.
    pub fn with_duplicate(&self, index: usize) -> Self {
        let mut records = self.records.clone();
        if let Some(record) = records.get(index).cloned() {
            records.insert(index + 1, record);
        }
        Self { records }
    }

    /// Returns a copy where one payload byte of record `index` is XORed with `mask`.
    pub fn with_corrupted_payload(&self, index: usize, offset: usize, mask: u8) -> Self {
        let mut records = self.records.clone();
        if let Some(byte) = records
            .get_mut(index)
            .and_then(|record| record.payload.get_mut(offset))
        {
            *byte ^= mask;
        }
        Self { records }
    }
}

impl From<Vec<LogRecord>> for MessageLog {
    fn from(records: Vec<LogRecord>) -> Self {
        Self::new(records)
    }
}

/// Wire encoding used when a materialized value is written to a target.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PayloadFormat {
    #[default]
    Json,
    Bincode,
}

/// A value that can be serialized onto a target's input channel.
pub trait Injectable {
    fn to_payload(&self, format: PayloadFormat) -> Result<Vec<u8>, PayloadError>;
}

impl Injectable for MessageLog {
    fn to_payload(&self, format: PayloadFormat) -> Result<Vec<u8>, PayloadError> {
        match format {
            PayloadFormat::Json => Ok(serde_json::to_vec(self)?),
            PayloadFormat::Bincode => Ok(bincode::encode_to_vec(self, bincode_config())?),
        }
    }
}

impl MessageLog {
    /// Inverse of [`Injectable::to_payload`], used by stub targets and tests.
    pub fn from_payload(bytes: &[u8], format: PayloadFormat) -> Result<Self, PayloadError> {
        match format {
            PayloadFormat::Json => Ok(serde_json::from_slice(bytes)?),
            PayloadFormat::Bincode => {
                let (log, _len) = bincode::decode_from_slice(bytes, bincode_config())?;
                Ok(log)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;

    /// Builds `["A", "B", ...]`-style logs: one record per label, one second apart.
    pub fn labelled_log(labels: &[&str]) -> MessageLog {
        labels
            .iter()
            .enumerate()
            .map(|(i, label)| {
                LogRecord::new("/chatter", i as u64 * 1_000_000_000, label.as_bytes().to_vec())
            })
            .collect::<Vec<_>>()
            .into()
    }

    pub fn payload_labels(log: &MessageLog) -> Vec<String> {
        log.iter()
            .map(|record| String::from_utf8_lossy(&record.payload).into_owned())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_utils::{labelled_log, payload_labels};
    use super::*;

    #[test]
    fn without_removes_only_the_indexed_record() {
        let log = labelled_log(&["A", "B", "C"]);
        let dropped = log.without(1);
        assert_eq!(payload_labels(&dropped), vec!["A", "C"]);
        assert_eq!(payload_labels(&log), vec!["A", "B", "C"]);
        assert_eq!(log.without(7), log);
    }

    #[test]
    fn with_swapped_keeps_timestamps_in_place() {
        let log = labelled_log(&["A", "B", "C"]);
        let swapped = log.with_swapped(0, 2);
        assert_eq!(payload_labels(&swapped), vec!["C", "B", "A"]);
        let timestamps: Vec<u64> = swapped.iter().map(|r| r.timestamp_ns).collect();
        assert_eq!(timestamps, vec![0, 1_000_000_000, 2_000_000_000]);
    }

    #[test]
    fn with_duplicate_inserts_copy_after_original() {
        let log = labelled_log(&["A", "B"]);
        assert_eq!(payload_labels(&log.with_duplicate(0)), vec!["A", "A", "B"]);
    }

    #[test]
    fn with_corrupted_payload_flips_masked_bits() {
        let log = MessageLog::new(vec![LogRecord::new("/imu", 5, vec![0b1010_0000, 1])]);
        let corrupted = log.with_corrupted_payload(0, 0, 0b0000_1111);
        assert_eq!(corrupted.records()[0].payload, vec![0b1010_1111, 1]);
        assert_eq!(log.with_corrupted_payload(0, 9, 0xFF), log);
    }

    #[test]
    fn payload_formats_decode_back_to_the_same_log() {
        let log = labelled_log(&["x", "y"]);
        for format in [PayloadFormat::Json, PayloadFormat::Bincode] {
            let bytes = log.to_payload(format).unwrap();
            assert_eq!(MessageLog::from_payload(&bytes, format).unwrap(), log);
        }
    }

    #[test]
    fn json_payload_is_a_plain_record_array() {
        let log = MessageLog::new(vec![LogRecord::new("/a", 1, vec![7])]);
        let json: serde_json::Value = serde_json::from_slice(&log.to_payload(PayloadFormat::Json).unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!([{ "channel": "/a", "timestamp-ns": 1, "payload": [7] }])
        );
    }
}
