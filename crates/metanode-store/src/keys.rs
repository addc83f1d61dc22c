//! Row key layout for the partition keyspace
//!
//! Extent deletion rows are keyed
//!
//! ```text
//! [ExtentDel tag: 1][DateKey: 8 BE][ExtentKey: 40]
//!  0                 1..9           9..49
//! ```
//!
//! so every row written in the same hour is contiguous, and rows sort by
//! hour before extent. Expiring everything older than a cursor is a single
//! range delete from the start of the table up to `[tag][cursor]`.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use metanode_common::{Error, ExtentKey, Result};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::tables::TableTag;

/// Offset of the date inside a deletion row key
pub const DATE_KEY_OFFSET: usize = 1;
/// Encoded size of a [`DateKey`]
pub const DATE_KEY_LEN: usize = 8;
/// Offset of the day byte inside a deletion row key
pub const DAY_KEY_INDEX: usize = DATE_KEY_OFFSET + 5;
/// Offset of the hour byte inside a deletion row key
pub const HOUR_KEY_INDEX: usize = DATE_KEY_OFFSET + 6;
/// Total size of a deletion row key
pub const EXTENT_DEL_KEY_LEN: usize = DATE_KEY_OFFSET + DATE_KEY_LEN + ExtentKey::ENCODED_LEN;

/// Meta row holding the deletion cursor
pub const CURSOR_KEY: &[u8] = b"\xF0extent_del_cursor";
/// Meta row holding the last applied consensus index
pub const APPLIED_INDEX_KEY: &[u8] = b"\xF0applied_index";

/// Hour-granularity date packed so that byte order is time order
///
/// Layout (big-endian): `[0, 0, year_hi, year_lo, month, day, hour, 0]`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DateKey(u64);

impl DateKey {
    /// The zero date; every real date compares greater
    pub const MIN: Self = Self(0);

    /// Wrap an already-packed value
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Packed value
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Bucket containing `time`
    #[must_use]
    pub fn at(time: &DateTime<Utc>) -> Self {
        let year = u64::try_from(time.year()).unwrap_or(0) & 0xFFFF;
        Self(
            year << 32
                | u64::from(time.month()) << 24
                | u64::from(time.day()) << 16
                | u64::from(time.hour()) << 8,
        )
    }

    /// Bucket containing the current wall-clock time
    #[must_use]
    pub fn now() -> Self {
        Self::at(&Utc::now())
    }

    /// Big-endian encoding
    #[must_use]
    pub const fn to_bytes(self) -> [u8; DATE_KEY_LEN] {
        self.0.to_be_bytes()
    }

    /// Decode from the 8 date bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let bytes: [u8; DATE_KEY_LEN] = data.try_into().map_err(|_| {
            Error::protocol(format!("date key is {} bytes, expected {DATE_KEY_LEN}", data.len()))
        })?;
        Ok(Self(u64::from_be_bytes(bytes)))
    }

    /// Start of the hour this key names, if it is a valid calendar date
    #[must_use]
    pub fn to_datetime(self) -> Option<DateTime<Utc>> {
        let [_, _, year_hi, year_lo, month, day, hour, _] = self.to_bytes();
        let year = i32::from(u16::from_be_bytes([year_hi, year_lo]));
        Utc.with_ymd_and_hms(year, month.into(), day.into(), hour.into(), 0, 0)
            .single()
    }
}

impl fmt::Display for DateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [_, _, year_hi, year_lo, month, day, hour, _] = self.to_bytes();
        let year = u16::from_be_bytes([year_hi, year_lo]);
        write!(f, "{year:04}-{month:02}-{day:02}T{hour:02}")
    }
}

/// Key of one deletion row
#[must_use]
pub fn extent_del_key(date: DateKey, extent: &ExtentKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(EXTENT_DEL_KEY_LEN);
    key.push(TableTag::ExtentDel.byte());
    key.extend_from_slice(&date.to_bytes());
    key.extend_from_slice(&extent.to_bytes());
    key
}

/// First key of the bucket for `date`; also the exclusive end of every
/// earlier bucket
#[must_use]
pub fn extent_del_bucket(date: DateKey) -> Vec<u8> {
    let mut key = Vec::with_capacity(DATE_KEY_OFFSET + DATE_KEY_LEN);
    key.push(TableTag::ExtentDel.byte());
    key.extend_from_slice(&date.to_bytes());
    key
}

/// Split a deletion row key into its date and extent-key suffix
pub fn split_extent_del_key(key: &[u8]) -> Result<(DateKey, &[u8])> {
    if key.len() != EXTENT_DEL_KEY_LEN || key[0] != TableTag::ExtentDel.byte() {
        return Err(Error::protocol(format!(
            "not an extent deletion key ({} bytes, tag {:#04x})",
            key.len(),
            key.first().copied().unwrap_or_default()
        )));
    }
    let date = DateKey::from_bytes(&key[DATE_KEY_OFFSET..DATE_KEY_OFFSET + DATE_KEY_LEN])?;
    Ok((date, &key[DATE_KEY_OFFSET + DATE_KEY_LEN..]))
}
