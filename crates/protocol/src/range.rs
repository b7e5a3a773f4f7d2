use std::fmt;
use std::str::FromStr;

use crate::ProtocolError;

/// A byte range as sent in a `Range: bytes=start-end` request header.
///
/// `length == None` means "from `offset` to the end of the object".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HttpRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl HttpRange {
    /// Range covering `length` bytes starting at `offset`.
    pub fn new(offset: u64, length: u64) -> Self {
        Self {
            offset,
            length: Some(length),
        }
    }

    /// Open-ended range from `offset` to the end of the object.
    pub fn from_offset(offset: u64) -> Self {
        Self {
            offset,
            length: None,
        }
    }

    /// The whole object.
    pub fn full() -> Self {
        Self::from_offset(0)
    }

    /// Inclusive end offset, if the range is bounded and non-empty.
    pub fn end_inclusive(&self) -> Option<u64> {
        match self.length {
            Some(0) | None => None,
            Some(len) => Some(self.offset + len - 1),
        }
    }

    /// Formats the header value, e.g. `bytes=0-99` or `bytes=100-`.
    ///
    /// A zero-length bounded range has no valid HTTP representation and is
    /// rendered open-ended; callers never request empty ranges.
    pub fn to_header(&self) -> String {
        match self.end_inclusive() {
            Some(end) => format!("bytes={}-{}", self.offset, end),
            None => format!("bytes={}-", self.offset),
        }
    }
}

impl fmt::Display for HttpRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_header())
    }
}

impl FromStr for HttpRange {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidRange(s.to_string());
        let spec = s.trim().strip_prefix("bytes=").ok_or_else(invalid)?;
        let (start, end) = spec.split_once('-').ok_or_else(invalid)?;
        let offset: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end = end.trim();
        if end.is_empty() {
            return Ok(Self::from_offset(offset));
        }
        let end: u64 = end.parse().map_err(|_| invalid())?;
        if end < offset {
            return Err(invalid());
        }
        Ok(Self::new(offset, end - offset + 1))
    }
}

/// A parsed `Content-Range: bytes start-end/total` response header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end_inclusive: u64,
    /// Full object length; `None` when the server answered `*`.
    pub total: Option<u64>,
}

impl ContentRange {
    /// Number of bytes carried by the response body.
    pub fn len(&self) -> u64 {
        self.end_inclusive - self.start + 1
    }

    /// Always false: a content range covers at least one byte.
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl FromStr for ContentRange {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ProtocolError::InvalidContentRange(s.to_string());
        let spec = s.trim().strip_prefix("bytes ").ok_or_else(invalid)?;
        let (range, total) = spec.split_once('/').ok_or_else(invalid)?;
        let (start, end) = range.split_once('-').ok_or_else(invalid)?;
        let start: u64 = start.trim().parse().map_err(|_| invalid())?;
        let end_inclusive: u64 = end.trim().parse().map_err(|_| invalid())?;
        if end_inclusive < start {
            return Err(invalid());
        }
        let total = match total.trim() {
            "*" => None,
            t => {
                let t: u64 = t.parse().map_err(|_| invalid())?;
                if end_inclusive >= t {
                    return Err(invalid());
                }
                Some(t)
            }
        };
        Ok(Self {
            start,
            end_inclusive,
            total,
        })
    }
}
