#![forbid(unsafe_code)]

//! Minimal libpcap (classic `.pcap`) container builder.
//!
//! Like the rest of the gateway's capture path, this crate only *builds* bytes: every function
//! returns a fully formed header or record so callers decide how to write it (buffered file,
//! in-memory, etc). A small reader is included so captures can be inspected in tests.

use std::time::Duration;

/// Magic for microsecond-resolution captures, written little-endian.
pub const MAGIC_MICROS: u32 = 0xA1B2_C3D4;
pub const VERSION_MAJOR: u16 = 2;
pub const VERSION_MINOR: u16 = 4;

/// Snap length used by the gateway (matches what Wireshark/tcpdump expect for Ethernet).
pub const DEFAULT_SNAPLEN: u32 = 65536;

pub const FILE_HEADER_LEN: usize = 24;
pub const RECORD_HEADER_LEN: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    Ethernet,
}

impl LinkType {
    fn to_pcap(self) -> u32 {
        match self {
            // https://www.tcpdump.org/linktypes.html
            LinkType::Ethernet => 1,
        }
    }

    fn from_pcap(value: u32) -> Option<Self> {
        match value {
            1 => Some(LinkType::Ethernet),
            _ => None,
        }
    }
}

/// Build the 24-byte global header.
pub fn file_header(snaplen: u32, link_type: LinkType) -> Vec<u8> {
    let mut out = Vec::with_capacity(FILE_HEADER_LEN);
    out.extend_from_slice(&MAGIC_MICROS.to_le_bytes());
    out.extend_from_slice(&VERSION_MAJOR.to_le_bytes());
    out.extend_from_slice(&VERSION_MINOR.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes()); // thiszone
    out.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
    out.extend_from_slice(&snaplen.to_le_bytes());
    out.extend_from_slice(&link_type.to_pcap().to_le_bytes());
    out
}

/// Build one packet record.
///
/// `timestamp` is the time since the Unix epoch. Payloads longer than `snaplen` are truncated;
/// the original length field always carries the full payload length.
pub fn packet_record(timestamp: Duration, payload: &[u8], snaplen: u32) -> Vec<u8> {
    let orig_len = u32::try_from(payload.len()).unwrap_or(u32::MAX);
    let incl_len = orig_len.min(snaplen);
    let captured = &payload[..incl_len as usize];

    let ts_sec = u32::try_from(timestamp.as_secs()).unwrap_or(u32::MAX);
    let ts_usec = timestamp.subsec_micros();

    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + captured.len());
    out.extend_from_slice(&ts_sec.to_le_bytes());
    out.extend_from_slice(&ts_usec.to_le_bytes());
    out.extend_from_slice(&incl_len.to_le_bytes());
    out.extend_from_slice(&orig_len.to_le_bytes());
    out.extend_from_slice(captured);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version_major: u16,
    pub version_minor: u16,
    pub snaplen: u32,
    pub link_type: LinkType,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub timestamp: Duration,
    pub orig_len: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    ShortHeader,
    BadMagic(u32),
    UnknownLinkType(u32),
    TruncatedRecord { offset: usize },
}

impl std::fmt::Display for ParseError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ParseError::ShortHeader => write!(f, "capture shorter than the pcap global header"),
            ParseError::BadMagic(magic) => write!(f, "unexpected pcap magic {magic:#010x}"),
            ParseError::UnknownLinkType(lt) => write!(f, "unknown pcap link type {lt}"),
            ParseError::TruncatedRecord { offset } => {
                write!(f, "truncated pcap record at offset {offset}")
            }
        }
    }
}

impl std::error::Error for ParseError {}

/// Parse a complete little-endian, microsecond-resolution capture.
pub fn parse(bytes: &[u8]) -> Result<(FileHeader, Vec<Record>), ParseError> {
    let header = bytes.get(..FILE_HEADER_LEN).ok_or(ParseError::ShortHeader)?;
    let magic = read_u32(header, 0);
    if magic != MAGIC_MICROS {
        return Err(ParseError::BadMagic(magic));
    }
    let link_raw = read_u32(header, 20);
    let file_header = FileHeader {
        version_major: u16::from_le_bytes([header[4], header[5]]),
        version_minor: u16::from_le_bytes([header[6], header[7]]),
        snaplen: read_u32(header, 16),
        link_type: LinkType::from_pcap(link_raw).ok_or(ParseError::UnknownLinkType(link_raw))?,
    };

    let mut records = Vec::new();
    let mut cursor = FILE_HEADER_LEN;
    while cursor < bytes.len() {
        let rec = bytes
            .get(cursor..cursor + RECORD_HEADER_LEN)
            .ok_or(ParseError::TruncatedRecord { offset: cursor })?;
        let ts_sec = read_u32(rec, 0);
        let ts_usec = read_u32(rec, 4);
        let incl_len = read_u32(rec, 8) as usize;
        let orig_len = read_u32(rec, 12);

        let data_start = cursor + RECORD_HEADER_LEN;
        let data = bytes
            .get(data_start..data_start + incl_len)
            .ok_or(ParseError::TruncatedRecord { offset: cursor })?;
        records.push(Record {
            timestamp: Duration::from_secs(ts_sec.into()) + Duration::from_micros(ts_usec.into()),
            orig_len,
            data: data.to_vec(),
        });
        cursor = data_start + incl_len;
    }

    Ok((file_header, records))
}

fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_header_declares_ethernet_and_snaplen() {
        let bytes = file_header(DEFAULT_SNAPLEN, LinkType::Ethernet);
        assert_eq!(bytes.len(), FILE_HEADER_LEN);
        assert_eq!(&bytes[0..4], &[0xD4, 0xC3, 0xB2, 0xA1]);

        let (header, records) = parse(&bytes).unwrap();
        assert_eq!(header.version_major, 2);
        assert_eq!(header.version_minor, 4);
        assert_eq!(header.snaplen, 65536);
        assert_eq!(header.link_type, LinkType::Ethernet);
        assert!(records.is_empty());
    }

    #[test]
    fn packet_record_truncates_to_snaplen_but_keeps_original_length() {
        let payload = [0x5Au8; 100];
        let bytes = packet_record(Duration::from_micros(1_500_000), &payload, 64);

        let incl_len = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let orig_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(incl_len, 64);
        assert_eq!(orig_len, 100);
        assert_eq!(bytes.len(), RECORD_HEADER_LEN + 64);

        assert_eq!(u32::from_le_bytes(bytes[0..4].try_into().unwrap()), 1);
        assert_eq!(u32::from_le_bytes(bytes[4..8].try_into().unwrap()), 500_000);
    }

    #[test]
    fn parse_reads_records_in_order() {
        let mut bytes = file_header(DEFAULT_SNAPLEN, LinkType::Ethernet);
        bytes.extend(packet_record(Duration::from_secs(10), b"first", DEFAULT_SNAPLEN));
        bytes.extend(packet_record(Duration::from_secs(11), b"", DEFAULT_SNAPLEN));
        bytes.extend(packet_record(Duration::from_secs(12), b"third!", DEFAULT_SNAPLEN));

        let (_, records) = parse(&bytes).unwrap();
        let data: Vec<&[u8]> = records.iter().map(|r| r.data.as_slice()).collect();
        assert_eq!(data, vec![&b"first"[..], &b""[..], &b"third!"[..]]);
        assert_eq!(records[2].timestamp, Duration::from_secs(12));
    }

    #[test]
    fn parse_rejects_truncated_record() {
        let mut bytes = file_header(DEFAULT_SNAPLEN, LinkType::Ethernet);
        let record = packet_record(Duration::ZERO, b"abcdef", DEFAULT_SNAPLEN);
        bytes.extend_from_slice(&record[..record.len() - 2]);

        assert_eq!(
            parse(&bytes).unwrap_err(),
            ParseError::TruncatedRecord {
                offset: FILE_HEADER_LEN
            }
        );
    }
}
