use crate::error::{DownloaderError, Result};
use chrono::NaiveDateTime;
use img_parts::jpeg::Jpeg;
use img_parts::ImageEXIF;

// TIFF field types used in the EXIF payload.
const TYPE_BYTE: u16 = 1;
const TYPE_ASCII: u16 = 2;
const TYPE_LONG: u16 = 4;
const TYPE_RATIONAL: u16 = 5;

// 0th IFD tags
const TAG_DATETIME: u16 = 0x0132;
const TAG_EXIF_IFD: u16 = 0x8769;
const TAG_GPS_IFD: u16 = 0x8825;

// Exif IFD tags
const TAG_DATETIME_ORIGINAL: u16 = 0x9003;
const TAG_DATETIME_DIGITIZED: u16 = 0x9004;

// GPS IFD tags
const TAG_GPS_VERSION: u16 = 0x0000;
const TAG_GPS_LAT_REF: u16 = 0x0001;
const TAG_GPS_LAT: u16 = 0x0002;
const TAG_GPS_LON_REF: u16 = 0x0003;
const TAG_GPS_LON: u16 = 0x0004;

/// Embeds capture date and GPS coordinates into a JPEG payload.
///
/// Builds a fresh little-endian TIFF EXIF blob (0th IFD with `DateTime` and
/// pointers to Exif and GPS IFDs) and splices it into the JPEG's APP1
/// segment. Non-JPEG payloads are rejected; callers treat any error here as
/// a warning, not a transfer failure.
pub fn embed_exif(
    bytes: &[u8],
    timestamp: Option<NaiveDateTime>,
    latitude: f64,
    longitude: f64,
) -> Result<Vec<u8>> {
    let mut jpeg = Jpeg::from_bytes(bytes.to_vec().into())
        .map_err(|e| DownloaderError::Exif(format!("not a JPEG container: {}", e)))?;
    let payload = build_exif_payload(timestamp, latitude, longitude);
    jpeg.set_exif(Some(payload.into()));
    Ok(jpeg.encoder().bytes().to_vec())
}

/// Builds the raw TIFF EXIF payload (without the `Exif\0\0` APP1 prefix,
/// which `img-parts` adds itself).
pub fn build_exif_payload(
    timestamp: Option<NaiveDateTime>,
    latitude: f64,
    longitude: f64,
) -> Vec<u8> {
    let date_str = timestamp.map(|t| t.format("%Y:%m:%d %H:%M:%S").to_string());

    let mut exif_ifd = Ifd::default();
    if let Some(ref d) = date_str {
        exif_ifd.push_ascii(TAG_DATETIME_ORIGINAL, d);
        exif_ifd.push_ascii(TAG_DATETIME_DIGITIZED, d);
    }

    let mut gps_ifd = Ifd::default();
    gps_ifd.push_bytes(TAG_GPS_VERSION, &[2, 3, 0, 0]);
    gps_ifd.push_ascii(TAG_GPS_LAT_REF, if latitude >= 0.0 { "N" } else { "S" });
    gps_ifd.push_rationals(TAG_GPS_LAT, &deg_to_dms(latitude));
    gps_ifd.push_ascii(TAG_GPS_LON_REF, if longitude >= 0.0 { "E" } else { "W" });
    gps_ifd.push_rationals(TAG_GPS_LON, &deg_to_dms(longitude));

    // Layout: header | 0th IFD | 0th data | Exif IFD | Exif data | GPS IFD | GPS data
    // Without a timestamp the Exif IFD would be empty, so it is omitted.
    let mut zeroth = Ifd::default();
    if let Some(ref d) = date_str {
        zeroth.push_ascii(TAG_DATETIME, d);
        zeroth.push_long(TAG_EXIF_IFD, 0);
    }
    // Pointer values depend on the 0th IFD's own size, which depends on how
    // many entries it has; pointer entries are added before sizing.
    zeroth.push_long(TAG_GPS_IFD, 0);

    let zeroth_end = 8 + zeroth.total_len();
    let exif_off = zeroth_end as u32;
    let gps_off = if date_str.is_some() {
        zeroth.set_long(TAG_EXIF_IFD, exif_off);
        (zeroth_end + exif_ifd.total_len()) as u32
    } else {
        zeroth_end as u32
    };
    zeroth.set_long(TAG_GPS_IFD, gps_off);

    let mut out = Vec::new();
    // Little-endian TIFF header, first IFD at offset 8
    out.extend_from_slice(b"II");
    out.extend_from_slice(&42u16.to_le_bytes());
    out.extend_from_slice(&8u32.to_le_bytes());
    zeroth.render(8, &mut out);
    if date_str.is_some() {
        exif_ifd.render(exif_off as usize, &mut out);
    }
    gps_ifd.render(gps_off as usize, &mut out);
    out
}

/// Converts a decimal coordinate to EXIF degree/minute/second rationals.
/// The sign is carried by the hemisphere reference tag, not the values.
pub fn deg_to_dms(value: f64) -> [(u32, u32); 3] {
    let abs = value.abs();
    let degrees = abs.trunc() as u32;
    let minutes_f = (abs - degrees as f64) * 60.0;
    let minutes = minutes_f.trunc() as u32;
    let seconds = (minutes_f - minutes as f64) * 60.0;
    [
        (degrees, 1),
        (minutes, 1),
        ((seconds * 10_000.0).round() as u32, 10_000),
    ]
}

struct Entry {
    tag: u16,
    kind: u16,
    count: u32,
    data: Vec<u8>,
}

/// One TIFF image file directory under construction. Values longer than
/// four bytes are stored after the entry table and referenced by offset.
#[derive(Default)]
struct Ifd {
    entries: Vec<Entry>,
}

impl Ifd {
    fn push_ascii(&mut self, tag: u16, text: &str) {
        let mut data = text.as_bytes().to_vec();
        data.push(0);
        self.entries.push(Entry {
            tag,
            kind: TYPE_ASCII,
            count: data.len() as u32,
            data,
        });
    }

    fn push_long(&mut self, tag: u16, value: u32) {
        self.entries.push(Entry {
            tag,
            kind: TYPE_LONG,
            count: 1,
            data: value.to_le_bytes().to_vec(),
        });
    }

    fn set_long(&mut self, tag: u16, value: u32) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.tag == tag) {
            entry.data = value.to_le_bytes().to_vec();
        }
    }

    fn push_bytes(&mut self, tag: u16, bytes: &[u8]) {
        self.entries.push(Entry {
            tag,
            kind: TYPE_BYTE,
            count: bytes.len() as u32,
            data: bytes.to_vec(),
        });
    }

    fn push_rationals(&mut self, tag: u16, values: &[(u32, u32)]) {
        let mut data = Vec::with_capacity(values.len() * 8);
        for (num, den) in values {
            data.extend_from_slice(&num.to_le_bytes());
            data.extend_from_slice(&den.to_le_bytes());
        }
        self.entries.push(Entry {
            tag,
            kind: TYPE_RATIONAL,
            count: values.len() as u32,
            data,
        });
    }

    fn table_len(&self) -> usize {
        2 + self.entries.len() * 12 + 4
    }

    fn data_len(&self) -> usize {
        self.entries
            .iter()
            .map(|e| {
                if e.data.len() > 4 {
                    e.data.len() + e.data.len() % 2
                } else {
                    0
                }
            })
            .sum()
    }

    fn total_len(&self) -> usize {
        self.table_len() + self.data_len()
    }

    /// Appends the entry table and out-of-line data, assuming the table
    /// starts at `ifd_offset` within the TIFF payload.
    fn render(&self, ifd_offset: usize, out: &mut Vec<u8>) {
        let mut entries: Vec<&Entry> = self.entries.iter().collect();
        entries.sort_by_key(|e| e.tag);

        out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
        let mut data_cursor = ifd_offset + self.table_len();
        let mut tail: Vec<u8> = Vec::new();
        for entry in &entries {
            out.extend_from_slice(&entry.tag.to_le_bytes());
            out.extend_from_slice(&entry.kind.to_le_bytes());
            out.extend_from_slice(&entry.count.to_le_bytes());
            if entry.data.len() <= 4 {
                let mut inline = [0u8; 4];
                inline[..entry.data.len()].copy_from_slice(&entry.data);
                out.extend_from_slice(&inline);
            } else {
                out.extend_from_slice(&(data_cursor as u32).to_le_bytes());
                tail.extend_from_slice(&entry.data);
                if entry.data.len() % 2 == 1 {
                    tail.push(0);
                }
                data_cursor += entry.data.len() + entry.data.len() % 2;
            }
        }
        // no chained IFD
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&tail);
    }
}
