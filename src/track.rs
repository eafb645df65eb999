use std::sync::Arc;

use tracing::warn;

use crate::chip::ChipModel;
use crate::error::{PlayerError, Result};
use crate::utils::fnv1a64;

const V1_DATA_OFFSET: u16 = 0x76;
const V2_DATA_OFFSET: u16 = 0x7C;
const MAX_SONGS: u16 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidFormat {
    Psid,
    Rsid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VideoClock {
    #[default]
    Unknown,
    Pal,
    Ntsc,
    Any,
}

impl VideoClock {
    pub fn frame_rate(&self) -> f64 {
        match self {
            VideoClock::Ntsc => 60.0,
            _ => 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ModelHint {
    #[default]
    Unknown,
    Only(ChipModel),
    Any,
}

/// The fixed part of a PSID/RSID file.
#[derive(Debug, Clone, PartialEq)]
pub struct SidHeader {
    pub format: SidFormat,
    pub version: u16,
    pub data_offset: u16,
    pub load_address: u16,
    pub init_address: u16,
    pub play_address: u16,
    pub songs: u16,
    pub start_song: u16, // 1-based, as stored
    pub speed: u32,
    pub name: String,
    pub author: String,
    pub released: String,
    pub clock: VideoClock,
    pub model: ModelHint,
}

impl SidHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < V1_DATA_OFFSET as usize {
            return Err(PlayerError::Format(format!(
                "File too short for a SID header: {} bytes",
                bytes.len()
            )));
        }

        let format = match &bytes[0..4] {
            b"PSID" => SidFormat::Psid,
            b"RSID" => SidFormat::Rsid,
            _ => return Err(PlayerError::Format("Missing PSID/RSID magic".to_string())),
        };

        let version = be16(bytes, 4);
        if !(1..=4).contains(&version) || (format == SidFormat::Rsid && version < 2) {
            return Err(PlayerError::Format(format!("Unsupported header version {}", version)));
        }

        let data_offset = be16(bytes, 6);
        let expected_offset = if version == 1 { V1_DATA_OFFSET } else { V2_DATA_OFFSET };
        if data_offset != expected_offset {
            return Err(PlayerError::Format(format!(
                "Bad data offset {:#x} for version {}",
                data_offset, version
            )));
        }
        if bytes.len() <= data_offset as usize {
            return Err(PlayerError::Format("File ends before data offset".to_string()));
        }

        let songs = be16(bytes, 14);
        if songs == 0 || songs > MAX_SONGS {
            return Err(PlayerError::Format(format!("Song count out of range: {}", songs)));
        }

        let mut start_song = be16(bytes, 16);
        if start_song == 0 || start_song > songs {
            warn!("Start song {} out of range 1..={}, using 1", start_song, songs);
            start_song = 1;
        }

        let (clock, model) = if version >= 2 {
            let flags = be16(bytes, 0x76);
            let clock = match (flags >> 2) & 0x03 {
                1 => VideoClock::Pal,
                2 => VideoClock::Ntsc,
                3 => VideoClock::Any,
                _ => VideoClock::Unknown,
            };
            let model = match (flags >> 4) & 0x03 {
                1 => ModelHint::Only(ChipModel::Mos6581),
                2 => ModelHint::Only(ChipModel::Mos8580),
                3 => ModelHint::Any,
                _ => ModelHint::Unknown,
            };
            (clock, model)
        } else {
            (VideoClock::Unknown, ModelHint::Unknown)
        };

        Ok(SidHeader {
            format,
            version,
            data_offset,
            load_address: be16(bytes, 8),
            init_address: be16(bytes, 10),
            play_address: be16(bytes, 12),
            songs,
            start_song,
            speed: u32::from_be_bytes([bytes[18], bytes[19], bytes[20], bytes[21]]),
            name: latin1(&bytes[22..54]),
            author: latin1(&bytes[54..86]),
            released: latin1(&bytes[86..118]),
            clock,
            model,
        })
    }

    /// Player call rate for a 0-based subtune: CIA-timed songs run at 60 Hz,
    /// vblank songs at the video clock.
    pub fn tick_rate(&self, subtune: usize) -> f64 {
        let bit = subtune.min(31);
        if self.speed & (1 << bit) != 0 {
            60.0
        } else {
            self.clock.frame_rate()
        }
    }
}

#[inline]
fn be16(bytes: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([bytes[at], bytes[at + 1]])
}

fn latin1(field: &[u8]) -> String {
    field
        .iter()
        .take_while(|&&b| b != 0)
        .map(|&b| b as char)
        .collect::<String>()
        .trim()
        .to_string()
}

/// A loaded track. Immutable once built; shared with the audio path behind an `Arc`.
#[derive(Debug, Clone, PartialEq)]
pub struct Track {
    pub id: String,
    pub title: String,
    pub artist: String,
    pub raw_data: Arc<[u8]>,
    pub subtune_count: usize,
    pub default_subtune: usize,
    pub source_url: Option<String>,
    pub header: SidHeader,
    payload_start: usize,
}

impl Track {
    pub fn from_bytes(bytes: Vec<u8>, source_url: Option<String>) -> Result<Self> {
        let header = SidHeader::parse(&bytes)?;

        let mut payload_start = header.data_offset as usize;
        if header.load_address == 0 {
            // load address lives in the first two payload bytes (little-endian)
            payload_start += 2;
        }
        if bytes.len() <= payload_start {
            return Err(PlayerError::Format("Track has no music data".to_string()));
        }

        let title = if header.name.is_empty() { "Unknown".to_string() } else { header.name.clone() };
        let artist = if header.author.is_empty() { "Unknown".to_string() } else { header.author.clone() };

        Ok(Track {
            id: format!("sid-{:016x}", fnv1a64(&bytes)),
            title,
            artist,
            subtune_count: header.songs as usize,
            default_subtune: header.start_song as usize - 1,
            source_url,
            header,
            raw_data: Arc::from(bytes),
            payload_start,
        })
    }

    /// Music data after the header (and embedded load address).
    pub fn payload(&self) -> &[u8] {
        &self.raw_data[self.payload_start..]
    }

    pub fn with_display(mut self, id: Option<&str>, title: Option<&str>, artist: Option<&str>) -> Self {
        if let Some(id) = id {
            self.id = id.to_string();
        }
        if let Some(title) = title {
            self.title = title.to_string();
        }
        if let Some(artist) = artist {
            self.artist = artist.to_string();
        }
        self
    }
}

/// Builds a minimal well-formed PSID image. Handy for tests and demos.
pub fn build_psid(name: &str, author: &str, songs: u16, start_song: u16, payload: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0u8; V2_DATA_OFFSET as usize];
    bytes[0..4].copy_from_slice(b"PSID");
    bytes[4..6].copy_from_slice(&2u16.to_be_bytes());
    bytes[6..8].copy_from_slice(&V2_DATA_OFFSET.to_be_bytes());
    bytes[8..10].copy_from_slice(&0x1000u16.to_be_bytes());
    bytes[10..12].copy_from_slice(&0x1000u16.to_be_bytes());
    bytes[12..14].copy_from_slice(&0x1003u16.to_be_bytes());
    bytes[14..16].copy_from_slice(&songs.to_be_bytes());
    bytes[16..18].copy_from_slice(&start_song.to_be_bytes());
    for (field, text) in [(22usize, name), (54, author)] {
        for (i, b) in text.bytes().take(31).enumerate() {
            bytes[field + i] = b;
        }
    }
    bytes[0x76..0x78].copy_from_slice(&0x0014u16.to_be_bytes()); // PAL, 6581
    bytes.extend_from_slice(payload);
    bytes
}
