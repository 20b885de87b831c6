use bytes::Bytes;

use crate::{CodecId, H264, AAC};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaType {
	Video,
	Audio,
	Data,
}

impl std::fmt::Display for MediaType {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		// Lower case, as embedded in artifact file names.
		match self {
			MediaType::Video => write!(f, "video"),
			MediaType::Audio => write!(f, "audio"),
			MediaType::Data => write!(f, "data"),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
	pub num: u32,
	pub den: u32,
}

impl Timebase {
	pub fn new(num: u32, den: u32) -> Self {
		Self { num, den }
	}

	/// Ticks per second.
	pub fn timescale(&self) -> u32 {
		self.den / self.num.max(1)
	}

	/// Convert a duration expressed in timebase units to milliseconds.
	pub fn to_millis(&self, units: i64) -> f64 {
		units as f64 * 1000.0 * self.num as f64 / self.den as f64
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
	pub width: u32,
	pub height: u32,
}

/// Immutable per-track metadata, fixed once the stream starts.
#[derive(Debug, Clone)]
pub struct MediaTrack {
	pub id: i32,
	pub name: String,
	pub media_type: MediaType,
	pub codec_id: CodecId,
	pub timebase: Timebase,

	/// Codec private data: an avcC record for H264, an AudioSpecificConfig
	/// for AAC. Absent for the data track.
	pub extradata: Option<Bytes>,

	pub resolution: Option<Dimensions>,
	pub framerate: f64,
	pub sample_rate: u32,
	pub channel_count: u32,
	pub bitrate: u64,
}

impl MediaTrack {
	pub fn video(
		id: i32,
		name: &str,
		codec_id: CodecId,
		timebase: Timebase,
		resolution: Dimensions,
		framerate: f64,
		bitrate: u64,
		extradata: Bytes,
	) -> Self {
		Self {
			id,
			name: name.to_string(),
			media_type: MediaType::Video,
			codec_id,
			timebase,
			extradata: Some(extradata),
			resolution: Some(resolution),
			framerate,
			sample_rate: 0,
			channel_count: 0,
			bitrate,
		}
	}

	pub fn audio(
		id: i32,
		name: &str,
		codec_id: CodecId,
		timebase: Timebase,
		sample_rate: u32,
		channel_count: u32,
		bitrate: u64,
		extradata: Bytes,
	) -> Self {
		Self {
			id,
			name: name.to_string(),
			media_type: MediaType::Audio,
			codec_id,
			timebase,
			extradata: Some(extradata),
			resolution: None,
			framerate: 0.0,
			sample_rate,
			channel_count,
			bitrate,
		}
	}

	pub fn data(id: i32, name: &str, timebase: Timebase) -> Self {
		Self {
			id,
			name: name.to_string(),
			media_type: MediaType::Data,
			codec_id: CodecId::ID3v2,
			timebase,
			extradata: None,
			resolution: None,
			framerate: 0.0,
			sample_rate: 0,
			channel_count: 0,
			bitrate: 0,
		}
	}

	pub fn is_supported(&self) -> bool {
		self.codec_id.is_supported()
	}

	/// The RFC 6381 codec string advertised in the master playlist, derived
	/// from the decoder configuration.
	pub fn codec_string(&self) -> Option<String> {
		match self.codec_id {
			CodecId::H264 => {
				let extradata = self.extradata.as_ref()?;
				H264::from_avcc(extradata).ok().map(|c| c.to_string())
			}
			CodecId::AAC => {
				let profile = self
					.extradata
					.as_ref()
					.filter(|data| !data.is_empty())
					.map(|data| (data[0] >> 3) & 0x1f)
					.unwrap_or(2);
				Some(AAC { profile }.to_string())
			}
			_ => None,
		}
	}
}
