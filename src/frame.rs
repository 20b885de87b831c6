use bytes::Bytes;
use derive_more::Debug;

use crate::MediaType;

/// How the payload bytes are framed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BitstreamFormat {
	/// H264 with 4-byte length prefixes, ready for an mdat.
	H264Avcc,
	/// H264 with start codes; the ingest side converts before handing over.
	H264AnnexB,
	/// Raw AAC frames without ADTS headers.
	AacRaw,
	AacAdts,
	/// ID3v2 timed metadata, the only format accepted on the data track.
	ID3v2,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
	Video,
	Audio,
	/// Timed metadata correlated with the video timeline.
	VideoEvent,
	/// Timed metadata correlated with the audio timeline.
	AudioEvent,
}

/// One encoded sample handed to the publisher by the ingest side.
///
/// Timestamps and duration are expressed in the owning track's timebase.
/// Samples arrive in DTS order per track; the caller guarantees it.
#[derive(Debug, Clone)]
pub struct MediaPacket {
	pub track_id: i32,
	pub media_type: MediaType,
	pub packet_type: PacketType,
	pub bitstream_format: BitstreamFormat,

	pub dts: i64,
	pub pts: i64,
	pub duration: i64,
	pub keyframe: bool,

	#[debug("{} bytes", payload.len())]
	pub payload: Bytes,
}

impl MediaPacket {
	pub fn video(track_id: i32, dts: i64, pts: i64, duration: i64, keyframe: bool, payload: Bytes) -> Self {
		Self {
			track_id,
			media_type: MediaType::Video,
			packet_type: PacketType::Video,
			bitstream_format: BitstreamFormat::H264Avcc,
			dts,
			pts,
			duration,
			keyframe,
			payload,
		}
	}

	pub fn audio(track_id: i32, dts: i64, duration: i64, payload: Bytes) -> Self {
		Self {
			track_id,
			media_type: MediaType::Audio,
			packet_type: PacketType::Audio,
			bitstream_format: BitstreamFormat::AacRaw,
			dts,
			pts: dts,
			duration,
			keyframe: true,
			payload,
		}
	}

	pub fn data(track_id: i32, packet_type: PacketType, pts: i64, payload: Bytes) -> Self {
		Self {
			track_id,
			media_type: MediaType::Data,
			packet_type,
			bitstream_format: BitstreamFormat::ID3v2,
			dts: pts,
			pts,
			duration: 0,
			keyframe: false,
			payload,
		}
	}
}
