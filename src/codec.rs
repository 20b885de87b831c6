use std::fmt;

use crate::{Error, Result};

/// The codec carried by a track, as signalled by the ingest side.
///
/// Only H264 and AAC survive packaging; everything else is recognized so it
/// can be excluded with a meaningful log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CodecId {
	H264,
	H265,
	VP9,
	AAC,
	Opus,
	ID3v2,
}

impl CodecId {
	/// Whether the packager can produce CMAF chunks for this codec.
	pub fn is_supported(&self) -> bool {
		matches!(self, CodecId::H264 | CodecId::AAC)
	}
}

impl fmt::Display for CodecId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			CodecId::H264 => write!(f, "h264"),
			CodecId::H265 => write!(f, "h265"),
			CodecId::VP9 => write!(f, "vp9"),
			CodecId::AAC => write!(f, "aac"),
			CodecId::Opus => write!(f, "opus"),
			CodecId::ID3v2 => write!(f, "id3v2"),
		}
	}
}

/// RFC 6381 parameters for H264, extracted from the avcC record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct H264 {
	pub profile: u8,
	pub constraints: u8,
	pub level: u8,
}

impl H264 {
	/// The profile/constraints/level triplet lives at bytes 1..4 of the
	/// AVCDecoderConfigurationRecord.
	pub fn from_avcc(extradata: &[u8]) -> Result<Self> {
		if extradata.len() < 4 {
			return Err(Error::MissingExtradata);
		}

		Ok(Self {
			profile: extradata[1],
			constraints: extradata[2],
			level: extradata[3],
		})
	}
}

impl fmt::Display for H264 {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "avc1.{:02x}{:02x}{:02x}", self.profile, self.constraints, self.level)
	}
}

/// RFC 6381 parameters for AAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AAC {
	pub profile: u8,
}

impl fmt::Display for AAC {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "mp4a.40.{}", self.profile)
	}
}

/// The 2-byte AudioSpecificConfig at the head of AAC extradata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioSpecificConfig {
	pub profile: u8,
	pub freq_index: u8,
	pub chan_conf: u8,
}

impl AudioSpecificConfig {
	pub fn parse(extradata: &[u8]) -> Result<Self> {
		if extradata.len() < 2 {
			return Err(Error::MissingExtradata);
		}

		Ok(Self {
			profile: (extradata[0] >> 3) & 0x1f,
			freq_index: ((extradata[0] & 0x07) << 1) | (extradata[1] >> 7),
			chan_conf: (extradata[1] >> 3) & 0x0f,
		})
	}

	/// The sampling-frequency-index table from ISO/IEC 14496-3.
	pub fn freq_index_for(sample_rate: u32) -> u8 {
		const RATES: [u32; 13] = [
			96000, 88200, 64000, 48000, 44100, 32000, 24000, 22050, 16000, 12000, 11025, 8000, 7350,
		];

		RATES
			.iter()
			.position(|&rate| rate == sample_rate)
			.unwrap_or(3) as u8
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_h264_codec_string() {
		// avcC for High@L3.1
		let avcc = [0x01, 0x64, 0x00, 0x1f, 0xff];
		let h264 = H264::from_avcc(&avcc).unwrap();
		assert_eq!(h264.to_string(), "avc1.64001f");
	}

	#[test]
	fn test_aac_codec_string() {
		assert_eq!(AAC { profile: 2 }.to_string(), "mp4a.40.2");
	}

	#[test]
	fn test_audio_specific_config() {
		// AAC-LC, 48 kHz, stereo
		let asc = AudioSpecificConfig::parse(&[0x11, 0x90]).unwrap();
		assert_eq!(asc.profile, 2);
		assert_eq!(asc.freq_index, 3);
		assert_eq!(asc.chan_conf, 2);
	}

	#[test]
	fn test_truncated_extradata() {
		assert!(H264::from_avcc(&[0x01]).is_err());
		assert!(AudioSpecificConfig::parse(&[0x11]).is_err());
	}
}
