use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::{MediaTrack, MediaType, Result};

/// A named pairing of at most one video and one audio track, advertised as
/// one `EXT-X-STREAM-INF` row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Rendition {
	pub name: String,
	#[serde(default)]
	pub video_track_name: Option<String>,
	#[serde(default)]
	pub audio_track_name: Option<String>,
}

/// A declared master playlist: its file name (without extension) and the
/// renditions it advertises.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Playlist {
	pub name: String,
	pub file_name: String,
	pub renditions: Vec<Rendition>,
}

#[derive(Debug)]
struct MediaEntry {
	group_id: String,
	track: Arc<MediaTrack>,
	chunklist_name: String,
}

#[derive(Debug)]
struct StreamEntry {
	video: Option<(Arc<MediaTrack>, String)>,
	audio: Option<(Arc<MediaTrack>, String)>,
}

/// The multivariant manifest. Contents depend only on the declared rendition
/// set and immutable track metadata, so it is rendered once and cached.
#[derive(Debug, Default)]
pub struct MasterPlaylist {
	chunk_path: String,
	media: Vec<MediaEntry>,
	streams: Vec<StreamEntry>,
}

impl MasterPlaylist {
	pub fn new() -> Self {
		Self::default()
	}

	/// Directory prefix applied to chunklist URIs, derived from the
	/// configured chunklist path depth.
	pub fn set_chunk_path(&mut self, chunk_path: &str) {
		self.chunk_path = chunk_path.to_string();
	}

	pub fn add_media_candidate(&mut self, group_id: &str, track: Arc<MediaTrack>, chunklist_name: &str) {
		self.media.push(MediaEntry {
			group_id: group_id.to_string(),
			track,
			chunklist_name: chunklist_name.to_string(),
		});
	}

	pub fn add_stream_inf(
		&mut self,
		video: Option<(Arc<MediaTrack>, String)>,
		audio: Option<(Arc<MediaTrack>, String)>,
	) {
		self.streams.push(StreamEntry { video, audio });
	}

	pub fn to_string(&self, query: &str, legacy: bool, include_path: bool) -> String {
		// Old players get pointed at the non-LL rendering of the same
		// chunklists.
		let query = if legacy {
			if query.is_empty() {
				"_HLS_legacy=YES".to_string()
			} else {
				format!("{}&_HLS_legacy=YES", query)
			}
		} else {
			query.to_string()
		};

		let path = if include_path { self.chunk_path.as_str() } else { "" };

		let mut out = String::with_capacity(512);
		out.push_str("#EXTM3U\n");
		out.push_str("#EXT-X-VERSION:7\n");

		for entry in self.media.iter().filter(|e| e.track.media_type == MediaType::Audio) {
			out.push_str(&format!(
				"#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"{}\",NAME=\"{}\",DEFAULT=YES,AUTOSELECT=YES,CHANNELS=\"{}\",URI=\"{}{}\"\n",
				entry.group_id,
				entry.track.name,
				entry.track.channel_count,
				path,
				with_query(&entry.chunklist_name, &query),
			));
		}

		for stream in &self.streams {
			let mut attributes = Vec::new();

			let bandwidth = stream.video.as_ref().map(|(t, _)| t.bitrate).unwrap_or(0)
				+ stream.audio.as_ref().map(|(t, _)| t.bitrate).unwrap_or(0);
			attributes.push(format!("BANDWIDTH={}", bandwidth));

			let codecs: Vec<String> = stream
				.video
				.iter()
				.chain(stream.audio.iter())
				.filter_map(|(track, _)| track.codec_string())
				.collect();
			if !codecs.is_empty() {
				attributes.push(format!("CODECS=\"{}\"", codecs.join(",")));
			}

			if let Some((track, _)) = &stream.video {
				if let Some(resolution) = track.resolution {
					attributes.push(format!("RESOLUTION={}x{}", resolution.width, resolution.height));
				}
				if track.framerate > 0.0 {
					attributes.push(format!("FRAME-RATE={:.3}", track.framerate));
				}
			}

			if let Some((track, _)) = &stream.audio {
				if stream.video.is_some() {
					attributes.push(format!("AUDIO=\"{}\"", track.id));
				}
			}

			// The variant URI points at the video chunklist, or the audio
			// one for audio-only renditions.
			let uri = stream
				.video
				.as_ref()
				.or(stream.audio.as_ref())
				.map(|(_, chunklist)| chunklist.as_str())
				.unwrap_or("");

			out.push_str(&format!("#EXT-X-STREAM-INF:{}\n", attributes.join(",")));
			out.push_str(&format!("{}{}\n", path, with_query(uri, &query)));
		}

		out
	}

	pub fn to_gzip_data(&self, query: &str, legacy: bool, include_path: bool) -> Result<Bytes> {
		let text = self.to_string(query, legacy, include_path);

		let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
		encoder.write_all(text.as_bytes())?;

		Ok(Bytes::from(encoder.finish()?))
	}
}

fn with_query(url: &str, query: &str) -> String {
	if query.is_empty() {
		url.to_string()
	} else {
		format!("{}?{}", url, query)
	}
}
