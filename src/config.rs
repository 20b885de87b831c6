use serde::{Deserialize, Serialize};

/// Per-track packaging knobs.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct PackagerConfig {
	/// Target CMAF chunk length, one `EXT-X-PART` each.
	pub chunk_duration_ms: u64,
	/// Target media segment length, one `EXTINF` each.
	pub segment_duration_ms: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StorageConfig {
	/// Sliding window of closed segments kept per track.
	pub max_segments: usize,
	pub segment_duration_ms: u64,
}

/// Stream-level configuration recognized by the core.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
	pub chunk_duration_ms: u64,
	pub segment_duration_ms: u64,
	pub max_segments: usize,

	/// Lower bound for `PART-HOLD-BACK` in seconds; the published value is
	/// never less than three times the longest chunk.
	pub part_hold_back: f64,

	/// How chunklist URIs are formed in the master playlist:
	/// 0 = same directory, 1 = `../<stream>/`, 2 = `../../<app>/<stream>/`,
	/// -1 = absolute `/<app>/<stream>/`.
	pub chunklist_path_depth: i32,

	pub dumps: Vec<DumpConfig>,
}

impl Default for StreamConfig {
	fn default() -> Self {
		Self {
			chunk_duration_ms: 500,
			segment_duration_ms: 6000,
			max_segments: 10,
			part_hold_back: 0.0,
			chunklist_path_depth: 0,
			dumps: Vec::new(),
		}
	}
}

impl StreamConfig {
	pub fn packager(&self) -> PackagerConfig {
		PackagerConfig {
			chunk_duration_ms: self.chunk_duration_ms,
			segment_duration_ms: self.segment_duration_ms,
		}
	}

	pub fn storage(&self) -> StorageConfig {
		StorageConfig {
			max_segments: self.max_segments,
			segment_duration_ms: self.segment_duration_ms,
		}
	}
}

/// A declared dump target, bound to a stream when the stream name matches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DumpConfig {
	pub id: String,

	/// Regex matched against the stream name.
	pub target_stream_name: String,

	/// Output directory; `${VHostName}`, `${AppName}` and `${StreamName}`
	/// are substituted at bind time.
	pub output_path: String,

	/// Master playlist file names mirrored alongside the segments.
	pub playlists: Vec<String>,

	pub enabled: bool,

	/// Unique handle for dumps issued at runtime; duplicates are refused.
	#[serde(default)]
	pub info_file_url: Option<String>,
}
