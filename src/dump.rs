use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;

use crate::Result;

/// One bound dump target: a durable mirror of this stream's artifacts.
///
/// Disabled dumps stay registered so their id remains reserved; only the
/// writes stop.
#[derive(Debug)]
pub struct Dump {
	id: String,
	output_path: PathBuf,
	playlists: Vec<String>,
	info_file_url: Option<String>,
	enabled: AtomicBool,

	/// Smallest segment number ever written per track; dump chunklists are
	/// rendered from here onward.
	first_segments: Mutex<HashMap<i32, i64>>,
}

impl Dump {
	pub fn new(id: &str, output_path: &Path, playlists: Vec<String>, info_file_url: Option<String>) -> Self {
		Self {
			id: id.to_string(),
			output_path: output_path.to_path_buf(),
			playlists,
			info_file_url,
			enabled: AtomicBool::new(true),
			first_segments: Mutex::new(HashMap::new()),
		}
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	pub fn output_path(&self) -> &Path {
		&self.output_path
	}

	pub fn playlists(&self) -> &[String] {
		&self.playlists
	}

	pub fn info_file_url(&self) -> Option<&str> {
		self.info_file_url.as_deref()
	}

	pub fn is_enabled(&self) -> bool {
		self.enabled.load(Ordering::Acquire)
	}

	pub fn set_enabled(&self, enabled: bool) {
		self.enabled.store(enabled, Ordering::Release);
	}

	/// Record the first dumped segment for a track; later calls keep the
	/// original value.
	pub fn mark_first_segment(&self, track_id: i32, segment_number: i64) {
		self.first_segments.lock().entry(track_id).or_insert(segment_number);
	}

	pub fn first_segment_number(&self, track_id: i32) -> Option<i64> {
		self.first_segments.lock().get(&track_id).copied()
	}

	/// Write one artifact under the output path. Writes go through a
	/// temporary name so readers of the target never observe a torn file.
	pub fn dump_data(&self, file_name: &str, data: &[u8]) -> Result<()> {
		std::fs::create_dir_all(&self.output_path)?;

		let target = self.output_path.join(file_name);
		let staging = self.output_path.join(format!("{}.tmp", file_name));

		std::fs::write(&staging, data)?;
		std::fs::rename(&staging, &target)?;

		tracing::debug!(dump = %self.id, file = %target.display(), size = data.len(), "dumped artifact");

		Ok(())
	}
}
