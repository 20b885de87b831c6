use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::{MediaTrack, StorageConfig};

/// One CMAF fragment, deliverable before its segment closes.
///
/// Published bytes are immutable; readers share the buffer by refcount.
#[derive(Debug, Clone)]
pub struct Chunk {
	pub segment_number: i64,
	pub chunk_number: i64,
	/// In the track's timebase.
	pub start_timestamp: i64,
	pub duration_ms: f64,
	pub independent: bool,
	pub data: Bytes,
}

impl Chunk {
	pub fn size(&self) -> usize {
		self.data.len()
	}
}

/// A closed media segment: the byte concatenation of its chunks.
#[derive(Debug, Clone)]
pub struct Segment {
	pub number: i64,
	pub start_timestamp: i64,
	pub duration_ms: f64,
	pub chunks: Vec<Arc<Chunk>>,
	pub data: Bytes,
}

impl Segment {
	pub fn size(&self) -> usize {
		self.data.len()
	}
}

/// The open segment being filled by the packager.
#[derive(Debug, Default)]
struct OpenSegment {
	number: i64,
	chunks: Vec<Arc<Chunk>>,
}

/// Owns the init section and the sliding window of segments for one track.
///
/// Single writer (the track's packager); readers take consistent snapshots
/// through the surrounding lock.
#[derive(Debug)]
pub struct Storage {
	track: Arc<MediaTrack>,
	max_segments: usize,

	init_section: Option<Bytes>,
	segments: VecDeque<Arc<Segment>>,
	current: Option<OpenSegment>,

	/// Number the next open segment will take.
	next_segment_number: i64,
	/// Most recently appended chunk, open segment included.
	last_chunk: (i64, i64),

	max_chunk_duration_ms: f64,
	min_chunk_duration_ms: f64,

	/// While set, the window does not evict; flipped by the dump manager.
	retain: bool,
}

impl Storage {
	pub fn new(track: Arc<MediaTrack>, config: StorageConfig) -> Self {
		Self {
			track,
			max_segments: config.max_segments,
			init_section: None,
			segments: VecDeque::with_capacity(config.max_segments + 1),
			current: None,
			next_segment_number: 0,
			last_chunk: (-1, -1),
			max_chunk_duration_ms: 0.0,
			min_chunk_duration_ms: f64::MAX,
			retain: false,
		}
	}

	pub fn track(&self) -> &Arc<MediaTrack> {
		&self.track
	}

	pub fn set_initialization_section(&mut self, data: Bytes) {
		self.init_section = Some(data);
	}

	pub fn initialization_section(&self) -> Option<Bytes> {
		self.init_section.clone()
	}

	/// Extend the open segment with a freshly written chunk and return its
	/// `(segment_number, chunk_number)` position.
	pub fn append_chunk(
		&mut self,
		data: Bytes,
		start_timestamp: i64,
		duration_ms: f64,
		independent: bool,
	) -> (i64, i64) {
		let current = self.current.get_or_insert_with(|| OpenSegment {
			number: self.next_segment_number,
			chunks: Vec::new(),
		});

		let chunk = Arc::new(Chunk {
			segment_number: current.number,
			chunk_number: current.chunks.len() as i64,
			start_timestamp,
			duration_ms,
			independent,
			data,
		});

		self.max_chunk_duration_ms = self.max_chunk_duration_ms.max(duration_ms);
		self.min_chunk_duration_ms = self.min_chunk_duration_ms.min(duration_ms);

		let position = (chunk.segment_number, chunk.chunk_number);
		current.chunks.push(chunk);
		self.last_chunk = position;

		position
	}

	/// Close the open segment, push it into the window and evict the oldest
	/// entries unless a dump is holding them.
	pub fn close_segment(&mut self) -> Option<Arc<Segment>> {
		let current = self.current.take()?;
		if current.chunks.is_empty() {
			return None;
		}

		let mut data = BytesMut::new();
		let mut duration_ms = 0.0;
		for chunk in &current.chunks {
			data.extend_from_slice(&chunk.data);
			duration_ms += chunk.duration_ms;
		}

		let segment = Arc::new(Segment {
			number: current.number,
			start_timestamp: current.chunks[0].start_timestamp,
			duration_ms,
			chunks: current.chunks,
			data: data.freeze(),
		});

		self.segments.push_back(segment.clone());
		self.next_segment_number = segment.number + 1;

		while self.segments.len() > self.max_segments && !self.retain {
			let evicted = self.segments.pop_front();
			tracing::debug!(
				track = self.track.id,
				segment = evicted.map(|s| s.number),
				"evicted segment"
			);
		}

		Some(segment)
	}

	pub fn media_segment(&self, segment_number: i64) -> Option<Arc<Segment>> {
		// Numbers are contiguous and eviction is FIFO, so the window is
		// indexable directly.
		let front = self.segments.front()?.number;
		let index = usize::try_from(segment_number.checked_sub(front)?).ok()?;
		self.segments.get(index).cloned()
	}

	pub fn media_chunk(&self, segment_number: i64, chunk_number: i64) -> Option<Arc<Chunk>> {
		if let Some(current) = &self.current {
			if current.number == segment_number {
				return current.chunks.get(chunk_number as usize).cloned();
			}
		}

		self.media_segment(segment_number)
			.and_then(|segment| segment.chunks.get(chunk_number as usize).cloned())
	}

	/// `(segment_number, chunk_number)` of the newest chunk, `(-1, -1)`
	/// before the first append.
	pub fn last_chunk_number(&self) -> (i64, i64) {
		self.last_chunk
	}

	/// Number of the newest closed segment, -1 before the first close.
	pub fn last_segment_number(&self) -> i64 {
		self.segments.back().map(|s| s.number).unwrap_or(-1)
	}

	pub fn segment_count(&self) -> usize {
		self.segments.len()
	}

	pub fn max_chunk_duration_ms(&self) -> f64 {
		self.max_chunk_duration_ms
	}

	pub fn min_chunk_duration_ms(&self) -> f64 {
		if self.min_chunk_duration_ms == f64::MAX {
			0.0
		} else {
			self.min_chunk_duration_ms
		}
	}

	/// While retention is on, eviction is suspended so dumps can still read
	/// old segments. Turning it off resumes eviction at the next close.
	pub fn set_retain(&mut self, retain: bool) {
		self.retain = retain;
	}
}
