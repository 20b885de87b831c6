use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{SecondsFormat, TimeZone, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::RwLock;

use crate::{MediaTrack, Result};

/// With delta updates, the newest segments are always rendered in full;
/// everything older is collapsed into `EXT-X-SKIP`.
const SKIP_KEEP_SEGMENTS: usize = 4;

/// One advertised artifact: either a full segment row or an `EXT-X-PART`.
#[derive(Debug, Clone)]
pub struct SegmentInfo {
	pub sequence: i64,
	/// Wall-clock epoch milliseconds of the first sample.
	pub start_time: i64,
	/// Seconds, as rendered into `EXTINF` / `DURATION`.
	pub duration: f64,
	pub size: usize,
	pub url: String,
	/// For parts: the name the next part will take, advertised as the
	/// preload hint.
	pub next_url: String,
	pub independent: bool,
}

#[derive(Debug)]
struct Entry {
	sequence: i64,
	info: Option<SegmentInfo>,
	parts: Vec<SegmentInfo>,
}

impl Entry {
	fn completed(&self) -> bool {
		self.info.is_some()
	}
}

#[derive(Debug)]
struct State {
	entries: VecDeque<Entry>,
	/// Completed entries pushed out of the window while a dump holds them.
	old_entries: VecDeque<Entry>,
	target_duration: f64,
	part_target: f64,
	part_hold_back: f64,
	save_old: bool,
	last_msn: i64,
	last_part: i64,
}

/// Mirrors one track's storage as an LL-HLS media playlist.
///
/// Appends come from the track's single writer; rendering takes a read
/// snapshot, so the text is always internally consistent.
pub struct Chunklist {
	url: String,
	track: Arc<MediaTrack>,
	max_segments: usize,
	init_segment_name: String,
	state: RwLock<State>,
}

impl Chunklist {
	pub fn new(
		url: &str,
		track: Arc<MediaTrack>,
		max_segments: usize,
		segment_duration: f64,
		chunk_duration: f64,
		init_segment_name: &str,
	) -> Self {
		Self {
			url: url.to_string(),
			track,
			max_segments,
			init_segment_name: init_segment_name.to_string(),
			state: RwLock::new(State {
				entries: VecDeque::new(),
				old_entries: VecDeque::new(),
				target_duration: segment_duration,
				part_target: chunk_duration,
				part_hold_back: 0.0,
				save_old: false,
				last_msn: -1,
				last_part: -1,
			}),
		}
	}

	pub fn url(&self) -> &str {
		&self.url
	}

	pub fn track(&self) -> &Arc<MediaTrack> {
		&self.track
	}

	/// Add an `EXT-X-PART` row under the open segment, creating the entry on
	/// the first part.
	pub fn append_partial_segment_info(&self, segment_number: i64, part: SegmentInfo) {
		let mut state = self.state.write();

		state.part_target = state.part_target.max(part.duration);
		state.last_msn = segment_number;
		state.last_part = part.sequence;

		let open = state
			.entries
			.back()
			.is_some_and(|entry| entry.sequence == segment_number);

		if open {
			if let Some(entry) = state.entries.back_mut() {
				entry.parts.push(part);
			}
		} else {
			state.entries.push_back(Entry {
				sequence: segment_number,
				info: None,
				parts: vec![part],
			});
		}
	}

	/// Close the open entry with its `EXTINF` row, evicting the window tail.
	pub fn append_segment_info(&self, info: SegmentInfo) {
		let mut state = self.state.write();

		state.target_duration = state.target_duration.max(info.duration);

		let open = state
			.entries
			.back()
			.is_some_and(|entry| entry.sequence == info.sequence);

		if open {
			if let Some(entry) = state.entries.back_mut() {
				entry.info = Some(info);
			}
		} else {
			let sequence = info.sequence;
			state.entries.push_back(Entry {
				sequence,
				info: Some(info),
				parts: Vec::new(),
			});
		}

		while state.entries.len() > self.max_segments {
			let evicted = state.entries.pop_front();
			if state.save_old {
				if let Some(entry) = evicted {
					state.old_entries.push_back(entry);
				}
			}
		}
	}

	/// Published once readiness flips; never changes afterwards.
	pub fn set_part_hold_back(&self, seconds: f64) {
		self.state.write().part_hold_back = seconds;
	}

	/// While set, evicted entries are kept aside so dump chunklists can still
	/// render them. Clearing drops the retained history.
	pub fn save_old_segment_info(&self, save: bool) {
		let mut state = self.state.write();
		state.save_old = save;
		if !save {
			state.old_entries.clear();
		}
	}

	/// Atomic `(msn, part)` snapshot of the newest advertised artifact.
	pub fn last_sequence_number(&self) -> (i64, i64) {
		let state = self.state.read();
		(state.last_msn, state.last_part)
	}

	pub fn media_sequence(&self) -> i64 {
		let state = self.state.read();
		state.entries.front().map(|e| e.sequence).unwrap_or(0)
	}

	pub fn to_string(
		&self,
		query: &str,
		chunklists: &HashMap<i32, Arc<Chunklist>>,
		skip: bool,
		legacy: bool,
		first_segment_number: Option<i64>,
	) -> String {
		let state = self.state.read();

		// Dump rendering replays retained history from the given segment on,
		// without the live-only tags.
		let dump = first_segment_number.is_some();
		let legacy = legacy || dump;
		let first = first_segment_number.unwrap_or(i64::MIN);

		let skippable = state.entries.len().saturating_sub(SKIP_KEEP_SEGMENTS);
		let skipped = if skip && !legacy { skippable } else { 0 };

		// Live rendering walks the window (minus the skipped head); dump
		// rendering replays retained history from the requested segment on.
		let rendered: Vec<&Entry> = if dump {
			state
				.old_entries
				.iter()
				.chain(state.entries.iter())
				.filter(|entry| entry.sequence >= first)
				.collect()
		} else {
			state.entries.iter().skip(skipped).collect()
		};

		let mut out = String::with_capacity(1024);
		out.push_str("#EXTM3U\n");
		out.push_str(if legacy {
			"#EXT-X-VERSION:6\n"
		} else {
			"#EXT-X-VERSION:9\n"
		});
		out.push_str(&format!(
			"#EXT-X-TARGETDURATION:{}\n",
			state.target_duration.ceil() as u64
		));

		if !legacy {
			out.push_str(&format!(
				"#EXT-X-SERVER-CONTROL:CAN-BLOCK-RELOAD=YES,PART-HOLD-BACK={:.3}",
				state.part_hold_back
			));
			if skippable > 0 {
				out.push_str(&format!(",CAN-SKIP-UNTIL={:.1}", state.target_duration * 6.0));
			}
			out.push('\n');
			out.push_str(&format!("#EXT-X-PART-INF:PART-TARGET={:.3}\n", state.part_target));
		}

		let media_sequence = if dump {
			rendered.first().map(|e| e.sequence).unwrap_or(0)
		} else {
			state.entries.front().map(|e| e.sequence).unwrap_or(0)
		};
		out.push_str(&format!("#EXT-X-MEDIA-SEQUENCE:{}\n", media_sequence));
		out.push_str(&format!(
			"#EXT-X-MAP:URI=\"{}\"\n",
			with_query(&self.init_segment_name, query)
		));

		if skipped > 0 {
			out.push_str(&format!("#EXT-X-SKIP:SKIPPED-SEGMENTS={}\n", skipped));
		}

		for (index, entry) in rendered.iter().enumerate() {
			if index == 0 {
				let start_time = entry
					.info
					.as_ref()
					.map(|info| info.start_time)
					.or_else(|| entry.parts.first().map(|part| part.start_time));

				if let Some(start_time) = start_time {
					if let Some(date_time) = Utc.timestamp_millis_opt(start_time).single() {
						out.push_str(&format!(
							"#EXT-X-PROGRAM-DATE-TIME:{}\n",
							date_time.to_rfc3339_opts(SecondsFormat::Millis, true)
						));
					}
				}
			}

			if !legacy && !entry.completed() {
				for part in &entry.parts {
					out.push_str(&format!(
						"#EXT-X-PART:DURATION={:.3},URI=\"{}\"",
						part.duration,
						with_query(&part.url, query)
					));
					if part.independent {
						out.push_str(",INDEPENDENT=YES");
					}
					out.push('\n');
				}

				if let Some(part) = entry.parts.last() {
					out.push_str(&format!(
						"#EXT-X-PRELOAD-HINT:TYPE=PART,URI=\"{}\"\n",
						with_query(&part.next_url, query)
					));
				}
			}

			if let Some(info) = &entry.info {
				out.push_str(&format!(
					"#EXTINF:{:.3},\n{}\n",
					info.duration,
					with_query(&info.url, query)
				));
			}
		}

		if !legacy {
			let mut siblings: Vec<_> = chunklists
				.iter()
				.filter(|(&track_id, _)| track_id != self.track.id)
				.collect();
			siblings.sort_by_key(|(&track_id, _)| track_id);

			for (_, sibling) in siblings {
				let (msn, part) = sibling.last_sequence_number();
				if msn < 0 {
					continue;
				}
				out.push_str(&format!(
					"#EXT-X-RENDITION-REPORT:URI=\"{}\",LAST-MSN={},LAST-PART={}\n",
					with_query(sibling.url(), query),
					msn,
					part.max(0)
				));
			}
		}

		out
	}

	pub fn to_gzip_data(
		&self,
		query: &str,
		chunklists: &HashMap<i32, Arc<Chunklist>>,
		skip: bool,
		legacy: bool,
		first_segment_number: Option<i64>,
	) -> Result<Bytes> {
		let text = self.to_string(query, chunklists, skip, legacy, first_segment_number);

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
