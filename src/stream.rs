use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use regex::Regex;
use tokio::sync::broadcast;

use crate::{
	Chunklist, Dump, DumpConfig, Error, MasterPlaylist, MediaPacket, MediaTrack, MediaType, PacketType, Packager,
	PackagerEvent, Playlist, Rendition, Result, SegmentInfo, Storage, StreamConfig,
};

/// Packets buffered before the stream starts; beyond this the oldest drop.
const MAX_INITIAL_MEDIA_PACKET_BUFFER_SIZE: usize = 2000;

const DEFAULT_PLAYLIST_FILE_NAME: &str = "llhls";
const DEFAULT_PLAYLIST_NAME: &str = "llhls.m3u8";

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
	Created,
	Started,
	Stopped,
}

/// Outcome of an artifact retrieval. `Accepted` means the artifact does not
/// exist *yet*: the HTTP layer should hold the request and retry after a
/// `PlaylistUpdated` event, or answer 503 on its own timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestResult {
	Success,
	Accepted,
	NotFound,
}

/// Broadcast on every chunk append; the only wakeup source for blocked
/// reload waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlaylistUpdated {
	pub track_id: i32,
	pub msn: i64,
	pub part: i64,
}

#[derive(Debug)]
struct Readiness {
	ready: bool,
	max_chunk_duration_ms: f64,
	min_chunk_duration_ms: f64,
}

/// The per-stream controller: wires packagers, storage, chunklists and
/// master playlists together and serves the artifact-retrieval API.
///
/// Sample ingress is serialized per track by the caller; retrieval may come
/// from any number of reader threads concurrently.
pub struct Stream {
	vhost_name: String,
	app_name: String,
	name: String,
	config: StreamConfig,

	/// Random per-run key mixed into artifact names, so a restarted stream
	/// never collides with cached artifacts of the previous run.
	stream_key: String,
	created_at_ms: i64,

	tracks: BTreeMap<i32, Arc<MediaTrack>>,
	declared_playlists: Vec<Playlist>,

	state: RwLock<State>,
	storages: RwLock<HashMap<i32, Arc<RwLock<Storage>>>>,
	packagers: RwLock<HashMap<i32, Arc<Mutex<Packager>>>>,
	chunklists: RwLock<HashMap<i32, Arc<Chunklist>>>,
	masters: Mutex<HashMap<String, Arc<MasterPlaylist>>>,
	dumps: RwLock<BTreeMap<String, Arc<Dump>>>,

	readiness: RwLock<Readiness>,
	preroll: Mutex<VecDeque<MediaPacket>>,
	events: broadcast::Sender<PlaylistUpdated>,
}

impl Stream {
	pub fn new(
		vhost_name: &str,
		app_name: &str,
		name: &str,
		tracks: Vec<MediaTrack>,
		playlists: Vec<Playlist>,
		config: StreamConfig,
	) -> Self {
		let stream_key: String = rand::thread_rng()
			.sample_iter(&Alphanumeric)
			.take(8)
			.map(char::from)
			.collect();

		let created_at_ms = std::time::SystemTime::now()
			.duration_since(std::time::UNIX_EPOCH)
			.map(|d| d.as_millis() as i64)
			.unwrap_or(0);

		let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

		Self {
			vhost_name: vhost_name.to_string(),
			app_name: app_name.to_string(),
			name: name.to_string(),
			config,
			stream_key,
			created_at_ms,
			tracks: tracks.into_iter().map(|t| (t.id, Arc::new(t))).collect(),
			declared_playlists: playlists,
			state: RwLock::new(State::Created),
			storages: RwLock::new(HashMap::new()),
			packagers: RwLock::new(HashMap::new()),
			chunklists: RwLock::new(HashMap::new()),
			masters: Mutex::new(HashMap::new()),
			dumps: RwLock::new(BTreeMap::new()),
			readiness: RwLock::new(Readiness {
				ready: false,
				max_chunk_duration_ms: 0.0,
				min_chunk_duration_ms: f64::MAX,
			}),
			preroll: Mutex::new(VecDeque::new()),
			events,
		}
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn state(&self) -> State {
		*self.state.read()
	}

	pub fn stream_key(&self) -> &str {
		&self.stream_key
	}

	/// Create packagers, storages and chunklists for every supported track,
	/// install the default playlist and bind matching configured dumps.
	pub fn start(&self) -> Result<()> {
		if self.state() != State::Created {
			return Err(Error::InvalidState);
		}

		let mut first_video: Option<Arc<MediaTrack>> = None;
		let mut first_audio: Option<Arc<MediaTrack>> = None;

		for track in self.tracks.values() {
			if track.media_type == MediaType::Data {
				continue;
			}

			if !track.is_supported() {
				tracing::info!(
					stream = %self.name,
					track = track.id,
					codec = %track.codec_id,
					"ignoring unsupported codec"
				);
				continue;
			}

			if let Err(err) = self.add_packager(track) {
				tracing::error!(stream = %self.name, track = track.id, %err, "failed to add packager");
				continue;
			}

			match track.media_type {
				MediaType::Video if first_video.is_none() => first_video = Some(track.clone()),
				MediaType::Audio if first_audio.is_none() => first_audio = Some(track.clone()),
				_ => {}
			}
		}

		if first_video.is_none() && first_audio.is_none() {
			tracing::warn!(stream = %self.name, "no supported codec, refusing to start");
			return Err(Error::NoSupportedTrack);
		}

		// The default playlist pairs the first supported video and audio
		// tracks, unless the caller declared one under the same name.
		let declared_default = self
			.declared_playlists
			.iter()
			.any(|p| p.file_name == DEFAULT_PLAYLIST_FILE_NAME);
		if !declared_default {
			let playlist = Playlist {
				name: "default".to_string(),
				file_name: DEFAULT_PLAYLIST_FILE_NAME.to_string(),
				renditions: vec![Rendition {
					name: "default".to_string(),
					video_track_name: first_video.map(|t| t.name.clone()),
					audio_track_name: first_audio.map(|t| t.name.clone()),
				}],
			};

			let master = self.create_master_playlist(&playlist);
			self.masters.lock().insert(DEFAULT_PLAYLIST_NAME.to_string(), Arc::new(master));
		}

		// Bind every enabled configured dump whose target matches this
		// stream name.
		let mut dumps = self.dumps.write();
		for dump in &self.config.dumps {
			if !dump.enabled {
				continue;
			}

			let matched = Regex::new(&dump.target_stream_name)
				.map(|regex| regex.is_match(&self.name))
				.unwrap_or(false);
			if !matched {
				continue;
			}

			let output_path = self.resolve_output_path(&dump.output_path);
			dumps.insert(
				dump.id.clone(),
				Arc::new(Dump::new(&dump.id, &output_path, dump.playlists.clone(), dump.info_file_url.clone())),
			);
		}
		drop(dumps);

		*self.state.write() = State::Started;

		tracing::info!(
			stream = %self.name,
			chunk_ms = self.config.chunk_duration_ms,
			segment_ms = self.config.segment_duration_ms,
			segments = self.config.max_segments,
			"stream started"
		);

		Ok(())
	}

	/// Release all per-track state. In-flight readers holding segment
	/// handles keep valid bytes; new lookups return `NotFound`.
	pub fn stop(&self) {
		self.packagers.write().clear();
		self.storages.write().clear();
		self.chunklists.write().clear();

		*self.state.write() = State::Stopped;

		tracing::debug!(stream = %self.name, "stream stopped");
	}

	fn add_packager(&self, track: &Arc<MediaTrack>) -> Result<()> {
		let storage = Arc::new(RwLock::new(Storage::new(track.clone(), self.config.storage())));
		let mut packager = Packager::new(storage.clone(), track.clone(), self.config.packager());

		packager.create_initialization_segment()?;

		self.storages.write().insert(track.id, storage);
		self.packagers.write().insert(track.id, Arc::new(Mutex::new(packager)));

		let chunklist = Chunklist::new(
			&self.chunklist_name(track.id),
			track.clone(),
			self.config.max_segments,
			self.config.segment_duration_ms as f64 / 1000.0,
			self.config.chunk_duration_ms as f64 / 1000.0,
			&self.init_segment_name(track.id),
		);
		self.chunklists.write().insert(track.id, Arc::new(chunklist));

		Ok(())
	}

	// ------------------------------------------------------------------
	// Sample ingress
	// ------------------------------------------------------------------

	pub fn send_video_frame(&self, packet: MediaPacket) -> Result<()> {
		self.send_media_frame(packet)
	}

	pub fn send_audio_frame(&self, packet: MediaPacket) -> Result<()> {
		self.send_media_frame(packet)
	}

	fn send_media_frame(&self, packet: MediaPacket) -> Result<()> {
		match self.state() {
			State::Created => {
				self.buffer_media_packet(packet);
				return Ok(());
			}
			State::Stopped => return Err(Error::InvalidState),
			State::Started => {}
		}

		self.send_buffered_packets()?;
		self.append_media_packet(packet)
	}

	pub fn send_data_frame(&self, packet: MediaPacket) -> Result<()> {
		if packet.bitstream_format != crate::BitstreamFormat::ID3v2 {
			// Not supported
			return Ok(());
		}

		match self.state() {
			State::Created => {
				self.buffer_media_packet(packet);
				return Ok(());
			}
			State::Stopped => return Err(Error::InvalidState),
			State::Started => {}
		}

		self.send_buffered_packets()?;
		self.reserve_data_packet(packet);
		Ok(())
	}

	fn buffer_media_packet(&self, packet: MediaPacket) {
		let mut preroll = self.preroll.lock();
		if preroll.len() >= MAX_INITIAL_MEDIA_PACKET_BUFFER_SIZE {
			// Drop the oldest packet, for OOM protection
			preroll.pop_front();
		}
		preroll.push_back(packet);
	}

	fn send_buffered_packets(&self) -> Result<()> {
		loop {
			let packet = match self.preroll.lock().pop_front() {
				Some(packet) => packet,
				None => return Ok(()),
			};

			if packet.media_type == MediaType::Data {
				self.reserve_data_packet(packet);
			} else {
				self.append_media_packet(packet)?;
			}
		}
	}

	fn append_media_packet(&self, packet: MediaPacket) -> Result<()> {
		let track = self.tracks.get(&packet.track_id).ok_or(Error::UnknownTrack)?;
		if !track.is_supported() {
			return Ok(());
		}

		let packager = match self.packagers.read().get(&packet.track_id).cloned() {
			Some(packager) => packager,
			None => {
				tracing::warn!(stream = %self.name, track = packet.track_id, "no packager for track");
				return Ok(());
			}
		};

		let events = match packager.lock().append_sample(packet) {
			Ok(events) => events,
			Err(err) => {
				tracing::error!(stream = %self.name, %err, "packager rejected sample");
				return Err(err);
			}
		};

		let track_id = track.id;
		for event in events {
			match event {
				PackagerEvent::ChunkUpdated {
					segment_number,
					chunk_number,
				} => self.on_media_chunk_updated(track_id, segment_number, chunk_number),
				PackagerEvent::SegmentUpdated { segment_number } => {
					self.on_media_segment_updated(track_id, segment_number)
				}
			}
		}

		Ok(())
	}

	fn reserve_data_packet(&self, packet: MediaPacket) {
		let target = match packet.packet_type {
			PacketType::VideoEvent => MediaType::Video,
			_ => MediaType::Audio,
		};

		let packagers = self.packagers.read();
		for track in self.tracks.values().filter(|t| t.media_type == target) {
			if let Some(packager) = packagers.get(&track.id) {
				packager.lock().reserve_data_packet(packet.clone());
			}
		}
	}

	// ------------------------------------------------------------------
	// Storage event handling
	// ------------------------------------------------------------------

	fn on_media_segment_updated(&self, track_id: i32, segment_number: i64) {
		// Check whether at least one segment of every track has been created.
		self.check_playlist_ready();

		let chunklist = match self.chunklist(track_id) {
			Some(chunklist) => chunklist,
			None => {
				tracing::error!(track = track_id, "chunklist is not found");
				return;
			}
		};

		let segment = self
			.storage(track_id)
			.and_then(|storage| storage.read().media_segment(segment_number));
		let segment = match segment {
			Some(segment) => segment,
			None => {
				tracing::error!(track = track_id, segment = segment_number, "segment is not found");
				return;
			}
		};

		let info = SegmentInfo {
			sequence: segment.number,
			start_time: self.epoch_ms(track_id, segment.start_timestamp),
			duration: segment.duration_ms / 1000.0,
			size: segment.size(),
			url: self.segment_name(track_id, segment.number),
			next_url: String::new(),
			independent: true,
		};

		chunklist.append_segment_info(info);

		tracing::debug!(
			stream = %self.name,
			track = track_id,
			segment = segment_number,
			duration_ms = segment.duration_ms,
			"media segment updated"
		);

		self.dump_segment_of_all_items(track_id, segment_number);
	}

	fn on_media_chunk_updated(&self, track_id: i32, segment_number: i64, chunk_number: i64) {
		let chunklist = match self.chunklist(track_id) {
			Some(chunklist) => chunklist,
			None => {
				tracing::error!(track = track_id, "chunklist is not found");
				return;
			}
		};

		let chunk = self
			.storage(track_id)
			.and_then(|storage| storage.read().media_chunk(segment_number, chunk_number));
		let chunk = match chunk {
			Some(chunk) => chunk,
			None => {
				tracing::error!(track = track_id, segment = segment_number, chunk = chunk_number, "chunk is not found");
				return;
			}
		};

		let info = SegmentInfo {
			sequence: chunk.chunk_number,
			start_time: self.epoch_ms(track_id, chunk.start_timestamp),
			duration: chunk.duration_ms / 1000.0,
			size: chunk.size(),
			url: self.partial_segment_name(track_id, segment_number, chunk.chunk_number),
			next_url: self.partial_segment_name(track_id, segment_number, chunk.chunk_number + 1),
			independent: chunk.independent,
		};

		chunklist.append_partial_segment_info(segment_number, info);

		// Wake any blocked reload waiters.
		let _ = self.events.send(PlaylistUpdated {
			track_id,
			msn: segment_number,
			part: chunk_number,
		});
	}

	/// Flips readiness the first time every storage holds a closed segment.
	/// On the transition, publishes `PART-HOLD-BACK` and back-fills dumps.
	fn check_playlist_ready(&self) -> bool {
		let mut readiness = self.readiness.write();
		if readiness.ready {
			return true;
		}

		{
			let storages = self.storages.read();
			for storage in storages.values() {
				let storage = storage.read();
				// At least one segment must be created.
				if storage.last_segment_number() < 0 {
					return false;
				}

				readiness.max_chunk_duration_ms = readiness.max_chunk_duration_ms.max(storage.max_chunk_duration_ms());
				readiness.min_chunk_duration_ms = readiness.min_chunk_duration_ms.min(storage.min_chunk_duration_ms());
			}
		}

		let min_part_hold_back = (readiness.max_chunk_duration_ms / 1000.0) * 3.0;
		let part_hold_back = min_part_hold_back.max(self.config.part_hold_back);

		// Publish the hold-back before readers are let through the gate.
		let track_ids: Vec<i32> = {
			let chunklists = self.chunklists.read();
			for chunklist in chunklists.values() {
				chunklist.set_part_hold_back(part_hold_back);
			}
			chunklists.keys().copied().collect()
		};

		readiness.ready = true;
		drop(readiness);

		for track_id in track_ids {
			self.dump_init_segment_of_all_items(track_id);
		}
		self.dump_master_playlists_of_all_items();

		tracing::info!(stream = %self.name, part_hold_back, "playlist ready");

		true
	}

	pub fn is_ready_to_play(&self) -> bool {
		self.readiness.read().ready
	}

	pub fn max_chunk_duration_ms(&self) -> f64 {
		self.readiness.read().max_chunk_duration_ms
	}

	/// Event stream for the HTTP layer's long-poll waiters.
	pub fn subscribe(&self) -> broadcast::Receiver<PlaylistUpdated> {
		self.events.subscribe()
	}

	// ------------------------------------------------------------------
	// Artifact retrieval
	// ------------------------------------------------------------------

	pub fn get_master_playlist(
		&self,
		file_name: &str,
		chunk_query_string: &str,
		gzip: bool,
		legacy: bool,
		include_path: bool,
	) -> (RequestResult, Option<Bytes>) {
		if self.state() != State::Started {
			return (RequestResult::NotFound, None);
		}

		if !self.is_ready_to_play() {
			return (RequestResult::Accepted, None);
		}

		let master = {
			let mut masters = self.masters.lock();
			match masters.get(file_name) {
				Some(master) => master.clone(),
				None => {
					let base_name = file_name.strip_suffix(".m3u8").unwrap_or(file_name);
					let playlist = self.declared_playlists.iter().find(|p| p.file_name == base_name);
					match playlist {
						Some(playlist) => {
							let master = Arc::new(self.create_master_playlist(playlist));
							masters.insert(file_name.to_string(), master.clone());
							master
						}
						None => return (RequestResult::NotFound, None),
					}
				}
			}
		};

		if gzip {
			match master.to_gzip_data(chunk_query_string, legacy, include_path) {
				Ok(data) => (RequestResult::Success, Some(data)),
				Err(err) => {
					tracing::error!(%err, "failed to gzip master playlist");
					(RequestResult::NotFound, None)
				}
			}
		} else {
			let text = master.to_string(chunk_query_string, legacy, include_path);
			(RequestResult::Success, Some(Bytes::from(text)))
		}
	}

	pub fn get_chunklist(
		&self,
		query_string: &str,
		track_id: i32,
		msn: i64,
		psn: i64,
		skip: bool,
		gzip: bool,
		legacy: bool,
	) -> (RequestResult, Option<Bytes>) {
		let chunklist = match self.chunklist(track_id) {
			Some(chunklist) => chunklist,
			None => return (RequestResult::NotFound, None),
		};

		if !self.is_ready_to_play() {
			return (RequestResult::Accepted, None);
		}

		if msn >= 0 && psn >= 0 {
			let (last_msn, last_psn) = chunklist.last_sequence_number();

			if msn > last_msn || (msn >= last_msn && psn > last_psn) {
				// Hold the request until the playlist advertises the
				// requested sequence number.
				return (RequestResult::Accepted, None);
			}
		}

		// Rendering happens under the map's read lock, so a concurrent
		// `Stop` cannot clear the chunklists out from underneath it.
		let chunklists = self.chunklists.read();

		if gzip {
			match chunklist.to_gzip_data(query_string, &chunklists, skip, legacy, None) {
				Ok(data) => (RequestResult::Success, Some(data)),
				Err(err) => {
					tracing::error!(%err, "failed to gzip chunklist");
					(RequestResult::NotFound, None)
				}
			}
		} else {
			let text = chunklist.to_string(query_string, &chunklists, skip, legacy, None);
			(RequestResult::Success, Some(Bytes::from(text)))
		}
	}

	pub fn get_initialization_segment(&self, track_id: i32) -> (RequestResult, Option<Bytes>) {
		let storage = match self.storage(track_id) {
			Some(storage) => storage,
			None => return (RequestResult::NotFound, None),
		};

		let result = match storage.read().initialization_section() {
			Some(data) => (RequestResult::Success, Some(data)),
			None => (RequestResult::NotFound, None),
		};
		result
	}

	pub fn get_segment(&self, track_id: i32, segment_number: i64) -> (RequestResult, Option<Bytes>) {
		let storage = match self.storage(track_id) {
			Some(storage) => storage,
			None => return (RequestResult::NotFound, None),
		};

		let segment = storage.read().media_segment(segment_number);
		match segment {
			Some(segment) => (RequestResult::Success, Some(segment.data.clone())),
			None => (RequestResult::NotFound, None),
		}
	}

	pub fn get_chunk(&self, track_id: i32, segment_number: i64, chunk_number: i64) -> (RequestResult, Option<Bytes>) {
		let storage = match self.storage(track_id) {
			Some(storage) => storage,
			None => return (RequestResult::NotFound, None),
		};

		let storage = storage.read();
		let (last_segment, last_chunk) = storage.last_chunk_number();

		if segment_number == last_segment && chunk_number > last_chunk {
			// The preload hint points here; hold until the chunk lands.
			return (RequestResult::Accepted, None);
		} else if segment_number > last_segment {
			return (RequestResult::NotFound, None);
		}

		match storage.media_chunk(segment_number, chunk_number) {
			Some(chunk) => (RequestResult::Success, Some(chunk.data.clone())),
			None => (RequestResult::NotFound, None),
		}
	}

	// ------------------------------------------------------------------
	// Master playlists
	// ------------------------------------------------------------------

	fn create_master_playlist(&self, playlist: &Playlist) -> MasterPlaylist {
		let mut master = MasterPlaylist::new();

		let chunk_path = match self.config.chunklist_path_depth {
			0 => String::new(),
			1 => format!("../{}/", self.name),
			2 => format!("../../{}/{}/", self.app_name, self.name),
			_ => format!("/{}/{}/", self.app_name, self.name),
		};
		master.set_chunk_path(&chunk_path);

		// Every supported track is a media candidate; grouping is by track
		// id until real track groups exist.
		for track in self.tracks.values().filter(|t| t.is_supported()) {
			master.add_media_candidate(&track.id.to_string(), track.clone(), &self.chunklist_name(track.id));
		}

		for rendition in &playlist.renditions {
			let video = rendition
				.video_track_name
				.as_deref()
				.and_then(|name| self.track_by_name(name));
			let audio = rendition
				.audio_track_name
				.as_deref()
				.and_then(|name| self.track_by_name(name));

			let unsupported = video.as_ref().map(|t| !t.is_supported()).unwrap_or(false)
				|| audio.as_ref().map(|t| !t.is_supported()).unwrap_or(false);
			if unsupported {
				tracing::warn!(
					stream = %self.name,
					rendition = %rendition.name,
					playlist = %playlist.file_name,
					"excluding rendition with unsupported codec"
				);
				continue;
			}

			if video.is_none() && audio.is_none() {
				continue;
			}

			master.add_stream_inf(
				video.map(|track| {
					let chunklist = self.chunklist_name(track.id);
					(track, chunklist)
				}),
				audio.map(|track| {
					let chunklist = self.chunklist_name(track.id);
					(track, chunklist)
				}),
			);
		}

		master
	}

	// ------------------------------------------------------------------
	// Dumps
	// ------------------------------------------------------------------

	/// Register a dump at runtime. After readiness this back-fills the init
	/// sections, the newest common segment and the master playlists.
	pub fn start_dump(&self, config: &DumpConfig) -> Result<()> {
		let mut dumps = self.dumps.write();

		for existing in dumps.values() {
			if existing.id() == config.id {
				return Err(Error::DuplicateDump);
			}

			if let (Some(existing_url), Some(new_url)) = (existing.info_file_url(), config.info_file_url.as_deref()) {
				if existing_url == new_url {
					return Err(Error::DuplicateInfoFile);
				}
			}
		}

		if !Regex::new(&config.target_stream_name)?.is_match(&self.name) {
			return Err(Error::DumpTargetMismatch);
		}

		let output_path = self.resolve_output_path(&config.output_path);
		let dump = Arc::new(Dump::new(
			&config.id,
			&output_path,
			config.playlists.clone(),
			config.info_file_url.clone(),
		));

		if !self.is_ready_to_play() {
			// Readiness will back-fill this dump along with the others.
			dumps.insert(dump.id().to_string(), dump);
			return Ok(());
		}

		let min_segment_number = self.minimum_last_segment_number();

		tracing::debug!(
			stream = %self.name,
			dump = %config.id,
			segment = min_segment_number,
			"starting dump"
		);

		let track_ids: Vec<i32> = self.storages.read().keys().copied().collect();
		for track_id in track_ids {
			self.dump_init_segment(&dump, track_id)?;
			self.dump_segment(&dump, track_id, min_segment_number)?;
		}

		if let Err(err) = self.dump_master_playlist(&dump) {
			self.stop_to_save_old_segments_info(&dumps);
			return Err(err);
		}

		dumps.insert(dump.id().to_string(), dump);

		Ok(())
	}

	/// Disable one dump by id, or every dump when `id` is `None`.
	pub fn stop_dump(&self, id: Option<&str>) -> Result<()> {
		let dumps = self.dumps.read();

		match id {
			Some(id) => {
				let dump = dumps.get(id).ok_or(Error::DumpNotFound)?;
				dump.set_enabled(false);
			}
			None => {
				for dump in dumps.values() {
					dump.set_enabled(false);
				}
			}
		}

		self.stop_to_save_old_segments_info(&dumps);

		Ok(())
	}

	pub fn dump_info(&self, id: &str) -> Option<Arc<Dump>> {
		self.dumps.read().get(id).cloned()
	}

	pub fn dump_info_list(&self) -> Vec<Arc<Dump>> {
		self.dumps.read().values().cloned().collect()
	}

	/// Once the last dump is disabled, retained history is released and the
	/// sliding windows resume eviction.
	fn stop_to_save_old_segments_info(&self, dumps: &BTreeMap<String, Arc<Dump>>) {
		if dumps.values().any(|dump| dump.is_enabled()) {
			return;
		}

		for chunklist in self.chunklists.read().values() {
			chunklist.save_old_segment_info(false);
		}
		for storage in self.storages.read().values() {
			storage.write().set_retain(false);
		}
	}

	fn dump_init_segment_of_all_items(&self, track_id: i32) {
		let dumps: Vec<Arc<Dump>> = self.dumps.read().values().cloned().collect();
		for dump in dumps {
			if !dump.is_enabled() {
				continue;
			}

			if let Err(err) = self.dump_init_segment(&dump, track_id) {
				tracing::warn!(dump = dump.id(), %err, "could not dump init segment, disabling");
				dump.set_enabled(false);
			}
		}
	}

	fn dump_init_segment(&self, dump: &Arc<Dump>, track_id: i32) -> Result<()> {
		if !dump.is_enabled() {
			return Err(Error::DumpDisabled);
		}

		let (result, data) = self.get_initialization_segment(track_id);
		let data = match (result, data) {
			(RequestResult::Success, Some(data)) => data,
			_ => return Err(Error::NotAvailable),
		};

		dump.dump_data(&self.init_segment_name(track_id), &data)
	}

	fn dump_segment_of_all_items(&self, track_id: i32, segment_number: i64) {
		let dumps: Vec<Arc<Dump>> = self.dumps.read().values().cloned().collect();
		for dump in dumps {
			if !dump.is_enabled() {
				continue;
			}

			if let Err(err) = self.dump_segment(&dump, track_id, segment_number) {
				tracing::warn!(dump = dump.id(), %err, "could not dump segment, disabling");
				dump.set_enabled(false);
			}
		}
	}

	fn dump_segment(&self, dump: &Arc<Dump>, track_id: i32, segment_number: i64) -> Result<()> {
		if !dump.is_enabled() {
			return Err(Error::DumpDisabled);
		}

		dump.mark_first_segment(track_id, segment_number);

		let segment = self
			.storage(track_id)
			.and_then(|storage| storage.read().media_segment(segment_number))
			.ok_or(Error::NotAvailable)?;

		let chunklist = self.chunklist(track_id).ok_or(Error::NotAvailable)?;

		// The dump's chunklist replays everything from its first segment.
		let chunklist_data = {
			let chunklists = self.chunklists.read();
			chunklist.to_string("", &chunklists, false, true, dump.first_segment_number(track_id))
		};

		dump.dump_data(&self.segment_name(track_id, segment_number), &segment.data)?;
		dump.dump_data(&self.chunklist_name(track_id), chunklist_data.as_bytes())?;

		// From now on the window must not drop what the dump already
		// advertised.
		chunklist.save_old_segment_info(true);
		if let Some(storage) = self.storage(track_id) {
			storage.write().set_retain(true);
		}

		Ok(())
	}

	fn dump_master_playlists_of_all_items(&self) {
		let dumps: Vec<Arc<Dump>> = self.dumps.read().values().cloned().collect();
		for dump in dumps {
			if !dump.is_enabled() {
				continue;
			}

			if let Err(err) = self.dump_master_playlist(&dump) {
				// Even if the dump fails here, it is not disabled.
				tracing::warn!(dump = dump.id(), %err, "could not dump master playlist");
			}
		}
	}

	fn dump_master_playlist(&self, dump: &Arc<Dump>) -> Result<()> {
		if !dump.is_enabled() {
			return Err(Error::DumpDisabled);
		}

		for playlist in dump.playlists() {
			let (result, data) = self.get_master_playlist(playlist, "", false, false, false);
			let data = match (result, data) {
				(RequestResult::Success, Some(data)) => data,
				_ => return Err(Error::NotAvailable),
			};

			dump.dump_data(playlist, &data)?;
		}

		Ok(())
	}

	fn minimum_last_segment_number(&self) -> i64 {
		self.storages
			.read()
			.values()
			.map(|storage| storage.read().last_segment_number())
			.min()
			.unwrap_or(-1)
	}

	fn resolve_output_path(&self, template: &str) -> PathBuf {
		PathBuf::from(
			template
				.replace("${VHostName}", &self.vhost_name)
				.replace("${AppName}", &self.app_name)
				.replace("${StreamName}", &self.name),
		)
	}

	// ------------------------------------------------------------------
	// Artifact names
	// ------------------------------------------------------------------

	fn media_type_name(&self, track_id: i32) -> String {
		self.tracks
			.get(&track_id)
			.map(|track| track.media_type.to_string())
			.unwrap_or_default()
	}

	pub fn chunklist_name(&self, track_id: i32) -> String {
		format!(
			"chunklist_{}_{}_{}_llhls.m3u8",
			track_id,
			self.media_type_name(track_id),
			self.stream_key
		)
	}

	pub fn init_segment_name(&self, track_id: i32) -> String {
		format!(
			"init_{}_{}_{}_llhls.m4s",
			track_id,
			self.media_type_name(track_id),
			self.stream_key
		)
	}

	pub fn segment_name(&self, track_id: i32, segment_number: i64) -> String {
		format!(
			"seg_{}_{}_{}_{}_llhls.m4s",
			track_id,
			segment_number,
			self.media_type_name(track_id),
			self.stream_key
		)
	}

	pub fn partial_segment_name(&self, track_id: i32, segment_number: i64, partial_number: i64) -> String {
		format!(
			"part_{}_{}_{}_{}_{}_llhls.m4s",
			track_id,
			segment_number,
			partial_number,
			self.media_type_name(track_id),
			self.stream_key
		)
	}

	// ------------------------------------------------------------------
	// Lookup helpers
	// ------------------------------------------------------------------

	fn storage(&self, track_id: i32) -> Option<Arc<RwLock<Storage>>> {
		self.storages.read().get(&track_id).cloned()
	}

	fn chunklist(&self, track_id: i32) -> Option<Arc<Chunklist>> {
		self.chunklists.read().get(&track_id).cloned()
	}

	fn track_by_name(&self, name: &str) -> Option<Arc<MediaTrack>> {
		self.tracks.values().find(|track| track.name == name).cloned()
	}

	/// Wall-clock instant of a timebase timestamp: the stream's creation
	/// epoch plus the media time.
	fn epoch_ms(&self, track_id: i32, timestamp: i64) -> i64 {
		let media_ms = self
			.tracks
			.get(&track_id)
			.map(|track| track.timebase.to_millis(timestamp))
			.unwrap_or(0.0);

		self.created_at_ms + media_ms.round() as i64
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{BitstreamFormat, CodecId, Dimensions, Timebase};
	use mp4_atom::{Any, Buf, DecodeMaybe};

	fn avcc_extradata() -> Bytes {
		use mp4_atom::{Atom, Avcc};

		let avcc = Avcc::new(
			&[0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40, 0x50],
			&[0x68, 0xeb, 0xe3, 0xcb],
		)
		.unwrap();

		let mut buf = Vec::new();
		avcc.encode_body(&mut buf).unwrap();
		Bytes::from(buf)
	}

	fn video_track(id: i32, name: &str, codec_id: CodecId) -> MediaTrack {
		MediaTrack::video(
			id,
			name,
			codec_id,
			Timebase::new(1, 90000),
			Dimensions { width: 1280, height: 720 },
			30.0,
			2_000_000,
			avcc_extradata(),
		)
	}

	fn audio_track(id: i32) -> MediaTrack {
		MediaTrack::audio(
			id,
			"audio",
			CodecId::AAC,
			Timebase::new(1, 48000),
			48000,
			2,
			128_000,
			Bytes::from_static(&[0x11, 0x90]),
		)
	}

	fn config(max_segments: usize) -> StreamConfig {
		StreamConfig {
			chunk_duration_ms: 500,
			segment_duration_ms: 2000,
			max_segments,
			..Default::default()
		}
	}

	fn video_stream(max_segments: usize) -> Stream {
		let stream = Stream::new(
			"default",
			"app",
			"stream",
			vec![video_track(1, "video", CodecId::H264)],
			Vec::new(),
			config(max_segments),
		);
		stream.start().unwrap();
		stream
	}

	// 50ms video frames, keyframe every 10 (one chunk), segment every 40.
	fn video_frame(i: i64) -> MediaPacket {
		MediaPacket::video(
			1,
			i * 4500,
			i * 4500,
			4500,
			i % 10 == 0,
			Bytes::from(vec![i as u8; 4]),
		)
	}

	fn pump_video(stream: &Stream, from: i64, upto: i64) {
		for i in from..=upto {
			stream.send_video_frame(video_frame(i)).unwrap();
		}
	}

	fn decode_all(mut data: &[u8]) -> Vec<Any> {
		let mut atoms = Vec::new();
		while data.has_remaining() {
			atoms.push(Any::decode_maybe(&mut data).unwrap().unwrap());
		}
		atoms
	}

	fn scratch_dir(name: &str) -> PathBuf {
		let dir = std::env::temp_dir().join(format!("perch-stream-{}-{}", name, std::process::id()));
		let _ = std::fs::remove_dir_all(&dir);
		dir
	}

	fn dump_config(id: &str, dir: &std::path::Path) -> DumpConfig {
		DumpConfig {
			id: id.to_string(),
			target_stream_name: "^stream$".to_string(),
			output_path: dir.to_string_lossy().to_string(),
			playlists: vec![DEFAULT_PLAYLIST_NAME.to_string()],
			enabled: true,
			info_file_url: None,
		}
	}

	#[test]
	fn test_preroll_drains_into_first_chunk() {
		let stream = Stream::new(
			"default",
			"app",
			"stream",
			vec![video_track(1, "video", CodecId::H264)],
			Vec::new(),
			config(5),
		);

		// Frames arrive before the stream starts; they are buffered.
		for i in 0..3 {
			stream.send_video_frame(video_frame(i)).unwrap();
		}

		stream.start().unwrap();

		// The next frames drain the buffer first.
		for i in 3..=10 {
			stream.send_video_frame(video_frame(i)).unwrap();
		}

		let (result, data) = stream.get_chunk(1, 0, 0);
		assert_eq!(result, RequestResult::Success);

		let atoms = decode_all(&data.unwrap());
		match &atoms[1] {
			Any::Mdat(mdat) => {
				// The buffered frames lead the chunk, in DTS order.
				assert_eq!(&mdat.data[0..4], &[0, 0, 0, 0]);
				assert_eq!(&mdat.data[4..8], &[1, 1, 1, 1]);
				assert_eq!(&mdat.data[8..12], &[2, 2, 2, 2]);
			}
			other => panic!("expected mdat, got {:?}", other),
		}
	}

	#[test]
	fn test_preroll_overflow_drops_oldest() {
		let stream = Stream::new(
			"default",
			"app",
			"stream",
			vec![video_track(1, "video", CodecId::H264)],
			Vec::new(),
			config(5),
		);

		for i in 0..(MAX_INITIAL_MEDIA_PACKET_BUFFER_SIZE + 10) {
			stream.send_video_frame(video_frame(i as i64)).unwrap();
		}

		assert_eq!(stream.preroll.lock().len(), MAX_INITIAL_MEDIA_PACKET_BUFFER_SIZE);
		assert_eq!(stream.preroll.lock().front().unwrap().dts, 10 * 4500);
	}

	#[test]
	fn test_readiness_flips_once() {
		let stream = video_stream(5);
		assert!(!stream.is_ready_to_play());

		// Not ready until the first segment closes.
		pump_video(&stream, 0, 39);
		assert!(!stream.is_ready_to_play());

		stream.send_video_frame(video_frame(40)).unwrap();
		assert!(stream.is_ready_to_play());

		pump_video(&stream, 41, 200);
		assert!(stream.is_ready_to_play());
	}

	#[test]
	fn test_blocking_reload() {
		let stream = video_stream(5);

		// Three closed segments; nothing of segment 3 has landed yet.
		pump_video(&stream, 0, 120);

		let (result, _) = stream.get_chunklist("", 1, 3, 0, false, false, false);
		assert_eq!(result, RequestResult::Accepted);

		let mut updates = stream.subscribe();

		// One more chunk arrives and unblocks the request.
		for i in 121..=130 {
			stream.send_video_frame(video_frame(i)).unwrap();
		}

		let event = updates.try_recv().unwrap();
		assert_eq!(event, PlaylistUpdated { track_id: 1, msn: 3, part: 0 });

		let (result, data) = stream.get_chunklist("", 1, 3, 0, false, false, false);
		assert_eq!(result, RequestResult::Success);

		let text = String::from_utf8(data.unwrap().to_vec()).unwrap();
		assert!(text.contains("#EXT-X-PART:"));
		let (msn, part) = stream.chunklist(1).unwrap().last_sequence_number();
		assert!(msn > 3 || (msn == 3 && part >= 0));
	}

	#[test]
	fn test_chunklist_not_ready_is_accepted() {
		let stream = video_stream(5);
		pump_video(&stream, 0, 10);

		let (result, _) = stream.get_chunklist("", 1, -1, -1, false, false, false);
		assert_eq!(result, RequestResult::Accepted);

		let (result, _) = stream.get_chunklist("", 9, -1, -1, false, false, false);
		assert_eq!(result, RequestResult::NotFound);
	}

	#[test]
	fn test_chunk_preload_discipline() {
		let stream = video_stream(5);
		pump_video(&stream, 0, 10);

		// Chunk (0, 0) exists; (0, 1) is hinted but not produced.
		assert_eq!(stream.get_chunk(1, 0, 0).0, RequestResult::Success);
		assert_eq!(stream.get_chunk(1, 0, 1).0, RequestResult::Accepted);
		assert_eq!(stream.get_chunk(1, 1, 0).0, RequestResult::NotFound);
	}

	#[test]
	fn test_skip_delta_update() {
		let stream = video_stream(8);

		// Eight closed segments.
		pump_video(&stream, 0, 320);

		let (result, data) = stream.get_chunklist("", 1, -1, -1, true, false, false);
		assert_eq!(result, RequestResult::Success);

		let text = String::from_utf8(data.unwrap().to_vec()).unwrap();
		assert!(text.contains("#EXT-X-SKIP:SKIPPED-SEGMENTS=4\n"));
		assert_eq!(text.matches("#EXTINF:").count(), 4);
	}

	#[test]
	fn test_default_playlist_excludes_unsupported_codec() {
		let stream = Stream::new(
			"default",
			"app",
			"stream",
			vec![
				video_track(1, "video", CodecId::H264),
				video_track(2, "video-vp9", CodecId::VP9),
				audio_track(3),
			],
			Vec::new(),
			config(5),
		);
		stream.start().unwrap();

		// The excluded track never gets storage.
		assert_eq!(stream.get_initialization_segment(2).0, RequestResult::NotFound);

		// Drive both supported tracks to readiness.
		pump_video(&stream, 0, 40);
		for i in 0..100 {
			let packet = MediaPacket::audio(3, i * 1024, 1024, Bytes::from_static(&[0u8; 8]));
			stream.send_audio_frame(packet).unwrap();
		}
		assert!(stream.is_ready_to_play());

		let (result, data) = stream.get_master_playlist(DEFAULT_PLAYLIST_NAME, "", false, false, false);
		assert_eq!(result, RequestResult::Success);

		let text = String::from_utf8(data.unwrap().to_vec()).unwrap();
		assert!(text.contains("avc1.64001f"));
		assert!(text.contains("mp4a.40.2"));
		assert!(!text.contains("vp09"));
		assert!(text.contains(&stream.chunklist_name(1)));
	}

	#[test]
	fn test_master_playlist_gating() {
		let stream = video_stream(5);

		let (result, _) = stream.get_master_playlist(DEFAULT_PLAYLIST_NAME, "", false, false, false);
		assert_eq!(result, RequestResult::Accepted);

		pump_video(&stream, 0, 40);
		let (result, _) = stream.get_master_playlist(DEFAULT_PLAYLIST_NAME, "", false, false, false);
		assert_eq!(result, RequestResult::Success);

		let (result, _) = stream.get_master_playlist("other.m3u8", "", false, false, false);
		assert_eq!(result, RequestResult::NotFound);
	}

	#[test]
	fn test_artifact_names_carry_stream_key() {
		let stream = video_stream(5);
		let key = stream.stream_key();

		assert_eq!(stream.chunklist_name(1), format!("chunklist_1_video_{}_llhls.m3u8", key));
		assert_eq!(stream.init_segment_name(1), format!("init_1_video_{}_llhls.m4s", key));
		assert_eq!(stream.segment_name(1, 7), format!("seg_1_7_video_{}_llhls.m4s", key));
		assert_eq!(
			stream.partial_segment_name(1, 7, 2),
			format!("part_1_7_2_video_{}_llhls.m4s", key)
		);
	}

	#[test]
	fn test_dump_back_fill() {
		let dir = scratch_dir("backfill");
		let stream = video_stream(5);
		pump_video(&stream, 0, 40);
		assert!(stream.is_ready_to_play());

		stream.start_dump(&dump_config("d1", &dir)).unwrap();

		let key = stream.stream_key();
		assert!(dir.join(format!("init_1_video_{}_llhls.m4s", key)).exists());
		assert!(dir.join(format!("seg_1_0_video_{}_llhls.m4s", key)).exists());
		assert!(dir.join(format!("chunklist_1_video_{}_llhls.m3u8", key)).exists());
		assert!(dir.join(DEFAULT_PLAYLIST_NAME).exists());

		// Duplicate ids are refused.
		let err = stream.start_dump(&dump_config("d1", &dir)).unwrap_err();
		assert!(matches!(err, Error::DuplicateDump));

		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn test_dump_target_mismatch() {
		let dir = scratch_dir("mismatch");
		let stream = video_stream(5);
		pump_video(&stream, 0, 40);

		let mut config = dump_config("d1", &dir);
		config.target_stream_name = "^other$".to_string();

		let err = stream.start_dump(&config).unwrap_err();
		assert!(matches!(err, Error::DumpTargetMismatch));
	}

	#[test]
	fn test_dump_blocks_eviction_until_stopped() {
		let dir = scratch_dir("eviction");
		let stream = video_stream(3);
		pump_video(&stream, 0, 40);

		stream.start_dump(&dump_config("d1", &dir)).unwrap();

		// Six closed segments with a window of three: all retained.
		pump_video(&stream, 41, 240);
		for n in 0..6 {
			assert_eq!(stream.get_segment(1, n).0, RequestResult::Success, "segment {}", n);
		}

		stream.stop_dump(Some("d1")).unwrap();

		// The next close resumes eviction down to the window.
		pump_video(&stream, 241, 280);
		assert_eq!(stream.get_segment(1, 0).0, RequestResult::NotFound);
		assert_eq!(stream.get_segment(1, 3).0, RequestResult::NotFound);
		assert_eq!(stream.get_segment(1, 6).0, RequestResult::Success);

		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[test]
	fn test_stop_clears_lookups() {
		let stream = video_stream(5);
		pump_video(&stream, 0, 40);

		let (_, data) = stream.get_segment(1, 0);
		let held = data.unwrap();

		stream.stop();
		assert_eq!(stream.state(), State::Stopped);
		assert_eq!(stream.get_segment(1, 0).0, RequestResult::NotFound);
		assert_eq!(stream.get_chunklist("", 1, -1, -1, false, false, false).0, RequestResult::NotFound);

		// Bytes handed out before the stop stay valid.
		assert!(!held.is_empty());
	}

	#[test]
	fn test_data_frames_require_id3(){
		let stream = video_stream(5);
		pump_video(&stream, 0, 10);

		let mut packet = MediaPacket::data(9, PacketType::VideoEvent, 0, Bytes::from_static(b"x"));
		packet.bitstream_format = BitstreamFormat::AacRaw;

		// Silently dropped.
		stream.send_data_frame(packet).unwrap();
	}

	#[test]
	fn test_data_frame_correlates_with_video() {
		let stream = video_stream(5);
		pump_video(&stream, 0, 5);

		let packet = MediaPacket::data(9, PacketType::VideoEvent, 5 * 4500, Bytes::from_static(b"ID3"));
		stream.send_data_frame(packet).unwrap();

		// The reserved payload lands in the next flushed chunk as an emsg.
		pump_video(&stream, 0, 10);

		let (result, data) = stream.get_chunk(1, 0, 0);
		assert_eq!(result, RequestResult::Success);

		let atoms = decode_all(&data.unwrap());
		assert!(matches!(atoms[0], Any::Emsg(_)));
	}
}
