use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use mp4_atom::esds::{DecoderConfig, DecoderSpecific, EsDescriptor, SLConfig};
use mp4_atom::{
	Atom, Audio, Avc1, Avcc, Dinf, Emsg, EmsgTimestamp, Encode, Esds, Ftyp, Hdlr, Matrix, Mdat, Mdhd, Mdia, Mfhd,
	Minf, Moof, Moov, Mp4a, Mvex, Mvhd, Smhd, Stbl, Stsd, Tfdt, Tfhd, Tkhd, Traf, Trak, Trex, Trun, TrunEntry, Visual,
	Vmhd,
};
use parking_lot::RwLock;

use crate::{
	AudioSpecificConfig, BitstreamFormat, Error, MediaPacket, MediaTrack, MediaType, PackagerConfig, Result,
	Storage,
};

const ID3_SCHEME_ID_URI: &str = "https://aomedia.org/emsg/ID3";

/// Sample flags for the trun entries, ISO 14496-12 §8.8.3.1.
const SAMPLE_FLAGS_SYNC: u32 = 0x0200_0000;
const SAMPLE_FLAGS_NON_SYNC: u32 = 0x0101_0000;

/// What happened to storage as a consequence of one appended sample. The
/// stream controller turns these into chunklist updates and waiter wakeups.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackagerEvent {
	ChunkUpdated { segment_number: i64, chunk_number: i64 },
	SegmentUpdated { segment_number: i64 },
}

/// Groups ordered samples into CMAF chunks and segments, writing the boxes
/// into the track's storage.
pub struct Packager {
	storage: Arc<RwLock<Storage>>,
	track: Arc<MediaTrack>,
	config: PackagerConfig,

	// Samples accumulated for the open chunk.
	samples: Vec<MediaPacket>,
	chunk_duration_ms: f64,
	segment_duration_ms: f64,

	last_dts: Option<i64>,
	sequence_number: u32,

	// ID3 payloads reserved against the next chunk of this track.
	pending_data: VecDeque<MediaPacket>,
	emsg_id: u32,
}

impl Packager {
	pub fn new(storage: Arc<RwLock<Storage>>, track: Arc<MediaTrack>, config: PackagerConfig) -> Self {
		Self {
			storage,
			track,
			config,
			samples: Vec::new(),
			chunk_duration_ms: 0.0,
			segment_duration_ms: 0.0,
			last_dts: None,
			sequence_number: 1,
			pending_data: VecDeque::new(),
			emsg_id: 0,
		}
	}

	/// Build the `ftyp`+`moov` section from the track metadata and hand it to
	/// storage. Fails when the decoder configuration is missing or the codec
	/// is not packageable; the stream drops the track in that case.
	pub fn create_initialization_segment(&mut self) -> Result<()> {
		let stsd = match self.track.media_type {
			MediaType::Video => Stsd {
				codecs: vec![self.video_sample_entry()?.into()],
				..Default::default()
			},
			MediaType::Audio => Stsd {
				codecs: vec![self.audio_sample_entry()?.into()],
				..Default::default()
			},
			MediaType::Data => return Err(Error::UnsupportedCodec("data")),
		};

		let track_id = self.track.id as u32;
		let timescale = self.track.timebase.timescale();

		let ftyp = Ftyp {
			major_brand: b"iso6".into(),
			minor_version: 0,
			compatible_brands: vec![b"isom".into(), b"iso6".into(), b"cmfc".into()],
		};

		let (width, height) = match self.track.resolution {
			Some(res) => (res.width as u16, res.height as u16),
			None => (0, 0),
		};

		let tkhd = Tkhd {
			track_id,
			enabled: true,
			volume: if self.track.media_type == MediaType::Audio {
				1.into()
			} else {
				0.into()
			},
			matrix: Matrix::default(),
			width: width.into(),
			height: height.into(),
			..Default::default()
		};

		let minf = Minf {
			vmhd: (self.track.media_type == MediaType::Video).then(Vmhd::default),
			smhd: (self.track.media_type == MediaType::Audio).then(Smhd::default),
			dinf: Dinf::default(),
			stbl: Stbl {
				stsd,
				..Default::default()
			},
		};

		let trak = Trak {
			tkhd,
			mdia: Mdia {
				mdhd: Mdhd {
					timescale,
					language: "und".to_string(),
					..Default::default()
				},
				hdlr: match self.track.media_type {
					MediaType::Video => Hdlr {
						handler: b"vide".into(),
						name: "VideoHandler".to_string(),
					},
					_ => Hdlr {
						handler: b"soun".into(),
						name: "SoundHandler".to_string(),
					},
				},
				minf,
			},
			..Default::default()
		};

		let moov = Moov {
			mvhd: Mvhd {
				creation_time: 0,
				modification_time: 0,
				timescale: 1000,
				duration: 0,
				rate: 1.into(),
				volume: 1.into(),
				matrix: Matrix::default(),
				next_track_id: track_id + 1,
			},
			meta: None,
			mvex: Some(Mvex {
				mehd: None,
				trex: vec![Trex {
					track_id,
					default_sample_description_index: 1,
					default_sample_duration: 0,
					default_sample_size: 0,
					default_sample_flags: 0,
				}],
			}),
			trak: vec![trak],
			udta: None,
		};

		let mut buf = Vec::new();
		ftyp.encode(&mut buf)?;
		moov.encode(&mut buf)?;

		tracing::debug!(track = self.track.id, size = buf.len(), "created initialization segment");

		self.storage.write().set_initialization_section(Bytes::from(buf));

		Ok(())
	}

	fn video_sample_entry(&self) -> Result<Avc1> {
		if !matches!(self.track.codec_id, crate::CodecId::H264) {
			return Err(Error::UnsupportedCodec("video codec is not h264"));
		}

		let extradata = self.track.extradata.as_ref().ok_or(Error::MissingExtradata)?;
		let avcc = Avcc::decode_body(&mut extradata.as_ref())?;

		let (width, height) = match self.track.resolution {
			Some(res) => (res.width as u16, res.height as u16),
			None => (0, 0),
		};

		Ok(Avc1 {
			visual: Visual {
				data_reference_index: 1,
				width,
				height,
				..Default::default()
			},
			avcc,
			btrt: None,
			colr: None,
			pasp: None,
			taic: None,
		})
	}

	fn audio_sample_entry(&self) -> Result<Mp4a> {
		if !matches!(self.track.codec_id, crate::CodecId::AAC) {
			return Err(Error::UnsupportedCodec("audio codec is not aac"));
		}

		// Fall back to the track shape when the ASC is absent.
		let asc = match self.track.extradata.as_deref() {
			Some(extradata) if extradata.len() >= 2 => AudioSpecificConfig::parse(extradata)?,
			_ => AudioSpecificConfig {
				profile: 2,
				freq_index: AudioSpecificConfig::freq_index_for(self.track.sample_rate),
				chan_conf: self.track.channel_count as u8,
			},
		};

		let bitrate = self.track.bitrate as u32;

		Ok(Mp4a {
			audio: Audio {
				data_reference_index: 1,
				channel_count: self.track.channel_count as u16,
				sample_size: 16,
				sample_rate: (self.track.sample_rate.min(u16::MAX as u32) as u16).into(),
			},
			esds: Esds {
				es_desc: EsDescriptor {
					es_id: self.track.id as u16,
					dec_config: DecoderConfig {
						object_type_indication: 0x40,
						stream_type: 0x05,
						up_stream: 0,
						max_bitrate: bitrate,
						avg_bitrate: bitrate,
						dec_specific: DecoderSpecific {
							profile: asc.profile,
							freq_index: asc.freq_index,
							chan_conf: asc.chan_conf,
						},
						..Default::default()
					},
					sl_config: SLConfig::default(),
				},
			},
			btrt: None,
			taic: None,
		})
	}

	/// Consume one sample in DTS order, rolling the chunk and segment when
	/// their target durations are reached. Returns the storage updates.
	pub fn append_sample(&mut self, packet: MediaPacket) -> Result<Vec<PackagerEvent>> {
		if let Some(last) = self.last_dts {
			if packet.dts < last {
				return Err(Error::OutOfOrderSample {
					last,
					got: packet.dts,
				});
			}
		}
		self.last_dts = Some(packet.dts);

		let mut events = Vec::new();

		// Video chunks may only start at a random-access point; audio chunks
		// may start anywhere.
		let boundary = match self.track.media_type {
			MediaType::Video => packet.keyframe,
			_ => true,
		};

		if boundary && !self.samples.is_empty() {
			let chunk_due = self.chunk_duration_ms >= self.config.chunk_duration_ms as f64;
			let segment_due = self.segment_duration_ms >= self.config.segment_duration_ms as f64;

			if chunk_due || segment_due {
				self.flush_chunk(&mut events)?;

				if segment_due {
					self.close_segment(&mut events);
				}
			}
		}

		let duration_ms = self.track.timebase.to_millis(packet.duration);
		self.chunk_duration_ms += duration_ms;
		self.segment_duration_ms += duration_ms;
		self.samples.push(packet);

		Ok(events)
	}

	/// Reserve an ID3 payload; it rides along the next chunk as an `emsg`.
	pub fn reserve_data_packet(&mut self, packet: MediaPacket) {
		if packet.bitstream_format != BitstreamFormat::ID3v2 {
			tracing::debug!(track = self.track.id, "dropping data packet with unsupported format");
			return;
		}

		self.pending_data.push_back(packet);
	}

	fn flush_chunk(&mut self, events: &mut Vec<PackagerEvent>) -> Result<()> {
		let samples = std::mem::take(&mut self.samples);
		debug_assert!(!samples.is_empty());

		let start_timestamp = samples[0].dts;
		let independent = match self.track.media_type {
			MediaType::Video => samples[0].keyframe,
			_ => true,
		};

		let duration_ms: f64 = samples
			.iter()
			.map(|s| self.track.timebase.to_millis(s.duration))
			.sum();

		let data = self.write_chunk(&samples)?;

		let (segment_number, chunk_number) =
			self.storage
				.write()
				.append_chunk(data, start_timestamp, duration_ms, independent);

		tracing::trace!(
			track = self.track.id,
			segment = segment_number,
			chunk = chunk_number,
			samples = samples.len(),
			duration_ms,
			"wrote chunk"
		);

		events.push(PackagerEvent::ChunkUpdated {
			segment_number,
			chunk_number,
		});

		self.chunk_duration_ms = 0.0;

		Ok(())
	}

	fn close_segment(&mut self, events: &mut Vec<PackagerEvent>) {
		if let Some(segment) = self.storage.write().close_segment() {
			tracing::debug!(
				track = self.track.id,
				segment = segment.number,
				duration_ms = segment.duration_ms,
				"closed segment"
			);

			events.push(PackagerEvent::SegmentUpdated {
				segment_number: segment.number,
			});
		}

		self.segment_duration_ms = 0.0;
	}

	/// Serialize one chunk: reserved `emsg` boxes, then a `moof`+`mdat` pair.
	fn write_chunk(&mut self, samples: &[MediaPacket]) -> Result<Bytes> {
		let mut buf = Vec::new();

		while let Some(data) = self.pending_data.pop_front() {
			self.emsg_id += 1;

			let emsg = Emsg {
				timescale: self.track.timebase.timescale(),
				presentation_time: EmsgTimestamp::Absolute(data.pts.max(0) as u64),
				event_duration: data.duration.max(0) as u32,
				id: self.emsg_id,
				scheme_id_uri: ID3_SCHEME_ID_URI.to_string(),
				value: String::new(),
				message_data: data.payload.to_vec().into(),
			};
			emsg.encode(&mut buf)?;
		}

		let entries = samples
			.iter()
			.map(|sample| TrunEntry {
				duration: Some(sample.duration.max(0) as u32),
				size: Some(sample.payload.len() as u32),
				flags: Some(if sample.keyframe {
					SAMPLE_FLAGS_SYNC
				} else {
					SAMPLE_FLAGS_NON_SYNC
				}),
				cts: Some((sample.pts - sample.dts) as i32),
			})
			.collect::<Vec<_>>();

		let mut moof = Moof {
			mfhd: Mfhd {
				sequence_number: self.sequence_number,
			},
			traf: vec![Traf {
				tfhd: Tfhd {
					track_id: self.track.id as u32,
					..Default::default()
				},
				tfdt: Some(Tfdt {
					base_media_decode_time: samples[0].dts.max(0) as u64,
				}),
				trun: vec![Trun {
					// Patched below once the moof size is known.
					data_offset: Some(0),
					entries,
				}],
				..Default::default()
			}],
		};
		self.sequence_number += 1;

		// The offset points past the moof and the 8-byte mdat header; its
		// encoded size does not depend on the value.
		let mut probe = Vec::new();
		moof.encode(&mut probe)?;
		if let Some(trun) = moof.traf[0].trun.first_mut() {
			trun.data_offset = Some(probe.len() as i32 + 8);
		}
		moof.encode(&mut buf)?;

		let mut payload = Vec::with_capacity(samples.iter().map(|s| s.payload.len()).sum());
		for sample in samples {
			payload.extend_from_slice(&sample.payload);
		}
		Mdat {
			data: payload.into(),
		}
		.encode(&mut buf)?;

		Ok(Bytes::from(buf))
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::{CodecId, Dimensions, StorageConfig, Timebase};
	use mp4_atom::{Any, Buf, DecodeMaybe};

	fn avcc_extradata() -> Bytes {
		let avcc = Avcc::new(
			&[0x67, 0x64, 0x00, 0x1f, 0xac, 0xd9, 0x40, 0x50],
			&[0x68, 0xeb, 0xe3, 0xcb],
		)
		.unwrap();

		let mut buf = Vec::new();
		avcc.encode_body(&mut buf).unwrap();
		Bytes::from(buf)
	}

	fn video_track() -> Arc<MediaTrack> {
		Arc::new(MediaTrack::video(
			1,
			"video",
			CodecId::H264,
			Timebase::new(1, 90000),
			Dimensions { width: 1280, height: 720 },
			30.0,
			2_000_000,
			avcc_extradata(),
		))
	}

	fn audio_track() -> Arc<MediaTrack> {
		Arc::new(MediaTrack::audio(
			2,
			"audio",
			CodecId::AAC,
			Timebase::new(1, 48000),
			48000,
			2,
			128_000,
			Bytes::from_static(&[0x11, 0x90]),
		))
	}

	fn packager(track: Arc<MediaTrack>) -> (Packager, Arc<RwLock<Storage>>) {
		let storage = Arc::new(RwLock::new(Storage::new(
			track.clone(),
			StorageConfig {
				max_segments: 5,
				segment_duration_ms: 2000,
			},
		)));

		let packager = Packager::new(
			storage.clone(),
			track,
			PackagerConfig {
				chunk_duration_ms: 500,
				segment_duration_ms: 2000,
			},
		);

		(packager, storage)
	}

	// 50ms per frame at a 90kHz timescale, so duration sums stay exact.
	fn video_frame(i: i64, keyframe: bool) -> MediaPacket {
		MediaPacket::video(1, i * 4500, i * 4500, 4500, keyframe, Bytes::from_static(&[0u8; 16]))
	}

	fn decode_all(mut data: &[u8]) -> Vec<Any> {
		let mut atoms = Vec::new();
		while data.has_remaining() {
			atoms.push(Any::decode_maybe(&mut data).unwrap().unwrap());
		}
		atoms
	}

	#[test]
	fn test_init_segment_parses() {
		let (mut packager, storage) = packager(video_track());
		packager.create_initialization_segment().unwrap();

		let init = storage.read().initialization_section().unwrap();
		let atoms = decode_all(&init);
		assert_eq!(atoms.len(), 2);

		match &atoms[0] {
			Any::Ftyp(ftyp) => assert_eq!(ftyp.major_brand, b"iso6".into()),
			other => panic!("expected ftyp, got {:?}", other),
		}
		match &atoms[1] {
			Any::Moov(moov) => {
				assert_eq!(moov.trak.len(), 1);
				assert_eq!(moov.trak[0].tkhd.track_id, 1);
				assert_eq!(moov.trak[0].mdia.mdhd.timescale, 90000);
				assert!(moov.mvex.is_some());
			}
			other => panic!("expected moov, got {:?}", other),
		}
	}

	#[test]
	fn test_audio_init_segment_parses() {
		let (mut packager, storage) = packager(audio_track());
		packager.create_initialization_segment().unwrap();

		let init = storage.read().initialization_section().unwrap();
		let atoms = decode_all(&init);
		match &atoms[1] {
			Any::Moov(moov) => assert_eq!(moov.trak[0].mdia.mdhd.timescale, 48000),
			other => panic!("expected moov, got {:?}", other),
		}
	}

	#[test]
	fn test_init_segment_requires_extradata() {
		let track = Arc::new(MediaTrack::video(
			1,
			"video",
			CodecId::H264,
			Timebase::new(1, 90000),
			Dimensions { width: 1280, height: 720 },
			30.0,
			2_000_000,
			Bytes::new(),
		));
		let (mut packager, _) = packager(track);
		assert!(packager.create_initialization_segment().is_err());
	}

	#[test]
	fn test_video_chunk_boundaries_at_keyframes() {
		let (mut packager, storage) = packager(video_track());
		packager.create_initialization_segment().unwrap();

		// 500ms of video, then a keyframe: one chunk flushes.
		let mut events = Vec::new();
		for i in 0..10 {
			events.extend(packager.append_sample(video_frame(i, i == 0)).unwrap());
		}
		assert!(events.is_empty());

		let events = packager.append_sample(video_frame(10, true)).unwrap();
		assert_eq!(
			events,
			vec![PackagerEvent::ChunkUpdated {
				segment_number: 0,
				chunk_number: 0
			}]
		);

		let chunk = storage.read().media_chunk(0, 0).unwrap();
		assert!(chunk.independent);
		assert_eq!(chunk.start_timestamp, 0);
		assert_eq!(chunk.duration_ms, 500.0);
	}

	#[test]
	fn test_no_chunk_boundary_without_keyframe() {
		let (mut packager, _) = packager(video_track());
		packager.create_initialization_segment().unwrap();

		// Way past the chunk target, but no keyframe: nothing flushes.
		let mut events = Vec::new();
		for i in 0..60 {
			events.extend(packager.append_sample(video_frame(i, i == 0)).unwrap());
		}
		assert!(events.is_empty());
	}

	#[test]
	fn test_segment_rolls_on_keyframe_past_target() {
		let (mut packager, storage) = packager(video_track());
		packager.create_initialization_segment().unwrap();

		// Keyframe every 10 frames = every 500ms; the segment target is 2s.
		let mut events = Vec::new();
		for i in 0..45 {
			events.extend(packager.append_sample(video_frame(i, i % 10 == 0)).unwrap());
		}

		assert!(events.contains(&PackagerEvent::SegmentUpdated { segment_number: 0 }));

		let segment = storage.read().media_segment(0).unwrap();
		assert_eq!(segment.chunks.len(), 4);
		assert!((segment.duration_ms - 2000.0).abs() < 1.0);
	}

	#[test]
	fn test_chunk_is_valid_cmaf(){
		let (mut packager, storage) = packager(video_track());
		packager.create_initialization_segment().unwrap();

		for i in 0..11 {
			packager.append_sample(video_frame(i, i % 10 == 0)).unwrap();
		}

		let chunk = storage.read().media_chunk(0, 0).unwrap();
		let atoms = decode_all(&chunk.data);
		assert_eq!(atoms.len(), 2);

		match &atoms[0] {
			Any::Moof(moof) => {
				let traf = &moof.traf[0];
				assert_eq!(traf.tfhd.track_id, 1);
				assert_eq!(traf.tfdt.as_ref().unwrap().base_media_decode_time, 0);

				let trun = traf.trun.first().unwrap();
				assert_eq!(trun.entries.len(), 10);
				assert_eq!(trun.entries[0].flags, Some(SAMPLE_FLAGS_SYNC));
				assert_eq!(trun.entries[1].flags, Some(SAMPLE_FLAGS_NON_SYNC));

				// The data offset must land exactly on the mdat payload:
				// everything before the payload is the moof plus the 8-byte
				// mdat header.
				let payload_len = 10 * 16;
				assert_eq!(trun.data_offset, Some((chunk.data.len() - payload_len) as i32));
			}
			other => panic!("expected moof, got {:?}", other),
		}
		match &atoms[1] {
			Any::Mdat(mdat) => assert_eq!(mdat.data.len(), 10 * 16),
			other => panic!("expected mdat, got {:?}", other),
		}
	}

	#[test]
	fn test_audio_chunks_always_independent() {
		let (mut packager, storage) = packager(audio_track());
		packager.create_initialization_segment().unwrap();

		// 1024-sample AAC frames at 48kHz, ~21.3ms each.
		let mut events = Vec::new();
		for i in 0..30 {
			let packet = MediaPacket::audio(2, i * 1024, 1024, Bytes::from_static(&[0u8; 8]));
			events.extend(packager.append_sample(packet).unwrap());
		}

		assert!(events.iter().any(|e| matches!(e, PackagerEvent::ChunkUpdated { .. })));
		let chunk = storage.read().media_chunk(0, 0).unwrap();
		assert!(chunk.independent);
	}

	#[test]
	fn test_out_of_order_dts_is_fatal() {
		let (mut packager, _) = packager(video_track());
		packager.create_initialization_segment().unwrap();

		packager.append_sample(video_frame(1, true)).unwrap();
		let err = packager.append_sample(video_frame(0, false)).unwrap_err();
		assert!(matches!(err, Error::OutOfOrderSample { last: 4500, got: 0 }));
	}

	#[test]
	fn test_reserved_data_rides_next_chunk() {
		let (mut packager, storage) = packager(video_track());
		packager.create_initialization_segment().unwrap();

		packager.append_sample(video_frame(0, true)).unwrap();
		packager.reserve_data_packet(MediaPacket::data(
			9,
			crate::PacketType::VideoEvent,
			1000,
			Bytes::from_static(b"ID3payload"),
		));

		for i in 1..11 {
			packager.append_sample(video_frame(i, i == 10)).unwrap();
		}

		let chunk = storage.read().media_chunk(0, 0).unwrap();
		let atoms = decode_all(&chunk.data);
		assert_eq!(atoms.len(), 3);

		match &atoms[0] {
			Any::Emsg(emsg) => {
				assert_eq!(emsg.scheme_id_uri, ID3_SCHEME_ID_URI);
				assert_eq!(&emsg.message_data[..], b"ID3payload");
				assert_eq!(emsg.presentation_time, EmsgTimestamp::Absolute(1000));
			}
			other => panic!("expected emsg, got {:?}", other),
		}
	}

	#[test]
	fn test_unsupported_data_format_dropped() {
		let (mut packager, _) = packager(video_track());

		let mut packet = MediaPacket::data(9, crate::PacketType::VideoEvent, 0, Bytes::from_static(b"x"));
		packet.bitstream_format = BitstreamFormat::AacRaw;
		packager.reserve_data_packet(packet);

		assert!(packager.pending_data.is_empty());
	}
}
