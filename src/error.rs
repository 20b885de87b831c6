use std::sync::Arc;

#[derive(Debug, thiserror::Error, Clone)]
pub enum Error {
	#[error("mp4 error: {0}")]
	Mp4(Arc<mp4_atom::Error>),

	#[error("io error: {0}")]
	Io(Arc<std::io::Error>),

	#[error("invalid regex: {0}")]
	Regex(#[from] regex::Error),

	#[error("unsupported codec: {0}")]
	UnsupportedCodec(&'static str),

	#[error("missing decoder configuration")]
	MissingExtradata,

	#[error("out-of-order sample: dts {got} after {last}")]
	OutOfOrderSample { last: i64, got: i64 },

	#[error("no supported track")]
	NoSupportedTrack,

	#[error("invalid state")]
	InvalidState,

	#[error("unknown track")]
	UnknownTrack,

	#[error("duplicate dump id")]
	DuplicateDump,

	#[error("unknown dump id")]
	DumpNotFound,

	#[error("duplicate dump info file")]
	DuplicateInfoFile,

	#[error("stream name does not match dump target")]
	DumpTargetMismatch,

	#[error("dump is disabled")]
	DumpDisabled,

	#[error("artifact is not available yet")]
	NotAvailable,
}

pub type Result<T> = std::result::Result<T, Error>;

// Wrap in an Arc so it is Clone
impl From<std::io::Error> for Error {
	fn from(err: std::io::Error) -> Self {
		Error::Io(Arc::new(err))
	}
}

impl From<mp4_atom::Error> for Error {
	fn from(err: mp4_atom::Error) -> Self {
		Error::Mp4(Arc::new(err))
	}
}
