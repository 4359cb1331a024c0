use docwire_core::CodecConfig;
use std::time::Duration;

/// Size limit assumed until the server reports `maxBsonObjectSize`.
pub const DEFAULT_MAX_BSON_SIZE: usize = 4 * 1024 * 1024;

/// Connection configuration
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
	/// Applies to every send and receive; `None` blocks indefinitely.
	pub op_timeout: Option<Duration>,
	pub connect_timeout: Option<Duration>,
	pub default_max_bson_size: usize,
	/// Used for documents the driver builds itself.
	pub codec: CodecConfig,
}

impl Default for ConnectionConfig {
	fn default() -> Self {
		Self {
			op_timeout: None,
			connect_timeout: Some(Duration::from_secs(10)),
			default_max_bson_size: DEFAULT_MAX_BSON_SIZE,
			codec: CodecConfig::default(),
		}
	}
}

impl ConnectionConfig {
	pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
		self.op_timeout = Some(timeout);
		self
	}
}
