use docwire_core::{DocWireError, DocWireResult};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_PORT: u16 = 27017;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostPort {
	pub host: String,
	pub port: u16,
}

impl HostPort {
	pub fn new(host: impl Into<String>, port: u16) -> Self {
		Self {
			host: host.into(),
			port,
		}
	}

	/// Parses `host[:port]`, splitting at the last colon. A missing port
	/// means the default one.
	pub fn parse(s: &str) -> DocWireResult<Self> {
		match s.rsplit_once(':') {
			Some((host, port)) => {
				let port = port
					.parse::<u16>()
					.map_err(|_| DocWireError::InvalidInput(format!("bad port in '{}'", s)))?;
				if host.is_empty() {
					return Err(DocWireError::InvalidInput(format!("missing host in '{}'", s)));
				}
				Ok(Self::new(host, port))
			}
			None if s.is_empty() => Err(DocWireError::InvalidInput("empty host".into())),
			None => Ok(Self::new(s, DEFAULT_PORT)),
		}
	}
}

impl FromStr for HostPort {
	type Err = DocWireError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Self::parse(s)
	}
}

impl fmt::Display for HostPort {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse() {
		assert_eq!(
			HostPort::parse("db1.local:27018").unwrap(),
			HostPort::new("db1.local", 27018)
		);
		assert_eq!(
			HostPort::parse("db2").unwrap(),
			HostPort::new("db2", DEFAULT_PORT)
		);
		assert!(HostPort::parse("db3:notaport").is_err());
		assert!(HostPort::parse(":1").is_err());
		assert_eq!(HostPort::new("h", 1).to_string(), "h:1");
	}
}
