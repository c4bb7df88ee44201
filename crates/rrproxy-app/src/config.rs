//! Minimal process-launch configuration (§2A): deliberately thin, since the full CLI
//! surface and YAML persistence format belong to the orchestration layer this core does
//! not implement (§1). Matches the teacher's `#[derive(Parser)]` + `clap` idiom in
//! `src/main.rs`.

use clap::Parser;
use rrproxy_store::Mode;

#[derive(Parser, Debug)]
#[command(version, about = "Transparent traffic record/replay proxy", long_about = None)]
pub struct Args {
	/// Starting mode: record or replay.
	#[arg(long, value_enum, default_value = "record")]
	pub mode: CliMode,

	/// Port the control-plane HTTP surface listens on.
	#[arg(long, default_value_t = 16789)]
	pub control_plane_port: u16,

	/// Comma-separated `port=upstream_host:port` pairs the ingress interceptor forwards;
	/// e.g. `8080=127.0.0.1:19080`.
	#[arg(long, value_delimiter = ',')]
	pub ingress: Vec<String>,

	/// Run ingress forwarders in synchronous mode (§4.3).
	#[arg(long, default_value_t = false)]
	pub sync: bool,

	/// Fuzzy-match similarity floor for the filtered pool (§4.5, default 0.9).
	#[arg(long, default_value_t = 0.9)]
	pub filtered_threshold: f64,

	/// Fuzzy-match similarity floor for the unfiltered pool (§4.5, default 0.4).
	#[arg(long, default_value_t = 0.4)]
	pub unfiltered_threshold: f64,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum CliMode {
	Record,
	Replay,
}

impl From<CliMode> for Mode {
	fn from(m: CliMode) -> Self {
		match m {
			CliMode::Record => Mode::Record,
			CliMode::Replay => Mode::Replay,
		}
	}
}

/// One `port=host:port` ingress forwarding rule parsed from `--ingress`.
#[derive(Clone, Debug)]
pub struct IngressRule {
	pub listen_port: u16,
	pub upstream: std::net::SocketAddr,
}

pub fn parse_ingress_rules(raw: &[String]) -> anyhow::Result<Vec<IngressRule>> {
	raw.iter()
		.map(|entry| {
			let (port, upstream) = entry
				.split_once('=')
				.ok_or_else(|| anyhow::anyhow!("malformed --ingress entry {entry:?}, expected port=host:port"))?;
			Ok(IngressRule {
				listen_port: port.parse()?,
				upstream: upstream.parse()?,
			})
		})
		.collect()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_well_formed_ingress_rules() {
		let rules = parse_ingress_rules(&["8080=127.0.0.1:19080".to_string()]).unwrap();
		assert_eq!(rules.len(), 1);
		assert_eq!(rules[0].listen_port, 8080);
		assert_eq!(rules[0].upstream.to_string(), "127.0.0.1:19080");
	}

	#[test]
	fn rejects_entry_without_equals() {
		assert!(parse_ingress_rules(&["garbage".to_string()]).is_err());
	}
}
