//! Command-line configuration.
//!
//! Defaults mirror the long-standing operational ones: listen on
//! `0.0.0.0:1248`, pool description in `./settings.conf`, 30-second reuse
//! window, 64 KiB resend window. With neither `--tcp` nor `--dgram` given,
//! TCP is assumed.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use rescon_dgram::{CoalesceConfig, DgramConfig, FecConfig};

use crate::session::SessionConfig;

#[derive(Debug, Parser)]
#[command(
    name = "rescond",
    about = "Reconnect-tolerant relay between lossy client transports and stable backends"
)]
pub struct Args {
    /// Listen for clients on the reliable stream transport (TCP).
    #[arg(long)]
    pub tcp: bool,

    /// Listen for clients on the FEC-protected datagram transport (UDP).
    #[arg(long)]
    pub dgram: bool,

    /// Client listen address, shared by both transports.
    #[arg(long, default_value = "0.0.0.0:1248")]
    pub listen: SocketAddr,

    /// Backend pool description file.
    #[arg(long, default_value = "./settings.conf")]
    pub pool: PathBuf,

    /// Log verbosity (trace, debug, info, warn, error). RUST_LOG wins.
    #[arg(long, default_value = "info")]
    pub log: String,

    /// Seconds a detached session waits for its client to resume.
    #[arg(long, default_value_t = 30)]
    pub reuse_timeout: u64,

    /// Resend window cap per session, in bytes.
    #[arg(long, default_value_t = 65536)]
    pub resend_buffer: usize,

    /// FEC data shards per group on the datagram transport (0 disables FEC).
    #[arg(long, default_value_t = 0)]
    pub fec_data: usize,

    /// FEC parity shards per group on the datagram transport.
    #[arg(long, default_value_t = 0)]
    pub fec_parity: usize,

    /// Coalesce datagram uploads until this many bytes are staged
    /// (0 disables coalescing).
    #[arg(long, default_value_t = 0)]
    pub upload_min_packet: usize,

    /// Longest a coalesced upload byte may be held, in milliseconds.
    #[arg(long, default_value_t = 0)]
    pub upload_max_delay: u64,
}

impl Args {
    /// Which transports to listen on; TCP is the default when neither
    /// flag is present.
    pub fn transports(&self) -> (bool, bool) {
        if !self.tcp && !self.dgram {
            (true, false)
        } else {
            (self.tcp, self.dgram)
        }
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            reuse_timeout: Duration::from_secs(self.reuse_timeout),
            resend_cap: self.resend_buffer,
        }
    }

    pub fn dgram_config(&self) -> DgramConfig {
        let fec = (self.fec_data > 0 && self.fec_parity > 0).then_some(FecConfig {
            data_shards: self.fec_data,
            parity_shards: self.fec_parity,
        });
        DgramConfig {
            fec,
            coalesce: CoalesceConfig {
                min_packet: self.upload_min_packet,
                max_delay: Duration::from_millis(self.upload_max_delay),
            },
            ..DgramConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tcp_is_the_default_transport() {
        let args = Args::parse_from(["rescond"]);
        assert_eq!(args.transports(), (true, false));

        let args = Args::parse_from(["rescond", "--dgram"]);
        assert_eq!(args.transports(), (false, true));

        let args = Args::parse_from(["rescond", "--tcp", "--dgram"]);
        assert_eq!(args.transports(), (true, true));
    }

    #[test]
    fn defaults_match_operational_ones() {
        let args = Args::parse_from(["rescond"]);
        assert_eq!(args.listen.to_string(), "0.0.0.0:1248");
        assert_eq!(args.pool, PathBuf::from("./settings.conf"));
        assert_eq!(args.reuse_timeout, 30);
        assert_eq!(args.resend_buffer, 65536);
        assert!(args.dgram_config().fec.is_none());
    }

    #[test]
    fn fec_requires_both_shard_counts() {
        let args = Args::parse_from(["rescond", "--fec-data", "4"]);
        assert!(args.dgram_config().fec.is_none());

        let args = Args::parse_from(["rescond", "--fec-data", "4", "--fec-parity", "2"]);
        let fec = args.dgram_config().fec.unwrap();
        assert_eq!(fec.data_shards, 4);
        assert_eq!(fec.parity_shards, 2);
    }

    #[test]
    fn coalescing_tuning_flows_through() {
        let args = Args::parse_from([
            "rescond",
            "--upload-min-packet",
            "512",
            "--upload-max-delay",
            "40",
        ]);
        let dgram = args.dgram_config();
        assert_eq!(dgram.coalesce.min_packet, 512);
        assert_eq!(dgram.coalesce.max_delay, Duration::from_millis(40));
    }
}
