//! Network parameter set for transfers.
//!
//! Carries the protocol choice, MTU, nominal block size, socket buffer
//! sizes, inter-packet delay and the receiver list. Protocol names follow
//! the operator convention: `udp` is sequence-numbered UDP (`udps`),
//! `pudp` is plain UDP, `udpsnor` records sequence numbers without
//! reordering, `rtcp` is TCP with client and server roles reversed.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("unsupported protocol `{0}'")]
    BadProtocol(String),
    #[error("cannot parse host spec `{0}'")]
    BadHostSpec(String),
    #[error("{0} must not be zero")]
    Zero(&'static str),
}

type Result<T, E = Error> = std::result::Result<T, E>;

pub const DEFAULT_MTU: u32 = 1500;
pub const DEFAULT_BLOCKSIZE: u32 = 128 * 1024;
pub const DEFAULT_NBLOCK: u32 = 8;
pub const DEFAULT_ACK_PERIOD: u32 = 10;
pub const DEFAULT_SOCKBUF: usize = 4 * 1024 * 1024;

/// One receiver endpoint; `suffix` labels the datastream the socket
/// belongs to when several are opened in parallel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HostPort {
    pub host: String,
    pub port: u16,
    pub suffix: Option<u32>,
}

impl FromStr for HostPort {
    type Err = Error;

    /// `host:port` or `host:port:suffix`.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(':');
        let host = parts
            .next()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::BadHostSpec(s.to_owned()))?;
        let port = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::BadHostSpec(s.to_owned()))?;
        let suffix = match parts.next() {
            None => None,
            Some(sfx) => Some(
                sfx.parse()
                    .map_err(|_| Error::BadHostSpec(s.to_owned()))?,
            ),
        };
        if parts.next().is_some() {
            return Err(Error::BadHostSpec(s.to_owned()));
        }
        Ok(HostPort {
            host: host.to_owned(),
            port,
            suffix,
        })
    }
}

impl fmt::Display for HostPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.suffix {
            None => write!(f, "{}:{}", self.host, self.port),
            Some(s) => write!(f, "{}:{}:{}", self.host, self.port, s),
        }
    }
}

#[derive(Clone, Debug)]
pub struct NetParms {
    protocol: String,
    mtu: u32,
    blocksize: u32,
    pub nblock: u32,
    pub sndbufsize: usize,
    pub rcvbufsize: usize,
    /// inter-packet delay in ns; negative means "use the theoretical rate"
    pub ipd_ns: i64,
    pub theoretical_ipd_ns: i64,
    /// every k-th datagram triggers backtraffic
    pub ack_period: u32,
    pub hosts: Vec<HostPort>,
}

impl Default for NetParms {
    fn default() -> Self {
        NetParms {
            protocol: "tcp".to_owned(),
            mtu: DEFAULT_MTU,
            blocksize: DEFAULT_BLOCKSIZE,
            nblock: DEFAULT_NBLOCK,
            sndbufsize: DEFAULT_SOCKBUF,
            rcvbufsize: DEFAULT_SOCKBUF,
            ipd_ns: -1,
            theoretical_ipd_ns: 0,
            ack_period: DEFAULT_ACK_PERIOD,
            hosts: Vec::new(),
        }
    }
}

impl NetParms {
    /// Sets the protocol, translating operator names to canonical ones
    /// (`udp` means sequence-numbered UDP).
    pub fn set_protocol(&mut self, name: &str) -> Result<()> {
        let canonical = match name {
            "udp" | "udps" => "udps",
            "pudp" => "udp",
            "udpsnor" => "udpsnor",
            "tcp" => "tcp",
            "rtcp" => "rtcp",
            "unix" => "unix",
            other => return Err(Error::BadProtocol(other.to_owned())),
        };
        self.protocol = canonical.to_owned();
        Ok(())
    }

    pub fn protocol(&self) -> String {
        self.protocol.clone()
    }

    pub fn set_mtu(&mut self, mtu: u32) -> Result<()> {
        if mtu == 0 {
            return Err(Error::Zero("MTU"));
        }
        self.mtu = mtu;
        Ok(())
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    /// Block size is quantized to 8 bytes, the transfer word size.
    pub fn set_blocksize(&mut self, bs: u32) -> Result<()> {
        if bs & !0x7 == 0 {
            return Err(Error::Zero("blocksize"));
        }
        self.blocksize = bs & !0x7;
        Ok(())
    }

    pub fn blocksize(&self) -> u32 {
        self.blocksize
    }

    /// Effective inter-packet delay: the configured one, or the
    /// theoretical value when the configured delay is negative.
    pub fn effective_ipd_ns(&self) -> i64 {
        if self.ipd_ns < 0 {
            self.theoretical_ipd_ns
        } else {
            self.ipd_ns
        }
    }

    /// Derives the theoretical inter-packet delay from the payload size
    /// and the data rate in bits per second.
    pub fn set_theoretical_ipd(&mut self, write_size: u32, bits_per_second: u64) {
        if bits_per_second == 0 {
            self.theoretical_ipd_ns = 0;
            return;
        }
        let bits = u64::from(write_size) * 8;
        self.theoretical_ipd_ns = (bits * 1_000_000_000 / bits_per_second) as i64;
    }

    pub fn is_packet_based(&self) -> bool {
        self.protocol.contains("udp")
    }
}

/// Multicast addresses get a group join instead of a bind.
pub fn is_multicast(host: &str) -> bool {
    host.parse::<Ipv4Addr>()
        .map(|ip| ip.is_multicast())
        .unwrap_or(false)
}
