//! Datastream definitions: split a mixed VDIF input into logical streams.
//!
//! A datastream is a named list of match expressions; the first stream
//! whose expressions match a frame claims it, and the stream's index
//! becomes the frame's tag. Match expressions have the form
//!
//! ```text
//! [sender>]station[.threads]
//! sender  := ip['@'port] | '*'
//! station := two-character code | numeric id | '*'
//! threads := thread-or-range['+'thread-or-range...] | '*'
//! ```
//!
//! e.g. `10.0.1.5@46227>Wb.0-3+8` or `Ef` or `*>*.16-31`. Definitions
//! survive as text so the operator sees back what was typed.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum Error {
    #[error("cannot parse match expression `{0}': {1}")]
    BadExpr(String, String),
    #[error("datastream `{0}' already defined")]
    Duplicate(String),
    #[error("no datastream named `{0}'")]
    Unknown(String),
}

type Result<T, E = Error> = std::result::Result<T, E>;

/// VDIF station field: a printable two-character code or a plain number.
#[derive(Clone, Debug, PartialEq, Eq)]
enum StationMatch {
    Any,
    Id(u16),
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum ThreadMatch {
    Any,
    One(u16),
    Range(u16, u16),
}

impl ThreadMatch {
    fn matches(&self, thread: u16) -> bool {
        match *self {
            ThreadMatch::Any => true,
            ThreadMatch::One(t) => t == thread,
            ThreadMatch::Range(lo, hi) => (lo..=hi).contains(&thread),
        }
    }
}

/// Station codes live in the 16-bit field as two little-endian bytes.
fn station_code_to_id(code: &str) -> Option<u16> {
    let bytes = code.as_bytes();
    if bytes.len() == 2 && bytes.iter().all(|b| b.is_ascii_graphic()) {
        Some(u16::from_le_bytes([bytes[0], bytes[1]]))
    } else {
        None
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchRule {
    sender_ip: Option<Ipv4Addr>,
    sender_port: Option<u16>,
    station: StationMatch,
    threads: Vec<ThreadMatch>,
}

impl MatchRule {
    pub fn parse(expr: &str) -> Result<Self> {
        let bad = |why: &str| Error::BadExpr(expr.to_owned(), why.to_owned());
        let (sender, rest) = match expr.find('>') {
            Some(at) => (Some(&expr[..at]), &expr[at + 1..]),
            None => (None, expr),
        };
        let (mut sender_ip, mut sender_port) = (None, None);
        if let Some(sender) = sender {
            if sender != "*" {
                let (ip, port) = match sender.find('@') {
                    Some(at) => (&sender[..at], Some(&sender[at + 1..])),
                    None => (sender, None),
                };
                sender_ip = Some(ip.parse().map_err(|_| bad("bad sender address"))?);
                if let Some(p) = port {
                    sender_port = Some(p.parse().map_err(|_| bad("bad sender port"))?);
                }
            }
        }
        let (station_txt, threads_txt) = match rest.find('.') {
            Some(at) => (&rest[..at], Some(&rest[at + 1..])),
            None => (rest, None),
        };
        let station = match station_txt {
            "" | "*" => StationMatch::Any,
            txt => match txt.parse::<u16>() {
                Ok(id) => StationMatch::Id(id),
                Err(_) => StationMatch::Id(
                    station_code_to_id(txt).ok_or_else(|| bad("bad station"))?,
                ),
            },
        };
        let threads = match threads_txt {
            None | Some("*") => vec![ThreadMatch::Any],
            Some(list) => list
                .split('+')
                .map(|part| {
                    if let Some(at) = part.find('-') {
                        let lo = part[..at].parse().map_err(|_| bad("bad thread range"))?;
                        let hi = part[at + 1..]
                            .parse()
                            .map_err(|_| bad("bad thread range"))?;
                        if lo > hi {
                            return Err(bad("thread range reversed"));
                        }
                        Ok(ThreadMatch::Range(lo, hi))
                    } else {
                        part.parse()
                            .map(ThreadMatch::One)
                            .map_err(|_| bad("bad thread id"))
                    }
                })
                .collect::<Result<_>>()?,
        };
        Ok(MatchRule {
            sender_ip,
            sender_port,
            station,
            threads,
        })
    }

    pub fn matches(
        &self,
        station_id: u16,
        thread_id: u16,
        sender: Option<(Ipv4Addr, u16)>,
    ) -> bool {
        if let Some(want_ip) = self.sender_ip {
            match sender {
                Some((ip, port)) => {
                    if ip != want_ip {
                        return false;
                    }
                    if let Some(want_port) = self.sender_port {
                        if port != want_port {
                            return false;
                        }
                    }
                }
                None => return false,
            }
        }
        match self.station {
            StationMatch::Any => (),
            StationMatch::Id(id) if id == station_id => (),
            StationMatch::Id(_) => return false,
        }
        self.threads.iter().any(|t| t.matches(thread_id))
    }
}

/// Persisted form: name plus the original expression texts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DataStreamDef {
    pub name: String,
    pub exprs: Vec<String>,
}

struct CompiledDef {
    def: DataStreamDef,
    rules: Vec<MatchRule>,
}

type FrameKey = (u16, u16, Option<(Ipv4Addr, u16)>);

/// The per-runtime datastream table.
#[derive(Default)]
pub struct DataStreams {
    defs: Vec<CompiledDef>,
    /// frame-key to tag memoization, cleared per recording
    cache: HashMap<FrameKey, Option<u32>>,
}

impl DataStreams {
    pub fn new() -> Self {
        DataStreams::default()
    }

    /// Defines a stream; its tag is its position in definition order.
    pub fn add(&mut self, name: &str, exprs: &[&str]) -> Result<u32> {
        if self.defs.iter().any(|d| d.def.name == name) {
            return Err(Error::Duplicate(name.to_owned()));
        }
        let rules = exprs
            .iter()
            .map(|e| MatchRule::parse(e))
            .collect::<Result<Vec<_>>>()?;
        self.defs.push(CompiledDef {
            def: DataStreamDef {
                name: name.to_owned(),
                exprs: exprs.iter().map(|s| (*s).to_owned()).collect(),
            },
            rules,
        });
        self.cache.clear();
        Ok((self.defs.len() - 1) as u32)
    }

    pub fn remove(&mut self, name: &str) -> Result<()> {
        let at = self
            .defs
            .iter()
            .position(|d| d.def.name == name)
            .ok_or_else(|| Error::Unknown(name.to_owned()))?;
        self.defs.remove(at);
        self.cache.clear();
        Ok(())
    }

    /// Clears the frame-key memoization; call before a new recording.
    pub fn reset(&mut self) {
        self.cache.clear();
    }

    pub fn clear(&mut self) {
        self.defs.clear();
        self.cache.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.defs.is_empty()
    }

    pub fn len(&self) -> usize {
        self.defs.len()
    }

    pub fn name_of(&self, tag: u32) -> Option<&str> {
        self.defs.get(tag as usize).map(|d| d.def.name.as_str())
    }

    pub fn tag_of_name(&self, name: &str) -> Option<u32> {
        self.defs
            .iter()
            .position(|d| d.def.name == name)
            .map(|i| i as u32)
    }

    /// Maps a frame to its datastream tag; first matching definition wins.
    pub fn stream_of(
        &mut self,
        station_id: u16,
        thread_id: u16,
        sender: Option<(Ipv4Addr, u16)>,
    ) -> Option<u32> {
        let key = (station_id, thread_id, sender);
        if let Some(hit) = self.cache.get(&key) {
            return *hit;
        }
        let tag = self.defs.iter().position(|d| {
            d.rules
                .iter()
                .any(|r| r.matches(station_id, thread_id, sender))
        });
        let tag = tag.map(|t| t as u32);
        self.cache.insert(key, tag);
        tag
    }

    /// The definition list in a serde-friendly shape.
    pub fn definitions(&self) -> Vec<DataStreamDef> {
        self.defs.iter().map(|d| d.def.clone()).collect()
    }

    /// Rebuilds the table from persisted definitions.
    pub fn from_definitions(defs: &[DataStreamDef]) -> Result<Self> {
        let mut ds = DataStreams::new();
        for d in defs {
            let exprs: Vec<&str> = d.exprs.iter().map(String::as_str).collect();
            ds.add(&d.name, &exprs)?;
        }
        Ok(ds)
    }
}
