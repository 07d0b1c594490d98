//! # Dedup guard
//!
//! One accepted vote per (poll, voter identity).
//!
//! The authoritative check is always a uniqueness constraint held by the
//! store: `UNIQUE (poll_id, voter_identity)` in Postgres, a per-poll
//! [`ReservationBook`] mutated under that poll's lock in memory. The
//! client's local "already voted" flag is only a hint and never consulted
//! here.
//!
//! ## Identity
//!
//! A deployment picks exactly one [`IdentityStrategy`]:
//!
//! - `network`: the first `X-Forwarded-For` hop when the proxy is trusted,
//!   otherwise the TCP peer address
//! - `token`: the opaque `X-Voter-Token` header supplied by the client
use std::{
    collections::HashSet,
    fmt::{self, Display},
    net::{IpAddr, SocketAddr},
    str::FromStr,
};

use http::HeaderMap;
use serde::Serialize;

use crate::error::LedgerError;

pub const MAX_IDENTITY_LEN: usize = 256;
pub const FORWARDED_FOR: &str = "x-forwarded-for";
pub const VOTER_TOKEN: &str = "x-voter-token";

/// Stable-per-voter opaque token used as the dedup key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct VoterIdentity(String);

impl VoterIdentity {
    pub fn new(raw: impl AsRef<str>) -> Result<Self, LedgerError> {
        let token = raw.as_ref().trim();

        if token.is_empty() {
            return Err(LedgerError::validation("voter identity must not be empty"));
        }
        if token.chars().count() > MAX_IDENTITY_LEN {
            return Err(LedgerError::validation(format!(
                "voter identity must be at most {MAX_IDENTITY_LEN} characters"
            )));
        }

        Ok(Self(token.to_string()))
    }

    pub fn from_ip(ip: IpAddr) -> Self {
        Self(ip.to_canonical().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VoterIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IdentityStrategy {
    #[default]
    NetworkAddress,
    ClientToken,
}

impl FromStr for IdentityStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "network" | "ip" => Ok(IdentityStrategy::NetworkAddress),
            "token" => Ok(IdentityStrategy::ClientToken),
            other => Err(format!("unknown voter identity strategy `{other}`")),
        }
    }
}

/// Derives the voter identity of an inbound request.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityResolver {
    pub strategy: IdentityStrategy,
    pub trust_forwarded_for: bool,
}

impl IdentityResolver {
    pub fn new(strategy: IdentityStrategy, trust_forwarded_for: bool) -> Self {
        Self {
            strategy,
            trust_forwarded_for,
        }
    }

    pub fn resolve(
        &self,
        headers: &HeaderMap,
        peer: Option<SocketAddr>,
    ) -> Result<VoterIdentity, LedgerError> {
        match self.strategy {
            IdentityStrategy::ClientToken => {
                let token = headers
                    .get(VOTER_TOKEN)
                    .and_then(|value| value.to_str().ok())
                    .ok_or_else(|| LedgerError::validation("missing X-Voter-Token header"))?;

                VoterIdentity::new(token)
            }
            IdentityStrategy::NetworkAddress => {
                if self.trust_forwarded_for {
                    if let Some(ip) = first_forwarded_hop(headers) {
                        return Ok(VoterIdentity::from_ip(ip));
                    }
                }

                peer.map(|addr| VoterIdentity::from_ip(addr.ip()))
                    .ok_or_else(|| LedgerError::validation("unable to determine voter address"))
            }
        }
    }
}

fn first_forwarded_hop(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get(FORWARDED_FOR)?
        .to_str()
        .ok()?
        .split(',')
        .next()?
        .trim()
        .parse()
        .ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Granted,
    AlreadyVoted,
}

/// Voters that hold a reservation on a single poll.
#[derive(Debug, Default, Clone)]
pub struct ReservationBook {
    voters: HashSet<VoterIdentity>,
}

impl ReservationBook {
    /// Insert-if-absent; the caller must hold the poll's lock.
    pub fn check_and_reserve(&mut self, voter: &VoterIdentity) -> Reservation {
        if self.voters.insert(voter.clone()) {
            Reservation::Granted
        } else {
            Reservation::AlreadyVoted
        }
    }

    pub fn contains(&self, voter: &VoterIdentity) -> bool {
        self.voters.contains(voter)
    }
}
