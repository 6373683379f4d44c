//! ICE candidate attribute lines and the filter applied to them

use serde::{Deserialize, Serialize};

/// Attribute prefix of an ICE candidate line
pub const CANDIDATE_PREFIX: &str = "a=candidate:";

/// Candidate type as declared after the `typ` token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    ServerReflexive,
    PeerReflexive,
    Relay,
    Unknown(String),
}

impl CandidateType {
    fn parse(token: &str) -> Self {
        match token.to_ascii_lowercase().as_str() {
            "host" => CandidateType::Host,
            "srflx" => CandidateType::ServerReflexive,
            "prflx" => CandidateType::PeerReflexive,
            "relay" => CandidateType::Relay,
            other => CandidateType::Unknown(other.to_string()),
        }
    }
}

/// Structured view of an `a=candidate:` line
///
/// Fields past the foundation are optional: truncated lines are still
/// classified on whatever they carry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidateLine<'a> {
    pub foundation: &'a str,
    pub component: Option<&'a str>,
    pub transport: Option<&'a str>,
    pub priority: Option<&'a str>,
    pub address: Option<&'a str>,
    pub port: Option<&'a str>,
    pub candidate_type: Option<CandidateType>,
    /// Extension attributes following the candidate type (`tcptype`, `generation`, ...)
    pub extras: Vec<&'a str>,
}

impl<'a> IceCandidateLine<'a> {
    /// Parse a trimmed SDP line; returns `None` if it is not a candidate attribute
    pub fn parse(line: &'a str) -> Option<Self> {
        let rest = line.strip_prefix(CANDIDATE_PREFIX)?;
        let mut tokens = rest.split_whitespace();

        let foundation = tokens.next().unwrap_or("");
        let component = tokens.next();
        let transport = tokens.next();
        let priority = tokens.next();
        let address = tokens.next();
        let port = tokens.next();

        let mut candidate_type = None;
        let mut extras = Vec::new();
        let remaining: Vec<&str> = tokens.collect();
        let mut i = 0;
        while i < remaining.len() {
            if remaining[i].eq_ignore_ascii_case("typ") && candidate_type.is_none() {
                if let Some(t) = remaining.get(i + 1) {
                    candidate_type = Some(CandidateType::parse(t));
                    i += 2;
                    continue;
                }
            }
            extras.push(remaining[i]);
            i += 1;
        }

        Some(Self {
            foundation,
            component,
            transport,
            priority,
            address,
            port,
            candidate_type,
            extras,
        })
    }

    /// TCP, passive/active TCP and SSL-TCP candidates
    pub fn is_tcp_family(&self) -> bool {
        let tcp_transport = self
            .transport
            .map(|t| t.to_ascii_lowercase().contains("tcp"))
            .unwrap_or(false);

        tcp_transport || self.extras.iter().any(|e| e.eq_ignore_ascii_case("tcptype"))
    }

    /// Address field is an IPv6 literal
    pub fn is_ipv6(&self) -> bool {
        self.address.map(|a| a.contains(':')).unwrap_or(false)
    }

    pub fn is_host(&self) -> bool {
        self.candidate_type == Some(CandidateType::Host)
    }

    pub fn is_server_reflexive(&self) -> bool {
        self.candidate_type == Some(CandidateType::ServerReflexive)
    }
}

/// Which candidate shapes are removed from a description
///
/// The default keeps host candidates: they are what makes a same-LAN browser
/// session work. [`CandidateFilter::strict`] additionally drops them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CandidateFilter {
    /// Drop TCP-family candidates
    pub drop_tcp: bool,
    /// Drop server-reflexive (srflx) candidates
    pub drop_server_reflexive: bool,
    /// Drop candidates whose address is an IPv6 literal
    pub drop_ipv6: bool,
    /// Drop host candidates
    pub drop_host: bool,
}

impl Default for CandidateFilter {
    fn default() -> Self {
        Self {
            drop_tcp: true,
            drop_server_reflexive: true,
            drop_ipv6: true,
            drop_host: false,
        }
    }
}

impl CandidateFilter {
    /// Variant that also removes host candidates
    pub fn strict() -> Self {
        Self {
            drop_host: true,
            ..Self::default()
        }
    }

    /// Whether a candidate survives this filter
    pub fn admits(&self, candidate: &IceCandidateLine<'_>) -> bool {
        if self.drop_tcp && candidate.is_tcp_family() {
            return false;
        }
        if self.drop_server_reflexive && candidate.is_server_reflexive() {
            return false;
        }
        if self.drop_host && candidate.is_host() {
            return false;
        }
        if self.drop_ipv6 && candidate.is_ipv6() {
            return false;
        }
        true
    }
}
