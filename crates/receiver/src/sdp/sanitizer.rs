//! SDP sanitization for browser interoperability
//!
//! Browsers are strict about some candidate shapes and legacy attributes that
//! the engine happily emits, and pasted answers can pick up stray banner lines
//! or LF-only line endings from the console. [`SdpSanitizer::sanitize`]
//! rewrites a description into a form every major browser accepts:
//!
//! 1. carriage returns are stripped and the text is split on line feeds,
//! 2. every line is trimmed, blank lines are dropped,
//! 3. console banners (`=====...`), `a=end-of-candidates` and `a=rtcp-mux-only`
//!    are removed,
//! 4. candidate lines are passed through the configured [`CandidateFilter`],
//! 5. survivors are emitted in their original order, each terminated by CRLF.

use super::candidate::{CandidateFilter, IceCandidateLine, CANDIDATE_PREFIX};

/// Prefix of the console banner lines wrapping a pasted description
pub const BANNER_PREFIX: &str = "=====";

const END_OF_CANDIDATES: &str = "a=end-of-candidates";
const RTCP_MUX_ONLY: &str = "a=rtcp-mux-only";

/// Pure SDP rewriting filter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SdpSanitizer {
    filter: CandidateFilter,
}

impl SdpSanitizer {
    pub fn new(filter: CandidateFilter) -> Self {
        Self { filter }
    }

    pub fn filter(&self) -> &CandidateFilter {
        &self.filter
    }

    /// Rewrite `raw` into CRLF-terminated, browser-safe SDP text
    ///
    /// Deterministic and idempotent: feeding the output back in yields the
    /// same text. An input with no surviving lines yields an empty string.
    pub fn sanitize(&self, raw: &str) -> String {
        let without_cr: String = raw.chars().filter(|&c| c != '\r').collect();
        let mut out = String::with_capacity(without_cr.len() + without_cr.len() / 16);

        for line in without_cr.split('\n') {
            let line = line.trim();
            if self.keeps(line) {
                out.push_str(line);
                out.push_str("\r\n");
            }
        }

        out
    }

    fn keeps(&self, line: &str) -> bool {
        if line.is_empty()
            || line.starts_with(BANNER_PREFIX)
            || line.starts_with(END_OF_CANDIDATES)
            || line.starts_with(RTCP_MUX_ONLY)
        {
            return false;
        }

        if line.starts_with(CANDIDATE_PREFIX) {
            return IceCandidateLine::parse(line)
                .map(|candidate| self.filter.admits(&candidate))
                .unwrap_or(true);
        }

        true
    }
}

/// Sanitize with the default candidate filter
pub fn sanitize(raw: &str) -> String {
    SdpSanitizer::default().sanitize(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    const OFFER: &str = "v=0\n\
o=- 4611731400430051336 2 IN IP4 127.0.0.1\n\
s=-\n\
t=0 0\n\
a=group:BUNDLE 0\n\
m=video 9 UDP/TLS/RTP/SAVPF 96\n\
c=IN IP4 0.0.0.0\n\
a=rtcp-mux\n\
a=rtcp-mux-only\n\
a=rtpmap:96 VP8/90000\n\
a=candidate:1 1 UDP 2122252543 192.168.1.20 51234 typ host\n\
a=candidate:2 1 TCP 1518280447 192.168.1.20 9 typ host tcptype active\n\
a=candidate:3 1 UDP 1686052607 203.0.113.9 51234 typ srflx raddr 192.168.1.20 rport 51234\n\
a=candidate:4 1 UDP 2122262783 fe80::1 51235 typ host\n\
a=end-of-candidates\n";

    #[test]
    fn test_empty_input() {
        assert_eq!(sanitize(""), "");
        assert_eq!(sanitize("\r\n\n  \t\n"), "");
    }

    #[test]
    fn test_crlf_normalization() {
        let out = sanitize("v=0\ns=-\r\nt=0 0");
        assert_eq!(out, "v=0\r\ns=-\r\nt=0 0\r\n");
    }

    #[test]
    fn test_whitespace_trimmed() {
        assert_eq!(sanitize("  v=0  \n\ts=-\t\n"), "v=0\r\ns=-\r\n");
    }

    #[test]
    fn test_offer_rewrite() {
        let out = sanitize(OFFER);
        assert!(out.contains("a=candidate:1 1 UDP 2122252543 192.168.1.20 51234 typ host\r\n"));
        assert!(!out.contains("a=candidate:2"));
        assert!(!out.contains("a=candidate:3"));
        assert!(!out.contains("a=candidate:4"));
        assert!(!out.contains("a=end-of-candidates"));
        assert!(!out.contains("a=rtcp-mux-only"));
        assert!(out.contains("a=rtcp-mux\r\n"));
    }

    #[test]
    fn test_strict_variant_drops_host() {
        let out = SdpSanitizer::new(CandidateFilter::strict()).sanitize(OFFER);
        assert!(!out.contains("a=candidate:"));
        assert!(out.starts_with("v=0\r\n"));
    }

    #[test]
    fn test_banner_lines_removed() {
        let raw = "===== SDP ANSWER =====\nv=0\n===== END SDP =====\n";
        assert_eq!(sanitize(raw), "v=0\r\n");
    }

    #[test]
    fn test_order_preserved() {
        let out = sanitize(OFFER);
        let lines: Vec<&str> = out.split("\r\n").filter(|l| !l.is_empty()).collect();
        let v = lines.iter().position(|l| *l == "v=0").unwrap();
        let m = lines.iter().position(|l| l.starts_with("m=video")).unwrap();
        let c = lines.iter().position(|l| l.starts_with("a=candidate:1")).unwrap();
        assert!(v < m && m < c);
    }

    #[test]
    fn test_idempotent() {
        let once = sanitize(OFFER);
        assert_eq!(sanitize(&once), once);
    }

    #[test]
    fn test_malformed_candidate_kept_when_nothing_matches() {
        let out = sanitize("a=candidate:1 1 udp\n");
        assert_eq!(out, "a=candidate:1 1 udp\r\n");
    }
}
