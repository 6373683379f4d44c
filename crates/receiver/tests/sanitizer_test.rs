//! SDP sanitizer behaviour on realistic offers and pasted answers

use webrtc_receiver::sdp::{sanitize, CandidateFilter, SdpSanitizer, SessionDescription};

const BROWSER_ANSWER: &str = "v=0
o=- 4611731400430051336 2 IN IP4 127.0.0.1
s=-
t=0 0
a=group:BUNDLE 0
m=video 9 UDP/TLS/RTP/SAVPF 96
c=IN IP4 0.0.0.0
a=rtcp-mux
a=rtcp-mux-only
a=mid:0
a=sendonly
a=rtpmap:96 VP8/90000
a=candidate:1 1 udp 2122260223 192.168.1.20 54321 typ host generation 0
a=candidate:2 1 udp 1686052607 203.0.113.7 54321 typ srflx raddr 192.168.1.20 rport 54321
a=candidate:3 1 tcp 1518280447 192.168.1.20 9 typ host tcptype active
a=candidate:4 1 udp 2122262783 2001:db8::1 54322 typ host
a=candidate:5 1 udp 41885695 198.51.100.4 3478 typ relay raddr 0.0.0.0 rport 0
a=end-of-candidates
";

#[test]
fn test_end_to_end_example() {
    let raw = "v=0\r\na=candidate:1 1 TCP 100 10.0.0.1 9999 typ host\r\na=end-of-candidates\r\n";
    assert_eq!(sanitize(raw), "v=0\r\n");
}

#[test]
fn test_browser_answer_pasted_with_banners() {
    let pasted = format!(
        "===== SDP ANSWER =====\n{}===== END SDP =====\n",
        BROWSER_ANSWER
    );
    let out = sanitize(&pasted);

    assert!(out.starts_with("v=0\r\n"));
    assert!(!out.contains("====="));
    assert!(!out.contains("a=rtcp-mux-only"));
    assert!(out.contains("a=rtcp-mux\r\n"));
    assert!(!out.contains("a=end-of-candidates"));

    // Host IPv4 UDP and relay survive; srflx, TCP and IPv6 do not
    assert!(out.contains("a=candidate:1 "));
    assert!(out.contains("a=candidate:5 "));
    assert!(!out.contains("a=candidate:2 "));
    assert!(!out.contains("a=candidate:3 "));
    assert!(!out.contains("a=candidate:4 "));

    SessionDescription::answer(out).unwrap();
}

#[test]
fn test_strict_filter_drops_host_candidates() {
    let out = SdpSanitizer::new(CandidateFilter::strict()).sanitize(BROWSER_ANSWER);
    assert!(!out.contains("typ host"));
    assert!(out.contains("a=candidate:5 "));
}

#[test]
fn test_idempotent_and_crlf_on_every_line() {
    for filter in [CandidateFilter::default(), CandidateFilter::strict()] {
        let sanitizer = SdpSanitizer::new(filter);
        let once = sanitizer.sanitize(BROWSER_ANSWER);
        assert_eq!(sanitizer.sanitize(&once), once);

        assert!(once.ends_with("\r\n"));
        for line in once.split_terminator("\r\n") {
            assert!(!line.contains('\r'));
            assert!(!line.contains('\n'));
            assert!(!line.is_empty());
        }
    }
}

#[test]
fn test_order_is_preserved() {
    let out = sanitize(BROWSER_ANSWER);
    let kept: Vec<&str> = out.split_terminator("\r\n").collect();
    let original: Vec<&str> = BROWSER_ANSWER.lines().map(str::trim).collect();

    let mut cursor = 0;
    for line in kept {
        let pos = original[cursor..]
            .iter()
            .position(|l| *l == line)
            .expect("sanitized line not found in order");
        cursor += pos + 1;
    }
}

#[test]
fn test_whitespace_only_input_is_empty() {
    assert_eq!(sanitize(""), "");
    assert_eq!(sanitize("  \r\n\t\n\n"), "");
    assert_eq!(sanitize("===== SDP OFFER (paste into browser) =====\n===== END SDP =====\n"), "");
}
