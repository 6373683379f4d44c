//! SDP handling: descriptions, candidate lines and the browser sanitizer

pub mod candidate;
pub mod description;
pub mod sanitizer;

pub use candidate::{CandidateFilter, CandidateType, IceCandidateLine};
pub use description::{SdpLine, SdpType, SessionDescription};
pub use sanitizer::{sanitize, SdpSanitizer};
