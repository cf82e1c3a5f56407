//! Port discovery from interpreter output.
//!
//! The built-in server has no handshake; the only signal that it is ready is
//! the address it prints on startup. Detection sits behind
//! [`PortAnnouncement`] so the supervisor does not care how the port is found.

use once_cell::sync::Lazy;
use regex::Regex;

static LOOPBACK_PORT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:127\.0\.0\.1|localhost|\[::1\]):(\d{1,5})\b")
        .expect("loopback port pattern must compile")
});

/// Extracts a bound port from a chunk of process output
pub trait PortAnnouncement: Send + Sync {
    fn detect(&self, output: &str) -> Option<u16>;
}

/// Matches the first `127.0.0.1:<port>` style address with a usable port
#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackPortPattern;

impl PortAnnouncement for LoopbackPortPattern {
    fn detect(&self, output: &str) -> Option<u16> {
        LOOPBACK_PORT
            .captures_iter(output)
            .filter_map(|caps| caps.get(1)?.as_str().parse::<u16>().ok())
            .find(|port| *port != 0)
    }
}
