use std::sync::OnceLock;

use regex::Regex;
use slnet_process::{ConsoleEvent, PlayerLine};

struct Rule {
    matches: fn(&str) -> bool,
    build: fn(&str) -> ConsoleEvent,
}

// Priority order: first match wins.
const RULES: &[Rule] = &[
    Rule {
        matches: |l| l.contains("Port number (default: 7777):"),
        build: |_| ConsoleEvent::PortPrompt,
    },
    Rule {
        matches: |l| l.contains("Received first heartbeat"),
        build: |_| ConsoleEvent::Heartbeat,
    },
    Rule {
        matches: |l| l.contains("entered") && l.contains("idle mode"),
        build: |_| ConsoleEvent::IdleEnter,
    },
    Rule {
        matches: |l| l.contains("exited") && l.contains("idle mode"),
        build: |_| ConsoleEvent::IdleExit,
    },
    Rule {
        matches: |l| l.contains("accept") && l.contains("EULA"),
        build: |_| ConsoleEvent::EulaPrompt,
    },
    Rule {
        matches: |l| l.contains("edit") && l.contains("keep"),
        build: |_| ConsoleEvent::ConfirmEditPrompt,
    },
    Rule {
        matches: |l| l.contains("this") && l.contains("global"),
        build: |_| ConsoleEvent::GlobalPrompt,
    },
    Rule {
        matches: |l| l.contains("Game") && l.contains("version"),
        build: version_event,
    },
];

pub fn classify(line: &str) -> ConsoleEvent {
    RULES
        .iter()
        .find(|r| (r.matches)(line))
        .map(|r| (r.build)(line))
        .unwrap_or_else(|| ConsoleEvent::PlainText(line.to_string()))
}

fn version_event(line: &str) -> ConsoleEvent {
    static VERSION: OnceLock<Regex> = OnceLock::new();
    let re = VERSION.get_or_init(|| Regex::new(r"\d+\.\d+\.\d+").expect("version regex"));
    match re.find(line) {
        Some(m) => ConsoleEvent::VersionAnnounce(m.as_str().to_string()),
        None => ConsoleEvent::PlainText(line.to_string()),
    }
}

struct PlayerPatterns {
    preauth: Regex,
    nickname: Regex,
    disconnect: Regex,
}

fn player_patterns() -> &'static PlayerPatterns {
    static PATTERNS: OnceLock<PlayerPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| PlayerPatterns {
        preauth: Regex::new(
            r"\[.*\] Player (\d+)@steam preauthenticated from endpoint ([\d\.]+:\d+)\.",
        )
        .expect("preauth regex"),
        nickname: Regex::new(r"\[.*\] Nickname of (\d+)@steam is now (.+)\.")
            .expect("nickname regex"),
        disconnect: Regex::new(
            r"\[.*\] (.+) \((\d+)@steam\) disconnected from IP address ([\d\.]+)\.",
        )
        .expect("disconnect regex"),
    })
}

/// Extracts player join/identify/leave facts. Runs independently of [`classify`].
pub fn player_line(line: &str) -> Option<PlayerLine> {
    let p = player_patterns();

    // The three patterns are anchored on disjoint phrases, so at most one matches.
    if let Some(c) = p.preauth.captures(line) {
        return Some(PlayerLine::Preauthenticated {
            id: c[1].to_string(),
            address: c[2].to_string(),
        });
    }
    if let Some(c) = p.nickname.captures(line) {
        return Some(PlayerLine::Nickname {
            id: c[1].to_string(),
            name: c[2].to_string(),
        });
    }
    if let Some(c) = p.disconnect.captures(line) {
        return Some(PlayerLine::Disconnected {
            name: c[1].to_string(),
            id: c[2].to_string(),
        });
    }
    None
}

/// Reassembles raw output chunks into lines, preserving arrival order.
///
/// Works on bytes so a multi-byte character split across two reads is decoded
/// only once the whole line is present.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        // Bytes already pending hold no newline; only the new chunk is scanned.
        let mut scan = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut out = Vec::new();
        let mut start = 0;
        while let Some(off) = self.pending[scan..].iter().position(|b| *b == b'\n') {
            let end = scan + off;
            out.push(decode_line(&self.pending[start..end]));
            start = end + 1;
            scan = start;
        }
        self.pending.drain(..start);
        out
    }

    pub fn has_partial(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Flushes an unterminated trailing line (EOF, or a prompt waiting for input).
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        Some(decode_line(&raw))
    }
}

fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}
