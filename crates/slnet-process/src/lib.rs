use std::collections::BTreeMap;

/// Identifies one supervised server process from spawn until exit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerState {
    #[default]
    Offline,
    Starting,
    Online,
    Idle,
}

impl ServerState {
    pub fn as_str(self) -> &'static str {
        match self {
            ServerState::Offline => "offline",
            ServerState::Starting => "starting",
            ServerState::Online => "online",
            ServerState::Idle => "idle",
        }
    }
}

impl std::fmt::Display for ServerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Semantic meaning of one console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsoleEvent {
    PortPrompt,
    EulaPrompt,
    ConfirmEditPrompt,
    GlobalPrompt,
    Heartbeat,
    IdleEnter,
    IdleExit,
    VersionAnnounce(String),
    PlainText(String),
}

/// Player facts extracted from a console line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerLine {
    Preauthenticated { id: String, address: String },
    Nickname { id: String, name: String },
    Disconnected { name: String, id: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct PlayerRecord {
    pub address: Option<String>,
    pub name: Option<String>,
}

pub type PlayerSnapshot = BTreeMap<String, PlayerRecord>;

#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessStats {
    pub cpu_percent: f64,
    pub memory_mb: f64,
}

/// Observer feed published by the lifecycle controller.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum ServerEvent {
    ServerLog {
        text: String,
    },
    ServerExit {
        code: Option<i32>,
    },
    ServerError {
        message: String,
    },
    Stats {
        cpu_percent: f64,
        memory_mb: f64,
    },
    State {
        state: ServerState,
    },
    Version {
        version: String,
    },
    Players {
        players: PlayerSnapshot,
    },
    Fatal {
        message: String,
        crash_report: Option<String>,
    },
}

impl ServerEvent {
    pub fn log(text: impl Into<String>) -> Self {
        ServerEvent::ServerLog { text: text.into() }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::ServerError {
            message: message.into(),
        }
    }
}

impl From<ProcessStats> for ServerEvent {
    fn from(s: ProcessStats) -> Self {
        ServerEvent::Stats {
            cpu_percent: s.cpu_percent,
            memory_mb: s.memory_mb,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusSnapshot {
    pub state: ServerState,
    pub port: u16,
    pub session_id: Option<SessionId>,
    pub pid: Option<u32>,
    pub started_at_unix_ms: Option<u64>,
    pub game_version: Option<String>,
    pub players: PlayerSnapshot,
    pub stats: Option<ProcessStats>,
    pub server_dir: Option<String>,
}

impl StatusSnapshot {
    pub fn uptime_secs(&self, now_unix_ms: u64) -> Option<u64> {
        self.started_at_unix_ms
            .map(|started| now_unix_ms.saturating_sub(started) / 1000)
    }
}

/// Renders an uptime as `Hh Mm Ss`.
pub fn format_uptime(secs: u64) -> String {
    let hours = secs / 3600;
    let minutes = (secs % 3600) / 60;
    let seconds = secs % 60;
    format!("{hours}h {minutes}m {seconds}s")
}
