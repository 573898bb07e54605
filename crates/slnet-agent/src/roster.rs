use slnet_process::{PlayerLine, PlayerSnapshot};

use crate::console;

/// Connected players as far as the console log shows.
///
/// Entries only leave on a disconnect line or [`PlayerRoster::clear`]; a missed
/// disconnect keeps a player listed until the session ends.
#[derive(Debug, Default)]
pub struct PlayerRoster {
    players: PlayerSnapshot,
}

impl PlayerRoster {
    /// Applies one console line. Returns true when the roster changed.
    pub fn on_line(&mut self, line: &str) -> bool {
        let Some(parsed) = console::player_line(line) else {
            return false;
        };

        match parsed {
            PlayerLine::Preauthenticated { id, address } => {
                tracing::debug!(player = %id, %address, "player preauthenticated");
                let record = self.players.entry(id).or_default();
                if record.address.as_deref() == Some(address.as_str()) {
                    return false;
                }
                record.address = Some(address);
                true
            }
            PlayerLine::Nickname { id, name } => {
                tracing::debug!(player = %id, %name, "player nickname set");
                let record = self.players.entry(id).or_default();
                if record.name.as_deref() == Some(name.as_str()) {
                    return false;
                }
                record.name = Some(name);
                true
            }
            PlayerLine::Disconnected { name, id } => {
                let removed = self.players.remove(&id).is_some();
                if removed {
                    tracing::debug!(player = %id, %name, "player disconnected");
                }
                removed
            }
        }
    }

    pub fn snapshot(&self) -> PlayerSnapshot {
        self.players.clone()
    }

    pub fn clear(&mut self) -> bool {
        let had_players = !self.players.is_empty();
        self.players.clear();
        had_players
    }
}
