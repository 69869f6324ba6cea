use crate::intent::IntentUpdate;
use ethers::types::Address;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Sink for intent transition events.
pub trait Notifier: Send + Sync {
    fn notify(&self, update: &IntentUpdate);
}

struct Subscriber {
    tx: mpsc::UnboundedSender<IntentUpdate>,
}

#[derive(Default)]
struct Registry {
    by_player: HashMap<Address, Vec<Subscriber>>,
    by_game: HashMap<String, Vec<Subscriber>>,
}

/// Fans updates out along exactly two keys: player address and game id.
/// Subscribers with dropped receivers are pruned on the next matching event.
#[derive(Default)]
pub struct FanoutNotifier {
    registry: Mutex<Registry>,
}

impl FanoutNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe_player(&self, player: Address) -> mpsc::UnboundedReceiver<IntentUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .by_player
            .entry(player)
            .or_default()
            .push(Subscriber { tx });
        rx
    }

    pub fn subscribe_game(&self, game_id: &str) -> mpsc::UnboundedReceiver<IntentUpdate> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock()
            .by_game
            .entry(game_id.to_string())
            .or_default()
            .push(Subscriber { tx });
        rx
    }
}

fn deliver(subs: &mut Vec<Subscriber>, update: &IntentUpdate) {
    subs.retain(|s| s.tx.send(update.clone()).is_ok());
}

impl Notifier for FanoutNotifier {
    fn notify(&self, update: &IntentUpdate) {
        let mut reg = self.lock();
        if let Some(subs) = reg.by_player.get_mut(&update.player) {
            deliver(subs, update);
            if subs.is_empty() {
                reg.by_player.remove(&update.player);
            }
        }
        if let Some(subs) = reg.by_game.get_mut(&update.game_id) {
            deliver(subs, update);
            if subs.is_empty() {
                reg.by_game.remove(&update.game_id);
            }
        }
    }
}
