use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};
use std::time::Duration;

use tracing::{info, warn};

use parlor_db::Database;
use parlor_db::queries::Leaderboard;
use parlor_types::api::Caller;
use parlor_types::models::{ChatMessage, DEFAULT_AVATAR_URL};

use crate::state::AppState;

/// How many users each leaderboard ranks.
pub const LEADERBOARD_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Ranks {
    pub usage: u32,
    pub balance: u32,
}

/// Snapshot of leaderboard positions, rebuilt periodically.
#[derive(Default)]
pub struct RankCache {
    ranks: RwLock<HashMap<i64, Ranks>>,
}

impl RankCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ranks for `user_id`; 0 means unranked.
    pub fn get(&self, user_id: i64) -> Ranks {
        if user_id <= 0 {
            return Ranks::default();
        }
        self.ranks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&user_id)
            .copied()
            .unwrap_or_default()
    }

    /// Rebuild from both leaderboards. A failing board is logged and left
    /// out rather than discarding the other one.
    pub fn refresh(&self, db: &Database) -> usize {
        let mut next: HashMap<i64, Ranks> = HashMap::new();

        match db.leaderboard(Leaderboard::Usage, LEADERBOARD_SIZE) {
            Ok(ids) => {
                for (pos, id) in ids.into_iter().enumerate() {
                    next.entry(id).or_default().usage = pos as u32 + 1;
                }
            }
            Err(e) => warn!("Failed to load usage leaderboard for rank cache: {}", e),
        }

        match db.leaderboard(Leaderboard::Balance, LEADERBOARD_SIZE) {
            Ok(ids) => {
                for (pos, id) in ids.into_iter().enumerate() {
                    next.entry(id).or_default().balance = pos as u32 + 1;
                }
            }
            Err(e) => warn!("Failed to load balance leaderboard for rank cache: {}", e),
        }

        let count = next.len();
        *self.ranks.write().unwrap_or_else(PoisonError::into_inner) = next;
        count
    }
}

/// Background task that keeps the rank cache fresh.
pub async fn run_rank_refresh_loop(state: AppState, interval: Duration) {
    let mut interval = tokio::time::interval(interval);

    loop {
        interval.tick().await;

        let st = state.clone();
        match tokio::task::spawn_blocking(move || st.ranks.refresh(&st.db)).await {
            Ok(count) => info!("Rank cache refreshed with {} users", count),
            Err(e) => warn!("Rank cache refresh task failed: {}", e),
        }
    }
}

/// Name shown next to a message: the profile's display name when set,
/// otherwise the caller's username.
pub fn display_name_for(db: &Database, caller: &Caller) -> String {
    if caller.is_anonymous() {
        return caller.username.clone();
    }
    match db.get_profile(caller.user_id) {
        Ok(Some(profile)) if !profile.display_name.is_empty() => profile.display_name,
        Ok(_) => caller.username.clone(),
        Err(e) => {
            warn!("Profile lookup failed for user {}: {}", caller.user_id, e);
            caller.username.clone()
        }
    }
}

/// Fill in avatar, quota and rank fields. Never fails; missing data leaves
/// defaults in place.
pub fn enrich(db: &Database, ranks: &RankCache, msg: &mut ChatMessage) {
    msg.avatar = DEFAULT_AVATAR_URL.to_string();
    if msg.user_id <= 0 {
        return;
    }

    let profile = match db.get_profile(msg.user_id) {
        Ok(Some(profile)) => profile,
        Ok(None) => return,
        Err(e) => {
            warn!("Profile lookup failed for user {}: {}", msg.user_id, e);
            return;
        }
    };

    if !profile.avatar_url.is_empty() {
        msg.avatar = profile.avatar_url;
    }
    msg.quota = profile.quota;
    msg.used_quota = profile.used_quota;

    let Ranks { usage, balance } = ranks.get(msg.user_id);
    msg.usage_rank = usage;
    msg.balance_rank = balance;
}

pub fn enrich_all(db: &Database, ranks: &RankCache, messages: &mut [ChatMessage]) {
    for msg in messages {
        enrich(db, ranks, msg);
    }
}
