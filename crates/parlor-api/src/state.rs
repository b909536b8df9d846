use std::sync::Arc;

use parlor_db::Database;
use parlor_gateway::hub::Hub;

use crate::attachments::AttachmentStore;
use crate::profiles::RankCache;
use crate::settings::SettingsStore;

pub type AppState = Arc<AppStateInner>;

/// Services shared by every handler and gateway connection. Built once at
/// startup and passed around explicitly.
pub struct AppStateInner {
    pub db: Database,
    pub hub: Hub,
    pub settings: SettingsStore,
    pub attachments: AttachmentStore,
    pub ranks: RankCache,
    pub jwt_secret: String,
}

impl AppStateInner {
    /// Assemble the state, loading persisted room settings from `db`.
    pub fn build(
        db: Database,
        hub: Hub,
        attachments: AttachmentStore,
        jwt_secret: String,
    ) -> anyhow::Result<AppState> {
        let settings = SettingsStore::load(&db)?;
        Ok(Arc::new(Self {
            db,
            hub,
            settings,
            attachments,
            ranks: RankCache::new(),
            jwt_secret,
        }))
    }
}
