//! On-disk store of global and per-room user bans.
//!
//! The whole document is rewritten atomically (temp file + rename) on every
//! mutation; a failed save is logged and the in-memory state keeps the
//! mutation.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{error, warn};

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdminData {
    pub user_bans: HashSet<i64>,
    pub room_bans: HashMap<String, HashSet<i64>>,
}

pub struct AdminStore {
    path: PathBuf,
    data: parking_lot::RwLock<AdminData>,
    save_lock: tokio::sync::Mutex<()>,
}

impl AdminStore {
    pub fn load(path: PathBuf) -> Self {
        let data = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(data) => data,
                Err(error) => {
                    warn!(path = %path.display(), %error, "admin data unreadable, starting empty");
                    AdminData::default()
                }
            },
            Err(_) => AdminData::default(),
        };
        Self {
            path,
            data: parking_lot::RwLock::new(data),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn is_user_banned(&self, user: i64) -> bool {
        self.data.read().user_bans.contains(&user)
    }

    pub fn is_room_banned(&self, room: &str, user: i64) -> bool {
        self.data
            .read()
            .room_bans
            .get(room)
            .is_some_and(|banned| banned.contains(&user))
    }

    pub fn snapshot(&self) -> AdminData {
        self.data.read().clone()
    }

    /// Returns whether the ban set actually changed.
    pub async fn set_user_ban(&self, user: i64, banned: bool) -> bool {
        let changed = {
            let mut data = self.data.write();
            if banned {
                data.user_bans.insert(user)
            } else {
                data.user_bans.remove(&user)
            }
        };
        if changed {
            self.save().await;
        }
        changed
    }

    pub async fn set_room_ban(&self, room: &str, user: i64, banned: bool) -> bool {
        let changed = {
            let mut data = self.data.write();
            if banned {
                data.room_bans.entry(room.to_string()).or_default().insert(user)
            } else {
                match data.room_bans.get_mut(room) {
                    Some(banned_set) => {
                        let removed = banned_set.remove(&user);
                        if banned_set.is_empty() {
                            data.room_bans.remove(room);
                        }
                        removed
                    }
                    None => false,
                }
            }
        };
        if changed {
            self.save().await;
        }
        changed
    }

    async fn save(&self) {
        let _guard = self.save_lock.lock().await;
        let serialized = {
            let data = self.data.read();
            match serde_json::to_vec_pretty(&*data) {
                Ok(bytes) => bytes,
                Err(error) => {
                    error!(%error, "admin data serialization failed");
                    return;
                }
            }
        };
        let temp = self.path.with_extension("json.tmp");
        let result = async {
            tokio::fs::write(&temp, &serialized).await?;
            tokio::fs::rename(&temp, &self.path).await
        }
        .await;
        if let Err(error) = result {
            error!(path = %self.path.display(), %error, "admin data save failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn temp_store(name: &str) -> AdminStore {
        let mut path = env::temp_dir();
        path.push(format!("phira_mp_admin_{name}.json"));
        let _ = std::fs::remove_file(&path);
        AdminStore::load(path)
    }

    #[tokio::test]
    async fn user_bans_persist_and_reload() {
        let store = temp_store("user_bans");
        let path = store.path.clone();
        assert!(store.set_user_ban(99, true).await);
        assert!(store.is_user_banned(99));
        assert!(!store.set_user_ban(99, true).await);

        let reloaded = AdminStore::load(path.clone());
        assert!(reloaded.is_user_banned(99));
        assert!(reloaded.set_user_ban(99, false).await);
        assert!(!reloaded.is_user_banned(99));
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn room_bans_are_scoped() {
        let store = temp_store("room_bans");
        store.set_room_ban("652398", 7, true).await;
        assert!(store.is_room_banned("652398", 7));
        assert!(!store.is_room_banned("652398", 8));
        assert!(!store.is_room_banned("111111", 7));
        assert!(store.set_room_ban("652398", 7, false).await);
        assert!(!store.is_room_banned("652398", 7));
        let _ = std::fs::remove_file(&store.path);
    }

    #[test]
    fn unreadable_file_starts_empty() {
        let mut path = env::temp_dir();
        path.push("phira_mp_admin_corrupt.json");
        std::fs::write(&path, "not json").unwrap();
        let store = AdminStore::load(path.clone());
        assert!(!store.is_user_banned(1));
        let _ = std::fs::remove_file(path);
    }
}
