//! 风格档案缓存：按调用方给定的 key 读写上一会话算出的档案
//!
//! 命中缓存时编排循环可以跳过 analyze 阶段。持久化本身不在核心职责内，这里只提供
//! 内存实现与一个简单的 JSON 文件实现。

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::core::StyleProfile;

/// 档案缓存
pub trait ProfileCache: Send + Sync {
    fn get(&self, key: &str) -> Option<StyleProfile>;
    fn put(&self, key: &str, profile: &StyleProfile);
}

/// 内存缓存（进程内多次运行共享）
#[derive(Debug, Default)]
pub struct InMemoryProfileCache {
    entries: Mutex<HashMap<String, StyleProfile>>,
}

impl InMemoryProfileCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProfileCache for InMemoryProfileCache {
    fn get(&self, key: &str) -> Option<StyleProfile> {
        self.entries.lock().ok()?.get(key).cloned()
    }

    fn put(&self, key: &str, profile: &StyleProfile) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(key.to_string(), profile.clone());
        }
    }
}

/// JSON 文件缓存：整个文件是 key → StyleProfile 的映射；读写失败只记日志
#[derive(Debug)]
pub struct FileProfileCache {
    path: PathBuf,
    lock: Mutex<()>,
}

impl FileProfileCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    fn load(&self) -> HashMap<String, StyleProfile> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return HashMap::new();
        };
        serde_json::from_str(&raw).unwrap_or_else(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "profile cache unreadable, ignoring");
            HashMap::new()
        })
    }
}

impl ProfileCache for FileProfileCache {
    fn get(&self, key: &str) -> Option<StyleProfile> {
        let _guard = self.lock.lock().ok()?;
        self.load().remove(key)
    }

    fn put(&self, key: &str, profile: &StyleProfile) {
        let Ok(_guard) = self.lock.lock() else {
            return;
        };
        let mut entries = self.load();
        entries.insert(key.to_string(), profile.clone());
        let written = serde_json::to_string_pretty(&entries)
            .map_err(|e| e.to_string())
            .and_then(|json| std::fs::write(&self.path, json).map_err(|e| e.to_string()));
        if let Err(e) = written {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write profile cache");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_roundtrip() {
        let cache = InMemoryProfileCache::new();
        assert!(cache.get("brand").is_none());
        cache.put("brand", &StyleProfile::default_profile());
        assert_eq!(cache.get("brand"), Some(StyleProfile::default_profile()));
    }

    #[test]
    fn test_file_cache_persists_between_instances() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        let mut profile = StyleProfile::default_profile();
        profile.voice = "Playful".to_string();
        FileProfileCache::new(&path).put("acme", &profile);
        let reopened = FileProfileCache::new(&path);
        assert_eq!(reopened.get("acme").map(|p| p.voice), Some("Playful".to_string()));
        assert!(reopened.get("other").is_none());
    }

    #[test]
    fn test_corrupt_file_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("profiles.json");
        std::fs::write(&path, "not json").unwrap();
        assert!(FileProfileCache::new(&path).get("acme").is_none());
    }
}
