//! Role- and department-based permission resolution.
//!
//! Rules:
//! - Admin users may use every active tool/skill.
//! - Everyone else gets the union of their roles' grants, minus anything
//!   their department has explicitly blocked, restricted to active rows.
//!
//! Results are cached for five minutes per `(user, kind)`. The cache is a
//! performance hint, not a correctness gate: permission-relevant writes
//! invalidate it best-effort (invalidate-all is fine), and a repository
//! failure degrades to the empty set so a turn proceeds with built-in
//! tools only.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::entities::User;
use crate::repository::Repository;

pub const CACHE_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PermissionKind {
    Tools,
    Skills,
}

struct CacheEntry {
    names: HashSet<String>,
    fetched_at: Instant,
}

pub struct PermissionResolver {
    repo: Arc<Repository>,
    cache: Mutex<HashMap<(i64, PermissionKind), CacheEntry>>,
    ttl: Duration,
}

impl PermissionResolver {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self::with_ttl(repo, CACHE_TTL)
    }

    pub fn with_ttl(repo: Arc<Repository>, ttl: Duration) -> Self {
        Self {
            repo,
            cache: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// All active MCP tool names the user may use.
    pub async fn resolve_tools(&self, user: &User) -> HashSet<String> {
        self.resolve(user, PermissionKind::Tools).await
    }

    /// All active skill names the user may use.
    pub async fn resolve_skills(&self, user: &User) -> HashSet<String> {
        self.resolve(user, PermissionKind::Skills).await
    }

    async fn resolve(&self, user: &User, kind: PermissionKind) -> HashSet<String> {
        if let Some(cached) = self.cached(user.id, kind) {
            return cached;
        }

        let result = self.resolve_uncached(user, kind).await;
        match result {
            Ok(names) => {
                self.cache.lock().insert(
                    (user.id, kind),
                    CacheEntry {
                        names: names.clone(),
                        fetched_at: Instant::now(),
                    },
                );
                names
            }
            Err(e) => {
                // Non-fatal: the turn proceeds with built-ins only.
                tracing::warn!(
                    user_id = user.id,
                    kind = ?kind,
                    error = %e,
                    "permission resolution failed, treating as empty"
                );
                HashSet::new()
            }
        }
    }

    async fn resolve_uncached(
        &self,
        user: &User,
        kind: PermissionKind,
    ) -> dg_domain::error::Result<HashSet<String>> {
        if user.is_admin {
            return match kind {
                PermissionKind::Tools => self.repo.active_tool_names().await,
                PermissionKind::Skills => self.repo.active_skill_names().await,
            };
        }

        let mut granted = match kind {
            PermissionKind::Tools => self.repo.tool_names_for_roles(&user.role_ids).await?,
            PermissionKind::Skills => self.repo.skill_names_for_roles(&user.role_ids).await?,
        };

        if let Some(dept) = user.department_id {
            let blocked = match kind {
                PermissionKind::Tools => {
                    self.repo.tool_names_blocked_for_department(dept).await?
                }
                PermissionKind::Skills => {
                    self.repo.skill_names_blocked_for_department(dept).await?
                }
            };
            granted.retain(|name| !blocked.contains(name));
        }

        Ok(granted)
    }

    fn cached(&self, user_id: i64, kind: PermissionKind) -> Option<HashSet<String>> {
        let cache = self.cache.lock();
        let entry = cache.get(&(user_id, kind))?;
        if entry.fetched_at.elapsed() < self.ttl {
            Some(entry.names.clone())
        } else {
            None
        }
    }

    /// Drop cached entries for one user.
    pub fn invalidate_user(&self, user_id: i64) {
        self.cache.lock().retain(|(uid, _), _| *uid != user_id);
    }

    /// Drop the whole cache. Called on any permission-relevant write.
    pub fn invalidate_all(&self) {
        self.cache.lock().clear();
    }

    #[cfg(test)]
    fn cache_len(&self) -> usize {
        self.cache.lock().len()
    }
}
