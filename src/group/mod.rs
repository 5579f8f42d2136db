//! Cached group metadata and routing decisions.
//!
//! The manager serves groups through a read-through cache keyed by name.
//! Invalidation is explicit: every admin mutation bumps a monotonic version
//! and flushes the maps; in-flight readers may finish with the old value,
//! readers arriving after `invalidate()` observe the new one.

pub mod types;

use crate::crypto::constant_time_eq;
use crate::database::DatabaseManager;
use crate::database::entities::groups;
use crate::error::AppError;
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

pub use types::{
    EffectiveConfig, GroupConfig, HeaderAction, HeaderRule, Upstream, is_valid_group_name,
    is_valid_validation_endpoint, normalize_header_rules, parse_expires_at, split_proxy_keys,
};

/// A group with its JSON columns parsed into routing shape.
#[derive(Debug, Clone)]
pub struct GroupRoute {
    pub group: groups::Model,
    pub upstreams: Vec<Upstream>,
    pub header_rules: Vec<HeaderRule>,
    pub model_redirects: HashMap<String, String>,
    pub param_overrides: serde_json::Map<String, serde_json::Value>,
    pub proxy_keys: Vec<String>,
    pub config: GroupConfig,
    /// `(sub_group_id, weight)` edges; empty for standard groups.
    pub children: Vec<(i32, u32)>,
}

impl GroupRoute {
    pub fn from_model(group: groups::Model, children: Vec<(i32, u32)>) -> Result<Self, AppError> {
        let parse = |what: &str, err: serde_json::Error| {
            AppError::Internal(format!("group {}: malformed {what}: {err}", group.name))
        };

        let upstreams: Vec<Upstream> = serde_json::from_value(group.upstreams.clone())
            .map_err(|e| parse("upstreams", e))?;
        let header_rules: Vec<HeaderRule> = serde_json::from_value(group.header_rules.clone())
            .map_err(|e| parse("header_rules", e))?;
        let model_redirects: HashMap<String, String> =
            serde_json::from_value(group.model_redirect_rules.clone())
                .map_err(|e| parse("model_redirect_rules", e))?;
        let param_overrides = match &group.param_overrides {
            serde_json::Value::Object(map) => map.clone(),
            serde_json::Value::Null => serde_json::Map::new(),
            _ => {
                return Err(AppError::Internal(format!(
                    "group {}: param_overrides is not an object",
                    group.name
                )));
            }
        };
        let config: GroupConfig =
            serde_json::from_value(group.config.clone()).map_err(|e| parse("config", e))?;
        let proxy_keys = split_proxy_keys(&group.proxy_keys);

        Ok(Self {
            group,
            upstreams,
            header_rules,
            model_redirects,
            param_overrides,
            proxy_keys,
            config,
            children,
        })
    }

    pub fn id(&self) -> i32 {
        self.group.id
    }

    pub fn name(&self) -> &str {
        &self.group.name
    }

    pub fn is_aggregate(&self) -> bool {
        self.group.is_aggregate()
    }

    /// Constant-time membership test of the presented proxy credential.
    /// Every configured key is compared so timing does not leak position.
    pub fn authorize(&self, credential: &str) -> bool {
        let mut matched = false;
        for key in &self.proxy_keys {
            matched |= constant_time_eq(key, credential);
        }
        matched
    }

    pub fn effective(&self, defaults: &crate::config::ProxyDefaults) -> EffectiveConfig {
        self.config.effective(defaults)
    }
}

/// Weighted random pick over `(index, weight)` pairs; `None` when the total
/// weight is zero.
fn weighted_pick(weights: &[u32]) -> Option<usize> {
    let total: u64 = weights.iter().map(|w| *w as u64).sum();
    if total == 0 {
        return None;
    }
    let mut roll = rand::rng().random_range(0..total);
    for (idx, w) in weights.iter().enumerate() {
        let w = *w as u64;
        if roll < w {
            return Some(idx);
        }
        roll -= w;
    }
    None
}

pub struct GroupManager {
    db: Arc<DatabaseManager>,
    by_name: RwLock<HashMap<String, Arc<GroupRoute>>>,
    by_id: RwLock<HashMap<i32, Arc<GroupRoute>>>,
    version: AtomicU64,
}

impl GroupManager {
    pub fn new(db: Arc<DatabaseManager>) -> Self {
        Self {
            db,
            by_name: RwLock::new(HashMap::new()),
            by_id: RwLock::new(HashMap::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Cold load: parse every group and warm both indexes.
    pub async fn initialize(&self) -> Result<(), AppError> {
        let models = self.db.groups().list().await?;
        let mut by_name = HashMap::with_capacity(models.len());
        let mut by_id = HashMap::with_capacity(models.len());
        for model in models {
            let children = self.load_children(&model).await?;
            let route = Arc::new(GroupRoute::from_model(model, children)?);
            by_name.insert(route.name().to_string(), route.clone());
            by_id.insert(route.id(), route);
        }
        let count = by_id.len();
        *self.by_name.write().await = by_name;
        *self.by_id.write().await = by_id;
        tracing::info!(groups = count, "group cache warmed");
        Ok(())
    }

    async fn load_children(&self, model: &groups::Model) -> Result<Vec<(i32, u32)>, AppError> {
        if !model.is_aggregate() {
            return Ok(Vec::new());
        }
        let edges = self.db.groups().sub_groups(model.id).await?;
        Ok(edges
            .into_iter()
            .map(|e| (e.sub_group_id, e.weight.max(0) as u32))
            .collect())
    }

    pub async fn get(&self, name: &str) -> Result<Arc<GroupRoute>, AppError> {
        if let Some(route) = self.by_name.read().await.get(name) {
            return Ok(route.clone());
        }

        let model = self
            .db
            .groups()
            .find_by_name(name)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("group {name}")))?;
        self.cache_model(model).await
    }

    pub async fn get_by_id(&self, id: i32) -> Result<Arc<GroupRoute>, AppError> {
        if let Some(route) = self.by_id.read().await.get(&id) {
            return Ok(route.clone());
        }

        let model = self
            .db
            .groups()
            .find_by_id(id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("group #{id}")))?;
        self.cache_model(model).await
    }

    async fn cache_model(&self, model: groups::Model) -> Result<Arc<GroupRoute>, AppError> {
        let children = self.load_children(&model).await?;
        let route = Arc::new(GroupRoute::from_model(model, children)?);
        self.by_name
            .write()
            .await
            .insert(route.name().to_string(), route.clone());
        self.by_id.write().await.insert(route.id(), route.clone());
        Ok(route)
    }

    pub async fn list(&self) -> Result<Vec<groups::Model>, AppError> {
        Ok(self.db.groups().list().await?)
    }

    /// Flush the cache after any group or sub-group mutation.
    pub async fn invalidate(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
        self.by_name.write().await.clear();
        self.by_id.write().await.clear();
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Resolve an aggregate group to one of its children by weighted random.
    pub async fn pick_child(&self, route: &GroupRoute) -> Result<Arc<GroupRoute>, AppError> {
        let eligible: Vec<(i32, u32)> = route
            .children
            .iter()
            .copied()
            .filter(|(_, w)| *w > 0)
            .collect();
        let weights: Vec<u32> = eligible.iter().map(|(_, w)| *w).collect();
        let idx = weighted_pick(&weights)
            .ok_or_else(|| AppError::NoChildGroupAvailable(route.name().to_string()))?;
        self.get_by_id(eligible[idx].0).await
    }

    /// Weighted upstream selection for one attempt.
    pub fn select_upstream(route: &GroupRoute) -> Result<Upstream, AppError> {
        let weights: Vec<u32> = route.upstreams.iter().map(|u| u.weight).collect();
        let idx = weighted_pick(&weights).ok_or_else(|| {
            AppError::Internal(format!("group {} has no eligible upstream", route.name()))
        })?;
        Ok(route.upstreams[idx].clone())
    }

    /// Flush on shutdown; nothing else to release.
    pub async fn stop(&self) {
        self.invalidate().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_pick_zero_total() {
        assert!(weighted_pick(&[]).is_none());
        assert!(weighted_pick(&[0, 0]).is_none());
    }

    #[test]
    fn test_weighted_pick_single() {
        for _ in 0..20 {
            assert_eq!(weighted_pick(&[0, 7, 0]), Some(1));
        }
    }

    #[test]
    fn test_weighted_pick_distribution() {
        // B:3, C:1: over many trials B should land near 75%.
        let weights = [3u32, 1u32];
        let mut counts = [0u32; 2];
        let trials = 4000;
        for _ in 0..trials {
            counts[weighted_pick(&weights).unwrap()] += 1;
        }
        let b_share = counts[0] as f64 / trials as f64;
        assert!(
            (0.70..0.80).contains(&b_share),
            "expected ~0.75, got {b_share}"
        );
    }

    #[test]
    fn test_authorize_constant_time_membership() {
        let group = groups::Model {
            id: 1,
            name: "g1".into(),
            display_name: String::new(),
            description: String::new(),
            group_type: "standard".into(),
            channel_type: "openai".into(),
            upstreams: serde_json::json!([{"url": "https://api.openai.com", "weight": 1}]),
            test_model: "gpt-4o-mini".into(),
            validation_endpoint: String::new(),
            param_overrides: serde_json::json!({}),
            model_redirect_rules: serde_json::json!({}),
            model_redirect_strict: false,
            header_rules: serde_json::json!([]),
            proxy_keys: "proxy-123\nproxy-456".into(),
            config: serde_json::json!({}),
            sort: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        let route = GroupRoute::from_model(group, vec![]).unwrap();
        assert!(route.authorize("proxy-123"));
        assert!(route.authorize("proxy-456"));
        assert!(!route.authorize("proxy-789"));
        assert!(!route.authorize(""));
    }

    #[test]
    fn test_from_model_rejects_malformed_json() {
        let mut group = groups::Model {
            id: 1,
            name: "bad".into(),
            display_name: String::new(),
            description: String::new(),
            group_type: "standard".into(),
            channel_type: "openai".into(),
            upstreams: serde_json::json!("not an array"),
            test_model: "m".into(),
            validation_endpoint: String::new(),
            param_overrides: serde_json::json!({}),
            model_redirect_rules: serde_json::json!({}),
            model_redirect_strict: false,
            header_rules: serde_json::json!([]),
            proxy_keys: String::new(),
            config: serde_json::json!({}),
            sort: 0,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        };
        assert!(GroupRoute::from_model(group.clone(), vec![]).is_err());

        group.upstreams = serde_json::json!([]);
        group.config = serde_json::json!({"bogus": 1});
        assert!(GroupRoute::from_model(group, vec![]).is_err());
    }
}
