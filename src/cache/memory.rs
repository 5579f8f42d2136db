use super::{KvError, KvResult, KvStore};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

enum Value {
    Str(String),
    Int(i64),
    List(VecDeque<String>),
    Set(HashSet<String>),
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self) -> bool {
        self.expires_at.is_some_and(|t| t <= Instant::now())
    }
}

/// In-process store. All operations run under one mutex, which makes every
/// compound transition trivially atomic. TTLs are enforced lazily on access.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn take_live<'a>(map: &'a mut HashMap<String, Entry>, key: &str) -> Option<&'a mut Entry> {
    if map.get(key).is_some_and(Entry::expired) {
        map.remove(key);
    }
    map.get_mut(key)
}

fn list_entry<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> KvResult<&'a mut VecDeque<String>> {
    let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::List(VecDeque::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::List(list) => Ok(list),
        _ => Err(KvError::WrongType(key.to_string())),
    }
}

fn set_entry<'a>(
    map: &'a mut HashMap<String, Entry>,
    key: &str,
) -> KvResult<&'a mut HashSet<String>> {
    let entry = map.entry(key.to_string()).or_insert_with(|| Entry {
        value: Value::Set(HashSet::new()),
        expires_at: None,
    });
    match &mut entry.value {
        Value::Set(set) => Ok(set),
        _ => Err(KvError::WrongType(key.to_string())),
    }
}

fn incr_locked(
    map: &mut HashMap<String, Entry>,
    key: &str,
    ttl: Duration,
) -> KvResult<i64> {
    if map.get(key).is_some_and(Entry::expired) {
        map.remove(key);
    }
    match map.get_mut(key) {
        Some(entry) => match &mut entry.value {
            Value::Int(n) => {
                *n += 1;
                Ok(*n)
            }
            _ => Err(KvError::WrongType(key.to_string())),
        },
        None => {
            map.insert(
                key.to_string(),
                Entry {
                    value: Value::Int(1),
                    expires_at: Some(Instant::now() + ttl),
                },
            );
            Ok(1)
        }
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut map = self.inner.lock().unwrap();
        match take_live(&mut map, key) {
            Some(Entry {
                value: Value::Str(s),
                ..
            }) => Ok(Some(s.clone())),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> KvResult<()> {
        let mut map = self.inner.lock().unwrap();
        map.insert(
            key.to_string(),
            Entry {
                value: Value::Str(value.to_string()),
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> KvResult<()> {
        self.inner.lock().unwrap().remove(key);
        Ok(())
    }

    async fn incr(&self, key: &str, ttl: Duration) -> KvResult<i64> {
        let mut map = self.inner.lock().unwrap();
        incr_locked(&mut map, key, ttl)
    }

    async fn rotate(&self, key: &str) -> KvResult<Option<String>> {
        let mut map = self.inner.lock().unwrap();
        match take_live(&mut map, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => match list.pop_front() {
                Some(head) => {
                    list.push_back(head.clone());
                    Ok(Some(head))
                }
                None => Ok(None),
            },
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(None),
        }
    }

    async fn list_push(&self, key: &str, values: &[String]) -> KvResult<()> {
        let mut map = self.inner.lock().unwrap();
        let list = list_entry(&mut map, key)?;
        for v in values {
            list.push_back(v.clone());
        }
        Ok(())
    }

    async fn list_remove(&self, key: &str, value: &str) -> KvResult<usize> {
        let mut map = self.inner.lock().unwrap();
        match take_live(&mut map, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => {
                let before = list.len();
                list.retain(|v| v != value);
                Ok(before - list.len())
            }
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    async fn list_len(&self, key: &str) -> KvResult<usize> {
        let mut map = self.inner.lock().unwrap();
        match take_live(&mut map, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.len()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(0),
        }
    }

    async fn list_all(&self, key: &str) -> KvResult<Vec<String>> {
        let mut map = self.inner.lock().unwrap();
        match take_live(&mut map, key) {
            Some(Entry {
                value: Value::List(list),
                ..
            }) => Ok(list.iter().cloned().collect()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()> {
        let mut map = self.inner.lock().unwrap();
        set_entry(&mut map, key)?.insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<bool> {
        let mut map = self.inner.lock().unwrap();
        match take_live(&mut map, key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.remove(member)),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(false),
        }
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        let mut map = self.inner.lock().unwrap();
        match take_live(&mut map, key) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => Ok(set.iter().cloned().collect()),
            Some(_) => Err(KvError::WrongType(key.to_string())),
            None => Ok(Vec::new()),
        }
    }

    async fn incr_and_demote(
        &self,
        counter: &str,
        ttl: Duration,
        threshold: i64,
        active_list: &str,
        invalid_set: &str,
        member: &str,
    ) -> KvResult<(i64, bool)> {
        let mut map = self.inner.lock().unwrap();
        let count = incr_locked(&mut map, counter, ttl)?;
        let mut demoted = false;
        if count >= threshold {
            let removed = match take_live(&mut map, active_list) {
                Some(Entry {
                    value: Value::List(list),
                    ..
                }) => {
                    let before = list.len();
                    list.retain(|v| v != member);
                    before - list.len()
                }
                _ => 0,
            };
            if removed > 0 {
                set_entry(&mut map, invalid_set)?.insert(member.to_string());
                demoted = true;
            }
        }
        Ok((count, demoted))
    }

    async fn promote_member(
        &self,
        invalid_set: &str,
        active_list: &str,
        member: &str,
        counter: &str,
    ) -> KvResult<bool> {
        let mut map = self.inner.lock().unwrap();
        let removed = match take_live(&mut map, invalid_set) {
            Some(Entry {
                value: Value::Set(set),
                ..
            }) => set.remove(member),
            _ => false,
        };
        if removed {
            list_entry(&mut map, active_list)?.push_back(member.to_string());
            map.remove(counter);
        }
        Ok(removed)
    }

    async fn ping(&self) -> KvResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_rotate_round_robin() {
        let store = MemoryStore::new();
        store
            .list_push("k", &["a".into(), "b".into(), "c".into()])
            .await
            .unwrap();

        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(store.rotate("k").await.unwrap().unwrap());
        }
        assert_eq!(seen, ["a", "b", "c", "a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_rotate_empty() {
        let store = MemoryStore::new();
        assert!(store.rotate("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rotate_concurrent_fairness() {
        let store = Arc::new(MemoryStore::new());
        let keys: Vec<String> = (0..4).map(|i| format!("k{i}")).collect();
        store.list_push("pool", &keys).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                for _ in 0..4 {
                    got.push(store.rotate("pool").await.unwrap().unwrap());
                }
                got
            }));
        }

        let mut counts: HashMap<String, usize> = HashMap::new();
        for h in handles {
            for k in h.await.unwrap() {
                *counts.entry(k).or_default() += 1;
            }
        }
        // 32 rotations over 4 keys: each key exactly 8 times.
        for key in &keys {
            assert_eq!(counts[key], 8, "uneven rotation: {counts:?}");
        }
    }

    #[tokio::test]
    async fn test_incr_ttl() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("c", Duration::from_millis(20)).await.unwrap(), 1);
        assert_eq!(store.incr("c", Duration::from_millis(20)).await.unwrap(), 2);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(store.incr("c", Duration::from_millis(20)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_and_demote_fires_once() {
        let store = MemoryStore::new();
        store.list_push("active", &["k1".into(), "k2".into()]).await.unwrap();

        let ttl = Duration::from_secs(60);
        let (n, moved) = store
            .incr_and_demote("fail:k1", ttl, 3, "active", "invalid", "k1")
            .await
            .unwrap();
        assert_eq!((n, moved), (1, false));
        let (n, moved) = store
            .incr_and_demote("fail:k1", ttl, 3, "active", "invalid", "k1")
            .await
            .unwrap();
        assert_eq!((n, moved), (2, false));
        let (n, moved) = store
            .incr_and_demote("fail:k1", ttl, 3, "active", "invalid", "k1")
            .await
            .unwrap();
        assert_eq!((n, moved), (3, true));

        // Subsequent failures are no-ops on membership.
        let (_, moved) = store
            .incr_and_demote("fail:k1", ttl, 3, "active", "invalid", "k1")
            .await
            .unwrap();
        assert!(!moved);

        assert_eq!(store.list_all("active").await.unwrap(), vec!["k2"]);
        assert_eq!(store.set_members("invalid").await.unwrap(), vec!["k1"]);
    }

    #[tokio::test]
    async fn test_promote_restores_membership() {
        let store = MemoryStore::new();
        store.list_push("active", &["k1".into()]).await.unwrap();
        let ttl = Duration::from_secs(60);
        store
            .incr_and_demote("fail:k1", ttl, 1, "active", "invalid", "k1")
            .await
            .unwrap();
        assert!(store.list_all("active").await.unwrap().is_empty());

        let promoted = store
            .promote_member("invalid", "active", "k1", "fail:k1")
            .await
            .unwrap();
        assert!(promoted);
        assert_eq!(store.list_all("active").await.unwrap(), vec!["k1"]);
        assert!(store.set_members("invalid").await.unwrap().is_empty());
        // Counter was cleared along with the move.
        assert_eq!(store.incr("fail:k1", ttl).await.unwrap(), 1);

        // Promoting again is a no-op.
        assert!(
            !store
                .promote_member("invalid", "active", "k1", "fail:k1")
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_str_ttl_expiry() {
        let store = MemoryStore::new();
        store
            .set("s", "v", Some(Duration::from_millis(10)))
            .await
            .unwrap();
        assert_eq!(store.get("s").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(store.get("s").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_wrong_type() {
        let store = MemoryStore::new();
        store.set("s", "v", None).await.unwrap();
        assert!(matches!(
            store.rotate("s").await,
            Err(KvError::WrongType(_))
        ));
    }
}
