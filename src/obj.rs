//! Redis objects: the tagged, refcounted value container shared by the
//! keyspace, client argv slots and reply queues.

use std::{cmp::Ordering, collections::{hash_set::Iter, HashSet, LinkedList}, hash::Hash, sync::{Arc, RwLock, RwLockWriteGuard}};
use once_cell::sync::Lazy;
use rand::Rng;

/// Shared "common" objects: built once, cloned (Arc bump) on every enqueue.
pub static OK: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"+OK\r\n".to_vec()) }))
});
pub static PONG: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"+PONG\r\n".to_vec()) }))
});
pub static C_ZERO: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"0\r\n".to_vec()) }))
});
pub static C_ONE: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"1\r\n".to_vec()) }))
});
pub static NULL_BULK: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"nil\r\n".to_vec()) }))
});
pub static NULL_MULTI_BULK: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"nil\r\n".to_vec()) }))
});
pub static EMPTY_MULTI_BULK: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"0\r\n".to_vec()) }))
});
pub static WRONG_TYPE_ERR: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"-2\r\n".to_vec()) }))
});
pub static NO_KEY_ERR: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"-1\r\n".to_vec()) }))
});
pub static SAME_OBJECT_ERR: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"-3\r\n".to_vec()) }))
});
pub static OUT_OF_RANGE_ERR: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"-4\r\n".to_vec()) }))
});
pub static SYNTAX_ERR: Lazy<Arc<RwLock<RedisObject>>> = Lazy::new(|| {
    Arc::new(RwLock::new(RedisObject::String { ptr: StringStorageType::Bytes(b"-ERR syntax error\r\n".to_vec()) }))
});

/// Bounded pool of recycled headers, drained by `create_object` and refilled
/// by `recycle_object`. Reduces allocator churn on churny workloads
/// (repeated SET/DEL of similarly-shaped values); discarding on overflow is
/// acceptable, the pool is a cache and not a correctness requirement.
const FREE_LIST_CAP: usize = 1024;
static FREE_LIST: Lazy<RwLock<Vec<Arc<RwLock<RedisObject>>>>> = Lazy::new(|| RwLock::new(Vec::new()));

fn free_list_write() -> RwLockWriteGuard<'static, Vec<Arc<RwLock<RedisObject>>>> {
    FREE_LIST.write().unwrap()
}

/// Allocate a fresh Value Object, reusing a free-list header when one is
/// available instead of allocating a new `Arc`.
pub fn create_object(value: RedisObject) -> Arc<RwLock<RedisObject>> {
    if let Some(recycled) = free_list_write().pop() {
        *recycled.write().unwrap() = value;
        return recycled;
    }
    Arc::new(RwLock::new(value))
}

/// Offer a header back to the free-list once nothing else references it.
/// Safe to call on a shared object still in use elsewhere: such objects are
/// simply not recycled.
pub fn recycle_object(obj: Arc<RwLock<RedisObject>>) {
    if Arc::strong_count(&obj) == 1 {
        let mut fl = free_list_write();
        if fl.len() < FREE_LIST_CAP {
            fl.push(obj);
        }
    }
}

pub fn free_list_len() -> usize {
    FREE_LIST.read().unwrap().len()
}

/// Object types.
#[derive(Clone, Eq)]
pub enum RedisObject {
    String { ptr: StringStorageType },
    List { l: ListStorageType },
    Set { s: SetStorageType },
}
impl RedisObject {
    /// Type code used by the snapshot codec.
    pub fn type_code(&self) -> u8 {
        match self {
            RedisObject::String { .. } => 0,
            RedisObject::List { .. } => 1,
            RedisObject::Set { .. } => 2,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RedisObject::String { .. } => "string",
            RedisObject::List { .. } => "list",
            RedisObject::Set { .. } => "set",
        }
    }

    pub fn is_string(&self) -> bool {
        matches!(self, Self::String { .. })
    }

    /// View a STRING object's bytes as a key/element (panics on non-string,
    /// callers only use this after confirming the variant).
    pub fn as_bytes(&self) -> Vec<u8> {
        self.string().unwrap().as_bytes()
    }

    pub fn string(&self) -> Option<&StringStorageType> {
        match self {
            Self::String { ptr } => Some(ptr),
            _ => None,
        }
    }

    pub fn string_mut(&mut self) -> Option<&mut StringStorageType> {
        match self {
            Self::String { ptr } => Some(ptr),
            _ => None,
        }
    }

    pub fn is_list(&self) -> bool {
        matches!(self, Self::List { .. })
    }

    pub fn list(&self) -> Option<&ListStorageType> {
        match self {
            Self::List { l } => Some(l),
            _ => None,
        }
    }

    pub fn list_mut(&mut self) -> Option<&mut ListStorageType> {
        match self {
            Self::List { l } => Some(l),
            _ => None,
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Self::Set { .. })
    }

    pub fn set(&self) -> Option<&SetStorageType> {
        match self {
            Self::Set { s } => Some(s),
            _ => None,
        }
    }

    pub fn set_mut(&mut self) -> Option<&mut SetStorageType> {
        match self {
            Self::Set { s } => Some(s),
            _ => None,
        }
    }

    /// Get a decoded version of an encoded object (returned as a new
    /// object). If the object is already raw-encoded, just clone it.
    pub fn get_decoded(&self) -> RedisObject {
        match self {
            Self::String { ptr: StringStorageType::Integer(n) } => {
                RedisObject::String { ptr: StringStorageType::Bytes(n.to_string().into_bytes()) }
            },
            _ => self.clone(),
        }
    }
}
impl PartialEq for RedisObject {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::String { ptr: l }, Self::String { ptr: r }) => l == r,
            _ => false,
        }
    }
}
impl Hash for RedisObject {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Self::String { ptr } => ptr.as_bytes().hash(state),
            _ => unreachable!("only STRING objects are used as set/dict keys"),
        }
    }
}

#[derive(Clone, Eq)]
pub enum StringStorageType {
    Bytes(Vec<u8>),
    Integer(i64),
}
impl StringStorageType {
    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bytes(b) => b.clone(),
            Self::Integer(n) => n.to_string().into_bytes(),
        }
    }
}
impl PartialEq for StringStorageType {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Bytes(l), Self::Bytes(r)) => l == r,
            (Self::Integer(l), Self::Integer(r)) => l == r,
            (Self::Bytes(l), Self::Integer(r)) => l.as_slice() == r.to_string().as_bytes(),
            (Self::Integer(l), Self::Bytes(r)) => r.as_slice() == l.to_string().as_bytes(),
        }
    }
}

#[derive(Clone, Eq)]
pub enum ListStorageType {
    LinkedList(LinkedList<RedisObject>),
}
impl ListStorageType {
    pub fn new() -> Self {
        Self::LinkedList(LinkedList::new())
    }

    pub fn push_front(&mut self, obj: RedisObject) {
        let Self::LinkedList(l) = self;
        l.push_front(obj);
    }
    pub fn push_back(&mut self, obj: RedisObject) {
        let Self::LinkedList(l) = self;
        l.push_back(obj);
    }
    pub fn pop_front(&mut self) -> Option<RedisObject> {
        let Self::LinkedList(l) = self;
        l.pop_front()
    }
    pub fn pop_back(&mut self) -> Option<RedisObject> {
        let Self::LinkedList(l) = self;
        l.pop_back()
    }
    pub fn len(&self) -> usize {
        let Self::LinkedList(l) = self;
        l.len()
    }
    pub fn iter(&self) -> std::collections::linked_list::Iter<'_, RedisObject> {
        let Self::LinkedList(l) = self;
        l.iter()
    }

    /// Inclusive [start, end] range over already-clamped indices.
    pub fn range(&self, start: usize, end: usize) -> Vec<RedisObject> {
        let Self::LinkedList(l) = self;
        l.iter().cloned().skip(start).take(end + 1 - start).collect()
    }

    /// Keep only the inclusive [start, end] window.
    pub fn retain_range(&mut self, start: usize, end: usize) {
        let Self::LinkedList(l) = self;
        let kept: LinkedList<RedisObject> = l.iter().cloned().skip(start).take(end + 1 - start).collect();
        *l = kept;
    }

    pub fn index(&self, index: usize) -> Option<RedisObject> {
        let Self::LinkedList(l) = self;
        l.iter().nth(index).cloned()
    }

    pub fn set(&mut self, index: usize, value: RedisObject) -> bool {
        let Self::LinkedList(l) = self;
        if index >= l.len() {
            return false;
        }
        let mut rebuilt: LinkedList<RedisObject> = LinkedList::new();
        for (i, e) in l.iter().enumerate() {
            if i == index {
                rebuilt.push_back(value.clone());
            } else {
                rebuilt.push_back(e.clone());
            }
        }
        *l = rebuilt;
        true
    }

    /// Remove up to `count` occurrences of `target` scanning head-to-tail
    /// (count == 0 removes all). Returns the number removed.
    pub fn remove_head(&mut self, count: i64, target: &RedisObject) -> i64 {
        let Self::LinkedList(l) = self;
        let mut removed = 0i64;
        let mut kept = LinkedList::new();
        for e in l.iter() {
            if e == target && (count == 0 || removed < count) {
                removed += 1;
            } else {
                kept.push_back(e.clone());
            }
        }
        *l = kept;
        removed
    }

    /// Same as `remove_head` but scanning tail-to-head.
    pub fn remove_tail(&mut self, count: i64, target: &RedisObject) -> i64 {
        let Self::LinkedList(l) = self;
        let mut removed = 0i64;
        let mut kept: LinkedList<RedisObject> = LinkedList::new();
        for e in l.iter().rev() {
            if e == target && (count == 0 || removed < count) {
                removed += 1;
            } else {
                kept.push_front(e.clone());
            }
        }
        *l = kept;
        removed
    }
}
impl PartialEq for ListStorageType {
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}

#[derive(Clone, Eq)]
pub enum SetStorageType {
    HashSet(HashSet<RedisObject>),
}
impl SetStorageType {
    pub fn new() -> Self {
        Self::HashSet(HashSet::new())
    }

    pub fn insert(&mut self, obj: RedisObject) -> bool {
        let Self::HashSet(s) = self;
        s.insert(obj)
    }

    pub fn remove(&mut self, obj: &RedisObject) -> bool {
        let Self::HashSet(s) = self;
        s.remove(obj)
    }

    /// Pick a uniformly random member without removing it.
    pub fn get_random_key(&self) -> Option<RedisObject> {
        let Self::HashSet(s) = self;
        if s.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..s.len());
        s.iter().nth(idx).cloned()
    }

    pub fn len(&self) -> usize {
        let Self::HashSet(s) = self;
        s.len()
    }

    pub fn contains(&self, obj: &RedisObject) -> bool {
        let Self::HashSet(s) = self;
        s.contains(obj)
    }

    pub fn iter(&self) -> Iter<RedisObject> {
        let Self::HashSet(s) = self;
        s.iter()
    }
}
impl PartialEq for SetStorageType {
    fn eq(&self, _other: &Self) -> bool {
        false
    }
}

/// Try to encode a string object as an integer in order to save space. Not
/// safe to apply to a shared object: encoded objects may only appear as
/// values, never as keys shared across the "object space".
pub fn try_object_encoding(obj: Arc<RwLock<RedisObject>>) -> Arc<RwLock<RedisObject>> {
    if Arc::strong_count(&obj) > 1 {
        return obj;
    }
    let encoded = match obj.read().unwrap().string() {
        Some(StringStorageType::Bytes(b)) => is_bytes_representable_as_int(b),
        _ => None,
    };
    if let Some(n) = encoded {
        return create_object(RedisObject::String { ptr: StringStorageType::Integer(n) });
    }
    obj
}

/// Check whether `b` is exactly the decimal rendering of some `i64` (no
/// leading zero, sign or surrounding whitespace tolerated beyond what
/// `i64::to_string` would itself produce).
fn is_bytes_representable_as_int(b: &[u8]) -> Option<i64> {
    let s = std::str::from_utf8(b).ok()?;
    let n: i64 = s.parse().ok()?;
    if n.to_string().as_bytes() == b {
        Some(n)
    } else {
        None
    }
}

/// Compare two STRING objects' decoded byte content, `memcmp`-style.
pub fn compare_string_objects(a: &RedisObject, b: &RedisObject) -> Ordering {
    a.get_decoded().as_bytes().cmp(&b.get_decoded().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoding_roundtrips_integers() {
        let obj = create_object(RedisObject::String { ptr: StringStorageType::Bytes(b"12345".to_vec()) });
        let encoded = try_object_encoding(obj);
        assert_eq!(encoded.read().unwrap().as_bytes(), b"12345".to_vec());
        match &*encoded.read().unwrap() {
            RedisObject::String { ptr: StringStorageType::Integer(12345) } => {},
            _ => panic!("expected integer encoding"),
        }
    }

    #[test]
    fn encoding_rejects_non_canonical_forms() {
        let obj = create_object(RedisObject::String { ptr: StringStorageType::Bytes(b"007".to_vec()) });
        let encoded = try_object_encoding(obj);
        match &*encoded.read().unwrap() {
            RedisObject::String { ptr: StringStorageType::Bytes(_) } => {},
            _ => panic!("007 must not be integer-encoded"),
        }
    }

    #[test]
    fn list_range_and_trim_clamp_correctly() {
        let mut l = ListStorageType::new();
        for e in ["a", "b", "c", "d"] {
            l.push_back(RedisObject::String { ptr: StringStorageType::Bytes(e.as_bytes().to_vec()) });
        }
        let r = l.range(1, 2);
        assert_eq!(r.len(), 2);
        l.retain_range(1, 2);
        assert_eq!(l.len(), 2);
    }

    #[test]
    fn set_membership_tracks_cardinality() {
        let mut s = SetStorageType::new();
        let a = RedisObject::String { ptr: StringStorageType::Bytes(b"a".to_vec()) };
        assert!(s.insert(a.clone()));
        assert!(!s.insert(a.clone()));
        assert_eq!(s.len(), 1);
        assert!(s.contains(&a));
        assert!(s.remove(&a));
        assert_eq!(s.len(), 0);
    }

    #[test]
    fn free_list_recycles_single_owner_headers() {
        let before = free_list_len();
        let obj = create_object(RedisObject::String { ptr: StringStorageType::Bytes(b"x".to_vec()) });
        recycle_object(obj);
        assert!(free_list_len() >= before);
    }
}
